//! # Poll / Publish Bridge
//!
//! Ties the registry, codec, transport and publisher together:
//!
//! - **Poll cycle**: one bulk read per coalesced block, merged into a
//!   tick-local register snapshot, then decode and publish every entity
//!   the snapshot covers. Entities missing from the snapshot (a failed
//!   block) are skipped for the tick, never crashed on.
//! - **Command handling**: resolve the entity by uid, encode the request,
//!   issue exactly one register write, and republish only after the
//!   device acknowledges. Failed encodes and failed writes leave the
//!   published state untouched; writes are never retried automatically.
//! - **Poll loop**: fixed-interval forever, handling inbound commands
//!   while waiting between ticks. Any cycle error means one logged
//!   message and a fixed-delay retry. The transport has exactly one
//!   owner, so reads and writes are naturally serialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::codec::{decode_entity, encode_command};
use crate::error::BridgeResult;
use crate::publisher::{CommandRequest, EntityPublisher};
use crate::registry::EntityRegistry;
use crate::transport::RegisterTransport;

/// Point-in-time view of the registers read this tick, keyed by absolute
/// address. Created fresh each cycle, discarded after publishing.
pub type RegisterSnapshot = HashMap<u16, i16>;

/// Poll-loop state, tracked for logging and the shutdown path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Polling,
    Backoff,
    Terminated,
}

/// The bridge engine: exclusive owner of the transport session.
pub struct Bridge<T, P> {
    registry: Arc<EntityRegistry>,
    transport: T,
    publisher: P,
    commands: mpsc::Receiver<CommandRequest>,
    interval: Duration,
}

impl<T: RegisterTransport, P: EntityPublisher> Bridge<T, P> {
    /// Assemble a bridge from its collaborators.
    pub fn new(
        registry: Arc<EntityRegistry>,
        transport: T,
        publisher: P,
        commands: mpsc::Receiver<CommandRequest>,
        interval: Duration,
    ) -> Self {
        Bridge {
            registry,
            transport,
            publisher,
            commands,
            interval,
        }
    }

    /// Run one poll cycle: read all blocks, decode, publish.
    ///
    /// Returns an error only when nothing at all could be read or a
    /// publish failed; a partially readable device is a normal cycle
    /// with a smaller snapshot.
    pub async fn poll_cycle(&mut self) -> BridgeResult<()> {
        let snapshot = self.read_snapshot().await?;

        let registry = Arc::clone(&self.registry);
        for entity in registry.entities() {
            let Some(&raw) = snapshot.get(&entity.address) else {
                // Block covering this address failed this tick.
                continue;
            };
            match decode_entity(entity, raw) {
                Ok(state) => self.publisher.publish(&entity.uid, &state).await?,
                Err(err) => debug!("Skipping '{}' this tick: {err}", entity.uid),
            }
        }
        Ok(())
    }

    /// Read every coalesced block once and merge into one snapshot.
    async fn read_snapshot(&mut self) -> BridgeResult<RegisterSnapshot> {
        let mut snapshot = RegisterSnapshot::new();
        let mut last_error = None;

        for range in self.registry.ranges().to_vec() {
            match self.transport.read_block(range.start, range.count()).await {
                Ok(values) => {
                    for (offset, value) in values.into_iter().enumerate() {
                        snapshot.insert(range.start + offset as u16, value);
                    }
                }
                Err(err) => {
                    warn!(
                        "Block read {}..={} failed, skipping its entities: {err}",
                        range.start, range.end
                    );
                    last_error = Some(err);
                }
            }
        }

        // All blocks down means the device is unreachable; let the loop
        // back off instead of publishing nothing forever.
        match last_error {
            Some(err) if snapshot.is_empty() && !self.registry.is_empty() => Err(err),
            _ => Ok(snapshot),
        }
    }

    /// Handle one inbound command. All failures are contained and logged;
    /// published state changes only after the device acknowledges.
    pub async fn handle_command(&mut self, command: CommandRequest) {
        let registry = Arc::clone(&self.registry);
        let Some(entity) = registry.by_uid(&command.uid) else {
            warn!("Command for unknown entity '{}'", command.uid);
            return;
        };

        let raw = match encode_command(entity, &command.value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("Command rejected: {err}");
                return;
            }
        };

        info!(
            "Writing register {} = {raw} ('{}' requested '{}')",
            entity.address, entity.uid, command.value
        );
        match self.transport.write_register(entity.address, raw).await {
            Ok(()) => match decode_entity(entity, raw) {
                Ok(state) => {
                    if let Err(err) = self.publisher.publish(&entity.uid, &state).await {
                        warn!("Confirmed write but publish failed: {err}");
                    }
                }
                Err(err) => warn!("Confirmed write decodes to nothing: {err}"),
            },
            Err(err) => {
                warn!(
                    "Write to register {} failed, published state unchanged: {err}",
                    entity.address
                );
            }
        }
    }

    /// Drive poll cycles forever at the configured cadence, handling
    /// commands between ticks, until `shutdown` fires. Closes the
    /// transport before returning.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> BridgeResult<()> {
        info!(
            "Publish loop started ({} entities, {} read blocks, every {:?})",
            self.registry.len(),
            self.registry.ranges().len(),
            self.interval
        );

        let mut state = LoopState::Polling;
        while state != LoopState::Terminated {
            let next = match self.poll_cycle().await {
                Ok(()) => LoopState::Polling,
                Err(err) => {
                    warn!("Poll cycle failed: {err}; retrying in {:?}", self.interval);
                    LoopState::Backoff
                }
            };
            if next != state {
                debug!("Poll loop {state:?} -> {next:?}");
                state = next;
            }

            // Fixed delay in both states; commands are served while waiting.
            let sleep = tokio::time::sleep(self.interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        state = LoopState::Terminated;
                        break;
                    }
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            // Command source is gone; just wait out the tick.
                            tokio::select! {
                                _ = shutdown.changed() => state = LoopState::Terminated,
                                _ = &mut sleep => {}
                            }
                            break;
                        }
                    }
                }
            }
        }

        info!("Publish loop terminated, releasing transport and publisher");
        // Release both even when one close fails; report the first error.
        let transport_closed = self.transport.close().await;
        let publisher_closed = self.publisher.close().await;
        transport_closed.and(publisher_closed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DisplayValue;
    use crate::definitions::DefinitionTable;
    use crate::error::BridgeError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio_test::assert_ok;

    /// In-memory register file with scriptable failures.
    struct MockTransport {
        registers: HashMap<u16, i16>,
        failing_blocks: Arc<Mutex<HashSet<u16>>>,
        fail_writes: bool,
        fail_close: bool,
        reads: Vec<(u16, u16)>,
        writes: Arc<Mutex<Vec<(u16, i16)>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl MockTransport {
        fn new(registers: &[(u16, i16)]) -> Self {
            MockTransport {
                registers: registers.iter().copied().collect(),
                failing_blocks: Arc::new(Mutex::new(HashSet::new())),
                fail_writes: false,
                fail_close: false,
                reads: Vec::new(),
                writes: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(Mutex::new(false)),
            }
        }
    }

    #[async_trait]
    impl RegisterTransport for MockTransport {
        async fn read_block(&mut self, start: u16, count: u16) -> BridgeResult<Vec<i16>> {
            self.reads.push((start, count));
            if self.failing_blocks.lock().unwrap().contains(&start) {
                return Err(BridgeError::transport("simulated block failure"));
            }
            (start..start + count)
                .map(|address| {
                    self.registers
                        .get(&address)
                        .copied()
                        .ok_or_else(|| BridgeError::transport("address not backed"))
                })
                .collect()
        }

        async fn write_register(&mut self, address: u16, value: i16) -> BridgeResult<()> {
            if self.fail_writes {
                return Err(BridgeError::transport("simulated write failure"));
            }
            self.registers.insert(address, value);
            self.writes.lock().unwrap().push((address, value));
            Ok(())
        }

        async fn close(&mut self) -> BridgeResult<()> {
            if self.fail_close {
                return Err(BridgeError::transport("simulated close failure"));
            }
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    /// Records published (uid, rendered value) pairs.
    struct MockPublisher {
        published: Arc<Mutex<Vec<(String, String)>>>,
        closed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl EntityPublisher for MockPublisher {
        async fn publish(&self, uid: &str, value: &DisplayValue) -> BridgeResult<()> {
            self.published
                .lock()
                .unwrap()
                .push((uid.to_string(), value.to_string()));
            Ok(())
        }

        async fn close(&self) -> BridgeResult<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    const DEFINITIONS: &str = r#"
[[sensor]]
register = 101
name = "Outside temperature"
scale = 0.5

[[enum_sensor]]
register = 60
name = "Working function"
[[enum_sensor.options]]
keys = [0, 1]
values = ["Heating", "DHW"]

[[switch]]
register = 50
name = "Fast DHW heating"

[[select]]
register = 26
name = "DHW operation"
default_option = "AUTO"
[[select.options]]
keys = [0, 1, 2]
values = ["OFF", "ON", "AUTO"]
"#;

    fn registry() -> Arc<EntityRegistry> {
        let entities = DefinitionTable::parse(DEFINITIONS)
            .unwrap()
            .into_entities()
            .unwrap();
        Arc::new(EntityRegistry::from_entities(entities).unwrap())
    }

    fn bridge(
        transport: MockTransport,
    ) -> (
        Bridge<MockTransport, MockPublisher>,
        Arc<Mutex<Vec<(String, String)>>>,
        mpsc::Sender<CommandRequest>,
    ) {
        let published = Arc::new(Mutex::new(Vec::new()));
        let publisher = MockPublisher {
            published: Arc::clone(&published),
            closed: Arc::new(Mutex::new(false)),
        };
        let (tx, rx) = mpsc::channel(4);
        let bridge = Bridge::new(
            registry(),
            transport,
            publisher,
            rx,
            Duration::from_secs(10),
        );
        (bridge, published, tx)
    }

    #[tokio::test]
    async fn test_poll_cycle_reads_each_block_once_and_publishes() {
        let transport = MockTransport::new(&[(25, 2), (49, 1), (59, 0), (100, 40)]);
        let (mut bridge, published, _tx) = bridge(transport);

        bridge.poll_cycle().await.unwrap();

        // One bulk read per coalesced singleton block, ascending.
        assert_eq!(
            bridge.transport.reads,
            vec![(25, 1), (49, 1), (59, 1), (100, 1)]
        );
        assert_eq!(
            *published.lock().unwrap(),
            vec![
                ("dhw_operation".to_string(), "AUTO".to_string()),
                ("fast_dhw_heating".to_string(), "ON".to_string()),
                ("working_function".to_string(), "Heating".to_string()),
                ("outside_temperature".to_string(), "20.0".to_string()),
            ]
        );
        // Polling never writes.
        assert!(bridge.transport.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poll_cycle_skips_entities_of_failed_blocks() {
        let transport = MockTransport::new(&[(25, 2), (49, 1), (59, 0), (100, 40)]);
        transport.failing_blocks.lock().unwrap().extend([49, 59]);
        let (mut bridge, published, _tx) = bridge(transport);

        bridge.poll_cycle().await.unwrap();

        let published = published.lock().unwrap();
        let uids: Vec<&str> = published.iter().map(|(uid, _)| uid.as_str()).collect();
        assert_eq!(uids, vec!["dhw_operation", "outside_temperature"]);
    }

    #[tokio::test]
    async fn test_poll_cycle_fails_when_nothing_is_readable() {
        let transport = MockTransport::new(&[]);
        transport
            .failing_blocks
            .lock()
            .unwrap()
            .extend([25, 49, 59, 100]);
        let (mut bridge, published, _tx) = bridge(transport);

        assert!(bridge.poll_cycle().await.is_err());
        assert!(published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poll_cycle_silently_skips_unknown_enum_code() {
        // Working function register reads 9, which maps to no option.
        let transport = MockTransport::new(&[(25, 2), (49, 0), (59, 9), (100, 40)]);
        let (mut bridge, published, _tx) = bridge(transport);

        bridge.poll_cycle().await.unwrap();

        let published = published.lock().unwrap();
        assert!(published.iter().all(|(uid, _)| uid != "working_function"));
        assert_eq!(published.len(), 3);
    }

    #[tokio::test]
    async fn test_switch_command_writes_then_publishes() {
        let transport = MockTransport::new(&[(49, 0)]);
        let (mut bridge, published, _tx) = bridge(transport);

        bridge
            .handle_command(CommandRequest {
                uid: "fast_dhw_heating".into(),
                value: "ON".into(),
            })
            .await;

        assert_eq!(*bridge.transport.writes.lock().unwrap(), vec![(49, 1)]);
        assert_eq!(
            *published.lock().unwrap(),
            vec![("fast_dhw_heating".to_string(), "ON".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_write_leaves_published_state_unchanged() {
        let mut transport = MockTransport::new(&[(49, 0)]);
        transport.fail_writes = true;
        let (mut bridge, published, _tx) = bridge(transport);

        bridge
            .handle_command(CommandRequest {
                uid: "fast_dhw_heating".into(),
                value: "ON".into(),
            })
            .await;

        assert!(published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_option_rejected_without_write() {
        let transport = MockTransport::new(&[(25, 2)]);
        let (mut bridge, published, _tx) = bridge(transport);

        bridge
            .handle_command(CommandRequest {
                uid: "dhw_operation".into(),
                value: "TURBO".into(),
            })
            .await;

        assert!(bridge.transport.writes.lock().unwrap().is_empty());
        assert!(published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_select_command_roundtrip() {
        let transport = MockTransport::new(&[(25, 2)]);
        let (mut bridge, published, _tx) = bridge(transport);

        bridge
            .handle_command(CommandRequest {
                uid: "dhw_operation".into(),
                value: "ON".into(),
            })
            .await;

        assert_eq!(*bridge.transport.writes.lock().unwrap(), vec![(25, 1)]);
        assert_eq!(
            *published.lock().unwrap(),
            vec![("dhw_operation".to_string(), "ON".to_string())]
        );
    }

    #[tokio::test]
    async fn test_command_for_unknown_entity_is_ignored() {
        let transport = MockTransport::new(&[]);
        let (mut bridge, published, _tx) = bridge(transport);

        bridge
            .handle_command(CommandRequest {
                uid: "nope".into(),
                value: "ON".into(),
            })
            .await;

        assert!(bridge.transport.writes.lock().unwrap().is_empty());
        assert!(published.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_terminates_on_shutdown_and_closes_transport() {
        let transport = MockTransport::new(&[(25, 2), (49, 1), (59, 0), (100, 40)]);
        let closed = Arc::clone(&transport.closed);
        let (mut bridge, published, _tx) = bridge(transport);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        assert_ok!(bridge.run(shutdown_rx).await);

        // One cycle ran before the shutdown signal was observed.
        assert_eq!(published.lock().unwrap().len(), 4);
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_transport_close_still_closes_publisher() {
        let mut transport = MockTransport::new(&[(25, 2), (49, 1), (59, 0), (100, 40)]);
        transport.fail_close = true;
        let publisher_closed = Arc::new(Mutex::new(false));
        let publisher = MockPublisher {
            published: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::clone(&publisher_closed),
        };
        let (_tx, rx) = mpsc::channel(4);
        let mut bridge = Bridge::new(registry(), transport, publisher, rx, Duration::from_secs(10));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        assert!(bridge.run(shutdown_rx).await.is_err());
        assert!(*publisher_closed.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_recovers_after_device_comes_back() {
        let transport = MockTransport::new(&[(25, 2), (49, 1), (59, 0), (100, 40)]);
        let failing = Arc::clone(&transport.failing_blocks);
        failing.lock().unwrap().extend([25, 49, 59, 100]);
        let (mut bridge, published, _tx) = bridge(transport);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_task = tokio::spawn(async move { bridge.run(shutdown_rx).await });

        // First cycle fails with every block down; the loop waits out
        // one interval before retrying.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(published.lock().unwrap().is_empty());

        // Device comes back; the retry succeeds and publishing resumes.
        failing.lock().unwrap().clear();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(published.lock().unwrap().len(), 4);

        shutdown_tx.send(true).unwrap();
        loop_task.await.unwrap().unwrap();
    }
}
