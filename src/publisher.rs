//! # Entity Publisher
//!
//! The [`EntityPublisher`] trait is the engine's only view of the message
//! bus: publish an entity's display state. Inbound control events arrive
//! as a stream of [`CommandRequest`] values on a channel handed out at
//! connection time, not as per-entity callbacks; the command handler does
//! one uid lookup in the registry to dispatch them.
//!
//! [`MqttPublisher`] is the production implementation on rumqttc. Topic
//! layout, with `<main_uid>` from the settings:
//!
//! | Topic | Direction | Payload |
//! |-------|-----------|---------|
//! | `<main_uid>/<uid>/state` | out | display value |
//! | `<main_uid>/<uid>/set` | in | requested display value |
//! | `homeassistant/<component>/<main_uid>/<uid>/config` | out, retained | discovery JSON |

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::DisplayValue;
use crate::definitions::{EntityDefinition, EntityKind};
use crate::error::{BridgeError, BridgeResult};
use crate::registry::EntityRegistry;
use crate::settings::{DeviceSettings, MqttSettings};

/// Inbound control event: a user asked an entity to take a display value.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Entity uid, taken from the command topic.
    pub uid: String,
    /// Requested display value, taken from the payload.
    pub value: String,
}

/// Abstract outbound state publisher.
///
/// Methods take `&self`; implementations are shared-state safe.
#[async_trait]
pub trait EntityPublisher: Send + Sync {
    /// Publish an entity's current display state.
    async fn publish(&self, uid: &str, value: &DisplayValue) -> BridgeResult<()>;

    /// Release the broker connection.
    async fn close(&self) -> BridgeResult<()> {
        Ok(())
    }
}

// ============================================================================
// MQTT implementation
// ============================================================================

/// MQTT publisher with Home Assistant discovery.
pub struct MqttPublisher {
    client: AsyncClient,
    main_uid: String,
}

impl MqttPublisher {
    /// Connect to the broker, subscribe to the command topics and spawn
    /// the connection event loop. Returns the publisher and the stream of
    /// inbound commands.
    pub async fn connect(
        settings: &MqttSettings,
    ) -> BridgeResult<(Self, mpsc::Receiver<CommandRequest>)> {
        let client_id = format!("{}-bridge", settings.main_uid);
        let mut options = MqttOptions::new(client_id, settings.host.as_str(), settings.port);
        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username.as_str(), password.as_str());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let command_topic = format!("{}/+/set", settings.main_uid);
        client
            .subscribe(command_topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::publisher(format!("Subscribe to {command_topic} failed: {e}")))?;

        let (tx, rx) = mpsc::channel(32);
        let main_uid = settings.main_uid.clone();
        let task_uid = main_uid.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(command) =
                            parse_command(&task_uid, &publish.topic, &publish.payload)
                        else {
                            debug!("Ignoring message on {}", publish.topic);
                            continue;
                        };
                        if tx.send(command).await.is_err() {
                            // Bridge dropped its receiver; we are shutting down.
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // rumqttc reconnects on the next poll; don't spin.
                        warn!("MQTT connection error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        debug!(
            "Connected to MQTT broker at {}:{}",
            settings.host, settings.port
        );
        Ok((MqttPublisher { client, main_uid }, rx))
    }

    /// Publish retained Home Assistant discovery configs for every entity.
    pub async fn announce(
        &self,
        registry: &EntityRegistry,
        device: &DeviceSettings,
    ) -> BridgeResult<()> {
        for entity in registry.entities() {
            let (topic, payload) = discovery_config(&self.main_uid, device, entity);
            self.client
                .publish(topic.as_str(), QoS::AtLeastOnce, true, payload.to_string())
                .await
                .map_err(|e| {
                    BridgeError::publisher(format!("Discovery publish to {topic} failed: {e}"))
                })?;
        }
        debug!("Announced {} entities for discovery", registry.len());
        Ok(())
    }

}

#[async_trait]
impl EntityPublisher for MqttPublisher {
    async fn publish(&self, uid: &str, value: &DisplayValue) -> BridgeResult<()> {
        let topic = format!("{}/{uid}/state", self.main_uid);
        self.client
            .publish(topic.as_str(), QoS::AtLeastOnce, false, value.to_string())
            .await
            .map_err(|e| BridgeError::publisher(format!("Publish to {topic} failed: {e}")))
    }

    async fn close(&self) -> BridgeResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BridgeError::publisher(format!("Disconnect failed: {e}")))
    }
}

// ============================================================================
// Topic / discovery helpers
// ============================================================================

/// Parse an inbound command topic `"<main_uid>/<uid>/set"`.
fn parse_command(main_uid: &str, topic: &str, payload: &[u8]) -> Option<CommandRequest> {
    let mut parts = topic.split('/');
    if parts.next() != Some(main_uid) {
        return None;
    }
    let uid = parts.next()?;
    if parts.next() != Some("set") || parts.next().is_some() || uid.is_empty() {
        return None;
    }
    let value = String::from_utf8_lossy(payload).trim().to_string();
    Some(CommandRequest {
        uid: uid.to_string(),
        value,
    })
}

/// Home Assistant discovery topic and payload for one entity.
fn discovery_config(
    main_uid: &str,
    device: &DeviceSettings,
    entity: &EntityDefinition,
) -> (String, serde_json::Value) {
    let component = match entity.kind {
        EntityKind::Numeric { .. } | EntityKind::Enum { .. } => "sensor",
        EntityKind::Binary { .. } => "binary_sensor",
        EntityKind::Switch => "switch",
        EntityKind::Select { .. } => "select",
    };
    let topic = format!(
        "homeassistant/{component}/{main_uid}/{}/config",
        entity.uid
    );

    let mut payload = json!({
        "name": entity.name,
        "unique_id": format!("{main_uid}_{}", entity.uid),
        "state_topic": format!("{main_uid}/{}/state", entity.uid),
        "device": {
            "identifiers": [main_uid],
            "name": device.name,
            "manufacturer": device.manufacturer,
            "model": device.model,
            "sw_version": env!("CARGO_PKG_VERSION")
        }
    });
    let fields = payload.as_object_mut().unwrap();

    match &entity.kind {
        EntityKind::Numeric {
            precision,
            unit,
            device_class,
            state_class,
            ..
        } => {
            fields.insert("suggested_display_precision".into(), json!(precision));
            if let Some(unit) = unit {
                fields.insert("unit_of_measurement".into(), json!(unit));
            }
            if let Some(device_class) = device_class {
                fields.insert("device_class".into(), json!(device_class));
            }
            if let Some(state_class) = state_class {
                fields.insert("state_class".into(), json!(state_class));
            }
        }
        EntityKind::Binary { device_class, .. } => {
            fields.insert("payload_on".into(), json!("ON"));
            fields.insert("payload_off".into(), json!("OFF"));
            if let Some(device_class) = device_class {
                fields.insert("device_class".into(), json!(device_class));
            }
        }
        EntityKind::Enum { options } => {
            fields.insert("device_class".into(), json!("enum"));
            fields.insert(
                "options".into(),
                json!(options.values().collect::<Vec<_>>()),
            );
        }
        EntityKind::Switch => {
            fields.insert(
                "command_topic".into(),
                json!(format!("{main_uid}/{}/set", entity.uid)),
            );
            fields.insert("payload_on".into(), json!("ON"));
            fields.insert("payload_off".into(), json!("OFF"));
        }
        EntityKind::Select { options, .. } => {
            fields.insert(
                "command_topic".into(),
                json!(format!("{main_uid}/{}/set", entity.uid)),
            );
            fields.insert(
                "options".into(),
                json!(options.values().collect::<Vec<_>>()),
            );
        }
    }

    (topic, payload)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::EnumOptions;

    #[test]
    fn test_parse_command() {
        let command = parse_command("kronoterm", "kronoterm/dhw_operation/set", b"AUTO").unwrap();
        assert_eq!(
            command,
            CommandRequest {
                uid: "dhw_operation".into(),
                value: "AUTO".into()
            }
        );
    }

    #[test]
    fn test_parse_command_trims_payload() {
        let command = parse_command("kronoterm", "kronoterm/fast_heating/set", b"ON\n").unwrap();
        assert_eq!(command.value, "ON");
    }

    #[test]
    fn test_parse_command_rejects_foreign_topics() {
        assert!(parse_command("kronoterm", "other/fast_heating/set", b"ON").is_none());
        assert!(parse_command("kronoterm", "kronoterm/fast_heating/state", b"ON").is_none());
        assert!(parse_command("kronoterm", "kronoterm/a/set/extra", b"ON").is_none());
        assert!(parse_command("kronoterm", "kronoterm//set", b"ON").is_none());
    }

    #[test]
    fn test_discovery_config_sensor() {
        let entity = EntityDefinition {
            address: 2101,
            name: "DHW temperature".into(),
            uid: "dhw_temperature".into(),
            kind: EntityKind::Numeric {
                scale: 0.1,
                precision: 1,
                unit: Some("°C".into()),
                device_class: Some("temperature".into()),
                state_class: Some("measurement".into()),
            },
        };
        let (topic, payload) = discovery_config("kronoterm", &DeviceSettings::default(), &entity);

        assert_eq!(
            topic,
            "homeassistant/sensor/kronoterm/dhw_temperature/config"
        );
        assert_eq!(payload["state_topic"], "kronoterm/dhw_temperature/state");
        assert_eq!(payload["unit_of_measurement"], "°C");
        assert_eq!(payload["suggested_display_precision"], 1);
        assert_eq!(payload["device"]["manufacturer"], "Kronoterm");
        // Sensors take no commands.
        assert!(payload.get("command_topic").is_none());
    }

    #[test]
    fn test_discovery_config_select() {
        let entity = EntityDefinition {
            address: 2025,
            name: "DHW operation".into(),
            uid: "dhw_operation".into(),
            kind: EntityKind::Select {
                options: EnumOptions::new(
                    vec![0, 1, 2],
                    vec!["OFF".into(), "ON".into(), "AUTO".into()],
                )
                .unwrap(),
                default_option: "AUTO".into(),
            },
        };
        let (topic, payload) = discovery_config("kronoterm", &DeviceSettings::default(), &entity);

        assert_eq!(topic, "homeassistant/select/kronoterm/dhw_operation/config");
        assert_eq!(payload["command_topic"], "kronoterm/dhw_operation/set");
        assert_eq!(payload["options"], json!(["OFF", "ON", "AUTO"]));
    }

    #[test]
    fn test_discovery_config_switch_and_binary() {
        let switch = EntityDefinition {
            address: 2025,
            name: "Fast DHW heating".into(),
            uid: "fast_dhw_heating".into(),
            kind: EntityKind::Switch,
        };
        let (_, payload) = discovery_config("kronoterm", &DeviceSettings::default(), &switch);
        assert_eq!(payload["command_topic"], "kronoterm/fast_dhw_heating/set");
        assert_eq!(payload["payload_on"], "ON");

        let binary = EntityDefinition {
            address: 2044,
            name: "Circulation pump".into(),
            uid: "circulation_pump".into(),
            kind: EntityKind::Binary {
                bit: Some(3),
                device_class: Some("running".into()),
            },
        };
        let (topic, payload) = discovery_config("kronoterm", &DeviceSettings::default(), &binary);
        assert_eq!(
            topic,
            "homeassistant/binary_sensor/kronoterm/circulation_pump/config"
        );
        assert_eq!(payload["device_class"], "running");
        assert!(payload.get("command_topic").is_none());
    }
}
