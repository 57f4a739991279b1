//! # pump2mqtt - Modbus to MQTT Bridge for Kronoterm Heat Pumps
//!
//! Bridges a heat pump exposing its state over Modbus TCP holding
//! registers to an MQTT broker, with Home Assistant discovery.
//!
//! ## How It Works
//!
//! A declarative TOML table maps register addresses to typed entities
//! (scaled numeric sensors, bit-flag binary sensors, coded enum sensors,
//! and writable switches/selects). At startup the table is compiled into
//! an immutable [`registry::EntityRegistry`], which coalesces the
//! scattered addresses into minimal contiguous read blocks. The bridge
//! then polls forever: one bulk read per block, decode each register word
//! into its entity's display state, publish over MQTT. Inbound commands
//! from the broker are encoded back into register words and written one
//! register at a time, with state republished only after the device
//! acknowledges.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use pump2mqtt::{
//!     Bridge, BridgeResult, DefinitionTable, EntityRegistry, ModbusTcpTransport,
//!     MqttPublisher, Settings,
//! };
//!
//! #[tokio::main]
//! async fn main() -> BridgeResult<()> {
//!     let settings = Settings::load(None)?;
//!     let entities = DefinitionTable::load(&settings.device.definitions)?.into_entities()?;
//!     let registry = Arc::new(EntityRegistry::from_entities(entities)?);
//!
//!     let transport = ModbusTcpTransport::connect(
//!         settings.modbus.host.as_deref().unwrap(),
//!         settings.modbus.port,
//!         settings.modbus.slave_id,
//!         settings.modbus.timeout(),
//!     )
//!     .await?;
//!     let (publisher, commands) = MqttPublisher::connect(&settings.mqtt).await?;
//!     publisher.announce(&registry, &settings.device).await?;
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     let mut bridge = Bridge::new(
//!         registry,
//!         transport,
//!         publisher,
//!         commands,
//!         settings.polling_interval(),
//!     );
//!     bridge.run(shutdown_rx).await
//! }
//! ```

// ============================================================================
// Modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Environment and file based runtime settings
pub mod settings;

/// Declarative register-to-entity definition table
pub mod definitions;

/// Coalescing of register addresses into contiguous read blocks
pub mod coalesce;

/// Bidirectional codec between register words and display values
pub mod codec;

/// Immutable entity registry with the precomputed read plan
pub mod registry;

/// Register transport trait and the Modbus TCP implementation
pub mod transport;

/// Entity publisher trait and the MQTT implementation
pub mod publisher;

/// Poll cycle, command handling and the poll loop
pub mod bridge;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Error handling ===
pub use error::{BridgeError, BridgeResult};

// === Core types ===
pub use coalesce::{coalesce_addresses, split_ranges, AddressRange};
pub use codec::{decode_entity, encode_command, DisplayValue};
pub use definitions::{DefinitionTable, EntityDefinition, EntityKind, EnumOptions};
pub use registry::EntityRegistry;

// === Engine ===
pub use bridge::{Bridge, RegisterSnapshot};

// === External interfaces ===
pub use publisher::{CommandRequest, EntityPublisher, MqttPublisher};
pub use transport::{ModbusTcpTransport, RegisterTransport};

// === Settings ===
pub use settings::Settings;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
