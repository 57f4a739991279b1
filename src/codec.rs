//! # Entity Codec
//!
//! Bidirectional translation between raw 16-bit register words and typed
//! display values, dispatched exhaustively over [`EntityKind`].
//!
//! Register words arrive already reinterpreted as signed two's-complement
//! (`i16`); the transport does that conversion at the wire boundary.
//!
//! | Kind | Decode | Encode |
//! |------|--------|--------|
//! | Numeric | `raw * scale`, fixed precision | read-only |
//! | Binary | selected bit, or word != 0 | read-only |
//! | Enum | key -> display lookup | read-only |
//! | Switch | ON iff word != 0 | "ON" -> 1, else 0 |
//! | Select | key -> display lookup | display -> key reverse lookup |

use std::fmt;

use crate::definitions::{EntityDefinition, EntityKind};
use crate::error::{BridgeError, BridgeResult};

/// Typed display state of an entity, as published over MQTT.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayValue {
    /// Scaled numeric reading rendered with a fixed number of digits.
    Numeric { value: f64, precision: u8 },
    /// Boolean state, rendered as `ON`/`OFF`.
    OnOff(bool),
    /// Display string from an option table.
    Text(String),
}

impl fmt::Display for DisplayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayValue::Numeric { value, precision } => {
                write!(f, "{value:.prec$}", prec = *precision as usize)
            }
            DisplayValue::OnOff(true) => write!(f, "ON"),
            DisplayValue::OnOff(false) => write!(f, "OFF"),
            DisplayValue::Text(text) => write!(f, "{text}"),
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a raw register word into the entity's display state.
///
/// Enum and select decoding fails with [`BridgeError::DecodeAmbiguity`]
/// when the word matches no configured option; the poll cycle treats that
/// as "skip this entity for this tick" rather than an update.
///
/// # Example
///
/// ```rust
/// use pump2mqtt::codec::decode_entity;
/// use pump2mqtt::definitions::{EntityDefinition, EntityKind};
///
/// let sensor = EntityDefinition {
///     address: 100,
///     name: "DHW temperature".into(),
///     uid: "dhw_temperature".into(),
///     kind: EntityKind::Numeric {
///         scale: 0.1,
///         precision: 1,
///         unit: None,
///         device_class: None,
///         state_class: None,
///     },
/// };
/// let state = decode_entity(&sensor, 215).unwrap();
/// assert_eq!(state.to_string(), "21.5");
/// ```
pub fn decode_entity(entity: &EntityDefinition, raw: i16) -> BridgeResult<DisplayValue> {
    match &entity.kind {
        EntityKind::Numeric {
            scale, precision, ..
        } => Ok(DisplayValue::Numeric {
            value: f64::from(raw) * scale,
            precision: *precision,
        }),

        EntityKind::Binary { bit, .. } => {
            let on = match bit {
                Some(bit) => (raw >> bit) & 1 == 1,
                None => raw != 0,
            };
            Ok(DisplayValue::OnOff(on))
        }

        EntityKind::Enum { options } | EntityKind::Select { options, .. } => options
            .display_for(raw)
            .map(|value| DisplayValue::Text(value.to_string()))
            .ok_or(BridgeError::DecodeAmbiguity {
                address: entity.address,
                raw,
            }),

        EntityKind::Switch => Ok(DisplayValue::OnOff(raw != 0)),
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a requested display value into the register word to write.
///
/// Only switches and selects are writable. A select value outside the
/// option table fails with [`BridgeError::UnknownOption`]; so does any
/// command aimed at a read-only entity, since no requested value is an
/// option of one.
pub fn encode_command(entity: &EntityDefinition, requested: &str) -> BridgeResult<i16> {
    match &entity.kind {
        EntityKind::Switch => Ok(if requested == "ON" { 1 } else { 0 }),

        EntityKind::Select { options, .. } => {
            options
                .key_for(requested)
                .ok_or_else(|| BridgeError::UnknownOption {
                    entity: entity.uid.clone(),
                    value: requested.to_string(),
                })
        }

        EntityKind::Numeric { .. } | EntityKind::Binary { .. } | EntityKind::Enum { .. } => {
            Err(BridgeError::UnknownOption {
                entity: entity.uid.clone(),
                value: requested.to_string(),
            })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
