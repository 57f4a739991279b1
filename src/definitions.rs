//! # Entity Definition Table
//!
//! Declarative mapping between heat-pump holding registers and the typed
//! entities published over MQTT. Definitions live in a TOML table with one
//! array per entity kind:
//!
//! | Table | Kind | Writable |
//! |-------|------|----------|
//! | `[[sensor]]` | scaled numeric reading | no |
//! | `[[binary_sensor]]` | boolean flag, optional bit index | no |
//! | `[[enum_sensor]]` | coded state with display strings | no |
//! | `[[switch]]` | ON/OFF control | yes |
//! | `[[select]]` | multi-option control | yes |
//!
//! Register numbers in the table follow the vendor documentation's
//! one-based "MA numbering"; loading subtracts one to get the zero-based
//! protocol address. All structural validation happens here, before the
//! poll loop starts: a malformed option table, a bad bit index or a
//! non-positive scale is a fatal `Configuration` error.

use std::path::Path;

use serde::Deserialize;

use crate::error::{BridgeError, BridgeResult};

// ============================================================================
// Runtime entity model
// ============================================================================

/// One register-backed entity, address already zero-based.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDefinition {
    /// Zero-based holding register address.
    pub address: u16,
    /// Human-readable name shown in the UI.
    pub name: String,
    /// Stable identifier, also the MQTT topic segment.
    pub uid: String,
    /// Kind-specific decode/encode parameters.
    pub kind: EntityKind,
}

/// Closed set of entity kinds.
///
/// Decode and encode dispatch exhaustively over this enum; adding a kind
/// is a compile-time change, not a runtime registration.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    /// Scaled numeric reading, e.g. a temperature in 0.1 degC steps.
    Numeric {
        scale: f64,
        /// Fractional digits implied by the scale factor (0 if scale >= 1).
        precision: u8,
        unit: Option<String>,
        device_class: Option<String>,
        state_class: Option<String>,
    },
    /// Boolean flag. With `bit` set only that bit of the word is
    /// significant, otherwise any non-zero word reads as ON.
    Binary {
        bit: Option<u8>,
        device_class: Option<String>,
    },
    /// Read-only coded state with display strings.
    Enum { options: EnumOptions },
    /// Writable ON/OFF control (ON <-> 1, OFF <-> 0).
    Switch,
    /// Writable multi-option control.
    Select {
        options: EnumOptions,
        default_option: String,
    },
}

impl EntityDefinition {
    /// Whether commands may be written to this entity.
    pub fn is_writable(&self) -> bool {
        matches!(self.kind, EntityKind::Switch | EntityKind::Select { .. })
    }
}

/// Ordered mapping between raw register codes and display strings.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumOptions(Vec<(i16, String)>);

impl EnumOptions {
    /// Build from parallel key/value arrays, rejecting mismatched lengths.
    pub fn new(keys: Vec<i16>, values: Vec<String>) -> BridgeResult<Self> {
        if keys.is_empty() || keys.len() != values.len() {
            return Err(BridgeError::configuration(format!(
                "Option table has {} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
        Ok(EnumOptions(keys.into_iter().zip(values).collect()))
    }

    /// Display string for a raw register code.
    pub fn display_for(&self, key: i16) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Raw register code for a display string.
    pub fn key_for(&self, value: &str) -> Option<i16> {
        self.0.iter().find(|(_, v)| v == value).map(|(k, _)| *k)
    }

    /// All display strings in table order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(_, v)| v.as_str())
    }

    /// All (key, value) pairs in table order.
    pub fn pairs(&self) -> impl Iterator<Item = (i16, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

// ============================================================================
// TOML table model
// ============================================================================

/// Raw definition table as it appears in the TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct DefinitionTable {
    #[serde(default)]
    pub sensor: Vec<SensorRecord>,
    #[serde(default)]
    pub binary_sensor: Vec<BinarySensorRecord>,
    #[serde(default)]
    pub enum_sensor: Vec<EnumSensorRecord>,
    #[serde(default)]
    pub switch: Vec<SwitchRecord>,
    #[serde(default)]
    pub select: Vec<SelectRecord>,
}

/// `[[sensor]]` record.
#[derive(Debug, Deserialize)]
pub struct SensorRecord {
    /// One-based register number from the vendor documentation.
    pub register: u16,
    pub name: String,
    pub scale: f64,
    #[serde(default)]
    pub unit_of_measurement: String,
    #[serde(default)]
    pub device_class: String,
    #[serde(default)]
    pub state_class: String,
}

/// `[[binary_sensor]]` record.
#[derive(Debug, Deserialize)]
pub struct BinarySensorRecord {
    pub register: u16,
    pub name: String,
    /// Bit index within the 16-bit word (0-15); whole word if absent.
    pub bit: Option<u8>,
    #[serde(default)]
    pub device_class: String,
}

/// `[[enum_sensor]]` record.
#[derive(Debug, Deserialize)]
pub struct EnumSensorRecord {
    pub register: u16,
    pub name: String,
    pub options: Vec<OptionRecord>,
}

/// `[[switch]]` record.
#[derive(Debug, Deserialize)]
pub struct SwitchRecord {
    pub register: u16,
    pub name: String,
}

/// `[[select]]` record.
#[derive(Debug, Deserialize)]
pub struct SelectRecord {
    pub register: u16,
    pub name: String,
    pub options: Vec<OptionRecord>,
    pub default_option: String,
}

/// Parallel key/value arrays, as the vendor tables are transcribed.
#[derive(Debug, Deserialize)]
pub struct OptionRecord {
    pub keys: Vec<i16>,
    pub values: Vec<String>,
}

impl DefinitionTable {
    /// Parse a definition table from TOML text.
    pub fn parse(text: &str) -> BridgeResult<Self> {
        toml::from_str(text)
            .map_err(|e| BridgeError::configuration(format!("Invalid definition table: {e}")))
    }

    /// Load a definition table from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::configuration(format!(
                "Cannot read definitions file {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&text)
    }

    /// Convert into runtime entities, in table order (sensors first, then
    /// binary sensors, enum sensors, switches, selects).
    pub fn into_entities(self) -> BridgeResult<Vec<EntityDefinition>> {
        let mut entities = Vec::new();

        for record in self.sensor {
            let address = zero_based(record.register, &record.name)?;
            if record.scale <= 0.0 {
                return Err(BridgeError::configuration(format!(
                    "Sensor '{}' has non-positive scale {}",
                    record.name, record.scale
                )));
            }
            entities.push(EntityDefinition {
                address,
                uid: slugify(&record.name),
                kind: EntityKind::Numeric {
                    scale: record.scale,
                    precision: display_precision(record.scale),
                    unit: non_empty(record.unit_of_measurement),
                    device_class: non_empty(record.device_class),
                    state_class: non_empty(record.state_class),
                },
                name: record.name,
            });
        }

        for record in self.binary_sensor {
            let address = zero_based(record.register, &record.name)?;
            if let Some(bit) = record.bit {
                if bit > 15 {
                    return Err(BridgeError::configuration(format!(
                        "Binary sensor '{}' has bit index {bit} (must be 0-15)",
                        record.name
                    )));
                }
            }
            entities.push(EntityDefinition {
                address,
                uid: slugify(&record.name),
                kind: EntityKind::Binary {
                    bit: record.bit,
                    device_class: non_empty(record.device_class),
                },
                name: record.name,
            });
        }

        for record in self.enum_sensor {
            let address = zero_based(record.register, &record.name)?;
            let options = options_for(record.options, &record.name)?;
            entities.push(EntityDefinition {
                address,
                uid: slugify(&record.name),
                kind: EntityKind::Enum { options },
                name: record.name,
            });
        }

        for record in self.switch {
            let address = zero_based(record.register, &record.name)?;
            entities.push(EntityDefinition {
                address,
                uid: slugify(&record.name),
                kind: EntityKind::Switch,
                name: record.name,
            });
        }

        for record in self.select {
            let address = zero_based(record.register, &record.name)?;
            let options = options_for(record.options, &record.name)?;
            if options.key_for(&record.default_option).is_none() {
                return Err(BridgeError::configuration(format!(
                    "Select '{}' default option '{}' is not in its option table",
                    record.name, record.default_option
                )));
            }
            entities.push(EntityDefinition {
                address,
                uid: slugify(&record.name),
                kind: EntityKind::Select {
                    options,
                    default_option: record.default_option,
                },
                name: record.name,
            });
        }

        Ok(entities)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Convert a one-based documentation register number to a protocol address.
fn zero_based(register: u16, name: &str) -> BridgeResult<u16> {
    register.checked_sub(1).ok_or_else(|| {
        BridgeError::configuration(format!("Entity '{name}' has register 0 (numbering is one-based)"))
    })
}

/// First option table of a record; the transcribed vendor tables carry
/// exactly one.
fn options_for(mut records: Vec<OptionRecord>, name: &str) -> BridgeResult<EnumOptions> {
    if records.is_empty() {
        return Err(BridgeError::configuration(format!(
            "Entity '{name}' has no option table"
        )));
    }
    let record = records.remove(0);
    let (key_count, value_count) = (record.keys.len(), record.values.len());
    EnumOptions::new(record.keys, record.values).map_err(|_| {
        BridgeError::configuration(format!(
            "Entity '{name}' has a malformed option table ({key_count} keys, {value_count} values)"
        ))
    })
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Fractional display digits implied by a scale factor.
///
/// A scale of 0.1 means readings land on tenths, so one digit; 0.25 means
/// two digits; any scale >= 1 needs none.
pub fn display_precision(scale: f64) -> u8 {
    if scale >= 1.0 {
        return 0;
    }
    let text = format!("{scale}");
    match text.find('.') {
        Some(dot) => (text.len() - dot - 1) as u8,
        None => 0,
    }
}

/// Lowercase a display name into a stable identifier.
///
/// Runs of non-alphanumeric characters collapse into single underscores:
/// `"DHW temperature (set)"` -> `"dhw_temperature_set"`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}

// ============================================================================
// Tests
// ============================================================================
