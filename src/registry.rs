//! # Entity Registry
//!
//! Immutable lookup structure built once from the definition table and
//! shared read-only by the poll cycle and the command handler:
//!
//! - address -> entity definition (decode path)
//! - uid -> entity definition (inbound command dispatch)
//! - sorted address list and its coalesced read-block plan
//!
//! All structural problems (duplicate address, duplicate uid) surface here,
//! before the poll loop starts. After construction nothing is mutated, so
//! concurrent readers need no locking around the registry itself.

use std::collections::HashMap;

use crate::coalesce::{coalesce_addresses, split_ranges, AddressRange};
use crate::definitions::EntityDefinition;
use crate::error::{BridgeError, BridgeResult};
use crate::transport::MAX_READ_REGISTERS;

/// Immutable register-to-entity mapping with a precomputed read plan.
#[derive(Debug)]
pub struct EntityRegistry {
    by_address: HashMap<u16, EntityDefinition>,
    by_uid: HashMap<String, u16>,
    addresses: Vec<u16>,
    ranges: Vec<AddressRange>,
}

impl EntityRegistry {
    /// Build the registry from already-converted entity definitions.
    ///
    /// Fails with a `Configuration` error if two definitions claim the
    /// same register address or slugify to the same uid.
    pub fn from_entities(entities: Vec<EntityDefinition>) -> BridgeResult<Self> {
        let mut by_address: HashMap<u16, EntityDefinition> =
            HashMap::with_capacity(entities.len());
        let mut by_uid: HashMap<String, u16> = HashMap::with_capacity(entities.len());

        for entity in entities {
            if let Some(existing) = by_address.get(&entity.address) {
                return Err(BridgeError::configuration(format!(
                    "Entities '{}' and '{}' both claim register address {}",
                    existing.name, entity.name, entity.address
                )));
            }
            if let Some(&address) = by_uid.get(&entity.uid) {
                let existing = &by_address[&address];
                return Err(BridgeError::configuration(format!(
                    "Entities '{}' and '{}' both slugify to uid '{}'",
                    existing.name, entity.name, entity.uid
                )));
            }
            by_uid.insert(entity.uid.clone(), entity.address);
            by_address.insert(entity.address, entity);
        }

        let mut addresses: Vec<u16> = by_address.keys().copied().collect();
        addresses.sort_unstable();
        // Runs longer than one FC03 request allows are read in slices.
        let ranges = split_ranges(coalesce_addresses(&addresses), MAX_READ_REGISTERS);

        Ok(EntityRegistry {
            by_address,
            by_uid,
            addresses,
            ranges,
        })
    }

    /// Entity mapped to a zero-based register address.
    pub fn by_address(&self, address: u16) -> Option<&EntityDefinition> {
        self.by_address.get(&address)
    }

    /// Entity with the given uid (command dispatch).
    pub fn by_uid(&self, uid: &str) -> Option<&EntityDefinition> {
        self.by_uid
            .get(uid)
            .and_then(|address| self.by_address.get(address))
    }

    /// Coalesced read blocks covering exactly the registered addresses,
    /// each at most [`MAX_READ_REGISTERS`] wide.
    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    /// All registered addresses, ascending.
    pub fn addresses(&self) -> &[u16] {
        &self.addresses
    }

    /// All entities in ascending address order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDefinition> {
        self.addresses
            .iter()
            .map(move |address| &self.by_address[address])
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    /// Whether the registry holds no entities.
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{DefinitionTable, EntityKind};

    fn sample_entities() -> Vec<EntityDefinition> {
        DefinitionTable::parse(
            r#"
[[sensor]]
register = 101
name = "Outside temperature"
scale = 0.5

[[switch]]
register = 50
name = "Fast DHW heating"
"#,
        )
        .unwrap()
        .into_entities()
        .unwrap()
    }

    #[test]
    fn test_zero_basing_and_read_plan() {
        let registry = EntityRegistry::from_entities(sample_entities()).unwrap();

        // One-based registers 101 and 50 land on addresses 100 and 49.
        assert_eq!(registry.addresses(), &[49, 100]);
        assert_eq!(
            registry.ranges(),
            &[
                AddressRange { start: 49, end: 49 },
                AddressRange { start: 100, end: 100 },
            ]
        );
    }

    #[test]
    fn test_lookups() {
        let registry = EntityRegistry::from_entities(sample_entities()).unwrap();

        let sensor = registry.by_address(100).unwrap();
        assert_eq!(sensor.uid, "outside_temperature");
        assert!(matches!(sensor.kind, EntityKind::Numeric { .. }));

        let switch = registry.by_uid("fast_dhw_heating").unwrap();
        assert_eq!(switch.address, 49);
        assert!(switch.is_writable());

        assert!(registry.by_address(7).is_none());
        assert!(registry.by_uid("nope").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_address_is_rejected() {
        let entities = DefinitionTable::parse(
            r#"
[[sensor]]
register = 101
name = "Temperature A"
scale = 0.1

[[switch]]
register = 101
name = "Switch on same register"
"#,
        )
        .unwrap()
        .into_entities()
        .unwrap();

        let err = EntityRegistry::from_entities(entities).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("100"));
    }

    #[test]
    fn test_duplicate_uid_is_rejected() {
        let entities = DefinitionTable::parse(
            r#"
[[sensor]]
register = 10
name = "Flow temp"
scale = 0.1

[[sensor]]
register = 11
name = "Flow (temp)"
scale = 0.1
"#,
        )
        .unwrap()
        .into_entities()
        .unwrap();

        let err = EntityRegistry::from_entities(entities).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("flow_temp"));
    }

    #[test]
    fn test_wide_runs_split_at_block_read_limit() {
        let entities: Vec<EntityDefinition> = (1u16..=130)
            .map(|register| EntityDefinition {
                address: register - 1,
                name: format!("Sensor {register}"),
                uid: format!("sensor_{register}"),
                kind: EntityKind::Numeric {
                    scale: 1.0,
                    precision: 0,
                    unit: None,
                    device_class: None,
                    state_class: None,
                },
            })
            .collect();

        let registry = EntityRegistry::from_entities(entities).unwrap();
        assert_eq!(
            registry.ranges(),
            &[
                AddressRange { start: 0, end: 124 },
                AddressRange {
                    start: 125,
                    end: 129,
                },
            ]
        );
        for range in registry.ranges() {
            assert!(range.count() <= MAX_READ_REGISTERS);
        }
    }

    #[test]
    fn test_adjacent_addresses_coalesce() {
        let entities = DefinitionTable::parse(
            r#"
[[sensor]]
register = 11
name = "A"
scale = 1.0

[[sensor]]
register = 12
name = "B"
scale = 1.0

[[sensor]]
register = 13
name = "C"
scale = 1.0

[[sensor]]
register = 21
name = "D"
scale = 1.0
"#,
        )
        .unwrap()
        .into_entities()
        .unwrap();

        let registry = EntityRegistry::from_entities(entities).unwrap();
        assert_eq!(
            registry.ranges(),
            &[
                AddressRange { start: 10, end: 12 },
                AddressRange { start: 20, end: 20 },
            ]
        );
    }
}
