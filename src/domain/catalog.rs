//! GATT catalog of a single connection
//!
//! Built once from a complete service/characteristic enumeration and never
//! modified afterwards. Order is the order reported by the peripheral, which
//! callers rely on when presenting choices.

use crate::domain::models::CommandTarget;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicEntry {
    pub uuid: Uuid,
    pub owning_service_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub uuid: Uuid,
    characteristics: Vec<CharacteristicEntry>,
}

impl ServiceEntry {
    pub fn characteristics(&self) -> &[CharacteristicEntry] {
        &self.characteristics
    }

    pub fn contains(&self, characteristic_uuid: &Uuid) -> bool {
        self.characteristics
            .iter()
            .any(|c| &c.uuid == characteristic_uuid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattCatalog {
    services: Vec<ServiceEntry>,
}

impl GattCatalog {
    pub fn services(&self) -> &[ServiceEntry] {
        &self.services
    }

    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.services.iter().map(|s| s.uuid).collect()
    }

    /// First service with the given UUID
    pub fn service(&self, uuid: &Uuid) -> Option<&ServiceEntry> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    pub fn characteristics(&self, service_uuid: &Uuid) -> Option<&[CharacteristicEntry]> {
        self.service(service_uuid).map(ServiceEntry::characteristics)
    }

    /// Characteristics of every service, flattened in catalog order
    pub fn all_characteristics(&self) -> impl Iterator<Item = &CharacteristicEntry> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    /// Whether the target's characteristic belongs to the target's service
    pub fn contains(&self, target: &CommandTarget) -> bool {
        self.services
            .iter()
            .filter(|s| s.uuid == target.service_uuid)
            .any(|s| s.contains(&target.characteristic_uuid))
    }

    /// Every characteristic references a service present in this catalog
    pub fn is_consistent(&self) -> bool {
        self.all_characteristics()
            .all(|c| self.service(&c.owning_service_uuid).is_some())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Builds a catalog from `(service, characteristics)` pairs in enumeration order.
impl FromIterator<(Uuid, Vec<Uuid>)> for GattCatalog {
    fn from_iter<I: IntoIterator<Item = (Uuid, Vec<Uuid>)>>(iter: I) -> Self {
        let services = iter
            .into_iter()
            .map(|(service_uuid, characteristics)| ServiceEntry {
                uuid: service_uuid,
                characteristics: characteristics
                    .into_iter()
                    .map(|uuid| CharacteristicEntry {
                        uuid,
                        owning_service_uuid: service_uuid,
                    })
                    .collect(),
            })
            .collect();
        Self { services }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid16(short: u16) -> Uuid {
        Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
    }

    fn sample() -> GattCatalog {
        vec![
            (uuid16(0x1800), vec![uuid16(0x2a00), uuid16(0x2a01)]),
            (uuid16(0x1843), vec![uuid16(0x2b7e), uuid16(0x2b7b)]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_enumeration_order_is_kept() {
        let catalog = sample();
        assert_eq!(catalog.service_uuids(), vec![uuid16(0x1800), uuid16(0x1843)]);

        let flattened: Vec<Uuid> = catalog.all_characteristics().map(|c| c.uuid).collect();
        assert_eq!(
            flattened,
            vec![uuid16(0x2a00), uuid16(0x2a01), uuid16(0x2b7e), uuid16(0x2b7b)]
        );
    }

    #[test]
    fn test_characteristics_reference_their_service() {
        let catalog = sample();
        assert!(catalog.is_consistent());
        for service in catalog.services() {
            for c in service.characteristics() {
                assert_eq!(c.owning_service_uuid, service.uuid);
            }
        }
    }

    #[test]
    fn test_contains_requires_matching_pair() {
        let catalog = sample();
        assert!(catalog.contains(&CommandTarget::new(uuid16(0x1843), uuid16(0x2b7e))));
        // Characteristic exists, but under another service
        assert!(!catalog.contains(&CommandTarget::new(uuid16(0x1800), uuid16(0x2b7e))));
        assert!(!catalog.contains(&CommandTarget::new(uuid16(0x180f), uuid16(0x2a19))));
    }

    #[test]
    fn test_unknown_service_has_no_characteristics() {
        let catalog = sample();
        assert!(catalog.characteristics(&uuid16(0x180f)).is_none());
        assert_eq!(catalog.characteristics(&uuid16(0x1843)).map(|c| c.len()), Some(2));
    }
}
