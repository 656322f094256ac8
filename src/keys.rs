// 🔑 Transaction Keys - Deterministic ids with collision avoidance
//
// A transaction id is derived from its values and its position in the feed:
//
//     id = serial * 10_000_000_000 + |seed|
//
// where `seed` is a 32-bit wrapping sum of the scaled amount and the hashes of
// currency, card, client and place. Distinct records can still land on the same
// id, so every id handed out is remembered together with the serial that
// claimed it. A clash with another serial (or a non-positive id after
// overflow) moves the id forward until a free slot is found.

use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::entities::{Client, Place};

/// Distance between the id ranges of consecutive serials
pub const SERIAL_STRIDE: i64 = 10_000_000_000;

/// Odd step applied when an id is already taken by another serial
pub const COLLISION_STEP: i64 = 141_414_141_414;

// ============================================================================
// HASHING
// ============================================================================

/// Polynomial (x31) hash over UTF-16 code units with 32-bit wrap-around.
///
/// Ids are pinned by golden vectors, so this must stay bit-for-bit stable.
pub fn string_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// 32-bit seed from the values of a transaction
pub fn seed(amount: &Decimal, currency: &str, card: &str, client: &Client, place: &Place) -> i32 {
    // Saturating float cast, truncated toward zero
    let cents = (amount.to_f64().unwrap_or_default() * 100.0) as i32;

    cents
        .wrapping_add(string_hash(currency))
        .wrapping_add(string_hash(card))
        .wrapping_add(client.key_hash())
        .wrapping_add(place.key_hash())
}

/// Id before collision checks. May be non-positive for very large serials.
pub fn base_key(seed: i32, serial: u32) -> i64 {
    SERIAL_STRIDE
        .wrapping_mul(i64::from(serial))
        .wrapping_add(i64::from(seed.wrapping_abs()))
}

// ============================================================================
// KEY REGISTRY
// ============================================================================

/// Every id handed out during the life of the process, with its serial.
///
/// Shared by reference between everything that builds transactions. It only
/// grows; a fresh registry is the only way to forget ids.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    assigned: Mutex<HashMap<i64, u32>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        KeyRegistry {
            assigned: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the first free id at or after `base` for `serial`.
    ///
    /// Claiming again for the same serial and values returns the same id.
    /// The result is always positive.
    pub fn claim(&self, base: i64, serial: u32) -> i64 {
        let mut assigned = self.assigned.lock();
        let mut id = base;

        loop {
            if id <= 0 {
                id = id.wrapping_add(i64::MAX);
            } else if matches!(assigned.get(&id), Some(&owner) if owner != serial) {
                id = id.wrapping_add(COLLISION_STEP);
            } else {
                break;
            }
        }

        assigned.insert(id, serial);
        id
    }

    /// Serial that owns `id`, if any
    pub fn serial_of(&self, id: i64) -> Option<u32> {
        self.assigned.lock().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.assigned.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.lock().is_empty()
    }
}

/// Derive and claim the id for one transaction
pub fn derive_key(
    registry: &KeyRegistry,
    amount: &Decimal,
    currency: &str,
    card: &str,
    client: &Client,
    place: &Place,
    serial: u32,
) -> i64 {
    let base = base_key(seed(amount, currency, card, client, place), serial);
    registry.claim(base, serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::thread;

    fn client() -> Client {
        Client::new("Ivan", "Ivanoff", "Ivanoff", "0123456789").unwrap()
    }

    fn place() -> Place {
        Place::new("A PLACE 0").unwrap()
    }

    fn golden_key(registry: &KeyRegistry, serial: u32) -> i64 {
        derive_key(
            registry,
            &Decimal::from_str("1").unwrap(),
            "UAH",
            "123456****1234",
            &client(),
            &place(),
            serial,
        )
    }

    #[test]
    fn test_string_hash_matches_reference_values() {
        assert_eq!(string_hash(""), 0);
        assert_eq!(string_hash("a"), 97);
        assert_eq!(string_hash("UAH"), 83_772);
        assert_eq!(string_hash("0123456789"), 1_584_875_013);
        // wraps past i32::MAX
        assert_eq!(string_hash("A PLACE 0"), -1_361_309_096);
    }

    #[test]
    fn test_golden_vector_serial_1() {
        let registry = KeyRegistry::new();
        assert_eq!(golden_key(&registry, 1), 12_119_887_295);
    }

    #[test]
    fn test_golden_vector_serial_10() {
        let registry = KeyRegistry::new();
        assert_eq!(golden_key(&registry, 10), 102_119_887_295);
    }

    #[test]
    fn test_same_serial_reclaims_same_id() {
        let registry = KeyRegistry::new();
        let first = golden_key(&registry, 7);
        let second = golden_key(&registry, 7);

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.serial_of(first), Some(7));
    }

    #[test]
    fn test_collision_moves_to_next_free_slot() {
        let registry = KeyRegistry::new();
        let taken = registry.claim(50_000_000_000, 5);
        let moved = registry.claim(50_000_000_000, 6);

        assert_eq!(taken, 50_000_000_000);
        assert_eq!(moved, 50_000_000_000 + COLLISION_STEP);

        // A third claimant skips both
        let third = registry.claim(50_000_000_000, 7);
        assert_eq!(third, 50_000_000_000 + 2 * COLLISION_STEP);
    }

    #[test]
    fn test_overflow_never_yields_non_positive_id() {
        let registry = KeyRegistry::new();
        let id = golden_key(&registry, 922_337_204);
        assert!(id > 0, "id {} must be positive", id);

        let id = registry.claim(0, 1);
        assert!(id > 0);
        let id = registry.claim(i64::MIN + 5, 2);
        assert!(id > 0);
    }

    #[test]
    fn test_concurrent_claims_never_share_an_id() {
        let registry = Arc::new(KeyRegistry::new());
        let handles: Vec<_> = (0..4u32)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..250u32)
                        .map(|i| registry.claim(SERIAL_STRIDE, worker * 1_000 + i + 1))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();

        assert_eq!(ids.len(), total);
        assert_eq!(registry.len(), total);
    }
}
