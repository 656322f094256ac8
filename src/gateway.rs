// 🚪 Persistence Gateway - What a writer needs from storage
//
// One call = one atomic unit of work over a batch:
//   1. resolve client and place by natural key (cache first, then storage)
//   2. insert-or-ignore newly seen clients and places
//   3. upsert each transaction by its id
//   4. commit, or roll everything back and report 0
//
// Partial success is not a valid answer: the result is 0 or batch.len().

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::entities::Transaction;

pub trait PersistenceGateway: Send + Sync {
    /// Persist `batch` atomically and return how many transactions were stored
    fn submit_batch(&self, batch: &[Transaction]) -> usize;
}

// ============================================================================
// NATURAL KEY CACHE
// ============================================================================

/// Read-through cache of resolved entities by natural key.
///
/// Entries only ever describe committed rows, so a hit can be linked to
/// without another lookup.
pub struct NaturalKeyCache<V> {
    entries: RwLock<HashMap<String, Arc<V>>>,
}

impl<V> NaturalKeyCache<V> {
    pub fn new() -> Self {
        NaturalKeyCache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.entries.read().get(key).cloned()
    }

    /// Publish entries resolved by a committed unit of work
    pub fn extend(&self, resolved: impl IntoIterator<Item = (String, Arc<V>)>) {
        self.entries.write().extend(resolved);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<V> Default for NaturalKeyCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Place;

    #[test]
    fn test_cache_miss_then_hit() {
        let cache: NaturalKeyCache<Place> = NaturalKeyCache::new();
        assert!(cache.get("A PLACE 1").is_none());

        cache.extend([("A PLACE 1".to_string(), Arc::new(Place::stored(7, "A PLACE 1")))]);

        let hit = cache.get("A PLACE 1").unwrap();
        assert_eq!(hit.id(), Some(7));
        assert_eq!(cache.len(), 1);
    }
}
