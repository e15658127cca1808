use std::hash::Hash;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

/// A copy-on-write map for data that is read on every message but changes rarely. Readers get a
///  consistent snapshot without holding a lock while they work with it, and updates replace
///  the map as a whole.
pub struct AtomicMap<K, V> {
    map: RwLock<Arc<FxHashMap<K, V>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn load(&self) -> Arc<FxHashMap<K, V>> {
        self.map.read().unwrap().clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.read().unwrap().get(key).cloned()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K, V>) -> R) -> R {
        let mut guard = self.map.write().unwrap();
        let mut map = guard.as_ref().clone();
        let result = f(&mut map);
        *guard = Arc::new(map);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update() {
        let map = AtomicMap::<u32, u32>::new();

        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));
        assert_eq!(None, map.get(&2));
    }

    #[test]
    fn test_snapshot_is_stable() {
        let map = AtomicMap::<u32, u32>::new();
        map.update(|m| m.insert(1, 1));

        let snapshot = map.load();
        let previous = map.update(|m| m.insert(1, 5));

        assert_eq!(previous, Some(1));
        assert_eq!(snapshot.get(&1), Some(&1));
        assert_eq!(map.get(&1), Some(5));
    }
}
