use dashmap::DashSet;
use rustc_hash::FxHashMap;

use crate::messaging::packet_id::PacketId;

/// Remembers the ids of all reliable packets seen so far. The set grows without bound, which is
///  acceptable for 128-bit ids at realistic packet rates over a process' lifetime.
#[derive(Default)]
pub struct DuplicateFilter {
    seen: DashSet<PacketId>,
}

impl DuplicateFilter {
    pub fn new() -> DuplicateFilter {
        Self::default()
    }

    /// Returns `true` for ids that were seen for the first time. The test-and-insert is atomic
    ///  per id, and an id that occurs repeatedly in `ids` is reported as new (at most) once.
    pub fn test_packet_ids_are_new(&self, ids: impl IntoIterator<Item = PacketId>) -> FxHashMap<PacketId, bool> {
        let mut result = FxHashMap::default();
        for id in ids {
            result.entry(id)
                .or_insert_with(|| self.seen.insert(id));
        }
        result
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
