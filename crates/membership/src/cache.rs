//! Bounded row-id to member-id cache backing the change-feed listener's
//! last-resort resolver. FIFO eviction; capacity is fixed at
//! construction.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

use portaria_shared::MemberId;

pub struct ResolutionCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Uuid, MemberId>,
    order: VecDeque<Uuid>,
}

impl ResolutionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, row_id: &Uuid) -> Option<MemberId> {
        self.locked().entries.get(row_id).cloned()
    }

    /// Remembering an already-known row refreshes the member without
    /// consuming capacity.
    pub fn insert(&self, row_id: Uuid, member: MemberId) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.locked();
        if state.entries.insert(row_id, member).is_some() {
            return;
        }
        state.order.push_back(row_id);
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.entries.remove(&oldest);
            }
        }
    }

    pub fn remove(&self, row_id: &Uuid) {
        let mut state = self.locked();
        state.entries.remove(row_id);
        state.order.retain(|id| id != row_id);
    }

    pub fn len(&self) -> usize {
        self.locked().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_at_capacity() {
        let cache = ResolutionCache::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        cache.insert(a, MemberId::new("1"));
        cache.insert(b, MemberId::new("2"));
        cache.insert(c, MemberId::new("3"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&a), None);
        assert_eq!(cache.get(&b), Some(MemberId::new("2")));
        assert_eq!(cache.get(&c), Some(MemberId::new("3")));
    }

    #[test]
    fn refresh_does_not_consume_capacity() {
        let cache = ResolutionCache::new(2);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        cache.insert(a, MemberId::new("1"));
        cache.insert(b, MemberId::new("2"));
        cache.insert(a, MemberId::new("1-refreshed"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&a), Some(MemberId::new("1-refreshed")));
        assert_eq!(cache.get(&b), Some(MemberId::new("2")));
    }

    #[test]
    fn removal_frees_a_slot() {
        let cache = ResolutionCache::new(1);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        cache.insert(a, MemberId::new("1"));
        cache.remove(&a);
        assert!(cache.is_empty());

        cache.insert(b, MemberId::new("2"));
        assert_eq!(cache.get(&b), Some(MemberId::new("2")));
    }

    #[test]
    fn zero_capacity_never_stores() {
        let cache = ResolutionCache::new(0);
        let a = Uuid::new_v4();
        cache.insert(a, MemberId::new("1"));
        assert!(cache.is_empty());
    }
}
