//! In-memory, per-user statistics cache. Grounded on
//! `userhashstatscache.cpp/h`: a simple two-level nested map, no write-back
//! logic of its own — that lives in `history.rs`, which treats this as the
//! fast path in front of the DB cache table.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use jiff::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashHistoryStats {
    pub last_history_id: u32,
    pub hash_id: u32,
    pub score_heard_count: u32,
    pub last_heard: Option<Timestamp>,
    pub average_permillage: i16,
}

#[derive(Default)]
pub struct UserHashStatsCache {
    stats: Mutex<HashMap<u32, HashMap<u32, HashHistoryStats>>>,
    users_loaded: Mutex<HashSet<u32>>,
}

impl UserHashStatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_been_loaded_for_user(&self, user_id: u32) -> bool {
        self.users_loaded.lock().unwrap().contains(&user_id)
    }

    pub fn load_for_user(&self, user_id: u32, stats: Vec<HashHistoryStats>) {
        let mut by_hash = HashMap::new();
        for s in stats {
            by_hash.insert(s.hash_id, s);
        }
        self.stats.lock().unwrap().insert(user_id, by_hash);
        self.users_loaded.lock().unwrap().insert(user_id);
    }

    pub fn get_for_user(&self, user_id: u32, hash_ids: &[u32]) -> Vec<HashHistoryStats> {
        let stats = self.stats.lock().unwrap();
        let Some(by_hash) = stats.get(&user_id) else {
            return Vec::new();
        };
        hash_ids.iter().filter_map(|id| by_hash.get(id).copied()).collect()
    }

    pub fn add(&self, user_id: u32, stats: HashHistoryStats) {
        self.stats
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .insert(stats.hash_id, stats);
    }

    pub fn remove(&self, user_id: u32, hash_id: u32) {
        if let Some(by_hash) = self.stats.lock().unwrap().get_mut(&user_id) {
            by_hash.remove(&hash_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(hash_id: u32, last_history_id: u32) -> HashHistoryStats {
        HashHistoryStats {
            last_history_id,
            hash_id,
            score_heard_count: 1,
            last_heard: None,
            average_permillage: 500,
        }
    }

    #[test]
    fn unloaded_user_reports_not_loaded() {
        let cache = UserHashStatsCache::new();
        assert!(!cache.has_been_loaded_for_user(1));
        assert!(cache.get_for_user(1, &[10]).is_empty());
    }

    #[test]
    fn load_then_get_round_trips() {
        let cache = UserHashStatsCache::new();
        cache.load_for_user(1, vec![stats(10, 5), stats(20, 6)]);
        assert!(cache.has_been_loaded_for_user(1));
        let got = cache.get_for_user(1, &[10, 20, 30]);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn remove_drops_single_entry() {
        let cache = UserHashStatsCache::new();
        cache.load_for_user(1, vec![stats(10, 5)]);
        cache.remove(1, 10);
        assert!(cache.get_for_user(1, &[10]).is_empty());
    }
}
