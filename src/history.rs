//! History & per-user statistics engine.
//!
//! Grounded on `historystatistics.cpp`: write-behind caching with a CAS'd
//! watermark over the history log, non-blocking stats reads that schedule
//! a background fetch on a cache miss, and an equivalence-aware
//! invalidation path feeding the [`fixer::UserHashStatsCacheFixer`]
//! watchdog.

pub mod cache;
pub mod fixer;
pub mod prefetcher;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use color_eyre::Result;
use jiff::Timestamp;
use rusqlite::Connection;
use tokio::sync::{Mutex as AsyncMutex, broadcast};

use crate::hashes::HashRelations;
use cache::{HashHistoryStats, UserHashStatsCache};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackStats {
    pub last_history_id: u32,
    pub last_heard: Option<Timestamp>,
    pub play_count_for_score: u32,
    pub average_permillage: i16,
}

impl From<HashHistoryStats> for TrackStats {
    fn from(s: HashHistoryStats) -> Self {
        TrackStats {
            last_history_id: s.last_history_id,
            last_heard: s.last_heard,
            play_count_for_score: s.score_heard_count,
            average_permillage: s.average_permillage,
        }
    }
}

/// `hash_statistics_changed(user, group_ids)`, broadcast so every session
/// subscribed to statistics updates can forward it to its client.
#[derive(Debug, Clone)]
pub struct HashStatisticsChanged {
    pub user_id: u32,
    pub hash_ids: Vec<u32>,
}

pub struct HistoryEngine {
    db: Arc<AsyncMutex<Connection>>,
    relations: Arc<HashRelations>,
    cache: UserHashStatsCache,
    in_progress: Mutex<HashSet<(u32, u32)>>,
    events: broadcast::Sender<HashStatisticsChanged>,
}

impl HistoryEngine {
    pub fn new(db: Arc<AsyncMutex<Connection>>, relations: Arc<HashRelations>) -> Self {
        let (events, _) = broadcast::channel(256);
        HistoryEngine { db, relations, cache: UserHashStatsCache::new(), in_progress: Mutex::new(HashSet::new()), events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HashStatisticsChanged> {
        self.events.subscribe()
    }

    /// Append a history record, recompute the touched equivalence group's
    /// aggregates, and advance the cache-consistency bookmark. Returns the
    /// newly assigned, monotonically increasing history id.
    pub async fn add_to_history(
        &self,
        user_id: u32,
        hash_id: u32,
        started: Timestamp,
        ended: Timestamp,
        permillage: i16,
        valid_for_scoring: bool,
    ) -> Result<u32> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO history (hash_id, user_id, started_at, ended_at, permillage, valid_for_scoring)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                hash_id,
                user_id,
                started.as_millisecond(),
                ended.as_millisecond(),
                permillage,
                valid_for_scoring,
            ),
        )?;
        let history_id: i64 = db.last_insert_rowid();

        let group = self.relations.group_of(hash_id);
        self.recalculate_group_stats(&db, user_id, &group)?;

        self.advance_bookmark_cas(&db, history_id)?;

        drop(db);
        self.schedule_statistics_changed(user_id, group.into_iter().collect());

        Ok(history_id as u32)
    }

    /// Non-blocking: returns cached stats immediately, or schedules a
    /// background fetch and returns `None`. Concurrent callers for the same
    /// `(user, hash)` coalesce onto one fetch.
    pub fn get_stats_if_available(self: &Arc<Self>, user_id: u32, hash_id: u32) -> Option<TrackStats> {
        let cached = self.cache.get_for_user(user_id, &[hash_id]);
        if let Some(s) = cached.into_iter().next() {
            return Some(s.into());
        }

        let mut in_progress = self.in_progress.lock().unwrap();
        if !in_progress.insert((user_id, hash_id)) {
            return None; // a fetch is already in flight for this pair
        }
        drop(in_progress);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.fetch_and_cache(user_id, hash_id).await {
                tracing::warn!("background stats fetch for user {user_id} hash {hash_id} failed: {e:#}");
            }
            this.in_progress.lock().unwrap().remove(&(user_id, hash_id));
        });

        None
    }

    /// Ensure stats for `(user_id, hash_id)` are cached, fetching them if
    /// missing. Unlike [`get_stats_if_available`](Self::get_stats_if_available),
    /// this awaits the fetch itself rather than scheduling it in the
    /// background — for callers (the prefetcher) that already throttle
    /// their own concurrency.
    pub async fn prefetch_if_missing(self: &Arc<Self>, user_id: u32, hash_id: u32) -> Result<()> {
        if self.cache.get_for_user(user_id, &[hash_id]).into_iter().next().is_some() {
            return Ok(());
        }
        self.fetch_and_cache(user_id, hash_id).await
    }

    async fn fetch_and_cache(self: &Arc<Self>, user_id: u32, hash_id: u32) -> Result<()> {
        let db = self.db.lock().await;
        let group = self.relations.group_of(hash_id);
        let changed = self.recalculate_group_stats(&db, user_id, &group)?;
        drop(db);
        if changed {
            self.schedule_statistics_changed(user_id, group.into_iter().collect());
        }
        Ok(())
    }

    fn schedule_statistics_changed(&self, user_id: u32, hash_ids: Vec<u32>) {
        let _ = self.events.send(HashStatisticsChanged { user_id, hash_ids });
    }

    /// Recompute every member of `group`'s stats for `user_id` from the
    /// authoritative history table and install the results in the cache.
    /// Returns whether anything actually changed (used to decide whether to
    /// emit the changed event).
    fn recalculate_group_stats(&self, db: &Connection, user_id: u32, group: &HashSet<u32>) -> Result<bool> {
        let mut changed = false;
        for &hash_id in group {
            let row = db.query_row(
                "SELECT MAX(id), COUNT(*), AVG(permillage), MAX(ended_at)
                 FROM history WHERE user_id = ?1 AND hash_id = ?2 AND valid_for_scoring = 1",
                (user_id, hash_id),
                |row| {
                    let last_id: Option<i64> = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    let avg: Option<f64> = row.get(2)?;
                    let last_heard: Option<i64> = row.get(3)?;
                    Ok((last_id, count, avg, last_heard))
                },
            )?;
            let (last_id, count, avg, last_heard) = row;
            let Some(last_id) = last_id else { continue };

            let new_stats = HashHistoryStats {
                last_history_id: last_id as u32,
                hash_id,
                score_heard_count: count as u32,
                last_heard: last_heard.and_then(crate::wire::timestamp_from_wire),
                average_permillage: avg.unwrap_or(0.0).round() as i16,
            };

            let previous = self.cache.get_for_user(user_id, &[hash_id]).into_iter().next();
            if previous != Some(new_stats) {
                changed = true;
            }

            self.persist_cache_row(db, user_id, &new_stats)?;
            self.cache.add(user_id, new_stats);
        }
        Ok(changed)
    }

    fn persist_cache_row(&self, db: &Connection, user_id: u32, stats: &HashHistoryStats) -> Result<()> {
        db.execute(
            "INSERT INTO user_hash_stats_cache (user_id, hash_id, last_history_id, last_heard, play_count, avg_permillage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, hash_id) DO UPDATE SET
                last_history_id = excluded.last_history_id,
                last_heard = excluded.last_heard,
                play_count = excluded.play_count,
                avg_permillage = excluded.avg_permillage",
            (
                user_id,
                stats.hash_id,
                stats.last_history_id,
                stats.last_heard.map(|t| t.as_millisecond()),
                stats.score_heard_count,
                stats.average_permillage,
            ),
        )?;
        Ok(())
    }

    fn advance_bookmark_cas(&self, db: &Connection, new_history_id: i64) -> Result<()> {
        let old = (new_history_id - 1).to_string();
        let updated = db.execute(
            "UPDATE misc_data SET value = ?1 WHERE key = 'UserHashStatsCacheHistoryId' AND value = ?2",
            (new_history_id.to_string(), &old),
        )?;
        if updated == 0 {
            db.execute(
                "INSERT OR IGNORE INTO misc_data (key, value) VALUES ('UserHashStatsCacheHistoryId', ?1)",
                [new_history_id.to_string()],
            )?;
        }
        Ok(())
    }

    /// Triggered by an equivalence-relation change: every member of the
    /// (new, merged) group must be recomputed, for every user that has any
    /// cached entry touching the group.
    pub fn invalidate_all_group_statistics_for_hash(&self, db: &Connection, hash_id: u32) -> Result<()> {
        let group = self.relations.group_of(hash_id);
        let mut user_ids = HashSet::new();
        {
            let mut stmt = db.prepare("SELECT DISTINCT user_id FROM history WHERE hash_id = ?1")?;
            for &member in &group {
                let rows = stmt.query_map([member], |row| row.get::<_, u32>(0))?;
                for row in rows {
                    user_ids.insert(row?);
                }
            }
        }

        for user_id in user_ids {
            self.recalculate_group_stats(db, user_id, &group)?;
        }
        Ok(())
    }

    /// Triggered when a single `(user, hash)` row's history lineage must be
    /// re-derived (e.g. the cache-fixer catching up on new history rows).
    pub fn invalidate_individual_hash_statistics(&self, db: &Connection, user_id: u32, hash_id: u32) -> Result<()> {
        self.cache.remove(user_id, hash_id);
        let group = HashSet::from([hash_id]);
        self.recalculate_group_stats(db, user_id, &group)?;
        Ok(())
    }
}
