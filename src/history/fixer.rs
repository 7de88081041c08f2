//! Background watchdog that keeps the statistics cache consistent with the
//! authoritative history log. Grounded on `userhashstatscachefixer.cpp/h`:
//! state machine `Initial -> WaitBeforeDeciding -> DecideWhatToDo ->
//! ProcessingHistory -> Finished`, batches of up to 10 history records per
//! pass, coalescing already-invalidated `(user, hash)` pairs within one
//! pass, and a compare-and-set bookmark advance using the exact string it
//! read as the CAS expected-old-value.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use super::HistoryEngine;

const INITIAL_WAIT: Duration = Duration::from_secs(5);
const PASS_WAIT_ON_PROGRESS: Duration = Duration::from_secs(3);
const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);
const BATCH_SIZE: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixerState {
    Initial,
    WaitBeforeDeciding,
    DecideWhatToDo,
    ProcessingHistory,
    Finished,
}

pub struct UserHashStatsCacheFixer {
    db: Arc<AsyncMutex<Connection>>,
    engine: Arc<HistoryEngine>,
    state: std::sync::Mutex<FixerState>,
}

impl UserHashStatsCacheFixer {
    pub fn new(db: Arc<AsyncMutex<Connection>>, engine: Arc<HistoryEngine>) -> Self {
        UserHashStatsCacheFixer { db, engine, state: std::sync::Mutex::new(FixerState::Initial) }
    }

    pub fn state(&self) -> FixerState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: FixerState) {
        *self.state.lock().unwrap() = s;
    }

    /// Run until the bookmark catches up to the latest history id, then
    /// return. Callers spawn this as a long-lived background task.
    pub async fn run(self: Arc<Self>) {
        self.set_state(FixerState::WaitBeforeDeciding);
        tokio::time::sleep(INITIAL_WAIT).await;

        let mut backoff = BACKOFF_INITIAL;
        loop {
            self.set_state(FixerState::DecideWhatToDo);
            match self.run_one_pass().await {
                Ok(true) => {
                    self.set_state(FixerState::Finished);
                    info!("cache fixer caught up with history, bookmark matches latest id");
                    return;
                }
                Ok(false) => {
                    backoff = BACKOFF_INITIAL;
                    tokio::time::sleep(PASS_WAIT_ON_PROGRESS).await;
                }
                Err(e) => {
                    warn!("cache fixer pass failed: {e:#}, backing off {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    /// Returns `Ok(true)` once the bookmark has caught up to the latest
    /// history id (nothing left to do), `Ok(false)` if a batch was
    /// processed and there's more to do, `Err` on failure (the bookmark is
    /// left untouched so no invalidated-but-unbookmarked record is lost).
    async fn run_one_pass(&self) -> color_eyre::Result<bool> {
        self.set_state(FixerState::ProcessingHistory);
        let db = self.db.lock().await;

        let bookmark_str: Option<String> = db
            .query_row(
                "SELECT value FROM misc_data WHERE key = 'UserHashStatsCacheHistoryId'",
                [],
                |row| row.get(0),
            )
            .ok();
        let bookmark: i64 = bookmark_str.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);

        let latest: i64 = db.query_row("SELECT COALESCE(MAX(id), 0) FROM history", [], |row| row.get(0))?;
        if bookmark >= latest {
            return Ok(true);
        }

        let mut stmt = db.prepare(
            "SELECT id, hash_id, user_id FROM history WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows: Vec<(i64, u32, u32)> = stmt
            .query_map((bookmark, BATCH_SIZE), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        if rows.is_empty() {
            return Ok(true);
        }

        let mut already_invalidated: HashSet<(u32, u32)> = HashSet::new();
        let mut new_bookmark = bookmark;
        for (id, hash_id, user_id) in &rows {
            if already_invalidated.insert((*user_id, *hash_id)) {
                self.engine.invalidate_individual_hash_statistics(&db, *user_id, *hash_id)?;
            }
            new_bookmark = new_bookmark.max(*id);
        }

        let old_value = bookmark_str.unwrap_or_else(|| "0".to_string());
        let updated = db.execute(
            "UPDATE misc_data SET value = ?1 WHERE key = 'UserHashStatsCacheHistoryId' AND value = ?2",
            (new_bookmark.to_string(), &old_value),
        )?;
        if updated == 0 {
            // first run: no row yet, insert it.
            db.execute(
                "INSERT OR IGNORE INTO misc_data (key, value) VALUES ('UserHashStatsCacheHistoryId', ?1)",
                [new_bookmark.to_string()],
            )?;
        }

        Ok(new_bookmark >= latest)
    }
}
