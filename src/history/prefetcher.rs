//! Background warmup that walks every registered hash id and makes sure
//! its statistics are cached for every known user, so a client's first
//! real request for a track's stats rarely has to wait on a fetch.
//! Grounded on `historystatisticsprefetcher.cpp/h`: a `WorkThrottle`
//! capping concurrent fetch jobs at 5, one pass over the whole hash list
//! per cycle, and a growing retry interval (capped at 10 minutes) while
//! the hash list is still empty.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{debug, warn};

use super::HistoryEngine;
use crate::hashes::HashIdRegistrar;
use crate::user;

const MAX_CONCURRENT_JOBS: usize = 5;
const STEP_INTERVAL: Duration = Duration::from_millis(200);
const EMPTY_LIST_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
const EMPTY_LIST_MAX_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct HistoryStatisticsPrefetcher {
    registrar: Arc<HashIdRegistrar>,
    db: Arc<AsyncMutex<Connection>>,
    engine: Arc<HistoryEngine>,
    throttle: Arc<Semaphore>,
}

impl HistoryStatisticsPrefetcher {
    pub fn new(registrar: Arc<HashIdRegistrar>, db: Arc<AsyncMutex<Connection>>, engine: Arc<HistoryEngine>) -> Self {
        HistoryStatisticsPrefetcher { registrar, db, engine, throttle: Arc::new(Semaphore::new(MAX_CONCURRENT_JOBS)) }
    }

    /// Runs forever. Callers spawn this as a long-lived background task.
    pub async fn run(self: Arc<Self>) {
        let mut empty_list_interval = EMPTY_LIST_INITIAL_INTERVAL;
        loop {
            let hash_ids = self.registrar.get_all_loaded();
            if hash_ids.is_empty() {
                debug!("prefetcher: hash list is empty, waiting {empty_list_interval:?}");
                tokio::time::sleep(empty_list_interval).await;
                empty_list_interval = (empty_list_interval * 2).min(EMPTY_LIST_MAX_INTERVAL);
                continue;
            }
            empty_list_interval = EMPTY_LIST_INITIAL_INTERVAL;

            let user_ids = {
                let db = self.db.lock().await;
                match user::list_all(&db) {
                    Ok(users) => users.into_iter().map(|u| u.id).collect::<Vec<_>>(),
                    Err(e) => {
                        warn!("prefetcher: could not list users: {e:#}");
                        Vec::new()
                    }
                }
            };

            debug!("prefetcher: starting pass over {} hashes x {} users", hash_ids.len(), user_ids.len());
            for hash_id in hash_ids {
                for &user_id in &user_ids {
                    let permit = match Arc::clone(&self.throttle).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return, // semaphore closed: shutting down
                    };
                    let engine = Arc::clone(&self.engine);
                    tokio::spawn(async move {
                        if let Err(e) = engine.prefetch_if_missing(user_id, hash_id).await {
                            warn!("prefetcher: fetch for user {user_id} hash {hash_id} failed: {e:#}");
                        }
                        drop(permit);
                    });
                    tokio::time::sleep(STEP_INTERVAL).await;
                }
            }
            debug!("prefetcher: pass complete");
        }
    }
}
