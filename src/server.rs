//! `ServerContext`: the explicit value carrying what the source kept as
//! global `QCoreApplication`-rooted singletons. Everything that needs the
//! registrar, the relations graph, the statistics engine, or the DB
//! connection receives this value (or an `Arc` to it) rather than
//! reaching for ambient global state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex};

use camino::Utf8PathBuf;
use color_eyre::{Result, eyre::Context};
use rusqlite::Connection;
use tokio::sync::{Mutex as AsyncMutex, broadcast};

use crate::fileanalyzer::AnalysisPool;
use crate::hashes::{HashIdRegistrar, HashRelations};
use crate::history::HistoryEngine;
use crate::history::fixer::UserHashStatsCacheFixer;
use crate::history::prefetcher::HistoryStatisticsPrefetcher;
use crate::queue::PlaybackQueue;
use crate::scan::IndexationPool;
use crate::scrobbling::LastFmScrobblingBackend;
use crate::wire::PlayerState;

/// Domain events the connection layer broadcasts to subscribed sessions:
/// components publish here instead of reaching into a session's internals
/// directly.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    QueueEntryAdded { index: usize, queue_id: u32 },
    QueueEntryRemoved { queue_id: u32 },
    QueueEntryMoved { queue_id: u32, new_index: usize },
    PlayerStateChanged,
    VolumeChanged(u8),
    IndexationRunning(bool),
}

/// Server-tracked playback state. Actual audio decode/output is an
/// external collaborator; this struct only tracks the state transitions a
/// real player would report back, so queue/session logic has something
/// authoritative to read and mutate.
pub struct Playback {
    pub state: PlayerState,
    pub volume: u8,
    pub position_ms: u64,
}

impl Default for Playback {
    fn default() -> Self {
        Playback { state: PlayerState::Stopped, volume: 100, position_ms: 0 }
    }
}

pub struct ServerContext {
    pub(crate) db: Arc<AsyncMutex<Connection>>,
    pub(crate) music_dir: Utf8PathBuf,
    pub registrar: Arc<HashIdRegistrar>,
    pub relations: Arc<HashRelations>,
    pub history: Arc<HistoryEngine>,
    pub(crate) analysis_pool: Arc<AnalysisPool>,
    pub(crate) indexation_pool: IndexationPool,
    pub scrobbling: Option<Arc<LastFmScrobblingBackend>>,
    pub queue: Arc<SyncMutex<PlaybackQueue>>,
    pub playback: Arc<SyncMutex<Playback>>,
    pub events: broadcast::Sender<ServerEvent>,
    pub indexation_running: Arc<std::sync::atomic::AtomicBool>,
    /// Per-user track-repetition-avoidance window, in seconds. Absent means
    /// the default of one hour. Kept in memory only: a real per-user
    /// preferences table would be a natural next addition.
    pub repetition_avoidance_seconds: Arc<SyncMutex<HashMap<u32, u32>>>,
    /// Salts issued for an in-progress `InitiateNewUserAccountMessage`, keyed
    /// by the login name the client announced, consumed by the matching
    /// `FinishNewUserAccountMessage`.
    pub pending_registrations: Arc<SyncMutex<HashMap<String, Vec<u8>>>>,
}

pub const DEFAULT_REPETITION_AVOIDANCE_SECONDS: u32 = 3600;

impl ServerContext {
    pub fn new(music_dir: Utf8PathBuf, db_path: Utf8PathBuf, config: &crate::config::Config) -> Result<Self> {
        let db = crate::db::open(&db_path).wrap_err("could not open database")?;
        let registrar = Arc::new(HashIdRegistrar::load_from_db(&db).wrap_err("could not load hash registrar")?);
        let relations = Arc::new(HashRelations::load_from_db(&db).wrap_err("could not load hash relations")?);
        let db = Arc::new(AsyncMutex::new(db));
        let history = Arc::new(HistoryEngine::new(Arc::clone(&db), Arc::clone(&relations)));

        let scrobbling = config.lastfm.as_ref().map(|cfg| {
            Arc::new(LastFmScrobblingBackend::new(cfg.api_key.clone(), cfg.shared_secret.clone()))
        });

        let (events, _) = broadcast::channel(256);

        let analysis_pool = AnalysisPool::spawn();
        let indexation_pool = IndexationPool::spawn();

        Ok(ServerContext {
            db,
            music_dir,
            registrar,
            relations,
            history,
            analysis_pool,
            indexation_pool,
            scrobbling,
            queue: Arc::new(SyncMutex::new(PlaybackQueue::new())),
            playback: Arc::new(SyncMutex::new(Playback::default())),
            events,
            indexation_running: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            repetition_avoidance_seconds: Arc::new(SyncMutex::new(HashMap::new())),
            pending_registrations: Arc::new(SyncMutex::new(HashMap::new())),
        })
    }

    pub fn repetition_avoidance_seconds_for(&self, user_id: u32) -> u32 {
        self.repetition_avoidance_seconds
            .lock()
            .unwrap()
            .get(&user_id)
            .copied()
            .unwrap_or(DEFAULT_REPETITION_AVOIDANCE_SECONDS)
    }

    pub fn set_repetition_avoidance_seconds_for(&self, user_id: u32, seconds: u32) {
        self.repetition_avoidance_seconds.lock().unwrap().insert(user_id, seconds);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub fn notify_queue_entry_added(&self, index: usize, queue_id: u32) {
        self.publish(ServerEvent::QueueEntryAdded { index, queue_id });
    }

    pub fn notify_queue_entry_removed(&self, queue_id: u32) {
        self.publish(ServerEvent::QueueEntryRemoved { queue_id });
    }

    pub fn notify_queue_entry_moved(&self, queue_id: u32, new_index: usize) {
        self.publish(ServerEvent::QueueEntryMoved { queue_id, new_index });
    }

    pub fn notify_player_state_changed(&self) {
        self.publish(ServerEvent::PlayerStateChanged);
    }

    pub fn notify_volume_changed(&self, volume: u8) {
        self.publish(ServerEvent::VolumeChanged(volume));
    }

    /// Spawn the cache-fixer watchdog as a background task. Returns its
    /// join handle so callers (tests, or a future `shutdown` command
    /// handler) can await or abort it.
    pub fn spawn_cache_fixer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let fixer = Arc::new(UserHashStatsCacheFixer::new(Arc::clone(&self.db), Arc::clone(&self.history)));
        tokio::spawn(async move {
            fixer.run().await;
        })
    }

    /// Spawn the statistics prefetcher as a background task, warming the
    /// stats cache for every known hash/user pair ahead of client demand.
    pub fn spawn_history_prefetcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let prefetcher = Arc::new(HistoryStatisticsPrefetcher::new(
            Arc::clone(&self.registrar),
            Arc::clone(&self.db),
            Arc::clone(&self.history),
        ));
        tokio::spawn(async move {
            prefetcher.run().await;
        })
    }

    /// Run a full indexation pass on the indexation pool, toggling the
    /// indexation-running server event around the scan so subscribed
    /// clients can show progress.
    pub async fn run_indexation(self: &Arc<Self>) -> Result<()> {
        if self
            .indexation_running
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(color_eyre::eyre::eyre!("indexation already running"));
        }
        self.publish(ServerEvent::IndexationRunning(true));
        let result = self.rescan().await;
        self.indexation_running.store(false, std::sync::atomic::Ordering::SeqCst);
        self.publish(ServerEvent::IndexationRunning(false));
        result
    }
}
