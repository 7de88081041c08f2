//! Indexation driver: walks the music directory, analyzes new/changed
//! files, registers their hashes, and records file locations, using a
//! generation-based rescan: every file touched in a pass is stamped with
//! the pass's generation number, and anything left with a stale generation
//! afterwards has disappeared from disk and is pruned.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;
use jiff::Timestamp;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::fileanalyzer;
use crate::server::ServerContext;

enum ScanOutcome {
    Cached,
    Added,
    Updated,
    NotASong,
}

impl ServerContext {
    pub async fn scan_one_file(&self, relpath: &Utf8Path, abspath: &Utf8Path, mtime: Timestamp, generation: i64) -> Result<ScanOutcome> {
        let db = self.db.lock().await;
        let existing: Option<(u32, i64)> = db
            .query_row(
                "SELECT hash_id, mtime FROM track_file WHERE path = ?1",
                [relpath.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        if let Some((_, cached_mtime)) = existing
            && cached_mtime == mtime.as_millisecond()
        {
            db.execute(
                "UPDATE track_file SET generation = ?2 WHERE path = ?1",
                (relpath.as_str(), generation),
            )?;
            return Ok(ScanOutcome::Cached);
        }
        drop(db);

        let Some(analysis) = fileanalyzer::analyze_path(abspath, &self.analysis_pool).await? else {
            return Ok(ScanOutcome::NotASong);
        };

        let db = self.db.lock().await;
        let hash_id = self.registrar.get_or_create_id(&db, analysis.hash)?;
        if let Some(legacy) = analysis.legacy_hash {
            let legacy_id = self.registrar.get_or_create_id(&db, legacy)?;
            if legacy_id != hash_id {
                self.relations.mark_as_equivalent(&[hash_id, legacy_id]);
                self.relations.persist_link(&db, hash_id, legacy_id)?;
            }
        }

        let was_new = existing.is_none();
        db.execute(
            "INSERT INTO track_file (hash_id, path, mtime, generation) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET hash_id = excluded.hash_id, mtime = excluded.mtime, generation = excluded.generation",
            (hash_id, relpath.as_str(), mtime.as_millisecond(), generation),
        )?;

        crate::db::upsert_tags(
            &db,
            hash_id,
            &crate::db::TrackTags {
                title: analysis.tags.title,
                artist: analysis.tags.artist,
                album: analysis.tags.album,
                album_artist: analysis.tags.album_artist,
                duration_ms: analysis.audio.duration_ms as i64,
            },
        )?;

        Ok(if was_new { ScanOutcome::Added } else { ScanOutcome::Updated })
    }

    /// Walk `music_dir` start to finish, analyzing files as needed. Hops
    /// onto the indexation pool's dedicated thread so walking a large tree
    /// and hashing files never runs on whatever task is driving connection
    /// handling.
    pub async fn rescan(self: &Arc<Self>) -> Result<()> {
        self.indexation_pool.run(Arc::clone(self)).await
    }

    async fn rescan_on_pool_thread(&self) -> Result<()> {
        let generation: i64 = {
            let db = self.db.lock().await;
            db.query_row("SELECT COALESCE(MAX(generation), 0) + 1 FROM track_file", [], |row| row.get(0))
                .unwrap_or(1)
        };

        let (mut cached, mut added, mut updated, mut not_songs) = (0u32, 0u32, 0u32, 0u32);
        for entry in walkdir::WalkDir::new(self.music_dir.as_std_path()).follow_links(true) {
            let Ok(entry) = entry else { continue };
            let Ok(metadata) = entry.metadata() else { continue };
            if metadata.is_dir() {
                continue;
            }
            let Some(abspath) = Utf8Path::from_path(entry.path()) else { continue };
            let Ok(relpath) = abspath.strip_prefix(&self.music_dir) else { continue };
            let Ok(mtime) = metadata.modified().map(Timestamp::try_from) else { continue };
            let Ok(mtime) = mtime else { continue };

            match self.scan_one_file(relpath, abspath, mtime, generation).await? {
                ScanOutcome::Cached => cached += 1,
                ScanOutcome::Added => added += 1,
                ScanOutcome::Updated => updated += 1,
                ScanOutcome::NotASong => not_songs += 1,
            }
        }

        let db = self.db.lock().await;
        let removed: usize = db.execute("DELETE FROM track_file WHERE generation < ?1", [generation])?;
        info!(
            "indexation complete: {added} added, {updated} updated, {cached} cached, {removed} removed, {not_songs} skipped (not audio)"
        );
        Ok(())
    }

    pub fn music_dir(&self) -> &Utf8PathBuf {
        &self.music_dir
    }
}

struct IndexationJob {
    ctx: Arc<ServerContext>,
    reply: oneshot::Sender<Result<()>>,
}

/// Indexation pool: a single dedicated OS thread fed by a
/// `tokio::sync::mpsc` queue, running its own small current-thread Tokio
/// runtime so a rescan never borrows a thread from whatever runtime is
/// driving connection handling.
pub struct IndexationPool {
    tx: mpsc::UnboundedSender<IndexationJob>,
}

impl IndexationPool {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<IndexationJob>();
        std::thread::Builder::new()
            .name("indexation-pool".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to start indexation pool runtime");
                while let Some(job) = rx.blocking_recv() {
                    let result = rt.block_on(job.ctx.rescan_on_pool_thread());
                    let _ = job.reply.send(result);
                }
            })
            .expect("failed to spawn indexation pool thread");
        IndexationPool { tx }
    }

    async fn run(&self, ctx: Arc<ServerContext>) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(IndexationJob { ctx, reply })
            .map_err(|_| color_eyre::eyre::eyre!("indexation pool thread is gone"))?;
        reply_rx.await.map_err(|_| color_eyre::eyre::eyre!("indexation pool dropped its reply"))?
    }
}
