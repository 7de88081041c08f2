//! Content-addressed track identity: hashing and tag extraction.
//!
//! The hash of a file is *defined* by the strip rules below: any
//! implementation must reproduce them byte-for-byte to stay interoperable
//! with existing history, so this module follows `fileanalyzer.cpp`
//! strip-order exactly rather than just
//! "close enough" tag stripping.

mod flac;
mod mp3;

use std::sync::Arc;

use camino::Utf8Path;
use color_eyre::{Result, eyre::Context};
use md5::{Digest, Md5};
use sha1::Sha1;
use tokio::sync::{mpsc, oneshot};

use crate::wire::WireFileHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    Mp3,
    Flac,
}

impl Extension {
    pub fn from_path(path: &Utf8Path) -> Option<Self> {
        match path.extension()?.to_ascii_lowercase().as_str() {
            "mp3" => Some(Extension::Mp3),
            "flac" => Some(Extension::Flac),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct TagData {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct AudioData {
    pub duration_ms: i32,
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub hash: WireFileHash,
    /// Present only when stripping ID3v2 alone yields bytes that differ
    /// from the final (fully stripped) buffer — historical data keyed by
    /// the intermediate hash stays reachable.
    pub legacy_hash: Option<WireFileHash>,
    pub audio: AudioData,
    pub tags: TagData,
}

const ID3V1_TAG_SIZE: usize = 128;

/// Strip a trailing ID3v1 tag (exactly 128 bytes, `"TAG"` marker), shared
/// by both the MP3 and FLAC analyzers the way `fileanalyzer.cpp`'s
/// `stripID3v1` is shared by `analyzeMp3`/`analyzeFlac`. Guards against
/// misreading the final 128 bytes of an APEv2 tag that happens to contain
/// `"TAG"` at that offset by checking the 8 bytes starting 3 bytes before
/// the match against `"APETAGEX"` — those 8 bytes overlap the `"TAG"`
/// match by 3 (`"APETAGEX"[3..6] == "TAG"`), so a real APE footer there
/// lines up exactly — if it matches, this isn't an ID3v1 tag, it's APE
/// tag data, and must be left for `strip_ape`.
fn strip_id3v1(data: &[u8]) -> &[u8] {
    if data.len() < ID3V1_TAG_SIZE {
        return data;
    }
    let tag_start = data.len() - ID3V1_TAG_SIZE;
    if &data[tag_start..tag_start + 3] != b"TAG" {
        return data;
    }
    if tag_start >= 3 && &data[tag_start - 3..tag_start + 5] == b"APETAGEX" {
        return data;
    }
    &data[..tag_start]
}

/// `(length, SHA1, MD5)` of a byte slice, used both for the final hash and
/// for the legacy intermediate.
fn hash_of(data: &[u8]) -> WireFileHash {
    let mut sha1 = Sha1::new();
    sha1.update(data);
    let sha1_digest = sha1.finalize();

    let mut md5 = Md5::new();
    md5.update(data);
    let md5_digest = md5.finalize();

    WireFileHash {
        length: data.len() as u64,
        sha1: sha1_digest.into(),
        md5: md5_digest.into(),
    }
}

/// Analyze file contents already loaded into memory. Splitting the entry
/// point this way lets the indexer re-stat the file before and after a read
/// without re-reading it for every retry attempt.
pub fn analyze(extension: Extension, contents: &[u8]) -> Result<AnalysisResult> {
    match extension {
        Extension::Mp3 => mp3::analyze(contents),
        Extension::Flac => flac::analyze(contents),
    }
}

/// Load a file and analyze it, re-stating it before and after the read: if
/// `(size, mtime)` changed while we were reading, the caller should
/// re-enqueue rather than trust this result. The CPU-bound analysis step
/// itself runs on `pool`'s dedicated thread, not on whatever reactor
/// thread is driving this future.
pub async fn analyze_path(path: &Utf8Path, pool: &AnalysisPool) -> Result<Option<AnalysisResult>> {
    let Some(extension) = Extension::from_path(path) else {
        return Ok(None);
    };

    let before = tokio::fs::metadata(path).await;
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("could not read {path}"))?;
    let after = tokio::fs::metadata(path).await;

    match (before, after) {
        (Ok(before), Ok(after)) if before.len() == after.len() && mtimes_match(&before, &after) => {
        }
        (Ok(_), Ok(_)) => return Ok(None), // changed mid-read; caller re-enqueues
        _ => return Ok(None),              // disappeared; caller drops it
    }

    let result = pool.analyze(extension, contents).await?;
    Ok(Some(result))
}

struct AnalysisJob {
    extension: Extension,
    contents: Vec<u8>,
    reply: oneshot::Sender<Result<AnalysisResult>>,
}

/// On-demand analysis pool: a single dedicated OS thread fed by a
/// `tokio::sync::mpsc` queue, so hashing a file never borrows a thread
/// from whatever async runtime is driving connection handling.
pub struct AnalysisPool {
    tx: mpsc::UnboundedSender<AnalysisJob>,
}

impl AnalysisPool {
    pub fn spawn() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AnalysisJob>();
        std::thread::Builder::new()
            .name("analysis-pool".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    let result = analyze(job.extension, &job.contents);
                    let _ = job.reply.send(result);
                }
            })
            .expect("failed to spawn analysis pool thread");
        Arc::new(AnalysisPool { tx })
    }

    async fn analyze(&self, extension: Extension, contents: Vec<u8>) -> Result<AnalysisResult> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(AnalysisJob { extension, contents, reply })
            .map_err(|_| color_eyre::eyre::eyre!("analysis pool thread is gone"))?;
        reply_rx.await.map_err(|_| color_eyre::eyre::eyre!("analysis pool dropped its reply"))?
    }
}

fn mtimes_match(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    match (a.modified(), b.modified()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_detection_is_case_insensitive() {
        assert_eq!(Extension::from_path(Utf8Path::new("a/b.MP3")), Some(Extension::Mp3));
        assert_eq!(Extension::from_path(Utf8Path::new("a/b.flac")), Some(Extension::Flac));
        assert_eq!(Extension::from_path(Utf8Path::new("a/b.wav")), None);
    }

    #[test]
    fn hash_of_is_stable_for_identical_bytes() {
        let a = hash_of(b"hello world");
        let b = hash_of(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, hash_of(b"hello worlD"));
    }
}
