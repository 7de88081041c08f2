//! Schema and queries backing the content-addressed track store, user
//! accounts, and per-user statistics.
//! The store itself — the SQL engine, connection pooling — is an external
//! collaborator; this module only owns the five tables the rest of the
//! crate reads and writes.

use camino::Utf8Path;
use color_eyre::Result;
use rusqlite::{Connection, OptionalExtension};

pub fn open(path: &Utf8Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Connection::open(path)?;
    init_schema(&db)?;
    Ok(db)
}

pub fn init_schema(db: &Connection) -> Result<()> {
    db.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS hash (
            id      INTEGER PRIMARY KEY,
            length  INTEGER NOT NULL,
            sha1    BLOB NOT NULL,
            md5     BLOB NOT NULL,
            UNIQUE(sha1, md5)
        );
        CREATE TABLE IF NOT EXISTS hash_equivalence (
            hash_id_a INTEGER NOT NULL,
            hash_id_b INTEGER NOT NULL,
            UNIQUE(hash_id_a, hash_id_b)
        );
        CREATE TABLE IF NOT EXISTS history (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            hash_id           INTEGER NOT NULL,
            user_id           INTEGER NOT NULL,
            started_at        INTEGER NOT NULL,
            ended_at          INTEGER NOT NULL,
            permillage        INTEGER NOT NULL DEFAULT -1,
            valid_for_scoring INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS history_by_user_hash ON history(user_id, hash_id);
        CREATE TABLE IF NOT EXISTS user_hash_stats_cache (
            user_id         INTEGER NOT NULL,
            hash_id         INTEGER NOT NULL,
            last_history_id INTEGER NOT NULL,
            last_heard      INTEGER,
            play_count      INTEGER NOT NULL,
            avg_permillage  INTEGER NOT NULL,
            PRIMARY KEY (user_id, hash_id)
        );
        CREATE TABLE IF NOT EXISTS misc_data (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS user (
            id       INTEGER PRIMARY KEY AUTOINCREMENT,
            login    TEXT NOT NULL UNIQUE,
            salt     BLOB NOT NULL,
            password TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS track_file (
            hash_id  INTEGER NOT NULL,
            path     TEXT NOT NULL UNIQUE,
            mtime    INTEGER NOT NULL,
            generation INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS hash_tags (
            hash_id      INTEGER PRIMARY KEY,
            title        TEXT,
            artist       TEXT,
            album        TEXT,
            album_artist TEXT,
            duration_ms  INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS scrobbling_user_data (
            user_id                INTEGER PRIMARY KEY,
            enable_lastfm          INTEGER NOT NULL DEFAULT 0,
            lastfm_user            TEXT,
            lastfm_session_key     TEXT,
            lastfm_scrobbled_up_to INTEGER NOT NULL DEFAULT 0
        );
        COMMIT;",
    )?;
    Ok(())
}

/// A track's display metadata, keyed by hash id rather than by file path:
/// every path sharing a hash shares one row.
#[derive(Debug, Clone, Default)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub duration_ms: i64,
}

pub fn upsert_tags(db: &Connection, hash_id: u32, tags: &TrackTags) -> Result<()> {
    db.execute(
        "INSERT INTO hash_tags (hash_id, title, artist, album, album_artist, duration_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(hash_id) DO UPDATE SET
            title = excluded.title,
            artist = excluded.artist,
            album = excluded.album,
            album_artist = excluded.album_artist,
            duration_ms = excluded.duration_ms",
        (hash_id, &tags.title, &tags.artist, &tags.album, &tags.album_artist, tags.duration_ms),
    )?;
    Ok(())
}

pub fn get_tags(db: &Connection, hash_id: u32) -> Result<Option<TrackTags>> {
    db.query_row(
        "SELECT title, artist, album, album_artist, duration_ms FROM hash_tags WHERE hash_id = ?1",
        [hash_id],
        |row| {
            Ok(TrackTags {
                title: row.get(0)?,
                artist: row.get(1)?,
                album: row.get(2)?,
                album_artist: row.get(3)?,
                duration_ms: row.get(4)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// A user's persisted Last.fm scrobbling preferences and session, keyed by
/// user id so it survives a server restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrobblingUserData {
    pub enabled: bool,
    pub username: Option<String>,
    pub session_key: Option<String>,
}

pub fn get_scrobbling_user_data(db: &Connection, user_id: u32) -> Result<Option<ScrobblingUserData>> {
    db.query_row(
        "SELECT enable_lastfm, lastfm_user, lastfm_session_key FROM scrobbling_user_data WHERE user_id = ?1",
        [user_id],
        |row| {
            Ok(ScrobblingUserData {
                enabled: row.get::<_, i64>(0)? != 0,
                username: row.get(1)?,
                session_key: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn upsert_scrobbling_enabled(db: &Connection, user_id: u32, enabled: bool) -> Result<()> {
    db.execute(
        "INSERT INTO scrobbling_user_data (user_id, enable_lastfm) VALUES (?1, ?2)
         ON CONFLICT(user_id) DO UPDATE SET enable_lastfm = excluded.enable_lastfm",
        (user_id, enabled),
    )?;
    Ok(())
}

pub fn upsert_scrobbling_session(
    db: &Connection,
    user_id: u32,
    username: Option<&str>,
    session_key: Option<&str>,
) -> Result<()> {
    db.execute(
        "INSERT INTO scrobbling_user_data (user_id, lastfm_user, lastfm_session_key) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET lastfm_user = excluded.lastfm_user, lastfm_session_key = excluded.lastfm_session_key",
        (user_id, username, session_key),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_init_is_idempotent() {
        let db = Connection::open_in_memory().unwrap();
        init_schema(&db).unwrap();
        init_schema(&db).unwrap();
    }

    #[test]
    fn tags_round_trip_and_upsert_overwrites() {
        let db = Connection::open_in_memory().unwrap();
        init_schema(&db).unwrap();
        let tags = TrackTags { title: Some("A".into()), artist: Some("B".into()), album: None, album_artist: None, duration_ms: 1000 };
        upsert_tags(&db, 1, &tags).unwrap();
        assert_eq!(get_tags(&db, 1).unwrap().unwrap().title.as_deref(), Some("A"));

        let tags2 = TrackTags { title: Some("A2".into()), ..tags };
        upsert_tags(&db, 1, &tags2).unwrap();
        assert_eq!(get_tags(&db, 1).unwrap().unwrap().title.as_deref(), Some("A2"));

        assert!(get_tags(&db, 2).unwrap().is_none());
    }

    #[test]
    fn scrobbling_user_data_round_trip_and_upserts() {
        let db = Connection::open_in_memory().unwrap();
        init_schema(&db).unwrap();

        assert!(get_scrobbling_user_data(&db, 1).unwrap().is_none());

        upsert_scrobbling_enabled(&db, 1, true).unwrap();
        let data = get_scrobbling_user_data(&db, 1).unwrap().unwrap();
        assert!(data.enabled);
        assert_eq!(data.username, None);

        upsert_scrobbling_session(&db, 1, Some("alice"), Some("sk-123")).unwrap();
        let data = get_scrobbling_user_data(&db, 1).unwrap().unwrap();
        assert!(data.enabled); // untouched by the session upsert
        assert_eq!(data.username.as_deref(), Some("alice"));
        assert_eq!(data.session_key.as_deref(), Some("sk-123"));

        upsert_scrobbling_enabled(&db, 1, false).unwrap();
        let data = get_scrobbling_user_data(&db, 1).unwrap().unwrap();
        assert!(!data.enabled);
        assert_eq!(data.username.as_deref(), Some("alice")); // untouched
    }
}
