//! Last.fm scrobbling backend: external HTTP API client plus the state
//! machine that gates operations on whether the session is actually usable
//! right now. Grounded on `lastfmscrobblingbackend.cpp`.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use color_eyre::{Result, eyre::bail};
use jiff::Timestamp;
use md5::{Digest, Md5};
use tracing::warn;

const API_BASE_URL: &str = "https://ws.audioscrobbler.com/2.0/";

/// Fixed retry schedule (Open Question resolution, see DESIGN.md): the
/// source leaves "later" unspecified beyond eventually retrying.
const RETRY_SCHEDULE: [Duration; 4] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(60 * 60),
];

/// Also doubles as the wire-level status byte in `StatusChangeMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::FromRepr)]
#[repr(u8)]
pub enum ScrobblingState {
    NotInitialized = 0,
    WaitingForUserCredentials = 1,
    ReadyForScrobbling = 2,
    TemporarilyUnavailable = 3,
    PermanentFatalError = 4,
}

#[derive(Debug, Clone)]
pub struct TrackToScrobble {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub duration: Option<Duration>,
}

pub struct LastFmScrobblingBackend {
    api_key: String,
    shared_secret: String,
    http: Mutex<reqwest::Client>,
    state: Mutex<ScrobblingState>,
    username: Mutex<Option<String>>,
    session_key: Mutex<Option<String>>,
    retry_attempt: Mutex<usize>,
}

impl LastFmScrobblingBackend {
    pub fn new(api_key: String, shared_secret: String) -> Self {
        LastFmScrobblingBackend {
            api_key,
            shared_secret,
            http: Mutex::new(reqwest::Client::new()),
            state: Mutex::new(ScrobblingState::NotInitialized),
            username: Mutex::new(None),
            session_key: Mutex::new(None),
            retry_attempt: Mutex::new(0),
        }
    }

    pub fn state(&self) -> ScrobblingState {
        *self.state.lock().unwrap()
    }

    pub fn username(&self) -> Option<String> {
        self.username.lock().unwrap().clone()
    }

    pub fn session_key(&self) -> Option<String> {
        self.session_key.lock().unwrap().clone()
    }

    /// `NotInitialized -> WaitingForUserCredentials` (no stored session key)
    /// or `-> ReadyForScrobbling` (session key already present, e.g.
    /// reloaded from the DB on restart).
    pub fn initialize(&self, stored_session_key: Option<String>, stored_username: Option<String>) {
        *self.username.lock().unwrap() = stored_username;
        if let Some(key) = stored_session_key {
            *self.session_key.lock().unwrap() = Some(key);
            *self.state.lock().unwrap() = ScrobblingState::ReadyForScrobbling;
        } else {
            *self.state.lock().unwrap() = ScrobblingState::WaitingForUserCredentials;
        }
    }

    pub async fn authenticate(&self, username: String, password: String) -> Result<String> {
        let params = BTreeMap::from([
            ("method".to_string(), "auth.getMobileSession".to_string()),
            ("username".to_string(), username.clone()),
            ("password".to_string(), password),
            ("api_key".to_string(), self.api_key.clone()),
        ]);
        let body = self.signed_post(&params).await?;
        let reply = parse_lfm_reply(&body)?;
        match reply {
            LfmReply::Ok { session_key, session_name } => {
                *self.username.lock().unwrap() = Some(session_name);
                *self.session_key.lock().unwrap() = Some(session_key.clone());
                *self.state.lock().unwrap() = ScrobblingState::ReadyForScrobbling;
                Ok(session_key)
            }
            LfmReply::Error { code, .. } => {
                self.apply_error_code(code);
                bail!("authentication failed with provider error {code}")
            }
        }
    }

    pub async fn update_now_playing(&self, track: &TrackToScrobble) -> Result<()> {
        self.do_scrobble_call("track.updateNowPlaying", track, None).await
    }

    pub async fn scrobble_track(&self, timestamp: Timestamp, track: &TrackToScrobble) -> Result<()> {
        self.do_scrobble_call("track.scrobble", track, Some(timestamp)).await
    }

    async fn do_scrobble_call(
        &self,
        method: &str,
        track: &TrackToScrobble,
        timestamp: Option<Timestamp>,
    ) -> Result<()> {
        if self.state() != ScrobblingState::ReadyForScrobbling {
            warn!("scrobble call '{method}' dropped: backend is not ready (state = {:?})", self.state());
            return Ok(());
        }
        let Some(session_key) = self.session_key.lock().unwrap().clone() else {
            warn!("scrobble call '{method}' dropped: no session key despite ReadyForScrobbling state");
            return Ok(());
        };

        let mut params = BTreeMap::from([
            ("method".to_string(), method.to_string()),
            ("api_key".to_string(), self.api_key.clone()),
            ("sk".to_string(), session_key),
            ("artist".to_string(), track.artist.clone()),
            ("track".to_string(), track.title.clone()),
        ]);
        if let Some(album) = &track.album {
            params.insert("album".to_string(), album.clone());
        }
        if let Some(album_artist) = &track.album_artist {
            params.insert("albumArtist".to_string(), album_artist.clone());
        }
        if let Some(timestamp) = timestamp {
            params.insert("timestamp".to_string(), timestamp.as_second().to_string());
        }

        let body = self.signed_post(&params).await?;
        match parse_lfm_reply(&body) {
            Ok(LfmReply::Ok { .. }) => Ok(()),
            Ok(LfmReply::Error { code, message }) => {
                self.apply_error_code(code);
                bail!("{method} failed with provider error {code}: {message}")
            }
            Err(e) => {
                // "network access is disabled" style failures: recreate the
                // http client and let the caller retry.
                if body.contains("disabled") {
                    *self.http.lock().unwrap() = reqwest::Client::new();
                }
                Err(e)
            }
        }
    }

    fn apply_error_code(&self, code: u32) {
        let mut state = self.state.lock().unwrap();
        match code {
            9 => {
                *self.session_key.lock().unwrap() = None;
                *state = ScrobblingState::WaitingForUserCredentials;
            }
            8 | 11 | 16 | 29 | 4 => {
                *state = ScrobblingState::TemporarilyUnavailable;
            }
            2 | 3 | 5 | 6 | 7 | 10 | 13 | 26 | 27 => {
                *state = ScrobblingState::PermanentFatalError;
            }
            _ => {}
        }
    }

    /// Exponential-ish retry delay for `TemporarilyUnavailable`, per the
    /// fixed schedule in [`RETRY_SCHEDULE`]. Capped at the schedule's last
    /// entry once attempts exceed its length.
    pub fn next_retry_delay(&self) -> Duration {
        let mut attempt = self.retry_attempt.lock().unwrap();
        let delay = RETRY_SCHEDULE[(*attempt).min(RETRY_SCHEDULE.len() - 1)];
        *attempt += 1;
        delay
    }

    pub fn reset_retry_schedule(&self) {
        *self.retry_attempt.lock().unwrap() = 0;
    }

    async fn signed_post(&self, params: &BTreeMap<String, String>) -> Result<String> {
        let mut signed = params.clone();
        let signature = sign_call(&signed, &self.shared_secret);
        signed.insert("api_sig".to_string(), signature);
        signed.insert("format".to_string(), "xml".to_string());

        let client = self.http.lock().unwrap().clone();
        let response = client.post(API_BASE_URL).form(&signed).send().await?;
        Ok(response.text().await?)
    }
}

/// Concatenate sorted `key||value` pairs (no separators, `BTreeMap` already
/// gives sorted iteration order) and the shared secret, MD5 hex digest.
fn sign_call(params: &BTreeMap<String, String>, shared_secret: &str) -> String {
    let mut buf = String::new();
    for (k, v) in params {
        if k == "format" {
            continue; // format is excluded from the signature base string
        }
        buf.push_str(k);
        buf.push_str(v);
    }
    buf.push_str(shared_secret);

    let mut hasher = Md5::new();
    hasher.update(buf.as_bytes());
    hex::encode(hasher.finalize())
}

enum LfmReply {
    Ok { session_key: String, session_name: String },
    Error { code: u32, message: String },
}

/// Minimal `<lfm status="ok|failed">` reply parser. `auth.getMobileSession`
/// nests `<session><key>/<name></session>`; other successful calls have no
/// session payload, so `session_key`/`session_name` are empty strings for
/// those and callers that only care about success/failure ignore them.
fn parse_lfm_reply(xml: &str) -> Result<LfmReply> {
    use quick_xml::Reader;
    use quick_xml::events::Event;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut status_failed = false;
    let mut error_code = 0u32;
    let mut error_message = String::new();
    let mut session_key = String::new();
    let mut session_name = String::new();
    let mut current_tag = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if current_tag == "lfm" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"status" {
                            status_failed = attr.value.as_ref() == b"failed";
                        }
                    }
                } else if current_tag == "error" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"code" {
                            error_code = String::from_utf8_lossy(&attr.value).parse().unwrap_or(0);
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().to_string();
                match current_tag.as_str() {
                    "error" => error_message = text,
                    "key" => session_key = text,
                    "name" => session_name = text,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => bail!("malformed lastfm xml reply: {e}"),
        }
        buf.clear();
    }

    if status_failed {
        Ok(LfmReply::Error { code: error_code, message: error_message })
    } else {
        Ok(LfmReply::Ok { session_key, session_name })
    }
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut s = String::new();
        for b in bytes.as_ref() {
            let _ = write!(s, "{b:02x}");
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_call_is_order_independent_of_insertion() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());
        let sig = sign_call(&a, "secret");
        assert_eq!(sig.len(), 32); // md5 hex digest
    }

    #[test]
    fn error_code_9_clears_session_and_waits_for_credentials() {
        let backend = LastFmScrobblingBackend::new("key".into(), "secret".into());
        backend.initialize(Some("sk".into()), Some("alice".into()));
        assert_eq!(backend.state(), ScrobblingState::ReadyForScrobbling);

        backend.apply_error_code(9);
        assert_eq!(backend.state(), ScrobblingState::WaitingForUserCredentials);
        assert!(backend.session_key.lock().unwrap().is_none());
    }

    #[test]
    fn error_code_10_and_26_are_permanent() {
        let backend = LastFmScrobblingBackend::new("key".into(), "secret".into());
        backend.initialize(Some("sk".into()), None);
        backend.apply_error_code(10);
        assert_eq!(backend.state(), ScrobblingState::PermanentFatalError);

        let backend2 = LastFmScrobblingBackend::new("key".into(), "secret".into());
        backend2.initialize(Some("sk".into()), None);
        backend2.apply_error_code(26);
        assert_eq!(backend2.state(), ScrobblingState::PermanentFatalError);
    }

    #[test]
    fn transient_codes_go_temporarily_unavailable() {
        let backend = LastFmScrobblingBackend::new("key".into(), "secret".into());
        backend.initialize(Some("sk".into()), None);
        backend.apply_error_code(16);
        assert_eq!(backend.state(), ScrobblingState::TemporarilyUnavailable);
    }

    #[test]
    fn parse_successful_auth_reply() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
        <lfm status="ok">
            <session>
                <name>alice</name>
                <key>abcd1234</key>
                <subscriber>0</subscriber>
            </session>
        </lfm>"#;
        match parse_lfm_reply(xml).unwrap() {
            LfmReply::Ok { session_key, session_name } => {
                assert_eq!(session_key, "abcd1234");
                assert_eq!(session_name, "alice");
            }
            LfmReply::Error { .. } => panic!("expected Ok reply"),
        }
    }

    #[test]
    fn parse_failed_reply_extracts_code() {
        let xml = r#"<lfm status="failed"><error code="9">Invalid session key</error></lfm>"#;
        match parse_lfm_reply(xml).unwrap() {
            LfmReply::Error { code, message } => {
                assert_eq!(code, 9);
                assert_eq!(message, "Invalid session key");
            }
            LfmReply::Ok { .. } => panic!("expected Error reply"),
        }
    }

    #[test]
    fn retry_schedule_escalates_then_caps() {
        let backend = LastFmScrobblingBackend::new("key".into(), "secret".into());
        let first = backend.next_retry_delay();
        let second = backend.next_retry_delay();
        assert!(second > first);
        for _ in 0..10 {
            backend.next_retry_delay();
        }
        assert_eq!(backend.next_retry_delay(), *RETRY_SCHEDULE.last().unwrap());
    }
}
