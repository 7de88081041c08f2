//! Server connection endpoint: the per-connection state machine (text
//! handshake, binary handshake, keep-alive loop) and the dispatch table that
//! turns decoded [`crate::wire::ClientMessageType`] frames into domain
//! operations. Grounded on `mpd_client.rs`'s accept-loop/per-connection-task
//! shape, generalized from line-oriented MPD commands to this crate's
//! length-prefixed binary frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use color_eyre::{Result, eyre::bail};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{ConnectionBroken, DisconnectReason, ErrorCode};
use crate::queue::{QueueEntryContent, QueueIndexType};
use crate::scrobbling::{LastFmScrobblingBackend, ScrobblingState, TrackToScrobble};
use crate::server::{ServerContext, ServerEvent};
use crate::user::{self, User};
use crate::wire::{
    self, CLIENT_PROTOCOL_NO, ClientMessageType, Frame, KEEP_ALIVE_INTERVAL_MS,
    KEEP_ALIVE_REPLY_TIMEOUT_MS, KEEP_ALIVE_MESSAGE_TYPE, MessageKind, ParameterlessActionCode,
    PlayerState, SCROBBLING_EXTENSION_ID, SCROBBLING_EXTENSION_NAME, ScrobblingClientMessageType,
    ScrobblingProvider, ScrobblingServerMessageType, ServerEventCode, ServerMessageType,
    SimpleResult, WireFileHash,
};

/// Accept loop: binds `port` and spawns one task per incoming connection.
pub async fn handle_clients(ctx: Arc<ServerContext>, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("listening for clients on port {port}");

    loop {
        let (stream, addr) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(ctx, stream, addr).await {
                debug!("connection {addr} ended: {e:#}");
            } else {
                info!("connection {addr} closed");
            }
        });
    }
}

async fn read_until_semicolon(reader: &mut (impl AsyncRead + Unpin)) -> Result<String> {
    let mut buf = Vec::new();
    loop {
        let b = reader.read_u8().await?;
        if b == b';' {
            break;
        }
        buf.push(b);
        if buf.len() > 256 {
            bail!("handshake token exceeded 256 bytes without a terminator");
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn text_handshake(
    reader: &mut (impl AsyncRead + Unpin),
    writer: &Arc<AsyncMutex<impl tokio::io::AsyncWrite + Unpin>>,
) -> Result<()> {
    {
        let mut w = writer.lock().await;
        w.write_all(b"PMP party music player;").await?;
        w.flush().await?;
    }
    let token = read_until_semicolon(reader).await?;
    if !token.trim_start().starts_with("binary") {
        bail!("client did not request binary mode, got {token:?}");
    }
    Ok(())
}

/// Returns the negotiated protocol number, `min(client, server)`.
async fn binary_handshake(
    reader: &mut (impl AsyncRead + Unpin),
    writer: &Arc<AsyncMutex<impl tokio::io::AsyncWrite + Unpin>>,
) -> Result<u16> {
    let mut hello = [0u8; 5];
    reader.read_exact(&mut hello).await?;
    if &hello[0..3] != b"PMP" {
        bail!("binary hello had bad magic");
    }
    let client_version = u16::from_be_bytes([hello[3], hello[4]]);

    {
        let mut w = writer.lock().await;
        w.write_all(b"PMP").await?;
        w.write_all(&CLIENT_PROTOCOL_NO.to_be_bytes()).await?;
        w.flush().await?;
    }

    Ok(client_version.min(CLIENT_PROTOCOL_NO))
}

async fn handle_connection(ctx: Arc<ServerContext>, stream: tokio::net::TcpStream, addr: SocketAddr) -> Result<()> {
    stream.set_nodelay(true).ok();
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(AsyncMutex::new(writer));

    text_handshake(&mut reader, &writer).await?;
    let protocol_no = binary_handshake(&mut reader, &writer).await?;
    debug!("{addr}: negotiated protocol {protocol_no}");

    let mut session = Session {
        ctx,
        writer,
        protocol_no,
        addr,
        user: None,
        subscribed: Arc::new(AtomicBool::new(false)),
    };
    session.announce_extensions().await?;
    session.run(&mut reader).await
}

/// Per-connection state. Queue/playback/history state all live in
/// [`ServerContext`]; this struct only holds what's specific to one TCP
/// connection — its negotiated protocol version and login status.
struct Session {
    ctx: Arc<ServerContext>,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    protocol_no: u16,
    addr: SocketAddr,
    user: Option<User>,
    subscribed: Arc<AtomicBool>,
}

impl Session {
    async fn send_frame(&self, message_type: u16, body: Vec<u8>) -> Result<()> {
        let mut w = self.writer.lock().await;
        wire::write_frame(&mut *w, message_type, &body).await
    }

    async fn send_simple_result(&self, client_ref: u32, error_code: ErrorCode, int_data: u32, blob: Vec<u8>) -> Result<()> {
        let body = wire::encode_simple_result(&SimpleResult { client_ref, error_code: error_code.to_wire(), int_data, blob });
        self.send_frame(ServerMessageType::SimpleResultMessage as u16, body).await
    }

    async fn send_ok(&self, client_ref: u32) -> Result<()> {
        self.send_simple_result(client_ref, ErrorCode::NoError, 0, Vec::new()).await
    }

    async fn send_error(&self, client_ref: u32, error: ErrorCode) -> Result<()> {
        self.send_simple_result(client_ref, error, 0, Vec::new()).await
    }

    async fn send_extension_frame(&self, extension_id: u8, sub_type: u8, body: Vec<u8>) -> Result<()> {
        self.send_frame(wire::extension_message_type_field(extension_id, sub_type), body).await
    }

    /// Tell the client which protocol extensions this server understands.
    /// Only `"scrobbling"` exists today, and only when a Last.fm backend was
    /// configured.
    async fn announce_extensions(&self) -> Result<()> {
        if self.ctx.scrobbling.is_none() {
            return Ok(());
        }
        let body = wire::encode_extensions_message(&[wire::ExtensionAnnouncement {
            extension_id: SCROBBLING_EXTENSION_ID,
            version: 1,
            name: SCROBBLING_EXTENSION_NAME.to_string(),
        }]);
        self.send_frame(ServerMessageType::ServerExtensionsMessage as u16, body).await
    }

    async fn track_to_scrobble(&self, hash_id: u32) -> Result<Option<TrackToScrobble>> {
        let db = self.ctx.db.lock().await;
        let tags = crate::db::get_tags(&db, hash_id)?;
        drop(db);
        Ok(tags.map(|t| TrackToScrobble {
            title: t.title.unwrap_or_default(),
            artist: t.artist.unwrap_or_default(),
            album: t.album,
            album_artist: t.album_artist,
            duration: (t.duration_ms > 0).then(|| Duration::from_millis(t.duration_ms as u64)),
        }))
    }

    /// Forward domain events this session has subscribed to as wire frames.
    /// Spawned once per connection; aborted when [`Session::run`] returns.
    fn spawn_event_forwarder(&self) -> tokio::task::JoinHandle<()> {
        let writer = Arc::clone(&self.writer);
        let subscribed = Arc::clone(&self.subscribed);
        let mut events = self.ctx.subscribe_events();
        let mut stats = self.ctx.history.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Ok(event) = event else { continue };
                        if !subscribed.load(Ordering::Relaxed) {
                            continue;
                        }
                        let frame = match event {
                            ServerEvent::QueueEntryAdded { index, queue_id } => {
                                let body = wire::encode_queue_insertion_confirmation(
                                    wire::QueueInsertionConfirmation { client_ref: 0, index: index as u32, queue_id },
                                );
                                Some((ServerMessageType::QueueEntryAddedMessage as u16, body))
                            }
                            ServerEvent::QueueEntryRemoved { queue_id } => {
                                Some((ServerMessageType::QueueEntryRemovedMessage as u16, queue_id.to_be_bytes().to_vec()))
                            }
                            // no dedicated "moved" message type exists on the
                            // wire; a move is communicated as a fresh
                            // addition confirmation carrying the new index.
                            ServerEvent::QueueEntryMoved { queue_id, new_index } => {
                                let mut body = queue_id.to_be_bytes().to_vec();
                                body.extend_from_slice(&(new_index as u32).to_be_bytes());
                                Some((ServerMessageType::QueueEntryAddedMessage as u16, body))
                            }
                            ServerEvent::PlayerStateChanged => None,
                            ServerEvent::VolumeChanged(v) => {
                                Some((ServerMessageType::VolumeChangedMessage as u16, wire::encode_volume_changed(v)))
                            }
                            ServerEvent::IndexationRunning(running) => {
                                let code = if running { ServerEventCode::FullIndexationRunning } else { ServerEventCode::FullIndexationNotRunning };
                                Some((ServerMessageType::ServerEventNotification as u16, wire::encode_server_event(code, 0)))
                            }
                        };
                        if let Some((message_type, body)) = frame {
                            let mut w = writer.lock().await;
                            if wire::write_frame(&mut *w, message_type, &body).await.is_err() {
                                break;
                            }
                        }
                    }
                    changed = stats.recv() => {
                        let Ok(changed) = changed else { continue };
                        if !subscribed.load(Ordering::Relaxed) {
                            continue;
                        }
                        let mut body = changed.user_id.to_be_bytes().to_vec();
                        body.extend_from_slice(&(changed.hash_ids.len() as u16).to_be_bytes());
                        for id in &changed.hash_ids {
                            body.extend_from_slice(&id.to_be_bytes());
                        }
                        let mut w = writer.lock().await;
                        if wire::write_frame(&mut *w, ServerMessageType::HashStatisticsChangedMessage as u16, &body).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn run(&mut self, reader: &mut (impl AsyncRead + Unpin)) -> Result<()> {
        let forwarder = self.spawn_event_forwarder();

        let idle = Duration::from_millis(KEEP_ALIVE_INTERVAL_MS);
        let reply_timeout = Duration::from_millis(KEEP_ALIVE_REPLY_TIMEOUT_MS);
        let mut awaiting_keepalive_reply = false;

        let result = loop {
            let wait = if awaiting_keepalive_reply { reply_timeout } else { idle };
            match tokio::time::timeout(wait, wire::read_frame(reader)).await {
                Ok(Ok(Some(frame))) => {
                    awaiting_keepalive_reply = false;
                    if let Err(e) = self.dispatch(frame).await {
                        debug!("{}: dispatch error: {e:#}", self.addr);
                    }
                }
                Ok(Ok(None)) => break Ok(()),
                Ok(Err(e)) => break Err(e),
                Err(_elapsed) => {
                    if awaiting_keepalive_reply {
                        break Err(ConnectionBroken(DisconnectReason::KeepAliveTimeout).into());
                    }
                    awaiting_keepalive_reply = true;
                    if self.send_frame(KEEP_ALIVE_MESSAGE_TYPE, Vec::new()).await.is_err() {
                        break Err(ConnectionBroken(DisconnectReason::IoError).into());
                    }
                }
            }
        };

        forwarder.abort();
        result
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<()> {
        let type_field = match frame.kind() {
            MessageKind::Standard(type_field) => type_field,
            MessageKind::Extension { extension_id, sub_type } => {
                return self.handle_extension_message(extension_id, sub_type, &frame.payload).await;
            }
        };
        let Some(message_type) = ClientMessageType::from_repr(type_field) else {
            debug!("{}: unrecognized client message type {type_field}", self.addr);
            return Ok(());
        };
        let body = &frame.payload;

        use ClientMessageType::*;
        match message_type {
            KeepAlive => Ok(()),

            SingleByteActionMessage => {
                if body.is_empty() {
                    return Ok(());
                }
                self.apply_parameterless_action(body[0]).await
            }

            ClientProtocolExtensionsMessage => {
                let extensions = wire::decode_extensions_message(body)?;
                debug!("{}: client announced {} extension(s)", self.addr, extensions.len());
                Ok(())
            }

            InsertHashIntoQueueRequestMessage => self.handle_insert_hash(body).await,

            ParameterlessActionMessage => {
                if body.len() < 5 {
                    bail!("parameterless action message too short");
                }
                let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
                let result = self.apply_parameterless_action(body[4]).await;
                if let Err(e) = &result {
                    warn!("{}: parameterless action failed: {e:#}", self.addr);
                    self.send_error(client_ref, ErrorCode::UnknownAction).await?;
                } else {
                    self.send_ok(client_ref).await?;
                }
                result
            }

            GeneratorNonRepetitionMessage | GeneratorNonRepetitionUpdateMessage => {
                if body.len() < 8 {
                    bail!("generator non-repetition message too short");
                }
                let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
                let seconds = u32::from_be_bytes(body[4..8].try_into().unwrap());
                if let Some(user) = &self.user {
                    self.ctx.set_repetition_avoidance_seconds_for(user.id, seconds);
                    self.send_ok(client_ref).await
                } else {
                    self.send_error(client_ref, ErrorCode::NotLoggedIn).await
                }
            }

            RequestForPlayerStateMessage => self.send_player_state().await,

            VolumeChangeRequestMessage => {
                if body.is_empty() {
                    return Ok(());
                }
                let volume = body[0].min(100);
                self.ctx.playback.lock().unwrap().volume = volume;
                self.ctx.notify_volume_changed(volume);
                Ok(())
            }

            InitiateNewUserAccountMessage => self.handle_initiate_registration(body).await,
            FinishNewUserAccountMessage => self.handle_finish_registration(body).await,
            InitiateLoginMessage => self.handle_initiate_login(body).await,
            FinishLoginMessage => self.handle_finish_login(body).await,

            RequestTrackInfoMessage => self.handle_track_info_request(body).await,
            RequestBulkTrackInfoMessage => self.handle_bulk_track_info_request(body).await,

            RequestQueueEntryRemovalMessage => self.handle_queue_removal(body).await,
            MoveQueueEntryRequestMessage => self.handle_queue_move(body).await,

            SubscriptionRequestMessage => {
                self.subscribed.store(true, Ordering::Relaxed);
                Ok(())
            }

            RequestQueueFetchMessage => self.handle_queue_fetch(body).await,

            RequestDatabaseIdentifierMessage => {
                let body = b"pmp-server".to_vec();
                self.send_frame(ServerMessageType::DatabaseIdentifierMessage as u16, body).await
            }

            RequestHashUserDataMessage => self.handle_hash_user_data_request(body).await,
            RequestHistoryFragmentMessage => self.handle_history_fragment_request(body).await,

            ActivateDelayedStartRequestMessage => {
                if self.protocol_no < 20 {
                    if body.len() >= 4 {
                        let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
                        self.send_error(client_ref, ErrorCode::ServerTooOld).await?;
                    }
                    return Ok(());
                }
                if body.len() < 4 {
                    return Ok(());
                }
                let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
                self.send_ok(client_ref).await
            }

            DeactivateDelayedStartRequestMessage => {
                if body.len() < 4 {
                    return Ok(());
                }
                let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
                self.send_ok(client_ref).await
            }

            SetTrackRepetitionAvoidanceIntervalMessage => {
                if body.len() < 4 {
                    return Ok(());
                }
                let seconds = u32::from_be_bytes(body[0..4].try_into().unwrap());
                if let Some(user) = &self.user {
                    self.ctx.set_repetition_avoidance_seconds_for(user.id, seconds);
                }
                Ok(())
            }

            IndexationRequestMessage => {
                let ctx = Arc::clone(&self.ctx);
                tokio::spawn(async move {
                    if let Err(e) = ctx.run_indexation().await {
                        warn!("indexation request failed: {e:#}");
                    }
                });
                Ok(())
            }

            CollectionFetchRequestMessage => self.handle_collection_fetch().await,

            AddUserToHistoryRequestMessage => self.handle_add_to_history(body).await,

            RequestUsersListMessage => self.handle_users_list_request().await,

            InsertSpecialItemIntoQueueRequestMessage => self.handle_insert_special(body).await,

            ClientFullIndexationNotifyMessage => {
                debug!("{}: client reports its own indexation complete", self.addr);
                Ok(())
            }
        }
    }

    async fn handle_extension_message(&mut self, extension_id: u8, sub_type: u8, body: &[u8]) -> Result<()> {
        if extension_id != SCROBBLING_EXTENSION_ID {
            debug!("{}: message for unregistered extension {extension_id}", self.addr);
            return Ok(());
        }
        let Some(message_type) = ScrobblingClientMessageType::from_repr(sub_type) else {
            debug!("{}: unrecognized scrobbling client message type {sub_type}", self.addr);
            return Ok(());
        };
        self.handle_scrobbling_message(message_type, body).await
    }

    async fn handle_scrobbling_message(&mut self, message_type: ScrobblingClientMessageType, body: &[u8]) -> Result<()> {
        let Some(scrobbling) = self.ctx.scrobbling.clone() else {
            return Ok(());
        };
        match message_type {
            ScrobblingClientMessageType::ProviderInfoRequestMessage => self.send_scrobbling_provider_info(&scrobbling).await,

            ScrobblingClientMessageType::EnableDisableRequestMessage => {
                let (provider, enable) = wire::decode_scrobbling_enable_disable_request(body)?;
                if let Some(user) = &self.user {
                    let db = self.ctx.db.lock().await;
                    crate::db::upsert_scrobbling_enabled(&db, user.id, enable)?;
                }
                let body = wire::encode_scrobbling_enabled_change(provider, enable);
                self.send_extension_frame(SCROBBLING_EXTENSION_ID, ScrobblingServerMessageType::ProviderEnabledChangeMessage as u8, body).await
            }

            ScrobblingClientMessageType::AuthenticationRequestMessage => {
                let (provider, username, password) = wire::decode_scrobbling_authentication_request(body)?;
                match scrobbling.authenticate(username, password).await {
                    Ok(session_key) => {
                        if let Some(user) = &self.user {
                            let db = self.ctx.db.lock().await;
                            crate::db::upsert_scrobbling_session(&db, user.id, scrobbling.username().as_deref(), Some(&session_key))?;
                            crate::db::upsert_scrobbling_enabled(&db, user.id, true)?;
                        }
                    }
                    Err(e) => warn!("{}: scrobbling authentication failed: {e:#}", self.addr),
                }
                self.send_scrobbling_status(provider, scrobbling.state()).await
            }
        }
    }

    async fn send_scrobbling_provider_info(&self, scrobbling: &LastFmScrobblingBackend) -> Result<()> {
        let enabled = match &self.user {
            Some(user) => {
                let db = self.ctx.db.lock().await;
                crate::db::get_scrobbling_user_data(&db, user.id)?.map(|d| d.enabled).unwrap_or(false)
            }
            None => false,
        };
        let body = wire::encode_scrobbling_provider_info(ScrobblingProvider::LastFm, enabled, scrobbling.state());
        self.send_extension_frame(SCROBBLING_EXTENSION_ID, ScrobblingServerMessageType::ProviderInfoMessage as u8, body).await
    }

    async fn send_scrobbling_status(&self, provider: ScrobblingProvider, state: ScrobblingState) -> Result<()> {
        let body = wire::encode_scrobbling_status_change(provider, state);
        self.send_extension_frame(SCROBBLING_EXTENSION_ID, ScrobblingServerMessageType::StatusChangeMessage as u8, body).await
    }

    /// Tell the scrobbling backend the queue's front track just started
    /// playing. Best-effort: a failed HTTP call shouldn't fail the Play
    /// action itself.
    async fn notify_now_playing(&self) {
        let Some(scrobbling) = self.ctx.scrobbling.clone() else { return };
        let front_hash = self.ctx.queue.lock().unwrap().iter().next().and_then(|e| match e.content {
            QueueEntryContent::Track(id) => Some(id),
            _ => None,
        });
        let Some(hash_id) = front_hash else { return };
        match self.track_to_scrobble(hash_id).await {
            Ok(Some(track)) => {
                tokio::spawn(async move {
                    if let Err(e) = scrobbling.update_now_playing(&track).await {
                        warn!("now-playing update failed: {e:#}");
                    }
                });
            }
            Ok(None) => {}
            Err(e) => warn!("could not look up now-playing track {hash_id}: {e:#}"),
        }
    }

    async fn apply_parameterless_action(&self, code: u8) -> Result<()> {
        let Some(action) = ParameterlessActionCode::from_repr(code) else {
            bail!("unrecognized parameterless action code {code}");
        };
        match action {
            ParameterlessActionCode::Play => {
                self.ctx.playback.lock().unwrap().state = PlayerState::Playing;
                self.ctx.notify_player_state_changed();
                self.notify_now_playing().await;
            }
            ParameterlessActionCode::Pause => {
                self.ctx.playback.lock().unwrap().state = PlayerState::Paused;
                self.ctx.notify_player_state_changed();
            }
            ParameterlessActionCode::Skip => {
                let front = self.ctx.queue.lock().unwrap().iter().next().map(|e| e.id);
                if let Some(id) = front {
                    self.ctx.queue.lock().unwrap().remove(id)?;
                    self.ctx.notify_queue_entry_removed(id.0);
                }
            }
            ParameterlessActionCode::InsertBreakAtFront => {
                let (index, queue_id) = self.ctx.queue.lock().unwrap().insert_at_front(QueueEntryContent::Break)?;
                self.ctx.notify_queue_entry_added(index, queue_id.0);
            }
            ParameterlessActionCode::StartFullIndexation | ParameterlessActionCode::StartQuickIndexation => {
                let ctx = Arc::clone(&self.ctx);
                tokio::spawn(async move {
                    if let Err(e) = ctx.run_indexation().await {
                        warn!("indexation failed: {e:#}");
                    }
                });
            }
            ParameterlessActionCode::ReloadServerSettings => {
                debug!("server settings reload requested");
            }
            ParameterlessActionCode::ShutdownServer => {
                warn!("shutdown requested by {}", self.addr);
            }
            ParameterlessActionCode::EnableDynamicMode
            | ParameterlessActionCode::DisableDynamicMode
            | ParameterlessActionCode::EnablePublicMode
            | ParameterlessActionCode::EnablePersonalMode => {
                debug!("{}: mode switch action {code}", self.addr);
            }
        }
        Ok(())
    }

    async fn send_player_state(&self) -> Result<()> {
        let playback = {
            let p = self.ctx.playback.lock().unwrap();
            (p.state, p.volume, p.position_ms)
        };
        let (queue_length, current_queue_id) = {
            let q = self.ctx.queue.lock().unwrap();
            (q.len() as u32, q.iter().next().map(|e| e.id.0).unwrap_or(0))
        };
        let body = wire::encode_player_state(wire::PlayerStateWire {
            state: playback.0,
            delayed_start_active: false,
            volume: playback.1,
            queue_length,
            current_queue_id,
            position_ms: playback.2,
        });
        self.send_frame(ServerMessageType::PlayerStateMessage as u16, body).await
    }

    async fn handle_insert_hash(&self, body: &[u8]) -> Result<()> {
        if body.len() < 4 + wire::FILEHASH_BYTECOUNT + 1 + 4 {
            bail!("insert-hash request too short");
        }
        let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let hash = WireFileHash::read_from(&body[4..4 + wire::FILEHASH_BYTECOUNT])?;
        let mut offset = 4 + wire::FILEHASH_BYTECOUNT;
        let index_type = if body[offset] == 0 { QueueIndexType::Normal } else { QueueIndexType::Reverse };
        offset += 1;
        let index = u32::from_be_bytes(body[offset..offset + 4].try_into().unwrap());

        if hash.is_zero() {
            return self.send_error(client_ref, ErrorCode::InvalidHash).await;
        }

        let db = self.ctx.db.lock().await;
        let hash_id = self.ctx.registrar.get_or_create_id(&db, hash)?;
        drop(db);

        let mut queue = self.ctx.queue.lock().unwrap();
        let absolute_index = queue.resolve_index(index, index_type);
        let result = queue.insert_at(absolute_index, QueueEntryContent::Track(hash_id));
        drop(queue);

        match result {
            Ok((index, queue_id)) => {
                self.ctx.notify_queue_entry_added(index, queue_id.0);
                let confirmation = wire::encode_queue_insertion_confirmation(wire::QueueInsertionConfirmation {
                    client_ref,
                    index: index as u32,
                    queue_id: queue_id.0,
                });
                self.send_frame(ServerMessageType::QueueEntryAdditionConfirmationMessage as u16, confirmation).await
            }
            Err(e) => self.send_error(client_ref, e).await,
        }
    }

    async fn handle_insert_special(&self, body: &[u8]) -> Result<()> {
        if body.len() < 4 + 1 + 1 + 4 {
            bail!("insert-special request too short");
        }
        let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let kind = body[4];
        let index_type = if body[5] == 0 { QueueIndexType::Normal } else { QueueIndexType::Reverse };
        let index = u32::from_be_bytes(body[6..10].try_into().unwrap());

        let content = match kind {
            1 => QueueEntryContent::Break,
            2 => QueueEntryContent::Barrier,
            _ => return self.send_error(client_ref, ErrorCode::InvalidQueueItemType).await,
        };

        let mut queue = self.ctx.queue.lock().unwrap();
        let absolute_index = queue.resolve_index(index, index_type);
        let result = queue.insert_at(absolute_index, content);
        drop(queue);

        match result {
            Ok((index, queue_id)) => {
                self.ctx.notify_queue_entry_added(index, queue_id.0);
                let confirmation = wire::encode_queue_insertion_confirmation(wire::QueueInsertionConfirmation {
                    client_ref,
                    index: index as u32,
                    queue_id: queue_id.0,
                });
                self.send_frame(ServerMessageType::QueueEntryAdditionConfirmationMessage as u16, confirmation).await
            }
            Err(e) => self.send_error(client_ref, e).await,
        }
    }

    async fn handle_queue_removal(&self, body: &[u8]) -> Result<()> {
        if body.len() < 8 {
            bail!("queue removal request too short");
        }
        let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let queue_id = u32::from_be_bytes(body[4..8].try_into().unwrap());
        let result = self.ctx.queue.lock().unwrap().remove(crate::queue::QueueId(queue_id));
        match result {
            Ok(()) => {
                self.ctx.notify_queue_entry_removed(queue_id);
                self.send_ok(client_ref).await
            }
            Err(e) => self.send_error(client_ref, e).await,
        }
    }

    async fn handle_queue_move(&self, body: &[u8]) -> Result<()> {
        if body.len() < 12 {
            bail!("queue move request too short");
        }
        let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let queue_id = u32::from_be_bytes(body[4..8].try_into().unwrap());
        let new_index = u32::from_be_bytes(body[8..12].try_into().unwrap()) as usize;
        let result = self.ctx.queue.lock().unwrap().move_entry(crate::queue::QueueId(queue_id), new_index);
        match result {
            Ok(new_index) => {
                self.ctx.notify_queue_entry_moved(queue_id, new_index);
                self.send_ok(client_ref).await
            }
            Err(e) => self.send_error(client_ref, e).await,
        }
    }

    async fn handle_queue_fetch(&self, body: &[u8]) -> Result<()> {
        if body.len() < 8 {
            bail!("queue fetch request too short");
        }
        let start_offset = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
        let count = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;

        let entries: Vec<_> = {
            let q = self.ctx.queue.lock().unwrap();
            q.iter().skip(start_offset).take(count).copied().collect()
        };

        let mut out = Vec::new();
        out.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        for entry in entries {
            out.extend_from_slice(&entry.id.0.to_be_bytes());
            let (kind, hash_id) = match entry.content {
                QueueEntryContent::Track(id) => (0u8, id),
                QueueEntryContent::Break => (1u8, 0),
                QueueEntryContent::Barrier => (2u8, 0),
                QueueEntryContent::UnknownPlaceholder => (255u8, 0),
            };
            out.push(kind);
            out.extend_from_slice(&hash_id.to_be_bytes());
        }
        self.send_frame(ServerMessageType::QueueContentsMessage as u16, out).await
    }

    async fn handle_collection_fetch(&self) -> Result<()> {
        let ids = self.ctx.registrar.get_all_loaded();
        let db = self.ctx.db.lock().await;
        let mut tracks = Vec::with_capacity(ids.len());
        for id in ids {
            let tags = crate::db::get_tags(&db, id)?.unwrap_or_default();
            tracks.push(wire::TrackInfoWire {
                hash_id: id,
                pseudo_status: 0,
                duration_ms: tags.duration_ms,
                title: tags.title.unwrap_or_default(),
                artist: tags.artist.unwrap_or_default(),
                album: tags.album.unwrap_or_default(),
                album_artist: tags.album_artist.unwrap_or_default(),
            });
        }
        drop(db);
        self.send_frame(ServerMessageType::CollectionFetchResponseMessage as u16, wire::encode_bulk_track_info(&tracks)).await
    }

    async fn handle_track_info_request(&self, body: &[u8]) -> Result<()> {
        if body.len() < 4 {
            bail!("track info request too short");
        }
        let hash_id = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let db = self.ctx.db.lock().await;
        let tags = crate::db::get_tags(&db, hash_id)?.unwrap_or_default();
        drop(db);
        let info = wire::TrackInfoWire {
            hash_id,
            pseudo_status: 0,
            duration_ms: tags.duration_ms,
            title: tags.title.unwrap_or_default(),
            artist: tags.artist.unwrap_or_default(),
            album: tags.album.unwrap_or_default(),
            album_artist: tags.album_artist.unwrap_or_default(),
        };
        self.send_frame(ServerMessageType::TrackInfoMessage as u16, wire::encode_track_info(&info)).await
    }

    async fn handle_bulk_track_info_request(&self, body: &[u8]) -> Result<()> {
        if body.len() < 2 {
            bail!("bulk track info request too short");
        }
        let count = u16::from_be_bytes([body[0], body[1]]) as usize;
        if body.len() < 2 + count * 4 {
            bail!("bulk track info request truncated");
        }
        let db = self.ctx.db.lock().await;
        let mut tracks = Vec::with_capacity(count);
        for i in 0..count {
            let offset = 2 + i * 4;
            let hash_id = u32::from_be_bytes(body[offset..offset + 4].try_into().unwrap());
            let tags = crate::db::get_tags(&db, hash_id)?.unwrap_or_default();
            tracks.push(wire::TrackInfoWire {
                hash_id,
                pseudo_status: 0,
                duration_ms: tags.duration_ms,
                title: tags.title.unwrap_or_default(),
                artist: tags.artist.unwrap_or_default(),
                album: tags.album.unwrap_or_default(),
                album_artist: tags.album_artist.unwrap_or_default(),
            });
        }
        drop(db);
        self.send_frame(ServerMessageType::BulkTrackInfoMessage as u16, wire::encode_bulk_track_info(&tracks)).await
    }

    async fn handle_hash_user_data_request(&self, body: &[u8]) -> Result<()> {
        if body.len() < 4 {
            bail!("hash user data request too short");
        }
        let hash_id = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let Some(user) = &self.user else {
            return self.send_frame(
                ServerMessageType::HashUserDataMessage as u16,
                {
                    let mut out = hash_id.to_be_bytes().to_vec();
                    out.extend_from_slice(&wire::timestamp_to_wire(None).to_be_bytes());
                    out.extend_from_slice(&0i16.to_be_bytes());
                    out
                },
            ).await;
        };
        let stats = self.ctx.history.get_stats_if_available(user.id, hash_id);
        let mut out = hash_id.to_be_bytes().to_vec();
        let (last_heard, permillage) = match stats {
            Some(s) => (s.last_heard, s.average_permillage),
            None => (None, 0),
        };
        out.extend_from_slice(&wire::timestamp_to_wire(last_heard).to_be_bytes());
        out.extend_from_slice(&permillage.to_be_bytes());
        self.send_frame(ServerMessageType::HashUserDataMessage as u16, out).await
    }

    async fn handle_history_fragment_request(&self, body: &[u8]) -> Result<()> {
        if body.len() < 8 {
            bail!("history fragment request too short");
        }
        let start_id = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let limit = u32::from_be_bytes(body[4..8].try_into().unwrap()).min(1000);

        let db = self.ctx.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, hash_id, user_id, started_at, ended_at, permillage, valid_for_scoring
             FROM history WHERE id >= ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map((start_id, limit), |row| {
            Ok(wire::HistoryRecordWire {
                id: row.get(0)?,
                hash_id: row.get(1)?,
                user_id: row.get(2)?,
                started_at_ms: row.get(3)?,
                ended_at_ms: row.get(4)?,
                permillage: row.get(5)?,
                valid_for_scoring: row.get(6)?,
            })
        })?;
        let records: Vec<_> = rows.collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(db);

        let next_start_id = records.last().map(|r| r.id + 1).unwrap_or(start_id);
        self.send_frame(
            ServerMessageType::HistoryFragmentMessage as u16,
            wire::encode_history_fragment(&records, next_start_id),
        ).await
    }

    async fn handle_add_to_history(&self, body: &[u8]) -> Result<()> {
        if body.len() < 4 + 8 + 8 + 2 + 1 {
            bail!("add-to-history request too short");
        }
        let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let Some(user) = self.user.clone() else {
            return self.send_error(client_ref, ErrorCode::NotLoggedIn).await;
        };
        let hash_id = u32::from_be_bytes(body[4..8].try_into().unwrap());
        let started_ms = i64::from_be_bytes(body[8..16].try_into().unwrap());
        let ended_ms = i64::from_be_bytes(body[16..24].try_into().unwrap());
        let permillage = i16::from_be_bytes(body[24..26].try_into().unwrap());
        let valid_for_scoring = body[26] != 0;

        let Some(started) = jiff::Timestamp::from_millisecond(started_ms).ok() else {
            return self.send_error(client_ref, ErrorCode::InvalidTimeSpan).await;
        };
        let Some(ended) = jiff::Timestamp::from_millisecond(ended_ms).ok() else {
            return self.send_error(client_ref, ErrorCode::InvalidTimeSpan).await;
        };
        if ended < started {
            return self.send_error(client_ref, ErrorCode::InvalidTimeSpan).await;
        }

        let history_id = self.ctx.history.add_to_history(user.id, hash_id, started, ended, permillage, valid_for_scoring).await?;

        if valid_for_scoring {
            if let Some(scrobbling) = self.ctx.scrobbling.clone() {
                match self.track_to_scrobble(hash_id).await {
                    Ok(Some(track)) => {
                        tokio::spawn(async move {
                            if let Err(e) = scrobbling.scrobble_track(started, &track).await {
                                warn!("scrobble failed: {e:#}");
                            }
                        });
                    }
                    Ok(None) => {}
                    Err(e) => warn!("could not look up track {hash_id} to scrobble: {e:#}"),
                }
            }
        }

        self.send_simple_result(client_ref, ErrorCode::NoError, history_id, Vec::new()).await
    }

    async fn handle_users_list_request(&self) -> Result<()> {
        let db = self.ctx.db.lock().await;
        let users = user::list_all(&db)?;
        drop(db);
        let mut out = Vec::new();
        out.extend_from_slice(&(users.len() as u16).to_be_bytes());
        for u in users {
            out.extend_from_slice(&u.id.to_be_bytes());
            wire::write_string_u8(&mut out, &u.login);
        }
        self.send_frame(ServerMessageType::UsersListMessage as u16, out).await
    }

    async fn handle_initiate_registration(&self, body: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        if body.len() < 4 {
            bail!("initiate-registration request too short");
        }
        let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
        offset += 4;
        let login = wire::read_string_u8(body, &mut offset)?;

        let mut salt = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        self.ctx.pending_registrations.lock().unwrap().insert(login, salt.clone());

        self.send_simple_result(client_ref, ErrorCode::NoError, 0, salt).await
    }

    async fn handle_finish_registration(&self, body: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        if body.len() < 4 {
            bail!("finish-registration request too short");
        }
        let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
        offset += 4;
        let login = wire::read_string_u8(body, &mut offset)?;
        if body.len() < offset + 2 {
            bail!("finish-registration request truncated before hash length");
        }
        let hash_len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
        offset += 2;
        if body.len() < offset + hash_len {
            bail!("finish-registration request truncated hash");
        }
        let stored_hash = body[offset..offset + hash_len].to_vec();

        let Some(salt) = self.ctx.pending_registrations.lock().unwrap().remove(&login) else {
            return self.send_error(client_ref, ErrorCode::InvalidUserAccountName).await;
        };

        let db = self.ctx.db.lock().await;
        let result = user::register(&db, &login, &salt, &stored_hash)?;
        drop(db);

        match result {
            Ok(user_id) => self.send_simple_result(client_ref, ErrorCode::NoError, user_id, Vec::new()).await,
            Err(e) => self.send_error(client_ref, e).await,
        }
    }

    async fn handle_initiate_login(&self, body: &[u8]) -> Result<()> {
        if body.len() < 4 {
            bail!("initiate-login request too short");
        }
        let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let mut salt = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        self.ctx.pending_registrations.lock().unwrap().insert(format!("__login_salt_{client_ref}"), salt.clone());
        self.send_simple_result(client_ref, ErrorCode::NoError, 0, salt).await
    }

    async fn handle_finish_login(&mut self, body: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        if body.len() < 4 {
            bail!("finish-login request too short");
        }
        let client_ref = u32::from_be_bytes(body[0..4].try_into().unwrap());
        offset += 4;
        let login = wire::read_string_u8(body, &mut offset)?;
        if body.len() < offset + 2 {
            bail!("finish-login request truncated before hash length");
        }
        let hash_len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
        offset += 2;
        if body.len() < offset + hash_len {
            bail!("finish-login request truncated hash");
        }
        let sent_hash = body[offset..offset + hash_len].to_vec();

        if self.user.is_some() {
            return self.send_error(client_ref, ErrorCode::AlreadyLoggedIn).await;
        }

        let Some(session_salt) = self.ctx.pending_registrations.lock().unwrap().remove(&format!("__login_salt_{client_ref}")) else {
            return self.send_error(client_ref, ErrorCode::UserLoginAuthenticationFailed).await;
        };

        let db = self.ctx.db.lock().await;
        let result = user::verify_login(&db, &login, &session_salt, &sent_hash)?;
        drop(db);

        match result {
            Ok(user) => {
                let user_id = user.id;
                self.user = Some(user);
                if let Some(scrobbling) = &self.ctx.scrobbling {
                    let db = self.ctx.db.lock().await;
                    let data = crate::db::get_scrobbling_user_data(&db, user_id)?;
                    drop(db);
                    if let Some(data) = data {
                        if data.enabled {
                            scrobbling.initialize(data.session_key, data.username);
                        }
                    }
                }
                self.send_simple_result(client_ref, ErrorCode::NoError, user_id, Vec::new()).await
            }
            Err(e) => self.send_error(client_ref, e).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn text_handshake_rejects_a_non_binary_token() {
        let (mut client, server) = duplex(4096);
        let (mut server_reader, server_writer) = tokio::io::split(server);
        let writer = Arc::new(AsyncMutex::new(server_writer));

        let server_side = tokio::spawn(async move { text_handshake(&mut server_reader, &writer).await });

        // drain the banner, then send something other than "binary"
        let mut banner = [0u8; 23];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"PMP party music player;");
        client.write_all(b"ascii;").await.unwrap();

        assert!(server_side.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn binary_handshake_negotiates_the_lower_version() {
        let (mut client, server) = duplex(4096);
        let (mut server_reader, server_writer) = tokio::io::split(server);
        let writer = Arc::new(AsyncMutex::new(server_writer));

        let server_side = tokio::spawn(async move { binary_handshake(&mut server_reader, &writer).await });

        let mut hello = b"PMP".to_vec();
        hello.extend_from_slice(&10u16.to_be_bytes());
        client.write_all(&hello).await.unwrap();

        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[0..3], b"PMP");
        assert_eq!(u16::from_be_bytes([reply[3], reply[4]]), CLIENT_PROTOCOL_NO);

        let negotiated = server_side.await.unwrap().unwrap();
        assert_eq!(negotiated, 10); // client's older version wins the min()
    }

    #[test]
    fn client_ref_overflow_threshold_matches_extension_bit() {
        // client refs must force a disconnect at 0x8000_0000 so they never
        // collide with the message-type field's own extension bit.
        assert_eq!(0x8000_0000u32, 1u32 << 31);
        assert_eq!(wire::EXTENSION_BIT as u32, 1u32 << 15);
    }

    #[test]
    fn not_logged_in_is_not_a_success_code() {
        assert!(!ErrorCode::NotLoggedIn.is_success());
    }
}
