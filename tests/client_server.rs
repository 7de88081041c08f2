//! Drives a real `PmpClient` against a real `session::handle_clients`
//! listener over a loopback TCP socket, exercising the handshake, the
//! request/response arena, account registration and login, and queue
//! mutation together rather than through any single module's mocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use camino::Utf8PathBuf;
use pmp_server::client::PmpClient;
use pmp_server::config::Config;
use pmp_server::server::ServerContext;
use pmp_server::session;
use pmp_server::wire::WireFileHash;

static NEXT_PORT: AtomicU16 = AtomicU16::new(28900);

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

async fn spawn_server() -> (u16, Utf8PathBuf) {
    let port = next_port();
    let unique = format!("{}-{}", std::process::id(), port);
    let base = std::env::temp_dir().join(format!("pmp-test-{unique}"));
    let music_dir = Utf8PathBuf::from_path_buf(base.join("music")).unwrap();
    let db_path = Utf8PathBuf::from_path_buf(base.join("pmp.sqlite")).unwrap();
    std::fs::create_dir_all(&music_dir).unwrap();

    let ctx = Arc::new(ServerContext::new(music_dir.clone(), db_path.clone(), &Config::default()).unwrap());
    tokio::spawn(session::handle_clients(ctx, port));
    // give the listener a moment to bind before the test connects.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    (port, music_dir)
}

#[tokio::test]
async fn handshake_register_login_and_play() {
    let (port, _music_dir) = spawn_server().await;
    let client = PmpClient::connect(("127.0.0.1", port)).await.unwrap();
    assert_eq!(client.protocol_no, pmp_server::wire::CLIENT_PROTOCOL_NO);

    let (_user_id, user_salt) = client.register("alice", "hunter2").await.unwrap();
    client.login("alice", &user_salt, "hunter2").await.unwrap();

    // a login with the wrong password must fail, not silently succeed.
    let bad_login = client.login("alice", &user_salt, "wrong").await;
    assert!(bad_login.is_err());

    client.play().await.unwrap();
    client.pause().await.unwrap();
    client.set_volume(77).await.unwrap();

    let state = client.request_player_state().await.unwrap();
    assert_eq!(state.volume, 77);
}

#[tokio::test]
async fn queue_insertion_and_removal_round_trip() {
    let (port, _music_dir) = spawn_server().await;
    let client = PmpClient::connect(("127.0.0.1", port)).await.unwrap();

    let (_user_id, user_salt) = client.register("bob", "swordfish").await.unwrap();
    client.login("bob", &user_salt, "swordfish").await.unwrap();

    let hash = WireFileHash { length: 12345, sha1: [7; 20], md5: [9; 16] };
    let confirmation = client.insert_hash_at_front(hash).await.unwrap();
    assert_eq!(confirmation.index, 0);

    client.remove_queue_entry(confirmation.queue_id).await.unwrap();
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let (port, _music_dir) = spawn_server().await;
    let client = PmpClient::connect(("127.0.0.1", port)).await.unwrap();

    client.register("carol", "first-password").await.unwrap();
    let second = client.register("carol", "second-password").await;
    assert!(second.is_err());
}
