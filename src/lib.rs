//! Party music player server: a content-addressed track collection, a
//! shared playback queue, per-user history and statistics, and the
//! length-prefixed binary protocol that lets a fleet of clients watch and
//! drive all three from a single running instance.
//!
//! # Async model
//!
//! One Tokio multi-thread runtime for the whole process. Each accepted
//! connection gets its own task (`session::handle_clients`); within a
//! connection, a second task forwards domain events from [`server`]'s
//! broadcast channel while the main task blocks on the next frame or the
//! keep-alive timer. State shared across connections — the queue, the
//! playback snapshot, the hash registrar, the history engine — lives in
//! one [`server::ServerContext`] passed around as an `Arc`, not behind a
//! global. Critical sections that never cross an `.await` (the queue, the
//! playback snapshot, the registrar, the pending-registration map) use
//! `std::sync::Mutex`; the database connection and a session's write half
//! are held across awaits and so use `tokio::sync::Mutex` instead.
//! File analysis and indexation each run on their own dedicated OS thread
//! (`fileanalyzer::AnalysisPool`, `scan::IndexationPool`), fed by an
//! `mpsc` work queue rather than `spawn_blocking`, so a slow scan can't
//! starve the runtime's blocking-pool budget shared with everything else.

pub mod cli;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod fileanalyzer;
pub mod hashes;
pub mod history;
pub mod proxy;
pub mod queue;
pub mod scan;
pub mod scrobbling;
pub mod server;
pub mod session;
pub mod user;
pub mod wire;

pub fn setup_tracing() {
    use tracing_subscriber::filter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = filter::EnvFilter::builder().from_env().unwrap();
    let fmt = fmt::layer().pretty().with_line_number(true);

    let _ignore_err = tracing_subscriber::registry().with(fmt).with(filter).try_init();
}
