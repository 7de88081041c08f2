use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pmp-server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Index `music_dir` and accept client connections on `port`.
    Run(RunArgs),
    /// One-shot indexation of `music_dir`, no server.
    Scan(ScanArgs),
    /// Forward connections on `port` to another server at `address`,
    /// logging traffic as it passes through. Generic over any
    /// length-framed-ish protocol, not specific to this crate's own wire
    /// format.
    Proxy {
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 5400)]
        port: u16,
    },
}

#[derive(clap::Args)]
pub struct RunArgs {
    #[arg(long)]
    pub music_dir: Utf8PathBuf,
    /// TOML file with settings not covered by CLI flags (DB path, keep-alive
    /// timings, Last.fm credentials).
    #[arg(long)]
    pub config: Option<Utf8PathBuf>,
    #[arg(long, default_value_t = 5400)]
    pub port: u16,
}

#[derive(clap::Args)]
pub struct ScanArgs {
    #[arg(long)]
    pub music_dir: Utf8PathBuf,
    #[arg(long)]
    pub config: Option<Utf8PathBuf>,
}
