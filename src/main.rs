use std::sync::Arc;

use clap::Parser;
use color_eyre::{Result, eyre::Context};

use pmp_server::cli::{Cli, Commands};
use pmp_server::{config::Config, proxy, server::ServerContext, session};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install().unwrap();
    pmp_server::setup_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Proxy { address, port } => proxy::handle_clients(port, &address).await?,

        Commands::Run(args) => {
            let config = Config::load(args.config.as_deref())?;
            let db_path = config.resolve_database_path()?;
            let ctx = Arc::new(
                ServerContext::new(args.music_dir, db_path, &config).wrap_err("could not start server context")?,
            );
            ctx.run_indexation().await.wrap_err("initial indexation failed")?;
            ctx.spawn_cache_fixer();
            ctx.spawn_history_prefetcher();
            session::handle_clients(ctx, args.port).await?;
        }

        Commands::Scan(args) => {
            let config = Config::load(args.config.as_deref())?;
            let db_path = config.resolve_database_path()?;
            let ctx = Arc::new(
                ServerContext::new(args.music_dir, db_path, &config).wrap_err("could not start server context")?,
            );
            ctx.rescan().await?;
        }
    }

    Ok(())
}
