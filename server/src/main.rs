mod config;
mod wire;

use clap::{Parser, Subcommand};
use config::ServerConfig;
use hermeticum_world::db::Store;
use hermeticum_world::Game;
use slog::{info, o, Drain, Logger};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hermeticum", about = "a server for your imagination")]
struct Cli {
    /// World database path (overrides HERMETICUM_DB).
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Start the server and bind the socket.
    Serve {
        /// Listen on this UNIX socket (overrides HERMETICUM_SOCKET).
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Drop and recreate the persistent schema and the default world.
    Reset,
}

fn main() -> anyhow::Result<()> {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = Logger::root(drain, o!());

    let cli = Cli::parse();
    let mut conf = ServerConfig::load();
    if let Some(ref db) = cli.db {
        conf.db_path = db.clone();
    }

    async_std::task::block_on(async move {
        match cli.command {
            Cmd::Serve { socket } => {
                let socket = socket.unwrap_or_else(|| conf.socket_path.clone());
                info!(logger, "starting"; "db" => %conf.db_path.display());

                let store = Store::connect(&conf.db_path, &logger).await?;
                store.migrate().await?;
                // clean up containment left over from an unclean shutdown
                store.ghost_bust().await?;
                store.ensure_defaults().await?;

                let game = Game::new(store, logger);
                wire::serve(game, socket).await
            }
            Cmd::Reset => {
                let store = Store::connect(&conf.db_path, &logger).await?;
                store.erase().await?;
                store.migrate().await?;
                store.ensure_defaults().await?;
                info!(logger, "world reset"; "db" => %conf.db_path.display());
                Ok(())
            }
        }
    })
}
