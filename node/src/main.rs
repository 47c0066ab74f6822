use std::env;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::task::spawn;
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use bmcl_node::config;

/// Edge cache node.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// Mode to run.
    #[clap(long, default_value = "monolithic")]
    mode: NodeMode,

    /// Whether to enable tokio-console.
    ///
    /// The console server will listen on its default port.
    #[clap(long)]
    tokio_console: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum NodeMode {
    /// Sync, serve and keep every cluster enabled.
    Monolithic,

    /// Run one sync then exit.
    SyncOnce,

    /// Run the database migrations then exit.
    DbMigrations,

    /// Check the configuration then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    init_logging(opts.tokio_console);
    dump_version();

    let config = config::load_config(opts.config.as_deref()).await?;

    match opts.mode {
        NodeMode::Monolithic => {
            bmcl_node::run_node(config).await?;
        }
        NodeMode::SyncOnce => {
            bmcl_node::run_sync_once(config).await?;
        }
        NodeMode::DbMigrations => {
            bmcl_node::run_migrations(config).await?;
        }
        NodeMode::CheckConfig => {
            eprintln!(
                "Configuration is valid: {} cluster(s), {} storage(s)",
                config.clusters.len(),
                config.storages.len()
            );
        }
    }

    Ok(())
}

fn init_logging(tokio_console: bool) {
    let env_filter = EnvFilter::from_default_env();
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);

    let error_layer = ErrorLayer::default();

    let console_layer = if tokio_console {
        let (layer, server) = console_subscriber::ConsoleLayer::new();
        spawn(server.serve());
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(error_layer)
        .with(console_layer)
        .init();

    if tokio_console {
        eprintln!("Note: tokio-console is enabled");
    }
}

fn dump_version() {
    #[cfg(debug_assertions)]
    eprintln!("Bmcl Node {} (debug)", env!("CARGO_PKG_VERSION"));

    #[cfg(not(debug_assertions))]
    eprintln!("Bmcl Node {} (release)", env!("CARGO_PKG_VERSION"));
}
