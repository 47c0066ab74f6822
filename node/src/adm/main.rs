mod command;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use enum_as_inner::EnumAsInner;

use bmcl_node::config;
use command::counters::{self, Counters};
use command::make_url::{self, MakeUrl};

/// Edge cache node administration utilities.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
pub struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// The sub-command.
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, EnumAsInner)]
pub enum Command {
    MakeUrl(MakeUrl),
    Counters(Counters),
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = config::load_config(opts.config.as_deref()).await?;

    match opts.command {
        Command::MakeUrl(_) => make_url::run(config, opts).await?,
        Command::Counters(_) => counters::run(config, opts).await?,
    }

    Ok(())
}
