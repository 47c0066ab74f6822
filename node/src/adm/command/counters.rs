use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::Parser;
use indicatif::HumanBytes;

use crate::Opts;
use bmcl_node::config::Config;
use bmcl_node::database::{hour_of, CounterStore, SqlCounterStore};

/// Show the hourly serving counters of a cluster.
#[derive(Debug, Parser)]
pub struct Counters {
    /// The cluster to show.
    #[clap(long)]
    cluster: String,

    /// Number of hours to look back.
    #[clap(long, default_value = "24")]
    hours: i64,
}

pub async fn run(config: Config, opts: Opts) -> Result<()> {
    let sub = opts.command.as_counters().unwrap();

    let store = SqlCounterStore::connect(&config.database_url()?).await?;
    store.migrate().await?;

    let since = hour_of(Utc::now()) - sub.hours + 1;
    let counters = store.get_counters(&sub.cluster, since).await?;

    if counters.is_empty() {
        eprintln!("No counters for {} in the last {} hours", sub.cluster, sub.hours);
        return Ok(());
    }

    let (mut hits, mut bytes) = (0, 0);
    for counter in &counters {
        let start = Utc
            .timestamp_opt(counter.hour * 3600, 0)
            .single()
            .map(|time| time.format("%Y-%m-%d %H:00").to_string())
            .unwrap_or_else(|| counter.hour.to_string());

        println!(
            "{}  {:>10} hits  {:>12}",
            start,
            counter.hits,
            HumanBytes(counter.bytes).to_string()
        );

        hits += counter.hits;
        bytes += counter.bytes;
    }

    println!("total             {:>10} hits  {:>12}", hits, HumanBytes(bytes).to_string());

    Ok(())
}
