use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use humantime::Duration;

use crate::Opts;
use bmcl::file::validate_hash;
use bmcl::signing;
use bmcl_node::config::Config;

/// Generate a signed download URL.
///
/// For example, to let a client fetch a file served by cluster `c1`
/// within the next 10 minutes:
///
/// $ bmcladm make-url --cluster c1 --hash 2ef7bde608ce5404e97d5f042f95f89f1c232871 --validity 10m
#[derive(Debug, Parser)]
pub struct MakeUrl {
    /// The cluster whose secret signs the URL.
    #[clap(long)]
    cluster: String,

    /// The hash of the file.
    #[clap(long, conflicts_with = "measure")]
    hash: Option<String>,

    /// Sign a measurement of this many MiB instead of a file.
    #[clap(long)]
    measure: Option<u64>,

    /// The validity period of the URL.
    #[clap(long, default_value = "5m")]
    validity: Duration,
}

pub async fn run(config: Config, opts: Opts) -> Result<()> {
    let sub = opts.command.as_make_url().unwrap();

    let cluster = config
        .clusters
        .iter()
        .find(|cluster| cluster.id == sub.cluster)
        .ok_or_else(|| anyhow!("Cluster {} is not configured", sub.cluster))?;

    let duration = ChronoDuration::from_std(sub.validity.into())?;
    let exp = Utc::now()
        .checked_add_signed(duration)
        .ok_or_else(|| anyhow!("Expiry timestamp overflowed"))?;

    let (path, subject) = match (&sub.hash, sub.measure) {
        (Some(hash), _) => {
            let hash = hash.to_ascii_lowercase();
            validate_hash(&hash)?;
            (format!("/download/{}", hash), hash)
        }
        (None, Some(size)) => {
            let path = format!("/measure/{}", size);
            (path.clone(), path)
        }
        (None, None) => return Err(anyhow!("Either --hash or --measure is required")),
    };

    let signature = signing::sign(&cluster.secret, &subject, exp.timestamp_millis() as u64);
    println!("{}?{}", path, signature.to_query());

    Ok(())
}
