use std::fs;
use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use tokio::runtime::Builder;
use truthseo::freshness::build_client;
use truthseo::{check_freshness, init_tracing, FreshnessVerdict};

#[derive(Parser, Debug)]
#[command(
    name = "truthseo-freshness",
    about = "Check a generated snapshot against the live root document"
)]
struct FreshnessCli {
    /// Snapshot HTML file produced by the sanitizer.
    #[arg(long)]
    snapshot: PathBuf,

    /// Live origin serving `/index.html`.
    #[arg(long, env = "TRUTHSEO_ORIGIN")]
    origin: String,

    /// Path the snapshot is served at.
    #[arg(long, default_value = "/")]
    path: String,

    /// Exit with an error when the snapshot would redirect.
    #[arg(long, default_value_t = false)]
    fail_on_redirect: bool,
}

fn main() -> Result<()> {
    init_tracing("info");
    let cli = FreshnessCli::parse();
    let snapshot = fs::read_to_string(&cli.snapshot)
        .with_context(|| format!("failed to read snapshot {:?}", cli.snapshot))?;

    let client = build_client()?;
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    let verdict = rt.block_on(check_freshness(&client, &snapshot, &cli.origin, &cli.path))?;

    println!("{}", serde_json::to_string(&verdict)?);
    if cli.fail_on_redirect {
        ensure!(
            !matches!(verdict, FreshnessVerdict::Redirect { .. }),
            "snapshot for {} is stale",
            cli.path
        );
    }
    Ok(())
}
