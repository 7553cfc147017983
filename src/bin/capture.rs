use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use truthseo::{init_tracing, run_agent, Cli, MemoryPage, SnapshotRecord, SNAPSHOT_QUERY_KEY};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "truthseo-capture",
    about = "Run the snapshot agent over rendered HTML and print the posted snapshot"
)]
struct CaptureCli {
    /// URL the document is served at; the snapshot flag is added when missing.
    #[arg(long, env = "TRUTHSEO_URL")]
    url: String,

    /// Rendered HTML file, or '-' to read stdin.
    #[arg(long, default_value = "-")]
    html: String,

    /// Manifest JSONL to append a capture record to.
    #[arg(long, env = "TRUTHSEO_MANIFEST")]
    manifest: Option<PathBuf>,

    #[command(flatten)]
    controls: Cli,
}

fn main() -> Result<()> {
    init_tracing("info");
    let cli = CaptureCli::parse();

    let html = read_input(&cli.html)?;
    let page_url = with_snapshot_flag(&cli.url)?;
    let (page, mut parent) = MemoryPage::new(page_url.as_str(), html)
        .with_context(|| format!("failed to load page at {}", cli.url))?;

    let outcome = run_agent(&cli.controls, page).map_err(|err| anyhow::anyhow!(err))?;
    if !outcome.is_delivered() {
        bail!("no snapshot delivered: {outcome:?}");
    }

    let mut snapshot = None;
    while let Some(message) = parent.try_next_message() {
        if message.snapshot_html().is_some() {
            snapshot = Some(message);
        }
    }
    let Some(message) = snapshot else {
        bail!("agent reported delivery but the parent received nothing");
    };
    println!("{}", serde_json::to_string(&message.payload)?);

    if let (Some(path), Some(html)) = (&cli.manifest, message.snapshot_html()) {
        let previous = load_latest_records(path)?;
        let record = SnapshotRecord::from_html(&cli.url, &html).compared_to(previous.get(&cli.url));
        append_record(path, &record)?;
    }
    Ok(())
}

fn read_input(source: &str) -> Result<String> {
    if source == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(source).with_context(|| format!("failed to read {source:?}"))
}

fn with_snapshot_flag(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid url {raw:?}"))?;
    if !url.query_pairs().any(|(key, _)| key == SNAPSHOT_QUERY_KEY) {
        url.query_pairs_mut().append_key_only(SNAPSHOT_QUERY_KEY);
    }
    Ok(url)
}

fn load_latest_records(path: &Path) -> Result<HashMap<String, SnapshotRecord>> {
    let mut records = HashMap::new();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(records),
        Err(err) => return Err(err).with_context(|| format!("failed to open manifest {path:?}")),
    };
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read manifest line {}", idx + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SnapshotRecord = serde_json::from_str(&line)
            .with_context(|| format!("invalid manifest record at line {}", idx + 1))?;
        records.insert(record.url.clone(), record);
    }
    Ok(records)
}

fn append_record(path: &Path, record: &SnapshotRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {parent:?}"))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open manifest {path:?}"))?;
    writeln!(file, "{}", serde_json::to_string(record)?)?;
    tracing::info!(
        url = %record.url,
        changed = record.changed,
        manifest = %path.display(),
        "capture recorded"
    );
    Ok(())
}
