use clap::Parser;
use snapshot_sanitizer::{sanitize, TransformOptions, DEFAULT_SNAPSHOT_VERSION};
use std::fs;
use std::io::{self, Read};
use std::process;
use tracing_subscriber::EnvFilter;

/// Sanitize a captured snapshot and print it to stdout.
#[derive(Parser, Debug)]
#[command(name = "snapshot_sanitizer", version, about)]
struct SanitizeCli {
    /// Snapshot HTML file, or '-' to read stdin (the default)
    #[arg(default_value = "-")]
    input: String,

    /// Version marker written into the head and the validator script
    #[arg(long, env = "TRUTHSEO_SNAPSHOT_VERSION", default_value_t = DEFAULT_SNAPSHOT_VERSION)]
    snapshot_version: u32,

    /// Skip appending the freshness validator script
    #[arg(long, default_value_t = false)]
    no_validator: bool,

    /// Exit with an error instead of echoing markup that cannot be sanitized
    #[arg(long, default_value_t = false)]
    strict: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run(SanitizeCli::parse()) {
        eprintln!("{}: {err}", env!("CARGO_PKG_NAME"));
        process::exit(1);
    }
}

fn run(cli: SanitizeCli) -> Result<(), String> {
    let html = if cli.input == "-" {
        read_stdin()?
    } else {
        read_file(&cli.input)?
    };

    let options = TransformOptions {
        snapshot_version: cli.snapshot_version,
        inject_validator: !cli.no_validator,
    };
    let output = match sanitize(&html, &options) {
        Ok(sanitized) => sanitized,
        Err(err) if cli.strict => return Err(format!("failed to sanitize snapshot: {err}")),
        Err(err) => {
            tracing::warn!(error = %err, "passing snapshot through unchanged");
            html
        }
    };
    println!("{}", output.trim_end());
    Ok(())
}

fn read_file(path: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|err| format!("failed to read '{path}': {err}"))
}

fn read_stdin() -> Result<String, String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|err| format!("failed to read stdin: {err}"))?;
    Ok(buf)
}
