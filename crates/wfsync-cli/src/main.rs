use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use wfsync_core::Category;
use wfsync_sync::{init_logging, LoggingConfig, SyncConfig, SyncOptions, SyncRunSummary};

#[derive(Debug, Parser)]
#[command(name = "wfsync")]
#[command(about = "Copy workers, dispatchers, assignments and tracks between workforce projects")]
struct Cli {
    /// Organization administrator username
    #[arg(short = 'u', long = "username", allow_hyphen_values = true)]
    username: String,
    /// Organization administrator password
    #[arg(short = 'p', long = "password", allow_hyphen_values = true)]
    password: String,
    /// Organization URL, e.g. https://example.maps.arcgis.com
    #[arg(long = "url")]
    org_url: String,
    /// Item id of the source project
    #[arg(long = "spid")]
    source_project_id: String,
    /// Item id of the destination project
    #[arg(long = "dpid")]
    destination_project_id: String,
    #[arg(long = "logFile", default_value = "log.txt", allow_hyphen_values = true)]
    log_file: PathBuf,
    /// YAML file with optional steps and field filters
    #[arg(long = "config")]
    config: Option<PathBuf>,
    #[arg(long = "skip-tracks")]
    skip_tracks: bool,
    #[arg(long = "skip-maps")]
    skip_maps: bool,
}

/// Accept the single-dash long flags (`-url`, `-spid`, `-dpid`, `-logFile`)
/// existing scripts pass. Only tokens in flag position are rewritten; the
/// value following a flag is passed through as is.
fn normalize_legacy_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    const LEGACY: [&str; 4] = ["url", "spid", "dpid", "logFile"];
    const TAKES_VALUE: [&str; 9] = [
        "-u", "-p", "--username", "--password", "--url", "--spid", "--dpid", "--logFile",
        "--config",
    ];
    let mut out = Vec::new();
    let mut value_next = false;
    let mut passthrough = false;
    for (index, arg) in args.into_iter().enumerate() {
        if index == 0 || value_next || passthrough {
            value_next = false;
            out.push(arg);
            continue;
        }
        let Some(text) = arg.to_str() else {
            out.push(arg);
            continue;
        };
        let rewritten = match text.strip_prefix('-').filter(|r| !r.starts_with('-')) {
            Some(rest) if LEGACY.contains(&rest.split_once('=').map_or(rest, |(n, _)| n)) => {
                format!("-{text}")
            }
            _ => text.to_string(),
        };
        if rewritten == "--" {
            passthrough = true;
        } else {
            value_next = TAKES_VALUE.contains(&rewritten.as_str());
        }
        out.push(OsString::from(rewritten));
    }
    out
}

async fn run(cli: Cli) -> Result<SyncRunSummary> {
    let mut options = match &cli.config {
        Some(path) => SyncOptions::load(path).await?,
        None => SyncOptions::default(),
    };
    if cli.skip_tracks {
        options.copy_tracks = false;
    }
    if cli.skip_maps {
        options.copy_web_maps = false;
    }
    let config = SyncConfig::new(
        cli.org_url,
        cli.username,
        cli.password,
        cli.source_project_id,
        cli.destination_project_id,
    )
    .with_options(options);
    wfsync_sync::run_sync_once(&config).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_legacy_flags(std::env::args_os()));

    let _guard = match init_logging(&LoggingConfig::new(&cli.log_file)) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(summary) => {
            for category in Category::SYNC_ORDER {
                if let Some(o) = summary.outcome(category) {
                    println!(
                        "{category}: added={} updated={} failed={} rejected={}",
                        o.added, o.updated, o.failed, o.rejected
                    );
                }
            }
            println!(
                "sync complete: run_id={} web_map_layers={} config_errors={}",
                summary.run_id,
                summary.web_map_layers_rewritten,
                summary.config_errors.len()
            );
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Exception detected, sync exiting");
            error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}
