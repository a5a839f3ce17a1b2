use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use url::Url;

use sizetracker_rs::config::{ArchiveConfig, TrackerConfig};
use sizetracker_rs::run::Tracker;

#[derive(Parser)]
#[command(name = "sizetracker")]
#[command(about = "Track engine, editor and packaging tool build sizes across releases")]
struct Args {
    /// Run a single analysis against the latest release: ios, android, packer, editor, macos
    #[arg(long)]
    test: Option<String>,

    /// Release list file
    #[arg(long, default_value = "releases.json")]
    releases: PathBuf,

    /// Directory for per-platform analysis CSVs and the index
    #[arg(long, default_value = "size-analyzer")]
    data_dir: PathBuf,

    /// Legacy engine-size report CSV
    #[arg(long, default_value = "size.csv")]
    report: PathBuf,

    /// Archive root URL (overrides SIZETRACKER_ARCHIVE_URL)
    #[arg(long)]
    archive_url: Option<String>,

    /// Skip rendering the trend graphs even when the report changed
    #[arg(long, default_value = "false")]
    skip_graphs: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!("sizetracker_rs={}", args.log_level))
        .init();

    let archive = match &args.archive_url {
        Some(raw) => ArchiveConfig::new(Url::parse(raw)?),
        None => ArchiveConfig::from_env()?,
    };

    let mut config = TrackerConfig::standard(archive);
    config.releases_path = args.releases.clone();
    config.data_dir = args.data_dir.clone();

    let tracker = Tracker::new(config);

    // Test mode works purely from the local release file; no channel
    // queries, no release list rewrite.
    if let Some(target) = &args.test {
        let releases = tracker.load_releases()?;
        tracker.run_test_mode(target, &releases).await?;
        return Ok(());
    }

    let (releases, forced) = match tracker.refresh_releases().await {
        Ok(result) => result,
        Err(e) => {
            error!("Failed to refresh release list: {}", e);
            std::process::exit(1);
        }
    };
    info!("Release list has {} entries", releases.releases.len());

    tracker.run_batch(&releases, &forced).await?;

    let changed = tracker
        .update_size_report(&releases, &forced, &args.report)
        .await?;
    if !changed {
        info!("Size report unchanged, skipping graphs");
    } else if args.skip_graphs {
        info!("Size report changed but graph rendering is disabled");
    } else {
        let out_dir = args
            .report
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let report = sizetracker_rs::report::Report::load(&args.report)?;
        tracker.render_graphs(&report, &out_dir)?;
    }

    Ok(())
}
