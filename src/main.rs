use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rosterdav::config::{self, PhotosConfig};
use rosterdav::photo::{HarArchive, PhotoDirectory, PhotoSource};
use rosterdav::remote::carddav::CardDavClient;
use rosterdav::roster::ConfiguredRoster;
use rosterdav::sync::{ConsoleCheckpoint, ReviewPoint, SyncOrchestrator, SyncReport};
use rosterdav::vdir::StagingDir;

#[derive(Parser, Debug)]
#[command(name = "rosterdav", version, about = "Sync a club roster into a CardDAV address book")]
struct Cli {
    /// Configuration file (default: <config dir>/rosterdav/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download, merge and upload with a review stop after each phase
    Sync,
    /// Stage the current server contents
    Download,
    /// Merge the roster into the staged contacts
    Merge(MergeArgs),
    /// Upload the staged contacts
    Upload,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// Read the roster from a local export instead of the configured source
    #[arg(long, value_name = "FILE")]
    roster: Option<PathBuf>,

    /// Skip photo lookup
    #[arg(long, default_value_t = false)]
    no_photos: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = config::load(cli.config.as_deref())?;
    info!(config = %config.config_path.display(), "configuration loaded");

    let remote = CardDavClient::from_config(&config.remote)?;
    let mut store = StagingDir::new(&config.staging_dir);
    let mut checkpoint = ConsoleCheckpoint::new(store.root());

    match cli.command {
        Command::Sync => {
            let roster = ConfiguredRoster::from_config(&config.roster, None)?;
            let sources = photo_sources(&config.photos, &config.phone_region)?;
            let mut orchestrator = SyncOrchestrator::new(&remote, &mut store, &mut checkpoint)
                .with_photos(sources, &config.phone_region, config.photos.max_downloads)
                .with_progress(true);
            let report = orchestrator.run(&roster).await?;
            if let Some(point) = report.aborted_at {
                println!("Stopped at the {} review.", review_name(point));
            }
        }
        Command::Download => {
            let mut report = SyncReport::default();
            SyncOrchestrator::new(&remote, &mut store, &mut checkpoint)
                .with_progress(true)
                .download_baseline(&mut report)
                .await?;
            report.print_summary("Download completed");
        }
        Command::Merge(args) => {
            let roster = ConfiguredRoster::from_config(&config.roster, args.roster)?;
            let sources = if args.no_photos || !config.photos.has_sources() {
                Vec::new()
            } else {
                photo_sources(&config.photos, &config.phone_region)?
            };
            let mut report = SyncReport::default();
            SyncOrchestrator::new(&remote, &mut store, &mut checkpoint)
                .with_photos(sources, &config.phone_region, config.photos.max_downloads)
                .with_progress(true)
                .merge_roster(&roster, &mut report)
                .await?;
            report.print_summary("Merge completed");
        }
        Command::Upload => {
            let mut report = SyncReport::default();
            SyncOrchestrator::new(&remote, &mut store, &mut checkpoint)
                .with_progress(true)
                .upload_staged(&mut report)
                .await?;
            report.print_summary("Upload completed");
        }
    }

    Ok(())
}

fn photo_sources(config: &PhotosConfig, region: &str) -> Result<Vec<Box<dyn PhotoSource>>> {
    let mut sources: Vec<Box<dyn PhotoSource>> = Vec::new();
    if let Some(path) = &config.whatsapp_har {
        sources.push(Box::new(HarArchive::load(path)?));
    }
    if let Some(path) = &config.directory {
        sources.push(Box::new(PhotoDirectory::open(path, region)?));
    }
    Ok(sources)
}

fn review_name(point: ReviewPoint) -> &'static str {
    match point {
        ReviewPoint::Baseline => "baseline",
        ReviewPoint::Merged => "pre-upload",
    }
}
