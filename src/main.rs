use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use trackframe::collect::CategoryCollector;
use trackframe::config::AppConfig;
use trackframe::export::CsvExporter;
use trackframe::fetch::RetryPolicy;
use trackframe::playlist::{self, Playlist};
use trackframe::source::spotify::SpotifyClient;

#[derive(Parser)]
#[command(name = "trackframe", version, about = "Playlist audio-analysis aggregator")]
struct Cli {
    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PlaylistArgs {
    /// Directory of playlist slice files (defaults to config data_dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory to write exports under (defaults to config output_dir)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Only process the first N playlists
    #[arg(short = 'n', long)]
    limit: Option<usize>,
}

#[derive(Args)]
struct FetchArgs {
    /// Number of parallel fetch workers (0 = use config)
    #[arg(short = 'j', long, default_value = "0")]
    jobs: usize,

    /// Attempts per track before it is skipped (defaults to config max_retries)
    #[arg(long)]
    max_retries: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch per-track audio analyses and export (category, track) tables
    Analyses {
        #[command(flatten)]
        playlists: PlaylistArgs,

        #[command(flatten)]
        fetch: FetchArgs,

        /// Only write the combined table, not one file per category
        #[arg(long)]
        combined_only: bool,
    },

    /// Fetch per-track audio features and export one row per track
    Features {
        #[command(flatten)]
        playlists: PlaylistArgs,

        #[command(flatten)]
        fetch: FetchArgs,
    },

    /// Export track id → song name tables (no API access needed)
    Names {
        #[command(flatten)]
        playlists: PlaylistArgs,
    },

    /// List the playlists in a slice file
    Inspect {
        /// Slice file to read
        slice: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();

    match cli.command {
        Commands::Analyses { playlists, fetch, combined_only } => {
            let lists = load_playlists(&config, &playlists)?;
            let exporter = CsvExporter::new(output_dir(&config, &playlists))
                .with_per_category(!combined_only);
            let client = SpotifyClient::new(&config.spotify).context("Failed to set up API client")?;
            let collector = collector(&config, &fetch, &client)?;

            for list in &lists {
                println!("{}", list.name);
                let report = trackframe::pipeline::process_analyses(list, &collector, &exporter)?;
                println!(
                    "  {} of {} tracks fetched ({} skipped): {} rows in {} categories -> {}",
                    report.fetched,
                    report.tracks,
                    report.skipped,
                    report.rows,
                    report.categories,
                    exporter.destination_dir(&report.export_key).display()
                );
            }
            println!("Analyses complete: {} playlists", lists.len());
        }

        Commands::Features { playlists, fetch } => {
            let lists = load_playlists(&config, &playlists)?;
            let exporter = CsvExporter::new(output_dir(&config, &playlists));
            let client = SpotifyClient::new(&config.spotify).context("Failed to set up API client")?;
            let collector = collector(&config, &fetch, &client)?;

            for list in &lists {
                println!("{}", list.name);
                let report = trackframe::pipeline::process_features(list, &collector, &exporter)?;
                println!(
                    "  {} of {} tracks fetched ({} skipped)",
                    report.fetched, report.tracks, report.skipped
                );
            }
            println!("Features complete: {} playlists", lists.len());
        }

        Commands::Names { playlists } => {
            let lists = load_playlists(&config, &playlists)?;
            let exporter = CsvExporter::new(output_dir(&config, &playlists));
            for list in &lists {
                let count = trackframe::pipeline::process_names(list, &exporter)?;
                println!("{}: {} songs", list.name, count);
            }
        }

        Commands::Inspect { slice } => {
            let lists = playlist::load_slice(&slice)
                .with_context(|| format!("Failed to read {}", slice.display()))?;
            println!("{:>8}  {:>6}  {}", "PID", "Tracks", "Name");
            println!("{}", "-".repeat(50));
            for list in &lists {
                println!("{:>8}  {:>6}  {}", list.pid, list.tracks.len(), list.name);
            }
            println!();
            println!("{} playlists", lists.len());
        }
    }

    Ok(())
}

/// Resolve playlists: CLI data dir > config data_dir, CLI limit > config limit.
fn load_playlists(config: &AppConfig, args: &PlaylistArgs) -> Result<Vec<Playlist>> {
    let data_dir = args.data_dir.clone().unwrap_or_else(|| config.data_dir.clone());
    let limit = args.limit.or(config.playlist_limit);
    log::info!("Data directory: {}", data_dir.display());

    let lists = playlist::load_playlists(&data_dir, limit)
        .with_context(|| format!("Failed to load playlists from {}", data_dir.display()))?;
    if lists.is_empty() {
        anyhow::bail!("No playlists found in {}", data_dir.display());
    }
    Ok(lists)
}

fn output_dir(config: &AppConfig, args: &PlaylistArgs) -> PathBuf {
    args.output_dir.clone().unwrap_or_else(|| config.output_dir.clone())
}

fn collector<'a>(
    config: &AppConfig,
    args: &FetchArgs,
    client: &'a SpotifyClient,
) -> Result<CategoryCollector<'a, SpotifyClient>> {
    let mut policy = RetryPolicy::from_config(config);
    if let Some(n) = args.max_retries {
        policy.max_retries = n.max(1);
    }
    let workers = if args.jobs > 0 { args.jobs } else { config.resolve_workers() };

    let collector = CategoryCollector::new(client, policy)
        .with_workers(workers)
        .context("Failed to start fetch workers")?
        .with_progress(true);
    Ok(collector)
}
