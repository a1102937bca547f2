use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use tagvault_core::models::ContentHash;
use tagvault_core::{Archive, Config, FeedClient, Store, SyncEngine, VaultError, VaultResult};

/// Command-line arguments for tagvault
#[derive(Parser)]
#[command(name = "tagvault")]
#[command(about = "Tagged media archive with remote tag repository sync")]
#[command(version)]
struct Cli {
    #[arg(long, env = "TAGVAULT_CONFIG", help = "Config file (default: ~/.tagvault/config.toml)")]
    config: Option<PathBuf>,

    #[arg(long, help = "Database path, overriding the config file")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    #[command(name = "sync-tags", about = "Fetch new tag repository updates and merge them")]
    SyncTags {
        #[arg(long, help = "Disable the progress bar")]
        quiet: bool,
    },

    #[command(name = "remote-tags", about = "Print remote tags known for a SHA-256 hash")]
    RemoteTags {
        #[arg(help = "Hex-encoded SHA-256 of the file contents")]
        sha256: String,
    },

    #[command(about = "List files carrying all the given tags")]
    Search {
        #[arg(required = true)]
        tags: Vec<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("tagvault: {err}");
        std::process::exit(err.exit_code());
    }
}

fn run(cli: Cli) -> VaultResult<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    let archive = Arc::new(Archive::open(Store::open(&config.db_path)?)?);

    match cli.command {
        Cmd::SyncTags { quiet } => sync_tags(config, archive, quiet),
        Cmd::RemoteTags { sha256 } => {
            let hash = parse_sha256(&sha256)?;
            for tag in archive.remote_tags(&hash)? {
                println!("{tag}");
            }
            Ok(())
        }
        Cmd::Search { tags } => {
            for id in archive.search(&tags) {
                println!("{id}");
            }
            Ok(())
        }
    }
}

fn sync_tags(config: Config, archive: Arc<Archive>, quiet: bool) -> VaultResult<()> {
    config.validate()?;
    let feed = FeedClient::new(&config)?;
    let engine = SyncEngine::new(feed, archive, config);

    let report = if quiet {
        engine.sync_tag_repository(&mut ())
    } else {
        let mut bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        let report = engine.sync_tag_repository(&mut bar);
        bar.finish_and_clear();
        report
    }?;

    println!(
        "updates {} -> {} ({} applied): {} hashes, {} pairs, {} tags; {} of {} records gained {} tags in {:.1}s",
        report.counter_before,
        report.counter_after,
        report.updates_applied,
        report.hash_rows,
        report.pair_rows,
        report.tag_rows,
        report.reconcile.updated,
        report.reconcile.examined,
        report.reconcile.tags_added,
        report.elapsed.as_secs_f64(),
    );
    Ok(())
}

fn parse_sha256(text: &str) -> VaultResult<ContentHash> {
    let mut hash = [0u8; 32];
    hex::decode_to_slice(text.trim(), &mut hash)
        .map_err(|e| VaultError::Config(format!("invalid SHA-256 `{text}`: {e}")))?;
    Ok(hash)
}
