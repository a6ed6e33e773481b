//! soundwatch CLI entry point

use clap::{Parser, Subcommand};
use soundwatch::{
    commands::{run_command_loop, CommandContext},
    config::Config,
    error::Result,
    fetch::PageFetcher,
    notify::{format_timestamp, TelegramNotifier},
    novelty::NoveltyCaps,
    scheduler::Scheduler,
    store::WatchDb,
};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "soundwatch")]
#[command(version, about = "Watch TikTok sounds and hashtags, notify Telegram chats", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "SOUNDWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize soundwatch configuration and database
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Run the bot: scheduler loop plus the Telegram command loop
    Run,

    /// List tracked targets with their last poll
    Targets,

    /// Show system status
    Status,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Handle init command specially (doesn't need existing config)
    if let Commands::Init { force } = cli.command {
        return handle_init(cli.config, force).await;
    }

    // Load configuration
    let config = load_config(cli.config.as_deref())?;
    let db = WatchDb::new(&config.paths.db_file).await?;

    match cli.command {
        Commands::Init { .. } => unreachable!(),

        Commands::Run => {
            run_bot(config, db).await?;
        }

        Commands::Targets => {
            let targets = db.list_targets().await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&targets)?);
            } else if targets.is_empty() {
                println!("No targets tracked yet.");
            } else {
                println!("Tracked targets:");
                for target in &targets {
                    let latest = db
                        .latest_successful_run(target.get_type()?, &target.target_id)
                        .await?;
                    println!(
                        "  {}  {}  last post: {}  last poll: {}",
                        target.label(),
                        target.title.as_deref().unwrap_or("—"),
                        format_timestamp(target.last_ts),
                        latest.map(|run| run.started_at).unwrap_or_else(|| "never".into()),
                    );
                }
            }
        }

        Commands::Status => {
            let stats = db.global_stats().await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("soundwatch status:");
                println!("  Targets: {}", stats.target_count);
                println!("  Subscriptions: {}", stats.subscription_count);
                println!("  Poll runs: {}", stats.run_count);
                println!("  Database: {}", config.paths.db_file.display());
            }
        }
    }

    Ok(())
}

/// Wire everything together and run until ctrl-c
async fn run_bot(config: Config, db: WatchDb) -> Result<()> {
    let fetcher = Arc::new(PageFetcher::new(&config.fetch, config.poll.fetch_limit)?);
    let notifier = Arc::new(TelegramNotifier::new(&config.telegram)?);
    let interval_secs = Arc::new(AtomicU64::new(config.poll.interval_secs));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let caps = NoveltyCaps {
        first_poll_cap: config.poll.first_poll_cap,
        max_seen_ids: config.poll.max_seen_ids,
    };

    let mut scheduler = Scheduler::new(
        db.clone(),
        fetcher,
        notifier.clone(),
        interval_secs.clone(),
        caps,
        config.telegram.admin_chat_id,
        shutdown_rx.clone(),
    );
    let scheduler_task = tokio::spawn(async move { scheduler.run().await });

    let ctx = CommandContext { db, interval_secs };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = run_command_loop(&notifier, &ctx, shutdown_rx) => {
            if let Err(e) = result {
                error!("Command loop failed: {}", e);
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;

    Ok(())
}

async fn handle_init(config_path: Option<PathBuf>, force: bool) -> Result<()> {
    // If the user names a config file, its parent becomes the base directory
    let (base_dir, config_file) = if let Some(path) = config_path {
        if path.extension().map_or(false, |e| e == "toml") {
            let base = path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_base_dir);
            (base, path)
        } else {
            (path.clone(), path.join("config.toml"))
        }
    } else {
        let base = Config::default_base_dir();
        (base.clone(), base.join("config.toml"))
    };

    if config_file.exists() && !force {
        eprintln!(
            "Config file already exists at: {}\nUse --force to overwrite.",
            config_file.display()
        );
        std::process::exit(1);
    }

    let mut config = Config::default();
    config.init_paths(Some(base_dir));
    config.save()?;

    // Create the database and schema up front
    WatchDb::new(&config.paths.db_file).await?;

    println!("✓ soundwatch initialized successfully");
    println!("  Config: {}", config.paths.config_file.display());
    println!("\nNext steps:");
    println!("  1. Export your bot token: export {}=...", config.telegram.token_env);
    println!("  2. Start the bot: soundwatch run");
    println!("  3. In a chat with the bot: /track_sound <music_id|url>");

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let config_path = Config::default_config_path();
            if !config_path.exists() {
                eprintln!(
                    "Config file not found: {}\nRun 'soundwatch init' first.",
                    config_path.display()
                );
                std::process::exit(1);
            }
            Config::load(&config_path)
        }
    }
}
