use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use trendbot::broker::PaperBroker;
use trendbot::config::EngineConfig;
use trendbot::models::SymbolSpec;
use trendbot::timing::ClockSync;
use trendbot::Trader;

#[derive(Parser)]
#[command(
    name = "trendbot",
    about = "Minute-bar trend-following engine with staged pyramiding"
)]
struct Cli {
    /// Path to a TOML config file. Defaults to ./trendbot.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading loop against the paper venue.
    Run {
        /// Stop after this many minute cycles.
        #[arg(long)]
        cycles: Option<u64>,

        /// Write position history as JSON on shutdown.
        #[arg(long)]
        export: Option<PathBuf>,

        /// Close every open unit on shutdown.
        #[arg(long, default_value_t = false)]
        flatten: bool,
    },
    /// Estimate the server clock offset and run a health check.
    CheckClock,
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            cycles,
            export,
            flatten,
        } => run(config, cycles, export, flatten).await,
        Commands::CheckClock => check_clock(config).await,
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trendbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn paper_venue(config: &EngineConfig) -> Arc<PaperBroker> {
    let broker = Arc::new(PaperBroker::new(&config.paper));
    for symbol in &config.symbols {
        broker.add_generated_symbol(symbol, SymbolSpec::default());
    }
    broker
}

// ============================================================================
// Commands
// ============================================================================

async fn run(
    config: EngineConfig,
    cycles: Option<u64>,
    export: Option<PathBuf>,
    flatten: bool,
) -> anyhow::Result<()> {
    tracing::info!("🚀 trendbot starting on paper venue");

    let broker = paper_venue(&config);
    let mut trader = Trader::new(broker, config);
    let stop = trader.stop_handle();

    let engine = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        trader.bootstrap();
        trader.run(cycles);
        trader.shutdown(flatten);
        if let Some(path) = export {
            trader.export_history(&path)?;
        }
        Ok(())
    });
    tokio::pin!(engine);

    tracing::info!("Press Ctrl+C to stop...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, finishing current cycle...");
            stop.store(true, Ordering::SeqCst);
            engine.await.context("engine task panicked")??;
        }
        result = &mut engine => {
            result.context("engine task panicked")??;
        }
    }

    tracing::info!("✅ trendbot stopped");
    Ok(())
}

async fn check_clock(config: EngineConfig) -> anyhow::Result<()> {
    let broker = paper_venue(&config);

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut clock = ClockSync::new(config.clock.clone());
        let offset = clock.synchronize(broker.as_ref());
        println!("Server offset: {:+.3}s", offset);

        match clock.check_health(broker.as_ref()) {
            Ok(()) => println!("Clock health: OK"),
            Err(e) => println!("Clock health: FAILED ({})", e),
        }
        Ok(())
    })
    .await
    .context("clock task panicked")?
}
