use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;

use tick_rollup::bar_store::writer::PersistenceGateway;
use tick_rollup::bar_store::BarStore;
use tick_rollup::cli::{self, Command};
use tick_rollup::config::Config;
use tick_rollup::logging::init_logging;
use tick_rollup::pipeline::LivePipeline;
use tick_rollup::rollup::RollupJob;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args).await {
        tracing::error!(error = %format!("{:#}", e), "Fatal error");
        eprintln!("tick-rollup: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: &[String]) -> Result<()> {
    let command = cli::parse_args(args)?;
    if command == Command::Help {
        println!("{}", cli::USAGE);
        return Ok(());
    }

    // rustls 0.23 needs a process-wide crypto provider before any wss:// connect
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let config = Config::load().context("failed to load config")?;
    init_logging(&config.logging)?;

    match command {
        Command::Run => run_live(config).await,
        Command::Rollup(rollup_args) => run_rollup(config, rollup_args),
        Command::Help => Ok(()),
    }
}

async fn run_live(config: Config) -> Result<()> {
    tracing::info!(
        ws_url = %config.feed.ws_url,
        stream = %config.feed.stream,
        symbols = ?config.feed.symbols,
        tick_buffer_sec = config.ingest.tick_buffer_sec,
        db_path = %config.storage.db_path.display(),
        "Starting tick-rollup"
    );

    let store = BarStore::open(&config.storage.db_path)
        .with_context(|| format!("failed to open {}", config.storage.db_path.display()))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (symbols_tx, symbols_rx) = watch::channel(config.feed.symbols.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, flushing and shutting down");
            let _ = shutdown_tx.send(true);
        }
    });
    spawn_symbol_reload(symbols_tx);

    let pipeline = LivePipeline::from_config(&config);
    let mut state_rx = pipeline.state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow_and_update();
            tracing::info!(state = ?state, "Feed state");
        }
    });

    let (_store, stats) = pipeline.run(store, symbols_rx, shutdown_rx).await?;
    tracing::info!(
        ticks = stats.feed.ticks,
        accepted = stats.ingest.accepted,
        late = stats.ingest.late,
        bars = stats.ingest.bars_emitted,
        writes_dropped = stats.ingest.writes_dropped,
        bars_written = stats.writer.bars_written,
        bars_dropped = stats.writer.bars_dropped,
        "tick-rollup stopped"
    );
    Ok(())
}

/// On SIGHUP, re-read the config and push the new symbol list to the feed.
#[cfg(unix)]
fn spawn_symbol_reload(symbols_tx: watch::Sender<Vec<String>>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "SIGHUP handler unavailable; symbol reload disabled");
                return;
            }
        };
        while hup.recv().await.is_some() {
            match Config::load() {
                Ok(config) => {
                    tracing::info!(symbols = ?config.feed.symbols, "Reloaded symbol set");
                    if symbols_tx.send(config.feed.symbols).is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %format!("{:#}", e), "Config reload failed; keeping symbols"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_symbol_reload(_symbols_tx: watch::Sender<Vec<String>>) {}

fn run_rollup(config: Config, args: cli::RollupArgs) -> Result<()> {
    let store = BarStore::open(&config.storage.db_path)
        .with_context(|| format!("failed to open {}", config.storage.db_path.display()))?;
    let gateway = PersistenceGateway::new(store, config.retry_policy());
    let mut job = RollupJob::new(gateway, &config.feed.source, config.rollup.safety_lag_minutes);

    let now_ms = chrono::Utc::now().timestamp_millis();
    let report = job.run(&args.to_request(now_ms), now_ms)?;
    println!(
        "rollup [{} .. {}){}: {} ticks read, {} bars written, {} bars dropped",
        report.from_ms,
        report.to_ms,
        if report.clamped { " (clamped)" } else { "" },
        report.ticks_read,
        report.bars_written,
        report.bars_dropped
    );
    if report.bars_dropped > 0 {
        return Err(anyhow!("{} bars could not be written", report.bars_dropped));
    }
    Ok(())
}
