use anyhow::{bail, Context};
use breakout_bot::api::{BinanceClient, Credentials, MarketDataSource};
use breakout_bot::config::{resolve_instruments, BotConfig};
use breakout_bot::control_loop::ControlLoop;
use breakout_bot::execution::{
    stream_url, DryRunGateway, ExecutionGateway, LiveGateway, MarketFeed, StreamConfig,
    BINANCE_TESTNET_WS_BASE, BINANCE_WS_BASE,
};
use breakout_bot::telemetry;
use chrono::Utc;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "breakout-bot")]
#[command(about = "Breakout trading bot with partial take-profit, ATR trailing stop and a daily kill switch")]
#[command(version)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Force simulated fills
    #[arg(long, conflicts_with = "live")]
    dry_run: bool,

    /// Force real orders (needs BINANCE_API_KEY / BINANCE_API_SECRET)
    #[arg(long)]
    live: bool,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut cfg = telemetry::with_bootstrap_logging(|| BotConfig::load(&args.config))
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    if args.dry_run {
        cfg.dry_run = true;
    }
    if args.live {
        cfg.dry_run = false;
    }

    let log_path = telemetry::init_logging(Path::new(&cfg.log_dir))?;
    tracing::info!(
        pid = std::process::id(),
        exchange = %cfg.exchange,
        sandbox = cfg.sandbox,
        dry_run = cfg.dry_run,
        symbols = ?cfg.symbols,
        timeframe = cfg.timeframe.as_str(),
        log_file = %log_path.display(),
        "BOOT"
    );

    let credentials = Credentials::from_env();
    if !cfg.dry_run && credentials.is_none() {
        bail!("Live mode requires BINANCE_API_KEY and BINANCE_API_SECRET");
    }

    let client = BinanceClient::new(cfg.sandbox, cfg.request_timeout(), credentials)
        .context("Failed to build exchange client")?;
    let markets = client
        .load_markets()
        .await
        .context("Failed to load exchange markets")?;
    let instruments = resolve_instruments(&cfg.symbols, &markets, &cfg.fiat, &cfg.exchange)?;
    tracing::info!(
        instruments = ?instruments.iter().map(|i| i.symbol()).collect::<Vec<_>>(),
        "Instruments resolved"
    );

    let gateway: Arc<dyn ExecutionGateway> = if cfg.dry_run {
        Arc::new(DryRunGateway)
    } else {
        Arc::new(LiveGateway::new(client.clone()).context("Failed to start live gateway")?)
    };

    let source: Arc<dyn MarketDataSource> = Arc::new(client);
    let mut feed = MarketFeed::new(source, cfg.poll_interval() * 2);

    let events = if cfg.use_websocket {
        let base = if cfg.sandbox {
            BINANCE_TESTNET_WS_BASE
        } else {
            BINANCE_WS_BASE
        };
        Some(feed.subscribe(StreamConfig {
            url: stream_url(base, &instruments, cfg.timeframe),
            instruments: instruments.clone(),
            reconnect_delay: cfg.reconnect_delay(),
        }))
    } else {
        tracing::info!("Push stream disabled, polling REST");
        None
    };

    let mut bot = ControlLoop::new(&cfg, instruments, markets, feed, gateway, Utc::now());
    if let Some(rx) = events {
        bot = bot.with_feed_events(rx);
    }
    bot.preload_history().await;

    if args.once {
        bot.tick(Utc::now()).await;
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });
        bot.run(shutdown_rx).await;
    }

    bot.shutdown_feed().await;
    tracing::info!(pid = std::process::id(), "SHUTDOWN");
    Ok(())
}

/// Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
