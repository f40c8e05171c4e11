//! UpDown Arb - Main Entry Point
//!
//! Paper trading against the mirrored book by default; `--live` sends real
//! orders.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use updown_arb::config::Config;
use updown_arb::engine::{Engine, SettlementTracker};
use updown_arb::exchange::{MarketFeed, MockVenue, OrderGateway, PolymarketClient};
use updown_arb::market::QuoteBook;
use updown_arb::notify::{spawn_log_consumer, EventSink};
use updown_arb::persistence::{LedgerStore, SqliteStore};

/// UpDown Arb CLI
#[derive(Parser)]
#[command(name = "updown-arb")]
#[command(version, about = "Market-neutral arbitrage on Polymarket Up/Down markets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading engine (default)
    Run {
        /// Send real orders instead of paper trading
        #[arg(long)]
        live: bool,
    },

    /// Show persisted positions and settlements
    Status {
        /// Path to SQLite database (default: engine.db_path from config)
        #[arg(short, long)]
        db: Option<String>,
    },
}

/// Trading mode: Live (real money) or Paper (mock venue).
#[derive(Debug, Clone, Copy, PartialEq)]
enum TradingMode {
    Live,
    Paper,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;

    let live = match cli.command {
        Some(Commands::Status { db }) => {
            return show_status(db.as_deref().unwrap_or(&config.engine.db_path));
        }
        Some(Commands::Run { live }) => live,
        None => false,
    };

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            UpDown Arb v{} - Cohort Arbitrage              ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let trading_mode = if live {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
        TradingMode::Live
    } else {
        info!("📝 PAPER TRADING MODE - Orders fill against the mirrored book");
        TradingMode::Paper
    };
    log_config(&config);

    let client = Arc::new(PolymarketClient::new(&config.polymarket)?);
    let book = Arc::new(QuoteBook::new(chrono::Duration::seconds(config.feed.quote_ttl_secs)));

    // Ledger state survives restarts in both modes
    let store = SqliteStore::new(&config.engine.db_path)?;
    let persisted = store.load().context("Failed to load persisted ledger")?;
    info!(
        live = persisted.live.len(),
        awaiting = persisted.awaiting.len(),
        settlements = persisted.settlements.len(),
        last_saved = ?persisted.last_saved,
        "📂 [PERSISTENCE] Ledger restored"
    );
    let paper_balance = persisted.paper_balance.unwrap_or(config.engine.paper_balance);
    let ledger = persisted.into_ledger();

    let (gateway, paper): (Arc<dyn OrderGateway>, Option<Arc<MockVenue>>) = match trading_mode {
        TradingMode::Live => {
            config.validate_live()?;
            client
                .health_check()
                .await
                .context("Trading API unreachable, refusing to start live")?;
            info!("✅ [INIT] Trading API reachable");
            (client.clone() as Arc<dyn OrderGateway>, None)
        }
        TradingMode::Paper => {
            info!(balance = %paper_balance, "📝 [INIT] Paper venue ready");
            let venue = Arc::new(MockVenue::new(book.clone(), paper_balance));
            (venue.clone() as Arc<dyn OrderGateway>, Some(venue))
        }
    };

    let (feed, feed_handle) = MarketFeed::new(&config.polymarket.ws_url, &config.feed, book.clone());
    tokio::spawn(feed.run());

    let (tracker, settlement) = SettlementTracker::new(client.clone(), config.engine.settlement_poll_secs);
    tracker.spawn();

    let (events, events_rx) = EventSink::channel(1024);
    spawn_log_consumer(events_rx);

    let mut engine = Engine::new(config, client, gateway, book, ledger, events, settlement)
        .with_feed(feed_handle)
        .with_store(Box::new(store));
    if let Some(venue) = paper {
        engine = engine.with_paper_venue(venue);
    }

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    engine.run(shutdown).await;

    info!("👋 UpDown Arb shutdown complete");
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "updown-arb.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("updown_arb=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let pct = Decimal::ONE_HUNDRED;
    info!("📋 Configuration:");
    info!("   Assets: {}", config.markets.assets.join(", "));
    info!(
        "   Cohorts: {}",
        config
            .markets
            .cohorts
            .iter()
            .map(|c| c.key())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("   Arbitrage Threshold: {}", config.scanner.arbitrage_threshold);
    info!("   Min Profit: {}%", config.scanner.min_profit_pct);
    info!("   Depth Utilization: {:.0}%", config.scanner.depth_utilization * pct);
    info!(
        "   Order Notional: ${} - ${}",
        config.execution.min_order_notional, config.execution.max_order_notional
    );
    info!(
        "   Risk: {} mode, last {}s, cost < {}, ratio >= {:.0}%",
        config.risk.mode,
        config.risk.window_secs,
        config.risk.cost_threshold,
        config.risk.trigger_ratio * pct
    );
    info!(
        "   Hedge: {} (max price {})",
        if config.hedge.enabled { "enabled" } else { "disabled" },
        config.hedge.max_price
    );
    info!("   Tick: {}ms, DB: {}", config.engine.tick_ms, config.engine.db_path);
}

/// Print persisted positions and settlement history.
fn show_status(db_path: &str) -> Result<()> {
    use std::path::Path;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              UPDOWN ARB STATUS                             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The engine has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = SqliteStore::new(db_path)?;
    let state = match store.load() {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Failed to read persisted state");
            return Err(e);
        }
    };

    let realized: Decimal = state.settlements.iter().map(|s| s.profit).sum();
    let wins = state.settlements.iter().filter(|s| s.profit >= Decimal::ZERO).count();

    println!("\n📊 Summary");
    if let Some(balance) = state.paper_balance {
        println!("   ├─ Paper Balance:    ${:.2}", balance);
    }
    println!("   ├─ Realized PnL:     ${:.4}", realized);
    println!("   ├─ Settlements:      {} ({} profitable)", state.settlements.len(), wins);
    println!("   ├─ Live Positions:   {}", state.live.len());
    println!("   ├─ Awaiting Outcome: {}", state.awaiting.len());
    match state.last_saved {
        Some(at) => println!("   └─ Last Updated:     {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("   └─ Last Updated:     never"),
    }

    let open: Vec<_> = state
        .live
        .iter()
        .map(|p| (p, "live"))
        .chain(state.awaiting.iter().map(|p| (p, "awaiting")))
        .collect();
    if !open.is_empty() {
        println!("\n🔓 Open Positions");
        for (pos, kind) in &open {
            let expires_in = pos.expiry - Utc::now();
            println!("   ┌─ {} [{}, {}]", pos.label, pos.cohort, kind);
            println!("   ├─ Up:   {} for ${:.2}", pos.up_shares, pos.up_cost);
            println!("   ├─ Down: {} for ${:.2}", pos.down_shares, pos.down_cost);
            println!("   ├─ Imbalance: {}", pos.imbalance());
            println!("   └─ Expiry: {} ({}m)", pos.expiry.format("%Y-%m-%d %H:%M UTC"), expires_in.num_minutes());
        }
    }

    if !state.settlements.is_empty() {
        println!("\n🏁 Recent Settlements");
        for record in state.settlements.iter().rev().take(10) {
            let status = if record.profit >= Decimal::ZERO { "✅" } else { "⚠️" };
            println!(
                "   {} {} | {} won | payout ${:.2} | cost ${:.2} | PnL ${:.4}",
                status, record.label, record.outcome, record.payout, record.total_cost, record.profit
            );
        }
    }

    println!();
    Ok(())
}
