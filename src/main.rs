//! Delta Pair Bot - Main Entry Point
//!
//! Runs one delta-neutral session across two venues until interrupted.

use anyhow::Result;
use clap::{Parser, Subcommand};
use delta_pair_bot::bot::BotController;
use delta_pair_bot::config::Config;
use delta_pair_bot::exchange::{
    AdapterPair, BitmexClient, BybitClient, ExchangeAdapter, Venue,
};
use delta_pair_bot::persistence::Store;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Delta Pair Bot CLI
#[derive(Parser)]
#[command(name = "delta-pair-bot")]
#[command(version, about = "Delta-neutral long/short pair across Bybit and BitMEX")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a trading session until interrupted
    Run,

    /// Show the active session, its legs and recent events
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Status => show_status(&config),
    }
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("delta_pair_bot=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║          Delta Pair Bot v{}                             ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config);

    if config.bybit.testnet || config.bitmex.testnet {
        warn!("⚠️  Testnet credentials in use on at least one venue");
    }

    let store = Arc::new(Store::new(&config.db_path)?);
    let long = build_adapter(&config, config.venues.long)?;
    let short = build_adapter(&config, config.venues.short)?;
    let adapters = AdapterPair::new(long, short);

    let controller = BotController::new(config, store, adapters);
    let session_id = controller.start().await?;
    info!("🚀 Session {} running, press Ctrl-C to stop", session_id);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
        _ = controller.wait_for_shutdown() => {
            warn!("🛑 Session requested its own shutdown");
        }
    }

    if let Some(report) = controller.stop().await? {
        info!(
            "✅ Session stopped: {} legs closed, {} failed, realized PnL ${:.4}",
            report.closed_count(),
            report.failed_count(),
            report.realized_pnl
        );
        if !report.is_complete() {
            warn!("⚠️  Some legs are still open and need manual attention");
        }
    }
    Ok(())
}

/// Log non-sensitive configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Legs: long on {}, short on {}",
        config.venues.long, config.venues.short
    );
    info!(
        "   Trade: {} | ${:.2} capital | {}x leverage",
        config.trade.base_asset, config.trade.capital_usdt, config.trade.leverage
    );
    info!(
        "   Risk: close at level {} | check every {}s | cooldown {}s",
        config.monitor.max_risk_level,
        config.monitor.check_interval_secs,
        config.monitor.cooldown_secs
    );
    info!(
        "   Margin: balance at {}% imbalance every {}h",
        config.margin.threshold_pct, config.margin.interval_hours
    );
}

fn build_adapter(config: &Config, venue: Venue) -> Result<Arc<dyn ExchangeAdapter>> {
    let credentials = config.credentials_for(venue);
    anyhow::ensure!(
        !credentials.api_key.is_empty() && !credentials.api_secret.is_empty(),
        "missing API credentials for {venue}"
    );

    // Each venue needs the other's deposit address to route withdrawals.
    let mut deposit_addresses = HashMap::new();
    for v in [Venue::Bybit, Venue::Bitmex] {
        let address = &config.credentials_for(v).deposit_address;
        if !address.is_empty() {
            deposit_addresses.insert(v, address.clone());
        }
    }

    Ok(match venue {
        Venue::Bybit => Arc::new(BybitClient::new(credentials, deposit_addresses)?),
        Venue::Bitmex => Arc::new(BitmexClient::new(credentials, deposit_addresses)?),
    })
}

/// Show the active session from the persisted state.
fn show_status(config: &Config) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              DELTA PAIR BOT STATUS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !std::path::Path::new(&config.db_path).exists() {
        println!("\n❌ Database not found: {}", config.db_path);
        println!("   The bot has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = Store::new(&config.db_path)?;
    let Some(session) = store.find_active_session(&config.user_id)? else {
        println!("\nNo active session for user '{}'", config.user_id);
        return Ok(());
    };

    println!("\n📊 Session {}", session.session_id);
    println!("   ├─ Status:        {}", session.status);
    println!(
        "   ├─ Pair:          long {} / short {} ({})",
        session.venue_long, session.venue_short, session.base_asset
    );
    println!(
        "   ├─ Started:       {}",
        session.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "   ├─ Last activity: {}",
        session.last_activity_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("   └─ Realized PnL:  ${:.4}", session.total_pnl);

    let legs = store.get_open_legs(&session.session_id)?;
    if legs.is_empty() {
        println!("\nNo open legs.");
    } else {
        println!("\n📈 Open Legs");
        for leg in &legs {
            let marker = if leg.risk_level >= dec!(80) { "⚠️" } else { "✅" };
            println!(
                "   {} {:7} {:5} {} | size {} @ ${} | margin ${:.2} | risk {}",
                marker,
                leg.venue.to_string(),
                leg.side.to_string(),
                leg.symbol,
                leg.size,
                leg.mark_price,
                leg.margin,
                leg.risk_level
            );
        }
    }

    let events = store.recent_risk_events(&session.session_id, 10)?;
    if !events.is_empty() {
        println!("\n🗒  Recent Events");
        for event in &events {
            println!(
                "   {} [{}] {} {}",
                event.created_at.format("%m-%d %H:%M:%S"),
                event.severity,
                event.event_type,
                event.payload
            );
        }
    }

    Ok(())
}
