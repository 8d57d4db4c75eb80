//! Upbit KRW scalper
//!
//! Runs the scalping engine in dry-run or live mode and offers a few
//! inspection commands for signals, strategy parameters, exchange health and
//! the position journal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use krw_scalper::api::{krw_market, ExchangeClient, GuardedExchange, UpbitClient};
use krw_scalper::db::PositionJournal;
use krw_scalper::engine::{exchange_ping, EngineConfig, TradingEngine};
use krw_scalper::resilience::{
    log_alerts, AlertDispatcher, CircuitBreakerRegistry, ExchangeRateLimiter, HealthConfig,
    HealthMonitor, RateLimiterConfig, EXCHANGE_API,
};
use krw_scalper::session::{Credentials, Session};
use krw_scalper::trading::{RiskConfig, SignalAnalyzer, StrategyTable};

/// Upbit KRW scalping engine CLI.
#[derive(Parser)]
#[command(name = "scalper")]
#[command(about = "Momentum scalping on Upbit KRW markets", long_about = None)]
struct Cli {
    /// Journal database URL
    #[arg(short, long, env = "SCALPER_DATABASE", default_value = "sqlite:./scalper.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON file with per-market strategy overrides
    #[arg(short, long, env = "SCALPER_STRATEGY")]
    strategy: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine
    Run {
        /// Session budget in KRW
        #[arg(short, long, env = "SCALPER_BUDGET")]
        budget: f64,

        /// Markets to scan (comma separated, e.g. KRW-BTC,KRW-ETH)
        #[arg(short, long, value_delimiter = ',')]
        markets: Vec<String>,

        /// Place real orders (requires UPBIT_ACCESS_KEY and UPBIT_SECRET_KEY)
        #[arg(long)]
        live: bool,

        /// Daily realized loss in KRW after which the engine stops
        #[arg(long)]
        daily_loss_limit: Option<f64>,

        /// Session id used in logs
        #[arg(long, default_value = "local")]
        user: String,
    },

    /// Score one market against its strategy parameters
    Analyze {
        /// Market or coin (KRW-BTC or BTC)
        market: String,
    },

    /// Show the strategy parameter table
    Params,

    /// Ping the exchange once and print service health
    Health,

    /// Show journaled open positions and recent closes
    Journal {
        /// Number of closes to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

fn init_logging(log_level: &str) -> Result<()> {
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(());
    }

    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn normalize_market(market: &str) -> String {
    let market = market.trim().to_uppercase();
    if market.starts_with("KRW-") {
        market
    } else {
        krw_market(&market)
    }
}

fn load_strategies(path: Option<&PathBuf>) -> Result<StrategyTable> {
    match path {
        Some(path) => StrategyTable::from_json_file(path),
        None => Ok(StrategyTable::default()),
    }
}

async fn make_breakers() -> Arc<CircuitBreakerRegistry> {
    let alerts = Arc::new(AlertDispatcher::default());
    alerts.register("log", log_alerts()).await;
    Arc::new(CircuitBreakerRegistry::with_default_services(Some(alerts)).await)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let strategies = load_strategies(cli.strategy.as_ref())?;

    match cli.command {
        Commands::Run {
            budget,
            markets,
            live,
            daily_loss_limit,
            user,
        } => {
            let budget = Decimal::try_from(budget).context("Invalid budget")?;

            let credentials = if live {
                Some(Credentials::from_env().context("Live trading needs API keys")?)
            } else {
                Credentials::from_env().ok()
            };

            let mut risk = RiskConfig::default();
            if let Some(limit) = daily_loss_limit {
                risk.daily_loss_limit =
                    Decimal::try_from(limit).context("Invalid daily loss limit")?;
            }

            let mut config = EngineConfig {
                dry_run: !live,
                ..EngineConfig::default()
            };
            if !markets.is_empty() {
                config.markets = markets.iter().map(|m| normalize_market(m)).collect();
            }

            let raw: Arc<dyn ExchangeClient> = Arc::new(UpbitClient::new(credentials.clone())?);
            let limiter = Arc::new(ExchangeRateLimiter::new(RateLimiterConfig::default()));
            let breakers = make_breakers().await;
            let exchange = Arc::new(GuardedExchange::new(
                Arc::clone(&raw),
                Arc::clone(&limiter),
                Arc::clone(&breakers),
            ));

            let alerts = Arc::new(AlertDispatcher::default());
            alerts.register("log", log_alerts()).await;
            let health = Arc::new(HealthMonitor::new(
                HealthConfig::default(),
                alerts,
                Some(Arc::clone(&breakers)),
            ));
            health
                .register(EXCHANGE_API, exchange_ping(Arc::clone(&raw), "KRW-BTC"))
                .await;

            let journal = match PositionJournal::new(&cli.database).await {
                Ok(journal) => Some(Arc::new(journal)),
                Err(e) => {
                    warn!(error = %e, "Journal unavailable, continuing without it");
                    None
                }
            };

            let session = Session::new(user, credentials, budget, risk);
            let mut engine = TradingEngine::new(session, exchange, config)
                .with_strategies(strategies)
                .with_health(health);
            if let Some(journal) = journal {
                engine = engine.with_journal(journal);
            }
            let engine = Arc::new(engine);

            println!("\n=== Upbit KRW Scalper ===");
            println!("Budget:   {} KRW", budget);
            println!("Mode:     {}", if live { "LIVE TRADING" } else { "DRY RUN (no real orders)" });
            println!("Markets:  {}", engine.config().markets.join(", "));
            println!("\nPress Ctrl+C to stop.\n");

            engine.start().await?;

            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!("\nStopping engine...");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !engine.is_running().await {
                            if let Some(report) = engine.last_emergency().await {
                                println!("\nEngine halted: {} ({})", report.reason, report);
                            }
                            break;
                        }
                        let status = engine.status().await;
                        println!(
                            "[{}] Available: {} KRW | Reserved: {} KRW | Positions: {} | Trades today: {} | Loss today: {} KRW",
                            chrono::Local::now().format("%H:%M:%S"),
                            status.available_budget.round_dp(0),
                            status.reserved_budget.round_dp(0),
                            status.positions.len(),
                            status.daily_trades,
                            status.daily_loss.round_dp(0),
                        );
                    }
                }
            }

            let held = engine.session().state.read().await.positions().count();
            if held > 0 && engine.is_running().await {
                let report = engine.emergency_stop("operator shutdown").await;
                println!("Emergency close: {}", report);
                if !report.is_complete() {
                    warn!(remaining = ?report.remaining, "Positions left open");
                }
            } else {
                engine.stop().await;
            }

            let status = engine.status().await;
            let v = &status.verification;
            println!("\n--- Session Summary ---");
            println!("Available Budget:  {} KRW", status.available_budget.round_dp(0));
            println!("Trades Today:      {}", status.daily_trades);
            println!("Loss Today:        {} KRW", status.daily_loss.round_dp(0));
            println!("Orders Verified:   {}/{}", v.verified, v.total);
            println!("Avg Slippage:      {:.3}%", v.avg_slippage_pct);
            println!("Exits:             {} ({} wins, {:.1}% win rate)", status.trades.trades, status.trades.wins, status.trades.win_rate * 100.0);
            println!("Realized P&L:      {} KRW", status.trades.total_pnl.round_dp(0));
            println!("Open Positions:    {}", status.positions.len());
        }

        Commands::Analyze { market } => {
            let market = normalize_market(&market);
            let params = strategies.get(&market);
            let client: Arc<dyn ExchangeClient> = Arc::new(UpbitClient::new(None)?);
            let analyzer = SignalAnalyzer::new(client, 1);

            info!(market = %market, "Analyzing");
            let report = analyzer.evaluate_detailed(&market, &params).await?;

            println!("\n=== Signal: {} ===", report.market);
            println!("Candles:          {}", report.candles);
            println!("Current Price:    {}", report.current_price);
            match report.volume_ratio {
                Some(ratio) => println!("Volume Ratio:     {:.2}x", ratio),
                None => println!("Volume Ratio:     n/a"),
            }
            println!("Price Change:     {:.3}%", report.price_change_pct);

            println!("\n--- Technical ({}) ---", report.technical.score);
            println!("EMA Fast:         {:.4}", report.technical.ema_fast);
            println!("EMA Slow:         {:.4}", report.technical.ema_slow);
            println!("RSI:              {:.1}", report.technical.rsi);
            println!("VWAP:             {:.4}", report.technical.vwap);

            println!("\n--- Pattern ({}) ---", report.pattern.score);
            match report.pattern.candle_position {
                Some(pos) => println!("Candle Position:  {:.2}", pos),
                None => println!("Candle Position:  n/a"),
            }

            println!("\nStrength:         {} (threshold {:.0})", report.strength, report.threshold * 100.0);
            match report.failed_gate {
                Some(gate) => println!("Result:           no entry ({:?})", gate),
                None => println!("Result:           BUY"),
            }
        }

        Commands::Params => {
            println!(
                "\n{:<12} {:>8} {:>8} {:>10} {:>10} {:>8} {:>8}",
                "MARKET", "TP %", "SL %", "HOLD MIN", "THRESHOLD", "VOL X", "CHG %"
            );
            println!("{}", "-".repeat(72));

            let mut entries = strategies.entries();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (market, p) in entries {
                println!(
                    "{:<12} {:>8} {:>8} {:>10} {:>10.2} {:>8.2} {:>8.2}",
                    market,
                    p.profit_target_pct,
                    p.stop_loss_pct,
                    p.max_hold_minutes,
                    p.mtfa_threshold,
                    p.volume_multiplier,
                    p.price_change_threshold
                );
            }

            let risk = RiskConfig::default();
            println!("\nRisk Limits:");
            println!("  Max Positions:      {}", risk.max_positions);
            println!("  Daily Loss Limit:   {} KRW", risk.daily_loss_limit);
            println!("  Coin Cooldown:      {}s", risk.coin_cooldown.as_secs());
            println!("  Max Investment:     {} KRW", risk.max_investment);
            println!("  Max Budget Share:   {}%", risk.max_budget_fraction * Decimal::from(100));
            println!("  Min Order:          {} KRW", risk.min_order_krw);
        }

        Commands::Health => {
            let client: Arc<dyn ExchangeClient> =
                Arc::new(UpbitClient::new(Credentials::from_env().ok())?);
            let breakers = make_breakers().await;
            let alerts = Arc::new(AlertDispatcher::default());
            alerts.register("log", log_alerts()).await;
            let monitor = HealthMonitor::new(HealthConfig::default(), alerts, Some(breakers));
            monitor
                .register(EXCHANGE_API, exchange_ping(client, "KRW-BTC"))
                .await;

            monitor.check(EXCHANGE_API).await;
            monitor.update_system_status().await;
            let report = monitor.report().await;

            println!("\nSystem: {}", report.system_status);
            println!("\n{:<20} {:<10} {:>10} {:>10}  {}", "SERVICE", "STATUS", "FAILURES", "LATENCY", "ERROR");
            println!("{}", "-".repeat(76));
            for s in report.services {
                println!(
                    "{:<20} {:<10} {:>10} {:>10}  {}",
                    s.service,
                    s.status.to_string(),
                    s.consecutive_failures,
                    s.last_latency_ms
                        .map(|ms| format!("{}ms", ms))
                        .unwrap_or_else(|| "-".to_string()),
                    s.last_error.unwrap_or_default()
                );
            }
        }

        Commands::Journal { limit } => {
            let journal = PositionJournal::new(&cli.database).await?;

            let open = journal.open_positions().await?;
            println!("\n--- Open Positions ({}) ---", open.len());
            if !open.is_empty() {
                println!(
                    "{:<8} {:>14} {:>18} {:>14} {:>14}  {}",
                    "COIN", "ENTRY", "AMOUNT", "TARGET", "STOP", "OPENED"
                );
                println!("{}", "-".repeat(90));
                for e in open {
                    println!(
                        "{:<8} {:>14} {:>18} {:>14} {:>14}  {}",
                        e.coin,
                        e.price,
                        e.amount,
                        e.profit_target.map(|p| p.to_string()).unwrap_or_default(),
                        e.stop_loss.map(|p| p.to_string()).unwrap_or_default(),
                        e.recorded_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }

            let closes = journal.recent_closes(limit).await?;
            println!("\n--- Recent Closes ({}) ---", closes.len());
            if !closes.is_empty() {
                println!(
                    "{:<8} {:>14} {:>18} {:>14} {:<14}  {}",
                    "COIN", "EXIT", "AMOUNT", "P&L", "REASON", "CLOSED"
                );
                println!("{}", "-".repeat(90));
                for e in closes {
                    println!(
                        "{:<8} {:>14} {:>18} {:>14} {:<14}  {}",
                        e.coin,
                        e.price,
                        e.amount,
                        e.pnl.map(|p| p.round_dp(0).to_string()).unwrap_or_default(),
                        e.reason.unwrap_or_default(),
                        e.recorded_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
    }

    Ok(())
}
