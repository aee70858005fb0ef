//! copyrelay: replicates master trading orders onto follower accounts.
//!
//! The outer platform (auth, billing, HTTP API) lives elsewhere; this
//! binary assembles the replication core, runs it as a service, and offers
//! operational subcommands for provisioning accounts, links and
//! instruments, and for driving a fan-out by hand.

mod api;
mod config;
mod db;
mod events;
mod instruments;
mod metrics;
mod models;
mod session;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::iifl::IiflClient;
use crate::api::mock::MockBroker;
use crate::api::BrokerAdapter;
use crate::config::Config;
use crate::db::{AccountRecord, Database, StatusUpdate};
use crate::events::{EngineEvent, Topic};
use crate::models::{
    CopyPolicy, Exchange, FollowerLink, InstrumentCode, OrderDraft, OrderKind, OrderSide,
    OrderStatus, ProductKind, Validity,
};
use crate::session::{BrokerCredentials, CredentialVault};
use crate::trading::Engine;

/// Copy trading replication engine.
#[derive(Parser)]
#[command(name = "copyrelay")]
#[command(about = "Replicate master orders to follower accounts", long_about = None)]
struct Cli {
    /// Use the in-memory broker simulator instead of the live API
    #[arg(long)]
    simulate: bool,

    /// Log filter, e.g. "info" or "copyrelay=debug" (overrides LOG_LEVEL)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and the reconciler until interrupted
    Run,

    /// Place a master order and fan it out (stands in for the front door)
    Place {
        /// Master account placing the order
        #[arg(long)]
        account: String,

        #[arg(long)]
        symbol: String,

        /// BUY or SELL
        #[arg(long, default_value = "BUY")]
        side: String,

        #[arg(long)]
        quantity: i64,

        /// Limit price; omit for a market order
        #[arg(long)]
        price: Option<f64>,

        #[arg(long, default_value = "NSE")]
        exchange: String,
    },

    /// Create, update or deactivate a follower link
    Link {
        #[arg(long)]
        master: String,

        #[arg(long)]
        follower: String,

        /// fixed_ratio, percentage or fixed_quantity
        #[arg(long, default_value = "fixed_ratio")]
        strategy: String,

        #[arg(long)]
        ratio: Option<f64>,

        #[arg(long)]
        percent: Option<f64>,

        #[arg(long)]
        quantity: Option<i64>,

        #[arg(long)]
        max_order_notional: Option<f64>,

        #[arg(long)]
        max_daily_loss: Option<f64>,

        #[arg(long)]
        deactivate: bool,
    },

    /// Seal broker credentials into an account record
    Account {
        #[arg(long)]
        account_id: String,

        #[arg(long)]
        user_id: String,

        #[arg(long)]
        password: String,

        #[arg(long)]
        api_key: String,

        #[arg(long, default_value = "copyrelay")]
        app_name: String,

        #[arg(long, default_value = "1.0.0")]
        app_version: String,

        #[arg(long)]
        public_ip: String,

        #[arg(long, default_value = "100000")]
        balance: f64,
    },

    /// Import instrument codes from a CSV: symbol,exchange,segment,scrip_code,lot_size
    Instruments {
        #[arg(long)]
        import: PathBuf,
    },

    /// Show the effective configuration
    Config,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let filter = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    let workers = (cpus * config.replication.worker_pool_multiplier).max(2);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(run(cli, config))
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    if let Commands::Config = cli.command {
        print_config(&config);
        return Ok(());
    }

    let db = Database::connect(&config.database_url).await?;
    let vault_key = config
        .vault_key_b64
        .as_deref()
        .context("VAULT_KEY required for this command")?;
    let vault = Arc::new(CredentialVault::new(
        db.clone(),
        vault_key,
        config.replication.session_refresh_guard(),
    )?);

    let broker: Arc<dyn BrokerAdapter> = if cli.simulate {
        info!("using the in-memory broker simulator");
        Arc::new(MockBroker::with_latency(Duration::from_millis(100)))
    } else {
        Arc::new(IiflClient::new(&config.broker_base_url, vault.clone())?)
    };

    match cli.command {
        Commands::Run => {
            let engine = Engine::assemble(db, vault, broker, config.replication.clone());
            let reconciler = engine.reconciler.clone().run(engine.shutdown_signal());
            let reconciler = tokio::spawn(reconciler);

            info!(
                broker = %config.broker_base_url,
                sandbox = config.broker_sandbox,
                "engine running; waiting for orders"
            );
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            engine.shutdown();
            let _ = reconciler.await;
        }

        Commands::Place {
            account,
            symbol,
            side,
            quantity,
            price,
            exchange,
        } => {
            let engine = Engine::assemble(db.clone(), vault, broker, config.replication.clone());
            let side = OrderSide::parse(&side).context("side must be BUY or SELL")?;
            let exchange = Exchange::parse(&exchange).context("unknown exchange")?;
            let limit_price = price
                .map(|p| Decimal::try_from(p).context("bad price"))
                .transpose()?;

            let draft = OrderDraft {
                owner: account,
                strategy_id: None,
                parent_id: None,
                side,
                kind: if limit_price.is_some() {
                    OrderKind::Limit
                } else {
                    OrderKind::Market
                },
                symbol: symbol.to_uppercase(),
                exchange,
                quantity,
                limit_price,
                trigger_price: None,
                product: ProductKind::Intraday,
                validity: Validity::Day,
            };
            let order = db.create_order(&draft).await?;
            // The front door would have placed the master's own order with
            // the broker; the engine only needs it in a replicable state.
            db.append_status(order.id, StatusUpdate::to(OrderStatus::Submitted))
                .await?;

            let mut events = engine.events.subscribe(Topic::Replication);
            let handle = engine.ingress.accept(order.id);
            println!("master order {} accepted", order.id);

            handle.await?;
            while let Ok(event) = events.try_recv() {
                if let EngineEvent::ReplicationSealed {
                    total,
                    dispatched,
                    pending_reconciliation,
                    p50_ms,
                    p95_ms,
                    ..
                } = event
                {
                    println!("{dispatched} of {total} replicated, {pending_reconciliation} pending reconciliation");
                    if let (Some(p50), Some(p95)) = (p50_ms, p95_ms) {
                        println!("latency p50 {p50:.0} ms, p95 {p95:.0} ms");
                    }
                }
            }

            for child in db.list_by_parent(order.id).await? {
                println!(
                    "  {:<12} {:<18} qty {:>6}  {}",
                    child.owner,
                    child.status.as_str(),
                    child.quantity,
                    child.message.unwrap_or_default()
                );
            }
        }

        Commands::Link {
            master,
            follower,
            strategy,
            ratio,
            percent,
            quantity,
            max_order_notional,
            max_daily_loss,
            deactivate,
        } => {
            let policy = match strategy.to_lowercase().as_str() {
                "fixed_ratio" => CopyPolicy::FixedRatio {
                    ratio: decimal_arg(ratio, 1.0)?,
                },
                "percentage" => CopyPolicy::Percentage {
                    percent: decimal_arg(percent, 10.0)?,
                },
                "fixed_quantity" => CopyPolicy::FixedQuantity {
                    quantity: quantity.unwrap_or(1),
                },
                other => bail!("unknown strategy {other}"),
            };
            policy
                .validate()
                .map_err(|e| anyhow::anyhow!("invalid policy: {e}"))?;

            let link = FollowerLink {
                master: master.clone(),
                follower: follower.clone(),
                policy,
                max_order_notional: max_order_notional
                    .map(|v| Decimal::try_from(v).context("bad notional"))
                    .transpose()?,
                max_daily_loss: max_daily_loss
                    .map(|v| Decimal::try_from(v).context("bad daily loss"))
                    .transpose()?,
                active: !deactivate,
                created_at: chrono::Utc::now(),
            };
            db.save_link(&link).await?;
            println!(
                "{} link {} -> {} ({})",
                if deactivate { "deactivated" } else { "saved" },
                master,
                follower,
                link.policy.kind_str()
            );
        }

        Commands::Account {
            account_id,
            user_id,
            password,
            api_key,
            app_name,
            app_version,
            public_ip,
            balance,
        } => {
            let sealed = vault.seal(&BrokerCredentials {
                client_code: account_id.clone(),
                user_id,
                password,
                api_key,
                app_name,
                app_version,
                public_ip,
            })?;
            db.save_account(&AccountRecord {
                account_id: account_id.clone(),
                sealed_credentials: sealed,
                balance: Decimal::try_from(balance).context("bad balance")?,
                max_daily_loss: None,
                max_drawdown_pct: None,
                max_position_notional: None,
                max_open_positions: None,
                max_exposure: None,
            })
            .await?;
            println!("account {account_id} provisioned");
        }

        Commands::Instruments { import } => {
            let text = std::fs::read_to_string(&import)
                .with_context(|| format!("cannot read {}", import.display()))?;
            let mut imported = 0usize;
            for line in text.lines().map(str::trim) {
                if line.is_empty() || line.starts_with('#') || line.starts_with("symbol") {
                    continue;
                }
                let fields: Vec<&str> = line.split(',').map(str::trim).collect();
                if fields.len() < 5 {
                    bail!("bad instrument row: {line}");
                }
                let exchange =
                    Exchange::parse(fields[1]).with_context(|| format!("bad exchange in {line}"))?;
                db.save_instrument(&InstrumentCode {
                    symbol: fields[0].to_uppercase(),
                    exchange,
                    segment: fields[2].to_string(),
                    scrip_code: fields[3].parse().with_context(|| format!("bad code in {line}"))?,
                    lot_size: fields[4]
                        .parse()
                        .with_context(|| format!("bad lot size in {line}"))?,
                    active: true,
                    updated_at: chrono::Utc::now(),
                })
                .await?;
                imported += 1;
            }
            println!("imported {imported} instruments");
        }

        Commands::Config => unreachable!("handled above"),
    }

    Ok(())
}

fn decimal_arg(value: Option<f64>, default: f64) -> Result<Decimal> {
    Decimal::try_from(value.unwrap_or(default)).context("bad decimal argument")
}

fn print_config(config: &Config) {
    let r = &config.replication;
    println!("\n=== copyrelay configuration ===\n");
    println!("database_url:                {}", config.database_url);
    println!("broker_base_url:             {}", config.broker_base_url);
    println!("broker_sandbox:              {}", config.broker_sandbox);
    println!("log_level:                   {}", config.log_level);
    println!();
    println!("max_in_flight_broker_calls:  {}", r.max_in_flight_broker_calls);
    println!("dispatch_timeout_ms:         {}", r.dispatch_timeout_ms);
    println!("max_retries:                 {}", r.max_retries);
    println!(
        "retry backoff:               base {} ms, cap {} ms, jitter {}%",
        r.retry_base_ms, r.retry_cap_ms, r.retry_jitter_pct
    );
    println!("follower_snapshot_ttl_ms:    {}", r.follower_snapshot_ttl_ms);
    println!("worker_pool_multiplier:      {}", r.worker_pool_multiplier);
    println!("session_refresh_guard_ms:    {}", r.session_refresh_guard_ms);
    println!("reconcile_interval_ms:       {}", r.reconcile_interval_ms);
    println!("reconcile_max_attempts:      {}", r.reconcile_max_attempts);
}
