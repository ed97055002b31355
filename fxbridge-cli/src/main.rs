use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fxbridge_config::{load_config, AppConfig};
use fxbridge_core::{Instruction, Login};
use fxbridge_dispatch::spawn_dispatcher;
use fxbridge_session::{
    spawn_sampler, start_session, AccountRegistry, SessionHandle, SessionSettings,
};
use fxbridge_sim::SimBroker;
use fxbridge_store::{
    keys, HistoryStore, InstructionStore, MemoryCache, ProjectionCache, ProjectionWriter,
    SqliteHistoryStore, SqliteInstructionStore,
};
use fxbridge_telemetry::{init_tracing, BridgeMetrics};
use rust_decimal::Decimal;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about = "Account session and instruction execution engine")]
struct Cli {
    /// Configuration environment, resolved as `config/{env}.toml`
    #[arg(long)]
    env: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine with the configured accounts on the simulated broker
    Run,
    /// Exercise the full pipeline against one scripted demo account
    Demo {
        #[arg(long, default_value_t = 501)]
        login: Login,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.env.as_deref())?;
    init_tracing(&config.log_level, None)?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Demo { login } => demo(config, login).await,
    }
}

fn session_settings(config: &AppConfig) -> SessionSettings {
    SessionSettings {
        reconnect_interval: Duration::from_secs(3),
        command_timeout: Duration::from_millis(config.dispatch.command_timeout_ms),
        risk: config.risk.clone(),
    }
}

async fn run(config: AppConfig) -> Result<()> {
    for path in [&config.store.history_path, &config.store.instructions_path] {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create data directory {dir:?}"))?;
        }
    }
    let cache = Arc::new(MemoryCache::new());
    let history: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::new(
        &config.store.history_path,
    )?);
    let instructions: Arc<dyn InstructionStore> = Arc::new(SqliteInstructionStore::new(
        &config.store.instructions_path,
    )?);
    let registry = Arc::new(AccountRegistry::new());
    let metrics = Arc::new(BridgeMetrics::new());
    let ttl = Duration::from_millis(config.cache.ttl_ms);
    let settings = session_settings(&config);

    for account in &config.accounts {
        let broker = SimBroker::new(account.login);
        let projection = Arc::new(ProjectionWriter::new(
            Arc::clone(&cache) as Arc<dyn ProjectionCache>,
            account.login,
            ttl,
        ));
        let handle = Arc::new(
            SessionHandle::new(
                account.login,
                account.server.clone(),
                account.master,
                Arc::new(broker.clone()),
                Arc::new(broker),
                projection,
            )
            .with_risk_flags(account.manage_stop_loss, account.average_losing_positions),
        );
        start_session(&registry, handle, Arc::clone(&history), settings.clone());
    }

    spawn_dispatcher(
        Arc::clone(&registry),
        Arc::clone(&instructions),
        config.dispatch.clone(),
    );
    spawn_sampler(
        Arc::clone(&registry),
        metrics,
        Duration::from_millis(config.metrics.sample_interval_ms),
    );
    info!(accounts = config.accounts.len(), "engine running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for handle in registry.handles() {
        registry.deregister(handle.login).await;
    }
    Ok(())
}

/// One scripted account end to end: connect, tick, queue an instruction,
/// then show what the projection and the queue recorded.
async fn demo(config: AppConfig, login: Login) -> Result<()> {
    let cache = Arc::new(MemoryCache::new());
    let history: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::new_in_memory()?);
    let instructions = Arc::new(SqliteInstructionStore::new_in_memory()?);
    let registry = Arc::new(AccountRegistry::new());

    let broker = SimBroker::new(login);
    broker.set_quote(
        "EURUSD",
        Decimal::new(11000, 4),
        Decimal::new(11002, 4),
    );
    let projection = Arc::new(ProjectionWriter::new(
        Arc::clone(&cache) as Arc<dyn ProjectionCache>,
        login,
        Duration::from_millis(config.cache.ttl_ms),
    ));
    let handle = Arc::new(SessionHandle::new(
        login,
        "Sim-Live".to_string(),
        true,
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        projection,
    ));
    start_session(&registry, handle, history, session_settings(&config));
    spawn_dispatcher(
        Arc::clone(&registry),
        Arc::clone(&instructions) as Arc<dyn InstructionStore>,
        config.dispatch.clone(),
    );

    let mut open = Instruction::new(login, "Open");
    open.symbol = "EURUSD".to_string();
    open.order_type = "BUY".to_string();
    open.volume = Decimal::new(10, 2);
    open.stop_loss = Decimal::new(20, 0);
    open.take_profit = Decimal::new(40, 0);
    let id = instructions.enqueue(&open)?;
    info!(id, login, "demo instruction queued");

    tokio::time::sleep(Duration::from_secs(2)).await;

    println!("account record: {:?}", cache.get(&keys::account(login))?);
    for ticket in cache.set_members(&keys::orders_set(login))? {
        println!("order record:   {:?}", cache.get(&keys::order(ticket))?);
    }
    match instructions.outcome(id)? {
        Some((ticket, error)) => println!("instruction outcome: ticket={ticket:?} error={error:?}"),
        None => println!("instruction still pending"),
    }

    registry.deregister(login).await;
    Ok(())
}
