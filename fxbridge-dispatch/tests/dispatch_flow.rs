use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use fxbridge_broker::{GatewayError, QuoteSession};
use fxbridge_config::DispatchConfig;
use fxbridge_core::{Instruction, OrderKind, OrderSnapshot, Ticket};
use fxbridge_dispatch::spawn_dispatcher;
use fxbridge_session::{AccountRegistry, SessionHandle};
use fxbridge_sim::SimBroker;
use fxbridge_store::{
    InstructionStore, MemoryCache, ProjectionCache, ProjectionWriter, SqliteInstructionStore,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const LOGIN: u32 = 501;

fn fast_config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.poll_interval_ms = 50;
    config
}

struct Rig {
    broker: SimBroker,
    store: Arc<SqliteInstructionStore>,
}

async fn start() -> Rig {
    let broker = SimBroker::new(LOGIN);
    broker.connect().await.unwrap();
    broker.set_quote("EURUSD", dec!(1.1000), dec!(1.1002));

    let cache = Arc::new(MemoryCache::new());
    let registry = Arc::new(AccountRegistry::new());
    let store = Arc::new(SqliteInstructionStore::new_in_memory().unwrap());

    let projection = Arc::new(ProjectionWriter::new(
        cache as Arc<dyn ProjectionCache>,
        LOGIN,
        Duration::from_secs(60),
    ));
    registry.register(Arc::new(SessionHandle::new(
        LOGIN,
        "Sim-Live".into(),
        true,
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        projection,
    )));
    spawn_dispatcher(
        Arc::clone(&registry),
        Arc::clone(&store) as Arc<dyn InstructionStore>,
        fast_config(),
    );

    Rig { broker, store }
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(5)).await;
}

fn open_instruction(symbol: &str) -> Instruction {
    let mut ins = Instruction::new(LOGIN, "Open");
    ins.symbol = symbol.into();
    ins.order_type = "BUY".into();
    ins.volume = dec!(0.10);
    ins.stop_loss = dec!(20);
    ins.take_profit = dec!(40);
    ins
}

fn market_order(ticket: Ticket, symbol: &str, kind: OrderKind) -> OrderSnapshot {
    let t = NaiveDate::from_ymd_opt(2024, 5, 10)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap();
    OrderSnapshot {
        ticket,
        kind,
        symbol: symbol.into(),
        open_time: t,
        close_time: t,
        open_price: dec!(1.1000),
        close_price: dec!(1.1000),
        stop_loss: Decimal::ZERO,
        take_profit: Decimal::ZERO,
        commission: Decimal::ZERO,
        swap: Decimal::ZERO,
        volume: dec!(0.10),
        profit: Decimal::ZERO,
        comment: String::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn open_executes_at_the_ask_and_reports_the_ticket() {
    let rig = start().await;
    let id = rig.store.enqueue(&open_instruction("EURUSD")).unwrap();
    settle().await;

    let book = rig.broker.book();
    assert_eq!(book.len(), 1);
    assert_eq!(book[0].open_price, dec!(1.1002));
    assert_eq!(book[0].stop_loss, dec!(1.0982));
    assert_eq!(book[0].take_profit, dec!(1.1042));

    let (ticket, error) = rig.store.outcome(id).unwrap().unwrap();
    assert_eq!(ticket, Some(book[0].ticket));
    assert_eq!(error, None);

    // The row is acknowledged exactly once.
    assert!(!rig.store.mark_executed(id, None, None).unwrap());
}

#[tokio::test(start_paused = true)]
async fn close_hits_only_matching_orders() {
    let rig = start().await;
    rig.broker.seed_open_order(market_order(1, "EURUSD", OrderKind::Buy));
    rig.broker.seed_open_order(market_order(2, "EURUSD", OrderKind::Buy));
    rig.broker.seed_open_order(market_order(3, "GBPUSD", OrderKind::Buy));

    let mut ins = Instruction::new(LOGIN, "Close");
    ins.symbol = "EURUSD".into();
    let id = rig.store.enqueue(&ins).unwrap();
    settle().await;

    let remaining: Vec<Ticket> = rig.broker.book().iter().map(|o| o.ticket).collect();
    assert_eq!(remaining, vec![3]);
    let (_, error) = rig.store.outcome(id).unwrap().unwrap();
    assert_eq!(error, None);

    // Nothing on USDJPY: the failure is reported, not swallowed.
    let mut ins = Instruction::new(LOGIN, "Close");
    ins.symbol = "USDJPY".into();
    let id = rig.store.enqueue(&ins).unwrap();
    settle().await;
    let (_, error) = rig.store.outcome(id).unwrap().unwrap();
    assert_eq!(error.as_deref(), Some("no matches"));
}

#[tokio::test(start_paused = true)]
async fn timed_out_submission_is_not_retried() {
    let rig = start().await;
    rig.broker.hang_next_order_calls(1);
    let id = rig.store.enqueue(&open_instruction("EURUSD")).unwrap();
    settle().await;

    // A blind retry would have landed a second call on the healthy broker.
    assert!(rig.broker.book().is_empty());
    let (_, error) = rig.store.outcome(id).unwrap().unwrap();
    assert_eq!(error.as_deref(), Some("timed out"));
}

#[tokio::test(start_paused = true)]
async fn refused_submission_is_retried() {
    let rig = start().await;
    rig.broker
        .reject_next_order_call(GatewayError::Rejected("requote".into()));
    let id = rig.store.enqueue(&open_instruction("EURUSD")).unwrap();
    settle().await;

    assert_eq!(rig.broker.book().len(), 1);
    let (_, error) = rig.store.outcome(id).unwrap().unwrap();
    assert_eq!(error, None);
}

#[tokio::test(start_paused = true)]
async fn modify_without_effect_reports_no_matches_or_changes() {
    let rig = start().await;
    rig.broker.seed_open_order(market_order(1, "EURUSD", OrderKind::Buy));

    let mut ins = Instruction::new(LOGIN, "Modify");
    ins.symbol = "EURUSD".into();
    let id = rig.store.enqueue(&ins).unwrap();
    settle().await;

    let (_, error) = rig.store.outcome(id).unwrap().unwrap();
    assert_eq!(error.as_deref(), Some("no matches or changes"));
}

#[tokio::test(start_paused = true)]
async fn modify_moves_stops_on_matching_orders() {
    let rig = start().await;
    rig.broker.seed_open_order(market_order(1, "EURUSD", OrderKind::Buy));

    let mut ins = Instruction::new(LOGIN, "Modify");
    ins.symbol = "EURUSD".into();
    ins.stop_loss = dec!(20);
    ins.take_profit = dec!(40);
    let id = rig.store.enqueue(&ins).unwrap();
    settle().await;

    let book = rig.broker.book();
    assert_eq!(book[0].stop_loss, dec!(1.0980));
    assert_eq!(book[0].take_profit, dec!(1.1040));
    let (ticket, error) = rig.store.outcome(id).unwrap().unwrap();
    assert_eq!(ticket, Some(1));
    assert_eq!(error, None);
}

#[tokio::test(start_paused = true)]
async fn unknown_action_is_rejected_with_an_error() {
    let rig = start().await;
    let ins = Instruction::new(LOGIN, "Liquidate");
    let id = rig.store.enqueue(&ins).unwrap();
    settle().await;

    let (_, error) = rig.store.outcome(id).unwrap().unwrap();
    assert_eq!(error.as_deref(), Some("unknown action 'Liquidate'"));
}

#[tokio::test(start_paused = true)]
async fn non_master_accounts_receive_nothing() {
    let broker = SimBroker::new(LOGIN);
    broker.connect().await.unwrap();
    let cache = Arc::new(MemoryCache::new());
    let registry = Arc::new(AccountRegistry::new());
    let store = Arc::new(SqliteInstructionStore::new_in_memory().unwrap());
    let projection = Arc::new(ProjectionWriter::new(
        cache as Arc<dyn ProjectionCache>,
        LOGIN,
        Duration::from_secs(60),
    ));
    registry.register(Arc::new(SessionHandle::new(
        LOGIN,
        "Sim-Live".into(),
        false,
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        projection,
    )));
    spawn_dispatcher(
        registry,
        Arc::clone(&store) as Arc<dyn InstructionStore>,
        fast_config(),
    );

    let id = store.enqueue(&open_instruction("EURUSD")).unwrap();
    settle().await;

    assert!(broker.book().is_empty());
    assert_eq!(store.outcome(id).unwrap(), None);
}
