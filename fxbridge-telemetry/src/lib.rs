//! Tracing installation and per-account Prometheus gauges.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use fxbridge_core::{AccountInfo, Login};
use prometheus::{GaugeVec, Opts, Registry};
use rust_decimal::prelude::ToPrimitive;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber with optional JSON file logging.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    if let Some(path) = log_path {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::new(filter));
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {dir:?}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let _ = FILE_GUARD.set(guard);
        let file_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_writer(writer)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .try_init()?;
    } else {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .try_init()?;
    }

    Ok(())
}

/// Per-account financial gauges sampled on a fixed cadence.
pub struct BridgeMetrics {
    registry: Registry,
    equity: GaugeVec,
    balance: GaugeVec,
    margin: GaugeVec,
    open_orders: GaugeVec,
    connected: GaugeVec,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let equity = GaugeVec::new(
            Opts::new("fxbridge_equity", "Account equity"),
            &["login"],
        )
        .unwrap();
        let balance = GaugeVec::new(
            Opts::new("fxbridge_balance", "Account balance"),
            &["login"],
        )
        .unwrap();
        let margin = GaugeVec::new(
            Opts::new("fxbridge_margin", "Margin currently in use"),
            &["login"],
        )
        .unwrap();
        let open_orders = GaugeVec::new(
            Opts::new("fxbridge_open_orders", "Open positions and pending orders"),
            &["login"],
        )
        .unwrap();
        let connected = GaugeVec::new(
            Opts::new(
                "fxbridge_connected",
                "Session connection status (1=connected, 0=disconnected)",
            ),
            &["login"],
        )
        .unwrap();

        registry.register(Box::new(equity.clone())).unwrap();
        registry.register(Box::new(balance.clone())).unwrap();
        registry.register(Box::new(margin.clone())).unwrap();
        registry.register(Box::new(open_orders.clone())).unwrap();
        registry.register(Box::new(connected.clone())).unwrap();

        Self {
            registry,
            equity,
            balance,
            margin,
            open_orders,
            connected,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Record one account sample.
    pub fn record(&self, info: &AccountInfo, open_orders: usize) {
        let login = info.login.to_string();
        self.equity
            .with_label_values(&[&login])
            .set(info.equity.to_f64().unwrap_or_default());
        self.balance
            .with_label_values(&[&login])
            .set(info.balance.to_f64().unwrap_or_default());
        self.margin
            .with_label_values(&[&login])
            .set(info.margin.to_f64().unwrap_or_default());
        self.open_orders
            .with_label_values(&[&login])
            .set(open_orders as f64);
        self.connected
            .with_label_values(&[&login])
            .set(if info.connected { 1.0 } else { 0.0 });
    }

    /// Drop every series for a deregistered account.
    pub fn forget(&self, login: Login) {
        let login = login.to_string();
        for gauge in [
            &self.equity,
            &self.balance,
            &self.margin,
            &self.open_orders,
            &self.connected,
        ] {
            let _ = gauge.remove_label_values(&[&login]);
        }
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn account(login: Login) -> AccountInfo {
        AccountInfo {
            connected: true,
            master: true,
            login,
            trade_mode: 0,
            leverage: 100,
            limit_orders: 50,
            balance: dec!(1000),
            credit: Decimal::ZERO,
            profit: Decimal::ZERO,
            equity: dec!(1010.50),
            margin: dec!(25),
            margin_free: dec!(985.50),
            currency: "USD".into(),
            server: "Demo".into(),
            account_name: "test".into(),
        }
    }

    #[test]
    fn record_and_forget_series() {
        let metrics = BridgeMetrics::new();
        metrics.record(&account(501), 3);
        metrics.record(&account(502), 0);

        let families = metrics.registry().gather();
        let equity = families
            .iter()
            .find(|f| f.get_name() == "fxbridge_equity")
            .unwrap();
        assert_eq!(equity.get_metric().len(), 2);

        metrics.forget(502);
        let families = metrics.registry().gather();
        let equity = families
            .iter()
            .find(|f| f.get_name() == "fxbridge_equity")
            .unwrap();
        assert_eq!(equity.get_metric().len(), 1);
    }
}
