//! Cache projection of per-account session state.
//!
//! Downstream consumers read the cache only; everything here is write-side.
//! Account and order records carry a short TTL so that a crashed or
//! disconnected session makes its data vanish instead of going stale. The
//! flat account record is the one exception: it is written without a TTL and
//! paired with a separate liveness key.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fxbridge_core::{round2, AccountInfo, Login, OrderSnapshot, Ticket};
use rust_decimal::Decimal;
use tracing::warn;

use crate::{ProjectionCache, StoreResult};

/// Cache key scheme shared with the read side.
pub mod keys {
    use fxbridge_core::{Login, Ticket};

    /// Flat account record, written without a TTL.
    #[must_use]
    pub fn account(login: Login) -> String {
        format!("forex:account#{login}")
    }

    /// JSON account record, TTL-bearing.
    #[must_use]
    pub fn account_json(login: Login) -> String {
        format!("forex:accountjson#{login}")
    }

    /// Set of open-order tickets for one account.
    #[must_use]
    pub fn orders_set(login: Login) -> String {
        format!("forex:account#{login}#orders")
    }

    /// Flat open-order record.
    #[must_use]
    pub fn order(ticket: Ticket) -> String {
        format!("forex:order#{ticket}")
    }

    /// Short-lived close marker; the value is the owning login.
    #[must_use]
    pub fn deleted_order(ticket: Ticket) -> String {
        format!("forex:deleteorder#{ticket}")
    }

    /// Liveness beacon proving a session still owns its flat record.
    #[must_use]
    pub fn live(login: Login) -> String {
        format!("forex:live#{login}")
    }
}

/// Write-side owner of one account's cache projection.
pub struct ProjectionWriter {
    cache: Arc<dyn ProjectionCache>,
    login: Login,
    ttl: Duration,
    prev_equity: Mutex<Option<Decimal>>,
}

impl ProjectionWriter {
    pub fn new(cache: Arc<dyn ProjectionCache>, login: Login, ttl: Duration) -> Self {
        Self {
            cache,
            login,
            ttl,
            prev_equity: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn login(&self) -> Login {
        self.login
    }

    /// Refresh the liveness beacon.
    pub fn mark_live(&self) -> StoreResult<()> {
        self.cache.set(&keys::live(self.login), "1", Some(self.ttl))
    }

    /// Force the next [`write_account`](Self::write_account) through the
    /// equity debounce. Called on connect and when the open set drains.
    pub fn force_next(&self) {
        *self.prev_equity.lock().unwrap() = None;
    }

    /// Project the account financials; returns whether anything was written.
    ///
    /// Quote ticks arrive far faster than equity actually moves, so writes
    /// are debounced on equity alone.
    pub fn write_account(&self, info: &AccountInfo) -> StoreResult<bool> {
        let equity = round2(info.equity);
        {
            let mut prev = self.prev_equity.lock().unwrap();
            if *prev == Some(equity) {
                return Ok(false);
            }
            *prev = Some(equity);
        }
        self.cache
            .set(&keys::account(self.login), &flat_account(info), None)?;
        let json = serde_json::to_string(info)?;
        self.cache
            .set(&keys::account_json(self.login), &json, Some(self.ttl))?;
        Ok(true)
    }

    /// Rebuild the open-order projection from a full snapshot, evicting
    /// records for tickets no longer present.
    pub fn write_orders_full(&self, orders: &[OrderSnapshot]) -> StoreResult<()> {
        let set_key = keys::orders_set(self.login);
        for stale in self.cache.set_members(&set_key)? {
            if !orders.iter().any(|o| o.ticket == stale) {
                self.cache.delete(&keys::order(stale))?;
                self.cache.set_remove(&set_key, stale)?;
            }
        }
        for order in orders {
            self.write_order(order)?;
        }
        self.cache.expire(&set_key, self.ttl)?;
        Ok(())
    }

    /// Rewrite the records for a subset of the open orders (typically all
    /// orders on one symbol after a tick) without touching the rest.
    pub fn refresh_orders(&self, orders: &[OrderSnapshot]) -> StoreResult<()> {
        for order in orders {
            self.write_order(order)?;
        }
        Ok(())
    }

    fn write_order(&self, order: &OrderSnapshot) -> StoreResult<()> {
        self.cache.set(
            &keys::order(order.ticket),
            &flat_order(self.login, order),
            Some(self.ttl),
        )?;
        self.cache.set_add(&keys::orders_set(self.login), order.ticket)
    }

    /// Evict one closed order and leave a short-lived close marker so the
    /// read side can distinguish "closed" from "expired".
    pub fn delete_order(&self, ticket: Ticket) -> StoreResult<()> {
        self.cache.delete(&keys::order(ticket))?;
        self.cache.set(
            &keys::deleted_order(ticket),
            &self.login.to_string(),
            Some(self.ttl),
        )?;
        self.cache.set_remove(&keys::orders_set(self.login), ticket)
    }

    /// Keep the TTL-bearing keys alive between broker events.
    pub fn refresh_ttls(&self) -> StoreResult<()> {
        self.mark_live()?;
        self.cache.expire(&keys::account_json(self.login), self.ttl)?;
        let set_key = keys::orders_set(self.login);
        for ticket in self.cache.set_members(&set_key)? {
            self.cache.expire(&keys::order(ticket), self.ttl)?;
        }
        self.cache.expire(&set_key, self.ttl)
    }

    /// Best-effort removal of every record this writer owns. Each delete is
    /// attempted independently so one cache failure cannot strand the rest.
    pub fn teardown(&self) {
        let mut targets = vec![
            keys::account(self.login),
            keys::account_json(self.login),
            keys::live(self.login),
        ];
        let set_key = keys::orders_set(self.login);
        match self.cache.set_members(&set_key) {
            Ok(tickets) => targets.extend(tickets.into_iter().map(keys::order)),
            Err(err) => warn!(login = self.login, %err, "failed to list projected orders"),
        }
        targets.push(set_key);
        for key in targets {
            if let Err(err) = self.cache.delete(&key) {
                warn!(login = self.login, key, %err, "failed to evict cache record");
            }
        }
    }
}

/// Hash-separated account record, money fields rounded to two decimals.
fn flat_account(info: &AccountInfo) -> String {
    format!(
        "{}#{}#{}#{}#{}#{}#{}#{}#{}#{}#{}#{}#{}#{}",
        info.login,
        info.trade_mode,
        info.leverage,
        info.limit_orders,
        round2(info.balance),
        round2(info.credit),
        round2(info.profit),
        round2(info.equity),
        round2(info.margin),
        round2(info.margin_free),
        info.margin_level(),
        info.currency,
        info.server,
        info.account_name,
    )
}

/// Hash-separated open-order record. The eleventh field is reserved and
/// always empty; the read side depends on the positions staying fixed.
fn flat_order(login: Login, order: &OrderSnapshot) -> String {
    format!(
        "{}#{}#{}#{}#{}#0#{}#{}#{}#{}##{}#{}#{}#{}#{}",
        login,
        order.ticket,
        order.kind.code(),
        order.symbol,
        order.open_time.and_utc().timestamp(),
        order.open_price,
        order.close_price,
        order.stop_loss,
        order.take_profit,
        order.commission,
        order.swap,
        order.volume,
        order.profit,
        round2(order.net_profit()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use fxbridge_core::OrderKind;
    use rust_decimal_macros::dec;

    fn account() -> AccountInfo {
        AccountInfo {
            connected: true,
            master: true,
            login: 501,
            trade_mode: 0,
            leverage: 100,
            limit_orders: 50,
            balance: dec!(1000.005),
            credit: Decimal::ZERO,
            profit: dec!(12.5),
            equity: dec!(1012.505),
            margin: dec!(100),
            margin_free: dec!(912.505),
            currency: "USD".into(),
            server: "Demo-1".into(),
            account_name: "alpha".into(),
        }
    }

    fn order(ticket: Ticket) -> OrderSnapshot {
        let t = NaiveDate::from_ymd_opt(2024, 5, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        OrderSnapshot {
            ticket,
            kind: OrderKind::Buy,
            symbol: "EURUSD".into(),
            open_time: t,
            close_time: t,
            open_price: dec!(1.1000),
            close_price: dec!(1.1010),
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            commission: dec!(-0.5),
            swap: Decimal::ZERO,
            volume: dec!(0.10),
            profit: dec!(10.0),
            comment: String::new(),
        }
    }

    fn writer(cache: &Arc<crate::MemoryCache>) -> ProjectionWriter {
        ProjectionWriter::new(
            Arc::clone(cache) as Arc<dyn ProjectionCache>,
            501,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn flat_account_record_layout() {
        let record = flat_account(&account());
        let fields: Vec<&str> = record.split('#').collect();
        assert_eq!(fields.len(), 14);
        assert_eq!(fields[0], "501");
        assert_eq!(fields[4], "1000.01");
        assert_eq!(fields[7], "1012.51");
        assert_eq!(fields[10], "1012.51");
        assert_eq!(fields[13], "alpha");
    }

    #[test]
    fn flat_order_record_layout() {
        let record = flat_order(501, &order(9001));
        let fields: Vec<&str> = record.split('#').collect();
        assert_eq!(fields.len(), 16);
        assert_eq!(fields[0], "501");
        assert_eq!(fields[1], "9001");
        assert_eq!(fields[2], "0");
        assert_eq!(fields[3], "EURUSD");
        assert_eq!(fields[5], "0");
        assert_eq!(fields[10], "");
        assert_eq!(fields[15], "9.5");
    }

    #[test]
    fn account_writes_debounce_on_equity() {
        let cache = Arc::new(crate::MemoryCache::new());
        let writer = writer(&cache);
        let info = account();
        assert!(writer.write_account(&info).unwrap());
        assert!(!writer.write_account(&info).unwrap());

        let mut moved = info.clone();
        moved.equity = dec!(1013);
        assert!(writer.write_account(&moved).unwrap());

        writer.force_next();
        assert!(writer.write_account(&moved).unwrap());
    }

    #[test]
    fn full_rewrite_evicts_stale_tickets() {
        let cache = Arc::new(crate::MemoryCache::new());
        let writer = writer(&cache);
        writer.write_orders_full(&[order(1), order(2)]).unwrap();
        writer.write_orders_full(&[order(2)]).unwrap();

        assert_eq!(cache.get(&keys::order(1)).unwrap(), None);
        assert!(cache.get(&keys::order(2)).unwrap().is_some());
        assert_eq!(cache.set_members(&keys::orders_set(501)).unwrap(), vec![2]);
    }

    #[test]
    fn delete_leaves_close_marker() {
        let cache = Arc::new(crate::MemoryCache::new());
        let writer = writer(&cache);
        writer.write_orders_full(&[order(7)]).unwrap();
        writer.delete_order(7).unwrap();

        assert_eq!(cache.get(&keys::order(7)).unwrap(), None);
        assert_eq!(
            cache.get(&keys::deleted_order(7)).unwrap().as_deref(),
            Some("501")
        );
        assert!(cache.set_members(&keys::orders_set(501)).unwrap().is_empty());
    }

    /// Delegating cache that refuses to delete one specific key.
    struct FlakyCache {
        inner: crate::MemoryCache,
        poisoned: String,
    }

    impl ProjectionCache for FlakyCache {
        fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> crate::StoreResult<()> {
            self.inner.set(key, value, ttl)
        }
        fn get(&self, key: &str) -> crate::StoreResult<Option<String>> {
            self.inner.get(key)
        }
        fn delete(&self, key: &str) -> crate::StoreResult<()> {
            if key == self.poisoned {
                return Err(crate::StoreError::Cache("connection reset".to_string()));
            }
            self.inner.delete(key)
        }
        fn expire(&self, key: &str, ttl: Duration) -> crate::StoreResult<()> {
            self.inner.expire(key, ttl)
        }
        fn set_add(&self, key: &str, member: i64) -> crate::StoreResult<()> {
            self.inner.set_add(key, member)
        }
        fn set_remove(&self, key: &str, member: i64) -> crate::StoreResult<()> {
            self.inner.set_remove(key, member)
        }
        fn set_members(&self, key: &str) -> crate::StoreResult<Vec<i64>> {
            self.inner.set_members(key)
        }
    }

    #[test]
    fn teardown_keeps_going_past_a_failed_delete() {
        let cache = Arc::new(FlakyCache {
            inner: crate::MemoryCache::new(),
            poisoned: keys::order(1),
        });
        let writer = ProjectionWriter::new(
            Arc::clone(&cache) as Arc<dyn ProjectionCache>,
            501,
            Duration::from_secs(60),
        );
        writer.write_account(&account()).unwrap();
        writer.write_orders_full(&[order(1), order(2)]).unwrap();
        writer.teardown();

        // The poisoned key survives; every other record is still evicted.
        assert!(cache.get(&keys::order(1)).unwrap().is_some());
        assert_eq!(cache.get(&keys::order(2)).unwrap(), None);
        assert_eq!(cache.get(&keys::account(501)).unwrap(), None);
        assert_eq!(cache.get(&keys::account_json(501)).unwrap(), None);
        assert!(cache.set_members(&keys::orders_set(501)).unwrap().is_empty());
    }

    #[test]
    fn teardown_clears_every_owned_key() {
        let cache = Arc::new(crate::MemoryCache::new());
        let writer = writer(&cache);
        writer.write_account(&account()).unwrap();
        writer.write_orders_full(&[order(1), order(2)]).unwrap();
        writer.mark_live().unwrap();
        writer.teardown();

        assert_eq!(cache.get(&keys::account(501)).unwrap(), None);
        assert_eq!(cache.get(&keys::account_json(501)).unwrap(), None);
        assert_eq!(cache.get(&keys::live(501)).unwrap(), None);
        assert_eq!(cache.get(&keys::order(1)).unwrap(), None);
        assert_eq!(cache.get(&keys::order(2)).unwrap(), None);
        assert!(cache.set_members(&keys::orders_set(501)).unwrap().is_empty());
    }
}
