//! Registry of live account sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use fxbridge_broker::{OrderGateway, QuoteSession};
use fxbridge_core::Login;
use fxbridge_store::ProjectionWriter;
use tokio::task::JoinHandle;
use tracing::info;

/// Everything the engine holds for one registered account.
///
/// `submit_lock` serializes gateway submissions between the dispatcher and
/// the in-session risk managers; every order mutation must hold it.
pub struct SessionHandle {
    pub login: Login,
    pub server: String,
    pub master: bool,
    pub manage_stop_loss: bool,
    pub average_losing_positions: bool,
    pub session: Arc<dyn QuoteSession>,
    pub gateway: Arc<dyn OrderGateway>,
    pub projection: Arc<ProjectionWriter>,
    pub submit_lock: Arc<tokio::sync::Mutex<()>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn new(
        login: Login,
        server: String,
        master: bool,
        session: Arc<dyn QuoteSession>,
        gateway: Arc<dyn OrderGateway>,
        projection: Arc<ProjectionWriter>,
    ) -> Self {
        Self {
            login,
            server,
            master,
            manage_stop_loss: false,
            average_losing_positions: false,
            session,
            gateway,
            projection,
            submit_lock: Arc::new(tokio::sync::Mutex::new(())),
            task: Mutex::new(None),
        }
    }

    pub fn with_risk_flags(mut self, manage_stop_loss: bool, average_losing: bool) -> Self {
        self.manage_stop_loss = manage_stop_loss;
        self.average_losing_positions = average_losing;
        self
    }

    /// Attach the reactor task so deregistration can abort it.
    pub fn attach_task(&self, task: JoinHandle<()>) {
        *self.task.lock().unwrap() = Some(task);
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap().take()
    }
}

/// Shared lookup table of registered accounts. The dispatcher reads it to
/// scope queue polls; samplers walk it; reactors remove themselves from it
/// when the broker declares their credentials dead.
#[derive(Default)]
pub struct AccountRegistry {
    accounts: RwLock<HashMap<Login, Arc<SessionHandle>>>,
}

impl AccountRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle, replacing (and returning) any previous registration
    /// for the same login.
    pub fn register(&self, handle: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        info!(login = handle.login, server = %handle.server, "account registered");
        self.accounts
            .write()
            .unwrap()
            .insert(handle.login, handle)
    }

    #[must_use]
    pub fn get(&self, login: Login) -> Option<Arc<SessionHandle>> {
        self.accounts.read().unwrap().get(&login).cloned()
    }

    #[must_use]
    pub fn contains(&self, login: Login) -> bool {
        self.accounts.read().unwrap().contains_key(&login)
    }

    /// Logins allowed to receive instructions.
    #[must_use]
    pub fn master_logins(&self) -> Vec<Login> {
        let mut logins: Vec<Login> = self
            .accounts
            .read()
            .unwrap()
            .values()
            .filter(|h| h.master)
            .map(|h| h.login)
            .collect();
        logins.sort_unstable();
        logins
    }

    #[must_use]
    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.accounts.read().unwrap().values().cloned().collect()
    }

    /// Drop the registry entry without dismantling the session. Reactors use
    /// this on terminal failures after running their own teardown.
    pub fn detach(&self, login: Login) -> Option<Arc<SessionHandle>> {
        self.accounts.write().unwrap().remove(&login)
    }

    /// Remove an account and dismantle everything it owns: the reactor task,
    /// the broker connection, and the cache projection.
    pub async fn deregister(&self, login: Login) -> bool {
        let handle = self.accounts.write().unwrap().remove(&login);
        let Some(handle) = handle else {
            return false;
        };
        if let Some(task) = handle.take_task() {
            task.abort();
        }
        handle.session.disconnect().await;
        handle.projection.teardown();
        info!(login, "account deregistered");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fxbridge_sim::SimBroker;
    use fxbridge_store::{MemoryCache, ProjectionCache};

    fn handle(cache: &Arc<MemoryCache>, login: Login, master: bool) -> Arc<SessionHandle> {
        let broker = Arc::new(SimBroker::new(login));
        let projection = Arc::new(ProjectionWriter::new(
            Arc::clone(cache) as Arc<dyn ProjectionCache>,
            login,
            Duration::from_secs(2),
        ));
        Arc::new(SessionHandle::new(
            login,
            "Sim-Live".into(),
            master,
            broker.clone(),
            broker,
            projection,
        ))
    }

    #[tokio::test]
    async fn register_and_deregister() {
        let cache = Arc::new(MemoryCache::new());
        let registry = AccountRegistry::new();
        registry.register(handle(&cache, 501, true));
        registry.register(handle(&cache, 502, false));

        assert!(registry.contains(501));
        assert_eq!(registry.master_logins(), vec![501]);

        assert!(registry.deregister(501).await);
        assert!(!registry.contains(501));
        assert!(!registry.deregister(501).await);
    }

    #[tokio::test]
    async fn deregister_tears_down_projection() {
        let cache = Arc::new(MemoryCache::new());
        let registry = AccountRegistry::new();
        let h = handle(&cache, 501, true);
        h.projection.mark_live().unwrap();
        registry.register(h);

        registry.deregister(501).await;
        assert_eq!(
            cache.get(&fxbridge_store::keys::live(501)).unwrap(),
            None
        );
    }
}
