//! Session and per-application instance multiplexing.
//!
//! Requests are keyed by chain identity ([`SessionKey`]) and calling
//! application ([`AppId`]). Each session owns one shared resource bundle;
//! each application inside a session gets its own wallet instance built on
//! top of it.
//!
//! ```text
//! SessionRegistry
//!   └─ SessionKey (chainId, version) ──► Shared<resources future>
//!        ├─ AppId "alpha" ──────────────► Shared<instance future>
//!        └─ AppId "beta"  ──────────────► Shared<instance future>
//! ```
//!
//! Both levels follow `absent → initializing → ready` (or `failed`). The
//! memoized future for a key is inserted under the registry lock before it
//! is first polled, so concurrent first-time callers all await the same
//! initialization. A failed initialization stays failed until the key is
//! evicted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

use crate::router::authorization::AuthorizationBroker;
use crate::rpc::protocol::ChainContext;
use crate::rpc::schema::WalletMethod;

/// Chain identity a session is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// L1 chain id.
    pub chain_id: u64,
    /// Rollup protocol version.
    pub version: u64,
}

impl SessionKey {
    /// Key for `chain_id` / `version`.
    pub fn new(chain_id: u64, version: u64) -> Self {
        Self { chain_id, version }
    }
}

impl From<&ChainContext> for SessionKey {
    fn from(context: &ChainContext) -> Self {
        Self::new(context.chain_id, context.version)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.version)
    }
}

/// Calling application identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(String);

impl AppId {
    /// Wrap an application id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// What a wallet instance can reach outside itself.
#[derive(Debug, Clone)]
pub struct InstanceContext {
    /// Session the instance belongs to.
    pub session: SessionKey,
    /// Application the instance serves.
    pub app_id: AppId,
    broker: AuthorizationBroker,
}

impl InstanceContext {
    /// Context for an instance serving `app_id` in `session`.
    pub fn new(session: SessionKey, app_id: AppId, broker: AuthorizationBroker) -> Self {
        Self {
            session,
            app_id,
            broker,
        }
    }

    /// Broadcast an event on behalf of this application.
    pub fn emit_event(&self, name: &str, payload: Value) {
        self.broker.emit_event(&self.app_id, name, payload);
    }

    /// Ask the user to authorize `method`; resolves with their answer.
    pub async fn request_authorization(&self, method: &str, payload: Value) -> Result<Value> {
        self.broker
            .request_authorization(&self.app_id, method, payload)
            .await
    }
}

/// A ready per-application wallet.
#[async_trait]
pub trait WalletInstance: Send + Sync {
    /// Run `method` with already-validated arguments.
    async fn invoke(&self, method: WalletMethod, args: Vec<Value>) -> Result<Value>;
}

/// Builds session resources and per-application instances.
///
/// This is the seam to the execution engine: the bridge never looks inside
/// either bundle.
#[async_trait]
pub trait WalletBackend: Send + Sync + 'static {
    /// Shared per-session state (node connections, stores).
    type Resources: Send + Sync + 'static;
    /// Per-application wallet.
    type Instance: WalletInstance + 'static;

    /// Build the resource bundle for `key`. Called at most once per key
    /// between evictions.
    async fn create_resources(&self, key: SessionKey) -> Result<Self::Resources>;

    /// Build the instance for `context.app_id` on top of `resources`. Called
    /// at most once per (session, app) between evictions.
    async fn create_instance(
        &self,
        resources: Arc<Self::Resources>,
        context: InstanceContext,
    ) -> Result<Self::Instance>;
}

/// Memoized initialization; errors are pre-rendered so waiters can share them.
type SharedInit<T> = Shared<BoxFuture<'static, Result<Arc<T>, String>>>;

/// Lifecycle of a session or instance slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Never requested, or evicted.
    Absent,
    /// Initialization in progress (or not yet polled).
    Initializing,
    /// Ready for use.
    Ready,
    /// Initialization failed; stays so until evicted.
    Failed,
}

fn state_of<T>(init: &SharedInit<T>) -> InitState {
    match init.peek() {
        None => InitState::Initializing,
        Some(Ok(_)) => InitState::Ready,
        Some(Err(_)) => InitState::Failed,
    }
}

struct SessionSlot<B: WalletBackend> {
    resources: SharedInit<B::Resources>,
    instances: HashMap<AppId, SharedInit<B::Instance>>,
}

/// Registry of sessions and their per-application instances.
///
/// Owned by the hosting process and shared by every connection it serves.
pub struct SessionRegistry<B: WalletBackend> {
    backend: Arc<B>,
    broker: AuthorizationBroker,
    sessions: Mutex<HashMap<SessionKey, SessionSlot<B>>>,
}

impl<B: WalletBackend> fmt::Debug for SessionRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl<B: WalletBackend> SessionRegistry<B> {
    /// Empty registry building through `backend`.
    pub fn new(backend: Arc<B>, broker: AuthorizationBroker) -> Self {
        Self {
            backend,
            broker,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Broker handed to every instance.
    pub fn broker(&self) -> &AuthorizationBroker {
        &self.broker
    }

    /// Ready instance for `app_id` in session `key`, creating it (and the
    /// session) on first use.
    pub async fn resolve(&self, key: SessionKey, app_id: &AppId) -> Result<Arc<B::Instance>> {
        let instance = {
            let mut sessions = self
                .sessions
                .lock()
                .map_err(|_| anyhow!("session registry lock poisoned"))?;
            let slot = sessions.entry(key).or_insert_with(|| SessionSlot {
                resources: self.init_resources(key),
                instances: HashMap::new(),
            });
            let resources = slot.resources.clone();
            slot.instances
                .entry(app_id.clone())
                .or_insert_with(|| self.init_instance(key, app_id.clone(), resources))
                .clone()
        };
        instance.await.map_err(|e| anyhow!(e))
    }

    fn init_resources(&self, key: SessionKey) -> SharedInit<B::Resources> {
        log::info!("[Session] New session {key}");
        let backend = Arc::clone(&self.backend);
        async move {
            match backend.create_resources(key).await {
                Ok(resources) => {
                    log::info!("[Session] Resources ready for session {key}");
                    Ok(Arc::new(resources))
                }
                Err(e) => {
                    log::error!("[Session] Resource initialization failed for session {key}: {e:#}");
                    Err(format!("session {key} initialization failed: {e:#}"))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn init_instance(
        &self,
        key: SessionKey,
        app_id: AppId,
        resources: SharedInit<B::Resources>,
    ) -> SharedInit<B::Instance> {
        log::info!("[Session] New instance for '{app_id}' in session {key}");
        let backend = Arc::clone(&self.backend);
        let context = InstanceContext::new(key, app_id, self.broker.clone());
        async move {
            let resources = resources.await?;
            let app_id = context.app_id.clone();
            match backend.create_instance(resources, context).await {
                Ok(instance) => Ok(Arc::new(instance)),
                Err(e) => {
                    log::error!(
                        "[Session] Instance initialization failed for '{app_id}' in session {key}: {e:#}"
                    );
                    Err(format!("instance for '{app_id}' initialization failed: {e:#}"))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Session resources, if initialized successfully.
    pub fn resources(&self, key: SessionKey) -> Option<Arc<B::Resources>> {
        let sessions = self.sessions.lock().ok()?;
        match sessions.get(&key)?.resources.peek()? {
            Ok(resources) => Some(Arc::clone(resources)),
            Err(_) => None,
        }
    }

    /// Lifecycle state of session `key`.
    pub fn session_state(&self, key: SessionKey) -> InitState {
        let Ok(sessions) = self.sessions.lock() else {
            return InitState::Absent;
        };
        sessions
            .get(&key)
            .map_or(InitState::Absent, |slot| state_of(&slot.resources))
    }

    /// Lifecycle state of `app_id`'s instance in session `key`.
    pub fn instance_state(&self, key: SessionKey, app_id: &AppId) -> InitState {
        let Ok(sessions) = self.sessions.lock() else {
            return InitState::Absent;
        };
        sessions
            .get(&key)
            .and_then(|slot| slot.instances.get(app_id))
            .map_or(InitState::Absent, state_of)
    }

    /// Drop session `key` and all its instances. Waiters already holding
    /// the old futures still complete; the next request starts over.
    pub fn evict_session(&self, key: SessionKey) -> bool {
        let removed = self
            .sessions
            .lock()
            .map(|mut sessions| sessions.remove(&key))
            .ok()
            .flatten();
        if let Some(slot) = &removed {
            log::info!(
                "[Session] Evicted session {key} ({} instance(s))",
                slot.instances.len()
            );
        }
        removed.is_some()
    }

    /// Drop `app_id`'s instance in session `key`, keeping the session.
    pub fn evict_instance(&self, key: SessionKey, app_id: &AppId) -> bool {
        let removed = self
            .sessions
            .lock()
            .ok()
            .and_then(|mut sessions| sessions.get_mut(&key)?.instances.remove(app_id))
            .is_some();
        if removed {
            log::info!("[Session] Evicted instance for '{app_id}' in session {key}");
        }
        removed
    }

    /// Drop every session and fail pending authorization prompts.
    pub fn shutdown(&self) -> usize {
        let count = self
            .sessions
            .lock()
            .map(|mut sessions| sessions.drain().count())
            .unwrap_or(0);
        self.broker.close();
        log::info!("[Session] Registry shut down, dropped {count} session(s)");
        count
    }

    /// Number of known sessions (any state).
    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Number of known instances in session `key` (any state).
    pub fn instance_count(&self, key: SessionKey) -> usize {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(&key).map(|slot| slot.instances.len()))
            .unwrap_or(0)
    }
}
