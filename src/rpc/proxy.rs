//! Calling side of the RPC channel.
//!
//! [`RpcProxy`] turns a [`MessageSink`] plus an inbound message stream into
//! awaited calls. Every call registers its continuation before the envelope
//! is sent; responses are matched by id and resolve it exactly once.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use super::pending::PendingCalls;
use super::protocol::{
    AuthorizationRequest, AuthorizationResponse, CallEnvelope, ChainContext, EventNotification,
    Inbound, TYPE_AUTHORIZATION_RESPONSE,
};
use super::CallError;
use crate::transport::{with_reassembly, FramedTransport, MessageSink};

/// Callback for event notifications.
pub type EventListener = Arc<dyn Fn(EventNotification) + Send + Sync>;
/// Callback for authorization prompts.
pub type AuthorizationListener = Arc<dyn Fn(AuthorizationRequest) + Send + Sync>;

type CallOutcome = Result<Value, CallError>;

#[derive(Default)]
struct Listeners {
    event: Option<EventListener>,
    authorization: Option<AuthorizationListener>,
}

/// Correlating RPC client bound to one application identity and chain.
pub struct RpcProxy {
    sink: Arc<dyn MessageSink>,
    pending: PendingCalls<CallOutcome, String>,
    app_id: String,
    context: ChainContext,
    listeners: RwLock<Listeners>,
    default_timeout: Option<Duration>,
}

impl std::fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxy")
            .field("app_id", &self.app_id)
            .field("context", &self.context)
            .field("in_flight", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl RpcProxy {
    /// Proxy sending through `sink`. Feed inbound traffic to
    /// [`handle_inbound`](Self::handle_inbound).
    pub fn new(sink: Arc<dyn MessageSink>, app_id: impl Into<String>, context: ChainContext) -> Self {
        Self {
            sink,
            pending: PendingCalls::new(),
            app_id: app_id.into(),
            context,
            listeners: RwLock::new(Listeners::default()),
            default_timeout: None,
        }
    }

    /// Apply `timeout` to every [`call`](Self::call).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Bind a proxy to `transport`.
    ///
    /// Registers a reassembling inbound handler and fails every in-flight
    /// call once the transport closes. The handler only holds a weak
    /// reference, so dropping the proxy detaches it.
    pub fn attach(
        transport: &Arc<FramedTransport>,
        app_id: impl Into<String>,
        context: ChainContext,
        timeout: Option<Duration>,
    ) -> Arc<Self> {
        let sink: Arc<dyn MessageSink> = Arc::clone(transport) as Arc<dyn MessageSink>;
        let proxy = Arc::new(Self::new(sink, app_id, context).with_timeout(timeout));

        let closed = transport.closed_token();
        let weak: Weak<Self> = Arc::downgrade(&proxy);
        transport.on_message(with_reassembly(
            move |message| {
                if let Some(proxy) = weak.upgrade() {
                    proxy.handle_inbound(message);
                }
            },
            transport.config(),
            closed.clone(),
        ));

        let weak = Arc::downgrade(&proxy);
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(proxy) = weak.upgrade() {
                proxy.close();
            }
        });

        proxy
    }

    /// Application id stamped on every call.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Chain context stamped on every call.
    pub fn context(&self) -> ChainContext {
        self.context
    }

    /// Call `method` with the default timeout.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> CallOutcome {
        self.call_with_timeout(method, args, self.default_timeout).await
    }

    /// Call `method`, giving up after `timeout`.
    ///
    /// A timed-out call leaves its entry registered; the late response
    /// removes it and is otherwise ignored.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> CallOutcome {
        let id = Uuid::new_v4().to_string();
        let envelope = CallEnvelope {
            method: method.to_string(),
            args,
            id: id.clone(),
            app_id: self.app_id.clone(),
            context: self.context,
        };
        let message =
            serde_json::to_value(&envelope).map_err(|e| CallError::Send(e.to_string()))?;

        let rx = self
            .pending
            .register(id.clone(), method.to_string())
            .map_err(|_| CallError::ChannelClosed)?;

        if let Err(e) = self.sink.send_message(&message) {
            self.pending.discard(&id);
            return Err(CallError::Send(format!("{e:#}")));
        }
        log::debug!("[Rpc] -> {method} ({id})");

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    log::warn!("[Rpc] {method} ({id}) timed out after {limit:?}");
                    return Err(CallError::Timeout(limit));
                }
            },
            None => rx.await,
        };
        received.unwrap_or(Err(CallError::ChannelClosed))
    }

    /// Route one inbound message: event, authorization prompt, or response.
    ///
    /// Never fails; malformed messages and unknown ids are logged and dropped.
    pub fn handle_inbound(&self, message: Value) {
        let inbound = match Inbound::classify(message) {
            Ok(inbound) => inbound,
            Err(e) => {
                log::warn!("[Rpc] Dropping unrecognized inbound message: {e:#}");
                return;
            }
        };

        match inbound {
            Inbound::Event(event) => {
                let listener = self.listeners.read().ok().and_then(|l| l.event.clone());
                match listener {
                    Some(listener) => listener(event),
                    None => log::debug!("[Rpc] No event listener, dropping '{}'", event.name),
                }
            }
            Inbound::AuthorizationRequest(request) => {
                let listener = self.listeners.read().ok().and_then(|l| l.authorization.clone());
                match listener {
                    Some(listener) => listener(request),
                    None => log::warn!(
                        "[Rpc] No authorization listener, dropping prompt {}",
                        request.id
                    ),
                }
            }
            Inbound::Response(response) => {
                let id = response.id.clone();
                let outcome = response.into_result().map_err(CallError::Remote);
                match self.pending.resolve(&id, outcome) {
                    Some(method) => log::debug!("[Rpc] <- {method} ({id})"),
                    None => log::warn!("[Rpc] Dropping response for unknown id {id}"),
                }
            }
        }
    }

    /// Listen for event notifications, replacing any previous listener.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(EventNotification) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.event = Some(Arc::new(listener));
        }
    }

    /// Listen for authorization prompts, replacing any previous listener.
    pub fn on_authorization_request<F>(&self, listener: F)
    where
        F: Fn(AuthorizationRequest) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.authorization = Some(Arc::new(listener));
        }
    }

    /// Answer an authorization prompt.
    pub fn respond_authorization(
        &self,
        id: &str,
        outcome: Result<Value, String>,
    ) -> anyhow::Result<()> {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(reason) => (None, Some(reason)),
        };
        let response = AuthorizationResponse {
            id: id.to_string(),
            app_id: self.app_id.clone(),
            result,
            error,
        };
        let mut message = serde_json::to_value(&response)?;
        if let Value::Object(map) = &mut message {
            map.insert("type".into(), Value::from(TYPE_AUTHORIZATION_RESPONSE));
        }
        self.sink.send_message(&message)
    }

    /// Fail every in-flight call with [`CallError::ChannelClosed`] and
    /// reject new ones.
    pub fn close(&self) {
        let failed = self.pending.close(|_| Err(CallError::ChannelClosed));
        if failed > 0 {
            log::info!("[Rpc] Channel closed, failed {failed} in-flight call(s)");
        }
    }

    /// Calls awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
