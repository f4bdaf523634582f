//! Outbound notifications from wallet instances.
//!
//! Events are broadcast to every connected peer. Authorization prompts are
//! broadcast too, but also park a continuation keyed by prompt id and
//! tagged with the application that raised it. The answer comes back from
//! whichever peer hosts the wallet UI, carrying that peer's identity, and is
//! routed by prompt id to the originating application's continuation.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::constants::NOTIFICATION_CAPACITY;
use crate::rpc::pending::PendingCalls;
use crate::rpc::protocol::{
    AuthorizationRequest, AuthorizationResponse, EventNotification, Notification,
};
use crate::session::AppId;

type Prompts = PendingCalls<Result<Value, String>, AppId>;

struct Inner {
    outbox: broadcast::Sender<Value>,
    prompts: Prompts,
}

/// Forgets a prompt when its waiter goes away without an answer.
struct PromptGuard<'a> {
    prompts: &'a Prompts,
    id: &'a str,
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        if let Some(origin) = self.prompts.discard(self.id) {
            log::debug!("[Router] Authorization {} for '{origin}' no longer awaited", self.id);
        }
    }
}

/// Cloneable handle shared by the router and every wallet instance.
#[derive(Clone)]
pub struct AuthorizationBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AuthorizationBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationBroker")
            .field("subscribers", &self.inner.outbox.receiver_count())
            .field("pending_prompts", &self.inner.prompts.len())
            .finish()
    }
}

impl Default for AuthorizationBroker {
    fn default() -> Self {
        Self::new(NOTIFICATION_CAPACITY)
    }
}

impl AuthorizationBroker {
    /// Broker whose outbox buffers up to `capacity` notifications per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (outbox, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                outbox,
                prompts: PendingCalls::new(),
            }),
        }
    }

    /// Receive every notification emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.inner.outbox.subscribe()
    }

    /// Broadcast an event for `app_id`. Returns how many peers it reached.
    pub fn emit_event(&self, app_id: &AppId, name: &str, payload: Value) -> usize {
        let notification = Notification::Event(EventNotification {
            app_id: app_id.to_string(),
            name: name.to_string(),
            payload,
        });
        match self.inner.outbox.send(notification.to_value()) {
            Ok(reached) => reached,
            Err(_) => {
                log::debug!("[Router] No peers connected, event '{name}' for '{app_id}' dropped");
                0
            }
        }
    }

    /// Prompt the user to authorize `method` for `app_id` and wait for the answer.
    ///
    /// Fails when no peer is connected to show the prompt, when the user
    /// rejects it, or when the broker shuts down first.
    pub async fn request_authorization(
        &self,
        app_id: &AppId,
        method: &str,
        payload: Value,
    ) -> Result<Value> {
        let id = format!("auth-{}", Uuid::new_v4());
        let answer = self.inner.prompts.register(id.clone(), app_id.clone())?;
        let _guard = PromptGuard {
            prompts: &self.inner.prompts,
            id: &id,
        };

        let prompt = Notification::AuthorizationRequest(AuthorizationRequest {
            id: id.clone(),
            app_id: app_id.to_string(),
            method: method.to_string(),
            payload,
        });
        if self.inner.outbox.send(prompt.to_value()).is_err() {
            bail!("no connected peer can show authorization prompt for {method}");
        }
        log::info!("[Router] Authorization {id} requested by '{app_id}' for {method}");

        match answer.await {
            Ok(Ok(approval)) => Ok(approval),
            Ok(Err(reason)) => bail!("authorization for {method} denied: {reason}"),
            Err(_) => bail!("authorization for {method} abandoned"),
        }
    }

    /// Deliver an answer to the prompt it names.
    ///
    /// Returns the originating application, or `None` when the prompt is
    /// unknown or already answered.
    pub fn resolve_authorization(&self, response: AuthorizationResponse) -> Option<AppId> {
        let id = response.id.clone();
        let responder = response.app_id.clone();
        match self.inner.prompts.resolve(&id, response.into_result()) {
            Some(origin) => {
                if origin.as_str() != responder {
                    log::info!(
                        "[Router] Authorization {id} answered by '{responder}', routed to '{origin}'"
                    );
                }
                Some(origin)
            }
            None => {
                log::warn!("[Router] Dropping answer for unknown authorization {id}");
                None
            }
        }
    }

    /// Reject every outstanding prompt and refuse new ones.
    pub fn close(&self) -> usize {
        self.inner
            .prompts
            .close(|_| Err("wallet shutting down".to_string()))
    }

    /// Prompts awaiting an answer.
    pub fn pending_prompts(&self) -> usize {
        self.inner.prompts.len()
    }
}
