//! Worker-side dispatch of inbound wallet calls.
//!
//! Every call envelope is validated against the method table, resolved to
//! the caller's wallet instance through the [`SessionRegistry`], executed,
//! and answered with `{id, result}` or `{id, error}`. Failures of any kind,
//! including handler panics, become error strings on the wire.
//!
//! Authorization answers are not calls: they go to the
//! [`AuthorizationBroker`], which hands them to the application that raised
//! the prompt.

pub mod authorization;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::FutureExt;
use serde_json::{json, Value};

pub use authorization::AuthorizationBroker;

use crate::rpc::protocol::{CallEnvelope, ResponseEnvelope, WorkerInbound};
use crate::rpc::schema::WalletMethod;
use crate::session::{AppId, SessionKey, SessionRegistry, WalletBackend, WalletInstance};
use crate::transport::MessageSink;

/// Routes inbound messages of every connection to the shared registry.
pub struct MessageRouter<B: WalletBackend> {
    registry: Arc<SessionRegistry<B>>,
}

impl<B: WalletBackend> std::fmt::Debug for MessageRouter<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("registry", &self.registry)
            .finish()
    }
}

impl<B: WalletBackend> MessageRouter<B> {
    /// Router dispatching into `registry`.
    pub fn new(registry: Arc<SessionRegistry<B>>) -> Self {
        Self { registry }
    }

    /// Registry backing this router.
    pub fn registry(&self) -> &Arc<SessionRegistry<B>> {
        &self.registry
    }

    /// Notification and authorization broker.
    pub fn broker(&self) -> &AuthorizationBroker {
        self.registry.broker()
    }

    /// Handle one inbound message, answering calls through `reply`.
    ///
    /// Calls run on their own task so a slow call never blocks the reader.
    /// Malformed calls that carry an id get an error response; anything
    /// else unparseable is logged and dropped.
    pub fn route(self: &Arc<Self>, message: Value, reply: Arc<dyn MessageSink>) {
        let call_id = message
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match WorkerInbound::classify(message) {
            Ok(WorkerInbound::AuthorizationResponse(response)) => {
                self.broker().resolve_authorization(response);
            }
            Ok(WorkerInbound::Call(call)) => {
                let router = Arc::clone(self);
                tokio::spawn(async move {
                    let id = call.id.clone();
                    let method = call.method.clone();
                    let response = match AssertUnwindSafe(router.dispatch(call))
                        .catch_unwind()
                        .await
                    {
                        Ok(response) => response,
                        Err(_) => {
                            log::error!("[Router] Handler for {method} ({id}) panicked");
                            ResponseEnvelope::failure(id, format!("internal error in {method}"))
                        }
                    };
                    send_response(reply.as_ref(), &response);
                });
            }
            Err(e) => match call_id {
                Some(id) => {
                    log::warn!("[Router] Malformed call {id}: {e:#}");
                    send_response(
                        reply.as_ref(),
                        &ResponseEnvelope::failure(id, format!("{e:#}")),
                    );
                }
                None => log::warn!("[Router] Dropping unroutable message: {e:#}"),
            },
        }
    }

    /// Execute one call and build its response.
    pub async fn dispatch(&self, call: CallEnvelope) -> ResponseEnvelope {
        let id = call.id.clone();
        let method = call.method.clone();
        match self.execute(call).await {
            Ok(result) => ResponseEnvelope::success(id, result),
            Err(e) => {
                log::warn!("[Router] {method} ({id}) failed: {e:#}");
                ResponseEnvelope::failure(id, format!("{e:#}"))
            }
        }
    }

    async fn execute(&self, call: CallEnvelope) -> Result<Value> {
        let Some(method) = WalletMethod::from_name(&call.method) else {
            log::warn!("[Router] Unknown method '{}' from '{}'", call.method, call.app_id);
            bail!("Unknown method: {}", call.method);
        };
        let args = method.validate_args(call.args).map_err(|e| anyhow!(e))?;

        let key = SessionKey::from(&call.context);
        let app_id = AppId::new(call.app_id);
        let instance = self.registry.resolve(key, &app_id).await?;

        if method == WalletMethod::Batch {
            return run_batch(instance.as_ref(), args).await;
        }
        instance.invoke(method, args).await
    }
}

/// Run batch entries `{name, args}` in order, stopping at the first failure.
async fn run_batch<I: WalletInstance + ?Sized>(instance: &I, args: Vec<Value>) -> Result<Value> {
    let Some(Value::Array(calls)) = args.into_iter().next() else {
        bail!("batch expects an array of calls");
    };

    let mut results = Vec::with_capacity(calls.len());
    for (index, entry) in calls.iter().enumerate() {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("batch entry {index}: missing method name"))?;
        let method = WalletMethod::from_name(name)
            .filter(|m| *m != WalletMethod::Batch)
            .ok_or_else(|| anyhow!("batch entry {index}: Unknown method: {name}"))?;
        let args = match entry.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(args)) => args.clone(),
            Some(_) => bail!("batch entry {index}: args must be an array"),
        };
        let args = method
            .validate_args(args)
            .map_err(|e| anyhow!("batch entry {index}: {e}"))?;

        let result = instance
            .invoke(method, args)
            .await
            .with_context(|| format!("batch entry {index} ({name})"))?;
        results.push(json!({"name": name, "result": result}));
    }
    Ok(Value::Array(results))
}

fn send_response(reply: &dyn MessageSink, response: &ResponseEnvelope) {
    let message = match serde_json::to_value(response) {
        Ok(message) => message,
        Err(e) => {
            log::error!("[Router] Failed to serialize response {}: {e}", response.id);
            return;
        }
    };
    if let Err(e) = reply.send_message(&message) {
        log::warn!("[Router] Could not deliver response {}: {e:#}", response.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::ChainContext;
    use crate::session::InstanceContext;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct TestBackend;

    struct TestInstance {
        context: InstanceContext,
    }

    #[async_trait]
    impl WalletInstance for TestInstance {
        async fn invoke(&self, method: WalletMethod, args: Vec<Value>) -> Result<Value> {
            match method {
                WalletMethod::GetContractMetadata => bail!("contract {} not registered", args[0]),
                WalletMethod::ProfileTx => panic!("prover crashed"),
                WalletMethod::SendTx => {
                    let approval = self
                        .context
                        .request_authorization("sendTx", args[0].clone())
                        .await?;
                    Ok(json!({"sent": true, "approval": approval}))
                }
                _ => Ok(json!({
                    "method": method.name(),
                    "args": args,
                    "app": self.context.app_id.as_str(),
                })),
            }
        }
    }

    #[async_trait]
    impl WalletBackend for TestBackend {
        type Resources = ();
        type Instance = TestInstance;

        async fn create_resources(&self, key: SessionKey) -> Result<()> {
            if key.chain_id == 0 {
                bail!("chain 0 is not served");
            }
            Ok(())
        }

        async fn create_instance(
            &self,
            _resources: Arc<()>,
            context: InstanceContext,
        ) -> Result<TestInstance> {
            Ok(TestInstance { context })
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<Value>);

    impl MessageSink for ChannelSink {
        fn send_message(&self, message: &Value) -> Result<()> {
            self.0.send(message.clone()).map_err(|_| anyhow!("closed"))
        }
    }

    fn router() -> Arc<MessageRouter<TestBackend>> {
        let registry = SessionRegistry::new(Arc::new(TestBackend), AuthorizationBroker::new(16));
        Arc::new(MessageRouter::new(Arc::new(registry)))
    }

    fn call(method: &str, args: Value, app: &str) -> CallEnvelope {
        CallEnvelope {
            method: method.into(),
            args: serde_json::from_value(args).unwrap(),
            id: format!("{method}-1"),
            app_id: app.into(),
            context: ChainContext { chain_id: 1, version: 1 },
        }
    }

    #[tokio::test]
    async fn test_known_method_dispatches_with_coerced_args() {
        let router = router();
        let response = router
            .dispatch(call("registerSender", json!(["0xabc"]), "alpha"))
            .await;
        assert_eq!(response.id, "registerSender-1");
        assert_eq!(
            response.into_result().unwrap(),
            json!({"method": "registerSender", "args": ["0xabc", null], "app": "alpha"})
        );
    }

    #[tokio::test]
    async fn test_unknown_method_is_an_error_response() {
        let response = router().dispatch(call("exportKeys", json!([]), "alpha")).await;
        assert_eq!(response.into_result(), Err("Unknown method: exportKeys".into()));
    }

    #[tokio::test]
    async fn test_validation_and_handler_errors_are_strings() {
        let router = router();
        let invalid = router.dispatch(call("sendTx", json!([1, 2]), "alpha")).await;
        assert!(invalid.into_result().unwrap_err().contains("executionPayload"));

        let failed = router
            .dispatch(call("getContractMetadata", json!(["0xdead"]), "alpha"))
            .await;
        assert!(failed.into_result().unwrap_err().contains("not registered"));
    }

    #[tokio::test]
    async fn test_resource_failure_reported_to_caller() {
        let router = router();
        let mut envelope = call("getAccounts", json!([]), "alpha");
        envelope.context.chain_id = 0;
        let err = router.dispatch(envelope).await.into_result().unwrap_err();
        assert!(err.contains("chain 0 is not served"), "{err}");
    }

    #[tokio::test]
    async fn test_batch_runs_in_order() {
        let router = router();
        let response = router
            .dispatch(call(
                "batch",
                json!([[
                    {"name": "getAccounts"},
                    {"name": "registerSender", "args": ["0x1", "bob"]}
                ]]),
                "alpha",
            ))
            .await;
        let results = response.into_result().unwrap();
        assert_eq!(results[0]["name"], "getAccounts");
        assert_eq!(results[1]["result"]["args"], json!(["0x1", "bob"]));

        let nested = router
            .dispatch(call("batch", json!([[{"name": "batch", "args": [[]]}]]), "alpha"))
            .await;
        assert!(nested.into_result().unwrap_err().contains("Unknown method: batch"));
    }

    #[tokio::test]
    async fn test_route_answers_through_sink_and_catches_panics() {
        let router = router();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn MessageSink> = Arc::new(ChannelSink(tx));

        let crash = serde_json::to_value(call("profileTx", json!([{}, {}]), "alpha")).unwrap();
        router.route(crash, Arc::clone(&sink));
        let response: ResponseEnvelope = serde_json::from_value(rx.recv().await.unwrap()).unwrap();
        assert_eq!(response.id, "profileTx-1");
        assert!(response.into_result().unwrap_err().contains("internal error"));

        router.route(json!({"id": "bad-1", "method": "getAccounts"}), Arc::clone(&sink));
        let malformed = rx.recv().await.unwrap();
        assert_eq!(malformed["id"], "bad-1");
        assert!(malformed["error"].is_string());

        router.route(json!(42), sink);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_authorization_answer_reaches_originating_call() {
        let router = router();
        let mut outbox = router.broker().subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn MessageSink> = Arc::new(ChannelSink(tx));

        let send = serde_json::to_value(call("sendTx", json!([{"calls": []}, {}]), "alpha")).unwrap();
        router.route(send, Arc::clone(&sink));

        let prompt = outbox.recv().await.unwrap();
        assert_eq!(prompt["appId"], "alpha");
        router.route(
            json!({
                "type": "authorization-response",
                "id": prompt["id"],
                "appId": "wallet-ui",
                "result": {"approved": true}
            }),
            sink,
        );

        let response = rx.recv().await.unwrap();
        assert_eq!(response["id"], "sendTx-1");
        assert_eq!(response["result"]["approval"], json!({"approved": true}));
    }
}
