//! Shared test backend and wiring helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;
use wallet_bridge::rpc::ChainContext;
use wallet_bridge::worker::serve_connection;
use wallet_bridge::{
    AuthorizationBroker, FramedTransport, InstanceContext, MessageRouter, RpcProxy, SessionKey,
    SessionRegistry, TransportConfig, WalletBackend, WalletInstance, WalletMethod,
};

/// Per-session bundle; `serial` identifies which construction produced it.
#[derive(Debug)]
pub struct Resources {
    pub serial: usize,
}

#[derive(Debug)]
pub struct Instance {
    pub resources: Arc<Resources>,
    pub context: InstanceContext,
}

#[async_trait]
impl WalletInstance for Instance {
    async fn invoke(&self, method: WalletMethod, args: Vec<Value>) -> Result<Value> {
        match method {
            WalletMethod::SendTx => {
                let approval = self
                    .context
                    .request_authorization(method.name(), args[0].clone())
                    .await?;
                self.context.emit_event("txSent", json!({"app": self.context.app_id.as_str()}));
                Ok(json!({"txHash": "0xfeed", "approval": approval}))
            }
            _ => Ok(json!({
                "method": method.name(),
                "app": self.context.app_id.as_str(),
                "bundle": self.resources.serial,
                "args": args,
            })),
        }
    }
}

/// Backend counting constructions. Resource creation waits on `gate` when set.
#[derive(Default)]
pub struct CountingBackend {
    pub resources_built: AtomicUsize,
    pub instances_built: AtomicUsize,
    pub gate: Option<Arc<Notify>>,
}

#[async_trait]
impl WalletBackend for CountingBackend {
    type Resources = Resources;
    type Instance = Instance;

    async fn create_resources(&self, _key: SessionKey) -> Result<Resources> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let serial = self.resources_built.fetch_add(1, Ordering::SeqCst);
        Ok(Resources { serial })
    }

    async fn create_instance(
        &self,
        resources: Arc<Resources>,
        context: InstanceContext,
    ) -> Result<Instance> {
        self.instances_built.fetch_add(1, Ordering::SeqCst);
        Ok(Instance { resources, context })
    }
}

pub const CONTEXT: ChainContext = ChainContext {
    chain_id: 1,
    version: 1,
};

pub fn router(backend: &Arc<CountingBackend>) -> Arc<MessageRouter<CountingBackend>> {
    let registry = SessionRegistry::new(Arc::clone(backend), AuthorizationBroker::default());
    Arc::new(MessageRouter::new(Arc::new(registry)))
}

/// Connect a proxy for `app_id` to `router` over an in-memory pipe.
pub fn connect(
    router: &Arc<MessageRouter<CountingBackend>>,
    app_id: &str,
    config: &TransportConfig,
) -> (Arc<FramedTransport>, Arc<RpcProxy>) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let (server_read, server_write) = tokio::io::split(server_io);
    tokio::spawn(serve_connection(
        server_read,
        server_write,
        Arc::clone(router),
        config.clone(),
        "test-peer",
    ));

    let (client_read, client_write) = tokio::io::split(client_io);
    let transport = Arc::new(FramedTransport::new(client_write, config.clone()));
    let proxy = RpcProxy::attach(&transport, app_id, CONTEXT, None);
    transport.spawn_reader(client_read);
    (transport, proxy)
}
