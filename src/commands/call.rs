//! One-shot wallet call over the worker socket.
//!
//! ```bash
//! wallet-bridge call getAccounts --app-id my-dapp --chain-id 31337 --chain-version 1
//! wallet-bridge call registerSender --args '["0x1234", "alice"]'
//! ```
//!
//! The result is returned to the caller for printing on stdout. Events and
//! authorization prompts that arrive meanwhile are printed to stderr.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::config::BridgeConfig;
use crate::host::connect_with_retry;
use crate::rpc::{ChainContext, RpcProxy, WalletClient, WalletMethod};
use crate::transport::FramedTransport;

/// Parameters of a debug call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Wallet method name.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Application identity to call as.
    pub app_id: String,
    /// Target chain.
    pub context: ChainContext,
}

/// Parse `--args`: a JSON array, or a single JSON value taken as one argument.
pub fn parse_args(raw: Option<&str>) -> Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    match serde_json::from_str(raw).context("--args must be valid JSON")? {
        Value::Array(args) => Ok(args),
        single => Ok(vec![single]),
    }
}

/// Connect to the worker, run the call, and return its result.
///
/// Known methods are checked against the method table first; unknown names
/// are sent as-is so the worker's rejection can be inspected.
pub async fn run(config: &BridgeConfig, options: CallOptions) -> Result<Value> {
    let stream = connect_with_retry(
        &config.socket_path,
        config.connect_retries,
        config.connect_retry_base_ms,
    )
    .await?;
    let (reader, writer) = stream.into_split();

    let transport = Arc::new(FramedTransport::new(writer, config.transport()));
    let proxy = RpcProxy::attach(
        &transport,
        options.app_id,
        options.context,
        config.call_timeout(),
    );
    proxy.on_event(|event| {
        eprintln!("event [{}] {}: {}", event.app_id, event.name, event.payload);
    });
    proxy.on_authorization_request(|request| {
        eprintln!(
            "authorization requested [{}] {} ({}): {}",
            request.app_id, request.method, request.id, request.payload
        );
    });
    let reader = transport.spawn_reader(reader);

    let outcome = match WalletMethod::from_name(&options.method) {
        Some(method) => {
            WalletClient::new(Arc::clone(&proxy))
                .invoke(method, options.args)
                .await
        }
        None => proxy.call(&options.method, options.args).await,
    };

    if let Err(e) = transport.shutdown().await {
        log::debug!("[Rpc] Call transport shutdown: {e:#}");
    }
    reader.abort();

    match outcome {
        Ok(result) => Ok(result),
        Err(e) => bail!("{} failed: {e}", options.method),
    }
}
