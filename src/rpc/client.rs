//! Typed wallet interface over an [`RpcProxy`].

use std::sync::Arc;

use serde_json::{json, Value};

use super::protocol::ChainContext;
use super::schema::WalletMethod;
use super::{CallError, RpcProxy};

type CallResult<T = Value> = Result<T, CallError>;

/// One call inside a [`WalletClient::batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCall {
    /// Method to run.
    pub method: WalletMethod,
    /// Its positional arguments.
    pub args: Vec<Value>,
}

impl BatchCall {
    /// Batch entry for `method`.
    pub fn new(method: WalletMethod, args: Vec<Value>) -> Self {
        Self { method, args }
    }
}

/// Wallet operations as typed async functions.
///
/// Arguments are checked against the method table before anything is sent,
/// so malformed calls fail locally with [`CallError::InvalidArgs`].
#[derive(Debug, Clone)]
pub struct WalletClient {
    proxy: Arc<RpcProxy>,
}

impl WalletClient {
    /// Client calling through `proxy`.
    pub fn new(proxy: Arc<RpcProxy>) -> Self {
        Self { proxy }
    }

    /// Underlying proxy (listeners, authorization answers).
    pub fn proxy(&self) -> &Arc<RpcProxy> {
        &self.proxy
    }

    /// Call `method` by table entry.
    pub async fn invoke(&self, method: WalletMethod, args: Vec<Value>) -> CallResult {
        let args = method.validate_args(args).map_err(CallError::InvalidArgs)?;
        self.proxy.call(method.name(), args).await
    }

    /// Chain the wallet is connected to.
    pub async fn get_chain_info(&self) -> CallResult<ChainContext> {
        let value = self.invoke(WalletMethod::GetChainInfo, vec![]).await?;
        serde_json::from_value(value)
            .map_err(|e| CallError::Remote(format!("malformed chain info: {e}")))
    }

    /// Accounts visible to this application.
    pub async fn get_accounts(&self) -> CallResult {
        self.invoke(WalletMethod::GetAccounts, vec![]).await
    }

    /// Registered sender addresses.
    pub async fn get_address_book(&self) -> CallResult {
        self.invoke(WalletMethod::GetAddressBook, vec![]).await
    }

    /// Register `address` as a note sender.
    pub async fn register_sender(&self, address: &str, alias: Option<&str>) -> CallResult {
        self.invoke(WalletMethod::RegisterSender, vec![json!(address), json!(alias)])
            .await
    }

    /// Register a contract instance with the wallet.
    pub async fn register_contract(
        &self,
        instance: Value,
        artifact: Option<Value>,
        secret_key: Option<&str>,
    ) -> CallResult {
        self.invoke(
            WalletMethod::RegisterContract,
            vec![instance, json!(artifact), json!(secret_key)],
        )
        .await
    }

    /// Metadata for the contract at `address`.
    pub async fn get_contract_metadata(&self, address: &str) -> CallResult {
        self.invoke(WalletMethod::GetContractMetadata, vec![json!(address)])
            .await
    }

    /// Metadata for contract class `class_id`.
    pub async fn get_contract_class_metadata(
        &self,
        class_id: &str,
        include_artifact: bool,
    ) -> CallResult {
        self.invoke(
            WalletMethod::GetContractClassMetadata,
            vec![json!(class_id), json!(include_artifact)],
        )
        .await
    }

    /// Simulate without sending.
    pub async fn simulate_tx(&self, execution_payload: Value, options: Value) -> CallResult {
        self.invoke(WalletMethod::SimulateTx, vec![execution_payload, options])
            .await
    }

    /// Prove and send; prompts the user for authorization.
    pub async fn send_tx(&self, execution_payload: Value, options: Value) -> CallResult {
        self.invoke(WalletMethod::SendTx, vec![execution_payload, options])
            .await
    }

    /// Gate-count profile of a transaction.
    pub async fn profile_tx(&self, execution_payload: Value, options: Value) -> CallResult {
        self.invoke(WalletMethod::ProfileTx, vec![execution_payload, options])
            .await
    }

    /// Run a utility function on contract `to`.
    pub async fn simulate_utility(
        &self,
        function_name: &str,
        args: Vec<Value>,
        to: &str,
        authwits: Option<Vec<Value>>,
        from: Option<&str>,
    ) -> CallResult {
        self.invoke(
            WalletMethod::SimulateUtility,
            vec![
                json!(function_name),
                Value::Array(args),
                json!(to),
                json!(authwits),
                json!(from),
            ],
        )
        .await
    }

    /// Authorization witness for `message_hash_or_intent`.
    pub async fn create_auth_wit(&self, from: &str, message_hash_or_intent: Value) -> CallResult {
        self.invoke(
            WalletMethod::CreateAuthWit,
            vec![json!(from), message_hash_or_intent],
        )
        .await
    }

    /// Private events of `contract_address` over a block range.
    pub async fn get_private_events(
        &self,
        contract_address: &str,
        event_metadata: Value,
        from: u64,
        num_blocks: u64,
        recipients: Vec<Value>,
    ) -> CallResult {
        self.invoke(
            WalletMethod::GetPrivateEvents,
            vec![
                json!(contract_address),
                event_metadata,
                json!(from),
                json!(num_blocks),
                Value::Array(recipients),
            ],
        )
        .await
    }

    /// Run `calls` in order on the wallet; resolves to one result per call.
    ///
    /// Every entry is validated locally first; nesting batches is refused.
    pub async fn batch(&self, calls: Vec<BatchCall>) -> CallResult {
        let mut entries = Vec::with_capacity(calls.len());
        for call in calls {
            if call.method == WalletMethod::Batch {
                return Err(CallError::InvalidArgs("batch cannot be nested".into()));
            }
            let args = call
                .method
                .validate_args(call.args)
                .map_err(CallError::InvalidArgs)?;
            entries.push(json!({"name": call.method.name(), "args": args}));
        }
        self.invoke(WalletMethod::Batch, vec![Value::Array(entries)])
            .await
    }
}
