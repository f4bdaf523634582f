//! The wallet interface: method names and argument shapes.
//!
//! One table drives both sides. The calling side marshals typed arguments
//! against it before sending; the router validates and coerces inbound
//! arguments against it before dispatch.

use serde_json::Value;

/// JSON type a parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Anything, including `null`.
    Any,
    /// JSON string.
    String,
    /// Non-negative integer; decimal strings are coerced.
    Number,
    /// Boolean; `"true"` / `"false"` strings are coerced.
    Bool,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
}

impl ArgKind {
    fn label(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    /// Accept `value` as this kind, coercing where allowed.
    fn coerce(self, value: Value) -> Option<Value> {
        match (self, value) {
            (Self::Any, v) => Some(v),
            (Self::String, v @ Value::String(_))
            | (Self::Bool, v @ Value::Bool(_))
            | (Self::Object, v @ Value::Object(_))
            | (Self::Array, v @ Value::Array(_)) => Some(v),
            (Self::Number, v @ Value::Number(_)) => Some(v),
            (Self::Number, Value::String(s)) => s.trim().parse::<u64>().ok().map(Value::from),
            (Self::Bool, Value::String(s)) => match s.as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }
}

/// One positional parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    /// Parameter name, for error messages.
    pub name: &'static str,
    /// Accepted type.
    pub kind: ArgKind,
    /// Optional parameters may be omitted or `null`.
    pub optional: bool,
}

const fn required(name: &'static str, kind: ArgKind) -> Param {
    Param { name, kind, optional: false }
}

const fn optional(name: &'static str, kind: ArgKind) -> Param {
    Param { name, kind, optional: true }
}

const TX_PARAMS: &[Param] = &[
    required("executionPayload", ArgKind::Object),
    required("options", ArgKind::Object),
];

const REGISTER_SENDER_PARAMS: &[Param] = &[
    required("address", ArgKind::String),
    optional("alias", ArgKind::String),
];

const REGISTER_CONTRACT_PARAMS: &[Param] = &[
    required("instance", ArgKind::Object),
    optional("artifact", ArgKind::Object),
    optional("secretKey", ArgKind::String),
];

const CONTRACT_METADATA_PARAMS: &[Param] = &[required("address", ArgKind::String)];

const CONTRACT_CLASS_METADATA_PARAMS: &[Param] = &[
    required("classId", ArgKind::String),
    optional("includeArtifact", ArgKind::Bool),
];

const SIMULATE_UTILITY_PARAMS: &[Param] = &[
    required("functionName", ArgKind::String),
    required("args", ArgKind::Array),
    required("to", ArgKind::String),
    optional("authwits", ArgKind::Array),
    optional("from", ArgKind::String),
];

const CREATE_AUTH_WIT_PARAMS: &[Param] = &[
    required("from", ArgKind::String),
    required("messageHashOrIntent", ArgKind::Any),
];

const PRIVATE_EVENTS_PARAMS: &[Param] = &[
    required("contractAddress", ArgKind::String),
    required("eventMetadata", ArgKind::Object),
    required("from", ArgKind::Number),
    required("numBlocks", ArgKind::Number),
    required("recipients", ArgKind::Array),
];

const BATCH_PARAMS: &[Param] = &[required("calls", ArgKind::Array)];

/// Every operation of the wallet interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalletMethod {
    /// Chain id and protocol version the wallet is connected to.
    GetChainInfo,
    /// Accounts exposed to the calling application.
    GetAccounts,
    /// Known sender addresses.
    GetAddressBook,
    /// Register an address to discover notes from.
    RegisterSender,
    /// Register a contract instance (and optionally its artifact).
    RegisterContract,
    /// Metadata for a deployed contract.
    GetContractMetadata,
    /// Metadata for a contract class.
    GetContractClassMetadata,
    /// Simulate a transaction.
    SimulateTx,
    /// Prove and send a transaction.
    SendTx,
    /// Profile gate counts of a transaction.
    ProfileTx,
    /// Run a utility (unconstrained) function.
    SimulateUtility,
    /// Create an authorization witness.
    CreateAuthWit,
    /// Decode private events for recipients.
    GetPrivateEvents,
    /// Run several calls in order, returning every result.
    Batch,
}

impl WalletMethod {
    /// All methods, in table order.
    pub const ALL: [Self; 14] = [
        Self::GetChainInfo,
        Self::GetAccounts,
        Self::GetAddressBook,
        Self::RegisterSender,
        Self::RegisterContract,
        Self::GetContractMetadata,
        Self::GetContractClassMetadata,
        Self::SimulateTx,
        Self::SendTx,
        Self::ProfileTx,
        Self::SimulateUtility,
        Self::CreateAuthWit,
        Self::GetPrivateEvents,
        Self::Batch,
    ];

    /// Wire name.
    pub fn name(self) -> &'static str {
        match self {
            Self::GetChainInfo => "getChainInfo",
            Self::GetAccounts => "getAccounts",
            Self::GetAddressBook => "getAddressBook",
            Self::RegisterSender => "registerSender",
            Self::RegisterContract => "registerContract",
            Self::GetContractMetadata => "getContractMetadata",
            Self::GetContractClassMetadata => "getContractClassMetadata",
            Self::SimulateTx => "simulateTx",
            Self::SendTx => "sendTx",
            Self::ProfileTx => "profileTx",
            Self::SimulateUtility => "simulateUtility",
            Self::CreateAuthWit => "createAuthWit",
            Self::GetPrivateEvents => "getPrivateEvents",
            Self::Batch => "batch",
        }
    }

    /// Look up a method by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Positional parameters.
    pub fn params(self) -> &'static [Param] {
        match self {
            Self::GetChainInfo | Self::GetAccounts | Self::GetAddressBook => &[],
            Self::RegisterSender => REGISTER_SENDER_PARAMS,
            Self::RegisterContract => REGISTER_CONTRACT_PARAMS,
            Self::GetContractMetadata => CONTRACT_METADATA_PARAMS,
            Self::GetContractClassMetadata => CONTRACT_CLASS_METADATA_PARAMS,
            Self::SimulateTx | Self::SendTx | Self::ProfileTx => TX_PARAMS,
            Self::SimulateUtility => SIMULATE_UTILITY_PARAMS,
            Self::CreateAuthWit => CREATE_AUTH_WIT_PARAMS,
            Self::GetPrivateEvents => PRIVATE_EVENTS_PARAMS,
            Self::Batch => BATCH_PARAMS,
        }
    }

    /// Validate `args` against the parameter list.
    ///
    /// Coerces numeric and boolean strings, pads omitted trailing optional
    /// parameters with `null`, and rejects missing required or extra arguments.
    pub fn validate_args(self, args: Vec<Value>) -> Result<Vec<Value>, String> {
        let params = self.params();
        if args.len() > params.len() {
            return Err(format!(
                "{} takes at most {} argument(s), got {}",
                self.name(),
                params.len(),
                args.len()
            ));
        }

        let mut supplied = args.into_iter();
        let mut coerced = Vec::with_capacity(params.len());
        for param in params {
            let value = supplied.next().unwrap_or(Value::Null);
            if value.is_null() {
                if param.optional || param.kind == ArgKind::Any {
                    coerced.push(Value::Null);
                    continue;
                }
                return Err(format!("{}: missing required argument '{}'", self.name(), param.name));
            }
            match param.kind.coerce(value) {
                Some(v) => coerced.push(v),
                None => {
                    return Err(format!(
                        "{}: argument '{}' must be {}",
                        self.name(),
                        param.name,
                        param.kind.label()
                    ))
                }
            }
        }
        Ok(coerced)
    }
}

impl std::fmt::Display for WalletMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
