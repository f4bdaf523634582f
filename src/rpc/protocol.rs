//! Wire types for calls, responses and notifications.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `type` of an event notification.
pub const TYPE_EVENT: &str = "event";
/// `type` of an authorization prompt sent toward the user-facing side.
pub const TYPE_AUTHORIZATION_REQUEST: &str = "authorization-request";
/// `type` of the user's answer to an authorization prompt.
pub const TYPE_AUTHORIZATION_RESPONSE: &str = "authorization-response";

/// Chain identity a call is made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainContext {
    /// L1 chain id.
    pub chain_id: u64,
    /// Rollup protocol version.
    pub version: u64,
}

/// An outbound RPC call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    /// Wallet method name.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Correlation id echoed by the response.
    pub id: String,
    /// Calling application.
    pub app_id: String,
    /// Chain the call targets.
    pub context: ChainContext,
}

/// Answer to a [`CallEnvelope`].
///
/// Exactly one of `result` / `error` is meaningful; a non-empty `error`
/// always wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Id of the call being answered.
    pub id: String,
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Successful response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Collapse into the call outcome. A missing result means `null`.
    pub fn into_result(self) -> std::result::Result<Value, String> {
        match self.error {
            Some(error) if !error.is_empty() => Err(error),
            _ => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// State-change notification emitted by a wallet instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    /// Application whose instance emitted the event.
    pub app_id: String,
    /// Event name.
    pub name: String,
    /// Event data.
    #[serde(default)]
    pub payload: Value,
}

/// Prompt asking the user to authorize an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    /// Prompt id, echoed by the [`AuthorizationResponse`].
    pub id: String,
    /// Application whose operation needs authorization.
    pub app_id: String,
    /// Operation being authorized.
    pub method: String,
    /// Details to show the user.
    #[serde(default)]
    pub payload: Value,
}

/// The user's answer to an [`AuthorizationRequest`].
///
/// `app_id` names whoever produced the answer (usually the wallet UI), not
/// necessarily the application that triggered the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationResponse {
    /// Id of the prompt being answered.
    pub id: String,
    /// Responder identity.
    #[serde(default)]
    pub app_id: String,
    /// Approval payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthorizationResponse {
    /// Collapse into the prompt outcome. A non-empty `error` rejects.
    pub fn into_result(self) -> std::result::Result<Value, String> {
        match self.error {
            Some(error) if !error.is_empty() => Err(error),
            _ => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Notifications pushed from the worker without a matching call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    /// State change.
    Event(EventNotification),
    /// Authorization prompt.
    AuthorizationRequest(AuthorizationRequest),
}

impl Notification {
    /// JSON form for the wire.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Inbound traffic on the calling side, classified by its `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Event notification.
    Event(EventNotification),
    /// Authorization prompt.
    AuthorizationRequest(AuthorizationRequest),
    /// RPC response (no recognized `type`).
    Response(ResponseEnvelope),
}

impl Inbound {
    /// Classify a raw inbound message.
    pub fn classify(message: Value) -> Result<Self> {
        let kind = message.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            TYPE_EVENT => Ok(Self::Event(
                serde_json::from_value(message).context("malformed event notification")?,
            )),
            TYPE_AUTHORIZATION_REQUEST => Ok(Self::AuthorizationRequest(
                serde_json::from_value(message).context("malformed authorization request")?,
            )),
            _ => Ok(Self::Response(
                serde_json::from_value(message).context("malformed response envelope")?,
            )),
        }
    }
}

/// Inbound traffic on the worker side.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerInbound {
    /// RPC call.
    Call(CallEnvelope),
    /// Answer to an authorization prompt.
    AuthorizationResponse(AuthorizationResponse),
}

impl WorkerInbound {
    /// Classify a raw inbound message.
    pub fn classify(message: Value) -> Result<Self> {
        if message.get("type").and_then(Value::as_str) == Some(TYPE_AUTHORIZATION_RESPONSE) {
            return Ok(Self::AuthorizationResponse(
                serde_json::from_value(message).context("malformed authorization response")?,
            ));
        }
        Ok(Self::Call(
            serde_json::from_value(message).context("malformed call envelope")?,
        ))
    }
}
