//! Request/response correlation over one-way message channels.
//!
//! Turns `send` + `on_message` into awaited calls: every outbound call gets a
//! fresh id and a pending continuation; the response carrying the same id
//! resolves it exactly once.
//!
//! # Message shapes
//!
//! ```text
//! call      {"method": "...", "args": [...], "id": "...", "appId": "...", "context": {"chainId": 1, "version": 1}}
//! response  {"id": "...", "result": ...}  |  {"id": "...", "error": "..."}
//! event     {"type": "event", "appId": "...", "name": "...", "payload": ...}
//! auth req  {"type": "authorization-request", "id": "...", "appId": "...", "method": "...", "payload": ...}
//! auth resp {"type": "authorization-response", "id": "...", "appId": "...", "result": ... | "error": "..."}
//! ```

pub mod client;
pub mod pending;
pub mod protocol;
pub mod proxy;
pub mod schema;

use std::time::Duration;

pub use client::WalletClient;
pub use protocol::{
    AuthorizationRequest, AuthorizationResponse, CallEnvelope, ChainContext, EventNotification,
    Inbound, Notification, ResponseEnvelope,
};
pub use proxy::RpcProxy;
pub use schema::WalletMethod;

/// Why an outbound call did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The peer answered with an error string.
    #[error("remote error: {0}")]
    Remote(String),
    /// The channel closed before or while the call was in flight.
    #[error("channel closed")]
    ChannelClosed,
    /// No response arrived within the caller's timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    /// The envelope could not be queued on the channel.
    #[error("send failed: {0}")]
    Send(String),
    /// Arguments were rejected before sending.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
}
