//! Wallet Bridge - wallet RPC between a browser extension and a desktop wallet.
//!
//! The extension talks to a native-messaging host over stdio; the host
//! relays to the desktop application's background worker over a Unix
//! socket; the worker executes wallet operations on behalf of each calling
//! application.
//!
//! # Architecture
//!
//! ```text
//! extension ◄─stdio─► host ◄─unix socket─► worker
//!   RpcProxy           relay                MessageRouter ──► SessionRegistry ──► WalletBackend
//! ```
//!
//! # Modules
//!
//! - [`transport`] - Length-prefixed framing, chunking and reassembly
//! - [`rpc`] - Call/response correlation and the typed wallet interface
//! - [`session`] - Per-chain resources and per-application instances
//! - [`router`] - Worker-side dispatch and authorization prompts
//! - [`worker`] - Worker socket server
//! - [`host`] - Native-messaging host relay
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod commands;
pub mod config;
pub mod constants;
pub mod host;
pub mod router;
pub mod rpc;
pub mod session;
pub mod transport;
pub mod worker;

// Re-export commonly used types
pub use config::BridgeConfig;
pub use router::{AuthorizationBroker, MessageRouter};
pub use rpc::{CallError, RpcProxy, WalletClient, WalletMethod};
pub use session::{AppId, InstanceContext, SessionKey, SessionRegistry, WalletBackend, WalletInstance};
pub use transport::{FramedTransport, MessageSink, TransportConfig};
pub use worker::WorkerServer;
