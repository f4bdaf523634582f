//! CLI subcommand implementations for wallet-bridge.
//!
//! - [`call`] - one-shot RPC against the worker socket (debugging)
//! - [`manifest`] - browser native-messaging host manifest generation
//!
//! The `host` subcommand lives in [`crate::host`]; `config` is a one-liner
//! in the binary.

pub mod call;
pub mod manifest;

#[doc(inline)]
pub use call::{run as run_call, CallOptions};
#[doc(inline)]
pub use manifest::{build as build_manifest, install as install_manifest, Browser};
