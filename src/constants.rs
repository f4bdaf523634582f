//! Wire limits and timing defaults shared across the bridge.

/// Hard ceiling of a single browser native-messaging message (host → extension).
pub const CHANNEL_HARD_LIMIT: usize = 1024 * 1024;

/// Largest JSON payload sent as one frame before chunking engages (900 KiB).
///
/// Leaves headroom under [`CHANNEL_HARD_LIMIT`] for the chunk envelope.
pub const DEFAULT_CHUNK_THRESHOLD: usize = 900 * 1024;

/// Bytes reserved per chunk frame for envelope metadata.
pub const DEFAULT_CHUNK_OVERHEAD: usize = 200;

/// Inbound frames declaring more than this are skipped (64 MiB, the browser's
/// extension → host limit).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Most chunks one reassembled message may declare (about 3.5 GiB at the
/// default threshold). Envelopes claiming more are dropped.
pub const MAX_CHUNKS_PER_MESSAGE: u32 = 4096;

/// Incomplete chunk sets with no activity for this long are evicted.
pub const DEFAULT_STALE_CHUNK_TIMEOUT_SECS: u64 = 30;

/// How often the reassembler cleanup task runs.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 10;

/// Socket connect attempts made by the native host before giving up.
pub const DEFAULT_CONNECT_RETRIES: u32 = 5;

/// Linear backoff step between connect attempts, in milliseconds.
pub const DEFAULT_CONNECT_RETRY_BASE_MS: u64 = 300;

/// Name of the socket file inside the runtime directory.
pub const SOCKET_FILE_NAME: &str = "wallet-bridge.sock";

/// Native-messaging host name registered with the browser.
pub const NATIVE_HOST_NAME: &str = "com.wallet_bridge.host";

/// Read buffer size for transport reader loops (64 KiB).
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Capacity of the notification broadcast channel (events + authorization requests).
pub const NOTIFICATION_CAPACITY: usize = 256;
