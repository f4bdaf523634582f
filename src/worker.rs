//! Background-worker side of the bridge.
//!
//! Listens on a Unix socket for native-host connections. Each connection
//! gets its own framed transport feeding the shared [`MessageRouter`];
//! notifications from the router's broker are forwarded to every
//! connection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::router::MessageRouter;
use crate::session::WalletBackend;
use crate::transport::{with_reassembly, FramedTransport, MessageSink, TransportConfig};

/// `sun_path` is 104 bytes on macOS and 108 on Linux; use the smaller.
const MAX_SOCKET_PATH: usize = 104;

/// Serve one bridge connection until either side closes it.
///
/// Inbound calls are routed through `router`; router notifications are
/// written to this connection as they are emitted. Resolves to `Ok(())` on
/// end-of-stream.
pub async fn serve_connection<B, R, W>(
    reader: R,
    writer: W,
    router: Arc<MessageRouter<B>>,
    config: TransportConfig,
    peer: &str,
) -> Result<()>
where
    B: WalletBackend,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let transport = Arc::new(FramedTransport::new(writer, config.clone()));
    let closed = transport.closed_token();

    let weak = Arc::downgrade(&transport);
    let inbound_router = Arc::clone(&router);
    transport.on_message(with_reassembly(
        move |message| {
            if let Some(transport) = weak.upgrade() {
                inbound_router.route(message, transport as Arc<dyn MessageSink>);
            }
        },
        &config,
        closed.clone(),
    ));

    let mut notifications = router.broker().subscribe();
    let reader = transport.spawn_reader(reader);
    log::info!("[Worker] Connection {peer} open");

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            received = notifications.recv() => match received {
                Ok(notification) => {
                    if let Err(e) = transport.send(&notification) {
                        log::debug!("[Worker] Connection {peer} stopped forwarding: {e:#}");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("[Worker] Connection {peer} lagged, skipped {skipped} notification(s)");
                }
                Err(RecvError::Closed) => {
                    closed.cancelled().await;
                    break;
                }
            }
        }
    }

    if !reader.is_finished() {
        reader.abort();
    }
    let read_result = match reader.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(anyhow!("reader task failed: {e}")),
    };
    if let Err(e) = transport.shutdown().await {
        log::debug!("[Worker] Connection {peer} writer ended with: {e:#}");
    }
    log::info!("[Worker] Connection {peer} closed");
    read_result
}

/// Unix socket server hosting the wallet for native-host connections.
#[derive(Debug)]
pub struct WorkerServer {
    socket_path: PathBuf,
    cancel: CancellationToken,
    accept_handle: JoinHandle<()>,
}

impl WorkerServer {
    /// Bind `socket_path` and start accepting connections.
    ///
    /// Removes a stale socket file, creates the parent directory, and
    /// restricts the socket to its owner (0600).
    pub fn start<B: WalletBackend>(
        socket_path: PathBuf,
        router: Arc<MessageRouter<B>>,
        config: TransportConfig,
    ) -> Result<Self> {
        validate_socket_path(&socket_path)?;

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("Failed to remove stale socket: {}", socket_path.display())
            })?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;
        log::info!("[Worker] Listening on {}", socket_path.display());

        let cancel = CancellationToken::new();
        let accept_handle = tokio::spawn(accept_loop(
            listener,
            router,
            config,
            socket_path.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            socket_path,
            cancel,
            accept_handle,
        })
    }

    /// Path the server is bound to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting and remove the socket file. Open connections end
    /// when their peers disconnect.
    pub fn shutdown(self) {
        self.cancel.cancel();
        self.accept_handle.abort();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            log::debug!("[Worker] Socket cleanup: {e}");
        }
        log::info!("[Worker] Stopped listening on {}", self.socket_path.display());
    }
}

async fn accept_loop<B: WalletBackend>(
    listener: UnixListener,
    router: Arc<MessageRouter<B>>,
    config: TransportConfig,
    socket_path: PathBuf,
    cancel: CancellationToken,
) {
    static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _addr)) => {
                let peer = format!("conn-{}", NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed));
                let (reader, writer) = stream.into_split();
                let router = Arc::clone(&router);
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(reader, writer, router, config, &peer).await {
                        log::warn!("[Worker] Connection {peer} failed: {e:#}");
                    }
                });
            }
            Err(e) => {
                if !socket_path.exists() {
                    log::info!("[Worker] Socket file removed, stopping accept loop");
                    break;
                }
                log::error!("[Worker] Accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn validate_socket_path(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= MAX_SOCKET_PATH {
        bail!(
            "Socket path too long ({len} bytes, max {}): {}\n\
             Set WALLET_BRIDGE_SOCKET to a shorter path.",
            MAX_SOCKET_PATH - 1,
            path.display()
        );
    }
    Ok(())
}
