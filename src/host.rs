//! Native-messaging host: relays between the browser and the worker socket.
//!
//! ```text
//!  browser ◄─stdio─► [extension transport] ◄──► [worker transport] ◄─unix socket─► worker
//! ```
//!
//! Each side reassembles what it reads and re-chunks what it writes, so the
//! relay works with whole messages and each hop applies its own frame limit.
//! The relay ends as soon as either side reaches end-of-stream.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;

use crate::config::BridgeConfig;
use crate::transport::{with_reassembly, FramedTransport, TransportConfig};

/// Connect to the worker socket, retrying with linear backoff.
///
/// Attempt `n` (zero-based) waits `n * base_ms` before connecting, which
/// covers a worker that is still starting up.
pub async fn connect_with_retry(path: &Path, retries: u32, base_ms: u64) -> Result<UnixStream> {
    let retries = retries.max(1);
    let mut last_err: Option<std::io::Error> = None;
    for attempt in 0..retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(attempt) * base_ms)).await;
        }
        match UnixStream::connect(path).await {
            Ok(stream) => {
                log::info!("[Host] Connected to worker at {}", path.display());
                return Ok(stream);
            }
            Err(e) => {
                log::warn!(
                    "[Host] Connect attempt {}/{retries} to {} failed: {e}",
                    attempt + 1,
                    path.display()
                );
                last_err = Some(e);
            }
        }
    }
    Err(anyhow!(
        "Failed to connect to worker socket after {retries} attempts: {}: {}",
        path.display(),
        last_err.map_or_else(|| "unknown error".to_owned(), |e| e.to_string())
    ))
}

/// Forward every whole message read by `from` to `to`.
fn forward(from: &FramedTransport, to: &Arc<FramedTransport>, label: &'static str) {
    let target = Arc::downgrade(to);
    from.on_message(with_reassembly(
        move |message| {
            let Some(target) = target.upgrade() else {
                return;
            };
            if let Err(e) = target.send(&message) {
                log::warn!("[Host] Dropping {label} message: {e:#}");
            }
        },
        from.config(),
        from.closed_token(),
    ));
}

/// Relay messages between the extension stream and the worker stream.
///
/// Returns when either side ends; queued frames toward the other side are
/// flushed first. An I/O error on the side that ended is returned.
pub async fn relay<ER, EW, WR, WW>(
    extension_reader: ER,
    extension_writer: EW,
    worker_reader: WR,
    worker_writer: WW,
    config: TransportConfig,
) -> Result<()>
where
    ER: AsyncRead + Unpin + Send + 'static,
    EW: AsyncWrite + Unpin + Send + 'static,
    WR: AsyncRead + Unpin + Send + 'static,
    WW: AsyncWrite + Unpin + Send + 'static,
{
    let extension = Arc::new(FramedTransport::new(extension_writer, config.clone()));
    let worker = Arc::new(FramedTransport::new(worker_writer, config));

    forward(&extension, &worker, "extension -> worker");
    forward(&worker, &extension, "worker -> extension");

    let mut extension_read = extension.spawn_reader(extension_reader);
    let mut worker_read = worker.spawn_reader(worker_reader);

    let ended = tokio::select! {
        result = &mut extension_read => {
            log::info!("[Host] Extension side closed");
            result
        }
        result = &mut worker_read => {
            log::info!("[Host] Worker side closed");
            result
        }
    };

    for (side, transport) in [("extension", &extension), ("worker", &worker)] {
        if let Err(e) = transport.shutdown().await {
            log::debug!("[Host] {side} writer ended with: {e:#}");
        }
    }
    extension_read.abort();
    worker_read.abort();

    ended.context("relay reader task failed")?
}

/// Run the host on stdin/stdout against the configured worker socket.
pub async fn run_host(config: &BridgeConfig) -> Result<()> {
    log::info!("[Host] Starting native messaging host (pid {})", std::process::id());
    let stream = connect_with_retry(
        &config.socket_path,
        config.connect_retries,
        config.connect_retry_base_ms,
    )
    .await?;
    let (worker_reader, worker_writer) = stream.into_split();

    relay(
        tokio::io::stdin(),
        tokio::io::stdout(),
        worker_reader,
        worker_writer,
        config.transport(),
    )
    .await
}
