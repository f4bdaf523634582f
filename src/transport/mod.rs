//! Framed, size-limited message transport.
//!
//! Carries JSON messages over any byte stream (native-messaging stdio pipe,
//! worker Unix socket, in-memory duplex in tests). Oversized messages are
//! split into chunk envelopes on send and reassembled on receive.
//!
//! # Architecture
//!
//! ```text
//!  send(&Value) ──► serialize ──► ≤ threshold? ──yes──► one frame ─┐
//!                                      │ no                        │
//!                                      └──► split_message ──► N chunk frames
//!                                                                  ▼
//!                                                  mpsc ──► writer task ──► AsyncWrite
//!
//!  AsyncRead ──► reader task ──► FrameDecoder ──► handler(Value)
//!                                                  (with_reassembly: ChunkReassembler first)
//! ```
//!
//! A single writer task owns the write half, so frames leave in the order
//! `send` queued them. See [`framing`] for the wire format.

pub mod chunking;
pub mod framing;
pub mod reassembly;

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    DEFAULT_CHUNK_OVERHEAD, DEFAULT_CHUNK_THRESHOLD, DEFAULT_CLEANUP_INTERVAL_SECS,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_STALE_CHUNK_TIMEOUT_SECS, READ_BUFFER_SIZE,
};
use chunking::{split_message, ChunkIdGenerator};
use framing::{encode_frame, FrameDecoder};
use reassembly::{spawn_cleanup, ChunkReassembler};

/// Transport limits and timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Largest serialized message sent as a single frame.
    pub chunk_threshold: usize,
    /// Bytes reserved per chunk frame for envelope metadata.
    pub chunk_overhead: usize,
    /// Inbound frames declaring more bytes than this are skipped.
    pub max_frame_size: usize,
    /// Incomplete chunk sets idle for longer than this are evicted.
    pub stale_chunk_timeout: Duration,
    /// Period of the reassembler cleanup task.
    pub cleanup_interval: Duration,
}

impl TransportConfig {
    /// Data budget of one chunk envelope.
    pub fn max_chunk_data(&self) -> usize {
        self.chunk_threshold.saturating_sub(self.chunk_overhead)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            chunk_overhead: DEFAULT_CHUNK_OVERHEAD,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            stale_chunk_timeout: Duration::from_secs(DEFAULT_STALE_CHUNK_TIMEOUT_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
        }
    }
}

/// Anything that can push a JSON message toward the peer.
///
/// The RPC and routing layers only depend on this, not on a concrete transport.
pub trait MessageSink: Send + Sync {
    /// Queue `message` for delivery.
    fn send_message(&self, message: &Value) -> Result<()>;
}

/// Callback receiving every inbound message.
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Bidirectional framed transport over an async byte stream.
pub struct FramedTransport {
    /// Sender for encoded frames to the writer task.
    frame_tx: UnboundedSender<Vec<u8>>,
    /// Current inbound handler; replaced by each `on_message` call.
    handler: Arc<RwLock<Option<MessageHandler>>>,
    config: TransportConfig,
    chunk_ids: ChunkIdGenerator,
    /// Cancelled once either direction of the stream has ended.
    closed: CancellationToken,
    write_handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl std::fmt::Debug for FramedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("config", &self.config)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl FramedTransport {
    /// Create a transport writing to `writer`.
    ///
    /// Spawns the writer task immediately. Register a handler with
    /// [`on_message`](Self::on_message) before starting the reader with
    /// [`spawn_reader`](Self::spawn_reader).
    pub fn new<W>(writer: W, config: TransportConfig) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let closed = CancellationToken::new();
        let write_handle = tokio::spawn(Self::write_loop(writer, frame_rx, closed.clone()));

        Self {
            frame_tx,
            handler: Arc::new(RwLock::new(None)),
            config,
            chunk_ids: ChunkIdGenerator::new(),
            closed,
            write_handle: Mutex::new(Some(write_handle)),
        }
    }

    /// Register the inbound message handler, replacing any previous one.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(Arc::new(handler));
        }
    }

    /// Send a message, chunking it if it exceeds the threshold.
    ///
    /// Returns the number of frames queued. Fails immediately once the
    /// transport is closed.
    pub fn send(&self, message: &Value) -> Result<usize> {
        if self.closed.is_cancelled() {
            bail!("transport closed");
        }

        let json = serde_json::to_string(message).context("serialize outbound message")?;
        if json.len() <= self.config.chunk_threshold {
            self.queue(encode_frame(json.as_bytes())?)?;
            return Ok(1);
        }

        let chunk_id = self.chunk_ids.next_id();
        let chunks = split_message(&json, self.config.max_chunk_data(), &chunk_id);
        log::debug!(
            "[Transport] Chunking {} byte message into {} frames ({chunk_id})",
            json.len(),
            chunks.len()
        );
        for chunk in &chunks {
            let payload = serde_json::to_vec(chunk).context("serialize chunk envelope")?;
            self.queue(encode_frame(&payload)?)?;
        }
        Ok(chunks.len())
    }

    fn queue(&self, frame: Vec<u8>) -> Result<()> {
        if self.frame_tx.send(frame).is_err() {
            bail!("transport closed");
        }
        Ok(())
    }

    /// Start the reader task on `reader`.
    ///
    /// Resolves to `Ok(())` on end-of-stream and to `Err` on an I/O error.
    /// Either way the transport is marked closed.
    pub fn spawn_reader<R>(&self, reader: R) -> JoinHandle<Result<()>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let max_frame_size = self.config.max_frame_size;
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let result = Self::read_loop(reader, handler, max_frame_size).await;
            closed.cancel();
            result
        })
    }

    /// Token cancelled when the stream ends in either direction.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Returns true once the stream has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Transport limits in use.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Stop accepting sends, write out queued frames, and close the write
    /// direction so the peer sees end-of-stream.
    pub async fn shutdown(&self) -> Result<()> {
        self.closed.cancel();
        let handle = self.write_handle.lock().ok().and_then(|mut h| h.take());
        match handle {
            Some(handle) => handle.await.context("writer task panicked")?,
            None => Ok(()),
        }
    }

    /// Read loop: decodes frames and hands each message to the current handler.
    async fn read_loop<R>(
        mut reader: R,
        handler: Arc<RwLock<Option<MessageHandler>>>,
        max_frame_size: usize,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = FrameDecoder::new(max_frame_size);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = reader.read(&mut buf).await.context("transport read failed")?;
            if n == 0 {
                if decoder.has_partial() {
                    log::warn!("[Transport] Stream ended inside a frame");
                }
                log::info!("[Transport] End of stream");
                return Ok(());
            }

            for message in decoder.feed(&buf[..n]) {
                let current = handler.read().ok().and_then(|h| h.clone());
                match current {
                    Some(handle) => handle(message),
                    None => log::warn!("[Transport] No message handler registered, dropping message"),
                }
            }
        }
    }

    /// Write loop: drains queued frames into the stream in order.
    ///
    /// Exits once every sender is gone, or after `closed` fires and the
    /// already-queued frames have been written.
    async fn write_loop<W>(
        mut writer: W,
        mut frame_rx: UnboundedReceiver<Vec<u8>>,
        closed: CancellationToken,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                biased;
                frame = frame_rx.recv() => frame,
                () = closed.cancelled() => {
                    frame_rx.close();
                    frame_rx.recv().await
                }
            };
            let Some(frame) = frame else { break };

            let written = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                log::error!("[Transport] Write error: {e}");
                closed.cancel();
                return Err(e).context("transport write failed");
            }
        }
        // Drain anything still queued after close() before exiting.
        while let Ok(frame) = frame_rx.try_recv() {
            writer.write_all(&frame).await.context("transport write failed")?;
        }
        writer.flush().await.context("transport flush failed")?;
        // Peer reads end-of-stream once we are done writing.
        writer.shutdown().await.context("transport shutdown failed")?;
        Ok(())
    }
}

impl MessageSink for FramedTransport {
    fn send_message(&self, message: &Value) -> Result<()> {
        self.send(message).map(|_| ())
    }
}

impl Drop for FramedTransport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Wrap `handler` so chunk envelopes are reassembled before it sees them.
///
/// Spawns the periodic cleanup task, which stops when `cancel` fires.
pub fn with_reassembly<F>(
    handler: F,
    config: &TransportConfig,
    cancel: CancellationToken,
) -> impl Fn(Value) + Send + Sync + 'static
where
    F: Fn(Value) + Send + Sync + 'static,
{
    let reassembler = Arc::new(Mutex::new(ChunkReassembler::new(config.stale_chunk_timeout)));
    spawn_cleanup(Arc::clone(&reassembler), config.cleanup_interval, cancel);

    move |message| {
        let complete = match reassembler.lock() {
            Ok(mut reassembler) => reassembler.process(message),
            Err(_) => {
                log::error!("[Reassembly] Reassembler lock poisoned, dropping message");
                None
            }
        };
        if let Some(message) = complete {
            handler(message);
        }
    }
}
