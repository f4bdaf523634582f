//! Table of in-flight requests awaiting a correlated reply.
//!
//! Shared by the calling-side proxy (metadata = method name) and the
//! authorization broker (metadata = originating application).

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use tokio::sync::oneshot;

/// Reply slot plus caller-supplied metadata.
type Entry<T, M> = (oneshot::Sender<T>, M);

struct Inner<T, M> {
    entries: HashMap<String, Entry<T, M>>,
    closed: bool,
}

/// Pending continuations keyed by request id.
///
/// Each entry resolves at most once: [`resolve`](Self::resolve) removes it.
pub struct PendingCalls<T, M = ()> {
    inner: Mutex<Inner<T, M>>,
}

impl<T, M> Default for PendingCalls<T, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, M> std::fmt::Debug for PendingCalls<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T, M> PendingCalls<T, M> {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register `id` and return the receiver its reply will arrive on.
    ///
    /// Must happen before the request is sent so a fast reply cannot race
    /// past registration.
    pub fn register(&self, id: impl Into<String>, meta: M) -> Result<oneshot::Receiver<T>> {
        let id = id.into();
        let Ok(mut inner) = self.inner.lock() else {
            bail!("pending table lock poisoned");
        };
        if inner.closed {
            bail!("channel closed");
        }
        if inner.entries.contains_key(&id) {
            bail!("duplicate request id {id}");
        }
        let (tx, rx) = oneshot::channel();
        inner.entries.insert(id, (tx, meta));
        Ok(rx)
    }

    /// Deliver `value` to the entry for `id`, removing it.
    ///
    /// Returns the entry's metadata, or `None` for an unknown (or already
    /// resolved) id. A receiver that gave up waiting is not an error.
    pub fn resolve(&self, id: &str, value: T) -> Option<M> {
        let (tx, meta) = self.inner.lock().ok()?.entries.remove(id)?;
        let _ = tx.send(value);
        Some(meta)
    }

    /// Remove the entry for `id` without delivering anything.
    pub fn discard(&self, id: &str) -> Option<M> {
        self.inner
            .lock()
            .ok()?
            .entries
            .remove(id)
            .map(|(_, meta)| meta)
    }

    /// Metadata of a pending entry.
    pub fn meta(&self, id: &str) -> Option<M>
    where
        M: Clone,
    {
        let inner = self.inner.lock().ok()?;
        inner.entries.get(id).map(|(_, meta)| meta.clone())
    }

    /// Resolve every pending entry with `make(meta)`.
    pub fn fail_all(&self, make: impl Fn(&M) -> T) -> usize {
        let drained: Vec<Entry<T, M>> = match self.inner.lock() {
            Ok(mut inner) => inner.entries.drain().map(|(_, entry)| entry).collect(),
            Err(_) => return 0,
        };
        let count = drained.len();
        for (tx, meta) in drained {
            let _ = tx.send(make(&meta));
        }
        count
    }

    /// Fail everything pending and refuse further registrations.
    pub fn close(&self, make: impl Fn(&M) -> T) -> usize {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
        self.fail_all(make)
    }

    /// Returns true once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|inner| inner.closed).unwrap_or(true)
    }

    /// Number of entries awaiting a reply.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
