//! # Message Buffer Module
//!
//! The broker keeps two ordered queues of in-flight payload records: TX
//! (fed by application SEND, drained by simulator FETCH) and RX (fed by
//! simulator POST, drained by application RECEIVE).
//!
//! ## Ordering Contract
//!
//! Scans always start at the head, so among entries matching a filter the
//! earliest-arrived wins; without a filter the absolute head wins. FIFO
//! therefore holds within a single `source` filter on TX and a single
//! `destination` filter on RX. Across filters no ordering is promised.
//!
//! ## Concurrency
//!
//! Each queue is guarded by its own async mutex and no operation ever
//! waits for entries to appear: empty means empty, and the caller decides
//! what an empty drain means (a NO_MESSAGE response).

use std::collections::VecDeque;
use tokio::sync::Mutex;

/// The payload carried by a queued entry: the bytes themselves, or the
/// key under which the payload store holds them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadRef {
    /// Payload bytes inline (store indirection disabled)
    Inline(Vec<u8>),
    /// Opaque payload-store key (store indirection enabled)
    Key(String),
}

impl PayloadRef {
    /// Byte length of an inline payload; keys report zero
    pub fn inline_len(&self) -> usize {
        match self {
            PayloadRef::Inline(bytes) => bytes.len(),
            PayloadRef::Key(_) => 0,
        }
    }
}

/// One in-flight payload record
///
/// Constructed by SEND (into TX) or POST (into RX) and consumed exactly
/// once by FETCH or RECEIVE. `payload_size` is the original byte length
/// as reported by the producer; it is informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub source: String,
    pub destination: String,
    pub payload: PayloadRef,
    pub payload_size: i32,
}

impl MessageEntry {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        payload: PayloadRef,
        payload_size: i32,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            payload,
            payload_size,
        }
    }
}

/// An ordered queue of [`MessageEntry`] with filtered retrieval
///
/// No size cap is enforced; backpressure is a deployment policy decision
/// outside this queue's contract.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    entries: Mutex<VecDeque<MessageEntry>>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry at the tail
    pub async fn push_back(&self, entry: MessageEntry) {
        self.entries.lock().await.push_back(entry);
    }

    /// Remove and return the head entry, if any
    pub async fn pop_front(&self) -> Option<MessageEntry> {
        self.entries.lock().await.pop_front()
    }

    /// Remove and return the first entry matching `predicate`
    ///
    /// The scan runs from the head, so the earliest-arrived match wins.
    pub async fn pop_first_where<F>(&self, predicate: F) -> Option<MessageEntry>
    where
        F: Fn(&MessageEntry) -> bool,
    {
        let mut entries = self.entries.lock().await;
        let index = entries.iter().position(|entry| predicate(entry))?;
        entries.remove(index)
    }

    /// Current queue depth
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
