//! # Payload Store Adapter Module
//!
//! When store indirection is enabled, payload bytes live in an external
//! key/value service and only opaque keys travel on the broker's
//! connection streams. This module is the broker-side adapter over that
//! service: a narrow async trait for the raw key/value operations, the
//! key-minting scheme, and a timeout-enforcing handle the verb handlers
//! call.
//!
//! ## Key Schema
//!
//! Keys have the form `<timestamp>-<client-id>-<counter>` where the
//! counter is a 20-bit rolling integer advanced atomically per client, so
//! two payloads stored by one client within the same millisecond still
//! receive distinct keys.
//!
//! ## Failure Surface
//!
//! Store failures (backend errors and timeouts alike) surface as empty
//! returns. The broker treats an empty return as "no payload available"
//! and answers NO_MESSAGE where a response is owed, rather than
//! propagating the backend error to the peer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

use crate::defaults::STORE_TIMEOUT;
use crate::utils::current_timestamp_ms;

/// Rolling per-client counter width
const COUNTER_BITS: u32 = 20;
const COUNTER_MASK: u32 = (1 << COUNTER_BITS) - 1;

/// Raw key/value operations the broker requires of a payload store
///
/// Implementations must be safe to call concurrently from multiple
/// handlers. This trait is the seam where a networked key/value client
/// plugs in; [`MemoryStore`] is the in-process implementation.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any previous value
    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()>;

    /// Atomic get-and-delete
    async fn take(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Non-destructive get
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

/// In-process payload store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PayloadStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.entries.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn take(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.remove(key))
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }
}

/// Generates store keys with a rolling per-client counter
#[derive(Debug, Default)]
pub struct KeyMint {
    counters: std::sync::Mutex<HashMap<String, u32>>,
}

impl KeyMint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next key for `client_id`
    pub fn mint(&self, client_id: &str) -> String {
        let counter = {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            let slot = counters.entry(client_id.to_string()).or_insert(0);
            let value = *slot;
            *slot = (*slot + 1) & COUNTER_MASK;
            value
        };
        format!("{}-{}-{}", current_timestamp_ms(), client_id, counter)
    }

    #[cfg(test)]
    fn preset(&self, client_id: &str, value: u32) {
        self.counters
            .lock()
            .unwrap()
            .insert(client_id.to_string(), value);
    }
}

/// The handle verb handlers use for store indirection
///
/// Wraps a [`PayloadStore`] backend with key minting and a per-operation
/// timeout. All failures collapse to empty returns after a logged warning.
pub struct StoreHandle {
    backend: Arc<dyn PayloadStore>,
    mint: KeyMint,
    op_timeout: Duration,
}

impl StoreHandle {
    pub fn new(backend: Arc<dyn PayloadStore>) -> Self {
        Self::with_timeout(backend, STORE_TIMEOUT)
    }

    pub fn with_timeout(backend: Arc<dyn PayloadStore>, op_timeout: Duration) -> Self {
        Self {
            backend,
            mint: KeyMint::new(),
            op_timeout,
        }
    }

    /// Store payload bytes under a freshly minted key
    ///
    /// Returns the key, or `None` when the backend failed or timed out.
    pub async fn store(&self, client_id: &str, bytes: Vec<u8>) -> Option<String> {
        let key = self.mint.mint(client_id);
        match timeout(self.op_timeout, self.backend.put(&key, bytes)).await {
            Ok(Ok(())) => Some(key),
            Ok(Err(e)) => {
                warn!("payload store write failed for key {}: {}", key, e);
                None
            }
            Err(_) => {
                warn!("payload store write timed out for key {}", key);
                None
            }
        }
    }

    /// Atomic get-and-delete of the bytes under `key`
    pub async fn check_out(&self, key: &str) -> Option<Vec<u8>> {
        match timeout(self.op_timeout, self.backend.take(key)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!("payload store check-out failed for key {}: {}", key, e);
                None
            }
            Err(_) => {
                warn!("payload store check-out timed out for key {}", key);
                None
            }
        }
    }

    /// Non-destructive read of the bytes under `key`
    pub async fn peek(&self, key: &str) -> Option<Vec<u8>> {
        match timeout(self.op_timeout, self.backend.get(key)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!("payload store peek failed for key {}: {}", key, e);
                None
            }
            Err(_) => {
                warn!("payload store peek timed out for key {}", key);
                None
            }
        }
    }
}
