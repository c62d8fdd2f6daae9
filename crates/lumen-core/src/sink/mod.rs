//! Result persistence and display boundaries.

pub mod postgres;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::StorageError;

pub use postgres::PgResultSink;

/// Upsert-by-key persistence for completed runs.
///
/// Implementations must be idempotent: storing identical fields under the
/// same key twice leaves one entry. The controller never retries.
#[async_trait]
pub trait ResultSink: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert(&self, key: &str, fields: &Map<String, Value>) -> Result<(), StorageError>;
}

/// Fire-and-forget presentation of a prediction result.
pub trait ResultDisplay: Send + Sync {
    fn present(&self, fields: &Map<String, Value>);
}

/// In-process sink, keyed by form id.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<BTreeMap<String, Map<String, Value>>>,
    upserts: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Map<String, Value>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of upsert calls received, including repeats.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, key: &str, fields: &Map<String, Value>) -> Result<(), StorageError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), fields.clone());
        Ok(())
    }
}

/// Display that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDisplay;

impl ResultDisplay for NoopDisplay {
    fn present(&self, _fields: &Map<String, Value>) {}
}
