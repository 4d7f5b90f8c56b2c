//! Fast-path counter store.
//!
//! A Redis-shaped key space: hashes of numeric counters, fixed-capacity
//! event lists, and per-key expiry. Writes go through a [`WriteBatch`] that
//! the store applies as one indivisible unit; callers rely on that for
//! counter consistency instead of taking their own locks.

pub mod memory;
pub mod ring;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use self::memory::MemoryCounterStore;
pub use self::ring::EventRing;

/// A numeric hash field value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CounterValue {
    Int(i64),
    Float(f64),
}

impl CounterValue {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    /// Integer view; floats are truncated and negatives clamp to zero.
    pub fn as_u64(self) -> u64 {
        match self {
            Self::Int(v) => v.max(0) as u64,
            Self::Float(v) if v.is_finite() && v > 0.0 => v as u64,
            Self::Float(_) => 0,
        }
    }
}

/// One operation inside a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Add an integer to a hash field (created at 0).
    IncrBy { key: String, field: String, by: i64 },
    /// Add a float to a hash field (created at 0.0).
    IncrByFloat { key: String, field: String, by: f64 },
    /// Push onto a fixed-capacity list, newest first.
    PushCapped {
        key: String,
        value: String,
        capacity: usize,
    },
    /// Set a key's time to live.
    Expire { key: String, ttl: Duration },
}

/// An ordered group of writes applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&mut self, key: impl Into<String>, field: impl Into<String>, by: i64) -> &mut Self {
        self.ops.push(BatchOp::IncrBy {
            key: key.into(),
            field: field.into(),
            by,
        });
        self
    }

    pub fn incr_float(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        by: f64,
    ) -> &mut Self {
        self.ops.push(BatchOp::IncrByFloat {
            key: key.into(),
            field: field.into(),
            by,
        });
        self
    }

    pub fn push_capped(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        capacity: usize,
    ) -> &mut Self {
        self.ops.push(BatchOp::PushCapped {
            key: key.into(),
            value: value.into(),
            capacity,
        });
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(BatchOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Low-latency store for real-time counters.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// Apply every operation in the batch, or none of them.
    async fn apply(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// All fields of a hash. Missing or expired keys yield an empty map.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, CounterValue>, StoreError>;

    /// A single hash field.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<CounterValue>, StoreError>;

    /// Up to `limit` entries of a capped list, newest first.
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;
}
