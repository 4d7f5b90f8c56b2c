//! In-process counter store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use super::{BatchOp, CounterStore, CounterValue, EventRing, WriteBatch};
use crate::error::StoreError;

#[derive(Debug)]
enum Entry {
    Hash(HashMap<String, CounterValue>),
    List(EventRing<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Hash,
    List,
}

impl Entry {
    fn kind(&self) -> Kind {
        match self {
            Self::Hash(_) => Kind::Hash,
            Self::List(_) => Kind::List,
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// How often `apply` drops expired keys by default.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Keyspace {
    slots: HashMap<String, Slot>,
    last_sweep: Instant,
}

impl Keyspace {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    fn purge(&mut self, now: Instant) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        self.last_sweep = now;
        before - self.slots.len()
    }
}

/// In-memory [`CounterStore`].
///
/// A single mutex guards the key space, so a [`WriteBatch`] is applied while
/// holding it once. Batches are type-checked before any write lands, which
/// keeps them all-or-nothing. Clone is cheap and shares the same data.
///
/// Expired keys read as absent immediately and are freed by a sweep that
/// runs inside `apply` at most once per sweep interval.
#[derive(Debug, Clone)]
pub struct MemoryCounterStore {
    inner: Arc<Mutex<Keyspace>>,
    sweep_interval: Duration,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Keyspace::new())),
            sweep_interval,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.inner.lock().expect("lock poisoned");
        guard.slots.values().filter(|slot| slot.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut guard = self.inner.lock().expect("lock poisoned");
        guard.purge(Instant::now())
    }

    /// Remaining time to live of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<std::time::Duration> {
        let now = Instant::now();
        let guard = self.inner.lock().expect("lock poisoned");
        guard
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn check(
        slots: &HashMap<String, Slot>,
        batch: &WriteBatch,
        now: Instant,
    ) -> Result<(), StoreError> {
        let mut planned: HashMap<&str, Kind> = HashMap::new();

        for op in batch.ops() {
            let (key, wanted) = match op {
                BatchOp::IncrBy { key, .. } | BatchOp::IncrByFloat { key, .. } => {
                    (key.as_str(), Kind::Hash)
                }
                BatchOp::PushCapped { key, .. } => (key.as_str(), Kind::List),
                BatchOp::Expire { .. } => continue,
            };

            let existing = planned.get(key).copied().or_else(|| {
                slots
                    .get(key)
                    .filter(|slot| slot.is_live(now))
                    .map(|slot| slot.entry.kind())
            });

            match existing {
                Some(kind) if kind != wanted => {
                    return Err(StoreError::WrongType {
                        key: key.to_string(),
                        expected: match wanted {
                            Kind::Hash => "hash",
                            Kind::List => "list",
                        },
                    });
                }
                _ => {
                    planned.insert(key, wanted);
                }
            }
        }
        Ok(())
    }

    fn live_slot<'a>(
        slots: &'a mut HashMap<String, Slot>,
        key: &str,
        now: Instant,
        make: impl FnOnce() -> Entry,
    ) -> &'a mut Slot {
        if slots.get(key).is_some_and(|slot| !slot.is_live(now)) {
            slots.remove(key);
        }
        slots.entry(key.to_string()).or_insert_with(|| Slot {
            entry: make(),
            expires_at: None,
        })
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    #[instrument(skip(self, batch), fields(ops = batch.len()))]
    async fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut keyspace = self.inner.lock().expect("lock poisoned");

        if now.saturating_duration_since(keyspace.last_sweep) >= self.sweep_interval {
            let removed = keyspace.purge(now);
            if removed > 0 {
                debug!(removed, "Expired keys swept");
            }
        }

        let slots = &mut keyspace.slots;
        Self::check(slots, &batch, now)?;

        for op in batch.ops() {
            match op {
                BatchOp::IncrBy { key, field, by } => {
                    let slot = Self::live_slot(slots, key, now, || Entry::Hash(HashMap::new()));
                    if let Entry::Hash(fields) = &mut slot.entry {
                        let value = fields.entry(field.clone()).or_insert(CounterValue::Int(0));
                        *value = match *value {
                            CounterValue::Int(v) => CounterValue::Int(v.saturating_add(*by)),
                            CounterValue::Float(v) => CounterValue::Float(v + *by as f64),
                        };
                    }
                }
                BatchOp::IncrByFloat { key, field, by } => {
                    let slot = Self::live_slot(slots, key, now, || Entry::Hash(HashMap::new()));
                    if let Entry::Hash(fields) = &mut slot.entry {
                        let value = fields.entry(field.clone()).or_insert(CounterValue::Float(0.0));
                        *value = CounterValue::Float(value.as_f64() + by);
                    }
                }
                BatchOp::PushCapped {
                    key,
                    value,
                    capacity,
                } => {
                    let slot = Self::live_slot(slots, key, now, || {
                        Entry::List(EventRing::with_capacity(*capacity))
                    });
                    if let Entry::List(ring) = &mut slot.entry {
                        if ring.capacity() != *capacity {
                            ring.set_capacity(*capacity);
                        }
                        ring.push(value.clone());
                    }
                }
                BatchOp::Expire { key, ttl } => {
                    if let Some(slot) = slots.get_mut(key).filter(|slot| slot.is_live(now)) {
                        slot.expires_at = Some(now + *ttl);
                    }
                }
            }
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, CounterValue>, StoreError> {
        let now = Instant::now();
        let keyspace = self.inner.lock().expect("lock poisoned");
        match keyspace.slots.get(key).filter(|slot| slot.is_live(now)) {
            None => Ok(HashMap::new()),
            Some(Slot {
                entry: Entry::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "hash",
            }),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<CounterValue>, StoreError> {
        Ok(self.hash_get_all(key).await?.get(field).copied())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let keyspace = self.inner.lock().expect("lock poisoned");
        match keyspace.slots.get(key).filter(|slot| slot.is_live(now)) {
            None => Ok(Vec::new()),
            Some(Slot {
                entry: Entry::List(ring),
                ..
            }) => Ok(ring.iter().take(limit).cloned().collect()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "list",
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
