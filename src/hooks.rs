//! Lifecycle hooks.
//!
//! A publish/subscribe registry keyed by [`HookEvent`]. Producers (LLM
//! clients, tool runners) fire events; consumers (metrics logging, billing)
//! register callbacks. Neither side knows about the other.
//!
//! Callback failures, including panics, are contained per callback: they are
//! logged and the remaining callbacks still run. Nothing is ever surfaced to
//! the producer.
//!
//! Two dispatch entry points exist:
//!
//! - [`HookManager::trigger`] is synchronous. Sync callbacks run inline;
//!   async callbacks are spawned onto the current Tokio runtime and blocking
//!   callbacks onto its blocking pool, neither awaited. Without a runtime,
//!   blocking callbacks run inline and async callbacks are skipped with a
//!   warning and counted in [`DispatchReport::skipped`].
//! - [`HookManager::atrigger`] awaits every callback in registration order,
//!   running blocking callbacks on the blocking pool.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::error::HookError;

/// Lifecycle events hooks can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    SessionStart,
    PreGeneration,
    PostGeneration,
    PreToolExecution,
    PostToolExecution,
    OnError,
}

impl HookEvent {
    pub const ALL: [HookEvent; 6] = [
        Self::SessionStart,
        Self::PreGeneration,
        Self::PostGeneration,
        Self::PreToolExecution,
        Self::PostToolExecution,
        Self::OnError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::PreGeneration => "pre_generation",
            Self::PostGeneration => "post_generation",
            Self::PreToolExecution => "pre_tool_execution",
            Self::PostToolExecution => "post_tool_execution",
            Self::OnError => "on_error",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data handed to every callback for one event. Subscribers treat it as
/// read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    pub event: HookEvent,
    pub agent_name: String,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default)]
    pub output_data: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl HookContext {
    pub fn new(event: HookEvent, agent_name: impl Into<String>) -> Self {
        Self {
            event,
            agent_name: agent_name.into(),
            input_data: Value::Null,
            output_data: Value::Null,
            metadata: Map::new(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input_data = input;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output_data = output;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub type SyncHookFn = dyn Fn(&HookContext) -> Result<(), HookError> + Send + Sync;
pub type AsyncHookFn =
    dyn Fn(Arc<HookContext>) -> BoxFuture<'static, Result<(), HookError>> + Send + Sync;

#[derive(Clone)]
enum HookKind {
    Sync(Arc<SyncHookFn>),
    Blocking(Arc<SyncHookFn>),
    Async(Arc<AsyncHookFn>),
}

/// A named callback: synchronous, blocking (file or database I/O), or
/// asynchronous.
#[derive(Clone)]
pub struct HookCallback {
    name: String,
    kind: HookKind,
}

impl HookCallback {
    /// A callback run inline by both `trigger` and `atrigger`.
    pub fn sync<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&HookContext) -> Result<(), HookError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: HookKind::Sync(Arc::new(f)),
        }
    }

    /// A synchronous callback that does blocking I/O. Kept off the async
    /// workers when a runtime is available, run inline otherwise.
    pub fn blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&HookContext) -> Result<(), HookError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: HookKind::Blocking(Arc::new(f)),
        }
    }

    /// A callback returning a future. `trigger` spawns it, `atrigger` awaits it.
    pub fn asynchronous<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<HookContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: HookKind::Async(Arc::new(move |ctx| f(ctx).boxed())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_async(&self) -> bool {
        matches!(self.kind, HookKind::Async(_))
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            HookKind::Sync(_) => "sync",
            HookKind::Blocking(_) => "blocking",
            HookKind::Async(_) => "async",
        }
    }
}

impl std::fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookCallback")
            .field("name", &self.name)
            .field("kind", &self.kind_name())
            .finish()
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Callbacks that completed successfully (inline or awaited).
    pub completed: usize,
    /// Callbacks that returned an error or panicked.
    pub failed: usize,
    /// Async and blocking callbacks spawned by `trigger`, still in flight.
    pub scheduled: Vec<JoinHandle<()>>,
    /// Async callbacks dropped because `trigger` ran outside a runtime.
    pub skipped: usize,
}

impl DispatchReport {
    /// Wait for every spawned callback to finish.
    pub async fn join(self) {
        for handle in self.scheduled {
            let _ = handle.await;
        }
    }
}

/// Registry of lifecycle callbacks.
///
/// Constructed explicitly and shared by `Arc`; each application or test owns
/// its own instance.
#[derive(Debug, Default)]
pub struct HookManager {
    hooks: RwLock<HashMap<HookEvent, Vec<HookCallback>>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a callback to an event. Registering the same callback twice
    /// invokes it twice.
    pub fn register(&self, event: HookEvent, callback: HookCallback) {
        tracing::debug!(
            event = %event,
            hook = %callback.name,
            kind = callback.kind_name(),
            "Hook registered"
        );
        self.hooks
            .write()
            .expect("lock poisoned")
            .entry(event)
            .or_default()
            .push(callback);
    }

    /// Number of callbacks registered for an event.
    pub fn count(&self, event: HookEvent) -> usize {
        self.hooks
            .read()
            .expect("lock poisoned")
            .get(&event)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        HookEvent::ALL.iter().all(|e| self.count(*e) == 0)
    }

    fn snapshot(&self, event: HookEvent) -> Vec<HookCallback> {
        self.hooks
            .read()
            .expect("lock poisoned")
            .get(&event)
            .cloned()
            .unwrap_or_default()
    }

    /// Synchronous dispatch. Never blocks on async callbacks and never fails.
    pub fn trigger(&self, event: HookEvent, context: &HookContext) -> DispatchReport {
        let callbacks = self.snapshot(event);
        let mut report = DispatchReport::default();
        if callbacks.is_empty() {
            return report;
        }

        let runtime = tokio::runtime::Handle::try_current().ok();
        let mut shared: Option<Arc<HookContext>> = None;

        for callback in callbacks {
            match &callback.kind {
                HookKind::Sync(f) => {
                    record(&mut report, event, &callback.name, run_sync(f.as_ref(), context));
                }
                HookKind::Blocking(f) => {
                    let Some(handle) = runtime.as_ref() else {
                        record(&mut report, event, &callback.name, run_sync(f.as_ref(), context));
                        continue;
                    };

                    let ctx = shared
                        .get_or_insert_with(|| Arc::new(context.clone()))
                        .clone();
                    let f = Arc::clone(f);
                    let name = callback.name.clone();
                    report.scheduled.push(handle.spawn_blocking(move || {
                        if let Err(e) = run_sync(f.as_ref(), &ctx) {
                            tracing::error!(event = %event, hook = %name, error = %e, "Hook failed");
                        }
                    }));
                }
                HookKind::Async(f) => {
                    let Some(handle) = runtime.as_ref() else {
                        tracing::warn!(
                            event = %event,
                            hook = %callback.name,
                            "No async runtime running, skipping async hook"
                        );
                        report.skipped += 1;
                        continue;
                    };

                    let ctx = shared
                        .get_or_insert_with(|| Arc::new(context.clone()))
                        .clone();
                    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| f(ctx))) {
                        Ok(fut) => fut,
                        Err(payload) => {
                            let err = HookError::Panicked(panic_message(payload.as_ref()));
                            record(&mut report, event, &callback.name, Err(err));
                            continue;
                        }
                    };

                    let name = callback.name.clone();
                    report.scheduled.push(handle.spawn(async move {
                        let result = run_async(fut).await;
                        if let Err(e) = result {
                            tracing::error!(event = %event, hook = %name, error = %e, "Hook failed");
                        }
                    }));
                }
            }
        }

        report
    }

    /// Asynchronous dispatch. Awaits each callback in registration order.
    pub async fn atrigger(&self, event: HookEvent, context: &HookContext) -> DispatchReport {
        let callbacks = self.snapshot(event);
        let mut report = DispatchReport::default();
        if callbacks.is_empty() {
            return report;
        }

        let mut shared: Option<Arc<HookContext>> = None;

        for callback in callbacks {
            let result = match &callback.kind {
                HookKind::Sync(f) => run_sync(f.as_ref(), context),
                HookKind::Blocking(f) => {
                    let ctx = shared
                        .get_or_insert_with(|| Arc::new(context.clone()))
                        .clone();
                    let f = Arc::clone(f);
                    tokio::task::spawn_blocking(move || run_sync(f.as_ref(), &ctx))
                        .await
                        .unwrap_or_else(|e| Err(HookError::Failed(format!("blocking hook task: {e}"))))
                }
                HookKind::Async(f) => {
                    let ctx = shared
                        .get_or_insert_with(|| Arc::new(context.clone()))
                        .clone();
                    match std::panic::catch_unwind(AssertUnwindSafe(|| f(ctx))) {
                        Ok(fut) => run_async(fut).await,
                        Err(payload) => Err(HookError::Panicked(panic_message(payload.as_ref()))),
                    }
                }
            };
            record(&mut report, event, &callback.name, result);
        }

        report
    }
}

fn run_sync(f: &SyncHookFn, context: &HookContext) -> Result<(), HookError> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| f(context))) {
        Ok(result) => result,
        Err(payload) => Err(HookError::Panicked(panic_message(payload.as_ref()))),
    }
}

async fn run_async(fut: BoxFuture<'static, Result<(), HookError>>) -> Result<(), HookError> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HookError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn record(report: &mut DispatchReport, event: HookEvent, name: &str, result: Result<(), HookError>) {
    match result {
        Ok(()) => report.completed += 1,
        Err(e) => {
            tracing::error!(event = %event, hook = %name, error = %e, "Hook failed");
            report.failed += 1;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
