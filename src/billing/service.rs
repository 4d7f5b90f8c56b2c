use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::keys;
use super::subscriptions::SubscriptionRepo;
use super::types::{SyncOutcome, TenantUsage, UsageEvent, UsageReceipt};
use crate::config::BillingConfig;
use crate::db::Database;
use crate::error::BillingError;
use crate::pricing::CostCalculator;
use crate::store::{CounterStore, WriteBatch};

/// Reconciliation cadence: sync whenever the call count is a multiple of
/// `every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    every: u64,
}

impl SyncPolicy {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
        }
    }

    pub fn every(&self) -> u64 {
        self.every
    }

    pub fn is_due(&self, total_calls: u64) -> bool {
        total_calls % self.every == 0
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Real-time per-tenant usage accounting over two tiers: fast-path counters
/// in a [`CounterStore`] and subscription/overage rows in the [`Database`].
///
/// Cheap to clone; clones share the store, the database, and the set of
/// in-flight sync tasks.
#[derive(Clone)]
pub struct UsageBillingService {
    store: Arc<dyn CounterStore>,
    subscriptions: SubscriptionRepo,
    calculator: Arc<CostCalculator>,
    policy: SyncPolicy,
    event_history: usize,
    daily_ttl: Duration,
    pending_syncs: Arc<Mutex<Vec<JoinHandle<()>>>>,
    sync_lock: Arc<tokio::sync::Mutex<()>>,
}

impl UsageBillingService {
    pub fn new(
        store: Arc<dyn CounterStore>,
        db: Database,
        calculator: Arc<CostCalculator>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            store,
            subscriptions: SubscriptionRepo::new(db),
            calculator,
            policy: SyncPolicy::new(config.sync_every),
            event_history: config.event_history.max(1),
            daily_ttl: Duration::from_secs(u64::from(config.daily_retention_days) * 86_400),
            pending_syncs: Arc::new(Mutex::new(Vec::new())),
            sync_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn subscriptions(&self) -> &SubscriptionRepo {
        &self.subscriptions
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    // MARK: - Write path

    /// Record one generation call. Never fails the caller: if the fast-path
    /// store rejects the write, the event is logged and dropped.
    pub async fn log_usage(
        &self,
        tenant_id: &str,
        model: &str,
        provider: &str,
        input_tokens: u64,
        output_tokens: u64,
        metadata: Map<String, Value>,
    ) {
        if let Err(e) = self
            .try_log_usage(tenant_id, model, provider, input_tokens, output_tokens, metadata)
            .await
        {
            warn!(tenant_id, error = %e, "Usage not recorded in fast-path store");
        }
    }

    /// Record one generation call and report what happened.
    ///
    /// All counters (tenant, model, day) and the event history entry are
    /// written as one batch. A due reconciliation is spawned in the
    /// background and never awaited here.
    #[instrument(skip(self, metadata))]
    pub async fn try_log_usage(
        &self,
        tenant_id: &str,
        model: &str,
        provider: &str,
        input_tokens: u64,
        output_tokens: u64,
        metadata: Map<String, Value>,
    ) -> Result<UsageReceipt, BillingError> {
        let cost_usd = self
            .calculator
            .calculate_cost(provider, model, input_tokens, output_tokens);
        let event = UsageEvent {
            timestamp: Utc::now(),
            tenant_id: tenant_id.to_string(),
            model: model.to_string(),
            provider: provider.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
            metadata,
        };

        let batch = self.usage_batch(&event)?;
        if let Err(e) = self.store.apply(batch).await {
            // Best-effort local record of the lost event.
            warn!(
                tenant_id = %event.tenant_id,
                model = %event.model,
                provider = %event.provider,
                input_tokens = event.input_tokens,
                output_tokens = event.output_tokens,
                cost_usd = event.cost_usd,
                timestamp = %event.timestamp,
                error = %e,
                "Fast-path store unavailable; usage event logged locally only"
            );
            return Err(e.into());
        }

        let total_calls = self.total_calls(tenant_id).await.unwrap_or(0);
        let sync_scheduled = total_calls > 0 && self.policy.is_due(total_calls);
        if sync_scheduled {
            self.spawn_sync(tenant_id);
        }

        debug!(cost_usd, total_calls, sync_scheduled, "Usage recorded");
        Ok(UsageReceipt {
            event,
            total_calls,
            sync_scheduled,
        })
    }

    fn usage_batch(&self, event: &UsageEvent) -> Result<WriteBatch, BillingError> {
        let tenant_id = &event.tenant_id;
        let day = event.timestamp.date_naive();
        let encoded = serde_json::to_string(event)
            .map_err(|e| BillingError::Internal(format!("usage event encoding failed: {e}")))?;

        let input = to_i64(event.input_tokens);
        let output = to_i64(event.output_tokens);

        let mut batch = WriteBatch::new();
        for key in [
            keys::tenant(tenant_id),
            keys::model(tenant_id, &event.model),
            keys::daily(tenant_id, day),
        ] {
            batch
                .incr(key.clone(), keys::TOTAL_INPUT_TOKENS, input)
                .incr(key.clone(), keys::TOTAL_OUTPUT_TOKENS, output)
                .incr(key.clone(), keys::TOTAL_CALLS, 1)
                .incr_float(key, keys::TOTAL_COST_USD, event.cost_usd);
        }
        batch
            .expire(keys::daily(tenant_id, day), self.daily_ttl)
            .push_capped(keys::events(tenant_id), encoded, self.event_history);
        Ok(batch)
    }

    // MARK: - Reconciliation

    /// Whether the tenant's current call count falls on the sync cadence.
    /// An unreadable store never triggers a sync.
    pub async fn should_sync(&self, tenant_id: &str) -> bool {
        match self.total_calls(tenant_id).await {
            Ok(calls) => self.policy.is_due(calls),
            Err(e) => {
                debug!(tenant_id, error = %e, "Sync check skipped");
                false
            }
        }
    }

    /// Reconcile a tenant into the durable store, logging any failure.
    pub async fn sync_to_db(&self, tenant_id: &str) {
        match self.try_sync_to_db(tenant_id).await {
            Ok(outcome) => {
                if let Some(record) = &outcome.overage {
                    info!(
                        tenant_id,
                        quantity = record.quantity,
                        amount = record.amount,
                        cumulative = record.cumulative_quantity,
                        "Overage recorded"
                    );
                }
            }
            Err(BillingError::SubscriptionNotFound(_)) => {
                debug!(tenant_id, "No subscription; sync skipped");
            }
            Err(e) => {
                warn!(tenant_id, error = %e, "Durable sync failed");
            }
        }
    }

    /// Fold the calls counted since the last sync into the subscription row,
    /// billing any new overage.
    ///
    /// The calls already folded in are tracked next to the counters (see
    /// [`keys::synced`]), so a fresh or reset fast-path store starts from
    /// zero on both sides and no usage is lost or counted twice. Syncs from
    /// one service run one at a time.
    #[instrument(skip(self))]
    pub async fn try_sync_to_db(&self, tenant_id: &str) -> Result<SyncOutcome, BillingError> {
        let _serial = self.sync_lock.lock().await;

        let observed = self.total_calls(tenant_id).await?;
        let marked = self
            .store
            .hash_get(&keys::synced(tenant_id), keys::TOTAL_CALLS)
            .await?
            .map(|v| v.as_u64())
            .unwrap_or(0);
        let new_calls = observed.saturating_sub(marked);

        let repo = self.subscriptions.clone();
        let tenant = tenant_id.to_string();
        let outcome =
            tokio::task::spawn_blocking(move || repo.reconcile(&tenant, observed, new_calls)).await??;

        if observed != marked {
            let mut batch = WriteBatch::new();
            batch.incr(
                keys::synced(tenant_id),
                keys::TOTAL_CALLS,
                to_i64(observed).saturating_sub(to_i64(marked)),
            );
            if let Err(e) = self.store.apply(batch).await {
                warn!(
                    tenant_id,
                    observed,
                    error = %e,
                    "Sync mark not advanced; the next sync will count these calls again"
                );
            }
        }

        debug!(
            observed,
            new_calls,
            usage_current = outcome.subscription.usage_current,
            usage_allowance = outcome.subscription.usage_allowance,
            "Subscription reconciled"
        );
        Ok(outcome)
    }

    fn spawn_sync(&self, tenant_id: &str) {
        let service = self.clone();
        let tenant = tenant_id.to_string();
        let handle = tokio::spawn(async move { service.sync_to_db(&tenant).await });

        let mut pending = self.pending_syncs.lock().expect("lock poisoned");
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for every background sync spawned so far.
    pub async fn drain(&self) {
        let handles: Vec<_> = {
            let mut pending = self.pending_syncs.lock().expect("lock poisoned");
            pending.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background sync task failed");
            }
        }
    }

    // MARK: - Reads

    /// Aggregate counters for a tenant. Empty when the tenant has no usage or
    /// the store cannot be read.
    pub async fn get_tenant_usage(&self, tenant_id: &str) -> TenantUsage {
        self.read_hash(&keys::tenant(tenant_id)).await
    }

    pub async fn get_model_usage(&self, tenant_id: &str, model: &str) -> TenantUsage {
        self.read_hash(&keys::model(tenant_id, model)).await
    }

    /// Counters for one UTC day; empty once the day has expired.
    pub async fn get_daily_usage(&self, tenant_id: &str, date: NaiveDate) -> TenantUsage {
        self.read_hash(&keys::daily(tenant_id, date)).await
    }

    /// Most recent usage events, newest first.
    pub async fn recent_events(&self, tenant_id: &str, limit: usize) -> Vec<UsageEvent> {
        match self.store.list_range(&keys::events(tenant_id), limit).await {
            Ok(raw) => raw
                .iter()
                .filter_map(|entry| match serde_json::from_str(entry) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(tenant_id, error = %e, "Skipping unreadable usage event");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!(tenant_id, error = %e, "Failed to read usage events");
                Vec::new()
            }
        }
    }

    async fn read_hash(&self, key: &str) -> TenantUsage {
        match self.store.hash_get_all(key).await {
            Ok(raw) => TenantUsage::from_counters(raw),
            Err(e) => {
                warn!(key, error = %e, "Failed to read usage counters");
                TenantUsage::default()
            }
        }
    }

    async fn total_calls(&self, tenant_id: &str) -> Result<u64, BillingError> {
        let value = self
            .store
            .hash_get(&keys::tenant(tenant_id), keys::TOTAL_CALLS)
            .await?;
        Ok(value.map(|v| v.as_u64()).unwrap_or(0))
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::subscriptions::NewSubscription;
    use crate::error::StoreError;
    use crate::store::{CounterValue, MemoryCounterStore};
    use std::collections::HashMap;

    struct DownStore;

    #[async_trait::async_trait]
    impl CounterStore for DownStore {
        async fn apply(&self, _batch: WriteBatch) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn hash_get_all(&self, _key: &str) -> Result<HashMap<String, CounterValue>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn hash_get(&self, _key: &str, _field: &str) -> Result<Option<CounterValue>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn list_range(&self, _key: &str, _limit: usize) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn service_with(store: Arc<dyn CounterStore>, config: BillingConfig) -> UsageBillingService {
        UsageBillingService::new(
            store,
            Database::open_in_memory().unwrap(),
            Arc::new(CostCalculator::new()),
            &config,
        )
    }

    fn setup() -> (MemoryCounterStore, UsageBillingService) {
        let store = MemoryCounterStore::new();
        let service = service_with(Arc::new(store.clone()), BillingConfig::default());
        (store, service)
    }

    fn provision(service: &UsageBillingService, tenant: &str, allowance: u64, rate: f64) {
        service
            .subscriptions()
            .upsert(&NewSubscription {
                location_id: tenant.into(),
                usage_allowance: allowance,
                overage_rate: rate,
                current_period_start: "2025-03-01".into(),
                current_period_end: "2025-04-01".into(),
            })
            .unwrap();
    }

    async fn call(service: &UsageBillingService, tenant: &str) {
        service
            .log_usage(tenant, "claude-3-5-sonnet-latest", "claude", 100, 50, Map::new())
            .await;
    }

    #[test]
    fn test_sync_policy_cadence() {
        let policy = SyncPolicy::default();
        for calls in [0, 10, 20, 30, 1000] {
            assert!(policy.is_due(calls), "{calls} should be due");
        }
        for calls in [1, 5, 9, 11, 19, 21, 999] {
            assert!(!policy.is_due(calls), "{calls} should not be due");
        }
        assert_eq!(SyncPolicy::new(0).every(), 1);
    }

    #[tokio::test]
    async fn test_log_usage_updates_all_counters() {
        let (_store, service) = setup();
        call(&service, "loc_abc").await;
        call(&service, "loc_abc").await;

        let usage = service.get_tenant_usage("loc_abc").await;
        assert_eq!(usage.total_calls(), 2);
        assert_eq!(usage.total_input_tokens(), 200);
        assert_eq!(usage.total_output_tokens(), 100);
        // 100 in / 50 out at 3 / 15 per million.
        let per_call = (100.0 * 3.0 + 50.0 * 15.0) / 1_000_000.0;
        assert!((usage.total_cost_usd() - 2.0 * per_call).abs() < 1e-12);

        let model = service.get_model_usage("loc_abc", "claude-3-5-sonnet-latest").await;
        assert_eq!(model.total_calls(), 2);

        let today = Utc::now().date_naive();
        let daily = service.get_daily_usage("loc_abc", today).await;
        assert_eq!(daily.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_daily_counters_expire() {
        let (store, service) = setup();
        call(&service, "loc_abc").await;

        let key = keys::daily("loc_abc", Utc::now().date_naive());
        let ttl = store.ttl(&key).unwrap();
        assert!(ttl > Duration::from_secs(30 * 86_400));
        assert!(ttl <= Duration::from_secs(31 * 86_400));
        assert!(store.ttl(&keys::tenant("loc_abc")).is_none());
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let (_store, service) = setup();
        call(&service, "loc_a").await;
        call(&service, "loc_b").await;
        call(&service, "loc_b").await;

        assert_eq!(service.get_tenant_usage("loc_a").await.total_calls(), 1);
        assert_eq!(service.get_tenant_usage("loc_b").await.total_calls(), 2);
        assert!(service.get_tenant_usage("loc_c").await.is_empty());
    }

    #[tokio::test]
    async fn test_separator_in_tenant_id_stays_isolated() {
        let (_store, service) = setup();
        service
            .log_usage("a:models:x", "m", "claude", 10, 10, Map::new())
            .await;

        assert!(service.get_model_usage("a", "x").await.is_empty());
        assert!(service.get_tenant_usage("a").await.is_empty());
        assert_eq!(service.get_tenant_usage("a:models:x").await.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_event_history_is_capped_newest_first() {
        let store = MemoryCounterStore::new();
        let config = BillingConfig {
            event_history: 3,
            ..BillingConfig::default()
        };
        let service = service_with(Arc::new(store), config);

        for tokens in 1..=5u64 {
            service
                .log_usage("loc_abc", "gemini-2.0-flash", "gemini", tokens, 0, Map::new())
                .await;
        }
        let events = service.recent_events("loc_abc", 10).await;
        let inputs: Vec<u64> = events.iter().map(|e| e.input_tokens).collect();
        assert_eq!(inputs, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_event_keeps_metadata() {
        let (_store, service) = setup();
        let mut metadata = Map::new();
        metadata.insert("task_type".into(), Value::from("qualify"));
        service
            .log_usage("loc_abc", "gemini-2.0-flash", "gemini", 10, 10, metadata)
            .await;

        let events = service.recent_events("loc_abc", 1).await;
        assert_eq!(events[0].metadata["task_type"], "qualify");
        assert_eq!(events[0].provider, "gemini");
    }

    #[tokio::test]
    async fn test_total_cost_never_decreases() {
        let (_store, service) = setup();
        let mut last = 0.0;
        for (input, output) in [(0, 0), (10, 0), (0, 10), (5_000, 7_000), (0, 0)] {
            service
                .log_usage("loc_abc", "unknown-model", "unknown-provider", input, output, Map::new())
                .await;
            let cost = service.get_tenant_usage("loc_abc").await.total_cost_usd();
            assert!(cost >= last);
            last = cost;
        }
    }

    #[tokio::test]
    async fn test_store_down_never_fails_caller() {
        let service = service_with(Arc::new(DownStore), BillingConfig::default());

        call(&service, "loc_abc").await;
        assert!(service.get_tenant_usage("loc_abc").await.is_empty());
        assert!(service.recent_events("loc_abc", 10).await.is_empty());
        assert!(!service.should_sync("loc_abc").await);

        let err = service
            .try_log_usage("loc_abc", "m", "claude", 1, 1, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_tenth_call_schedules_sync() {
        let (_store, service) = setup();
        provision(&service, "loc_abc", 1000, 0.02);

        for _ in 0..9 {
            let receipt = service
                .try_log_usage("loc_abc", "claude-3-5-sonnet-latest", "claude", 100, 50, Map::new())
                .await
                .unwrap();
            assert!(!receipt.sync_scheduled);
        }
        service.drain().await;
        let sub = service.subscriptions().get_by_location("loc_abc").unwrap().unwrap();
        assert_eq!(sub.usage_current, 0);

        let receipt = service
            .try_log_usage("loc_abc", "claude-3-5-sonnet-latest", "claude", 100, 50, Map::new())
            .await
            .unwrap();
        assert_eq!(receipt.total_calls, 10);
        assert!(receipt.sync_scheduled);

        service.drain().await;
        let sub = service.subscriptions().get_by_location("loc_abc").unwrap().unwrap();
        assert_eq!(sub.usage_current, 10);
    }

    #[tokio::test]
    async fn test_sync_bills_overage_from_fast_path() {
        let (store, service) = setup();
        provision(&service, "loc_abc", 1000, 0.02);

        let mut batch = WriteBatch::new();
        batch.incr(keys::tenant("loc_abc"), keys::TOTAL_CALLS, 1500);
        store.apply(batch).await.unwrap();

        let outcome = service.try_sync_to_db("loc_abc").await.unwrap();
        let record = outcome.overage.unwrap();
        assert_eq!(record.quantity, 500);
        assert!((record.amount - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sync_folds_only_new_calls() {
        let (_store, service) = setup();
        provision(&service, "loc_abc", 1000, 0.02);

        for _ in 0..3 {
            call(&service, "loc_abc").await;
        }
        let first = service.try_sync_to_db("loc_abc").await.unwrap();
        assert_eq!(first.new_calls, 3);

        let idle = service.try_sync_to_db("loc_abc").await.unwrap();
        assert_eq!(idle.observed_calls, 3);
        assert_eq!(idle.new_calls, 0);
        assert_eq!(idle.subscription.usage_current, 3);

        call(&service, "loc_abc").await;
        let next = service.try_sync_to_db("loc_abc").await.unwrap();
        assert_eq!(next.new_calls, 1);
        assert_eq!(next.subscription.usage_current, 4);
    }

    #[tokio::test]
    async fn test_fresh_store_keeps_durable_usage() {
        let db = Database::open_in_memory().unwrap();
        let calculator = Arc::new(CostCalculator::new());
        let config = BillingConfig::default();
        let first = UsageBillingService::new(
            Arc::new(MemoryCounterStore::new()),
            db.clone(),
            Arc::clone(&calculator),
            &config,
        );
        provision(&first, "loc_abc", 1000, 0.02);
        for _ in 0..7 {
            call(&first, "loc_abc").await;
        }
        first.sync_to_db("loc_abc").await;

        // Same database, counters start over.
        let second = UsageBillingService::new(Arc::new(MemoryCounterStore::new()), db, calculator, &config);
        for _ in 0..2 {
            call(&second, "loc_abc").await;
        }
        let outcome = second.try_sync_to_db("loc_abc").await.unwrap();
        assert_eq!(outcome.new_calls, 2);
        assert_eq!(outcome.subscription.usage_current, 9);
    }

    #[tokio::test]
    async fn test_failed_sync_leaves_calls_for_next_sync() {
        let (_store, service) = setup();
        for _ in 0..4 {
            call(&service, "loc_late").await;
        }
        assert!(service.try_sync_to_db("loc_late").await.is_err());

        provision(&service, "loc_late", 1000, 0.02);
        let outcome = service.try_sync_to_db("loc_late").await.unwrap();
        assert_eq!(outcome.new_calls, 4);
        assert_eq!(outcome.subscription.usage_current, 4);
    }

    #[tokio::test]
    async fn test_sync_below_allowance_records_nothing() {
        let (store, service) = setup();
        provision(&service, "loc_abc", 1000, 0.02);

        let mut batch = WriteBatch::new();
        batch.incr(keys::tenant("loc_abc"), keys::TOTAL_CALLS, 800);
        store.apply(batch).await.unwrap();

        let outcome = service.try_sync_to_db("loc_abc").await.unwrap();
        assert_eq!(outcome.subscription.usage_current, 800);
        assert!(outcome.overage.is_none());
        assert!(service.subscriptions().overage_records("loc_abc").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_without_subscription_is_contained() {
        let (_store, service) = setup();
        call(&service, "loc_new").await;
        service.sync_to_db("loc_new").await;

        let err = service.try_sync_to_db("loc_new").await.unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionNotFound(_)));
        // Fast-path counters untouched by the failed sync.
        assert_eq!(service.get_tenant_usage("loc_new").await.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_lose_nothing() {
        let (_store, service) = setup();
        provision(&service, "loc_abc", 5, 1.0);

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let service = service.clone();
            tasks.push(tokio::spawn(async move { call(&service, "loc_abc").await }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        service.drain().await;
        service.sync_to_db("loc_abc").await;

        assert_eq!(service.get_tenant_usage("loc_abc").await.total_calls(), 40);
        let sub = service.subscriptions().get_by_location("loc_abc").unwrap().unwrap();
        assert_eq!(sub.usage_current, 40);
        assert_eq!(sub.overage_billed, 35);
        let billed: u64 = service
            .subscriptions()
            .overage_records("loc_abc")
            .unwrap()
            .iter()
            .map(|r| r.quantity)
            .sum();
        assert_eq!(billed, 35);
    }
}
