pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod pricing;
pub mod store;
pub mod telemetry;
pub mod wiring;

use crate::billing::UsageBillingService;
use crate::config::Config;
use crate::db::Database;
use crate::hooks::HookManager;
use crate::metrics::MetricsLogger;
use crate::pricing::{CostCalculator, RateTable};
use crate::store::CounterStore;

use std::sync::Arc;

/// Everything a host application needs to meter LLM usage, wired together.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub cost_calculator: Arc<CostCalculator>,
    pub metrics: Arc<MetricsLogger>,
    pub billing: UsageBillingService,
    pub hooks: Arc<HookManager>,
}

impl AppState {
    /// Build the shared rate table, the metrics log and the billing service,
    /// and subscribe both to `PostGeneration` on a fresh hook registry.
    pub fn new(config: Config, db: Database, store: Arc<dyn CounterStore>) -> Self {
        let mut rates = RateTable::new();
        rates.apply_overrides(&config.pricing.models);
        let cost_calculator = Arc::new(CostCalculator::with_rate_table(rates));

        let metrics = Arc::new(MetricsLogger::new(
            config.metrics.log_path.clone(),
            Arc::clone(&cost_calculator),
        ));
        let billing = UsageBillingService::new(
            store,
            db.clone(),
            Arc::clone(&cost_calculator),
            &config.billing,
        );

        let hooks = Arc::new(HookManager::new());
        wiring::install_billing_hooks(&hooks, Arc::clone(&metrics), billing.clone());

        Self {
            config: Arc::new(config),
            db,
            cost_calculator,
            metrics,
            billing,
            hooks,
        }
    }
}
