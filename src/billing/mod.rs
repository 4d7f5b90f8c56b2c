//! Multi-tenant usage billing.
//!
//! [`UsageBillingService`] keeps real-time counters in a fast-path
//! [`CounterStore`](crate::store::CounterStore) and periodically reconciles
//! them into the durable [`Database`](crate::db::Database), where
//! subscriptions and overage records live.

pub mod keys;
pub mod overage;
pub mod service;
pub mod subscriptions;
pub mod types;

pub use self::overage::OverageState;
pub use self::service::{SyncPolicy, UsageBillingService};
pub use self::subscriptions::{NewSubscription, SubscriptionRepo};
pub use self::types::{
    OverageRecord, Subscription, SyncOutcome, TenantUsage, UsageEvent, UsageReceipt,
};
