use rusqlite::{OptionalExtension, Row, params};
use serde::Deserialize;
use uuid::Uuid;

use super::overage::{OverageState, overage_amount};
use super::types::{OverageRecord, Subscription, SyncOutcome};
use crate::db::Database;
use crate::error::BillingError;

const SUBSCRIPTION_COLUMNS: &str = "id, location_id, usage_allowance, usage_current, overage_rate, \
     overage_billed, current_period_start, current_period_end, updated_at";

/// Provisioning input for a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub location_id: String,
    pub usage_allowance: u64,
    pub overage_rate: f64,
    pub current_period_start: String,
    pub current_period_end: String,
}

/// Subscription and overage rows in the durable store.
#[derive(Clone)]
pub struct SubscriptionRepo {
    db: Database,
}

impl SubscriptionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create or update a tenant's subscription. Moving to a new period
    /// (different `current_period_start`) clears usage and billed overage.
    pub fn upsert(&self, new: &NewSubscription) -> Result<Subscription, BillingError> {
        let subscription = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO subscriptions
                    (location_id, usage_allowance, overage_rate, current_period_start, current_period_end)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (location_id) DO UPDATE SET
                    usage_allowance = excluded.usage_allowance,
                    overage_rate = excluded.overage_rate,
                    usage_current = CASE
                        WHEN subscriptions.current_period_start = excluded.current_period_start
                        THEN subscriptions.usage_current ELSE 0 END,
                    overage_billed = CASE
                        WHEN subscriptions.current_period_start = excluded.current_period_start
                        THEN subscriptions.overage_billed ELSE 0 END,
                    current_period_start = excluded.current_period_start,
                    current_period_end = excluded.current_period_end,
                    updated_at = datetime('now')",
                params![
                    new.location_id,
                    to_i64(new.usage_allowance),
                    new.overage_rate,
                    new.current_period_start,
                    new.current_period_end,
                ],
            )?;
            select_by_location(conn, &new.location_id)
        })?;

        tracing::info!(
            location_id = %subscription.location_id,
            usage_allowance = subscription.usage_allowance,
            overage_rate = subscription.overage_rate,
            period_start = %subscription.current_period_start,
            "Subscription upserted"
        );
        Ok(subscription)
    }

    pub fn get_by_location(&self, location_id: &str) -> Result<Option<Subscription>, BillingError> {
        let subscription = self
            .db
            .with_conn(|conn| select_by_location(conn, location_id).optional())?;
        Ok(subscription)
    }

    /// All subscriptions, ordered by tenant.
    pub fn list(&self) -> Result<Vec<Subscription>, BillingError> {
        let subscriptions = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions ORDER BY location_id"
            ))?;
            let rows = stmt.query_map([], subscription_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        Ok(subscriptions)
    }

    /// Overage records for a tenant, oldest first.
    pub fn overage_records(&self, location_id: &str) -> Result<Vec<OverageRecord>, BillingError> {
        let records = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.subscription_id, r.quantity, r.amount, r.cumulative_quantity,
                        r.billing_period_start, r.billing_period_end, r.created_at
                 FROM usage_records r
                 JOIN subscriptions s ON s.id = r.subscription_id
                 WHERE s.location_id = ?1
                 ORDER BY r.billing_period_start, r.cumulative_quantity",
            )?;
            let rows = stmt.query_map([location_id], overage_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        Ok(records)
    }

    /// Add `new_calls` (calls not yet folded in) to the subscription and bill
    /// any new overage, all in one transaction.
    ///
    /// `usage_current` only moves forward. Overage is billed as the delta
    /// beyond `overage_billed`; a duplicate insert for the same cumulative
    /// quantity is ignored.
    pub fn reconcile(
        &self,
        location_id: &str,
        observed_calls: u64,
        new_calls: u64,
    ) -> Result<SyncOutcome, BillingError> {
        let outcome = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let updated = tx.execute(
                "UPDATE subscriptions
                 SET usage_current = usage_current + ?1, updated_at = datetime('now')
                 WHERE location_id = ?2",
                params![to_i64(new_calls), location_id],
            )?;
            if updated == 0 {
                return Ok(None);
            }

            let current = select_by_location(&tx, location_id)?;
            let state = OverageState::evaluate(
                current.usage_current,
                current.usage_allowance,
                current.overage_billed,
            );

            let mut overage = None;
            if let OverageState::Unbilled {
                quantity,
                cumulative,
            } = state
            {
                let id = Uuid::new_v4().to_string();
                let inserted = tx.execute(
                    "INSERT INTO usage_records
                        (id, subscription_id, quantity, amount, cumulative_quantity,
                         billing_period_start, billing_period_end)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (subscription_id, billing_period_start, cumulative_quantity)
                     DO NOTHING",
                    params![
                        id,
                        current.id,
                        to_i64(quantity),
                        overage_amount(quantity, current.overage_rate),
                        to_i64(cumulative),
                        current.current_period_start,
                        current.current_period_end,
                    ],
                )?;
                tx.execute(
                    "UPDATE subscriptions SET overage_billed = MAX(overage_billed, ?1) WHERE id = ?2",
                    params![to_i64(cumulative), current.id],
                )?;
                if inserted == 1 {
                    overage = Some(tx.query_row(
                        "SELECT id, subscription_id, quantity, amount, cumulative_quantity,
                                billing_period_start, billing_period_end, created_at
                         FROM usage_records WHERE id = ?1",
                        [&id],
                        overage_from_row,
                    )?);
                }
            }

            let subscription = select_by_location(&tx, location_id)?;
            tx.commit()?;
            Ok(Some(SyncOutcome {
                subscription,
                observed_calls,
                new_calls,
                overage,
            }))
        })?;

        outcome.ok_or_else(|| BillingError::SubscriptionNotFound(location_id.to_string()))
    }
}

fn select_by_location(
    conn: &rusqlite::Connection,
    location_id: &str,
) -> Result<Subscription, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE location_id = ?1"),
        [location_id],
        subscription_from_row,
    )
}

fn subscription_from_row(row: &Row<'_>) -> Result<Subscription, rusqlite::Error> {
    Ok(Subscription {
        id: row.get(0)?,
        location_id: row.get(1)?,
        usage_allowance: to_u64(row.get(2)?),
        usage_current: to_u64(row.get(3)?),
        overage_rate: row.get(4)?,
        overage_billed: to_u64(row.get(5)?),
        current_period_start: row.get(6)?,
        current_period_end: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn overage_from_row(row: &Row<'_>) -> Result<OverageRecord, rusqlite::Error> {
    Ok(OverageRecord {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        quantity: to_u64(row.get(2)?),
        amount: row.get(3)?,
        cumulative_quantity: to_u64(row.get(4)?),
        billing_period_start: row.get(5)?,
        billing_period_end: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SubscriptionRepo {
        SubscriptionRepo::new(Database::open_in_memory().unwrap())
    }

    fn provision(repo: &SubscriptionRepo, location: &str, allowance: u64, rate: f64) -> Subscription {
        repo.upsert(&NewSubscription {
            location_id: location.into(),
            usage_allowance: allowance,
            overage_rate: rate,
            current_period_start: "2025-03-01".into(),
            current_period_end: "2025-04-01".into(),
        })
        .unwrap()
    }

    #[test]
    fn test_upsert_and_get() {
        let repo = setup();
        let created = provision(&repo, "loc_abc", 1000, 0.02);
        assert_eq!(created.usage_allowance, 1000);
        assert_eq!(created.usage_current, 0);

        let fetched = repo.get_by_location("loc_abc").unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert!(repo.get_by_location("loc_missing").unwrap().is_none());
    }

    #[test]
    fn test_reconcile_over_allowance_inserts_overage() {
        let repo = setup();
        provision(&repo, "loc_abc", 1000, 0.02);

        let outcome = repo.reconcile("loc_abc", 1500, 1500).unwrap();
        assert_eq!(outcome.subscription.usage_current, 1500);
        assert_eq!(outcome.subscription.overage_billed, 500);

        let record = outcome.overage.unwrap();
        assert_eq!(record.quantity, 500);
        assert!((record.amount - 500.0 * 0.02).abs() < 1e-9);
        assert_eq!(record.billing_period_start, "2025-03-01");
        assert_eq!(record.billing_period_end, "2025-04-01");
    }

    #[test]
    fn test_reconcile_within_allowance_updates_only() {
        let repo = setup();
        provision(&repo, "loc_abc", 1000, 0.02);

        let outcome = repo.reconcile("loc_abc", 1000, 1000).unwrap();
        assert_eq!(outcome.subscription.usage_current, 1000);
        assert!(outcome.overage.is_none());
        assert!(repo.overage_records("loc_abc").unwrap().is_empty());
    }

    #[test]
    fn test_new_calls_accumulate() {
        let repo = setup();
        provision(&repo, "loc_abc", 1000, 0.02);

        repo.reconcile("loc_abc", 40, 40).unwrap();
        // Fast-path counter restarted and saw 3 more calls.
        let outcome = repo.reconcile("loc_abc", 3, 3).unwrap();
        assert_eq!(outcome.subscription.usage_current, 43);
        assert_eq!(outcome.observed_calls, 3);
        assert_eq!(outcome.new_calls, 3);

        let idle = repo.reconcile("loc_abc", 3, 0).unwrap();
        assert_eq!(idle.subscription.usage_current, 43);
    }

    #[test]
    fn test_repeated_sync_does_not_double_bill() {
        let repo = setup();
        provision(&repo, "loc_abc", 1000, 0.02);

        repo.reconcile("loc_abc", 1500, 1500).unwrap();
        let again = repo.reconcile("loc_abc", 1500, 0).unwrap();
        assert!(again.overage.is_none());
        assert_eq!(repo.overage_records("loc_abc").unwrap().len(), 1);
    }

    #[test]
    fn test_growing_overage_bills_deltas() {
        let repo = setup();
        provision(&repo, "loc_abc", 1000, 0.5);

        repo.reconcile("loc_abc", 1010, 1010).unwrap();
        repo.reconcile("loc_abc", 1030, 20).unwrap();
        let records = repo.overage_records("loc_abc").unwrap();

        let quantities: Vec<u64> = records.iter().map(|r| r.quantity).collect();
        assert_eq!(quantities, vec![10, 20]);
        let cumulative: Vec<u64> = records.iter().map(|r| r.cumulative_quantity).collect();
        assert_eq!(cumulative, vec![10, 30]);
        let total: f64 = records.iter().map(|r| r.amount).sum();
        assert!((total - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_reconcile_unknown_tenant() {
        let repo = setup();
        let err = repo.reconcile("loc_missing", 10, 10).unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionNotFound(_)));
    }

    #[test]
    fn test_new_period_resets_usage() {
        let repo = setup();
        provision(&repo, "loc_abc", 1000, 0.02);
        repo.reconcile("loc_abc", 1200, 1200).unwrap();

        // Same period: usage kept, allowance changed.
        let same = repo
            .upsert(&NewSubscription {
                location_id: "loc_abc".into(),
                usage_allowance: 2000,
                overage_rate: 0.02,
                current_period_start: "2025-03-01".into(),
                current_period_end: "2025-04-01".into(),
            })
            .unwrap();
        assert_eq!(same.usage_current, 1200);
        assert_eq!(same.overage_billed, 200);

        let next = repo
            .upsert(&NewSubscription {
                location_id: "loc_abc".into(),
                usage_allowance: 2000,
                overage_rate: 0.02,
                current_period_start: "2025-04-01".into(),
                current_period_end: "2025-05-01".into(),
            })
            .unwrap();
        assert_eq!(next.usage_current, 0);
        assert_eq!(next.overage_billed, 0);
        // Old period's records stay.
        assert_eq!(repo.overage_records("loc_abc").unwrap().len(), 1);
    }

    #[test]
    fn test_list_orders_by_location() {
        let repo = setup();
        provision(&repo, "loc_b", 10, 0.1);
        provision(&repo, "loc_a", 10, 0.1);
        let names: Vec<String> = repo.list().unwrap().into_iter().map(|s| s.location_id).collect();
        assert_eq!(names, vec!["loc_a", "loc_b"]);
    }
}
