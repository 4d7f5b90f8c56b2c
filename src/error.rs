/// Errors raised by a fast-path counter store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Wrong value type at key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("Store error: {0}")]
    Other(String),
}

/// Errors raised by the billing service and the durable store.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Fast-path store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("No subscription for tenant: {0}")]
    SubscriptionNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for BillingError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "Database error");
        Self::Database(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BillingError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {err}"))
    }
}

/// Errors raised while writing or reading the metrics log.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Metrics log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed metrics row {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Error returned by a hook callback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HookError {
    #[error("Hook payload missing field: {0}")]
    MissingField(&'static str),

    #[error("Hook panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

impl From<BillingError> for HookError {
    fn from(err: BillingError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<MetricsError> for HookError {
    fn from(err: MetricsError) -> Self {
        Self::Failed(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts_into_billing_error() {
        let err: BillingError = StoreError::Unavailable("connection refused".into()).into();
        assert!(matches!(err, BillingError::Store(StoreError::Unavailable(_))));
        assert_eq!(
            err.to_string(),
            "Fast-path store error: Store unavailable: connection refused"
        );
    }

    #[test]
    fn test_rusqlite_error_maps_to_database() {
        let err: BillingError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, BillingError::Database(_)));
    }

    #[test]
    fn test_hook_error_from_billing_error_keeps_message() {
        let err: HookError = BillingError::SubscriptionNotFound("loc_1".into()).into();
        assert_eq!(err.to_string(), "No subscription for tenant: loc_1");
    }
}
