use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe handle to the durable store (subscriptions and overage
/// records), wrapping a single SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path with WAL mode.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, rusqlite::Error>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self.conn.lock().expect("database mutex poisoned");
        f(&conn)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    location_id             TEXT NOT NULL UNIQUE,
    usage_allowance         INTEGER NOT NULL DEFAULT 0 CHECK (usage_allowance >= 0),
    usage_current           INTEGER NOT NULL DEFAULT 0 CHECK (usage_current >= 0),
    overage_rate            REAL NOT NULL DEFAULT 0.0,
    overage_billed          INTEGER NOT NULL DEFAULT 0 CHECK (overage_billed >= 0),
    current_period_start    TEXT NOT NULL,
    current_period_end      TEXT NOT NULL,
    updated_at              TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_location ON subscriptions(location_id);

CREATE TABLE IF NOT EXISTS usage_records (
    id                      TEXT PRIMARY KEY,
    subscription_id         INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
    quantity                INTEGER NOT NULL CHECK (quantity > 0),
    amount                  REAL NOT NULL,
    cumulative_quantity     INTEGER NOT NULL,
    billing_period_start    TEXT NOT NULL,
    billing_period_end      TEXT NOT NULL,
    created_at              TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (subscription_id, billing_period_start, cumulative_quantity)
);
CREATE INDEX IF NOT EXISTS idx_usage_records_subscription ON usage_records(subscription_id);
"#;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
