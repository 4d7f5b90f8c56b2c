use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, instrument, warn};

use super::{COLUMNS, MetricsEntry, MetricsRecord, MetricsSummary, csv};
use crate::error::MetricsError;
use crate::pricing::CostCalculator;

/// Append-only CSV log of every generation call's cost and token usage.
///
/// Logging never fails the caller: I/O errors are reported through
/// `tracing` and the call returns normally. Use the `try_*` methods to see
/// the error.
pub struct MetricsLogger {
    path: PathBuf,
    calculator: Arc<CostCalculator>,
    write_lock: Mutex<()>,
}

impl MetricsLogger {
    /// Create a logger and initialise the log file (header row) if needed.
    pub fn new(path: impl Into<PathBuf>, calculator: Arc<CostCalculator>) -> Self {
        let logger = Self {
            path: path.into(),
            calculator,
            write_lock: Mutex::new(()),
        };
        if let Err(e) = logger.initialize() {
            warn!(path = %logger.path.display(), error = %e, "Failed to initialise metrics log");
        }
        logger
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the header row if the log does not exist or is empty.
    /// Calling this repeatedly leaves an existing log untouched.
    pub fn initialize(&self) -> Result<(), MetricsError> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        self.ensure_header()
    }

    fn ensure_header(&self) -> Result<(), MetricsError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if std::fs::metadata(&self.path)?.len() > 0 {
                    return Ok(());
                }
                OpenOptions::new().append(true).open(&self.path)?
            }
            Err(e) => return Err(e.into()),
        };

        writeln!(file, "{}", csv::join_row(COLUMNS))?;
        debug!(path = %self.path.display(), "Metrics log initialised");
        Ok(())
    }

    /// Cost in USD for one call, using the shared rate table.
    pub fn calculate_cost(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> f64 {
        self.calculator
            .calculate_cost(provider, model, input_tokens, output_tokens)
    }

    /// Price and append one call. Errors are logged, never returned.
    pub fn log_metrics(&self, entry: &MetricsEntry) {
        if let Err(e) = self.try_log_metrics(entry) {
            warn!(
                path = %self.path.display(),
                provider = %entry.provider,
                model = %entry.model,
                error = %e,
                "Failed to append metrics row"
            );
        }
    }

    /// Price and append one call, returning the row that was written.
    #[instrument(skip(self, entry), fields(provider = %entry.provider, model = %entry.model))]
    pub fn try_log_metrics(&self, entry: &MetricsEntry) -> Result<MetricsRecord, MetricsError> {
        let input_tokens = entry.input_tokens.unwrap_or(0);
        let output_tokens = entry.output_tokens.unwrap_or(0);
        let cost_usd = self.calculate_cost(&entry.provider, &entry.model, input_tokens, output_tokens);

        let record = MetricsRecord {
            timestamp: Utc::now(),
            model: entry.model.clone(),
            provider: entry.provider.clone(),
            task_type: entry.task_type.clone(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            cost_usd,
            accuracy_score: entry.accuracy_score,
            tenant_id: entry.tenant_id.clone(),
            is_failover: entry.is_failover,
        };

        let _guard = self.write_lock.lock().expect("lock poisoned");
        self.ensure_header()?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", record.to_row())?;

        debug!(cost_usd, total_tokens = record.total_tokens, "Metrics row appended");
        Ok(record)
    }

    /// Aggregate cost by task type across the whole log.
    /// An unreadable log yields an empty summary.
    pub fn get_metrics_summary(&self) -> MetricsSummary {
        match self.try_metrics_summary() {
            Ok(summary) => summary,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read metrics log");
                MetricsSummary::default()
            }
        }
    }

    pub fn try_metrics_summary(&self) -> Result<MetricsSummary, MetricsError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(MetricsSummary::default()),
            Err(e) => return Err(e.into()),
        };

        let mut summary = MetricsSummary::default();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if idx == 0 || line.trim().is_empty() {
                continue;
            }
            match MetricsRecord::from_row(&line) {
                Ok(record) => {
                    summary.total_cost += record.cost_usd;
                    *summary.tasks.entry(record.task_type).or_insert(0.0) += record.cost_usd;
                    summary.total_calls += 1;
                    summary.total_tokens += record.total_tokens;
                }
                Err(reason) => {
                    let err = MetricsError::Malformed {
                        line: idx + 1,
                        reason,
                    };
                    warn!(error = %err, "Skipping metrics row");
                    summary.skipped_rows += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Every parseable row, oldest first.
    pub fn records(&self) -> Result<Vec<MetricsRecord>, MetricsError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in BufReader::new(file).lines().skip(1) {
            if let Ok(record) = MetricsRecord::from_row(&line?) {
                out.push(record);
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
