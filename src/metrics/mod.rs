pub mod csv;
pub mod logger;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::logger::MetricsLogger;

/// Column order of the metrics log.
pub const COLUMNS: [&str; 11] = [
    "timestamp",
    "model",
    "provider",
    "task_type",
    "input_tokens",
    "output_tokens",
    "total_tokens",
    "cost_usd",
    "accuracy_score",
    "tenant_id",
    "is_failover",
];

/// One generation call to be logged. Missing token counts count as zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsEntry {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    pub task_type: String,
    #[serde(default)]
    pub accuracy_score: Option<f64>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub is_failover: bool,
}

impl MetricsEntry {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            task_type: task_type.into(),
            ..Self::default()
        }
    }

    pub fn tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = Some(input);
        self.output_tokens = Some(output);
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn accuracy(mut self, score: f64) -> Self {
        self.accuracy_score = Some(score);
        self
    }

    pub fn failover(mut self, is_failover: bool) -> Self {
        self.is_failover = is_failover;
        self
    }
}

/// A row of the metrics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub provider: String,
    pub task_type: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub accuracy_score: Option<f64>,
    pub tenant_id: Option<String>,
    pub is_failover: bool,
}

impl MetricsRecord {
    pub fn to_row(&self) -> String {
        csv::join_row([
            self.timestamp.to_rfc3339(),
            self.model.clone(),
            self.provider.clone(),
            self.task_type.clone(),
            self.input_tokens.to_string(),
            self.output_tokens.to_string(),
            self.total_tokens.to_string(),
            self.cost_usd.to_string(),
            self.accuracy_score.map(|s| s.to_string()).unwrap_or_default(),
            self.tenant_id.clone().unwrap_or_default(),
            self.is_failover.to_string(),
        ])
    }

    /// Parse a row. Errors name the offending column.
    pub fn from_row(line: &str) -> Result<Self, String> {
        let fields = csv::split_row(line).ok_or("unterminated quote")?;
        if fields.len() != COLUMNS.len() {
            return Err(format!(
                "expected {} columns, found {}",
                COLUMNS.len(),
                fields.len()
            ));
        }

        fn num<T: std::str::FromStr>(value: &str, column: &str) -> Result<T, String> {
            value
                .trim()
                .parse()
                .map_err(|_| format!("invalid {column}: {value:?}"))
        }
        fn optional(value: &str) -> Option<String> {
            let v = value.trim();
            (!v.is_empty()).then(|| v.to_string())
        }

        let accuracy_score = match optional(&fields[8]) {
            Some(v) => Some(num::<f64>(&v, "accuracy_score")?),
            None => None,
        };

        Ok(Self {
            timestamp: DateTime::parse_from_rfc3339(fields[0].trim())
                .map_err(|_| format!("invalid timestamp: {:?}", fields[0]))?
                .with_timezone(&Utc),
            model: fields[1].clone(),
            provider: fields[2].clone(),
            task_type: fields[3].clone(),
            input_tokens: num(&fields[4], "input_tokens")?,
            output_tokens: num(&fields[5], "output_tokens")?,
            total_tokens: num(&fields[6], "total_tokens")?,
            cost_usd: num(&fields[7], "cost_usd")?,
            accuracy_score,
            tenant_id: optional(&fields[9]),
            is_failover: matches!(fields[10].trim(), "true" | "True" | "1"),
        })
    }
}

/// Cost totals across the whole log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_cost: f64,
    /// Cost per task type.
    pub tasks: BTreeMap<String, f64>,
    pub total_calls: u64,
    pub total_tokens: u64,
    /// Rows that could not be parsed and were left out.
    pub skipped_rows: u64,
}
