//! Step results reported by a pipeline and their per-store interpretation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metric name read from step data and charged against the API budget.
pub const API_CALLS_METRIC: &str = "api_calls";

/// Outcome of one named pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    /// Step output. Numeric top-level fields of an object are summed into
    /// the run metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    /// Creates a successful step result.
    pub fn ok(data: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            duration_ms,
        }
    }

    /// Attaches step output, e.g. usage counters of a failed step.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Creates a failed step result.
    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Step id to result, ordered by id.
pub type StepResults = BTreeMap<String, StepResult>;

/// Final status of one store's processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStatus::Completed => write!(f, "completed"),
            ProcessingStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of processing one store once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub store_id: String,
    pub status: ProcessingStatus,
    /// Attempts made before this one.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
    pub errors: Vec<String>,
    pub steps_total: usize,
    pub steps_succeeded: usize,
    /// API calls reported by every step, failed ones included.
    #[serde(default)]
    pub api_calls: u64,
}

impl ProcessingResult {
    /// Interprets pipeline step results.
    ///
    /// The attempt succeeds only when at least one step ran and every step
    /// succeeded. Metrics are summed from successful steps only; the
    /// `api_calls` counter is summed over every step.
    pub fn from_steps(
        store_id: impl Into<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        steps: &StepResults,
    ) -> Self {
        let mut metrics = BTreeMap::new();
        let mut errors = Vec::new();
        let mut steps_succeeded = 0;
        let mut api_calls = 0.0;

        for (step_id, step) in steps {
            if let Some(n) = step
                .data
                .as_ref()
                .and_then(|data| data.get(API_CALLS_METRIC))
                .and_then(|v| v.as_f64())
            {
                api_calls += n.max(0.0);
            }

            if step.success {
                steps_succeeded += 1;
                if let Some(serde_json::Value::Object(fields)) = &step.data {
                    for (name, value) in fields {
                        if let Some(n) = value.as_f64() {
                            *metrics.entry(name.clone()).or_insert(0.0) += n;
                        }
                    }
                }
            } else {
                let message = step.error.as_deref().unwrap_or("step failed");
                errors.push(format!("{}: {}", step_id, message));
            }
        }

        if steps.is_empty() {
            errors.push("pipeline returned no steps".to_string());
        }

        let status = if !steps.is_empty() && errors.is_empty() {
            ProcessingStatus::Completed
        } else {
            ProcessingStatus::Failed
        };

        Self {
            store_id: store_id.into(),
            status,
            attempt,
            started_at,
            ended_at,
            metrics,
            errors,
            steps_total: steps.len(),
            steps_succeeded,
            api_calls: api_calls.round() as u64,
        }
    }

    /// Creates a failed result for an attempt that never produced steps.
    pub fn failed(
        store_id: impl Into<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            status: ProcessingStatus::Failed,
            attempt,
            started_at,
            ended_at: Utc::now(),
            metrics: BTreeMap::new(),
            errors: vec![error.into()],
            steps_total: 0,
            steps_succeeded: 0,
            api_calls: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProcessingStatus::Completed
    }

    /// Failed, but at least one step succeeded.
    pub fn is_partial(&self) -> bool {
        self.status == ProcessingStatus::Failed && self.steps_succeeded > 0
    }

    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }

    /// API calls reported through the `api_calls` field of any step.
    pub fn api_calls(&self) -> u64 {
        self.api_calls
    }

    /// Joined error text, for events and logs.
    pub fn error_summary(&self) -> String {
        self.errors.join("; ")
    }
}
