//! Aggregated run report.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::pipeline::ProcessingResult;

/// Failure summary for one store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreFailure {
    pub store_id: String,
    pub attempts: u32,
    pub errors: Vec<String>,
}

/// Outcome of one `start_processing` run.
///
/// Every store that was eligible to run appears exactly once: in `results`
/// with its final status, or in `skipped_stores` when the run stopped before
/// it started.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_stores: usize,
    pub completed_stores: usize,
    pub failed_stores: usize,
    /// Failed stores where at least one step succeeded.
    pub partial_stores: usize,
    pub skipped_stores: Vec<String>,
    /// Processing attempts including retries.
    pub total_attempts: usize,
    /// Metrics summed over every attempt.
    pub metrics: BTreeMap<String, f64>,
    /// API calls reported by every attempt, failed steps included.
    pub api_calls: u64,
    /// Completed stores as a percentage of all stores.
    pub success_rate: f64,
    /// API calls per minute relative to the nominal limit.
    pub api_usage_rate: f64,
    /// Final result per store, ordered by store id.
    pub results: Vec<ProcessingResult>,
    pub failures: Vec<StoreFailure>,
}

impl AggregatedReport {
    pub fn total_api_calls(&self) -> u64 {
        self.api_calls
    }
}

/// Accumulates results while a run is in progress.
#[derive(Debug)]
pub(crate) struct ReportBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finals: BTreeMap<String, ProcessingResult>,
    metrics: BTreeMap<String, f64>,
    api_calls: u64,
    attempts: usize,
}

impl ReportBuilder {
    pub(crate) fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finals: BTreeMap::new(),
            metrics: BTreeMap::new(),
            api_calls: 0,
            attempts: 0,
        }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Records one finished attempt. A later attempt of the same store
    /// replaces its earlier result.
    pub(crate) fn record(&mut self, result: ProcessingResult) {
        self.attempts += 1;
        self.api_calls += result.api_calls();
        for (name, value) in &result.metrics {
            *self.metrics.entry(name.clone()).or_insert(0.0) += value;
        }
        self.finals.insert(result.store_id.clone(), result);
    }

    pub(crate) fn finish(
        self,
        skipped: Vec<String>,
        elapsed: Duration,
        requests_per_minute: u64,
    ) -> AggregatedReport {
        let skipped: Vec<String> = skipped
            .into_iter()
            .filter(|id| !self.finals.contains_key(id))
            .collect();

        let results: Vec<ProcessingResult> = self.finals.into_values().collect();
        let completed_stores = results.iter().filter(|r| r.is_success()).count();
        let failed_stores = results.len() - completed_stores;
        let partial_stores = results.iter().filter(|r| r.is_partial()).count();
        let total_stores = results.len() + skipped.len();

        let success_rate = if total_stores == 0 {
            0.0
        } else {
            completed_stores as f64 / total_stores as f64 * 100.0
        };

        let api_calls = self.api_calls as f64;
        let elapsed_minutes = elapsed.as_secs_f64() / 60.0;
        let api_usage_rate = if elapsed_minutes > 0.0 && requests_per_minute > 0 {
            api_calls / elapsed_minutes / requests_per_minute as f64
        } else {
            0.0
        };

        let failures = results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| StoreFailure {
                store_id: r.store_id.clone(),
                attempts: r.attempt + 1,
                errors: r.errors.clone(),
            })
            .collect();

        AggregatedReport {
            run_id: self.run_id,
            started_at: self.started_at,
            ended_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            total_stores,
            completed_stores,
            failed_stores,
            partial_stores,
            skipped_stores: skipped,
            total_attempts: self.attempts,
            metrics: self.metrics,
            api_calls: self.api_calls,
            success_rate,
            api_usage_rate,
            results,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{StepResult, StepResults};
    use serde_json::json;

    fn result(store_id: &str, attempt: u32, steps: Vec<(&str, StepResult)>) -> ProcessingResult {
        let steps: StepResults = steps
            .into_iter()
            .map(|(id, r)| (id.to_string(), r))
            .collect();
        let now = Utc::now();
        ProcessingResult::from_steps(store_id, attempt, now, now, &steps)
    }

    #[test]
    fn test_report_counts_final_results() {
        let mut builder = ReportBuilder::new(Utc::now());
        builder.record(result("a", 0, vec![("x", StepResult::ok(json!({"api_calls": 30}), 1))]));
        builder.record(result("b", 0, vec![("x", StepResult::failed("boom", 1))]));
        builder.record(result("b", 1, vec![("x", StepResult::ok(json!({"api_calls": 30}), 1))]));
        builder.record(result(
            "c",
            0,
            vec![
                ("x", StepResult::ok(json!({"api_calls": 15}), 1)),
                ("y", StepResult::failed("bad", 1)),
            ],
        ));

        let report = builder.finish(vec!["d".to_string()], Duration::from_secs(60), 60);
        assert_eq!(report.total_stores, 4);
        assert_eq!(report.completed_stores, 2);
        assert_eq!(report.failed_stores, 1);
        assert_eq!(report.partial_stores, 1);
        assert_eq!(report.skipped_stores, vec!["d".to_string()]);
        assert_eq!(report.total_attempts, 4);
        assert_eq!(report.total_api_calls(), 75);
        assert!((report.success_rate - 50.0).abs() < 1e-9);
        assert!((report.api_usage_rate - 1.25).abs() < 1e-9);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].store_id, "c");
        assert_eq!(report.results.len(), 3);
    }

    #[test]
    fn test_api_calls_from_failed_steps_are_reported() {
        let mut builder = ReportBuilder::new(Utc::now());
        builder.record(result(
            "a",
            0,
            vec![("x", StepResult::failed("quota", 1).with_data(json!({"api_calls": 40})))],
        ));
        builder.record(result("a", 1, vec![("x", StepResult::ok(json!({"api_calls": 20}), 1))]));

        let report = builder.finish(Vec::new(), Duration::from_secs(60), 60);
        assert_eq!(report.total_api_calls(), 60);
        assert!((report.api_usage_rate - 1.0).abs() < 1e-9);
        assert_eq!(report.metrics.get("api_calls"), Some(&20.0));
    }

    #[test]
    fn test_empty_report() {
        let report = ReportBuilder::new(Utc::now()).finish(Vec::new(), Duration::ZERO, 60);
        assert_eq!(report.total_stores, 0);
        assert_eq!(report.success_rate, 0.0);
        assert_eq!(report.api_usage_rate, 0.0);
    }

    #[test]
    fn test_skipped_store_with_result_is_not_double_counted() {
        let mut builder = ReportBuilder::new(Utc::now());
        builder.record(result("a", 0, vec![("x", StepResult::failed("boom", 1))]));

        // failed once, then the run stopped while its retry was queued
        let report = builder.finish(vec!["a".to_string()], Duration::from_secs(1), 60);
        assert_eq!(report.total_stores, 1);
        assert_eq!(report.failed_stores, 1);
        assert!(report.skipped_stores.is_empty());
    }
}
