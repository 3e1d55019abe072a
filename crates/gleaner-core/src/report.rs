//! Per-job, per-store and per-run outcome reports.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobState};
use crate::pipeline::PipelineReport;

/// Final outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub store: String,
    pub category: String,
    pub url: String,
    pub state: JobState,
    /// Attempts made in this run (0 when skipped or never started).
    pub attempts: u32,
    /// Last error message for failed jobs.
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Classifier calls across every attempt, including failed ones.
    pub api_calls: u64,
    /// Report of the successful attempt.
    pub pipeline: Option<PipelineReport>,
}

impl JobReport {
    pub fn skipped(job: &Job) -> Self {
        Self::new(job, JobState::Skipped)
    }

    pub fn succeeded(job: &Job, attempts: u32, duration_ms: u64, pipeline: PipelineReport) -> Self {
        Self {
            attempts,
            duration_ms,
            pipeline: Some(pipeline),
            ..Self::new(job, JobState::Succeeded)
        }
    }

    pub fn failed(job: &Job, error: &AppError, duration_ms: u64) -> Self {
        Self {
            attempts: error.attempts(),
            error: Some(error.root_message()),
            duration_ms,
            ..Self::new(job, JobState::TerminalFailed)
        }
    }

    pub fn with_api_calls(mut self, api_calls: u64) -> Self {
        self.api_calls = api_calls;
        self
    }

    /// A job that never ran because its store could not start.
    pub fn not_started(job: &Job, error: &AppError) -> Self {
        Self {
            error: Some(error.root_message()),
            ..Self::new(job, JobState::TerminalFailed)
        }
    }

    fn new(job: &Job, state: JobState) -> Self {
        Self {
            store: job.store.clone(),
            category: job.category.clone(),
            url: job.url.clone(),
            state,
            attempts: 0,
            error: None,
            duration_ms: 0,
            api_calls: 0,
            pipeline: None,
        }
    }

    /// Retries beyond the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Aggregate outcome of one store-worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreReport {
    pub store: String,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Retries across all jobs of the store.
    pub retried: u32,
    pub filtered_out: usize,
    pub products_inserted: usize,
    pub products_updated: usize,
    pub item_errors: usize,
    pub api_calls: u64,
    /// Store-level failure (e.g. the resource could not be created).
    pub error: Option<String>,
    /// Set when the run was interrupted before every job of the store finished.
    pub interrupted: bool,
    pub jobs: Vec<JobReport>,
}

impl StoreReport {
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            ..Default::default()
        }
    }

    /// A store that failed as a whole before or while running its jobs.
    pub fn failed_store(store: impl Into<String>, error: &AppError, jobs: &[Job]) -> Self {
        let mut report = Self::new(store);
        report.error = Some(error.root_message());
        for job in jobs {
            report.push(JobReport::not_started(job, error));
        }
        report
    }

    pub fn push(&mut self, job: JobReport) {
        self.total += 1;
        match job.state {
            JobState::Succeeded => self.success += 1,
            JobState::TerminalFailed => self.failed += 1,
            JobState::Skipped => self.skipped += 1,
            _ => {}
        }
        self.retried += job.retries();
        self.api_calls += job.api_calls;
        if let Some(pipeline) = &job.pipeline {
            self.filtered_out += pipeline.filtered_out;
            self.products_inserted += pipeline.inserted;
            self.products_updated += pipeline.updated;
            self.item_errors += pipeline.item_errors.len();
        }
        self.jobs.push(job);
    }

    pub fn job(&self, category: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.category == category)
    }
}

/// A job that ended in `TERMINAL_FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    pub store: String,
    pub category: String,
    pub url: String,
    pub attempts: u32,
    pub error: String,
}

/// Roll-up of every store report of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub interrupted: bool,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub retried: u32,
    pub filtered_out: usize,
    pub products_inserted: usize,
    pub products_updated: usize,
    pub api_calls: u64,
    pub failures: Vec<FailedJob>,
    pub stores: Vec<StoreReport>,
}

impl RunSummary {
    pub fn from_stores(
        started_at: DateTime<Utc>,
        mut stores: Vec<StoreReport>,
        interrupted: bool,
    ) -> Self {
        stores.sort_by(|a, b| a.store.cmp(&b.store));

        let mut failures = Vec::new();
        for job in stores.iter().flat_map(|s| &s.jobs) {
            if job.state == JobState::TerminalFailed {
                failures.push(FailedJob {
                    store: job.store.clone(),
                    category: job.category.clone(),
                    url: job.url.clone(),
                    attempts: job.attempts,
                    error: job.error.clone().unwrap_or_default(),
                });
            }
        }

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at,
            duration_ms,
            interrupted,
            total: stores.iter().map(|s| s.total).sum(),
            success: stores.iter().map(|s| s.success).sum(),
            failed: stores.iter().map(|s| s.failed).sum(),
            skipped: stores.iter().map(|s| s.skipped).sum(),
            retried: stores.iter().map(|s| s.retried).sum(),
            filtered_out: stores.iter().map(|s| s.filtered_out).sum(),
            products_inserted: stores.iter().map(|s| s.products_inserted).sum(),
            products_updated: stores.iter().map(|s| s.products_updated).sum(),
            api_calls: stores.iter().map(|s| s.api_calls).sum(),
            failures,
            stores,
        }
    }

    pub fn store(&self, name: &str) -> Option<&StoreReport> {
        self.stores.iter().find(|s| s.store == name)
    }

    /// Write `run-summary-<UTC timestamp>.json` into `dir`, returning its path.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf, AppError> {
        std::fs::create_dir_all(dir).map_err(|e| {
            AppError::Generic(format!("Failed to create {}: {e}", dir.display()))
        })?;
        let path = dir.join(format!(
            "run-summary-{}.json",
            self.finished_at.format("%Y%m%dT%H%M%SZ")
        ));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| {
            AppError::Generic(format!("Failed to write {}: {e}", path.display()))
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(store: &str, category: &str) -> Job {
        Job::new(store, format!("https://{store}.test/{category}"), category, 0)
    }

    fn pipeline(filtered_out: usize, inserted: usize, api_calls: u64) -> PipelineReport {
        PipelineReport {
            filtered_out,
            inserted,
            api_calls,
            ..Default::default()
        }
    }

    #[test]
    fn store_report_counts_each_state() {
        let mut report = StoreReport::new("acme");
        report.push(
            JobReport::succeeded(&job("acme", "tops"), 3, 10, pipeline(2, 5, 1)).with_api_calls(3),
        );
        report.push(JobReport::skipped(&job("acme", "shoes")));
        let error = AppError::RetriesExhausted {
            operation: "job".into(),
            attempts: 4,
            last_error: Box::new(AppError::NetworkError("down".into())),
        };
        report.push(JobReport::failed(&job("acme", "bags"), &error, 10).with_api_calls(4));

        assert_eq!(report.total, 3);
        assert_eq!(report.success, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 2 + 3);
        assert_eq!(report.filtered_out, 2);
        assert_eq!(report.products_inserted, 5);
        assert_eq!(report.job("bags").unwrap().attempts, 4);
        assert_eq!(report.api_calls, 7);
    }

    #[test]
    fn failed_store_marks_every_job_failed() {
        let jobs = vec![job("acme", "tops"), job("acme", "shoes")];
        let report = StoreReport::failed_store(
            "acme",
            &AppError::ResourceCreation("no chrome".into()),
            &jobs,
        );
        assert_eq!(report.failed, 2);
        assert!(report.error.as_deref().unwrap().contains("no chrome"));
        assert!(report.jobs.iter().all(|j| j.attempts == 0));
    }

    #[test]
    fn summary_rolls_up_and_lists_failures() {
        let mut a = StoreReport::new("b-store");
        a.push(
            JobReport::succeeded(&job("b-store", "tops"), 1, 1, pipeline(1, 2, 3)).with_api_calls(3),
        );
        let mut b = StoreReport::new("a-store");
        b.push(
            JobReport::failed(
                &job("a-store", "shoes"),
                &AppError::ScrapeError {
                    message: "layout changed".into(),
                    retryable: false,
                },
                1,
            )
            .with_api_calls(2),
        );

        let started_at = Utc::now() - chrono::Duration::seconds(90);
        let summary = RunSummary::from_stores(started_at, vec![a, b], false);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.api_calls, 5);
        assert!(summary.duration_ms >= 90_000);
        assert_eq!(summary.stores[0].store, "a-store");
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].category, "shoes");
        assert_eq!(summary.failures[0].attempts, 1);
        assert!(summary.failures[0].error.contains("layout changed"));
    }

    #[test]
    fn summary_is_written_with_timestamped_name() {
        let dir = tempfile::tempdir().unwrap();
        let summary = RunSummary::from_stores(Utc::now(), vec![], true);
        let path = summary.write_to_dir(&dir.path().join("runs")).unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("run-summary-") && name.ends_with(".json"));
        let back: RunSummary = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(back.interrupted);
    }
}
