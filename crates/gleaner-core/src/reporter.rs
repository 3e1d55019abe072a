use std::time::Duration;

use crate::job::{Job, JobState};
use crate::report::{RunSummary, StoreReport};

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum HarvestEvent<'a> {
    RunStarted {
        stores: usize,
        jobs: usize,
    },
    StoreStarted {
        store: &'a str,
        pending_jobs: usize,
    },
    /// Every job of the store is already done; no resource is acquired.
    StoreAlreadyDone {
        store: &'a str,
    },
    JobSkipped {
        job: &'a Job,
    },
    /// A job moved to a new lifecycle state.
    JobTransition {
        job: &'a Job,
        from: JobState,
        to: JobState,
    },
    JobStarted {
        job: &'a Job,
        attempt: u32,
    },
    JobRetrying {
        job: &'a Job,
        attempt: u32,
        delay: Duration,
        error: &'a str,
    },
    JobSucceeded {
        job: &'a Job,
        attempts: u32,
        products: usize,
    },
    JobFailed {
        job: &'a Job,
        attempts: u32,
        error: &'a str,
    },
    StoreFinished {
        report: &'a StoreReport,
    },
    Interrupted,
    RunFinished {
        summary: &'a RunSummary,
    },
}

/// Trait for receiving harvest events (decoupled logging).
pub trait HarvestReporter: Send + Sync {
    fn report(&self, event: HarvestEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl HarvestReporter for TracingReporter {
    fn report(&self, event: HarvestEvent<'_>) {
        match event {
            HarvestEvent::RunStarted { stores, jobs } => {
                tracing::info!(stores, jobs, "Harvest run started");
            }
            HarvestEvent::StoreStarted {
                store,
                pending_jobs,
            } => {
                tracing::info!(%store, pending_jobs, "Store worker started");
            }
            HarvestEvent::StoreAlreadyDone { store } => {
                tracing::info!(%store, "All jobs already completed, skipping store");
            }
            HarvestEvent::JobSkipped { job } => {
                tracing::debug!(store = %job.store, category = %job.category, "Job already completed");
            }
            HarvestEvent::JobTransition { job, from, to } => {
                tracing::trace!(store = %job.store, category = %job.category, %from, %to, "Job state changed");
            }
            HarvestEvent::JobStarted { job, attempt } => {
                tracing::info!(store = %job.store, category = %job.category, attempt, "Running job");
            }
            HarvestEvent::JobRetrying {
                job,
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(
                    store = %job.store,
                    category = %job.category,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "Job attempt failed, retrying"
                );
            }
            HarvestEvent::JobSucceeded {
                job,
                attempts,
                products,
            } => {
                tracing::info!(store = %job.store, category = %job.category, attempts, products, "Job succeeded");
            }
            HarvestEvent::JobFailed {
                job,
                attempts,
                error,
            } => {
                tracing::error!(store = %job.store, category = %job.category, attempts, %error, "Job failed");
            }
            HarvestEvent::StoreFinished { report } => {
                tracing::info!(
                    store = %report.store,
                    success = report.success,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Store worker finished"
                );
            }
            HarvestEvent::Interrupted => {
                tracing::warn!("Harvest interrupted, no new jobs will start");
            }
            HarvestEvent::RunFinished { summary } => {
                tracing::info!(
                    total = summary.total,
                    success = summary.success,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    interrupted = summary.interrupted,
                    "Harvest run finished"
                );
            }
        }
    }
}
