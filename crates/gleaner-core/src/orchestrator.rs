//! Runs a harvest plan: stores in priority order, bounded store-workers,
//! sequential jobs per store, checkpointed outcomes.
//!
//! ```text
//! run(plan)
//!   └─ for store in plan.by_priority()          (≤ max_concurrent_stores at once)
//!        └─ store-worker: pool.acquire()          (one resource for the whole store)
//!             └─ for job in store.jobs            (strictly sequential)
//!                  checkpoint.is_done? → SKIPPED
//!                  retry(pipeline.run(job))  → SUCCEEDED | TERMINAL_FAILED
//!                  checkpoint.record_outcome + flush
//! ```
//!
//! Failures never cross a boundary: an item failure stays in its job's
//! report, a failed job does not stop its store, and a failed (or panicking)
//! store does not stop its siblings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::error::AppError;
use crate::job::{HarvestPlan, Job, JobState, StorePlan};
use crate::pipeline::PipelineRunner;
use crate::pool::{ResourceFactory, ResourcePool};
use crate::report::{JobReport, RunSummary, StoreReport};
use crate::reporter::{HarvestEvent, HarvestReporter, TracingReporter};
use crate::retry::{ClockJitter, JitterSource, RetryExecutor, RetryPolicy};
use crate::traits::{Classifier, DetailFetcher, ProductStore, StoreScraper};

/// Lifecycle of one job within a run. Illegal moves are logged and ignored.
struct JobLifecycle<'a, Rep: HarvestReporter> {
    job: &'a Job,
    reporter: &'a Rep,
    state: Mutex<JobState>,
}

impl<'a, Rep: HarvestReporter> JobLifecycle<'a, Rep> {
    fn new(job: &'a Job, reporter: &'a Rep) -> Self {
        Self {
            job,
            reporter,
            state: Mutex::new(JobState::Pending),
        }
    }

    fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, to: JobState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let from = *state;
            if !from.can_transition_to(to) {
                tracing::error!(store = %self.job.store, category = %self.job.category, %from, %to, "Rejected illegal job state transition");
                return;
            }
            *state = to;
            from
        };
        self.reporter.report(HarvestEvent::JobTransition {
            job: self.job,
            from,
            to,
        });
    }
}

/// Global scheduling knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent_stores: usize,
    /// Retry policy for whole jobs.
    pub job_policy: RetryPolicy,
    /// Pause between consecutive jobs of one store.
    pub inter_job_delay: Duration,
    /// Pause between launching consecutive store-workers.
    pub inter_store_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stores: 2,
            job_policy: RetryPolicy::for_jobs(3),
            inter_job_delay: Duration::from_secs(2),
            inter_store_delay: Duration::from_secs(5),
        }
    }
}

/// Coordinates store-workers over a shared resource pool and checkpoint.
pub struct JobOrchestrator<F, S, D, C, P, Rep = TracingReporter>
where
    F: ResourceFactory,
    D: DetailFetcher,
    C: Classifier,
    P: ProductStore,
{
    pool: ResourcePool<F>,
    pipeline: Arc<PipelineRunner<S, D, C, P>>,
    checkpoint: Arc<CheckpointStore>,
    config: OrchestratorConfig,
    reporter: Arc<Rep>,
    jitter: Arc<dyn JitterSource>,
    cancel: CancellationToken,
}

impl<F, S, D, C, P, Rep> Clone for JobOrchestrator<F, S, D, C, P, Rep>
where
    F: ResourceFactory,
    D: DetailFetcher,
    C: Classifier,
    P: ProductStore,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            pipeline: Arc::clone(&self.pipeline),
            checkpoint: Arc::clone(&self.checkpoint),
            config: self.config.clone(),
            reporter: Arc::clone(&self.reporter),
            jitter: Arc::clone(&self.jitter),
            cancel: self.cancel.clone(),
        }
    }
}

impl<F, S, D, C, P> JobOrchestrator<F, S, D, C, P, TracingReporter>
where
    F: ResourceFactory,
    D: DetailFetcher,
    C: Classifier,
    P: ProductStore,
{
    pub fn new(
        pool: ResourcePool<F>,
        pipeline: PipelineRunner<S, D, C, P>,
        checkpoint: Arc<CheckpointStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            pipeline: Arc::new(pipeline),
            checkpoint,
            config,
            reporter: Arc::new(TracingReporter),
            jitter: Arc::new(ClockJitter),
            cancel: CancellationToken::new(),
        }
    }
}

impl<F, S, D, C, P, Rep> JobOrchestrator<F, S, D, C, P, Rep>
where
    F: ResourceFactory,
    S: StoreScraper<F::Resource> + 'static,
    D: DetailFetcher,
    C: Classifier + 'static,
    P: ProductStore,
    Rep: HarvestReporter + 'static,
{
    pub fn with_reporter<R2: HarvestReporter + 'static>(
        self,
        reporter: R2,
    ) -> JobOrchestrator<F, S, D, C, P, R2> {
        JobOrchestrator {
            pool: self.pool,
            pipeline: self.pipeline,
            checkpoint: self.checkpoint,
            config: self.config,
            reporter: Arc::new(reporter),
            jitter: self.jitter,
            cancel: self.cancel,
        }
    }

    /// Stop launching stores and jobs once `cancel` fires.
    ///
    /// Pass the same token to the [`PipelineRunner`] so in-flight jobs stop
    /// waiting too.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_jitter_source(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn pool(&self) -> &ResourcePool<F> {
        &self.pool
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    /// Run every store of `plan` and report on all of them.
    ///
    /// Never fails: store and job failures end up in the summary.
    pub async fn run(&self, plan: &HarvestPlan) -> RunSummary {
        let started_at = Utc::now();
        let stores = plan.by_priority();
        self.reporter.report(HarvestEvent::RunStarted {
            stores: stores.len(),
            jobs: plan.job_count(),
        });

        let slots = Arc::new(Semaphore::new(self.config.max_concurrent_stores.max(1)));
        let mut workers = JoinSet::new();
        let mut launched: HashMap<tokio::task::Id, StorePlan> = HashMap::new();
        let mut reports = Vec::new();
        let mut remaining = stores.into_iter();

        for store in remaining.by_ref() {
            if self.cancel.is_cancelled() {
                reports.push(self.unstarted(&store));
                break;
            }

            if self.all_done(&store) {
                self.reporter
                    .report(HarvestEvent::StoreAlreadyDone { store: &store.name });
                reports.push(self.already_done(&store));
                continue;
            }

            if !launched.is_empty() && !self.config.inter_store_delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(self.config.inter_store_delay) => {}
                    () = self.cancel.cancelled() => {
                        reports.push(self.unstarted(&store));
                        break;
                    }
                }
            }

            let permit = tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        reports.push(self.unstarted(&store));
                        break;
                    }
                },
                () = self.cancel.cancelled() => {
                    reports.push(self.unstarted(&store));
                    break;
                }
            };

            let worker = self.clone();
            let plan = store.clone();
            let handle = workers.spawn(async move {
                let report = worker.run_store(&plan).await;
                drop(permit);
                report
            });
            launched.insert(handle.id(), store);
        }

        // Stores never launched because of an interrupt.
        for store in remaining {
            reports.push(self.unstarted(&store));
        }

        while let Some(joined) = workers.join_next_with_id().await {
            match joined {
                Ok((_, report)) => reports.push(report),
                Err(e) => {
                    let Some(store) = launched.get(&e.id()) else {
                        continue;
                    };
                    tracing::error!(store = %store.name, error = %e, "Store worker panicked");
                    let error = AppError::Generic(format!("store worker panicked: {e}"));
                    let unfinished: Vec<Job> = store
                        .to_jobs()
                        .into_iter()
                        .filter(|job| !self.checkpoint.is_done(&job.store, job.item_key()))
                        .collect();
                    reports.push(StoreReport::failed_store(&store.name, &error, &unfinished));
                }
            }
        }

        if let Err(e) = self.checkpoint.flush().await {
            tracing::error!(error = %e, "Failed to flush checkpoint at end of run");
        }

        let interrupted = self.cancel.is_cancelled();
        if interrupted {
            self.reporter.report(HarvestEvent::Interrupted);
        }
        let summary = RunSummary::from_stores(started_at, reports, interrupted);
        self.reporter
            .report(HarvestEvent::RunFinished { summary: &summary });
        summary
    }

    fn all_done(&self, store: &StorePlan) -> bool {
        store
            .jobs
            .iter()
            .all(|spec| self.checkpoint.is_done(&store.name, &spec.category))
    }

    fn already_done(&self, store: &StorePlan) -> StoreReport {
        let mut report = StoreReport::new(&store.name);
        for job in store.to_jobs() {
            JobLifecycle::new(&job, &*self.reporter).advance(JobState::Skipped);
            report.push(JobReport::skipped(&job));
        }
        report
    }

    fn unstarted(&self, store: &StorePlan) -> StoreReport {
        StoreReport {
            interrupted: true,
            ..StoreReport::new(&store.name)
        }
    }

    /// One store-worker: a single resource, jobs strictly in order.
    async fn run_store(&self, store: &StorePlan) -> StoreReport {
        let jobs = store.to_jobs();
        let pending = jobs
            .iter()
            .filter(|job| !self.checkpoint.is_done(&job.store, job.item_key()))
            .count();
        self.reporter.report(HarvestEvent::StoreStarted {
            store: &store.name,
            pending_jobs: pending,
        });

        let handle = match self.pool.acquire().await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(store = %store.name, error = %e, "Store worker could not acquire a resource");
                let mut report = StoreReport::new(&store.name);
                report.error = Some(e.root_message());
                for job in &jobs {
                    if self.checkpoint.is_done(&job.store, job.item_key()) {
                        report.push(JobReport::skipped(job));
                    } else {
                        report.push(JobReport::not_started(job, &e));
                    }
                }
                self.reporter
                    .report(HarvestEvent::StoreFinished { report: &report });
                return report;
            }
        };

        let executor = RetryExecutor::new(format!("job:{}", store.name))
            .with_jitter_source(Arc::clone(&self.jitter))
            .with_cancellation(self.cancel.clone());

        let mut report = StoreReport::new(&store.name);
        let mut ran_any = false;
        for job in &jobs {
            if self.checkpoint.is_done(&job.store, job.item_key()) {
                JobLifecycle::new(job, &*self.reporter).advance(JobState::Skipped);
                self.reporter.report(HarvestEvent::JobSkipped { job });
                report.push(JobReport::skipped(job));
                continue;
            }
            if self.cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            if ran_any && !self.config.inter_job_delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(self.config.inter_job_delay) => {}
                    () = self.cancel.cancelled() => {
                        report.interrupted = true;
                        break;
                    }
                }
            }
            ran_any = true;

            match self.run_job(&executor, &*handle, job).await {
                Some(job_report) => report.push(job_report),
                None => {
                    report.interrupted = true;
                    break;
                }
            }

            if let Err(e) = self.checkpoint.flush().await {
                tracing::warn!(store = %store.name, error = %e, "Failed to flush checkpoint");
            }
        }

        handle.release();
        self.reporter
            .report(HarvestEvent::StoreFinished { report: &report });
        report
    }

    /// Run one job to a terminal state. Returns `None` if the run was
    /// interrupted first, in which case no outcome is recorded.
    ///
    /// Classifier calls of every attempt count towards the checkpoint's API
    /// counter, whatever the outcome.
    async fn run_job(
        &self,
        executor: &RetryExecutor,
        resource: &F::Resource,
        job: &Job,
    ) -> Option<JobReport> {
        let started = Instant::now();
        let pipeline = &*self.pipeline;
        let reporter = &*self.reporter;
        let lifecycle = JobLifecycle::new(job, reporter);
        let lifecycle = &lifecycle;
        let api_calls = AtomicU64::new(0);
        let calls = &api_calls;
        let mut attempt = 0;

        let result = executor
            .execute_with(
                &self.config.job_policy,
                move || {
                    attempt += 1;
                    lifecycle.advance(JobState::Running);
                    reporter.report(HarvestEvent::JobStarted { job, attempt });
                    pipeline.run_counted(resource, job, calls)
                },
                |attempt, error, delay| {
                    lifecycle.advance(JobState::RetryWait);
                    let error = error.to_string();
                    reporter.report(HarvestEvent::JobRetrying {
                        job,
                        attempt,
                        delay,
                        error: &error,
                    });
                },
            )
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let api_calls = api_calls.load(Ordering::Relaxed);
        self.checkpoint.record_api_calls(api_calls);

        match result {
            Ok(retried) => {
                lifecycle.advance(JobState::Succeeded);
                self.checkpoint
                    .record_outcome(&job.store, job.item_key(), true);
                reporter.report(HarvestEvent::JobSucceeded {
                    job,
                    attempts: retried.attempts,
                    products: retried.value.persisted(),
                });
                Some(
                    JobReport::succeeded(job, retried.attempts, duration_ms, retried.value)
                        .with_api_calls(api_calls),
                )
            }
            Err(_) if self.cancel.is_cancelled() => {
                tracing::info!(
                    store = %job.store,
                    category = %job.category,
                    state = %lifecycle.state(),
                    "Job interrupted, leaving it for the next run"
                );
                None
            }
            Err(e) => {
                lifecycle.advance(JobState::TerminalFailed);
                self.checkpoint
                    .record_outcome(&job.store, job.item_key(), false);
                let error = e.root_message();
                reporter.report(HarvestEvent::JobFailed {
                    job,
                    attempts: e.attempts(),
                    error: &error,
                });
                Some(JobReport::failed(job, &e, duration_ms).with_api_calls(api_calls))
            }
        }
    }
}
