//! Staged per-job pipeline: extract → filter → enrich → transform → persist.
//!
//! Extract and filter failures fail the job. The later stages isolate
//! per-item failures and record them in the [`PipelineReport`]; such a stage
//! fails the job only when *every* unit failed because its collaborator was
//! unreachable, since then retrying the whole job is the only sensible move.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::concurrency::{Settled, settle_bounded};
use crate::error::AppError;
use crate::job::Job;
use crate::models::{Classification, Product, RawProduct, UpsertOutcome};
use crate::retry::{JitterSource, RetryExecutor, RetryPolicy};
use crate::traits::{Classifier, DetailFetcher, ProductStore, StoreScraper};

/// Tuning of the per-item stages.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Detail fetches in flight at once.
    pub enrich_concurrency: usize,
    pub classify_batch_size: usize,
    /// Pause between classifier batches.
    pub inter_batch_delay: Duration,
    /// Upper bound on a single listing scrape.
    pub extract_timeout: Option<Duration>,
    pub detail_policy: RetryPolicy,
    pub classify_policy: RetryPolicy,
    pub persist_policy: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enrich_concurrency: 4,
            classify_batch_size: 10,
            inter_batch_delay: Duration::from_secs(1),
            extract_timeout: None,
            detail_policy: RetryPolicy::default().with_max_retries(2),
            classify_policy: RetryPolicy::default(),
            persist_policy: RetryPolicy::default().with_max_retries(2),
        }
    }
}

/// Stage at which an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Enrich,
    Transform,
    Persist,
}

/// An isolated per-item failure. The item itself carries on in degraded form
/// (enrich, transform) or is not persisted (persist).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub stage: Stage,
    pub product_url: String,
    pub error: String,
}

/// Counters for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub extracted: usize,
    pub filtered_out: usize,
    pub enriched: usize,
    pub classified: usize,
    pub unclassified: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Classifier calls made, including retries.
    pub api_calls: u64,
    pub item_errors: Vec<ItemFailure>,
}

impl PipelineReport {
    pub fn persisted(&self) -> usize {
        self.inserted + self.updated
    }

    fn item_failed(&mut self, stage: Stage, product: &Product, error: &AppError) {
        self.item_errors.push(ItemFailure {
            stage,
            product_url: product.product_url.clone(),
            error: error.root_message(),
        });
    }
}

/// True when a stage had work and every unit of it failed as unreachable.
fn all_unreachable(errors: &[AppError], units: usize) -> bool {
    units > 0 && errors.len() == units && errors.iter().all(AppError::is_unreachable)
}

/// Runs the pipeline for one job against external collaborators.
///
/// Each collaborator class gets its own [`RetryExecutor`], so a failing
/// classifier does not escalate backoff for detail fetches.
pub struct PipelineRunner<S, D, C, P>
where
    D: DetailFetcher,
    C: Classifier,
    P: ProductStore,
{
    scraper: S,
    details: D,
    classifier: C,
    store: P,
    config: PipelineConfig,
    detail_retry: RetryExecutor,
    classify_retry: RetryExecutor,
    persist_retry: RetryExecutor,
    cancel: CancellationToken,
}

impl<S, D, C, P> PipelineRunner<S, D, C, P>
where
    D: DetailFetcher,
    C: Classifier,
    P: ProductStore,
{
    pub fn new(scraper: S, details: D, classifier: C, store: P, config: PipelineConfig) -> Self {
        Self {
            scraper,
            details,
            classifier,
            store,
            config,
            detail_retry: RetryExecutor::new("detail_fetch"),
            classify_retry: RetryExecutor::new("classify"),
            persist_retry: RetryExecutor::new("persist"),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort backoff waits and batch delays once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.detail_retry = self.detail_retry.with_cancellation(cancel.clone());
        self.classify_retry = self.classify_retry.with_cancellation(cancel.clone());
        self.persist_retry = self.persist_retry.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn with_jitter_source(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.detail_retry = self.detail_retry.with_jitter_source(jitter.clone());
        self.classify_retry = self.classify_retry.with_jitter_source(jitter.clone());
        self.persist_retry = self.persist_retry.with_jitter_source(jitter);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn scraper(&self) -> &S {
        &self.scraper
    }

    /// Run every stage for `job`, using `resource` for extraction only.
    pub async fn run<R>(&self, resource: &R, job: &Job) -> Result<PipelineReport, AppError>
    where
        S: StoreScraper<R>,
        R: Sync,
    {
        self.run_counted(resource, job, &AtomicU64::new(0)).await
    }

    /// Like [`run`](Self::run), also adding every classifier call made to
    /// `api_calls`, even when the run fails afterwards.
    pub async fn run_counted<R>(
        &self,
        resource: &R,
        job: &Job,
        api_calls: &AtomicU64,
    ) -> Result<PipelineReport, AppError>
    where
        S: StoreScraper<R>,
        R: Sync,
    {
        let mut report = PipelineReport::default();

        // 1. Extract
        let raw = self.extract(resource, job).await?;
        report.extracted = raw.len();

        // 2. Filter
        let (products, filtered_out) = self.filter(job, raw);
        report.filtered_out = filtered_out;
        tracing::info!(
            store = %job.store,
            category = %job.category,
            extracted = report.extracted,
            filtered_out,
            "Listing extracted"
        );
        if products.is_empty() {
            return Ok(report);
        }

        // 3. Enrich
        let products = self.enrich(products, &mut report).await?;
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        // 4. Transform
        let transformed = self.transform_batched(products, &mut report).await;
        api_calls.fetch_add(report.api_calls, Ordering::Relaxed);
        let products = transformed?;

        // 5. Persist
        self.persist(&products, &mut report).await?;

        tracing::info!(
            store = %job.store,
            category = %job.category,
            inserted = report.inserted,
            updated = report.updated,
            item_errors = report.item_errors.len(),
            "Pipeline complete"
        );
        Ok(report)
    }

    /// Produce the raw listing through the store scraper.
    pub async fn extract<R>(&self, resource: &R, job: &Job) -> Result<Vec<RawProduct>, AppError>
    where
        S: StoreScraper<R>,
        R: Sync,
    {
        match self.config.extract_timeout {
            Some(limit) => tokio::time::timeout(limit, self.scraper.scrape(resource, job))
                .await
                .map_err(|_| AppError::Timeout(limit.as_millis() as u64))?,
            None => self.scraper.scrape(resource, job).await,
        }
    }

    /// Drop entries missing identifying fields. Returns the survivors and
    /// how many were dropped.
    pub fn filter(&self, job: &Job, raw: Vec<RawProduct>) -> (Vec<Product>, usize) {
        let total = raw.len();
        let products: Vec<Product> = raw
            .into_iter()
            .filter_map(|item| {
                if let Some(reason) = item.validation_issue() {
                    tracing::debug!(store = %job.store, category = %job.category, reason, "Filtered out listing entry");
                    return None;
                }
                Product::from_raw(&job.store, &job.category, item)
            })
            .collect();
        let filtered_out = total - products.len();
        (products, filtered_out)
    }

    /// Fetch details for every product with bounded concurrency.
    ///
    /// Returns one settled result per input product, tagged with its index.
    pub async fn enrich_bounded(&self, products: &[Product]) -> Vec<Settled<Product>> {
        let policy = self.config.detail_policy.clone();
        settle_bounded(
            products.to_vec(),
            self.config.enrich_concurrency,
            |product| {
                let details = self.details.clone();
                let executor = self.detail_retry.clone();
                let policy = policy.clone();
                async move {
                    executor
                        .execute(&policy, || details.fetch_detail(product.clone()))
                        .await
                        .map(|retried| retried.value)
                }
            },
        )
        .await
    }

    async fn enrich(
        &self,
        products: Vec<Product>,
        report: &mut PipelineReport,
    ) -> Result<Vec<Product>, AppError> {
        let settled = self.enrich_bounded(&products).await;
        let units = products.len();

        let mut enriched = Vec::with_capacity(units);
        let mut errors = Vec::new();
        for (Settled { index, result }, original) in settled.into_iter().zip(products) {
            match result {
                Ok(product) => {
                    report.enriched += 1;
                    enriched.push(product);
                }
                Err(e) => {
                    tracing::debug!(index, url = %original.product_url, error = %e, "Detail fetch failed, keeping listing data");
                    report.item_failed(Stage::Enrich, &original, &e);
                    enriched.push(original);
                    errors.push(e);
                }
            }
        }

        if all_unreachable(&errors, units) {
            tracing::warn!(units, "Detail pages unreachable for every product");
            return Err(errors.swap_remove(0));
        }
        Ok(enriched)
    }

    /// Classify products in sequential batches.
    ///
    /// A batch that fails even after retries keeps the `unknown` default for
    /// all of its products.
    pub async fn transform_batched(
        &self,
        mut products: Vec<Product>,
        report: &mut PipelineReport,
    ) -> Result<Vec<Product>, AppError> {
        let batch_size = self.config.classify_batch_size.max(1);
        let batches = products.len().div_ceil(batch_size);
        let counts_calls = self.classifier.is_enabled();
        let mut errors = Vec::new();

        for (n, batch) in products.chunks_mut(batch_size).enumerate() {
            if n > 0 && counts_calls && !self.config.inter_batch_delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(self.config.inter_batch_delay) => {}
                    () = self.cancel.cancelled() => return Err(AppError::Cancelled),
                }
            }

            let items: &[Product] = batch;
            let outcome = self
                .classify_retry
                .execute(&self.config.classify_policy, || self.classify(items))
                .await;

            let error = match outcome {
                Ok(retried) => {
                    if counts_calls {
                        report.api_calls += u64::from(retried.attempts);
                    }
                    for (product, label) in batch.iter_mut().zip(retried.value) {
                        if label.is_unclassified() {
                            report.unclassified += 1;
                        } else {
                            report.classified += 1;
                        }
                        product.classification = label.with_applicable_attributes();
                    }
                    continue;
                }
                Err(e) => e,
            };

            if matches!(error, AppError::Cancelled) {
                return Err(error);
            }
            if counts_calls {
                report.api_calls += u64::from(error.attempts());
            }
            tracing::warn!(batch = n, size = batch.len(), error = %error, "Classification failed, degrading batch");
            for product in batch.iter_mut() {
                product.classification = Classification::unclassified();
                report.unclassified += 1;
                report.item_failed(Stage::Transform, product, &error);
            }
            errors.push(error);
        }

        if all_unreachable(&errors, batches) {
            return Err(errors.swap_remove(0));
        }
        Ok(products)
    }

    async fn classify(&self, batch: &[Product]) -> Result<Vec<Classification>, AppError> {
        let labels = self.classifier.classify(batch).await?;
        if labels.len() != batch.len() {
            return Err(AppError::ClassifierError {
                message: format!(
                    "expected {} classifications, got {}",
                    batch.len(),
                    labels.len()
                ),
                status_code: 200,
                retryable: false,
            });
        }
        Ok(labels)
    }

    /// Upsert every product by natural key, isolating per-product failures.
    pub async fn persist(
        &self,
        products: &[Product],
        report: &mut PipelineReport,
    ) -> Result<(), AppError> {
        let mut errors = Vec::new();
        for product in products {
            let outcome = self
                .persist_retry
                .execute(&self.config.persist_policy, || self.store.upsert(product))
                .await;
            match outcome {
                Ok(retried) => match retried.value {
                    UpsertOutcome::Inserted => report.inserted += 1,
                    UpsertOutcome::Updated => report.updated += 1,
                },
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    tracing::warn!(url = %product.product_url, error = %e, "Failed to persist product");
                    report.item_failed(Stage::Persist, product, &e);
                    errors.push(e);
                }
            }
        }

        if all_unreachable(&errors, products.len()) {
            return Err(errors.swap_remove(0));
        }
        Ok(())
    }
}
