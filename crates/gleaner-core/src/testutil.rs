//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` (or atomics for plain counters) for interior
//! mutability, allowing test assertions on recorded calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::job::Job;
use crate::models::{AttributeConfidence, Classification, Product, RawProduct, UpsertOutcome};
use crate::pool::ResourceFactory;
use crate::reporter::{HarvestEvent, HarvestReporter};
use crate::traits::{Classifier, DetailFetcher, PageRenderer, ProductStore, StoreScraper};

/// Builds a fresh error for each scripted failure.
pub type ErrorFn = fn() -> AppError;

/// A valid raw listing entry.
pub fn raw_product(name: &str, url: &str) -> RawProduct {
    RawProduct {
        name: Some(name.to_string()),
        product_url: Some(url.to_string()),
        price: Some("19.99".to_string()),
        image_url: Some(format!("{url}.jpg")),
        description: None,
    }
}

/// `n` valid entries at `https://<store>.test/<category>/<i>`.
pub fn sample_listing(store: &str, category: &str, n: usize) -> Vec<RawProduct> {
    (0..n)
        .map(|i| {
            raw_product(
                &format!("{category} item {i}"),
                &format!("https://{store}.test/{category}/{i}"),
            )
        })
        .collect()
}

/// `n` confident, non-default classifications.
pub fn labels(n: usize) -> Vec<Classification> {
    vec![
        Classification {
            category: "top".to_string(),
            color: "black".to_string(),
            pattern: "solid".to_string(),
            gender: "women".to_string(),
            sleeve_length: Some("short".to_string()),
            neckline: Some("round".to_string()),
            length: None,
            confidence: AttributeConfidence {
                category: 0.9,
                color: 0.8,
                pattern: 0.8,
                gender: 0.7,
                sleeve_length: Some(0.6),
                neckline: Some(0.6),
                length: None,
            },
        };
        n
    ]
}

// ---------------------------------------------------------------------------
// MockResourceFactory
// ---------------------------------------------------------------------------

/// Stand-in for a browser instance.
#[derive(Debug, Clone, Default)]
pub struct MockBrowser {
    pub id: usize,
}

impl PageRenderer for MockBrowser {
    async fn render(&self, url: &str) -> Result<String, AppError> {
        Ok(format!("<html><body><h1>{url}</h1></body></html>"))
    }
}

/// Factory that counts creations and destructions.
#[derive(Clone, Default)]
pub struct MockResourceFactory {
    created: Arc<AtomicUsize>,
    destroyed: Arc<AtomicUsize>,
    /// Remaining `create` calls that fail.
    failures: Arc<Mutex<usize>>,
}

impl MockResourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` creations fail with [`AppError::ResourceCreation`].
    pub fn failing_first(n: usize) -> Self {
        Self {
            failures: Arc::new(Mutex::new(n)),
            ..Self::default()
        }
    }

    /// Every creation fails.
    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl ResourceFactory for MockResourceFactory {
    type Resource = MockBrowser;

    async fn create(&self) -> Result<MockBrowser, AppError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(AppError::ResourceCreation(
                    "mock browser failed to launch".to_string(),
                ));
            }
        }
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockBrowser { id })
    }

    async fn destroy(&self, _resource: MockBrowser) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MockScraper
// ---------------------------------------------------------------------------

/// Scraper with per-category listings and scripted failures.
///
/// Categories without a configured listing yield three sample products.
#[derive(Clone, Default)]
pub struct MockScraper {
    listings: Arc<Mutex<HashMap<String, Vec<RawProduct>>>>,
    /// category -> (remaining failures, error)
    failures: Arc<Mutex<HashMap<String, (u32, ErrorFn)>>>,
    calls: Arc<Mutex<HashMap<String, u32>>>,
    delay: Duration,
}

impl MockScraper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listing(self, category: &str, listing: Vec<RawProduct>) -> Self {
        self.listings
            .lock()
            .unwrap()
            .insert(category.to_string(), listing);
        self
    }

    /// The first `times` scrapes of `category` fail with `error()`.
    pub fn failing(self, category: &str, times: u32, error: ErrorFn) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(category.to_string(), (times, error));
        self
    }

    pub fn always_failing(self, category: &str, error: ErrorFn) -> Self {
        self.failing(category, u32::MAX, error)
    }

    /// Every scrape takes `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self, category: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(category)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

impl<R: Sync> StoreScraper<R> for MockScraper {
    async fn scrape(&self, _resource: &R, job: &Job) -> Result<Vec<RawProduct>, AppError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(job.category.clone())
            .or_default() += 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&job.category) {
                Some((remaining, error)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*error)
                }
                _ => None,
            }
        };
        if let Some(error) = scripted {
            return Err(error());
        }

        let listings = self.listings.lock().unwrap();
        Ok(listings
            .get(&job.category)
            .cloned()
            .unwrap_or_else(|| sample_listing(&job.store, &job.category, 3)))
    }
}

// ---------------------------------------------------------------------------
// MockDetailFetcher
// ---------------------------------------------------------------------------

/// Detail fetcher that fills in a description, failing for chosen URLs.
#[derive(Clone, Default)]
pub struct MockDetailFetcher {
    failing_urls: Arc<Mutex<HashSet<String>>>,
    fail_all: bool,
    error: Option<ErrorFn>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl MockDetailFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_urls(mut self, urls: Vec<String>, error: ErrorFn) -> Self {
        self.failing_urls.lock().unwrap().extend(urls);
        self.error = Some(error);
        self
    }

    pub fn failing_all(mut self, error: ErrorFn) -> Self {
        self.fail_all = true;
        self.error = Some(error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `fetch_detail` calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl DetailFetcher for MockDetailFetcher {
    async fn fetch_detail(&self, mut product: Product) -> Result<Product, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fails =
            self.fail_all || self.failing_urls.lock().unwrap().contains(&product.product_url);
        if fails && let Some(error) = self.error {
            return Err(error());
        }

        product.description = Some(format!("Details for {}", product.name));
        Ok(product)
    }
}

// ---------------------------------------------------------------------------
// MockClassifier
// ---------------------------------------------------------------------------

/// Classifier that pops scripted responses, then labels everything.
#[derive(Clone, Default)]
pub struct MockClassifier {
    /// Queue of responses. Each call pops the first element.
    /// If empty, every product gets [`labels`].
    responses: Arc<Mutex<Vec<Result<Vec<Classification>, AppError>>>>,
    batch_sizes: Arc<Mutex<Vec<usize>>>,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<Vec<Classification>, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    /// Sizes of every batch received, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

impl Classifier for MockClassifier {
    async fn classify(&self, batch: &[Product]) -> Result<Vec<Classification>, AppError> {
        self.batch_sizes.lock().unwrap().push(batch.len());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(labels(batch.len()))
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockProductStore
// ---------------------------------------------------------------------------

/// In-memory product store keyed by natural key.
#[derive(Clone, Default)]
pub struct MockProductStore {
    products: Arc<Mutex<HashMap<String, Product>>>,
    failing_urls: Arc<Mutex<HashSet<String>>>,
    /// Upserts still to fail regardless of URL.
    remaining_failures: Arc<Mutex<usize>>,
    error: Option<ErrorFn>,
}

impl MockProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_urls(mut self, urls: Vec<String>, error: ErrorFn) -> Self {
        self.failing_urls.lock().unwrap().extend(urls);
        self.error = Some(error);
        self
    }

    /// The first `n` upserts fail with `error()`, whatever the product.
    pub fn failing_first(mut self, n: usize, error: ErrorFn) -> Self {
        *self.remaining_failures.lock().unwrap() = n;
        self.error = Some(error);
        self
    }

    pub fn len(&self) -> usize {
        self.products.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, product_url: &str) -> Option<Product> {
        self.products
            .lock()
            .unwrap()
            .values()
            .find(|p| p.product_url == product_url)
            .cloned()
    }
}

impl ProductStore for MockProductStore {
    async fn upsert(&self, product: &Product) -> Result<UpsertOutcome, AppError> {
        {
            let mut remaining = self.remaining_failures.lock().unwrap();
            if *remaining > 0
                && let Some(error) = self.error
            {
                *remaining -= 1;
                return Err(error());
            }
        }
        if self
            .failing_urls
            .lock()
            .unwrap()
            .contains(&product.product_url)
            && let Some(error) = self.error
        {
            return Err(error());
        }
        let previous = self
            .products
            .lock()
            .unwrap()
            .insert(product.natural_key(), product.clone());
        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records a short description of every event.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// States entered by one job, in order.
    pub fn states(&self, store: &str, category: &str) -> Vec<String> {
        let prefix = format!("job_state {store}/{category} ");
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(String::from))
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl HarvestReporter for MockReporter {
    fn report(&self, event: HarvestEvent<'_>) {
        let line = match event {
            HarvestEvent::RunStarted { stores, jobs } => format!("run_started {stores} {jobs}"),
            HarvestEvent::StoreStarted { store, .. } => format!("store_started {store}"),
            HarvestEvent::StoreAlreadyDone { store } => format!("store_done {store}"),
            HarvestEvent::JobSkipped { job } => format!("job_skipped {}/{}", job.store, job.category),
            HarvestEvent::JobTransition { job, to, .. } => {
                format!("job_state {}/{} {to}", job.store, job.category)
            }
            HarvestEvent::JobStarted { job, attempt } => {
                format!("job_started {}/{} {attempt}", job.store, job.category)
            }
            HarvestEvent::JobRetrying { job, attempt, .. } => {
                format!("job_retrying {}/{} {attempt}", job.store, job.category)
            }
            HarvestEvent::JobSucceeded { job, attempts, .. } => {
                format!("job_succeeded {}/{} {attempts}", job.store, job.category)
            }
            HarvestEvent::JobFailed { job, attempts, .. } => {
                format!("job_failed {}/{} {attempts}", job.store, job.category)
            }
            HarvestEvent::StoreFinished { report } => format!("store_finished {}", report.store),
            HarvestEvent::Interrupted => "interrupted".to_string(),
            HarvestEvent::RunFinished { .. } => "run_finished".to_string(),
        };
        self.events.lock().unwrap().push(line);
    }
}
