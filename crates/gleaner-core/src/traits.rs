use std::future::Future;

use crate::error::AppError;
use crate::job::Job;
use crate::models::{Classification, Product, RawProduct, UpsertOutcome};

/// What a pooled resource offers to scrapers: rendering a page to HTML.
pub trait PageRenderer: Send + Sync {
    fn render(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Produces the raw product listing for one harvest job.
///
/// The resource is borrowed for the duration of the call only and must not
/// be retained afterwards.
pub trait StoreScraper<R>: Send + Sync + Clone {
    fn scrape(
        &self,
        resource: &R,
        job: &Job,
    ) -> impl Future<Output = Result<Vec<RawProduct>, AppError>> + Send;
}

/// Enriches one product with details from its own page.
pub trait DetailFetcher: Send + Sync + Clone + 'static {
    fn fetch_detail(
        &self,
        product: Product,
    ) -> impl Future<Output = Result<Product, AppError>> + Send;
}

/// Assigns attributes to a batch of products.
///
/// Implementations must return exactly one classification per input product,
/// in input order.
pub trait Classifier: Send + Sync + Clone {
    fn classify(
        &self,
        batch: &[Product],
    ) -> impl Future<Output = Result<Vec<Classification>, AppError>> + Send;

    /// Whether calls reach an external API (and count against its quota).
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Idempotent persistence keyed by [`Product::natural_key`].
pub trait ProductStore: Send + Sync + Clone + 'static {
    fn upsert(
        &self,
        product: &Product,
    ) -> impl Future<Output = Result<UpsertOutcome, AppError>> + Send;
}

/// A missing classifier degrades every product to [`Classification::unclassified`].
impl<C: Classifier> Classifier for Option<C> {
    async fn classify(&self, batch: &[Product]) -> Result<Vec<Classification>, AppError> {
        match self {
            Some(inner) => inner.classify(batch).await,
            None => Ok(vec![Classification::unclassified(); batch.len()]),
        }
    }

    fn is_enabled(&self) -> bool {
        self.as_ref().is_some_and(|inner| inner.is_enabled())
    }
}

/// A no-op DetailFetcher that passes products through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDetails;

impl DetailFetcher for NoDetails {
    async fn fetch_detail(&self, product: Product) -> Result<Product, AppError> {
        Ok(product)
    }
}

/// A no-op ProductStore for use when persistence is not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

impl ProductStore for NullStore {
    async fn upsert(&self, _product: &Product) -> Result<UpsertOutcome, AppError> {
        Ok(UpsertOutcome::Inserted)
    }
}
