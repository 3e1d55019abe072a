pub mod checkpoint;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod job;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod report;
pub mod reporter;
pub mod retry;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use checkpoint::{CheckpointData, CheckpointStore, ScopeRecord};
pub use concurrency::{Settled, settle_bounded};
pub use config::HarvestConfig;
pub use error::AppError;
pub use job::{HarvestPlan, Job, JobSpec, JobState, StorePlan, StoreSelectors};
pub use models::{AttributeConfidence, Classification, Product, RawProduct, UNKNOWN_LABEL, UpsertOutcome, compute_hash};
pub use orchestrator::{JobOrchestrator, OrchestratorConfig};
pub use pipeline::{ItemFailure, PipelineConfig, PipelineReport, PipelineRunner, Stage};
pub use pool::{PoolStats, ResourceFactory, ResourceHandle, ResourcePool};
pub use report::{FailedJob, JobReport, RunSummary, StoreReport};
pub use reporter::{HarvestEvent, HarvestReporter, TracingReporter};
pub use retry::{ClockJitter, FixedJitter, JitterSource, Retried, RetryExecutor, RetryPolicy, RetryState};
pub use traits::{
    Classifier, DetailFetcher, NoDetails, NullStore, PageRenderer, ProductStore, StoreScraper,
};
