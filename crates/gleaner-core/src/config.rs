use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::orchestrator::OrchestratorConfig;
use crate::pipeline::PipelineConfig;
use crate::retry::RetryPolicy;

/// Harvest tuning, read from `GLEANER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestConfig {
    pub max_concurrent_stores: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_jitter: Duration,
    pub inter_job_delay: Duration,
    pub inter_store_delay: Duration,
    pub pool_size: usize,
    pub pool_idle_timeout: Duration,
    pub checkpoint_path: PathBuf,
    pub checkpoint_flush_interval: Duration,
    pub enrich_concurrency: usize,
    pub classify_batch_size: usize,
    pub inter_batch_delay: Duration,
    /// Timeout for every single external operation.
    pub operation_timeout: Duration,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stores: 2,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            retry_jitter: Duration::from_millis(500),
            inter_job_delay: Duration::from_millis(2000),
            inter_store_delay: Duration::from_millis(5000),
            pool_size: 2,
            pool_idle_timeout: Duration::from_secs(300),
            checkpoint_path: PathBuf::from(".gleaner/checkpoint.json"),
            checkpoint_flush_interval: Duration::from_secs(30),
            enrich_concurrency: 4,
            classify_batch_size: 10,
            inter_batch_delay: Duration::from_millis(1000),
            operation_timeout: Duration::from_secs(60),
        }
    }
}

impl HarvestConfig {
    /// Read configuration from environment variables, falling back to defaults.
    ///
    /// - `GLEANER_MAX_CONCURRENT_STORES` (default 2)
    /// - `GLEANER_MAX_RETRIES` (default 3)
    /// - `GLEANER_RETRY_BASE_DELAY_MS` (default 1000)
    /// - `GLEANER_RETRY_JITTER_MS` (default 500)
    /// - `GLEANER_INTER_JOB_DELAY_MS` (default 2000)
    /// - `GLEANER_INTER_STORE_DELAY_MS` (default 5000)
    /// - `GLEANER_POOL_SIZE` (default 2)
    /// - `GLEANER_POOL_IDLE_TIMEOUT_SECS` (default 300)
    /// - `GLEANER_CHECKPOINT_PATH` (default `.gleaner/checkpoint.json`)
    /// - `GLEANER_CHECKPOINT_FLUSH_INTERVAL_SECS` (default 30)
    /// - `GLEANER_ENRICH_CONCURRENCY` (default 4)
    /// - `GLEANER_CLASSIFY_BATCH_SIZE` (default 10)
    /// - `GLEANER_INTER_BATCH_DELAY_MS` (default 1000)
    /// - `GLEANER_OPERATION_TIMEOUT_SECS` (default 60)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| -> Result<Duration, AppError> {
            Ok(Duration::from_millis(parse(&lookup, key, default.as_millis() as u64)?))
        };
        let secs = |key: &str, default: Duration| -> Result<Duration, AppError> {
            Ok(Duration::from_secs(parse(&lookup, key, default.as_secs())?))
        };

        let config = Self {
            max_concurrent_stores: parse(
                &lookup,
                "GLEANER_MAX_CONCURRENT_STORES",
                defaults.max_concurrent_stores,
            )?,
            max_retries: parse(&lookup, "GLEANER_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay: millis("GLEANER_RETRY_BASE_DELAY_MS", defaults.retry_base_delay)?,
            retry_jitter: millis("GLEANER_RETRY_JITTER_MS", defaults.retry_jitter)?,
            inter_job_delay: millis("GLEANER_INTER_JOB_DELAY_MS", defaults.inter_job_delay)?,
            inter_store_delay: millis("GLEANER_INTER_STORE_DELAY_MS", defaults.inter_store_delay)?,
            pool_size: parse(&lookup, "GLEANER_POOL_SIZE", defaults.pool_size)?,
            pool_idle_timeout: secs("GLEANER_POOL_IDLE_TIMEOUT_SECS", defaults.pool_idle_timeout)?,
            checkpoint_path: lookup("GLEANER_CHECKPOINT_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_path),
            checkpoint_flush_interval: secs(
                "GLEANER_CHECKPOINT_FLUSH_INTERVAL_SECS",
                defaults.checkpoint_flush_interval,
            )?,
            enrich_concurrency: parse(
                &lookup,
                "GLEANER_ENRICH_CONCURRENCY",
                defaults.enrich_concurrency,
            )?,
            classify_batch_size: parse(
                &lookup,
                "GLEANER_CLASSIFY_BATCH_SIZE",
                defaults.classify_batch_size,
            )?,
            inter_batch_delay: millis("GLEANER_INTER_BATCH_DELAY_MS", defaults.inter_batch_delay)?,
            operation_timeout: secs("GLEANER_OPERATION_TIMEOUT_SECS", defaults.operation_timeout)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Counts and intervals that must be non-zero.
    pub fn validate(&self) -> Result<(), AppError> {
        let positive = [
            ("GLEANER_MAX_CONCURRENT_STORES", self.max_concurrent_stores),
            ("GLEANER_POOL_SIZE", self.pool_size),
            ("GLEANER_ENRICH_CONCURRENCY", self.enrich_concurrency),
            ("GLEANER_CLASSIFY_BATCH_SIZE", self.classify_batch_size),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(AppError::ConfigError(format!("{key} must be at least 1")));
            }
        }
        if self.operation_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "GLEANER_OPERATION_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        if self.checkpoint_flush_interval.is_zero() {
            return Err(AppError::ConfigError(
                "GLEANER_CHECKPOINT_FLUSH_INTERVAL_SECS must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Policy shared by the per-item collaborators, each attempt bounded by
    /// the operation timeout.
    fn operation_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.max_retries)
            .with_base_delay(self.retry_base_delay)
            .with_jitter(self.retry_jitter)
            .with_attempt_timeout(self.operation_timeout)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent_stores: self.max_concurrent_stores,
            job_policy: RetryPolicy::for_jobs(self.max_retries)
                .with_base_delay(self.retry_base_delay)
                .with_jitter(self.retry_jitter),
            inter_job_delay: self.inter_job_delay,
            inter_store_delay: self.inter_store_delay,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            enrich_concurrency: self.enrich_concurrency,
            classify_batch_size: self.classify_batch_size,
            inter_batch_delay: self.inter_batch_delay,
            extract_timeout: Some(self.operation_timeout),
            detail_policy: self.operation_policy().with_max_retries(self.max_retries.min(2)),
            classify_policy: self.operation_policy(),
            persist_policy: self.operation_policy().with_max_retries(self.max_retries.min(2)),
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': must be a non-negative integer"))
        }),
    }
}
