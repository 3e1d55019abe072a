use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;

/// Lifecycle state of a harvest job within one run.
///
/// ```text
/// PENDING -> RUNNING -> SUCCEEDED
///               |  ^
///               v  |
///           RETRY_WAIT -> ... -> TERMINAL_FAILED
/// PENDING -> SKIPPED   (already completed in the checkpoint)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    RetryWait,
    Succeeded,
    TerminalFailed,
    Skipped,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::RetryWait => "retry_wait",
            JobState::Succeeded => "succeeded",
            JobState::TerminalFailed => "terminal_failed",
            JobState::Skipped => "skipped",
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Succeeded)
                | (Running, RetryWait)
                | (Running, TerminalFailed)
                | (RetryWait, Running)
                | (RetryWait, TerminalFailed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One harvest job: a single category listing of a single store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub store: String,
    pub url: String,
    pub category: String,
    pub priority: i32,
}

impl Job {
    pub fn new(
        store: impl Into<String>,
        url: impl Into<String>,
        category: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            store: store.into(),
            url: url.into(),
            category: category.into(),
            priority,
        }
    }

    /// Checkpoint item key of this job within its store's scope.
    pub fn item_key(&self) -> &str {
        &self.category
    }
}

/// CSS selectors describing a store's listing and detail pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSelectors {
    /// Selects one element per product card on a listing page.
    pub item: String,
    /// Relative to the product card.
    pub name: String,
    /// Anchor relative to the product card; its `href` is the product URL.
    pub link: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    /// Selector on the product detail page holding the description.
    #[serde(default)]
    pub detail_description: Option<String>,
}

/// A category entry of a store in the harvest plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub category: String,
    pub url: String,
}

/// A store and its ordered job list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePlan {
    pub name: String,
    /// Lower runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub selectors: Option<StoreSelectors>,
    pub jobs: Vec<JobSpec>,
}

impl StorePlan {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            selectors: None,
            jobs: Vec::new(),
        }
    }

    pub fn with_job(mut self, category: impl Into<String>, url: impl Into<String>) -> Self {
        self.jobs.push(JobSpec {
            category: category.into(),
            url: url.into(),
        });
        self
    }

    pub fn with_selectors(mut self, selectors: StoreSelectors) -> Self {
        self.selectors = Some(selectors);
        self
    }

    /// The store's jobs in plan order.
    pub fn to_jobs(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .map(|spec| Job::new(&self.name, &spec.url, &spec.category, self.priority))
            .collect()
    }
}

/// The full set of stores to harvest, as read from a plan file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestPlan {
    pub stores: Vec<StorePlan>,
}

impl HarvestPlan {
    pub fn new(stores: Vec<StorePlan>) -> Self {
        Self { stores }
    }

    /// Read and validate a JSON plan file.
    pub fn from_path(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read plan {}: {e}", path.display()))
        })?;
        let plan: HarvestPlan = serde_json::from_str(&raw)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Store names must be unique, categories unique per store, URLs absolute http(s).
    pub fn validate(&self) -> Result<(), AppError> {
        let mut names = HashSet::new();
        for store in &self.stores {
            if store.name.trim().is_empty() {
                return Err(AppError::ConfigError("Store name must not be empty".into()));
            }
            if !names.insert(store.name.as_str()) {
                return Err(AppError::ConfigError(format!(
                    "Duplicate store '{}' in plan",
                    store.name
                )));
            }
            let mut categories = HashSet::new();
            for job in &store.jobs {
                if !categories.insert(job.category.as_str()) {
                    return Err(AppError::ConfigError(format!(
                        "Duplicate category '{}' for store '{}'",
                        job.category, store.name
                    )));
                }
                let url = Url::parse(&job.url).map_err(|e| {
                    AppError::ConfigError(format!("Invalid URL '{}': {e}", job.url))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(AppError::ConfigError(format!(
                        "URL scheme '{}' is not allowed (only http/https)",
                        url.scheme()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Keep only the named stores (all stores when `names` is empty).
    pub fn retain_stores(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.stores.retain(|s| names.iter().any(|n| n == &s.name));
    }

    /// Stores sorted ascending by priority; ties keep plan order.
    pub fn by_priority(&self) -> Vec<StorePlan> {
        let mut stores = self.stores.clone();
        stores.sort_by_key(|s| s.priority);
        stores
    }

    pub fn job_count(&self) -> usize {
        self.stores.iter().map(|s| s.jobs.len()).sum()
    }
}
