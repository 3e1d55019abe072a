#[cfg(feature = "browser")]
pub mod browser;
pub mod details;
pub mod fetcher;
pub mod listing;
pub mod llm;

#[cfg(feature = "browser")]
pub use browser::{BrowserFactory, BrowserSession};
pub use details::HttpDetailFetcher;
pub use fetcher::{HttpRenderer, HttpRendererFactory};
pub use listing::{SelectorScraper, parse_listing};
pub use llm::OpenAiClassifier;
