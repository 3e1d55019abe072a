use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Label used when a product could not be classified.
pub const UNKNOWN_LABEL: &str = "unknown";

/// A product as scraped from a listing page, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawProduct {
    pub name: Option<String>,
    /// Absolute URL of the product detail page.
    pub product_url: Option<String>,
    pub price: Option<String>,
    pub image_url: Option<String>,
    pub description: Option<String>,
}

impl RawProduct {
    /// Returns the reason this product should be filtered out, if any.
    pub fn validation_issue(&self) -> Option<&'static str> {
        if self.name.as_deref().is_none_or(|n| n.trim().is_empty()) {
            return Some("missing name");
        }
        if self
            .product_url
            .as_deref()
            .is_none_or(|u| u.trim().is_empty())
        {
            return Some("missing product url");
        }
        None
    }
}

/// Categories that carry a sleeve length.
pub const SLEEVE_CATEGORIES: &[&str] = &[
    "dress", "top", "shirt", "blouse", "t-shirt", "sweater", "hoodie", "jacket", "coat",
];

/// Categories that carry a neckline.
pub const NECKLINE_CATEGORIES: &[&str] = &["dress", "top", "shirt", "blouse", "t-shirt", "sweater"];

/// Categories that carry a garment length.
pub const LENGTH_CATEGORIES: &[&str] = &["dress", "skirt"];

/// Attributes assigned by the classifier.
///
/// `sleeve_length`, `neckline` and `length` only exist for categories where
/// they make sense; see [`Classification::with_applicable_attributes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub color: String,
    pub pattern: String,
    /// Target audience (`women`, `men`, `kids`, ...).
    pub gender: String,
    pub sleeve_length: Option<String>,
    pub neckline: Option<String>,
    pub length: Option<String>,
    pub confidence: AttributeConfidence,
}

/// Per-attribute confidence in `[0, 1]`. Conditional attributes have a
/// confidence exactly when they have a label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeConfidence {
    pub category: f32,
    pub color: f32,
    pub pattern: f32,
    pub gender: f32,
    pub sleeve_length: Option<f32>,
    pub neckline: Option<f32>,
    pub length: Option<f32>,
}

impl Classification {
    /// The degraded default for products the classifier could not handle.
    pub fn unclassified() -> Self {
        Self {
            category: UNKNOWN_LABEL.to_string(),
            color: UNKNOWN_LABEL.to_string(),
            pattern: UNKNOWN_LABEL.to_string(),
            gender: UNKNOWN_LABEL.to_string(),
            sleeve_length: None,
            neckline: None,
            length: None,
            confidence: AttributeConfidence::default(),
        }
    }

    /// A product is unclassified when its category is unknown, whatever the
    /// other attributes say.
    pub fn is_unclassified(&self) -> bool {
        self.category == UNKNOWN_LABEL
    }

    /// Drop conditional attributes that do not apply to the category.
    pub fn with_applicable_attributes(mut self) -> Self {
        let category = self.category.as_str();
        if !SLEEVE_CATEGORIES.contains(&category) || self.sleeve_length.is_none() {
            self.sleeve_length = None;
            self.confidence.sleeve_length = None;
        }
        if !NECKLINE_CATEGORIES.contains(&category) || self.neckline.is_none() {
            self.neckline = None;
            self.confidence.neckline = None;
        }
        if !LENGTH_CATEGORIES.contains(&category) || self.length.is_none() {
            self.length = None;
            self.confidence.length = None;
        }
        self
    }
}

/// A validated product ready for classification and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub store: String,
    /// Category of the harvest job this product came from.
    pub source_category: String,
    pub name: String,
    pub product_url: String,
    pub price: Option<String>,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub classification: Classification,
}

impl Product {
    /// Build a product from a validated raw listing entry.
    ///
    /// Returns `None` when the entry fails [`RawProduct::validation_issue`].
    pub fn from_raw(store: &str, source_category: &str, raw: RawProduct) -> Option<Self> {
        if raw.validation_issue().is_some() {
            return None;
        }
        Some(Self {
            store: store.to_string(),
            source_category: source_category.to_string(),
            name: raw.name?.trim().to_string(),
            product_url: raw.product_url?.trim().to_string(),
            price: raw.price,
            image_url: raw.image_url,
            description: raw.description,
            classification: Classification::unclassified(),
        })
    }

    /// Natural key used for idempotent upserts: one row per (store, product url).
    pub fn natural_key(&self) -> String {
        compute_hash(&format!("{}\n{}", self.store, self.product_url))
    }

    /// Hash of the mutable content, for change detection on update.
    pub fn content_hash(&self) -> String {
        let content = serde_json::json!({
            "name": self.name,
            "price": self.price,
            "image_url": self.image_url,
            "description": self.description,
            "classification": self.classification,
        });
        compute_hash(&content.to_string())
    }
}

/// Result of an idempotent upsert, reported explicitly by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
