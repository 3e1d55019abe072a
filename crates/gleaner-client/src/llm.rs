use std::time::Duration;

use gleaner_core::error::AppError;
use gleaner_core::models::{AttributeConfidence, Classification, Product, UNKNOWN_LABEL};
use gleaner_core::traits::Classifier;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::fetcher::map_send_error;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_SYSTEM_PROMPT: &str = "You are a fashion product classifier. For each numbered product, pick its garment category, dominant color, pattern and target gender from the allowed values. Give a sleeve length only for dresses, tops, shirts, blouses, t-shirts, sweaters, hoodies, jackets and coats; a neckline only for dresses, tops, shirts, blouses, t-shirts and sweaters; a length only for dresses and skirts; otherwise use null. Give every attribute a confidence between 0 and 1, null for attributes you left null. Use \"unknown\" when a value cannot be determined. Respond ONLY with valid JSON matching the requested schema.";

/// Longest description excerpt sent per product.
const MAX_DESCRIPTION_CHARS: usize = 300;

pub const CATEGORY_LABELS: &[&str] = &[
    "dress", "top", "shirt", "blouse", "t-shirt", "sweater", "hoodie", "jacket", "coat", "pants",
    "jeans", "shorts", "skirt", "shoes", "sneakers", "boots", "sandals", "heels", "bag",
    "backpack", "hat", "scarf", "belt", "sunglasses",
];

pub const COLOR_LABELS: &[&str] = &[
    "black", "white", "gray", "red", "blue", "green", "yellow", "orange", "pink", "purple",
    "brown", "beige", "navy", "burgundy", "cream",
];

pub const PATTERN_LABELS: &[&str] = &[
    "solid", "striped", "plaid", "floral", "geometric", "dots", "animal",
];

pub const GENDER_LABELS: &[&str] = &["men", "women", "boys", "girls", "unisex", "kids"];

pub const SLEEVE_LENGTH_LABELS: &[&str] = &["sleeveless", "short", "long", "three-quarter"];

pub const NECKLINE_LABELS: &[&str] = &[
    "round", "v-neck", "collar", "turtleneck", "scoop", "square", "off-shoulder",
];

pub const LENGTH_LABELS: &[&str] = &["mini", "knee", "midi", "maxi", "ankle"];

/// OpenAI-compatible LLM client that labels products in batches.
///
/// Works with any OpenAI-compatible API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
#[derive(Clone)]
pub struct OpenAiClassifier {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_ms: u64,
    system_prompt: String,
}

impl OpenAiClassifier {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let prompt = self.system_prompt.clone();
        Ok(Self::build(&self.api_key, &self.model, &self.base_url, timeout)?
            .with_system_prompt(prompt))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_ms: timeout.as_millis() as u64,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }

    fn request(&self, batch: &[Product]) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: user_prompt(batch),
                },
            ],
            response_format: Some(ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: Some(JsonSchemaWrapper {
                    name: "classification".to_string(),
                    strict: true,
                    schema: response_schema(),
                }),
            }),
        }
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_schema: Option<JsonSchemaWrapper>,
}

#[derive(Serialize)]
struct JsonSchemaWrapper {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ---- Classification payload ----

#[derive(Deserialize)]
struct LabelledBatch {
    items: Vec<LabelledItem>,
}

#[derive(Deserialize)]
struct LabelledItem {
    index: usize,
    category: String,
    color: String,
    pattern: String,
    #[serde(default)]
    gender: String,
    #[serde(default)]
    sleeve_length: Option<String>,
    #[serde(default)]
    neckline: Option<String>,
    #[serde(default)]
    length: Option<String>,
    confidence: LabelledConfidence,
}

#[derive(Deserialize)]
struct LabelledConfidence {
    category: f32,
    #[serde(default)]
    color: f32,
    #[serde(default)]
    pattern: f32,
    #[serde(default)]
    gender: f32,
    #[serde(default)]
    sleeve_length: Option<f32>,
    #[serde(default)]
    neckline: Option<f32>,
    #[serde(default)]
    length: Option<f32>,
}

fn user_prompt(batch: &[Product]) -> String {
    let mut prompt = format!(
        "Classify these {} products. Return exactly one item per product, with `index` set to the product number.\n\n",
        batch.len()
    );
    for (i, product) in batch.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. name: {}\n   listed under: {}\n",
            i + 1,
            product.name,
            product.source_category
        ));
        if let Some(description) = product.description.as_deref().map(str::trim)
            && !description.is_empty()
        {
            let excerpt: String = description.chars().take(MAX_DESCRIPTION_CHARS).collect();
            prompt.push_str(&format!("   description: {excerpt}\n"));
        }
    }
    prompt
}

fn with_unknown(labels: &[&'static str]) -> Vec<&'static str> {
    let mut values = labels.to_vec();
    values.push(UNKNOWN_LABEL);
    values
}

fn label(labels: &[&'static str]) -> serde_json::Value {
    json!({ "type": "string", "enum": with_unknown(labels) })
}

fn nullable_label(labels: &[&'static str]) -> serde_json::Value {
    let mut values: Vec<serde_json::Value> = with_unknown(labels).into_iter().map(Into::into).collect();
    values.push(serde_json::Value::Null);
    json!({ "type": ["string", "null"], "enum": values })
}

fn response_schema() -> serde_json::Value {
    let score = json!({ "type": "number" });
    let nullable_score = json!({ "type": ["number", "null"] });
    json!({
        "type": "object",
        "properties": {
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "index": { "type": "integer" },
                        "category": label(CATEGORY_LABELS),
                        "color": label(COLOR_LABELS),
                        "pattern": label(PATTERN_LABELS),
                        "gender": label(GENDER_LABELS),
                        "sleeve_length": nullable_label(SLEEVE_LENGTH_LABELS),
                        "neckline": nullable_label(NECKLINE_LABELS),
                        "length": nullable_label(LENGTH_LABELS),
                        "confidence": {
                            "type": "object",
                            "properties": {
                                "category": score,
                                "color": score,
                                "pattern": score,
                                "gender": score,
                                "sleeve_length": nullable_score,
                                "neckline": nullable_score,
                                "length": nullable_score
                            },
                            "required": [
                                "category", "color", "pattern", "gender",
                                "sleeve_length", "neckline", "length"
                            ],
                            "additionalProperties": false
                        }
                    },
                    "required": [
                        "index", "category", "color", "pattern", "gender",
                        "sleeve_length", "neckline", "length", "confidence"
                    ],
                    "additionalProperties": false
                }
            }
        },
        "required": ["items"],
        "additionalProperties": false
    })
}

/// Parse the model's JSON answer into one classification per product, in
/// product order.
///
/// Labels outside the vocabulary become `unknown`; a product the model skipped
/// is unclassified. An answer that is not valid JSON fails the whole batch.
fn parse_classifications(content: &str, expected: usize) -> Result<Vec<Classification>, AppError> {
    let batch: LabelledBatch = serde_json::from_str(content).map_err(|e| AppError::ClassifierError {
        message: format!("LLM returned invalid JSON: {e}. Raw: {content}"),
        status_code: 200,
        retryable: false,
    })?;

    let mut out = vec![Classification::unclassified(); expected];
    for item in batch.items {
        let Some(slot) = item.index.checked_sub(1).and_then(|i| out.get_mut(i)) else {
            tracing::debug!(index = item.index, "Classifier returned an out-of-range index");
            continue;
        };
        let confidence = item.confidence;
        *slot = Classification {
            category: normalize(&item.category, CATEGORY_LABELS),
            color: normalize(&item.color, COLOR_LABELS),
            pattern: normalize(&item.pattern, PATTERN_LABELS),
            gender: normalize(&item.gender, GENDER_LABELS),
            sleeve_length: item
                .sleeve_length
                .map(|l| normalize(&l, SLEEVE_LENGTH_LABELS)),
            neckline: item.neckline.map(|l| normalize(&l, NECKLINE_LABELS)),
            length: item.length.map(|l| normalize(&l, LENGTH_LABELS)),
            confidence: AttributeConfidence {
                category: clamp_score(confidence.category),
                color: clamp_score(confidence.color),
                pattern: clamp_score(confidence.pattern),
                gender: clamp_score(confidence.gender),
                sleeve_length: Some(clamp_score(confidence.sleeve_length.unwrap_or(0.0))),
                neckline: Some(clamp_score(confidence.neckline.unwrap_or(0.0))),
                length: Some(clamp_score(confidence.length.unwrap_or(0.0))),
            },
        }
        .with_applicable_attributes();
    }
    Ok(out)
}

fn clamp_score(score: f32) -> f32 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn normalize(label: &str, vocabulary: &[&str]) -> String {
    let label = label.trim().to_lowercase();
    if vocabulary.contains(&label.as_str()) {
        label
    } else {
        UNKNOWN_LABEL.to_string()
    }
}

impl Classifier for OpenAiClassifier {
    async fn classify(&self, batch: &[Product]) -> Result<Vec<Classification>, AppError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/chat/completions", self.base_url);
        let request = self.request(batch);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            if status_code == 429 {
                return Err(AppError::RateLimitExceeded);
            }

            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));

            return Err(AppError::ClassifierError {
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {e}")))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| AppError::ClassifierError {
                message: "Empty response from LLM".into(),
                status_code: 200,
                retryable: false,
            })?;

        parse_classifications(content, batch.len())
    }
}

#[cfg(test)]
mod tests {
    use gleaner_core::models::RawProduct;

    use super::*;

    fn product(name: &str, description: Option<&str>) -> Product {
        Product::from_raw(
            "acme",
            "dresses",
            RawProduct {
                name: Some(name.into()),
                product_url: Some(format!("https://acme.test/{name}")),
                description: description.map(String::from),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_parse_orders_by_index() {
        let content = r#"{"items":[
            {"index":2,"category":"skirt","color":"red","pattern":"plaid","gender":"women",
             "sleeve_length":null,"neckline":null,"length":"mini",
             "confidence":{"category":0.7,"color":0.6,"pattern":0.5,"gender":0.4,
                           "sleeve_length":null,"neckline":null,"length":0.3}},
            {"index":1,"category":"Dress","color":"black","pattern":"solid","gender":"women",
             "sleeve_length":"long","neckline":"v-neck","length":"midi",
             "confidence":{"category":0.95,"color":0.9,"pattern":0.8,"gender":0.7,
                           "sleeve_length":0.6,"neckline":0.5,"length":0.4}}
        ]}"#;
        let out = parse_classifications(content, 2).unwrap();
        assert_eq!(out[0].category, "dress");
        assert_eq!(out[0].confidence.category, 0.95);
        assert_eq!(out[0].sleeve_length.as_deref(), Some("long"));
        assert_eq!(out[0].confidence.neckline, Some(0.5));
        assert_eq!(out[1].pattern, "plaid");
        assert_eq!(out[1].length.as_deref(), Some("mini"));
        assert_eq!(out[1].confidence.length, Some(0.3));
        assert_eq!(out[1].sleeve_length, None);
        assert_eq!(out[1].confidence.sleeve_length, None);
    }

    #[test]
    fn test_parse_drops_attributes_that_do_not_fit_the_category() {
        let content = r#"{"items":[
            {"index":1,"category":"bag","color":"brown","pattern":"solid","gender":"unisex",
             "sleeve_length":"short","neckline":"round","length":"maxi",
             "confidence":{"category":0.9,"color":0.9,"pattern":0.9,"gender":0.5,
                           "sleeve_length":0.9,"neckline":0.9,"length":0.9}}
        ]}"#;
        let out = parse_classifications(content, 1).unwrap();
        assert_eq!(out[0].gender, "unisex");
        assert_eq!(out[0].sleeve_length, None);
        assert_eq!(out[0].neckline, None);
        assert_eq!(out[0].length, None);
        assert_eq!(out[0].confidence.sleeve_length, None);
    }

    #[test]
    fn test_parse_fills_missing_and_unknown_labels() {
        let content = r#"{"items":[
            {"index":1,"category":"cape","color":"teal","pattern":"solid","gender":"adults",
             "confidence":{"category":3.0,"color":0.2,"pattern":0.9}},
            {"index":9,"category":"top","color":"white","pattern":"solid","gender":"men",
             "confidence":{"category":0.5,"color":0.5,"pattern":0.5,"gender":0.5}}
        ]}"#;
        let out = parse_classifications(content, 2).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].category, UNKNOWN_LABEL);
        assert_eq!(out[0].color, UNKNOWN_LABEL);
        assert_eq!(out[0].gender, UNKNOWN_LABEL);
        assert_eq!(out[0].pattern, "solid");
        assert_eq!(out[0].confidence.category, 1.0);
        assert_eq!(out[0].confidence.gender, 0.0);
        assert!(out[0].is_unclassified());
        assert!(out[1].is_unclassified());
        assert_eq!(out[1], Classification::unclassified());
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        let err = parse_classifications("not json", 1).unwrap_err();
        assert!(matches!(err, AppError::ClassifierError { retryable: false, .. }));
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn test_user_prompt_numbers_products_and_truncates() {
        let long = "x".repeat(1000);
        let prompt = user_prompt(&[product("Linen Dress", None), product("Wrap", Some(&long))]);
        assert!(prompt.contains("1. name: Linen Dress"));
        assert!(prompt.contains("2. name: Wrap"));
        assert!(prompt.contains("listed under: dresses"));
        assert!(!prompt.contains(&"x".repeat(MAX_DESCRIPTION_CHARS + 1)));
    }

    #[test]
    fn test_request_carries_strict_schema() {
        let classifier = OpenAiClassifier::new("sk-test", "gpt-4o-mini").unwrap();
        let request = serde_json::to_value(classifier.request(&[product("Tee", None)])).unwrap();
        assert_eq!(request["model"], "gpt-4o-mini");
        assert_eq!(request["response_format"]["type"], "json_schema");
        assert_eq!(request["response_format"]["json_schema"]["strict"], true);
        let categories = &request["response_format"]["json_schema"]["schema"]["properties"]["items"]
            ["items"]["properties"]["category"]["enum"];
        assert!(categories.as_array().unwrap().contains(&json!("unknown")));
        let item = &request["response_format"]["json_schema"]["schema"]["properties"]["items"]
            ["items"];
        let sleeves = item["properties"]["sleeve_length"]["enum"].as_array().unwrap();
        assert!(sleeves.contains(&json!("three-quarter")));
        assert!(sleeves.contains(&serde_json::Value::Null));
        assert_eq!(item["required"].as_array().unwrap().len(), 9);
        assert_eq!(
            item["properties"]["confidence"]["required"].as_array().unwrap().len(),
            7
        );
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_call() {
        let classifier =
            OpenAiClassifier::with_base_url("sk-test", "m", "http://127.0.0.1:9").unwrap();
        assert!(classifier.classify(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_api_is_retryable() {
        let classifier = OpenAiClassifier::with_base_url("sk-test", "m", "http://127.0.0.1:9")
            .unwrap()
            .with_timeout(Duration::from_secs(5))
            .unwrap();
        let err = classifier.classify(&[product("Tee", None)]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.is_unreachable());
    }
}
