use std::collections::HashMap;
use std::sync::Arc;

use gleaner_core::error::AppError;
use gleaner_core::job::HarvestPlan;
use gleaner_core::models::Product;
use gleaner_core::traits::DetailFetcher;
use scraper::{Html, Selector};

use crate::fetcher::HttpRenderer;
use crate::listing::{compile, first_text};

/// Fills in product descriptions from their detail pages over plain HTTP.
///
/// Uses the store's `detail_description` selector when one is configured,
/// falling back to the page's `<meta name="description">` and then
/// `og:description`. A page without any description leaves the product as is.
#[derive(Clone)]
pub struct HttpDetailFetcher {
    http: HttpRenderer,
    description_selectors: Arc<HashMap<String, String>>,
}

impl HttpDetailFetcher {
    pub fn new(http: HttpRenderer) -> Self {
        Self {
            http,
            description_selectors: Arc::new(HashMap::new()),
        }
    }

    pub fn from_plan(http: HttpRenderer, plan: &HarvestPlan) -> Self {
        let description_selectors = plan
            .stores
            .iter()
            .filter_map(|s| {
                let selector = s.selectors.as_ref()?.detail_description.clone()?;
                Some((s.name.clone(), selector))
            })
            .collect();
        Self {
            http,
            description_selectors: Arc::new(description_selectors),
        }
    }
}

impl DetailFetcher for HttpDetailFetcher {
    async fn fetch_detail(&self, mut product: Product) -> Result<Product, AppError> {
        let html = self.http.get(&product.product_url).await?;
        let selector = self
            .description_selectors
            .get(&product.store)
            .map(String::as_str);

        if let Some(description) = extract_description(&html, selector)? {
            product.description = Some(description);
        }
        Ok(product)
    }
}

fn extract_description(html: &str, selector: Option<&str>) -> Result<Option<String>, AppError> {
    let selector = selector.map(compile).transpose()?;
    let document = Html::parse_document(html);

    if let Some(selector) = &selector
        && let Some(text) = first_text(document.root_element(), selector)
    {
        return Ok(Some(text));
    }

    for meta in [
        r#"meta[name="description"]"#,
        r#"meta[property="og:description"]"#,
    ] {
        let Ok(meta) = Selector::parse(meta) else {
            continue;
        };
        let content = document
            .select(&meta)
            .filter_map(|m| m.value().attr("content"))
            .map(str::trim)
            .find(|c| !c.is_empty());
        if let Some(content) = content {
            return Ok(Some(content.to_string()));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html>
          <head>
            <meta name="description" content="  Breezy linen dress.  ">
            <meta property="og:description" content="OG text">
          </head>
          <body>
            <div class="pdp-description"><p>100% linen.</p><p>Machine
              washable.</p></div>
          </body>
        </html>
    "#;

    #[test]
    fn test_selector_wins() {
        let text = extract_description(PAGE, Some(".pdp-description")).unwrap();
        assert_eq!(text.as_deref(), Some("100% linen. Machine washable."));
    }

    #[test]
    fn test_falls_back_to_meta() {
        let text = extract_description(PAGE, Some(".missing")).unwrap();
        assert_eq!(text.as_deref(), Some("Breezy linen dress."));

        let text = extract_description(PAGE, None).unwrap();
        assert_eq!(text.as_deref(), Some("Breezy linen dress."));
    }

    #[test]
    fn test_og_description_and_nothing() {
        let og_only = r#"<html><head><meta property="og:description" content="OG text"></head></html>"#;
        assert_eq!(
            extract_description(og_only, None).unwrap().as_deref(),
            Some("OG text")
        );
        assert_eq!(extract_description("<p>hi</p>", None).unwrap(), None);
    }

    #[test]
    fn test_bad_selector_is_an_error() {
        assert!(extract_description(PAGE, Some("div[")).is_err());
    }

    #[test]
    fn test_from_plan_collects_description_selectors() {
        use gleaner_core::job::{StorePlan, StoreSelectors};

        let selectors = StoreSelectors {
            item: ".card".into(),
            name: ".title".into(),
            link: "a".into(),
            price: None,
            image: None,
            detail_description: Some(".pdp-description".into()),
        };
        let plan = HarvestPlan::new(vec![
            StorePlan::new("acme", 0).with_selectors(selectors),
            StorePlan::new("bare", 0),
        ]);
        let fetcher = HttpDetailFetcher::from_plan(HttpRenderer::new().unwrap(), &plan);
        assert_eq!(fetcher.description_selectors.len(), 1);
        assert_eq!(
            fetcher.description_selectors.get("acme").map(String::as_str),
            Some(".pdp-description")
        );
    }
}
