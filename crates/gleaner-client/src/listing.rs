use std::collections::HashMap;
use std::sync::Arc;

use gleaner_core::error::AppError;
use gleaner_core::job::{HarvestPlan, Job, StoreSelectors};
use gleaner_core::models::RawProduct;
use gleaner_core::traits::{PageRenderer, StoreScraper};
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Listing scraper driven by per-store CSS selectors.
///
/// Renders the job's listing page with the leased resource, then reads one
/// [`RawProduct`] per product card. Relative links and images are resolved
/// against the listing URL.
#[derive(Debug, Clone, Default)]
pub struct SelectorScraper {
    selectors: Arc<HashMap<String, StoreSelectors>>,
}

impl SelectorScraper {
    pub fn new(selectors: HashMap<String, StoreSelectors>) -> Self {
        Self {
            selectors: Arc::new(selectors),
        }
    }

    /// Selectors of every store in the plan that declares them.
    pub fn from_plan(plan: &HarvestPlan) -> Self {
        Self::new(
            plan.stores
                .iter()
                .filter_map(|s| Some((s.name.clone(), s.selectors.clone()?)))
                .collect(),
        )
    }

    pub fn selectors(&self, store: &str) -> Option<&StoreSelectors> {
        self.selectors.get(store)
    }
}

impl<R: PageRenderer> StoreScraper<R> for SelectorScraper {
    async fn scrape(&self, resource: &R, job: &Job) -> Result<Vec<RawProduct>, AppError> {
        let selectors = self.selectors(&job.store).ok_or_else(|| AppError::ScrapeError {
            message: format!("No selectors configured for store '{}'", job.store),
            retryable: false,
        })?;

        let html = resource.render(&job.url).await?;
        let products = parse_listing(&html, &job.url, selectors)?;

        // An empty grid is usually a page that has not finished loading or a
        // bot wall, both of which may clear on the next attempt.
        if products.is_empty() {
            return Err(AppError::ScrapeError {
                message: format!("No products matched '{}' on {}", selectors.item, job.url),
                retryable: true,
            });
        }

        tracing::debug!(
            store = %job.store,
            category = %job.category,
            count = products.len(),
            "Parsed listing"
        );
        Ok(products)
    }
}

/// Read every product card of a listing page.
pub fn parse_listing(
    html: &str,
    page_url: &str,
    selectors: &StoreSelectors,
) -> Result<Vec<RawProduct>, AppError> {
    let base = Url::parse(page_url).map_err(|e| AppError::ScrapeError {
        message: format!("Invalid listing URL '{page_url}': {e}"),
        retryable: false,
    })?;

    let item = compile(&selectors.item)?;
    let name = compile(&selectors.name)?;
    let link = compile(&selectors.link)?;
    let price = selectors.price.as_deref().map(compile).transpose()?;
    let image = selectors.image.as_deref().map(compile).transpose()?;

    let document = Html::parse_document(html);
    let products = document
        .select(&item)
        .map(|card| RawProduct {
            name: first_text(card, &name),
            product_url: card
                .select(&link)
                .next()
                .and_then(|a| a.value().attr("href"))
                .and_then(|href| resolve(&base, href)),
            price: price.as_ref().and_then(|sel| first_text(card, sel)),
            image_url: image.as_ref().and_then(|sel| {
                let img = card.select(sel).next()?;
                let src = img
                    .value()
                    .attr("src")
                    .or_else(|| img.value().attr("data-src"))?;
                resolve(&base, src)
            }),
            description: None,
        })
        .collect();

    Ok(products)
}

pub(crate) fn compile(selector: &str) -> Result<Selector, AppError> {
    Selector::parse(selector).map_err(|e| AppError::ScrapeError {
        message: format!("Invalid CSS selector '{selector}': {e}"),
        retryable: false,
    })
}

/// Whitespace-collapsed text of the first match, if non-empty.
pub(crate) fn first_text(root: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let element = root.select(selector).next()?;
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn resolve(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    base.join(href).ok().map(String::from)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    const LISTING: &str = r##"
        <html><body>
          <ul class="grid">
            <li class="card">
              <a class="link" href="/p/linen-dress"><h3 class="title"> Linen
                 Dress </h3></a>
              <span class="price">49,90 €</span>
              <img class="thumb" src="//cdn.acme.test/linen.jpg">
            </li>
            <li class="card">
              <a class="link" href="https://acme.test/p/wrap"><h3 class="title">Wrap Dress</h3></a>
              <img class="thumb" data-src="/img/wrap.jpg">
            </li>
            <li class="card">
              <a class="link" href="#"><h3 class="title">Gift Card</h3></a>
            </li>
          </ul>
        </body></html>
    "##;

    fn selectors() -> StoreSelectors {
        StoreSelectors {
            item: "li.card".into(),
            name: ".title".into(),
            link: "a.link".into(),
            price: Some(".price".into()),
            image: Some("img.thumb".into()),
            detail_description: None,
        }
    }

    #[derive(Clone)]
    struct StaticPage {
        html: String,
        rendered: Arc<Mutex<Vec<String>>>,
    }

    impl StaticPage {
        fn new(html: &str) -> Self {
            Self {
                html: html.to_string(),
                rendered: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl PageRenderer for StaticPage {
        async fn render(&self, url: &str) -> Result<String, AppError> {
            self.rendered.lock().unwrap().push(url.to_string());
            Ok(self.html.clone())
        }
    }

    fn job() -> Job {
        Job::new("acme", "https://acme.test/c/dresses?page=1", "dresses", 0)
    }

    #[test]
    fn test_parse_listing_reads_cards() {
        let products = parse_listing(LISTING, "https://acme.test/c/dresses", &selectors()).unwrap();
        assert_eq!(products.len(), 3);

        assert_eq!(products[0].name.as_deref(), Some("Linen Dress"));
        assert_eq!(
            products[0].product_url.as_deref(),
            Some("https://acme.test/p/linen-dress")
        );
        assert_eq!(products[0].price.as_deref(), Some("49,90 €"));
        assert_eq!(
            products[0].image_url.as_deref(),
            Some("https://cdn.acme.test/linen.jpg")
        );

        assert_eq!(products[1].price, None);
        assert_eq!(
            products[1].image_url.as_deref(),
            Some("https://acme.test/img/wrap.jpg")
        );

        // A card without a usable link is kept and left to validation.
        assert_eq!(products[2].product_url, None);
        assert!(products[2].validation_issue().is_some());
    }

    #[test]
    fn test_invalid_selector_is_not_retryable() {
        let mut bad = selectors();
        bad.item = "li[".into();
        let err = parse_listing(LISTING, "https://acme.test/", &bad).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_scrape_renders_job_url() {
        let scraper = SelectorScraper::new(HashMap::from([("acme".to_string(), selectors())]));
        let page = StaticPage::new(LISTING);

        let products = scraper.scrape(&page, &job()).await.unwrap();
        assert_eq!(products.len(), 3);
        assert_eq!(
            page.rendered.lock().unwrap().as_slice(),
            ["https://acme.test/c/dresses?page=1"]
        );
    }

    #[tokio::test]
    async fn test_empty_listing_is_retryable() {
        let scraper = SelectorScraper::new(HashMap::from([("acme".to_string(), selectors())]));
        let page = StaticPage::new("<html><body><p>Loading…</p></body></html>");

        let err = scraper.scrape(&page, &job()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("li.card"));
    }

    #[tokio::test]
    async fn test_unknown_store_fails_without_rendering() {
        let scraper = SelectorScraper::default();
        let page = StaticPage::new(LISTING);

        let err = scraper.scrape(&page, &job()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(page.rendered.lock().unwrap().is_empty());
    }

    #[test]
    fn test_from_plan_keeps_stores_with_selectors() {
        let plan = HarvestPlan::new(vec![
            gleaner_core::job::StorePlan::new("acme", 0).with_selectors(selectors()),
            gleaner_core::job::StorePlan::new("bare", 0),
        ]);
        let scraper = SelectorScraper::from_plan(&plan);
        assert!(scraper.selectors("acme").is_some());
        assert!(scraper.selectors("bare").is_none());
    }
}
