use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use gleaner_core::error::AppError;
use gleaner_core::pool::ResourceFactory;
use gleaner_core::traits::PageRenderer;
use tokio::task::JoinHandle;

/// Launches headless Chromium processes for the resource pool.
///
/// Each [`BrowserSession`] owns one Chromium process. Sessions render
/// JavaScript before returning HTML, for stores whose listings are built
/// client-side or lazy-load their product grid.
///
/// # Example
///
/// ```rust,no_run
/// use gleaner_client::BrowserFactory;
/// use gleaner_core::{PageRenderer, ResourceFactory};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let factory = BrowserFactory::new();
/// let session = factory.create().await?;
/// let html = session.render("https://example.com").await?;
/// println!("{}", &html[..200]);
/// factory.destroy(session).await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BrowserFactory {
    timeout: Duration,
    chrome_bin: Option<PathBuf>,
}

impl Default for BrowserFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserFactory {
    /// Sessions with a **30 s** navigation timeout.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            chrome_bin: find_chrome_binary(),
        }
    }

    async fn launch(&self) -> Result<BrowserSession, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        if let Some(bin) = &self.chrome_bin {
            tracing::debug!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::ResourceCreation(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::ResourceCreation(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to work.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(BrowserSession {
            browser,
            handler,
            timeout: self.timeout,
        })
    }
}

impl ResourceFactory for BrowserFactory {
    type Resource = BrowserSession;

    async fn create(&self) -> Result<BrowserSession, AppError> {
        self.launch().await
    }

    async fn destroy(&self, mut session: BrowserSession) {
        if let Err(e) = session.browser.close().await {
            tracing::warn!("Failed to close browser: {e}");
        }
        let _ = session.browser.wait().await;
        session.handler.abort();
    }
}

/// One running Chromium process, leased from the pool.
pub struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    timeout: Duration,
}

impl PageRenderer for BrowserSession {
    async fn render(&self, url: &str) -> Result<String, AppError> {
        let result = tokio::time::timeout(self.timeout, async {
            let page = self
                .browser
                .new_page(url)
                .await
                .map_err(|e| AppError::NetworkError(format!("Failed to navigate to {url}: {e}")))?;

            // <body> present is the minimal signal that the page rendered.
            page.find_element("body")
                .await
                .map_err(|e| AppError::HttpError(format!("Page did not render body: {e}")))?;

            let html = page
                .content()
                .await
                .map_err(|e| AppError::HttpError(format!("Failed to read page content: {e}")))?;

            let _ = page.close().await;
            Ok::<String, AppError>(html)
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

/// Locate a real Chrome/Chromium binary.
///
/// `CHROME_BIN` wins when it exists. The snap wrapper at `/snap/bin/chromium`
/// strips unknown CLI flags, so the binary inside the snap is tried first.
/// `None` leaves the lookup to `chromiumoxide`.
fn find_chrome_binary() -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    CANDIDATES.iter().map(PathBuf::from).find(|p| p.exists())
}
