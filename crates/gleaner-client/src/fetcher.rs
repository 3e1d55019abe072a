use std::net::IpAddr;
use std::time::Duration;

use gleaner_core::error::AppError;
use gleaner_core::pool::ResourceFactory;
use gleaner_core::traits::PageRenderer;
use reqwest::{Client, StatusCode};
use url::Url;

/// Plain HTTP page renderer using reqwest.
///
/// Downloads raw HTML without executing JavaScript, for stores whose listings
/// are server-rendered. SSRF protection is **enabled** by default: requests to
/// private/reserved IP ranges are blocked. Use
/// [`allow_private_urls`](Self::allow_private_urls) to disable it.
#[derive(Clone)]
pub struct HttpRenderer {
    client: Client,
    timeout_ms: u64,
    ssrf_protection: bool,
}

impl HttpRenderer {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent("Gleaner/0.1 (catalog harvester)")
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_ms: timeout.as_millis() as u64,
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    /// GET `url` and return the response body.
    pub async fn get(&self, url: &str) -> Result<String, AppError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_ms))?;

        check_status(response.status(), url)?;

        response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))
    }
}

impl PageRenderer for HttpRenderer {
    async fn render(&self, url: &str) -> Result<String, AppError> {
        self.get(url).await
    }
}

pub(crate) fn map_send_error(e: reqwest::Error, timeout_ms: u64) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout_ms)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}

/// 429 is a rate limit and 5xx a transient outage; other failures are final.
fn check_status(status: StatusCode, url: &str) -> Result<(), AppError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(AppError::RateLimitExceeded);
    }
    if status.is_server_error() {
        return Err(AppError::NetworkError(format!(
            "HTTP {} from {url}",
            status.as_u16()
        )));
    }
    Err(AppError::HttpError(format!(
        "HTTP {} for {url}",
        status.as_u16()
    )))
}

/// Hands out [`HttpRenderer`]s to the resource pool.
///
/// Renderers share reqwest's connection pool, so creation is cheap and never
/// fails after construction.
#[derive(Clone)]
pub struct HttpRendererFactory {
    renderer: HttpRenderer,
}

impl HttpRendererFactory {
    pub fn new(renderer: HttpRenderer) -> Self {
        Self { renderer }
    }
}

impl ResourceFactory for HttpRendererFactory {
    type Resource = HttpRenderer;

    async fn create(&self) -> Result<HttpRenderer, AppError> {
        Ok(self.renderer.clone())
    }

    async fn destroy(&self, _resource: HttpRenderer) {}
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?;

    // 1. Scheme check
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::HttpError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    // 2. Extract host
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::HttpError("URL has no host".to_string()))?;

    // 3. IP literals are checked directly
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::HttpError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    // 4. DNS resolve and check all addresses
    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    if let Some(blocked) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(AppError::HttpError(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            blocked.ip()
        )));
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16, cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
