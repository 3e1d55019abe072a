/// Smoke-test for `BrowserFactory`.
///
/// Launches a pooled headless Chromium, renders <https://example.com>, and
/// verifies the rendered HTML contains the expected `<h1>`.
///
/// Run with:
///   cargo run --example browser_smoke --features browser
use gleaner_client::BrowserFactory;
use gleaner_core::{PageRenderer, ResourcePool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let pool = ResourcePool::new("smoke", BrowserFactory::new(), 1);

    println!("Launching headless browser…");
    let session = pool.acquire().await?;

    let url = "https://example.com";
    println!("Rendering {url} …");
    let html = session.render(url).await?;
    session.release();

    anyhow::ensure!(
        html.contains("<h1>Example Domain</h1>"),
        "Expected <h1> not found in rendered HTML"
    );

    println!("OK: got {} bytes of rendered HTML", html.len());
    println!("First 300 chars:\n{}", &html[..html.len().min(300)]);

    pool.shutdown().await;
    Ok(())
}
