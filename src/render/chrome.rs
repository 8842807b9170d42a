//! Chromium rendering through the DevTools protocol (chromiumoxide).

#[cfg(feature = "browser")]
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(feature = "browser")]
use std::time::Duration;

use async_trait::async_trait;
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::network::{
    Headers, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
#[cfg(feature = "browser")]
use chromiumoxide::handler::HandlerConfig;
#[cfg(feature = "browser")]
use chromiumoxide::page::ScreenshotParams;
#[cfg(feature = "browser")]
use chromiumoxide::{Browser, BrowserConfig, Page};
#[cfg(feature = "browser")]
use futures::StreamExt;
#[cfg(feature = "browser")]
use tokio::sync::{Mutex, OnceCell};
#[cfg(feature = "browser")]
use tracing::{debug, info, warn};

use super::{RenderProvider, RenderSession};
#[cfg(feature = "browser")]
use super::{RenderedPage, WaitFor};
use crate::error::RenderError;
use crate::settings::BrowserSettings;

#[cfg(feature = "browser")]
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

#[cfg(feature = "browser")]
const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Launches (or attaches to) one browser and opens a fresh tab per session.
pub struct ChromeRenderer {
    settings: Arc<BrowserSettings>,
    #[cfg(feature = "browser")]
    browser: OnceCell<Mutex<Browser>>,
}

impl ChromeRenderer {
    pub fn new(settings: BrowserSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            #[cfg(feature = "browser")]
            browser: OnceCell::new(),
        }
    }

    #[cfg(not(feature = "browser"))]
    pub async fn shutdown(&self) {}
}

#[cfg(feature = "browser")]
impl ChromeRenderer {
    /// Close the browser if one was launched. A remote browser is left running.
    pub async fn shutdown(&self) {
        let Some(browser) = self.browser.get() else {
            return;
        };
        if self.settings.remote_url.is_some() {
            return;
        }
        let mut browser = browser.lock().await;
        if let Err(e) = browser.close().await {
            debug!("Browser close failed: {}", e);
        }
        let _ = browser.wait().await;
    }

    async fn browser(&self) -> Result<&Mutex<Browser>, RenderError> {
        self.browser
            .get_or_try_init(|| async {
                let browser = match self.settings.remote_url.as_deref() {
                    Some(url) => self.connect_remote(url).await?,
                    None => self.launch().await?,
                };
                Ok::<_, RenderError>(Mutex::new(browser))
            })
            .await
    }

    fn find_chrome(&self) -> Option<PathBuf> {
        if let Some(path) = &self.settings.executable {
            return Some(path.clone());
        }
        CHROME_PATHS
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
            .map(Path::to_path_buf)
    }

    async fn launch(&self) -> Result<Browser, RenderError> {
        info!("Launching browser (headless={})", self.settings.headless);

        let mut builder = BrowserConfig::builder()
            .request_timeout(Duration::from_secs(self.settings.navigation_timeout_secs));
        // Without an explicit path chromiumoxide searches PATH itself.
        if let Some(path) = self.find_chrome() {
            debug!("Using browser at {}", path.display());
            builder = builder.chrome_executable(path);
        }
        if !self.settings.headless {
            builder = builder.with_head();
        }
        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-gpu");
        for arg in &self.settings.chrome_args {
            builder = builder.arg(arg);
        }
        let config = builder
            .build()
            .map_err(|e| RenderError::navigation("browser launch", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::navigation("browser launch", e))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(browser)
    }

    async fn connect_remote(&self, url: &str) -> Result<Browser, RenderError> {
        info!("Connecting to remote browser at {}", url);

        let http_url = url
            .replace("ws://", "http://")
            .replace("wss://", "https://");
        let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

        let version: serde_json::Value = reqwest::Client::new()
            .get(&version_url)
            .send()
            .await
            .map_err(|e| RenderError::navigation(&version_url, e))?
            .json()
            .await
            .map_err(|e| RenderError::navigation(&version_url, e))?;

        let ws_url = version
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RenderError::navigation(&version_url, "no webSocketDebuggerUrl"))?;

        let handler_config = HandlerConfig {
            request_timeout: Duration::from_secs(self.settings.navigation_timeout_secs),
            ..Default::default()
        };
        let (browser, mut handler) = Browser::connect_with_config(ws_url, handler_config)
            .await
            .map_err(|e| RenderError::navigation(ws_url, e))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(browser)
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl RenderProvider for ChromeRenderer {
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        let page = {
            let browser = self.browser().await?.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| RenderError::navigation("about:blank", e))?
        };

        page.execute(SetUserAgentOverrideParams::new(self.settings.user_agent.clone()))
            .await
            .map_err(|e| RenderError::navigation("about:blank", e))?;

        let mut headers = serde_json::Map::new();
        headers.insert(
            "Accept".into(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
        );
        headers.insert("Accept-Language".into(), self.settings.accept_language.clone().into());
        if let Some(referer) = &self.settings.referer {
            headers.insert("Referer".into(), referer.clone().into());
        }
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
            .await
            .map_err(|e| RenderError::navigation("about:blank", e))?;

        Ok(Box::new(ChromeSession {
            page: Some(page),
            settings: Arc::clone(&self.settings),
        }))
    }
}

#[cfg(feature = "browser")]
struct ChromeSession {
    page: Option<Page>,
    settings: Arc<BrowserSettings>,
}

#[cfg(feature = "browser")]
impl ChromeSession {
    fn page(&self) -> Result<&Page, RenderError> {
        self.page
            .as_ref()
            .ok_or_else(|| RenderError::navigation("about:blank", "session already closed"))
    }

    async fn exists(page: &Page, selector: &str) -> Result<bool, RenderError> {
        let literal = serde_json::to_string(selector).unwrap_or_default();
        page.evaluate(format!("document.querySelector({literal}) !== null"))
            .await
            .and_then(|r| r.into_value::<bool>().map_err(Into::into))
            .map_err(|e| RenderError::navigation(selector, e))
    }

    async fn wait_for_selector(page: &Page, selector: &str, timeout: Duration) -> Result<(), RenderError> {
        let poll = async {
            loop {
                if Self::exists(page, selector).await? {
                    return Ok::<(), RenderError>(());
                }
                tokio::time::sleep(SELECTOR_POLL).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(RenderError::ElementNotFound {
                selector: selector.to_string(),
            }),
        }
    }

    /// Scroll to the bottom in steps so lazy-loaded sections render.
    async fn auto_scroll(&self, page: &Page, timeout: Duration) {
        let step = self.settings.scroll_step_px.max(1);
        let interval = self.settings.scroll_interval_ms.max(1);
        let max_steps = (timeout.as_millis() as u64 / interval).max(1);
        let script = format!(
            r#"new Promise((resolve) => {{
                let total = 0;
                let steps = 0;
                const timer = setInterval(() => {{
                    const height = document.body ? document.body.scrollHeight : 0;
                    window.scrollBy(0, {step});
                    total += {step};
                    steps += 1;
                    if (total >= height || steps >= {max_steps}) {{
                        clearInterval(timer);
                        resolve(total);
                    }}
                }}, {interval});
            }})"#
        );
        match tokio::time::timeout(timeout, page.evaluate(script)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("Auto-scroll failed: {}", e),
            Err(_) => warn!("Auto-scroll did not finish within {}s", timeout.as_secs()),
        }
    }

    /// Ready selector, scroll, settle, then read the DOM.
    async fn settle_and_read(&self, wait: &WaitFor) -> Result<RenderedPage, RenderError> {
        let page = self.page()?;
        if let Some(selector) = &wait.ready_selector {
            Self::wait_for_selector(page, selector, wait.timeout).await?;
        }
        self.auto_scroll(page, wait.timeout).await;
        tokio::time::sleep(wait.settle).await;

        let url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        let html = page
            .content()
            .await
            .map_err(|e| RenderError::navigation(&url, e))?;
        Ok(RenderedPage { url, html })
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl RenderSession for ChromeSession {
    async fn navigate(&mut self, url: &str, wait: &WaitFor) -> Result<RenderedPage, RenderError> {
        debug!("Navigating to {}", url);
        let page = self.page()?;
        match tokio::time::timeout(wait.timeout, page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(chromiumoxide::error::CdpError::Timeout)) | Err(_) => {
                return Err(RenderError::RenderTimeout {
                    what: format!("navigation to {url}"),
                    secs: wait.timeout.as_secs(),
                })
            }
            Ok(Err(e)) => return Err(RenderError::navigation(url, e)),
        }
        let mut rendered = self.settle_and_read(wait).await?;
        if rendered.url.is_empty() {
            rendered.url = url.to_string();
        }
        Ok(rendered)
    }

    async fn follow(&mut self, selector: &str, wait: &WaitFor) -> Result<Option<RenderedPage>, RenderError> {
        let page = self.page()?;
        if !Self::exists(page, selector).await? {
            return Ok(None);
        }
        let element = page
            .find_element(selector)
            .await
            .map_err(|e| RenderError::navigation(selector, e))?;

        let navigation = async {
            element.click().await?;
            page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };
        match tokio::time::timeout(wait.timeout, navigation).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RenderError::navigation(selector, e)),
            Err(_) => {
                return Err(RenderError::RenderTimeout {
                    what: format!("navigation after clicking {selector}"),
                    secs: wait.timeout.as_secs(),
                })
            }
        }
        self.settle_and_read(wait).await.map(Some)
    }

    async fn snapshot(&mut self, path: &Path) -> Result<(), RenderError> {
        let page = self.page()?;
        page.save_screenshot(ScreenshotParams::builder().full_page(true).build(), path)
            .await
            .map(|_| ())
            .map_err(|e| RenderError::navigation(path.display().to_string(), e))
    }

    async fn close(self: Box<Self>) {
        let mut session = self;
        if let Some(page) = session.page.take() {
            if let Err(e) = page.close().await {
                debug!("Closing tab failed: {}", e);
            }
        }
    }
}

#[cfg(feature = "browser")]
impl Drop for ChromeSession {
    // A session dropped mid-flight (unit timeout) still releases its tab.
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = page.close().await;
                });
            }
        }
    }
}

// Stub for when browser feature is disabled
#[cfg(not(feature = "browser"))]
#[async_trait]
impl RenderProvider for ChromeRenderer {
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        Err(RenderError::navigation(
            "browser launch",
            "browser support not compiled; rebuild with --features browser",
        ))
    }
}
