//! Page rendering collaborator: a browser (or anything that behaves like one)
//! that turns a URL into a fully settled HTML document.

mod chrome;
#[cfg(test)]
pub mod mock;

pub use chrome::ChromeRenderer;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RenderError;
use crate::settings::{BrowserSettings, SiteProfile};

/// A document after navigation, scrolling and settling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    /// Final URL after redirects; base for relative links.
    pub url: String,
    pub html: String,
}

/// When a navigation counts as done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitFor {
    /// Element that must be present before the content is read.
    pub ready_selector: Option<String>,
    /// Upper bound for navigation and for the ready selector.
    pub timeout: Duration,
    /// Pause after lazy content was triggered.
    pub settle: Duration,
}

impl WaitFor {
    pub fn listing(site: &SiteProfile, browser: &BrowserSettings) -> Self {
        Self {
            ready_selector: site.listing_ready_selector.clone(),
            timeout: Duration::from_secs(browser.navigation_timeout_secs),
            settle: Duration::from_millis(browser.listing_settle_ms),
        }
    }

    pub fn product(site: &SiteProfile, browser: &BrowserSettings) -> Self {
        Self {
            ready_selector: site.product_ready_selector.clone(),
            timeout: Duration::from_secs(browser.wait_timeout_secs),
            settle: Duration::from_millis(browser.settle_ms),
        }
    }
}

#[async_trait]
pub trait RenderProvider: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError>;

    /// Sessions this provider can serve at once. `Some(1)` for a single
    /// stateful session; None when sessions are independent.
    fn max_sessions(&self) -> Option<usize> {
        None
    }
}

/// One browsing context. Navigation mutates it, so calls are sequential.
#[async_trait]
pub trait RenderSession: Send {
    async fn navigate(&mut self, url: &str, wait: &WaitFor) -> Result<RenderedPage, RenderError>;

    /// Click the element matching `selector` and wait for the resulting page.
    /// Ok(None) when no such element exists.
    async fn follow(
        &mut self,
        selector: &str,
        wait: &WaitFor,
    ) -> Result<Option<RenderedPage>, RenderError>;

    /// Save a screenshot of the current page. Debugging only.
    async fn snapshot(&mut self, path: &Path) -> Result<(), RenderError>;

    async fn close(self: Box<Self>);
}
