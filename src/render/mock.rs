//! In-memory rendering provider for tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{RenderProvider, RenderSession, RenderedPage, WaitFor};
use crate::error::RenderError;

#[derive(Default)]
struct MockState {
    pages: HashMap<String, String>,
    /// Catalog pages in "next" order.
    catalog: Vec<(String, String)>,
    /// Catalog position whose "next" click fails.
    follow_error_at: Option<usize>,
    /// Remaining forced failures per URL.
    failures: Mutex<HashMap<String, usize>>,
    /// URLs whose navigation panics.
    panics: HashSet<String>,
    delay: Duration,
    delays: HashMap<String, Duration>,
    max_sessions: Option<usize>,
    attempts: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    snapshots: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MockRenderer {
    state: Arc<MockState>,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_mut(&mut self) -> &mut MockState {
        Arc::get_mut(&mut self.state).expect("configure the mock before sharing it")
    }

    pub fn with_page(mut self, url: &str, html: &str) -> Self {
        self.state_mut().pages.insert(url.to_string(), html.to_string());
        self
    }

    pub fn with_catalog(mut self, pages: Vec<(String, String)>) -> Self {
        self.state_mut().catalog = pages;
        self
    }

    pub fn with_follow_error_at(mut self, position: usize) -> Self {
        self.state_mut().follow_error_at = Some(position);
        self
    }

    /// Fail the next `times` navigations to `url` with NavigationFailed.
    pub fn failing(mut self, url: &str, times: usize) -> Self {
        self.state_mut()
            .failures
            .get_mut()
            .unwrap()
            .insert(url.to_string(), times);
        self
    }

    pub fn panicking(mut self, url: &str) -> Self {
        self.state_mut().panics.insert(url.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.state_mut().delay = delay;
        self
    }

    pub fn with_delay_for(mut self, url: &str, delay: Duration) -> Self {
        self.state_mut().delays.insert(url.to_string(), delay);
        self
    }

    pub fn with_max_sessions(mut self, n: usize) -> Self {
        self.state_mut().max_sessions = Some(n);
        self
    }

    pub fn attempts(&self, url: &str) -> usize {
        self.state.attempts.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    /// Highest number of navigations observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn snapshots(&self) -> usize {
        self.state.snapshots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderProvider for MockRenderer {
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
            position: None,
        }))
    }

    fn max_sessions(&self) -> Option<usize> {
        self.state.max_sessions
    }
}

struct MockSession {
    state: Arc<MockState>,
    position: Option<usize>,
}

#[async_trait]
impl RenderSession for MockSession {
    async fn navigate(&mut self, url: &str, _wait: &WaitFor) -> Result<RenderedPage, RenderError> {
        let state = Arc::clone(&self.state);
        *state.attempts.lock().unwrap().entry(url.to_string()).or_default() += 1;

        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak.fetch_max(now, Ordering::SeqCst);
        let delay = state.delays.get(url).copied().unwrap_or(state.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        if state.panics.contains(url) {
            panic!("renderer crashed on {url}");
        }

        let fail = {
            let mut failures = state.failures.lock().unwrap();
            match failures.get_mut(url) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            return Err(RenderError::navigation(url, "connection reset"));
        }

        if let Some(pos) = state.catalog.iter().position(|(u, _)| u == url) {
            self.position = Some(pos);
            let (url, html) = &state.catalog[pos];
            return Ok(RenderedPage {
                url: url.clone(),
                html: html.clone(),
            });
        }
        state
            .pages
            .get(url)
            .map(|html| RenderedPage {
                url: url.to_string(),
                html: html.clone(),
            })
            .ok_or_else(|| RenderError::navigation(url, "404 Not Found"))
    }

    async fn follow(
        &mut self,
        selector: &str,
        _wait: &WaitFor,
    ) -> Result<Option<RenderedPage>, RenderError> {
        let Some(pos) = self.position else {
            return Ok(None);
        };
        if self.state.follow_error_at == Some(pos) {
            return Err(RenderError::RenderTimeout {
                what: format!("navigation after clicking {selector}"),
                secs: 120,
            });
        }
        let Some((url, html)) = self.state.catalog.get(pos + 1) else {
            return Ok(None);
        };
        self.position = Some(pos + 1);
        Ok(Some(RenderedPage {
            url: url.clone(),
            html: html.clone(),
        }))
    }

    async fn snapshot(&mut self, _path: &Path) -> Result<(), RenderError> {
        self.state.snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}
