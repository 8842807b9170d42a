use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{FetchError, RenderError};
use crate::model::{ProductLink, ProductRecord};
use crate::parser::{self, PageSelectors};
use crate::render::{RenderProvider, RenderedPage, WaitFor};
use crate::retry::RetryPolicy;
use crate::settings::{FailurePolicy, Settings};

#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub concurrency: usize,
    /// Minimum gap between two unit dispatches, whatever the concurrency.
    pub inter_request_delay: Duration,
    pub unit_timeout: Duration,
    /// Fetch only the first N links. 0 = all.
    pub max_records: usize,
    pub failure_policy: FailurePolicy,
    pub retry: RetryPolicy,
    pub wait: WaitFor,
    pub progress: bool,
}

impl ScheduleOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            concurrency: settings.concurrency_limit,
            inter_request_delay: settings.inter_request_delay(),
            unit_timeout: settings.unit_timeout(),
            max_records: settings.max_records,
            failure_policy: settings.failure_policy,
            retry: settings.retry.product,
            wait: WaitFor::product(&settings.site, &settings.browser),
            progress: true,
        }
    }
}

/// Scrape stats returned after completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeStats {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// Hands out dispatch slots at least `spacing` apart.
struct Pacer {
    next_slot: Mutex<Instant>,
    spacing: Duration,
}

impl Pacer {
    fn new(spacing: Duration) -> Self {
        Self {
            next_slot: Mutex::new(Instant::now()),
            spacing,
        }
    }

    async fn wait(&self) {
        if self.spacing.is_zero() {
            return;
        }
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.spacing;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

type UnitResult = (ProductLink, Result<ProductRecord, String>);

/// Fetches product pages with bounded concurrency and turns them into records.
pub struct FetchScheduler {
    provider: Arc<dyn RenderProvider>,
    selectors: Arc<PageSelectors>,
    opts: Arc<ScheduleOptions>,
}

impl FetchScheduler {
    pub fn new(
        provider: Arc<dyn RenderProvider>,
        selectors: PageSelectors,
        opts: ScheduleOptions,
    ) -> Self {
        Self {
            provider,
            selectors: Arc::new(selectors),
            opts: Arc::new(opts),
        }
    }

    fn concurrency(&self) -> usize {
        let wanted = self.opts.concurrency.max(1);
        match self.provider.max_sessions() {
            Some(cap) if cap.max(1) < wanted => {
                warn!(
                    "Renderer serves {} session(s) at once; concurrency lowered from {}",
                    cap.max(1),
                    wanted
                );
                cap.max(1)
            }
            _ => wanted,
        }
    }

    /// Scrape every link, one task per link. A failing link never affects its
    /// siblings; it becomes a Failed record or is dropped, per the failure policy.
    pub async fn run(&self, mut links: Vec<ProductLink>) -> (Vec<ProductRecord>, ScrapeStats) {
        if self.opts.max_records > 0 && links.len() > self.opts.max_records {
            info!(
                "Limiting to the first {} of {} links",
                self.opts.max_records,
                links.len()
            );
            links.truncate(self.opts.max_records);
        }
        let total = links.len();
        if total == 0 {
            return (Vec::new(), ScrapeStats::default());
        }

        let concurrency = self.concurrency();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let pacer = Arc::new(Pacer::new(self.opts.inter_request_delay));
        let pb = self.progress_bar(total);
        info!("Scraping {} products ({} at a time)", total, concurrency);

        let (tx, mut rx) = tokio::sync::mpsc::channel::<UnitResult>(concurrency * 2);

        let mut handles = Vec::with_capacity(total);
        for link in links {
            let provider = Arc::clone(&self.provider);
            let selectors = Arc::clone(&self.selectors);
            let opts = Arc::clone(&self.opts);
            let sem = Arc::clone(&semaphore);
            let pacer = Arc::clone(&pacer);
            let tx = tx.clone();
            let unit_link = link.clone();

            let handle = tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return;
                };
                pacer.wait().await;
                let result = scrape_unit(provider.as_ref(), &unit_link, &opts, &selectors)
                    .await
                    .map_err(|e| e.source.to_string());
                let _ = tx.send((unit_link, result)).await;
            });
            handles.push((link, handle));
        }

        // Drop our copy of tx so rx closes when all spawned tasks finish
        drop(tx);

        let mut records = Vec::with_capacity(total);
        let mut stats = ScrapeStats {
            total,
            ..Default::default()
        };

        while let Some((link, result)) = rx.recv().await {
            self.collect(link, result, &mut records, &mut stats);
            pb.inc(1);
        }

        // A task that panicked never sent its result; account for it here.
        for (link, handle) in handles {
            if let Err(e) = handle.await {
                let reason = format!("fetch task aborted: {}", e);
                self.collect(link, Err(reason), &mut records, &mut stats);
                pb.inc(1);
            }
        }

        pb.finish_and_clear();
        info!(
            "Scraped {} products ({} ok, {} failed, {} dropped)",
            stats.total, stats.ok, stats.failed, stats.dropped
        );
        (records, stats)
    }

    /// Apply the failure policy to one unit's outcome.
    fn collect(
        &self,
        link: ProductLink,
        result: Result<ProductRecord, String>,
        records: &mut Vec<ProductRecord>,
        stats: &mut ScrapeStats,
    ) {
        match result {
            Ok(record) => {
                stats.ok += 1;
                records.push(record);
            }
            Err(reason) => match self.opts.failure_policy {
                FailurePolicy::Report => {
                    warn!("Fetch failed for {}: {}", link, reason);
                    stats.failed += 1;
                    records.push(ProductRecord::failed(link, reason));
                }
                FailurePolicy::Drop => {
                    warn!("Dropping {}: {}", link, reason);
                    stats.dropped += 1;
                }
            },
        }
    }

    /// Fetch one product page without retries, optionally saving a screenshot
    /// of it. Meant for checking selectors against a live page.
    pub async fn scrape_single(
        &self,
        link: &ProductLink,
        snapshot: Option<&Path>,
    ) -> Result<ProductRecord, FetchError> {
        let fetch_error = |source| FetchError {
            url: link.to_string(),
            source,
        };
        let mut session = self.provider.open_session().await.map_err(fetch_error)?;
        let page = session.navigate(link.as_str(), &self.opts.wait).await;
        if let (Ok(_), Some(path)) = (&page, snapshot) {
            match session.snapshot(path).await {
                Ok(()) => info!("Saved snapshot to {}", path.display()),
                Err(e) => warn!("Snapshot failed: {}", e),
            }
        }
        session.close().await;
        let page = page.map_err(fetch_error)?;
        Ok(parser::process_product(&page, link, &self.selectors))
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.opts.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        let template = "[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})";
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            pb.set_style(style.progress_chars("=> "));
        }
        pb
    }
}

/// Fetch and extract one link under the unit timeout.
async fn scrape_unit(
    provider: &dyn RenderProvider,
    link: &ProductLink,
    opts: &ScheduleOptions,
    selectors: &PageSelectors,
) -> Result<ProductRecord, FetchError> {
    let fetched = tokio::time::timeout(opts.unit_timeout, fetch_page(provider, link, opts)).await;
    let page = match fetched {
        Ok(Ok(page)) => page,
        Ok(Err(source)) => {
            return Err(FetchError {
                url: link.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(FetchError {
                url: link.to_string(),
                source: RenderError::RenderTimeout {
                    what: "product page".to_string(),
                    secs: opts.unit_timeout.as_secs(),
                },
            })
        }
    };
    debug!("Rendered {} ({} bytes)", page.url, page.html.len());
    Ok(parser::process_product(&page, link, selectors))
}

/// One fresh session per attempt, so a broken tab never leaks into a retry.
async fn fetch_page(
    provider: &dyn RenderProvider,
    link: &ProductLink,
    opts: &ScheduleOptions,
) -> Result<RenderedPage, RenderError> {
    let wait = &opts.wait;
    opts.retry
        .run(link.as_str(), || async move {
            let mut session = provider.open_session().await?;
            let page = session.navigate(link.as_str(), wait).await;
            session.close().await;
            page
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Outcome;
    use crate::parser::test_selectors;
    use crate::render::mock::MockRenderer;

    const PRODUCTS: &str = "https://www.tesco.com/groceries/en-GB/products/";

    fn link(i: usize) -> ProductLink {
        ProductLink::new(format!("{PRODUCTS}{i}"))
    }

    fn product_html(i: usize) -> String {
        format!(
            r#"<html><body>
            <h1 data-auto="pdp-product-title">Product {i}</h1>
            <p class="styled__priceText--abc">£{i}.00</p>
            <table class="product__info-table">
              <thead><tr><th>Typical Values</th><th>Per 100g</th></tr></thead>
              <tbody><tr><th>Fat</th><td>{i}g</td></tr></tbody>
            </table>
            </body></html>"#
        )
    }

    /// Mock serving products 0..n.
    fn catalog_mock(n: usize) -> MockRenderer {
        (0..n).fold(MockRenderer::new(), |mock, i| {
            mock.with_page(link(i).as_str(), &product_html(i))
        })
    }

    fn options(concurrency: usize) -> ScheduleOptions {
        ScheduleOptions {
            concurrency,
            inter_request_delay: Duration::ZERO,
            unit_timeout: Duration::from_secs(30),
            max_records: 0,
            failure_policy: FailurePolicy::Report,
            retry: RetryPolicy::new(2, 100),
            wait: WaitFor {
                ready_selector: None,
                timeout: Duration::from_secs(5),
                settle: Duration::ZERO,
            },
            progress: false,
        }
    }

    fn scheduler(mock: &MockRenderer, opts: ScheduleOptions) -> FetchScheduler {
        FetchScheduler::new(Arc::new(mock.clone()), test_selectors(), opts)
    }

    fn links(n: usize) -> Vec<ProductLink> {
        (0..n).map(link).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_bounds_wall_clock() {
        let mock = catalog_mock(10).with_delay(Duration::from_secs(1));
        let start = Instant::now();
        let (records, stats) = scheduler(&mock, options(2)).run(links(10)).await;
        let elapsed = start.elapsed();

        assert_eq!(records.len(), 10);
        assert_eq!(stats.ok, 10);
        assert!(elapsed >= Duration::from_secs(5), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "{elapsed:?}");
        assert_eq!(mock.peak_in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failure_does_not_affect_siblings() {
        // Product 3 is never served: every navigation to it fails.
        let mock = (0..10)
            .filter(|&i| i != 3)
            .fold(MockRenderer::new(), |m, i| m.with_page(link(i).as_str(), &product_html(i)));
        let (records, stats) = scheduler(&mock, options(4)).run(links(10)).await;

        assert_eq!(
            stats,
            ScrapeStats {
                total: 10,
                ok: 9,
                failed: 1,
                dropped: 0
            }
        );
        assert_eq!(records.len(), 10);
        let failed: Vec<_> = records.iter().filter(|r| !r.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].url, link(3));
        assert!(matches!(&failed[0].outcome, Outcome::Failed(reason) if reason.contains("404")));
        assert_eq!(failed[0].title, "");
        assert_eq!(mock.attempts(link(3).as_str()), 2);

        let ok = records.iter().find(|r| r.url == link(7)).unwrap();
        assert_eq!(ok.title, "Product 7");
        assert_eq!(ok.price, "£7.00");
        assert_eq!(ok.nutrition.as_ref().unwrap().get("Fat"), Some("7g"));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_unit_becomes_failed_record() {
        let mock = catalog_mock(10).panicking(link(3).as_str());
        let (records, stats) = scheduler(&mock, options(4)).run(links(10)).await;

        assert_eq!(records.len(), 10);
        assert_eq!(
            stats,
            ScrapeStats {
                total: 10,
                ok: 9,
                failed: 1,
                dropped: 0
            }
        );
        let crashed = records.iter().find(|r| r.url == link(3)).unwrap();
        assert!(matches!(&crashed.outcome, Outcome::Failed(reason) if reason.contains("aborted")));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_unit_is_dropped_under_drop_policy() {
        let mock = catalog_mock(5).panicking(link(0).as_str());
        let mut opts = options(2);
        opts.failure_policy = FailurePolicy::Drop;
        let (records, stats) = scheduler(&mock, opts).run(links(5)).await;

        assert_eq!(records.len(), 4);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.ok + stats.failed + stats.dropped, stats.total);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_policy_omits_failures() {
        let mock = catalog_mock(4);
        let mut opts = options(2);
        opts.failure_policy = FailurePolicy::Drop;
        let mut input = links(4);
        input.push(ProductLink::new(format!("{PRODUCTS}missing")));
        let (records, stats) = scheduler(&mock, opts).run(input).await;

        assert_eq!(records.len(), 4);
        assert!(records.iter().all(ProductRecord::is_success));
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_are_paced() {
        let mock = catalog_mock(4);
        let mut opts = options(10);
        opts.inter_request_delay = Duration::from_millis(500);
        let start = Instant::now();
        let (records, _) = scheduler(&mock, opts).run(links(4)).await;
        let elapsed = start.elapsed();

        assert_eq!(records.len(), 4);
        assert!(elapsed >= Duration::from_millis(1500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2000), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn unit_timeout_fails_only_that_unit() {
        let mock = catalog_mock(3).with_delay_for(link(1).as_str(), Duration::from_secs(600));
        let mut opts = options(3);
        opts.unit_timeout = Duration::from_secs(10);
        let (records, stats) = scheduler(&mock, opts).run(links(3)).await;

        assert_eq!(stats.ok, 2);
        assert_eq!(stats.failed, 1);
        let slow = records.iter().find(|r| r.url == link(1)).unwrap();
        assert!(matches!(&slow.outcome, Outcome::Failed(reason) if reason.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn max_records_keeps_first_links() {
        let mock = catalog_mock(10);
        let mut opts = options(5);
        opts.max_records = 3;
        let (records, stats) = scheduler(&mock, opts).run(links(10)).await;

        assert_eq!(stats.total, 3);
        assert_eq!(records.len(), 3);
        assert_eq!(mock.attempts(link(3).as_str()), 0);
        let mut urls: Vec<_> = records.into_iter().map(|r| r.url).collect();
        urls.sort();
        assert_eq!(urls, links(3));
    }

    #[tokio::test(start_paused = true)]
    async fn single_session_renderer_collapses_concurrency() {
        let mock = catalog_mock(4)
            .with_delay(Duration::from_secs(1))
            .with_max_sessions(1);
        let start = Instant::now();
        let (records, _) = scheduler(&mock, options(5)).run(links(4)).await;

        assert_eq!(records.len(), 4);
        assert_eq!(mock.peak_in_flight(), 1);
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let mock = catalog_mock(1).failing(link(0).as_str(), 1);
        let (records, stats) = scheduler(&mock, options(1)).run(links(1)).await;

        assert_eq!(stats.ok, 1);
        assert_eq!(records[0].title, "Product 0");
        assert_eq!(mock.attempts(link(0).as_str()), 2);
        assert_eq!(mock.sessions_opened(), mock.sessions_closed());
    }

    #[tokio::test]
    async fn empty_frontier_yields_nothing() {
        let mock = MockRenderer::new();
        let (records, stats) = scheduler(&mock, options(2)).run(Vec::new()).await;
        assert!(records.is_empty());
        assert_eq!(stats, ScrapeStats::default());
        assert_eq!(mock.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn single_product_with_snapshot() {
        let mock = catalog_mock(1);
        let dir = tempfile::tempdir().unwrap();
        let rec = scheduler(&mock, options(1))
            .scrape_single(&link(0), Some(&dir.path().join("p.png")))
            .await
            .unwrap();
        assert_eq!(rec.title, "Product 0");
        assert_eq!(mock.snapshots(), 1);

        let err = scheduler(&mock, options(1))
            .scrape_single(&link(5), None)
            .await
            .unwrap_err();
        assert!(matches!(err.source, RenderError::NavigationFailed { .. }));
    }
}
