use std::collections::BTreeSet;
use std::path::PathBuf;

use scraper::Html;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::RenderError;
use crate::model::{CrawlFrontier, ProductLink, SealedFrontier, StopReason};
use crate::parser::{links, PageSelectors};
use crate::render::{RenderProvider, RenderSession, RenderedPage, WaitFor};
use crate::retry::RetryPolicy;
use crate::settings::Settings;

/// Everything the pagination controller needs besides the renderer.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub entry_url: String,
    /// Catalog pages listed at most, the entry page included.
    pub max_pages: usize,
    pub next_selector: String,
    pub wait: WaitFor,
    pub retry: RetryPolicy,
    pub snapshot_dir: Option<PathBuf>,
}

impl CrawlOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            entry_url: settings.category_url.clone(),
            max_pages: settings.max_pages,
            next_selector: settings.site.next_selector.clone(),
            wait: WaitFor::listing(&settings.site, &settings.browser),
            retry: settings.retry.listing,
            snapshot_dir: settings.browser.snapshot_dir.clone(),
        }
    }
}

enum State {
    Listing(RenderedPage),
    Advancing,
    Done(StopReason),
}

/// Walks the catalog through one rendering session, collecting product links.
pub struct PaginationController<'a> {
    provider: &'a dyn RenderProvider,
    opts: &'a CrawlOptions,
    sel: &'a PageSelectors,
}

impl<'a> PaginationController<'a> {
    pub fn new(
        provider: &'a dyn RenderProvider,
        opts: &'a CrawlOptions,
        sel: &'a PageSelectors,
    ) -> Self {
        Self { provider, opts, sel }
    }

    /// Crawl until there is no next page, the page limit is hit, or navigation
    /// fails. Never errors: whatever was discovered so far is returned.
    pub async fn run(&self) -> SealedFrontier {
        let mut frontier = CrawlFrontier::new();
        info!("Crawling catalog from {}", self.opts.entry_url);

        let entry = self
            .opts
            .retry
            .run("catalog entry page", move || self.open_entry())
            .await;
        let (mut session, first) = match entry {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Could not load catalog entry page: {}", e);
                return frontier.seal(StopReason::EntryFailed(e.to_string()));
            }
        };
        self.snapshot(session.as_mut()).await;

        let mut state = State::Listing(first);
        let stop = loop {
            state = match state {
                State::Listing(page) => {
                    let found = discover_on(&page, self.sel);
                    let count = found.len();
                    let added = frontier.merge(found);
                    frontier.page_listed();
                    info!(
                        "Catalog page {}: {} product links ({} new, {} total)",
                        frontier.pages(),
                        count,
                        added,
                        frontier.len()
                    );
                    State::Advancing
                }
                State::Advancing if frontier.pages() >= self.opts.max_pages => {
                    State::Done(StopReason::PageLimit)
                }
                State::Advancing => match session
                    .follow(&self.opts.next_selector, &self.opts.wait)
                    .await
                {
                    Ok(Some(page)) => {
                        debug!("Advanced to {}", page.url);
                        State::Listing(page)
                    }
                    Ok(None) => State::Done(StopReason::NoNextPage),
                    Err(e) => {
                        warn!(
                            "Next page after page {} failed, keeping partial frontier: {}",
                            frontier.pages(),
                            e
                        );
                        State::Done(StopReason::NavigationFailed(e.to_string()))
                    }
                },
                State::Done(stop) => break stop,
            };
        };

        session.close().await;
        info!(
            "Crawl finished ({}): {} links from {} pages",
            stop,
            frontier.len(),
            frontier.pages()
        );
        frontier.seal(stop)
    }

    async fn open_entry(&self) -> Result<(Box<dyn RenderSession>, RenderedPage), RenderError> {
        let mut session = self.provider.open_session().await?;
        match session.navigate(&self.opts.entry_url, &self.opts.wait).await {
            Ok(page) => Ok((session, page)),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn snapshot(&self, session: &mut dyn RenderSession) {
        let Some(dir) = &self.opts.snapshot_dir else {
            return;
        };
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("Cannot create snapshot dir {}: {}", dir.display(), e);
            return;
        }
        let path = dir.join("catalog-page-1.png");
        match session.snapshot(&path).await {
            Ok(()) => info!("Saved catalog snapshot to {}", path.display()),
            Err(e) => warn!("Catalog snapshot failed: {}", e),
        }
    }
}

/// Product links on a rendered catalog page, resolved against its final URL.
fn discover_on(page: &RenderedPage, sel: &PageSelectors) -> BTreeSet<ProductLink> {
    let base = match Url::parse(&page.url) {
        Ok(base) => base,
        Err(e) => {
            warn!("Unusable catalog page URL {}: {}", page.url, e);
            return BTreeSet::new();
        }
    };
    let doc = Html::parse_document(&page.html);
    links::discover(&doc, &base, &page.url, sel)
}
