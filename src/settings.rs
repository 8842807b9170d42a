use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SettingsError;
use crate::parser::PageSelectors;
use crate::retry::RetryPolicy;

const ENV_PREFIX: &str = "NUTRI";

const DEFAULT_CATEGORY_URL: &str =
    "https://www.tesco.com/groceries/en-GB/shop/fresh-food/fresh-meat-and-poultry/all?sortBy=relevance&count=48";
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:139.0) Gecko/20100101 Firefox/139.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Catalog page the crawl starts from.
    pub category_url: String,
    /// Hard cap on catalog pages visited, including the first.
    pub max_pages: usize,
    /// Product pages fetched at the same time.
    pub concurrency_limit: usize,
    /// Minimum spacing between product fetch dispatches.
    pub inter_request_delay_ms: u64,
    /// Only the first N discovered products are fetched. 0 = all.
    pub max_records: usize,
    pub failure_policy: FailurePolicy,
    /// Budget for one product fetch + extract, retries included.
    pub unit_timeout_secs: u64,
    pub site: SiteProfile,
    pub browser: BrowserSettings,
    pub retry: RetrySettings,
    pub output: OutputSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            category_url: DEFAULT_CATEGORY_URL.to_string(),
            max_pages: 10,
            concurrency_limit: 5,
            inter_request_delay_ms: 1000,
            max_records: 0,
            failure_policy: FailurePolicy::Report,
            unit_timeout_secs: 180,
            site: SiteProfile::default(),
            browser: BrowserSettings::default(),
            retry: RetrySettings::default(),
            output: OutputSettings::default(),
        }
    }
}

/// What the scheduler does with a product it could not fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep a Failed record carrying the reason.
    #[default]
    Report,
    /// Log and omit the unit.
    Drop,
}

/// Selectors and markers describing one catalog site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteProfile {
    /// Path segment every product-detail URL contains.
    pub product_path: String,
    pub next_selector: String,
    pub title_selector: String,
    pub price_selector: String,
    pub nutrition_table_selector: String,
    /// Header substrings (case-insensitive) marking the standardized column.
    pub column_markers: Vec<String>,
    /// Element awaited on catalog pages before reading links.
    pub listing_ready_selector: Option<String>,
    /// Element awaited on product pages before reading content.
    pub product_ready_selector: Option<String>,
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            product_path: "/groceries/en-GB/products/".to_string(),
            next_selector: r#"a[data-next-previous-btn="next"]"#.to_string(),
            title_selector: r#"h1[data-auto="pdp-product-title"]"#.to_string(),
            price_selector: r#"p[class*="priceText"]"#.to_string(),
            nutrition_table_selector: ".product__info-table".to_string(),
            column_markers: vec!["100g".to_string(), "100ml".to_string()],
            listing_ready_selector: None,
            product_ready_selector: Some(r#"h1[data-auto="pdp-product-title"]"#.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    /// Chrome/Chromium binary. Searched in common locations when unset.
    pub executable: Option<PathBuf>,
    /// DevTools endpoint (e.g. "ws://localhost:9222") of an already running browser.
    pub remote_url: Option<String>,
    pub user_agent: String,
    pub accept_language: String,
    pub referer: Option<String>,
    pub navigation_timeout_secs: u64,
    pub wait_timeout_secs: u64,
    pub scroll_step_px: u32,
    pub scroll_interval_ms: u64,
    /// Pause after scrolling a product page.
    pub settle_ms: u64,
    /// Pause after scrolling a catalog page; listings hydrate slowly.
    pub listing_settle_ms: u64,
    /// Where diagnostic screenshots go. None disables them.
    pub snapshot_dir: Option<PathBuf>,
    pub chrome_args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            remote_url: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: "en-GB,en;q=0.5".to_string(),
            referer: Some("https://www.tesco.com/".to_string()),
            navigation_timeout_secs: 120,
            wait_timeout_secs: 100,
            scroll_step_px: 300,
            scroll_interval_ms: 500,
            settle_ms: 3000,
            listing_settle_ms: 10_000,
            snapshot_dir: None,
            chrome_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub listing: RetryPolicy,
    pub product: RetryPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            listing: RetryPolicy::new(2, 5000),
            product: RetryPolicy::new(3, 2000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub json_path: Option<PathBuf>,
    pub csv_path: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            json_path: Some(PathBuf::from("scraped-data.json")),
            csv_path: PathBuf::from("scraped-data.csv"),
        }
    }
}

impl Settings {
    /// Defaults (every field, so a nested table can be overridden one key at a
    /// time), then the optional TOML file, then `NUTRI_*` environment
    /// variables (nested keys joined with `__`, e.g. `NUTRI_BROWSER__HEADLESS`).
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<PageSelectors, SettingsError> {
        if self.max_pages == 0 {
            return Err(SettingsError::invalid("max_pages", "must be at least 1"));
        }
        if self.concurrency_limit == 0 {
            return Err(SettingsError::invalid("concurrency_limit", "must be at least 1"));
        }
        if self.unit_timeout_secs == 0 {
            return Err(SettingsError::invalid("unit_timeout_secs", "must be at least 1"));
        }
        self.category_url()?;
        PageSelectors::compile(&self.site)
    }

    pub fn category_url(&self) -> Result<Url, SettingsError> {
        Url::parse(&self.category_url).map_err(|e| SettingsError::invalid("category_url", e))
    }

    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }
}
