pub mod links;
pub mod nutrition;
pub mod product;

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::error::SettingsError;
use crate::model::{ProductLink, ProductRecord};
use crate::render::RenderedPage;
use crate::settings::SiteProfile;

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Compiled selectors for one site profile. Built once, shared by every task.
#[derive(Debug, Clone)]
pub struct PageSelectors {
    pub anchor: Selector,
    pub title: Selector,
    pub price: Selector,
    pub table: Selector,
    pub header_cells: Selector,
    pub body_rows: Selector,
    pub row_label: Selector,
    pub row_cells: Selector,
    /// Lower-cased header substrings marking the standardized column.
    pub column_markers: Vec<String>,
    pub product_path: String,
}

impl PageSelectors {
    pub fn compile(site: &SiteProfile) -> Result<Self, SettingsError> {
        if site.product_path.trim().is_empty() {
            return Err(SettingsError::invalid("site.product_path", "must not be empty"));
        }
        let column_markers: Vec<String> = site
            .column_markers
            .iter()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        if column_markers.is_empty() {
            return Err(SettingsError::invalid(
                "site.column_markers",
                "at least one marker is required",
            ));
        }
        // Checked here so a bad next/ready selector fails at startup, not mid-crawl.
        parse_selector("site.next_selector", &site.next_selector)?;
        for ready in [&site.listing_ready_selector, &site.product_ready_selector]
            .into_iter()
            .flatten()
        {
            parse_selector("site.*_ready_selector", ready)?;
        }

        Ok(Self {
            anchor: parse_selector("anchor", "a[href]")?,
            title: parse_selector("site.title_selector", &site.title_selector)?,
            price: parse_selector("site.price_selector", &site.price_selector)?,
            table: parse_selector("site.nutrition_table_selector", &site.nutrition_table_selector)?,
            header_cells: parse_selector("header_cells", "thead tr th")?,
            body_rows: parse_selector("body_rows", "tbody tr")?,
            row_label: parse_selector("row_label", "th")?,
            row_cells: parse_selector("row_cells", "td")?,
            column_markers,
            product_path: site.product_path.clone(),
        })
    }
}

fn parse_selector(field: &'static str, css: &str) -> Result<Selector, SettingsError> {
    Selector::parse(css).map_err(|e| SettingsError::invalid(field, format!("'{css}': {e}")))
}

/// Text content of an element with runs of whitespace collapsed and trimmed.
pub fn element_text(el: ElementRef<'_>) -> String {
    let raw: String = el.text().collect();
    WHITESPACE_RE.replace_all(raw.trim(), " ").into_owned()
}

/// Parse one rendered product page into a record.
///
/// Sync on purpose: `Html` must not be held across an await in spawned tasks.
pub fn process_product(page: &RenderedPage, url: &ProductLink, sel: &PageSelectors) -> ProductRecord {
    let doc = Html::parse_document(&page.html);
    product::extract(&doc, url, sel)
}

#[cfg(test)]
pub(crate) fn test_selectors() -> PageSelectors {
    PageSelectors::compile(&SiteProfile::default()).unwrap()
}
