use std::collections::BTreeSet;

use scraper::Html;
use url::Url;

use super::PageSelectors;
use crate::model::ProductLink;

/// Product-detail links reachable from a catalog document.
///
/// Hrefs are resolved against `base` the way a browser resolves `a.href`, kept
/// when they contain the product path segment, and never equal `current_url`.
pub fn discover(doc: &Html, base: &Url, current_url: &str, sel: &PageSelectors) -> BTreeSet<ProductLink> {
    doc.select(&sel.anchor)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href.trim()).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(String::from)
        .filter(|url| url.contains(sel.product_path.as_str()) && url != current_url)
        .map(ProductLink::new)
        .collect()
}
