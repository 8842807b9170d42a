use chrono::Utc;
use scraper::Html;
use tracing::{debug, warn};

use super::{element_text, nutrition, PageSelectors};
use crate::model::{Outcome, ProductLink, ProductRecord};

/// Title, price and nutrition of one product document.
///
/// Each field is read independently; a missing title or price becomes an
/// empty string so partial records still surface.
pub fn extract(doc: &Html, url: &ProductLink, sel: &PageSelectors) -> ProductRecord {
    let title = doc
        .select(&sel.title)
        .next()
        .map(element_text)
        .unwrap_or_default();
    if title.is_empty() {
        warn!("No title on {}", url);
    }

    let price = doc
        .select(&sel.price)
        .next()
        .map(element_text)
        .unwrap_or_default();
    if price.is_empty() {
        debug!("No price on {}", url);
    }

    let nutrition = nutrition::resolve(doc, sel);

    ProductRecord {
        title,
        price,
        nutrition,
        url: url.clone(),
        outcome: Outcome::Success,
        scraped_at: Some(Utc::now()),
    }
}
