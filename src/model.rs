use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Absolute URL of one product-detail page. Compared by exact string identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductLink(String);

impl ProductLink {
    pub fn new(url: impl Into<String>) -> Self {
        ProductLink(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Nutrient label -> value with units, e.g. "Energy" -> "250kcal".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NutritionRecord(BTreeMap<String, String>);

impl NutritionRecord {
    pub fn get(&self, label: &str) -> Option<&str> {
        self.0.get(label).map(String::as_str)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for NutritionRecord {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        NutritionRecord(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    Success,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub nutrition: Option<NutritionRecord>,
    pub url: ProductLink,
    #[serde(default)]
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<DateTime<Utc>>,
}

impl ProductRecord {
    pub fn failed(url: ProductLink, reason: impl ToString) -> Self {
        ProductRecord {
            title: String::new(),
            price: String::new(),
            nutrition: None,
            url,
            outcome: Outcome::Failed(reason.to_string()),
            scraped_at: Some(Utc::now()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Why the pagination controller stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    NoNextPage,
    PageLimit,
    NavigationFailed(String),
    EntryFailed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::NoNextPage => f.write_str("no next page"),
            StopReason::PageLimit => f.write_str("page limit reached"),
            StopReason::NavigationFailed(e) => write!(f, "navigation failed: {e}"),
            StopReason::EntryFailed(e) => write!(f, "entry page failed: {e}"),
        }
    }
}

/// Links discovered so far, in discovery order, plus the catalog page count.
#[derive(Debug, Default)]
pub struct CrawlFrontier {
    links: Vec<ProductLink>,
    seen: HashSet<ProductLink>,
    pages: usize,
}

impl CrawlFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `found` into the frontier. Returns how many links were new.
    pub fn merge(&mut self, found: impl IntoIterator<Item = ProductLink>) -> usize {
        let before = self.links.len();
        for link in found {
            if self.seen.insert(link.clone()) {
                self.links.push(link);
            }
        }
        self.links.len() - before
    }

    pub fn page_listed(&mut self) {
        self.pages += 1;
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn seal(self, stop: StopReason) -> SealedFrontier {
        SealedFrontier {
            links: self.links,
            pages: self.pages,
            stop,
        }
    }
}

/// Frontier after pagination finished; no further mutation.
#[derive(Debug, Clone)]
pub struct SealedFrontier {
    pub links: Vec<ProductLink>,
    pub pages: usize,
    pub stop: StopReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontier_union_keeps_first_seen_order() {
        let mut f = CrawlFrontier::new();
        assert_eq!(f.merge(["a", "b"].map(ProductLink::new)), 2);
        assert_eq!(f.merge(["b", "c", "a"].map(ProductLink::new)), 1);
        let sealed = f.seal(StopReason::NoNextPage);
        let urls: Vec<&str> = sealed.links.iter().map(ProductLink::as_str).collect();
        assert_eq!(urls, ["a", "b", "c"]);
    }

    #[test]
    fn record_loads_without_outcome() {
        let json = r#"{"title":"Ham","price":"£2","nutrition":{"Fat":"1g"},"url":"https://x/products/1"}"#;
        let rec: ProductRecord = serde_json::from_str(json).unwrap();
        assert!(rec.is_success());
        assert_eq!(rec.nutrition.unwrap().get("Fat"), Some("1g"));
        assert!(rec.scraped_at.is_none());
    }

    #[test]
    fn failed_outcome_serializes_reason() {
        let rec = ProductRecord::failed(ProductLink::new("https://x/products/2"), "boom");
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["outcome"]["status"], "failed");
        assert_eq!(v["outcome"]["reason"], "boom");
        assert!(v["nutrition"].is_null());
    }
}
