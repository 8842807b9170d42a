//! Locates the standardized (per 100g / per 100ml) column of a nutrition table
//! and reads it into a label -> value mapping.
//!
//! Assumes the label column comes first: the header row renders it as a `th`
//! alongside the data headings, while each body row renders it as a row-heading
//! `th` and keeps only the data cells as `td`. Body `td` indices are therefore
//! header indices minus one. A table with a data column before the label column
//! would be mis-aligned by this rule.

use scraper::Html;
use tracing::warn;

use super::{element_text, PageSelectors};
use crate::error::ResolveMiss;
use crate::model::NutritionRecord;

/// Nutrition mapping of a document, or None when the page has no usable table.
pub fn resolve(doc: &Html, sel: &PageSelectors) -> Option<NutritionRecord> {
    match resolve_table(doc, sel) {
        Ok(record) => Some(record),
        Err(miss) => {
            warn!("{}", miss);
            None
        }
    }
}

pub fn resolve_table(doc: &Html, sel: &PageSelectors) -> Result<NutritionRecord, ResolveMiss> {
    let table = doc.select(&sel.table).next().ok_or(ResolveMiss::TableNotFound)?;

    let standard_index = table
        .select(&sel.header_cells)
        .enumerate()
        .skip(1)
        .find(|(_, cell)| {
            let text = element_text(*cell).to_lowercase();
            sel.column_markers.iter().any(|m| text.contains(m.as_str()))
        })
        .map(|(i, _)| i - 1)
        .ok_or(ResolveMiss::ColumnNotFound)?;

    let record = table
        .select(&sel.body_rows)
        .filter_map(|row| {
            let label = row.select(&sel.row_label).next().map(element_text)?;
            let value = row
                .select(&sel.row_cells)
                .nth(standard_index)
                .map(element_text)?;
            (!label.is_empty() && !value.is_empty()).then_some((label, value))
        })
        .collect();

    Ok(record)
}
