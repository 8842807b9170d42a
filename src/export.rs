use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::model::{ProductLink, ProductRecord};

const FIXED_COLUMNS: [&str; 3] = ["Title", "Price", "URL"];

/// One flattened record. `nutrients` lines up with `ExportTable::columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRow {
    pub title: String,
    pub price: String,
    pub url: String,
    pub nutrients: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportTable {
    /// Sorted union of every nutrient label seen.
    pub columns: Vec<String>,
    pub rows: Vec<ExportRow>,
}

impl ExportTable {
    /// Fixed columns, then one per nutrient. A nutrient label equal to a fixed
    /// column name gets a " (nutrient)" suffix so headers stay unique.
    pub fn headers(&self) -> Vec<String> {
        let nutrients = self.columns.iter().map(|label| {
            if FIXED_COLUMNS.iter().any(|fixed| fixed.eq_ignore_ascii_case(label)) {
                warn!("Nutrient label {:?} clashes with a fixed column; renamed", label);
                format!("{label} (nutrient)")
            } else {
                label.clone()
            }
        });
        FIXED_COLUMNS
            .into_iter()
            .map(String::from)
            .chain(nutrients)
            .collect()
    }
}

/// Flatten records into rows sharing one column set. A nutrient a record
/// lacks is an empty cell.
pub fn aggregate(records: &[ProductRecord]) -> ExportTable {
    let columns: Vec<String> = records
        .iter()
        .filter_map(|r| r.nutrition.as_ref())
        .flat_map(|n| n.labels())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(String::from)
        .collect();

    let rows = records
        .iter()
        .map(|r| ExportRow {
            title: r.title.clone(),
            price: r.price.clone(),
            url: r.url.to_string(),
            nutrients: columns
                .iter()
                .map(|label| {
                    r.nutrition
                        .as_ref()
                        .and_then(|n| n.get(label))
                        .unwrap_or_default()
                        .to_string()
                })
                .collect(),
        })
        .collect();

    ExportTable { columns, rows }
}

pub fn write_csv_to<W: Write>(table: &ExportTable, out: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(table.headers())?;
    for row in &table.rows {
        wtr.write_record(
            [&row.title, &row.price, &row.url]
                .into_iter()
                .chain(row.nutrients.iter()),
        )?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_csv(records: &[ProductRecord], path: &Path) -> Result<()> {
    let table = aggregate(records);
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    write_csv_to(&table, BufWriter::new(file))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(
        "Wrote {} rows x {} nutrient columns to {}",
        table.rows.len(),
        table.columns.len(),
        path.display()
    );
    Ok(())
}

pub fn write_json(records: &[ProductRecord], path: &Path) -> Result<()> {
    save_json(records, path)?;
    info!("Wrote {} records to {}", records.len(), path.display());
    Ok(())
}

pub fn read_json(path: &Path) -> Result<Vec<ProductRecord>> {
    load_json(path)
}

pub fn write_links(links: &[ProductLink], path: &Path) -> Result<()> {
    save_json(links, path)?;
    info!("Wrote {} links to {}", links.len(), path.display());
    Ok(())
}

pub fn read_links(path: &Path) -> Result<Vec<ProductLink>> {
    load_json(path)
}

fn save_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, value)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    out.flush()?;
    Ok(())
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))
}
