//! Price statistics over a scope's TSV delivery log.

use crate::utils::fmt_number;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

/// Prices further than this factor from the median are left out of the price figures.
const OUTLIER_FACTOR: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub dt: String,
    pub id: String,
    pub title: String,
    pub url: String,
    pub dispo: Option<String>,
    pub locality: Option<String>,
    pub area_m2: Option<f64>,
    pub price_czk: Option<f64>,
    pub price_per_m2: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Spread {
    pub min: f64,
    pub median: f64,
    pub mean: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    /// Rows dropped from the price figures as outliers.
    pub outliers: usize,
    pub price: Option<Spread>,
    pub area: Option<Spread>,
    pub price_per_m2: Option<Spread>,
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn number(s: Option<&str>) -> Option<f64> {
    s.and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Read a TSV log written by the delivery sink. A missing file reads as empty.
pub fn read_log(path: &Path) -> Result<Vec<LogRow>> {
    if !path.exists() {
        return Ok(vec![]);
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open log {:?}", path))?;

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Row {} in {:?}: {}", i + 1, path, e);
                continue;
            }
        };
        rows.push(LogRow {
            dt: record.get(0).unwrap_or_default().to_string(),
            id: record.get(1).unwrap_or_default().to_string(),
            title: record.get(2).unwrap_or_default().to_string(),
            url: record.get(3).unwrap_or_default().to_string(),
            dispo: non_empty(record.get(4)),
            locality: non_empty(record.get(5)),
            area_m2: number(record.get(6)),
            price_czk: number(record.get(7)),
            price_per_m2: number(record.get(8)),
        });
    }
    debug!("{:?}: {} rows", path, rows.len());
    Ok(rows)
}

/// The last `n` rows.
pub fn last(rows: &[LogRow], n: usize) -> &[LogRow] {
    &rows[rows.len().saturating_sub(n)..]
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn spread(values: impl Iterator<Item = f64>) -> Option<Spread> {
    let mut v: Vec<f64> = values.collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(f64::total_cmp);
    Some(Spread {
        min: v[0],
        median: median(&v),
        mean: v.iter().sum::<f64>() / v.len() as f64,
        max: v[v.len() - 1],
    })
}

/// Rows kept for the price figures: with at least three prices, anything outside
/// `[median / 10, median * 10]` is dropped.
fn without_outliers(rows: &[LogRow]) -> Vec<&LogRow> {
    let mut prices: Vec<f64> = rows.iter().filter_map(|r| r.price_czk).collect();
    if prices.len() < 3 {
        return rows.iter().collect();
    }
    prices.sort_by(f64::total_cmp);
    let med = median(&prices);
    if med <= 0.0 {
        return rows.iter().collect();
    }
    let (lo, hi) = (med / OUTLIER_FACTOR, med * OUTLIER_FACTOR);
    rows.iter()
        .filter(|r| r.price_czk.is_none_or(|p| p >= lo && p <= hi))
        .collect()
}

pub fn summarize(rows: &[LogRow]) -> Summary {
    let kept = without_outliers(rows);
    Summary {
        count: rows.len(),
        outliers: rows.len() - kept.len(),
        price: spread(kept.iter().filter_map(|r| r.price_czk)),
        area: spread(rows.iter().filter_map(|r| r.area_m2)),
        price_per_m2: spread(kept.iter().filter_map(|r| r.price_per_m2)),
    }
}

/// Text block shared by the `stats` subcommand and the console.
pub fn format_summary(scope: &str, summary: &Summary) -> String {
    let mut lines = vec![format!("Scope {}: {} listings", scope, summary.count)];
    let figures = [
        ("Price", summary.price),
        ("Area m²", summary.area),
        ("Kč/m²", summary.price_per_m2),
    ];
    for (label, spread) in figures {
        lines.push(match spread {
            Some(s) => format!(
                "  {:<8}: min {}  median {}  mean {}  max {}",
                label,
                fmt_number(s.min.round() as i64),
                fmt_number(s.median.round() as i64),
                fmt_number(s.mean.round() as i64),
                fmt_number(s.max.round() as i64)
            ),
            None => format!("  {:<8}: no data", label),
        });
    }
    if summary.outliers > 0 {
        lines.push(format!("  ({} price outliers left out)", summary.outliers));
    }
    lines.join("\n")
}
