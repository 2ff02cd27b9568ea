//! HTML table extraction: the first `<table>` of an analytics page becomes
//! a sequence of raw rows keyed by header text.

use metric_core::{RawRow, RawValue};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

/// Extract the first table of `html` as raw rows. Returns an empty vec when
/// the document has no table, an empty table, or no recognizable header.
pub fn extract_table_rows(html: &str) -> Vec<RawRow> {
    let (Some(table_sel), Some(tr_sel), Some(th_sel), Some(cell_sel)) = (
        Selector::parse("table").ok(),
        Selector::parse("tr").ok(),
        Selector::parse("th").ok(),
        Selector::parse("td, th").ok(),
    ) else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let Some(table) = document.select(&table_sel).next() else {
        return Vec::new();
    };

    let rows: Vec<ElementRef> = table.select(&tr_sel).collect();
    // Header row: the first row carrying <th> cells, else the first row.
    let header_idx = rows
        .iter()
        .position(|row| row.select(&th_sel).next().is_some())
        .unwrap_or(0);
    let Some(header_row) = rows.get(header_idx) else {
        return Vec::new();
    };
    let headers: Vec<String> = header_row
        .select(&cell_sel)
        .map(|cell| cell_text(&cell))
        .collect();
    if headers.iter().all(String::is_empty) {
        return Vec::new();
    }

    let mut out = Vec::new();
    for row in rows.iter().skip(header_idx + 1) {
        let cells: Vec<String> = row.select(&cell_sel).map(|cell| cell_text(&cell)).collect();
        if cells.is_empty() {
            continue;
        }
        let raw: RawRow = headers
            .iter()
            .zip(cells)
            .map(|(name, value)| {
                let cell = if value.is_empty() {
                    RawValue::Missing
                } else {
                    RawValue::Text(value)
                };
                (name.clone(), cell)
            })
            .collect();
        out.push(raw);
    }
    debug!(rows = out.len(), "extracted table rows");
    out
}

fn cell_text(cell: &ElementRef) -> String {
    cell.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
