//! Master-copy CSV codec.
//!
//! The remote master file is a plain CSV with the `MASTER_SCHEMA` header.
//! Encoding always emits the canonical column order. Decoding is
//! schema-tolerant: columns are matched by header name, missing columns
//! become defaults, extras are dropped, and an empty or corrupt body decodes
//! to an empty record set instead of failing.

use crate::{MetricRecord, MASTER_SCHEMA};

/// Header-only master file, used when bootstrapping the remote copy.
pub fn master_header() -> String {
    let mut header = MASTER_SCHEMA.join(",");
    header.push('\n');
    header
}

pub fn encode_master_csv(records: &[MetricRecord]) -> String {
    let mut output = master_header();
    for record in records {
        let row = record.text_row();
        let mut first = true;
        for field in &row {
            if !first {
                output.push(',');
            }
            first = false;
            output.push_str(&escape_field(field));
        }
        output.push('\n');
    }
    output
}

pub fn decode_master_csv(text: &str) -> Vec<MetricRecord> {
    let mut rows = parse_rows(text);
    if rows.is_empty() {
        return Vec::new();
    }
    let header = rows.remove(0);

    // Map each canonical column to its position in this particular file.
    let positions: Vec<Option<usize>> = MASTER_SCHEMA
        .iter()
        .map(|canonical| {
            header
                .iter()
                .position(|col| col.trim().eq_ignore_ascii_case(canonical))
        })
        .collect();

    // A header that shares no columns with the schema is not a master file.
    if positions.iter().all(Option::is_none) {
        return Vec::new();
    }

    rows.into_iter()
        .filter(|cells| !cells.iter().all(|c| c.trim().is_empty()))
        .map(|cells| {
            let fields: Vec<String> = positions
                .iter()
                .map(|pos| {
                    pos.and_then(|idx| cells.get(idx).cloned())
                        .unwrap_or_default()
                })
                .collect();
            MetricRecord::from_text_row(&fields)
        })
        .collect()
}

fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// RFC-4180 row splitter. Quoted fields may contain commas, escaped quotes
/// and embedded newlines (captions routinely do).
fn parse_rows(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            ',' => {
                row.push(std::mem::take(&mut field));
            }
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            '\r' => {
                // Swallow CR in CRLF; a bare CR also terminates the row.
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(ch),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}
