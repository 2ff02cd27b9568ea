//! Canonical metric record model and raw-row contracts for Open-Metric.

use serde::{Deserialize, Serialize};

pub mod csv;

pub const CRATE_NAME: &str = "metric-core";

/// Identity prefix stamped onto every derived `post_id`.
pub const POST_ID_PREFIX: &str = "metri_";

/// The golden schema shared by the local store and the remote master copy.
/// Column order is load-bearing: the SQLite table, the CSV header and
/// `MetricRecord::text_row` all follow it.
pub const MASTER_SCHEMA: [&str; 11] = [
    "post_id",
    "timestamp_utc",
    "platform",
    "media_type",
    "engagement_score",
    "reach",
    "likes",
    "comments",
    "shares",
    "caption_text",
    "conversion_status",
];

/// Whether a post registered at least one click in the source dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConversionStatus {
    Clicked,
    #[default]
    None,
}

impl ConversionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clicked => "Clicked",
            Self::None => "None",
        }
    }

    /// Lenient parse used when reading back persisted text columns.
    /// Anything that is not `Clicked` is treated as `None`.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("clicked") {
            Self::Clicked
        } else {
            Self::None
        }
    }
}

impl std::fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized row of harvested social performance data.
///
/// Records are created once by the normalizer, written at most once per
/// `post_id` into the local store and appended at most once to the remote
/// master copy. They are never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Derived identity, never empty. See `metric-harvest` for the derivation.
    pub post_id: String,
    /// ISO-8601 UTC timestamp, raw source text when unparseable, empty when absent.
    pub timestamp_utc: String,
    pub platform: String,
    pub media_type: String,
    /// interactions / reach rounded to 4 decimals; 0 when reach is 0.
    pub engagement_score: f64,
    pub reach: f64,
    pub likes: f64,
    pub comments: f64,
    pub shares: f64,
    pub caption_text: String,
    pub conversion_status: ConversionStatus,
}

impl MetricRecord {
    /// Render every field as text in `MASTER_SCHEMA` order.
    pub fn text_row(&self) -> [String; 11] {
        [
            self.post_id.clone(),
            self.timestamp_utc.clone(),
            self.platform.clone(),
            self.media_type.clone(),
            format_number(self.engagement_score),
            format_number(self.reach),
            format_number(self.likes),
            format_number(self.comments),
            format_number(self.shares),
            self.caption_text.clone(),
            self.conversion_status.as_str().to_string(),
        ]
    }

    /// Rebuild a record from text fields in `MASTER_SCHEMA` order.
    /// Unparseable numeric fields degrade to `0.0`, never an error.
    pub fn from_text_row(fields: &[String]) -> Self {
        let get = |idx: usize| fields.get(idx).cloned().unwrap_or_default();
        Self {
            post_id: get(0),
            timestamp_utc: get(1),
            platform: get(2),
            media_type: get(3),
            engagement_score: parse_stored_number(&get(4)),
            reach: parse_stored_number(&get(5)),
            likes: parse_stored_number(&get(6)),
            comments: parse_stored_number(&get(7)),
            shares: parse_stored_number(&get(8)),
            caption_text: get(9),
            conversion_status: ConversionStatus::parse(&get(10)),
        }
    }
}

/// Canonical text rendering for numeric columns. Whole numbers drop the
/// fractional part so the same value always round-trips to the same text.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn parse_stored_number(text: &str) -> f64 {
    text.trim().parse::<f64>().unwrap_or(0.0)
}

/// A scalar cell as produced by the dashboard extraction collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Text(String),
    Number(f64),
    Missing,
}

impl RawValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

/// One raw tabular row: an ordered mapping from source column names to
/// scalar values. Column names vary by locale and dashboard version, so
/// lookups are case-insensitive and callers probe ordered alias lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    columns: Vec<(String, RawValue)>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: RawValue) {
        self.columns.push((name.into(), value));
    }

    /// First non-missing value stored under `name` (ASCII case-insensitive).
    pub fn get(&self, name: &str) -> Option<&RawValue> {
        self.columns
            .iter()
            .find(|(col, value)| col.trim().eq_ignore_ascii_case(name) && !value.is_missing())
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }
}

impl FromIterator<(String, RawValue)> for RawRow {
    fn from_iter<T: IntoIterator<Item = (String, RawValue)>>(iter: T) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_row_lookup_is_case_insensitive() {
        let mut row = RawRow::new();
        row.insert("Reach", RawValue::Text("1.5K".into()));
        assert!(row.get("reach").is_some());
        assert!(row.get("REACH").is_some());
        assert!(row.get("Alcance").is_none());
    }

    #[test]
    fn raw_row_skips_missing_cells() {
        let mut row = RawRow::new();
        row.insert("Likes", RawValue::Missing);
        row.insert("likes", RawValue::Number(7.0));
        assert_eq!(row.get("Likes"), Some(&RawValue::Number(7.0)));
    }

    #[test]
    fn conversion_status_round_trips_through_text() {
        assert_eq!(ConversionStatus::parse("Clicked"), ConversionStatus::Clicked);
        assert_eq!(ConversionStatus::parse("clicked"), ConversionStatus::Clicked);
        assert_eq!(ConversionStatus::parse("None"), ConversionStatus::None);
        assert_eq!(ConversionStatus::parse(""), ConversionStatus::None);
        assert_eq!(ConversionStatus::Clicked.as_str(), "Clicked");
    }

    #[test]
    fn text_row_round_trips_numbers() {
        let record = MetricRecord {
            post_id: "metri_abc".into(),
            timestamp_utc: "2026-02-02T00:00:00+00:00".into(),
            platform: "Instagram".into(),
            media_type: "Reel".into(),
            engagement_score: 0.0087,
            reach: 1500.0,
            likes: 10.0,
            comments: 2.0,
            shares: 1.0,
            caption_text: "launch day".into(),
            conversion_status: ConversionStatus::Clicked,
        };
        let row = record.text_row();
        assert_eq!(row[5], "1500");
        assert_eq!(row[4], "0.0087");
        let back = MetricRecord::from_text_row(&row);
        assert_eq!(back, record);
    }

    #[test]
    fn from_text_row_degrades_garbage_numbers_to_zero() {
        let mut fields: Vec<String> = vec![String::new(); 11];
        fields[0] = "metri_x".into();
        fields[5] = "not-a-number".into();
        let record = MetricRecord::from_text_row(&fields);
        assert_eq!(record.reach, 0.0);
        assert_eq!(record.conversion_status, ConversionStatus::None);
    }
}
