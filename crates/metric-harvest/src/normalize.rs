//! Raw-row normalization into canonical metric records.
//!
//! Dashboard exports vary by locale and product version, so every target
//! field probes an ordered list of column-name aliases. Malformed cells
//! degrade to field defaults; normalization never rejects a row.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use metric_core::{format_number, ConversionStatus, MetricRecord, RawRow, RawValue, POST_ID_PREFIX};
use sha2::{Digest, Sha256};

const REACH_ALIASES: &[&str] = &["Reach", "Alcance", "Impressions", "Impresiones"];
const CLICK_ALIASES: &[&str] = &["Clicks", "Clics"];
const INTERACTION_ALIASES: &[&str] = &["Interactions", "Interacciones", "Engagements"];
const LIKE_ALIASES: &[&str] = &["Likes", "Me gusta", "Like"];
const COMMENT_ALIASES: &[&str] = &["Comments", "Comentarios"];
const SHARE_ALIASES: &[&str] = &["Shares", "Shared", "Compartidos", "Saves", "Guardados"];
const PLATFORM_ALIASES: &[&str] = &["Platform", "Plataforma", "Network", "Red", "Canal", "Channel"];
const MEDIA_TYPE_ALIASES: &[&str] = &["Type", "Tipo", "Format", "Formato"];
const CAPTION_ALIASES: &[&str] = &[
    "Text",
    "Post",
    "Caption",
    "Contenido",
    "Descripción",
    "Description",
];
const DATE_ALIASES: &[&str] = &["Date", "Fecha", "Day", "Día", "Published", "Publicado", "Time"];
const ID_ALIASES: &[&str] = &["Post ID", "PostId", "ID", "Id", "URL", "Link", "Enlace"];

/// Normalize a batch of raw rows. Output order matches input order.
pub fn normalize(rows: &[RawRow]) -> Vec<MetricRecord> {
    rows.iter().map(normalize_row).collect()
}

pub fn normalize_row(row: &RawRow) -> MetricRecord {
    let reach = parse_number(resolve(row, REACH_ALIASES));
    let clicks = parse_number(resolve(row, CLICK_ALIASES));
    let likes = parse_number(resolve(row, LIKE_ALIASES));
    let comments = parse_number(resolve(row, COMMENT_ALIASES));
    let shares = parse_number(resolve(row, SHARE_ALIASES));

    // A source-provided interactions total wins over the summed parts.
    let mut interactions = parse_number(resolve(row, INTERACTION_ALIASES));
    if interactions == 0.0 {
        interactions = likes + comments + shares;
    }
    let engagement_score = if reach > 0.0 {
        round4(interactions / reach)
    } else {
        0.0
    };

    let platform = resolve_text(row, PLATFORM_ALIASES, "Metricool");
    let media_type = resolve_text(row, MEDIA_TYPE_ALIASES, "Unknown");
    let caption_text = resolve_text(row, CAPTION_ALIASES, "");
    let timestamp_utc = to_iso_utc(resolve(row, DATE_ALIASES));

    let hash_input = natural_id(row).unwrap_or_else(|| {
        format!(
            "{platform}|{timestamp_utc}|{caption_text}|{}|{}|{}|{}",
            format_number(reach),
            format_number(likes),
            format_number(comments),
            format_number(shares),
        )
    });

    MetricRecord {
        post_id: derive_post_id(&hash_input),
        timestamp_utc,
        platform,
        media_type,
        engagement_score,
        reach,
        likes,
        comments,
        shares,
        caption_text,
        conversion_status: if clicks > 0.0 {
            ConversionStatus::Clicked
        } else {
            ConversionStatus::None
        },
    }
}

/// Stable identity: source tag + the first 16 hex chars of a SHA-256 digest
/// of the hash input (natural id when present, canonical field tuple
/// otherwise).
pub fn derive_post_id(hash_input: &str) -> String {
    let digest = Sha256::digest(hash_input.as_bytes());
    let hex_digest = hex::encode(digest);
    format!("{POST_ID_PREFIX}{}", &hex_digest[..16])
}

fn resolve<'a>(row: &'a RawRow, aliases: &[&str]) -> Option<&'a RawValue> {
    aliases.iter().find_map(|alias| row.get(alias))
}

fn resolve_text(row: &RawRow, aliases: &[&str], default: &str) -> String {
    match resolve(row, aliases) {
        Some(RawValue::Text(text)) => text.trim().to_string(),
        Some(RawValue::Number(number)) => format_number(*number),
        Some(RawValue::Missing) | None => default.to_string(),
    }
}

fn natural_id(row: &RawRow) -> Option<String> {
    match resolve(row, ID_ALIASES)? {
        RawValue::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        RawValue::Number(number) => Some(format_number(*number)),
        RawValue::Missing => None,
    }
}

fn parse_number(value: Option<&RawValue>) -> f64 {
    let parsed = match value {
        None | Some(RawValue::Missing) => 0.0,
        Some(RawValue::Number(number)) => {
            if number.is_finite() {
                *number
            } else {
                0.0
            }
        }
        Some(RawValue::Text(text)) => parse_number_text(text),
    };
    parsed.max(0.0)
}

/// Locale- and unit-tolerant numeric parse. Strips `%`, applies `K`/`M`/`B`
/// magnitude suffixes, treats a comma as the decimal separator only when no
/// period is present, and maps sentinel tokens and residual garbage to `0.0`.
pub fn parse_number_text(text: &str) -> f64 {
    let mut s = text.trim().to_string();
    if s.is_empty() {
        return 0.0;
    }
    if matches!(s.to_lowercase().as_str(), "nan" | "none" | "null" | "-") {
        return 0.0;
    }

    s = s.replace('%', "");

    let mut multiplier = 1.0;
    if let Some(last) = s.chars().last() {
        let suffix = match last {
            'K' => 1e3,
            'M' => 1e6,
            'B' => 1e9,
            _ => 1.0,
        };
        if suffix != 1.0 {
            s.pop();
            multiplier = suffix;
        }
    }

    let s = if s.contains(',') && !s.contains('.') {
        s.replace(',', ".")
    } else {
        s.replace(',', "")
    };

    s.trim()
        .parse::<f64>()
        .map(|value| value * multiplier)
        .unwrap_or(0.0)
}

/// Best-effort ISO-8601 UTC rendering of a resolved date cell. Unparseable
/// values fall back to the raw text; absent values become the empty string.
pub fn to_iso_utc(value: Option<&RawValue>) -> String {
    let raw = match value {
        None | Some(RawValue::Missing) => return String::new(),
        Some(RawValue::Number(number)) => format_number(*number),
        Some(RawValue::Text(text)) => text.trim().to_string(),
    };
    if raw.is_empty() {
        return String::new();
    }
    match parse_timestamp(&raw) {
        Some(datetime) => datetime.to_rfc3339(),
        None => raw,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(datetime) = DateTime::parse_from_rfc3339(raw) {
        return Some(datetime.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d/%m/%Y %H:%M"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(datetime.and_utc());
        }
    }
    for format in ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%b %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
        }
    }
    None
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
