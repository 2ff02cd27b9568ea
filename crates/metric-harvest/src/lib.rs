//! Dashboard harvesting: raw-row normalization, HTML table extraction and
//! the retry-wrapped harvest orchestration.

mod harvester;
mod normalize;
mod table;

pub const CRATE_NAME: &str = "metric-harvest";

pub use harvester::{DashboardSession, Harvester, HarvestError, HttpDashboardSession};
pub use normalize::{derive_post_id, normalize, normalize_row, parse_number_text, to_iso_utc};
pub use table::extract_table_rows;
