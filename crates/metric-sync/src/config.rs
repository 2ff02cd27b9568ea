//! Runtime configuration: environment variables overlaid on an optional
//! `config/settings.json` file, with env taking precedence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Canonical name of the master copy on the remote store.
pub const MASTER_FILE_NAME: &str = "Social_Metrics_Master.csv";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{key}`; export the env var or add it to config/settings.json")]
    Missing { key: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root for the local cache: database, master-copy mirror, logs, queue.
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub queue_path: PathBuf,
    pub log_path: PathBuf,
    pub drive_folder_id: Option<String>,
    pub drive_access_token: Option<String>,
    pub analytics_url: Option<String>,
    pub dashboard_cookie: Option<String>,
    pub analyst_file_id: Option<String>,
    pub analyst_file_name: String,
    pub api_key: Option<String>,
    pub ollama_url: String,
    pub ollama_model: String,
    pub scheduler_enabled: bool,
    pub harvest_cron: String,
    pub queue_max: usize,
    pub host: String,
    pub port: u16,
}

impl AppConfig {
    /// Load configuration rooted at `root` (usually the working directory).
    pub fn load(root: &Path) -> Self {
        let settings = load_settings(&root.join("config").join("settings.json"));
        Self::build(root, |env_key, setting_key| {
            std::env::var(env_key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .or_else(|| settings.get(setting_key).cloned())
        })
    }

    fn build(root: &Path, lookup: impl Fn(&str, &str) -> Option<String>) -> Self {
        let data_dir = lookup("OPEN_METRIC_DATA_DIR", "data_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("data_cache"));
        Self {
            db_path: data_dir.join("social_metrics.db"),
            queue_path: data_dir.join("pending_posts.json"),
            log_path: data_dir.join("system.log"),
            drive_folder_id: lookup("GOOGLE_DRIVE_FOLDER_ID", "drive_folder_id")
                .map(|raw| metric_storage::normalize_drive_folder_id(&raw))
                .filter(|id| !id.is_empty()),
            drive_access_token: lookup("GOOGLE_DRIVE_ACCESS_TOKEN", "drive_access_token"),
            analytics_url: lookup("METRICOOL_ANALYTICS_URL", "analytics_url"),
            dashboard_cookie: lookup("METRICOOL_COOKIE", "metricool_cookie"),
            analyst_file_id: lookup("NOTEBOOKLM_SOURCE_FILE_ID", "notebooklm_source_file_id"),
            analyst_file_name: lookup("NOTEBOOKLM_SOURCE_NAME", "notebooklm_source_name")
                .unwrap_or_else(|| "NotebookLM_Source.csv".to_string()),
            api_key: lookup("OPEN_METRIC_API_KEY", "api_key"),
            ollama_url: lookup("OLLAMA_URL", "ollama_url")
                .unwrap_or_else(|| "http://localhost:11434/api/generate".to_string()),
            ollama_model: lookup("OLLAMA_MODEL", "ollama_model")
                .unwrap_or_else(|| "llama3".to_string()),
            scheduler_enabled: lookup("OPEN_METRIC_SCHEDULER", "scheduler_enabled")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            harvest_cron: lookup("HARVEST_CRON", "harvest_cron")
                .unwrap_or_else(|| "0 0 6 * * *".to_string()),
            queue_max: lookup("BUFFER_MAX_QUEUE", "buffer_max_queue")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            host: lookup("OPEN_METRIC_HOST", "host").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: lookup("OPEN_METRIC_PORT", "port")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            data_dir,
        }
    }

    /// Unwrap an optional setting or name the key that is missing.
    pub fn require(value: &Option<String>, key: &str) -> Result<String, ConfigError> {
        value
            .clone()
            .ok_or_else(|| ConfigError::Missing { key: key.to_string() })
    }
}

/// Read `settings.json` into a flat string map. A missing or malformed file
/// is treated as empty; numbers and booleans are stringified.
fn load_settings(path: &Path) -> HashMap<String, String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    let Ok(value) = serde_json::from_str::<Value>(&text) else {
        debug!(path = %path.display(), "ignoring malformed settings file");
        return HashMap::new();
    };
    let Some(map) = value.as_object() else {
        return HashMap::new();
    };
    map.iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            if text.is_empty() {
                None
            } else {
                Some((key.clone(), text))
            }
        })
        .collect()
}
