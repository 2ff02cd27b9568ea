//! Harvest orchestration over a dashboard-session collaborator.
//!
//! The browser-automation (or export-URL) details live behind
//! [`DashboardSession`]; the harvester contributes the retry discipline
//! around every externally-fallible step and the table→record pipeline.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use metric_core::MetricRecord;
use metric_storage::{run_with_retry, RetryError, RetryPolicy};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::normalize::normalize;
use crate::table::extract_table_rows;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("dashboard step failed: {0}")]
    Step(String),
    #[error("no metrics table found in analytics page")]
    NoTable,
    #[error("harvest cancelled")]
    Cancelled,
}

/// Live dashboard the harvester drives. Implementations own navigation and
/// authentication; the harvester only sequences the steps.
#[async_trait]
pub trait DashboardSession: Send + Sync {
    /// Navigate to the analytics view, authenticating if the session needs it.
    async fn open_analytics(&self) -> Result<(), HarvestError>;
    /// Switch the analytics view to its tabular (list) layout.
    async fn open_list_view(&self) -> Result<(), HarvestError>;
    /// Current HTML of the analytics page.
    async fn page_html(&self) -> Result<String, HarvestError>;
}

pub struct Harvester<S> {
    session: S,
    policy: RetryPolicy,
}

impl<S: DashboardSession> Harvester<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Drive the session through analytics → list view → table HTML and
    /// normalize whatever the table holds. Each step gets the full retry
    /// budget; a step that stays down fails the harvest.
    pub async fn collect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<MetricRecord>, HarvestError> {
        self.step("analytics navigation", cancel, || {
            self.session.open_analytics()
        })
        .await?;
        self.step("list toggle", cancel, || self.session.open_list_view())
            .await?;
        let html = self
            .step("metrics table", cancel, || self.session.page_html())
            .await?;

        let rows = extract_table_rows(&html);
        if rows.is_empty() {
            return Err(HarvestError::NoTable);
        }
        info!(rows = rows.len(), "scraped rows from dashboard");
        Ok(normalize(&rows))
    }

    async fn step<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        action: F,
    ) -> Result<T, HarvestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HarvestError>>,
    {
        run_with_retry(self.policy, label, cancel, action)
            .await
            .map_err(|err| match err {
                RetryError::Cancelled => HarvestError::Cancelled,
                RetryError::Exhausted(inner) => inner,
            })
    }
}

/// Session backed by a plain HTTP fetch of a pre-authenticated analytics
/// export URL. The list layout is already rendered server-side for export
/// URLs, so `open_list_view` has nothing to do.
pub struct HttpDashboardSession {
    http: reqwest::Client,
    analytics_url: String,
    cookie: Option<String>,
    page: Mutex<Option<String>>,
}

impl HttpDashboardSession {
    pub fn new(analytics_url: impl Into<String>, cookie: Option<String>) -> Result<Self, HarvestError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| HarvestError::Step(err.to_string()))?;
        Ok(Self {
            http,
            analytics_url: analytics_url.into(),
            cookie,
            page: Mutex::new(None),
        })
    }
}

#[async_trait]
impl DashboardSession for HttpDashboardSession {
    async fn open_analytics(&self) -> Result<(), HarvestError> {
        let mut request = self.http.get(&self.analytics_url);
        if let Some(cookie) = &self.cookie {
            request = request.header(reqwest::header::COOKIE, cookie.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|err| HarvestError::Step(err.to_string()))?;
        if !response.status().is_success() {
            return Err(HarvestError::Step(format!(
                "analytics page returned status {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|err| HarvestError::Step(err.to_string()))?;
        *self.page.lock().await = Some(body);
        Ok(())
    }

    async fn open_list_view(&self) -> Result<(), HarvestError> {
        Ok(())
    }

    async fn page_html(&self) -> Result<String, HarvestError> {
        self.page
            .lock()
            .await
            .clone()
            .ok_or_else(|| HarvestError::Step("analytics page not loaded".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TABLE_HTML: &str = "<table>\
        <tr><th>Platform</th><th>Reach</th><th>Likes</th></tr>\
        <tr><td>Instagram</td><td>1.5K</td><td>10</td></tr>\
        </table>";

    struct ScriptedSession {
        nav_failures: u32,
        nav_calls: AtomicU32,
        html: String,
    }

    impl ScriptedSession {
        fn new(nav_failures: u32, html: &str) -> Self {
            Self {
                nav_failures,
                nav_calls: AtomicU32::new(0),
                html: html.to_string(),
            }
        }
    }

    #[async_trait]
    impl DashboardSession for ScriptedSession {
        async fn open_analytics(&self) -> Result<(), HarvestError> {
            let call = self.nav_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.nav_failures {
                Err(HarvestError::Step("navigation timed out".to_string()))
            } else {
                Ok(())
            }
        }

        async fn open_list_view(&self) -> Result<(), HarvestError> {
            Ok(())
        }

        async fn page_html(&self) -> Result<String, HarvestError> {
            Ok(self.html.clone())
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 2,
        }
    }

    #[tokio::test]
    async fn collect_normalizes_the_scraped_table() {
        let harvester =
            Harvester::new(ScriptedSession::new(0, TABLE_HTML)).with_policy(quick_policy());
        let records = harvester
            .collect(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].platform, "Instagram");
        assert_eq!(records[0].reach, 1500.0);
    }

    #[tokio::test]
    async fn flaky_navigation_is_retried() {
        let session = ScriptedSession::new(2, TABLE_HTML);
        let harvester = Harvester::new(session).with_policy(quick_policy());
        let records = harvester
            .collect(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn persistent_navigation_failure_surfaces_after_retries() {
        let session = ScriptedSession::new(10, TABLE_HTML);
        let harvester = Harvester::new(session).with_policy(quick_policy());
        let err = harvester
            .collect(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Step(_)));
    }

    #[tokio::test]
    async fn pages_without_tables_are_a_harvest_error() {
        let harvester = Harvester::new(ScriptedSession::new(0, "<p>empty</p>"))
            .with_policy(quick_policy());
        let err = harvester
            .collect(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::NoTable));
    }

    #[tokio::test]
    async fn cancellation_propagates() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let harvester =
            Harvester::new(ScriptedSession::new(0, TABLE_HTML)).with_policy(quick_policy());
        let err = harvester.collect(&cancel).await.unwrap_err();
        assert!(matches!(err, HarvestError::Cancelled));
    }
}
