//! Draft-post generation through a local Ollama instance.
//!
//! Generation is best-effort: a failure comes back as a bracketed
//! placeholder string so the queue workflow keeps moving without a model.

use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::warn;

pub struct CreativeEngine {
    http: reqwest::Client,
    url: String,
    model: String,
}

impl CreativeEngine {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building ollama http client")?;
        Ok(Self {
            http,
            url: url.into(),
            model: model.into(),
        })
    }

    pub async fn generate(&self, topic: &str) -> String {
        match self.request(topic).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, topic, "post generation failed");
                format!("[Generation failed: {err}]")
            }
        }
    }

    async fn request(&self, topic: &str) -> anyhow::Result<String> {
        let prompt = format!(
            "You are a social media strategist. Write a short, engaging LinkedIn post \
             about the following topic. Plain text only, no hashtag spam, at most 120 words.\n\n\
             Topic: {topic}"
        );
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("reaching ollama")?;
        if !response.status().is_success() {
            anyhow::bail!("ollama returned status {}", response.status());
        }
        let body: serde_json::Value = response.json().await.context("decoding ollama response")?;
        let text = body
            .get("response")
            .and_then(|value| value.as_str())
            .context("ollama response missing `response` field")?;
        Ok(text.trim().to_string())
    }
}
