//! Pending-post queue persisted as JSON, plus the slot-filling automation
//! that feeds an external publishing service.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use metric_storage::{run_with_retry, RetryError, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher step failed: {0}")]
    Step(String),
    #[error("publish cancelled")]
    Cancelled,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

fn default_platforms() -> Vec<String> {
    vec!["linkedin".to_string()]
}

fn default_status() -> String {
    "pending".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPost {
    #[serde(default)]
    pub id: String,
    pub text: String,
    #[serde(default = "default_platforms")]
    pub platforms: Vec<String>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

impl PendingPost {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            text: text.into(),
            platforms: default_platforms(),
            status: default_status(),
            image_path: None,
        }
    }

    fn assign_id(&mut self) {
        if self.id.is_empty() {
            let uuid = Uuid::new_v4().simple().to_string();
            self.id = format!("post_{}", &uuid[..8]);
        }
    }
}

/// JSON-file-backed queue. Load/save are explicit so callers control when
/// state hits disk.
pub struct PostQueue {
    path: PathBuf,
    posts: Vec<PendingPost>,
}

impl PostQueue {
    /// A missing file is an empty queue, not an error.
    pub fn load(path: &Path) -> Result<Self, QueueError> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                posts: Vec::new(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        let posts = serde_json::from_str(&text)?;
        Ok(Self {
            path: path.to_path_buf(),
            posts,
        })
    }

    pub fn save(&self) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&self.posts)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }

    /// Add a post, assigning a `post_<uuid8>` id when it has none. Returns
    /// the id under which the post was stored.
    pub fn push(&mut self, mut post: PendingPost) -> String {
        post.assign_id();
        let id = post.id.clone();
        self.posts.push(post);
        id
    }

    pub fn posts(&self) -> &[PendingPost] {
        &self.posts
    }

    pub fn next_pending(&self) -> Option<&PendingPost> {
        self.posts.iter().find(|post| post.status == "pending")
    }

    pub fn mark_scheduled(&mut self, id: &str) -> bool {
        match self.posts.iter_mut().find(|post| post.id == id) {
            Some(post) => {
                post.status = "scheduled".to_string();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }
}

/// External scheduling service the queue automation feeds (Buffer in
/// production).
#[async_trait]
pub trait PostPublisher: Send + Sync {
    /// Posts currently waiting inside the external service.
    async fn queued_count(&self) -> Result<usize, PublishError>;
    async fn publish(&self, post: &PendingPost) -> Result<(), PublishError>;
}

/// Move one pending post into the external service when it has room.
/// Returns the id of the post that was scheduled, if any.
pub async fn fill_slots(
    queue: &mut PostQueue,
    publisher: &dyn PostPublisher,
    max_queue: usize,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Option<String>, PublishError> {
    let queued = retry_publish(policy, "publisher queue size", cancel, || {
        publisher.queued_count()
    })
    .await?;
    if queued >= max_queue {
        info!(queued, max_queue, "publisher queue is full; nothing to do");
        return Ok(None);
    }

    let Some(post) = queue.next_pending().cloned() else {
        info!("no pending posts in the local queue");
        return Ok(None);
    };

    retry_publish(policy, "publish post", cancel, || publisher.publish(&post)).await?;
    queue.mark_scheduled(&post.id);
    queue.save()?;
    info!(post_id = %post.id, "post handed to publisher");
    Ok(Some(post.id))
}

async fn retry_publish<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    cancel: &CancellationToken,
    action: F,
) -> Result<T, PublishError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, PublishError>>,
{
    run_with_retry(policy, label, cancel, action)
        .await
        .map_err(|err| match err {
            RetryError::Cancelled => PublishError::Cancelled,
            RetryError::Exhausted(inner) => inner,
        })
}
