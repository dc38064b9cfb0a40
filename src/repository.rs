//! Story persistence and live-insert notifications.
//!
//! The managed database of a deployed instance is an external collaborator;
//! this module owns the seam. [`StoryRepository`] exposes exactly the two
//! capabilities the delivery engines consume ("insert row", "subscribe to
//! inserts") plus the bounded recent listing the history feed needs.
//! [`MemoryRepository`] is the in-process implementation used by the demo
//! binary and the test suites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::StoryError;

/// Capacity of the insert-notification channel. Subscribers that lag behind
/// simply reload, so a small buffer is enough.
const INSERT_CHANNEL_CAPACITY: usize = 16;

/// One persisted story. Created once per successful generation by whichever
/// delivery engine completed; immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Story {
    /// Unique story identifier.
    pub id: Uuid,
    /// Prompt-derived title, at most 53 characters.
    pub title: String,
    /// Full generated text.
    pub content: String,
    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
}

/// Persistence seam for finished stories.
#[async_trait]
pub trait StoryRepository: Send + Sync {
    /// Insert a finished story and notify subscribers.
    async fn insert(&self, title: &str, content: &str) -> Result<Story, StoryError>;

    /// The `limit` most recently created stories, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Story>, StoryError>;

    /// Subscribe to insert notifications. Each successfully inserted story
    /// is broadcast to all current subscribers.
    fn subscribe(&self) -> broadcast::Receiver<Story>;
}

/// In-memory repository backed by a `Vec` under an async lock.
pub struct MemoryRepository {
    stories: RwLock<Vec<Story>>,
    inserts: broadcast::Sender<Story>,
}

impl MemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        let (inserts, _) = broadcast::channel(INSERT_CHANNEL_CAPACITY);
        Self {
            stories: RwLock::new(Vec::new()),
            inserts,
        }
    }

    /// Total number of persisted stories.
    pub async fn len(&self) -> usize {
        self.stories.read().await.len()
    }

    /// Whether the repository holds no stories.
    pub async fn is_empty(&self) -> bool {
        self.stories.read().await.is_empty()
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoryRepository for MemoryRepository {
    async fn insert(&self, title: &str, content: &str) -> Result<Story, StoryError> {
        let story = Story {
            id: Uuid::new_v4(),
            title: title.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };

        self.stories.write().await.push(story.clone());

        // No subscribers is fine; the feed is optional.
        let _ = self.inserts.send(story.clone());
        Ok(story)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Story>, StoryError> {
        let stories = self.stories.read().await;
        let mut recent: Vec<Story> = stories.clone();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit);
        Ok(recent)
    }

    fn subscribe(&self) -> broadcast::Receiver<Story> {
        self.inserts.subscribe()
    }
}
