//! Live recent-history view.
//!
//! Maintains the N most recently created stories, refreshed on every insert
//! notification from the repository. The list is bounded and small, so each
//! notification triggers a full reload rather than an incremental merge.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::repository::{Story, StoryRepository};
use crate::StoryError;

/// Live-updating view of the most recent stories.
///
/// Created with [`HistoryFeed::start`], which performs the initial load and
/// spawns the refresh task. Observers read the current list via
/// [`HistoryFeed::stories`] or watch for changes via
/// [`HistoryFeed::subscribe`]. Call [`HistoryFeed::stop`] on teardown to
/// unsubscribe.
pub struct HistoryFeed {
    view: watch::Receiver<Vec<Story>>,
    shutdown: CancellationToken,
    refresher: JoinHandle<()>,
}

impl HistoryFeed {
    /// Load the initial list and start following insert notifications.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the initial load fails.
    pub async fn start(
        repository: Arc<dyn StoryRepository>,
        limit: usize,
    ) -> Result<Self, StoryError> {
        let initial = repository.recent(limit).await?;
        let (tx, view) = watch::channel(initial);
        let inserts = repository.subscribe();
        let shutdown = CancellationToken::new();

        let refresher = tokio::spawn(refresh_loop(
            repository,
            limit,
            inserts,
            tx,
            shutdown.clone(),
        ));

        Ok(Self {
            view,
            shutdown,
            refresher,
        })
    }

    /// Snapshot of the current list, newest first.
    pub fn stories(&self) -> Vec<Story> {
        self.view.borrow().clone()
    }

    /// Watch receiver that changes whenever the list is refreshed.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Story>> {
        self.view.clone()
    }

    /// Unsubscribe and wait for the refresh task to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.refresher.await;
    }
}

/// Follow insert notifications, reloading the top-N list on each.
async fn refresh_loop(
    repository: Arc<dyn StoryRepository>,
    limit: usize,
    mut inserts: broadcast::Receiver<Story>,
    tx: watch::Sender<Vec<Story>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("history feed shutting down");
                return;
            }
            notification = inserts.recv() => {
                match notification {
                    // A reload covers any number of missed notifications,
                    // so lagging is handled the same as a single insert.
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        match repository.recent(limit).await {
                            Ok(stories) => {
                                let _ = tx.send(stories);
                            }
                            Err(e) => warn!(error = %e, "history reload failed"),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("insert feed closed, history feed stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use std::time::Duration;

    #[tokio::test]
    async fn test_initial_load_populates_view() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert("first", "text").await.unwrap();

        let feed = HistoryFeed::start(repo, 5).await.unwrap();
        let stories = feed.stories();
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].title, "first");
        feed.stop().await;
    }

    #[tokio::test]
    async fn test_insert_refreshes_view() {
        let repo = Arc::new(MemoryRepository::new());
        let feed = HistoryFeed::start(Arc::clone(&repo) as Arc<dyn StoryRepository>, 5)
            .await
            .unwrap();
        let mut view = feed.subscribe();

        repo.insert("fresh", "text").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), view.changed())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(feed.stories()[0].title, "fresh");
        feed.stop().await;
    }

    #[tokio::test]
    async fn test_view_is_capped_at_limit() {
        let repo = Arc::new(MemoryRepository::new());
        let feed = HistoryFeed::start(Arc::clone(&repo) as Arc<dyn StoryRepository>, 5)
            .await
            .unwrap();
        let mut view = feed.subscribe();

        for i in 0..6 {
            repo.insert(&format!("story-{i}"), "text").await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        // Wait for the view to settle on the final insert.
        loop {
            tokio::time::timeout(Duration::from_secs(1), view.changed())
                .await
                .unwrap()
                .unwrap();
            if feed.stories().first().map(|s| s.title.as_str()) == Some("story-5") {
                break;
            }
        }

        let stories = feed.stories();
        assert_eq!(stories.len(), 5);
        assert_eq!(stories[0].title, "story-5");
        feed.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ends_refresh_task() {
        let repo = Arc::new(MemoryRepository::new());
        let feed = HistoryFeed::start(repo, 5).await.unwrap();
        // Must return rather than hang.
        tokio::time::timeout(Duration::from_secs(1), feed.stop())
            .await
            .unwrap();
    }
}
