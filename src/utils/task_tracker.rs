//! Named registry for background loops so shutdown can cancel stragglers.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked background task. A task already registered under the
    /// same name is aborted first.
    pub async fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut tasks = self.tasks.lock().await;
        if let Some(old) = tasks.remove(&name) {
            warn!("aborting existing task '{}' before respawning", name);
            old.abort();
        }
        tasks.insert(name, tokio::spawn(future));
    }

    /// Abort every tracked task. Used at shutdown for loops that have no
    /// graceful stop path of their own.
    pub async fn cancel_all(&self) {
        let tasks: HashMap<String, JoinHandle<()>> = {
            let mut guard = self.tasks.lock().await;
            guard.drain().collect()
        };
        let count = tasks.len();
        for (name, handle) in tasks {
            handle.abort();
            debug!("cancelled task '{}'", name);
        }
        if count > 0 {
            info!("cancelled {} tracked tasks", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_cancel_all() {
        let tracker = TaskTracker::new();
        tracker
            .spawn("long", async {
                tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
            })
            .await;
        assert_eq!(tracker.tasks.lock().await.len(), 1);

        tracker.cancel_all().await;
        assert!(tracker.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn respawn_replaces_existing() {
        let tracker = TaskTracker::new();
        for _ in 0..2 {
            tracker
                .spawn("loop", async {
                    tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
                })
                .await;
        }
        assert_eq!(tracker.tasks.lock().await.len(), 1);
        tracker.cancel_all().await;
    }

    #[tokio::test]
    async fn cancel_all_on_empty_is_a_no_op() {
        let tracker = TaskTracker::new();
        tracker.cancel_all().await;
        assert!(tracker.tasks.lock().await.is_empty());
    }
}
