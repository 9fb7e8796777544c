use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::now_ms;

/// One cancellation token per in-flight run. Cancellation is cooperative:
/// the execution task observes its token at safe points and stops promptly.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, run_id: &str) -> CancellationToken {
        let mut tokens = self.tokens.write().await;
        tokens
            .entry(run_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Signals cancellation. Returns false when no task is registered, which
    /// callers treat as "nothing to cancel".
    pub async fn cancel(&self, run_id: &str) -> bool {
        match self.tokens.read().await.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, run_id: &str) {
        self.tokens.write().await.remove(run_id);
    }
}

/// Liveness heartbeats for background execution tasks. The reaper uses the
/// last-activity timestamps to surface crashed or stalled tasks as run
/// errors instead of leaving them `running` forever.
#[derive(Clone, Default)]
pub struct RunActivity {
    last: Arc<RwLock<HashMap<String, u64>>>,
}

impl RunActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn touch(&self, run_id: &str) {
        self.last.write().await.insert(run_id.to_string(), now_ms());
    }

    pub async fn finish(&self, run_id: &str) {
        self.last.write().await.remove(run_id);
    }

    /// Removes and returns ids of runs silent for longer than `stale_ms`.
    pub async fn reap_stale(&self, stale_ms: u64) -> Vec<String> {
        let now = now_ms();
        let mut last = self.last.write().await;
        let stale: Vec<String> = last
            .iter()
            .filter(|(_, at)| now.saturating_sub(**at) > stale_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            last.remove(id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_without_registration_reports_false() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("missing").await);
        let token = registry.register("run-1").await;
        assert!(registry.cancel("run-1").await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn register_is_idempotent_per_run() {
        let registry = CancellationRegistry::new();
        let first = registry.register("run-1").await;
        let second = registry.register("run-1").await;
        first.cancel();
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn reap_returns_only_silent_runs() {
        let activity = RunActivity::new();
        activity.touch("fresh").await;
        activity.last.write().await.insert("stale".to_string(), 0);
        let stale = activity.reap_stale(60_000).await;
        assert_eq!(stale, vec!["stale".to_string()]);
        assert!(activity.reap_stale(60_000).await.is_empty());
    }
}
