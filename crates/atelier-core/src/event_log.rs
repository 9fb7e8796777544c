//! Per-run append-only event log with broadcast fan-out.
//!
//! Each run owns its events and its own broadcast channel, created and
//! dropped with the run rather than living in process-global state. Appends
//! for one run are serialized by the map's write lock; subscription snapshots
//! the backlog and subscribes under the same lock, so a reader sees every
//! event exactly once when it dedups by sequence id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;
use tokio::fs;
use tokio::sync::{broadcast, RwLock};

use atelier_types::EventRecord;

const CHANNEL_CAPACITY: usize = 1024;

struct RunLog {
    events: Vec<EventRecord>,
    tx: broadcast::Sender<EventRecord>,
}

impl RunLog {
    fn new(events: Vec<EventRecord>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { events, tx }
    }
}

pub struct Subscription {
    /// Persisted events with a sequence id greater than the requested cursor.
    pub backlog: Vec<EventRecord>,
    pub receiver: broadcast::Receiver<EventRecord>,
}

pub struct EventLog {
    base: PathBuf,
    runs: RwLock<HashMap<String, RunLog>>,
}

impl EventLog {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().join("events");
        fs::create_dir_all(&base)
            .await
            .with_context(|| format!("create events dir {}", base.display()))?;
        let mut runs = HashMap::new();
        let mut entries = fs::read_dir(&base).await.context("read events dir")?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(run_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = fs::read_to_string(&path).await?;
            let events: Vec<EventRecord> = serde_json::from_str(&raw).unwrap_or_default();
            runs.insert(run_id.to_string(), RunLog::new(events));
        }
        Ok(Self {
            base,
            runs: RwLock::new(runs),
        })
    }

    /// Appends one event, assigning the next sequence id, and fans it out to
    /// live subscribers. Persisted before the lock is released so the on-disk
    /// order always matches sequence order.
    pub async fn append(
        &self,
        run_id: &str,
        event_type: &str,
        payload: Value,
    ) -> anyhow::Result<EventRecord> {
        let mut runs = self.runs.write().await;
        let log = runs
            .entry(run_id.to_string())
            .or_insert_with(|| RunLog::new(Vec::new()));
        let sequence_id = log.events.len() as u64 + 1;
        let record = EventRecord::new(sequence_id, event_type, payload);
        log.events.push(record.clone());
        let payload = serde_json::to_string(&log.events).context("serialize events")?;
        let _ = log.tx.send(record.clone());
        let path = self.events_path(run_id);
        fs::write(&path, payload)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(record)
    }

    /// Snapshot of events after `after`, plus a live receiver, taken
    /// atomically with respect to appends.
    pub async fn subscribe(&self, run_id: &str, after: u64) -> Subscription {
        let mut runs = self.runs.write().await;
        let log = runs
            .entry(run_id.to_string())
            .or_insert_with(|| RunLog::new(Vec::new()));
        Subscription {
            backlog: log
                .events
                .iter()
                .filter(|event| event.sequence_id > after)
                .cloned()
                .collect(),
            receiver: log.tx.subscribe(),
        }
    }

    pub async fn events(&self, run_id: &str) -> Vec<EventRecord> {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|log| log.events.clone())
            .unwrap_or_default()
    }

    pub async fn event_count(&self, run_id: &str) -> u64 {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|log| log.events.len() as u64)
            .unwrap_or(0)
    }

    fn events_path(&self, run_id: &str) -> PathBuf {
        self.base.join(format!("{run_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sequence_ids_are_gapless_from_one() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).await.unwrap();
        for i in 0..4 {
            let record = log
                .append("run-1", "status", json!({"step": i}))
                .await
                .unwrap();
            assert_eq!(record.sequence_id, i + 1);
        }
        let events = log.events("run-1").await;
        let ids: Vec<u64> = events.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn replay_after_cursor_then_live_without_gaps_or_dupes() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).await.unwrap();
        for i in 1..=10 {
            log.append("run-1", "tool", json!({"n": i})).await.unwrap();
        }

        let mut sub = log.subscribe("run-1", 4).await;
        let backlog_ids: Vec<u64> = sub.backlog.iter().map(|e| e.sequence_id).collect();
        assert_eq!(backlog_ids, vec![5, 6, 7, 8, 9, 10]);

        let live = log.append("run-1", "done", json!({})).await.unwrap();
        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received.sequence_id, 11);
        assert_eq!(received.sequence_id, live.sequence_id);
    }

    #[tokio::test]
    async fn subscribers_observe_identical_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).await.unwrap();
        let mut a = log.subscribe("run-1", 0).await;
        let mut b = log.subscribe("run-1", 0).await;
        for i in 0..3 {
            log.append("run-1", "message", json!({"i": i})).await.unwrap();
        }
        for _ in 0..3 {
            let from_a = a.receiver.recv().await.unwrap();
            let from_b = b.receiver.recv().await.unwrap();
            assert_eq!(from_a.sequence_id, from_b.sequence_id);
            assert_eq!(from_a.payload, from_b.payload);
        }
    }

    #[tokio::test]
    async fn events_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = EventLog::new(dir.path()).await.unwrap();
            log.append("run-1", "status", json!({"status": "running"}))
                .await
                .unwrap();
            log.append("run-1", "done", json!({})).await.unwrap();
        }
        let reloaded = EventLog::new(dir.path()).await.unwrap();
        let events = reloaded.events("run-1").await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "done");
        // Appends continue from the persisted tail.
        let next = reloaded
            .append("run-1", "status", json!({}))
            .await
            .unwrap();
        assert_eq!(next.sequence_id, 3);
    }

    #[tokio::test]
    async fn concurrent_appends_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let log = std::sync::Arc::new(EventLog::new(dir.path()).await.unwrap());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append("run-1", "tool", json!({})).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let mut ids: Vec<u64> = log
            .events("run-1")
            .await
            .iter()
            .map(|e| e.sequence_id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=20).collect::<Vec<u64>>());
    }
}
