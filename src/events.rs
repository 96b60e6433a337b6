//! Buffered writers for the decision and reinforcement streams.
//!
//! Emitters never block on storage: events go into a bounded queue and a
//! background task flushes them through the gateway. A full queue drops the
//! event with a log line rather than stalling the hot path. On shutdown the
//! queue is drained best-effort within a deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::Store;
use crate::types::{DecisionEvent, ReinforcementEvent};

/// Best-effort drain window at shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum StreamEvent {
    Decision(DecisionEvent),
    Reinforcement(ReinforcementEvent),
}

/// Cheap-to-clone handle used by every component that emits events.
#[derive(Clone)]
pub struct EventLog {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventLog {
    /// Spawn the writer task over a bounded queue of `queue_max` events.
    pub fn spawn(store: Arc<dyn Store>, queue_max: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(queue_max.max(1));

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Decision(ev) => {
                        if let Err(e) = store.append_decision(&ev).await {
                            warn!(event_type = %ev.event_type, error = %e, "Decision append failed");
                        }
                    }
                    StreamEvent::Reinforcement(ev) => {
                        if let Err(e) = store.append_reinforcement(&ev).await {
                            warn!(user_id = %ev.user_id, error = %e, "Reinforcement append failed");
                        }
                    }
                }
            }
            debug!("Event writer drained and stopped");
        });

        (Self { tx }, handle)
    }

    /// Queue a decision event. Never blocks; drops when the buffer is full.
    pub fn decision(&self, event: DecisionEvent) {
        if let Err(e) = self.tx.try_send(StreamEvent::Decision(event)) {
            warn!(error = %e, "Decision event queue full, dropping event");
        }
    }

    pub fn reinforcement(&self, event: ReinforcementEvent) {
        if let Err(e) = self.tx.try_send(StreamEvent::Reinforcement(event)) {
            warn!(error = %e, "Reinforcement event queue full, dropping event");
        }
    }

    /// Convenience constructor + enqueue for the common case.
    pub fn log(
        &self,
        event_type: &str,
        source: &str,
        user_id: &str,
        summary: impl Into<String>,
        details: serde_json::Value,
    ) {
        self.decision(DecisionEvent::new(event_type, source, user_id, summary, details));
    }
}

/// Close the queue and wait (bounded) for the writer to flush what's left.
pub async fn shutdown(log: EventLog, handle: JoinHandle<()>) {
    drop(log);
    if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
        warn!("Event writer did not drain within {:?}", DRAIN_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventStore, KvStore, SqliteStore};

    #[tokio::test]
    async fn events_flush_through_the_writer() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let (log, handle) = EventLog::spawn(store.clone(), 100);

        log.log(
            "verifier_result",
            "debate",
            "u1",
            "Verifier rejected plan",
            serde_json::json!({"result": "reject", "reason": "denylist:rm -rf"}),
        );
        log.reinforcement(ReinforcementEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            user_id: "u1".into(),
            score: 0.4,
            task_succeeded: true,
            concise: true,
            helpful: true,
            emotionally_aligned: false,
            reasoning: "task completed".into(),
        });

        shutdown(log, handle).await;

        let decisions = store.recent_decisions(10).await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].event_type, "verifier_result");
    }

    #[tokio::test]
    async fn insertion_order_is_preserved_per_writer() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let (log, handle) = EventLog::spawn(store.clone(), 100);

        for i in 0..5 {
            log.log("step", "debate", "u1", format!("step {}", i), serde_json::json!({"i": i}));
        }
        shutdown(log, handle).await;

        let ring = store.kv_lrange(crate::store::keys::DECISION_LOGS, 10).await.unwrap();
        assert_eq!(ring.len(), 5);
        // Ring is newest-first; the last appended step is on top.
        assert!(ring[0].contains("step 4"));
        assert!(ring[4].contains("step 0"));
    }
}
