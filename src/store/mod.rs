//! Persistence gateway: typed access to durable state over SQLite.
//!
//! Components never touch SQL directly — they hold an `Arc<dyn Store>` and go
//! through these traits. The gateway owns the canonical bytes for tasks,
//! locks, profiles and the append-only event streams, and emulates the KV
//! namespaces (`her:*`) the dashboard and transport collaborators read.

mod retry;
mod sqlite;

pub use retry::with_retry;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::CoreResult;
use crate::types::{AutonomyProfile, DecisionEvent, ReinforcementEvent, Task};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Upsert by id. Conflicts when the stored row carries a newer
    /// `updated_at` than the one being written (stale writer).
    async fn save_task(&self, task: &Task) -> CoreResult<()>;
    async fn load_tasks(&self) -> CoreResult<Vec<Task>>;
    async fn load_task(&self, id: &str) -> CoreResult<Option<Task>>;
    /// Idempotent: deleting an absent task succeeds.
    async fn delete_task(&self, id: &str) -> CoreResult<()>;
    /// Enabled tasks whose `next_run_at` is at or before `now`.
    async fn due_tasks(&self, now: DateTime<Utc>) -> CoreResult<Vec<Task>>;
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// True when acquired, or when the lock is already held by this holder.
    /// An expired lock (heartbeat older than its ttl) can be taken over.
    async fn acquire_lock(&self, name: &str, holder: &str, ttl_secs: u64) -> CoreResult<bool>;
    /// True while the lock is still ours; false means it was lost.
    async fn heartbeat_lock(&self, name: &str, holder: &str) -> CoreResult<bool>;
    async fn release_lock(&self, name: &str, holder: &str) -> CoreResult<()>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Load the profile, creating the default row lazily on first use.
    async fn load_profile(&self, user_id: &str) -> CoreResult<AutonomyProfile>;
    async fn save_profile(&self, profile: &AutonomyProfile) -> CoreResult<()>;
    /// Users with a profile, most recently active first.
    async fn list_profile_user_ids(&self, limit: u32) -> CoreResult<Vec<String>>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably append and mirror into the `her:decision:logs` ring buffer.
    async fn append_decision(&self, event: &DecisionEvent) -> CoreResult<()>;
    async fn append_reinforcement(&self, event: &ReinforcementEvent) -> CoreResult<()>;
    async fn recent_decisions(&self, limit: i64) -> CoreResult<Vec<DecisionEvent>>;
}

/// Outcome of one proactive delivery attempt, audited per (user, day, slot).
#[derive(Debug, Clone)]
pub struct ProactiveAudit {
    pub user_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub message_kind: String,
    pub mood: String,
    pub success: bool,
    pub day_bucket: NaiveDate,
    pub daily_slot: Option<u8>,
}

/// Daily reflection over a user's proactive activity.
#[derive(Debug, Clone)]
pub struct ReflectionEntry {
    pub user_id: String,
    pub reflection_date: NaiveDate,
    pub engagement_trend: String,
    pub initiative_adjustment: f64,
    pub notes: String,
    pub confidence: String,
}

#[async_trait]
pub trait ProactiveStore: Send + Sync {
    /// Claim the lowest free slot (1..=3) for the day. The unique key is the
    /// source of truth: a conflicting insert means someone else owns it.
    async fn reserve_daily_slot(&self, user_id: &str, day: NaiveDate) -> CoreResult<Option<u8>>;
    async fn record_proactive_audit(&self, audit: &ProactiveAudit) -> CoreResult<()>;
    async fn count_proactive_sent(&self, user_id: &str, day: NaiveDate) -> CoreResult<u32>;
    /// (sent, failed) counts for one user-day, feeding the daily reflection.
    async fn proactive_day_counts(&self, user_id: &str, day: NaiveDate) -> CoreResult<(u32, u32)>;
    async fn upsert_reflection(&self, entry: &ReflectionEntry) -> CoreResult<()>;
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn kv_set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> CoreResult<()>;
    async fn kv_get(&self, key: &str) -> CoreResult<Option<String>>;
    /// Atomic set-if-absent; expired entries count as absent.
    async fn kv_setnx(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> CoreResult<bool>;
    /// LPUSH + LTRIM: prepend and keep the newest `keep` entries.
    async fn kv_lpush_trim(&self, key: &str, value: &str, keep: u32) -> CoreResult<()>;
    /// Newest-first range read of a list namespace.
    async fn kv_lrange(&self, key: &str, limit: u32) -> CoreResult<Vec<String>>;
    async fn kv_list_clear(&self, key: &str) -> CoreResult<()>;
}

/// Facade over every gateway concern. Components depend on this.
pub trait Store:
    TaskStore + LockStore + ProfileStore + EventStore + ProactiveStore + KvStore
{
}

impl<T> Store for T where
    T: TaskStore + LockStore + ProfileStore + EventStore + ProactiveStore + KvStore
{
}

/// KV namespaces shared with the dashboard and transport collaborators.
pub mod keys {
    pub const SCHEDULER_STATE: &str = "her:scheduler:state";
    pub const SCHEDULER_TASKS_OVERRIDE: &str = "her:scheduler:tasks_override";
    pub const SCHEDULER_JOBS: &str = "her:scheduler:jobs";
    pub const DECISION_LOGS: &str = "her:decision:logs";
    pub const REINFORCEMENT_EVENTS: &str = "her:reinforcement:events";
    pub const SANDBOX_EXECUTIONS: &str = "her:sandbox:executions";
    pub const RUNTIME_CAPABILITIES: &str = "her:runtime:capabilities";

    pub fn user_context(user_id: &str) -> String {
        format!("her:context:{}", user_id)
    }

    pub fn metric(name: &str) -> String {
        format!("her:metrics:{}", name)
    }
}
