use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use super::retry::with_retry;
use super::{
    keys, EventStore, KvStore, LockStore, ProactiveAudit, ProactiveStore, ProfileStore,
    ReflectionEntry, TaskStore,
};
use crate::error::{CoreError, CoreResult};
use crate::types::{AutonomyProfile, DecisionEvent, ReinforcementEvent, Task, TaskKind, TriggerSpec};

/// SQLite-backed persistence gateway.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(db_path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(db = db_path, "Persistence gateway initialized");
        Ok(store)
    }

    /// Single-connection in-memory store for tests.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                username TEXT,
                mode TEXT,
                created_at TEXT NOT NULL,
                last_interaction TEXT,
                preferences TEXT NOT NULL DEFAULT '{}'
            )",
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                owner_user TEXT NOT NULL,
                kind TEXT NOT NULL,
                trigger_json TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                payload_json TEXT NOT NULL DEFAULT '{}',
                steps_json TEXT NOT NULL DEFAULT '[]',
                state_json TEXT NOT NULL DEFAULT '{}',
                last_run_at TEXT,
                next_run_at TEXT,
                last_result TEXT,
                failure_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(enabled, next_run_at)",
            "CREATE TABLE IF NOT EXISTS scheduler_job_locks (
                lock_name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS decision_logs (
                decision_id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                user_id TEXT,
                source TEXT NOT NULL,
                summary TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '{}'
            )",
            "CREATE INDEX IF NOT EXISTS idx_decision_logs_time ON decision_logs(timestamp)",
            "CREATE TABLE IF NOT EXISTS reinforcement_events (
                reinforcement_id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                user_id TEXT NOT NULL,
                score REAL NOT NULL,
                task_succeeded INTEGER NOT NULL DEFAULT 0,
                concise INTEGER NOT NULL DEFAULT 0,
                helpful INTEGER NOT NULL DEFAULT 0,
                emotionally_aligned INTEGER NOT NULL DEFAULT 0,
                reasoning TEXT NOT NULL DEFAULT ''
            )",
            "CREATE TABLE IF NOT EXISTS autonomy_profiles (
                user_id TEXT PRIMARY KEY,
                engagement_score REAL NOT NULL DEFAULT 0.5
                    CHECK (engagement_score >= 0.1 AND engagement_score <= 1.0),
                initiative_level REAL NOT NULL DEFAULT 0.5
                    CHECK (initiative_level >= 0.1 AND initiative_level <= 1.0),
                last_proactive_at TEXT,
                messages_sent_today INTEGER NOT NULL DEFAULT 0,
                proactive_day TEXT,
                error_count_today INTEGER NOT NULL DEFAULT 0,
                last_user_message_at TEXT,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS autonomy_reflections (
                reflection_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                reflection_date TEXT NOT NULL,
                engagement_trend TEXT NOT NULL,
                initiative_adjustment REAL NOT NULL,
                notes TEXT NOT NULL,
                confidence TEXT NOT NULL DEFAULT 'medium',
                created_at TEXT NOT NULL,
                UNIQUE (user_id, reflection_date)
            )",
            "CREATE TABLE IF NOT EXISTS proactive_daily_slots (
                user_id TEXT NOT NULL,
                day_bucket TEXT NOT NULL,
                slot INTEGER NOT NULL CHECK (slot >= 1 AND slot <= 3),
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, day_bucket, slot)
            )",
            "CREATE TABLE IF NOT EXISTS proactive_message_audit (
                proactive_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                sent_at TEXT,
                message_kind TEXT NOT NULL,
                mood TEXT NOT NULL DEFAULT '',
                success INTEGER NOT NULL DEFAULT 0,
                day_bucket TEXT NOT NULL,
                daily_slot INTEGER
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_proactive_audit_slot
                ON proactive_message_audit(user_id, day_bucket, daily_slot)
                WHERE daily_slot IS NOT NULL",
            "CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at TEXT
            )",
            "CREATE TABLE IF NOT EXISTS kv_list_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_kv_list_key ON kv_list_entries(key, id)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn db_err(context: &str, e: sqlx::Error) -> CoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() || db.is_check_violation() => {
            CoreError::domain(
                "That conflicts with something already recorded.",
                format!("{}: constraint violation: {}", context, db),
            )
        }
        _ => CoreError::transient(format!("{}: {}", context, e)),
    }
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

fn parse_day(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Task> {
    let trigger_json: String = row.get("trigger_json");
    let trigger: TriggerSpec = serde_json::from_str(&trigger_json)
        .map_err(|e| CoreError::fatal(format!("corrupt trigger_json: {}", e)))?;
    let kind_raw: String = row.get("kind");
    let kind: TaskKind = serde_json::from_value(serde_json::Value::String(kind_raw.clone()))
        .map_err(|_| CoreError::fatal(format!("corrupt task kind '{}'", kind_raw)))?;
    let payload_json: String = row.get("payload_json");
    let steps_json: String = row.get("steps_json");
    let state_json: String = row.get("state_json");

    Ok(Task {
        id: row.get("id"),
        owner_user: row.get("owner_user"),
        kind,
        trigger,
        enabled: row.get::<i64, _>("enabled") != 0,
        payload: serde_json::from_str(&payload_json)
            .map_err(|e| CoreError::fatal(format!("corrupt payload_json: {}", e)))?,
        steps: serde_json::from_str(&steps_json)
            .map_err(|e| CoreError::fatal(format!("corrupt steps_json: {}", e)))?,
        state: serde_json::from_str(&state_json)
            .map_err(|e| CoreError::fatal(format!("corrupt state_json: {}", e)))?,
        last_run_at: row.get::<Option<String>, _>("last_run_at").as_deref().and_then(parse_ts),
        next_run_at: row.get::<Option<String>, _>("next_run_at").as_deref().and_then(parse_ts),
        last_result: row.get("last_result"),
        failure_count: row.get::<i64, _>("failure_count") as u32,
        created_at: parse_ts(&row.get::<String, _>("created_at")).unwrap_or_else(Utc::now),
        updated_at: parse_ts(&row.get::<String, _>("updated_at")).unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn save_task(&self, task: &Task) -> CoreResult<()> {
        with_retry("save_task", || async {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT updated_at FROM tasks WHERE id = ?")
                    .bind(&task.id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| db_err("save_task", e))?;

            if let Some(stored) = existing.as_deref().and_then(parse_ts) {
                if stored > task.updated_at {
                    return Err(CoreError::domain(
                        "That task changed underneath this update.",
                        format!("save_task conflict: stored updated_at {} is newer", stored),
                    ));
                }
            }

            sqlx::query(
                "INSERT OR REPLACE INTO tasks
                    (id, owner_user, kind, trigger_json, enabled, payload_json, steps_json,
                     state_json, last_run_at, next_run_at, last_result, failure_count,
                     created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&task.id)
            .bind(&task.owner_user)
            .bind(task.kind.as_str())
            .bind(serde_json::to_string(&task.trigger).unwrap_or_default())
            .bind(task.enabled as i64)
            .bind(serde_json::to_string(&task.payload).unwrap_or_default())
            .bind(serde_json::to_string(&task.steps).unwrap_or_default())
            .bind(serde_json::to_string(&task.state).unwrap_or_default())
            .bind(task.last_run_at.map(|t| t.to_rfc3339()))
            .bind(task.next_run_at.map(|t| t.to_rfc3339()))
            .bind(&task.last_result)
            .bind(task.failure_count as i64)
            .bind(task.created_at.to_rfc3339())
            .bind(task.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("save_task", e))?;
            Ok(())
        })
        .await
    }

    async fn load_tasks(&self) -> CoreResult<Vec<Task>> {
        with_retry("load_tasks", || async {
            let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_err("load_tasks", e))?;
            rows.iter().map(row_to_task).collect()
        })
        .await
    }

    async fn load_task(&self, id: &str) -> CoreResult<Option<Task>> {
        with_retry("load_task", || async {
            let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_err("load_task", e))?;
            row.as_ref().map(row_to_task).transpose()
        })
        .await
    }

    async fn delete_task(&self, id: &str) -> CoreResult<()> {
        with_retry("delete_task", || async {
            sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("delete_task", e))?;
            Ok(())
        })
        .await
    }

    async fn due_tasks(&self, now: DateTime<Utc>) -> CoreResult<Vec<Task>> {
        with_retry("due_tasks", || async {
            let rows = sqlx::query(
                "SELECT * FROM tasks
                 WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?
                 ORDER BY next_run_at",
            )
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("due_tasks", e))?;
            rows.iter().map(row_to_task).collect()
        })
        .await
    }
}

#[async_trait]
impl LockStore for SqliteStore {
    async fn acquire_lock(&self, name: &str, holder: &str, ttl_secs: u64) -> CoreResult<bool> {
        with_retry("acquire_lock", || async {
            let now = Utc::now();
            let expiry_cutoff = now - chrono::Duration::seconds(ttl_secs as i64);
            let result = sqlx::query(
                "INSERT INTO scheduler_job_locks (lock_name, holder, updated_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(lock_name) DO UPDATE SET
                    holder = excluded.holder,
                    updated_at = excluded.updated_at
                 WHERE scheduler_job_locks.holder = excluded.holder
                    OR scheduler_job_locks.updated_at < ?",
            )
            .bind(name)
            .bind(holder)
            .bind(now.to_rfc3339())
            .bind(expiry_cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("acquire_lock", e))?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn heartbeat_lock(&self, name: &str, holder: &str) -> CoreResult<bool> {
        with_retry("heartbeat_lock", || async {
            let result = sqlx::query(
                "UPDATE scheduler_job_locks SET updated_at = ?
                 WHERE lock_name = ? AND holder = ?",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("heartbeat_lock", e))?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn release_lock(&self, name: &str, holder: &str) -> CoreResult<()> {
        with_retry("release_lock", || async {
            sqlx::query("DELETE FROM scheduler_job_locks WHERE lock_name = ? AND holder = ?")
                .bind(name)
                .bind(holder)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("release_lock", e))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn load_profile(&self, user_id: &str) -> CoreResult<AutonomyProfile> {
        with_retry("load_profile", || async {
            sqlx::query(
                "INSERT OR IGNORE INTO autonomy_profiles (user_id, updated_at) VALUES (?, ?)",
            )
            .bind(user_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("load_profile", e))?;

            let row = sqlx::query(
                "SELECT user_id, engagement_score, initiative_level, last_proactive_at,
                        messages_sent_today, proactive_day, error_count_today, last_user_message_at
                 FROM autonomy_profiles WHERE user_id = ?",
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err("load_profile", e))?;

            Ok(AutonomyProfile {
                user_id: row.get("user_id"),
                engagement_score: row.get("engagement_score"),
                initiative_level: row.get("initiative_level"),
                last_proactive_at: row
                    .get::<Option<String>, _>("last_proactive_at")
                    .as_deref()
                    .and_then(parse_ts),
                messages_sent_today: row.get::<i64, _>("messages_sent_today") as u32,
                proactive_day: row
                    .get::<Option<String>, _>("proactive_day")
                    .as_deref()
                    .and_then(parse_day),
                error_count_today: row.get::<i64, _>("error_count_today") as u32,
                last_user_message_at: row
                    .get::<Option<String>, _>("last_user_message_at")
                    .as_deref()
                    .and_then(parse_ts),
            })
        })
        .await
    }

    async fn list_profile_user_ids(&self, limit: u32) -> CoreResult<Vec<String>> {
        with_retry("list_profile_user_ids", || async {
            let rows = sqlx::query(
                "SELECT user_id FROM autonomy_profiles ORDER BY updated_at DESC LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list_profile_user_ids", e))?;
            Ok(rows.iter().map(|row| row.get("user_id")).collect())
        })
        .await
    }

    async fn save_profile(&self, profile: &AutonomyProfile) -> CoreResult<()> {
        let mut clamped = profile.clone();
        clamped.clamp();
        with_retry("save_profile", || async {
            sqlx::query(
                "INSERT INTO autonomy_profiles
                    (user_id, engagement_score, initiative_level, last_proactive_at,
                     messages_sent_today, proactive_day, error_count_today,
                     last_user_message_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(user_id) DO UPDATE SET
                    engagement_score = excluded.engagement_score,
                    initiative_level = excluded.initiative_level,
                    last_proactive_at = excluded.last_proactive_at,
                    messages_sent_today = excluded.messages_sent_today,
                    proactive_day = excluded.proactive_day,
                    error_count_today = excluded.error_count_today,
                    last_user_message_at = excluded.last_user_message_at,
                    updated_at = excluded.updated_at",
            )
            .bind(&clamped.user_id)
            .bind(clamped.engagement_score)
            .bind(clamped.initiative_level)
            .bind(clamped.last_proactive_at.map(|t| t.to_rfc3339()))
            .bind(clamped.messages_sent_today as i64)
            .bind(clamped.proactive_day.map(|d| d.format("%Y-%m-%d").to_string()))
            .bind(clamped.error_count_today as i64)
            .bind(clamped.last_user_message_at.map(|t| t.to_rfc3339()))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("save_profile", e))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn append_decision(&self, event: &DecisionEvent) -> CoreResult<()> {
        with_retry("append_decision", || async {
            if !event.user_id.is_empty() {
                sqlx::query(
                    "INSERT INTO users (user_id, created_at, last_interaction)
                     VALUES (?, ?, ?)
                     ON CONFLICT(user_id) DO UPDATE SET last_interaction = excluded.last_interaction",
                )
                .bind(&event.user_id)
                .bind(event.timestamp.to_rfc3339())
                .bind(event.timestamp.to_rfc3339())
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("append_decision", e))?;
            }

            sqlx::query(
                "INSERT INTO decision_logs
                    (decision_id, timestamp, event_type, user_id, source, summary, details)
                 VALUES (?, ?, ?, NULLIF(?, ''), ?, ?, ?)",
            )
            .bind(&event.id)
            .bind(event.timestamp.to_rfc3339())
            .bind(&event.event_type)
            .bind(&event.user_id)
            .bind(&event.source)
            .bind(&event.summary)
            .bind(serde_json::to_string(&event.details).unwrap_or_default())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("append_decision", e))?;
            Ok(())
        })
        .await?;

        let serialized = serde_json::to_string(event).unwrap_or_default();
        self.kv_lpush_trim(keys::DECISION_LOGS, &serialized, 500).await
    }

    async fn append_reinforcement(&self, event: &ReinforcementEvent) -> CoreResult<()> {
        with_retry("append_reinforcement", || async {
            sqlx::query(
                "INSERT INTO reinforcement_events
                    (reinforcement_id, timestamp, user_id, score, task_succeeded, concise,
                     helpful, emotionally_aligned, reasoning)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.id)
            .bind(event.timestamp.to_rfc3339())
            .bind(&event.user_id)
            .bind(event.score)
            .bind(event.task_succeeded as i64)
            .bind(event.concise as i64)
            .bind(event.helpful as i64)
            .bind(event.emotionally_aligned as i64)
            .bind(&event.reasoning)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("append_reinforcement", e))?;
            Ok(())
        })
        .await?;

        let serialized = serde_json::to_string(event).unwrap_or_default();
        self.kv_lpush_trim(keys::REINFORCEMENT_EVENTS, &serialized, 500).await
    }

    async fn recent_decisions(&self, limit: i64) -> CoreResult<Vec<DecisionEvent>> {
        with_retry("recent_decisions", || async {
            let rows = sqlx::query(
                "SELECT decision_id, timestamp, event_type, user_id, source, summary, details
                 FROM decision_logs ORDER BY timestamp DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("recent_decisions", e))?;

            Ok(rows
                .iter()
                .map(|row| DecisionEvent {
                    id: row.get("decision_id"),
                    timestamp: parse_ts(&row.get::<String, _>("timestamp"))
                        .unwrap_or_else(Utc::now),
                    event_type: row.get("event_type"),
                    user_id: row.get::<Option<String>, _>("user_id").unwrap_or_default(),
                    source: row.get("source"),
                    summary: row.get("summary"),
                    details: serde_json::from_str(&row.get::<String, _>("details"))
                        .unwrap_or(serde_json::Value::Null),
                })
                .collect())
        })
        .await
    }
}

#[async_trait]
impl ProactiveStore for SqliteStore {
    async fn reserve_daily_slot(&self, user_id: &str, day: NaiveDate) -> CoreResult<Option<u8>> {
        with_retry("reserve_daily_slot", || async {
            for slot in 1..=3u8 {
                let result = sqlx::query(
                    "INSERT OR IGNORE INTO proactive_daily_slots
                        (user_id, day_bucket, slot, created_at)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(user_id)
                .bind(day.format("%Y-%m-%d").to_string())
                .bind(slot as i64)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("reserve_daily_slot", e))?;
                if result.rows_affected() == 1 {
                    return Ok(Some(slot));
                }
            }
            Ok(None)
        })
        .await
    }

    async fn record_proactive_audit(&self, audit: &ProactiveAudit) -> CoreResult<()> {
        with_retry("record_proactive_audit", || async {
            sqlx::query(
                "INSERT INTO proactive_message_audit
                    (proactive_id, user_id, scheduled_at, sent_at, message_kind, mood,
                     success, day_bucket, daily_slot)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&audit.user_id)
            .bind(audit.scheduled_at.to_rfc3339())
            .bind(audit.sent_at.map(|t| t.to_rfc3339()))
            .bind(&audit.message_kind)
            .bind(&audit.mood)
            .bind(audit.success as i64)
            .bind(audit.day_bucket.format("%Y-%m-%d").to_string())
            .bind(audit.daily_slot.map(|s| s as i64))
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("record_proactive_audit", e))?;
            Ok(())
        })
        .await
    }

    async fn count_proactive_sent(&self, user_id: &str, day: NaiveDate) -> CoreResult<u32> {
        with_retry("count_proactive_sent", || async {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM proactive_message_audit
                 WHERE user_id = ? AND day_bucket = ? AND success = 1",
            )
            .bind(user_id)
            .bind(day.format("%Y-%m-%d").to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err("count_proactive_sent", e))?;
            Ok(count as u32)
        })
        .await
    }

    async fn proactive_day_counts(&self, user_id: &str, day: NaiveDate) -> CoreResult<(u32, u32)> {
        with_retry("proactive_day_counts", || async {
            let row = sqlx::query(
                "SELECT
                    COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS sent,
                    COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) AS failed
                 FROM proactive_message_audit
                 WHERE user_id = ? AND day_bucket = ?",
            )
            .bind(user_id)
            .bind(day.format("%Y-%m-%d").to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err("proactive_day_counts", e))?;
            Ok((row.get::<i64, _>("sent") as u32, row.get::<i64, _>("failed") as u32))
        })
        .await
    }

    async fn upsert_reflection(&self, entry: &ReflectionEntry) -> CoreResult<()> {
        with_retry("upsert_reflection", || async {
            sqlx::query(
                "INSERT INTO autonomy_reflections
                    (reflection_id, user_id, reflection_date, engagement_trend,
                     initiative_adjustment, notes, confidence, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(user_id, reflection_date) DO UPDATE SET
                    engagement_trend = excluded.engagement_trend,
                    initiative_adjustment = excluded.initiative_adjustment,
                    notes = excluded.notes,
                    confidence = excluded.confidence,
                    created_at = excluded.created_at",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&entry.user_id)
            .bind(entry.reflection_date.format("%Y-%m-%d").to_string())
            .bind(&entry.engagement_trend)
            .bind(entry.initiative_adjustment)
            .bind(&entry.notes)
            .bind(&entry.confidence)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("upsert_reflection", e))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn kv_set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> CoreResult<()> {
        with_retry("kv_set", || async {
            let expires_at = ttl_secs
                .map(|ttl| (Utc::now() + chrono::Duration::seconds(ttl as i64)).to_rfc3339());
            sqlx::query(
                "INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value, expires_at = excluded.expires_at",
            )
            .bind(key)
            .bind(value)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("kv_set", e))?;
            Ok(())
        })
        .await
    }

    async fn kv_get(&self, key: &str) -> CoreResult<Option<String>> {
        with_retry("kv_get", || async {
            let row = sqlx::query("SELECT value, expires_at FROM kv_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_err("kv_get", e))?;
            let Some(row) = row else { return Ok(None) };
            if let Some(expiry) = row.get::<Option<String>, _>("expires_at").as_deref().and_then(parse_ts)
            {
                if expiry <= Utc::now() {
                    return Ok(None);
                }
            }
            Ok(Some(row.get("value")))
        })
        .await
    }

    async fn kv_setnx(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> CoreResult<bool> {
        with_retry("kv_setnx", || async {
            let now = Utc::now();
            let expires_at =
                ttl_secs.map(|ttl| (now + chrono::Duration::seconds(ttl as i64)).to_rfc3339());
            // An expired entry counts as absent and can be replaced.
            let result = sqlx::query(
                "INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value, expires_at = excluded.expires_at
                 WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= ?",
            )
            .bind(key)
            .bind(value)
            .bind(expires_at)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("kv_setnx", e))?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn kv_lpush_trim(&self, key: &str, value: &str, keep: u32) -> CoreResult<()> {
        with_retry("kv_lpush_trim", || async {
            sqlx::query("INSERT INTO kv_list_entries (key, value, created_at) VALUES (?, ?, ?)")
                .bind(key)
                .bind(value)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("kv_lpush_trim", e))?;
            sqlx::query(
                "DELETE FROM kv_list_entries
                 WHERE key = ? AND id NOT IN (
                     SELECT id FROM kv_list_entries WHERE key = ? ORDER BY id DESC LIMIT ?
                 )",
            )
            .bind(key)
            .bind(key)
            .bind(keep as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("kv_lpush_trim", e))?;
            Ok(())
        })
        .await
    }

    async fn kv_list_clear(&self, key: &str) -> CoreResult<()> {
        with_retry("kv_list_clear", || async {
            sqlx::query("DELETE FROM kv_list_entries WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("kv_list_clear", e))?;
            Ok(())
        })
        .await
    }

    async fn kv_lrange(&self, key: &str, limit: u32) -> CoreResult<Vec<String>> {
        with_retry("kv_lrange", || async {
            let rows = sqlx::query(
                "SELECT value FROM kv_list_entries WHERE key = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(key)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("kv_lrange", e))?;
            Ok(rows.iter().map(|row| row.get("value")).collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskKind;

    fn sample_task(id: &str) -> Task {
        let mut task = Task::new(
            id,
            "user-1",
            TaskKind::Interval,
            TriggerSpec::Interval { seconds: 300, anchor: None },
        );
        task.next_run_at = Some(Utc::now());
        task
    }

    #[tokio::test]
    async fn task_round_trips_by_value() {
        let store = SqliteStore::in_memory().await.unwrap();
        let task = sample_task("t1");
        store.save_task(&task).await.unwrap();

        let loaded = store.load_task("t1").await.unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.trigger, task.trigger);
        assert_eq!(loaded.kind, task.kind);
        assert_eq!(loaded.enabled, task.enabled);
        assert_eq!(
            loaded.next_run_at.unwrap().timestamp(),
            task.next_run_at.unwrap().timestamp()
        );

        let all = store.load_tasks().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn stale_save_conflicts() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut task = sample_task("t1");
        task.updated_at = Utc::now();
        store.save_task(&task).await.unwrap();

        let mut stale = task.clone();
        stale.updated_at = task.updated_at - chrono::Duration::seconds(30);
        let err = store.save_task(&stale).await.unwrap_err();
        assert!(!err.is_retryable());

        // Re-saving the same (id, updated_at) is idempotent.
        store.save_task(&task).await.unwrap();
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save_task(&sample_task("t1")).await.unwrap();
        store.delete_task("t1").await.unwrap();
        store.delete_task("t1").await.unwrap();
        assert!(store.load_task("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_tasks_filters_on_enabled_and_time() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();

        let mut due = sample_task("due");
        due.next_run_at = Some(now - chrono::Duration::seconds(5));
        store.save_task(&due).await.unwrap();

        let mut future = sample_task("future");
        future.next_run_at = Some(now + chrono::Duration::seconds(3600));
        store.save_task(&future).await.unwrap();

        let mut disabled = sample_task("disabled");
        disabled.enabled = false;
        disabled.next_run_at = Some(now - chrono::Duration::seconds(5));
        store.save_task(&disabled).await.unwrap();

        let due_now = store.due_tasks(now).await.unwrap();
        let ids: Vec<&str> = due_now.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["due"]);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_expired() {
        let store = SqliteStore::in_memory().await.unwrap();

        assert!(store.acquire_lock("scheduler_main", "node-a", 30).await.unwrap());
        // Re-entrant for the same holder.
        assert!(store.acquire_lock("scheduler_main", "node-a", 30).await.unwrap());
        // Second holder spins.
        assert!(!store.acquire_lock("scheduler_main", "node-b", 30).await.unwrap());

        assert!(store.heartbeat_lock("scheduler_main", "node-a").await.unwrap());
        assert!(!store.heartbeat_lock("scheduler_main", "node-b").await.unwrap());

        // A zero-ttl lock is immediately expired and can be taken over.
        store.release_lock("scheduler_main", "node-a").await.unwrap();
        assert!(store.acquire_lock("scheduler_main", "node-a", 0).await.unwrap());
        assert!(store.acquire_lock("scheduler_main", "node-b", 0).await.unwrap());
        assert!(!store.heartbeat_lock("scheduler_main", "node-a").await.unwrap());
    }

    #[tokio::test]
    async fn profile_defaults_and_clamping() {
        let store = SqliteStore::in_memory().await.unwrap();
        let profile = store.load_profile("u1").await.unwrap();
        assert_eq!(profile.engagement_score, 0.5);
        assert_eq!(profile.initiative_level, 0.5);

        let mut wild = profile.clone();
        wild.engagement_score = 4.2;
        wild.initiative_level = -1.0;
        store.save_profile(&wild).await.unwrap();

        let reloaded = store.load_profile("u1").await.unwrap();
        assert_eq!(reloaded.engagement_score, 1.0);
        assert_eq!(reloaded.initiative_level, 0.1);
    }

    #[tokio::test]
    async fn decision_append_mirrors_into_ring() {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 0..3 {
            let event = DecisionEvent::new(
                "scheduler_execution",
                "scheduler",
                "u1",
                format!("tick {}", i),
                serde_json::json!({"n": i}),
            );
            store.append_decision(&event).await.unwrap();
        }

        let recent = store.recent_decisions(10).await.unwrap();
        assert_eq!(recent.len(), 3);

        let ring = store.kv_lrange(keys::DECISION_LOGS, 10).await.unwrap();
        assert_eq!(ring.len(), 3);
        // Newest first.
        assert!(ring[0].contains("tick 2"));
    }

    #[tokio::test]
    async fn daily_slots_hand_out_each_slot_once() {
        let store = SqliteStore::in_memory().await.unwrap();
        let day = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();

        assert_eq!(store.reserve_daily_slot("u1", day).await.unwrap(), Some(1));
        assert_eq!(store.reserve_daily_slot("u1", day).await.unwrap(), Some(2));
        assert_eq!(store.reserve_daily_slot("u1", day).await.unwrap(), Some(3));
        assert_eq!(store.reserve_daily_slot("u1", day).await.unwrap(), None);

        // Another user and another day are independent.
        assert_eq!(store.reserve_daily_slot("u2", day).await.unwrap(), Some(1));
        let next_day = day.succ_opt().unwrap();
        assert_eq!(store.reserve_daily_slot("u1", next_day).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn kv_ttl_and_setnx() {
        let store = SqliteStore::in_memory().await.unwrap();

        store.kv_set("k", "v1", None).await.unwrap();
        assert_eq!(store.kv_get("k").await.unwrap().as_deref(), Some("v1"));

        assert!(!store.kv_setnx("k", "v2", None).await.unwrap());
        assert_eq!(store.kv_get("k").await.unwrap().as_deref(), Some("v1"));

        assert!(store.kv_setnx("fresh", "v", Some(60)).await.unwrap());
        assert!(!store.kv_setnx("fresh", "other", Some(60)).await.unwrap());
    }

    #[tokio::test]
    async fn list_namespace_trims_to_newest() {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 0..10 {
            store
                .kv_lpush_trim("her:scheduler:jobs", &format!("job-{}", i), 5)
                .await
                .unwrap();
        }
        let entries = store.kv_lrange("her:scheduler:jobs", 100).await.unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0], "job-9");
        assert_eq!(entries[4], "job-5");
    }
}
