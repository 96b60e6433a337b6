//! Cross-component scenarios: the paths a unit test can't see — intent
//! extraction feeding the scheduler, the single-runner lock handover, and
//! crash-replay behavior around the persist-then-enqueue ordering.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::{SchedulerConfig, WorkflowConfig};
use crate::events::EventLog;
use crate::intent::{Intent, IntentClassifier};
use crate::providers::testing::ScriptedProvider;
use crate::scheduler::{SchedulerEngine, SCHEDULER_LOCK};
use crate::store::{LockStore, SqliteStore, TaskStore};
use crate::transport::{parse_admin_command, AdminCommand};
use crate::types::{InboundMessage, OutboundMessage, TaskKind, TriggerSpec};
use crate::workflow::WorkflowEngine;

async fn scheduler_fixture(
    store: Arc<SqliteStore>,
    lock_ttl_secs: u64,
) -> (Arc<SchedulerEngine>, mpsc::Receiver<OutboundMessage>) {
    let (events, _handle) = EventLog::spawn(store.clone(), 1000);
    let workflow = WorkflowEngine::new(&WorkflowConfig::default(), None).unwrap();
    let (tx, rx) = mpsc::channel(16);
    let config = SchedulerConfig { lock_ttl_secs, ..SchedulerConfig::default() };
    let engine = SchedulerEngine::new(store, events, workflow, tx, config, "UTC".to_string());
    (engine, rx)
}

fn inbound(text: &str) -> InboundMessage {
    InboundMessage {
        user_id: "u1".into(),
        timestamp: Utc::now(),
        text: text.into(),
        language_hint: None,
    }
}

async fn classifier(store: Arc<SqliteStore>) -> IntentClassifier {
    let (events, _handle) = EventLog::spawn(store, 100);
    IntentClassifier::new(
        Arc::new(ScriptedProvider::of_texts(&[])),
        events,
        0.8,
        "UTC".to_string(),
    )
}

/// Natural language in, scheduled workflow out, threshold alert across two
/// fires with state persisted between them.
#[tokio::test]
async fn threshold_automation_flows_from_message_to_alert() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let (engine, _rx) = scheduler_fixture(store.clone(), 30).await;
    let classifier = classifier(store.clone()).await;

    let classification = classifier
        .classify(
            &inbound("Check BTC price every 5 minutes and notify me when it rises 2% from current price"),
            None,
        )
        .await
        .unwrap();
    let Intent::ScheduleAdd { task, .. } = classification.intent else {
        panic!("expected a schedule draft");
    };
    let task = engine.add_task(*task).await.unwrap();
    assert_eq!(task.kind, TaskKind::Workflow);

    // Drive two fires with canned sources, persisting state like the engine
    // does between runs.
    let workflow = WorkflowEngine::new(&WorkflowConfig::default(), None).unwrap();
    let mut stored = store.load_task(&task.id).await.unwrap().unwrap();

    let first = workflow
        .run_with_source(&stored, Some(json!({"bitcoin": {"usd": 50000.0}})))
        .await;
    assert!(first.notifications.is_empty());
    stored.state = first.state;
    stored.updated_at = Utc::now();
    store.save_task(&stored).await.unwrap();

    let stored = store.load_task(&task.id).await.unwrap().unwrap();
    let second = workflow
        .run_with_source(&stored, Some(json!({"bitcoin": {"usd": 51500.0}})))
        .await;
    assert_eq!(second.notifications, vec!["BTC up >=2%, price=51500.0".to_string()]);
    assert_eq!(second.state.get("last_price"), Some(&json!(51500.0)));
}

/// The admin reminder shape: parsed, materialized, scheduled for the next
/// 09:00 UTC boundary.
#[tokio::test]
async fn admin_daily_reminder_lands_on_the_nine_oclock_boundary() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let (engine, _rx) = scheduler_fixture(store.clone(), 30).await;

    let command = parse_admin_command(
        "/schedule add hydrate reminder daily at=09:00 timezone=UTC message='drink water'",
    )
    .unwrap()
    .unwrap();
    let AdminCommand::ScheduleAdd(args) = command else {
        panic!("expected ScheduleAdd");
    };
    let task = engine.add_task(args.into_task("admin", "UTC").unwrap()).await.unwrap();

    let next = task.next_run_at.unwrap();
    assert_eq!(next.hour(), 9);
    assert_eq!(next.minute(), 0);
    assert_eq!(next.second(), 0);
    assert!(next > Utc::now());

    // After a fire at the boundary, the next occurrence is a day later.
    let after = crate::clock::next_fire(&task.trigger, next).unwrap().unwrap();
    assert_eq!(after - next, chrono::Duration::days(1));
}

/// "Remind me in 15 minutes" becomes a one-shot that disables itself.
#[tokio::test]
async fn natural_language_one_shot_fires_once_then_disables() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let (engine, mut rx) = scheduler_fixture(store.clone(), 30).await;
    engine.maintain_lock().await;
    let classifier = classifier(store.clone()).await;

    let message = inbound("Remind me in 15 minutes to stretch");
    let t0 = message.timestamp;
    let classification = classifier.classify(&message, None).await.unwrap();
    let Intent::ScheduleAdd { task, .. } = classification.intent else {
        panic!("expected a schedule draft");
    };
    let task = engine.add_task(*task).await.unwrap();
    assert!(task.enabled);
    assert_eq!(
        task.trigger,
        TriggerSpec::OneShot { at: t0 + chrono::Duration::minutes(15) }
    );

    // Pull the fire time into the past and let a tick run it.
    let mut due = store.load_task(&task.id).await.unwrap().unwrap();
    due.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    due.trigger = TriggerSpec::OneShot { at: Utc::now() - chrono::Duration::seconds(1) };
    due.updated_at = Utc::now();
    store.save_task(&due).await.unwrap();

    engine.tick().await.unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.text, "stretch");

    for _ in 0..100 {
        let task = store.load_task(&task.id).await.unwrap().unwrap();
        if !task.enabled {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("one-shot task was not disabled after firing");
}

/// Scheduler lock handover: the standby engine takes over once the active
/// holder stops heartbeating, and no task fires twice across the handover.
#[tokio::test]
async fn lock_handover_fires_each_task_exactly_once() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    // Engine A heartbeats against a normal ttl; engine B treats anything
    // older than 1s as expired, standing in for ttl expiry after a crash.
    let (engine_a, mut rx_a) = scheduler_fixture(store.clone(), 30).await;
    let (engine_b, mut rx_b) = scheduler_fixture(store.clone(), 1).await;

    engine_a.maintain_lock().await;
    assert!(engine_a.holds_lock());
    engine_b.maintain_lock().await;
    assert!(!engine_b.holds_lock());

    // A fires the first occurrence.
    let mut task = crate::types::Task::new(
        "handover",
        "u1",
        TaskKind::Reminder,
        TriggerSpec::Interval { seconds: 1, anchor: None },
    );
    task.payload.insert("message".into(), json!("tick"));
    task.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    engine_a.add_task(task).await.unwrap();
    engine_a.tick().await.unwrap();
    assert!(tokio::time::timeout(Duration::from_secs(2), rx_a.recv()).await.is_ok());

    // "Kill" A: no more heartbeats. After B's expiry horizon it takes over.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    engine_b.maintain_lock().await;
    assert!(engine_b.holds_lock());

    // A notices on its next heartbeat and suspends.
    engine_a.maintain_lock().await;
    assert!(!engine_a.holds_lock());

    // Make the task due again: only B may fire it.
    let mut due = store.load_task("handover").await.unwrap().unwrap();
    due.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    due.updated_at = Utc::now();
    store.save_task(&due).await.unwrap();

    engine_a.tick().await.unwrap();
    engine_b.tick().await.unwrap();

    assert!(tokio::time::timeout(Duration::from_secs(2), rx_b.recv()).await.is_ok());
    assert!(tokio::time::timeout(Duration::from_millis(300), rx_a.recv()).await.is_err());
}

/// The persist-then-enqueue ordering: once the advancement is durable, a
/// replay of the due query cannot produce a second fire for the same tick.
#[tokio::test]
async fn replay_after_advancement_does_not_double_fire() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let (engine, mut rx) = scheduler_fixture(store.clone(), 30).await;
    engine.maintain_lock().await;

    let mut task = crate::types::Task::new(
        "replayed",
        "u1",
        TaskKind::Reminder,
        TriggerSpec::Interval { seconds: 3600, anchor: None },
    );
    task.payload.insert("message".into(), json!("once"));
    task.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    engine.add_task(task).await.unwrap();

    engine.tick().await.unwrap();
    assert!(tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.is_ok());

    // Simulated crash-and-restart: the advanced next_run_at is durable, so
    // replaying the loop finds nothing due.
    let due = store.due_tasks(Utc::now()).await.unwrap();
    assert!(due.is_empty());
    engine.tick().await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());
}

/// Lock rows are visible through the gateway like any other state, so an
/// operator can inspect who holds the scheduler.
#[tokio::test]
async fn lock_state_is_inspectable() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let (engine, _rx) = scheduler_fixture(store.clone(), 30).await;
    engine.maintain_lock().await;

    assert!(!store.acquire_lock(SCHEDULER_LOCK, "someone-else", 30).await.unwrap());
    assert!(engine.holds_lock());
}
