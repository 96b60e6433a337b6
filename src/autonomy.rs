//! Bounded semi-autonomous behavior: per-user engagement/initiative scores,
//! proactive-send gating, daily slot reservation, and the nightly reflection
//! that nudges initiative based on how outreach actually landed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock;
use crate::error::CoreResult;
use crate::events::EventLog;
use crate::providers::{ChatMessage, ModelProvider};
use crate::store::{ProactiveAudit, ReflectionEntry, Store};
use crate::types::{clamp_score, AutonomyProfile, OutboundMessage, ReinforcementEvent, ReplyMode};

static POSITIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(thanks|thank you|great|good|awesome|perfect|helpful|merci|دمت گرم|عالی|ممنون)\b")
        .expect("static regex")
});
static COLD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(ok|k|fine|sure|نه|باشه|اوکی)\W*$").expect("static regex"));
static MUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(mute|stop proactive|disable proactive|خاموش|مزاحم نشو|پیام نده)")
        .expect("static regex")
});
static STRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(stress|stressed|overwhelmed|anxious|deadline|burnout|استرس|ددلاین|فشار)\b")
        .expect("static regex")
});

/// Per-event bound on profile movement from reinforcement.
const REINFORCEMENT_STEP: f64 = 0.05;

/// Hard cap on proactive messages per user-day, matching the slot table.
pub const MAX_DAILY_PROACTIVE: u32 = 3;

/// Signals extracted from one user message.
#[derive(Debug, Clone)]
pub struct MessageSignals {
    pub positive: bool,
    pub cold: bool,
    pub muted: bool,
    pub stressed: bool,
    pub engagement_score: f64,
    pub initiative_level: f64,
}

pub struct AutonomyService {
    store: Arc<dyn Store>,
    events: EventLog,
    quiet_hours_start: u32,
    quiet_hours_end: u32,
}

impl AutonomyService {
    pub fn new(
        store: Arc<dyn Store>,
        events: EventLog,
        quiet_hours_start: u32,
        quiet_hours_end: u32,
    ) -> Arc<Self> {
        Arc::new(Self { store, events, quiet_hours_start, quiet_hours_end })
    }

    pub async fn profile(&self, user_id: &str) -> CoreResult<AutonomyProfile> {
        self.store.load_profile(user_id).await
    }

    /// Fold one inbound message into the profile. Reply latency, message
    /// length, and tone regexes move engagement; initiative trails it.
    pub async fn record_user_message(
        &self,
        user_id: &str,
        message: &str,
        user_initiated: bool,
        response_seconds: Option<f64>,
    ) -> CoreResult<MessageSignals> {
        let mut profile = self.store.load_profile(user_id).await?;
        roll_day_counters(&mut profile);
        let now = Utc::now();

        let text = message.trim();
        let positive = POSITIVE.is_match(text);
        let cold = text.chars().count() < 12 || COLD.is_match(text);
        let muted = MUTE.is_match(text);
        let stressed = STRESS.is_match(text);
        let ignored = response_seconds.map(|s| s >= 6.0 * 3600.0).unwrap_or(false);

        let mut delta = 0.0;
        if let Some(seconds) = response_seconds {
            if seconds <= 120.0 {
                delta += 0.08;
            } else if seconds <= 600.0 {
                delta += 0.05;
            } else if seconds >= 21_600.0 {
                delta -= 0.08;
            }
        }
        let length = text.chars().count();
        if length >= 280 {
            delta += 0.06;
        } else if length >= 120 {
            delta += 0.03;
        } else if length <= 20 {
            delta -= 0.03;
        }
        if user_initiated {
            delta += 0.04;
        }
        if positive {
            delta += 0.05;
        }
        if ignored {
            delta -= 0.07;
        }
        if cold {
            delta -= 0.05;
        }
        if muted {
            delta -= 0.2;
        }

        profile.engagement_score = clamp_score(profile.engagement_score + delta);
        let target_initiative = clamp_score(profile.engagement_score * 0.75 + 0.2);
        profile.initiative_level =
            clamp_score(profile.initiative_level * 0.75 + target_initiative * 0.25);
        profile.last_user_message_at = Some(now);
        self.store.save_profile(&profile).await?;

        self.events.log(
            "autonomy_profile_updated",
            "autonomy",
            user_id,
            format!("Autonomy profile updated for user {}", user_id),
            serde_json::json!({
                "engagement_score": profile.engagement_score,
                "initiative_level": profile.initiative_level,
                "positive": positive,
                "cold": cold,
                "muted": muted,
                "ignored": ignored,
            }),
        );

        Ok(MessageSignals {
            positive,
            cold,
            muted,
            stressed,
            engagement_score: profile.engagement_score,
            initiative_level: profile.initiative_level,
        })
    }

    /// How many proactive messages this user should get today (0..=3).
    pub fn daily_target(profile: &AutonomyProfile) -> u32 {
        let engagement = profile.engagement_score;
        if engagement < 0.2 {
            return 0;
        }
        let base = if engagement < 0.6 {
            1.0
        } else if engagement < 0.8 {
            2.0
        } else {
            3.0
        };
        let scaled = (base * (0.65 + 0.5 * profile.initiative_level)).round() as u32;
        scaled.min(MAX_DAILY_PROACTIVE)
    }

    /// Gate one proactive send attempt. The returned reason is stable and
    /// ends up in the decision log.
    pub async fn can_send_proactive(
        &self,
        user_id: &str,
        timezone: &str,
    ) -> CoreResult<(bool, &'static str)> {
        let mut profile = self.store.load_profile(user_id).await?;
        roll_day_counters(&mut profile);

        if profile.engagement_score < 0.2 {
            return Ok((false, "low_engagement"));
        }
        let target = Self::daily_target(&profile);
        if profile.messages_sent_today >= target.min(MAX_DAILY_PROACTIVE) {
            return Ok((false, "daily_target_reached"));
        }
        if let Some(last) = profile.last_proactive_at {
            if Utc::now() - last < chrono::Duration::hours(2) {
                return Ok((false, "cooldown_active"));
            }
        }
        let local_hour = clock::now_in(timezone).map(|t| {
            use chrono::Timelike;
            t.hour()
        })?;
        let quiet = local_hour >= self.quiet_hours_start || local_hour < self.quiet_hours_end;
        if quiet {
            return Ok((false, "quiet_hours"));
        }
        Ok((true, "ok"))
    }

    /// Claim a daily slot; the unique key in the slot table is the source of
    /// truth, so a `None` means another runner (or an earlier send) owns it.
    pub async fn reserve_daily_slot(&self, user_id: &str, day: NaiveDate) -> CoreResult<Option<u8>> {
        self.store.reserve_daily_slot(user_id, day).await
    }

    /// Record one proactive delivery attempt: audit row plus profile counters.
    /// Three consecutive failures cost initiative.
    pub async fn register_proactive_result(
        &self,
        user_id: &str,
        slot: Option<u8>,
        kind: &str,
        mood: &str,
        sent: bool,
        error: &str,
    ) -> CoreResult<()> {
        let now = Utc::now();
        let day = now.date_naive();

        self.store
            .record_proactive_audit(&ProactiveAudit {
                user_id: user_id.to_string(),
                scheduled_at: now,
                sent_at: sent.then_some(now),
                message_kind: kind.to_string(),
                mood: mood.to_string(),
                success: sent,
                day_bucket: day,
                daily_slot: slot,
            })
            .await?;

        let mut profile = self.store.load_profile(user_id).await?;
        roll_day_counters(&mut profile);
        if sent {
            profile.messages_sent_today = (profile.messages_sent_today + 1).min(MAX_DAILY_PROACTIVE);
            profile.last_proactive_at = Some(now);
            profile.error_count_today = 0;
        } else {
            profile.error_count_today += 1;
            if profile.error_count_today >= 3 {
                profile.initiative_level = clamp_score(profile.initiative_level - 0.12);
            }
        }
        profile.proactive_day = Some(day);
        self.store.save_profile(&profile).await?;

        self.events.log(
            "proactive_outcome",
            "autonomy",
            user_id,
            format!("Proactive outcome recorded for user {}", user_id),
            serde_json::json!({
                "sent": sent,
                "error": error,
                "slot": slot,
                "messages_sent_today": profile.messages_sent_today,
                "error_count_today": profile.error_count_today,
            }),
        );
        Ok(())
    }

    /// Fold a reinforcement event into the profile, bounded per event.
    pub async fn apply_reinforcement(&self, event: &ReinforcementEvent) -> CoreResult<()> {
        let mut profile = self.store.load_profile(&event.user_id).await?;
        let step = (event.score * REINFORCEMENT_STEP).clamp(-REINFORCEMENT_STEP, REINFORCEMENT_STEP);
        profile.engagement_score = clamp_score(profile.engagement_score + step);
        profile.initiative_level = clamp_score(profile.initiative_level + step * 0.5);
        self.store.save_profile(&profile).await
    }

    /// Daily reflection: look at how outreach landed and adjust initiative.
    pub async fn generate_daily_reflection(
        &self,
        user_id: &str,
        day: NaiveDate,
    ) -> CoreResult<ReflectionEntry> {
        let mut profile = self.store.load_profile(user_id).await?;
        let (sent, failed) = self.store.proactive_day_counts(user_id, day).await?;
        let target = Self::daily_target(&profile);

        let (trend, adjustment, notes) = if sent > target && sent >= 2 {
            ("over_initiating", -0.12, "Proactive volume felt high; reducing initiative.")
        } else if sent == 0 && profile.engagement_score >= 0.45 {
            ("under_engaged", 0.08, "Low outreach despite moderate engagement; leaning in a little.")
        } else if failed >= 2 {
            ("friction", -0.08, "Delivery had friction; backing off.")
        } else {
            ("stable", 0.0, "Engagement steady.")
        };

        profile.initiative_level = clamp_score(profile.initiative_level + adjustment);
        // Slow daily decay keeps stale engagement from propping up outreach.
        profile.engagement_score = clamp_score(profile.engagement_score - 0.02);
        self.store.save_profile(&profile).await?;

        let entry = ReflectionEntry {
            user_id: user_id.to_string(),
            reflection_date: day,
            engagement_trend: trend.to_string(),
            initiative_adjustment: adjustment,
            notes: notes.to_string(),
            confidence: "medium".to_string(),
        };
        self.store.upsert_reflection(&entry).await?;

        self.events.log(
            "reflection",
            "scheduler",
            user_id,
            format!("Daily reflection generated for user {}", user_id),
            serde_json::json!({
                "date": day.format("%Y-%m-%d").to_string(),
                "engagement_trend": entry.engagement_trend,
                "initiative_adjustment": entry.initiative_adjustment,
                "sent": sent,
                "failed": failed,
            }),
        );
        Ok(entry)
    }
}

impl AutonomyService {
    /// Background proactive loop: every half hour, look for users with free
    /// daily slots and send at most one message each; after the evening
    /// cutoff, generate the day's reflection (idempotent per user-day).
    pub fn spawn_proactive_loop(
        self: &Arc<Self>,
        provider: Arc<dyn ModelProvider>,
        outbound: mpsc::Sender<OutboundMessage>,
        timezone: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1800));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        if let Err(e) = service.proactive_pass(&provider, &outbound, &timezone).await {
                            warn!(error = %e, "Proactive pass failed");
                        }
                    }
                }
            }
            info!("Proactive loop stopped");
        })
    }

    async fn proactive_pass(
        &self,
        provider: &Arc<dyn ModelProvider>,
        outbound: &mpsc::Sender<OutboundMessage>,
        timezone: &str,
    ) -> CoreResult<()> {
        let today = Utc::now().date_naive();
        let evening = {
            use chrono::Timelike;
            clock::now_in(timezone).map(|t| t.hour() >= 21).unwrap_or(false)
        };

        for user_id in self.store.list_profile_user_ids(200).await? {
            if evening {
                if let Err(e) = self.generate_daily_reflection(&user_id, today).await {
                    warn!(user_id = %user_id, error = %e, "Reflection failed");
                }
                continue;
            }

            let (ok, reason) = self.can_send_proactive(&user_id, timezone).await?;
            if !ok {
                if reason != "daily_target_reached" && reason != "low_engagement" {
                    info!(user_id = %user_id, reason, "Proactive send gated");
                }
                continue;
            }
            let Some(slot) = self.reserve_daily_slot(&user_id, today).await? else {
                continue;
            };

            let profile = self.profile(&user_id).await?;
            let mood = mood_for_day(today);
            let kind = kind_for_slot(slot, profile.engagement_score);
            let text = self.proactive_message(provider, &user_id, mood, kind).await;

            let sent = outbound
                .send(OutboundMessage {
                    user_id: user_id.clone(),
                    text,
                    reply_mode: ReplyMode::Notification,
                })
                .await
                .is_ok();
            self.register_proactive_result(
                &user_id,
                Some(slot),
                kind,
                mood,
                sent,
                if sent { "" } else { "outbound_channel_closed" },
            )
            .await?;
        }
        Ok(())
    }

    /// One proactive message, LLM-phrased with a plain fallback.
    async fn proactive_message(
        &self,
        provider: &Arc<dyn ModelProvider>,
        user_id: &str,
        mood: &str,
        kind: &str,
    ) -> String {
        let prompt = format!(
            "Write one short, warm {} message to check in with the user. Mood: {}. \
             One or two sentences, no markdown.",
            kind, mood
        );
        let result = provider
            .complete(
                &[ChatMessage::system("You are HER, a caring personal assistant."), ChatMessage::user(prompt)],
                0.9,
                200,
                Duration::from_secs(20),
            )
            .await;
        match result {
            Ok(completion) if !completion.text.trim().is_empty() => completion.text,
            _ => {
                warn!(user_id, "Proactive phrasing failed, using fallback");
                "Hi, quick check-in: how is your day going so far?".to_string()
            }
        }
    }
}

fn mood_for_day(day: NaiveDate) -> &'static str {
    const MOODS: [&str; 4] = ["curious", "playful", "reflective", "supportive"];
    MOODS[day.num_days_from_ce() as usize % MOODS.len()]
}

fn kind_for_slot(slot: u8, engagement: f64) -> &'static str {
    match (slot, engagement >= 0.7) {
        (1, _) => "checkin",
        (2, true) => "curiosity",
        (2, false) => "support",
        (_, true) => "reflection",
        (_, false) => "follow_up",
    }
}

/// Reset daily counters when the profile's day bucket is stale.
fn roll_day_counters(profile: &mut AutonomyProfile) {
    let today = Utc::now().date_naive();
    if profile.proactive_day != Some(today) {
        profile.messages_sent_today = 0;
        profile.error_count_today = 0;
        profile.proactive_day = Some(today);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ProactiveStore, ProfileStore, SqliteStore};

    async fn service() -> (Arc<AutonomyService>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let (events, _handle) = EventLog::spawn(store.clone(), 1000);
        (AutonomyService::new(store.clone(), events, 22, 8), store)
    }

    #[tokio::test]
    async fn positive_fast_replies_raise_engagement() {
        let (service, _store) = service().await;
        let signals = service
            .record_user_message(
                "u1",
                "thanks, that was exactly what I needed — really helpful!",
                true,
                Some(60.0),
            )
            .await
            .unwrap();
        assert!(signals.positive);
        assert!(!signals.cold);
        assert!(signals.engagement_score > 0.5);
    }

    #[tokio::test]
    async fn mute_requests_tank_engagement() {
        let (service, _store) = service().await;
        let signals = service
            .record_user_message("u1", "stop proactive messages please", true, None)
            .await
            .unwrap();
        assert!(signals.muted);
        assert!(signals.engagement_score < 0.5);
    }

    #[tokio::test]
    async fn scores_stay_clamped_under_repeated_updates() {
        let (service, _store) = service().await;
        for _ in 0..30 {
            let signals = service.record_user_message("u1", "ok", false, None).await.unwrap();
            assert!(signals.engagement_score >= 0.1);
            assert!(signals.initiative_level >= 0.1);
        }
        let profile = service.profile("u1").await.unwrap();
        assert!(profile.engagement_score >= 0.1);
    }

    #[test]
    fn moods_rotate_and_kinds_follow_engagement() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let moods: Vec<&str> =
            (0..4u64).map(|i| mood_for_day(day + chrono::Days::new(i))).collect();
        assert_eq!(moods.iter().collect::<std::collections::HashSet<_>>().len(), 4);

        assert_eq!(kind_for_slot(1, 0.9), "checkin");
        assert_eq!(kind_for_slot(2, 0.9), "curiosity");
        assert_eq!(kind_for_slot(2, 0.3), "support");
        assert_eq!(kind_for_slot(3, 0.3), "follow_up");
    }

    #[test]
    fn daily_target_tracks_engagement_bands() {
        let mut profile = AutonomyProfile::new("u1");
        profile.engagement_score = 0.15;
        assert_eq!(AutonomyService::daily_target(&profile), 0);

        profile.engagement_score = 0.5;
        profile.initiative_level = 0.5;
        assert_eq!(AutonomyService::daily_target(&profile), 1);

        profile.engagement_score = 0.9;
        profile.initiative_level = 0.9;
        assert_eq!(AutonomyService::daily_target(&profile), 3);
    }

    #[tokio::test]
    async fn proactive_results_move_counters_and_slots_audit() {
        let (service, store) = service().await;
        let day = Utc::now().date_naive();

        // Lift engagement above the band so the target allows sending.
        let mut profile = service.profile("u1").await.unwrap();
        profile.engagement_score = 0.9;
        profile.initiative_level = 0.9;
        store.save_profile(&profile).await.unwrap();

        let slot = service.reserve_daily_slot("u1", day).await.unwrap();
        assert_eq!(slot, Some(1));
        service
            .register_proactive_result("u1", slot, "checkin", "curious", true, "")
            .await
            .unwrap();

        let profile = service.profile("u1").await.unwrap();
        assert_eq!(profile.messages_sent_today, 1);
        assert!(profile.last_proactive_at.is_some());
        assert_eq!(store.count_proactive_sent("u1", day).await.unwrap(), 1);

        // Cooldown blocks an immediate follow-up.
        let (ok, reason) = service.can_send_proactive("u1", "UTC").await.unwrap();
        assert!(!ok);
        assert_eq!(reason, "cooldown_active");
    }

    #[tokio::test]
    async fn repeated_failures_cost_initiative() {
        let (service, _store) = service().await;
        let before = service.profile("u1").await.unwrap().initiative_level;
        for _ in 0..3 {
            service
                .register_proactive_result("u1", None, "checkin", "calm", false, "chat_not_found")
                .await
                .unwrap();
        }
        let after = service.profile("u1").await.unwrap().initiative_level;
        assert!(after < before);
    }

    #[tokio::test]
    async fn reinforcement_moves_profile_at_most_one_step() {
        let (service, store) = service().await;
        let before = service.profile("u1").await.unwrap();

        let event = ReinforcementEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_id: "u1".into(),
            score: 1.0,
            task_succeeded: true,
            concise: true,
            helpful: true,
            emotionally_aligned: true,
            reasoning: "flawless run".into(),
        };
        service.apply_reinforcement(&event).await.unwrap();

        let after = service.profile("u1").await.unwrap();
        let moved = after.engagement_score - before.engagement_score;
        assert!(moved > 0.0 && moved <= REINFORCEMENT_STEP + 1e-9);
    }

    #[tokio::test]
    async fn reflection_is_idempotent_per_day_and_decays_engagement() {
        let (service, _store) = service().await;
        let day = Utc::now().date_naive();

        let before = service.profile("u1").await.unwrap().engagement_score;
        let entry = service.generate_daily_reflection("u1", day).await.unwrap();
        assert_eq!(entry.engagement_trend, "under_engaged");

        // Upsert semantics: a second run for the same day replaces the row.
        let entry = service.generate_daily_reflection("u1", day).await.unwrap();
        assert_eq!(entry.reflection_date, day);

        let after = service.profile("u1").await.unwrap().engagement_score;
        assert!(after < before);
    }
}
