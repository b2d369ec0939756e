use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::Ordering;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use hapisync_core::{EventTime, LmsEvent, SourceSystem, StudySession, lms_to_canonical};
use hapisync_providers::{
    MemoryProvider, ProviderErrorCode, ProviderEvent, ProviderEventTime, RetryPolicy, SendUpdates,
    TokenCipher, TokenInfo, to_provider_event,
};
use hapisync_store::{
    CalendarConnection, ConnectionSyncStatus, MappingStatus, ModifiedBy, ResolutionAction,
    ResolutionStatus, RunStatus, Store, SyncToggles,
};

use super::*;
use crate::config::{ConflictPolicy, EngineConfig};
use crate::error::{RECONNECT_MESSAGE, RETRY_LATER_MESSAGE, SyncError};
use crate::webhook::{WebhookNotification, WebhookOutcome};

const USER: &str = "u-1";
const CALENDAR: &str = "primary";
const WEBHOOK_URL: &str = "https://hooks.example.edu/calendar";

struct Harness {
    store: Arc<Store>,
    memory: Arc<MemoryProvider>,
    engine: SyncEngine,
    connection: CalendarConnection,
}

fn live_tokens() -> TokenInfo {
    TokenInfo::new(
        "access-1",
        Some("refresh-1".into()),
        Some(Utc::now() + Duration::hours(1)),
    )
}

fn request(tokens: TokenInfo) -> ConnectRequest {
    ConnectRequest {
        user_id: USER.into(),
        account_email: Some("student@example.edu".into()),
        calendar_id: CALENDAR.into(),
        timezone: None,
        toggles: SyncToggles::default(),
        tokens,
    }
}

fn engine_for(store: Arc<Store>, memory: Arc<MemoryProvider>, config: EngineConfig) -> SyncEngine {
    let cipher = TokenCipher::from_base64_key(&TokenCipher::generate_key()).unwrap();
    SyncEngine::new(store, memory, cipher, config.with_retry(RetryPolicy::no_retry()))
}

async fn harness_with(config: EngineConfig, tokens: TokenInfo) -> Harness {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let memory = Arc::new(MemoryProvider::new());
    let engine = engine_for(store.clone(), memory.clone(), config);
    let connection = engine.connect(request(tokens)).await.unwrap();
    Harness {
        store,
        memory,
        engine,
        connection,
    }
}

async fn harness() -> Harness {
    harness_with(EngineConfig::default(), live_tokens()).await
}

async fn webhook_harness() -> Harness {
    harness_with(
        EngineConfig::default().with_webhook_url(WEBHOOK_URL),
        live_tokens(),
    )
    .await
}

fn at(days: i64) -> EventTime {
    EventTime::from_utc(Utc::now() + Duration::days(days))
}

fn lms(id: &str, title: &str, days: i64) -> LmsEvent {
    LmsEvent {
        id: id.into(),
        user_id: USER.into(),
        title: title.into(),
        description: Some("Bring a calculator".into()),
        course_code: Some("CS101".into()),
        location: Some("Hall A".into()),
        start: at(days),
        end: None,
        deleted: false,
        updated_at: Utc::now(),
    }
}

fn session(id: &str, title: &str, days: i64) -> StudySession {
    StudySession {
        id: id.into(),
        user_id: USER.into(),
        title: title.into(),
        notes: None,
        location: Some("Library".into()),
        start: at(days),
        end: None,
        deleted: false,
        updated_at: Utc::now(),
    }
}

fn external(summary: &str, days: i64) -> ProviderEvent {
    let start = at(days);
    ProviderEvent {
        summary: Some(summary.into()),
        start: Some(ProviderEventTime::from_event_time(&start, None)),
        end: Some(ProviderEventTime::from_event_time(&start.default_end(), None)),
        ..Default::default()
    }
}

impl Harness {
    async fn full_sync(&self) -> RunReport {
        self.engine.perform_full_sync(USER, None).await.unwrap()
    }

    fn external_id(&self, system: SourceSystem, source_id: &str) -> String {
        self.store
            .find_mapping(USER, &self.connection.id, system, source_id)
            .unwrap()
            .and_then(|m| m.external_event_id)
            .unwrap()
    }

    fn summary_of(&self, external_id: &str) -> Option<String> {
        self.memory.event(CALENDAR, external_id).and_then(|e| e.summary)
    }

    fn notification(&self) -> WebhookNotification {
        let channel = self
            .store
            .require_connection(&self.connection.id)
            .unwrap()
            .channel
            .unwrap();
        WebhookNotification::new(channel.channel_id, channel.resource_id, "exists")
    }

    async fn webhook(&self) -> RunReport {
        match self.engine.handle_webhook(&self.notification()).await.unwrap() {
            WebhookOutcome::Processed(report) => report,
            other => panic!("expected a processed notification, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn full_sync_mirrors_lms_events_once() {
    let h = harness().await;
    for (id, title, days) in [("lms-1", "Midterm", 2), ("lms-2", "Quiz", 5), ("lms-3", "Lab", 9)] {
        h.store.upsert_lms_event(&lms(id, title, days)).unwrap();
    }

    let report = h.full_sync().await;
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.success);
    assert_eq!(report.stats.events_created, 3);
    assert_eq!(report.stats.errors, 0);

    let events = h.memory.events(CALENDAR);
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(ProviderEvent::is_engine_authored));
    assert_eq!(h.summary_of(&h.external_id(SourceSystem::Lms, "lms-1")).as_deref(), Some("CS101: Midterm"));

    let again = h.full_sync().await;
    assert_eq!(again.status, RunStatus::Completed);
    assert_eq!(again.stats.writes(), 0);
    assert_eq!(h.memory.events(CALENDAR).len(), 3);
    assert_eq!(h.store.count_mappings(&h.connection.id).unwrap(), 3);

    assert!(
        h.memory
            .send_updates_seen()
            .iter()
            .all(|s| *s == SendUpdates::None)
    );
    let connection = h.store.require_connection(&h.connection.id).unwrap();
    assert_eq!(connection.last_sync_status, Some(ConnectionSyncStatus::Success));
    assert!(connection.last_sync_error.is_none());
}

#[tokio::test]
async fn leftover_external_copy_is_adopted() {
    let h = harness().await;
    let event = lms("lms-1", "Midterm", 3);
    h.store.upsert_lms_event(&event).unwrap();
    // A previous pass created the event but crashed before saving the mapping.
    let payload = to_provider_event(&lms_to_canonical(&event), None);
    let first = h.memory.insert_external(CALENDAR, payload.clone());
    let second = h.memory.insert_external(CALENDAR, payload);

    let report = h.full_sync().await;
    assert_eq!(report.stats.events_created, 0);
    assert_eq!(report.stats.conflicts, 1);
    assert_eq!(h.external_id(SourceSystem::Lms, "lms-1"), first);
    assert_eq!(h.memory.events(CALENDAR).len(), 2);

    let pending = h
        .store
        .list_conflicts(USER, Some(ResolutionStatus::Pending))
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].conflict_type, hapisync_core::ConflictType::DuplicateEvent);
    assert!(pending[0].external_snapshot.is_some());

    let again = h.full_sync().await;
    assert_eq!(again.stats.writes(), 0);
    assert_eq!(again.stats.conflicts, 0);
    assert!(h.memory.event(CALENDAR, &second).is_some());
}

#[tokio::test]
async fn internal_edits_and_deletes_are_pushed() {
    let h = harness().await;
    let mut study = session("s-1", "Group study", 4);
    h.store.upsert_study_session(&study).unwrap();
    let mut exam = lms("lms-1", "Final", 6);
    h.store.upsert_lms_event(&exam).unwrap();
    h.full_sync().await;
    let study_id = h.external_id(SourceSystem::StudySession, "s-1");
    let exam_id = h.external_id(SourceSystem::Lms, "lms-1");

    study.title = "Group study (moved)".into();
    study.location = None;
    h.store.upsert_study_session(&study).unwrap();
    exam.deleted = true;
    h.store.upsert_lms_event(&exam).unwrap();

    let report = h.full_sync().await;
    assert_eq!(report.stats.events_updated, 1);
    assert_eq!(report.stats.events_deleted, 1);

    let pushed = h.memory.event(CALENDAR, &study_id).unwrap();
    assert_eq!(pushed.summary.as_deref(), Some("Group study (moved)"));
    assert!(pushed.location.unwrap_or_default().is_empty());
    assert!(h.memory.event(CALENDAR, &exam_id).unwrap().is_cancelled());

    let mapping = h
        .store
        .find_mapping(USER, &h.connection.id, SourceSystem::Lms, "lms-1")
        .unwrap()
        .unwrap();
    assert!(mapping.is_retired());

    let again = h.full_sync().await;
    assert_eq!(again.stats.writes(), 0);
}

#[tokio::test]
async fn external_edits_follow_source_rules() {
    let h = harness().await;
    h.store.upsert_study_session(&session("s-1", "Group study", 4)).unwrap();
    h.store.upsert_lms_event(&lms("lms-1", "Final", 6)).unwrap();
    h.full_sync().await;
    let study_id = h.external_id(SourceSystem::StudySession, "s-1");
    let exam_id = h.external_id(SourceSystem::Lms, "lms-1");

    h.memory.edit_external(CALENDAR, &study_id, |e| {
        e.summary = Some("Group study with Sam".into());
    });
    h.memory.edit_external(CALENDAR, &exam_id, |e| {
        e.summary = Some("Skip this".into());
    });

    let report = h.full_sync().await;
    assert_eq!(report.stats.events_updated, 2);
    assert_eq!(report.stats.conflicts, 0);

    // Study sessions take the edit.
    let stored = h.store.get_study_session("s-1").unwrap().unwrap();
    assert_eq!(stored.title, "Group study with Sam");
    let mapping = h
        .store
        .find_mapping(USER, &h.connection.id, SourceSystem::StudySession, "s-1")
        .unwrap()
        .unwrap();
    assert_eq!(mapping.last_modified_by, Some(ModifiedBy::External));

    // LMS events are read-only: the provider copy is restored.
    assert_eq!(h.summary_of(&exam_id).as_deref(), Some("CS101: Final"));
    assert_eq!(h.store.get_lms_event("lms-1").unwrap().unwrap().title, "Final");

    let again = h.full_sync().await;
    assert_eq!(again.stats.writes(), 0);
}

#[tokio::test]
async fn external_deletes_follow_source_rules() {
    let h = harness().await;
    h.store.upsert_study_session(&session("s-1", "Group study", 4)).unwrap();
    h.store.upsert_lms_event(&lms("lms-1", "Final", 6)).unwrap();
    h.full_sync().await;
    let study_id = h.external_id(SourceSystem::StudySession, "s-1");
    let exam_id = h.external_id(SourceSystem::Lms, "lms-1");

    assert!(h.memory.delete_external(CALENDAR, &study_id));
    assert!(h.memory.delete_external(CALENDAR, &exam_id));

    let report = h.full_sync().await;
    assert_eq!(report.stats.events_deleted, 1);
    assert_eq!(report.stats.events_created, 1);

    assert!(h.store.get_study_session("s-1").unwrap().unwrap().deleted);
    let recreated = h.external_id(SourceSystem::Lms, "lms-1");
    assert_ne!(recreated, exam_id);
    assert_eq!(h.summary_of(&recreated).as_deref(), Some("CS101: Final"));
    assert_eq!(h.memory.events(CALENDAR).len(), 1);

    let again = h.full_sync().await;
    assert_eq!(again.stats.writes(), 0);
}

#[tokio::test]
async fn changes_on_both_sides_are_flagged_once() {
    let h = harness().await;
    let mut study = session("s-1", "Group study", 4);
    h.store.upsert_study_session(&study).unwrap();
    h.full_sync().await;
    let study_id = h.external_id(SourceSystem::StudySession, "s-1");

    study.title = "Internal title".into();
    h.store.upsert_study_session(&study).unwrap();
    h.memory.edit_external(CALENDAR, &study_id, |e| {
        e.summary = Some("External title".into());
    });

    let report = h.full_sync().await;
    assert_eq!(report.stats.conflicts, 1);
    assert_eq!(report.stats.writes(), 0);
    assert!(report.success);

    let pending = h
        .store
        .list_conflicts(USER, Some(ResolutionStatus::Pending))
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].conflict_type, hapisync_core::ConflictType::ContentChange);
    let mapping = h
        .store
        .find_mapping(USER, &h.connection.id, SourceSystem::StudySession, "s-1")
        .unwrap()
        .unwrap();
    assert_eq!(mapping.sync_status, MappingStatus::Conflict);

    // Neither side was touched, and the next pass does not flag it again.
    assert_eq!(h.summary_of(&study_id).as_deref(), Some("External title"));
    assert_eq!(h.store.get_study_session("s-1").unwrap().unwrap().title, "Internal title");
    let again = h.full_sync().await;
    assert_eq!(again.stats.conflicts, 0);
    assert_eq!(h.store.list_conflicts(USER, None).unwrap().len(), 1);
}

#[tokio::test]
async fn single_sided_change_is_not_a_conflict() {
    let h = harness().await;
    let mut study = session("s-1", "Group study", 4);
    h.store.upsert_study_session(&study).unwrap();
    h.full_sync().await;

    study.notes = Some("chapter 3".into());
    h.store.upsert_study_session(&study).unwrap();
    let report = h.full_sync().await;
    assert_eq!(report.stats.conflicts, 0);
    assert_eq!(report.stats.events_updated, 1);
    assert!(h.store.list_conflicts(USER, None).unwrap().is_empty());
}

#[tokio::test]
async fn human_resolution_is_applied_on_next_pass() {
    let h = harness().await;
    let mut study = session("s-1", "Group study", 4);
    h.store.upsert_study_session(&study).unwrap();
    h.full_sync().await;
    let study_id = h.external_id(SourceSystem::StudySession, "s-1");

    study.title = "Internal title".into();
    h.store.upsert_study_session(&study).unwrap();
    h.memory.edit_external(CALENDAR, &study_id, |e| {
        e.summary = Some("External title".into());
    });
    h.full_sync().await;

    let conflict = h.store.list_conflicts(USER, None).unwrap().remove(0);
    h.store
        .resolve_conflict(conflict.id, ResolutionStatus::Resolved, Some(ResolutionAction::KeptSource))
        .unwrap();

    let report = h.full_sync().await;
    assert_eq!(report.stats.events_updated, 1);
    assert_eq!(report.stats.conflicts, 0);
    assert_eq!(h.summary_of(&study_id).as_deref(), Some("Internal title"));

    let mapping = h
        .store
        .find_mapping(USER, &h.connection.id, SourceSystem::StudySession, "s-1")
        .unwrap()
        .unwrap();
    assert_eq!(mapping.sync_status, MappingStatus::Synced);
    assert_eq!(h.store.list_conflicts(USER, None).unwrap().len(), 1);

    let again = h.full_sync().await;
    assert_eq!(again.stats.writes(), 0);
}

#[tokio::test]
async fn prefer_source_policy_resolves_automatically() {
    let h = harness_with(
        EngineConfig::default().with_conflict_policy(ConflictPolicy::PreferSource),
        live_tokens(),
    )
    .await;
    let mut study = session("s-1", "Group study", 4);
    h.store.upsert_study_session(&study).unwrap();
    h.full_sync().await;
    let study_id = h.external_id(SourceSystem::StudySession, "s-1");

    study.start = at(5);
    h.store.upsert_study_session(&study).unwrap();
    h.memory.edit_external(CALENDAR, &study_id, |e| {
        let start = at(6);
        e.start = Some(ProviderEventTime::from_event_time(&start, None));
        e.end = Some(ProviderEventTime::from_event_time(&start.default_end(), None));
    });

    let report = h.full_sync().await;
    assert_eq!(report.stats.conflicts, 1);
    assert_eq!(report.stats.events_updated, 1);

    let conflicts = h.store.list_conflicts(USER, None).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].status, ResolutionStatus::AutoResolved);
    assert_eq!(conflicts[0].resolution_action, Some(ResolutionAction::KeptSource));
    assert_eq!(conflicts[0].conflict_type, hapisync_core::ConflictType::TimeChange);

    let pushed = h.memory.event(CALENDAR, &study_id).unwrap();
    let start = pushed.start.and_then(|t| t.to_event_time()).unwrap();
    assert_eq!(start.canonical_string(), study.start.canonical_string());
}

#[tokio::test]
async fn failing_event_does_not_stop_the_others() {
    let h = harness().await;
    h.store.upsert_lms_event(&lms("lms-1", "Midterm", 2)).unwrap();
    h.store.upsert_lms_event(&lms("lms-2", "Broken", 3)).unwrap();
    h.store.upsert_lms_event(&lms("lms-3", "Lab", 4)).unwrap();
    h.memory
        .fail_summary("CS101: Broken", ProviderErrorCode::ServiceUnavailable);

    let report = h.full_sync().await;
    assert_eq!(report.status, RunStatus::Partial);
    assert!(!report.success);
    assert_eq!(report.stats.events_created, 2);
    assert_eq!(report.stats.errors, 1);
    assert_eq!(report.errors, vec!["lms lms-2: service_unavailable".to_string()]);

    let mapping = h
        .store
        .find_mapping(USER, &h.connection.id, SourceSystem::Lms, "lms-2")
        .unwrap()
        .unwrap();
    assert_eq!(mapping.sync_status, MappingStatus::Error);
    assert_eq!(mapping.last_error.as_deref(), Some("service_unavailable"));
    assert!(mapping.external_event_id.is_none());

    let connection = h.store.require_connection(&h.connection.id).unwrap();
    assert_eq!(connection.last_sync_status, Some(ConnectionSyncStatus::Partial));
    assert_eq!(connection.last_sync_error.as_deref(), Some(RETRY_LATER_MESSAGE));

    let run = h.store.get_run(report.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.error_summary.as_deref(), Some("lms lms-2: service_unavailable"));
}

#[tokio::test]
async fn rejected_refresh_asks_for_reconnect() {
    let h = harness_with(
        EngineConfig::default(),
        TokenInfo::new("old", Some("refresh-1".into()), Some(Utc::now() - Duration::minutes(5))),
    )
    .await;
    h.store.upsert_lms_event(&lms("lms-1", "Midterm", 2)).unwrap();
    h.memory
        .set_refresh_error(Some(ProviderErrorCode::AuthenticationFailed));

    let report = h.full_sync().await;
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.connections[0].status, ConnectionSyncStatus::Error);
    assert_eq!(report.connections[0].error.as_deref(), Some(RECONNECT_MESSAGE));
    assert!(h.memory.events(CALENDAR).is_empty());

    let connection = h.store.require_connection(&h.connection.id).unwrap();
    assert_eq!(connection.last_sync_error.as_deref(), Some(RECONNECT_MESSAGE));
}

#[tokio::test]
async fn expired_token_is_refreshed_before_the_pass() {
    let h = harness_with(
        EngineConfig::default(),
        TokenInfo::new("old", Some("refresh-1".into()), Some(Utc::now() - Duration::minutes(5))),
    )
    .await;
    h.store.upsert_lms_event(&lms("lms-1", "Midterm", 2)).unwrap();

    let report = h.full_sync().await;
    assert!(report.success);
    assert_eq!(report.stats.events_created, 1);
    assert_eq!(h.memory.refresh_count(), 1);
}

#[tokio::test]
async fn second_full_sync_for_same_user_is_rejected() {
    let h = harness().await;
    let _running = h.engine.inner.user_locks.try_lock(USER).unwrap();
    assert!(h.engine.is_syncing(USER));

    let err = h.engine.perform_full_sync(USER, None).await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadyInProgress { .. }));
    assert!(h.engine.perform_full_sync("someone-else", None).await.is_ok());
}

#[tokio::test]
async fn lease_held_elsewhere_blocks_full_sync() {
    let h = harness_with(
        EngineConfig::default().with_lease_ttl(Duration::minutes(10)),
        live_tokens(),
    )
    .await;
    assert!(
        h.store
            .try_acquire_lease("user:u-1", "other-process", Duration::minutes(10), Utc::now())
            .unwrap()
    );
    let err = h.engine.perform_full_sync(USER, None).await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadyInProgress { .. }));

    h.store.release_lease("user:u-1", "other-process").unwrap();
    assert!(h.engine.perform_full_sync(USER, None).await.is_ok());
    // Released again after the run.
    assert!(
        h.store
            .try_acquire_lease("user:u-1", "other-process", Duration::minutes(10), Utc::now())
            .unwrap()
    );
}

#[tokio::test]
async fn cancelled_connection_stops_writing() {
    let h = harness().await;
    h.store.upsert_lms_event(&lms("lms-1", "Midterm", 2)).unwrap();
    h.engine
        .cancel_flag(&h.connection.id)
        .store(true, Ordering::SeqCst);

    let report = h.full_sync().await;
    assert_eq!(report.status, RunStatus::Failed);
    assert!(h.memory.events(CALENDAR).is_empty());
}

#[tokio::test]
async fn disabled_sources_are_left_alone() {
    let h = harness().await;
    h.store
        .set_toggles(
            &h.connection.id,
            SyncToggles {
                lms_events: false,
                ..Default::default()
            },
        )
        .unwrap();
    h.store.upsert_lms_event(&lms("lms-1", "Midterm", 2)).unwrap();
    h.store.upsert_study_session(&session("s-1", "Group study", 4)).unwrap();

    let report = h.full_sync().await;
    assert_eq!(report.stats.events_created, 1);
    assert_eq!(h.memory.events(CALENDAR).len(), 1);
}

#[tokio::test]
async fn full_sync_imports_external_events() {
    let h = harness().await;
    h.memory.insert_external(CALENDAR, external("Dentist", 3));

    let report = h.full_sync().await;
    assert_eq!(report.stats.events_created, 1);
    let imported = h.store.list_imported_events(&h.connection.id).unwrap();
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].event.title, "Dentist");

    let again = h.full_sync().await;
    assert_eq!(again.stats.writes(), 0);
}

#[tokio::test]
async fn user_without_connections_fails_the_run() {
    let h = harness().await;
    let report = h.engine.perform_full_sync("nobody", None).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(!report.success);
    assert_eq!(report.errors, vec!["no calendar connections".to_string()]);
}

#[tokio::test]
async fn progress_is_reported() {
    let h = harness().await;
    let seen = StdMutex::new(Vec::new());
    let sink = |message: &str, percent: Option<u8>| {
        seen.lock().unwrap().push((message.to_string(), percent));
    };
    h.engine.perform_full_sync(USER, Some(&sink)).await.unwrap();

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.first().and_then(|(_, p)| *p), Some(0));
    assert_eq!(seen.last().and_then(|(_, p)| *p), Some(100));
    assert!(seen.iter().any(|(m, _)| m == "Syncing primary"));
}

#[tokio::test]
async fn last_sync_status_survives_restart() {
    let h = harness().await;
    assert!(h.engine.get_last_sync_status(USER).await.unwrap().is_none());

    let report = h.full_sync().await;
    let cached = h.engine.get_last_sync_status(USER).await.unwrap().unwrap();
    assert_eq!(cached, report);

    let restarted = engine_for(h.store.clone(), h.memory.clone(), EngineConfig::default());
    let rebuilt = restarted.get_last_sync_status(USER).await.unwrap().unwrap();
    assert_eq!(rebuilt.run_id, report.run_id);
    assert_eq!(rebuilt.status, RunStatus::Completed);
    assert!(rebuilt.connections.is_empty());

    let json = serde_json::to_value(&rebuilt).unwrap();
    assert_eq!(json["status"], "completed");
    assert_eq!(json["run_type"], "full");
}

#[tokio::test]
async fn connect_registers_a_channel() {
    let h = webhook_harness().await;
    let channel = h
        .store
        .require_connection(&h.connection.id)
        .unwrap()
        .channel
        .unwrap();
    let active = h.memory.active_channels();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, channel.channel_id);
    assert!(channel.expiration.is_some());
}

#[tokio::test]
async fn webhooks_for_unknown_or_stale_channels_are_ignored() {
    let h = webhook_harness().await;
    let unknown = WebhookNotification::new("nope", "res-primary", "exists");
    assert_eq!(h.engine.handle_webhook(&unknown).await.unwrap(), WebhookOutcome::Ignored);

    let mut stale = h.notification();
    stale.resource_id = "res-other".into();
    assert_eq!(h.engine.handle_webhook(&stale).await.unwrap(), WebhookOutcome::Ignored);

    let mut handshake = h.notification();
    handshake.resource_state = "sync".into();
    assert_eq!(h.engine.handle_webhook(&handshake).await.unwrap(), WebhookOutcome::Ignored);
}

#[tokio::test]
async fn webhook_runs_incremental_import() {
    let h = webhook_harness().await;
    let id = h.memory.insert_external(CALENDAR, external("Dentist", 2));

    let report = h.webhook().await;
    assert_eq!(report.run_type, hapisync_store::RunType::Incremental);
    assert_eq!(report.stats.events_created, 1);
    assert!(h.store.require_connection(&h.connection.id).unwrap().sync_token.is_some());

    h.memory.edit_external(CALENDAR, &id, |e| {
        e.location = Some("Clinic".into());
    });
    let report = h.webhook().await;
    assert_eq!(report.stats.events_updated, 1);
    let imported = h.store.get_imported_event(&h.connection.id, &id).unwrap().unwrap();
    assert_eq!(imported.event.location.as_deref(), Some("Clinic"));

    h.memory.delete_external(CALENDAR, &id);
    let report = h.webhook().await;
    assert_eq!(report.stats.events_deleted, 1);
    assert!(h.store.get_imported_event(&h.connection.id, &id).unwrap().unwrap().deleted);

    let run = h.store.get_run(report.run_id).unwrap().unwrap();
    assert_eq!(run.connection_id.as_deref(), Some(h.connection.id.as_str()));
}

#[tokio::test]
async fn incremental_skips_engine_authored_events() {
    let h = webhook_harness().await;
    h.store.upsert_lms_event(&lms("lms-1", "Midterm", 2)).unwrap();
    h.full_sync().await;

    let report = h.webhook().await;
    assert_eq!(report.stats.writes(), 0);
    assert!(h.store.list_imported_events(&h.connection.id).unwrap().is_empty());
}

#[tokio::test]
async fn expired_sync_token_falls_back_to_window() {
    let h = webhook_harness().await;
    h.memory.insert_external(CALENDAR, external("Dentist", 2));
    h.webhook().await;

    h.memory.expire_sync_tokens();
    h.memory.insert_external(CALENDAR, external("Gym", 3));
    let report = h.webhook().await;
    assert!(report.success);
    assert_eq!(report.stats.events_created, 1);
    assert_eq!(h.store.list_imported_events(&h.connection.id).unwrap().len(), 2);
}

#[tokio::test]
async fn disconnect_stops_channel_and_drops_mappings() {
    let h = webhook_harness().await;
    h.store.upsert_lms_event(&lms("lms-1", "Midterm", 2)).unwrap();
    h.full_sync().await;
    assert_eq!(h.store.count_mappings(&h.connection.id).unwrap(), 1);

    assert!(h.engine.disconnect(&h.connection.id).await.unwrap());
    assert!(h.memory.active_channels().is_empty());
    assert!(h.store.get_connection(&h.connection.id).unwrap().is_none());
    assert_eq!(h.store.count_mappings(&h.connection.id).unwrap(), 0);

    assert!(!h.engine.disconnect(&h.connection.id).await.unwrap());
    let err = h.engine.run_incremental(&h.connection.id).await.unwrap_err();
    assert!(matches!(err, SyncError::ConnectionNotFound(_)));
}

#[tokio::test]
async fn expiring_channels_are_renewed() {
    let h = harness_with(
        EngineConfig::default()
            .with_webhook_url(WEBHOOK_URL)
            .with_channel_renewal(StdDuration::from_secs(3600), Duration::hours(24)),
        live_tokens(),
    )
    .await;
    let before = h.notification();

    let summary = h.engine.renew_channels().await.unwrap();
    assert_eq!(summary, RenewalSummary { renewed: 1, failed: 0 });

    let after = h.notification();
    assert_ne!(after.channel_id, before.channel_id);
    let active = h.memory.active_channels();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, after.channel_id);

    // Notifications on the replaced channel are discarded.
    assert_eq!(h.engine.handle_webhook(&before).await.unwrap(), WebhookOutcome::Ignored);
}

#[tokio::test]
async fn renewal_is_a_no_op_without_webhook_url() {
    let h = harness().await;
    assert_eq!(h.engine.renew_channels().await.unwrap(), RenewalSummary::default());
    assert!(h.memory.active_channels().is_empty());
}

#[tokio::test]
async fn sync_all_covers_every_connected_user() {
    let h = harness().await;
    h.engine
        .connect(ConnectRequest {
            user_id: "u-2".into(),
            ..request(live_tokens())
        })
        .await
        .unwrap();

    let reports = h.engine.sync_all().await.unwrap();
    let mut users: Vec<_> = reports.iter().map(|r| r.user_id.as_str()).collect();
    users.sort_unstable();
    assert_eq!(users, vec!["u-1", "u-2"]);
}

#[tokio::test]
async fn renewal_racing_connect_leaves_one_channel() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let memory = Arc::new(MemoryProvider::new());
    memory.set_latency(StdDuration::from_millis(20));
    let engine = engine_for(
        store.clone(),
        memory.clone(),
        EngineConfig::default().with_webhook_url(WEBHOOK_URL),
    );

    let (connected, summary) = tokio::join!(engine.connect(request(live_tokens())), async {
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        engine.renew_channels().await
    });
    let connection = connected.unwrap();
    assert_eq!(summary.unwrap().failed, 0);

    let channel = store.require_connection(&connection.id).unwrap().channel.unwrap();
    let active = memory.active_channels();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, channel.channel_id);

    let deadline = Utc::now() + engine.config().renewal_buffer;
    assert!(!engine.renew_channel(&connection.id, deadline).await.unwrap());
    assert_eq!(memory.active_channels().len(), 1);
}

#[tokio::test]
async fn renewal_racing_disconnect_leaves_no_channel() {
    let h = harness_with(
        EngineConfig::default()
            .with_webhook_url(WEBHOOK_URL)
            .with_channel_renewal(StdDuration::from_secs(3600), Duration::hours(24)),
        live_tokens(),
    )
    .await;
    h.memory.set_latency(StdDuration::from_millis(20));

    let (removed, summary) = tokio::join!(h.engine.disconnect(&h.connection.id), h.engine.renew_channels());
    assert!(removed.unwrap());
    assert_eq!(summary.unwrap().failed, 0);
    assert!(h.memory.active_channels().is_empty());

    let deadline = Utc::now() + Duration::hours(24);
    assert!(!h.engine.renew_channel(&h.connection.id, deadline).await.unwrap());
    assert!(h.memory.active_channels().is_empty());
}

#[tokio::test]
async fn channel_that_cannot_be_recorded_is_stopped() {
    let h = webhook_harness().await;
    let before: Vec<String> = h.memory.active_channels().into_iter().map(|c| c.id).collect();
    let stale = h.store.require_connection(&h.connection.id).unwrap();
    h.store.delete_connection(&h.connection.id).unwrap();

    let err = h.engine.register_channel(&stale).await.unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::NotFound { .. })));
    let after: Vec<String> = h.memory.active_channels().into_iter().map(|c| c.id).collect();
    assert_eq!(after, before);
}

#[tokio::test]
async fn lease_is_renewed_during_a_long_sync() {
    let ttl = Duration::milliseconds(600);
    let h = harness_with(EngineConfig::default().with_lease_ttl(ttl), live_tokens()).await;
    for n in 0..8 {
        h.store
            .upsert_lms_event(&lms(&format!("lms-{n}"), "Quiz", n + 1))
            .unwrap();
    }
    h.memory.set_latency(StdDuration::from_millis(150));

    let contender = async {
        let mut refused = 0;
        for _ in 0..10 {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            if !h
                .store
                .try_acquire_lease("user:u-1", "other-process", ttl, Utc::now())
                .unwrap()
            {
                refused += 1;
            }
        }
        refused
    };
    let (report, refused) = tokio::join!(h.engine.perform_full_sync(USER, None), contender);
    assert_eq!(refused, 10);

    let report = report.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.events_created, 8);
}

#[tokio::test]
async fn lost_lease_stops_the_run() {
    let ttl = Duration::milliseconds(600);
    let h = harness_with(EngineConfig::default().with_lease_ttl(ttl), live_tokens()).await;
    for n in 0..8 {
        h.store
            .upsert_lms_event(&lms(&format!("lms-{n}"), "Quiz", n + 1))
            .unwrap();
    }
    h.memory.set_latency(StdDuration::from_millis(100));

    let takeover = async {
        tokio::time::sleep(StdDuration::from_millis(250)).await;
        h.store
            .release_lease("user:u-1", &h.engine.inner.instance_id)
            .unwrap();
        assert!(
            h.store
                .try_acquire_lease("user:u-1", "other-process", Duration::minutes(10), Utc::now())
                .unwrap()
        );
    };
    let (report, ()) = tokio::join!(h.engine.perform_full_sync(USER, None), takeover);

    let report = report.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.errors.iter().any(|e| e.contains("lease")));
    assert!(h.memory.events(CALENDAR).len() < 8);
    assert_eq!(
        h.store.get_run(report.run_id).unwrap().unwrap().status,
        RunStatus::Failed
    );

    // The new holder keeps the lease.
    assert!(
        !h.store
            .try_acquire_lease("user:u-1", &h.engine.inner.instance_id, ttl, Utc::now())
            .unwrap()
    );
}
