//! One pass over one connection.
//!
//! A full pass lists the external calendar once, reconciles every internal
//! event of the enabled sources against its mapping, then imports external
//! events. An incremental pass only runs the import half, preferably from
//! the stored sync token.
//!
//! Failures on a single event are recorded on its mapping and counted; they
//! never abort the pass. Cancellation, a lost sync lease and credential
//! failures do.
//!
//! Datastore work runs on the blocking pool through [`Store::call`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use hapisync_core::transform::{from_snapshot, to_snapshot};
use hapisync_core::{
    CanonicalEvent, ConflictType, ContentHash, SideChange, SourceSystem, TimeWindow,
    WriteOperation, classify_conflict, content_hash, diff, ensure_writable, lms_to_canonical,
    study_session_to_canonical,
};
use hapisync_providers::{
    AccessToken, EventList, ListOptions, ProviderError, ProviderErrorCode, ProviderEvent,
    SendUpdates, from_provider_event, to_provider_event,
};
use hapisync_store::{
    CalendarConnection, EventMapping, ImportedEvent, MappingStatus, ModifiedBy, NewConflict,
    ResolutionAction, ResolutionStatus, Store, StoreResult, SyncStats,
};
use tracing::{debug, info, warn};

use super::EngineInner;
use crate::config::ConflictPolicy;
use crate::error::{SyncError, SyncResult};

/// Counters and per-event messages of a finished pass.
#[derive(Debug, Default)]
pub(crate) struct PassOutcome {
    pub(crate) stats: SyncStats,
    pub(crate) errors: Vec<String>,
}

/// An internal event of any source, normalised.
struct SourceItem {
    system: SourceSystem,
    id: String,
    event: CanonicalEvent,
    deleted: bool,
}

/// The external listing of a full pass.
#[derive(Default)]
struct RemoteIndex {
    by_id: HashMap<String, ProviderEvent>,
    /// Live engine-tagged events that no mapping points at, by the internal
    /// event they were created from.
    orphans: HashMap<(SourceSystem, String), Vec<String>>,
    /// External ids owned by mappings of internal events.
    mirrored: HashSet<String>,
}

impl RemoteIndex {
    fn build(events: &[ProviderEvent], mappings: &[EventMapping]) -> Self {
        let mirrored: HashSet<String> = mappings
            .iter()
            .filter(|m| m.source_system != SourceSystem::External)
            .filter_map(|m| m.external_event_id.clone())
            .collect();
        let mut index = Self {
            mirrored,
            ..Default::default()
        };
        for event in events {
            let Some(id) = event.id.clone() else {
                continue;
            };
            if !event.is_cancelled()
                && !index.mirrored.contains(&id)
                && let Some((system, source_id)) = event.source_key()
            {
                index
                    .orphans
                    .entry((system, source_id.to_string()))
                    .or_default()
                    .push(id.clone());
            }
            index.by_id.insert(id, event.clone());
        }
        index
    }
}

/// How a change on both sides gets settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Flag,
    KeepSource { auto: bool },
    KeepExternal { auto: bool },
    /// A human dismissed the conflict: both current versions become the
    /// new baseline.
    AcceptBoth,
}

/// The external side of a mapping as seen in the current listing.
struct ExternalSide {
    change: SideChange,
    event: Option<CanonicalEvent>,
}

pub(crate) struct ConnectionPass<'a> {
    engine: &'a EngineInner,
    connection: &'a CalendarConnection,
    token: AccessToken,
    cancel: Arc<AtomicBool>,
    /// Set when the user's sync lease could not be renewed.
    lease_lost: Arc<AtomicBool>,
    now: DateTime<Utc>,
    outcome: PassOutcome,
}

impl<'a> ConnectionPass<'a> {
    /// Resolves credentials for the connection. Fails if they are unusable.
    pub(crate) async fn start(
        engine: &'a EngineInner,
        connection: &'a CalendarConnection,
        cancel: Arc<AtomicBool>,
        lease_lost: Arc<AtomicBool>,
    ) -> SyncResult<Self> {
        let pass = Self {
            engine,
            connection,
            token: engine.tokens.access_token(connection).await?,
            cancel,
            lease_lost,
            now: Utc::now(),
            outcome: PassOutcome::default(),
        };
        pass.check_cancelled()?;
        Ok(pass)
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled {
                connection_id: self.connection.id.clone(),
            });
        }
        if self.lease_lost.load(Ordering::SeqCst) {
            return Err(SyncError::LeaseLost {
                user_id: self.user_id().to_string(),
            });
        }
        Ok(())
    }

    async fn db<T, F>(&self, work: F) -> SyncResult<T>
    where
        F: FnOnce(&Store) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.engine.store.call(work).await?)
    }

    /// Upserts a copy of the mapping and returns its row id.
    async fn save(&self, mapping: &EventMapping) -> SyncResult<i64> {
        let mapping = mapping.clone();
        self.db(move |s| s.upsert_mapping(&mapping)).await
    }

    async fn find_mapping(&self, system: SourceSystem, source_id: &str) -> SyncResult<Option<EventMapping>> {
        let user_id = self.user_id().to_string();
        let connection_id = self.connection.id.clone();
        let source_id = source_id.to_string();
        self.db(move |s| s.find_mapping(&user_id, &connection_id, system, &source_id))
            .await
    }

    async fn save_sync_token(&self, sync_token: Option<&str>) -> SyncResult<()> {
        let connection_id = self.connection.id.clone();
        let sync_token = sync_token.map(str::to_string);
        self.db(move |s| s.set_sync_token(&connection_id, sync_token.as_deref()))
            .await
    }

    async fn mappings(&self) -> SyncResult<Vec<EventMapping>> {
        let connection_id = self.connection.id.clone();
        self.db(move |s| s.list_mappings(&connection_id)).await
    }

    fn user_id(&self) -> &str {
        &self.connection.user_id
    }

    fn calendar_id(&self) -> &str {
        &self.connection.calendar_id
    }

    /// Both directions over the full window.
    pub(crate) async fn full(mut self) -> SyncResult<PassOutcome> {
        let window = self.engine.config.full_window(self.now);
        let listing = self.list_window(window).await?;
        let mappings = self.mappings().await?;
        let mut remote = RemoteIndex::build(&listing.events, &mappings);
        debug!(
            connection_id = %self.connection.id,
            remote = remote.by_id.len(),
            mappings = mappings.len(),
            "full pass listing loaded"
        );

        let mut items = Vec::new();
        let toggles = self.connection.toggles;
        if toggles.enabled(SourceSystem::Lms) {
            let user_id = self.user_id().to_string();
            let events = self.db(move |s| s.list_lms_events(&user_id, &window)).await?;
            for event in events {
                items.push(SourceItem {
                    system: SourceSystem::Lms,
                    event: lms_to_canonical(&event),
                    id: event.id,
                    deleted: event.deleted,
                });
            }
        }
        if toggles.enabled(SourceSystem::StudySession) {
            let user_id = self.user_id().to_string();
            let sessions = self.db(move |s| s.list_study_sessions(&user_id, &window)).await?;
            for session in sessions {
                items.push(SourceItem {
                    system: SourceSystem::StudySession,
                    event: study_session_to_canonical(&session),
                    id: session.id,
                    deleted: session.deleted,
                });
            }
        }

        for item in &items {
            self.check_cancelled()?;
            let result = self.reconcile(item, &mut remote).await;
            self.isolate(item.system, &item.id, result).await?;
        }

        if toggles.enabled(SourceSystem::External) {
            self.import_all(&listing.events, &remote.mirrored).await?;
        }
        if let Some(token) = listing.next_sync_token.as_deref() {
            self.save_sync_token(Some(token)).await?;
        }
        Ok(self.outcome)
    }

    /// External-to-internal only, from the sync token or the incremental
    /// window.
    ///
    /// Engine-authored events are skipped here; edits made to them on the
    /// provider side are reconciled by the next full pass.
    pub(crate) async fn incremental(mut self) -> SyncResult<PassOutcome> {
        let listing = match self.connection.sync_token.clone() {
            Some(sync_token) => {
                let options = ListOptions::new().with_sync_token(sync_token);
                match self
                    .engine
                    .provider
                    .list_events(&self.token, self.calendar_id(), options)
                    .await
                {
                    Err(err) if err.code() == ProviderErrorCode::SyncTokenExpired => {
                        info!(connection_id = %self.connection.id, "sync token expired, listing the window");
                        self.save_sync_token(None).await?;
                        self.list_window(self.engine.config.incremental_window(self.now))
                            .await?
                    }
                    other => other?,
                }
            }
            None => {
                self.list_window(self.engine.config.incremental_window(self.now))
                    .await?
            }
        };

        if self.connection.toggles.enabled(SourceSystem::External) {
            let mirrored: HashSet<String> = self
                .mappings()
                .await?
                .into_iter()
                .filter(|m| m.source_system != SourceSystem::External)
                .filter_map(|m| m.external_event_id)
                .collect();
            self.import_all(&listing.events, &mirrored).await?;
        }
        if let Some(token) = listing.next_sync_token.as_deref() {
            self.save_sync_token(Some(token)).await?;
        }
        Ok(self.outcome)
    }

    async fn list_window(&self, window: TimeWindow) -> SyncResult<EventList> {
        let options = ListOptions::new()
            .with_time_window(window)
            .with_show_deleted(true);
        Ok(self
            .engine
            .provider
            .list_events(&self.token, self.calendar_id(), options)
            .await?)
    }

    /// Turns a per-event failure into a counted error on the mapping.
    /// Cancellation, lease loss and credential failures propagate.
    async fn isolate(&mut self, system: SourceSystem, source_id: &str, result: SyncResult<()>) -> SyncResult<()> {
        let err = match result {
            Ok(()) => return Ok(()),
            Err(err @ (SyncError::Cancelled { .. } | SyncError::LeaseLost { .. })) => return Err(err),
            Err(err) if err.requires_reconnect() => return Err(err),
            Err(err) => err,
        };
        let label = error_label(&err);
        warn!(
            connection_id = %self.connection.id,
            source_system = %system,
            source_id,
            error = %err,
            "event sync failed"
        );
        self.outcome.stats.errors += 1;
        self.outcome.errors.push(format!("{system} {source_id}: {label}"));

        let recorded = match self.find_mapping(system, source_id).await {
            Ok(Some(mapping)) => {
                self.db(move |s| s.set_mapping_status(mapping.id, MappingStatus::Error, Some(label)))
                    .await
            }
            Ok(None) => {
                let mut mapping = EventMapping::new(self.user_id(), &self.connection.id, system, source_id);
                mapping.sync_status = MappingStatus::Error;
                mapping.last_error = Some(label.to_string());
                self.save(&mapping).await.map(|_| ())
            }
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            warn!(source_id, error = %e, "failed to record event error on mapping");
        }
        Ok(())
    }

    async fn reconcile(&mut self, item: &SourceItem, remote: &mut RemoteIndex) -> SyncResult<()> {
        let Some(mut mapping) = self.find_mapping(item.system, &item.id).await? else {
            if item.deleted {
                return Ok(());
            }
            return self.create_or_adopt(item, remote).await;
        };

        let mapping_id = mapping.id;
        if mapping.sync_status == MappingStatus::Conflict
            && self
                .db(move |s| s.pending_conflict_for_mapping(mapping_id))
                .await?
                .is_some()
        {
            debug!(mapping_id = mapping.id, "mapping blocked by a pending conflict");
            return Ok(());
        }

        if mapping.is_retired() || mapping.external_deleted || mapping.external_event_id.is_none() {
            if item.deleted {
                if !mapping.hapi_deleted {
                    mapping.hapi_deleted = true;
                    mapping.sync_status = MappingStatus::Synced;
                    mapping.last_error = None;
                    self.save(&mapping).await?;
                }
                return Ok(());
            }
            // Restored internally, or never mirrored: start over.
            mapping.external_event_id = None;
            mapping.hapi_deleted = false;
            mapping.external_deleted = false;
            return self.create(item, mapping).await;
        }
        let Some(external_id) = mapping.external_event_id.clone() else {
            return Ok(());
        };

        let internal = if item.deleted {
            SideChange::Deleted
        } else {
            side_change(&item.event, mapping.hapi_version_hash.as_ref(), mapping.hapi_snapshot.as_deref())
        };
        let external = match remote.by_id.get(&external_id) {
            // Outside the listing window: nothing observed.
            None => ExternalSide {
                change: SideChange::Unchanged,
                event: None,
            },
            Some(event) if event.is_cancelled() => ExternalSide {
                change: SideChange::Deleted,
                event: None,
            },
            Some(event) => match from_provider_event(event) {
                Some(observed) => ExternalSide {
                    change: side_change(
                        &observed,
                        mapping.external_version_hash.as_ref(),
                        mapping.external_snapshot.as_deref(),
                    ),
                    event: Some(observed),
                },
                None => ExternalSide {
                    change: SideChange::Unchanged,
                    event: None,
                },
            },
        };

        match (&internal, &external.change) {
            (SideChange::Unchanged, SideChange::Unchanged) => {
                if mapping.sync_status != MappingStatus::Synced {
                    mapping.sync_status = MappingStatus::Synced;
                    mapping.last_error = None;
                    self.save(&mapping).await?;
                }
                Ok(())
            }
            (SideChange::Modified(_), SideChange::Unchanged) => {
                match self.push_update(item, &mut mapping, &external_id).await {
                    Err(SyncError::Provider(err)) if err.is_not_found() => {
                        let external = ExternalSide {
                            change: SideChange::Deleted,
                            event: None,
                        };
                        self.settle_conflict(item, mapping, &internal, &external).await
                    }
                    other => other,
                }
            }
            (SideChange::Deleted, SideChange::Unchanged) => {
                self.push_delete(&mut mapping, &external_id).await
            }
            (SideChange::Deleted, SideChange::Deleted) => {
                mapping.hapi_deleted = true;
                mapping.external_deleted = true;
                mapping.sync_status = MappingStatus::Synced;
                mapping.last_error = None;
                self.save(&mapping).await?;
                Ok(())
            }
            (SideChange::Unchanged, SideChange::Modified(_)) => match &external.event {
                Some(observed) => self.pull_update(item, &mut mapping, &external_id, observed).await,
                None => Ok(()),
            },
            (SideChange::Unchanged, SideChange::Deleted) => self.pull_delete(item, mapping).await,
            _ => {
                if let Some(observed) = &external.event
                    && !item.deleted
                    && content_hash(observed) == content_hash(&item.event)
                {
                    debug!(mapping_id = mapping.id, "both sides converged");
                    return self
                        .mark_synced(&mut mapping, &item.event, observed, ModifiedBy::External)
                        .await;
                }
                self.settle_conflict(item, mapping, &internal, &external).await
            }
        }
    }

    /// Maps a new internal event, adopting an engine-tagged external copy
    /// left behind by an interrupted pass before creating a new one.
    async fn create_or_adopt(&mut self, item: &SourceItem, remote: &mut RemoteIndex) -> SyncResult<()> {
        let mapping = EventMapping::new(self.user_id(), &self.connection.id, item.system, &item.id);
        let mut candidates = remote
            .orphans
            .remove(&(item.system, item.id.clone()))
            .unwrap_or_default()
            .into_iter();
        let Some(adopted_id) = candidates.next() else {
            return self.create(item, mapping).await;
        };

        let mut mapping = mapping;
        mapping.external_event_id = Some(adopted_id.clone());
        remote.mirrored.insert(adopted_id.clone());
        let existing = remote.by_id.get(&adopted_id).and_then(from_provider_event);
        let current = match existing {
            Some(existing) if content_hash(&existing) == content_hash(&item.event) => existing,
            _ => {
                self.check_cancelled()?;
                let returned = self
                    .engine
                    .provider
                    .patch_event(
                        &self.token,
                        self.calendar_id(),
                        &adopted_id,
                        &patch_payload(&item.event, self.connection.timezone.as_deref()),
                        SendUpdates::None,
                    )
                    .await?;
                self.outcome.stats.events_updated += 1;
                observed(&returned, &item.event)
            }
        };
        self.mark_synced(&mut mapping, &item.event, &current, ModifiedBy::Hapi)
            .await?;
        info!(
            connection_id = %self.connection.id,
            source_id = %item.id,
            external_event_id = %adopted_id,
            "adopted existing external event"
        );

        for duplicate in candidates {
            warn!(
                connection_id = %self.connection.id,
                source_id = %item.id,
                external_event_id = %duplicate,
                "duplicate external copy of internal event"
            );
            remote.mirrored.insert(duplicate.clone());
            let external_snapshot = remote
                .by_id
                .get(&duplicate)
                .and_then(from_provider_event)
                .map(|event| self.snapshot(&event))
                .transpose()?;
            let conflict = NewConflict {
                mapping_id: mapping.id,
                conflict_type: ConflictType::DuplicateEvent,
                hapi_snapshot: Some(self.snapshot(&item.event)?),
                external_snapshot,
                status: ResolutionStatus::Pending,
                resolution_action: None,
            };
            self.db(move |s| s.record_conflict(&conflict)).await?;
            self.outcome.stats.conflicts += 1;
        }
        Ok(())
    }

    async fn create(&mut self, item: &SourceItem, mut mapping: EventMapping) -> SyncResult<()> {
        self.check_cancelled()?;
        let returned = self
            .engine
            .provider
            .create_event(
                &self.token,
                self.calendar_id(),
                &to_provider_event(&item.event, self.connection.timezone.as_deref()),
                SendUpdates::None,
            )
            .await?;
        let external_id = returned
            .id
            .clone()
            .ok_or_else(|| ProviderError::invalid_response("created event has no id"))?;
        mapping.external_event_id = Some(external_id);
        mapping.external_deleted = false;
        self.mark_synced(&mut mapping, &item.event, &observed(&returned, &item.event), ModifiedBy::Hapi)
            .await?;
        self.outcome.stats.events_created += 1;
        Ok(())
    }

    async fn push_update(&mut self, item: &SourceItem, mapping: &mut EventMapping, external_id: &str) -> SyncResult<()> {
        self.check_cancelled()?;
        let returned = self
            .engine
            .provider
            .patch_event(
                &self.token,
                self.calendar_id(),
                external_id,
                &patch_payload(&item.event, self.connection.timezone.as_deref()),
                SendUpdates::None,
            )
            .await?;
        self.mark_synced(mapping, &item.event, &observed(&returned, &item.event), ModifiedBy::Hapi)
            .await?;
        self.outcome.stats.events_updated += 1;
        Ok(())
    }

    /// Full replace, used to re-assert the internal version.
    async fn replace(&mut self, item: &SourceItem, mapping: &mut EventMapping, external_id: &str) -> SyncResult<()> {
        self.check_cancelled()?;
        let returned = self
            .engine
            .provider
            .update_event(
                &self.token,
                self.calendar_id(),
                external_id,
                &to_provider_event(&item.event, self.connection.timezone.as_deref()),
                SendUpdates::None,
            )
            .await?;
        self.mark_synced(mapping, &item.event, &observed(&returned, &item.event), ModifiedBy::Hapi)
            .await?;
        self.outcome.stats.events_updated += 1;
        Ok(())
    }

    async fn push_delete(&mut self, mapping: &mut EventMapping, external_id: &str) -> SyncResult<()> {
        self.check_cancelled()?;
        match self
            .engine
            .provider
            .delete_event(&self.token, self.calendar_id(), external_id, SendUpdates::None)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(external_event_id = external_id, "external event already gone");
            }
            Err(err) => return Err(err.into()),
        }
        mapping.hapi_deleted = true;
        mapping.external_deleted = true;
        mapping.sync_status = MappingStatus::Synced;
        mapping.last_error = None;
        mapping.last_modified_by = Some(ModifiedBy::Hapi);
        mapping.last_synced_at = Some(self.now);
        self.save(mapping).await?;
        self.outcome.stats.events_deleted += 1;
        Ok(())
    }

    /// The external copy was edited. Editable sources take the edit;
    /// read-only sources get their version written back.
    async fn pull_update(
        &mut self,
        item: &SourceItem,
        mapping: &mut EventMapping,
        external_id: &str,
        external: &CanonicalEvent,
    ) -> SyncResult<()> {
        if !item.system.editable() {
            debug!(source_id = %item.id, "external edit of read-only event, re-asserting");
            return self.replace(item, mapping, external_id).await;
        }
        let internal = self.apply_external_edit(item, external).await?;
        self.mark_synced(mapping, &internal, external, ModifiedBy::External)
            .await?;
        self.outcome.stats.events_updated += 1;
        Ok(())
    }

    /// The external copy was deleted. Deletable sources follow; read-only
    /// sources get a new external copy.
    async fn pull_delete(&mut self, item: &SourceItem, mut mapping: EventMapping) -> SyncResult<()> {
        if !item.system.deletable() {
            debug!(source_id = %item.id, "external delete of read-only event, re-creating");
            mapping.external_event_id = None;
            return self.create(item, mapping).await;
        }
        self.apply_external_delete(item, &mut mapping).await
    }

    async fn apply_external_edit(&self, item: &SourceItem, external: &CanonicalEvent) -> SyncResult<CanonicalEvent> {
        ensure_writable(item.system, WriteOperation::Update)?;
        let system = item.system;
        let source_id = item.id.clone();
        let edit = external.clone();
        let session = self
            .db(move |s| {
                s.apply_external_edit(system, &source_id, &edit, Utc::now())?;
                s.get_study_session(&source_id)
            })
            .await?
            .ok_or_else(|| SyncError::sync(&self.connection.id, format!("study session {} vanished", item.id)))?;
        Ok(study_session_to_canonical(&session))
    }

    async fn apply_external_delete(&mut self, item: &SourceItem, mapping: &mut EventMapping) -> SyncResult<()> {
        ensure_writable(item.system, WriteOperation::Delete)?;
        if !item.deleted {
            let system = item.system;
            let source_id = item.id.clone();
            self.db(move |s| s.apply_external_delete(system, &source_id, Utc::now()))
                .await?;
        }
        mapping.hapi_deleted = true;
        mapping.external_deleted = true;
        mapping.sync_status = MappingStatus::Synced;
        mapping.last_error = None;
        mapping.last_modified_by = Some(ModifiedBy::External);
        mapping.last_synced_at = Some(self.now);
        self.save(mapping).await?;
        self.outcome.stats.events_deleted += 1;
        Ok(())
    }

    /// Both sides changed since the last sync.
    async fn settle_conflict(
        &mut self,
        item: &SourceItem,
        mut mapping: EventMapping,
        internal: &SideChange,
        external: &ExternalSide,
    ) -> SyncResult<()> {
        let conflict_type = classify_conflict(internal, &external.change);
        let decision = self.decide(&mapping, item.system).await?;
        debug!(
            mapping_id = mapping.id,
            conflict_type = %conflict_type,
            ?decision,
            "both sides changed"
        );

        let action = match decision {
            Decision::Flag => {
                mapping.sync_status = MappingStatus::Conflict;
                mapping.last_error = None;
                mapping.id = self.save(&mapping).await?;
                let mapping_id = mapping.id;
                if self
                    .db(move |s| s.pending_conflict_for_mapping(mapping_id))
                    .await?
                    .is_none()
                {
                    self.record_conflict(&mapping, item, external, conflict_type, ResolutionStatus::Pending, None)
                        .await?;
                    self.outcome.stats.conflicts += 1;
                    info!(
                        connection_id = %self.connection.id,
                        mapping_id = mapping.id,
                        conflict_type = %conflict_type,
                        "conflict flagged for review"
                    );
                }
                return Ok(());
            }
            Decision::AcceptBoth => {
                match (&external.event, item.deleted) {
                    (Some(observed), false) => {
                        return self
                            .mark_synced(&mut mapping, &item.event, observed, ModifiedBy::External)
                            .await;
                    }
                    // A deletion cannot be accepted alongside the other
                    // version; the internal side is authoritative.
                    _ => None,
                }
            }
            Decision::KeepSource { auto } => auto.then_some(ResolutionAction::KeptSource),
            Decision::KeepExternal { auto } => auto.then_some(ResolutionAction::KeptExternal),
        };

        let keep_external = matches!(decision, Decision::KeepExternal { .. });
        if keep_external {
            self.keep_external(item, &mut mapping, external).await?;
        } else {
            self.keep_source(item, &mut mapping).await?;
        }

        if let Some(action) = action {
            self.record_conflict(&mapping, item, external, conflict_type, ResolutionStatus::AutoResolved, Some(action))
                .await?;
            self.outcome.stats.conflicts += 1;
            info!(
                connection_id = %self.connection.id,
                mapping_id = mapping.id,
                conflict_type = %conflict_type,
                action = %action,
                "conflict resolved by policy"
            );
        }
        Ok(())
    }

    /// A human decision on the mapping's last conflict wins over the policy.
    async fn decide(&self, mapping: &EventMapping, system: SourceSystem) -> SyncResult<Decision> {
        let latest = if mapping.id != 0 && mapping.sync_status == MappingStatus::Pending {
            let mapping_id = mapping.id;
            self.db(move |s| s.latest_conflict_for_mapping(mapping_id)).await?
        } else {
            None
        };
        if let Some(latest) = latest
            && matches!(latest.status, ResolutionStatus::Resolved | ResolutionStatus::Ignored)
        {
            return Ok(match latest.resolution_action {
                Some(ResolutionAction::KeptSource) => Decision::KeepSource { auto: false },
                Some(ResolutionAction::KeptExternal) => Decision::KeepExternal { auto: false },
                Some(ResolutionAction::Dismissed) | None => Decision::AcceptBoth,
            });
        }
        Ok(match self.engine.config.conflict_policy {
            ConflictPolicy::Flag => Decision::Flag,
            ConflictPolicy::PreferSource => Decision::KeepSource { auto: true },
            ConflictPolicy::PreferExternal if system.editable() && system.deletable() => {
                Decision::KeepExternal { auto: true }
            }
            ConflictPolicy::PreferExternal => Decision::Flag,
        })
    }

    /// Writes the internal version over whatever the provider holds.
    async fn keep_source(&mut self, item: &SourceItem, mapping: &mut EventMapping) -> SyncResult<()> {
        let Some(external_id) = mapping.external_event_id.clone() else {
            return self.create(item, mapping.clone()).await;
        };
        if item.deleted {
            return self.push_delete(mapping, &external_id).await;
        }
        match self.replace(item, mapping, &external_id).await {
            Err(SyncError::Provider(err)) if err.is_not_found() => {
                mapping.external_event_id = None;
                self.create(item, mapping.clone()).await
            }
            other => other,
        }
    }

    /// Applies the provider version to the internal source.
    async fn keep_external(
        &mut self,
        item: &SourceItem,
        mapping: &mut EventMapping,
        external: &ExternalSide,
    ) -> SyncResult<()> {
        match &external.event {
            Some(observed) => {
                let internal = self.apply_external_edit(item, observed).await?;
                mapping.hapi_deleted = false;
                self.mark_synced(mapping, &internal, observed, ModifiedBy::External)
                    .await?;
                self.outcome.stats.events_updated += 1;
                Ok(())
            }
            None => self.apply_external_delete(item, mapping).await,
        }
    }

    async fn record_conflict(
        &self,
        mapping: &EventMapping,
        item: &SourceItem,
        external: &ExternalSide,
        conflict_type: ConflictType,
        status: ResolutionStatus,
        resolution_action: Option<ResolutionAction>,
    ) -> SyncResult<()> {
        let hapi_snapshot = if item.deleted {
            None
        } else {
            Some(self.snapshot(&item.event)?)
        };
        let external_snapshot = external
            .event
            .as_ref()
            .map(|event| self.snapshot(event))
            .transpose()?;
        let conflict = NewConflict {
            mapping_id: mapping.id,
            conflict_type,
            hapi_snapshot,
            external_snapshot,
            status,
            resolution_action,
        };
        self.db(move |s| s.record_conflict(&conflict)).await?;
        Ok(())
    }

    /// Records both versions as the new baseline.
    async fn mark_synced(
        &self,
        mapping: &mut EventMapping,
        internal: &CanonicalEvent,
        external: &CanonicalEvent,
        modified_by: ModifiedBy,
    ) -> SyncResult<()> {
        mapping.hapi_version_hash = Some(content_hash(internal));
        mapping.external_version_hash = Some(content_hash(external));
        mapping.hapi_snapshot = Some(self.snapshot(internal)?);
        mapping.external_snapshot = Some(self.snapshot(external)?);
        mapping.sync_status = MappingStatus::Synced;
        mapping.last_modified_by = Some(modified_by);
        mapping.last_error = None;
        mapping.last_synced_at = Some(self.now);
        mapping.id = self.save(mapping).await?;
        Ok(())
    }

    fn snapshot(&self, event: &CanonicalEvent) -> SyncResult<String> {
        to_snapshot(event).map_err(|e| SyncError::sync(&self.connection.id, e.to_string()))
    }

    async fn import_all(&mut self, events: &[ProviderEvent], mirrored: &HashSet<String>) -> SyncResult<()> {
        for event in events {
            let Some(id) = event.id.as_deref() else {
                continue;
            };
            if event.is_engine_authored() || mirrored.contains(id) {
                continue;
            }
            self.check_cancelled()?;
            let result = self.import(id, event).await;
            self.isolate(SourceSystem::External, id, result).await?;
        }
        Ok(())
    }

    /// Copies one external event into the internal store.
    async fn import(&mut self, external_id: &str, event: &ProviderEvent) -> SyncResult<()> {
        let connection_id = self.connection.id.clone();
        let now = self.now;

        if event.is_cancelled() {
            let (cid, eid) = (connection_id.clone(), external_id.to_string());
            if self.db(move |s| s.mark_imported_deleted(&cid, &eid, now)).await? {
                self.outcome.stats.events_deleted += 1;
                if let Some(mut mapping) = self.find_mapping(SourceSystem::External, external_id).await? {
                    mapping.external_deleted = true;
                    mapping.hapi_deleted = true;
                    mapping.sync_status = MappingStatus::Synced;
                    mapping.last_modified_by = Some(ModifiedBy::External);
                    mapping.last_synced_at = Some(now);
                    self.save(&mapping).await?;
                }
            }
            return Ok(());
        }

        let Some(canonical) = from_provider_event(event) else {
            debug!(external_event_id = external_id, "external event without start time skipped");
            return Ok(());
        };
        let hash = content_hash(&canonical);
        let (cid, eid) = (connection_id.clone(), external_id.to_string());
        let existing = self.db(move |s| s.get_imported_event(&cid, &eid)).await?;
        if let Some(existing) = &existing
            && !existing.deleted
            && existing.content_hash == hash
        {
            return Ok(());
        }

        let imported = ImportedEvent {
            connection_id: connection_id.clone(),
            external_event_id: external_id.to_string(),
            user_id: self.user_id().to_string(),
            event: canonical.clone(),
            content_hash: hash,
            deleted: false,
            updated_at: now,
        };
        self.db(move |s| s.upsert_imported_event(&imported)).await?;

        let mut mapping = self
            .find_mapping(SourceSystem::External, external_id)
            .await?
            .unwrap_or_else(|| EventMapping::new(self.user_id(), connection_id.as_str(), SourceSystem::External, external_id));
        mapping.external_event_id = Some(external_id.to_string());
        mapping.hapi_deleted = false;
        mapping.external_deleted = false;
        self.mark_synced(&mut mapping, &canonical, &canonical, ModifiedBy::External)
            .await?;

        match existing {
            Some(existing) if !existing.deleted => self.outcome.stats.events_updated += 1,
            _ => self.outcome.stats.events_created += 1,
        }
        Ok(())
    }
}

/// Compares an event with the recorded baseline of its side.
fn side_change(current: &CanonicalEvent, baseline: Option<&ContentHash>, snapshot: Option<&str>) -> SideChange {
    if baseline == Some(&content_hash(current)) {
        return SideChange::Unchanged;
    }
    let changes = snapshot
        .and_then(|s| from_snapshot(s).ok())
        .map(|previous| diff(&previous, current))
        .unwrap_or_default();
    SideChange::Modified(changes)
}

/// A patch body that also clears fields removed internally.
fn patch_payload(event: &CanonicalEvent, time_zone: Option<&str>) -> ProviderEvent {
    let mut payload = to_provider_event(event, time_zone);
    payload.description = Some(event.description.clone().unwrap_or_default());
    payload.location = Some(event.location.clone().unwrap_or_default());
    payload
}

/// What the provider now holds after a write.
fn observed(returned: &ProviderEvent, written: &CanonicalEvent) -> CanonicalEvent {
    from_provider_event(returned).unwrap_or_else(|| written.clone())
}

fn error_label(err: &SyncError) -> &'static str {
    match err {
        SyncError::Provider(err) => err.code().as_str(),
        SyncError::Store(err) if err.is_retryable() => "datastore_busy",
        SyncError::Store(_) => "datastore_error",
        SyncError::ReadOnlySource(_) => "read_only_source",
        _ => "sync_error",
    }
}
