//! Result state machine: claim, process in one transaction, then settle
//!
//! PENDING → PROCESSING → PROCESSED | DELAYED | ERROR. Processing is a pure
//! upsert so a result can be delivered twice or replayed by an operator.

use std::sync::Arc;

use cdp_common::events::{CdpEvent, EventBus, ResultState};
use cdp_common::time::now;
use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::activity::process_activity;
use super::context::{SyncPlan, TenantContext};
use super::diagnostics::error_diagnostic;
use super::member::process_member_update;
use crate::config::SinkConfig;
use crate::db::{activities, erasure, identities, members, results};
use crate::error::{Disposition, ResultExt, SinkError, SinkResult};
use crate::organizations::process_organization_enrich;
use crate::sync::SearchSyncEmitter;
use crate::types::{IntegrationResult, NewResult, ResultPayload};
use crate::utils::retry_on_lock;

pub struct IngestService {
    pool: SqlitePool,
    sync: Arc<dyn SearchSyncEmitter>,
    events: EventBus,
    max_retries: i64,
    backoff_unit_secs: u64,
    processing_timeout_secs: u64,
    lock_wait_ms: u64,
}

impl IngestService {
    pub fn new(
        pool: SqlitePool,
        config: &SinkConfig,
        sync: Arc<dyn SearchSyncEmitter>,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            sync,
            events,
            max_retries: config.max_stream_retries,
            backoff_unit_secs: config.retry_backoff_unit_secs,
            processing_timeout_secs: config.processing_timeout_secs,
            lock_wait_ms: config.db_lock_max_wait_ms,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn emit_transition(&self, result_id: Uuid, old_state: ResultState, new_state: ResultState, retries: i64) {
        self.events.emit_lossy(CdpEvent::ResultStateChanged {
            result_id,
            old_state,
            new_state,
            retries,
            timestamp: now(),
        });
    }

    /// Store a new raw fact as PENDING
    pub async fn create_result(&self, result: &NewResult) -> SinkResult<Uuid> {
        let id = results::insert_result(&self.pool, result).await?;
        tracing::debug!(result_id = %id, platform = %result.platform, "Stored integration result");
        Ok(id)
    }

    /// Store an inline payload and process it right away
    pub async fn create_and_process(&self, result: &NewResult) -> SinkResult<(Uuid, ResultState)> {
        let id = self.create_result(result).await?;
        let state = self.process_result(id).await?;
        Ok((id, state))
    }

    /// Drive one result through the state machine
    ///
    /// Returns the state the result ended in. A result that cannot be claimed
    /// (already processed, or in flight elsewhere) is left alone and its
    /// current state returned.
    pub async fn process_result(&self, id: Uuid) -> SinkResult<ResultState> {
        let result = results::find_result(&self.pool, id)
            .await?
            .ok_or_else(|| SinkError::NotFound(format!("integration result {}", id)))?;

        if !results::claim_result(&self.pool, id).await? {
            tracing::debug!(result_id = %id, state = %result.state, "Result not claimable, skipping");
            return Ok(result.state);
        }
        self.emit_transition(id, result.state, ResultState::Processing, result.retries);

        match self.process_claimed(&result).await {
            Ok(plan) => {
                self.settle_processed(&result).await?;
                plan.send(result.tenant_id, self.sync.as_ref()).await;
                Ok(ResultState::Processed)
            }
            Err(e) => self.settle_failure(&result, e).await,
        }
    }

    async fn process_claimed(&self, result: &IntegrationResult) -> SinkResult<SyncPlan> {
        let payload = result.payload()?;
        let payload = &payload;
        let pool = &self.pool;

        retry_on_lock("processing result", self.lock_wait_ms, move || async move {
            let mut tx = pool.begin().await?;
            let ctx = TenantContext::load(&mut *tx, result.tenant_id, result.integration_id).await?;
            let mut plan = SyncPlan::default();

            match payload {
                ResultPayload::Activity(activity) => {
                    let outcome = process_activity(&mut *tx, &ctx, &result.platform, activity, &mut plan)
                        .await
                        .context("processing activity")?;
                    tracing::debug!(result_id = %result.id, outcome = ?outcome, "Activity processed");
                }
                ResultPayload::MemberUpdate(member) => {
                    if process_member_update(&mut *tx, &ctx, &result.platform, member, &mut plan)
                        .await
                        .context("processing member update")?
                        .is_none()
                    {
                        tracing::debug!(result_id = %result.id, "Member update had no effect");
                    }
                }
                ResultPayload::OrganizationEnrich(organization) => {
                    match process_organization_enrich(&mut *tx, result.tenant_id, &result.platform, organization)
                        .await
                        .context("processing organization enrichment")?
                    {
                        Some(organization_id) => plan.organization(organization_id),
                        None => tracing::info!(
                            result_id = %result.id,
                            "No organization matches the enrichment payload, skipping"
                        ),
                    }
                }
            }

            tx.commit().await.context("committing result")?;
            Ok::<SyncPlan, SinkError>(plan)
        })
        .await
    }

    async fn settle_processed(&self, result: &IntegrationResult) -> SinkResult<()> {
        let pool = &self.pool;
        retry_on_lock("marking result processed", self.lock_wait_ms, move || async move {
            results::mark_processed(pool, result.id).await
        })
        .await?;
        self.emit_transition(result.id, ResultState::Processing, ResultState::Processed, result.retries);
        Ok(())
    }

    /// Route a failed attempt per the error's disposition
    async fn settle_failure(&self, result: &IntegrationResult, error: SinkError) -> SinkResult<ResultState> {
        let metadata = json!({
            "resultId": result.id,
            "tenantId": result.tenant_id,
            "integrationId": result.integration_id,
            "platform": result.platform,
            "retries": result.retries,
        });
        let diagnostic = error_diagnostic("ingest::process_result", &error, metadata);

        match error.disposition() {
            Disposition::Skip => {
                tracing::warn!(result_id = %result.id, error = %error, "Referenced entity missing, skipping result");
                self.settle_processed(result).await?;
                Ok(ResultState::Processed)
            }
            Disposition::Reject | Disposition::Terminate => {
                tracing::error!(result_id = %result.id, error = %error, "Result failed permanently");
                results::mark_error(&self.pool, result.id, result.retries, &diagnostic).await?;
                self.emit_transition(result.id, ResultState::Processing, ResultState::Error, result.retries);
                Ok(ResultState::Error)
            }
            Disposition::Retry => {
                let retries = result.retries + 1;
                if retries > self.max_retries {
                    tracing::error!(
                        result_id = %result.id,
                        retries,
                        error = %error,
                        "Result exhausted its retries"
                    );
                    results::mark_error(&self.pool, result.id, retries, &diagnostic).await?;
                    self.emit_transition(result.id, ResultState::Processing, ResultState::Error, retries);
                    return Ok(ResultState::Error);
                }

                let delay = chrono::Duration::seconds(retries * self.backoff_unit_secs as i64);
                let delayed_until = now() + delay;
                tracing::warn!(
                    result_id = %result.id,
                    retries,
                    delayed_until = %delayed_until,
                    error = %error,
                    "Result processing failed, retry scheduled"
                );
                results::mark_delayed(&self.pool, result.id, retries, delayed_until, &diagnostic).await?;
                self.emit_transition(result.id, ResultState::Processing, ResultState::Delayed, retries);
                Ok(ResultState::Delayed)
            }
        }
    }

    /// Move due DELAYED results back to PENDING; returns the ids to enqueue
    pub async fn sweep_delayed(&self, batch: i64) -> SinkResult<Vec<Uuid>> {
        let mut swept = Vec::new();
        for id in results::due_delayed(&self.pool, now(), batch).await? {
            if results::reset_to_pending(&self.pool, id, ResultState::Delayed, false).await? {
                self.emit_transition(id, ResultState::Delayed, ResultState::Pending, 0);
                swept.push(id);
            }
        }
        if !swept.is_empty() {
            tracing::info!(count = swept.len(), "Delayed results due for another attempt");
        }
        Ok(swept)
    }

    /// Return abandoned PROCESSING results to PENDING; returns the ids to enqueue
    pub async fn recover_stale_processing(&self, batch: i64) -> SinkResult<Vec<Uuid>> {
        let timeout = chrono::Duration::from_std(std::time::Duration::from_secs(self.processing_timeout_secs))
            .map_err(|e| SinkError::Internal(format!("processing timeout out of range: {}", e)))?;
        let Some(before) = now().checked_sub_signed(timeout) else {
            return Ok(Vec::new());
        };
        let released = results::release_stale_processing(&self.pool, before, batch).await?;
        for id in &released {
            self.emit_transition(*id, ResultState::Processing, ResultState::Pending, 0);
        }
        if !released.is_empty() {
            tracing::warn!(count = released.len(), "Recovered results stuck in processing");
        }
        Ok(released)
    }

    /// Reset an ERROR result to PENDING with a clean retry budget
    pub async fn replay_result(&self, id: Uuid) -> SinkResult<bool> {
        let reset = results::reset_to_pending(&self.pool, id, ResultState::Error, true).await?;
        if reset {
            tracing::info!(result_id = %id, "Result reset for replay");
            self.emit_transition(id, ResultState::Error, ResultState::Pending, 0);
        } else {
            tracing::warn!(result_id = %id, "Result is not in ERROR state, nothing to replay");
        }
        Ok(reset)
    }

    pub async fn replay_failed_results(&self, batch: i64) -> SinkResult<Vec<Uuid>> {
        let mut replayed = Vec::new();
        for id in results::ids_in_state(&self.pool, ResultState::Error, batch).await? {
            if self.replay_result(id).await? {
                replayed.push(id);
            }
        }
        Ok(replayed)
    }

    /// Forget a member: remember its identities as erased, then delete it
    pub async fn erase_member(&self, tenant_id: Uuid, member_id: Uuid) -> SinkResult<()> {
        let mut tx = self.pool.begin().await?;
        let member = members::find_member(&mut *tx, member_id)
            .await?
            .filter(|m| m.tenant_id == tenant_id)
            .ok_or_else(|| SinkError::NotFound(format!("member {}", member_id)))?;

        let member_identities = identities::identities_for_member(&mut *tx, member.id).await?;
        for identity in &member_identities {
            erasure::record_erased(&mut *tx, tenant_id, identity).await?;
        }
        activities::clear_object_member(&mut *tx, member.id).await?;
        members::delete_member(&mut *tx, member.id).await?;
        tx.commit().await.context("committing member erasure")?;

        tracing::info!(
            member_id = %member.id,
            identities = member_identities.len(),
            "Member erased"
        );
        if let Err(e) = self.sync.trigger_remove_member(tenant_id, member.id).await {
            tracing::warn!(member_id = %member.id, error = %e, "Member removal request failed");
        }
        Ok(())
    }
}
