//! Member enrichment: refresh provider caches, squash, write back

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cdp_common::events::{CdpEvent, EventBus};
use cdp_common::time::now;
use serde_json::{json, Value};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::arbiter::Arbiter;
use super::disambiguation::{cascade_discard, select_profile};
use super::source::{EnrichmentInput, EnrichmentSource, NormalizedProfile};
use super::squasher::{squash, SquashedProfile};
use super::timeline::{self, ResolvedExperience};
use crate::attributes::{calculate_reach, merge_for_update, set_defaults};
use crate::config::SinkConfig;
use crate::db::{enrichment as cache, identities, members, organizations as org_repo, settings};
use crate::error::{ResultExt, SinkError, SinkResult};
use crate::identity::reconcile_identities;
use crate::merge::manager;
use crate::organizations;
use crate::sync::SearchSyncEmitter;
use crate::types::{
    Attributes, Member, MemberIdentity, MemberOrganization, OrganizationFields, OrganizationPayload,
    ENRICHMENT_PLATFORM,
};
use crate::utils::{retry_on_lock, CreditsCache, RateLimitLock, RequestPacer};

/// Outcome of writing a squashed profile
#[derive(Debug, Default)]
struct WriteBack {
    updated: bool,
    organizations: Vec<Uuid>,
}

pub struct EnrichmentService {
    pool: SqlitePool,
    sources: Vec<Arc<dyn EnrichmentSource>>,
    arbiter: Option<Arbiter>,
    credits: CreditsCache,
    pacer: RequestPacer,
    sync: Arc<dyn SearchSyncEmitter>,
    events: EventBus,
    social_platform: String,
    lock_wait_ms: u64,
}

impl EnrichmentService {
    pub fn new(
        pool: SqlitePool,
        config: &SinkConfig,
        sources: Vec<Arc<dyn EnrichmentSource>>,
        arbiter: Option<Arbiter>,
        sync: Arc<dyn SearchSyncEmitter>,
        events: EventBus,
    ) -> Self {
        let enrichment = &config.enrichment;
        Self {
            pool,
            sources,
            arbiter,
            credits: CreditsCache::new(
                Duration::from_secs(enrichment.credits_cache_secs),
                Duration::from_millis(enrichment.lock_timeout_ms),
                RateLimitLock::new(),
            ),
            pacer: RequestPacer::per_second(enrichment.requests_per_second),
            sync,
            events,
            social_platform: enrichment.social_network_platform.clone(),
            lock_wait_ms: config.db_lock_max_wait_ms,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_input(&self, member_id: Uuid) -> SinkResult<(Member, EnrichmentInput)> {
        let mut conn = self.pool.acquire().await?;
        let member = members::find_member(&mut *conn, member_id)
            .await?
            .ok_or_else(|| SinkError::NotFound(format!("member {}", member_id)))?;
        let member_identities = identities::identities_for_member(&mut *conn, member_id).await?;
        let input = EnrichmentInput::new(&member, member_identities);
        Ok((member, input))
    }

    /// Fetch from every source whose cache went stale and that can serve the member
    async fn refresh_caches(&self, input: &EnrichmentInput) -> SinkResult<()> {
        for source in &self.sources {
            let name = source.name();

            let cached = {
                let mut conn = self.pool.acquire().await?;
                cache::find_cache(&mut *conn, input.member_id, name).await?
            };
            if let Some(row) = &cached {
                if !row.is_obsolete(source.cache_ttl(), now()) {
                    continue;
                }
            }

            if !source.is_enrichable(input) {
                tracing::debug!(member_id = %input.member_id, source = name, "Member not enrichable by source");
                continue;
            }

            let has_credits = self
                .credits
                .has_remaining_credits(name, || source.has_remaining_credits())
                .await?;
            if !has_credits {
                tracing::warn!(source = name, "Source has no remaining credits, skipping");
                continue;
            }

            self.pacer.ready().await;
            match source.fetch(input).await {
                Ok(data) => {
                    let mut conn = self.pool.acquire().await?;
                    cache::upsert_cache(&mut *conn, input.member_id, name, data.as_ref()).await?;
                    tracing::debug!(
                        member_id = %input.member_id,
                        source = name,
                        found = data.is_some(),
                        "Enrichment cache refreshed"
                    );
                }
                Err(e) => {
                    tracing::warn!(member_id = %input.member_id, source = name, error = %e, "Source fetch failed");
                }
            }
        }
        Ok(())
    }

    /// Normalize cached payloads and settle multi-profile sources
    ///
    /// Returns the single profile per source plus the source whose
    /// selected profile is trusted for work experiences and reach.
    async fn collect_profiles(
        &self,
        member: &Member,
        input: &EnrichmentInput,
    ) -> SinkResult<(BTreeMap<String, NormalizedProfile>, Option<String>)> {
        let rows = {
            let mut conn = self.pool.acquire().await?;
            cache::caches_for_member(&mut *conn, member.id).await?
        };

        let context = member_context(member, &input.identities);

        let mut profiles: BTreeMap<String, NormalizedProfile> = BTreeMap::new();
        let mut discarded: Vec<NormalizedProfile> = Vec::new();
        let mut high_confidence: Option<String> = None;

        for source in &self.sources {
            let Some(data) = rows
                .iter()
                .find(|row| row.source == source.name())
                .and_then(|row| row.data.as_ref())
            else {
                continue;
            };

            let candidates = match source.normalize(data) {
                Ok(candidates) => candidates,
                Err(e) => {
                    tracing::warn!(source = source.name(), error = %e, "Cached payload could not be normalized");
                    continue;
                }
            };

            if source.is_multi_profile() {
                let selection = select_profile(self.arbiter.as_ref(), member.id, &context, candidates).await;
                discarded.extend(selection.discarded);
                if let Some(selected) = selection.selected {
                    if high_confidence.is_none() {
                        high_confidence = Some(source.name().to_string());
                    }
                    profiles.insert(source.name().to_string(), selected);
                }
            } else if let Some(profile) = candidates.into_iter().next() {
                profiles.insert(source.name().to_string(), profile);
            }
        }

        let removed = cascade_discard(&mut profiles, &discarded, &self.social_platform);
        if high_confidence.as_ref().is_some_and(|s| removed.contains(s)) {
            high_confidence = None;
        }

        Ok((profiles, high_confidence))
    }

    /// Stamp a failed attempt so the member waits a full interval before the next one
    pub async fn record_failed_attempt(&self, member_id: Uuid) -> SinkResult<()> {
        let mut conn = self.pool.acquire().await?;
        members::touch_enrichment(&mut *conn, member_id, false).await
    }

    /// Enrich one member; returns whether the member changed
    pub async fn enrich_member(&self, member_id: Uuid) -> SinkResult<bool> {
        let (member, input) = self.load_input(member_id).await?;

        self.refresh_caches(&input).await?;
        let (profiles, high_confidence) = self.collect_profiles(&member, &input).await?;

        let squashed = if profiles.is_empty() {
            SquashedProfile::default()
        } else {
            squash(
                member.id,
                &profiles,
                &input.identities,
                high_confidence.as_deref(),
                self.arbiter.as_ref(),
            )
            .await
        };

        let pool = &self.pool;
        let squashed = &squashed;
        let (tenant_id, id) = (member.tenant_id, member.id);
        let outcome = retry_on_lock("member enrichment", self.lock_wait_ms, move || async move {
            let mut tx = pool.begin().await?;
            let outcome = write_back(&mut *tx, tenant_id, id, squashed).await?;
            members::touch_enrichment(&mut *tx, id, outcome.updated).await?;
            tx.commit().await.context("committing member enrichment")?;
            Ok::<WriteBack, SinkError>(outcome)
        })
        .await?;

        for organization_id in &outcome.organizations {
            if let Err(e) = self.sync.trigger_organization_sync(member.tenant_id, *organization_id).await {
                tracing::warn!(organization_id = %organization_id, error = %e, "Organization sync request failed");
            }
        }

        if outcome.updated {
            if let Err(e) = self.sync.trigger_member_sync(member.tenant_id, member.id).await {
                tracing::warn!(member_id = %member.id, error = %e, "Member sync request failed");
            }
            self.events.emit_lossy(CdpEvent::MemberEnriched {
                tenant_id: member.tenant_id,
                member_id: member.id,
                sources: profiles.keys().cloned().collect(),
                timestamp: now(),
            });
            tracing::info!(member_id = %member.id, sources = profiles.len(), "Member enriched");
        } else {
            tracing::debug!(member_id = %member.id, "Enrichment produced no changes");
        }

        Ok(outcome.updated)
    }
}

/// Apply a squashed profile to the member inside the caller's transaction
async fn write_back(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    member_id: Uuid,
    squashed: &SquashedProfile,
) -> SinkResult<WriteBack> {
    let mut outcome = WriteBack::default();
    if squashed.is_empty() {
        return Ok(outcome);
    }

    let member = members::find_member(conn, member_id)
        .await?
        .ok_or_else(|| SinkError::NotFound(format!("member {}", member_id)))?;

    outcome.updated |= write_identities(conn, tenant_id, member_id, &squashed.identities).await?;

    let mut changes = members::MemberChanges::default();

    if !squashed.attributes.is_empty() {
        let incoming: Attributes = squashed
            .attributes
            .iter()
            .map(|(name, value)| (name.clone(), json!({ (ENRICHMENT_PLATFORM): value })))
            .collect();
        if let Some(merged) =
            merge_for_update(&member.attributes, &incoming, &member.manually_changed_fields)
        {
            let priority = settings::priority_array(conn, tenant_id).await?.unwrap_or_default();
            let merged = set_defaults(&merged, &priority)?;
            if merged != member.attributes {
                changes.attributes = Some(merged);
            }
        }
    }

    if let Some(reach) = squashed.reach.as_ref().filter(|r| !r.is_empty()) {
        let merged = calculate_reach(&member.reach, reach);
        if merged != member.reach {
            changes.reach = Some(merged);
        }
    }

    outcome.updated |= members::update_member(conn, member_id, &changes).await?;

    if !squashed.work_experiences.is_empty() {
        let (changed, organizations) = write_work_experiences(conn, tenant_id, member_id, squashed).await?;
        outcome.updated |= changed;
        outcome.organizations = organizations;
    }

    Ok(outcome)
}

async fn write_identities(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    member_id: Uuid,
    incoming: &[MemberIdentity],
) -> SinkResult<bool> {
    if incoming.is_empty() {
        return Ok(false);
    }
    let strong: Vec<MemberIdentity> = incoming.iter().filter(|i| i.verified).cloned().collect();

    let reconciliation = reconcile_identities(conn, tenant_id, Some(member_id), &strong, &[]).await?;
    let mut changed = !reconciliation.to_attach.is_empty() || !reconciliation.to_verify.is_empty();
    for identity in &reconciliation.to_attach {
        identities::insert_identity(conn, tenant_id, member_id, identity, None).await?;
    }
    for identity in &reconciliation.to_verify {
        identities::set_identity_verified(conn, member_id, identity, true).await?;
    }
    let mut collisions = reconciliation.collisions;

    // provider guesses are stored as they came; they never claim ownership
    let existing = identities::identities_for_member(conn, member_id).await?;
    for identity in incoming.iter().filter(|i| !i.verified) {
        if existing.iter().any(|e| e.same_tuple(identity)) {
            continue;
        }
        let other_owner = identities::find_member_by_verified(
            conn,
            tenant_id,
            &identity.platform,
            identity.identity_type,
            &identity.value,
        )
        .await?
        .filter(|id| *id != member_id);
        if let Some(other) = other_owner {
            collisions.push((identity.clone(), other));
        }
        identities::insert_identity(conn, tenant_id, member_id, identity, None).await?;
        changed = true;
    }

    for (identity, other) in &collisions {
        tracing::warn!(
            member_id = %member_id,
            other_member_id = %other,
            platform = %identity.platform,
            "Enriched identity belongs to another member, suggesting merge"
        );
        manager::add_to_merge(conn, member_id, *other).await?;
    }
    Ok(changed)
}

/// Resolve organizations named by work experiences and apply the timeline diff
async fn write_work_experiences(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    member_id: Uuid,
    squashed: &SquashedProfile,
) -> SinkResult<(bool, Vec<Uuid>)> {
    let mut resolved: Vec<ResolvedExperience> = Vec::new();
    let mut organization_ids: Vec<Uuid> = Vec::new();

    for experience in &squashed.work_experiences {
        if experience.identities.is_empty() {
            tracing::debug!(
                member_id = %member_id,
                organization = ?experience.organization_name,
                "Skipping work experience without organization identities"
            );
            continue;
        }

        let payload = OrganizationPayload {
            display_name: experience.organization_name.clone(),
            fields: OrganizationFields {
                description: experience.organization_description.clone(),
                ..OrganizationFields::default()
            },
            identities: experience.identities.clone(),
            attributes: Attributes::new(),
            source: Some(ENRICHMENT_PLATFORM.to_string()),
        };
        let organization_id =
            organizations::find_or_create(conn, tenant_id, ENRICHMENT_PLATFORM, &payload).await?;
        if !organization_ids.contains(&organization_id) {
            organization_ids.push(organization_id);
        }

        resolved.push(ResolvedExperience {
            organization_id,
            title: experience.title.clone(),
            start_date: experience.start_date,
            end_date: experience.end_date,
        });
    }

    let existing = org_repo::member_organizations(conn, member_id).await?;
    let diff = timeline::diff(&existing, &resolved, squashed.replace_automatic_experiences);

    for id in &diff.to_delete {
        org_repo::delete_member_organization(conn, *id).await?;
    }
    for row in &diff.to_update {
        org_repo::update_member_organization(conn, row).await?;
    }
    for experience in &diff.to_create {
        org_repo::insert_member_organization(
            conn,
            &MemberOrganization {
                id: Uuid::new_v4(),
                member_id,
                organization_id: experience.organization_id,
                title: experience.title.clone(),
                date_start: experience.start_date,
                date_end: experience.end_date,
                source: Some(ENRICHMENT_PLATFORM.to_string()),
            },
        )
        .await?;
    }

    if !diff.is_empty() {
        tracing::debug!(
            member_id = %member_id,
            created = diff.to_create.len(),
            updated = diff.to_update.len(),
            deleted = diff.to_delete.len(),
            "Work experiences reconciled"
        );
    }
    Ok((!diff.is_empty(), organization_ids))
}

/// What arbitration knows about the member when choosing a profile
fn member_context(member: &Member, identities: &[MemberIdentity]) -> Value {
    json!({
        "displayName": member.display_name,
        "attributes": member.attributes,
        "identities": identities,
    })
}
