//! Member enrichment against fake providers and a fake arbitration collaborator

mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdp_common::events::{CdpEvent, EventBus};
use cdp_sink::config::SinkConfig;
use cdp_sink::db::{identities, members, organizations};
use cdp_sink::enrichment::{
    Arbiter, ArbitrationClient, ArbitrationRequest, ArbitrationTask, EnrichmentInput, EnrichmentScheduler,
    EnrichmentService, EnrichmentSource, NormalizedProfile,
};
use cdp_sink::merge::MergeService;
use cdp_sink::sync::{RecordingSync, SyncCall};
use cdp_sink::{SinkError, SinkResult};
use chrono::NaiveDate;
use helpers::*;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct FakeSource {
    name: &'static str,
    /// Raw payload: a JSON array of normalized profiles
    payload: Value,
    multi_profile: bool,
    credits: bool,
    /// Credits check fails outright
    broken: bool,
    fetches: AtomicUsize,
}

impl FakeSource {
    fn new(name: &'static str, profiles: Value) -> Self {
        Self {
            name,
            payload: profiles,
            multi_profile: false,
            credits: true,
            broken: false,
            fetches: AtomicUsize::new(0),
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentSource for FakeSource {
    fn name(&self) -> &str {
        self.name
    }

    fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(90)
    }

    fn is_multi_profile(&self) -> bool {
        self.multi_profile
    }

    fn is_enrichable(&self, input: &EnrichmentInput) -> bool {
        input.verified_username("github").is_some()
    }

    async fn has_remaining_credits(&self) -> SinkResult<bool> {
        if self.broken {
            return Err(SinkError::Internal("credits endpoint unreachable".to_string()));
        }
        Ok(self.credits)
    }

    async fn fetch(&self, _input: &EnrichmentInput) -> SinkResult<Option<Value>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Some(self.payload.clone()))
    }

    fn normalize(&self, raw: &Value) -> SinkResult<Vec<NormalizedProfile>> {
        serde_json::from_value(raw.clone()).map_err(SinkError::from)
    }
}

/// Answers every request with a canned response
struct CannedArbitration {
    attributes: Value,
    profile: Value,
}

#[async_trait]
impl ArbitrationClient for CannedArbitration {
    async fn complete(&self, request: &ArbitrationRequest) -> SinkResult<Value> {
        Ok(match request.task {
            ArbitrationTask::SquashAttributes => self.attributes.clone(),
            ArbitrationTask::SelectProfile => self.profile.clone(),
        })
    }
}

fn enrichment_service(
    pool: &SqlitePool,
    sources: Vec<Arc<dyn EnrichmentSource>>,
    arbiter: Option<Arbiter>,
    events: EventBus,
) -> (EnrichmentService, Arc<RecordingSync>) {
    let sync = Arc::new(RecordingSync::new());
    let mut config = SinkConfig::default();
    config.enrichment.requests_per_second = 100;
    let service = EnrichmentService::new(pool.clone(), &config, sources, arbiter, sync.clone(), events);
    (service, sync)
}

/// Tenant plus one member ingested from github as `octo`
async fn seeded_member(pool: &SqlitePool) -> (Uuid, Uuid) {
    let tenant_id = setup_tenant(pool, &["github", "enrichment"]).await.unwrap();
    let (ingest, _sync) = ingest_service(pool, &test_config());
    let payload = activity_payload("github", "octo", "star", "2024-03-01T10:00:00Z", "s-1");
    ingest
        .create_and_process(&activity_result(tenant_id, "github", payload))
        .await
        .unwrap();
    let member_id = member_by_username(pool, tenant_id, "github", "octo").await.unwrap();
    (tenant_id, member_id)
}

fn acme_experience(source: &str, title: &str, start: &str, end: Option<&str>) -> Value {
    json!({
        "organizationName": "Acme",
        "identities": [
            { "platform": "enrichment", "type": "primary-domain", "value": "acme.io", "verified": true }
        ],
        "title": title,
        "startDate": start,
        "endDate": end,
        "source": source
    })
}

fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
}

#[tokio::test]
async fn test_single_source_enrichment_writes_member() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let (tenant_id, member_id) = seeded_member(&pool).await;

    let source = Arc::new(FakeSource::new(
        "progai",
        json!([{
            "identities": [
                { "platform": "linkedin", "type": "username", "value": "octo-li", "verified": false }
            ],
            "attributes": { "jobTitle": "Engineer", "location": " Lisbon " },
            "workExperiences": [acme_experience("progai", "Engineer", "2020-01-01", None)]
        }]),
    ));
    let events = EventBus::new(10);
    let mut rx = events.subscribe();
    let (service, sync) = enrichment_service(
        &pool,
        vec![source.clone() as Arc<dyn EnrichmentSource>],
        None,
        events,
    );

    assert!(service.enrich_member(member_id).await.unwrap());
    assert_eq!(source.fetches(), 1);

    let mut conn = pool.acquire().await.unwrap();
    let member = members::find_member(&mut *conn, member_id).await.unwrap().unwrap();
    assert_eq!(member.attributes["jobTitle"]["enrichment"], "Engineer");
    assert_eq!(member.attributes["jobTitle"]["default"], "Engineer");
    assert_eq!(member.attributes["location"]["enrichment"], "Lisbon");
    assert!(member.enrichment_last_tried_at.is_some());
    assert!(member.enrichment_last_updated_at.is_some());

    let member_identities = identities::identities_for_member(&mut *conn, member_id).await.unwrap();
    let linkedin = member_identities
        .iter()
        .find(|i| i.platform == "linkedin" && i.value == "octo-li")
        .unwrap();
    assert!(!linkedin.verified);

    let jobs = organizations::member_organizations(&mut *conn, member_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].title.as_deref(), Some("Engineer"));
    assert_eq!(jobs[0].date_start, Some(date("2020-01-01")));
    assert_eq!(jobs[0].source.as_deref(), Some("enrichment"));
    drop(conn);

    let calls = sync.calls();
    assert!(calls.contains(&SyncCall::Member(member_id)));
    assert!(calls.contains(&SyncCall::Organization(jobs[0].organization_id)));

    match rx.try_recv().unwrap() {
        CdpEvent::MemberEnriched {
            tenant_id: event_tenant,
            member_id: event_member,
            sources,
            ..
        } => {
            assert_eq!(event_tenant, tenant_id);
            assert_eq!(event_member, member_id);
            assert_eq!(sources, vec!["progai".to_string()]);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_unverified_provider_identity_never_takes_ownership() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let (tenant_id, member_id) = seeded_member(&pool).await;

    let (ingest, _sync) = ingest_service(&pool, &test_config());
    let payload = activity_payload("linkedin", "maybe-octo", "comment", "2024-03-02T10:00:00Z", "l-1");
    ingest
        .create_and_process(&activity_result(tenant_id, "linkedin", payload))
        .await
        .unwrap();
    let owner = member_by_username(&pool, tenant_id, "linkedin", "maybe-octo").await.unwrap();

    let source = Arc::new(FakeSource::new(
        "progai",
        json!([{
            "identities": [
                { "platform": "linkedin", "type": "username", "value": "maybe-octo", "verified": false },
                { "platform": "twitter", "type": "username", "value": "octo-tw", "verified": false }
            ],
            "attributes": { "jobTitle": "Engineer" }
        }]),
    ));
    let (service, sync) = enrichment_service(
        &pool,
        vec![source as Arc<dyn EnrichmentSource>],
        None,
        EventBus::new(10),
    );
    assert!(service.enrich_member(member_id).await.unwrap());

    let mut conn = pool.acquire().await.unwrap();
    let member_identities = identities::identities_for_member(&mut *conn, member_id).await.unwrap();
    for value in ["maybe-octo", "octo-tw"] {
        let identity = member_identities.iter().find(|i| i.value == value).unwrap();
        assert!(!identity.verified, "{} should stay unverified", value);
    }
    drop(conn);

    assert_eq!(
        member_by_username(&pool, tenant_id, "linkedin", "maybe-octo").await,
        Some(owner)
    );
    assert_eq!(member_by_username(&pool, tenant_id, "twitter", "octo-tw").await, None);

    let merge = MergeService::new(pool.clone(), sync, EventBus::new(10), 1000);
    assert_eq!(merge.to_merge(member_id).await.unwrap(), vec![owner]);
}

#[tokio::test]
async fn test_fresh_cache_is_not_fetched_again() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let (_tenant_id, member_id) = seeded_member(&pool).await;

    let source = Arc::new(FakeSource::new(
        "progai",
        json!([{ "attributes": { "jobTitle": "Engineer" } }]),
    ));
    let (service, _sync) = enrichment_service(
        &pool,
        vec![source.clone() as Arc<dyn EnrichmentSource>],
        None,
        EventBus::new(10),
    );

    assert!(service.enrich_member(member_id).await.unwrap());
    assert!(!service.enrich_member(member_id).await.unwrap());
    assert_eq!(source.fetches(), 1);
}

#[tokio::test]
async fn test_source_without_credits_is_skipped() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let (_tenant_id, member_id) = seeded_member(&pool).await;

    let source = Arc::new(FakeSource {
        credits: false,
        ..FakeSource::new("clearbit", json!([{ "attributes": { "jobTitle": "Engineer" } }]))
    });
    let (service, _sync) = enrichment_service(
        &pool,
        vec![source.clone() as Arc<dyn EnrichmentSource>],
        None,
        EventBus::new(10),
    );

    assert!(!service.enrich_member(member_id).await.unwrap());
    assert_eq!(source.fetches(), 0);

    let mut conn = pool.acquire().await.unwrap();
    let member = members::find_member(&mut *conn, member_id).await.unwrap().unwrap();
    assert!(member.enrichment_last_tried_at.is_some());
    assert!(member.enrichment_last_updated_at.is_none());
}

#[tokio::test]
async fn test_conflicting_attributes_are_arbitrated() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let (_tenant_id, member_id) = seeded_member(&pool).await;

    let first = Arc::new(FakeSource::new(
        "progai",
        json!([{ "attributes": { "jobTitle": "Engineer", "bio": "Builds things" } }]),
    ));
    let second = Arc::new(FakeSource::new(
        "clearbit",
        json!([{ "attributes": { "jobTitle": "Senior Engineer", "bio": "Builds things" } }]),
    ));
    let arbiter = Arbiter::new(Arc::new(CannedArbitration {
        attributes: json!({ "jobTitle": "Senior Engineer" }),
        profile: json!({ "profileIndex": null }),
    }));
    let (service, _sync) = enrichment_service(
        &pool,
        vec![first as Arc<dyn EnrichmentSource>, second],
        Some(arbiter),
        EventBus::new(10),
    );

    assert!(service.enrich_member(member_id).await.unwrap());

    let mut conn = pool.acquire().await.unwrap();
    let member = members::find_member(&mut *conn, member_id).await.unwrap().unwrap();
    assert_eq!(member.attributes["jobTitle"]["enrichment"], "Senior Engineer");
    assert_eq!(member.attributes["bio"]["enrichment"], "Builds things");
}

#[tokio::test]
async fn test_conflicting_attributes_without_arbiter_stay_unset() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let (_tenant_id, member_id) = seeded_member(&pool).await;

    let first = Arc::new(FakeSource::new("progai", json!([{ "attributes": { "jobTitle": "Engineer" } }])));
    let second = Arc::new(FakeSource::new("clearbit", json!([{ "attributes": { "jobTitle": "CTO" } }])));
    let (service, _sync) = enrichment_service(
        &pool,
        vec![first as Arc<dyn EnrichmentSource>, second],
        None,
        EventBus::new(10),
    );

    assert!(!service.enrich_member(member_id).await.unwrap());

    let mut conn = pool.acquire().await.unwrap();
    let member = members::find_member(&mut *conn, member_id).await.unwrap().unwrap();
    assert!(member.attributes.get("jobTitle").is_none());
}

#[tokio::test]
async fn test_overlapping_jobs_from_two_sources_become_one_row() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let (_tenant_id, member_id) = seeded_member(&pool).await;

    let first = Arc::new(FakeSource::new(
        "progai",
        json!([{ "workExperiences": [acme_experience("progai", "Engineer", "2019-01-01", Some("2020-06-01"))] }]),
    ));
    let second = Arc::new(FakeSource::new(
        "clearbit",
        json!([{ "workExperiences": [acme_experience("clearbit", "Engineer", "2020-01-01", Some("2021-01-01"))] }]),
    ));
    let (service, _sync) = enrichment_service(
        &pool,
        vec![first as Arc<dyn EnrichmentSource>, second],
        None,
        EventBus::new(10),
    );

    assert!(service.enrich_member(member_id).await.unwrap());

    let mut conn = pool.acquire().await.unwrap();
    let jobs = organizations::member_organizations(&mut *conn, member_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].date_start, Some(date("2019-01-01")));
    assert_eq!(jobs[0].date_end, Some(date("2021-01-01")));
}

#[tokio::test]
async fn test_multi_profile_source_without_arbiter_selects_nothing() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let (_tenant_id, member_id) = seeded_member(&pool).await;

    let source = Arc::new(FakeSource {
        multi_profile: true,
        ..FakeSource::new(
            "serp",
            json!([
                { "attributes": { "jobTitle": "Engineer" } },
                { "attributes": { "jobTitle": "Designer" } }
            ]),
        )
    });
    let (service, _sync) = enrichment_service(
        &pool,
        vec![source as Arc<dyn EnrichmentSource>],
        None,
        EventBus::new(10),
    );

    assert!(!service.enrich_member(member_id).await.unwrap());
}

#[tokio::test]
async fn test_multi_profile_source_uses_arbitrated_profile() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let (_tenant_id, member_id) = seeded_member(&pool).await;

    let source = Arc::new(FakeSource {
        multi_profile: true,
        ..FakeSource::new(
            "serp",
            json!([
                { "attributes": { "jobTitle": "Engineer" } },
                { "attributes": { "jobTitle": "Designer" }, "reach": { "linkedin": 500 } }
            ]),
        )
    });
    let arbiter = Arbiter::new(Arc::new(CannedArbitration {
        attributes: json!({}),
        profile: json!({ "profileIndex": 1 }),
    }));
    let (service, _sync) = enrichment_service(
        &pool,
        vec![source as Arc<dyn EnrichmentSource>],
        Some(arbiter),
        EventBus::new(10),
    );

    assert!(service.enrich_member(member_id).await.unwrap());

    let mut conn = pool.acquire().await.unwrap();
    let member = members::find_member(&mut *conn, member_id).await.unwrap().unwrap();
    assert_eq!(member.attributes["jobTitle"]["enrichment"], "Designer");
    // the arbitrated profile is trusted for reach
    assert_eq!(member.reach.get("linkedin"), Some(&500));
}

#[tokio::test]
async fn test_scheduler_tick_enriches_due_members() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let (_tenant_id, member_id) = seeded_member(&pool).await;

    let source = Arc::new(FakeSource::new("progai", json!([{ "attributes": { "jobTitle": "Engineer" } }])));
    let (service, _sync) = enrichment_service(
        &pool,
        vec![source.clone() as Arc<dyn EnrichmentSource>],
        None,
        EventBus::new(10),
    );

    let mut config = SinkConfig::default().enrichment;
    config.interval_secs = 3600;
    config.batch_size = 10;
    let scheduler = EnrichmentScheduler::new(Arc::new(service), &config);
    let cancel = CancellationToken::new();

    assert_eq!(scheduler.tick(&cancel).await.unwrap(), 1);

    let mut enriched = false;
    for _ in 0..50 {
        let mut conn = pool.acquire().await.unwrap();
        let member = members::find_member(&mut *conn, member_id).await.unwrap().unwrap();
        if member.enrichment_last_tried_at.is_some() {
            enriched = true;
            break;
        }
        drop(conn);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(enriched);
    assert_eq!(source.fetches(), 1);

    // Tried within the interval: not due again
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.tick(&cancel).await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_enrichment_waits_for_next_interval() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let (_tenant_id, member_id) = seeded_member(&pool).await;

    let source = Arc::new(FakeSource {
        broken: true,
        ..FakeSource::new("progai", json!([{ "attributes": { "jobTitle": "Engineer" } }]))
    });
    let (service, _sync) = enrichment_service(
        &pool,
        vec![source.clone() as Arc<dyn EnrichmentSource>],
        None,
        EventBus::new(10),
    );

    let mut config = SinkConfig::default().enrichment;
    config.interval_secs = 3600;
    config.batch_size = 10;
    config.retry.initial_interval_secs = 0;
    config.retry.maximum_attempts = 1;
    let scheduler = EnrichmentScheduler::new(Arc::new(service), &config);
    let cancel = CancellationToken::new();

    assert_eq!(scheduler.tick(&cancel).await.unwrap(), 1);

    let mut tried = None;
    for _ in 0..50 {
        let mut conn = pool.acquire().await.unwrap();
        let member = members::find_member(&mut *conn, member_id).await.unwrap().unwrap();
        if member.enrichment_last_tried_at.is_some() {
            tried = Some(member);
            break;
        }
        drop(conn);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let member = tried.expect("failed attempt should be recorded");
    assert!(member.enrichment_last_updated_at.is_none());
    assert_eq!(source.fetches(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.tick(&cancel).await.unwrap(), 0);
}
