//! Organization resolution, member affiliation and cache repair

mod helpers;

use cdp_common::events::ResultState;
use cdp_sink::db::organizations::{self as repo, OrganizationCacheRow};
use cdp_sink::organizations::{find_or_create, repair_organization_cache};
use cdp_sink::types::{
    NewResult, OrganizationFields, OrganizationIdentity, OrganizationIdentityType, OrganizationPayload,
};
use helpers::*;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use uuid::Uuid;

async fn count_organizations(pool: &SqlitePool, tenant_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM organizations WHERE tenant_id = ?")
        .bind(tenant_id.to_string())
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn organizations_of(pool: &SqlitePool, member_id: Uuid) -> Vec<Uuid> {
    let mut conn = pool.acquire().await.unwrap();
    repo::member_organizations(&mut *conn, member_id)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.organization_id)
        .collect()
}

fn with_organization(mut payload: Value, domain: &str) -> Value {
    payload["member"]["organizations"] = json!([{
        "displayName": "Acme",
        "identities": [
            { "platform": "github", "type": "primary-domain", "value": domain, "verified": true }
        ]
    }]);
    payload
}

fn acme(identities: Vec<OrganizationIdentity>) -> OrganizationPayload {
    OrganizationPayload {
        display_name: Some("Acme".to_string()),
        identities,
        ..Default::default()
    }
}

fn organization_enrich(tenant_id: Uuid, organization: Value) -> NewResult {
    NewResult {
        tenant_id,
        integration_id: None,
        platform: "enrichment".to_string(),
        payload: serde_json::from_value(json!({ "type": "ORGANIZATION_ENRICH", "data": organization }))
            .unwrap(),
    }
}

#[tokio::test]
async fn test_member_organizations_resolve_to_one_organization() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = setup_tenant(&pool, &["github"]).await.unwrap();
    let (service, _sync) = ingest_service(&pool, &test_config());

    let first = activity_payload("github", "alice", "star", "2024-03-01T10:00:00Z", "s-1");
    service
        .create_and_process(&activity_result(tenant_id, "github", with_organization(first, "https://www.acme.io/")))
        .await
        .unwrap();
    let second = activity_payload("github", "bob", "star", "2024-03-02T10:00:00Z", "s-2");
    service
        .create_and_process(&activity_result(tenant_id, "github", with_organization(second, "acme.io")))
        .await
        .unwrap();

    assert_eq!(count_organizations(&pool, tenant_id).await, 1);

    let alice = member_by_username(&pool, tenant_id, "github", "alice").await.unwrap();
    let bob = member_by_username(&pool, tenant_id, "github", "bob").await.unwrap();
    let alice_orgs = organizations_of(&pool, alice).await;
    assert_eq!(alice_orgs.len(), 1);
    assert_eq!(alice_orgs, organizations_of(&pool, bob).await);
}

#[tokio::test]
async fn test_email_domain_links_existing_organization() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = setup_tenant(&pool, &["github"]).await.unwrap();
    let (service, _sync) = ingest_service(&pool, &test_config());

    let founder = activity_payload("github", "alice", "star", "2024-03-01T10:00:00Z", "s-1");
    service
        .create_and_process(&activity_result(tenant_id, "github", with_organization(founder, "acme.io")))
        .await
        .unwrap();

    let mut employee = activity_payload("github", "carol", "star", "2024-03-02T10:00:00Z", "s-2");
    employee["member"]["identities"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "platform": "github", "type": "email", "value": "carol@acme.io", "verified": true }));
    service
        .create_and_process(&activity_result(tenant_id, "github", employee))
        .await
        .unwrap();

    let alice = member_by_username(&pool, tenant_id, "github", "alice").await.unwrap();
    let carol = member_by_username(&pool, tenant_id, "github", "carol").await.unwrap();
    assert_eq!(organizations_of(&pool, carol).await, organizations_of(&pool, alice).await);
}

#[tokio::test]
async fn test_free_mail_domain_creates_nothing() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = setup_tenant(&pool, &["github"]).await.unwrap();
    let (service, _sync) = ingest_service(&pool, &test_config());

    let mut payload = activity_payload("github", "dave", "star", "2024-03-01T10:00:00Z", "s-1");
    payload["member"]["identities"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "platform": "github", "type": "email", "value": "dave@gmail.com", "verified": true }));
    service
        .create_and_process(&activity_result(tenant_id, "github", payload))
        .await
        .unwrap();

    let dave = member_by_username(&pool, tenant_id, "github", "dave").await.unwrap();
    assert_eq!(count_organizations(&pool, tenant_id).await, 0);
    assert!(organizations_of(&pool, dave).await.is_empty());
}

#[tokio::test]
async fn test_organization_enrich_fills_only_missing_fields() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = setup_tenant(&pool, &["github"]).await.unwrap();
    let (service, _sync) = ingest_service(&pool, &test_config());

    let mut payload = with_organization(
        activity_payload("github", "alice", "star", "2024-03-01T10:00:00Z", "s-1"),
        "acme.io",
    );
    payload["member"]["organizations"][0]["location"] = json!("Berlin");
    service
        .create_and_process(&activity_result(tenant_id, "github", payload))
        .await
        .unwrap();

    let enrich = json!({
        "identities": [
            { "platform": "enrichment", "type": "primary-domain", "value": "acme.io", "verified": true }
        ],
        "location": "Paris",
        "industry": "Software"
    });
    let (_, state) = service
        .create_and_process(&organization_enrich(tenant_id, enrich))
        .await
        .unwrap();
    assert_eq!(state, ResultState::Processed);

    let alice = member_by_username(&pool, tenant_id, "github", "alice").await.unwrap();
    let organization_id = organizations_of(&pool, alice).await[0];
    let mut conn = pool.acquire().await.unwrap();
    let organization = repo::find_organization(&mut *conn, organization_id).await.unwrap().unwrap();
    assert_eq!(organization.fields.location.as_deref(), Some("Berlin"));
    assert_eq!(organization.fields.industry.as_deref(), Some("Software"));
}

#[tokio::test]
async fn test_organization_enrich_for_unknown_organization_is_a_no_op() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = setup_tenant(&pool, &["github"]).await.unwrap();
    let (service, _sync) = ingest_service(&pool, &test_config());

    let enrich = json!({
        "identities": [
            { "platform": "enrichment", "type": "primary-domain", "value": "nowhere.dev", "verified": true }
        ],
        "industry": "Software"
    });
    let (_, state) = service
        .create_and_process(&organization_enrich(tenant_id, enrich))
        .await
        .unwrap();

    assert_eq!(state, ResultState::Processed);
    assert_eq!(count_organizations(&pool, tenant_id).await, 0);
}

#[tokio::test]
async fn test_cache_repair_keeps_most_complete_row() {
    let (_dir, pool) = create_test_db().await.unwrap();

    let sparse = OrganizationCacheRow {
        id: Uuid::new_v4(),
        name: None,
        website: Some("acme.io".to_string()),
        fields: OrganizationFields {
            industry: Some("Software".to_string()),
            ..Default::default()
        },
    };
    let rich = OrganizationCacheRow {
        id: Uuid::new_v4(),
        name: Some("Acme".to_string()),
        website: Some("acme.io".to_string()),
        fields: OrganizationFields {
            location: Some("Berlin".to_string()),
            employees: Some(40),
            ..Default::default()
        },
    };
    let unrelated = OrganizationCacheRow {
        id: Uuid::new_v4(),
        name: Some("Other".to_string()),
        website: Some("other.io".to_string()),
        fields: OrganizationFields::default(),
    };
    for row in [&sparse, &rich, &unrelated] {
        repo::insert_cache_row(&pool, row).await.unwrap();
    }
    let linked_org = Uuid::new_v4();
    repo::link_cache(&pool, sparse.id, linked_org).await.unwrap();

    let removed = repair_organization_cache(&pool, 10).await.unwrap();
    assert_eq!(removed, 1);

    let mut conn = pool.acquire().await.unwrap();
    let rows = repo::cache_rows_for_website(&mut *conn, "acme.io").await.unwrap();
    assert_eq!(rows.len(), 1);
    let canonical = &rows[0];
    assert_eq!(canonical.id, rich.id);
    assert_eq!(canonical.fields.industry.as_deref(), Some("Software"));
    assert_eq!(canonical.fields.location.as_deref(), Some("Berlin"));
    drop(conn);

    assert_eq!(repo::cache_links(&pool, rich.id).await.unwrap(), vec![linked_org]);
    assert_eq!(repair_organization_cache(&pool, 10).await.unwrap(), 0);
}

#[tokio::test]
async fn test_second_primary_domain_becomes_alternative() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = Uuid::new_v4();
    let mut conn = pool.acquire().await.unwrap();

    let first = find_or_create(
        &mut *conn,
        tenant_id,
        "github",
        &acme(vec![OrganizationIdentity::primary_domain("github", "acme.com", true)]),
    )
    .await
    .unwrap();
    let second = find_or_create(
        &mut *conn,
        tenant_id,
        "github",
        &acme(vec![
            OrganizationIdentity::primary_domain("github", "acme.com", true),
            OrganizationIdentity::primary_domain("github", "acme.io", true),
            OrganizationIdentity::primary_domain("enrichment", "acme.com", true),
        ]),
    )
    .await
    .unwrap();
    assert_eq!(first, second);

    let identities = repo::identities_for_organization(&mut *conn, first).await.unwrap();
    let verified_primary: Vec<&OrganizationIdentity> = identities
        .iter()
        .filter(|i| i.verified && i.identity_type == OrganizationIdentityType::PrimaryDomain)
        .collect();
    assert_eq!(verified_primary.len(), 1);
    assert_eq!(verified_primary[0].value, "acme.com");
    assert!(identities.iter().any(|i| {
        i.verified && i.identity_type == OrganizationIdentityType::AlternativeDomain && i.value == "acme.io"
    }));

    // the alternative domain still finds the same organization
    let third = find_or_create(
        &mut *conn,
        tenant_id,
        "github",
        &acme(vec![OrganizationIdentity::primary_domain("github", "acme.io", true)]),
    )
    .await
    .unwrap();
    assert_eq!(third, first);
    assert_eq!(count_organizations(&pool, tenant_id).await, 1);
}

#[tokio::test]
async fn test_unverified_identity_upgraded_when_seen_verified() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = Uuid::new_v4();
    let mut conn = pool.acquire().await.unwrap();

    let handle = OrganizationIdentity {
        platform: "linkedin".to_string(),
        identity_type: OrganizationIdentityType::Username,
        value: "acme-corp".to_string(),
        verified: false,
        source: None,
    };
    let organization_id = find_or_create(
        &mut *conn,
        tenant_id,
        "github",
        &acme(vec![
            OrganizationIdentity::primary_domain("github", "acme.com", true),
            handle.clone(),
        ]),
    )
    .await
    .unwrap();

    let stored = repo::identities_for_organization(&mut *conn, organization_id).await.unwrap();
    assert!(!stored.iter().find(|i| i.same_tuple(&handle)).unwrap().verified);

    let again = find_or_create(
        &mut *conn,
        tenant_id,
        "github",
        &acme(vec![
            OrganizationIdentity::primary_domain("github", "acme.com", true),
            OrganizationIdentity {
                verified: true,
                ..handle.clone()
            },
        ]),
    )
    .await
    .unwrap();
    assert_eq!(again, organization_id);

    let stored = repo::identities_for_organization(&mut *conn, organization_id).await.unwrap();
    assert!(stored.iter().find(|i| i.same_tuple(&handle)).unwrap().verified);
    assert_eq!(
        repo::find_by_verified_identity(
            &mut *conn,
            tenant_id,
            "linkedin",
            OrganizationIdentityType::Username,
            "acme-corp",
        )
        .await
        .unwrap(),
        Some(organization_id)
    );
}
