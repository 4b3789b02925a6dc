//! Member merge and merge-suggestion edges

mod helpers;

use std::sync::Arc;

use cdp_common::events::{CdpEvent, EventBus};
use cdp_sink::db::members;
use cdp_sink::ingest::IngestService;
use cdp_sink::merge::MergeService;
use cdp_sink::sync::{RecordingSync, SyncCall};
use helpers::*;
use sqlx::SqlitePool;
use uuid::Uuid;

async fn ingest_member(
    service: &IngestService,
    pool: &SqlitePool,
    tenant_id: Uuid,
    platform: &str,
    username: &str,
    timestamp: &str,
) -> Uuid {
    let source_id = format!("{}-{}-{}", platform, username, timestamp);
    let payload = activity_payload(platform, username, "message", timestamp, &source_id);
    service
        .create_and_process(&activity_result(tenant_id, platform, payload))
        .await
        .unwrap();
    member_by_username(pool, tenant_id, platform, username).await.unwrap()
}

fn merge_service(pool: &SqlitePool, sync: Arc<RecordingSync>, events: EventBus) -> MergeService {
    MergeService::new(pool.clone(), sync, events, 1000)
}

#[tokio::test]
async fn test_self_merge_is_a_no_op() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = setup_tenant(&pool, &["github"]).await.unwrap();
    let (ingest, sync) = ingest_service(&pool, &test_config());
    let member = ingest_member(&ingest, &pool, tenant_id, "github", "octo", "2024-03-01T10:00:00Z").await;

    let merge = merge_service(&pool, sync, EventBus::new(10));
    assert!(!merge.merge(tenant_id, member, member).await.unwrap());
    assert_eq!(count_members(&pool, tenant_id).await, 1);
}

#[tokio::test]
async fn test_merge_drops_duplicate_activities_on_same_platform() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = setup_tenant(&pool, &["github"]).await.unwrap();
    let (ingest, sync) = ingest_service(&pool, &test_config());
    let primary = ingest_member(&ingest, &pool, tenant_id, "github", "octo", "2024-03-01T10:00:00Z").await;
    let secondary = ingest_member(&ingest, &pool, tenant_id, "github", "octo-alt", "2024-03-01T10:00:00Z").await;
    assert_eq!(count_activities(&pool, tenant_id).await, 2);

    let events = EventBus::new(10);
    let mut rx = events.subscribe();
    let merge = merge_service(&pool, sync.clone(), events);
    assert!(merge.merge(tenant_id, primary, secondary).await.unwrap());

    assert_eq!(count_members(&pool, tenant_id).await, 1);
    assert_eq!(count_activities(&pool, tenant_id).await, 1);
    assert_eq!(
        member_by_username(&pool, tenant_id, "github", "octo-alt").await,
        Some(primary)
    );

    let calls = sync.calls();
    assert!(calls.contains(&SyncCall::Member(primary)));
    assert!(calls.contains(&SyncCall::RemoveMember(secondary)));

    match rx.try_recv().unwrap() {
        CdpEvent::MembersMerged {
            primary_id,
            secondary_id,
            ..
        } => {
            assert_eq!(primary_id, primary);
            assert_eq!(secondary_id, secondary);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_merge_keeps_activities_from_different_platforms() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = setup_tenant(&pool, &["github", "slack"]).await.unwrap();
    let (ingest, sync) = ingest_service(&pool, &test_config());
    let primary = ingest_member(&ingest, &pool, tenant_id, "github", "octo", "2024-03-01T10:00:00Z").await;
    let secondary = ingest_member(&ingest, &pool, tenant_id, "slack", "octo", "2024-03-01T10:00:00Z").await;

    let merge = merge_service(&pool, sync, EventBus::new(10));
    assert!(merge.merge(tenant_id, primary, secondary).await.unwrap());

    assert_eq!(count_members(&pool, tenant_id).await, 1);
    assert_eq!(count_activities(&pool, tenant_id).await, 2);
    assert_eq!(
        member_by_username(&pool, tenant_id, "slack", "octo").await,
        Some(primary)
    );
}

#[tokio::test]
async fn test_merge_keeps_earliest_joined_at() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = setup_tenant(&pool, &["github"]).await.unwrap();
    let (ingest, sync) = ingest_service(&pool, &test_config());
    let primary = ingest_member(&ingest, &pool, tenant_id, "github", "late", "2024-05-01T10:00:00Z").await;
    let secondary = ingest_member(&ingest, &pool, tenant_id, "github", "early", "2023-01-01T10:00:00Z").await;

    let merge = merge_service(&pool, sync, EventBus::new(10));
    merge.merge(tenant_id, primary, secondary).await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let member = members::find_member(&mut *conn, primary).await.unwrap().unwrap();
    assert_eq!(member.joined_at, ts("2023-01-01T10:00:00Z"));
}

#[tokio::test]
async fn test_no_merge_refuses_suggestion() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = setup_tenant(&pool, &["github"]).await.unwrap();
    let (ingest, sync) = ingest_service(&pool, &test_config());
    let a = ingest_member(&ingest, &pool, tenant_id, "github", "a", "2024-03-01T10:00:00Z").await;
    let b = ingest_member(&ingest, &pool, tenant_id, "github", "b", "2024-03-02T10:00:00Z").await;

    let merge = merge_service(&pool, sync, EventBus::new(10));
    assert!(merge.add_to_merge(a, b).await.unwrap());
    assert_eq!(merge.to_merge(a).await.unwrap(), vec![b]);

    merge.add_to_no_merge(a, b).await.unwrap();
    assert!(merge.to_merge(a).await.unwrap().is_empty());
    assert_eq!(merge.no_merge(b).await.unwrap(), vec![a]);

    assert!(!merge.add_to_merge(b, a).await.unwrap());
    assert!(merge.to_merge(b).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_merge_carries_suggestions_to_primary() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let tenant_id = setup_tenant(&pool, &["github"]).await.unwrap();
    let (ingest, sync) = ingest_service(&pool, &test_config());
    let primary = ingest_member(&ingest, &pool, tenant_id, "github", "a", "2024-03-01T10:00:00Z").await;
    let secondary = ingest_member(&ingest, &pool, tenant_id, "github", "b", "2024-03-02T10:00:00Z").await;
    let other = ingest_member(&ingest, &pool, tenant_id, "github", "c", "2024-03-03T10:00:00Z").await;

    let merge = merge_service(&pool, sync, EventBus::new(10));
    merge.add_to_merge(secondary, other).await.unwrap();
    merge.merge(tenant_id, primary, secondary).await.unwrap();

    assert_eq!(merge.to_merge(primary).await.unwrap(), vec![other]);
    assert_eq!(merge.to_merge(other).await.unwrap(), vec![primary]);
}
