//! Shared fixtures for cdp-sink integration tests

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use cdp_common::events::EventBus;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use cdp_sink::attributes::{default_attribute_bundle, install_attribute_bundle};
use cdp_sink::config::SinkConfig;
use cdp_sink::db::{self, settings};
use cdp_sink::ingest::IngestService;
use cdp_sink::sync::RecordingSync;
use cdp_sink::types::{NewResult, ResultPayload};

/// Temporary database with the schema applied
///
/// Returns (TempDir, SqlitePool); TempDir must stay alive for the whole test
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test_cdp.db");
    let pool = db::init_database_pool(&db_path).await?;
    Ok((temp_dir, pool))
}

/// New tenant with the default attribute bundle and a platform priority
pub async fn setup_tenant(pool: &SqlitePool, priority: &[&str]) -> Result<Uuid> {
    let tenant_id = Uuid::new_v4();
    let mut conn = pool.acquire().await?;
    install_attribute_bundle(&mut *conn, tenant_id, &default_attribute_bundle()).await?;
    if !priority.is_empty() {
        let priority: Vec<String> = priority.iter().map(|p| p.to_string()).collect();
        settings::set_priority_array(&mut *conn, tenant_id, &priority).await?;
    }
    Ok(tenant_id)
}

/// Config with instant retries so DELAYED results are due immediately
pub fn test_config() -> SinkConfig {
    SinkConfig {
        max_stream_retries: 2,
        retry_backoff_unit_secs: 0,
        ..SinkConfig::default()
    }
}

pub fn ingest_service(pool: &SqlitePool, config: &SinkConfig) -> (IngestService, Arc<RecordingSync>) {
    let sync = Arc::new(RecordingSync::new());
    let service = IngestService::new(pool.clone(), config, sync.clone(), EventBus::new(100));
    (service, sync)
}

pub fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap()
}

/// ACTIVITY payload for a member known by one verified username
pub fn activity_payload(
    platform: &str,
    username: &str,
    activity_type: &str,
    timestamp: &str,
    source_id: &str,
) -> Value {
    json!({
        "type": activity_type,
        "timestamp": timestamp,
        "sourceId": source_id,
        "member": {
            "identities": [
                { "platform": platform, "type": "username", "value": username, "verified": true }
            ]
        }
    })
}

pub fn activity_result(tenant_id: Uuid, platform: &str, payload: Value) -> NewResult {
    NewResult {
        tenant_id,
        integration_id: None,
        platform: platform.to_string(),
        payload: serde_json::from_value(json!({ "type": "ACTIVITY", "data": payload })).unwrap(),
    }
}

pub fn member_update_result(tenant_id: Uuid, platform: &str, member: Value) -> NewResult {
    let payload: ResultPayload =
        serde_json::from_value(json!({ "type": "MEMBER_UPDATE", "data": member })).unwrap();
    NewResult {
        tenant_id,
        integration_id: None,
        platform: platform.to_string(),
        payload,
    }
}

pub async fn count_members(pool: &SqlitePool, tenant_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM members WHERE tenant_id = ?")
        .bind(tenant_id.to_string())
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn count_activities(pool: &SqlitePool, tenant_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM activities WHERE tenant_id = ?")
        .bind(tenant_id.to_string())
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Id of the member holding a verified identity
pub async fn member_by_username(pool: &SqlitePool, tenant_id: Uuid, platform: &str, username: &str) -> Option<Uuid> {
    let mut conn = pool.acquire().await.unwrap();
    db::identities::find_member_by_verified(
        &mut *conn,
        tenant_id,
        platform,
        cdp_sink::types::MemberIdentityType::Username,
        username,
    )
    .await
    .unwrap()
}
