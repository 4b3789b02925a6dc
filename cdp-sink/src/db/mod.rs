//! SQLite persistence for the data sink
//!
//! Functions that take part in a result's transaction accept
//! `&mut SqliteConnection`; callers pass `&mut *tx`.

pub mod activities;
pub mod enrichment;
pub mod erasure;
pub mod identities;
pub mod members;
pub mod merge_edges;
pub mod organizations;
pub mod results;
pub mod settings;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{SinkError, SinkResult};

/// Open (creating if needed) the database and ensure the schema exists
pub async fn init_database_pool(db_path: &Path) -> SinkResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(cdp_common::Error::Io)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create every table and index if missing
pub async fn init_tables(pool: &SqlitePool) -> SinkResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(statements = SCHEMA.len(), "Database schema initialized");
    Ok(())
}

pub(crate) fn parse_uuid(raw: &str) -> SinkResult<Uuid> {
    Uuid::parse_str(raw).map_err(SinkError::from)
}

pub(crate) fn parse_opt_uuid(raw: Option<String>) -> SinkResult<Option<Uuid>> {
    raw.as_deref().map(parse_uuid).transpose()
}

pub(crate) fn json_text<T: serde::Serialize + ?Sized>(value: &T) -> SinkResult<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tenant_settings (
        tenant_id TEXT PRIMARY KEY,
        attribute_priority TEXT NOT NULL DEFAULT '[]'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS member_attribute_settings (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        name TEXT NOT NULL,
        label TEXT NOT NULL,
        type TEXT NOT NULL,
        options TEXT NOT NULL DEFAULT '[]',
        can_delete INTEGER NOT NULL DEFAULT 1,
        show INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        UNIQUE (tenant_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS members (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        display_name TEXT,
        emails TEXT NOT NULL DEFAULT '[]',
        joined_at TEXT NOT NULL,
        score INTEGER,
        reach TEXT NOT NULL DEFAULT '{"total":-1}',
        attributes TEXT NOT NULL DEFAULT '{}',
        manually_changed_fields TEXT NOT NULL DEFAULT '[]',
        enrichment_last_tried_at TEXT,
        enrichment_last_updated_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS member_identities (
        id TEXT PRIMARY KEY,
        member_id TEXT NOT NULL REFERENCES members(id) ON DELETE CASCADE,
        tenant_id TEXT NOT NULL,
        platform TEXT NOT NULL,
        type TEXT NOT NULL,
        value TEXT NOT NULL,
        verified INTEGER NOT NULL DEFAULT 0,
        source_id TEXT,
        integration_id TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (member_id, platform, type, value)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_member_identities_verified
        ON member_identities (tenant_id, platform, type, value) WHERE verified = 1
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ix_member_identities_lookup
        ON member_identities (tenant_id, platform, type, value)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activities (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        member_id TEXT NOT NULL REFERENCES members(id) ON DELETE CASCADE,
        object_member_id TEXT,
        object_member_username TEXT,
        platform TEXT NOT NULL,
        type TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        source_id TEXT NOT NULL,
        source_parent_id TEXT,
        username TEXT,
        attributes TEXT NOT NULL DEFAULT '{}',
        sentiment TEXT,
        body TEXT,
        title TEXT,
        channel TEXT,
        url TEXT,
        score INTEGER,
        is_contribution INTEGER NOT NULL DEFAULT 0,
        organization_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_activities_member_dedup
        ON activities (member_id, timestamp, type, platform)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ix_activities_source
        ON activities (tenant_id, platform, source_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS member_merge_edges (
        member_id TEXT NOT NULL,
        other_member_id TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('to_merge', 'no_merge')),
        created_at TEXT NOT NULL,
        PRIMARY KEY (member_id, other_member_id, kind)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS merge_actions (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        primary_id TEXT NOT NULL,
        secondary_id TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS member_tags (
        member_id TEXT NOT NULL REFERENCES members(id) ON DELETE CASCADE,
        tag_id TEXT NOT NULL,
        PRIMARY KEY (member_id, tag_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS member_tasks (
        member_id TEXT NOT NULL REFERENCES members(id) ON DELETE CASCADE,
        task_id TEXT NOT NULL,
        PRIMARY KEY (member_id, task_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS member_notes (
        member_id TEXT NOT NULL REFERENCES members(id) ON DELETE CASCADE,
        note_id TEXT NOT NULL,
        PRIMARY KEY (member_id, note_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS organizations (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        display_name TEXT NOT NULL,
        fields TEXT NOT NULL DEFAULT '{}',
        attributes TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS organization_identities (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
        tenant_id TEXT NOT NULL,
        platform TEXT NOT NULL,
        type TEXT NOT NULL,
        value TEXT NOT NULL,
        verified INTEGER NOT NULL DEFAULT 0,
        source TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (organization_id, platform, type, value)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_organization_identities_verified
        ON organization_identities (tenant_id, platform, type, value) WHERE verified = 1
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_organization_primary_domain
        ON organization_identities (organization_id) WHERE verified = 1 AND type = 'primary-domain'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS member_organizations (
        id TEXT PRIMARY KEY,
        member_id TEXT NOT NULL REFERENCES members(id) ON DELETE CASCADE,
        organization_id TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
        title TEXT,
        date_start TEXT,
        date_end TEXT,
        source TEXT,
        created_at TEXT NOT NULL,
        deleted_at TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ix_member_organizations_member
        ON member_organizations (member_id, organization_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS integration_results (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        integration_id TEXT,
        platform TEXT NOT NULL,
        state TEXT NOT NULL,
        data TEXT NOT NULL,
        retries INTEGER NOT NULL DEFAULT 0,
        delayed_until TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        processed_at TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ix_integration_results_state
        ON integration_results (state, delayed_until)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS enrichment_cache (
        member_id TEXT NOT NULL REFERENCES members(id) ON DELETE CASCADE,
        source TEXT NOT NULL,
        data TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (member_id, source)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS erased_identities (
        tenant_id TEXT NOT NULL,
        platform TEXT NOT NULL,
        type TEXT NOT NULL,
        value TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, platform, type, value)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS organization_caches (
        id TEXT PRIMARY KEY,
        name TEXT,
        website TEXT,
        fields TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS organization_cache_links (
        organization_cache_id TEXT NOT NULL,
        organization_id TEXT NOT NULL,
        PRIMARY KEY (organization_cache_id, organization_id)
    )
    "#,
];
