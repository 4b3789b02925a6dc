//! Data-sink ingestion: turns queued integration results into canonical state

mod activity;
mod context;
pub mod diagnostics;
mod member;
pub mod queue;
mod service;

pub use activity::{process_activity, ActivityOutcome};
pub use context::{SyncPlan, TenantContext};
pub use member::{is_bot_flagged, process_member_update, upsert_member, MemberOutcome};
pub use queue::{channel, spawn_delayed_sweeper, QueueMessage, QueueSender, QueueWorker};
pub use service::IngestService;
