//! Search-index synchronization seam
//!
//! Sync requests are fire-and-acknowledge and are only issued after the
//! transaction that produced them has committed.

use async_trait::async_trait;
use cdp_common::events::{CdpEvent, EventBus};
use cdp_common::time::now;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::SinkResult;

#[async_trait]
pub trait SearchSyncEmitter: Send + Sync {
    async fn trigger_member_sync(&self, tenant_id: Uuid, member_id: Uuid) -> SinkResult<()>;

    async fn trigger_organization_sync(
        &self,
        tenant_id: Uuid,
        organization_id: Uuid,
    ) -> SinkResult<()>;

    async fn trigger_remove_member(&self, tenant_id: Uuid, member_id: Uuid) -> SinkResult<()>;
}

/// Publishes sync requests on the process event bus
#[derive(Clone)]
pub struct EventBusSync {
    events: EventBus,
}

impl EventBusSync {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

#[async_trait]
impl SearchSyncEmitter for EventBusSync {
    async fn trigger_member_sync(&self, tenant_id: Uuid, member_id: Uuid) -> SinkResult<()> {
        self.events.emit_lossy(CdpEvent::MemberSyncRequested {
            tenant_id,
            member_id,
            timestamp: now(),
        });
        Ok(())
    }

    async fn trigger_organization_sync(
        &self,
        tenant_id: Uuid,
        organization_id: Uuid,
    ) -> SinkResult<()> {
        self.events.emit_lossy(CdpEvent::OrganizationSyncRequested {
            tenant_id,
            organization_id,
            timestamp: now(),
        });
        Ok(())
    }

    async fn trigger_remove_member(&self, tenant_id: Uuid, member_id: Uuid) -> SinkResult<()> {
        self.events.emit_lossy(CdpEvent::MemberRemovalRequested {
            tenant_id,
            member_id,
            timestamp: now(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCall {
    Member(Uuid),
    Organization(Uuid),
    RemoveMember(Uuid),
}

/// Keeps every request in memory; used by tests and dry runs
#[derive(Debug, Default)]
pub struct RecordingSync {
    calls: Mutex<Vec<SyncCall>>,
}

impl RecordingSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SyncCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: SyncCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl SearchSyncEmitter for RecordingSync {
    async fn trigger_member_sync(&self, _tenant_id: Uuid, member_id: Uuid) -> SinkResult<()> {
        self.record(SyncCall::Member(member_id));
        Ok(())
    }

    async fn trigger_organization_sync(
        &self,
        _tenant_id: Uuid,
        organization_id: Uuid,
    ) -> SinkResult<()> {
        self.record(SyncCall::Organization(organization_id));
        Ok(())
    }

    async fn trigger_remove_member(&self, _tenant_id: Uuid, member_id: Uuid) -> SinkResult<()> {
        self.record(SyncCall::RemoveMember(member_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_sync_emits_requests() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let sync = EventBusSync::new(bus);
        let tenant = Uuid::new_v4();
        let member = Uuid::new_v4();

        sync.trigger_member_sync(tenant, member).await.unwrap();

        match rx.recv().await.unwrap() {
            CdpEvent::MemberSyncRequested { member_id, .. } => assert_eq!(member_id, member),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
