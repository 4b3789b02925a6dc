//! Event types for the CDP event system
//!
//! Provides shared event definitions and the EventBus used by every service
//! to publish state changes and downstream sync requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Integration result processing state
///
/// PENDING → PROCESSING → {PROCESSED | ERROR | DELAYED}; DELAYED is swept
/// back to PENDING once `delayed_until` passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultState {
    Pending,
    Processing,
    Processed,
    Error,
    Delayed,
}

impl ResultState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultState::Pending => "pending",
            ResultState::Processing => "processing",
            ResultState::Processed => "processed",
            ResultState::Error => "error",
            ResultState::Delayed => "delayed",
        }
    }

    /// PROCESSED and ERROR are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResultState::Processed | ResultState::Error)
    }
}

impl fmt::Display for ResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ResultState::Pending),
            "processing" => Ok(ResultState::Processing),
            "processed" => Ok(ResultState::Processed),
            "error" => Ok(ResultState::Error),
            "delayed" => Ok(ResultState::Delayed),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown result state: {}",
                other
            ))),
        }
    }
}

/// CDP event types
///
/// Events are broadcast via EventBus. Sync requests are only emitted after the
/// transaction that produced them has committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CdpEvent {
    /// Member must be (re)indexed by the search service
    MemberSyncRequested {
        tenant_id: Uuid,
        member_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Organization must be (re)indexed by the search service
    OrganizationSyncRequested {
        tenant_id: Uuid,
        organization_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Member must be removed from the search index
    MemberRemovalRequested {
        tenant_id: Uuid,
        member_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Integration result moved between processing states
    ResultStateChanged {
        result_id: Uuid,
        old_state: ResultState,
        new_state: ResultState,
        retries: i64,
        timestamp: DateTime<Utc>,
    },

    /// Secondary member was absorbed into the primary
    MembersMerged {
        tenant_id: Uuid,
        primary_id: Uuid,
        secondary_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Enrichment run finished for a member
    MemberEnriched {
        tenant_id: Uuid,
        member_id: Uuid,
        /// Sources whose data changed the member
        sources: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

/// In-process broadcast bus for CdpEvent
///
/// Cloning the bus shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CdpEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: CdpEvent) -> Result<usize, broadcast::error::SendError<CdpEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: CdpEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_state_round_trip() {
        for state in [
            ResultState::Pending,
            ResultState::Processing,
            ResultState::Processed,
            ResultState::Error,
            ResultState::Delayed,
        ] {
            assert_eq!(state.as_str().parse::<ResultState>().unwrap(), state);
        }
        assert!("done".parse::<ResultState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ResultState::Processed.is_terminal());
        assert!(ResultState::Error.is_terminal());
        assert!(!ResultState::Delayed.is_terminal());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = CdpEvent::MemberSyncRequested {
            tenant_id: Uuid::nil(),
            member_id: Uuid::nil(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "MemberSyncRequested");
    }

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let member_id = Uuid::new_v4();

        bus.emit(CdpEvent::MemberRemovalRequested {
            tenant_id: Uuid::nil(),
            member_id,
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            CdpEvent::MemberRemovalRequested { member_id: got, .. } => assert_eq!(got, member_id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_errors_but_lossy_does_not() {
        let bus = EventBus::new(4);
        let event = CdpEvent::OrganizationSyncRequested {
            tenant_id: Uuid::nil(),
            organization_id: Uuid::nil(),
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 4);
    }
}
