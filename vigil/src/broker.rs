//! Event broker
//!
//! Side channel that publishes what the scheduler does: timed events,
//! downtime transitions, comments and notifications. Publishing never
//! fails from the caller's point of view; with no subscribers the event
//! is simply dropped.

use crate::clock::Timestamp;
use crate::downtimes::DowntimeKind;
use crate::events::EventType;
use crate::objects::NotificationReason;
use tokio::sync::broadcast;

/// Why a downtime stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Window ran out
    Normal,
    /// Cancelled before its natural end
    Cancelled,
}

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Timed event queued
    TimedEventAdded {
        id: u64,
        event_type: EventType,
        run_time: Timestamp,
    },
    /// Timed event removed before firing
    TimedEventRemoved { id: u64, event_type: EventType },
    /// Timed event about to run
    TimedEventExecuted {
        id: u64,
        event_type: EventType,
        run_time: Timestamp,
    },
    /// Loop went idle
    Sleep { millis: u64 },
    /// Downtime created
    DowntimeAdded {
        id: u64,
        kind: DowntimeKind,
        host_name: String,
        service_description: Option<String>,
    },
    /// Downtime restored from retention
    DowntimeLoaded { id: u64, kind: DowntimeKind },
    /// Downtime went into effect
    DowntimeStarted { id: u64, kind: DowntimeKind },
    /// Downtime left effect
    DowntimeStopped {
        id: u64,
        kind: DowntimeKind,
        reason: StopReason,
    },
    /// Downtime removed from the manager
    DowntimeDeleted { id: u64, kind: DowntimeKind },
    /// Comment created
    CommentAdded { id: u64 },
    /// Comment deleted
    CommentDeleted { id: u64 },
    /// Idle poll for external commands
    ExternalCommandCheck,
    /// Notification sent for a host or service
    Notification {
        host_name: String,
        service_description: Option<String>,
        reason: NotificationReason,
    },
    /// Periodic program status refresh
    ProgramStatus {
        timestamp: Timestamp,
        running_checks: usize,
        pending_commands: usize,
    },
}

/// Broadcast publisher shared by the engine components
#[derive(Debug, Clone)]
pub struct Broker {
    sender: broadcast::Sender<BrokerEvent>,
}

impl Broker {
    /// Create a broker whose subscribers can lag by `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event
    pub fn publish(&self, event: BrokerEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let broker = Broker::default();
        broker.publish(BrokerEvent::ExternalCommandCheck);
    }

    #[test]
    fn test_subscriber_receives_events() {
        let broker = Broker::new(8);
        let mut rx = broker.subscribe();
        broker.publish(BrokerEvent::CommentAdded { id: 7 });
        match rx.try_recv() {
            Ok(BrokerEvent::CommentAdded { id }) => assert_eq!(id, 7),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
