//! A single scheduled downtime
//!
//! A downtime is a maintenance window on a host or a service. It moves
//! through `pending -> scheduled -> in effect -> stopped` and its
//! transitions are driven by the [`DowntimeManager`](super::DowntimeManager),
//! which owns every downtime and handles the trigger cascades. The methods
//! here cover the per-downtime half of each transition: counters,
//! notifications, broker events and the timed events it schedules.

use crate::broker::{Broker, BrokerEvent, StopReason};
use crate::clock::{format_timestamp, time_breakdown, Timestamp};
use crate::comments::{Comment, CommentEntryType, CommentStore};
use crate::error::{EngineError, Result};
use crate::events::{EventPayload, EventType, Priority, TimedEvent, Timeline};
use crate::objects::{NotificationReason, ObjectRef, ObjectStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Author used for comments the engine writes itself
pub const ENGINE_AUTHOR: &str = "(Vigil Process)";

/// Host or service downtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DowntimeKind {
    Host,
    Service,
}

impl DowntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for DowntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a downtime covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DowntimeTarget {
    Host {
        host_name: String,
    },
    Service {
        host_name: String,
        service_description: String,
    },
}

impl DowntimeTarget {
    pub fn kind(&self) -> DowntimeKind {
        match self {
            Self::Host { .. } => DowntimeKind::Host,
            Self::Service { .. } => DowntimeKind::Service,
        }
    }

    pub fn host_name(&self) -> &str {
        match self {
            Self::Host { host_name } | Self::Service { host_name, .. } => host_name,
        }
    }

    pub fn service_description(&self) -> Option<&str> {
        match self {
            Self::Host { .. } => None,
            Self::Service {
                service_description,
                ..
            } => Some(service_description),
        }
    }

    pub(crate) fn not_found(&self) -> EngineError {
        match self {
            Self::Host { host_name } => EngineError::HostNotFound(host_name.clone()),
            Self::Service {
                host_name,
                service_description,
            } => EngineError::ServiceNotFound {
                host: host_name.clone(),
                service: service_description.clone(),
            },
        }
    }
}

/// Parameters for a new downtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DowntimeRequest {
    pub host_name: String,
    /// Set for service downtimes
    pub service_description: Option<String>,
    pub entry_time: Timestamp,
    pub author: String,
    pub comment: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub fixed: bool,
    pub triggered_by: u64,
    /// Active length of a flexible downtime, in seconds
    pub duration: u64,
}

/// Serialized form kept in the retention file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowntimeRecord {
    pub kind: DowntimeKind,
    pub host_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_description: Option<String>,
    pub downtime_id: u64,
    pub entry_time: Timestamp,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub fixed: bool,
    pub triggered_by: u64,
    pub duration: u64,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub comment: String,
}

/// Borrowed engine state a downtime transition works against
pub struct DowntimeContext<'a> {
    pub objects: &'a mut ObjectStore,
    pub comments: &'a mut CommentStore,
    pub events: &'a mut Timeline,
    pub broker: &'a Broker,
    pub now: Timestamp,
}

/// One maintenance window
#[derive(Debug, Clone, PartialEq)]
pub struct Downtime {
    pub id: u64,
    pub target: DowntimeTarget,
    pub entry_time: Timestamp,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub fixed: bool,
    pub triggered_by: u64,
    pub duration: u64,
    pub author: String,
    pub comment: String,
    pub comment_id: Option<u64>,
    pub in_effect: bool,
    pub incremented_pending_downtime: bool,
    pub start_flex_downtime: bool,
}

impl Downtime {
    /// Build a downtime from a request; the target is chosen by `kind`
    pub fn new(id: u64, kind: DowntimeKind, request: &DowntimeRequest) -> Self {
        let target = match kind {
            DowntimeKind::Host => DowntimeTarget::Host {
                host_name: request.host_name.clone(),
            },
            DowntimeKind::Service => DowntimeTarget::Service {
                host_name: request.host_name.clone(),
                service_description: request.service_description.clone().unwrap_or_default(),
            },
        };
        Self {
            id,
            target,
            entry_time: request.entry_time,
            start_time: request.start_time,
            end_time: request.end_time,
            fixed: request.fixed,
            triggered_by: request.triggered_by,
            duration: request.duration,
            author: request.author.clone(),
            comment: request.comment.clone(),
            comment_id: None,
            in_effect: false,
            incremented_pending_downtime: false,
            start_flex_downtime: false,
        }
    }

    /// Rebuild a downtime from its retention record
    pub fn from_record(record: &DowntimeRecord) -> Self {
        let request = DowntimeRequest {
            host_name: record.host_name.clone(),
            service_description: record.service_description.clone(),
            entry_time: record.entry_time,
            author: record.author.clone(),
            comment: record.comment.clone(),
            start_time: record.start_time,
            end_time: record.end_time,
            fixed: record.fixed,
            triggered_by: record.triggered_by,
            duration: record.duration,
        };
        Self::new(record.downtime_id, record.kind, &request)
    }

    pub fn kind(&self) -> DowntimeKind {
        self.target.kind()
    }

    pub fn host_name(&self) -> &str {
        self.target.host_name()
    }

    pub fn service_description(&self) -> Option<&str> {
        self.target.service_description()
    }

    /// Find the object this downtime covers
    pub fn resolve(&self, objects: &ObjectStore) -> Option<ObjectRef> {
        objects.resolve(self.host_name(), self.service_description())
    }

    /// The target is gone or the window already ended
    pub fn is_stale(&self, objects: &ObjectStore, now: Timestamp) -> bool {
        self.resolve(objects).is_none() || self.end_time < now
    }

    pub fn retention_record(&self) -> DowntimeRecord {
        DowntimeRecord {
            kind: self.kind(),
            host_name: self.host_name().to_string(),
            service_description: self.service_description().map(str::to_string),
            downtime_id: self.id,
            entry_time: self.entry_time,
            start_time: self.start_time,
            end_time: self.end_time,
            fixed: self.fixed,
            triggered_by: self.triggered_by,
            duration: self.duration,
            author: self.author.clone(),
            comment: self.comment.clone(),
        }
    }

    /// Text of the comment created when the downtime is subscribed
    pub fn comment_text(&self) -> String {
        let kind = self.kind().as_str();
        let start = format_timestamp(self.start_time);
        let end = format_timestamp(self.end_time);
        if self.fixed {
            format!(
                "This {kind} has been scheduled for fixed downtime from {start} to {end} \
                 Notifications for the {kind} will not be sent out during that time period."
            )
        } else {
            let (days, hours, minutes, _) = time_breakdown(self.duration);
            format!(
                "This {kind} has been scheduled for flexible downtime starting between {start} \
                 and {end} and lasting for a period of {} hours and {minutes} minutes. \
                 Notifications for the {kind} will not be sent out during that time period.",
                days * 24 + hours
            )
        }
    }

    fn alert(&self, what: &str) {
        match &self.target {
            DowntimeTarget::Host { host_name } => {
                let text = match what {
                    "STARTED" => "Host has entered a period of scheduled downtime",
                    "STOPPED" => "Host has exited from a period of scheduled downtime",
                    _ => "Scheduled downtime for host has been cancelled.",
                };
                info!("HOST DOWNTIME ALERT: {};{}; {}", host_name, what, text);
            }
            DowntimeTarget::Service {
                host_name,
                service_description,
            } => {
                let text = match what {
                    "STARTED" => "Service has entered a period of scheduled downtime",
                    "STOPPED" => "Service has exited from a period of scheduled downtime",
                    _ => "Scheduled downtime for service has been cancelled.",
                };
                info!(
                    "SERVICE DOWNTIME ALERT: {};{};{}; {}",
                    host_name, service_description, what, text
                );
            }
        }
    }

    /// Register with the scheduler: comment plus, for untriggered
    /// downtimes, the activation event at `start_time`
    pub(crate) fn subscribe(&mut self, ctx: &mut DowntimeContext<'_>) -> Result<()> {
        if self.resolve(ctx.objects).is_none() {
            return Err(self.target.not_found());
        }

        let (_, hours, minutes, seconds) = time_breakdown(self.duration);
        debug!(
            "Scheduled downtime details: type={} host={} service={:?} fixed={} start={} end={} \
             duration={}h {}m {}s id={} trigger={}",
            self.kind(),
            self.host_name(),
            self.service_description(),
            self.fixed,
            format_timestamp(self.start_time),
            format_timestamp(self.end_time),
            hours,
            minutes,
            seconds,
            self.id,
            self.triggered_by
        );

        let comment = Comment::new(
            self.host_name(),
            self.service_description().map(str::to_string),
            CommentEntryType::Downtime,
            ENGINE_AUTHOR,
            self.comment_text(),
        );
        self.comment_id = Some(ctx.comments.add(comment, ctx.now));

        if self.triggered_by == 0 {
            ctx.events.add_event(
                TimedEvent::new(EventType::ScheduledDowntime, self.start_time)
                    .with_payload(EventPayload::Downtime(self.id)),
                Priority::High,
            );
        }
        Ok(())
    }

    /// Flexible downtime waiting for a problem: count it as pending and
    /// queue a sweep so an unused window cannot linger
    pub(crate) fn enter_pending(&mut self, target: ObjectRef, ctx: &mut DowntimeContext<'_>) {
        if !self.incremented_pending_downtime {
            if let Some(check) = ctx.objects.checkable_mut(target) {
                check.inc_pending_flex_downtime();
                self.incremented_pending_downtime = true;
            }
        }
        // shares its payload with the recurring sweep, so deleting the
        // downtime leaves it queued and it runs as a no-op
        ctx.events.add_event(
            TimedEvent::new(EventType::ExpireDowntime, self.end_time + 1),
            Priority::High,
        );
    }

    /// Undo the pending-flex bookkeeping, once
    pub(crate) fn release_pending(&mut self, target: Option<ObjectRef>, ctx: &mut DowntimeContext<'_>) {
        if self.fixed || !self.incremented_pending_downtime {
            return;
        }
        if let Some(check) = target.and_then(|t| ctx.objects.checkable_mut(t)) {
            check.dec_pending_flex_downtime();
        }
        self.incremented_pending_downtime = false;
    }

    /// Enter effect and queue the matching stop event
    pub(crate) fn start(&mut self, target: ObjectRef, ctx: &mut DowntimeContext<'_>) {
        ctx.broker.publish(BrokerEvent::DowntimeStarted {
            id: self.id,
            kind: self.kind(),
        });

        let depth = ctx
            .objects
            .checkable(target)
            .map_or(0, |c| c.scheduled_downtime_depth);
        if depth == 0 {
            debug!(
                "{} '{}' has entered a period of scheduled downtime (id={})",
                self.kind(),
                self.host_name(),
                self.id
            );
            self.alert("STARTED");
            ctx.objects.notify(
                target,
                NotificationReason::DowntimeStart,
                &self.author,
                &self.comment,
                ctx.now,
                ctx.broker,
            );
        }
        if let Some(check) = ctx.objects.checkable_mut(target) {
            check.inc_scheduled_downtime_depth();
        }
        self.in_effect = true;

        // triggered downtimes are stopped by their parent
        if self.triggered_by == 0 {
            let stop_time = if self.fixed {
                self.end_time
            } else {
                ctx.now + self.duration as i64
            };
            ctx.events.add_event(
                TimedEvent::new(EventType::ScheduledDowntime, stop_time)
                    .with_payload(EventPayload::Downtime(self.id)),
                Priority::High,
            );
        }
    }

    /// Leave effect. A missing target skips the counter bookkeeping.
    pub(crate) fn stop(
        &mut self,
        target: Option<ObjectRef>,
        reason: StopReason,
        ctx: &mut DowntimeContext<'_>,
    ) {
        ctx.broker.publish(BrokerEvent::DowntimeStopped {
            id: self.id,
            kind: self.kind(),
            reason,
        });
        self.in_effect = false;

        let Some(target) = target else {
            return;
        };
        let depth = match ctx.objects.checkable_mut(target) {
            Some(check) => {
                check.dec_scheduled_downtime_depth();
                check.scheduled_downtime_depth
            }
            None => return,
        };
        if depth == 0 {
            let (label, notification) = match reason {
                StopReason::Normal => ("STOPPED", NotificationReason::DowntimeEnd),
                StopReason::Cancelled => ("CANCELLED", NotificationReason::DowntimeCancelled),
            };
            debug!(
                "{} '{}' has exited from a period of scheduled downtime (id={})",
                self.kind(),
                self.host_name(),
                self.id
            );
            self.alert(label);
            let (author, comment) = match reason {
                StopReason::Normal => (self.author.as_str(), self.comment.as_str()),
                StopReason::Cancelled => ("", ""),
            };
            ctx.objects
                .notify(target, notification, author, comment, ctx.now, ctx.broker);
        }
    }
}

impl fmt::Display for Downtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            DowntimeTarget::Host { host_name } => {
                writeln!(f, "hostdowntime {{")?;
                writeln!(f, "\thost_name={}", host_name)?;
            }
            DowntimeTarget::Service {
                host_name,
                service_description,
            } => {
                writeln!(f, "servicedowntime {{")?;
                writeln!(f, "\thost_name={}", host_name)?;
                writeln!(f, "\tservice_description={}", service_description)?;
            }
        }
        writeln!(f, "\tdowntime_id={}", self.id)?;
        writeln!(f, "\tentry_time={}", self.entry_time)?;
        writeln!(f, "\tstart_time={}", self.start_time)?;
        writeln!(f, "\tend_time={}", self.end_time)?;
        writeln!(f, "\ttriggered_by={}", self.triggered_by)?;
        writeln!(f, "\tfixed={}", u8::from(self.fixed))?;
        writeln!(f, "\tduration={}", self.duration)?;
        writeln!(f, "\tauthor={}", self.author)?;
        writeln!(f, "\tcomment={}", self.comment)?;
        writeln!(f, "\t}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DowntimeRequest {
        DowntimeRequest {
            host_name: "web01".into(),
            service_description: Some("http".into()),
            entry_time: 100,
            author: "ops".into(),
            comment: "patching".into(),
            start_time: 1_000,
            end_time: 2_000,
            fixed: false,
            triggered_by: 0,
            duration: 5_400,
        }
    }

    #[test]
    fn test_target_follows_kind() {
        let host = Downtime::new(1, DowntimeKind::Host, &request());
        assert_eq!(host.kind(), DowntimeKind::Host);
        assert_eq!(host.service_description(), None);

        let svc = Downtime::new(2, DowntimeKind::Service, &request());
        assert_eq!(svc.service_description(), Some("http"));
        assert_eq!(svc.host_name(), "web01");
    }

    #[test]
    fn test_record_round_trip() {
        let original = Downtime::new(9, DowntimeKind::Service, &request());
        let record = original.retention_record();
        let json = serde_json::to_string(&record).unwrap();
        let restored = Downtime::from_record(&serde_json::from_str(&json).unwrap());
        assert_eq!(restored, original);
    }

    #[test]
    fn test_print_format() {
        let dt = Downtime::new(3, DowntimeKind::Host, &request());
        let text = dt.to_string();
        assert!(text.starts_with("hostdowntime {\n\thost_name=web01\n\tdowntime_id=3\n"));
        assert!(text.contains("\tfixed=0\n"));
        assert!(text.contains("\tcomment=patching\n"));
        assert!(text.ends_with("\t}\n"));
    }

    #[test]
    fn test_flexible_comment_text() {
        let dt = Downtime::new(3, DowntimeKind::Host, &request());
        let text = dt.comment_text();
        assert!(text.starts_with("This host has been scheduled for flexible downtime"));
        assert!(text.contains("lasting for a period of 1 hours and 30 minutes."));
    }

    #[test]
    fn test_fixed_comment_text() {
        let mut req = request();
        req.fixed = true;
        let dt = Downtime::new(3, DowntimeKind::Service, &req);
        assert!(dt
            .comment_text()
            .starts_with("This service has been scheduled for fixed downtime from"));
    }

    #[test]
    fn test_staleness() {
        let objects = ObjectStore::new();
        let dt = Downtime::new(1, DowntimeKind::Host, &request());
        assert!(dt.is_stale(&objects, 0));
    }
}
