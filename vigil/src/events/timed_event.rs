//! Timed events
//!
//! A [`TimedEvent`] is one unit of scheduled work. It carries a type tag,
//! the time it should run, recurrence settings and a typed payload whose
//! meaning depends on the type. [`TimedEvent::handle`] is the dispatch
//! table that maps each type onto the engine operation it triggers.

use crate::broker::BrokerEvent;
use crate::clock::Timestamp;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::objects::{CheckOptions, HostId, ServiceId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Identity of a queued event
pub type EventId = u64;

/// Computes the next run time from the current time
pub type TimingFn = Arc<dyn Fn(Timestamp) -> Timestamp + Send + Sync>;

/// Kind of scheduled work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ServiceCheck,
    CommandCheck,
    LogRotation,
    ProgramShutdown,
    ProgramRestart,
    CheckReaper,
    OrphanCheck,
    RetentionSave,
    StatusSave,
    ScheduledDowntime,
    ServiceFreshnessCheck,
    ExpireDowntime,
    HostCheck,
    HostFreshnessCheck,
    RescheduleChecks,
    ExpireComment,
    ExpireHostAck,
    ExpireServiceAck,
    UserFunction,
    Sleep,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceCheck => "service check",
            Self::CommandCheck => "external command check",
            Self::LogRotation => "log rotation",
            Self::ProgramShutdown => "program shutdown",
            Self::ProgramRestart => "program restart",
            Self::CheckReaper => "check result reaper",
            Self::OrphanCheck => "orphaned check",
            Self::RetentionSave => "retention save",
            Self::StatusSave => "status save",
            Self::ScheduledDowntime => "scheduled downtime",
            Self::ServiceFreshnessCheck => "service freshness check",
            Self::ExpireDowntime => "downtime expiry",
            Self::HostCheck => "host check",
            Self::HostFreshnessCheck => "host freshness check",
            Self::RescheduleChecks => "check rescheduling",
            Self::ExpireComment => "comment expiry",
            Self::ExpireHostAck => "host acknowledgement expiry",
            Self::ExpireServiceAck => "service acknowledgement expiry",
            Self::UserFunction => "user function",
            Self::Sleep => "sleep",
        }
    }

    /// Host and service checks go through admission control
    pub fn is_check(&self) -> bool {
        matches!(self, Self::ServiceCheck | Self::HostCheck)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which queue an event lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

/// Callback run by a [`EventType::UserFunction`] event
#[derive(Clone)]
pub struct UserFunction(Arc<dyn Fn(&mut Engine) + Send + Sync>);

impl UserFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Engine) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for UserFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserFunction")
    }
}

/// What an event acts on
#[derive(Debug, Clone, Default)]
pub enum EventPayload {
    #[default]
    None,
    Host(HostId),
    Service(ServiceId),
    Downtime(u64),
    Comment(u64),
    Function(UserFunction),
}

impl EventPayload {
    /// Identity comparison used when removing events by target
    pub fn matches(&self, other: &EventPayload) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Host(a), Self::Host(b)) => a == b,
            (Self::Service(a), Self::Service(b)) => a == b,
            (Self::Downtime(a), Self::Downtime(b)) => a == b,
            (Self::Comment(a), Self::Comment(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

/// One schedulable unit of work
#[derive(Clone)]
pub struct TimedEvent {
    pub(crate) id: EventId,
    pub event_type: EventType,
    pub run_time: Timestamp,
    pub recurring: bool,
    /// Recurrence period in seconds
    pub event_interval: i64,
    pub compensate_for_time_change: bool,
    pub timing_func: Option<TimingFn>,
    pub payload: EventPayload,
    pub event_options: CheckOptions,
}

impl fmt::Debug for TimedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedEvent")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("run_time", &self.run_time)
            .field("recurring", &self.recurring)
            .field("event_interval", &self.event_interval)
            .field("compensate_for_time_change", &self.compensate_for_time_change)
            .field("timing_func", &self.timing_func.is_some())
            .field("payload", &self.payload)
            .field("event_options", &self.event_options)
            .finish()
    }
}

impl TimedEvent {
    /// One-shot event
    pub fn new(event_type: EventType, run_time: Timestamp) -> Self {
        Self {
            id: 0,
            event_type,
            run_time,
            recurring: false,
            event_interval: 0,
            compensate_for_time_change: false,
            timing_func: None,
            payload: EventPayload::None,
            event_options: CheckOptions::empty(),
        }
    }

    /// Repeat every `interval` seconds
    pub fn recurring(mut self, interval: i64) -> Self {
        self.recurring = true;
        self.event_interval = interval;
        self
    }

    /// Shift with the system clock when it jumps
    pub fn compensated(mut self) -> Self {
        self.compensate_for_time_change = true;
        self
    }

    pub fn with_timing(mut self, timing: TimingFn) -> Self {
        self.timing_func = Some(timing);
        self
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_options(mut self, options: CheckOptions) -> Self {
        self.event_options = options;
        self
    }

    /// Queue-assigned identity (0 until queued)
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Run the action behind this event.
    ///
    /// Failures are logged here and never reach the loop.
    pub fn handle(&self, engine: &mut Engine) {
        engine.broker.publish(BrokerEvent::TimedEventExecuted {
            id: self.id,
            event_type: self.event_type,
            run_time: self.run_time,
        });
        trace!("Handling event {} ({})", self.id, self.event_type);

        if let Err(e) = self.dispatch(engine) {
            if e.is_not_found() {
                debug!("{} event {}: {}", self.event_type, self.id, e);
            } else {
                error!("{} event {} failed: {}", self.event_type, self.id, e);
            }
        }
    }

    fn dispatch(&self, engine: &mut Engine) -> Result<()> {
        let latency = (engine.clock.now_precise() - self.run_time as f64).max(0.0);

        match (self.event_type, &self.payload) {
            (EventType::ServiceCheck, EventPayload::Service(id)) => {
                debug!("** Service Check Event ==> Service {:?}, Latency: {:.3} sec", id, latency);
                engine.run_scheduled_service_check(*id, self.event_options, latency)
            }
            (EventType::HostCheck, EventPayload::Host(id)) => {
                debug!("** Host Check Event ==> Host {:?}, Latency: {:.3} sec", id, latency);
                engine.run_scheduled_host_check(*id, self.event_options, latency)
            }
            (EventType::CommandCheck, _) => {
                debug!("** External Command Check Event");
                engine.check_for_external_commands();
                Ok(())
            }
            (EventType::CheckReaper, _) => {
                debug!("** Check Result Reaper");
                engine.reap_check_results()
            }
            (EventType::OrphanCheck, _) => {
                debug!("** Orphaned Host and Service Check Event");
                engine.check_for_orphaned_checks();
                Ok(())
            }
            (EventType::RetentionSave, _) => {
                debug!("** Retention Data Save Event");
                engine.save_retention()
            }
            (EventType::StatusSave, _) => {
                debug!("** Status Data Save Event");
                engine.save_status()
            }
            (EventType::ScheduledDowntime, EventPayload::Downtime(id)) => {
                debug!("** Scheduled Downtime Event ==> downtime {}", id);
                engine.handle_downtime(*id)
            }
            (EventType::ServiceFreshnessCheck, _) => {
                debug!("** Service Result Freshness Check Event");
                engine.check_service_freshness();
                Ok(())
            }
            (EventType::HostFreshnessCheck, _) => {
                debug!("** Host Result Freshness Check Event");
                engine.check_host_freshness();
                Ok(())
            }
            (EventType::ExpireDowntime, _) => {
                debug!("** Expire Downtime Event");
                engine.check_for_expired_downtime();
                Ok(())
            }
            (EventType::RescheduleChecks, _) => {
                debug!("** Reschedule Checks Event");
                engine.adjust_check_scheduling();
                Ok(())
            }
            (EventType::ExpireComment, EventPayload::Comment(id)) => {
                debug!("** Expire Comment Event ==> comment {}", id);
                engine.expire_comment(*id)
            }
            (EventType::ExpireHostAck, EventPayload::Host(id)) => {
                debug!("** Expire Host Acknowledgement Event");
                engine.expire_host_acknowledgement(*id)
            }
            (EventType::ExpireServiceAck, EventPayload::Service(id)) => {
                debug!("** Expire Service Acknowledgement Event");
                engine.expire_service_acknowledgement(*id)
            }
            (EventType::LogRotation, _) => {
                debug!("** Log File Rotation Event");
                engine.rotate_log();
                Ok(())
            }
            (EventType::ProgramShutdown, _) => {
                debug!("** Program Shutdown Event");
                engine.shutdown_requested = true;
                Ok(())
            }
            (EventType::ProgramRestart, _) => {
                debug!("** Program Restart Event");
                engine.restart_requested = true;
                Ok(())
            }
            (EventType::UserFunction, EventPayload::Function(f)) => {
                debug!("** User Function Event");
                (f.0)(engine);
                Ok(())
            }
            (EventType::Sleep, _) => Ok(()),
            (event_type, payload) => Err(EngineError::MalformedEvent(format!(
                "{} event carries unexpected payload {:?}",
                event_type, payload
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let event = TimedEvent::new(EventType::CheckReaper, 100)
            .recurring(10)
            .compensated();
        assert!(event.recurring);
        assert_eq!(event.event_interval, 10);
        assert!(event.compensate_for_time_change);
        assert_eq!(event.id(), 0);
    }

    #[test]
    fn test_payload_matching() {
        assert!(EventPayload::Downtime(3).matches(&EventPayload::Downtime(3)));
        assert!(!EventPayload::Downtime(3).matches(&EventPayload::Downtime(4)));
        assert!(!EventPayload::Host(HostId(1)).matches(&EventPayload::Service(ServiceId(1))));

        let f = UserFunction::new(|_| {});
        let same = EventPayload::Function(f.clone());
        assert!(same.matches(&EventPayload::Function(f)));
        assert!(!same.matches(&EventPayload::Function(UserFunction::new(|_| {}))));
    }

    #[test]
    fn test_check_types() {
        assert!(EventType::ServiceCheck.is_check());
        assert!(EventType::HostCheck.is_check());
        assert!(!EventType::ScheduledDowntime.is_check());
    }
}
