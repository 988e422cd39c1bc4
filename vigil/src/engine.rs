//! Scheduler context
//!
//! [`Engine`] owns the object store, comments, downtimes and the event
//! timeline, plus the checker and the deferred command queue. Everything
//! the loop dispatches runs against it with the engine lock held.

use crate::broker::{Broker, BrokerEvent};
use crate::checker::{CheckResult, Checker};
use crate::clock::{Clock, Timestamp};
use crate::command_manager::CommandManager;
use crate::comments::{Comment, CommentStore};
use crate::config::EngineConfig;
use crate::downtimes::{
    DowntimeContext, DowntimeFilter, DowntimeFinder, DowntimeKind, DowntimeManager,
    DowntimeRequest,
};
use crate::error::{EngineError, Result};
use crate::events::{EventPayload, EventType, Priority, TimedEvent, Timeline};
use crate::objects::{HostId, ObjectRef, ObjectStore, ServiceId};
use crate::retention::RetentionDocument;
use crate::status::StatusSnapshot;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Program-wide runtime status
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgramStatus {
    pub pid: u32,
    pub program_start: Timestamp,
    pub event_start: Timestamp,
    pub last_command_check: Timestamp,
    pub last_log_rotation: Timestamp,
    pub last_update: Timestamp,
    pub execute_service_checks: bool,
    pub execute_host_checks: bool,
    pub events_handled: u64,
}

impl ProgramStatus {
    fn new(config: &EngineConfig, now: Timestamp) -> Self {
        Self {
            pid: std::process::id(),
            program_start: now,
            execute_service_checks: config.scheduler.execute_service_checks,
            execute_host_checks: config.scheduler.execute_host_checks,
            ..Self::default()
        }
    }
}

/// The monitoring engine
pub struct Engine {
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub broker: Broker,
    pub objects: ObjectStore,
    pub comments: CommentStore,
    pub downtimes: DowntimeManager,
    pub events: Timeline,
    pub commands: Arc<CommandManager<Engine>>,
    pub program: ProgramStatus,
    pub(crate) checker: Box<dyn Checker>,
    pub(crate) passive_results: Vec<CheckResult>,
    pub shutdown_requested: bool,
    pub restart_requested: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("hosts", &self.objects.host_count())
            .field("services", &self.objects.service_count())
            .field("downtimes", &self.downtimes.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl Engine {
    /// Build an engine from a validated configuration
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>, checker: Box<dyn Checker>) -> Result<Self> {
        config.validate()?;

        let interval_length = config.scheduler.interval_length;
        let mut objects = ObjectStore::new();
        for host in &config.hosts {
            objects.add_host(host, interval_length);
        }
        for service in &config.services {
            objects.add_service(service, interval_length)?;
        }
        info!(
            "Loaded {} hosts and {} services",
            objects.host_count(),
            objects.service_count()
        );

        let broker = Broker::default();
        let now = clock.now();
        Ok(Self {
            program: ProgramStatus::new(&config, now),
            comments: CommentStore::new(broker.clone()),
            events: Timeline::new(broker.clone()),
            downtimes: DowntimeManager::new(),
            commands: Arc::new(CommandManager::new()),
            passive_results: Vec::new(),
            shutdown_requested: false,
            restart_requested: false,
            objects,
            checker,
            broker,
            clock,
            config,
        })
    }

    /// Restore retained state and queue the initial events
    pub fn start(&mut self) {
        if let Err(e) = self.restore_retention() {
            warn!("Failed to restore retention data: {}", e);
        }
        self.init_timing_loop();
        self.program.event_start = self.clock.now();
        self.update_program_status();
    }

    /// Queue work to run on the loop thread
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(&mut Engine) + Send + 'static,
    {
        self.commands.enqueue(task);
    }

    /// The downtime manager plus everything its operations touch
    pub fn downtime_parts(&mut self) -> (&mut DowntimeManager, DowntimeContext<'_>) {
        let now = self.clock.now();
        (
            &mut self.downtimes,
            DowntimeContext {
                objects: &mut self.objects,
                comments: &mut self.comments,
                events: &mut self.events,
                broker: &self.broker,
                now,
            },
        )
    }

    pub fn handle_downtime(&mut self, id: u64) -> Result<()> {
        let (downtimes, mut ctx) = self.downtime_parts();
        downtimes.handle(id, &mut ctx)
    }

    pub fn schedule_downtime(&mut self, kind: DowntimeKind, request: &DowntimeRequest) -> Result<u64> {
        let (downtimes, mut ctx) = self.downtime_parts();
        downtimes.schedule_downtime(kind, request, &mut ctx)
    }

    pub fn unschedule_downtime(&mut self, kind: Option<DowntimeKind>, id: u64) -> Result<()> {
        let (downtimes, mut ctx) = self.downtime_parts();
        downtimes.unschedule_downtime(kind, id, &mut ctx)
    }

    pub fn check_for_expired_downtime(&mut self) -> usize {
        let (downtimes, mut ctx) = self.downtime_parts();
        downtimes.check_for_expired_downtime(&mut ctx)
    }

    pub fn delete_downtimes_matching(&mut self, filter: &DowntimeFilter) -> usize {
        let (downtimes, mut ctx) = self.downtime_parts();
        downtimes.delete_downtime_by_hostname_service_description_start_time_comment(filter, &mut ctx)
    }

    /// Ids of downtimes matching every `(field, value)` pair
    pub fn find_downtimes<K: AsRef<str>, V: AsRef<str>>(&self, criteria: &[(K, V)]) -> Vec<u64> {
        DowntimeFinder::new(self.downtimes.downtimes()).find_matching_all(criteria)
    }

    /// Store a comment, queueing its expiry if it has one
    pub fn add_comment(&mut self, comment: Comment) -> u64 {
        let expires = comment.expires;
        let id = self.comments.add(comment, self.clock.now());
        if let Some(expires) = expires {
            self.events.add_event(
                TimedEvent::new(EventType::ExpireComment, expires)
                    .with_payload(EventPayload::Comment(id)),
                Priority::High,
            );
        }
        id
    }

    pub fn expire_comment(&mut self, id: u64) -> Result<()> {
        if self.comments.get(id).is_none() {
            return Err(EngineError::CommentNotFound(id));
        }
        if self.comments.remove_if_expired(id, self.clock.now()) {
            debug!("Comment {} expired", id);
        }
        Ok(())
    }

    /// Record a log rotation and dump the current object states
    pub fn rotate_log(&mut self) {
        let now = self.clock.now();
        info!("LOG ROTATION: {:?}", self.config.logging.rotation);
        for host in self.objects.hosts() {
            info!(
                "CURRENT HOST STATE: {};{};{:?};{};{}",
                host.name,
                host.state.as_str(),
                host.check.state_type,
                host.check.current_attempt,
                host.check.plugin_output
            );
        }
        for svc in self.objects.services() {
            info!(
                "CURRENT SERVICE STATE: {};{};{};{:?};{};{}",
                svc.host_name,
                svc.description,
                svc.state.as_str(),
                svc.check.state_type,
                svc.check.current_attempt,
                svc.check.plugin_output
            );
        }
        self.program.last_log_rotation = now;
    }

    /// Refresh the in-memory program status and announce it
    pub fn update_program_status(&mut self) {
        let now = self.clock.now();
        self.program.last_update = now;
        self.broker.publish(BrokerEvent::ProgramStatus {
            timestamp: now,
            running_checks: self.running_service_checks(),
            pending_commands: self.commands.pending(),
        });
    }

    pub fn save_status(&mut self) -> Result<()> {
        self.update_program_status();
        StatusSnapshot::capture(self).write(&self.config.status.file)
    }

    pub fn save_retention(&mut self) -> Result<()> {
        if !self.config.retention.enabled {
            return Ok(());
        }
        let document = RetentionDocument::capture(self);
        document.save(&self.config.retention.file)?;
        debug!(
            "Saved retention data for {} downtimes to {}",
            document.downtimes.len(),
            self.config.retention.file.display()
        );
        Ok(())
    }

    /// Load retained object state, comments and downtimes
    pub fn restore_retention(&mut self) -> Result<()> {
        let document = if self.config.retention.enabled {
            RetentionDocument::load(&self.config.retention.file)?
        } else {
            None
        };
        let records = match document {
            Some(document) => {
                document.restore_objects(&mut self.objects);
                self.program.execute_service_checks = document.program.execute_service_checks;
                self.program.execute_host_checks = document.program.execute_host_checks;
                for comment in document.comments {
                    self.add_comment(comment);
                }
                self.queue_acknowledgement_expiry();
                info!(
                    "Restored retention data ({} downtimes) from {}",
                    document.downtimes.len(),
                    self.config.retention.file.display()
                );
                document.downtimes
            }
            None => Vec::new(),
        };

        let (downtimes, mut ctx) = self.downtime_parts();
        downtimes.apply(&records, &mut ctx);
        Ok(())
    }

    fn queue_acknowledgement_expiry(&mut self) {
        let hosts = self
            .objects
            .hosts()
            .filter(|h| h.check.problem_acknowledged && h.check.acknowledgement_end_time > 0)
            .map(|h| (ObjectRef::Host(h.id), h.check.acknowledgement_end_time));
        let services = self
            .objects
            .services()
            .filter(|s| s.check.problem_acknowledged && s.check.acknowledgement_end_time > 0)
            .map(|s| (ObjectRef::Service(s.id), s.check.acknowledgement_end_time));
        let expiring: Vec<(ObjectRef, Timestamp)> = hosts.chain(services).collect();

        for (target, end_time) in expiring {
            let (event_type, payload) = match target {
                ObjectRef::Host(id) => (EventType::ExpireHostAck, EventPayload::Host(id)),
                ObjectRef::Service(id) => (EventType::ExpireServiceAck, EventPayload::Service(id)),
            };
            self.events.add_event(
                TimedEvent::new(event_type, end_time).with_payload(payload),
                Priority::High,
            );
        }
    }

    /// Apply a re-read configuration.
    ///
    /// Objects that disappeared lose their downtimes, comments and queued
    /// events; surviving objects keep their runtime state.
    pub fn apply(&mut self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        let now = self.clock.now();
        let interval_length = config.scheduler.interval_length;

        let wanted_services: HashSet<(&str, &str)> = config
            .services
            .iter()
            .map(|s| (s.host_name.as_str(), s.description.as_str()))
            .collect();
        let gone_services: Vec<ServiceId> = self
            .objects
            .services()
            .filter(|s| !wanted_services.contains(&(s.host_name.as_str(), s.description.as_str())))
            .map(|s| s.id)
            .collect();
        for id in gone_services {
            self.forget_service(id);
        }

        let wanted_hosts: HashSet<&str> = config.hosts.iter().map(|h| h.name.as_str()).collect();
        let gone_hosts: Vec<HostId> = self
            .objects
            .hosts()
            .filter(|h| !wanted_hosts.contains(h.name.as_str()))
            .map(|h| h.id)
            .collect();
        for id in gone_hosts {
            self.forget_host(id);
        }

        for host in &config.hosts {
            self.objects.add_host(host, interval_length);
        }
        for service in &config.services {
            self.objects.add_service(service, interval_length)?;
        }

        self.program.execute_service_checks = config.scheduler.execute_service_checks;
        self.program.execute_host_checks = config.scheduler.execute_host_checks;
        self.config = config;

        self.sync_check_events(now);
        self.schedule_maintenance_events(now);
        info!(
            "Configuration applied: {} hosts, {} services",
            self.objects.host_count(),
            self.objects.service_count()
        );
        Ok(())
    }

    fn forget_service(&mut self, id: ServiceId) {
        let Some(svc) = self.objects.service(id) else {
            return;
        };
        let host_name = svc.host_name.clone();
        let description = svc.description.clone();

        self.delete_downtimes_matching(&DowntimeFilter {
            host_name: Some(host_name.clone()),
            service_description: Some(description.clone()),
            ..DowntimeFilter::default()
        });
        self.comments.delete_all_for(&host_name, Some(&description));
        for event_type in [EventType::ServiceCheck, EventType::ExpireServiceAck] {
            self.events.remove_events(event_type, &EventPayload::Service(id));
        }
        self.objects.remove_service(id);
        info!("Removed service '{}' on host '{}'", description, host_name);
    }

    fn forget_host(&mut self, id: HostId) {
        for svc in self.objects.services_of(id) {
            self.forget_service(svc);
        }
        let Some(host) = self.objects.host(id) else {
            return;
        };
        let name = host.name.clone();

        self.delete_downtimes_matching(&DowntimeFilter {
            host_name: Some(name.clone()),
            ..DowntimeFilter::default()
        });
        self.comments.delete_all_for(&name, None);
        for event_type in [EventType::HostCheck, EventType::ExpireHostAck] {
            self.events.remove_events(event_type, &EventPayload::Host(id));
        }
        self.objects.remove_host(id);
        info!("Removed host '{}'", name);
    }

    /// Make queued check events agree with each object's active-check flag
    fn sync_check_events(&mut self, now: Timestamp) {
        let services: Vec<(ServiceId, bool, bool)> = self
            .objects
            .services()
            .map(|s| (s.id, s.check.active_checks_enabled, s.check.is_executing))
            .collect();
        for (id, active, executing) in services {
            let payload = EventPayload::Service(id);
            let queued = self.events.find_event(EventType::ServiceCheck, &payload).is_some();
            if active && !queued && !executing {
                self.schedule_service_check(id, now, Default::default());
            } else if !active && queued {
                self.events.remove_events(EventType::ServiceCheck, &payload);
            }
        }

        let hosts: Vec<(HostId, bool, bool)> = self
            .objects
            .hosts()
            .map(|h| (h.id, h.check.active_checks_enabled, h.check.is_executing))
            .collect();
        for (id, active, executing) in hosts {
            let payload = EventPayload::Host(id);
            let queued = self.events.find_event(EventType::HostCheck, &payload).is_some();
            if active && !queued && !executing {
                self.schedule_host_check(id, now, Default::default());
            } else if !active && queued {
                self.events.remove_events(EventType::HostCheck, &payload);
            }
        }
    }
}
