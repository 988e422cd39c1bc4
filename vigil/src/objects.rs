//! Monitored objects
//!
//! Hosts and services as the scheduler sees them: identity, check settings
//! and the runtime state that checks, downtimes and time-change
//! compensation update.

use crate::broker::{Broker, BrokerEvent};
use crate::clock::Timestamp;
use crate::config::{HostConfig, ServiceConfig};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::{debug, info};

/// Host identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostId(pub u32);

/// Service identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub u32);

/// Reference to either kind of checkable object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    Host(HostId),
    Service(ServiceId),
}

/// Host state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostState {
    #[default]
    Up,
    Down,
    Unreachable,
}

impl HostState {
    /// Map a passive check return code (0-2)
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Up),
            1 => Some(Self::Down),
            2 => Some(Self::Unreachable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Unreachable => "UNREACHABLE",
        }
    }
}

/// Service state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceState {
    #[default]
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl ServiceState {
    /// Map a plugin return code (0-3)
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::Warning),
            2 => Some(Self::Critical),
            3 => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Soft or hard state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateType {
    Soft,
    #[default]
    Hard,
}

bitflags::bitflags! {
    /// Options attached to a scheduled check
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CheckOptions: u32 {
        /// Run even if checks are disabled or the parallel limit is reached
        const FORCE_EXECUTION = 1 << 0;
        /// Scheduled because the last result went stale
        const FRESHNESS_CHECK = 1 << 1;
        /// Rescheduled after the previous result never arrived
        const ORPHAN_CHECK = 1 << 2;
    }
}

/// Why a notification is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationReason {
    Problem,
    Recovery,
    Acknowledgement,
    DowntimeStart,
    DowntimeEnd,
    DowntimeCancelled,
}

impl NotificationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Problem => "PROBLEM",
            Self::Recovery => "RECOVERY",
            Self::Acknowledgement => "ACKNOWLEDGEMENT",
            Self::DowntimeStart => "DOWNTIMESTART",
            Self::DowntimeEnd => "DOWNTIMEEND",
            Self::DowntimeCancelled => "DOWNTIMECANCELLED",
        }
    }
}

impl fmt::Display for NotificationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check and notification state shared by hosts and services.
///
/// All intervals are stored in seconds.
#[derive(Debug, Clone, Default)]
pub struct Checkable {
    pub check_command: String,
    pub check_interval: u64,
    pub retry_interval: u64,
    pub max_attempts: u32,
    pub current_attempt: u32,
    pub state_type: StateType,
    pub active_checks_enabled: bool,
    pub should_be_scheduled: bool,
    pub check_options: CheckOptions,
    pub is_executing: bool,
    pub latency: f64,
    pub execution_time: f64,
    pub plugin_output: String,
    pub last_check: Timestamp,
    pub next_check: Timestamp,
    pub last_state_change: Timestamp,
    pub last_hard_state_change: Timestamp,
    pub notification_interval: u64,
    pub notification_number: u32,
    pub last_notification: Timestamp,
    pub next_notification: Timestamp,
    pub problem_acknowledged: bool,
    pub acknowledgement_sticky: bool,
    pub last_acknowledgement: Timestamp,
    /// Acknowledgement expiry (0 = never)
    pub acknowledgement_end_time: Timestamp,
    pub scheduled_downtime_depth: u32,
    pub pending_flex_downtime: u32,
    pub check_freshness: bool,
    pub freshness_threshold: u64,
}

impl Checkable {
    #[allow(clippy::too_many_arguments)]
    fn from_settings(
        check_command: &str,
        check_interval: u64,
        retry_interval: u64,
        max_attempts: u32,
        notification_interval: u64,
        active_checks_enabled: bool,
        check_freshness: bool,
        freshness_threshold: u64,
        interval_length: u64,
    ) -> Self {
        Self {
            check_command: check_command.to_string(),
            check_interval: check_interval * interval_length,
            retry_interval: retry_interval * interval_length,
            max_attempts: max_attempts.max(1),
            current_attempt: 1,
            notification_interval: notification_interval * interval_length,
            active_checks_enabled,
            check_freshness,
            freshness_threshold,
            ..Self::default()
        }
    }

    /// Copy configured settings over, keeping runtime state
    fn reconfigure(&mut self, fresh: Checkable) {
        self.check_command = fresh.check_command;
        self.check_interval = fresh.check_interval;
        self.retry_interval = fresh.retry_interval;
        self.max_attempts = fresh.max_attempts;
        self.current_attempt = self.current_attempt.min(self.max_attempts);
        self.notification_interval = fresh.notification_interval;
        self.active_checks_enabled = fresh.active_checks_enabled;
        self.check_freshness = fresh.check_freshness;
        self.freshness_threshold = fresh.freshness_threshold;
    }

    /// Whether a scheduled downtime currently covers this object
    pub fn in_downtime(&self) -> bool {
        self.scheduled_downtime_depth > 0
    }

    pub fn inc_scheduled_downtime_depth(&mut self) {
        self.scheduled_downtime_depth += 1;
    }

    pub fn dec_scheduled_downtime_depth(&mut self) {
        self.scheduled_downtime_depth = self.scheduled_downtime_depth.saturating_sub(1);
    }

    pub fn inc_pending_flex_downtime(&mut self) {
        self.pending_flex_downtime += 1;
    }

    pub fn dec_pending_flex_downtime(&mut self) {
        self.pending_flex_downtime = self.pending_flex_downtime.saturating_sub(1);
    }

    /// Clear the acknowledgement
    pub fn clear_acknowledgement(&mut self) {
        self.problem_acknowledged = false;
        self.acknowledgement_sticky = false;
        self.acknowledgement_end_time = 0;
    }

    /// Next check time after a result in the given problem/soft situation
    pub fn next_check_after(&self, now: Timestamp, soft_problem: bool) -> Timestamp {
        let interval = if soft_problem {
            self.retry_interval
        } else {
            self.check_interval
        };
        now + interval as i64
    }

    fn notification_allowed(&self, reason: NotificationReason) -> bool {
        match reason {
            NotificationReason::Problem => !self.in_downtime() && !self.problem_acknowledged,
            NotificationReason::Recovery | NotificationReason::Acknowledgement => {
                !self.in_downtime()
            }
            NotificationReason::DowntimeStart
            | NotificationReason::DowntimeEnd
            | NotificationReason::DowntimeCancelled => true,
        }
    }

    fn record_notification(&mut self, reason: NotificationReason, now: Timestamp) {
        match reason {
            NotificationReason::Problem => self.notification_number += 1,
            NotificationReason::Recovery => self.notification_number = 0,
            _ => {}
        }
        self.last_notification = now;
        self.recompute_next_notification();
    }

    /// Derive the next re-notification time from the last one
    pub fn recompute_next_notification(&mut self) {
        self.next_notification = if self.last_notification != 0 && self.notification_interval > 0 {
            self.last_notification + self.notification_interval as i64
        } else {
            0
        };
    }
}

/// Monitored host
#[derive(Debug, Clone)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub address: String,
    pub parents: Vec<String>,
    pub state: HostState,
    pub last_hard_state: HostState,
    pub check: Checkable,
}

/// Monitored service
#[derive(Debug, Clone)]
pub struct Service {
    pub id: ServiceId,
    pub host_id: HostId,
    pub host_name: String,
    pub description: String,
    pub state: ServiceState,
    pub last_hard_state: ServiceState,
    pub check: Checkable,
}

fn host_checkable(cfg: &HostConfig, interval_length: u64) -> Checkable {
    Checkable::from_settings(
        &cfg.check_command,
        cfg.check_interval,
        cfg.retry_interval,
        cfg.max_check_attempts,
        cfg.notification_interval,
        cfg.active_checks_enabled,
        cfg.check_freshness,
        cfg.freshness_threshold,
        interval_length,
    )
}

fn service_checkable(cfg: &ServiceConfig, interval_length: u64) -> Checkable {
    Checkable::from_settings(
        &cfg.check_command,
        cfg.check_interval,
        cfg.retry_interval,
        cfg.max_check_attempts,
        cfg.notification_interval,
        cfg.active_checks_enabled,
        cfg.check_freshness,
        cfg.freshness_threshold,
        interval_length,
    )
}

/// All hosts and services, indexed by id and by name
#[derive(Debug, Default)]
pub struct ObjectStore {
    hosts: BTreeMap<HostId, Host>,
    services: BTreeMap<ServiceId, Service>,
    host_index: HashMap<String, HostId>,
    service_index: HashMap<(String, String), ServiceId>,
    next_host_id: u32,
    next_service_id: u32,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host (or reconfigure it if the name is already known)
    pub fn add_host(&mut self, cfg: &HostConfig, interval_length: u64) -> HostId {
        if let Some(id) = self.find_host(&cfg.name) {
            self.update_host(id, cfg, interval_length);
            return id;
        }
        self.next_host_id += 1;
        let id = HostId(self.next_host_id);
        self.hosts.insert(
            id,
            Host {
                id,
                name: cfg.name.clone(),
                address: cfg.address.clone(),
                parents: cfg.parents.clone(),
                state: HostState::Up,
                last_hard_state: HostState::Up,
                check: host_checkable(cfg, interval_length),
            },
        );
        self.host_index.insert(cfg.name.clone(), id);
        debug!("Added host '{}'", cfg.name);
        id
    }

    /// Apply new settings to an existing host
    pub fn update_host(&mut self, id: HostId, cfg: &HostConfig, interval_length: u64) {
        if let Some(host) = self.hosts.get_mut(&id) {
            host.address = cfg.address.clone();
            host.parents = cfg.parents.clone();
            host.check.reconfigure(host_checkable(cfg, interval_length));
        }
    }

    /// Add a service (or reconfigure it if already known)
    pub fn add_service(&mut self, cfg: &ServiceConfig, interval_length: u64) -> Result<ServiceId> {
        let host_id = self
            .find_host(&cfg.host_name)
            .ok_or_else(|| EngineError::HostNotFound(cfg.host_name.clone()))?;
        if let Some(id) = self.find_service(&cfg.host_name, &cfg.description) {
            self.update_service(id, cfg, interval_length);
            return Ok(id);
        }
        self.next_service_id += 1;
        let id = ServiceId(self.next_service_id);
        self.services.insert(
            id,
            Service {
                id,
                host_id,
                host_name: cfg.host_name.clone(),
                description: cfg.description.clone(),
                state: ServiceState::Ok,
                last_hard_state: ServiceState::Ok,
                check: service_checkable(cfg, interval_length),
            },
        );
        self.service_index
            .insert((cfg.host_name.clone(), cfg.description.clone()), id);
        debug!("Added service '{}' on host '{}'", cfg.description, cfg.host_name);
        Ok(id)
    }

    /// Apply new settings to an existing service
    pub fn update_service(&mut self, id: ServiceId, cfg: &ServiceConfig, interval_length: u64) {
        if let Some(svc) = self.services.get_mut(&id) {
            svc.check.reconfigure(service_checkable(cfg, interval_length));
        }
    }

    /// Remove a host together with its services
    pub fn remove_host(&mut self, id: HostId) -> Option<Host> {
        for svc in self.services_of(id) {
            self.remove_service(svc);
        }
        let host = self.hosts.remove(&id)?;
        self.host_index.remove(&host.name);
        Some(host)
    }

    pub fn remove_service(&mut self, id: ServiceId) -> Option<Service> {
        let svc = self.services.remove(&id)?;
        self.service_index
            .remove(&(svc.host_name.clone(), svc.description.clone()));
        Some(svc)
    }

    pub fn host(&self, id: HostId) -> Option<&Host> {
        self.hosts.get(&id)
    }

    pub fn host_mut(&mut self, id: HostId) -> Option<&mut Host> {
        self.hosts.get_mut(&id)
    }

    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.services.get(&id)
    }

    pub fn service_mut(&mut self, id: ServiceId) -> Option<&mut Service> {
        self.services.get_mut(&id)
    }

    pub fn find_host(&self, name: &str) -> Option<HostId> {
        self.host_index.get(name).copied()
    }

    /// Look a host up by name, then by address
    pub fn find_host_by_name_or_address(&self, name: &str) -> Option<HostId> {
        self.find_host(name).or_else(|| {
            self.hosts
                .values()
                .find(|h| !h.address.is_empty() && h.address == name)
                .map(|h| h.id)
        })
    }

    pub fn find_service(&self, host_name: &str, description: &str) -> Option<ServiceId> {
        self.service_index
            .get(&(host_name.to_string(), description.to_string()))
            .copied()
    }

    /// Resolve a host name (and optional service description)
    pub fn resolve(&self, host_name: &str, service_description: Option<&str>) -> Option<ObjectRef> {
        match service_description {
            Some(desc) => self.find_service(host_name, desc).map(ObjectRef::Service),
            None => self.find_host(host_name).map(ObjectRef::Host),
        }
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn hosts_mut(&mut self) -> impl Iterator<Item = &mut Host> {
        self.hosts.values_mut()
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn services_mut(&mut self) -> impl Iterator<Item = &mut Service> {
        self.services.values_mut()
    }

    pub fn host_ids(&self) -> Vec<HostId> {
        self.hosts.keys().copied().collect()
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.services.keys().copied().collect()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Services that belong to a host
    pub fn services_of(&self, host: HostId) -> Vec<ServiceId> {
        self.services
            .values()
            .filter(|s| s.host_id == host)
            .map(|s| s.id)
            .collect()
    }

    /// Every host below `name` in the parent/child tree, nearest first
    pub fn descendants(&self, name: &str) -> Vec<HostId> {
        let mut seen: HashSet<&str> = HashSet::from([name]);
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        let mut result = Vec::new();

        while let Some(current) = queue.pop_front() {
            for host in self.hosts.values() {
                if host.parents.iter().any(|p| p == current) && seen.insert(host.name.as_str()) {
                    result.push(host.id);
                    queue.push_back(host.name.as_str());
                }
            }
        }
        result
    }

    pub fn checkable(&self, target: ObjectRef) -> Option<&Checkable> {
        match target {
            ObjectRef::Host(id) => self.hosts.get(&id).map(|h| &h.check),
            ObjectRef::Service(id) => self.services.get(&id).map(|s| &s.check),
        }
    }

    pub fn checkable_mut(&mut self, target: ObjectRef) -> Option<&mut Checkable> {
        match target {
            ObjectRef::Host(id) => self.hosts.get_mut(&id).map(|h| &mut h.check),
            ObjectRef::Service(id) => self.services.get_mut(&id).map(|s| &mut s.check),
        }
    }

    /// Whether the object is UP / OK (missing objects count as healthy)
    pub fn is_healthy(&self, target: ObjectRef) -> bool {
        match target {
            ObjectRef::Host(id) => self.hosts.get(&id).map_or(true, |h| h.state == HostState::Up),
            ObjectRef::Service(id) => self
                .services
                .get(&id)
                .map_or(true, |s| s.state == ServiceState::Ok),
        }
    }

    /// Soft non-OK state, where the retry interval applies
    pub fn in_soft_problem(&self, target: ObjectRef) -> bool {
        self.checkable(target)
            .is_some_and(|c| c.state_type == StateType::Soft && !self.is_healthy(target))
    }

    /// Host name and optional service description of an object
    pub fn names(&self, target: ObjectRef) -> Option<(String, Option<String>)> {
        match target {
            ObjectRef::Host(id) => self.hosts.get(&id).map(|h| (h.name.clone(), None)),
            ObjectRef::Service(id) => self
                .services
                .get(&id)
                .map(|s| (s.host_name.clone(), Some(s.description.clone()))),
        }
    }

    /// Send a notification for an object if its state allows it
    pub fn notify(
        &mut self,
        target: ObjectRef,
        reason: NotificationReason,
        author: &str,
        comment: &str,
        now: Timestamp,
        broker: &Broker,
    ) -> bool {
        let Some((host_name, service_description)) = self.names(target) else {
            return false;
        };
        let Some(check) = self.checkable_mut(target) else {
            return false;
        };
        if !check.notification_allowed(reason) {
            debug!("Notification ({}) suppressed for '{}'", reason, host_name);
            return false;
        }
        check.record_notification(reason, now);

        match &service_description {
            Some(desc) => info!(
                "SERVICE NOTIFICATION: {};{};{};{};{}",
                host_name, desc, reason, author, comment
            ),
            None => info!("HOST NOTIFICATION: {};{};{};{}", host_name, reason, author, comment),
        }
        broker.publish(BrokerEvent::Notification {
            host_name,
            service_description,
            reason,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str, parents: &[&str]) -> HostConfig {
        HostConfig {
            name: name.into(),
            address: format!("10.0.0.{}", name.len()),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            check_command: "exit 0".into(),
            check_interval: 5,
            retry_interval: 1,
            max_check_attempts: 3,
            notification_interval: 30,
            active_checks_enabled: true,
            check_freshness: false,
            freshness_threshold: 0,
        }
    }

    fn service(host: &str, desc: &str) -> ServiceConfig {
        ServiceConfig {
            host_name: host.into(),
            description: desc.into(),
            check_command: "exit 0".into(),
            check_interval: 5,
            retry_interval: 1,
            max_check_attempts: 3,
            notification_interval: 30,
            active_checks_enabled: true,
            check_freshness: false,
            freshness_threshold: 0,
        }
    }

    #[test]
    fn test_add_and_find() {
        let mut store = ObjectStore::new();
        let h = store.add_host(&host("web01", &[]), 60);
        let s = store.add_service(&service("web01", "http"), 60).unwrap();

        assert_eq!(store.find_host("web01"), Some(h));
        assert_eq!(store.find_service("web01", "http"), Some(s));
        assert_eq!(store.resolve("web01", Some("http")), Some(ObjectRef::Service(s)));
        assert_eq!(store.host(h).unwrap().check.check_interval, 300);
        assert!(store.add_service(&service("nope", "http"), 60).is_err());
    }

    #[test]
    fn test_find_by_address() {
        let mut store = ObjectStore::new();
        let h = store.add_host(&host("db", &[]), 60);
        assert_eq!(store.find_host_by_name_or_address("10.0.0.2"), Some(h));
        assert_eq!(store.find_host_by_name_or_address("db"), Some(h));
        assert_eq!(store.find_host_by_name_or_address("10.9.9.9"), None);
    }

    #[test]
    fn test_remove_host_drops_services() {
        let mut store = ObjectStore::new();
        let h = store.add_host(&host("web01", &[]), 60);
        store.add_service(&service("web01", "http"), 60).unwrap();
        store.add_service(&service("web01", "ssh"), 60).unwrap();

        assert!(store.remove_host(h).is_some());
        assert_eq!(store.service_count(), 0);
        assert!(store.find_service("web01", "ssh").is_none());
    }

    #[test]
    fn test_descendants() {
        let mut store = ObjectStore::new();
        store.add_host(&host("core", &[]), 60);
        let sw = store.add_host(&host("switch", &["core"]), 60);
        let a = store.add_host(&host("a", &["switch"]), 60);
        let b = store.add_host(&host("b", &["switch", "core"]), 60);

        let found = store.descendants("core");
        assert_eq!(found.len(), 3);
        assert!(found.contains(&sw) && found.contains(&a) && found.contains(&b));
        assert!(store.descendants("a").is_empty());
    }

    #[test]
    fn test_notification_suppressed_in_downtime() {
        let broker = Broker::default();
        let mut store = ObjectStore::new();
        let h = ObjectRef::Host(store.add_host(&host("web01", &[]), 60));

        store.checkable_mut(h).unwrap().inc_scheduled_downtime_depth();
        assert!(!store.notify(h, NotificationReason::Problem, "", "", 100, &broker));
        assert!(store.notify(h, NotificationReason::DowntimeStart, "", "", 100, &broker));

        let check = store.checkable(h).unwrap();
        assert_eq!(check.last_notification, 100);
        assert_eq!(check.next_notification, 100 + 1800);
    }

    #[test]
    fn test_counters_never_underflow() {
        let mut check = Checkable::default();
        check.dec_scheduled_downtime_depth();
        check.dec_pending_flex_downtime();
        assert_eq!(check.scheduled_downtime_depth, 0);
        assert_eq!(check.pending_flex_downtime, 0);
    }
}
