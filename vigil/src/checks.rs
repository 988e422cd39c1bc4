//! Check scheduling and result processing
//!
//! Check events live in the low-priority queue, one per object. Results
//! come back through the checker's reaper (or as passive submissions) and
//! drive soft/hard state, notifications, acknowledgements and pending
//! flexible downtimes.

use crate::checker::{CheckRequest, CheckResult};
use crate::clock::Timestamp;
use crate::comments::{Comment, CommentEntryType};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::events::{EventPayload, EventType, Priority, TimedEvent};
use crate::objects::{
    CheckOptions, Checkable, HostId, HostState, NotificationReason, ObjectRef, ServiceId,
    ServiceState, StateType,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

fn check_event(target: ObjectRef) -> (EventType, EventPayload) {
    match target {
        ObjectRef::Host(id) => (EventType::HostCheck, EventPayload::Host(id)),
        ObjectRef::Service(id) => (EventType::ServiceCheck, EventPayload::Service(id)),
    }
}

fn ack_event(target: ObjectRef) -> (EventType, EventPayload) {
    match target {
        ObjectRef::Host(id) => (EventType::ExpireHostAck, EventPayload::Host(id)),
        ObjectRef::Service(id) => (EventType::ExpireServiceAck, EventPayload::Service(id)),
    }
}

fn missing(target: ObjectRef) -> EngineError {
    match target {
        ObjectRef::Host(id) => EngineError::HostNotFound(format!("#{}", id.0)),
        ObjectRef::Service(id) => EngineError::ServiceNotFound {
            host: String::new(),
            service: format!("#{}", id.0),
        },
    }
}

/// What a single result did to an object
#[derive(Debug, Default)]
struct Transition {
    state_changed: bool,
    hard_change: bool,
    soft_problem: bool,
    recovered: bool,
    notification: Option<NotificationReason>,
}

/// Apply soft/hard state logic for one result
fn apply_result(
    check: &mut Checkable,
    result: &CheckResult,
    now: Timestamp,
    was_problem: bool,
    is_problem: bool,
    state_changed: bool,
) -> Transition {
    let mut t = Transition {
        state_changed,
        ..Transition::default()
    };
    let was_hard = check.state_type == StateType::Hard;

    if !result.passive {
        check.is_executing = false;
    }
    check.last_check = now;
    check.latency = result.latency;
    check.execution_time = result.execution_time();
    check.plugin_output = result.output.clone();

    match (was_problem, is_problem) {
        (false, false) => {
            check.current_attempt = 1;
            check.state_type = StateType::Hard;
        }
        (true, false) => {
            check.current_attempt = 1;
            check.state_type = StateType::Hard;
            t.recovered = true;
            if was_hard {
                t.hard_change = true;
                t.notification = Some(NotificationReason::Recovery);
            }
        }
        (false, true) => {
            check.current_attempt = 1;
            if check.max_attempts <= 1 {
                check.state_type = StateType::Hard;
                t.hard_change = true;
                t.notification = Some(NotificationReason::Problem);
            } else {
                check.state_type = StateType::Soft;
            }
        }
        (true, true) if !was_hard => {
            check.current_attempt = (check.current_attempt + 1).min(check.max_attempts);
            if check.current_attempt >= check.max_attempts {
                check.state_type = StateType::Hard;
                t.hard_change = true;
                t.notification = Some(NotificationReason::Problem);
            }
        }
        (true, true) => {
            if state_changed {
                t.hard_change = true;
                t.notification = Some(NotificationReason::Problem);
            } else if check.next_notification != 0 && now >= check.next_notification {
                t.notification = Some(NotificationReason::Problem);
            }
        }
    }

    if state_changed {
        check.last_state_change = now;
    }
    if t.hard_change {
        check.last_hard_state_change = now;
    }
    t.soft_problem = is_problem && check.state_type == StateType::Soft;
    t
}

impl Engine {
    /// Queue a service check
    pub fn schedule_service_check(&mut self, id: ServiceId, check_time: Timestamp, options: CheckOptions) {
        self.schedule_check(ObjectRef::Service(id), check_time, options);
    }

    /// Queue a host check
    pub fn schedule_host_check(&mut self, id: HostId, check_time: Timestamp, options: CheckOptions) {
        self.schedule_check(ObjectRef::Host(id), check_time, options);
    }

    /// Queue a check for an object.
    ///
    /// An object has at most one queued check. A forced request replaces an
    /// unforced one and is never replaced by one; otherwise the earlier of
    /// the two wins.
    pub fn schedule_check(&mut self, target: ObjectRef, check_time: Timestamp, options: CheckOptions) {
        if self.objects.checkable(target).is_none() {
            debug!("Not scheduling check for unknown object {:?}", target);
            return;
        }
        let (event_type, payload) = check_event(target);
        let forced = options.contains(CheckOptions::FORCE_EXECUTION);

        let existing = self
            .events
            .find_event(event_type, &payload)
            .map(|(e, _)| (e.id(), e.run_time, e.event_options));
        if let Some((id, run_time, existing_options)) = existing {
            let existing_forced = existing_options.contains(CheckOptions::FORCE_EXECUTION);
            let keep_existing = if forced != existing_forced {
                existing_forced
            } else {
                run_time <= check_time
            };
            if keep_existing {
                trace!("Keeping queued {} for {:?} at {}", event_type, target, run_time);
                return;
            }
            self.events.remove_event(id);
        }

        if let Some(check) = self.objects.checkable_mut(target) {
            check.next_check = check_time;
            check.check_options = options;
            check.should_be_scheduled = true;
        }
        self.events.add_event(
            TimedEvent::new(event_type, check_time)
                .compensated()
                .with_payload(payload)
                .with_options(options),
            Priority::Low,
        );
    }

    pub fn run_scheduled_service_check(
        &mut self,
        id: ServiceId,
        options: CheckOptions,
        latency: f64,
    ) -> Result<()> {
        self.run_scheduled_check(ObjectRef::Service(id), options, latency)
    }

    pub fn run_scheduled_host_check(&mut self, id: HostId, options: CheckOptions, latency: f64) -> Result<()> {
        self.run_scheduled_check(ObjectRef::Host(id), options, latency)
    }

    fn run_scheduled_check(&mut self, target: ObjectRef, options: CheckOptions, latency: f64) -> Result<()> {
        let now = self.clock.now();
        let (execute_enabled, timeout) = match target {
            ObjectRef::Host(_) => (
                self.program.execute_host_checks,
                self.config.checks.host_check_timeout,
            ),
            ObjectRef::Service(_) => (
                self.program.execute_service_checks,
                self.config.checks.service_check_timeout,
            ),
        };
        let soft_problem = self.objects.in_soft_problem(target);
        let check = self.objects.checkable_mut(target).ok_or_else(|| missing(target))?;

        if check.is_executing {
            debug!("Check of {:?} is already running", target);
            return Ok(());
        }
        if !options.contains(CheckOptions::FORCE_EXECUTION)
            && (!execute_enabled || !check.active_checks_enabled)
        {
            let next = check.next_check_after(now, soft_problem);
            let active = check.active_checks_enabled;
            debug!("Active checks disabled for {:?}, not running", target);
            if active {
                self.schedule_check(target, next, CheckOptions::empty());
            }
            return Ok(());
        }

        check.is_executing = true;
        check.latency = latency;
        check.check_options = options;
        let request = CheckRequest {
            target,
            command: check.check_command.clone(),
            timeout: Duration::from_secs(timeout),
            options,
            latency,
        };

        if let Err(e) = self.checker.run_check(request) {
            let retry = self.objects.checkable_mut(target).map(|check| {
                check.is_executing = false;
                now + check.retry_interval as i64
            });
            if let Some(retry) = retry {
                self.schedule_check(target, retry, CheckOptions::empty());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Service checks currently running
    pub fn running_service_checks(&self) -> usize {
        self.objects.services().filter(|s| s.check.is_executing).count()
    }

    /// Process every finished active result and every queued passive one
    pub fn reap_check_results(&mut self) -> Result<()> {
        let mut results = self.checker.reap();
        results.append(&mut self.passive_results);
        if results.is_empty() {
            return Ok(());
        }
        debug!("Processing {} check results", results.len());
        for result in results {
            match result.target {
                ObjectRef::Host(id) => self.process_host_result(id, &result),
                ObjectRef::Service(id) => self.process_service_result(id, &result),
            }
        }
        Ok(())
    }

    fn process_service_result(&mut self, id: ServiceId, result: &CheckResult) {
        let now = self.clock.now();
        let Some(svc) = self.objects.service_mut(id) else {
            debug!("Discarding result for removed service {:?}", id);
            return;
        };
        let new_state = ServiceState::from_code(result.return_code).unwrap_or(ServiceState::Unknown);
        let old_state = svc.state;
        svc.state = new_state;

        let t = apply_result(
            &mut svc.check,
            result,
            now,
            old_state != ServiceState::Ok,
            new_state != ServiceState::Ok,
            old_state != new_state,
        );
        if t.hard_change {
            svc.last_hard_state = new_state;
        }
        if t.state_changed || t.hard_change || t.soft_problem {
            info!(
                "SERVICE ALERT: {};{};{};{:?};{};{}",
                svc.host_name,
                svc.description,
                new_state.as_str(),
                svc.check.state_type,
                svc.check.current_attempt,
                svc.check.plugin_output
            );
        }
        let host_name = svc.host_name.clone();
        let description = svc.description.clone();

        self.after_result(ObjectRef::Service(id), result, &t, now);
        if new_state != ServiceState::Ok && t.state_changed {
            let (downtimes, mut ctx) = self.downtime_parts();
            downtimes.check_pending_flex_service_downtime(&host_name, &description, &mut ctx);
        }
    }

    fn process_host_result(&mut self, id: HostId, result: &CheckResult) {
        let now = self.clock.now();
        let new_state = if result.passive {
            HostState::from_code(result.return_code).unwrap_or(HostState::Down)
        } else if result.return_code == 0 || result.return_code == 1 {
            HostState::Up
        } else {
            self.host_problem_state(id)
        };

        let Some(host) = self.objects.host_mut(id) else {
            debug!("Discarding result for removed host {:?}", id);
            return;
        };
        let old_state = host.state;
        host.state = new_state;

        let t = apply_result(
            &mut host.check,
            result,
            now,
            old_state != HostState::Up,
            new_state != HostState::Up,
            old_state != new_state,
        );
        if t.hard_change {
            host.last_hard_state = new_state;
        }
        if t.state_changed || t.hard_change || t.soft_problem {
            info!(
                "HOST ALERT: {};{};{:?};{};{}",
                host.name,
                new_state.as_str(),
                host.check.state_type,
                host.check.current_attempt,
                host.check.plugin_output
            );
        }
        let name = host.name.clone();

        self.after_result(ObjectRef::Host(id), result, &t, now);
        if new_state != HostState::Up && t.state_changed {
            let (downtimes, mut ctx) = self.downtime_parts();
            downtimes.check_pending_flex_host_downtime(&name, &mut ctx);
        }
    }

    /// DOWN unless every parent is down, then UNREACHABLE
    fn host_problem_state(&self, id: HostId) -> HostState {
        let Some(host) = self.objects.host(id) else {
            return HostState::Down;
        };
        let parents_down = !host.parents.is_empty()
            && host.parents.iter().all(|p| {
                self.objects
                    .find_host(p)
                    .and_then(|pid| self.objects.host(pid))
                    .is_some_and(|parent| parent.state != HostState::Up)
            });
        if parents_down {
            HostState::Unreachable
        } else {
            HostState::Down
        }
    }

    /// Acknowledgements, notifications and the next check
    fn after_result(&mut self, target: ObjectRef, result: &CheckResult, t: &Transition, now: Timestamp) {
        let clear_ack = self.objects.checkable(target).is_some_and(|check| {
            check.problem_acknowledged
                && (t.recovered || (t.state_changed && !check.acknowledgement_sticky))
        });
        if clear_ack {
            self.remove_acknowledgement(target);
        }

        if let Some(reason) = t.notification {
            self.objects
                .notify(target, reason, "", &result.output, now, &self.broker);
        }

        if result.passive {
            return;
        }
        let next = self.objects.checkable(target).and_then(|check| {
            check
                .active_checks_enabled
                .then(|| check.next_check_after(now, t.soft_problem))
        });
        if let Some(next) = next {
            self.schedule_check(target, next, CheckOptions::empty());
        }
    }

    /// Reset checks whose results are long overdue and run them again
    pub fn check_for_orphaned_checks(&mut self) {
        let now = self.clock.now();
        let reaper = self.config.scheduler.check_reaper_interval as i64;
        let service_timeout = self.config.checks.service_check_timeout as i64;
        let host_timeout = self.config.checks.host_check_timeout as i64;

        let overdue = |check: &Checkable, timeout: i64| {
            check.is_executing
                && check.next_check + check.latency.ceil() as i64 + timeout + reaper < now
        };
        let mut orphans: Vec<ObjectRef> = self
            .objects
            .services()
            .filter(|s| overdue(&s.check, service_timeout))
            .map(|s| ObjectRef::Service(s.id))
            .collect();
        orphans.extend(
            self.objects
                .hosts()
                .filter(|h| overdue(&h.check, host_timeout))
                .map(|h| ObjectRef::Host(h.id)),
        );

        for target in orphans {
            if let Some((host, service)) = self.objects.names(target) {
                warn!(
                    "The check of '{}' {:?} looks like it was orphaned (results never came back). \
                     Rescheduling it",
                    host, service
                );
            }
            if let Some(check) = self.objects.checkable_mut(target) {
                check.is_executing = false;
            }
            self.schedule_check(target, now, CheckOptions::ORPHAN_CHECK);
        }
    }

    pub fn check_service_freshness(&mut self) {
        let targets: Vec<ObjectRef> = self
            .objects
            .services()
            .map(|s| ObjectRef::Service(s.id))
            .collect();
        self.check_freshness(targets);
    }

    pub fn check_host_freshness(&mut self) {
        let targets: Vec<ObjectRef> = self.objects.hosts().map(|h| ObjectRef::Host(h.id)).collect();
        self.check_freshness(targets);
    }

    /// Force a check of every object whose last result went stale
    fn check_freshness(&mut self, targets: Vec<ObjectRef>) {
        let now = self.clock.now();
        let slack = self.config.scheduler.additional_freshness_latency as i64;
        let program_start = self.program.program_start;

        for target in targets {
            let soft_problem = self.objects.in_soft_problem(target);
            let Some(check) = self.objects.checkable(target) else {
                continue;
            };
            if !check.check_freshness || check.is_executing {
                continue;
            }
            let threshold = if check.freshness_threshold > 0 {
                check.freshness_threshold as i64
            } else {
                let interval = if soft_problem {
                    check.retry_interval
                } else {
                    check.check_interval
                };
                interval as i64 + check.latency.ceil() as i64 + slack
            };
            let reference = if check.last_check == 0 {
                program_start
            } else {
                check.last_check
            };
            if now <= reference + threshold {
                continue;
            }

            if let Some((host, service)) = self.objects.names(target) {
                warn!(
                    "The results of '{}' {:?} are stale by {} seconds (threshold={} seconds). \
                     Forcing an immediate check",
                    host,
                    service,
                    now - reference - threshold,
                    threshold
                );
            }
            self.schedule_check(
                target,
                now,
                CheckOptions::FORCE_EXECUTION | CheckOptions::FRESHNESS_CHECK,
            );
        }
    }

    /// Acknowledge a host or service problem
    #[allow(clippy::too_many_arguments)]
    pub fn acknowledge_problem(
        &mut self,
        target: ObjectRef,
        sticky: bool,
        notify: bool,
        persistent: bool,
        author: &str,
        comment: &str,
        end_time: Option<Timestamp>,
    ) -> Result<()> {
        let now = self.clock.now();
        let (host_name, service_description) = self.objects.names(target).ok_or_else(|| missing(target))?;
        if self.objects.is_healthy(target) {
            return Err(EngineError::CommandRejected(format!(
                "'{}' {:?} is not in a problem state",
                host_name, service_description
            )));
        }

        if let Some(check) = self.objects.checkable_mut(target) {
            check.problem_acknowledged = true;
            check.acknowledgement_sticky = sticky;
            check.last_acknowledgement = now;
            check.acknowledgement_end_time = end_time.unwrap_or(0);
        }
        if notify {
            self.objects.notify(
                target,
                NotificationReason::Acknowledgement,
                author,
                comment,
                now,
                &self.broker,
            );
        }
        self.add_comment(
            Comment::new(
                host_name,
                service_description,
                CommentEntryType::Acknowledgement,
                author,
                comment,
            )
            .persistent(persistent),
        );
        if let Some(end_time) = end_time {
            let (event_type, payload) = ack_event(target);
            self.events.remove_events(event_type, &payload);
            self.events.add_event(
                TimedEvent::new(event_type, end_time).with_payload(payload),
                Priority::High,
            );
        }
        Ok(())
    }

    /// Clear an acknowledgement with its comments and expiry event
    pub fn remove_acknowledgement(&mut self, target: ObjectRef) {
        let Some((host_name, service_description)) = self.objects.names(target) else {
            return;
        };
        if let Some(check) = self.objects.checkable_mut(target) {
            check.clear_acknowledgement();
        }
        self.comments.delete_matching(
            &host_name,
            service_description.as_deref(),
            CommentEntryType::Acknowledgement,
        );
        let (event_type, payload) = ack_event(target);
        self.events.remove_events(event_type, &payload);
    }

    pub fn expire_host_acknowledgement(&mut self, id: HostId) -> Result<()> {
        self.expire_acknowledgement(ObjectRef::Host(id))
    }

    pub fn expire_service_acknowledgement(&mut self, id: ServiceId) -> Result<()> {
        self.expire_acknowledgement(ObjectRef::Service(id))
    }

    fn expire_acknowledgement(&mut self, target: ObjectRef) -> Result<()> {
        let now = self.clock.now();
        let check = self.objects.checkable(target).ok_or_else(|| missing(target))?;
        let expired = check.problem_acknowledged
            && check.acknowledgement_end_time != 0
            && check.acknowledgement_end_time <= now;
        if expired {
            debug!("Acknowledgement of {:?} expired", target);
            self.remove_acknowledgement(target);
        }
        Ok(())
    }

    /// Queue a passive service result for the next reaper run
    pub fn submit_passive_service_result(
        &mut self,
        host_name: &str,
        description: &str,
        return_code: i32,
        output: &str,
    ) -> Result<()> {
        if !(0..=3).contains(&return_code) {
            return Err(EngineError::InvalidCommand(format!(
                "service return code {} out of range",
                return_code
            )));
        }
        let host = self
            .objects
            .find_host_by_name_or_address(host_name)
            .and_then(|id| self.objects.host(id))
            .ok_or_else(|| EngineError::HostNotFound(host_name.to_string()))?;
        let id = self
            .objects
            .find_service(&host.name, description)
            .ok_or_else(|| EngineError::ServiceNotFound {
                host: host_name.to_string(),
                service: description.to_string(),
            })?;
        let now = self.clock.now();
        self.passive_results
            .push(CheckResult::passive(ObjectRef::Service(id), return_code, output, now));
        Ok(())
    }

    /// Queue a passive host result for the next reaper run
    pub fn submit_passive_host_result(&mut self, host_name: &str, return_code: i32, output: &str) -> Result<()> {
        if !(0..=2).contains(&return_code) {
            return Err(EngineError::InvalidCommand(format!(
                "host return code {} out of range",
                return_code
            )));
        }
        let id = self
            .objects
            .find_host_by_name_or_address(host_name)
            .ok_or_else(|| EngineError::HostNotFound(host_name.to_string()))?;
        let now = self.clock.now();
        self.passive_results
            .push(CheckResult::passive(ObjectRef::Host(id), return_code, output, now));
        Ok(())
    }

    /// Run every queued external command on this thread
    pub fn check_for_external_commands(&mut self) {
        self.program.last_command_check = self.clock.now();
        let commands = Arc::clone(&self.commands);
        commands.execute_pending(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downtimes::{DowntimeKind, DowntimeRequest};
    use crate::engine::tests::{config, engine_with, NOW};

    fn result(target: ObjectRef, code: i32) -> CheckResult {
        CheckResult {
            target,
            return_code: code,
            output: format!("rc={}", code),
            start_time: NOW as f64,
            finish_time: NOW as f64 + 0.5,
            latency: 0.2,
            options: CheckOptions::empty(),
            passive: false,
        }
    }

    fn queued_check(engine: &Engine, target: ObjectRef) -> Option<(Timestamp, CheckOptions)> {
        let (event_type, payload) = check_event(target);
        engine
            .events
            .find_event(event_type, &payload)
            .map(|(e, _)| (e.run_time, e.event_options))
    }

    #[test]
    fn test_schedule_keeps_earliest() {
        let (mut engine, _, _) = engine_with(config());
        let id = engine.objects.find_service("web01", "http").unwrap();
        let target = ObjectRef::Service(id);

        engine.schedule_service_check(id, NOW + 100, CheckOptions::empty());
        engine.schedule_service_check(id, NOW + 200, CheckOptions::empty());
        assert_eq!(queued_check(&engine, target).unwrap().0, NOW + 100);

        engine.schedule_service_check(id, NOW + 50, CheckOptions::empty());
        assert_eq!(queued_check(&engine, target).unwrap().0, NOW + 50);
        assert_eq!(engine.events.queue(Priority::Low).len(), 1);
    }

    #[test]
    fn test_forced_check_wins() {
        let (mut engine, _, _) = engine_with(config());
        let id = engine.objects.find_service("web01", "http").unwrap();
        let target = ObjectRef::Service(id);

        engine.schedule_service_check(id, NOW + 10, CheckOptions::empty());
        engine.schedule_service_check(id, NOW + 300, CheckOptions::FORCE_EXECUTION);
        assert_eq!(
            queued_check(&engine, target).unwrap(),
            (NOW + 300, CheckOptions::FORCE_EXECUTION)
        );

        engine.schedule_service_check(id, NOW, CheckOptions::empty());
        assert_eq!(queued_check(&engine, target).unwrap().0, NOW + 300);
    }

    #[test]
    fn test_run_hands_request_to_checker() {
        let (mut engine, _, checker) = engine_with(config());
        let id = engine.objects.find_service("web01", "http").unwrap();

        engine
            .run_scheduled_service_check(id, CheckOptions::empty(), 0.25)
            .unwrap();
        let requests = checker.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].command, "exit 0");
        assert_eq!(requests[0].timeout, Duration::from_secs(60));
        assert!(engine.objects.service(id).unwrap().check.is_executing);
        assert_eq!(engine.running_service_checks(), 1);
    }

    #[test]
    fn test_disabled_checks_are_rescheduled() {
        let (mut engine, _, checker) = engine_with(config());
        engine.program.execute_service_checks = false;
        let id = engine.objects.find_service("web01", "http").unwrap();

        engine
            .run_scheduled_service_check(id, CheckOptions::empty(), 0.0)
            .unwrap();
        assert!(checker.requests.lock().is_empty());
        assert_eq!(
            queued_check(&engine, ObjectRef::Service(id)).unwrap().0,
            NOW + 300
        );

        engine
            .run_scheduled_service_check(id, CheckOptions::FORCE_EXECUTION, 0.0)
            .unwrap();
        assert_eq!(checker.requests.lock().len(), 1);
    }

    #[test]
    fn test_soft_then_hard_problem() {
        let (mut engine, clock, checker) = engine_with(config());
        let mut rx = engine.broker.subscribe();
        let id = engine.objects.find_service("web01", "http").unwrap();
        let target = ObjectRef::Service(id);

        for attempt in 1..=3 {
            engine.run_scheduled_service_check(id, CheckOptions::empty(), 0.0).unwrap();
            checker.results.lock().push(result(target, 2));
            engine.reap_check_results().unwrap();

            let svc = engine.objects.service(id).unwrap();
            assert_eq!(svc.state, ServiceState::Critical);
            assert_eq!(svc.check.current_attempt, attempt);
            clock.advance(60);
        }

        let svc = engine.objects.service(id).unwrap();
        assert_eq!(svc.check.state_type, StateType::Hard);
        assert_eq!(svc.last_hard_state, ServiceState::Critical);
        assert_eq!(svc.check.notification_number, 1);

        let notified = std::iter::from_fn(|| rx.try_recv().ok()).any(|e| {
            matches!(
                e,
                crate::broker::BrokerEvent::Notification {
                    reason: NotificationReason::Problem,
                    ..
                }
            )
        });
        assert!(notified);
    }

    #[test]
    fn test_retry_interval_while_soft() {
        let (mut engine, _, checker) = engine_with(config());
        let id = engine.objects.find_service("web01", "http").unwrap();
        let target = ObjectRef::Service(id);

        engine.run_scheduled_service_check(id, CheckOptions::empty(), 0.0).unwrap();
        checker.results.lock().push(result(target, 1));
        engine.reap_check_results().unwrap();
        assert_eq!(queued_check(&engine, target).unwrap().0, NOW + 60);

        // the loop pops the event before running it
        engine.events.remove_events(EventType::ServiceCheck, &EventPayload::Service(id));
        engine.run_scheduled_service_check(id, CheckOptions::empty(), 0.0).unwrap();
        checker.results.lock().push(result(target, 0));
        engine.reap_check_results().unwrap();
        assert_eq!(queued_check(&engine, target).unwrap().0, NOW + 300);
        assert_eq!(engine.objects.service(id).unwrap().check.state_type, StateType::Hard);
    }

    #[test]
    fn test_recovery_clears_acknowledgement() {
        let (mut engine, _, _) = engine_with(config());
        let id = engine.objects.find_service("web01", "http").unwrap();
        let target = ObjectRef::Service(id);

        assert!(engine
            .acknowledge_problem(target, false, false, false, "ops", "known", None)
            .is_err());

        engine.submit_passive_service_result("web01", "http", 2, "down").unwrap();
        engine.reap_check_results().unwrap();
        engine
            .acknowledge_problem(target, true, true, false, "ops", "known", Some(NOW + 600))
            .unwrap();
        assert!(engine.objects.service(id).unwrap().check.problem_acknowledged);
        assert_eq!(engine.comments.len(), 1);
        assert!(engine
            .events
            .find_event(EventType::ExpireServiceAck, &EventPayload::Service(id))
            .is_some());

        engine.submit_passive_service_result("web01", "http", 0, "fine").unwrap();
        engine.reap_check_results().unwrap();
        let check = &engine.objects.service(id).unwrap().check;
        assert!(!check.problem_acknowledged);
        assert!(engine.comments.is_empty());
        assert!(engine
            .events
            .find_event(EventType::ExpireServiceAck, &EventPayload::Service(id))
            .is_none());
    }

    #[test]
    fn test_acknowledgement_expiry() {
        let (mut engine, clock, _) = engine_with(config());
        let host = engine.objects.find_host("db01").unwrap();
        let target = ObjectRef::Host(host);

        engine.submit_passive_host_result("db01", 1, "down").unwrap();
        engine.reap_check_results().unwrap();
        engine
            .acknowledge_problem(target, true, false, false, "ops", "known", Some(NOW + 10))
            .unwrap();

        engine.expire_host_acknowledgement(host).unwrap();
        assert!(engine.objects.host(host).unwrap().check.problem_acknowledged);

        clock.advance(10);
        engine.expire_host_acknowledgement(host).unwrap();
        assert!(!engine.objects.host(host).unwrap().check.problem_acknowledged);
    }

    #[test]
    fn test_host_unreachable_behind_down_parent() {
        let mut cfg = config();
        cfg.hosts[0].parents = vec!["db01".into()];
        let (mut engine, _, checker) = engine_with(cfg);
        let web = engine.objects.find_host("web01").unwrap();

        engine.submit_passive_host_result("db01", 1, "down").unwrap();
        engine.reap_check_results().unwrap();

        engine.run_scheduled_host_check(web, CheckOptions::empty(), 0.0).unwrap();
        checker.results.lock().push(result(ObjectRef::Host(web), 2));
        engine.reap_check_results().unwrap();
        assert_eq!(engine.objects.host(web).unwrap().state, HostState::Unreachable);
    }

    #[test]
    fn test_passive_validation() {
        let (mut engine, _, _) = engine_with(config());
        assert!(engine.submit_passive_service_result("web01", "http", 4, "").is_err());
        assert!(engine.submit_passive_host_result("web01", 3, "").is_err());
        assert!(engine
            .submit_passive_service_result("nowhere", "http", 0, "")
            .unwrap_err()
            .is_not_found());
        assert!(engine
            .submit_passive_service_result("web01", "smtp", 0, "")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_problem_starts_pending_flexible_downtime() {
        let (mut engine, _, _) = engine_with(config());
        let request = DowntimeRequest {
            host_name: "web01".into(),
            entry_time: NOW,
            author: "ops".into(),
            comment: "flex".into(),
            start_time: NOW - 10,
            end_time: NOW + 3600,
            fixed: false,
            duration: 600,
            ..DowntimeRequest::default()
        };
        let id = engine.schedule_downtime(DowntimeKind::Host, &request).unwrap();
        engine.handle_downtime(id).unwrap();
        let host = engine.objects.find_host("web01").unwrap();
        assert_eq!(engine.objects.host(host).unwrap().check.pending_flex_downtime, 1);

        engine.submit_passive_host_result("web01", 1, "down").unwrap();
        engine.reap_check_results().unwrap();
        assert!(engine.downtimes.find_downtime(None, id).unwrap().in_effect);
        assert!(engine.objects.host(host).unwrap().check.in_downtime());
    }

    #[test]
    fn test_orphaned_check_is_rescheduled() {
        let (mut engine, clock, _) = engine_with(config());
        let id = engine.objects.find_service("web01", "http").unwrap();
        engine.schedule_service_check(id, NOW, CheckOptions::empty());
        engine.events.remove_events(EventType::ServiceCheck, &EventPayload::Service(id));
        engine.run_scheduled_service_check(id, CheckOptions::empty(), 0.0).unwrap();

        clock.advance(60 + 10);
        engine.check_for_orphaned_checks();
        assert!(engine.objects.service(id).unwrap().check.is_executing);

        clock.advance(1);
        engine.check_for_orphaned_checks();
        assert!(!engine.objects.service(id).unwrap().check.is_executing);
        assert_eq!(
            queued_check(&engine, ObjectRef::Service(id)).unwrap(),
            (NOW + 71, CheckOptions::ORPHAN_CHECK)
        );
    }

    #[test]
    fn test_stale_results_force_check() {
        let mut cfg = config();
        cfg.services[0].check_freshness = true;
        cfg.services[0].freshness_threshold = 120;
        let (mut engine, clock, _) = engine_with(cfg);
        let id = engine.objects.find_service("web01", "http").unwrap();

        clock.advance(120);
        engine.check_service_freshness();
        assert!(queued_check(&engine, ObjectRef::Service(id)).is_none());

        clock.advance(1);
        engine.check_service_freshness();
        let (_, options) = queued_check(&engine, ObjectRef::Service(id)).unwrap();
        assert!(options.contains(CheckOptions::FRESHNESS_CHECK | CheckOptions::FORCE_EXECUTION));
    }

    #[test]
    fn test_external_commands_run_on_check() {
        let (mut engine, _, _) = engine_with(config());
        engine.submit(|engine: &mut Engine| engine.program.events_handled = 42);
        engine.check_for_external_commands();
        assert_eq!(engine.program.events_handled, 42);
        assert_eq!(engine.program.last_command_check, NOW);
    }
}
