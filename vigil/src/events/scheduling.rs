//! Timing loop bootstrap, time-change compensation and check rescheduling

use super::timed_event::{EventPayload, EventType, Priority, TimedEvent};
use crate::clock::{time_breakdown, Timestamp};
use crate::config::RotationMethod;
use crate::engine::Engine;
use crate::objects::{CheckOptions, Checkable, HostId, ServiceId};
use chrono::{Datelike, Duration, Local, NaiveDate, TimeZone, Timelike};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-check overhead assumed when spreading checks
const PROJECTED_CHECK_OVERHEAD: f64 = 0.1;

/// Recurring housekeeping events owned by the timing loop
pub(crate) const MAINTENANCE_EVENTS: &[EventType] = &[
    EventType::CheckReaper,
    EventType::RescheduleChecks,
    EventType::OrphanCheck,
    EventType::ServiceFreshnessCheck,
    EventType::HostFreshnessCheck,
    EventType::StatusSave,
    EventType::CommandCheck,
    EventType::RetentionSave,
    EventType::LogRotation,
];

/// Shift a timestamp by a clock jump. Unset values (0 and -1) stay put and
/// the result never precedes the epoch.
pub fn adjust_timestamp_for_time_change(ts: Timestamp, delta: i64) -> Timestamp {
    if ts == 0 || ts == -1 {
        return ts;
    }
    ts.saturating_add(delta).max(0)
}

/// Next log rotation boundary in local time, or `None` when rotation is off
pub fn next_log_rotation(method: RotationMethod, now: Timestamp) -> Option<Timestamp> {
    let current = Local.timestamp_opt(now, 0).single()?;
    let date = current.date_naive();
    let next = match method {
        RotationMethod::None => return None,
        RotationMethod::Hourly => date.and_hms_opt(current.hour(), 0, 0)? + Duration::hours(1),
        RotationMethod::Daily => date.succ_opt()?.and_hms_opt(0, 0, 0)?,
        RotationMethod::Weekly => {
            let days = 7 - i64::from(date.weekday().num_days_from_sunday());
            (date + Duration::days(days)).and_hms_opt(0, 0, 0)?
        }
        RotationMethod::Monthly => {
            let (year, month) = if date.month() == 12 {
                (date.year() + 1, 1)
            } else {
                (date.year(), date.month() + 1)
            };
            NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?
        }
    };
    Local
        .from_local_datetime(&next)
        .earliest()
        .map(|dt| dt.timestamp())
        .filter(|ts| *ts > now)
}

fn shift_checkable(check: &mut Checkable, delta: i64) {
    check.last_check = adjust_timestamp_for_time_change(check.last_check, delta);
    check.next_check = adjust_timestamp_for_time_change(check.next_check, delta);
    check.last_state_change = adjust_timestamp_for_time_change(check.last_state_change, delta);
    check.last_hard_state_change =
        adjust_timestamp_for_time_change(check.last_hard_state_change, delta);
    check.last_notification = adjust_timestamp_for_time_change(check.last_notification, delta);
    check.last_acknowledgement = adjust_timestamp_for_time_change(check.last_acknowledgement, delta);
    check.recompute_next_notification();
}

/// Inter-check delay for spreading `intervals` over at most `spread` seconds
fn inter_check_delay(intervals: &[u64], spread: u64) -> f64 {
    if intervals.is_empty() {
        return 0.0;
    }
    let n = intervals.len() as f64;
    let average = intervals.iter().sum::<u64>() as f64 / n;
    (average / n).min(spread as f64 / n)
}

impl Engine {
    /// Queue the initial host and service checks and the recurring
    /// maintenance events
    pub fn init_timing_loop(&mut self) {
        let now = self.clock.now();
        let scheduler = self.config.scheduler.clone();

        let services: Vec<(ServiceId, u64, Timestamp)> = self
            .objects
            .services()
            .filter(|s| s.check.active_checks_enabled)
            .map(|s| (s.id, s.check.check_interval, s.check.next_check))
            .collect();
        let intervals: Vec<u64> = services.iter().map(|(_, i, _)| *i).collect();
        let icd = inter_check_delay(&intervals, scheduler.max_service_check_spread * 60);
        for (i, (id, interval, retained)) in services.into_iter().enumerate() {
            let spread_time = now + (i as f64 * icd) as i64;
            let check_time = if retained > now && retained <= now + interval as i64 {
                retained
            } else {
                spread_time
            };
            self.schedule_service_check(id, check_time, CheckOptions::empty());
        }
        debug!("Service inter-check delay: {:.3} sec", icd);

        let hosts: Vec<(HostId, u64, Timestamp)> = self
            .objects
            .hosts()
            .filter(|h| h.check.active_checks_enabled)
            .map(|h| (h.id, h.check.check_interval, h.check.next_check))
            .collect();
        let intervals: Vec<u64> = hosts.iter().map(|(_, i, _)| *i).collect();
        let icd = inter_check_delay(&intervals, scheduler.max_host_check_spread * 60);
        for (i, (id, interval, retained)) in hosts.into_iter().enumerate() {
            let spread_time = now + (i as f64 * icd) as i64;
            let check_time = if retained > now && retained <= now + interval as i64 {
                retained
            } else {
                spread_time
            };
            self.schedule_host_check(id, check_time, CheckOptions::empty());
        }
        debug!("Host inter-check delay: {:.3} sec", icd);

        self.schedule_maintenance_events(now);

        info!(
            "Timing loop initialized: {} high and {} low priority events",
            self.events.queue(Priority::High).len(),
            self.events.queue(Priority::Low).len()
        );
    }

    /// Queue the recurring maintenance events, replacing any already queued
    pub fn schedule_maintenance_events(&mut self, now: Timestamp) {
        self.events.remove_all_of(MAINTENANCE_EVENTS);
        // per-downtime expiry events are one-shot and stay queued
        let sweeps: Vec<_> = self
            .events
            .queue(Priority::High)
            .iter()
            .filter(|e| e.event_type == EventType::ExpireDowntime && e.recurring)
            .map(|e| e.id())
            .collect();
        for id in sweeps {
            self.events.remove_event(id);
        }

        let mut maintenance = vec![(EventType::CheckReaper, self.config.scheduler.check_reaper_interval)];
        if self.config.scheduler.auto_reschedule_checks {
            maintenance.push((EventType::RescheduleChecks, self.config.scheduler.auto_rescheduling_interval));
        }
        if self.config.scheduler.check_orphaned {
            maintenance.push((EventType::OrphanCheck, self.config.scheduler.orphan_check_interval));
        }
        if self.config.scheduler.check_service_freshness {
            maintenance.push((
                EventType::ServiceFreshnessCheck,
                self.config.scheduler.service_freshness_check_interval,
            ));
        }
        if self.config.scheduler.check_host_freshness {
            maintenance.push((
                EventType::HostFreshnessCheck,
                self.config.scheduler.host_freshness_check_interval,
            ));
        }
        maintenance.push((EventType::StatusSave, self.config.status.update_interval));
        if self.config.commands.check_external_commands {
            let interval = match self.config.scheduler.command_check_interval {
                -1 => 5,
                n => n.max(1) as u64,
            };
            maintenance.push((EventType::CommandCheck, interval));
        }
        if self.config.retention.enabled {
            maintenance.push((EventType::RetentionSave, self.config.retention.update_interval * 60));
        }
        maintenance.push((EventType::ExpireDowntime, self.config.scheduler.downtime_expiry_interval));

        for (event_type, interval) in maintenance {
            let interval = interval as i64;
            self.events.add_event(
                TimedEvent::new(event_type, now + interval)
                    .recurring(interval)
                    .compensated(),
                Priority::High,
            );
        }

        let method = self.config.logging.rotation;
        if let Some(first) = next_log_rotation(method, now) {
            self.events.add_event(
                TimedEvent::new(EventType::LogRotation, first)
                    .recurring(0)
                    .compensated()
                    .with_timing(Arc::new(move |t| {
                        next_log_rotation(method, t).unwrap_or(t + 3600)
                    })),
                Priority::High,
            );
        }
    }

    /// Shift queued events and retained object timestamps after the wall
    /// clock jumped from `last` to `current`
    pub fn compensate_for_system_time_change(&mut self, last: Timestamp, current: Timestamp) {
        let delta = current - last;
        if delta == 0 {
            return;
        }

        let (days, hours, minutes, seconds) = time_breakdown(delta.unsigned_abs());
        warn!(
            "A system time change of {}d {}h {}m {}s ({} in time) has been detected. Compensating...",
            days,
            hours,
            minutes,
            seconds,
            if delta < 0 { "backwards" } else { "forwards" }
        );

        for priority in [Priority::High, Priority::Low] {
            for event in self.events.queue_mut(priority).iter_mut() {
                if !event.compensate_for_time_change {
                    continue;
                }
                event.run_time = match &event.timing_func {
                    Some(timing) => timing(current),
                    None => adjust_timestamp_for_time_change(event.run_time, delta),
                };
            }
        }
        self.events.resort();

        for host in self.objects.hosts_mut() {
            shift_checkable(&mut host.check, delta);
        }
        for service in self.objects.services_mut() {
            shift_checkable(&mut service.check, delta);
        }

        let program = &mut self.program;
        program.program_start = adjust_timestamp_for_time_change(program.program_start, delta);
        program.event_start = adjust_timestamp_for_time_change(program.event_start, delta);
        program.last_command_check =
            adjust_timestamp_for_time_change(program.last_command_check, delta);
        program.last_log_rotation =
            adjust_timestamp_for_time_change(program.last_log_rotation, delta);
    }

    /// Spread the checks due in the rescheduling window when they bump
    /// into each other
    pub fn adjust_check_scheduling(&mut self) {
        let now = self.clock.now();
        let window = self.config.scheduler.auto_rescheduling_window;
        let last_window_time = now + window as i64;

        let in_window = |event: &TimedEvent| {
            event.event_type.is_check()
                && event.run_time > now
                && event.run_time <= last_window_time
                && !event.event_options.contains(CheckOptions::FORCE_EXECUTION)
        };

        let mut total_checks = 0usize;
        let mut total_exec_time = 0.0;
        let mut last_check_time: Timestamp = 0;
        let mut last_exec_time = 0.0;
        let mut bumps = false;
        for event in self.events.queue(Priority::Low).iter() {
            if event.run_time > last_window_time {
                break;
            }
            if !in_window(event) {
                continue;
            }
            if last_check_time as f64 + last_exec_time > event.run_time as f64 {
                bumps = true;
            }
            last_check_time = event.run_time;
            last_exec_time = PROJECTED_CHECK_OVERHEAD;
            total_exec_time += last_exec_time;
            total_checks += 1;
        }

        if total_checks == 0 || !bumps {
            return;
        }

        let (icd, exec_factor) = if total_exec_time > window as f64 {
            (0.0, window as f64 / total_exec_time)
        } else {
            ((window as f64 - total_exec_time) / total_checks as f64, 1.0)
        };
        debug!(
            "Rescheduling {} checks in a {}s window (icd {:.3}, exec factor {:.3})",
            total_checks, window, icd, exec_factor
        );

        let mut icd_offset = icd / 2.0;
        let mut exec_offset = 0.0;
        let mut moved = Vec::new();
        for event in self.events.queue_mut(Priority::Low).iter_mut() {
            if event.run_time > last_window_time {
                break;
            }
            if !in_window(&*event) {
                continue;
            }
            let exec_time = match event.payload {
                EventPayload::Host(id) => self
                    .objects
                    .host(id)
                    .map_or(0.0, |h| h.check.execution_time),
                _ => 0.0,
            };
            let current_exec = (exec_time + PROJECTED_CHECK_OVERHEAD) * exec_factor;
            let new_run_time = (now + (exec_offset + icd_offset) as i64).min(last_window_time);
            event.run_time = new_run_time;
            moved.push((event.payload.clone(), new_run_time));

            icd_offset += icd;
            exec_offset += current_exec;
        }
        self.events.resort_queue(Priority::Low);

        for (payload, run_time) in moved {
            let check = match payload {
                EventPayload::Host(id) => self.objects.host_mut(id).map(|h| &mut h.check),
                EventPayload::Service(id) => self.objects.service_mut(id).map(|s| &mut s.check),
                _ => None,
            };
            if let Some(check) = check {
                check.next_check = run_time;
            }
        }
    }
}
