//! Property tests for scheduling and downtime invariants

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use vigil::broker::Broker;
use vigil::checker::{CheckRequest, CheckResult, Checker};
use vigil::clock::{ManualClock, Timestamp};
use vigil::config::{EngineConfig, HostConfig};
use vigil::downtimes::{DowntimeKind, DowntimeRequest};
use vigil::events::{adjust_timestamp_for_time_change, EventType, Priority, TimedEvent, Timeline};
use vigil::Engine;

const NOW: Timestamp = 1_700_000_000;

struct IdleChecker;

impl Checker for IdleChecker {
    fn run_check(&mut self, _request: CheckRequest) -> vigil::Result<()> {
        Ok(())
    }

    fn reap(&mut self) -> Vec<CheckResult> {
        Vec::new()
    }
}

fn engine() -> Engine {
    let mut config = EngineConfig::default();
    config.retention.enabled = false;
    config.hosts = ["web01", "db01"]
        .iter()
        .map(|name| HostConfig {
            name: name.to_string(),
            address: String::new(),
            parents: Vec::new(),
            check_command: "true".into(),
            check_interval: 5,
            retry_interval: 1,
            max_check_attempts: 3,
            notification_interval: 30,
            active_checks_enabled: true,
            check_freshness: false,
            freshness_threshold: 0,
        })
        .collect();
    Engine::new(config, Arc::new(ManualClock::new(NOW)), Box::new(IdleChecker)).unwrap()
}

fn request(host: &str, start: i64, length: i64, comment: &str) -> DowntimeRequest {
    DowntimeRequest {
        host_name: host.to_string(),
        entry_time: NOW,
        author: "ops".into(),
        comment: comment.to_string(),
        start_time: NOW + start,
        end_time: NOW + start + length,
        fixed: true,
        ..DowntimeRequest::default()
    }
}

proptest! {
    /// Compensating by zero never moves a timestamp
    #[test]
    fn zero_delta_is_identity(ts in 0i64..4_000_000_000) {
        prop_assert_eq!(adjust_timestamp_for_time_change(ts, 0), ts);
    }

    /// A jump and its reverse cancel out while the timestamp stays positive
    #[test]
    fn jump_and_reverse_cancel(ts in 1i64..4_000_000_000, delta in -1_000_000i64..1_000_000) {
        prop_assume!(ts + delta > 0);
        let shifted = adjust_timestamp_for_time_change(ts, delta);
        prop_assert_eq!(adjust_timestamp_for_time_change(shifted, -delta), ts);
    }

    /// Each queue pops in run-time order, whatever the insertion order
    #[test]
    fn queues_pop_in_time_order(events in prop::collection::vec((0i64..10_000, any::<bool>()), 1..50)) {
        let mut timeline = Timeline::new(Broker::default());
        for (offset, high) in &events {
            let priority = if *high { Priority::High } else { Priority::Low };
            timeline.add_event(TimedEvent::new(EventType::CheckReaper, NOW + offset), priority);
        }

        let mut popped = 0;
        for priority in [Priority::High, Priority::Low] {
            let mut last = Timestamp::MIN;
            while let Some(event) = timeline.pop_due(priority, NOW + 10_000) {
                prop_assert!(event.run_time >= last);
                last = event.run_time;
                popped += 1;
            }
        }
        prop_assert_eq!(popped, events.len());
        prop_assert!(timeline.is_empty());
    }

    /// Downtime ids are never reused while the downtimes exist
    #[test]
    fn downtime_ids_are_unique(windows in prop::collection::vec((1i64..3_600, 60i64..7_200, any::<bool>()), 1..20)) {
        let mut engine = engine();
        let mut ids = HashSet::new();
        for (start, length, on_web) in windows {
            let host = if on_web { "web01" } else { "db01" };
            let id = engine
                .schedule_downtime(DowntimeKind::Host, &request(host, start, length, "maint"))
                .unwrap();
            prop_assert!(ids.insert(id));
        }
        prop_assert_eq!(engine.downtimes.len(), ids.len());
    }

    /// Adding a criterion never widens a downtime query
    #[test]
    fn extra_criteria_only_narrow(windows in prop::collection::vec((1i64..3_600, any::<bool>(), any::<bool>()), 1..15)) {
        let mut engine = engine();
        for (start, on_web, patching) in windows {
            let host = if on_web { "web01" } else { "db01" };
            let comment = if patching { "patching" } else { "other" };
            engine
                .schedule_downtime(DowntimeKind::Host, &request(host, start, 600, comment))
                .unwrap();
        }

        let by_host: HashSet<u64> = engine.find_downtimes(&[("host", "web01")]).into_iter().collect();
        let narrowed = engine.find_downtimes(&[("host", "web01"), ("comment", "patching")]);
        prop_assert!(narrowed.len() <= by_host.len());
        prop_assert!(narrowed.iter().all(|id| by_host.contains(id)));
    }
}
