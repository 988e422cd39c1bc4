//! End-to-end scheduling tests
//!
//! Drive the event loop step by step against a manual clock and a checker
//! that answers every check with a fixed return code.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use vigil::checker::{CheckRequest, CheckResult, Checker};
use vigil::clock::{ManualClock, Timestamp};
use vigil::config::EngineConfig;
use vigil::events::Step;
use vigil::external::process_external_command;
use vigil::objects::{HostState, ObjectRef, ServiceState, StateType};
use vigil::{Engine, EventLoop};

const NOW: Timestamp = 1_700_000_000;

/// Answers checks by command: the command string is the return code
#[derive(Clone, Default)]
struct ScriptedChecker {
    pending: Arc<Mutex<Vec<CheckResult>>>,
    runs: Arc<Mutex<HashMap<String, usize>>>,
}

impl Checker for ScriptedChecker {
    fn run_check(&mut self, request: CheckRequest) -> vigil::Result<()> {
        let return_code = request.command.parse().unwrap_or(3);
        *self.runs.lock().entry(request.command.clone()).or_default() += 1;
        self.pending.lock().push(CheckResult {
            target: request.target,
            return_code,
            output: format!("exit {}", return_code),
            start_time: NOW as f64,
            finish_time: NOW as f64,
            latency: request.latency,
            options: request.options,
            passive: false,
        });
        Ok(())
    }

    fn reap(&mut self) -> Vec<CheckResult> {
        std::mem::take(&mut *self.pending.lock())
    }
}

fn config(dir: &tempfile::TempDir) -> EngineConfig {
    let yaml = format!(
        r#"
scheduler:
  sleep_time_ms: 1
retention:
  enabled: false
status:
  file: {}
hosts:
  - name: web01
    check_command: "0"
services:
  - host_name: web01
    description: http
    check_command: "2"
    check_interval: 5
    retry_interval: 1
    max_check_attempts: 3
"#,
        dir.path().join("status.json").display()
    );
    EngineConfig::from_yaml(&yaml).unwrap()
}

fn start(config: EngineConfig) -> (EventLoop, Arc<ManualClock>, ScriptedChecker) {
    let clock = Arc::new(ManualClock::new(NOW));
    let checker = ScriptedChecker::default();
    let mut engine = Engine::new(config, clock.clone(), Box::new(checker.clone())).unwrap();
    engine.start();
    (EventLoop::new(engine, None), clock, checker)
}

/// Run everything due, then move the clock on
fn run_for(event_loop: &mut EventLoop, clock: &ManualClock, seconds: i64, step: i64) {
    let mut elapsed = 0;
    while elapsed <= seconds {
        loop {
            match event_loop.run_once() {
                Step::Dispatched { .. } => continue,
                Step::Idle(_) | Step::Deferred(_) => break,
                other => panic!("unexpected loop step {:?}", other),
            }
        }
        clock.advance(step);
        elapsed += step;
    }
}

#[test]
fn failing_service_becomes_hard_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let (mut event_loop, clock, checker) = start(config(&dir));

    run_for(&mut event_loop, &clock, 40, 10);
    {
        let engine = event_loop.engine();
        let engine = engine.lock();
        let id = engine.objects.find_service("web01", "http").unwrap();
        let svc = engine.objects.service(id).unwrap();
        assert_eq!(svc.state, ServiceState::Critical);
        assert_eq!(svc.check.state_type, StateType::Soft);
        assert_eq!(svc.check.current_attempt, 1);
    }

    run_for(&mut event_loop, &clock, 200, 10);
    let engine = event_loop.engine();
    let engine = engine.lock();
    let id = engine.objects.find_service("web01", "http").unwrap();
    let svc = engine.objects.service(id).unwrap();
    assert_eq!(svc.check.state_type, StateType::Hard);
    assert_eq!(svc.check.current_attempt, 3);
    assert_eq!(svc.last_hard_state, ServiceState::Critical);

    let host = engine.objects.host(engine.objects.find_host("web01").unwrap()).unwrap();
    assert_eq!(host.state, HostState::Up);
    assert!(checker.runs.lock()["2"] >= 3);
}

#[test]
fn status_file_is_written_by_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let (mut event_loop, clock, _) = start(config(&dir));

    // status is saved every minute by default
    run_for(&mut event_loop, &clock, 120, 10);

    let content = std::fs::read_to_string(dir.path().join("status.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(value["hosts"][0]["name"], "web01");
    assert!(value["program"]["events_handled"].as_u64().unwrap() > 0);
}

#[test]
fn downtime_command_runs_through_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let (mut event_loop, clock, _) = start(config(&dir));
    let handle = event_loop.handle();

    let line = format!(
        "[{}] SCHEDULE_HOST_DOWNTIME;web01;{};{};1;0;0;ops;kernel upgrade",
        NOW,
        NOW + 30,
        NOW + 90
    );
    handle.submit(move |engine: &mut Engine| {
        assert_eq!(process_external_command(engine, &line), 0);
    });

    run_for(&mut event_loop, &clock, 50, 10);
    {
        let engine = event_loop.engine();
        let engine = engine.lock();
        assert_eq!(engine.downtimes.len(), 1);
        assert!(engine.downtimes.downtimes()[0].in_effect);
        let host = engine.objects.find_host("web01").unwrap();
        assert!(engine.objects.checkable(ObjectRef::Host(host)).unwrap().in_downtime());
    }

    run_for(&mut event_loop, &clock, 60, 10);
    let engine = event_loop.engine();
    let engine = engine.lock();
    assert!(engine.downtimes.is_empty());
    let host = engine.objects.find_host("web01").unwrap();
    assert!(!engine.objects.checkable(ObjectRef::Host(host)).unwrap().in_downtime());
}

#[test]
fn shutdown_command_stops_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let (mut event_loop, _, _) = start(config(&dir));
    let handle = event_loop.handle();

    let line = format!("[{}] SHUTDOWN_PROGRAM", NOW);
    handle.submit(move |engine: &mut Engine| {
        process_external_command(engine, &line);
    });

    assert!(event_loop.run().is_ok());
    assert!(handle.is_shutdown());
}

#[test]
fn stopped_host_checks_are_pushed_back() {
    let dir = tempfile::tempdir().unwrap();
    let (mut event_loop, clock, checker) = start(config(&dir));
    {
        let engine = event_loop.engine();
        engine.lock().program.execute_host_checks = false;
    }

    run_for(&mut event_loop, &clock, 30, 10);
    assert!(!checker.runs.lock().contains_key("0"));
    assert!(checker.runs.lock().contains_key("2"));
}
