//! Event loop
//!
//! Runs on one dedicated thread. Each iteration takes the engine lock,
//! dispatches at most one due event (high priority first) and otherwise
//! drains the command queue and waits for the next tick with the lock
//! released. Reloads parse and apply the configuration on a separate
//! thread.

use super::timed_event::{EventPayload, EventType, Priority, TimedEvent};
use crate::broker::BrokerEvent;
use crate::clock::Timestamp;
use crate::command_manager::CommandManager;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::objects::{CheckOptions, ObjectRef};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Seconds between in-memory program status refreshes
const STATUS_REFRESH_INTERVAL: i64 = 5;

/// Outcome of one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// An event ran
    Dispatched {
        event_type: EventType,
        priority: Priority,
    },
    /// A due check was pushed back by admission control, then the loop idled
    Deferred(EventType),
    /// Nothing was due
    Idle(Duration),
    /// Shutdown observed
    ShutDown,
    /// Both queues empty
    Empty,
}

/// Cloneable control surface for a running loop
#[derive(Clone)]
pub struct LoopHandle {
    commands: Arc<CommandManager<Engine>>,
    shutdown: CancellationToken,
    reload_requested: Arc<AtomicBool>,
}

impl LoopHandle {
    /// Stop the loop at the top of its next iteration
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
        self.commands.wake();
    }

    /// Re-read the configuration file in the background
    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::SeqCst);
        self.commands.wake();
    }

    /// Run a task on the loop thread
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(&mut Engine) + Send + 'static,
    {
        self.commands.enqueue(task);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// The scheduler's main loop
pub struct EventLoop {
    engine: Arc<Mutex<Engine>>,
    commands: Arc<CommandManager<Engine>>,
    shutdown: CancellationToken,
    reload_requested: Arc<AtomicBool>,
    reloading: Arc<AtomicBool>,
    config_path: Option<PathBuf>,
    last_time: Timestamp,
    last_status_update: Timestamp,
}

impl EventLoop {
    /// Wrap an engine. `config_path` is re-read on reload.
    pub fn new(engine: Engine, config_path: Option<PathBuf>) -> Self {
        let commands = Arc::clone(&engine.commands);
        let now = engine.clock.now();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            commands,
            shutdown: CancellationToken::new(),
            reload_requested: Arc::new(AtomicBool::new(false)),
            reloading: Arc::new(AtomicBool::new(false)),
            config_path,
            last_time: now,
            last_status_update: now,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            commands: Arc::clone(&self.commands),
            shutdown: self.shutdown.clone(),
            reload_requested: Arc::clone(&self.reload_requested),
        }
    }

    /// Shared engine, locked by the loop while it dispatches
    pub fn engine(&self) -> Arc<Mutex<Engine>> {
        Arc::clone(&self.engine)
    }

    /// Whether a background reload is still running
    pub fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::SeqCst)
    }

    /// Run until shutdown. An empty timeline is an error.
    pub fn run(&mut self) -> Result<()> {
        info!("Event loop started");
        loop {
            match self.run_once() {
                Step::ShutDown => {
                    info!("Event loop stopped");
                    return Ok(());
                }
                Step::Empty => return Err(EngineError::NoScheduledEvents),
                step => trace!("Loop step: {:?}", step),
            }
        }
    }

    /// One iteration of the loop
    pub fn run_once(&mut self) -> Step {
        if self.shutdown.is_cancelled() {
            return Step::ShutDown;
        }

        let engine_lock = Arc::clone(&self.engine);
        let mut engine = engine_lock.lock();

        if engine.shutdown_requested {
            info!("Shutdown requested, stopping event loop");
            self.shutdown.cancel();
            return Step::ShutDown;
        }
        if engine.restart_requested {
            info!("Restart requested, reloading configuration");
            engine.restart_requested = false;
            self.reload_requested.store(true, Ordering::SeqCst);
        }

        if engine.events.is_empty() {
            error!("There aren't any events that need to be handled! Exiting...");
            return Step::Empty;
        }

        self.start_reload_if_requested();

        let now = engine.clock.now();
        let threshold = engine.config.scheduler.time_change_threshold;
        if now < self.last_time || now - self.last_time >= threshold {
            engine.compensate_for_system_time_change(self.last_time, now);
        }
        self.last_time = now;

        if now - self.last_status_update > STATUS_REFRESH_INTERVAL {
            engine.update_program_status();
            self.last_status_update = now;
        }

        if let Some(event) = engine.events.pop_due(Priority::High, now) {
            return dispatch(&mut engine, event, Priority::High);
        }

        let low_due = engine
            .events
            .queue(Priority::Low)
            .peek()
            .is_some_and(|e| e.run_time <= now);
        if low_due {
            if let Some(event) = engine.events.pop_due(Priority::Low, now) {
                match admit(&mut engine, event) {
                    Ok(event) => return dispatch(&mut engine, event, Priority::Low),
                    Err(event_type) => {
                        self.idle(engine);
                        return Step::Deferred(event_type);
                    }
                }
            }
        }

        Step::Idle(self.idle(engine))
    }

    /// Drain queued commands, then wait for work or the next tick with the
    /// engine unlocked
    fn idle(&self, mut engine: MutexGuard<'_, Engine>) -> Duration {
        let sleep = engine.config.scheduler.sleep_time();
        self.commands.execute_pending(&mut engine);
        if engine.config.scheduler.command_check_interval == -1 {
            let now = engine.clock.now();
            engine.program.last_command_check = now;
            engine.broker.publish(BrokerEvent::ExternalCommandCheck);
        }
        engine.broker.publish(BrokerEvent::Sleep {
            millis: sleep.as_millis() as u64,
        });
        drop(engine);

        self.commands.wait_for_work(sleep, &self.shutdown);
        sleep
    }

    fn start_reload_if_requested(&self) {
        if !self.reload_requested.load(Ordering::SeqCst) || self.reloading.load(Ordering::SeqCst) {
            return;
        }
        self.reload_requested.store(false, Ordering::SeqCst);
        self.reloading.store(true, Ordering::SeqCst);

        let engine = Arc::clone(&self.engine);
        let reloading = Arc::clone(&self.reloading);
        let path = self.config_path.clone();
        let spawned = thread::Builder::new()
            .name("vigil-reload".into())
            .spawn(move || {
                reload(&engine, path);
                reloading.store(false, Ordering::SeqCst);
            });
        if let Err(e) = spawned {
            error!("Failed to start reload thread: {}", e);
            self.reloading.store(false, Ordering::SeqCst);
        }
    }
}

fn reload(engine: &Mutex<Engine>, path: Option<PathBuf>) {
    let Some(path) = path else {
        warn!("Reload requested but no configuration file is set");
        return;
    };
    info!("Reloading configuration from {}", path.display());
    let config = match EngineConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration {}: {}", path.display(), e);
            return;
        }
    };
    if let Err(e) = engine.lock().apply(config) {
        error!("Failed to apply configuration: {}", e);
    }
}

fn dispatch(engine: &mut Engine, event: TimedEvent, priority: Priority) -> Step {
    let event_type = event.event_type;
    event.handle(engine);
    engine.program.events_handled += 1;
    if event.recurring {
        let now = engine.clock.now();
        engine.events.reschedule_event(event, priority, now);
    }
    Step::Dispatched {
        event_type,
        priority,
    }
}

/// Admission control for a due low-priority event.
///
/// Checks are pushed back when the parallel limit is reached or checks
/// are disabled, unless forced. Returns the event to run, or the type of
/// the event that was requeued.
fn admit(engine: &mut Engine, mut event: TimedEvent) -> std::result::Result<TimedEvent, EventType> {
    let target = match event.payload {
        EventPayload::Service(id) if event.event_type == EventType::ServiceCheck => ObjectRef::Service(id),
        EventPayload::Host(id) if event.event_type == EventType::HostCheck => ObjectRef::Host(id),
        _ => return Ok(event),
    };
    if event.event_options.contains(CheckOptions::FORCE_EXECUTION) {
        return Ok(event);
    }

    let event_type = event.event_type;
    if let ObjectRef::Service(_) = target {
        let limit = engine.config.scheduler.max_parallel_service_checks;
        if limit > 0 && engine.running_service_checks() >= limit {
            let nudge = rand::thread_rng().gen_range(5..15);
            debug!(
                "Max concurrent service checks ({}) has been reached. Nudging check by {} seconds",
                limit, nudge
            );
            event.run_time += nudge;
            requeue(engine, target, event);
            return Err(event_type);
        }
    }

    let enabled = match target {
        ObjectRef::Service(_) => engine.program.execute_service_checks,
        ObjectRef::Host(_) => engine.program.execute_host_checks,
    };
    if !enabled {
        let soft_problem = engine.objects.in_soft_problem(target);
        let interval = engine.objects.checkable(target).map_or(0, |c| {
            if soft_problem {
                c.retry_interval
            } else {
                c.check_interval
            }
        });
        debug!("{} execution is disabled, rescheduling", event_type);
        event.run_time += interval.max(1) as i64;
        requeue(engine, target, event);
        return Err(event_type);
    }
    Ok(event)
}

fn requeue(engine: &mut Engine, target: ObjectRef, event: TimedEvent) {
    if let Some(check) = engine.objects.checkable_mut(target) {
        check.next_check = event.run_time;
    }
    engine.events.add_event(event, Priority::Low);
}
