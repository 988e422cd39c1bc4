//! Check execution
//!
//! The engine hands check requests to a [`Checker`] and later reaps the
//! finished results. [`ProcessChecker`] runs check commands through
//! `sh -c` on the tokio runtime.

use crate::clock::Timestamp;
use crate::error::Result;
use crate::objects::{CheckOptions, ObjectRef};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Exit code reported when a check cannot be run or times out
pub const STATE_CRITICAL: i32 = 2;

/// Exit code for an unknown result
pub const STATE_UNKNOWN: i32 = 3;

/// A check the engine wants executed
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub target: ObjectRef,
    pub command: String,
    pub timeout: Duration,
    pub options: CheckOptions,
    pub latency: f64,
}

/// Outcome of an active or passive check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub target: ObjectRef,
    pub return_code: i32,
    pub output: String,
    pub start_time: f64,
    pub finish_time: f64,
    pub latency: f64,
    pub options: CheckOptions,
    pub passive: bool,
}

impl CheckResult {
    /// Result submitted from outside the engine
    pub fn passive(target: ObjectRef, return_code: i32, output: impl Into<String>, now: Timestamp) -> Self {
        Self {
            target,
            return_code,
            output: output.into(),
            start_time: now as f64,
            finish_time: now as f64,
            latency: 0.0,
            options: CheckOptions::empty(),
            passive: true,
        }
    }

    pub fn execution_time(&self) -> f64 {
        (self.finish_time - self.start_time).max(0.0)
    }
}

/// Runs checks and hands back their results
pub trait Checker: Send {
    /// Start a check; the result shows up in a later [`reap`](Checker::reap)
    fn run_check(&mut self, request: CheckRequest) -> Result<()>;

    /// Collect every result that finished since the last call
    fn reap(&mut self) -> Vec<CheckResult>;
}

fn precise_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Executes check commands as child processes
pub struct ProcessChecker {
    runtime: Handle,
    tx: mpsc::UnboundedSender<CheckResult>,
    rx: mpsc::UnboundedReceiver<CheckResult>,
}

impl ProcessChecker {
    /// Spawn checks onto the given runtime
    pub fn new(runtime: Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { runtime, tx, rx }
    }
}

impl Checker for ProcessChecker {
    fn run_check(&mut self, request: CheckRequest) -> Result<()> {
        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            let result = execute(request).await;
            let _ = tx.send(result);
        });
        Ok(())
    }

    fn reap(&mut self) -> Vec<CheckResult> {
        let mut results = Vec::new();
        while let Ok(result) = self.rx.try_recv() {
            results.push(result);
        }
        results
    }
}

async fn execute(request: CheckRequest) -> CheckResult {
    let start_time = precise_now();
    debug!("Running check command: {}", request.command);

    let outcome = timeout(
        request.timeout,
        Command::new("/bin/sh")
            .arg("-c")
            .arg(&request.command)
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let (return_code, output) = match outcome {
        Ok(Ok(output)) => {
            let code = output.status.code().unwrap_or(STATE_UNKNOWN);
            let text = String::from_utf8_lossy(&output.stdout);
            let first_line = text.lines().next().unwrap_or_default().trim().to_string();
            (code, first_line)
        }
        Ok(Err(e)) => {
            warn!("Check command '{}' failed to start: {}", request.command, e);
            (STATE_CRITICAL, format!("(Return code of 127 is out of bounds - plugin may be missing: {})", e))
        }
        Err(_) => {
            warn!("Check command '{}' timed out after {:?}", request.command, request.timeout);
            let text = match request.target {
                ObjectRef::Host(_) => "(Host Check Timed Out)",
                ObjectRef::Service(_) => "(Service Check Timed Out)",
            };
            (STATE_CRITICAL, text.to_string())
        }
    };

    CheckResult {
        target: request.target,
        return_code,
        output,
        start_time,
        finish_time: precise_now(),
        latency: request.latency,
        options: request.options,
        passive: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ServiceId;

    fn request(command: &str, timeout: Duration) -> CheckRequest {
        CheckRequest {
            target: ObjectRef::Service(ServiceId(1)),
            command: command.into(),
            timeout,
            options: CheckOptions::empty(),
            latency: 0.5,
        }
    }

    #[tokio::test]
    async fn test_exit_code_and_output() {
        let result = execute(request("echo 'DISK OK'; exit 1", Duration::from_secs(5))).await;
        assert_eq!(result.return_code, 1);
        assert_eq!(result.output, "DISK OK");
        assert_eq!(result.latency, 0.5);
        assert!(!result.passive);
    }

    #[tokio::test]
    async fn test_timeout() {
        let result = execute(request("sleep 5", Duration::from_millis(50))).await;
        assert_eq!(result.return_code, STATE_CRITICAL);
        assert_eq!(result.output, "(Service Check Timed Out)");
    }

    #[test]
    fn test_process_checker_reaps() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut checker = ProcessChecker::new(runtime.handle().clone());
        checker.run_check(request("exit 0", Duration::from_secs(5))).unwrap();

        let mut results = Vec::new();
        for _ in 0..100 {
            results.extend(checker.reap());
            if !results.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].return_code, 0);
    }

    #[test]
    fn test_passive_result() {
        let result = CheckResult::passive(ObjectRef::Service(ServiceId(2)), 2, "CRIT", 100);
        assert!(result.passive);
        assert_eq!(result.execution_time(), 0.0);
    }
}
