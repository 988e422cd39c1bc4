//! State retention
//!
//! Object state, persistent comments and downtimes are saved to a JSON
//! document and read back at startup. Retained state is best effort:
//! entries for objects that no longer exist are skipped.

use crate::clock::Timestamp;
use crate::comments::{Comment, CommentEntryType};
use crate::downtimes::DowntimeRecord;
use crate::engine::Engine;
use crate::error::Result;
use crate::objects::{Checkable, HostState, ObjectStore, ServiceState, StateType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const RETENTION_VERSION: u32 = 1;

/// Write a file through a temporary sibling and a rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Check state carried across restarts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetainedCheck {
    pub active_checks_enabled: bool,
    pub current_attempt: u32,
    pub state_type: StateType,
    pub plugin_output: String,
    pub last_check: Timestamp,
    pub next_check: Timestamp,
    pub last_state_change: Timestamp,
    pub last_hard_state_change: Timestamp,
    pub last_notification: Timestamp,
    pub notification_number: u32,
    pub problem_acknowledged: bool,
    pub acknowledgement_sticky: bool,
    pub last_acknowledgement: Timestamp,
    pub acknowledgement_end_time: Timestamp,
}

impl RetainedCheck {
    fn capture(check: &Checkable) -> Self {
        Self {
            active_checks_enabled: check.active_checks_enabled,
            current_attempt: check.current_attempt,
            state_type: check.state_type,
            plugin_output: check.plugin_output.clone(),
            last_check: check.last_check,
            next_check: check.next_check,
            last_state_change: check.last_state_change,
            last_hard_state_change: check.last_hard_state_change,
            last_notification: check.last_notification,
            notification_number: check.notification_number,
            problem_acknowledged: check.problem_acknowledged,
            acknowledgement_sticky: check.acknowledgement_sticky,
            last_acknowledgement: check.last_acknowledgement,
            acknowledgement_end_time: check.acknowledgement_end_time,
        }
    }

    fn restore(&self, check: &mut Checkable) {
        check.active_checks_enabled = self.active_checks_enabled;
        check.current_attempt = self.current_attempt.clamp(1, check.max_attempts.max(1));
        check.state_type = self.state_type;
        check.plugin_output = self.plugin_output.clone();
        check.last_check = self.last_check;
        check.next_check = self.next_check;
        check.last_state_change = self.last_state_change;
        check.last_hard_state_change = self.last_hard_state_change;
        check.last_notification = self.last_notification;
        check.notification_number = self.notification_number;
        check.problem_acknowledged = self.problem_acknowledged;
        check.acknowledgement_sticky = self.acknowledgement_sticky;
        check.last_acknowledgement = self.last_acknowledgement;
        check.acknowledgement_end_time = self.acknowledgement_end_time;
        check.recompute_next_notification();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedHost {
    pub name: String,
    pub state: HostState,
    pub last_hard_state: HostState,
    pub check: RetainedCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedService {
    pub host_name: String,
    pub description: String,
    pub state: ServiceState,
    pub last_hard_state: ServiceState,
    pub check: RetainedCheck,
}

/// Program switches toggled at runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedProgram {
    pub execute_service_checks: bool,
    pub execute_host_checks: bool,
}

/// Everything written to the retention file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionDocument {
    pub version: u32,
    pub saved_at: Timestamp,
    pub program: RetainedProgram,
    #[serde(default)]
    pub hosts: Vec<RetainedHost>,
    #[serde(default)]
    pub services: Vec<RetainedService>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub downtimes: Vec<DowntimeRecord>,
}

impl RetentionDocument {
    /// Snapshot the engine. Downtime comments are left out; downtimes
    /// recreate them when they are registered again.
    pub fn capture(engine: &Engine) -> Self {
        Self {
            version: RETENTION_VERSION,
            saved_at: engine.clock.now(),
            program: RetainedProgram {
                execute_service_checks: engine.program.execute_service_checks,
                execute_host_checks: engine.program.execute_host_checks,
            },
            hosts: engine
                .objects
                .hosts()
                .map(|h| RetainedHost {
                    name: h.name.clone(),
                    state: h.state,
                    last_hard_state: h.last_hard_state,
                    check: RetainedCheck::capture(&h.check),
                })
                .collect(),
            services: engine
                .objects
                .services()
                .map(|s| RetainedService {
                    host_name: s.host_name.clone(),
                    description: s.description.clone(),
                    state: s.state,
                    last_hard_state: s.last_hard_state,
                    check: RetainedCheck::capture(&s.check),
                })
                .collect(),
            comments: engine
                .comments
                .iter()
                .filter(|c| c.persistent && c.entry_type != CommentEntryType::Downtime)
                .cloned()
                .collect(),
            downtimes: engine.downtimes.retention_records(),
        }
    }

    /// Copy retained state onto objects that still exist
    pub fn restore_objects(&self, objects: &mut ObjectStore) {
        for retained in &self.hosts {
            let host = objects
                .find_host(&retained.name)
                .and_then(|id| objects.host_mut(id));
            match host {
                Some(host) => {
                    host.state = retained.state;
                    host.last_hard_state = retained.last_hard_state;
                    retained.check.restore(&mut host.check);
                }
                None => debug!("Skipping retained state of unknown host '{}'", retained.name),
            }
        }
        for retained in &self.services {
            let svc = objects
                .find_service(&retained.host_name, &retained.description)
                .and_then(|id| objects.service_mut(id));
            match svc {
                Some(svc) => {
                    svc.state = retained.state;
                    svc.last_hard_state = retained.last_hard_state;
                    retained.check.restore(&mut svc.check);
                }
                None => debug!(
                    "Skipping retained state of unknown service '{}' on '{}'",
                    retained.description, retained.host_name
                ),
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)
    }

    /// Read a retention file; a missing file is not an error
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}
