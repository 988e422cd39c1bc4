//! Status file
//!
//! A JSON snapshot of program, object, downtime and comment state for
//! external readers. Rewritten atomically so readers never see a partial file.

use crate::clock::Timestamp;
use crate::comments::Comment;
use crate::downtimes::Downtime;
use crate::engine::{Engine, ProgramStatus};
use crate::error::Result;
use crate::objects::{Checkable, HostState, ServiceState, StateType};
use crate::retention::write_atomic;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct CheckStatus {
    pub state_type: StateType,
    pub current_attempt: u32,
    pub max_attempts: u32,
    pub plugin_output: String,
    pub last_check: Timestamp,
    pub next_check: Timestamp,
    pub is_executing: bool,
    pub active_checks_enabled: bool,
    pub problem_acknowledged: bool,
    pub scheduled_downtime_depth: u32,
}

impl From<&Checkable> for CheckStatus {
    fn from(check: &Checkable) -> Self {
        Self {
            state_type: check.state_type,
            current_attempt: check.current_attempt,
            max_attempts: check.max_attempts,
            plugin_output: check.plugin_output.clone(),
            last_check: check.last_check,
            next_check: check.next_check,
            is_executing: check.is_executing,
            active_checks_enabled: check.active_checks_enabled,
            problem_acknowledged: check.problem_acknowledged,
            scheduled_downtime_depth: check.scheduled_downtime_depth,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub name: String,
    pub state: HostState,
    #[serde(flatten)]
    pub check: CheckStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub host_name: String,
    pub description: String,
    pub state: ServiceState,
    #[serde(flatten)]
    pub check: CheckStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DowntimeStatus {
    pub id: u64,
    pub host_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_description: Option<String>,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub fixed: bool,
    pub triggered_by: u64,
    pub in_effect: bool,
    pub author: String,
    pub comment: String,
}

impl From<&Downtime> for DowntimeStatus {
    fn from(dt: &Downtime) -> Self {
        Self {
            id: dt.id,
            host_name: dt.host_name().to_string(),
            service_description: dt.service_description().map(str::to_string),
            start_time: dt.start_time,
            end_time: dt.end_time,
            fixed: dt.fixed,
            triggered_by: dt.triggered_by,
            in_effect: dt.in_effect,
            author: dt.author.clone(),
            comment: dt.comment.clone(),
        }
    }
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub program: ProgramStatus,
    pub hosts: Vec<HostStatus>,
    pub services: Vec<ServiceStatus>,
    pub downtimes: Vec<DowntimeStatus>,
    pub comments: Vec<Comment>,
}

impl StatusSnapshot {
    pub fn capture(engine: &Engine) -> Self {
        Self {
            program: engine.program.clone(),
            hosts: engine
                .objects
                .hosts()
                .map(|h| HostStatus {
                    name: h.name.clone(),
                    state: h.state,
                    check: CheckStatus::from(&h.check),
                })
                .collect(),
            services: engine
                .objects
                .services()
                .map(|s| ServiceStatus {
                    host_name: s.host_name.clone(),
                    description: s.description.clone(),
                    state: s.state,
                    check: CheckStatus::from(&s.check),
                })
                .collect(),
            downtimes: engine.downtimes.downtimes().iter().map(DowntimeStatus::from).collect(),
            comments: engine.comments.iter().cloned().collect(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes())
    }
}
