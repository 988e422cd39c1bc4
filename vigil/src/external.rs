//! External commands
//!
//! Lines of the form `[timestamp] COMMAND;arg;arg...` arrive through the
//! command file. They are parsed off the loop thread and executed on it
//! through the command queue.

use crate::clock::Timestamp;
use crate::downtimes::{DowntimeFilter, DowntimeKind, DowntimeRequest};
use crate::engine::Engine;
use crate::error::{status_of, EngineError, Result};
use crate::objects::{CheckOptions, ObjectRef};
use std::str::FromStr;
use tracing::{info, warn};

/// Arguments shared by the downtime scheduling commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DowntimeArgs {
    pub host_name: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub fixed: bool,
    pub triggered_by: u64,
    pub duration: u64,
    pub author: String,
    pub comment: String,
}

impl DowntimeArgs {
    fn request(&self, host_name: &str, service: Option<&str>, entry_time: Timestamp) -> DowntimeRequest {
        DowntimeRequest {
            host_name: host_name.to_string(),
            service_description: service.map(str::to_string),
            entry_time,
            author: self.author.clone(),
            comment: self.comment.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            fixed: self.fixed,
            triggered_by: self.triggered_by,
            duration: self.duration,
        }
    }
}

/// Arguments of the acknowledgement commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckArgs {
    pub sticky: bool,
    pub notify: bool,
    pub persistent: bool,
    pub end_time: Option<Timestamp>,
    pub author: String,
    pub comment: String,
}

/// A parsed external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalCommand {
    ScheduleHostDowntime(DowntimeArgs),
    ScheduleServiceDowntime {
        service_description: String,
        args: DowntimeArgs,
    },
    /// Downtime for every service of a host
    ScheduleHostServicesDowntime(DowntimeArgs),
    /// Host downtime copied onto every host below it
    SchedulePropagatedHostDowntime {
        args: DowntimeArgs,
        triggered: bool,
    },
    DeleteHostDowntime(u64),
    DeleteServiceDowntime(u64),
    DeleteDowntimeByHostName(DowntimeFilter),
    ProcessHostCheckResult {
        host_name: String,
        return_code: i32,
        output: String,
    },
    ProcessServiceCheckResult {
        host_name: String,
        service_description: String,
        return_code: i32,
        output: String,
    },
    ScheduleForcedHostCheck {
        host_name: String,
        check_time: Timestamp,
    },
    ScheduleForcedServiceCheck {
        host_name: String,
        service_description: String,
        check_time: Timestamp,
    },
    AcknowledgeHostProblem {
        host_name: String,
        ack: AckArgs,
    },
    AcknowledgeServiceProblem {
        host_name: String,
        service_description: String,
        ack: AckArgs,
    },
    StartExecutingServiceChecks,
    StopExecutingServiceChecks,
    StartExecutingHostChecks,
    StopExecutingHostChecks,
    ShutdownProgram,
    RestartProgram,
}

/// A command with its submission time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub entry_time: Timestamp,
    pub command: ExternalCommand,
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidCommand(msg.into())
}

fn number<T: FromStr>(field: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(format!("{} '{}' is not a number", field, value)))
}

fn flag(field: &str, value: &str) -> Result<bool> {
    Ok(number::<i64>(field, value)? != 0)
}

/// Split into exactly `n` fields; the last one keeps any further `;`
fn fields<'a>(name: &str, args: &'a str, n: usize) -> Result<Vec<&'a str>> {
    let parts: Vec<&str> = args.splitn(n, ';').collect();
    if parts.len() != n {
        return Err(invalid(format!("{} expects {} arguments", name, n)));
    }
    Ok(parts)
}

fn downtime_args(host_name: &str, rest: &[&str]) -> Result<DowntimeArgs> {
    Ok(DowntimeArgs {
        host_name: host_name.to_string(),
        start_time: number("start_time", rest[0])?,
        end_time: number("end_time", rest[1])?,
        fixed: flag("fixed", rest[2])?,
        triggered_by: number("trigger_id", rest[3])?,
        duration: number("duration", rest[4])?,
        author: rest[5].to_string(),
        comment: rest[6].to_string(),
    })
}

fn ack_args(rest: &[&str], expires: bool) -> Result<AckArgs> {
    let (end_time, author, comment) = if expires {
        (Some(number("end_time", rest[3])?), rest[4], rest[5])
    } else {
        (None, rest[3], rest[4])
    };
    Ok(AckArgs {
        sticky: number::<i64>("sticky", rest[0])? == 2,
        notify: flag("notify", rest[1])?,
        persistent: flag("persistent", rest[2])?,
        end_time,
        author: author.to_string(),
        comment: comment.to_string(),
    })
}

/// Parse one command-file line
pub fn parse_command(line: &str) -> Result<CommandLine> {
    let line = line.trim();
    let rest = line
        .strip_prefix('[')
        .ok_or_else(|| invalid("missing '[timestamp]' prefix"))?;
    let (timestamp, rest) = rest
        .split_once(']')
        .ok_or_else(|| invalid("unterminated timestamp"))?;
    let entry_time: Timestamp = number("timestamp", timestamp)?;
    let rest = rest.trim_start();
    let (name, args) = rest.split_once(';').unwrap_or((rest, ""));
    if name.is_empty() {
        return Err(invalid("missing command name"));
    }

    let command = match name {
        "SCHEDULE_HOST_DOWNTIME" => {
            let f = fields(name, args, 8)?;
            ExternalCommand::ScheduleHostDowntime(downtime_args(f[0], &f[1..])?)
        }
        "SCHEDULE_SVC_DOWNTIME" => {
            let f = fields(name, args, 9)?;
            ExternalCommand::ScheduleServiceDowntime {
                service_description: f[1].to_string(),
                args: downtime_args(f[0], &f[2..])?,
            }
        }
        "SCHEDULE_HOST_SVC_DOWNTIME" => {
            let f = fields(name, args, 8)?;
            ExternalCommand::ScheduleHostServicesDowntime(downtime_args(f[0], &f[1..])?)
        }
        "SCHEDULE_AND_PROPAGATE_HOST_DOWNTIME" | "SCHEDULE_AND_PROPAGATE_TRIGGERED_HOST_DOWNTIME" => {
            let f = fields(name, args, 8)?;
            ExternalCommand::SchedulePropagatedHostDowntime {
                args: downtime_args(f[0], &f[1..])?,
                triggered: name == "SCHEDULE_AND_PROPAGATE_TRIGGERED_HOST_DOWNTIME",
            }
        }
        "DEL_HOST_DOWNTIME" => ExternalCommand::DeleteHostDowntime(number("downtime_id", args)?),
        "DEL_SVC_DOWNTIME" => ExternalCommand::DeleteServiceDowntime(number("downtime_id", args)?),
        "DEL_DOWNTIME_BY_HOST_NAME" => {
            let f: Vec<&str> = args.splitn(4, ';').collect();
            if f[0].is_empty() {
                return Err(invalid(format!("{} expects a host name", name)));
            }
            let start_time = match f.get(2) {
                Some(v) if !v.is_empty() => Some(number("start_time", v)?),
                _ => None,
            };
            ExternalCommand::DeleteDowntimeByHostName(DowntimeFilter {
                host_name: Some(f[0].to_string()),
                service_description: f.get(1).map(|s| s.to_string()),
                start_time,
                comment: f.get(3).map(|s| s.to_string()),
            })
        }
        "PROCESS_HOST_CHECK_RESULT" => {
            let f = fields(name, args, 3)?;
            ExternalCommand::ProcessHostCheckResult {
                host_name: f[0].to_string(),
                return_code: number("return_code", f[1])?,
                output: f[2].to_string(),
            }
        }
        "PROCESS_SERVICE_CHECK_RESULT" => {
            let f = fields(name, args, 4)?;
            ExternalCommand::ProcessServiceCheckResult {
                host_name: f[0].to_string(),
                service_description: f[1].to_string(),
                return_code: number("return_code", f[2])?,
                output: f[3].to_string(),
            }
        }
        "SCHEDULE_FORCED_HOST_CHECK" => {
            let f = fields(name, args, 2)?;
            ExternalCommand::ScheduleForcedHostCheck {
                host_name: f[0].to_string(),
                check_time: number("check_time", f[1])?,
            }
        }
        "SCHEDULE_FORCED_SVC_CHECK" => {
            let f = fields(name, args, 3)?;
            ExternalCommand::ScheduleForcedServiceCheck {
                host_name: f[0].to_string(),
                service_description: f[1].to_string(),
                check_time: number("check_time", f[2])?,
            }
        }
        "ACKNOWLEDGE_HOST_PROBLEM" | "ACKNOWLEDGE_HOST_PROBLEM_EXPIRE" => {
            let expires = name.ends_with("_EXPIRE");
            let f = fields(name, args, if expires { 7 } else { 6 })?;
            ExternalCommand::AcknowledgeHostProblem {
                host_name: f[0].to_string(),
                ack: ack_args(&f[1..], expires)?,
            }
        }
        "ACKNOWLEDGE_SVC_PROBLEM" | "ACKNOWLEDGE_SVC_PROBLEM_EXPIRE" => {
            let expires = name.ends_with("_EXPIRE");
            let f = fields(name, args, if expires { 8 } else { 7 })?;
            ExternalCommand::AcknowledgeServiceProblem {
                host_name: f[0].to_string(),
                service_description: f[1].to_string(),
                ack: ack_args(&f[2..], expires)?,
            }
        }
        "START_EXECUTING_SVC_CHECKS" => ExternalCommand::StartExecutingServiceChecks,
        "STOP_EXECUTING_SVC_CHECKS" => ExternalCommand::StopExecutingServiceChecks,
        "START_EXECUTING_HOST_CHECKS" => ExternalCommand::StartExecutingHostChecks,
        "STOP_EXECUTING_HOST_CHECKS" => ExternalCommand::StopExecutingHostChecks,
        "SHUTDOWN_PROGRAM" => ExternalCommand::ShutdownProgram,
        "RESTART_PROGRAM" => ExternalCommand::RestartProgram,
        other => return Err(invalid(format!("unknown command '{}'", other))),
    };

    Ok(CommandLine {
        entry_time,
        command,
    })
}

fn require_host(engine: &Engine, host_name: &str) -> Result<()> {
    engine
        .objects
        .find_host(host_name)
        .map(|_| ())
        .ok_or_else(|| EngineError::HostNotFound(host_name.to_string()))
}

fn resolve(engine: &Engine, host_name: &str, service: Option<&str>) -> Result<ObjectRef> {
    engine
        .objects
        .resolve(host_name, service)
        .ok_or_else(|| match service {
            Some(service) => EngineError::ServiceNotFound {
                host: host_name.to_string(),
                service: service.to_string(),
            },
            None => EngineError::HostNotFound(host_name.to_string()),
        })
}

impl CommandLine {
    /// Carry the command out against the engine
    pub fn execute(self, engine: &mut Engine) -> Result<()> {
        let entry_time = self.entry_time;
        match self.command {
            ExternalCommand::ScheduleHostDowntime(args) => {
                require_host(engine, &args.host_name)?;
                let request = args.request(&args.host_name, None, entry_time);
                engine.schedule_downtime(DowntimeKind::Host, &request).map(|_| ())
            }
            ExternalCommand::ScheduleServiceDowntime {
                service_description,
                args,
            } => {
                resolve(engine, &args.host_name, Some(&service_description))?;
                let request = args.request(&args.host_name, Some(&service_description), entry_time);
                engine
                    .schedule_downtime(DowntimeKind::Service, &request)
                    .map(|_| ())
            }
            ExternalCommand::ScheduleHostServicesDowntime(args) => {
                let host = engine
                    .objects
                    .find_host(&args.host_name)
                    .ok_or_else(|| EngineError::HostNotFound(args.host_name.clone()))?;
                let descriptions: Vec<String> = engine
                    .objects
                    .services_of(host)
                    .into_iter()
                    .filter_map(|id| engine.objects.service(id).map(|s| s.description.clone()))
                    .collect();
                let mut outcome = Ok(());
                for description in descriptions {
                    let request = args.request(&args.host_name, Some(&description), entry_time);
                    if let Err(e) = engine.schedule_downtime(DowntimeKind::Service, &request) {
                        warn!("Downtime for service '{}' not scheduled: {}", description, e);
                        outcome = Err(e);
                    }
                }
                outcome
            }
            ExternalCommand::SchedulePropagatedHostDowntime { args, triggered } => {
                require_host(engine, &args.host_name)?;
                let parent = engine.schedule_downtime(
                    DowntimeKind::Host,
                    &args.request(&args.host_name, None, entry_time),
                )?;
                let children: Vec<String> = engine
                    .objects
                    .descendants(&args.host_name)
                    .into_iter()
                    .filter_map(|id| engine.objects.host(id).map(|h| h.name.clone()))
                    .collect();
                for child in children {
                    let mut request = args.request(&child, None, entry_time);
                    if triggered {
                        request.triggered_by = parent;
                    }
                    if let Err(e) = engine.schedule_downtime(DowntimeKind::Host, &request) {
                        warn!("Downtime for child host '{}' not scheduled: {}", child, e);
                    }
                }
                Ok(())
            }
            ExternalCommand::DeleteHostDowntime(id) => {
                engine.unschedule_downtime(Some(DowntimeKind::Host), id)
            }
            ExternalCommand::DeleteServiceDowntime(id) => {
                engine.unschedule_downtime(Some(DowntimeKind::Service), id)
            }
            ExternalCommand::DeleteDowntimeByHostName(filter) => {
                match engine.delete_downtimes_matching(&filter) {
                    0 => Err(EngineError::CommandRejected("no matching downtime".into())),
                    _ => Ok(()),
                }
            }
            ExternalCommand::ProcessHostCheckResult {
                host_name,
                return_code,
                output,
            } => engine.submit_passive_host_result(&host_name, return_code, &output),
            ExternalCommand::ProcessServiceCheckResult {
                host_name,
                service_description,
                return_code,
                output,
            } => engine.submit_passive_service_result(
                &host_name,
                &service_description,
                return_code,
                &output,
            ),
            ExternalCommand::ScheduleForcedHostCheck {
                host_name,
                check_time,
            } => {
                let target = resolve(engine, &host_name, None)?;
                engine.schedule_check(target, check_time, CheckOptions::FORCE_EXECUTION);
                Ok(())
            }
            ExternalCommand::ScheduleForcedServiceCheck {
                host_name,
                service_description,
                check_time,
            } => {
                let target = resolve(engine, &host_name, Some(&service_description))?;
                engine.schedule_check(target, check_time, CheckOptions::FORCE_EXECUTION);
                Ok(())
            }
            ExternalCommand::AcknowledgeHostProblem { host_name, ack } => {
                let target = resolve(engine, &host_name, None)?;
                engine.acknowledge_problem(
                    target,
                    ack.sticky,
                    ack.notify,
                    ack.persistent,
                    &ack.author,
                    &ack.comment,
                    ack.end_time,
                )
            }
            ExternalCommand::AcknowledgeServiceProblem {
                host_name,
                service_description,
                ack,
            } => {
                let target = resolve(engine, &host_name, Some(&service_description))?;
                engine.acknowledge_problem(
                    target,
                    ack.sticky,
                    ack.notify,
                    ack.persistent,
                    &ack.author,
                    &ack.comment,
                    ack.end_time,
                )
            }
            ExternalCommand::StartExecutingServiceChecks => {
                engine.program.execute_service_checks = true;
                Ok(())
            }
            ExternalCommand::StopExecutingServiceChecks => {
                engine.program.execute_service_checks = false;
                Ok(())
            }
            ExternalCommand::StartExecutingHostChecks => {
                engine.program.execute_host_checks = true;
                Ok(())
            }
            ExternalCommand::StopExecutingHostChecks => {
                engine.program.execute_host_checks = false;
                Ok(())
            }
            ExternalCommand::ShutdownProgram => {
                engine.shutdown_requested = true;
                Ok(())
            }
            ExternalCommand::RestartProgram => {
                engine.restart_requested = true;
                Ok(())
            }
        }
    }
}

/// Parse and run one command line, returning the command status code
pub fn process_external_command(engine: &mut Engine, line: &str) -> i32 {
    let result = if engine.config.commands.check_external_commands {
        info!("EXTERNAL COMMAND: {}", line.trim());
        parse_command(line).and_then(|command| command.execute(engine))
    } else {
        Err(EngineError::CommandRejected("external commands are disabled".into()))
    };
    if let Err(e) = &result {
        warn!("External command '{}' failed: {}", line.trim(), e);
    }
    status_of(&result)
}
