//! Configuration for the Vigil monitoring scheduler

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Event loop and check scheduling settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Check execution limits
    #[serde(default)]
    pub checks: ChecksConfig,

    /// State retention
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Status file output
    #[serde(default)]
    pub status: StatusConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,

    /// External command intake
    #[serde(default)]
    pub commands: CommandsConfig,

    /// Monitored hosts
    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    /// Monitored services
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Idle sleep between loop iterations in milliseconds
    #[serde(default = "default_sleep_time_ms")]
    pub sleep_time_ms: u64,

    /// Clock jump (seconds) that triggers time-change compensation
    #[serde(default = "default_time_change_threshold")]
    pub time_change_threshold: i64,

    /// Maximum concurrently running service checks (0 = unlimited)
    #[serde(default)]
    pub max_parallel_service_checks: usize,

    /// Run active service checks
    #[serde(default = "default_true")]
    pub execute_service_checks: bool,

    /// Run active host checks
    #[serde(default = "default_true")]
    pub execute_host_checks: bool,

    /// External command check interval in seconds (-1 = every idle cycle)
    #[serde(default = "default_command_check_interval")]
    pub command_check_interval: i64,

    /// Check result reaper interval in seconds
    #[serde(default = "default_reaper_interval")]
    pub check_reaper_interval: u64,

    /// Spread checks that bump into each other
    #[serde(default)]
    pub auto_reschedule_checks: bool,

    /// How often to look for bumping checks, in seconds
    #[serde(default = "default_auto_rescheduling_interval")]
    pub auto_rescheduling_interval: u64,

    /// Look-ahead window for rescheduling, in seconds
    #[serde(default = "default_auto_rescheduling_window")]
    pub auto_rescheduling_window: u64,

    /// Seconds per interval unit used by check and notification intervals
    #[serde(default = "default_interval_length")]
    pub interval_length: u64,

    /// Look for checks whose results never came back
    #[serde(default = "default_true")]
    pub check_orphaned: bool,

    /// Orphan check interval in seconds
    #[serde(default = "default_maintenance_interval")]
    pub orphan_check_interval: u64,

    /// Enable service freshness checking
    #[serde(default = "default_true")]
    pub check_service_freshness: bool,

    /// Service freshness check interval in seconds
    #[serde(default = "default_maintenance_interval")]
    pub service_freshness_check_interval: u64,

    /// Enable host freshness checking
    #[serde(default)]
    pub check_host_freshness: bool,

    /// Host freshness check interval in seconds
    #[serde(default = "default_maintenance_interval")]
    pub host_freshness_check_interval: u64,

    /// Extra slack added to computed freshness thresholds, in seconds
    #[serde(default = "default_freshness_latency")]
    pub additional_freshness_latency: u64,

    /// Downtime expiry sweep interval in seconds
    #[serde(default = "default_maintenance_interval")]
    pub downtime_expiry_interval: u64,

    /// Spread initial service checks over this many minutes
    #[serde(default = "default_check_spread")]
    pub max_service_check_spread: u64,

    /// Spread initial host checks over this many minutes
    #[serde(default = "default_check_spread")]
    pub max_host_check_spread: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sleep_time_ms: default_sleep_time_ms(),
            time_change_threshold: default_time_change_threshold(),
            max_parallel_service_checks: 0,
            execute_service_checks: true,
            execute_host_checks: true,
            command_check_interval: default_command_check_interval(),
            check_reaper_interval: default_reaper_interval(),
            auto_reschedule_checks: false,
            auto_rescheduling_interval: default_auto_rescheduling_interval(),
            auto_rescheduling_window: default_auto_rescheduling_window(),
            interval_length: default_interval_length(),
            check_orphaned: true,
            orphan_check_interval: default_maintenance_interval(),
            check_service_freshness: true,
            service_freshness_check_interval: default_maintenance_interval(),
            check_host_freshness: false,
            host_freshness_check_interval: default_maintenance_interval(),
            additional_freshness_latency: default_freshness_latency(),
            downtime_expiry_interval: default_maintenance_interval(),
            max_service_check_spread: default_check_spread(),
            max_host_check_spread: default_check_spread(),
        }
    }
}

impl SchedulerConfig {
    /// Idle sleep as a duration
    pub fn sleep_time(&self) -> Duration {
        Duration::from_millis(self.sleep_time_ms)
    }
}

/// Check execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksConfig {
    /// Host check timeout in seconds
    #[serde(default = "default_host_check_timeout")]
    pub host_check_timeout: u64,

    /// Service check timeout in seconds
    #[serde(default = "default_service_check_timeout")]
    pub service_check_timeout: u64,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            host_check_timeout: default_host_check_timeout(),
            service_check_timeout: default_service_check_timeout(),
        }
    }
}

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Save and restore state across restarts
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Retention file path
    #[serde(default = "default_retention_file")]
    pub file: PathBuf,

    /// Save interval in minutes
    #[serde(default = "default_retention_interval")]
    pub update_interval: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: default_retention_file(),
            update_interval: default_retention_interval(),
        }
    }
}

/// Status file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Status file path
    #[serde(default = "default_status_file")]
    pub file: PathBuf,

    /// Write interval in seconds
    #[serde(default = "default_status_interval")]
    pub update_interval: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            file: default_status_file(),
            update_interval: default_status_interval(),
        }
    }
}

/// Log rotation schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationMethod {
    #[default]
    None,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Rotation schedule
    #[serde(default)]
    pub rotation: RotationMethod,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            rotation: RotationMethod::None,
        }
    }
}

/// External command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Accept external commands
    #[serde(default = "default_true")]
    pub check_external_commands: bool,

    /// Command file (usually a FIFO)
    #[serde(default)]
    pub command_file: Option<PathBuf>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            check_external_commands: true,
            command_file: None,
        }
    }
}

/// Host definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Unique host name
    pub name: String,

    /// Network address
    #[serde(default)]
    pub address: String,

    /// Parent host names
    #[serde(default)]
    pub parents: Vec<String>,

    /// Command run by `sh -c`
    #[serde(default)]
    pub check_command: String,

    /// Normal check interval (interval units)
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Retry interval while in a soft problem state (interval units)
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,

    /// Attempts before a problem becomes hard
    #[serde(default = "default_max_attempts")]
    pub max_check_attempts: u32,

    /// Re-notification interval (interval units, 0 = notify once)
    #[serde(default = "default_notification_interval")]
    pub notification_interval: u64,

    /// Schedule active checks
    #[serde(default = "default_true")]
    pub active_checks_enabled: bool,

    /// Force a check when results go stale
    #[serde(default)]
    pub check_freshness: bool,

    /// Freshness threshold in seconds (0 = derive from the check interval)
    #[serde(default)]
    pub freshness_threshold: u64,
}

/// Service definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Owning host name
    pub host_name: String,

    /// Service description, unique per host
    pub description: String,

    /// Command run by `sh -c`
    #[serde(default)]
    pub check_command: String,

    /// Normal check interval (interval units)
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Retry interval while in a soft problem state (interval units)
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,

    /// Attempts before a problem becomes hard
    #[serde(default = "default_max_attempts")]
    pub max_check_attempts: u32,

    /// Re-notification interval (interval units, 0 = notify once)
    #[serde(default = "default_notification_interval")]
    pub notification_interval: u64,

    /// Schedule active checks
    #[serde(default = "default_true")]
    pub active_checks_enabled: bool,

    /// Force a check when results go stale
    #[serde(default)]
    pub check_freshness: bool,

    /// Freshness threshold in seconds (0 = derive from the check interval)
    #[serde(default)]
    pub freshness_threshold: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_sleep_time_ms() -> u64 {
    500
}

fn default_time_change_threshold() -> i64 {
    900
}

fn default_command_check_interval() -> i64 {
    -1
}

fn default_reaper_interval() -> u64 {
    10
}

fn default_auto_rescheduling_interval() -> u64 {
    30
}

fn default_auto_rescheduling_window() -> u64 {
    180
}

fn default_interval_length() -> u64 {
    60
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_freshness_latency() -> u64 {
    15
}

fn default_check_spread() -> u64 {
    5
}

fn default_host_check_timeout() -> u64 {
    30
}

fn default_service_check_timeout() -> u64 {
    60
}

fn default_retention_file() -> PathBuf {
    PathBuf::from("/var/lib/vigil/retention.json")
}

fn default_retention_interval() -> u64 {
    60
}

fn default_status_file() -> PathBuf {
    PathBuf::from("/run/vigil/status.json")
}

fn default_status_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_check_interval() -> u64 {
    5
}

fn default_retry_interval() -> u64 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_notification_interval() -> u64 {
    30
}

impl EngineConfig {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_yaml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Reject configurations the scheduler can't run with
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.sleep_time_ms == 0 {
            return Err(EngineError::Config("sleep_time_ms must be positive".into()));
        }
        if s.time_change_threshold <= 0 {
            return Err(EngineError::Config(
                "time_change_threshold must be positive".into(),
            ));
        }
        if s.command_check_interval == 0 {
            return Err(EngineError::Config(
                "command_check_interval must be -1 or positive".into(),
            ));
        }
        let intervals = [
            ("check_reaper_interval", s.check_reaper_interval),
            ("auto_rescheduling_interval", s.auto_rescheduling_interval),
            ("auto_rescheduling_window", s.auto_rescheduling_window),
            ("interval_length", s.interval_length),
            ("orphan_check_interval", s.orphan_check_interval),
            ("service_freshness_check_interval", s.service_freshness_check_interval),
            ("host_freshness_check_interval", s.host_freshness_check_interval),
            ("downtime_expiry_interval", s.downtime_expiry_interval),
            ("status.update_interval", self.status.update_interval),
            ("retention.update_interval", self.retention.update_interval),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(EngineError::Config(format!("{} must not be zero", name)));
            }
        }

        let mut hosts = HashSet::new();
        for host in &self.hosts {
            if host.name.is_empty() {
                return Err(EngineError::Config("host with empty name".into()));
            }
            if !hosts.insert(host.name.as_str()) {
                return Err(EngineError::Config(format!("duplicate host '{}'", host.name)));
            }
            if host.check_interval == 0 || host.retry_interval == 0 {
                return Err(EngineError::Config(format!(
                    "host '{}' has a zero check interval",
                    host.name
                )));
            }
        }
        for host in &self.hosts {
            for parent in &host.parents {
                if !hosts.contains(parent.as_str()) {
                    return Err(EngineError::Config(format!(
                        "host '{}' has unknown parent '{}'",
                        host.name, parent
                    )));
                }
            }
        }

        let mut services = HashSet::new();
        for svc in &self.services {
            if svc.description.is_empty() {
                return Err(EngineError::Config(format!(
                    "service on host '{}' has an empty description",
                    svc.host_name
                )));
            }
            if !hosts.contains(svc.host_name.as_str()) {
                return Err(EngineError::Config(format!(
                    "service '{}' refers to unknown host '{}'",
                    svc.description, svc.host_name
                )));
            }
            if !services.insert((svc.host_name.as_str(), svc.description.as_str())) {
                return Err(EngineError::Config(format!(
                    "duplicate service '{}' on host '{}'",
                    svc.description, svc.host_name
                )));
            }
            if svc.check_interval == 0 || svc.retry_interval == 0 {
                return Err(EngineError::Config(format!(
                    "service '{}' on host '{}' has a zero check interval",
                    svc.description, svc.host_name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler.sleep_time_ms, 500);
        assert_eq!(config.scheduler.command_check_interval, -1);
        assert_eq!(config.logging.rotation, RotationMethod::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("absent.yaml")).unwrap();
        assert!(config.hosts.is_empty());
        assert_eq!(config.scheduler.interval_length, 60);
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.yaml");
        std::fs::write(
            &path,
            r#"
scheduler:
  sleep_time_ms: 250
  max_parallel_service_checks: 4
logging:
  rotation: daily
hosts:
  - name: gateway
    check_command: "exit 0"
  - name: web01
    parents: [gateway]
services:
  - host_name: web01
    description: http
    check_interval: 2
"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.scheduler.sleep_time_ms, 250);
        assert_eq!(config.scheduler.max_parallel_service_checks, 4);
        assert_eq!(config.logging.rotation, RotationMethod::Daily);
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[1].parents, vec!["gateway".to_string()]);
        assert_eq!(config.services[0].check_interval, 2);
        assert_eq!(config.services[0].max_check_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_objects() {
        let mut config = EngineConfig::from_yaml(
            r#"
hosts:
  - name: a
services:
  - host_name: b
    description: ping
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        config.services.clear();
        config.hosts.push(config.hosts[0].clone());
        assert!(config.validate().is_err());

        config.hosts.pop();
        config.hosts[0].parents.push("ghost".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = EngineConfig::default();
        config.scheduler.sleep_time_ms = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.scheduler.check_reaper_interval = 0;
        assert!(config.validate().is_err());
    }
}
