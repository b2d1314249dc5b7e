//! System configuration parsing.

use crate::{ConfigError, ConfigResult, parse_duration};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings of a scheduler process. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// PostgreSQL connection string.
    pub database_url: Option<String>,
    /// How often each pipeline is scheduled. Also the scheduling lease duration.
    pub scheduling_interval: Duration,
    /// Default periodic check interval for resources without `check-every`.
    pub check_interval: Duration,
    /// Lease held while a manual trigger scans its job's inputs.
    pub job_checking_lease: Duration,
    /// Lease held by an on-demand resource scan.
    pub scan_lease: Duration,
    /// Wait between attempts to take a busy resource checking lease during a scan.
    pub scan_retry: Duration,
    /// How often started builds are polled.
    pub tracking_interval: Duration,
    /// Directory holding `<type>/check` scripts.
    pub check_scripts: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            scheduling_interval: Duration::from_secs(10),
            check_interval: Duration::from_secs(60),
            job_checking_lease: Duration::from_secs(5 * 60),
            scan_lease: Duration::from_secs(5 * 60),
            scan_retry: Duration::from_secs(1),
            tracking_interval: Duration::from_secs(10),
            check_scripts: PathBuf::from("/opt/conveyor/resource-types"),
        }
    }
}

/// Parse system configuration from KDL text.
///
/// ```kdl
/// database-url "postgres://conveyor@localhost/conveyor"
/// scheduler { interval "10s" }
/// radar {
///     check-interval "1m"
///     scan-lease "5m"
///     scan-retry "1s"
///     scripts "/opt/conveyor/resource-types"
/// }
/// leases { job-checking "5m" }
/// tracker { interval "10s" }
/// ```
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database-url" => {
                config.database_url = Some(first_string(node).ok_or_else(|| {
                    ConfigError::MissingField("database-url value".to_string())
                })?);
            }
            "scheduler" => {
                for child in children(node) {
                    if child.name().value() == "interval" {
                        config.scheduling_interval = duration_arg("scheduler.interval", child)?;
                    }
                }
            }
            "radar" => {
                for child in children(node) {
                    match child.name().value() {
                        "check-interval" => {
                            config.check_interval = duration_arg("radar.check-interval", child)?;
                        }
                        "scan-lease" => {
                            config.scan_lease = duration_arg("radar.scan-lease", child)?;
                        }
                        "scan-retry" => {
                            config.scan_retry = duration_arg("radar.scan-retry", child)?;
                        }
                        "scripts" => {
                            config.check_scripts =
                                PathBuf::from(first_string(child).ok_or_else(|| {
                                    ConfigError::MissingField("radar.scripts value".to_string())
                                })?);
                        }
                        _ => {}
                    }
                }
            }
            "leases" => {
                for child in children(node) {
                    if child.name().value() == "job-checking" {
                        config.job_checking_lease = duration_arg("leases.job-checking", child)?;
                    }
                }
            }
            "tracker" => {
                for child in children(node) {
                    if child.name().value() == "interval" {
                        config.tracking_interval = duration_arg("tracker.interval", child)?;
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn children(node: &KdlNode) -> &[KdlNode] {
    node.children().map(|c| c.nodes()).unwrap_or(&[])
}

fn first_string(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn duration_arg(field: &str, node: &KdlNode) -> ConfigResult<Duration> {
    let raw = first_string(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    parse_duration(&raw).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("not a duration: {}", raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config, SystemConfig::default());
    }

    #[test]
    fn test_parse_overrides() {
        let kdl = r#"
            database-url "postgres://localhost/conveyor"
            scheduler {
                interval "5s"
            }
            radar {
                check-interval "2m"
                scripts "/srv/types"
            }
            leases {
                job-checking "90s"
            }
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/conveyor")
        );
        assert_eq!(config.scheduling_interval, Duration::from_secs(5));
        assert_eq!(config.check_interval, Duration::from_secs(120));
        assert_eq!(config.job_checking_lease, Duration::from_secs(90));
        assert_eq!(config.check_scripts, PathBuf::from("/srv/types"));
        assert_eq!(config.tracking_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_duration() {
        let result = parse_system_config(r#"scheduler { interval "often" }"#);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }
}
