//! systemd adapter: transient units via `systemd-run`, state via
//! `systemctl show`.
//!
//! Launch invariants:
//! - No `--collect`: a failed unit stays loaded until `cleanup` runs
//!   `reset-failed`, so its Result/ExecMainStatus remain queryable.
//! - `--remain-after-exit`: a successful unit stays loaded until observed,
//!   so a fast exit between polls cannot be mistaken for a vanished unit.

use std::collections::HashMap;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Supervisor, SupervisorError, UnitName, UnitState};
use crate::domain::TaskRecord;

const SHOW_PROPERTIES: &str = "LoadState,ActiveState,SubState,Result,ExecMainStatus";

pub struct SystemdSupervisor {
    /// Talk to the per-user service manager instead of the system one.
    user: bool,
    unit_prefix: String,
}

impl SystemdSupervisor {
    /// Adapter for the per-user service manager (the default).
    pub fn new() -> Self {
        Self {
            user: true,
            unit_prefix: "foreman-".to_string(),
        }
    }

    /// Adapter for the system service manager. Requires privileges.
    pub fn system() -> Self {
        Self {
            user: false,
            unit_prefix: "foreman-".to_string(),
        }
    }

    /// Deterministic unit name for the task's current attempt.
    pub fn unit_name(&self, task: &TaskRecord) -> UnitName {
        UnitName::new(format!(
            "{}{}-{}",
            self.unit_prefix,
            task.id,
            task.current_attempt()
        ))
    }

    /// `systemd-run` argument vector for a task. Pure, for testability.
    fn launch_args(&self, task: &TaskRecord, unit: &UnitName) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if self.user {
            args.push("--user".into());
        }
        args.push("--unit".into());
        args.push(unit.as_str().into());
        args.push("--quiet".into());
        args.push("--remain-after-exit".into());

        if let Some(dir) = &task.working_dir {
            args.push(format!("--working-directory={}", dir.display()));
        }
        for (key, value) in &task.env {
            args.push(format!("--setenv={key}={value}"));
        }

        let limits = &task.limits;
        if let Some(nice) = limits.nice {
            args.push(format!("--nice={nice}"));
        }
        if let Some(weight) = limits.cpu_weight {
            args.push(format!("--property=CPUWeight={weight}"));
        }
        if let Some(quota) = limits.cpu_quota_pct {
            args.push(format!("--property=CPUQuota={quota}%"));
        }
        if let Some(memory) = &limits.memory_max {
            args.push(format!("--property=MemoryMax={memory}"));
        }
        if let Some((policy, priority)) = limits.scheduling {
            args.push(format!(
                "--property=CPUSchedulingPolicy={}",
                policy.as_property()
            ));
            args.push(format!("--property=CPUSchedulingPriority={priority}"));
        }
        if let Some(runtime_max) = limits.runtime_max {
            args.push(format!("--property=RuntimeMaxSec={}", runtime_max.as_secs()));
        }

        args.push("--".into());
        args.extend(task.command.iter().cloned());
        args
    }

    fn systemctl_args(&self, rest: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if self.user {
            args.push("--user".into());
        }
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<Output, SupervisorError> {
        Ok(Command::new(program).args(args).output().await?)
    }
}

impl Default for SystemdSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_show_output(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Map `systemctl show` properties to a unit state.
fn unit_state_from_properties(props: &HashMap<String, String>) -> UnitState {
    if props.get("LoadState").map(String::as_str) == Some("not-found") {
        return UnitState::Gone;
    }

    let exit_code = props
        .get("ExecMainStatus")
        .and_then(|s| s.parse::<i32>().ok());
    let result = props.get("Result").cloned().unwrap_or_default();

    match props.get("ActiveState").map(String::as_str) {
        Some("failed") => UnitState::Failed { result, exit_code },
        Some("inactive") => {
            if result == "success" || result.is_empty() {
                UnitState::Exited {
                    exit_code: exit_code.unwrap_or(0),
                }
            } else {
                UnitState::Failed { result, exit_code }
            }
        }
        // remain-after-exit: a finished unit parks as active (exited).
        Some(_) if props.get("SubState").map(String::as_str) == Some("exited") => {
            UnitState::Exited {
                exit_code: exit_code.unwrap_or(0),
            }
        }
        Some(_) => UnitState::Active,
        None => UnitState::Gone,
    }
}

#[async_trait]
impl Supervisor for SystemdSupervisor {
    async fn launch(&self, task: &TaskRecord) -> Result<UnitName, SupervisorError> {
        let unit = self.unit_name(task);
        let args = self.launch_args(task, &unit);
        let output = self.run("systemd-run", &args).await?;

        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SupervisorError::Launch { unit, message });
        }

        debug!(unit = %unit, task = %task.id, "launched");
        Ok(unit)
    }

    async fn poll(&self, unit: &UnitName) -> Result<UnitState, SupervisorError> {
        let args =
            self.systemctl_args(&["show", unit.as_str(), "--property", SHOW_PROPERTIES]);
        let output = self.run("systemctl", &args).await?;

        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SupervisorError::Query {
                unit: unit.clone(),
                message,
            });
        }

        let props = parse_show_output(&String::from_utf8_lossy(&output.stdout));
        Ok(unit_state_from_properties(&props))
    }

    async fn stop(&self, unit: &UnitName) -> Result<(), SupervisorError> {
        let args = self.systemctl_args(&["stop", unit.as_str()]);
        let output = self.run("systemctl", &args).await?;
        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SupervisorError::Query {
                unit: unit.clone(),
                message,
            });
        }
        Ok(())
    }

    async fn cleanup(&self, unit: &UnitName) -> Result<(), SupervisorError> {
        // Both calls fail harmlessly when the unit is already gone.
        let stop = self.systemctl_args(&["stop", unit.as_str()]);
        let _ = self.run("systemctl", &stop).await;
        let reset = self.systemctl_args(&["reset-failed", unit.as_str()]);
        let _ = self.run("systemctl", &reset).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ResourceLimits, SchedulingPolicy, TaskId, TaskStatus};
    use chrono::Utc;
    use rstest::rstest;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn record(id: i64, attempts: u32) -> TaskRecord {
        TaskRecord {
            id: TaskId::new(id),
            command: vec!["/bin/echo".into(), "hi".into()],
            priority: 0,
            status: TaskStatus::Running,
            scheduled_at: Utc::now(),
            attempts,
            max_attempts: 3,
            dependencies: Vec::new(),
            unique_key: None,
            lease_owner: None,
            lease_expires_at: None,
            unit_name: None,
            exit_code: None,
            last_error: None,
            working_dir: None,
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn unit_names_are_deterministic_per_attempt() {
        let supervisor = SystemdSupervisor::new();
        assert_eq!(supervisor.unit_name(&record(7, 0)).as_str(), "foreman-7-1");
        assert_eq!(supervisor.unit_name(&record(7, 2)).as_str(), "foreman-7-3");
    }

    #[test]
    fn launch_args_forward_properties() {
        let supervisor = SystemdSupervisor::new();
        let mut task = record(7, 0);
        task.working_dir = Some("/srv/build".into());
        task.env.insert("RUST_LOG".into(), "debug".into());
        task.limits = ResourceLimits {
            nice: Some(5),
            cpu_weight: Some(200),
            cpu_quota_pct: Some(50),
            memory_max: Some("512M".into()),
            scheduling: Some((SchedulingPolicy::Fifo, 90)),
            runtime_max: Some(Duration::from_secs(300)),
        };

        let unit = supervisor.unit_name(&task);
        let args = supervisor.launch_args(&task, &unit);

        for expected in [
            "--user",
            "--remain-after-exit",
            "--working-directory=/srv/build",
            "--setenv=RUST_LOG=debug",
            "--nice=5",
            "--property=CPUWeight=200",
            "--property=CPUQuota=50%",
            "--property=MemoryMax=512M",
            "--property=CPUSchedulingPolicy=fifo",
            "--property=CPUSchedulingPriority=90",
            "--property=RuntimeMaxSec=300",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }

        // The argv comes last, untouched, after the separator.
        let sep = args.iter().position(|a| a == "--").expect("separator");
        assert_eq!(&args[sep + 1..], &["/bin/echo", "hi"]);
        assert!(!args.iter().any(|a| a == "--collect"));
    }

    #[test]
    fn system_scope_drops_user_flag() {
        let supervisor = SystemdSupervisor::system();
        let task = record(1, 0);
        let unit = supervisor.unit_name(&task);
        let args = supervisor.launch_args(&task, &unit);
        assert!(!args.iter().any(|a| a == "--user"));
    }

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case::running(
        &[("LoadState", "loaded"), ("ActiveState", "active"), ("SubState", "running")],
        UnitState::Active
    )]
    #[case::starting(
        &[("LoadState", "loaded"), ("ActiveState", "activating"), ("SubState", "start")],
        UnitState::Active
    )]
    #[case::remain_after_exit_success(
        &[("LoadState", "loaded"), ("ActiveState", "active"), ("SubState", "exited"),
          ("Result", "success"), ("ExecMainStatus", "0")],
        UnitState::Exited { exit_code: 0 }
    )]
    #[case::inactive_success(
        &[("LoadState", "loaded"), ("ActiveState", "inactive"), ("SubState", "dead"),
          ("Result", "success"), ("ExecMainStatus", "0")],
        UnitState::Exited { exit_code: 0 }
    )]
    #[case::failed_exit(
        &[("LoadState", "loaded"), ("ActiveState", "failed"), ("SubState", "failed"),
          ("Result", "exit-code"), ("ExecMainStatus", "2")],
        UnitState::Failed { result: "exit-code".into(), exit_code: Some(2) }
    )]
    #[case::timeout(
        &[("LoadState", "loaded"), ("ActiveState", "failed"), ("SubState", "failed"),
          ("Result", "timeout")],
        UnitState::Failed { result: "timeout".into(), exit_code: None }
    )]
    #[case::gone(
        &[("LoadState", "not-found"), ("ActiveState", "inactive")],
        UnitState::Gone
    )]
    fn unit_state_mapping(#[case] given: &[(&str, &str)], #[case] expected: UnitState) {
        assert_eq!(unit_state_from_properties(&props(given)), expected);
    }

    #[test]
    fn show_output_parses_as_key_value_lines() {
        let parsed = parse_show_output("LoadState=loaded\nActiveState=active\nResult=success\n");
        assert_eq!(parsed.get("ActiveState").unwrap(), "active");
        assert_eq!(parsed.len(), 3);
    }
}
