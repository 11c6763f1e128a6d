//! OS process supervision for spawned agents.
//!
//! Each started agent owns exactly one child process spawned from its
//! environment's runtime executable. The process receives its identity
//! through environment variables and its effective config as a `--config`
//! JSON argument. Exit is observed through a watch channel so both the
//! manager's exit watcher and a stopping caller can wait on it.

use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use apiary_types::AgentRecord;

/// Terminal outcome of a supervised child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally. Signal deaths carry
    /// `None`.
    pub code: Option<i32>,
}

impl ProcessExit {
    /// Whether the exit looks clean.
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A spawned agent child process plus its exit observer.
#[derive(Debug)]
pub struct SupervisedProcess {
    pid: Option<u32>,
    started_at: Instant,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl SupervisedProcess {
    /// Spawn the agent's child process and start waiting on its exit.
    pub fn spawn(record: &AgentRecord) -> Result<Self> {
        let config_json = serde_json::to_string(&record.config)
            .context("serializing agent config for --config")?;

        let mut command = Command::new(&record.environment.runtime);
        command
            .arg(&record.startup_script)
            .arg("--config")
            .arg(config_json)
            .current_dir(&record.environment.working_directory)
            .env("AGENT_ID", record.id.to_string())
            .env("AGENT_TYPE", &record.agent_type)
            .env("AGENT_NAME", &record.name)
            .env("WORKING_DIR", &record.environment.working_directory)
            .env("LOG_DIR", &record.environment.log_directory)
            .envs(&record.environment.variables)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().with_context(|| {
            format!(
                "spawning agent process '{}' for {}",
                record.environment.runtime, record.id
            )
        })?;

        let pid = child.id();
        debug!(agent_id = %record.id, pid, "agent process spawned");

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let status = child.wait().await;
            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                },
                Err(err) => {
                    warn!(error = %err, "waiting on agent process failed");
                    ProcessExit { code: None }
                }
            };
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            pid,
            started_at: Instant::now(),
            exit_rx,
        })
    }

    /// OS pid, while the process is alive.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// How long the process has been up.
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Whether the process already exited.
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Receiver that resolves once the process exits.
    pub fn exit_receiver(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Ask the process to terminate gracefully.
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                debug!(error = %err, "SIGTERM delivery failed, process likely gone");
            }
        }
        #[cfg(not(unix))]
        self.kill();
    }

    /// Kill the process outright.
    pub fn kill(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL) {
                debug!(error = %err, "SIGKILL delivery failed, process likely gone");
            }
        }
    }

    /// Wait for the process to exit, bounded by `timeout`. Returns `None`
    /// when the bound elapses first.
    pub async fn wait_exit(&self, timeout: std::time::Duration) -> Option<ProcessExit> {
        let mut rx = self.exit_rx.clone();
        let wait = async {
            loop {
                if let Some(exit) = *rx.borrow() {
                    return exit;
                }
                if rx.changed().await.is_err() {
                    return ProcessExit { code: None };
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_types::capabilities::AgentCapabilities;
    use apiary_types::template::{AgentEnvironment, AgentRuntimeConfig};
    use apiary_types::{AgentId, AgentMetrics, AgentStatus, BoundedHistory, SwarmId};
    use chrono::Utc;
    use std::io::Write;
    use std::time::Duration;

    fn record_running(script_body: &str, dir: &std::path::Path) -> AgentRecord {
        let script_path = dir.join("agent.sh");
        let mut file = std::fs::File::create(&script_path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{script_body}").unwrap();

        AgentRecord {
            id: AgentId::new(),
            swarm_id: SwarmId::new(),
            agent_type: "coder".to_string(),
            instance: 1,
            name: "Coder 1".to_string(),
            status: AgentStatus::Initializing,
            capabilities: AgentCapabilities::default(),
            config: AgentRuntimeConfig::default(),
            environment: AgentEnvironment {
                runtime: "/bin/sh".to_string(),
                working_directory: dir.to_path_buf(),
                temp_directory: dir.to_path_buf(),
                log_directory: dir.to_path_buf(),
                variables: Default::default(),
            },
            startup_script: script_path.display().to_string(),
            metrics: AgentMetrics::default(),
            health: 1.0,
            workload: 0.0,
            last_heartbeat: Utc::now(),
            current_tasks: Vec::new(),
            task_history: BoundedHistory::new(50),
            error_history: BoundedHistory::new(50),
            collaborators: Vec::new(),
            children: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn clean_exit_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_running("exit 0", dir.path());
        let process = SupervisedProcess::spawn(&record).unwrap();
        let exit = process.wait_exit(Duration::from_secs(5)).await.unwrap();
        assert!(exit.is_success());
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_running("exit 3", dir.path());
        let process = SupervisedProcess::spawn(&record).unwrap();
        let exit = process.wait_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.code, Some(3));
    }

    #[tokio::test]
    async fn terminate_stops_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_running("sleep 30", dir.path());
        let process = SupervisedProcess::spawn(&record).unwrap();
        assert!(!process.has_exited());
        process.terminate();
        let exit = process.wait_exit(Duration::from_secs(5)).await;
        assert!(exit.is_some());
    }

    #[tokio::test]
    async fn wait_exit_times_out_while_alive() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_running("sleep 30", dir.path());
        let process = SupervisedProcess::spawn(&record).unwrap();
        let exit = process.wait_exit(Duration::from_millis(50)).await;
        assert!(exit.is_none());
        process.kill();
    }

    #[tokio::test]
    async fn missing_runtime_fails_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = record_running("exit 0", dir.path());
        record.environment.runtime = "/definitely/not/a/runtime".to_string();
        assert!(SupervisedProcess::spawn(&record).is_err());
    }
}
