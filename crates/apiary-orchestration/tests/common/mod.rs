//! Shared harness for orchestration integration tests.
//!
//! Agents are real `/bin/sh` child processes running a long sleep; the
//! agent-side protocol (ready signals, heartbeats, task completion) is
//! driven by pump tasks emitting on the bus, standing in for the agent
//! runtime.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use apiary_bus::SwarmEvent;
use apiary_orchestration::collaborators::{
    LoopbackCoordination, LoopbackMcpServer, LoopbackTerminalBackend,
};
use apiary_orchestration::Orchestrator;
use apiary_store_memory::InMemoryStore;
use apiary_types::template::{AgentEnvironment, TemplateOverride};
use apiary_types::{AgentId, OrchestratorConfig};

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub dir: TempDir,
    pumps: Vec<JoinHandle<()>>,
}

impl Harness {
    /// Build and initialize an orchestrator over loopback collaborators.
    pub async fn start(mut config: OrchestratorConfig) -> Self {
        let dir = TempDir::new().expect("tempdir");
        config.environment_defaults.runtime = "/bin/sh".to_string();
        config.environment_defaults.working_directory = dir.path().to_path_buf();
        config.environment_defaults.temp_directory = dir.path().to_path_buf();
        config.environment_defaults.log_directory = dir.path().to_path_buf();

        let orchestrator = Orchestrator::new(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(LoopbackTerminalBackend::new()),
            Arc::new(LoopbackCoordination),
            Arc::new(LoopbackMcpServer::new()),
        );
        orchestrator.initialize().await.expect("initialize");

        let mut harness = Self {
            orchestrator,
            dir,
            pumps: Vec::new(),
        };
        harness.spawn_ready_pump();
        harness
    }

    /// Overrides pointing a template at the harness shell script.
    pub fn shell_overrides(&self) -> TemplateOverride {
        TemplateOverride {
            environment: Some(AgentEnvironment {
                runtime: "/bin/sh".to_string(),
                working_directory: self.dir.path().to_path_buf(),
                temp_directory: self.dir.path().to_path_buf(),
                log_directory: self.dir.path().to_path_buf(),
                variables: Default::default(),
            }),
            startup_script: Some(write_sleep_script(self.dir.path())),
            ..Default::default()
        }
    }

    /// Emit `agent:ready` for every known agent on a short cadence,
    /// standing in for the startup handshake of the agent runtime.
    fn spawn_ready_pump(&mut self) {
        let orchestrator = Arc::clone(&self.orchestrator);
        self.pumps.push(tokio::spawn(async move {
            loop {
                for agent in orchestrator.manager().list_agents() {
                    orchestrator
                        .bus()
                        .emit(SwarmEvent::AgentReady { agent_id: agent.id });
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }));
    }

    /// Emit heartbeats for one agent until the returned handle is aborted.
    pub fn spawn_heartbeat_pump(&self, agent_id: AgentId) -> JoinHandle<()> {
        let bus = self.orchestrator.bus().clone();
        tokio::spawn(async move {
            loop {
                bus.emit(SwarmEvent::AgentHeartbeat {
                    agent_id,
                    timestamp: chrono::Utc::now(),
                    metrics: serde_json::Value::Null,
                });
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
        })
    }

    /// Create and start one agent from a template, using the shell
    /// overrides.
    pub async fn spawn_agent(&self, template: &str) -> AgentId {
        let overrides = self.shell_overrides();
        let agent_id = self
            .orchestrator
            .manager()
            .create_agent(template, &overrides)
            .await
            .expect("create agent");
        self.orchestrator
            .manager()
            .start_agent(agent_id)
            .await
            .expect("start agent");
        agent_id
    }

    pub async fn stop(self) {
        for pump in &self.pumps {
            pump.abort();
        }
        self.orchestrator.shutdown("test teardown").await.ok();
    }
}

/// Config with timings tuned for tests: fast startup bounds, slow
/// watchdogs so they stay out of the way unless a test opts in.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        default_timeout: Duration::from_secs(3),
        heartbeat_interval: Duration::from_secs(30),
        health_check_interval: Duration::from_secs(30),
        maintenance_interval: Duration::from_secs(60),
        metrics_interval: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Write a script that keeps the agent process alive until stopped.
pub fn write_sleep_script(dir: &Path) -> String {
    let path = dir.join("agent.sh");
    let mut file = std::fs::File::create(&path).expect("script file");
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "sleep 30").unwrap();
    path.display().to_string()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
