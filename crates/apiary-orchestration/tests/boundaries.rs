//! Boundary and invariant tests at the orchestration level.

mod common;

use std::time::Duration;

use common::{test_config, wait_until, Harness};

use apiary_agents::AgentManagerError;
use apiary_dispatch::DispatchError;
use apiary_types::template::TemplateOverride;
use apiary_types::{AgentStatus, PoolConfig, SessionProfile, Task};

#[tokio::test(flavor = "multi_thread")]
async fn queue_capacity_boundary_rejects_the_overflow_submission() {
    let mut config = test_config();
    config.task_queue_size = 3;
    let harness = Harness::start(config).await;
    let dispatcher = harness.orchestrator.dispatcher().clone();

    // No agents exist, so every submission stays queued.
    for i in 0..3 {
        dispatcher
            .submit_task(Task::new("analysis", format!("inspect {i}"), 40))
            .await
            .unwrap();
    }
    let overflow = dispatcher
        .submit_task(Task::new("analysis", "inspect overflow", 40))
        .await;
    assert!(matches!(overflow, Err(DispatchError::QueueFull { capacity: 3 })));
    assert_eq!(dispatcher.queue_depth(), 3);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_cap_boundary_rejects_the_overflow_creation() {
    let mut config = test_config();
    config.max_agents = 1;
    let harness = Harness::start(config).await;
    let manager = harness.orchestrator.manager().clone();

    manager
        .create_agent("coder", &harness.shell_overrides())
        .await
        .unwrap();
    let overflow = manager
        .create_agent("coder", &harness.shell_overrides())
        .await;
    assert!(matches!(
        overflow,
        Err(AgentManagerError::LimitExceeded { limit: 1 })
    ));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_template_is_rejected() {
    let harness = Harness::start(test_config()).await;
    let result = harness
        .orchestrator
        .manager()
        .create_agent("warlock", &TemplateOverride::default())
        .await;
    assert!(matches!(result, Err(AgentManagerError::TemplateNotFound(_))));
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_scaling_outside_bounds_fails_without_mutation() {
    let harness = Harness::start(test_config()).await;
    let orchestrator = &harness.orchestrator;

    let mut template = orchestrator.manager().template("tester").unwrap();
    template.agent_type = "tester-pool".to_string();
    template.environment.runtime = "/bin/sh".to_string();
    template.environment.working_directory = harness.dir.path().to_path_buf();
    template.environment.log_directory = harness.dir.path().to_path_buf();
    template.environment.temp_directory = harness.dir.path().to_path_buf();
    template.startup_script = common::write_sleep_script(harness.dir.path());
    orchestrator.manager().register_template(template);

    let pool_id = orchestrator
        .manager()
        .create_agent_pool(
            "testers",
            "tester-pool",
            PoolConfig {
                min_size: 1,
                max_size: 2,
                auto_scale: false,
                scale_up_threshold: 0.8,
                scale_down_threshold: 0.2,
            },
        )
        .await
        .unwrap();

    let before = orchestrator.manager().pool(pool_id).unwrap();
    for target in [0, 3] {
        let result = orchestrator.manager().scale_pool(pool_id, target).await;
        assert!(matches!(
            result,
            Err(AgentManagerError::InvalidPoolSize { min: 1, max: 2, .. })
        ));
    }
    let after = orchestrator.manager().pool(pool_id).unwrap();
    assert_eq!(before.current_size(), after.current_size());

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_agent_is_idempotent_once_terminated() {
    let harness = Harness::start(test_config()).await;
    let manager = harness.orchestrator.manager().clone();

    let agent_id = harness.spawn_agent("coder").await;
    manager.stop_agent(agent_id, "test").await.unwrap();
    assert_eq!(
        manager.agent(agent_id).unwrap().status,
        AgentStatus::Terminated
    );
    // Second stop is a no-op.
    manager.stop_agent(agent_id, "test again").await.unwrap();
    assert_eq!(
        manager.agent(agent_id).unwrap().status,
        AgentStatus::Terminated
    );

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn terminated_agent_cannot_be_started() {
    let harness = Harness::start(test_config()).await;
    let manager = harness.orchestrator.manager().clone();

    let agent_id = harness.spawn_agent("coder").await;
    manager.stop_agent(agent_id, "test").await.unwrap();
    let result = manager.start_agent(agent_id).await;
    assert!(matches!(
        result,
        Err(AgentManagerError::InvalidTransition { .. })
    ));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn workload_tracks_assignment_and_completion() {
    let harness = Harness::start(test_config()).await;
    let orchestrator = &harness.orchestrator;

    let agent_id = harness.spawn_agent("coder").await;
    let max_concurrent = orchestrator
        .manager()
        .agent(agent_id)
        .unwrap()
        .capabilities
        .max_concurrent_tasks;

    let mut task = Task::new("code-generation", "implement", 50);
    task.required_capabilities = vec!["code-generation".to_string()];
    let task_id = orchestrator.dispatcher().submit_task(task).await.unwrap();

    let manager = orchestrator.manager().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let agent = manager.agent(agent_id).unwrap();
            agent.current_tasks.len() == 1
                && (agent.workload - 1.0 / max_concurrent as f64).abs() < 1e-9
        })
        .await,
        "workload reflects one in-flight task"
    );

    orchestrator.bus().emit(apiary_bus::SwarmEvent::TaskCompleted {
        task_id,
        agent_id,
        result: serde_json::Value::Null,
        execution_time: Duration::from_millis(100),
        metrics: None,
    });
    assert!(
        wait_until(Duration::from_secs(2), || {
            manager.agent(agent_id).unwrap().workload == 0.0
        })
        .await,
        "workload returns to zero"
    );

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sessions_round_trip_through_the_orchestrators_store() {
    let harness = Harness::start(test_config()).await;
    let sessions = harness.orchestrator.sessions().clone();

    let agent_id = harness.spawn_agent("coder").await;
    let session = sessions
        .create_session(SessionProfile {
            agent_id,
            agent_name: "Coder 1".to_string(),
            shell: None,
        })
        .await
        .unwrap();

    sessions
        .persist_sessions(Default::default())
        .await
        .unwrap();
    assert!(sessions.session(session.id).is_some());
    assert_eq!(sessions.active_count(), 1);

    harness.stop().await;
}
