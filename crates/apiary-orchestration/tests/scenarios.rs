//! End-to-end scenarios across the whole control plane.

mod common;

use std::time::Duration;

use common::{test_config, wait_until, Harness};

use apiary_bus::{DeadlockedAgent, SwarmEvent, Topic};
use apiary_types::{
    AgentErrorKind, AgentStatus, PoolConfig, Task, TaskStatus,
};

#[tokio::test(flavor = "multi_thread")]
async fn basic_dispatch_completes_a_task() {
    let mut config = test_config();
    config.max_agents = 2;
    config.task_queue_size = 8;
    let harness = Harness::start(config).await;
    let orchestrator = &harness.orchestrator;

    let agent_id = harness.spawn_agent("coder").await;
    assert_eq!(
        orchestrator.manager().agent(agent_id).unwrap().status,
        AgentStatus::Idle
    );

    let mut rx = orchestrator.bus().subscribe();
    let mut task = Task::new("code-generation", "implement the typescript parser", 50);
    task.required_capabilities = vec!["code-generation".to_string()];
    task.languages = vec!["typescript".to_string()];
    let task_id = orchestrator.dispatcher().submit_task(task).await.unwrap();

    // Assignment lands within a second.
    let assigned = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(SwarmEvent::TaskAssigned {
                task_id: t,
                agent_id: a,
            }) = rx.recv().await
            {
                if t == task_id {
                    return a;
                }
            }
        }
    })
    .await
    .expect("task:assigned within 1s");
    assert_eq!(assigned, agent_id);

    // The agent runtime reports execution.
    orchestrator.bus().emit(SwarmEvent::TaskStarted { task_id, agent_id });
    orchestrator.bus().emit(SwarmEvent::TaskCompleted {
        task_id,
        agent_id,
        result: serde_json::json!({"ok": true}),
        execution_time: Duration::from_millis(250),
        metrics: Some(serde_json::json!({"tokensUsed": 1200})),
    });

    let manager = orchestrator.manager().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let agent = manager.agent(agent_id).unwrap();
            agent.metrics.tasks_completed == 1
                && agent.status == AgentStatus::Idle
                && agent.workload == 0.0
        })
        .await,
        "agent settles back to idle with one completion"
    );
    let completed = orchestrator.dispatcher().task(task_id).unwrap();
    assert_eq!(completed.status, TaskStatus::Completed);
    assert!(completed.execution_metrics.is_some());

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn capability_mismatch_keeps_task_queued_until_capable_agent_arrives() {
    let harness = Harness::start(test_config()).await;
    let orchestrator = &harness.orchestrator;

    harness.spawn_agent("analyst").await;

    let mut task = Task::new("work", "produce the feature", 50);
    task.required_capabilities = vec!["code-generation".to_string()];
    let task_id = orchestrator.dispatcher().submit_task(task).await.unwrap();

    // No capable agent; the task must stay queued.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        orchestrator.dispatcher().task(task_id).unwrap().status,
        TaskStatus::Queued
    );
    assert!(orchestrator.bus().topic_stats(Topic::TaskAssigned).is_none());

    // A coder shows up; its idle transition drives the queue.
    let coder = harness.spawn_agent("coder").await;
    let dispatcher = orchestrator.dispatcher().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            dispatcher.task(task_id).unwrap().status == TaskStatus::Assigned
        })
        .await,
        "task assigned once a capable agent exists"
    );
    assert_eq!(
        dispatcher.task(task_id).unwrap().assigned_agent,
        Some(coder)
    );

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_timeout_errors_agent_and_auto_restart_recovers() {
    let mut config = test_config();
    config.heartbeat_interval = Duration::from_millis(100);
    config.auto_restart = true;
    let harness = Harness::start(config).await;
    let orchestrator = &harness.orchestrator;

    let agent_id = harness.spawn_agent("coder").await;
    let heartbeats = harness.spawn_heartbeat_pump(agent_id);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Heartbeats stop; after three intervals the watchdog trips.
    heartbeats.abort();
    let manager = orchestrator.manager().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            manager
                .agent(agent_id)
                .map(|a| {
                    a.error_history
                        .iter()
                        .any(|e| e.kind == AgentErrorKind::HeartbeatTimeout)
                })
                .unwrap_or(false)
        })
        .await,
        "heartbeat timeout recorded"
    );

    // Resume heartbeats so the restarted agent stays healthy, then wait
    // for the auto-restart to bring it back to idle.
    let _heartbeats = harness.spawn_heartbeat_pump(agent_id);
    assert!(
        wait_until(Duration::from_secs(5), || {
            manager
                .agent(agent_id)
                .map(|a| a.status == AgentStatus::Idle)
                .unwrap_or(false)
        })
        .await,
        "agent returns to idle after auto-restart"
    );

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_task_is_retried_then_fails_terminally() {
    let mut config = test_config();
    config.task_max_retries = 2;
    let harness = Harness::start(config).await;
    let orchestrator = &harness.orchestrator;

    let _agent = harness.spawn_agent("coder").await;

    // Stand-in agent runtime that fails every assignment.
    let bus = orchestrator.bus().clone();
    let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = std::sync::Arc::clone(&attempts);
    let failing_runtime = {
        let bus_out = bus.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let SwarmEvent::TaskAssigned { task_id, agent_id } = event {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    bus_out.emit(SwarmEvent::TaskStarted { task_id, agent_id });
                    bus_out.emit(SwarmEvent::TaskFailed {
                        task_id,
                        error: "synthetic failure".to_string(),
                    });
                }
            }
        })
    };

    let task_id = orchestrator
        .dispatcher()
        .submit_task(Task::new("code-generation", "implement the feature", 50))
        .await
        .unwrap();

    // Three attempts total: the original plus two retries (backoffs of
    // roughly one and two seconds).
    let dispatcher = orchestrator.dispatcher().clone();
    assert!(
        wait_until(Duration::from_secs(8), || {
            dispatcher.task(task_id).unwrap().status == TaskStatus::Failed
        })
        .await,
        "task reaches terminal failure"
    );
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    let task = dispatcher.task(task_id).unwrap();
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.error.as_deref(), Some("synthetic failure"));

    failing_runtime.abort();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_pool_scales_up_and_reports_the_transition() {
    let harness = Harness::start(test_config()).await;
    let orchestrator = &harness.orchestrator;

    // Single-slot template so one task saturates the member.
    let mut template = orchestrator
        .manager()
        .template("coder")
        .expect("coder template");
    template.agent_type = "coder-pool".to_string();
    template.capabilities.max_concurrent_tasks = 1;
    template.environment.runtime = "/bin/sh".to_string();
    template.environment.working_directory = harness.dir.path().to_path_buf();
    template.environment.log_directory = harness.dir.path().to_path_buf();
    template.environment.temp_directory = harness.dir.path().to_path_buf();
    template.startup_script = common::write_sleep_script(harness.dir.path());
    orchestrator.manager().register_template(template);

    let pool_id = orchestrator
        .manager()
        .create_agent_pool(
            "coders",
            "coder-pool",
            PoolConfig {
                min_size: 1,
                max_size: 3,
                auto_scale: true,
                scale_up_threshold: 0.8,
                scale_down_threshold: 0.1,
            },
        )
        .await
        .unwrap();
    assert_eq!(orchestrator.manager().pool(pool_id).unwrap().current_size(), 1);

    // Saturate the single member.
    let mut task = Task::new("code-generation", "implement the feature", 60);
    task.required_capabilities = vec!["code-generation".to_string()];
    orchestrator.dispatcher().submit_task(task).await.unwrap();

    let manager = orchestrator.manager().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            manager
                .pool(pool_id)
                .map(|p| p.utilization() >= 0.8)
                .unwrap_or(false)
        })
        .await,
        "pool member saturated"
    );

    let mut rx = orchestrator.bus().subscribe();
    orchestrator.manager().autoscale_pools().await;

    let pool = orchestrator.manager().pool(pool_id).unwrap();
    assert_eq!(pool.current_size(), 2);
    let mut saw_scaled = false;
    while let Ok(event) = rx.try_recv() {
        if let SwarmEvent::PoolScaled {
            pool_id: p,
            from_size,
            to_size,
        } = event
        {
            assert_eq!(p, pool_id);
            assert_eq!((from_size, to_size), (1, 2));
            saw_scaled = true;
        }
    }
    assert!(saw_scaled, "pool:scaled observed");

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deadlock_cancels_only_the_lowest_priority_agents_tasks() {
    let harness = Harness::start(test_config()).await;
    let orchestrator = &harness.orchestrator;

    let victim = harness.spawn_agent("coder").await;
    let survivor = harness.spawn_agent("coder").await;

    let mut victim_task = Task::new("code-generation", "implement", 50);
    victim_task.assigned_agent = Some(victim);
    let victim_task_id = orchestrator
        .dispatcher()
        .submit_task(victim_task)
        .await
        .unwrap();

    let mut survivor_task = Task::new("code-generation", "implement", 50);
    survivor_task.assigned_agent = Some(survivor);
    let survivor_task_id = orchestrator
        .dispatcher()
        .submit_task(survivor_task)
        .await
        .unwrap();

    orchestrator.bus().emit(SwarmEvent::DeadlockDetected {
        agents: vec![
            DeadlockedAgent {
                agent_id: victim,
                priority: 10,
            },
            DeadlockedAgent {
                agent_id: survivor,
                priority: 50,
            },
        ],
        resources: vec!["shared-repo".to_string()],
    });

    let dispatcher = orchestrator.dispatcher().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            dispatcher.task(victim_task_id).unwrap().status == TaskStatus::Cancelled
        })
        .await,
        "victim task cancelled"
    );
    let cancelled = dispatcher.task(victim_task_id).unwrap();
    assert_eq!(cancelled.error.as_deref(), Some("Agent termination"));
    assert_eq!(
        dispatcher.task(survivor_task_id).unwrap().status,
        TaskStatus::Assigned
    );

    harness.stop().await;
}
