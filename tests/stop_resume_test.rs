mod common;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Notify;

use mageflow::{
    PauseKind, SignOptions, SignatureStatus, SwarmConfig, SwarmOptions, TaskSpec, TriggerScope,
};

use common::Harness;

#[tokio::test]
async fn paused_chain_holds_the_next_step_until_resumed() {
    let h = Harness::new().await;
    h.register_fn(TaskSpec::new("a"), |_| Ok(json!("from-a"))).await;
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    h.register_gated("sleepy", Arc::clone(&started), Arc::clone(&release))
        .await;
    h.register_fn(TaskSpec::new("c"), Ok).await;
    h.register_fn(TaskSpec::new("s"), Ok).await;

    let success = h.engine.sign("s", SignOptions::default()).await.unwrap();
    let chain = h
        .engine
        .chain(
            vec!["a".into(), "sleepy".into(), "c".into()],
            mageflow::ChainOptions {
                success: Some(success.id().clone()),
                ..mageflow::ChainOptions::default()
            },
        )
        .await
        .expect("chain");
    let step_ids = chain.as_chain().expect("chain signature").tasks.clone();

    h.engine
        .run_no_wait(&chain, json!({}), &TriggerScope::default())
        .await
        .expect("run");

    // Pause mid-flight, while the second step is running.
    started.notified().await;
    h.engine
        .pause_by_id(chain.id(), PauseKind::Soft)
        .await
        .expect("pause");

    let step_c = h.engine.load_signature(&step_ids[2]).await.expect("step c");
    assert_eq!(step_c.core().task_status.status, SignatureStatus::Suspended);

    // Let the running step finish; the chain must not advance.
    release.notify_one();
    h.settle().await;
    assert_eq!(h.probes.count("c").await, 0, "paused chain advanced");
    assert_eq!(h.probes.count("s").await, 0);

    // The refused trigger parked the upstream result on the suspended step.
    let step_c = h.engine.load_signature(&step_ids[2]).await.expect("step c");
    assert_eq!(
        step_c.core().task_status.last_status,
        SignatureStatus::Active
    );
    assert!(step_c.core().kwargs.contains_key("results"));

    h.engine.resume_by_id(chain.id()).await.expect("resume");
    h.settle().await;

    assert_eq!(h.probes.count("c").await, 1);
    assert_eq!(h.probes.count("s").await, 1);
    let c_runs = h.probes.runs_of("c").await;
    assert_eq!(c_runs[0].payload["results"]["results"], json!("from-a"));
    h.assert_store_clean().await;
}

#[tokio::test]
async fn suspended_swarm_resumes_every_child() {
    let h = Harness::new().await;
    h.register_fn(TaskSpec::new("work"), Ok).await;
    h.register_fn(TaskSpec::new("k"), Ok).await;

    let success = h.engine.sign("k", SignOptions::default()).await.unwrap();
    let first = h.engine.sign("work", SignOptions::default()).await.unwrap();
    let second = h.engine.sign("work", SignOptions::default()).await.unwrap();
    let swarm = h
        .engine
        .swarm(
            vec![first.id().clone().into(), second.id().clone().into()],
            SwarmOptions {
                config: SwarmConfig {
                    max_concurrency: 2,
                    ..SwarmConfig::default()
                },
                success_callbacks: vec![success.id().clone()],
                ..SwarmOptions::default()
            },
        )
        .await
        .expect("swarm");
    h.engine.close_swarm(swarm.id()).await.expect("close");

    h.engine.suspend_by_id(swarm.id()).await.expect("suspend");
    let original = h.engine.load_signature(first.id()).await.expect("original");
    assert_eq!(
        original.core().task_status.status,
        SignatureStatus::Suspended
    );

    h.engine
        .run_no_wait(&swarm, json!({}), &TriggerScope::default())
        .await
        .expect("run");
    h.settle().await;
    assert_eq!(h.probes.count("work").await, 0, "suspended children ran");

    h.engine.resume_by_id(swarm.id()).await.expect("resume");
    h.settle().await;

    assert_eq!(h.probes.count("work").await, 2);
    assert_eq!(h.probes.count("k").await, 1);
    h.assert_store_clean().await;
}

#[tokio::test]
async fn resume_restores_non_active_children_without_running_them() {
    let h = Harness::new().await;
    h.register_fn(TaskSpec::new("work"), Ok).await;

    let signature = h.engine.sign("work", SignOptions::default()).await.unwrap();
    h.engine
        .suspend_by_id(signature.id())
        .await
        .expect("suspend");
    h.engine.resume_by_id(signature.id()).await.expect("resume");
    h.settle().await;

    // Never picked up while suspended, so resume restores PENDING quietly.
    assert_eq!(h.probes.count("work").await, 0);
    let stored = h.engine.load_signature(signature.id()).await.expect("load");
    assert_eq!(stored.core().task_status.status, SignatureStatus::Pending);
}
