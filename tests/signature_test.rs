mod common;

use serde_json::json;

use mageflow::domain::ports::executor::TriggerScope;
use mageflow::{
    FlowError, InputSchema, PauseKind, SignOptions, SignatureId, SignatureStatus, TaskSpec,
};

use common::Harness;

#[tokio::test]
async fn sign_resolves_schema_from_registry() {
    let h = Harness::new().await;
    let schema = InputSchema::with_return_field("ProducerInput", "upstream");
    h.register_fn(
        TaskSpec::new("producer").with_schema(schema.clone()),
        |payload| Ok(payload),
    )
    .await;

    let signature = h
        .engine
        .sign("producer", SignOptions::default())
        .await
        .expect("sign");
    assert_eq!(signature.core().input_schema, Some(schema));
    assert!(signature.id().as_str().starts_with("task:"));
}

#[tokio::test]
async fn run_merges_kwargs_over_payload() {
    let h = Harness::new().await;
    h.register_fn(TaskSpec::new("echo"), Ok).await;

    let kwargs = json!({"a": 2}).as_object().cloned().unwrap();
    let signature = h
        .engine
        .sign(
            "echo",
            SignOptions {
                kwargs,
                ..SignOptions::default()
            },
        )
        .await
        .expect("sign");

    h.engine
        .run_no_wait(&signature, json!({"a": 1, "b": 1}), &TriggerScope::default())
        .await
        .expect("run");
    h.settle().await;

    let runs = h.probes.runs_of("echo").await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].payload, json!({"a": 2, "b": 1}));
    h.assert_store_clean().await;
}

#[tokio::test]
async fn success_callback_sees_the_result_under_its_return_field() {
    let h = Harness::new().await;
    h.register_fn(TaskSpec::new("producer"), |_| Ok(json!(42))).await;
    h.register_fn(TaskSpec::new("consumer"), Ok).await;

    let consumer = h
        .engine
        .sign(
            "consumer",
            SignOptions {
                kwargs: json!({"own": true}).as_object().cloned().unwrap(),
                ..SignOptions::default()
            },
        )
        .await
        .expect("sign consumer");
    let producer = h
        .engine
        .sign(
            "producer",
            SignOptions {
                success_callbacks: vec![consumer.id().clone()],
                ..SignOptions::default()
            },
        )
        .await
        .expect("sign producer");

    h.engine
        .run_no_wait(&producer, json!({}), &TriggerScope::default())
        .await
        .expect("run");
    h.settle().await;

    let runs = h.probes.runs_of("consumer").await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].payload, json!({"results": 42, "own": true}));
    h.assert_store_clean().await;
}

#[tokio::test]
async fn error_callback_sees_the_failing_tasks_message() {
    let h = Harness::new().await;
    h.register_fail("boom", true).await;
    h.register_fn(TaskSpec::new("on_err"), Ok).await;

    let on_err = h
        .engine
        .sign("on_err", SignOptions::default())
        .await
        .expect("sign on_err");
    let boom = h
        .engine
        .sign(
            "boom",
            SignOptions {
                error_callbacks: vec![on_err.id().clone()],
                ..SignOptions::default()
            },
        )
        .await
        .expect("sign boom");

    h.engine
        .run_no_wait(&boom, json!({"x": 1}), &TriggerScope::default())
        .await
        .expect("run");
    h.settle().await;

    assert_eq!(h.probes.count("boom").await, 1);
    let runs = h.probes.runs_of("on_err").await;
    assert_eq!(runs.len(), 1);
    // Error payloads are not renamed into a results field.
    assert_eq!(runs[0].payload["x"], json!(1));
    h.assert_store_clean().await;
}

#[tokio::test]
async fn missing_callback_raises_missing_signature() {
    let h = Harness::new().await;
    h.register_fn(TaskSpec::new("producer"), Ok).await;

    let producer = h
        .engine
        .sign(
            "producer",
            SignOptions {
                success_callbacks: vec![SignatureId::from("task:00000000-missing")],
                ..SignOptions::default()
            },
        )
        .await
        .expect("sign");

    let err = h
        .engine
        .activate_success(&producer, json!(1))
        .await
        .expect_err("callback should be missing");
    assert!(matches!(err, FlowError::MissingSignature(_)));
}

#[tokio::test]
async fn canceled_signature_is_removed_on_next_touch() {
    let h = Harness::new().await;
    h.register_fn(TaskSpec::new("work"), Ok).await;

    let signature = h
        .engine
        .sign("work", SignOptions::default())
        .await
        .expect("sign");
    h.engine
        .change_status(&signature, SignatureStatus::Canceled)
        .await
        .expect("cancel");

    h.engine
        .run_no_wait(&signature, json!({}), &TriggerScope::default())
        .await
        .expect("run");
    h.settle().await;

    assert_eq!(h.probes.count("work").await, 0);
    h.assert_store_clean().await;
}

#[tokio::test]
async fn suspended_signature_absorbs_payload_and_resumes() {
    let h = Harness::new().await;
    h.register_fn(TaskSpec::new("work"), Ok).await;

    let signature = h
        .engine
        .sign("work", SignOptions::default())
        .await
        .expect("sign");
    h.engine
        .suspend_by_id(signature.id())
        .await
        .expect("suspend");

    h.engine
        .run_no_wait(&signature, json!({"x": 9}), &TriggerScope::default())
        .await
        .expect("run");
    h.settle().await;
    assert_eq!(h.probes.count("work").await, 0);

    // The refused attempt merged the payload and marked the signature as
    // previously active, so resume re-triggers it.
    let stored = h
        .engine
        .load_signature(signature.id())
        .await
        .expect("still stored");
    assert_eq!(stored.core().kwargs.get("x"), Some(&json!(9)));
    assert_eq!(
        stored.core().task_status.last_status,
        SignatureStatus::Active
    );

    h.engine.resume_by_id(signature.id()).await.expect("resume");
    h.settle().await;

    let runs = h.probes.runs_of("work").await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].payload["x"], json!(9));
    h.assert_store_clean().await;
}

#[tokio::test]
async fn duplicates_are_persisted_under_fresh_ids() {
    let h = Harness::new().await;
    h.register_fn(TaskSpec::new("work"), Ok).await;

    let original = h
        .engine
        .sign(
            "work",
            SignOptions {
                kwargs: json!({"seed": 7}).as_object().cloned().unwrap(),
                ..SignOptions::default()
            },
        )
        .await
        .expect("sign");

    let copies = h
        .engine
        .duplicate_many(&original, 3)
        .await
        .expect("duplicate");
    assert_eq!(copies.len(), 3);
    for copy in &copies {
        assert_ne!(copy.id(), original.id());
        let stored = h.engine.load_signature(copy.id()).await.expect("stored");
        assert_eq!(stored.task_name(), "work");
        assert_eq!(stored.core().kwargs.get("seed"), Some(&json!(7)));
    }
}

#[tokio::test]
async fn change_status_records_the_previous_status() {
    let h = Harness::new().await;
    h.register_fn(TaskSpec::new("work"), Ok).await;

    let signature = h
        .engine
        .sign("work", SignOptions::default())
        .await
        .expect("sign");
    h.engine
        .change_status(&signature, SignatureStatus::Suspended)
        .await
        .expect("suspend");

    let stored = h
        .engine
        .load_signature(signature.id())
        .await
        .expect("load");
    assert_eq!(stored.core().task_status.status, SignatureStatus::Suspended);
    assert_eq!(
        stored.core().task_status.last_status,
        SignatureStatus::Pending
    );
}

#[tokio::test]
async fn interrupt_refuses_loudly() {
    let h = Harness::new().await;
    h.register_fn(TaskSpec::new("work"), Ok).await;
    let signature = h
        .engine
        .sign("work", SignOptions::default())
        .await
        .expect("sign");

    let err = h
        .engine
        .interrupt_by_id(signature.id())
        .await
        .expect_err("interrupt is reserved");
    assert!(matches!(err, FlowError::Unsupported(_)));

    let err = h
        .engine
        .pause_by_id(signature.id(), PauseKind::Hard)
        .await
        .expect_err("hard pause is reserved");
    assert!(matches!(err, FlowError::Unsupported(_)));
}
