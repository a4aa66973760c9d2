use std::path::Path;

use serde_json::json;

use lieflow_core::types::{TaskStatus, WorkflowEvent};
use lieflow_test_utils::{
    add_number_task, branched_workflow, diamond_workflow, dummy_input, dummy_registry,
    linear_workflow, remote_task, temp_project, AddNumberRunner, MockRemoteRunner,
    RecordingRunner,
};
use lieflow_workflow::schema::{CONFIGURATION, CUSTOM_FUNC};
use lieflow_workflow::{EngineSettings, RunnerRegistry, Workflow, WorkflowSpec};

#[tokio::test]
async fn test_linear_workflow_accumulates() {
    let (spec, nids) = linear_workflow(&[1, 2, 1, 3, 1]);
    let runner = AddNumberRunner::new();
    let wf = Workflow::new(spec, dummy_registry(&runner));
    wf.input(dummy_input(3)).unwrap();
    wf.run_to_end().await.unwrap();

    assert!(wf.is_completed());
    let expected = [4, 6, 7, 10, 11];
    for (nid, value) in nids.iter().zip(expected) {
        let output = wf.output(Some(*nid)).unwrap();
        assert_eq!(output[nid]["dummy"], json!(value), "task {}", nid);
    }
    assert_eq!(runner.calls(), 5);

    let leaves = wf.output(None).unwrap();
    assert_eq!(leaves.keys().copied().collect::<Vec<_>>(), vec![nids[4]]);
    assert!(wf.runtime().is_some());
}

#[tokio::test]
async fn test_branched_workflow_runs_every_branch() {
    let runner = AddNumberRunner::new();
    let wf = Workflow::new(branched_workflow(), dummy_registry(&runner));
    wf.input(dummy_input(0)).unwrap();
    wf.run_to_end().await.unwrap();

    assert!(wf.is_completed());
    assert_eq!(runner.calls(), 9);
    let leaves = wf.output(None).unwrap();
    assert_eq!(leaves.keys().copied().collect::<Vec<_>>(), vec![5, 8, 10]);
    assert_eq!(leaves[&5]["dummy"], json!(4));
    assert_eq!(leaves[&8]["dummy"], json!(5));
    assert_eq!(leaves[&10]["dummy"], json!(5));
}

#[tokio::test]
async fn test_parents_finish_before_children() {
    let (mut spec, [top, left, right, bottom]) = diamond_workflow();
    for nid in [top, left, right, bottom] {
        spec.graph_mut()
            .set_node_attr(nid, CUSTOM_FUNC, json!("record"))
            .unwrap();
    }
    let recorder = RecordingRunner::default();
    let mut registry = RunnerRegistry::new();
    registry.register(recorder.clone());

    let wf = Workflow::new(spec, registry)
        .with_settings(EngineSettings {
            max_parallel_tasks: 1,
            ..EngineSettings::default()
        });
    wf.run_to_end().await.unwrap();

    let order = recorder.order();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], top);
    assert_eq!(order[3], bottom);
}

#[tokio::test]
async fn test_diamond_join_sees_both_parents() {
    let (spec, [_, _, _, bottom]) = diamond_workflow();
    let runner = AddNumberRunner::new();
    let wf = Workflow::new(spec, dummy_registry(&runner));
    wf.input(dummy_input(0)).unwrap();
    wf.run_to_end().await.unwrap();

    assert!(wf.is_completed());
    assert_eq!(wf.output(None).unwrap()[&bottom]["dummy"], json!(3));
}

#[tokio::test]
async fn test_two_task_chain() {
    let mut spec = WorkflowSpec::new();
    let a = spec.add_task("a", "PythonTask", add_number_task(10)).unwrap().nid;
    let b = spec.add_task("b", "PythonTask", add_number_task(8)).unwrap().nid;
    spec.connect_task(a, b, &["dummy"]).unwrap();

    let runner = AddNumberRunner::new();
    let wf = Workflow::new(spec, dummy_registry(&runner));
    wf.input(dummy_input(2)).unwrap();
    wf.run_to_end().await.unwrap();

    assert!(wf.is_completed());
    assert_eq!(wf.output(Some(a)).unwrap()[&a]["dummy"], json!(12));
    assert_eq!(wf.output(None).unwrap()[&b]["dummy"], json!(20));
    assert_eq!(runner.calls(), 2);
}

/// Diamond whose branches sleep for different times.
async fn run_uneven_diamond(left_ms: u64, right_ms: u64) {
    let (mut spec, [top, left, right, bottom]) = diamond_workflow();
    for (nid, ms) in [(left, left_ms), (right, right_ms)] {
        spec.graph_mut()
            .set_node_attr(nid, CONFIGURATION, json!({ "add_number": 1, "sleep_ms": ms }))
            .unwrap();
    }
    let runner = AddNumberRunner::new();
    let wf = Workflow::new(spec, dummy_registry(&runner));
    let mut events = wf.subscribe();
    wf.input(dummy_input(0)).unwrap();
    wf.run_to_end().await.unwrap();

    assert!(wf.is_completed());
    assert_eq!(wf.output(None).unwrap()[&bottom]["dummy"], json!(3));
    assert_eq!(runner.calls(), 4);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            WorkflowEvent::TaskStarted { nid, .. } => seen.push(("started", nid)),
            WorkflowEvent::TaskCompleted { nid, .. } => seen.push(("completed", nid)),
            _ => {}
        }
    }
    let at = |kind: &str, nid| seen.iter().position(|e| *e == (kind, nid)).unwrap();
    assert!(at("completed", top) < at("started", left));
    assert!(at("completed", left) < at("started", bottom));
    assert!(at("completed", right) < at("started", bottom));

    let bottom_start = wf.with_task(bottom, |t| t.started_at()).unwrap().unwrap();
    for branch in [left, right] {
        let ended = wf.with_task(branch, |t| t.ended_at()).unwrap().unwrap();
        assert!(ended <= bottom_start, "task {} ended after the join started", branch);
    }
}

#[tokio::test]
async fn test_diamond_join_waits_for_slow_left_branch() {
    run_uneven_diamond(60, 5).await;
}

#[tokio::test]
async fn test_diamond_join_waits_for_slow_right_branch() {
    run_uneven_diamond(5, 60).await;
}

#[tokio::test]
async fn test_failed_task_halts_branch_and_resumes_after_retry() {
    let (spec, nids) = linear_workflow(&[1, 1, 1]);
    let runner = AddNumberRunner::new();
    let wf = Workflow::new(spec, dummy_registry(&runner));
    wf.update_task(nids[1], |t| {
        let mut conf = t.view()?.configuration();
        conf.insert("fail".into(), json!(true));
        t.set_configuration(conf)
    })
    .unwrap();
    wf.input(dummy_input(0)).unwrap();
    wf.run_to_end().await.unwrap();

    assert!(wf.has_failed());
    assert_eq!(wf.failed_task(), Some(nids[1]));
    assert_eq!(wf.status(nids[2]).unwrap(), TaskStatus::Ready);

    wf.update_task(nids[1], |t| {
        let mut conf = t.view()?.configuration();
        conf.insert("fail".into(), json!(false));
        t.set_configuration(conf)
    })
    .unwrap();
    wf.retry(nids[1]).unwrap();
    wf.run_to_end().await.unwrap();

    assert!(wf.is_completed());
    assert_eq!(wf.output(None).unwrap()[&nids[2]]["dummy"], json!(3));
    // The first task is not run again
    assert_eq!(runner.calls(), 4);
}

#[tokio::test]
async fn test_crashing_task_is_failure() {
    let mut spec = WorkflowSpec::new();
    let mut meta = add_number_task(1);
    meta.insert("configuration".into(), json!({ "crash": true }));
    let nid = spec.add_task("crash", "PythonTask", meta).unwrap().nid;

    let runner = AddNumberRunner::new();
    let wf = Workflow::new(spec, dummy_registry(&runner));
    let mut events = wf.subscribe();
    wf.run_to_end().await.unwrap();

    assert_eq!(wf.status(nid).unwrap(), TaskStatus::Failed);
    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        if let WorkflowEvent::TaskFailed { nid: failed_nid, .. } = event {
            failed = failed_nid == nid;
        }
    }
    assert!(failed);
}

#[tokio::test]
async fn test_timeout_fails_slow_task() {
    let mut spec = WorkflowSpec::new();
    let mut meta = add_number_task(1);
    meta.insert("configuration".into(), json!({ "sleep_ms": 5000 }));
    let nid = spec.add_task("slow", "PythonTask", meta).unwrap().nid;

    let runner = AddNumberRunner::new();
    let wf = Workflow::new(spec, dummy_registry(&runner)).with_settings(EngineSettings {
        task_timeout_secs: 1,
        ..EngineSettings::default()
    });
    wf.run_to_end().await.unwrap();
    assert_eq!(wf.status(nid).unwrap(), TaskStatus::Failed);
}

#[tokio::test]
async fn test_remote_task_uses_qualified_uri_and_workdir() {
    let project = temp_project();
    let mut spec = WorkflowSpec::new();
    spec.set_project_dir(project.path());
    let nid = spec
        .add_task("rpc", "WampTask", remote_task("calc.add", "org.lie"))
        .unwrap()
        .nid;

    let remote = MockRemoteRunner::default();
    let mut registry = RunnerRegistry::new();
    registry.set_remote(remote.clone());

    let wf = Workflow::new(spec, registry);
    wf.input(dummy_input(7)).unwrap();
    wf.run_to_end().await.unwrap();
    assert!(wf.is_completed());

    let calls = remote.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "org.lie.calc.add");
    assert_eq!(calls[0].1["dummy"], json!(7));

    let workdir = wf
        .with_task(nid, |t| t.workdir().map(str::to_string))
        .unwrap()
        .expect("workdir assigned");
    assert!(workdir.starts_with(project.path().to_str().unwrap()));
    assert_eq!(calls[0].1["workdir"], json!(workdir));
    assert!(Path::new(&workdir).join("output.json").exists());
}

#[tokio::test]
async fn test_invalid_remote_task_is_rejected() {
    let mut spec = WorkflowSpec::new();
    spec.add_task("rpc", "WampTask", remote_task("not a uri", ""))
        .unwrap();
    let wf = Workflow::new(spec, RunnerRegistry::new());
    assert!(wf.run().is_err());
    assert!(!wf.is_running());
}
