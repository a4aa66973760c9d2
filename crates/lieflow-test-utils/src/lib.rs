//! Dummy task runners and workflow fixtures shared by lieflow tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use lieflow_core::error::Result;
use lieflow_core::traits::TaskRunner;
use lieflow_core::types::{Attrs, NodeId, TaskRequest, TaskResult};
use lieflow_workflow::schema::{CONFIGURATION, CUSTOM_FUNC, GROUP_CONTEXT, URI};
use lieflow_workflow::{RunnerRegistry, WorkflowSpec};

/// Adds `configuration.add_number` to the integer `dummy` input.
///
/// Configuration flags: `sleep_ms` delays the result, `fail` reports
/// failure, `crash` panics, `return_more` adds a `param3` output key.
#[derive(Clone, Default)]
pub struct AddNumberRunner {
    calls: Arc<AtomicUsize>,
}

impl AddNumberRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the runner was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TaskRunner for AddNumberRunner {
    fn name(&self) -> &str {
        "add_number"
    }

    fn run(&self, request: TaskRequest) -> BoxFuture<'_, Result<TaskResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let conf = &request.configuration;
            let flag = |key: &str| conf.get(key).and_then(Value::as_bool).unwrap_or(false);

            if let Some(ms) = conf.get("sleep_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if flag("crash") {
                panic!("Crashed task");
            }
            if flag("fail") {
                return Ok(TaskResult::failed("task configured to fail"));
            }

            let mut output = Attrs::new();
            let dummy = match request.input.get("dummy") {
                Some(Value::Number(n)) if n.is_i64() => {
                    let add = conf.get("add_number").and_then(Value::as_i64).unwrap_or(0);
                    json!(n.as_i64().unwrap_or(0) + add)
                }
                Some(other) => other.clone(),
                None => Value::Null,
            };
            output.insert("dummy".into(), dummy);
            if flag("return_more") {
                output.insert("param3".into(), json!(request.task_name));
            }
            Ok(TaskResult::completed(output))
        })
    }
}

/// Always fails and counts its attempts.
#[derive(Clone, Default)]
pub struct FailingRunner {
    attempts: Arc<AtomicUsize>,
}

impl FailingRunner {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl TaskRunner for FailingRunner {
    fn name(&self) -> &str {
        "fail"
    }

    fn run(&self, _request: TaskRequest) -> BoxFuture<'_, Result<TaskResult>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(TaskResult::failed("always fails")) })
    }
}

/// Echoes its input and records the order in which tasks ran.
#[derive(Clone, Default)]
pub struct RecordingRunner {
    order: Arc<Mutex<Vec<NodeId>>>,
}

impl RecordingRunner {
    pub fn order(&self) -> Vec<NodeId> {
        self.order.lock().unwrap().clone()
    }
}

impl TaskRunner for RecordingRunner {
    fn name(&self) -> &str {
        "record"
    }

    fn run(&self, request: TaskRequest) -> BoxFuture<'_, Result<TaskResult>> {
        self.order.lock().unwrap().push(request.nid);
        Box::pin(async move { Ok(TaskResult::completed(request.input)) })
    }
}

/// Stands in for a remote procedure endpoint, recording called uris.
#[derive(Clone, Default)]
pub struct MockRemoteRunner {
    calls: Arc<Mutex<Vec<(String, Attrs)>>>,
}

impl MockRemoteRunner {
    /// `(uri, input)` for every call, in order.
    pub fn calls(&self) -> Vec<(String, Attrs)> {
        self.calls.lock().unwrap().clone()
    }
}

impl TaskRunner for MockRemoteRunner {
    fn name(&self) -> &str {
        "remote"
    }

    fn run(&self, request: TaskRequest) -> BoxFuture<'_, Result<TaskResult>> {
        let uri = request.meta_str(URI).unwrap_or("").to_string();
        self.calls
            .lock()
            .unwrap()
            .push((uri.clone(), request.input.clone()));
        Box::pin(async move {
            let mut output = request.input;
            output.insert("called".into(), json!(uri));
            Ok(TaskResult::completed(output))
        })
    }
}

/// Registry with an [`AddNumberRunner`] and a [`FailingRunner`].
pub fn dummy_registry(add: &AddNumberRunner) -> RunnerRegistry {
    let mut registry = RunnerRegistry::new();
    registry.register(add.clone());
    registry.register(FailingRunner::default());
    registry
}

/// Metadata for an `add_number` task.
pub fn add_number_task(number: i64) -> Attrs {
    let mut meta = Attrs::new();
    meta.insert(CUSTOM_FUNC.into(), json!("add_number"));
    meta.insert(CONFIGURATION.into(), json!({ "add_number": number }));
    meta
}

/// Metadata for a remote task.
pub fn remote_task(uri: &str, group_context: &str) -> Attrs {
    let mut meta = Attrs::new();
    meta.insert(URI.into(), json!(uri));
    meta.insert(GROUP_CONTEXT.into(), json!(group_context));
    meta
}

/// Chain of `add_number` tasks, one per entry, with the workflow input
/// `dummy` carried from task to task.
pub fn linear_workflow(numbers: &[i64]) -> (WorkflowSpec, Vec<NodeId>) {
    let mut spec = WorkflowSpec::new();
    spec.set_title("linear");
    let mut nids = Vec::new();
    for (i, number) in numbers.iter().enumerate() {
        let handle = spec
            .add_task(&format!("task{}", i + 1), "PythonTask", add_number_task(*number))
            .expect("add task");
        if let Some(prev) = nids.last() {
            spec.connect_task(*prev, handle.nid, &["dummy"]).expect("connect");
        }
        nids.push(handle.nid);
    }
    (spec, nids)
}

/// Branched workflow of nine `add_number` tasks (nids 2..=10, each adding
/// one) with edges 2-3, 3-4, 4-5, 3-6, 6-7, 7-8, 4-9 and 9-10.
pub fn branched_workflow() -> WorkflowSpec {
    let mut spec = WorkflowSpec::new();
    spec.set_title("branched");
    for i in 2..=10 {
        spec.add_task(&format!("task{}", i), "PythonTask", add_number_task(1))
            .expect("add task");
    }
    for (src, dst) in [(2, 3), (3, 4), (4, 5), (3, 6), (6, 7), (7, 8), (4, 9), (9, 10)] {
        spec.connect_task(src, dst, &["dummy"]).expect("connect");
    }
    spec
}

/// `top` fans out to `left` and `right`, which join in `bottom`.
/// Returns the builder and `[top, left, right, bottom]`.
pub fn diamond_workflow() -> (WorkflowSpec, [NodeId; 4]) {
    let mut spec = WorkflowSpec::new();
    spec.set_title("diamond");
    let mut add = |name: &str| {
        spec.add_task(name, "PythonTask", add_number_task(1))
            .expect("add task")
            .nid
    };
    let (top, left, right, bottom) = (add("top"), add("left"), add("right"), add("bottom"));
    spec.connect_task(top, left, &[]).expect("connect");
    spec.connect_task(top, right, &[]).expect("connect");
    spec.connect_task(left, bottom, &[]).expect("connect");
    spec.connect_task(right, bottom, &[]).expect("connect");
    (spec, [top, left, right, bottom])
}

/// Workflow input `{"dummy": value}`.
pub fn dummy_input(value: i64) -> Attrs {
    let mut input = Attrs::new();
    input.insert("dummy".into(), json!(value));
    input
}

/// Temporary project directory, removed on drop.
pub fn temp_project() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("lieflow-project-")
        .tempdir()
        .expect("create temp project dir")
}
