use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use lieflow_core::error::{FlowError, Result};
use lieflow_core::types::{parse_timestamp, Attrs, NodeId, TaskStatus};
use lieflow_graph::algorithms;
use lieflow_graph::{attrs, Graph, GraphOrm};

use crate::schema::{self, *};

/// How a task's work gets done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing to run: the node completes with its own input as output.
    Passthrough,
    /// A locally registered runner by name, or the fallback runner.
    Local(Option<String>),
    /// The remote procedure runner, with a fully qualified uri.
    Remote(String),
}

/// Behaviour attached to task nodes by their `task_type`.
pub trait TaskBehavior: Send + Sync + 'static {
    /// Task type name, as stored in `task_type`.
    fn name(&self) -> &str;

    /// Whether the node is a unit of work (the Start marker is not).
    fn is_task(&self) -> bool {
        true
    }

    /// Blocking tasks never run at the same time as one another.
    fn is_blocking(&self) -> bool {
        false
    }

    /// Type specific schema problems on top of the common task schema.
    fn schema_problems(&self, attrs: &Attrs) -> Vec<String> {
        let _ = attrs;
        Vec::new()
    }

    /// Precondition check run before the task is dispatched.
    fn validate(&self, attrs: &Attrs) -> bool {
        schema::check(attrs).is_empty() && self.schema_problems(attrs).is_empty()
    }

    /// Decide which runner performs the work.
    fn dispatch(&self, attrs: &Attrs) -> Result<Dispatch>;

    /// Adjust the resolved input right before dispatch.
    fn prepare_input(&self, attrs: &Attrs, input: &mut Attrs) {
        let _ = (attrs, input);
    }
}

pub type TaskOrm = GraphOrm<dyn TaskBehavior>;

/// Workflow root marker holding the workflow input.
pub struct StartTask;

impl TaskBehavior for StartTask {
    fn name(&self) -> &str {
        "Start"
    }

    fn is_task(&self) -> bool {
        false
    }

    fn dispatch(&self, _attrs: &Attrs) -> Result<Dispatch> {
        Ok(Dispatch::Passthrough)
    }
}

/// Runs a host registered function named by `custom_func`.
pub struct PythonTask;

impl TaskBehavior for PythonTask {
    fn name(&self) -> &str {
        "PythonTask"
    }

    fn dispatch(&self, attrs: &Attrs) -> Result<Dispatch> {
        Ok(Dispatch::Local(custom_func(attrs)))
    }
}

/// Like [`PythonTask`], serialised against other blocking tasks.
pub struct BlockingPythonTask;

impl TaskBehavior for BlockingPythonTask {
    fn name(&self) -> &str {
        "BlockingPythonTask"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn dispatch(&self, attrs: &Attrs) -> Result<Dispatch> {
        Ok(Dispatch::Local(custom_func(attrs)))
    }
}

fn custom_func(attrs: &Attrs) -> Option<String> {
    attrs
        .get(CUSTOM_FUNC)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Calls a remote procedure through the injected remote runner.
pub struct WampTask;

/// `word(.word)*` with word characters only.
fn is_dotted_name(s: &str) -> bool {
    !s.is_empty()
        && s.split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_'))
}

impl WampTask {
    /// Uri prefixed with the group context unless it already starts with it.
    pub fn qualified_uri(attrs: &Attrs) -> Option<String> {
        let uri = attrs.get(URI).and_then(Value::as_str)?;
        match attrs.get(GROUP_CONTEXT).and_then(Value::as_str) {
            Some(ctx) if !ctx.is_empty() && !uri.starts_with(ctx) => {
                Some(format!("{}.{}", ctx, uri))
            }
            _ => Some(uri.to_string()),
        }
    }
}

impl TaskBehavior for WampTask {
    fn name(&self) -> &str {
        "WampTask"
    }

    fn schema_problems(&self, attrs: &Attrs) -> Vec<String> {
        let mut problems = Vec::new();
        match attrs.get(URI).and_then(Value::as_str) {
            Some(uri) if is_dotted_name(uri) => {}
            Some(uri) => problems.push(format!("uri: '{}' is not a dotted procedure name", uri)),
            None => problems.push("uri: required".to_string()),
        }
        if let Some(ctx) = attrs.get(GROUP_CONTEXT).and_then(Value::as_str) {
            if !ctx.is_empty() && !is_dotted_name(ctx) {
                problems.push(format!("group_context: '{}' is not a dotted name", ctx));
            }
        }
        problems
    }

    fn dispatch(&self, attrs: &Attrs) -> Result<Dispatch> {
        Self::qualified_uri(attrs)
            .map(Dispatch::Remote)
            .ok_or_else(|| FlowError::Validation("WampTask without uri".into()))
    }

    fn prepare_input(&self, attrs: &Attrs, input: &mut Attrs) {
        let store = attrs.get(STORE_OUTPUT).and_then(Value::as_bool).unwrap_or(true);
        if let (true, Some(workdir)) = (store, attrs.get(WORKDIR).and_then(Value::as_str)) {
            input.insert(WORKDIR.into(), json!(workdir));
        }
    }
}

/// ORM with the builtin task types mapped on `task_type`.
pub fn workflow_orm() -> TaskOrm {
    let mut orm = TaskOrm::new();
    let behaviors: Vec<Arc<dyn TaskBehavior>> = vec![
        Arc::new(StartTask),
        Arc::new(PythonTask),
        Arc::new(BlockingPythonTask),
        Arc::new(WampTask),
    ];
    for behavior in behaviors {
        let pattern = attrs([(TASK_TYPE, json!(behavior.name()))]);
        orm.map_node(pattern, behavior, 0);
    }
    orm
}

/// Highest precedence behaviour of a node.
pub fn behavior_of(orm: &TaskOrm, attrs: &Attrs) -> Option<Arc<dyn TaskBehavior>> {
    orm.resolve_node(attrs).first().cloned()
}

/// Whether a task type is known to the ORM.
pub fn is_supported_type(orm: &TaskOrm, task_type: &str) -> bool {
    orm.mapped_node_types()
        .get(TASK_TYPE)
        .map(|types| types.iter().any(|t| t.as_str() == Some(task_type)))
        .unwrap_or(false)
}

/// Run `validate` on the node and then on every ancestor, nearest first,
/// stopping at the first failure.
pub fn validate_hierarchy(graph: &Graph, orm: &TaskOrm, nid: NodeId) -> Result<bool> {
    let mut chain = vec![nid];
    chain.extend(algorithms::ancestors(graph, nid)?);

    for member in chain {
        let view = orm.node(graph, member)?;
        for behavior in view.capabilities() {
            if !behavior.validate(view.attrs()) {
                warn!(nid, failed_at = member, behavior = behavior.name(), "Task validation failed");
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Typed read access to a task node.
#[derive(Clone, Copy)]
pub struct TaskView<'g> {
    graph: &'g Graph,
    nid: NodeId,
    attrs: &'g Attrs,
}

impl<'g> TaskView<'g> {
    pub fn new(graph: &'g Graph, nid: NodeId) -> Result<Self> {
        Ok(Self {
            graph,
            nid,
            attrs: graph.node(nid)?,
        })
    }

    pub fn nid(&self) -> NodeId {
        self.nid
    }

    pub fn attrs(&self) -> &'g Attrs {
        self.attrs
    }

    fn str_attr(&self, key: &str) -> Option<&'g str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    fn map_attr(&self, key: &str) -> Attrs {
        self.attrs
            .get(key)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    pub fn name(&self) -> &'g str {
        self.str_attr(KEY).unwrap_or("")
    }

    pub fn task_type(&self) -> &'g str {
        self.str_attr(TASK_TYPE).unwrap_or("")
    }

    pub fn status(&self) -> Result<TaskStatus> {
        self.str_attr(STATUS)
            .ok_or_else(|| FlowError::Validation(format!("task {} has no status", self.nid)))?
            .parse()
    }

    /// Status, treating a malformed value as `ready`.
    pub fn status_or_ready(&self) -> TaskStatus {
        self.status().unwrap_or(TaskStatus::Ready)
    }

    pub fn task_id(&self) -> Option<Uuid> {
        self.str_attr(TASK_ID).and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn retry_count(&self) -> u64 {
        self.attrs.get(RETRY_COUNT).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn store_output(&self) -> bool {
        self.attrs.get(STORE_OUTPUT).and_then(Value::as_bool).unwrap_or(true)
    }

    pub fn breakpoint(&self) -> bool {
        self.attrs.get(BREAKPOINT).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn workdir(&self) -> Option<&'g str> {
        self.str_attr(WORKDIR)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.str_attr(STARTED_AT).and_then(parse_timestamp)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.str_attr(ENDED_AT).and_then(parse_timestamp)
    }

    /// Wall time of the last attempt, once it has ended.
    pub fn runtime(&self) -> Option<chrono::Duration> {
        Some(self.ended_at()? - self.started_at()?)
    }

    pub fn input(&self) -> Attrs {
        self.map_attr(INPUT_DATA)
    }

    pub fn configuration(&self) -> Attrs {
        self.map_attr(CONFIGURATION)
    }

    /// Stored output. An output of the form `{"$ref": path}` is loaded from
    /// the referenced JSON file.
    pub fn get_output(&self) -> Result<Attrs> {
        let output = self.map_attr(OUTPUT_DATA);
        match output.get("$ref").and_then(Value::as_str) {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|_| {
                    FlowError::Workflow(format!(
                        "Task {} ({}) output file does not exist: {}",
                        self.nid,
                        self.name(),
                        path
                    ))
                })?;
                Ok(serde_json::from_str(&content)?)
            }
            None => Ok(output),
        }
    }

    pub fn custom_func(&self) -> Option<&'g str> {
        self.str_attr(CUSTOM_FUNC)
    }

    pub fn uri(&self) -> Option<&'g str> {
        self.str_attr(URI)
    }

    pub fn group_context(&self) -> Option<&'g str> {
        self.str_attr(GROUP_CONTEXT)
    }

    pub fn children(&self) -> &'g [NodeId] {
        self.graph.children(self.nid).unwrap_or(&[])
    }

    pub fn parents(&self) -> &'g [NodeId] {
        self.graph.parents(self.nid).unwrap_or(&[])
    }
}

/// Validated write access to a task node.
///
/// Every setter checks the value against the task schema first, so a
/// rejected write leaves the node untouched.
pub struct TaskMut<'g> {
    graph: &'g mut Graph,
    nid: NodeId,
}

impl<'g> TaskMut<'g> {
    pub fn new(graph: &'g mut Graph, nid: NodeId) -> Result<Self> {
        graph.node(nid)?;
        Ok(Self { graph, nid })
    }

    pub fn nid(&self) -> NodeId {
        self.nid
    }

    pub fn view(&self) -> Result<TaskView<'_>> {
        TaskView::new(self.graph, self.nid)
    }

    /// Set any attribute, validating schema keys. A status write must also
    /// be a legal transition from the current status.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        schema::validate_value(key, &value)?;
        if key == STATUS {
            self.check_transition(&value)?;
        }
        self.graph.set_node_attr(self.nid, key, value)
    }

    fn check_transition(&self, value: &Value) -> Result<()> {
        let next: TaskStatus = value.as_str().unwrap_or_default().parse()?;
        // Missing or malformed current status: anything goes
        let Ok(current) = self.view()?.status() else {
            return Ok(());
        };
        if current.can_transition_to(next) {
            Ok(())
        } else {
            Err(FlowError::Workflow(format!(
                "Task {} cannot move from {} to {}",
                self.nid, current, next
            )))
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) -> Result<()> {
        debug!(nid = self.nid, status = %status, "Task status");
        self.set(STATUS, json!(status.as_str()))
    }

    /// Set the status without checking the transition. For engine resets of
    /// interrupted tasks and the re-armed Start node.
    pub fn force_status(&mut self, status: TaskStatus) -> Result<()> {
        debug!(nid = self.nid, status = %status, "Task status forced");
        self.graph.set_node_attr(self.nid, STATUS, json!(status.as_str()))
    }

    /// Set status from its string form.
    pub fn set_status_str(&mut self, status: &str) -> Result<()> {
        self.set(STATUS, json!(status))
    }

    pub fn set_task_id(&mut self, task_id: &str) -> Result<()> {
        self.set(TASK_ID, json!(task_id))
    }

    pub fn set_retry_count(&mut self, retry_count: u64) -> Result<()> {
        self.set(RETRY_COUNT, json!(retry_count))
    }

    pub fn set_breakpoint(&mut self, breakpoint: bool) -> Result<()> {
        self.set(BREAKPOINT, json!(breakpoint))
    }

    pub fn set_store_output(&mut self, store: bool) -> Result<()> {
        self.set(STORE_OUTPUT, json!(store))
    }

    pub fn set_workdir(&mut self, workdir: Option<&Path>) -> Result<()> {
        let value = match workdir {
            Some(path) => json!(path.display().to_string()),
            None => Value::Null,
        };
        self.set(WORKDIR, value)
    }

    pub fn set_started_at(&mut self, at: Option<&str>) -> Result<()> {
        self.set(STARTED_AT, at.map(|s| json!(s)).unwrap_or(Value::Null))
    }

    pub fn set_ended_at(&mut self, at: Option<&str>) -> Result<()> {
        self.set(ENDED_AT, at.map(|s| json!(s)).unwrap_or(Value::Null))
    }

    /// Merge values into `input_data`.
    pub fn set_input(&mut self, values: Attrs) -> Result<()> {
        let mut input = self.view()?.input();
        input.extend(values);
        self.set(INPUT_DATA, Value::Object(input))
    }

    /// Replace `input_data` entirely.
    pub fn replace_input(&mut self, values: Attrs) -> Result<()> {
        self.set(INPUT_DATA, Value::Object(values))
    }

    pub fn set_output(&mut self, output: Attrs) -> Result<()> {
        self.set(OUTPUT_DATA, Value::Object(output))
    }

    /// Merge values into `configuration`.
    pub fn set_configuration(&mut self, values: Attrs) -> Result<()> {
        let mut configuration = self.view()?.configuration();
        configuration.extend(values);
        self.set(CONFIGURATION, Value::Object(configuration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_task(task_type: &str) -> (Graph, NodeId) {
        let mut g = Graph::new();
        let nid = g.add_node(task_defaults("t", task_type, 1));
        (g, nid)
    }

    #[test]
    fn test_status_validation_keeps_prior_value() {
        let (mut g, nid) = graph_with_task("PythonTask");
        let mut task = TaskMut::new(&mut g, nid).unwrap();
        task.set_status(TaskStatus::Running).unwrap();
        let err = task.set_status_str("paused").unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
        assert_eq!(task.view().unwrap().status().unwrap(), TaskStatus::Running);
    }

    #[test]
    fn test_completed_task_cannot_restart() {
        let (mut g, nid) = graph_with_task("PythonTask");
        let mut task = TaskMut::new(&mut g, nid).unwrap();
        task.set_status(TaskStatus::Completed).unwrap();

        let err = task.set_status(TaskStatus::Running).unwrap_err();
        assert!(matches!(err, FlowError::Workflow(_)));
        assert!(task.set_status_str("ready").is_err());
        assert!(task.set(STATUS, json!("failed")).is_err());
        assert_eq!(task.view().unwrap().status().unwrap(), TaskStatus::Completed);

        task.force_status(TaskStatus::Ready).unwrap();
        assert_eq!(task.view().unwrap().status().unwrap(), TaskStatus::Ready);
    }

    #[test]
    fn test_failed_task_only_returns_to_ready() {
        let (mut g, nid) = graph_with_task("PythonTask");
        let mut task = TaskMut::new(&mut g, nid).unwrap();
        task.set_status(TaskStatus::Running).unwrap();
        task.set_status(TaskStatus::Failed).unwrap();
        assert!(task.set_status(TaskStatus::Running).is_err());
        task.set_status(TaskStatus::Ready).unwrap();
        task.set_status(TaskStatus::Running).unwrap();
    }

    #[test]
    fn test_task_id_must_be_uuid() {
        let (mut g, nid) = graph_with_task("PythonTask");
        let before = TaskView::new(&g, nid).unwrap().task_id();
        let mut task = TaskMut::new(&mut g, nid).unwrap();
        assert!(task.set_task_id("1234").is_err());
        assert_eq!(task.view().unwrap().task_id(), before);
        let fresh = Uuid::new_v4().to_string();
        task.set_task_id(&fresh).unwrap();
        assert_eq!(task.view().unwrap().task_id().map(|u| u.to_string()), Some(fresh));
    }

    #[test]
    fn test_set_input_merges() {
        let (mut g, nid) = graph_with_task("PythonTask");
        let mut task = TaskMut::new(&mut g, nid).unwrap();
        task.set_input(attrs([("a", json!(1)), ("b", json!(2))])).unwrap();
        task.set_input(attrs([("b", json!(3))])).unwrap();
        let input = task.view().unwrap().input();
        assert_eq!(input["a"], json!(1));
        assert_eq!(input["b"], json!(3));
    }

    #[test]
    fn test_output_reference_loaded_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.json");
        std::fs::write(&path, r#"{"dummy": 7}"#).unwrap();

        let (mut g, nid) = graph_with_task("PythonTask");
        TaskMut::new(&mut g, nid)
            .unwrap()
            .set_output(attrs([("$ref", json!(path.display().to_string()))]))
            .unwrap();
        let output = TaskView::new(&g, nid).unwrap().get_output().unwrap();
        assert_eq!(output["dummy"], json!(7));

        std::fs::remove_file(&path).unwrap();
        assert!(TaskView::new(&g, nid).unwrap().get_output().is_err());
    }

    #[test]
    fn test_wamp_uri_rules() {
        let wamp = WampTask;
        let mut a = task_defaults("w", "WampTask", 0);
        assert_eq!(wamp.schema_problems(&a), vec!["uri: required".to_string()]);

        a.insert(URI.into(), json!("bad uri!"));
        assert_eq!(wamp.schema_problems(&a).len(), 1);

        a.insert(URI.into(), json!("md.run_simulation"));
        a.insert(GROUP_CONTEXT.into(), json!("mdgroup.lie"));
        assert!(wamp.schema_problems(&a).is_empty());
        assert_eq!(
            wamp.dispatch(&a).unwrap(),
            Dispatch::Remote("mdgroup.lie.md.run_simulation".into())
        );

        a.insert(URI.into(), json!("mdgroup.lie.md.run"));
        assert_eq!(
            wamp.dispatch(&a).unwrap(),
            Dispatch::Remote("mdgroup.lie.md.run".into())
        );
    }

    #[test]
    fn test_wamp_adds_workdir_to_input() {
        let wamp = WampTask;
        let mut a = task_defaults("w", "WampTask", 0);
        a.insert(WORKDIR.into(), json!("/tmp/task-1"));
        let mut input = Attrs::new();
        wamp.prepare_input(&a, &mut input);
        assert_eq!(input[WORKDIR], json!("/tmp/task-1"));

        a.insert(STORE_OUTPUT.into(), json!(false));
        let mut input = Attrs::new();
        wamp.prepare_input(&a, &mut input);
        assert!(input.is_empty());
    }

    #[test]
    fn test_orm_maps_builtin_types() {
        let orm = workflow_orm();
        assert!(is_supported_type(&orm, "BlockingPythonTask"));
        assert!(!is_supported_type(&orm, "Choice"));

        let attrs = task_defaults("t", "BlockingPythonTask", 0);
        let behavior = behavior_of(&orm, &attrs).unwrap();
        assert!(behavior.is_blocking());
        assert_eq!(behavior.dispatch(&attrs).unwrap(), Dispatch::Local(None));
    }

    #[test]
    fn test_validate_hierarchy_fails_on_ancestor() {
        let orm = workflow_orm();
        let mut g = Graph::new();
        let a = g.add_node(task_defaults("a", "WampTask", 0));
        let b = g.add_node(task_defaults("b", "PythonTask", 0));
        g.add_edge(a, b, Attrs::new()).unwrap();

        // a has no uri
        assert!(!validate_hierarchy(&g, &orm, b).unwrap());
        g.set_node_attr(a, URI, json!("svc.call")).unwrap();
        assert!(validate_hierarchy(&g, &orm, b).unwrap());
    }
}
