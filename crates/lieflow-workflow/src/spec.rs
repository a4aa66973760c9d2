use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use lieflow_core::config::AppConfig;
use lieflow_core::error::{FlowError, Result};
use lieflow_core::types::{timestamp_now, Attrs, NodeId};
use lieflow_graph::{algorithms, attrs, io, Graph};

use crate::schema::{self, *};
use crate::task::{behavior_of, is_supported_type, workflow_orm, TaskOrm, TaskView};

pub const START_TYPE: &str = "Start";

/// Handle returned when a task is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    pub nid: NodeId,
    pub task_id: Uuid,
}

/// Builder for workflow graphs.
pub struct WorkflowSpec {
    graph: Graph,
    orm: Arc<TaskOrm>,
    default_retry_count: u64,
}

impl WorkflowSpec {
    /// Empty workflow with a Start root and the builtin task types.
    pub fn new() -> Self {
        Self::with_orm(workflow_orm())
    }

    /// Empty workflow using a custom set of task types.
    pub fn with_orm(orm: TaskOrm) -> Self {
        let mut spec = Self {
            graph: Graph::new(),
            orm: Arc::new(orm),
            default_retry_count: 0,
        };
        let start = spec
            .graph
            .add_node(schema::task_defaults("start", START_TYPE, 0));
        // Freshly added node, cannot be missing
        let _ = spec.graph.set_root(start);

        let meta = spec.graph.attrs_mut();
        meta.insert(TITLE.into(), json!(""));
        meta.insert(DESCRIPTION.into(), json!(""));
        meta.insert(CREATED_AT.into(), json!(timestamp_now()));
        info!("Init default empty workflow");
        spec
    }

    /// Wrap an existing graph. The root must exist and be a Start node.
    pub fn from_graph(graph: Graph, orm: Arc<TaskOrm>) -> Result<Self> {
        let root = graph
            .root()
            .ok_or_else(|| FlowError::Workflow("Workflow does not have a root node defined".into()))?;
        if graph.node(root)?.get(TASK_TYPE).and_then(Value::as_str) != Some(START_TYPE) {
            return Err(FlowError::Workflow("Workflow root node is not of type: Start".into()));
        }
        let spec = Self {
            graph,
            orm,
            default_retry_count: 0,
        };
        info!(title = %spec.title(), tasks = spec.len(), "Loaded workflow");
        Ok(spec)
    }

    /// Parse a workflow document.
    pub fn load(json: &str) -> Result<Self> {
        Self::load_with_orm(json, workflow_orm())
    }

    /// Parse a workflow document whose tasks map onto a custom set of task
    /// types.
    pub fn load_with_orm(json: &str, orm: TaskOrm) -> Result<Self> {
        Self::from_graph(io::from_json(json)?, Arc::new(orm))
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        Self::load_file_with_orm(path, workflow_orm())
    }

    pub fn load_file_with_orm(path: &Path, orm: TaskOrm) -> Result<Self> {
        Self::from_graph(io::read_file(path)?, Arc::new(orm))
    }

    /// Retry count given to tasks that do not set one.
    pub fn with_default_retry_count(mut self, retry_count: u64) -> Self {
        self.default_retry_count = retry_count;
        self
    }

    /// Apply the `[engine]` defaults that shape new tasks.
    pub fn with_config(self, config: &AppConfig) -> Self {
        self.with_default_retry_count(config.engine.default_retry_count)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn orm(&self) -> &Arc<TaskOrm> {
        &self.orm
    }

    pub fn into_parts(self) -> (Graph, Arc<TaskOrm>) {
        (self.graph, self.orm)
    }

    pub fn root(&self) -> Option<NodeId> {
        self.graph.root()
    }

    pub fn title(&self) -> &str {
        self.graph.attrs().get(TITLE).and_then(Value::as_str).unwrap_or("")
    }

    pub fn set_title(&mut self, title: &str) {
        self.graph.attrs_mut().insert(TITLE.into(), json!(title));
    }

    pub fn set_description(&mut self, description: &str) {
        self.graph
            .attrs_mut()
            .insert(DESCRIPTION.into(), json!(description));
    }

    pub fn set_project_dir(&mut self, dir: &Path) {
        self.graph
            .attrs_mut()
            .insert(PROJECT_DIR.into(), json!(dir.display().to_string()));
    }

    /// Add a task of a registered type. `metadata` overrides the defaults
    /// and is checked against the task schema.
    pub fn add_task(&mut self, name: &str, task_type: &str, metadata: Attrs) -> Result<TaskHandle> {
        if !is_supported_type(&self.orm, task_type) {
            return Err(FlowError::Validation(format!(
                "Workflow task type '{}' not supported",
                task_type
            )));
        }

        let mut node = schema::task_defaults(name, task_type, self.default_retry_count);
        for (key, value) in metadata {
            schema::validate_value(&key, &value)?;
            node.insert(key, value);
        }
        let task_id = node
            .get(TASK_ID)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| FlowError::Validation("task_id: invalid".into()))?;

        let nid = self.graph.add_node(node);
        info!(nid, task = %name, task_type = %task_type, "Added task");
        Ok(TaskHandle { nid, task_id })
    }

    /// Connect two tasks, passing the listed output keys under the same name.
    pub fn connect_task(&mut self, from: NodeId, to: NodeId, keys: &[&str]) -> Result<()> {
        let mapping: Vec<(&str, &str)> = keys.iter().map(|k| (*k, *k)).collect();
        self.connect_task_with_mapping(from, to, &mapping)
    }

    /// Connect two tasks, renaming producer output keys to consumer input keys.
    pub fn connect_task_with_mapping(
        &mut self,
        from: NodeId,
        to: NodeId,
        mapping: &[(&str, &str)],
    ) -> Result<()> {
        let edge = if mapping.is_empty() {
            Attrs::new()
        } else {
            mapping_attrs(mapping)
        };
        self.graph.add_edge(from, to, edge)?;
        Ok(())
    }

    pub fn get_task(&self, nid: NodeId) -> Option<TaskView<'_>> {
        match TaskView::new(&self.graph, nid) {
            Ok(view) => Some(view),
            Err(_) => {
                warn!(nid, "No workflow task with nid");
                None
            }
        }
    }

    /// Task node ids (Start excluded), ascending.
    pub fn tasks(&self) -> Vec<NodeId> {
        task_ids(&self.graph, &self.orm)
    }

    /// Number of tasks (Start excluded).
    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validate(&self) -> Result<()> {
        validate_graph(&self.graph, &self.orm)
    }

    pub fn to_json(&self) -> Result<String> {
        io::to_json(&self.graph)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                return Err(FlowError::Workflow(format!(
                    "Directory does not exist: {}",
                    parent.display()
                )));
            }
        }
        io::write_file(&self.graph, path)?;
        info!(title = %self.title(), path = %path.display(), "Saved workflow");
        Ok(())
    }
}

impl Default for WorkflowSpec {
    fn default() -> Self {
        Self::new()
    }
}

/// Node ids whose behaviour marks them as tasks.
pub fn task_ids(graph: &Graph, orm: &TaskOrm) -> Vec<NodeId> {
    graph
        .nodes()
        .filter(|(_, attrs)| behavior_of(orm, attrs).map(|b| b.is_task()).unwrap_or(false))
        .map(|(nid, _)| nid)
        .collect()
}

/// Tasks without a parent among the other tasks.
pub fn entry_tasks(graph: &Graph, orm: &TaskOrm) -> Vec<NodeId> {
    let tasks = task_ids(graph, orm);
    tasks
        .iter()
        .copied()
        .filter(|nid| {
            graph
                .parents(*nid)
                .map(|parents| parents.iter().all(|p| !tasks.contains(p)))
                .unwrap_or(true)
        })
        .collect()
}

/// Structural and schema checks run before a workflow may execute.
pub fn validate_graph(graph: &Graph, orm: &TaskOrm) -> Result<()> {
    let root = graph
        .root()
        .ok_or_else(|| FlowError::Workflow("Workflow does not have a root node defined".into()))?;
    if graph.node(root)?.get(TASK_TYPE).and_then(Value::as_str) != Some(START_TYPE) {
        return Err(FlowError::WorkflowValidation {
            nodes: vec![root],
            reason: "root node is not of type Start".into(),
        });
    }

    if let Err(FlowError::Cycle(nodes)) = algorithms::topological_order(graph) {
        return Err(FlowError::WorkflowValidation {
            nodes,
            reason: "workflow contains a cycle".into(),
        });
    }

    let mut offending = Vec::new();
    let mut problems = Vec::new();
    for (nid, attrs) in graph.nodes() {
        let mut node_problems = schema::check(attrs);
        match behavior_of(orm, attrs) {
            Some(behavior) => node_problems.extend(behavior.schema_problems(attrs)),
            None => node_problems.push(format!(
                "task_type {} not supported",
                attrs.get(TASK_TYPE).cloned().unwrap_or(Value::Null)
            )),
        }
        if !node_problems.is_empty() {
            offending.push(nid);
            problems.push(format!("{}: {}", nid, node_problems.join(", ")));
        }
    }
    if !offending.is_empty() {
        return Err(FlowError::WorkflowValidation {
            nodes: offending,
            reason: problems.join("; "),
        });
    }

    let entries = entry_tasks(graph, orm);
    if entries.len() != 1 {
        return Err(FlowError::WorkflowValidation {
            nodes: entries.clone(),
            reason: format!("expected exactly one entry task, found {}", entries.len()),
        });
    }
    Ok(())
}

/// Edge attributes carrying a data mapping.
pub fn mapping_attrs(pairs: &[(&str, &str)]) -> Attrs {
    attrs([(
        DATA_MAPPING,
        Value::Object(pairs.iter().map(|(o, i)| (o.to_string(), json!(i))).collect()),
    )])
}
