use thiserror::Error;

use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph store errors
    #[error("Node {0} already exists")]
    DuplicateNode(NodeId),

    #[error("Node {0} not found")]
    UnknownNode(NodeId),

    #[error("Edge ({0}, {1}) not found")]
    UnknownEdge(NodeId, NodeId),

    #[error("Element selection mixes nodes and edges")]
    MixedElements,

    #[error("Graph contains a cycle through nodes {0:?}")]
    Cycle(Vec<NodeId>),

    // Task model errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Workflow validation failed for nodes {nodes:?}: {reason}")]
    WorkflowValidation { nodes: Vec<NodeId>, reason: String },

    // Execution errors
    #[error("Task execution failed: {task}: {message}")]
    TaskExecution { task: String, message: String },

    #[error("Task timeout after {timeout_secs}s: {task}")]
    TaskTimeout { task: String, timeout_secs: u64 },

    #[error("Task runner not found: {0}")]
    RunnerNotFound(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
