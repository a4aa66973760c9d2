pub mod engine;
pub mod registry;
pub mod runners;
pub mod schema;
pub mod spec;
pub mod task;

pub use engine::{EngineSettings, Summary, SummaryRow, Workflow};
pub use registry::{FnRunner, RunnerRegistry};
pub use runners::CommandRunner;
pub use spec::{mapping_attrs, TaskHandle, WorkflowSpec, START_TYPE};
pub use task::{
    workflow_orm, BlockingPythonTask, Dispatch, PythonTask, StartTask, TaskBehavior, TaskMut,
    TaskOrm, TaskView, WampTask,
};
