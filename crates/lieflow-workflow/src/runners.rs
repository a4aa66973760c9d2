use std::process::Stdio;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use lieflow_core::error::{FlowError, Result};
use lieflow_core::traits::TaskRunner;
use lieflow_core::types::{Attrs, TaskRequest, TaskResult};

/// Runs `configuration.command` (an argv array) as a subprocess.
///
/// The full [`TaskRequest`] is written to stdin as JSON. A zero exit status
/// completes the task with the JSON object printed on stdout as output
/// (empty stdout means empty output); any other exit fails it.
pub struct CommandRunner {
    name: String,
    shell: bool,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self {
            name: "command".to_string(),
            shell: false,
        }
    }

    /// Accept `configuration.command` as a single string run through `sh -c`.
    pub fn with_shell(mut self) -> Self {
        self.shell = true;
        self
    }

    fn argv(&self, request: &TaskRequest) -> Result<Vec<String>> {
        let command = request.configuration.get("command").ok_or_else(|| {
            FlowError::TaskExecution {
                task: request.task_name.clone(),
                message: "configuration.command is not set".into(),
            }
        })?;
        match command {
            Value::String(line) if self.shell => {
                Ok(vec!["sh".into(), "-c".into(), line.clone()])
            }
            Value::Array(parts) if !parts.is_empty() => parts
                .iter()
                .map(|p| {
                    p.as_str().map(str::to_string).ok_or_else(|| FlowError::TaskExecution {
                        task: request.task_name.clone(),
                        message: format!("command argument {} is not a string", p),
                    })
                })
                .collect(),
            other => Err(FlowError::TaskExecution {
                task: request.task_name.clone(),
                message: format!("unsupported command {}", other),
            }),
        }
    }

    async fn execute(&self, request: TaskRequest) -> Result<TaskResult> {
        let argv = self.argv(&request)?;
        let payload = serde_json::to_vec(&request)?;

        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]);
        if let Some(dir) = &request.workdir {
            command.current_dir(dir);
        }
        command
            .env("LIEFLOW_TASK_ID", request.task_id.to_string())
            .env("LIEFLOW_TASK_NAME", &request.task_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(task = %request.task_name, program = %argv[0], "Spawning task command");
        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // Commands that ignore stdin may exit before reading it
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(task = %request.task_name, error = %e, "Task command closed stdin");
            }
        }
        let out = child.wait_with_output().await?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            warn!(task = %request.task_name, code = out.status.code(), "Task command exited non-zero");
            return Ok(TaskResult::failed(format!(
                "exit code {:?}: {}",
                out.status.code(),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        if stdout.trim().is_empty() {
            return Ok(TaskResult::completed(Attrs::new()));
        }
        match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(Value::Object(output)) => Ok(TaskResult::completed(output)),
            Ok(other) => Ok(TaskResult::failed(format!(
                "command printed {} instead of a JSON object",
                other
            ))),
            Err(e) => Ok(TaskResult::failed(format!("unparseable command output: {}", e))),
        }
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner for CommandRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, request: TaskRequest) -> BoxFuture<'_, Result<TaskResult>> {
        Box::pin(self.execute(request))
    }
}
