use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use lieflow_core::error::{FlowError, Result};
use lieflow_core::traits::TaskRunner;
use lieflow_core::types::{TaskRequest, TaskResult};

use crate::task::Dispatch;

/// Registry of task runners available to a workflow.
///
/// Local tasks look their runner up by `custom_func` and fall back to the
/// fallback runner; remote tasks go to the remote runner.
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn TaskRunner>>,
    fallback: Option<Arc<dyn TaskRunner>>,
    remote: Option<Arc<dyn TaskRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            runners: HashMap::new(),
            fallback: None,
            remote: None,
        }
    }

    /// Register a runner under its own name.
    pub fn register(&mut self, runner: impl TaskRunner) {
        let name = runner.name().to_string();
        self.runners.insert(name, Arc::new(runner));
    }

    /// Register a closure as a named runner.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskResult>> + Send + 'static,
    {
        self.register(FnRunner {
            name: name.into(),
            func,
        });
    }

    /// Unregister a runner by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.runners.remove(name).is_some()
    }

    /// Runner used by local tasks without a registered `custom_func`.
    pub fn set_fallback(&mut self, runner: impl TaskRunner) {
        self.fallback = Some(Arc::new(runner));
    }

    /// Runner that performs remote procedure calls.
    pub fn set_remote(&mut self, runner: impl TaskRunner) {
        self.remote = Some(Arc::new(runner));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskRunner>> {
        self.runners.get(name).cloned()
    }

    /// Registered runner names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.runners.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Pick the runner for a dispatch decision.
    pub fn resolve(&self, dispatch: &Dispatch) -> Result<Arc<dyn TaskRunner>> {
        match dispatch {
            Dispatch::Local(Some(name)) => self
                .get(name)
                .or_else(|| self.fallback.clone())
                .ok_or_else(|| FlowError::RunnerNotFound(name.clone())),
            Dispatch::Local(None) => self
                .fallback
                .clone()
                .ok_or_else(|| FlowError::RunnerNotFound("<fallback>".into())),
            Dispatch::Remote(uri) => self
                .remote
                .clone()
                .ok_or_else(|| FlowError::RunnerNotFound(format!("<remote> {}", uri))),
            Dispatch::Passthrough => Err(FlowError::RunnerNotFound("<passthrough>".into())),
        }
    }

    /// Execute one attempt, bounded by the runner timeout or `default_timeout_secs`
    /// (0 = unbounded).
    pub async fn execute(
        runner: Arc<dyn TaskRunner>,
        request: TaskRequest,
        default_timeout_secs: u64,
    ) -> Result<TaskResult> {
        let timeout_secs = match runner.timeout_secs() {
            0 => default_timeout_secs,
            secs => secs,
        };
        if timeout_secs == 0 {
            return runner.run(request).await;
        }

        let task = request.task_name.clone();
        let timeout = std::time::Duration::from_secs(timeout_secs);
        match tokio::time::timeout(timeout, runner.run(request)).await {
            Ok(result) => result,
            Err(_) => Err(FlowError::TaskTimeout { task, timeout_secs }),
        }
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Closure adapter for [`TaskRunner`].
pub struct FnRunner<F> {
    name: String,
    func: F,
}

impl<F, Fut> TaskRunner for FnRunner<F>
where
    F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskResult>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, request: TaskRequest) -> BoxFuture<'_, Result<TaskResult>> {
        Box::pin((self.func)(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lieflow_core::types::Attrs;
    use uuid::Uuid;

    fn request(name: &str) -> TaskRequest {
        TaskRequest {
            nid: 1,
            task_id: Uuid::new_v4(),
            task_name: name.into(),
            task_type: "PythonTask".into(),
            metadata: Attrs::new(),
            input: Attrs::new(),
            configuration: Attrs::new(),
            workdir: None,
        }
    }

    struct Slow;

    impl TaskRunner for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn run(&self, _request: TaskRequest) -> BoxFuture<'_, Result<TaskResult>> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(TaskResult::completed(Attrs::new()))
            })
        }

        fn timeout_secs(&self) -> u64 {
            1
        }
    }

    #[test]
    fn test_resolution_rules() {
        let mut registry = RunnerRegistry::new();
        registry.register_fn("echo", |req: TaskRequest| async move {
            Ok(TaskResult::completed(req.input))
        });

        assert!(registry.resolve(&Dispatch::Local(Some("echo".into()))).is_ok());
        assert!(matches!(
            registry.resolve(&Dispatch::Local(Some("missing".into()))),
            Err(FlowError::RunnerNotFound(_))
        ));
        assert!(registry.resolve(&Dispatch::Remote("a.b".into())).is_err());

        registry.set_fallback(Slow);
        let runner = registry
            .resolve(&Dispatch::Local(Some("missing".into())))
            .ok()
            .unwrap();
        assert_eq!(runner.name(), "slow");
        assert_eq!(registry.list(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_execute_closure() {
        let mut registry = RunnerRegistry::new();
        registry.register_fn("echo", |req: TaskRequest| async move {
            Ok(TaskResult::completed(req.input))
        });
        let runner = registry.get("echo").unwrap();
        let result = RunnerRegistry::execute(runner, request("t"), 0).await.unwrap();
        assert!(result.is_completed());
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let err = RunnerRegistry::execute(Arc::new(Slow), request("slow-task"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::TaskTimeout { timeout_secs: 1, .. }));
    }
}
