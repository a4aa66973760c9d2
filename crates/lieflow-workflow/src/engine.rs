use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lieflow_core::config::AppConfig;
use lieflow_core::error::{FlowError, Result};
use lieflow_core::event::EventBus;
use lieflow_core::traits::TaskRunner;
use lieflow_core::types::{
    timestamp_now, Attrs, NodeId, TaskRequest, TaskResult, TaskStatus, WorkflowEvent,
};
use lieflow_graph::{algorithms, io, Graph};

use crate::registry::RunnerRegistry;
use crate::schema::{DATA_MAPPING, OUTPUT_DATA, PROJECT_DIR, TITLE, URI};
use crate::spec::{task_ids, validate_graph, WorkflowSpec};
use crate::task::{behavior_of, validate_hierarchy, Dispatch, TaskBehavior, TaskMut, TaskOrm, TaskView};

/// Engine tuning, usually taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum concurrently running tasks (0 = unlimited).
    pub max_parallel_tasks: usize,
    /// Per-attempt timeout for runners without their own (0 = none).
    pub task_timeout_secs: u64,
    /// Overrides the workflow's `project_dir` graph attribute.
    pub project_dir: Option<PathBuf>,
    /// Autosave target written after every task state change.
    pub checkpoint_path: Option<PathBuf>,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_parallel_tasks: config.engine.max_parallel_tasks,
            task_timeout_secs: config.engine.task_timeout_secs,
            project_dir: config.project_dir(),
            checkpoint_path: config.checkpoint_path(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// State shared between the caller-facing handle and the driver task.
struct Shared {
    graph: Mutex<Graph>,
    orm: Arc<TaskOrm>,
    runners: RunnerRegistry,
    blocking: Arc<tokio::sync::Mutex<()>>,
    events: EventBus,
    driving: AtomicBool,
}

/// A task ready to hand to its runner.
struct Job {
    nid: NodeId,
    task: String,
    blocking: bool,
    runner: Arc<dyn TaskRunner>,
    request: TaskRequest,
}

/// Outcome of one runner invocation.
struct Attempt {
    nid: NodeId,
    task: String,
    elapsed_ms: u64,
    outcome: Result<TaskResult>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a workflow graph.
///
/// All run state lives in the graph itself, so a workflow saved at any
/// point can be loaded and run again to continue where it stopped.
pub struct Workflow {
    shared: Arc<Shared>,
    settings: EngineSettings,
    driver: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl Workflow {
    pub fn new(spec: WorkflowSpec, runners: RunnerRegistry) -> Self {
        let (mut graph, orm) = spec.into_parts();
        reset_interrupted(&mut graph, &orm);
        Self {
            shared: Arc::new(Shared {
                graph: Mutex::new(graph),
                orm,
                runners,
                blocking: Arc::new(tokio::sync::Mutex::new(())),
                events: EventBus::default(),
                driving: AtomicBool::new(false),
            }),
            settings: EngineSettings::default(),
            driver: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Load a persisted workflow document.
    pub fn load(json: &str, runners: RunnerRegistry) -> Result<Self> {
        Ok(Self::new(WorkflowSpec::load(json)?, runners))
    }

    pub fn load_file(path: &Path, runners: RunnerRegistry) -> Result<Self> {
        Ok(Self::new(WorkflowSpec::load_file(path)?, runners))
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_config(self, config: &AppConfig) -> Self {
        self.with_settings(EngineSettings::from_config(config))
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.shared.events.subscribe()
    }

    // ── Running ─────────────────────────────────────────────────

    /// Start processing the workflow in the background and return.
    ///
    /// Must be called from within a Tokio runtime. Fails if the workflow is
    /// already being driven or does not pass validation.
    pub fn run(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| FlowError::Workflow("run() requires a Tokio runtime".into()))?;
        if self.shared.driving.swap(true, Ordering::SeqCst) {
            return Err(FlowError::Workflow("Workflow is already running".into()));
        }

        let prepared = {
            let mut graph = lock(&self.shared.graph);
            validate_graph(&graph, &self.shared.orm).and_then(|_| self.shared.prepare_run(&mut graph))
        };
        if let Err(e) = prepared {
            self.shared.driving.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let token = CancellationToken::new();
        *lock(&self.cancel) = token.clone();
        let handle = runtime.spawn(drive(self.shared.clone(), self.settings.clone(), token));
        *lock(&self.driver) = Some(handle);
        Ok(())
    }

    /// Wait until the background driver stops.
    pub async fn wait(&self) {
        let handle = lock(&self.driver).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Workflow driver task failed");
            }
        }
    }

    /// `run()` followed by `wait()`.
    pub async fn run_to_end(&self) -> Result<()> {
        self.run()?;
        self.wait().await;
        Ok(())
    }

    /// Abort the workflow: running and ready tasks become `aborted`.
    /// Returns false when nothing was running.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            info!("Workflow is not running");
            return false;
        }
        lock(&self.cancel).cancel();

        let mut graph = lock(&self.shared.graph);
        let targets: Vec<NodeId> = task_ids(&graph, &self.shared.orm)
            .into_iter()
            .filter(|nid| {
                matches!(
                    status_of(&graph, *nid),
                    TaskStatus::Running | TaskStatus::Ready
                )
            })
            .collect();
        info!(tasks = targets.len(), "Cancelling active tasks in the workflow");
        for nid in targets {
            write(&mut graph, nid, |t| t.set_status(TaskStatus::Aborted));
        }
        drop(graph);

        self.shared.events.publish(WorkflowEvent::Cancelled);
        true
    }

    /// Reset a failed or aborted task to `ready`.
    pub fn retry(&self, nid: NodeId) -> Result<()> {
        let mut graph = lock(&self.shared.graph);
        let status = TaskView::new(&graph, nid)?.status()?;
        if !status.is_terminal_failure() {
            return Err(FlowError::Workflow(format!(
                "Task {} is {}, only failed or aborted tasks can be retried",
                nid, status
            )));
        }
        TaskMut::new(&mut graph, nid)?.set_status(TaskStatus::Ready)?;
        info!(nid, "Task reset for retry");
        Ok(())
    }

    /// Clear the breakpoint on a task so the next `run()` passes it.
    pub fn step_breakpoint(&self, nid: NodeId) -> Result<()> {
        let mut graph = lock(&self.shared.graph);
        let view = TaskView::new(&graph, nid)?;
        if !view.breakpoint() {
            return Err(FlowError::Workflow(format!(
                "No active breakpoint set on task with nid {}",
                nid
            )));
        }
        let name = view.name().to_string();
        TaskMut::new(&mut graph, nid)?.set_breakpoint(false)?;
        info!(nid, task = %name, "Removed breakpoint");
        Ok(())
    }

    /// Set the workflow input held by the Start node.
    pub fn input(&self, values: Attrs) -> Result<()> {
        let mut graph = lock(&self.shared.graph);
        let root = graph
            .root()
            .ok_or_else(|| FlowError::Workflow("Workflow has no Start node".into()))?;
        let mut start = TaskMut::new(&mut graph, root)?;
        start.replace_input(values)?;
        // Picked up again by the next run
        start.force_status(TaskStatus::Ready)
    }

    // ── Inspection ──────────────────────────────────────────────

    /// Task node ids, ascending.
    pub fn tasks(&self) -> Vec<NodeId> {
        task_ids(&lock(&self.shared.graph), &self.shared.orm)
    }

    /// Read a task through a typed view.
    pub fn with_task<R>(&self, nid: NodeId, f: impl FnOnce(TaskView<'_>) -> R) -> Result<R> {
        let graph = lock(&self.shared.graph);
        Ok(f(TaskView::new(&graph, nid)?))
    }

    /// Modify a task through validated setters.
    pub fn update_task<R>(
        &self,
        nid: NodeId,
        f: impl FnOnce(&mut TaskMut<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut graph = lock(&self.shared.graph);
        let mut task = TaskMut::new(&mut graph, nid)?;
        f(&mut task)
    }

    pub fn status(&self, nid: NodeId) -> Result<TaskStatus> {
        self.with_task(nid, |t| t.status())?
    }

    /// Copy of the current graph.
    pub fn snapshot(&self) -> Graph {
        lock(&self.shared.graph).clone()
    }

    /// True while the driver is active or any task is running.
    pub fn is_running(&self) -> bool {
        self.shared.driving.load(Ordering::SeqCst)
            || self.tasks_with(|s| s == TaskStatus::Running).next().is_some()
    }

    /// Every task has completed.
    pub fn is_completed(&self) -> bool {
        is_completed(&lock(&self.shared.graph), &self.shared.orm)
    }

    /// Nothing is running or queued and some task failed or was aborted.
    pub fn has_failed(&self) -> bool {
        !self.shared.driving.load(Ordering::SeqCst)
            && has_failed(&lock(&self.shared.graph), &self.shared.orm)
    }

    pub fn failed_task(&self) -> Option<NodeId> {
        self.tasks_with(|s| s == TaskStatus::Failed).next()
    }

    pub fn active_tasks(&self) -> Vec<NodeId> {
        self.tasks_with(|s| s == TaskStatus::Running).collect()
    }

    /// First ready task held back by its breakpoint.
    pub fn active_breakpoint(&self) -> Option<NodeId> {
        let graph = lock(&self.shared.graph);
        task_ids(&graph, &self.shared.orm).into_iter().find(|nid| {
            let Ok(view) = TaskView::new(&graph, *nid) else {
                return false;
            };
            view.breakpoint()
                && view.status_or_ready() == TaskStatus::Ready
                && parents_completed(&graph, *nid)
        })
    }

    fn tasks_with(&self, pred: impl Fn(TaskStatus) -> bool) -> impl Iterator<Item = NodeId> {
        let graph = lock(&self.shared.graph);
        let matching: Vec<NodeId> = task_ids(&graph, &self.shared.orm)
            .into_iter()
            .filter(|nid| pred(status_of(&graph, *nid)))
            .collect();
        matching.into_iter()
    }

    /// When the Start node was processed.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        let graph = lock(&self.shared.graph);
        TaskView::new(&graph, graph.root()?).ok()?.started_at()
    }

    /// Most recent task timestamp.
    pub fn update_time(&self) -> Option<DateTime<Utc>> {
        let graph = lock(&self.shared.graph);
        graph
            .node_ids()
            .filter_map(|nid| TaskView::new(&graph, nid).ok())
            .flat_map(|view| [view.started_at(), view.ended_at()])
            .flatten()
            .max()
    }

    /// Last task end time, once the workflow is completed.
    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        let graph = lock(&self.shared.graph);
        if !is_completed(&graph, &self.shared.orm) {
            return None;
        }
        task_ids(&graph, &self.shared.orm)
            .into_iter()
            .filter_map(|nid| TaskView::new(&graph, nid).ok()?.ended_at())
            .max()
    }

    /// Time from start until finish, or until now while unfinished.
    pub fn runtime(&self) -> Option<chrono::Duration> {
        let start = self.start_time()?;
        let end = self.finish_time().unwrap_or_else(Utc::now);
        Some(end - start)
    }

    /// Output of completed leaf tasks, or of the given task.
    pub fn output(&self, nid: Option<NodeId>) -> Result<BTreeMap<NodeId, Attrs>> {
        let graph = lock(&self.shared.graph);
        let selected = match nid {
            Some(nid) => {
                graph.node(nid)?;
                vec![nid]
            }
            None => {
                let tasks = task_ids(&graph, &self.shared.orm);
                graph.leaves().into_iter().filter(|n| tasks.contains(n)).collect()
            }
        };

        let mut out = BTreeMap::new();
        for nid in selected {
            let view = TaskView::new(&graph, nid)?;
            if view.status_or_ready() == TaskStatus::Completed {
                out.insert(nid, view.get_output()?);
            }
        }
        Ok(out)
    }

    /// Per-task overview.
    pub fn summary(&self) -> Summary {
        let graph = lock(&self.shared.graph);
        let rows = task_ids(&graph, &self.shared.orm)
            .into_iter()
            .filter_map(|nid| TaskView::new(&graph, nid).ok())
            .map(|view| SummaryRow {
                nid: view.nid(),
                task: view.name().to_string(),
                task_type: view.task_type().to_string(),
                status: view
                    .status()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "invalid".into()),
                children: view.children().to_vec(),
                runtime_secs: view.runtime().map(|d| d.num_milliseconds() as f64 / 1000.0),
                output: view.get_output().unwrap_or_default(),
            })
            .collect();
        Summary {
            title: graph
                .attrs()
                .get(TITLE)
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            rows,
        }
    }

    // ── Persistence ─────────────────────────────────────────────

    /// Serialize the full workflow state. Output of tasks with
    /// `store_output = false` is left out.
    pub fn save(&self) -> Result<String> {
        self.shared.to_json()
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.save()?)?;
        info!(path = %path.display(), "Saved workflow state");
        Ok(())
    }
}

impl Drop for Workflow {
    fn drop(&mut self) {
        lock(&self.cancel).cancel();
    }
}

// ── Driver ──────────────────────────────────────────────────────

async fn drive(shared: Arc<Shared>, settings: EngineSettings, token: CancellationToken) {
    let permits = match settings.max_parallel_tasks {
        0 => Semaphore::MAX_PERMITS,
        n => n,
    };
    let semaphore = Arc::new(Semaphore::new(permits));
    let mut in_flight: JoinSet<Attempt> = JoinSet::new();
    let mut dispatched: HashSet<NodeId> = HashSet::new();
    let mut breakpoints = HashSet::new();
    // Attempts report here once they hold their permit and serial lock
    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<NodeId>();

    loop {
        if token.is_cancelled() {
            break;
        }

        let (jobs, changed) = shared.collect_ready(&settings, &mut breakpoints, &dispatched);
        for job in jobs {
            dispatched.insert(job.nid);
            let permit = semaphore.clone();
            let blocking = job.blocking.then(|| shared.blocking.clone());
            let timeout_secs = settings.task_timeout_secs;
            let started_tx = started_tx.clone();
            in_flight.spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                let _serial = match blocking {
                    Some(serial) => Some(serial.lock_owned().await),
                    None => None,
                };
                let _ = started_tx.send(job.nid);
                let started = Instant::now();
                let task = job.task;
                let outcome = AssertUnwindSafe(RunnerRegistry::execute(
                    job.runner,
                    job.request,
                    timeout_secs,
                ))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(FlowError::TaskExecution {
                        task: task.clone(),
                        message: "task runner panicked".into(),
                    })
                });
                Attempt {
                    nid: job.nid,
                    task,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    outcome,
                }
            });
        }
        if changed {
            shared.autosave(&settings);
        }

        if in_flight.is_empty() {
            if changed {
                continue;
            }
            break;
        }

        // Start notices are sent before the attempt can finish, so the biased
        // order always marks a task running before its result is recorded
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            Some(nid) = started_rx.recv() => {
                shared.mark_started(nid);
                shared.autosave(&settings);
            }
            joined = in_flight.join_next() => match joined {
                Some(Ok(attempt)) => {
                    dispatched.remove(&attempt.nid);
                    shared.record(attempt);
                    shared.autosave(&settings);
                }
                Some(Err(e)) => error!(error = %e, "Task attempt did not finish"),
                None => {}
            },
        }
    }

    in_flight.abort_all();
    shared.driving.store(false, Ordering::SeqCst);

    let (completed, failed) = {
        let graph = lock(&shared.graph);
        (is_completed(&graph, &shared.orm), has_failed(&graph, &shared.orm))
    };
    shared.autosave(&settings);
    shared
        .events
        .publish(WorkflowEvent::RunFinished { completed, failed });
    info!(completed, failed, cancelled = token.is_cancelled(), "Workflow run stopped");
}

impl Shared {
    /// Re-arm aborted tasks and complete the Start node.
    fn prepare_run(&self, graph: &mut Graph) -> Result<()> {
        for nid in task_ids(graph, &self.orm) {
            if status_of(graph, nid) == TaskStatus::Aborted {
                TaskMut::new(graph, nid)?.set_status(TaskStatus::Ready)?;
            }
        }

        let root = graph
            .root()
            .ok_or_else(|| FlowError::Workflow("Workflow does not have a root node defined".into()))?;
        if status_of(graph, root) != TaskStatus::Completed {
            let input = TaskView::new(graph, root)?.input();
            let now = timestamp_now();
            let mut start = TaskMut::new(graph, root)?;
            start.set_started_at(Some(&now))?;
            start.set_output(input)?;
            start.force_status(TaskStatus::Completed)?;
            start.set_ended_at(Some(&now))?;
        }

        let title = graph.attrs().get(TITLE).and_then(Value::as_str).unwrap_or("");
        info!(workflow = %title, "Running workflow");
        self.events.publish(WorkflowEvent::RunStarted {
            workflow: title.to_string(),
        });
        Ok(())
    }

    /// Mark every dispatchable task running and build its job. Returns the
    /// jobs and whether any task changed state without being dispatched.
    fn collect_ready(
        &self,
        settings: &EngineSettings,
        breakpoints: &mut HashSet<NodeId>,
        dispatched: &HashSet<NodeId>,
    ) -> (Vec<Job>, bool) {
        let mut graph = lock(&self.graph);
        let order = match algorithms::topological_order(&graph) {
            Ok(order) => order,
            Err(e) => {
                error!(error = %e, "Workflow graph is no longer acyclic");
                return (Vec::new(), false);
            }
        };

        let mut jobs = Vec::new();
        let mut changed = false;
        for nid in order {
            let Some(behavior) = graph
                .node(nid)
                .ok()
                .and_then(|attrs| behavior_of(&self.orm, attrs))
            else {
                continue;
            };
            if !behavior.is_task()
                || dispatched.contains(&nid)
                || status_of(&graph, nid) != TaskStatus::Ready
                || !parents_completed(&graph, nid)
            {
                continue;
            }

            if TaskView::new(&graph, nid).map(|v| v.breakpoint()).unwrap_or(false) {
                if breakpoints.insert(nid) {
                    let task = graph.key_of(nid).unwrap_or("").to_string();
                    info!(nid, task = %task, "Task halted at breakpoint");
                    self.events
                        .publish(WorkflowEvent::BreakpointReached { nid, task });
                }
                continue;
            }

            match self.prepare_job(&mut graph, nid, behavior.as_ref(), settings) {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => changed = true,
                Err(e) => {
                    self.apply_failure(&mut graph, nid, &e.to_string());
                    changed = true;
                }
            }
        }
        (jobs, changed)
    }

    /// Resolve input and set up the working directory. The task stays
    /// `ready` until its attempt holds a permit, see [`Shared::mark_started`].
    /// Pass-through tasks complete on the spot and yield no job.
    fn prepare_job(
        &self,
        graph: &mut Graph,
        nid: NodeId,
        behavior: &dyn TaskBehavior,
        settings: &EngineSettings,
    ) -> Result<Option<Job>> {
        if !validate_hierarchy(graph, &self.orm, nid)? {
            return Err(FlowError::Validation(format!(
                "task {} or one of its ancestors failed validation",
                nid
            )));
        }
        let dispatch = behavior.dispatch(graph.node(nid)?)?;
        let runner = match &dispatch {
            Dispatch::Passthrough => None,
            other => Some(self.runners.resolve(other)?),
        };

        ensure_workdir(graph, nid, settings)?;
        let mut input = resolve_input(graph, nid)?;
        behavior.prepare_input(graph.node(nid)?, &mut input);

        let mut task = TaskMut::new(graph, nid)?;
        task.replace_input(input.clone())?;
        task.set_ended_at(None)?;

        let Some(runner) = runner else {
            let now = timestamp_now();
            task.set_started_at(Some(&now))?;
            task.set_output(input)?;
            task.set_status(TaskStatus::Completed)?;
            task.set_ended_at(Some(&now))?;
            debug!(nid, "Pass-through task completed");
            return Ok(None);
        };
        task.set_started_at(None)?;

        let view = TaskView::new(graph, nid)?;
        let mut metadata = view.attrs().clone();
        if let Dispatch::Remote(uri) = &dispatch {
            metadata.insert(URI.into(), json!(uri));
        }
        let request = TaskRequest {
            nid,
            task_id: view.task_id().unwrap_or_else(Uuid::new_v4),
            task_name: view.name().to_string(),
            task_type: view.task_type().to_string(),
            metadata,
            input,
            configuration: view.configuration(),
            workdir: view.workdir().map(str::to_string),
        };

        debug!(nid, task = %request.task_name, runner = runner.name(), "Task queued");
        Ok(Some(Job {
            nid,
            task: request.task_name.clone(),
            blocking: behavior.is_blocking(),
            runner,
            request,
        }))
    }

    /// An attempt acquired its permit: the task is now running.
    fn mark_started(&self, nid: NodeId) {
        let mut graph = lock(&self.graph);
        if status_of(&graph, nid) != TaskStatus::Ready {
            debug!(nid, "Task left ready while queued, not starting");
            return;
        }
        let now = timestamp_now();
        write(&mut graph, nid, |t| {
            t.set_started_at(Some(&now))?;
            t.set_status(TaskStatus::Running)
        });
        let task = graph.key_of(nid).unwrap_or("").to_string();
        info!(nid, task = %task, "Task started");
        self.events.publish(WorkflowEvent::TaskStarted { nid, task });
    }

    /// Write a finished attempt back onto its task node.
    fn record(&self, attempt: Attempt) {
        let mut graph = lock(&self.graph);
        if status_of(&graph, attempt.nid) != TaskStatus::Running {
            debug!(nid = attempt.nid, "Discarding result of task that is no longer running");
            return;
        }

        match attempt.outcome {
            Ok(result) if result.is_completed() => {
                let output = persist_output(&graph, attempt.nid, result.output);
                let now = timestamp_now();
                write(&mut graph, attempt.nid, |t| {
                    t.set_output(output)?;
                    t.set_status(TaskStatus::Completed)?;
                    t.set_ended_at(Some(&now))
                });
                info!(nid = attempt.nid, task = %attempt.task, elapsed_ms = attempt.elapsed_ms, "Task completed");
                self.events.publish(WorkflowEvent::TaskCompleted {
                    nid: attempt.nid,
                    task: attempt.task,
                    elapsed_ms: attempt.elapsed_ms,
                });
            }
            Ok(result) => {
                let message = result
                    .message
                    .unwrap_or_else(|| format!("runner reported status {}", result.status));
                self.apply_failure(&mut graph, attempt.nid, &message);
            }
            Err(e) => self.apply_failure(&mut graph, attempt.nid, &e.to_string()),
        }
    }

    /// Fail a task, or put it back to `ready` while retries remain.
    fn apply_failure(&self, graph: &mut Graph, nid: NodeId, message: &str) {
        let Ok(view) = TaskView::new(graph, nid) else {
            return;
        };
        let retries = view.retry_count();
        let task = view.name().to_string();
        let now = timestamp_now();

        if retries > 0 {
            write(graph, nid, |t| {
                t.set_ended_at(Some(&now))?;
                t.set_retry_count(retries - 1)?;
                t.set_status(TaskStatus::Failed)?;
                t.set_status(TaskStatus::Ready)
            });
            warn!(nid, task = %task, retries_left = retries - 1, error = %message, "Task failed, retrying");
            self.events.publish(WorkflowEvent::TaskRetrying {
                nid,
                task,
                retries_left: retries - 1,
            });
        } else {
            write(graph, nid, |t| {
                t.set_ended_at(Some(&now))?;
                t.set_status(TaskStatus::Failed)
            });
            error!(nid, task = %task, error = %message, "Task failed");
            self.events.publish(WorkflowEvent::TaskFailed {
                nid,
                task,
                message: message.to_string(),
            });
        }
    }

    fn to_json(&self) -> Result<String> {
        let mut snapshot = lock(&self.graph).clone();
        for nid in task_ids(&snapshot, &self.orm) {
            let store = TaskView::new(&snapshot, nid)?.store_output();
            if !store {
                snapshot.set_node_attr(nid, OUTPUT_DATA, json!({}))?;
            }
        }
        io::to_json(&snapshot)
    }

    fn autosave(&self, settings: &EngineSettings) {
        let Some(path) = &settings.checkpoint_path else {
            return;
        };
        match self.to_json() {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!(path = %path.display(), error = %e, "Failed to write checkpoint");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize checkpoint"),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────

/// Apply validated writes to a task, logging instead of failing.
fn write(graph: &mut Graph, nid: NodeId, f: impl FnOnce(&mut TaskMut<'_>) -> Result<()>) {
    let result = TaskMut::new(graph, nid).and_then(|mut task| f(&mut task));
    if let Err(e) = result {
        error!(nid, error = %e, "Failed to update task");
    }
}

fn status_of(graph: &Graph, nid: NodeId) -> TaskStatus {
    TaskView::new(graph, nid)
        .map(|v| v.status_or_ready())
        .unwrap_or(TaskStatus::Ready)
}

fn parents_completed(graph: &Graph, nid: NodeId) -> bool {
    graph
        .parents(nid)
        .map(|parents| parents.iter().all(|p| status_of(graph, *p) == TaskStatus::Completed))
        .unwrap_or(false)
}

fn is_completed(graph: &Graph, orm: &TaskOrm) -> bool {
    task_ids(graph, orm)
        .into_iter()
        .all(|nid| status_of(graph, nid) == TaskStatus::Completed)
}

fn has_failed(graph: &Graph, orm: &TaskOrm) -> bool {
    let statuses: Vec<TaskStatus> = task_ids(graph, orm)
        .into_iter()
        .map(|nid| status_of(graph, nid))
        .collect();
    !statuses.contains(&TaskStatus::Running) && statuses.iter().any(|s| s.is_terminal_failure())
}

/// Tasks left `running` by an interrupted process go back to `ready`.
fn reset_interrupted(graph: &mut Graph, orm: &TaskOrm) {
    for nid in task_ids(graph, orm) {
        if status_of(graph, nid) == TaskStatus::Running {
            warn!(nid, "Resetting interrupted task to ready");
            write(graph, nid, |t| t.force_status(TaskStatus::Ready));
        }
    }
}

/// Own input with references resolved, then every parent's output: all
/// keys under their own name, followed by the edge's mapped keys.
/// Tasks without parents receive the Start node's output.
fn resolve_input(graph: &Graph, nid: NodeId) -> Result<Attrs> {
    let view = TaskView::new(graph, nid)?;
    let mut input = Attrs::new();
    for (key, value) in view.input() {
        let resolved = resolve_references(graph, value);
        input.insert(key, resolved);
    }

    let mut sources: Vec<(NodeId, Option<&Attrs>)> = Vec::new();
    for parent in view.parents() {
        let mapping = graph
            .edge(*parent, nid)?
            .get(DATA_MAPPING)
            .and_then(Value::as_object);
        sources.push((*parent, mapping));
    }
    if sources.is_empty() {
        if let Some(root) = graph.root().filter(|root| *root != nid) {
            sources.push((root, None));
        }
    }

    for (source, mapping) in sources {
        let output = TaskView::new(graph, source)?.get_output()?;
        for (key, value) in &output {
            input.insert(key.clone(), value.clone());
        }
        for (out_key, in_key) in mapping.into_iter().flatten() {
            if let (Some(value), Some(in_key)) = (output.get(out_key), in_key.as_str()) {
                input.insert(in_key.to_string(), value.clone());
            }
        }
    }
    Ok(input)
}

/// `"$<nid>.<key>"` strings are replaced by that task's output value.
fn resolve_references(graph: &Graph, value: Value) -> Value {
    match value {
        Value::String(s) => lookup_reference(graph, &s).unwrap_or(Value::String(s)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => {
                        lookup_reference(graph, &s).unwrap_or(Value::String(s))
                    }
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

fn lookup_reference(graph: &Graph, s: &str) -> Option<Value> {
    let (nid, key) = s.strip_prefix('$')?.split_once('.')?;
    let nid: NodeId = nid.parse().ok()?;
    let output = TaskView::new(graph, nid).ok()?.get_output().ok()?;
    Some(output.get(key).cloned().unwrap_or(Value::Null))
}

/// Give a task its own directory under the project directory.
fn ensure_workdir(graph: &mut Graph, nid: NodeId, settings: &EngineSettings) -> Result<()> {
    let project_dir = settings.project_dir.clone().or_else(|| {
        graph
            .attrs()
            .get(PROJECT_DIR)
            .and_then(Value::as_str)
            .map(PathBuf::from)
    });
    let Some(project_dir) = project_dir else {
        return Ok(());
    };

    let view = TaskView::new(graph, nid)?;
    if !view.store_output() || view.workdir().is_some() {
        return Ok(());
    }
    let task_id = view
        .task_id()
        .map(|id| id.to_string())
        .unwrap_or_default();
    let dir = project_dir.join(format!("task-{}-{}", nid, task_id));
    std::fs::create_dir_all(&dir)?;
    debug!(nid, workdir = %dir.display(), "Created task directory");
    TaskMut::new(graph, nid)?.set_workdir(Some(&dir))
}

/// Keep a copy of the output as `output.json` in the task directory.
fn persist_output(graph: &Graph, nid: NodeId, output: Attrs) -> Attrs {
    let Ok(view) = TaskView::new(graph, nid) else {
        return output;
    };
    if let (true, Some(dir)) = (view.store_output(), view.workdir()) {
        let path = Path::new(dir).join("output.json");
        match serde_json::to_string_pretty(&output) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!(nid, path = %path.display(), error = %e, "Failed to write task output");
                }
            }
            Err(e) => warn!(nid, error = %e, "Failed to serialize task output"),
        }
    }
    output
}

/// One line per task.
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub nid: NodeId,
    pub task: String,
    pub task_type: String,
    pub status: String,
    pub children: Vec<NodeId>,
    pub runtime_secs: Option<f64>,
    pub output: Attrs,
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub title: String,
    pub rows: Vec<SummaryRow>,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.title.is_empty() {
            writeln!(f, "Workflow: {}", self.title)?;
        }
        writeln!(
            f,
            "{:<20} {:>5} {:<12} {:<10} {:>9}  output",
            "task", "nid", "links", "status", "runtime"
        )?;
        for row in &self.rows {
            let links = row
                .children
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let runtime = row
                .runtime_secs
                .map(|s| format!("{:.2}s", s))
                .unwrap_or_else(|| "-".into());
            let output = row.output.keys().cloned().collect::<Vec<_>>().join(",");
            writeln!(
                f,
                "{:<20} {:>5} {:<12} {:<10} {:>9}  {}",
                row.task, row.nid, links, row.status, runtime, output
            )?;
        }
        Ok(())
    }
}
