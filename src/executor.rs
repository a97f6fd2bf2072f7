//! Drives a [`TaskGraph`] to completion.
//!
//! The scheduler keeps a ready set of tasks whose predecessors have all
//! reached a terminal status. Sequential execution (the default) pops one
//! ready task at a time; parallel execution (`parallelism > 1`) runs tasks
//! on a dedicated worker pool, with all mutable run state owned by the
//! scheduler thread and workers reporting results over a channel.
//!
//! Failure policy: by default a failure halts scheduling (in-flight tasks
//! drain); with `keep_going` the scheduler continues with every task whose
//! strict predecessors are all non-failed. A task with a failed strict
//! predecessor is never executed; it is recorded as skipped.

use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use console::Style;
use indicatif::ProgressStyle;
use serde::{Serialize, Serializer};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::{Context, TaskId};
use crate::error::BuildError;
use crate::graph::TaskGraph;
use crate::property::PropertyKind;
use crate::task::{TaskRef, TaskStatus};

/// Execution policy for one run.
#[derive(Clone)]
pub struct ExecutorConfig {
    /// Maximum number of tasks running at once. `1` executes sequentially.
    pub parallelism: usize,
    /// Keep scheduling tasks whose strict predecessors are all non-failed
    /// instead of halting at the first failure.
    pub keep_going: bool,
    /// Cooperative cancellation: once set, no new task starts and in-flight
    /// tasks are allowed to finish.
    pub cancelled: Arc<AtomicBool>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            parallelism: 1,
            keep_going: false,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ExecutorConfig {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// The flag a front-end flips to request cancellation.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

/// Hooks into the execution of a graph. All callbacks run on the scheduler
/// thread.
pub trait ExecutionObserver: Send {
    fn before_task(&mut self, _task: TaskRef<'_>) {}
    fn after_task(&mut self, _task: TaskRef<'_>, _status: &TaskStatus) {}
    fn after_graph(&mut self, _ctx: &Context, _summary: &BuildSummary) {}
}

/// The default observer: logs task transitions and prints the build summary.
#[derive(Default)]
pub struct LogObserver;

impl ExecutionObserver for LogObserver {
    fn before_task(&mut self, task: TaskRef<'_>) {
        tracing::info!(task = %task.path(), "starting");
    }

    fn after_task(&mut self, task: TaskRef<'_>, status: &TaskStatus) {
        match status {
            TaskStatus::Failed { reason } => {
                tracing::error!(task = %task.path(), %reason, "failed");
            }
            status => {
                tracing::info!(task = %task.path(), status = status.label(), "done");
            }
        }
    }

    fn after_graph(&mut self, _ctx: &Context, summary: &BuildSummary) {
        eprintln!("{}", summary.render());
    }
}

fn duration_millis<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

/// One task's outcome in the summary.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryEntry {
    #[serde(skip)]
    pub task: TaskId,
    pub path: String,
    pub status: TaskStatus,
    #[serde(rename = "duration_ms", serialize_with = "duration_millis")]
    pub duration: Option<Duration>,
}

/// Mapping from every task in the executed graph to its final status, in
/// completion order.
#[derive(Debug, Default, Serialize)]
pub struct BuildSummary {
    entries: Vec<SummaryEntry>,
}

impl BuildSummary {
    pub fn iter(&self) -> impl Iterator<Item = &SummaryEntry> {
        self.entries.iter()
    }

    pub fn status_of(&self, task: TaskId) -> Option<&TaskStatus> {
        self.entries
            .iter()
            .find(|entry| entry.task == task)
            .map(|entry| &entry.status)
    }

    /// Paths of the tasks that actually ran, in completion order.
    pub fn executed_paths(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| !entry.status.is_skipped())
            .map(|entry| entry.path.as_str())
            .collect()
    }

    pub fn failed(&self) -> impl Iterator<Item = &SummaryEntry> {
        self.entries.iter().filter(|entry| entry.status.is_failed())
    }

    /// `true` if no task failed.
    pub fn is_success(&self) -> bool {
        self.entries.iter().all(|entry| entry.status.is_ok())
    }

    /// Turn task failures into a [`BuildError`].
    pub fn check(&self) -> Result<(), BuildError> {
        let tasks: Vec<String> = self.failed().map(|entry| entry.path.clone()).collect();
        if tasks.is_empty() {
            Ok(())
        } else {
            Err(BuildError::TasksFailed { tasks })
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// A styled, human readable summary: every task with its status, the
    /// reason for failures and skips, and execution durations.
    pub fn render(&self) -> String {
        use std::fmt::Write;

        let succeeded = Style::new().green();
        let failed = Style::new().red();
        let skipped = Style::new().yellow();
        let up_to_date = Style::new().blue();

        let mut out = String::new();
        let _ = writeln!(out, "Build summary");
        for entry in &self.entries {
            let style = match entry.status {
                TaskStatus::Failed { .. } => &failed,
                TaskStatus::Skipped { .. } => &skipped,
                TaskStatus::UpToDate => &up_to_date,
                _ => &succeeded,
            };
            let _ = write!(
                out,
                "  {} {}",
                entry.path,
                style.apply_to(entry.status.label())
            );
            if let Some(reason) = entry.status.reason() {
                let _ = write!(out, " ({reason})");
            }
            if let Some(duration) = entry.duration {
                let _ = write!(out, " [{:.3}s]", duration.as_secs_f64());
            }
            let _ = writeln!(out);
        }
        out
    }
}

/// Mutable scheduling state, owned by the scheduler thread.
struct RunState<'a> {
    ctx: &'a Context,
    graph: &'a TaskGraph,
    rank: HashMap<TaskId, usize>,
    blockers: HashMap<TaskId, usize>,
    ready: BTreeSet<(usize, TaskId)>,
    statuses: HashMap<TaskId, TaskStatus>,
    entries: Vec<SummaryEntry>,
}

impl<'a> RunState<'a> {
    fn new(ctx: &'a Context, graph: &'a TaskGraph) -> Self {
        let order = graph.execution_order();
        let rank: HashMap<TaskId, usize> = order
            .iter()
            .enumerate()
            .map(|(position, &task)| (task, position))
            .collect();
        let blockers: HashMap<TaskId, usize> = order
            .iter()
            .map(|&task| (task, graph.predecessors(task).len()))
            .collect();
        let ready: BTreeSet<(usize, TaskId)> = order
            .iter()
            .copied()
            .filter(|task| blockers[task] == 0)
            .map(|task| (rank[&task], task))
            .collect();
        RunState {
            ctx,
            graph,
            rank,
            blockers,
            ready,
            statuses: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// The ready task earliest in topological order, for determinism.
    fn pop_ready(&mut self) -> Option<TaskId> {
        let &(rank, task) = self.ready.iter().next()?;
        self.ready.remove(&(rank, task));
        Some(task)
    }

    /// If a strict predecessor failed, the task must not run.
    fn skip_reason(&self, task: TaskId) -> Option<String> {
        self.graph
            .predecessors(task)
            .into_iter()
            .find(|(pred, strict)| {
                *strict && self.statuses.get(pred).is_some_and(TaskStatus::is_failed)
            })
            .map(|(pred, _)| format!("upstream failed: {}", self.ctx.task_path(pred)))
    }

    fn record(&mut self, task: TaskId, status: TaskStatus, duration: Option<Duration>) {
        self.statuses.insert(task, status.clone());
        self.entries.push(SummaryEntry {
            task,
            path: self.ctx.task_path(task).to_string(),
            status,
            duration,
        });
        for (successor, _) in self.graph.successors(task) {
            if let Some(count) = self.blockers.get_mut(&successor) {
                *count -= 1;
                if *count == 0 {
                    self.ready.insert((self.rank[&successor], successor));
                }
            }
        }
    }

    /// Account for every task that never started: dependents of failures
    /// are skipped with the failing upstream named, the rest with the cause
    /// of the halt.
    fn finish(mut self, cancelled: bool, observer: &mut dyn ExecutionObserver) -> BuildSummary {
        let order = self.graph.execution_order();
        for &task in order {
            if self.statuses.contains_key(&task) {
                continue;
            }
            let reason = self.skip_reason(task).unwrap_or_else(|| {
                if cancelled {
                    "cancelled".to_string()
                } else {
                    "build halted".to_string()
                }
            });
            let status = TaskStatus::skipped(reason);
            observer.after_task(self.ctx.task(task), &status);
            self.record(task, status, None);
        }
        BuildSummary {
            entries: self.entries,
        }
    }
}

pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Executor { config }
    }

    pub fn run(&self, ctx: &Context, graph: &TaskGraph) -> BuildSummary {
        self.run_with_observer(ctx, graph, &mut LogObserver)
    }

    pub fn run_with_observer(
        &self,
        ctx: &Context,
        graph: &TaskGraph,
        observer: &mut dyn ExecutionObserver,
    ) -> BuildSummary {
        let root_span = tracing::span!(Level::INFO, "executing_tasks");
        root_span.pb_set_length(graph.len() as u64);
        root_span.pb_set_style(
            &ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("invalid progress bar template")
                .progress_chars("=>-"),
        );
        root_span.pb_set_message("Executing tasks...");
        let enter = root_span.enter();

        let mut state = RunState::new(ctx, graph);
        if self.config.parallelism <= 1 {
            self.run_sequential(&mut state, observer, &root_span);
        } else {
            self.run_parallel(&mut state, observer, &root_span);
        }

        drop(enter);
        let summary = state.finish(self.is_cancelled(), observer);
        observer.after_graph(ctx, &summary);
        summary
    }

    fn is_cancelled(&self) -> bool {
        self.config.cancelled.load(Ordering::SeqCst)
    }

    fn run_sequential(
        &self,
        state: &mut RunState<'_>,
        observer: &mut dyn ExecutionObserver,
        root_span: &tracing::Span,
    ) {
        let mut halted = false;
        while !halted && !self.is_cancelled() {
            let Some(task) = state.pop_ready() else { break };

            if let Some(reason) = state.skip_reason(task) {
                let status = TaskStatus::skipped(reason);
                observer.after_task(state.ctx.task(task), &status);
                state.record(task, status, None);
                root_span.pb_inc(1);
                continue;
            }

            observer.before_task(state.ctx.task(task));
            let started = Instant::now();
            let status = run_task(state.ctx, task);
            let duration = started.elapsed();
            if status.is_failed() && !self.config.keep_going {
                halted = true;
            }
            observer.after_task(state.ctx.task(task), &status);
            state.record(task, status, Some(duration));
            root_span.pb_inc(1);
        }
    }

    fn run_parallel(
        &self,
        state: &mut RunState<'_>,
        observer: &mut dyn ExecutionObserver,
        root_span: &tracing::Span,
    ) {
        let parallelism = self.config.parallelism;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .build()
            .expect("failed to build the worker pool");

        // The scheduler stays on the calling thread; only task bodies occupy
        // the pool's workers.
        pool.in_place_scope(|scope| {
            let (sender, receiver) =
                crossbeam_channel::unbounded::<(TaskId, TaskStatus, Duration)>();
            let mut running = 0usize;
            let mut halted = false;

            loop {
                // Fill the pool with ready tasks, resolving skips inline.
                while !halted && !self.is_cancelled() && running < parallelism {
                    let Some(task) = state.pop_ready() else { break };

                    if let Some(reason) = state.skip_reason(task) {
                        let status = TaskStatus::skipped(reason);
                        observer.after_task(state.ctx.task(task), &status);
                        state.record(task, status, None);
                        root_span.pb_inc(1);
                        continue;
                    }

                    observer.before_task(state.ctx.task(task));
                    let ctx = state.ctx;
                    let sender = sender.clone();
                    running += 1;
                    scope.spawn(move |_| {
                        let started = Instant::now();
                        let status = run_task(ctx, task);
                        sender
                            .send((task, status, started.elapsed()))
                            .expect("scheduler outlives its workers");
                    });
                }

                if running == 0 {
                    break;
                }

                // Block on the completion of any running task.
                let (task, status, duration) =
                    receiver.recv().expect("running worker sends a result");
                running -= 1;
                if status.is_failed() && !self.config.keep_going {
                    halted = true;
                }
                observer.after_task(state.ctx.task(task), &status);
                state.record(task, status, Some(duration));
                root_span.pb_inc(1);
            }
        });
    }
}

/// Invoke a task's action with its output properties unlocked, containing
/// panics and turning errors into a `Failed` status.
fn run_task(ctx: &Context, id: TaskId) -> TaskStatus {
    let data = ctx.task_data(id);
    let span = tracing::span!(Level::INFO, "task", path = %data.path);
    let _enter = span.enter();

    for property in &data.properties {
        if property.kind() == PropertyKind::Output {
            property.unfreeze();
        }
    }

    let action = data.action.clone();
    let result = catch_unwind(AssertUnwindSafe(|| action.execute(TaskRef { ctx, id })));

    for property in &data.properties {
        if property.kind() == PropertyKind::Output {
            property.freeze();
        }
    }

    match result {
        Ok(Ok(status)) => status,
        Ok(Err(error)) => TaskStatus::failed(format!("{error:#}")),
        Err(panic) => {
            let message = if let Some(text) = panic.downcast_ref::<&str>() {
                format!("task panicked: {text}")
            } else if let Some(text) = panic.downcast_ref::<String>() {
                format!("task panicked: {text}")
            } else {
                String::from("task panicked")
            };
            TaskStatus::failed(message)
        }
    }
}
