//! Instrumentation hooks for flows, tasks and schedulers.
//!
//! An [`Emitter`] is a factory: the runtime asks it for a sink per flow,
//! per task and per scheduler, then reports lifecycle events to those
//! sinks. Every method has a no-op default, so implementations only
//! override what they care about. A panic raised inside an emitter is
//! caught and logged; it never reaches the scheduler.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::{ExecError, PanicError, TaskError};

/// Which front end is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Flow,
    Parallel,
}

#[derive(Debug, Clone)]
pub struct FlowInfo {
    pub name: String,
    pub kind: DirectiveKind,
}

#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub name: String,
    pub file: &'static str,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerInfo {
    /// Name of the flow or parallel owning the scheduler.
    pub name: String,
}

/// Snapshot of a scheduler's control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerState {
    /// Jobs submitted but not finished.
    pub pending: usize,
    /// Jobs whose dependencies are done, waiting for a worker.
    pub ready: usize,
    /// Jobs still waiting on dependencies.
    pub waiting: usize,
    pub idle_workers: usize,
    pub concurrency: usize,
}

pub trait Emitter: Send + Sync {
    fn flow_init(&self, _info: &FlowInfo) -> Arc<dyn FlowEmitter> {
        Arc::new(NopEmitter)
    }

    fn task_init(&self, _task: &TaskInfo, _flow: &FlowInfo) -> Arc<dyn TaskEmitter> {
        Arc::new(NopEmitter)
    }

    /// `None` disables state reporting for the scheduler.
    fn scheduler_init(&self, _info: &SchedulerInfo) -> Option<Arc<dyn SchedulerEmitter>> {
        None
    }
}

pub trait FlowEmitter: Send + Sync {
    fn flow_start(&self) {}
    fn flow_success(&self) {}
    fn flow_error(&self, _err: &ExecError) {}
    fn flow_done(&self, _elapsed: Duration) {}
}

pub trait TaskEmitter: Send + Sync {
    fn task_start(&self) {}
    fn task_success(&self) {}
    fn task_error(&self, _err: &TaskError) {}
    fn task_error_recovered(&self, _err: &TaskError) {}
    fn task_panic(&self, _err: &PanicError) {}
    fn task_panic_recovered(&self, _err: &PanicError) {}
    /// The task never started. `err` is the failure that stopped the run,
    /// if any.
    fn task_skipped(&self, _err: Option<&ExecError>) {}
    fn task_done(&self, _elapsed: Duration) {}
}

pub trait SchedulerEmitter: Send + Sync {
    fn emit_state(&self, _state: SchedulerState) {}
}

/// Runs an emitter callback, logging instead of propagating a panic.
pub(crate) fn guard<T>(event: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let panic = PanicError::from_payload(payload);
            warn!(event, error = %panic.message(), "emitter panicked");
            None
        }
    }
}

/// Emits nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopEmitter;

impl Emitter for NopEmitter {}
impl FlowEmitter for NopEmitter {}
impl TaskEmitter for NopEmitter {}
impl SchedulerEmitter for NopEmitter {}

/// Fans every event out to several emitters, in order.
#[derive(Clone, Default)]
pub struct EmitterStack {
    emitters: Vec<Arc<dyn Emitter>>,
}

impl EmitterStack {
    pub fn new(emitters: Vec<Arc<dyn Emitter>>) -> Self {
        Self { emitters }
    }

    pub fn push(&mut self, emitter: Arc<dyn Emitter>) {
        self.emitters.push(emitter);
    }

    pub fn len(&self) -> usize {
        self.emitters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitters.is_empty()
    }
}

impl Emitter for EmitterStack {
    fn flow_init(&self, info: &FlowInfo) -> Arc<dyn FlowEmitter> {
        let sinks = self
            .emitters
            .iter()
            .filter_map(|e| guard("flow_init", || e.flow_init(info)))
            .collect();
        Arc::new(FlowStack(sinks))
    }

    fn task_init(&self, task: &TaskInfo, flow: &FlowInfo) -> Arc<dyn TaskEmitter> {
        let sinks = self
            .emitters
            .iter()
            .filter_map(|e| guard("task_init", || e.task_init(task, flow)))
            .collect();
        Arc::new(TaskStack(sinks))
    }

    fn scheduler_init(&self, info: &SchedulerInfo) -> Option<Arc<dyn SchedulerEmitter>> {
        let sinks: Vec<_> = self
            .emitters
            .iter()
            .filter_map(|e| guard("scheduler_init", || e.scheduler_init(info)).flatten())
            .collect();
        if sinks.is_empty() {
            None
        } else {
            Some(Arc::new(SchedulerStack(sinks)))
        }
    }
}

struct FlowStack(Vec<Arc<dyn FlowEmitter>>);

impl FlowStack {
    fn each(&self, event: &'static str, f: impl Fn(&dyn FlowEmitter)) {
        for sink in &self.0 {
            guard(event, || f(sink.as_ref()));
        }
    }
}

impl FlowEmitter for FlowStack {
    fn flow_start(&self) {
        self.each("flow_start", |e| e.flow_start());
    }
    fn flow_success(&self) {
        self.each("flow_success", |e| e.flow_success());
    }
    fn flow_error(&self, err: &ExecError) {
        self.each("flow_error", |e| e.flow_error(err));
    }
    fn flow_done(&self, elapsed: Duration) {
        self.each("flow_done", |e| e.flow_done(elapsed));
    }
}

struct TaskStack(Vec<Arc<dyn TaskEmitter>>);

impl TaskStack {
    fn each(&self, event: &'static str, f: impl Fn(&dyn TaskEmitter)) {
        for sink in &self.0 {
            guard(event, || f(sink.as_ref()));
        }
    }
}

impl TaskEmitter for TaskStack {
    fn task_start(&self) {
        self.each("task_start", |e| e.task_start());
    }
    fn task_success(&self) {
        self.each("task_success", |e| e.task_success());
    }
    fn task_error(&self, err: &TaskError) {
        self.each("task_error", |e| e.task_error(err));
    }
    fn task_error_recovered(&self, err: &TaskError) {
        self.each("task_error_recovered", |e| e.task_error_recovered(err));
    }
    fn task_panic(&self, err: &PanicError) {
        self.each("task_panic", |e| e.task_panic(err));
    }
    fn task_panic_recovered(&self, err: &PanicError) {
        self.each("task_panic_recovered", |e| e.task_panic_recovered(err));
    }
    fn task_skipped(&self, err: Option<&ExecError>) {
        self.each("task_skipped", |e| e.task_skipped(err));
    }
    fn task_done(&self, elapsed: Duration) {
        self.each("task_done", |e| e.task_done(elapsed));
    }
}

struct SchedulerStack(Vec<Arc<dyn SchedulerEmitter>>);

impl SchedulerEmitter for SchedulerStack {
    fn emit_state(&self, state: SchedulerState) {
        for sink in &self.0 {
            guard("emit_state", || sink.emit_state(state));
        }
    }
}

/// Writes every event as a `tracing` record.
///
/// Flow outcomes are logged at `info`/`error`, task events at `debug`
/// (failures at `warn`), and scheduler snapshots at `trace`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEmitter;

impl Emitter for TracingEmitter {
    fn flow_init(&self, info: &FlowInfo) -> Arc<dyn FlowEmitter> {
        Arc::new(TracingFlow {
            flow: info.name.clone(),
        })
    }

    fn task_init(&self, task: &TaskInfo, flow: &FlowInfo) -> Arc<dyn TaskEmitter> {
        Arc::new(TracingTask {
            flow: flow.name.clone(),
            task: task.name.clone(),
        })
    }

    fn scheduler_init(&self, info: &SchedulerInfo) -> Option<Arc<dyn SchedulerEmitter>> {
        Some(Arc::new(TracingScheduler {
            flow: info.name.clone(),
        }))
    }
}

struct TracingFlow {
    flow: String,
}

impl FlowEmitter for TracingFlow {
    fn flow_start(&self) {
        debug!(flow = %self.flow, "flow started");
    }
    fn flow_success(&self) {
        info!(flow = %self.flow, "flow succeeded");
    }
    fn flow_error(&self, err: &ExecError) {
        error!(flow = %self.flow, error = %err, "flow failed");
    }
    fn flow_done(&self, elapsed: Duration) {
        debug!(flow = %self.flow, ?elapsed, "flow done");
    }
}

struct TracingTask {
    flow: String,
    task: String,
}

impl TaskEmitter for TracingTask {
    fn task_start(&self) {
        debug!(flow = %self.flow, task = %self.task, "task started");
    }
    fn task_success(&self) {
        debug!(flow = %self.flow, task = %self.task, "task succeeded");
    }
    fn task_error(&self, err: &TaskError) {
        warn!(flow = %self.flow, task = %self.task, error = %err, "task failed");
    }
    fn task_error_recovered(&self, err: &TaskError) {
        warn!(flow = %self.flow, task = %self.task, error = %err, "task error recovered");
    }
    fn task_panic(&self, err: &PanicError) {
        error!(flow = %self.flow, task = %self.task, panic = %err.message(), "task panicked");
    }
    fn task_panic_recovered(&self, err: &PanicError) {
        warn!(flow = %self.flow, task = %self.task, panic = %err.message(), "task panic recovered");
    }
    fn task_skipped(&self, err: Option<&ExecError>) {
        match err {
            Some(err) => debug!(flow = %self.flow, task = %self.task, error = %err, "task skipped"),
            None => debug!(flow = %self.flow, task = %self.task, "task skipped"),
        }
    }
    fn task_done(&self, elapsed: Duration) {
        trace!(flow = %self.flow, task = %self.task, ?elapsed, "task done");
    }
}

struct TracingScheduler {
    flow: String,
}

impl SchedulerEmitter for TracingScheduler {
    fn emit_state(&self, state: SchedulerState) {
        trace!(
            flow = %self.flow,
            pending = state.pending,
            ready = state.ready,
            waiting = state.waiting,
            idle_workers = state.idle_workers,
            concurrency = state.concurrency,
            "scheduler state"
        );
    }
}
