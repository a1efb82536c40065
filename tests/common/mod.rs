#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use dagflow::{
    Emitter, ExecError, FlowEmitter, FlowInfo, PanicError, SchedulerEmitter, SchedulerInfo,
    SchedulerState, TaskEmitter, TaskError, TaskInfo,
};
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests. Enable levels with e.g.
/// `RUST_LOG=dagflow=trace`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt().with_env_filter(filter).with_test_writer().init();
    });
}

/// Records every event as `"<event>"` or `"<event>:<task>"`.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
    states: Arc<Mutex<Vec<SchedulerState>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Events of one task, without the task suffix.
    pub fn task_events(&self, task: &str) -> Vec<String> {
        let suffix = format!(":{task}");
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_suffix(&suffix).map(str::to_string))
            .collect()
    }

    pub fn states(&self) -> Vec<SchedulerState> {
        self.states.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl Emitter for Recorder {
    fn flow_init(&self, _info: &FlowInfo) -> Arc<dyn FlowEmitter> {
        Arc::new(self.clone())
    }

    fn task_init(&self, task: &TaskInfo, _flow: &FlowInfo) -> Arc<dyn TaskEmitter> {
        Arc::new(TaskRecorder {
            recorder: self.clone(),
            task: task.name.clone(),
        })
    }

    fn scheduler_init(&self, _info: &SchedulerInfo) -> Option<Arc<dyn SchedulerEmitter>> {
        Some(Arc::new(self.clone()))
    }
}

impl FlowEmitter for Recorder {
    fn flow_start(&self) {
        self.push("flow_start".into());
    }
    fn flow_success(&self) {
        self.push("flow_success".into());
    }
    fn flow_error(&self, _err: &ExecError) {
        self.push("flow_error".into());
    }
    fn flow_done(&self, _elapsed: Duration) {
        self.push("flow_done".into());
    }
}

impl SchedulerEmitter for Recorder {
    fn emit_state(&self, state: SchedulerState) {
        self.states.lock().unwrap().push(state);
    }
}

struct TaskRecorder {
    recorder: Recorder,
    task: String,
}

impl TaskRecorder {
    fn push(&self, event: &str) {
        self.recorder.push(format!("{event}:{}", self.task));
    }
}

impl TaskEmitter for TaskRecorder {
    fn task_start(&self) {
        self.push("task_start");
    }
    fn task_success(&self) {
        self.push("task_success");
    }
    fn task_error(&self, _err: &TaskError) {
        self.push("task_error");
    }
    fn task_error_recovered(&self, _err: &TaskError) {
        self.push("task_error_recovered");
    }
    fn task_panic(&self, _err: &PanicError) {
        self.push("task_panic");
    }
    fn task_panic_recovered(&self, _err: &PanicError) {
        self.push("task_panic_recovered");
    }
    fn task_skipped(&self, err: Option<&ExecError>) {
        match err {
            Some(_) => self.push("task_skipped_err"),
            None => self.push("task_skipped"),
        }
    }
    fn task_done(&self, _elapsed: Duration) {
        self.push("task_done");
    }
}
