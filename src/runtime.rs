//! Job runtime: turns a [`TaskDescriptor`] into a scheduler job (predicate
//! gating, panic containment, output checks, fallback recovery) and tracks
//! the emitter events of a run.

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::emitter::{
    Emitter, FlowEmitter, FlowInfo, NopEmitter, SchedulerInfo, TaskEmitter, TaskInfo, guard,
};
use crate::{
    ExecError, PanicError, Scheduler, SchedulerConfig, TaskDescriptor, TaskError, TypeKey, Values,
};

/// Values produced so far by a run, shared between its jobs.
pub(crate) type Store = Arc<RwLock<Values>>;

/// Polls `fut`, turning a panic into a [`PanicError`].
pub(crate) async fn catch_panic<F: Future>(fut: F) -> Result<F::Output, PanicError> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(PanicError::from_payload)
}

/// Like [`catch_panic`] for futures that already report [`ExecError`]s.
pub(crate) async fn contain_panic<F, T>(fut: F) -> Result<T, ExecError>
where
    F: Future<Output = Result<T, ExecError>>,
{
    catch_panic(fut)
        .await
        .unwrap_or_else(|panic| Err(ExecError::Panic(panic)))
}

/// Emitter bookkeeping for one flow or parallel run.
pub(crate) struct RunEvents {
    emitter: Arc<dyn Emitter>,
    info: FlowInfo,
    flow: Arc<dyn FlowEmitter>,
    start: Instant,
    /// Each task's emitter and whether its function was invoked.
    tasks: Vec<(Arc<dyn TaskEmitter>, Arc<AtomicBool>)>,
}

impl RunEvents {
    /// Emits FlowStart.
    pub(crate) fn begin(emitter: Arc<dyn Emitter>, info: FlowInfo) -> Self {
        let flow: Arc<dyn FlowEmitter> = guard("flow_init", || emitter.flow_init(&info))
            .unwrap_or_else(|| Arc::new(NopEmitter));
        guard("flow_start", || flow.flow_start());
        Self {
            emitter,
            info,
            flow,
            start: Instant::now(),
            tasks: Vec::new(),
        }
    }

    /// Starts the scheduler for this run, with state reporting when the
    /// emitter asks for it.
    pub(crate) fn scheduler(&self, config: SchedulerConfig) -> Scheduler {
        let info = SchedulerInfo {
            name: self.info.name.clone(),
        };
        let state_emitter = guard("scheduler_init", || self.emitter.scheduler_init(&info)).flatten();
        Scheduler::start(config, state_emitter)
    }

    /// Registers a task; the returned flag must be set once it runs.
    pub(crate) fn task(&mut self, task: TaskInfo) -> (Arc<dyn TaskEmitter>, Arc<AtomicBool>) {
        let emitter: Arc<dyn TaskEmitter> =
            guard("task_init", || self.emitter.task_init(&task, &self.info))
                .unwrap_or_else(|| Arc::new(NopEmitter));
        let ran = Arc::new(AtomicBool::new(false));
        self.tasks.push((Arc::clone(&emitter), Arc::clone(&ran)));
        (emitter, ran)
    }

    /// Emits the flow outcome, Skipped for every task that never ran, then
    /// FlowDone.
    pub(crate) fn finish<T>(self, outcome: Result<T, ExecError>) -> Result<T, ExecError> {
        let err = outcome.as_ref().err();
        match err {
            None => guard("flow_success", || self.flow.flow_success()),
            Some(err) => {
                debug!(flow = %self.info.name, error = %err, "run failed");
                guard("flow_error", || self.flow.flow_error(err))
            }
        };
        for (emitter, ran) in &self.tasks {
            if !ran.load(Ordering::SeqCst) {
                guard("task_skipped", || emitter.task_skipped(err));
            }
        }
        guard("flow_done", || self.flow.flow_done(self.start.elapsed()));
        outcome
    }
}

enum Failure {
    Error(TaskError),
    Panic(PanicError),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Error(err) => write!(f, "error ({:#})", err.inner()),
            Failure::Panic(panic) => write!(f, "panic ({})", panic.message()),
        }
    }
}

/// One task of a flow, ready to be handed to the scheduler.
pub(crate) struct TaskJob {
    pub(crate) descriptor: Arc<TaskDescriptor>,
    pub(crate) store: Store,
    pub(crate) emitter: Arc<dyn TaskEmitter>,
    /// Set once the task function is invoked.
    pub(crate) ran: Arc<AtomicBool>,
}

impl TaskJob {
    pub(crate) async fn run(self, ctx: CancellationToken) -> Result<(), ExecError> {
        let name = self.descriptor.name().to_string();

        if let Some(predicate) = self.descriptor.predicate() {
            let inputs = self.gather(predicate.inputs()).await;
            match catch_unwind(AssertUnwindSafe(|| predicate.evaluate(&inputs))) {
                Ok(true) => {}
                Ok(false) => {
                    trace!(task = %name, "predicate declined, not running");
                    return Ok(());
                }
                Err(payload) => return Err(ExecError::Panic(PanicError::from_payload(payload))),
            }
        }

        let inputs = self.gather(self.descriptor.inputs()).await;
        self.ran.store(true, Ordering::SeqCst);
        guard("task_start", || self.emitter.task_start());
        let start = Instant::now();

        // A task that did not ask for the context never observes
        // cancellation once it started.
        let ctx = if self.descriptor.wants_context() {
            ctx
        } else {
            CancellationToken::new()
        };
        let result = self.invoke(&name, ctx, inputs).await;

        guard("task_done", || self.emitter.task_done(start.elapsed()));
        result
    }

    async fn invoke(
        &self,
        name: &str,
        ctx: CancellationToken,
        inputs: Values,
    ) -> Result<(), ExecError> {
        let task = Arc::clone(self.descriptor.task());
        let failure = match catch_panic(task.execute(ctx, inputs)).await {
            Ok(Ok(outputs)) => match self.check_outputs(&outputs) {
                Ok(()) => {
                    self.publish(outputs).await;
                    guard("task_success", || self.emitter.task_success());
                    return Ok(());
                }
                Err(err) => Failure::Error(TaskError::new(name, err)),
            },
            Ok(Err(err)) => Failure::Error(TaskError::new(name, err)),
            Err(panic) => Failure::Panic(panic),
        };

        let Some(fallback) = self.descriptor.fallback() else {
            return Err(match failure {
                Failure::Error(err) => {
                    guard("task_error", || self.emitter.task_error(&err));
                    ExecError::Task(err)
                }
                Failure::Panic(panic) => {
                    guard("task_panic", || self.emitter.task_panic(&panic));
                    ExecError::Panic(panic)
                }
            });
        };

        let values = match catch_unwind(AssertUnwindSafe(|| fallback.produce())) {
            Ok(values) => values,
            Err(payload) => {
                let panic = PanicError::from_payload(payload);
                debug!(task = %name, failure = %failure, "fallback panicked");
                guard("task_panic", || self.emitter.task_panic(&panic));
                return Err(ExecError::Panic(panic));
            }
        };
        if let Err(err) = self.check_outputs(&values) {
            let err = TaskError::new(
                name,
                err.context(format!("invalid fallback values after {failure}")),
            );
            guard("task_error", || self.emitter.task_error(&err));
            return Err(ExecError::Task(err));
        }

        match &failure {
            Failure::Error(err) => {
                guard("task_error_recovered", || self.emitter.task_error_recovered(err))
            }
            Failure::Panic(panic) => {
                guard("task_panic_recovered", || self.emitter.task_panic_recovered(panic))
            }
        };
        trace!(task = %name, "task recovered with fallback");
        self.publish(values).await;
        Ok(())
    }

    async fn gather(&self, keys: &[TypeKey]) -> Values {
        let store = self.store.read().await;
        let mut values = Values::new();
        for key in keys {
            if let Some(value) = store.get_value(key) {
                values.insert_value(*key, Arc::clone(value));
            }
        }
        values
    }

    fn check_outputs(&self, outputs: &Values) -> anyhow::Result<()> {
        let declared = self.descriptor.outputs();
        let missing: Vec<&TypeKey> = declared.iter().filter(|k| !outputs.contains(k)).collect();
        if !missing.is_empty() {
            anyhow::bail!("declared outputs were not produced: {missing:?}");
        }
        let extra: Vec<&TypeKey> = outputs.keys().filter(|k| !declared.contains(k)).collect();
        if !extra.is_empty() {
            anyhow::bail!("undeclared outputs were produced: {extra:?}");
        }
        Ok(())
    }

    async fn publish(&self, outputs: Values) {
        let mut store = self.store.write().await;
        for (key, value) in outputs.into_entries() {
            store.insert_value(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fallback, Predicate};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Events(Mutex<Vec<&'static str>>);

    impl TaskEmitter for Events {
        fn task_start(&self) {
            self.0.lock().unwrap().push("start");
        }
        fn task_success(&self) {
            self.0.lock().unwrap().push("success");
        }
        fn task_error(&self, _err: &TaskError) {
            self.0.lock().unwrap().push("error");
        }
        fn task_error_recovered(&self, _err: &TaskError) {
            self.0.lock().unwrap().push("error_recovered");
        }
        fn task_panic(&self, _err: &PanicError) {
            self.0.lock().unwrap().push("panic");
        }
        fn task_panic_recovered(&self, _err: &PanicError) {
            self.0.lock().unwrap().push("panic_recovered");
        }
        fn task_done(&self, _elapsed: Duration) {
            self.0.lock().unwrap().push("done");
        }
    }

    fn job(descriptor: TaskDescriptor, store: Values) -> (TaskJob, Arc<Events>, Store) {
        let events = Arc::new(Events::default());
        let store = Arc::new(RwLock::new(store));
        let job = TaskJob {
            descriptor: Arc::new(descriptor),
            store: Arc::clone(&store),
            emitter: events.clone(),
            ran: Arc::new(AtomicBool::new(false)),
        };
        (job, events, store)
    }

    #[tokio::test]
    async fn outputs_are_published() {
        let desc = TaskDescriptor::builder(|_ctx, input| async move {
            let n = *input.require::<u32>()?;
            Ok(Values::new().with(format!("n={n}")))
        })
        .input::<u32>()
        .output::<String>()
        .build();
        let (job, events, store) = job(desc, Values::new().with(7u32));

        job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(store.read().await.get::<String>().map(String::as_str), Some("n=7"));
        assert_eq!(*events.0.lock().unwrap(), vec!["start", "success", "done"]);
    }

    #[tokio::test]
    async fn error_without_fallback_fails_the_task() {
        let desc = TaskDescriptor::builder(|_ctx, _input| async { anyhow::bail!("x") })
            .name("fails")
            .output::<String>()
            .fallible()
            .build();
        let (job, events, _) = job(desc, Values::new());

        let err = job.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "task \"fails\" failed: x");
        assert_eq!(*events.0.lock().unwrap(), vec!["start", "error", "done"]);
    }

    #[tokio::test]
    async fn fallback_recovers_errors() {
        let desc = TaskDescriptor::builder(|_ctx, _input| async { anyhow::bail!("x") })
            .output::<String>()
            .fallible()
            .fallback(Fallback::values(Values::new().with("bar".to_string())))
            .build();
        let (job, events, store) = job(desc, Values::new());

        job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(store.read().await.cloned::<String>().as_deref(), Some("bar"));
        assert_eq!(*events.0.lock().unwrap(), vec!["start", "error_recovered", "done"]);
    }

    #[tokio::test]
    async fn fallback_recovers_panics() {
        async fn sad(_ctx: CancellationToken, _input: Values) -> anyhow::Result<Values> {
            panic!("sad")
        }
        let desc = TaskDescriptor::builder(sad)
            .output::<u8>()
            .fallible()
            .fallback(Fallback::with(|| Values::new().with(1u8)))
            .build();
        let (job, events, store) = job(desc, Values::new());

        job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(store.read().await.get::<u8>(), Some(&1));
        assert_eq!(*events.0.lock().unwrap(), vec!["start", "panic_recovered", "done"]);
    }

    #[tokio::test]
    async fn mismatched_outputs_are_an_error() {
        let desc = TaskDescriptor::builder(|_ctx, _input| async { Ok(Values::new().with(1u16)) })
            .output::<u8>()
            .build();
        let (job, _, _) = job(desc, Values::new());

        let err = job.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("not produced"), "{err}");
    }

    #[tokio::test]
    async fn declined_predicate_skips_silently() {
        let desc = TaskDescriptor::builder(|_ctx, _input| async { Ok(Values::new().with(1u8)) })
            .output::<u8>()
            .predicate(Predicate::new(|input| *input.get::<bool>().unwrap_or(&false)).input::<bool>())
            .build();
        let (job, events, store) = job(desc, Values::new().with(false));
        let ran = Arc::clone(&job.ran);

        job.run(CancellationToken::new()).await.unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(store.read().await.get::<u8>().is_none());
        assert!(events.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panicking_predicate_fails_the_task() {
        let desc = TaskDescriptor::builder(|_ctx, _input| async { Ok(Values::new()) })
            .predicate(Predicate::new(|_| panic!("bad predicate")))
            .build();
        let (job, _, _) = job(desc, Values::new());

        let err = job.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.as_panic().map(PanicError::message), Some("bad predicate"));
    }

    #[tokio::test]
    async fn invalid_fallback_values_fail_the_task() {
        let desc = TaskDescriptor::builder(|_ctx, _input| async { anyhow::bail!("x") })
            .name("lookup")
            .output::<u8>()
            .fallible()
            .fallback(Fallback::with(|| Values::new().with(1u16)))
            .build();
        let (job, events, store) = job(desc, Values::new());

        let err = job.run(CancellationToken::new()).await.unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.starts_with("task \"lookup\" failed"), "{rendered}");
        assert!(rendered.contains("error (x)"), "{rendered}");
        assert!(rendered.contains("not produced"), "{rendered}");
        assert!(store.read().await.get::<u16>().is_none());
        assert_eq!(*events.0.lock().unwrap(), vec!["start", "error", "done"]);
    }

    #[tokio::test]
    async fn panicking_fallback_fails_the_task() {
        let desc = TaskDescriptor::builder(|_ctx, _input| async { anyhow::bail!("x") })
            .output::<u8>()
            .fallible()
            .fallback(Fallback::with(|| panic!("fallback exploded")))
            .build();
        let (job, events, _) = job(desc, Values::new());

        let err = job.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.as_panic().map(PanicError::message), Some("fallback exploded"));
        assert_eq!(*events.0.lock().unwrap(), vec!["start", "panic", "done"]);
    }

    #[tokio::test]
    async fn context_reaches_only_tasks_that_ask_for_it() {
        async fn observe(ctx: CancellationToken, _input: Values) -> anyhow::Result<Values> {
            Ok(Values::new().with(ctx.is_cancelled()))
        }
        let cancelled = CancellationToken::new();
        cancelled.cancel();

        let desc = TaskDescriptor::builder(observe).output::<bool>().build();
        let (plain, _, store) = job(desc, Values::new());
        plain.run(cancelled.clone()).await.unwrap();
        assert_eq!(store.read().await.get::<bool>(), Some(&false));

        let desc = TaskDescriptor::builder(observe)
            .output::<bool>()
            .with_context()
            .build();
        let (aware, _, store) = job(desc, Values::new());
        aware.run(cancelled).await.unwrap();
        assert_eq!(store.read().await.get::<bool>(), Some(&true));
    }
}
