//! Dependency-aware job scheduler.
//!
//! A [`Scheduler`] runs [`Job`]s on a fixed pool of workers. Jobs are
//! enqueued with handles to previously enqueued jobs they depend on, and a
//! job only runs once all of its dependencies finished successfully.
//!
//! ```no_run
//! # use dagflow::{Job, Scheduler};
//! # use tokio_util::sync::CancellationToken;
//! # async fn demo() -> Result<(), dagflow::ExecError> {
//! let ctx = CancellationToken::new();
//! let sched = Scheduler::begin(2);
//! let a = sched.enqueue(&ctx, Job::new(|_ctx| async { Ok(()) })).await;
//! let b = sched.enqueue(&ctx, Job::new(|_ctx| async { Ok(()) })).await;
//! sched.enqueue(&ctx, Job::new(|_ctx| async { Ok(()) }).after([a, b])).await;
//! sched.wait(&ctx).await
//! # }
//! ```
//!
//! All scheduling state lives in one control loop task. Callers talk to it
//! through a submission channel, workers report back through a completion
//! channel, and nothing else touches the state, so no locks guard it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::emitter::{self, SchedulerEmitter, SchedulerState};
use crate::runtime::contain_panic;
use crate::{ExecError, SchedulerConfig};

/// Capacity of the submission queue: one job may be queued while the
/// control loop is busy.
const SUBMISSION_CAPACITY: usize = 1;

pub type JobFn =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), ExecError>> + Send>;

/// A unit of work for the scheduler.
pub struct Job {
    run: JobFn,
    dependencies: Vec<ScheduledJob>,
}

impl Job {
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ExecError>> + Send + 'static,
    {
        Self {
            run: Box::new(move |ctx| run(ctx).boxed()),
            dependencies: Vec::new(),
        }
    }

    /// Jobs that must finish successfully before this one runs.
    pub fn after(mut self, dependencies: impl IntoIterator<Item = ScheduledJob>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn dependencies(&self) -> &[ScheduledJob] {
        &self.dependencies
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Handle to an enqueued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduledJob {
    id: usize,
}

struct Submission {
    id: usize,
    ctx: CancellationToken,
    job: Job,
}

struct Dispatch {
    id: usize,
    ctx: CancellationToken,
    run: JobFn,
    invalid: bool,
}

struct Completion {
    id: usize,
    worker: usize,
    result: Result<(), ExecError>,
}

pub struct Scheduler {
    submit_tx: Mutex<Option<mpsc::Sender<Submission>>>,
    finished: Mutex<Option<oneshot::Receiver<Result<(), ExecError>>>>,
    next_id: AtomicUsize,
    concurrency: usize,
}

impl Scheduler {
    /// Starts a fail-fast scheduler with `concurrency` workers, `0` meaning
    /// `max(available parallelism, 4)`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn begin(concurrency: usize) -> Self {
        Self::start(SchedulerConfig::default().with_concurrency(concurrency), None)
    }

    /// Starts a scheduler. When `emitter` is set it receives a state
    /// snapshot every `state_flush_frequency`.
    pub fn start(config: SchedulerConfig, emitter: Option<Arc<dyn SchedulerEmitter>>) -> Self {
        let config = config.normalized();
        let concurrency = config.concurrency;

        let (submit_tx, submit_rx) = mpsc::channel(SUBMISSION_CAPACITY);
        let (done_tx, done_rx) = mpsc::channel(concurrency);
        let (finished_tx, finished_rx) = oneshot::channel();

        let mut workers = Vec::with_capacity(concurrency);
        for index in 0..concurrency {
            // A worker only ever holds the job it is running; the loop
            // never hands a job to a busy worker.
            let (tx, rx) = mpsc::channel(1);
            workers.push(tx);
            tokio::spawn(worker(index, rx, done_tx.clone()));
        }
        drop(done_tx);

        let ticker = emitter.as_ref().map(|_| {
            let period = config.state_flush_frequency;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let control = ControlLoop {
            continue_on_error: config.continue_on_error,
            concurrency,
            jobs: HashMap::new(),
            ready: VecDeque::new(),
            idle: (0..concurrency).rev().collect(),
            workers,
            pending: 0,
            waiting: 0,
            ongoing: 0,
            errors: Vec::new(),
            emitter,
        };

        debug!(
            concurrency,
            continue_on_error = config.continue_on_error,
            "scheduler started"
        );
        tokio::spawn(control.run(submit_rx, done_rx, ticker, finished_tx));

        Self {
            submit_tx: Mutex::new(Some(submit_tx)),
            finished: Mutex::new(Some(finished_rx)),
            next_id: AtomicUsize::new(0),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Queues `job` for execution under `ctx`.
    ///
    /// Dependencies must have been enqueued on this scheduler before. The
    /// returned handle can be used as a dependency of later jobs.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Scheduler::wait`].
    pub async fn enqueue(&self, ctx: &CancellationToken, job: Job) -> ScheduledJob {
        let tx = self
            .submit_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(tx) = tx else {
            panic!("Scheduler::enqueue called after Scheduler::wait");
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let submission = Submission {
            id,
            ctx: ctx.clone(),
            job,
        };
        if tx.send(submission).await.is_err() {
            // The loop already stopped after a failure; the job never runs.
            trace!(job = id, "scheduler stopped, dropping job");
        }
        ScheduledJob { id }
    }

    /// Waits for every enqueued job to finish.
    ///
    /// In fail-fast mode the first failure is returned as soon as it is
    /// recorded; jobs already running finish in the background. With
    /// continue-on-error every failure is collected. Cancelling `ctx`
    /// returns [`ExecError::Cancelled`] right away.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub async fn wait(&self, ctx: &CancellationToken) -> Result<(), ExecError> {
        // Disallow further enqueues. The loop sees the channel close once
        // in-flight enqueue calls return.
        drop(
            self.submit_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let Some(finished) = self
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            panic!("Scheduler::wait called twice");
        };

        tokio::select! {
            _ = ctx.cancelled() => Err(ExecError::Cancelled),
            outcome = finished => match outcome {
                // The context may have been cancelled at the same moment
                // the last job finished.
                Ok(Ok(())) if ctx.is_cancelled() => Err(ExecError::Cancelled),
                Ok(result) => result,
                Err(_) => Err(ExecError::Interrupted),
            },
        }
    }
}

struct JobState {
    ctx: CancellationToken,
    run: Option<JobFn>,
    remaining: usize,
    consumers: Vec<usize>,
    done: bool,
    failed: bool,
    invalid: bool,
}

struct ControlLoop {
    continue_on_error: bool,
    concurrency: usize,
    jobs: HashMap<usize, JobState>,
    ready: VecDeque<usize>,
    idle: Vec<usize>,
    workers: Vec<mpsc::Sender<Dispatch>>,
    /// Jobs submitted and not yet finished.
    pending: usize,
    /// Jobs with outstanding dependencies.
    waiting: usize,
    /// Jobs handed to a worker.
    ongoing: usize,
    errors: Vec<ExecError>,
    emitter: Option<Arc<dyn SchedulerEmitter>>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut submit_rx: mpsc::Receiver<Submission>,
        mut done_rx: mpsc::Receiver<Completion>,
        mut ticker: Option<Interval>,
        finished_tx: oneshot::Sender<Result<(), ExecError>>,
    ) {
        let mut accepting = true;

        let outcome = loop {
            if let Some(err) = self.dispatch() {
                break Err(err);
            }

            tokio::select! {
                submission = submit_rx.recv(), if accepting => match submission {
                    Some(submission) => self.register(submission),
                    None => accepting = false,
                },
                Some(completion) = done_rx.recv() => {
                    if let Some(err) = self.complete(completion) {
                        break Err(err);
                    }
                }
                _ = tick(&mut ticker) => self.emit_state(),
                else => break Err(ExecError::Interrupted),
            }

            if self.pending == 0 && !accepting {
                break self.finish();
            }
        };

        match &outcome {
            Ok(()) => debug!("scheduler finished"),
            Err(err) => debug!(error = %err, "scheduler stopped"),
        }
        let _ = finished_tx.send(outcome);

        // Idle workers exit; busy ones finish their job first.
        self.workers.clear();

        // Don't leave concurrent enqueue calls blocked.
        submit_rx.close();
        while submit_rx.recv().await.is_some() {}
    }

    /// Hands ready jobs to idle workers. Returns a fail-fast error if a
    /// worker turned out to be gone.
    fn dispatch(&mut self) -> Option<ExecError> {
        while !self.idle.is_empty() {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            let Some(run) = job.run.take() else {
                continue;
            };
            let Some(worker) = self.idle.pop() else {
                break;
            };

            let dispatch = Dispatch {
                id,
                ctx: job.ctx.clone(),
                run,
                invalid: job.invalid,
            };
            trace!(job = id, worker, invalid = job.invalid, "dispatching job");
            self.ongoing += 1;

            if self.workers[worker].try_send(dispatch).is_err() {
                warn!(job = id, worker, "worker exited unexpectedly");
                let completion = Completion {
                    id,
                    worker,
                    result: Err(ExecError::Interrupted),
                };
                if let Some(err) = self.complete(completion) {
                    return Some(err);
                }
                // Never hand work to that worker again.
                self.idle.retain(|&w| w != worker);
            }
        }
        None
    }

    fn register(&mut self, submission: Submission) {
        let Submission { id, ctx, job } = submission;
        let mut state = JobState {
            ctx,
            run: Some(job.run),
            remaining: 0,
            consumers: Vec::new(),
            done: false,
            failed: false,
            invalid: false,
        };

        for dep in job.dependencies {
            match self.jobs.get_mut(&dep.id) {
                Some(dep) if dep.done => {
                    if dep.failed {
                        state.invalid = true;
                    }
                }
                Some(dep) => {
                    dep.consumers.push(id);
                    state.remaining += 1;
                }
                None => warn!(job = id, dependency = dep.id, "unknown dependency ignored"),
            }
        }

        self.pending += 1;
        if state.remaining == 0 {
            self.ready.push_back(id);
        } else {
            self.waiting += 1;
        }
        trace!(job = id, remaining = state.remaining, "job enqueued");
        self.jobs.insert(id, state);
    }

    /// Records a finished job. Returns the error that stops the loop in
    /// fail-fast mode.
    fn complete(&mut self, completion: Completion) -> Option<ExecError> {
        let Completion { id, worker, result } = completion;
        self.idle.push(worker);
        self.ongoing = self.ongoing.saturating_sub(1);
        self.pending = self.pending.saturating_sub(1);

        let failed = result.is_err();
        let consumers = match self.jobs.get_mut(&id) {
            Some(job) => {
                job.done = true;
                job.failed = failed;
                std::mem::take(&mut job.consumers)
            }
            None => Vec::new(),
        };
        trace!(job = id, failed, "job finished");

        if let Err(err) = result {
            if !self.continue_on_error {
                return Some(err);
            }
            match err {
                ExecError::DependencyFailed => {}
                ExecError::Cancelled if self.errors.iter().any(ExecError::is_cancelled) => {}
                err => self.errors.push(err),
            }
            for consumer in &consumers {
                if let Some(job) = self.jobs.get_mut(consumer) {
                    job.invalid = true;
                }
            }
        }

        for consumer in consumers {
            if let Some(job) = self.jobs.get_mut(&consumer) {
                job.remaining -= 1;
                if job.remaining == 0 {
                    self.waiting -= 1;
                    self.ready.push_back(consumer);
                }
            }
        }
        None
    }

    fn finish(&mut self) -> Result<(), ExecError> {
        let mut errors = std::mem::take(&mut self.errors);
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ExecError::Multiple(errors)),
        }
    }

    fn emit_state(&self) {
        let Some(emitter) = &self.emitter else {
            return;
        };
        let state = SchedulerState {
            pending: self.pending,
            ready: self.ready.len(),
            waiting: self.waiting,
            idle_workers: self.concurrency.saturating_sub(self.ongoing),
            concurrency: self.concurrency,
        };
        emitter::guard("emit_state", || emitter.emit_state(state));
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Runs dispatched jobs one at a time and reports their outcome.
async fn worker(
    index: usize,
    mut jobs: mpsc::Receiver<Dispatch>,
    done: mpsc::Sender<Completion>,
) {
    while let Some(Dispatch {
        id,
        ctx,
        run,
        invalid,
    }) = jobs.recv().await
    {
        let result = if ctx.is_cancelled() {
            Err(ExecError::Cancelled)
        } else if invalid {
            Err(ExecError::DependencyFailed)
        } else {
            contain_panic(async move { run(ctx).await }).await
        };

        let completion = Completion {
            id,
            worker: index,
            result,
        };
        if done.send(completion).await.is_err() {
            // The control loop is gone.
            break;
        }
    }
}
