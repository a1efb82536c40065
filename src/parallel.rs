//! Independent tasks run side by side, with no data wiring between them.
//!
//! Besides single tasks a [`Parallel`] can fan out over a slice or a map,
//! one job per element, optionally followed by an end hook that runs once
//! every element succeeded.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::emitter::{DirectiveKind, Emitter, FlowInfo, TaskEmitter, TaskInfo, guard};
use crate::flow::stack;
use crate::runtime::{RunEvents, catch_panic};
use crate::{ExecError, GraphError, GraphErrors, Job, SchedulerConfig, TaskError};

type UnitFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

fn boxed<F, Fut>(f: F) -> UnitFn
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |ctx| f(ctx).boxed())
}

/// One job of a parallel.
struct Unit {
    name: String,
    location: &'static Location<'static>,
    run: UnitFn,
}

impl Unit {
    fn info(&self) -> TaskInfo {
        TaskInfo {
            name: self.name.clone(),
            file: self.location.file(),
            line: self.location.line(),
        }
    }

    async fn run(
        self,
        ctx: CancellationToken,
        emitter: Arc<dyn TaskEmitter>,
        ran: Arc<AtomicBool>,
    ) -> Result<(), ExecError> {
        let Unit { name, run, .. } = self;
        ran.store(true, Ordering::SeqCst);
        guard("task_start", || emitter.task_start());
        let start = Instant::now();

        let result = match catch_panic(async move { run(ctx).await }).await {
            Ok(Ok(())) => {
                guard("task_success", || emitter.task_success());
                Ok(())
            }
            Ok(Err(err)) => {
                let err = TaskError::new(name, err);
                guard("task_error", || emitter.task_error(&err));
                Err(ExecError::Task(err))
            }
            Err(panic) => {
                guard("task_panic", || emitter.task_panic(&panic));
                Err(ExecError::Panic(panic))
            }
        };

        guard("task_done", || emitter.task_done(start.elapsed()));
        result
    }
}

/// A set of units, plus a hook to run once all of them succeeded.
struct Group {
    units: Vec<Unit>,
    end: Option<Unit>,
}

/// A validated parallel, ready to run once.
pub struct Parallel {
    name: String,
    groups: Vec<Group>,
    config: SchedulerConfig,
    emitter: Arc<dyn Emitter>,
}

impl Parallel {
    pub fn builder(name: impl Into<String>) -> ParallelBuilder {
        ParallelBuilder {
            name: name.into(),
            groups: Vec::new(),
            config: SchedulerConfig::default(),
            emitters: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of jobs, end hooks included.
    pub fn len(&self) -> usize {
        self.groups
            .iter()
            .map(|g| g.units.len() + usize::from(g.end.is_some()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every job.
    ///
    /// Fail-fast by default. With continue-on-error every independent job
    /// runs and every failure is returned.
    pub async fn run(self, ctx: &CancellationToken) -> Result<(), ExecError> {
        let info = FlowInfo {
            name: self.name.clone(),
            kind: DirectiveKind::Parallel,
        };
        let jobs = self.len();
        let mut events = RunEvents::begin(self.emitter, info);

        let ctx = ctx.child_token();
        let sched = events.scheduler(self.config.clone());
        debug!(parallel = %self.name, jobs, "running parallel");

        for group in self.groups {
            let mut handles = Vec::with_capacity(group.units.len());
            for unit in group.units {
                let (emitter, ran) = events.task(unit.info());
                let job = Job::new(move |ctx| unit.run(ctx, emitter, ran));
                handles.push(sched.enqueue(&ctx, job).await);
            }
            if let Some(end) = group.end {
                let (emitter, ran) = events.task(end.info());
                let job = Job::new(move |ctx| end.run(ctx, emitter, ran)).after(handles);
                sched.enqueue(&ctx, job).await;
            }
        }

        let outcome = sched.wait(&ctx).await;
        if outcome.is_err() {
            ctx.cancel();
        }
        events.finish(outcome)
    }
}

impl std::fmt::Debug for Parallel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parallel")
            .field("name", &self.name)
            .field("jobs", &self.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub struct ParallelBuilder {
    name: String,
    groups: Vec<Group>,
    config: SchedulerConfig,
    emitters: Vec<Arc<dyn Emitter>>,
}

impl ParallelBuilder {
    /// Adds a standalone task.
    #[track_caller]
    pub fn task<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.groups.push(Group {
            units: vec![Unit {
                name: name.into(),
                location: Location::caller(),
                run: boxed(f),
            }],
            end: None,
        });
        self
    }

    /// Runs `f` once per element, with the element's index.
    #[track_caller]
    pub fn slice<T, F, Fut>(self, name: impl Into<String>, items: Vec<T>, f: F) -> Self
    where
        T: Send + 'static,
        F: Fn(CancellationToken, usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.slice_group(name.into(), items, f, None)
    }

    /// Like [`ParallelBuilder::slice`], then runs `end` once every element
    /// succeeded.
    #[track_caller]
    pub fn slice_with_end<T, F, Fut, E, EFut>(
        self,
        name: impl Into<String>,
        items: Vec<T>,
        f: F,
        end: E,
    ) -> Self
    where
        T: Send + 'static,
        F: Fn(CancellationToken, usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        E: FnOnce(CancellationToken) -> EFut + Send + 'static,
        EFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.slice_group(name.into(), items, f, Some(boxed(end)))
    }

    /// Runs `f` once per entry.
    #[track_caller]
    pub fn map<K, V, F, Fut>(self, name: impl Into<String>, items: HashMap<K, V>, f: F) -> Self
    where
        K: Eq + Hash + Send + 'static,
        V: Send + 'static,
        F: Fn(CancellationToken, K, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.map_group(name.into(), items, f, None)
    }

    /// Like [`ParallelBuilder::map`], then runs `end` once every entry
    /// succeeded.
    #[track_caller]
    pub fn map_with_end<K, V, F, Fut, E, EFut>(
        self,
        name: impl Into<String>,
        items: HashMap<K, V>,
        f: F,
        end: E,
    ) -> Self
    where
        K: Eq + Hash + Send + 'static,
        V: Send + 'static,
        F: Fn(CancellationToken, K, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        E: FnOnce(CancellationToken) -> EFut + Send + 'static,
        EFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.map_group(name.into(), items, f, Some(boxed(end)))
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.config.continue_on_error = continue_on_error;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn emitter(mut self, emitter: Arc<dyn Emitter>) -> Self {
        self.emitters.push(emitter);
        self
    }

    /// Fails if an end hook is combined with continue-on-error: the hook
    /// could not tell whether every element succeeded.
    pub fn build(self) -> Result<Parallel, GraphErrors> {
        if self.config.continue_on_error {
            let errors: Vec<GraphError> = self
                .groups
                .iter()
                .filter_map(|g| g.end.as_ref())
                .map(|end| GraphError::InvalidTask {
                    task: end.name.clone(),
                    reason: "an end hook cannot be combined with continue_on_error".to_string(),
                })
                .collect();
            if !errors.is_empty() {
                return Err(GraphErrors::new(errors));
            }
        }

        Ok(Parallel {
            name: self.name,
            groups: self.groups,
            config: self.config,
            emitter: stack(self.emitters),
        })
    }

    #[track_caller]
    fn slice_group<T, F, Fut>(
        mut self,
        name: String,
        items: Vec<T>,
        f: F,
        end: Option<UnitFn>,
    ) -> Self
    where
        T: Send + 'static,
        F: Fn(CancellationToken, usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let location = Location::caller();
        let f = Arc::new(f);
        let units = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let f = Arc::clone(&f);
                Unit {
                    name: format!("{name}[{i}]"),
                    location,
                    run: boxed(move |ctx| f(ctx, i, item)),
                }
            })
            .collect();
        self.push_group(name, location, units, end);
        self
    }

    #[track_caller]
    fn map_group<K, V, F, Fut>(
        mut self,
        name: String,
        items: HashMap<K, V>,
        f: F,
        end: Option<UnitFn>,
    ) -> Self
    where
        K: Eq + Hash + Send + 'static,
        V: Send + 'static,
        F: Fn(CancellationToken, K, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let location = Location::caller();
        let f = Arc::new(f);
        let units = items
            .into_iter()
            .enumerate()
            .map(|(i, (key, value))| {
                let f = Arc::clone(&f);
                Unit {
                    name: format!("{name}[{i}]"),
                    location,
                    run: boxed(move |ctx| f(ctx, key, value)),
                }
            })
            .collect();
        self.push_group(name, location, units, end);
        self
    }

    fn push_group(
        &mut self,
        name: String,
        location: &'static Location<'static>,
        units: Vec<Unit>,
        end: Option<UnitFn>,
    ) {
        let end = end.map(|run| Unit {
            name: format!("{name}.end"),
            location,
            run,
        });
        self.groups.push(Group { units, end });
    }
}
