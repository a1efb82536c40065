use std::any::Any;
use std::future::Future;
use std::panic::Location;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{GraphError, GraphErrors, TaskInput, TaskOutput, TypeKey, Values};

/// The function behind a task.
///
/// `input` holds the values of the task's declared input types; a value may
/// be absent when its producer was skipped by a predicate. The returned
/// output must hold exactly the declared output types.
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self, ctx: CancellationToken, input: TaskInput) -> anyhow::Result<TaskOutput>;
}

pub type BoxTask = Arc<dyn Task>;

struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(CancellationToken, TaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<TaskOutput>> + Send + 'static,
{
    async fn execute(&self, ctx: CancellationToken, input: TaskInput) -> anyhow::Result<TaskOutput> {
        (self.0)(ctx, input).await
    }
}

/// Wraps an async closure as a [`Task`].
pub fn task_fn<F, Fut>(f: F) -> BoxTask
where
    F: Fn(CancellationToken, TaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<TaskOutput>> + Send + 'static,
{
    Arc::new(FnTask(f))
}

/// A position in a task signature as described by a descriptor provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The cancellation context. Only valid as the first parameter.
    Context,
    Value(TypeKey),
    /// The failure channel. Only valid as the last result.
    Error,
}

impl Slot {
    pub fn of<T: Any>() -> Self {
        Slot::Value(TypeKey::of::<T>())
    }
}

/// Gate deciding whether a task runs.
///
/// The predicate's inputs become dependencies of its task.
#[derive(Clone)]
pub struct Predicate {
    inputs: Vec<TypeKey>,
    eval: Arc<dyn Fn(&TaskInput) -> bool + Send + Sync>,
}

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&TaskInput) -> bool + Send + Sync + 'static,
    {
        Self {
            inputs: Vec::new(),
            eval: Arc::new(f),
        }
    }

    pub fn input<T: Any>(mut self) -> Self {
        self.inputs.push(TypeKey::of::<T>());
        self
    }

    pub fn inputs(&self) -> &[TypeKey] {
        &self.inputs
    }

    pub(crate) fn evaluate(&self, input: &TaskInput) -> bool {
        (self.eval)(input)
    }
}

/// Substitute outputs for a task that failed or panicked.
#[derive(Clone)]
pub enum Fallback {
    Values(Values),
    With(Arc<dyn Fn() -> Values + Send + Sync>),
}

impl Fallback {
    pub fn values(values: Values) -> Self {
        Fallback::Values(values)
    }

    pub fn with<F>(f: F) -> Self
    where
        F: Fn() -> Values + Send + Sync + 'static,
    {
        Fallback::With(Arc::new(f))
    }

    pub(crate) fn produce(&self) -> Values {
        match self {
            Fallback::Values(values) => values.clone(),
            Fallback::With(f) => f(),
        }
    }
}

/// Everything the graph builder and the runtime need to know about a task.
#[derive(Clone)]
pub struct TaskDescriptor {
    name: String,
    location: &'static Location<'static>,
    inputs: Vec<TypeKey>,
    outputs: Vec<TypeKey>,
    wants_context: bool,
    has_error: bool,
    predicate: Option<Predicate>,
    fallback: Option<Fallback>,
    invoke: bool,
    task: BoxTask,
}

impl TaskDescriptor {
    /// Starts a descriptor for an async closure.
    ///
    /// The instrumentation name defaults to `<file>.<line>` of the caller.
    #[track_caller]
    pub fn builder<F, Fut>(f: F) -> TaskBuilder
    where
        F: Fn(CancellationToken, TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<TaskOutput>> + Send + 'static,
    {
        TaskBuilder::new(task_fn(f), Location::caller())
    }

    /// Starts a descriptor for an existing [`Task`] implementation.
    #[track_caller]
    pub fn for_task(task: BoxTask) -> TaskBuilder {
        TaskBuilder::new(task, Location::caller())
    }

    /// Starts a descriptor from a positional signature.
    ///
    /// A [`Slot::Context`] is only recognized as the first parameter and a
    /// [`Slot::Error`] only as the last result.
    #[track_caller]
    pub fn from_signature(
        name: impl Into<String>,
        params: &[Slot],
        results: &[Slot],
        task: BoxTask,
    ) -> Result<TaskBuilder, GraphError> {
        let name = name.into();
        let invalid = |reason: &str| GraphError::InvalidTask {
            task: name.clone(),
            reason: reason.to_string(),
        };

        let mut builder = TaskBuilder::new(task, Location::caller()).name(name.clone());

        for (i, slot) in params.iter().enumerate() {
            match slot {
                Slot::Context if i == 0 => builder.wants_context = true,
                Slot::Context => return Err(invalid("only the first parameter may be a context")),
                Slot::Value(key) => builder.inputs.push(*key),
                Slot::Error => return Err(invalid("an error cannot be a parameter")),
            }
        }

        for (i, slot) in results.iter().enumerate() {
            match slot {
                Slot::Error if i + 1 == results.len() => builder.has_error = true,
                Slot::Error => return Err(invalid("only the last result may be an error")),
                Slot::Value(key) => builder.outputs.push(*key),
                Slot::Context => return Err(invalid("a context cannot be a result")),
            }
        }

        Ok(builder)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn inputs(&self) -> &[TypeKey] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TypeKey] {
        &self.outputs
    }

    pub fn wants_context(&self) -> bool {
        self.wants_context
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    pub fn fallback(&self) -> Option<&Fallback> {
        self.fallback.as_ref()
    }

    pub fn invoke(&self) -> bool {
        self.invoke
    }

    pub(crate) fn task(&self) -> &BoxTask {
        &self.task
    }

    /// Task inputs followed by predicate inputs not already listed.
    pub fn dependencies(&self) -> Vec<TypeKey> {
        let mut deps = self.inputs.clone();
        if let Some(predicate) = &self.predicate {
            for key in predicate.inputs() {
                if !deps.contains(key) {
                    deps.push(*key);
                }
            }
        }
        deps
    }

    /// Problems with the descriptor itself, independent of the graph.
    pub(crate) fn validate(&self) -> Vec<GraphError> {
        let mut errors = Vec::new();
        let mut invalid = |reason: String| {
            errors.push(GraphError::InvalidTask {
                task: self.name.clone(),
                reason,
            })
        };

        for (i, key) in self.outputs.iter().enumerate() {
            if self.outputs[..i].contains(key) {
                invalid(format!("output type {key} is declared twice"));
            }
        }

        if let Some(fallback) = &self.fallback {
            if !self.has_error {
                invalid("the task must be fallible for a fallback to be used".to_string());
            }
            if let Fallback::Values(values) = fallback {
                if values.len() != self.outputs.len()
                    || !self.outputs.iter().all(|k| values.contains(k))
                {
                    invalid(format!(
                        "fallback must produce the same values as the task: expected {:?}, got {:?}",
                        self.outputs, values
                    ));
                }
            }
        }

        errors
    }
}

impl std::fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("wants_context", &self.wants_context)
            .field("has_error", &self.has_error)
            .field("predicate", &self.predicate.as_ref().map(Predicate::inputs))
            .field("fallback", &self.fallback.is_some())
            .field("invoke", &self.invoke)
            .finish()
    }
}

/// Builder for [`TaskDescriptor`].
pub struct TaskBuilder {
    name: Option<String>,
    location: &'static Location<'static>,
    inputs: Vec<TypeKey>,
    outputs: Vec<TypeKey>,
    wants_context: bool,
    has_error: bool,
    predicate: Option<Predicate>,
    fallback: Option<Fallback>,
    invoke: bool,
    task: BoxTask,
}

impl TaskBuilder {
    fn new(task: BoxTask, location: &'static Location<'static>) -> Self {
        Self {
            name: None,
            location,
            inputs: Vec::new(),
            outputs: Vec::new(),
            wants_context: false,
            has_error: false,
            predicate: None,
            fallback: None,
            invoke: false,
            task,
        }
    }

    /// Instrumentation name reported to emitters.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn input<T: Any>(mut self) -> Self {
        self.inputs.push(TypeKey::of::<T>());
        self
    }

    pub fn output<T: Any>(mut self) -> Self {
        self.outputs.push(TypeKey::of::<T>());
        self
    }

    /// Passes the run's cancellation token to the task. Without it the
    /// task receives a token that is never cancelled.
    pub fn with_context(mut self) -> Self {
        self.wants_context = true;
        self
    }

    pub fn fallible(mut self) -> Self {
        self.has_error = true;
        self
    }

    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn invoke(mut self, invoke: bool) -> Self {
        self.invoke = invoke;
        self
    }

    pub fn build(self) -> TaskDescriptor {
        let name = self.name.unwrap_or_else(|| default_name(self.location));
        TaskDescriptor {
            name,
            location: self.location,
            inputs: self.inputs,
            outputs: self.outputs,
            wants_context: self.wants_context,
            has_error: self.has_error,
            predicate: self.predicate,
            fallback: self.fallback,
            invoke: self.invoke,
            task: self.task,
        }
    }
}

fn default_name(location: &Location<'_>) -> String {
    let file = Path::new(location.file())
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or_else(|| location.file());
    format!("{}.{}", file, location.line())
}

/// Supplies task descriptors, e.g. from a code generator or a registry.
pub trait DescriptorProvider {
    fn descriptors(&self) -> Result<Vec<TaskDescriptor>, GraphErrors>;
}
