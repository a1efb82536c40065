use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::Mutex;

use thiserror::Error;

use crate::TypeKey;

/// Something that provides a type to the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    Param,
    Task(String),
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Param => f.write_str("parameter"),
            Provider::Task(name) => write!(f, "task {name:?}"),
        }
    }
}

/// One step of a dependency cycle: `task` has to run to provide `provides`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleStep {
    pub task: String,
    pub provides: TypeKey,
}

fn render_cycle(path: &[CycleStep]) -> String {
    path.iter()
        .map(|step| format!("need to run [{}] to provide {}", step.task, step.provides))
        .collect::<Vec<_>>()
        .join(", then ")
}

fn render_outputs(outputs: &[TypeKey]) -> String {
    if outputs.is_empty() {
        return "it produces no values and is not marked invoke".to_string();
    }
    let names = outputs
        .iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("nothing consumes its outputs ({names}) and it is not marked invoke")
}

/// A problem found while validating a task graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected: {}", render_cycle(.path))]
    Cycle { path: Vec<CycleStep> },

    #[error("type {key} provided by both {first} and {second}")]
    DuplicateProvider {
        key: TypeKey,
        first: Provider,
        second: Provider,
    },

    #[error("type {key} is already provided as a parameter, task {task:?} provides it again")]
    AlreadyProvided { key: TypeKey, task: String },

    #[error("no provider found for {key}, required by {consumer}")]
    MissingProvider { key: TypeKey, consumer: String },

    #[error("task {task:?} is unused: {}", render_outputs(.outputs))]
    UnusedOutput { task: String, outputs: Vec<TypeKey> },

    #[error("unused parameter type {key}")]
    UnusedInput { key: TypeKey },

    #[error("invalid task {task:?}: {reason}")]
    InvalidTask { task: String, reason: String },
}

impl GraphError {
    /// True for both flavours of "this type has two providers".
    pub fn is_duplicate_provider(&self) -> bool {
        matches!(
            self,
            GraphError::DuplicateProvider { .. } | GraphError::AlreadyProvided { .. }
        )
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self, GraphError::Cycle { .. })
    }

    pub fn is_missing_provider(&self) -> bool {
        matches!(self, GraphError::MissingProvider { .. })
    }
}

/// Every validation problem found in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphErrors(Vec<GraphError>);

impl GraphErrors {
    pub(crate) fn new(errors: Vec<GraphError>) -> Self {
        Self(errors)
    }

    pub fn errors(&self) -> &[GraphError] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GraphError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn any(&self, f: impl Fn(&GraphError) -> bool) -> bool {
        self.0.iter().any(f)
    }
}

impl fmt::Display for GraphErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            errors => {
                write!(f, "{} graph errors:", errors.len())?;
                for err in errors {
                    write!(f, "\n  - {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for GraphErrors {}

impl From<GraphError> for GraphErrors {
    fn from(err: GraphError) -> Self {
        Self(vec![err])
    }
}

impl IntoIterator for GraphErrors {
    type Item = GraphError;
    type IntoIter = std::vec::IntoIter<GraphError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A task returned an error.
#[derive(Debug)]
pub struct TaskError {
    task: String,
    source: anyhow::Error,
}

impl TaskError {
    pub fn new(task: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            task: task.into(),
            source,
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.source
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {:?} failed: {:#}", self.task, self.source)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// A task panicked.
///
/// Holds the message recovered from the panic payload and, when
/// `RUST_BACKTRACE` allows it, the backtrace captured where the panic was
/// caught.
pub struct PanicError {
    message: String,
    payload: Mutex<Option<Box<dyn Any + Send>>>,
    backtrace: Option<String>,
}

impl PanicError {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };

        let backtrace = Backtrace::capture();
        let backtrace = match backtrace.status() {
            BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };

        Self {
            message,
            payload: Mutex::new(Some(payload)),
            backtrace,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    /// Takes the original panic payload, e.g. to resume unwinding with it.
    /// Returns `None` once taken.
    pub fn take_payload(&self) -> Option<Box<dyn Any + Send>> {
        match self.payload.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl fmt::Debug for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicError")
            .field("message", &self.message)
            .field("backtrace", &self.backtrace.is_some())
            .finish()
    }
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)?;
        if let Some(bt) = &self.backtrace {
            write!(f, "\n{bt}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PanicError {}

fn render_multiple(errors: &[ExecError]) -> String {
    let rendered = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} jobs failed: {rendered}", errors.len())
}

/// Runtime failure of a flow, a parallel or a scheduler run.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Panic(#[from] PanicError),

    #[error("execution cancelled")]
    Cancelled,

    /// A dependency of the job failed, so the job was not run. Only seen
    /// in continue-on-error mode and never reported by `wait`.
    #[error("job not run: a dependency failed")]
    DependencyFailed,

    #[error("scheduler exited unexpectedly")]
    Interrupted,

    #[error("{}", render_multiple(.0))]
    Multiple(Vec<ExecError>),
}

impl ExecError {
    pub fn task(task: impl Into<String>, source: anyhow::Error) -> Self {
        ExecError::Task(TaskError::new(task, source))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled)
    }

    /// The panic behind this error, looking inside aggregates.
    pub fn as_panic(&self) -> Option<&PanicError> {
        self.errors().into_iter().find_map(|e| match e {
            ExecError::Panic(p) => Some(p),
            _ => None,
        })
    }

    /// Flattens aggregates into the individual failures.
    pub fn errors(&self) -> Vec<&ExecError> {
        match self {
            ExecError::Multiple(errors) => errors.iter().flat_map(|e| e.errors()).collect(),
            other => vec![other],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_exposes_its_cause() {
        let err = ExecError::task("fetch", anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "task \"fetch\" failed: boom");

        let source = std::error::Error::source(&err).expect("transparent source");
        assert_eq!(source.to_string(), "boom");
    }

    #[test]
    fn panic_error_recovers_string_payloads() {
        let err = PanicError::from_payload(Box::new("static message"));
        assert_eq!(err.message(), "static message");

        let err = PanicError::from_payload(Box::new(String::from("owned")));
        assert_eq!(err.message(), "owned");
        assert!(err.to_string().starts_with("panic: owned"));

        let payload = err.take_payload().expect("payload");
        assert_eq!(payload.downcast_ref::<String>().map(String::as_str), Some("owned"));
        assert!(err.take_payload().is_none());
    }

    #[test]
    fn multiple_flattens_nested_errors() {
        let err = ExecError::Multiple(vec![
            ExecError::task("a", anyhow::anyhow!("x")),
            ExecError::Multiple(vec![ExecError::Cancelled]),
        ]);
        assert_eq!(err.errors().len(), 2);
        assert!(err.to_string().starts_with("2 jobs failed"));
    }

    #[test]
    fn graph_errors_render_every_problem() {
        let errors = GraphErrors::new(vec![
            GraphError::UnusedInput {
                key: TypeKey::of::<u8>(),
            },
            GraphError::MissingProvider {
                key: TypeKey::of::<u16>(),
                consumer: "task \"b\"".to_string(),
            },
        ]);
        let rendered = errors.to_string();
        assert!(rendered.starts_with("2 graph errors:"));
        assert!(rendered.contains("unused parameter type u8"));
        assert!(rendered.contains("no provider found for u16"));
    }
}
