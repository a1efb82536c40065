pub mod config;
pub mod cycle_check;
pub mod emitter;
pub mod error;
pub mod flow;
pub mod graph;
pub mod parallel;
pub mod scheduler;
pub mod task;
pub mod types;

mod runtime;

pub use config::SchedulerConfig;
pub use cycle_check::find_cycles;
pub use emitter::{
    DirectiveKind, Emitter, EmitterStack, FlowEmitter, FlowInfo, NopEmitter, SchedulerEmitter,
    SchedulerInfo, SchedulerState, TaskEmitter, TaskInfo, TracingEmitter,
};
pub use error::{CycleStep, ExecError, GraphError, GraphErrors, PanicError, Provider, TaskError};
pub use flow::{Flow, FlowBuilder};
pub use graph::{DependencyEdge, Graph, Producer, TaskId, build_graph};
pub use parallel::{Parallel, ParallelBuilder};
pub use scheduler::{Job, JobFn, ScheduledJob, Scheduler};
pub use task::{
    BoxTask, DescriptorProvider, Fallback, Predicate, Slot, Task, TaskBuilder, TaskDescriptor,
    task_fn,
};
pub use types::{ParamSet, ResultSet, TypeKey, Value, Values};

pub type TaskInput = Values;
pub type TaskOutput = Values;
