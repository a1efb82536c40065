use std::any::Any;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::emitter::{DirectiveKind, Emitter, EmitterStack, FlowInfo, NopEmitter, TaskInfo};
use crate::runtime::{RunEvents, Store, TaskJob};
use crate::{
    DescriptorProvider, ExecError, Graph, GraphError, GraphErrors, Job, ParamSet, ResultSet,
    ScheduledJob, SchedulerConfig, TaskDescriptor, Values, build_graph,
};

/// A validated set of tasks wired together by type.
///
/// Build one with [`Flow::builder`]; building runs every graph check, so
/// an invalid flow never executes. A flow can be run any number of times.
pub struct Flow {
    name: String,
    graph: Graph,
    params: Values,
    config: SchedulerConfig,
    emitter: Arc<dyn Emitter>,
}

impl Flow {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder {
            name: name.into(),
            params: ParamSet::new(),
            results: ResultSet::new(),
            tasks: Vec::new(),
            errors: Vec::new(),
            config: SchedulerConfig::default(),
            emitters: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Runs every task and returns the requested result values.
    ///
    /// A result whose producer was skipped by its predicate is absent from
    /// the returned values. The first failure cancels the run; tasks that
    /// never started are reported to emitters as skipped.
    pub async fn run(&self, ctx: &CancellationToken) -> Result<Values, ExecError> {
        let info = FlowInfo {
            name: self.name.clone(),
            kind: DirectiveKind::Flow,
        };
        let mut events = RunEvents::begin(Arc::clone(&self.emitter), info);

        let ctx = ctx.child_token();
        let store: Store = Arc::new(RwLock::new(self.params.clone()));
        let sched = events.scheduler(self.config.clone());
        debug!(flow = %self.name, tasks = self.graph.len(), "running flow");

        let mut handles: Vec<Option<ScheduledJob>> = vec![None; self.graph.len()];
        for &id in self.graph.topological_order() {
            let descriptor = Arc::clone(self.graph.task(id));
            let (emitter, ran) = events.task(TaskInfo {
                name: descriptor.name().to_string(),
                file: descriptor.location().file(),
                line: descriptor.location().line(),
            });
            let job = TaskJob {
                descriptor,
                store: Arc::clone(&store),
                emitter,
                ran,
            };

            let dependencies = self
                .graph
                .dependencies_of(id)
                .iter()
                .filter_map(|dep| handles[dep.0]);
            let job = Job::new(move |ctx| job.run(ctx)).after(dependencies);
            handles[id.0] = Some(sched.enqueue(&ctx, job).await);
        }

        let outcome = match sched.wait(&ctx).await {
            Ok(()) => {
                let store = store.read().await;
                let mut results = Values::new();
                for key in self.graph.results() {
                    if let Some(value) = store.get_value(key) {
                        results.insert_value(*key, Arc::clone(value));
                    }
                }
                Ok(results)
            }
            Err(err) => {
                // Stop dispatching whatever is still queued.
                ctx.cancel();
                Err(err)
            }
        };
        events.finish(outcome)
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("tasks", &self.graph.len())
            .field("params", &self.params)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub struct FlowBuilder {
    name: String,
    params: ParamSet,
    results: ResultSet,
    tasks: Vec<TaskDescriptor>,
    errors: Vec<GraphError>,
    config: SchedulerConfig,
    emitters: Vec<Arc<dyn Emitter>>,
}

impl FlowBuilder {
    pub fn param<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.params.insert(value);
        self
    }

    pub fn params(mut self, params: ParamSet) -> Self {
        self.params.append(params);
        self
    }

    /// Requests the value of type `T` as a result of the flow.
    pub fn result<T: Any>(mut self) -> Self {
        self.results = self.results.slot::<T>();
        self
    }

    pub fn results(mut self, results: ResultSet) -> Self {
        for key in results.keys() {
            self.results.add(*key);
        }
        self
    }

    pub fn task(mut self, task: TaskDescriptor) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn tasks(mut self, tasks: impl IntoIterator<Item = TaskDescriptor>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Adds every descriptor supplied by `provider`. Provider failures are
    /// reported by [`FlowBuilder::build`].
    pub fn tasks_from(mut self, provider: &dyn DescriptorProvider) -> Self {
        match provider.descriptors() {
            Ok(tasks) => self.tasks.extend(tasks),
            Err(errors) => self.errors.extend(errors),
        }
        self
    }

    /// Maximum number of tasks running at once. `0` picks the default.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds an emitter. Several emitters receive every event in the order
    /// they were added.
    pub fn emitter(mut self, emitter: Arc<dyn Emitter>) -> Self {
        self.emitters.push(emitter);
        self
    }

    pub fn build(self) -> Result<Flow, GraphErrors> {
        let mut errors = self.errors;
        if self.config.continue_on_error {
            errors.push(GraphError::InvalidTask {
                task: self.name.clone(),
                reason: "continue_on_error is only supported by parallel".to_string(),
            });
        }

        let graph = match build_graph(self.tasks, &self.params, &self.results) {
            Ok(graph) => Some(graph),
            Err(graph_errors) => {
                errors.extend(graph_errors);
                None
            }
        };
        let graph = match graph {
            Some(graph) if errors.is_empty() => graph,
            _ => return Err(GraphErrors::new(errors)),
        };

        Ok(Flow {
            name: self.name,
            graph,
            params: self.params.values(),
            config: self.config,
            emitter: stack(self.emitters),
        })
    }
}

/// Collapses the configured emitters into one.
pub(crate) fn stack(mut emitters: Vec<Arc<dyn Emitter>>) -> Arc<dyn Emitter> {
    match emitters.len() {
        0 => Arc::new(NopEmitter),
        1 => emitters.remove(0),
        _ => Arc::new(EmitterStack::new(emitters)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Celsius(f64);
    #[derive(Debug, Clone, PartialEq)]
    struct Fahrenheit(f64);

    struct Converters;

    impl DescriptorProvider for Converters {
        fn descriptors(&self) -> Result<Vec<TaskDescriptor>, GraphErrors> {
            Ok(vec![
                TaskDescriptor::builder(|_ctx, input| async move {
                    let c = input.require::<Celsius>()?;
                    Ok(Values::new().with(Fahrenheit(c.0 * 9.0 / 5.0 + 32.0)))
                })
                .name("to_fahrenheit")
                .input::<Celsius>()
                .output::<Fahrenheit>()
                .build(),
            ])
        }
    }

    struct Broken;

    impl DescriptorProvider for Broken {
        fn descriptors(&self) -> Result<Vec<TaskDescriptor>, GraphErrors> {
            Err(GraphError::InvalidTask {
                task: "broken".into(),
                reason: "no signature".into(),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn runs_descriptors_from_a_provider() {
        let flow = Flow::builder("convert")
            .param(Celsius(100.0))
            .result::<Fahrenheit>()
            .tasks_from(&Converters)
            .build()
            .unwrap();

        let values = flow.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(values.get::<Fahrenheit>(), Some(&Fahrenheit(212.0)));
        assert_eq!(flow.graph().len(), 1);
    }

    #[test]
    fn provider_errors_are_reported_with_graph_errors() {
        let err = Flow::builder("broken")
            .tasks_from(&Broken)
            .result::<Fahrenheit>()
            .build()
            .unwrap_err();
        assert_eq!(err.len(), 2, "{err}");
        assert!(err.any(GraphError::is_missing_provider));
    }

    #[test]
    fn continue_on_error_is_rejected() {
        let err = Flow::builder("strict")
            .param(Celsius(1.0))
            .result::<Celsius>()
            .config(SchedulerConfig::default().with_continue_on_error(true))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("only supported by parallel"), "{err}");
    }

    #[tokio::test]
    async fn parameters_can_be_results() {
        let flow = Flow::builder("echo")
            .params(ParamSet::new().with(Celsius(3.0)))
            .result::<Celsius>()
            .build()
            .unwrap();
        let values = flow.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(values.cloned::<Celsius>(), Some(Celsius(3.0)));
    }
}
