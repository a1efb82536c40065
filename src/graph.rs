//! Graph builder: wires task descriptors together by type and validates
//! the result.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::cycle_check::{DepEdge, find_cycles};
use crate::{
    CycleStep, GraphError, GraphErrors, ParamSet, Provider, ResultSet, TaskDescriptor, TypeKey,
};

/// Index of a task inside a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

/// Where a type comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Producer {
    Param,
    Task(TaskId),
}

/// `consumer` needs `key`, which `producer` provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEdge {
    pub consumer: TaskId,
    pub producer: Producer,
    pub key: TypeKey,
}

/// A validated, acyclic task graph.
///
/// Only [`build_graph`] creates graphs, so holding one means validation
/// passed.
#[derive(Debug, Clone)]
pub struct Graph {
    tasks: Vec<Arc<TaskDescriptor>>,
    edges: Vec<DependencyEdge>,
    providers: HashMap<TypeKey, Producer>,
    params: Vec<TypeKey>,
    results: Vec<TypeKey>,
    dependencies: Vec<Vec<TaskId>>,
    dependents: Vec<Vec<TaskId>>,
    order: Vec<TaskId>,
}

impl Graph {
    pub fn tasks(&self) -> &[Arc<TaskDescriptor>] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> &Arc<TaskDescriptor> {
        &self.tasks[id.0]
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn params(&self) -> &[TypeKey] {
        &self.params
    }

    pub fn results(&self) -> &[TypeKey] {
        &self.results
    }

    /// Tasks `id` has to wait for, without duplicates.
    pub fn dependencies_of(&self, id: TaskId) -> &[TaskId] {
        &self.dependencies[id.0]
    }

    /// Tasks waiting for `id`.
    pub fn dependents_of(&self, id: TaskId) -> &[TaskId] {
        &self.dependents[id.0]
    }

    pub fn provider_of(&self, key: &TypeKey) -> Option<Producer> {
        self.providers.get(key).copied()
    }

    /// A topological order: every task comes after all of its
    /// dependencies.
    pub fn topological_order(&self) -> &[TaskId] {
        &self.order
    }

    fn fmt_chain(&self, f: &mut fmt::Formatter<'_>, id: TaskId, prefix: &str) -> fmt::Result {
        for &child in self.dependents_of(id) {
            writeln!(f, "{}└─> {}", prefix, self.task(child).name())?;
            self.fmt_chain(f, child, &format!("{prefix}    "))?;
        }
        Ok(())
    }
}

/// Renders every root task followed by the chains of tasks waiting on it.
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, deps) in self.dependencies.iter().enumerate() {
            if !deps.is_empty() {
                continue;
            }
            let root = TaskId(i);
            writeln!(f, "{}", self.task(root).name())?;
            self.fmt_chain(f, root, "  ")?;
        }
        Ok(())
    }
}

/// Builds and validates the dependency graph of `tasks`.
///
/// Every problem is collected; the error lists all of them.
pub fn build_graph(
    tasks: Vec<TaskDescriptor>,
    params: &ParamSet,
    results: &ResultSet,
) -> Result<Graph, GraphErrors> {
    let tasks: Vec<Arc<TaskDescriptor>> = tasks.into_iter().map(Arc::new).collect();
    let mut errors = Vec::new();

    for task in &tasks {
        errors.extend(task.validate());
    }

    // Produced type -> single producer.
    let mut providers: HashMap<TypeKey, Producer> = HashMap::new();
    let mut param_keys = Vec::new();
    for key in params.keys() {
        if providers.insert(key, Producer::Param).is_some() {
            errors.push(GraphError::DuplicateProvider {
                key,
                first: Provider::Param,
                second: Provider::Param,
            });
            continue;
        }
        param_keys.push(key);
    }

    for (i, task) in tasks.iter().enumerate() {
        for &key in task.outputs() {
            match providers.get(&key) {
                None => {
                    providers.insert(key, Producer::Task(TaskId(i)));
                }
                Some(Producer::Param) => errors.push(GraphError::AlreadyProvided {
                    key,
                    task: task.name().to_string(),
                }),
                Some(Producer::Task(first)) if first.0 == i => {
                    // Declared twice by the same task; reported by validate().
                }
                Some(Producer::Task(first)) => errors.push(GraphError::DuplicateProvider {
                    key,
                    first: Provider::Task(tasks[first.0].name().to_string()),
                    second: Provider::Task(task.name().to_string()),
                }),
            }
        }
    }

    // Resolve every input, including predicate inputs.
    let mut edges = Vec::new();
    let mut task_deps: Vec<Vec<DepEdge>> = vec![Vec::new(); tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        for key in task.dependencies() {
            match providers.get(&key) {
                Some(&producer) => {
                    edges.push(DependencyEdge {
                        consumer: TaskId(i),
                        producer,
                        key,
                    });
                    if let Producer::Task(p) = producer {
                        task_deps[i].push((p.0, key));
                    }
                }
                None => errors.push(GraphError::MissingProvider {
                    key,
                    consumer: format!("task {:?}", task.name()),
                }),
            }
        }
    }

    for &key in results.keys() {
        if !providers.contains_key(&key) {
            errors.push(GraphError::MissingProvider {
                key,
                consumer: "flow results".to_string(),
            });
        }
    }

    for cycle in find_cycles(&task_deps) {
        errors.push(GraphError::Cycle {
            path: cycle
                .into_iter()
                .map(|(task, key)| CycleStep {
                    task: tasks[task].name().to_string(),
                    provides: key,
                })
                .collect(),
        });
    }

    // Walk backwards from the results and the invoked tasks.
    let mut reached = vec![false; tasks.len()];
    let mut used_params = HashSet::new();
    let mut queue = VecDeque::new();
    for key in results.keys() {
        match providers.get(key) {
            Some(Producer::Task(id)) => queue.push_back(*id),
            Some(Producer::Param) => {
                used_params.insert(*key);
            }
            None => {}
        }
    }
    for (i, task) in tasks.iter().enumerate() {
        if task.invoke() {
            queue.push_back(TaskId(i));
        }
    }
    while let Some(id) = queue.pop_front() {
        if reached[id.0] {
            continue;
        }
        reached[id.0] = true;
        for edge in edges.iter().filter(|e| e.consumer == id) {
            match edge.producer {
                Producer::Task(p) => queue.push_back(p),
                Producer::Param => {
                    used_params.insert(edge.key);
                }
            }
        }
    }

    let consumed: HashSet<TypeKey> = edges
        .iter()
        .map(|e| e.key)
        .chain(results.keys().iter().copied())
        .collect();
    for (i, task) in tasks.iter().enumerate() {
        if !reached[i] {
            errors.push(GraphError::UnusedOutput {
                task: task.name().to_string(),
                outputs: task
                    .outputs()
                    .iter()
                    .filter(|k| !consumed.contains(*k))
                    .copied()
                    .collect(),
            });
        }
    }
    for key in &param_keys {
        if !used_params.contains(key) {
            errors.push(GraphError::UnusedInput { key: *key });
        }
    }

    if !errors.is_empty() {
        debug!(errors = errors.len(), "graph validation failed");
        return Err(GraphErrors::new(errors));
    }

    let mut dependencies: Vec<Vec<TaskId>> = vec![Vec::new(); tasks.len()];
    let mut dependents: Vec<Vec<TaskId>> = vec![Vec::new(); tasks.len()];
    for (i, deps) in task_deps.iter().enumerate() {
        for &(p, _) in deps {
            let p = TaskId(p);
            if !dependencies[i].contains(&p) {
                dependencies[i].push(p);
                dependents[p.0].push(TaskId(i));
            }
        }
    }

    let order = topological_order(&dependencies, &dependents);
    debug!(
        tasks = tasks.len(),
        edges = edges.len(),
        "graph validated"
    );

    Ok(Graph {
        tasks,
        edges,
        providers,
        params: param_keys,
        results: results.keys().to_vec(),
        dependencies,
        dependents,
        order,
    })
}

/// Kahn's algorithm over an acyclic graph, lowest index first among ready
/// tasks.
fn topological_order(dependencies: &[Vec<TaskId>], dependents: &[Vec<TaskId>]) -> Vec<TaskId> {
    let mut in_degrees: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: VecDeque<TaskId> = in_degrees
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| TaskId(i))
        .collect();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        for &child in &dependents[id.0] {
            in_degrees[child.0] -= 1;
            if in_degrees[child.0] == 0 {
                ready.push_back(child);
            }
        }
    }
    order
}
