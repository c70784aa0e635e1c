use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, Reversed};

use crate::core::Dynamic;
use crate::engine::{TaskAction, TaskContext, TaskDefinition};
use crate::error::{CycleError, GraphError};

enum DefKind {
    Define,
    Override,
}

/// Collects task definitions and overrides before the graph is frozen.
///
/// Errors found while defining tasks are held back and reported by
/// [`finalize`](Self::finalize), so plugins can register in one pass.
#[derive(Default)]
pub struct TaskGraphBuilder {
    tasks: Vec<Arc<TaskDefinition>>,
    errors: Vec<GraphError>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts defining a new task.
    pub fn define(&mut self, name: impl Into<String>) -> TaskDef<'_> {
        TaskDef {
            builder: self,
            kind: DefKind::Define,
            name: name.into(),
            description: None,
            dependencies: None,
        }
    }

    /// Starts redefining an existing task. The new action can reach the
    /// replaced one through [`TaskContext::run_super`]. Description and
    /// dependencies are inherited unless set.
    pub fn override_task(&mut self, name: impl Into<String>) -> TaskDef<'_> {
        TaskDef {
            builder: self,
            kind: DefKind::Override,
            name: name.into(),
            description: None,
            dependencies: None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.name == name)
    }

    /// Checks every dependency and the absence of cycles, and freezes the
    /// graph.
    pub fn finalize(self) -> Result<TaskGraph, GraphError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }

        let mut graph = Graph::new();
        let mut index = HashMap::new();

        for task in &self.tasks {
            let node = graph.add_node(task.clone());
            index.insert(task.name.clone(), node);
        }

        for task in &self.tasks {
            let target = index[&task.name];
            for dependency in &task.dependencies {
                let Some(&source) = index.get(dependency) else {
                    return Err(GraphError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dependency.clone(),
                    });
                };
                graph.update_edge(source, target, ());
            }
        }

        // A strongly connected component with more than one node, or a node
        // depending on itself, is a cycle.
        let cycle = petgraph::algo::tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|mut scc| {
                scc.sort();
                scc
            })
            .min();

        if let Some(scc) = cycle {
            return Err(CycleError {
                tasks: scc.into_iter().map(|n| graph[n].name.clone()).collect(),
            }
            .into());
        }

        tracing::debug!(tasks = graph.node_count(), edges = graph.edge_count(), "finalized task graph");

        Ok(TaskGraph { graph, index })
    }
}

/// Builder for a single task definition.
pub struct TaskDef<'a> {
    builder: &'a mut TaskGraphBuilder,
    kind: DefKind,
    name: String,
    description: Option<String>,
    dependencies: Option<Vec<String>>,
}

impl<'a> TaskDef<'a> {
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a dependency. On an override, the first call replaces the
    /// inherited dependency set.
    pub fn depends_on(mut self, task: impl Into<String>) -> Self {
        self.dependencies.get_or_insert_with(Vec::new).push(task.into());
        self
    }

    /// Sets the action and registers the definition.
    pub fn run<F, R>(self, action: F)
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let TaskDef {
            builder,
            kind,
            name,
            description,
            dependencies,
        } = self;

        let action: TaskAction = Arc::new(move |ctx: &TaskContext<'_>| {
            action(ctx).map(|output| Arc::new(output) as Dynamic)
        });

        match (kind, builder.position(&name)) {
            (DefKind::Define, Some(_)) => builder.errors.push(GraphError::DuplicateTask(name)),
            (DefKind::Define, None) => builder.tasks.push(Arc::new(TaskDefinition {
                name,
                description: description.unwrap_or_default(),
                dependencies: dependencies.unwrap_or_default(),
                action,
                prior: None,
            })),
            (DefKind::Override, None) => builder.errors.push(GraphError::OverrideUndefined(name)),
            (DefKind::Override, Some(i)) => {
                let prior = builder.tasks[i].clone();
                builder.tasks[i] = Arc::new(TaskDefinition {
                    name,
                    description: description.unwrap_or_else(|| prior.description.clone()),
                    dependencies: dependencies.unwrap_or_else(|| prior.dependencies.clone()),
                    action,
                    prior: Some(prior),
                });
            }
        }
    }
}

/// A finalized, acyclic task graph. Edges point from a dependency to its
/// dependents; node order is declaration order.
pub struct TaskGraph {
    pub(crate) graph: Graph<Arc<TaskDefinition>, ()>,
    index: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.index.get(name).map(|&i| &*self.graph[i])
    }

    pub(crate) fn node(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Every task with its description, in declaration order.
    pub fn list(&self) -> Vec<(&str, &str)> {
        self.graph
            .node_weights()
            .map(|t| (t.name.as_str(), t.description.as_str()))
            .collect()
    }

    /// The target and everything it depends on, dependencies first. Ties
    /// are broken by declaration order.
    pub fn closure_order(&self, target: &str) -> Result<Vec<NodeIndex>, GraphError> {
        let start = self
            .node(target)
            .ok_or_else(|| GraphError::UnknownTask(target.to_owned()))?;

        let mut closure = HashSet::new();
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        while let Some(node) = dfs.next(reversed) {
            closure.insert(node);
        }

        let mut remaining: HashMap<NodeIndex, usize> = closure
            .iter()
            .map(|&n| {
                let count = self
                    .graph
                    .neighbors_directed(n, Direction::Incoming)
                    .filter(|d| closure.contains(d))
                    .count();
                (n, count)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(&n, _)| Reverse(n))
            .collect();

        let mut order = Vec::with_capacity(closure.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(dependent));
                    }
                }
            }
        }

        Ok(order)
    }

    /// Names in [`closure_order`](Self::closure_order).
    pub fn plan(&self, target: &str) -> Result<Vec<&str>, GraphError> {
        Ok(self
            .closure_order(target)?
            .into_iter()
            .map(|n| self.graph[n].name.as_str())
            .collect())
    }
}
