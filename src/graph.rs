//! The generic task graph engine.
//!
//! Build steps are registered on a [`Blueprint`] under unique string ids,
//! together with the ids of their prerequisites. Sealing the blueprint
//! validates the wiring (duplicate ids, unknown prerequisites, cycles) and
//! produces an executable [`TaskGraph`]. Validation happens entirely before
//! any action runs, so a misconfigured graph never leaves partial side
//! effects on disk.
//!
//! Execution is parallel across independent branches: a task is spawned on
//! the worker pool as soon as every prerequisite has reported success. Each
//! task runs at most once per invocation, and a failed task causes its
//! transitive dependents to be skipped while unrelated subtrees keep
//! running (unless the caller asked for a full abort).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use crossbeam_channel::unbounded;
use glob::Pattern;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use crate::Environment;
use crate::error::{BuildError, ConfigError, TaskFailure};

/// A unit of work producing success or failure. Actions typically perform
/// file I/O; the engine itself only keeps completion bookkeeping.
pub type Action = Box<dyn Fn(&Environment) -> anyhow::Result<()> + Send + Sync>;

struct TaskSpec {
    id: String,
    prerequisites: Vec<String>,
    watched: Vec<String>,
    action: Action,
}

struct Node {
    id: String,
    watched: Vec<Pattern>,
    action: Action,
}

/// Builder for a [`TaskGraph`]. Registration order is preserved for error
/// reporting, but execution order is derived from the dependency edges.
#[derive(Default)]
pub struct Blueprint {
    tasks: Vec<TaskSpec>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under a unique id with the given prerequisites.
    pub fn add_task<F>(self, id: &str, prerequisites: &[&str], action: F) -> Self
    where
        F: Fn(&Environment) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_watched_task(id, prerequisites, &[], action)
    }

    /// Register a task which additionally declares the source globs it
    /// consumes. In watch mode the task is re-run whenever a matching file
    /// changes.
    pub fn add_watched_task<F>(
        mut self,
        id: &str,
        prerequisites: &[&str],
        watched: &[&str],
        action: F,
    ) -> Self
    where
        F: Fn(&Environment) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.tasks.push(TaskSpec {
            id: id.to_string(),
            prerequisites: prerequisites.iter().map(|s| s.to_string()).collect(),
            watched: watched.iter().map(|s| s.to_string()).collect(),
            action: Box::new(action),
        });
        self
    }

    /// Validate the wiring and produce an executable graph. Duplicate ids,
    /// unknown prerequisites, invalid watch globs and dependency cycles are
    /// all rejected here, before anything executes.
    pub fn seal(self) -> Result<TaskGraph, ConfigError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        let mut edges = Vec::new();
        for spec in self.tasks {
            if index.contains_key(&spec.id) {
                return Err(ConfigError::DuplicateTask(spec.id));
            }

            let watched = spec
                .watched
                .iter()
                .map(|pattern| Pattern::new(pattern))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| ConfigError::WatchPattern {
                    task: spec.id.clone(),
                    source,
                })?;

            let node = graph.add_node(Arc::new(Node {
                id: spec.id.clone(),
                watched,
                action: spec.action,
            }));

            index.insert(spec.id, node);
            edges.push((node, spec.prerequisites));
        }

        for (node, prerequisites) in edges {
            for prerequisite in prerequisites {
                let Some(&dep) = index.get(&prerequisite) else {
                    return Err(ConfigError::UnknownDependency {
                        task: graph[node].id.clone(),
                        dependency: prerequisite,
                    });
                };
                // Edge direction: prerequisite -> dependent.
                graph.add_edge(dep, node, ());
            }
        }

        toposort(&graph, None)
            .map_err(|cycle| ConfigError::Cycle(graph[cycle.node_id()].id.clone()))?;

        Ok(TaskGraph { graph, index })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

/// A sealed, validated task graph.
pub struct TaskGraph {
    graph: DiGraph<Arc<Node>, ()>,
    index: HashMap<String, NodeIndex>,
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("ids", &self.ids().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskGraph {
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|node| node.id.as_str())
    }

    /// Ids of every task whose watched globs match the given path. The path
    /// is expected to be relative to the project root, like the globs.
    pub fn tasks_watching(&self, path: &Utf8Path) -> Vec<&str> {
        self.graph
            .node_weights()
            .filter(|node| {
                node.watched
                    .iter()
                    .any(|pattern| pattern.matches_path(path.as_std_path()))
            })
            .map(|node| node.id.as_str())
            .collect()
    }

    /// Run a single named task after its transitive prerequisites.
    pub fn run(&self, id: &str, env: &Environment) -> Result<(), BuildError> {
        self.run_many(&[id], env)
    }

    /// Run several named tasks, sharing one completion table: a prerequisite
    /// common to multiple targets executes exactly once.
    pub fn run_many(&self, ids: &[&str], env: &Environment) -> Result<(), BuildError> {
        self.run_many_with(ids, env, false)
    }

    /// Like [`TaskGraph::run_many`], with an optional full-build abort: when
    /// `fail_fast` is set, the first failure stops spawning any further
    /// tasks, including unrelated subtrees. Tasks already in flight run to
    /// completion either way.
    pub fn run_many_with(
        &self,
        ids: &[&str],
        env: &Environment,
        fail_fast: bool,
    ) -> Result<(), BuildError> {
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            match self.index.get(*id) {
                Some(&node) => targets.push(node),
                None => return Err(ConfigError::UnknownTask(id.to_string()).into()),
            }
        }

        let required = self.required(&targets);
        self.run_nodes(env, &required, fail_fast)
    }

    /// Run every registered task.
    pub fn run_all(&self, env: &Environment) -> Result<(), BuildError> {
        let all: HashSet<NodeIndex> = self.graph.node_indices().collect();
        self.run_nodes(env, &all, false)
    }

    /// The targets plus all their transitive prerequisites.
    fn required(&self, targets: &[NodeIndex]) -> HashSet<NodeIndex> {
        let reversed = Reversed(&self.graph);
        let mut required = HashSet::new();

        for &target in targets {
            let mut dfs = Dfs::new(reversed, target);
            while let Some(node) = dfs.next(reversed) {
                required.insert(node);
            }
        }

        required
    }

    /// Execute a set of nodes with a worker pool. Tasks are spawned as soon
    /// as their dependencies within the set are met; results come back over
    /// a channel and unlock dependents. The completion table lives only for
    /// the duration of one invocation.
    fn run_nodes(
        &self,
        env: &Environment,
        nodes_to_run: &HashSet<NodeIndex>,
        fail_fast: bool,
    ) -> Result<(), BuildError> {
        let total = nodes_to_run.len() as u64;
        if total == 0 {
            return Ok(());
        }

        let started = Instant::now();

        // Map from a prerequisite to the nodes that depend on it.
        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in self.graph.raw_edges() {
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }

        // A dependency only counts if it is also part of this invocation.
        let mut waiting: HashMap<NodeIndex, usize> = nodes_to_run
            .iter()
            .map(|&node| {
                let count = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .filter(|dep| nodes_to_run.contains(dep))
                    .count();
                (node, count)
            })
            .collect();

        let mp = MultiProgress::new();
        let main_pb = mp.add(ProgressBar::new(total));
        main_pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("invalid progress bar template")
                .progress_chars("#>-"),
        );
        main_pb.set_message("Running tasks...");

        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.blue} {msg}")
            .expect("invalid progress bar template");

        let (result_tx, result_rx) = unbounded::<(NodeIndex, anyhow::Result<()>)>();

        let mut settled: HashMap<NodeIndex, Outcome> = HashMap::new();
        let mut in_flight: usize = 0;
        let mut failures: Vec<TaskFailure> = Vec::new();
        let mut aborted = false;

        rayon::scope(|s| {
            let spawn_task = |node: NodeIndex, in_flight: &mut usize| {
                let task = self.graph[node].clone();
                let sender = result_tx.clone();
                let mp = mp.clone();
                let style = spinner_style.clone();
                *in_flight += 1;

                s.spawn(move |_| {
                    let pb = mp.add(ProgressBar::new_spinner());
                    pb.set_style(style);
                    pb.set_message(task.id.clone());
                    pb.enable_steady_tick(Duration::from_millis(100));

                    let result = (task.action)(env);

                    pb.finish_and_clear();
                    sender.send((node, result)).unwrap();
                });
            };

            for &node in nodes_to_run {
                if waiting.get(&node).copied().unwrap_or(0) == 0 {
                    spawn_task(node, &mut in_flight);
                }
            }

            while (settled.len() as u64) < total {
                if in_flight == 0 {
                    // Nothing is running and nothing can be unlocked anymore;
                    // everything left was cut off by a failure.
                    for &node in nodes_to_run {
                        settled.entry(node).or_insert(Outcome::Skipped);
                    }
                    break;
                }

                let (node, result) = result_rx.recv().unwrap();
                in_flight -= 1;
                main_pb.inc(1);

                match result {
                    Ok(()) => {
                        settled.insert(node, Outcome::Succeeded);

                        if aborted {
                            continue;
                        }

                        if let Some(next) = dependents.get(&node) {
                            for &dependent in next {
                                if settled.contains_key(&dependent) {
                                    continue;
                                }
                                if let Some(count) = waiting.get_mut(&dependent) {
                                    *count -= 1;
                                    if *count == 0 {
                                        spawn_task(dependent, &mut in_flight);
                                    }
                                }
                            }
                        }
                    }
                    Err(cause) => {
                        let id = self.graph[node].id.clone();
                        tracing::error!("task '{id}' failed: {cause:#}");

                        settled.insert(node, Outcome::Failed);
                        failures.push(TaskFailure { id, cause });

                        // Everything downstream of the failure is skipped.
                        let mut dfs = Dfs::new(&self.graph, node);
                        while let Some(next) = dfs.next(&self.graph) {
                            if next != node
                                && nodes_to_run.contains(&next)
                                && !settled.contains_key(&next)
                            {
                                settled.insert(next, Outcome::Skipped);
                                main_pb.inc(1);
                            }
                        }

                        if fail_fast {
                            aborted = true;
                        }
                    }
                }
            }
        });

        main_pb.finish_with_message(format!(
            "Finished tasks {}",
            crate::io::as_overhead(started)
        ));

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Tasks(failures))
        }
    }
}
