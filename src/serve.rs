//! The dev server / watch orchestrator.
//!
//! While the managed process runs, the orchestrator watches three
//! independent groups of files:
//!
//! 1. Sources matched by a task's watch globs re-run that task.
//! 2. Process-level resources (the top-level entry script and the browser
//!    process tree) restart the managed process.
//! 3. UI-level resources (compiled stylesheets, renderer markup and
//!    scripts) reload the process's rendered view without a relaunch.
//!
//! No two transitions run concurrently. Change events arriving while a
//! transition is in flight are queued, and pending events of the same
//! group coalesce, so a burst of rapid saves produces at most one
//! restart or reload per settle period. The settle period is the
//! debouncer's window and is a configuration option.
//!
//! The restart/reload decision is a pure function of the current state
//! and the coalesced pending groups ([`plan_effects`]), which keeps the
//! orchestration testable without a real process.

use std::collections::BTreeSet;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use notify::RecursiveMode;
use notify_debouncer_full::new_debouncer;

use crate::error::WatchError;
use crate::graph::TaskGraph;
use crate::process::AppProcess;
use crate::{Environment, Mode};

/// Lifecycle of the managed dev session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Reloading,
}

/// Coalesced pending changes, one slot per trigger group. Merging two
/// batches of the same group leaves a single pending action.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Pending {
    /// Tasks whose watched sources changed.
    pub tasks: BTreeSet<String>,
    /// A process-level resource changed.
    pub restart: bool,
    /// A UI-level resource changed.
    pub reload: bool,
}

impl Pending {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && !self.restart && !self.reload
    }

    pub fn merge(&mut self, other: Pending) {
        self.tasks.extend(other.tasks);
        self.restart |= other.restart;
        self.reload |= other.reload;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Effect {
    RunTasks(Vec<String>),
    Restart,
    Reload,
}

/// Decide what one coalesced batch of changes does. Task re-runs come
/// first so restarted or reloaded views pick up fresh output. A restart
/// subsumes a reload from the same batch, since the relaunch re-renders
/// the view anyway.
pub fn plan_effects(state: ServerState, pending: &Pending) -> Vec<Effect> {
    if state != ServerState::Running {
        return Vec::new();
    }

    let mut effects = Vec::new();

    if !pending.tasks.is_empty() {
        effects.push(Effect::RunTasks(pending.tasks.iter().cloned().collect()));
    }

    if pending.restart {
        effects.push(Effect::Restart);
    } else if pending.reload {
        effects.push(Effect::Reload);
    }

    effects
}

/// Patterns for the restart and reload trigger groups, matched against
/// paths relative to the project root. Task triggers come from the
/// graph's own watch globs.
pub struct WatchTriggers {
    pub restart: Vec<Pattern>,
    pub reload: Vec<Pattern>,
}

impl WatchTriggers {
    /// Sort one changed path into the pending groups.
    fn classify(&self, path: &Utf8Path, graph: &TaskGraph, pending: &mut Pending) {
        for id in graph.tasks_watching(path) {
            pending.tasks.insert(id.to_string());
        }
        if matches(&self.restart, path) {
            pending.restart = true;
        }
        if matches(&self.reload, path) {
            pending.reload = true;
        }
    }
}

fn matches(patterns: &[Pattern], path: &Utf8Path) -> bool {
    patterns
        .iter()
        .any(|pattern| pattern.matches_path(path.as_std_path()))
}

/// Serializes transitions: one coalesced batch in, effects applied one at
/// a time, state back to `Running` afterwards. A failed transition is
/// logged and the session stays alive, so a corrected save can retry.
pub struct Orchestrator<'a> {
    graph: &'a TaskGraph,
    env: Environment,
    process: &'a mut dyn AppProcess,
    state: ServerState,
}

impl<'a> Orchestrator<'a> {
    pub fn new(graph: &'a TaskGraph, process: &'a mut dyn AppProcess) -> Self {
        Self {
            graph,
            env: Environment { mode: Mode::Watch },
            process,
            state: ServerState::Stopped,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn start(&mut self, load_root: &Utf8Path) -> Result<(), WatchError> {
        self.state = ServerState::Starting;
        self.process.start(load_root)?;
        self.state = ServerState::Running;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), WatchError> {
        self.process.stop()?;
        self.state = ServerState::Stopped;
        Ok(())
    }

    /// Apply one coalesced batch. Errors don't tear the session down.
    pub fn apply(&mut self, pending: Pending) {
        for effect in plan_effects(self.state, &pending) {
            match effect {
                Effect::RunTasks(ids) => {
                    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
                    if let Err(e) = self.graph.run_many(&ids, &self.env) {
                        tracing::error!("rebuild failed: {e}");
                    }
                }
                Effect::Restart => {
                    self.state = ServerState::Restarting;
                    match self.process.restart() {
                        Ok(()) => tracing::info!("process restarted"),
                        Err(e) => tracing::error!("restart failed: {e}"),
                    }
                    self.state = ServerState::Running;
                }
                Effect::Reload => {
                    self.state = ServerState::Reloading;
                    match self.process.reload() {
                        Ok(()) => tracing::info!("view reloaded"),
                        Err(e) => tracing::error!("reload failed: {e}"),
                    }
                    self.state = ServerState::Running;
                }
            }
        }
    }
}

pub struct ServeOptions {
    /// Coalescing window for file change events.
    pub debounce: Duration,
    /// Directories (and single files) to watch, with their recursion mode.
    pub roots: Vec<(Utf8PathBuf, RecursiveMode)>,
}

/// Run the watch session: start the managed process on the staging root,
/// then loop over debounced change batches until the watcher goes away.
pub fn serve(
    graph: &TaskGraph,
    project_root: &Utf8Path,
    load_root: &Utf8Path,
    triggers: &WatchTriggers,
    process: &mut dyn AppProcess,
    options: &ServeOptions,
) -> Result<(), WatchError> {
    let mut orchestrator = Orchestrator::new(graph, process);
    orchestrator.start(load_root)?;

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(options.debounce, None, tx)?;

    for (root, mode) in &options.roots {
        if root.exists() {
            tracing::info!("watching {root}");
            debouncer.watch(root.as_std_path(), *mode)?;
        }
    }

    while let Ok(batch) = rx.recv() {
        let mut pending = Pending::default();
        collect(batch, project_root, graph, triggers, &mut pending);

        // Anything that arrived while we were waiting coalesces into the
        // same batch; the transition below runs once per settle period.
        while let Ok(batch) = rx.try_recv() {
            collect(batch, project_root, graph, triggers, &mut pending);
        }

        if pending.is_empty() {
            continue;
        }

        tracing::debug!("coalesced changes: {pending:?}");
        orchestrator.apply(pending);
    }

    orchestrator.stop()?;
    Ok(())
}

type DebounceBatch =
    Result<Vec<notify_debouncer_full::DebouncedEvent>, Vec<notify::Error>>;

fn collect(
    batch: DebounceBatch,
    project_root: &Utf8Path,
    graph: &TaskGraph,
    triggers: &WatchTriggers,
    pending: &mut Pending,
) {
    let events = match batch {
        Ok(events) => events,
        Err(errors) => {
            for e in errors {
                tracing::error!("watch error: {e}");
            }
            return;
        }
    };

    for event in events {
        for path in &event.event.paths {
            let rel = path.strip_prefix(project_root.as_std_path()).unwrap_or(path);
            let Some(rel) = Utf8Path::from_path(rel) else {
                tracing::error!("non UTF-8 path: {}", path.display());
                continue;
            };
            triggers.classify(rel, graph, pending);
        }
    }
}
