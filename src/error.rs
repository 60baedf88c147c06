#[cfg(feature = "live")]
use std::sync::mpsc::{RecvError, SendError};

pub use anyhow::Error as ActionError;
use thiserror::Error;

/// Errors in the task wiring itself. All of these are detected while the
/// blueprint is sealed, before any task action has run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("task '{0}' is registered more than once")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("task dependency cycle involving '{0}'")]
    Cycle(String),

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("couldn't compile watch pattern of task '{task}'\n{source}")]
    WatchPattern {
        task: String,
        source: glob::PatternError,
    },

    #[error("couldn't read project manifest '{path}'\n{source}")]
    ManifestRead {
        path: camino::Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("couldn't parse project manifest '{path}'\n{source}")]
    ManifestParse {
        path: camino::Utf8PathBuf,
        source: serde_json::Error,
    },
}

/// A single task whose action returned an error, or which inherited a
/// failure from one of its prerequisites.
#[derive(Debug, Error)]
#[error("task '{id}'\n{cause}")]
pub struct TaskFailure {
    pub id: String,
    #[source]
    pub cause: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{} task(s) failed", .0.len())]
    Tasks(Vec<TaskFailure>),
}

impl BuildError {
    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            BuildError::Config(_) => &[],
            BuildError::Tasks(failures) => failures,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("couldn't read input '{path}'\n{source}")]
    Read {
        path: camino::Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("couldn't write output '{path}'\n{source}")]
    Write {
        path: camino::Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("couldn't compile glob pattern\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("couldn't run glob\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("couldn't convert path to UTF-8\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("transform failed on '{path}'\n{source}")]
    Tool {
        path: camino::Utf8PathBuf,
        source: anyhow::Error,
    },
}

/// The bundler could not locate or read an entry file declared (or implied)
/// by a dependency's own manifest.
#[derive(Debug, Error)]
#[error("couldn't resolve entry '{entry}' of dependency '{dependency}'")]
pub struct UnresolvedEntry {
    pub dependency: String,
    pub entry: camino::Utf8PathBuf,
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error(transparent)]
    Unresolved(#[from] UnresolvedEntry),

    #[error("couldn't read manifest of dependency '{dependency}'\n{source}")]
    DependencyManifest {
        dependency: String,
        source: anyhow::Error,
    },

    #[error("bundling '{entry}' of dependency '{dependency}' failed\n{source}")]
    Tool {
        dependency: String,
        entry: camino::Utf8PathBuf,
        source: anyhow::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure of one platform's packaging invocation. Independent platforms
/// may still have been attempted.
#[derive(Debug, Error)]
#[error("packaging for '{platform}' failed\n{diagnostics}")]
pub struct PackagingError {
    pub platform: String,
    pub diagnostics: String,
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Recv(#[from] RecvError),

    #[error(transparent)]
    Send(#[from] SendError<()>),

    #[error("managed process is not running")]
    NotRunning,

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Top level error for the whole pipeline.
#[derive(Debug, Error)]
pub enum KarakuriError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("error while building\n{0}")]
    Build(#[from] BuildError),

    #[error("error while cleaning generated directories\n{0}")]
    Clean(std::io::Error),

    #[error("packaging failed for {} platform(s)", .0.len())]
    Packaging(Vec<PackagingError>),

    #[cfg(feature = "live")]
    #[error("error while watching for file changes\n{0}")]
    Watch(#[from] WatchError),
}
