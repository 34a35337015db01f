use crate::graph::Graph;
use crate::provider::ProviderRegistry;
use crate::{EngineError, Location, Result, Session};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Graph optimization level
///
/// Recorded and reported by the session; no graph rewrites are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    Disabled,
    Basic,
    #[default]
    Extended,
}

impl fmt::Display for OptimizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationLevel::Disabled => write!(f, "disabled"),
            OptimizationLevel::Basic => write!(f, "basic"),
            OptimizationLevel::Extended => write!(f, "extended"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Steps run one by one in plan order
    #[default]
    Sequential,
    /// Independent CPU steps run on the intra-op pool
    Parallel,
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_profile_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Session configuration, loadable from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionOptions {
    /// Provider names, highest priority first. Empty means every registered
    /// provider in registration order.
    pub providers: Vec<String>,
    pub optimization_level: OptimizationLevel,
    pub execution_mode: ExecutionMode,
    pub intra_op_threads: usize,
    /// Preferred location per graph output, host when absent
    pub output_locations: BTreeMap<String, Location>,
    pub enable_profiling: bool,
    pub profile_dir: PathBuf,
    pub run_timeout_ms: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            providers: Vec::new(),
            optimization_level: OptimizationLevel::default(),
            execution_mode: ExecutionMode::default(),
            intra_op_threads: default_threads(),
            output_locations: BTreeMap::new(),
            enable_profiling: false,
            profile_dir: default_profile_dir(),
            run_timeout_ms: None,
        }
    }
}

impl SessionOptions {
    /// # Errors
    /// Returns `Configuration` for malformed JSON or unknown fields
    pub fn from_json(json: &str) -> Result<SessionOptions> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::configuration(format!("invalid session options: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<SessionOptions> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EngineError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        SessionOptions::from_json(&json)
    }

    /// Checks that need no graph
    pub(crate) fn validate(&self) -> Result<()> {
        if self.intra_op_threads == 0 {
            return Err(EngineError::configuration(
                "intra_op_threads must be at least 1",
            ));
        }
        if self.run_timeout_ms == Some(0) {
            return Err(EngineError::configuration("run_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Builder for configuring sessions
pub struct SessionBuilder<'a> {
    registry: &'a ProviderRegistry,
    options: SessionOptions,
}

impl<'a> SessionBuilder<'a> {
    pub(crate) fn new(registry: &'a ProviderRegistry) -> Self {
        SessionBuilder {
            registry,
            options: SessionOptions::default(),
        }
    }

    /// Append a provider to the priority list
    pub fn with_provider(mut self, name: &str) -> Self {
        self.options.providers.push(name.to_string());
        self
    }

    pub fn with_optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.options.optimization_level = level;
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.options.execution_mode = mode;
        self
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.options.intra_op_threads = threads;
        self
    }

    /// Deliver output `name` at `location`
    pub fn with_output_location(mut self, name: &str, location: Location) -> Self {
        self.options
            .output_locations
            .insert(name.to_string(), location);
        self
    }

    /// Enable profiling, writing the profile to `dir`
    pub fn with_profiling(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.enable_profiling = true;
        self.options.profile_dir = dir.into();
        self
    }

    pub fn with_run_timeout(mut self, timeout_ms: u64) -> Self {
        self.options.run_timeout_ms = Some(timeout_ms);
        self
    }

    /// Replace every option at once
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Partition, plan and materialize constants for `graph`
    ///
    /// # Errors
    /// Returns `Configuration` for bad options, unassignable nodes and
    /// missing or ambiguous kernels; no partial session is returned.
    pub fn commit(self, graph: Graph) -> Result<Session> {
        Session::new(graph, self.registry, self.options)
    }
}
