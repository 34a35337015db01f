use crate::binding::{IoBinding, OutputBinding};
use crate::executor::{Executor, OutputRequest, PhaseCell, RunOutcome, RunPhase, RunRequest, RunStats};
use crate::graph::Graph;
use crate::options::{ExecutionMode, OptimizationLevel, SessionBuilder, SessionOptions};
use crate::partition::partition;
use crate::plan::{ExecutionPlan, build_plan};
use crate::planner::ValueId;
use crate::profiler::{ProfileEvent, Profiler};
use crate::provider::{Deadline, ExecutionProvider, ProviderRegistry};
use crate::{EngineError, Location, Result, Tensor};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Output requested from a run: plan output index, bound tensor, location override
type OutputSpec = (usize, Option<Tensor>, Option<Location>);

/// A graph prepared for repeated execution
///
/// Building a session partitions the graph over the selected providers,
/// plans every step and buffer, and copies initializers to where their
/// consumers read them. Runs reuse all of it. A session runs one request
/// at a time; a second concurrent run fails with `SessionBusy`.
pub struct Session {
    id: u64,
    graph: Graph,
    plan: ExecutionPlan,
    providers: Vec<Arc<dyn ExecutionProvider>>,
    constants: HashMap<ValueId, Tensor>,
    options: SessionOptions,
    phase: PhaseCell,
    /// Drives blocking runs, taken on drop
    runtime: Option<tokio::runtime::Runtime>,
    pool: Option<rayon::ThreadPool>,
    binding: Mutex<IoBinding>,
    profiler: Mutex<Profiler>,
    last_stats: Mutex<Option<RunStats>>,
}

impl Session {
    pub fn builder(registry: &ProviderRegistry) -> SessionBuilder<'_> {
        SessionBuilder::new(registry)
    }

    /// # Errors
    /// Returns a `Configuration`-class error for bad options or a graph the
    /// selected providers can't run. No partial session is returned.
    pub fn new(graph: Graph, registry: &ProviderRegistry, options: SessionOptions) -> Result<Session> {
        options.validate()?;
        for name in options.output_locations.keys() {
            if !graph.outputs().contains(name) {
                return Err(EngineError::configuration(format!(
                    "output location given for unknown output {}",
                    name
                )));
            }
        }

        let providers = registry.resolve(&options.providers)?;
        let preferred: HashMap<String, Location> = options
            .output_locations
            .iter()
            .map(|(name, location)| (name.clone(), *location))
            .collect();
        let partition = partition(&graph, &providers, &preferred)?;
        let plan = build_plan(&graph, &partition, &providers)?;

        let mut constants = HashMap::with_capacity(plan.constants.len());
        for constant in &plan.constants {
            let source = graph.initializer(&constant.initializer).ok_or_else(|| {
                EngineError::invalid_graph(format!("missing initializer {}", constant.initializer))
            })?;
            let tensor = match constant.provider {
                Some(provider) => providers[provider].transfer_tensor(source, constant.location)?,
                None => source.clone(),
            };
            constants.insert(constant.value, tensor);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| EngineError::configuration(format!("cannot start run driver: {}", e)))?;
        let pool = match options.execution_mode {
            ExecutionMode::Parallel => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(options.intra_op_threads)
                    .thread_name(|i| format!("ember-intra-{}", i))
                    .build()
                    .map_err(|e| {
                        EngineError::configuration(format!("cannot start intra-op pool: {}", e))
                    })?,
            ),
            ExecutionMode::Sequential => None,
        };

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "session {} built for graph {}: {} steps ({} transfers) on [{}], {} slots sharing {} bytes, optimization {}",
            id,
            graph.name(),
            plan.steps.len(),
            plan.transfer_count(),
            providers
                .iter()
                .map(|p| p.name())
                .collect::<Vec<_>>()
                .join(", "),
            plan.allocation.slots().len(),
            plan.allocation.shared_bytes(),
            options.optimization_level
        );

        let profiler = Profiler::new(options.enable_profiling, options.profile_dir.clone());
        Ok(Session {
            id,
            graph,
            plan,
            providers,
            constants,
            options,
            phase: PhaseCell::new(),
            runtime: Some(runtime),
            pool,
            binding: Mutex::new(IoBinding::default()),
            profiler: Mutex::new(profiler),
            last_stats: Mutex::new(None),
        })
    }

    /// Run the graph
    ///
    /// An empty `output_names` returns every graph output in declaration
    /// order. Use [`Session::run_async`] from async code.
    ///
    /// # Errors
    /// Returns `Configuration` when called inside an async runtime,
    /// `SessionBusy` while another run is in flight,
    /// `InvalidArgument` for unknown, missing or mismatched tensors, and the
    /// error of the failing step otherwise. The session stays usable.
    pub fn run(&self, inputs: &[(&str, &Tensor)], output_names: &[&str]) -> Result<Vec<Tensor>> {
        let runtime = self.blocking_runtime()?;
        let guard = self.phase.enter()?;
        let feeds = inputs.iter().map(|(name, t)| (name.to_string(), (*t).clone()));
        let request = self.prepare(feeds, self.output_specs(output_names)?)?;
        let outcome = runtime.block_on(self.executor().execute(request, &guard));
        self.complete(outcome)
    }

    /// Run writing outputs into caller tensors
    ///
    /// Each bound tensor must name one of `output_names` and is handed back
    /// in its output's position holding the result.
    ///
    /// # Errors
    /// As [`Session::run`]; a bound tensor of the wrong type or shape is
    /// `InvalidArgument`.
    pub fn run_with_bound_outputs(
        &self,
        inputs: &[(&str, &Tensor)],
        output_names: &[&str],
        bound: Vec<(&str, Tensor)>,
    ) -> Result<Vec<Tensor>> {
        let runtime = self.blocking_runtime()?;
        let guard = self.phase.enter()?;
        let mut specs = self.output_specs(output_names)?;
        for (name, tensor) in bound {
            let index = self.plan.output_index(name).ok_or_else(|| {
                EngineError::invalid_argument(format!("unknown output {}", name))
            })?;
            let spec = specs.iter_mut().find(|s| s.0 == index).ok_or_else(|| {
                EngineError::invalid_argument(format!("bound output {} was not requested", name))
            })?;
            self.check_output(name, &tensor)?;
            if !tensor.is_unique() {
                return Err(EngineError::invalid_argument(format!(
                    "tensor bound to output {} is shared, the run must own it",
                    name
                )));
            }
            spec.1 = Some(tensor);
        }
        let feeds = inputs.iter().map(|(name, t)| (name.to_string(), (*t).clone()));
        let request = self.prepare(feeds, specs)?;
        let outcome = runtime.block_on(self.executor().execute(request, &guard));
        self.complete(outcome)
    }

    /// [`Session::run`] awaited on the caller's runtime
    pub async fn run_async(
        &self,
        inputs: &[(&str, &Tensor)],
        output_names: &[&str],
    ) -> Result<Vec<Tensor>> {
        let guard = self.phase.enter()?;
        let feeds = inputs.iter().map(|(name, t)| (name.to_string(), (*t).clone()));
        let request = self.prepare(feeds, self.output_specs(output_names)?)?;
        let outcome = self.executor().execute(request, &guard).await;
        self.complete(outcome)
    }

    /// Run with the bound inputs and outputs
    ///
    /// Returns the bound outputs by name, or every graph output when none is
    /// bound. Bound output tensors are handed back and must be bound again
    /// for the next run to write into them.
    pub fn run_bound(&self) -> Result<Vec<(String, Tensor)>> {
        let runtime = self.blocking_runtime()?;
        let guard = self.phase.enter()?;
        let (feeds, bound) = self
            .binding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take_for_run();

        let mut names = Vec::with_capacity(bound.len());
        let mut specs = Vec::with_capacity(bound.len());
        if bound.is_empty() {
            for (index, output) in self.plan.outputs.iter().enumerate() {
                names.push(output.name.clone());
                specs.push((index, None, None));
            }
        } else {
            for (name, binding) in bound {
                let index = self.plan.output_index(&name).ok_or_else(|| {
                    EngineError::invalid_argument(format!("unknown output {}", name))
                })?;
                specs.push(match binding {
                    OutputBinding::Tensor(tensor) => (index, Some(tensor), None),
                    OutputBinding::Location(location) => (index, None, Some(location)),
                    OutputBinding::Preferred => (index, None, None),
                });
                names.push(name);
            }
        }

        let request = self.prepare(feeds.into_iter(), specs)?;
        let outcome = runtime.block_on(self.executor().execute(request, &guard));
        let outputs = self.complete(outcome)?;
        Ok(names.into_iter().zip(outputs).collect())
    }

    /// Bind an input for [`Session::run_bound`]
    ///
    /// Binding the same buffer at the same location again is a no-op.
    ///
    /// # Errors
    /// Returns `SessionBusy` while a run is in flight
    pub fn bind_input(&self, name: &str, tensor: Tensor) -> Result<()> {
        self.idle_binding()?
            .bind_input(name, tensor, |t| self.check_input(name, t))
    }

    /// Bind a tensor the output `name` is written into by the next run
    pub fn bind_output(&self, name: &str, tensor: Tensor) -> Result<()> {
        self.idle_binding()?
            .bind_output(name, tensor, |t| self.check_output(name, t))
    }

    /// Deliver output `name` freshly allocated at `location`
    pub fn bind_output_to_location(&self, name: &str, location: Location) -> Result<()> {
        if self.plan.output_index(name).is_none() {
            return Err(EngineError::invalid_argument(format!("unknown output {}", name)));
        }
        self.idle_binding()?.bind_output_to_location(name, location);
        Ok(())
    }

    pub fn clear_bindings(&self) -> Result<()> {
        self.idle_binding()?.clear();
        Ok(())
    }

    /// Binding state, writable only between runs
    ///
    /// Runs read the bindings under the same lock after leaving `Idle`.
    fn idle_binding(&self) -> Result<MutexGuard<'_, IoBinding>> {
        let binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
        if self.phase.get() != RunPhase::Idle {
            return Err(EngineError::SessionBusy);
        }
        Ok(binding)
    }

    /// Binds that reached validation, cache hits excluded
    pub fn native_bind_calls(&self) -> usize {
        self.binding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .native_bind_calls()
    }

    /// Write the profile and return its path
    ///
    /// # Errors
    /// Returns `Configuration` when profiling is off or already ended
    pub fn end_profiling(&self) -> Result<PathBuf> {
        self.profiler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .finish(self.id)
    }

    pub fn profile_events(&self) -> Vec<ProfileEvent> {
        self.profiler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events()
            .to_vec()
    }

    pub fn last_run_stats(&self) -> Option<RunStats> {
        self.last_stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Tear the session down, releasing its constants and device queues
    pub fn release(self) {
        log::info!("session {} released", self.id);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase.get()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn optimization_level(&self) -> OptimizationLevel {
        self.options.optimization_level
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.plan.inputs.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.plan.outputs.iter().map(|o| o.name.as_str()).collect()
    }

    /// Selected providers, highest priority first
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Runtime for blocking runs
    ///
    /// # Errors
    /// Returns `Configuration` when called from inside an async runtime,
    /// where blocking would stall that runtime's thread.
    fn blocking_runtime(&self) -> Result<&tokio::runtime::Runtime> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(EngineError::configuration(
                "blocking run called from inside an async runtime, use run_async",
            ));
        }
        self.runtime
            .as_ref()
            .ok_or_else(|| EngineError::configuration("session run driver is shut down"))
    }

    fn executor(&self) -> Executor<'_> {
        Executor {
            plan: &self.plan,
            providers: &self.providers,
            constants: &self.constants,
            pool: self.pool.as_ref(),
            deadline: self.options.run_timeout_ms.map(Deadline::after_ms),
            profile: self.profiler.lock().unwrap_or_else(|e| e.into_inner()).is_enabled(),
        }
    }

    fn output_specs(&self, output_names: &[&str]) -> Result<Vec<OutputSpec>> {
        if output_names.is_empty() {
            return Ok((0..self.plan.outputs.len()).map(|i| (i, None, None)).collect());
        }
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(output_names.len());
        for name in output_names {
            let index = self.plan.output_index(name).ok_or_else(|| {
                EngineError::invalid_argument(format!("unknown output {}", name))
            })?;
            if !seen.insert(index) {
                return Err(EngineError::invalid_argument(format!(
                    "output {} requested twice",
                    name
                )));
            }
            specs.push((index, None, None));
        }
        Ok(specs)
    }

    fn check_input(&self, name: &str, tensor: &Tensor) -> Result<()> {
        if self.plan.input_id(name).is_none() {
            let reason = if self.graph.is_initializer(name) {
                "is an initializer and can't be fed"
            } else {
                "is not a graph input"
            };
            return Err(EngineError::invalid_argument(format!("{} {}", name, reason)));
        }
        let info = self
            .graph
            .inputs()
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| EngineError::invalid_argument(format!("{} is not a graph input", name)))?;
        if tensor.element_type() != info.element_type {
            return Err(EngineError::invalid_argument(format!(
                "input {} expects {}, got {}",
                name,
                info.element_type,
                tensor.element_type()
            )));
        }
        if !info.accepts_shape(tensor.shape()) {
            return Err(EngineError::invalid_argument(format!(
                "input {} doesn't accept shape {:?}",
                name,
                tensor.shape()
            )));
        }
        Ok(())
    }

    fn check_output(&self, name: &str, tensor: &Tensor) -> Result<()> {
        let index = self
            .plan
            .output_index(name)
            .ok_or_else(|| EngineError::invalid_argument(format!("unknown output {}", name)))?;
        let meta = &self.plan.values[self.plan.outputs[index].value];
        if let Some(element_type) = meta.element_type {
            if tensor.element_type() != element_type {
                return Err(EngineError::invalid_argument(format!(
                    "output {} is {}, bound tensor is {}",
                    name,
                    element_type,
                    tensor.element_type()
                )));
            }
        }
        if let Some(shape) = &meta.shape {
            if tensor.shape() != shape.as_slice() {
                return Err(EngineError::invalid_argument(format!(
                    "output {} has shape {:?}, bound tensor has {:?}",
                    name,
                    shape,
                    tensor.shape()
                )));
            }
        }
        Ok(())
    }

    fn prepare(
        &self,
        feeds: impl Iterator<Item = (String, Tensor)>,
        outputs: Vec<OutputSpec>,
    ) -> Result<RunRequest> {
        let mut fed: Vec<(ValueId, Tensor)> = Vec::new();
        for (name, tensor) in feeds {
            self.check_input(&name, &tensor)?;
            let value = self
                .plan
                .input_id(&name)
                .ok_or_else(|| EngineError::invalid_argument(format!("{} is not a graph input", name)))?;
            if fed.iter().any(|(v, _)| *v == value) {
                return Err(EngineError::invalid_argument(format!(
                    "input {} given twice",
                    name
                )));
            }
            fed.push((value, tensor));
        }
        for (name, value) in &self.plan.inputs {
            if !fed.iter().any(|(v, _)| v == value) {
                return Err(EngineError::invalid_argument(format!(
                    "missing input {}",
                    name
                )));
            }
        }

        Ok(RunRequest {
            feeds: fed,
            outputs: outputs
                .into_iter()
                .map(|(output, bound, location)| OutputRequest {
                    output,
                    bound,
                    location,
                })
                .collect(),
        })
    }

    fn complete(&self, outcome: RunOutcome) -> Result<Vec<Tensor>> {
        let RunOutcome {
            result,
            stats,
            timings,
        } = outcome;

        self.profiler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_run(&self.plan, &self.providers, &timings);

        match &result {
            Ok(_) => log::debug!(
                "session {} run: {} steps, {} transfers ({} bytes), {} reuses, {} fallbacks in {:?}",
                self.id,
                stats.steps_executed,
                stats.transfers,
                stats.bytes_transferred,
                stats.planned_reuses,
                stats.fallback_allocations,
                stats.elapsed
            ),
            Err(e) => log::warn!("session {} run failed: {}", self.id, e),
        }
        *self.last_stats.lock().unwrap_or_else(|e| e.into_inner()) = Some(stats);
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // a blocking shutdown would panic when the session is dropped inside async code
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
