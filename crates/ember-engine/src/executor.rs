use crate::error::ErrorSink;
use crate::kernel::{OutputSlot, OutputTarget};
use crate::plan::{ExecutionPlan, StepKind, ValueKind};
use crate::planner::{Allocation, ValueId};
use crate::profiler::StepTiming;
use crate::provider::{
    Deadline, ExecutionProvider, Launch, PendingKernel, ProviderKind, Transfer,
};
use crate::{Buffer, EngineError, Kernel, KernelContext, Location, Result, Tensor};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Phase of a session's run protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunPhase {
    Idle = 0,
    Preparing = 1,
    Running = 2,
    Completing = 3,
}

impl RunPhase {
    fn from_u8(value: u8) -> RunPhase {
        match value {
            1 => RunPhase::Preparing,
            2 => RunPhase::Running,
            3 => RunPhase::Completing,
            _ => RunPhase::Idle,
        }
    }
}

/// Session-wide phase, at most one run leaves `Idle` at a time
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new() -> Self {
        PhaseCell(AtomicU8::new(RunPhase::Idle as u8))
    }

    pub fn get(&self) -> RunPhase {
        RunPhase::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Claim the session for a run
    ///
    /// # Errors
    /// Returns `SessionBusy` when another run is in flight
    pub fn enter(&self) -> Result<PhaseGuard<'_>> {
        self.0
            .compare_exchange(
                RunPhase::Idle as u8,
                RunPhase::Preparing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| EngineError::SessionBusy)?;
        log::debug!("run phase: Idle -> Preparing");
        Ok(PhaseGuard { cell: self })
    }
}

/// Returns the session to `Idle` when the run ends, however it ends
pub(crate) struct PhaseGuard<'a> {
    cell: &'a PhaseCell,
}

impl PhaseGuard<'_> {
    pub fn advance(&self, phase: RunPhase) {
        let previous = self.cell.0.swap(phase as u8, Ordering::SeqCst);
        log::debug!("run phase: {:?} -> {:?}", RunPhase::from_u8(previous), phase);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.cell.0.store(RunPhase::Idle as u8, Ordering::SeqCst);
    }
}

/// Counters of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub steps_executed: usize,
    pub device_kernels: usize,
    /// Outputs written into a planned slot buffer released by an earlier value
    pub planned_reuses: usize,
    /// Outputs that needed storage beyond the plan
    pub fallback_allocations: usize,
    pub transfers: usize,
    pub bytes_transferred: usize,
    pub elapsed: Duration,
}

pub(crate) struct OutputRequest {
    /// Index into the plan's outputs
    pub output: usize,
    pub bound: Option<Tensor>,
    pub location: Option<Location>,
}

pub(crate) struct RunRequest {
    pub feeds: Vec<(ValueId, Tensor)>,
    pub outputs: Vec<OutputRequest>,
}

pub(crate) struct RunOutcome {
    pub result: Result<Vec<Tensor>>,
    pub stats: RunStats,
    pub timings: Vec<StepTiming>,
}

/// Everything one run owns; dropping it releases every run allocation
struct RunState {
    values: Vec<Option<Tensor>>,
    remaining: Vec<usize>,
    /// Free buffer of each planned slot
    arena: Vec<Option<Buffer>>,
    pending: Vec<Option<(PendingKernel, Instant)>>,
    /// Caller tensors outputs are written into directly
    bound: HashMap<ValueId, Tensor>,
    errors: ErrorSink,
    stats: RunStats,
    timings: Vec<StepTiming>,
}

impl RunState {
    fn new(plan: &ExecutionPlan) -> Self {
        RunState {
            values: vec![None; plan.values.len()],
            remaining: plan.values.iter().map(|v| v.consumers.len()).collect(),
            arena: (0..plan.allocation.slots().len()).map(|_| None).collect(),
            pending: (0..plan.steps.len()).map(|_| None).collect(),
            bound: HashMap::new(),
            errors: ErrorSink::default(),
            stats: RunStats::default(),
            timings: Vec::new(),
        }
    }
}

type BatchResult = (usize, Result<KernelContext>, Instant);

pub(crate) struct Executor<'a> {
    pub plan: &'a ExecutionPlan,
    pub providers: &'a [Arc<dyn ExecutionProvider>],
    pub constants: &'a HashMap<ValueId, Tensor>,
    /// Worker pool of parallel mode, `None` runs steps one by one
    pub pool: Option<&'a rayon::ThreadPool>,
    pub deadline: Option<Deadline>,
    pub profile: bool,
}

impl Executor<'_> {
    /// Walk the plan once
    ///
    /// Device kernels are awaited only when a later step needs their
    /// outputs and at completion. The first failure stops scheduling; work
    /// already queued is still awaited so its errors are reported and its
    /// buffers are released before returning.
    pub async fn execute(&self, request: RunRequest, phase: &PhaseGuard<'_>) -> RunOutcome {
        let started = Instant::now();
        let mut state = RunState::new(self.plan);
        let RunRequest {
            feeds,
            outputs: mut requests,
        } = request;

        for (value, tensor) in feeds {
            state.values[value] = Some(tensor);
        }
        for request in requests.iter_mut() {
            let output = &self.plan.outputs[request.output];
            let meta = &self.plan.values[output.value];
            let wanted = request.location.unwrap_or(output.location);
            // written in place when the producer allocates at the bound location
            let direct = request.bound.as_ref().is_some_and(|b| {
                b.location() == wanted && b.location() == meta.location && meta.producer.is_some()
            });
            if direct {
                if let Some(bound) = request.bound.take() {
                    state.bound.insert(output.value, bound);
                }
            }
        }

        phase.advance(RunPhase::Running);
        if self.pool.is_some() {
            for group in &self.plan.levels {
                if !state.errors.is_empty() {
                    break;
                }
                self.run_group(group, &mut state).await;
            }
        } else {
            for index in 0..self.plan.steps.len() {
                if !state.errors.is_empty() {
                    break;
                }
                self.run_group(&[index], &mut state).await;
            }
        }

        phase.advance(RunPhase::Completing);
        self.drain_pending(&mut state).await;

        let result = match std::mem::take(&mut state.errors).into_result() {
            Ok(()) => self.collect_outputs(requests, &mut state).await,
            Err(e) => Err(e),
        };

        state.stats.elapsed = started.elapsed();
        RunOutcome {
            result,
            stats: state.stats.clone(),
            timings: std::mem::take(&mut state.timings),
        }
    }

    async fn run_group(&self, group: &[usize], state: &mut RunState) {
        for &index in group {
            for &value in self.plan.steps[index].inputs.iter().flatten() {
                self.ensure_available(value, state).await;
            }
        }
        if !state.errors.is_empty() {
            return;
        }

        let mut batch: Vec<(usize, Arc<dyn Kernel>, KernelContext)> = Vec::new();
        for &index in group {
            let step = &self.plan.steps[index];
            match &step.kind {
                StepKind::Transfer { to, .. } => {
                    let started = Instant::now();
                    if let Err(e) = self.run_transfer(index, *to, state).await {
                        state.errors.push(e);
                        return;
                    }
                    self.record(index, started, state);
                }
                StepKind::Kernel { kernel, .. } => {
                    let ctx = match self.prepare_context(index, state).await {
                        Ok(ctx) => ctx,
                        Err(e) => {
                            state.errors.push(e);
                            return;
                        }
                    };
                    let provider = &self.providers[step.provider];
                    if provider.is_async() {
                        let started = Instant::now();
                        match provider.launch(Arc::clone(kernel), ctx, self.deadline) {
                            Launch::Pending(pending) => {
                                state.stats.device_kernels += 1;
                                state.pending[index] = Some((pending, started));
                            }
                            Launch::Complete(result) => {
                                self.finish_kernel(index, result, started, state)
                            }
                        }
                    } else {
                        batch.push((index, Arc::clone(kernel), ctx));
                    }
                }
            }
        }

        for (index, result, started) in self.run_batch(batch) {
            self.finish_kernel(index, result, started, state);
        }
    }

    fn run_batch(&self, batch: Vec<(usize, Arc<dyn Kernel>, KernelContext)>) -> Vec<BatchResult> {
        let run_one = |(index, kernel, ctx): (usize, Arc<dyn Kernel>, KernelContext)| {
            let provider = &self.providers[self.plan.steps[index].provider];
            let started = Instant::now();
            let result = match provider.launch(kernel, ctx, self.deadline) {
                Launch::Complete(result) => result,
                Launch::Pending(pending) => Err(EngineError::DeviceExecution(format!(
                    "synchronous provider {} deferred node {}",
                    provider.name(),
                    pending.node()
                ))),
            };
            (index, result, started)
        };
        match self.pool {
            Some(pool) if batch.len() > 1 => {
                pool.install(|| batch.into_par_iter().map(run_one).collect())
            }
            _ => batch.into_iter().map(run_one).collect(),
        }
    }

    async fn ensure_available(&self, value: ValueId, state: &mut RunState) {
        if state.values[value].is_some() || self.constants.contains_key(&value) {
            return;
        }
        let Some(producer) = self.plan.values[value].producer else {
            return;
        };
        if let Some((pending, started)) = state.pending[producer].take() {
            let result = pending.wait().await;
            self.finish_kernel(producer, result, started, state);
        }
    }

    async fn drain_pending(&self, state: &mut RunState) {
        for index in 0..state.pending.len() {
            if let Some((pending, started)) = state.pending[index].take() {
                let result = pending.wait().await;
                self.finish_kernel(index, result, started, state);
            }
        }
    }

    fn value(&self, value: ValueId, state: &RunState) -> Option<Tensor> {
        state.values[value]
            .clone()
            .or_else(|| self.constants.get(&value).cloned())
    }

    async fn prepare_context(&self, index: usize, state: &mut RunState) -> Result<KernelContext> {
        let step = &self.plan.steps[index];
        let provider = &self.providers[step.provider];
        let readable = provider.input_locations();

        let mut inputs = Vec::with_capacity(step.inputs.len());
        for input in &step.inputs {
            let Some(value) = *input else {
                inputs.push(None);
                continue;
            };
            let tensor = self.value(value, state).ok_or_else(|| {
                EngineError::DeviceExecution(format!(
                    "value {} is not available for node {}",
                    self.plan.values[value].name, step.name
                ))
            })?;
            let tensor = if readable.contains(&tensor.location()) {
                tensor
            } else {
                // the caller placed the tensor somewhere the plan didn't expect
                self.transfer(&step.name, &tensor, provider.default_location(), state)
                    .await?
            };
            inputs.push(Some(tensor));
        }

        let mut outputs = Vec::with_capacity(step.outputs.len());
        for &value in &step.outputs {
            let allocator = provider.allocator(self.plan.values[value].location)?;
            let target = match state.bound.remove(&value) {
                Some(bound) => OutputTarget::Bound(bound),
                None => match self.plan.allocation.allocation(value) {
                    Allocation::Slot(slot) => {
                        let buffer = state.arena[slot].take();
                        if buffer.is_some() {
                            state.stats.planned_reuses += 1;
                        }
                        OutputTarget::Planned {
                            buffer,
                            capacity: self.plan.allocation.slots()[slot].capacity,
                        }
                    }
                    Allocation::Dedicated(_) => OutputTarget::Dedicated,
                    Allocation::Empty => OutputTarget::Empty,
                    Allocation::Dynamic | Allocation::External => OutputTarget::Unplanned,
                },
            };
            outputs.push(OutputSlot { target, allocator });
        }

        Ok(KernelContext::with_slots(
            Arc::from(step.name.as_str()),
            inputs,
            outputs,
        ))
    }

    fn finish_kernel(
        &self,
        index: usize,
        result: Result<KernelContext>,
        started: Instant,
        state: &mut RunState,
    ) {
        let step = &self.plan.steps[index];
        self.record(index, started, state);

        match result {
            Ok(ctx) => {
                let parts = ctx.into_parts();
                state.stats.fallback_allocations += parts.fallbacks;
                for (output, buffer) in parts.leftovers {
                    self.recycle(step.outputs[output], buffer, state);
                }
                for (output, tensor) in parts.outputs.into_iter().enumerate() {
                    let value = step.outputs[output];
                    match tensor {
                        Some(tensor) => state.values[value] = Some(tensor),
                        None => state.errors.push(EngineError::DeviceExecution(format!(
                            "kernel of node {} did not produce output {}",
                            step.name, output
                        ))),
                    }
                }
                for &value in &step.outputs {
                    if state.remaining[value] == 0 {
                        self.release(value, state);
                    }
                }
            }
            Err(e) => {
                if self.providers[step.provider].is_async() {
                    log::error!("device kernel {} failed: {}", step.name, e);
                } else {
                    log::debug!("kernel {} failed: {}", step.name, e);
                }
                state.errors.push(e);
            }
        }

        self.consume_inputs(index, state);
    }

    async fn run_transfer(&self, index: usize, to: Location, state: &mut RunState) -> Result<()> {
        let step = &self.plan.steps[index];
        let source = step.inputs[0]
            .and_then(|v| self.value(v, state))
            .ok_or_else(|| {
                EngineError::DeviceExecution(format!("nothing to transfer for {}", step.name))
            })?;
        let output = step.outputs[0];

        let moved = match state.bound.remove(&output) {
            Some(mut bound) => {
                bound.copy_from(&source)?;
                if source.location() != bound.location() {
                    state.stats.transfers += 1;
                    state.stats.bytes_transferred += source.byte_len();
                }
                bound
            }
            None => {
                let provider = &self.providers[step.provider];
                if source.location() == to {
                    // already where it needs to be, wrap without copying
                    source.clone()
                } else if provider.can_transfer(source.location(), to) {
                    self.copy_with(provider, &step.name, &source, to, state).await?
                } else {
                    self.transfer(&step.name, &source, to, state).await?
                }
            }
        };
        drop(source);

        state.values[output] = Some(moved);
        self.consume_inputs(index, state);
        if state.remaining[output] == 0 {
            self.release(output, state);
        }
        Ok(())
    }

    /// Copy a tensor to `to` with whichever provider reaches both ends
    ///
    /// Device to device copies without a direct route are staged through
    /// host memory.
    async fn transfer(
        &self,
        node: &str,
        tensor: &Tensor,
        to: Location,
        state: &mut RunState,
    ) -> Result<Tensor> {
        let from = tensor.location();
        if from == to {
            return Ok(tensor.clone());
        }
        if let Some(provider) = self.copier(from, to) {
            return self.copy_with(provider, node, tensor, to, state).await;
        }
        if from != Location::Host && to != Location::Host {
            if let (Some(down), Some(up)) =
                (self.copier(from, Location::Host), self.copier(Location::Host, to))
            {
                let staged = self.copy_with(down, node, tensor, Location::Host, state).await?;
                return self.copy_with(up, node, &staged, to, state).await;
            }
        }
        Err(EngineError::configuration(format!(
            "no provider can copy from {} to {}",
            from, to
        )))
    }

    /// Provider for a direct copy, accelerators first
    fn copier(&self, from: Location, to: Location) -> Option<&Arc<dyn ExecutionProvider>> {
        self.providers
            .iter()
            .filter(|p| p.can_transfer(from, to))
            .min_by_key(|p| p.kind() == ProviderKind::Cpu)
    }

    async fn copy_with(
        &self,
        provider: &Arc<dyn ExecutionProvider>,
        node: &str,
        tensor: &Tensor,
        to: Location,
        state: &mut RunState,
    ) -> Result<Tensor> {
        let moved = match provider.enqueue_transfer(node, tensor, to, self.deadline) {
            Transfer::Complete(result) => result?,
            Transfer::Pending(pending) => pending.wait().await?,
        };
        state.stats.transfers += 1;
        state.stats.bytes_transferred += tensor.byte_len();
        Ok(moved)
    }

    async fn collect_outputs(
        &self,
        requests: Vec<OutputRequest>,
        state: &mut RunState,
    ) -> Result<Vec<Tensor>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let output = &self.plan.outputs[request.output];
            let tensor = self.value(output.value, state).ok_or_else(|| {
                EngineError::DeviceExecution(format!("output {} was not produced", output.name))
            })?;
            let delivered = match request.bound {
                Some(mut bound) => {
                    bound.copy_from(&tensor)?;
                    if bound.location() != tensor.location() {
                        state.stats.transfers += 1;
                        state.stats.bytes_transferred += tensor.byte_len();
                    }
                    bound
                }
                None => {
                    let wanted = request.location.unwrap_or(output.location);
                    self.transfer(&output.name, &tensor, wanted, state).await?
                }
            };
            results.push(delivered);
        }
        Ok(results)
    }

    fn record(&self, index: usize, started: Instant, state: &mut RunState) {
        state.stats.steps_executed += 1;
        if self.profile {
            state.timings.push(StepTiming {
                step: index,
                started,
                duration: started.elapsed(),
            });
        }
    }

    fn consume_inputs(&self, index: usize, state: &mut RunState) {
        let mut inputs: Vec<ValueId> = self.plan.steps[index].inputs.iter().flatten().copied().collect();
        inputs.sort_unstable();
        inputs.dedup();
        for value in inputs {
            if state.remaining[value] > 0 {
                state.remaining[value] -= 1;
                if state.remaining[value] == 0 {
                    self.release(value, state);
                }
            }
        }
    }

    /// Drop a dead intermediate, keeping its buffer for the slot's next value
    fn release(&self, value: ValueId, state: &mut RunState) {
        if self.plan.values[value].kind != ValueKind::Intermediate {
            return;
        }
        let Some(tensor) = state.values[value].take() else {
            return;
        };
        if let Some(buffer) = tensor.into_buffer() {
            self.recycle(value, buffer, state);
        }
    }

    fn recycle(&self, value: ValueId, buffer: Buffer, state: &mut RunState) {
        if let Allocation::Slot(slot) = self.plan.allocation.allocation(value) {
            let matches = self
                .plan
                .allocation
                .slot(slot)
                .is_some_and(|s| s.location == buffer.location());
            if matches && state.arena[slot].is_none() {
                state.arena[slot] = Some(buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_entry_is_busy_until_guard_drops() {
        let cell = PhaseCell::new();
        let guard = cell.enter().unwrap();
        guard.advance(RunPhase::Running);
        assert_eq!(cell.get(), RunPhase::Running);
        assert!(matches!(cell.enter(), Err(EngineError::SessionBusy)));

        drop(guard);
        assert_eq!(cell.get(), RunPhase::Idle);
        assert!(cell.enter().is_ok());
    }
}
