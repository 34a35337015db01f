use crate::graph::Graph;
use crate::partition::Partition;
use crate::planner::{AllocationPlan, MemoryPlanner, ValueClass, ValueId, ValueRequest};
use crate::provider::{ExecutionProvider, ProviderKind};
use crate::tensor::byte_size;
use crate::{ElementType, EngineError, Kernel, Location, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Role of a value in the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Supplied by the caller at run time
    Input,
    /// Constant materialized at session build
    Constant,
    Intermediate,
    /// Delivered to the caller
    Output,
}

#[derive(Debug, Clone)]
pub struct ValueMeta {
    pub name: String,
    pub element_type: Option<ElementType>,
    /// Shape when fully static
    pub shape: Option<Vec<usize>>,
    pub location: Location,
    pub kind: ValueKind,
    /// Step producing the value
    pub producer: Option<usize>,
    /// Steps reading the value, ascending
    pub consumers: Vec<usize>,
}

impl ValueMeta {
    /// Byte size when type and shape are static
    pub fn static_size(&self) -> Option<usize> {
        let size = self.element_type?.size()?;
        // an unaddressable static size is left to the run-time fallback
        byte_size(self.shape.as_ref()?, size)
    }
}

pub enum StepKind {
    Kernel {
        node: usize,
        kernel: Arc<dyn Kernel>,
    },
    Transfer {
        from: Location,
        to: Location,
    },
}

pub struct Step {
    pub name: String,
    pub op_type: String,
    /// Index into the session's provider list
    pub provider: usize,
    pub kind: StepKind,
    pub inputs: Vec<Option<ValueId>>,
    pub outputs: Vec<ValueId>,
    /// Per input, whether it was produced by a transfer
    pub transfer_before: Vec<bool>,
    /// Dependency depth, steps of equal level are independent
    pub level: usize,
}

impl Step {
    pub fn is_transfer(&self) -> bool {
        matches!(self.kind, StepKind::Transfer { .. })
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("op_type", &self.op_type)
            .field("provider", &self.provider)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("level", &self.level)
            .finish()
    }
}

/// Initializer copy created once at session build
#[derive(Debug, Clone)]
pub struct Constant {
    pub value: ValueId,
    pub initializer: String,
    pub location: Location,
    /// Provider performing the copy, `None` when no copy is needed
    pub provider: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PlanOutput {
    pub name: String,
    pub value: ValueId,
    pub location: Location,
}

/// Immutable per-session schedule
#[derive(Debug)]
pub struct ExecutionPlan {
    pub steps: Vec<Step>,
    pub values: Vec<ValueMeta>,
    pub inputs: Vec<(String, ValueId)>,
    pub outputs: Vec<PlanOutput>,
    pub constants: Vec<Constant>,
    pub allocation: AllocationPlan,
    /// Step indices grouped by level, in plan order within a level
    pub levels: Vec<Vec<usize>>,
}

impl ExecutionPlan {
    pub fn transfer_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_transfer()).count()
    }

    pub fn value_id(&self, name: &str) -> Option<ValueId> {
        self.values.iter().position(|v| v.name == name)
    }

    pub fn input_id(&self, name: &str) -> Option<ValueId> {
        self.inputs.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|o| o.name == name)
    }
}

struct PlanBuilder<'a> {
    graph: &'a Graph,
    providers: &'a [Arc<dyn ExecutionProvider>],
    steps: Vec<Step>,
    values: Vec<ValueMeta>,
    ids: HashMap<String, ValueId>,
    copies: HashMap<(ValueId, Location), ValueId>,
    constants: Vec<Constant>,
}

impl<'a> PlanBuilder<'a> {
    fn add_value(&mut self, name: &str, location: Location, kind: ValueKind) -> ValueId {
        let info = self.graph.value_info(name);
        let id = self.values.len();
        self.values.push(ValueMeta {
            name: name.to_string(),
            element_type: self.graph.value_type(name),
            shape: info.and_then(|i| i.static_shape()),
            location,
            kind,
            producer: None,
            consumers: Vec::new(),
        });
        self.ids.insert(name.to_string(), id);
        id
    }

    fn transfer_provider(&self, from: Location, to: Location) -> Option<usize> {
        // accelerators first, they own the device side of the copy
        self.providers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.can_transfer(from, to))
            .min_by_key(|(_, p)| p.kind() == ProviderKind::Cpu)
            .map(|(i, _)| i)
    }

    /// Value holding `source` at `to`, creating the copy if needed
    fn copy_of(&mut self, source: ValueId, to: Location) -> Result<ValueId> {
        let from = self.values[source].location;
        if from == to {
            return Ok(source);
        }
        if let Some(&copy) = self.copies.get(&(source, to)) {
            return Ok(copy);
        }

        let (source, from) = match self.transfer_provider(from, to) {
            Some(_) => (source, from),
            None => {
                // no single provider reaches both ends, hop through host memory
                let hop = self.copy_of(source, Location::Host)?;
                (hop, Location::Host)
            }
        };
        let provider = self.transfer_provider(from, to).ok_or_else(|| {
            EngineError::configuration(format!(
                "no provider can copy {} from {} to {}",
                self.values[source].name, from, to
            ))
        })?;

        let name = format!("{}@{}", self.values[source].name, to);
        let copy = self.values.len();
        let mut meta = self.values[source].clone();
        meta.name = name.clone();
        meta.location = to;
        meta.producer = None;
        meta.consumers = Vec::new();
        meta.kind = if meta.kind == ValueKind::Constant {
            ValueKind::Constant
        } else {
            ValueKind::Intermediate
        };
        self.values.push(meta);
        self.ids.insert(name.clone(), copy);
        self.copies.insert((source, to), copy);

        if self.values[source].kind == ValueKind::Constant {
            self.constants.push(Constant {
                value: copy,
                initializer: self.root_initializer(source),
                location: to,
                provider: Some(provider),
            });
        } else {
            let step = self.steps.len();
            self.values[copy].producer = Some(step);
            self.values[source].consumers.push(step);
            self.steps.push(Step {
                name,
                op_type: "MemcpyTransfer".to_string(),
                provider,
                kind: StepKind::Transfer { from, to },
                inputs: vec![Some(source)],
                outputs: vec![copy],
                transfer_before: vec![false],
                level: 0,
            });
        }
        Ok(copy)
    }

    fn root_initializer(&self, value: ValueId) -> String {
        self.constants
            .iter()
            .find(|c| c.value == value)
            .map(|c| c.initializer.clone())
            .unwrap_or_else(|| self.values[value].name.clone())
    }
}

/// Turn a partitioned graph into an execution plan
///
/// # Errors
/// Returns `Configuration` when a kernel can't be created or a required copy
/// has no provider.
pub fn build_plan(
    graph: &Graph,
    partition: &Partition,
    providers: &[Arc<dyn ExecutionProvider>],
) -> Result<ExecutionPlan> {
    let mut builder = PlanBuilder {
        graph,
        providers,
        steps: Vec::new(),
        values: Vec::new(),
        ids: HashMap::new(),
        copies: HashMap::new(),
        constants: Vec::new(),
    };

    let mut inputs = Vec::new();
    for input in graph.inputs() {
        let id = builder.add_value(&input.name, Location::Host, ValueKind::Input);
        inputs.push((input.name.clone(), id));
    }
    for name in graph.initializers().keys() {
        let id = builder.add_value(name, Location::Host, ValueKind::Constant);
        builder.constants.push(Constant {
            value: id,
            initializer: name.clone(),
            location: Location::Host,
            provider: None,
        });
    }
    for node in graph.nodes() {
        for output in &node.outputs {
            let location = partition
                .locations
                .get(output)
                .copied()
                .unwrap_or(Location::Host);
            builder.add_value(output, location, ValueKind::Intermediate);
        }
    }

    // outputs that aren't node results are copied up front
    let mut output_values: HashMap<String, ValueId> = HashMap::new();
    for placement in &partition.outputs {
        if graph.producer(&placement.name).is_none() {
            let source = builder.ids[&placement.name];
            let value = builder.copy_of(source, placement.location)?;
            output_values.insert(placement.name.clone(), value);
        }
    }

    for (index, node) in graph.nodes().iter().enumerate() {
        let provider_index = partition.assignments[index];
        let provider = &providers[provider_index];

        let mut step_inputs = Vec::with_capacity(node.inputs.len());
        let mut transfer_before = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            match input {
                Some(name) => {
                    let source = builder.ids[name];
                    let value = match partition.transfer_for(name, index) {
                        Some(edge) => builder.copy_of(source, edge.to)?,
                        None => source,
                    };
                    step_inputs.push(Some(value));
                    transfer_before.push(value != source);
                }
                None => {
                    step_inputs.push(None);
                    transfer_before.push(false);
                }
            }
        }

        let kernel = provider.create_kernel(node, graph).map_err(|e| match e {
            EngineError::InvalidArgument(msg) => {
                EngineError::configuration(format!("node {}: {}", node.name, msg))
            }
            other => other,
        })?;

        let step = builder.steps.len();
        let outputs: Vec<ValueId> = node.outputs.iter().map(|o| builder.ids[o]).collect();
        for value in step_inputs.iter().flatten() {
            builder.values[*value].consumers.push(step);
        }
        for &value in &outputs {
            builder.values[value].producer = Some(step);
        }
        builder.steps.push(Step {
            name: node.name.clone(),
            op_type: node.op_type.clone(),
            provider: provider_index,
            kind: StepKind::Kernel { node: index, kernel },
            inputs: step_inputs,
            outputs,
            transfer_before,
            level: 0,
        });

        for output in &node.outputs {
            if let Some(placement) = partition.outputs.iter().find(|p| &p.name == output) {
                let source = builder.ids[output];
                let value = builder.copy_of(source, placement.location)?;
                output_values.insert(output.clone(), value);
            }
        }
    }

    let mut outputs = Vec::with_capacity(partition.outputs.len());
    for placement in &partition.outputs {
        let value = output_values[&placement.name];
        if builder.values[value].kind == ValueKind::Intermediate {
            builder.values[value].kind = ValueKind::Output;
        }
        outputs.push(PlanOutput {
            name: placement.name.clone(),
            value,
            location: placement.location,
        });
    }

    let PlanBuilder {
        mut steps,
        mut values,
        constants,
        ..
    } = builder;

    for value in values.iter_mut() {
        value.consumers.sort_unstable();
        value.consumers.dedup();
    }

    let levels = assign_levels(&mut steps, &values);
    let allocation = plan_memory(&steps, &values);

    Ok(ExecutionPlan {
        steps,
        values,
        inputs,
        outputs,
        constants,
        allocation,
        levels,
    })
}

fn assign_levels(steps: &mut [Step], values: &[ValueMeta]) -> Vec<Vec<usize>> {
    let mut levels: Vec<Vec<usize>> = Vec::new();
    for index in 0..steps.len() {
        let level = steps[index]
            .inputs
            .iter()
            .flatten()
            .filter_map(|&v| values[v].producer)
            .map(|p| steps[p].level + 1)
            .max()
            .unwrap_or(0);
        steps[index].level = level;
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(index);
    }
    levels
}

fn plan_memory(steps: &[Step], values: &[ValueMeta]) -> AllocationPlan {
    let mut planner = MemoryPlanner::new();
    for (id, value) in values.iter().enumerate() {
        let Some(start) = value.producer else {
            continue;
        };
        let (class, end) = match value.kind {
            ValueKind::Output => (ValueClass::Output, steps.len()),
            ValueKind::Constant => (ValueClass::Initializer, steps.len()),
            _ => (
                ValueClass::Intermediate,
                value.consumers.last().copied().unwrap_or(start).max(start),
            ),
        };
        planner.request(ValueRequest {
            value: id,
            location: value.location,
            size: value.static_size(),
            start,
            end,
            class,
        });
    }
    planner.plan()
}
