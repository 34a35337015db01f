use crate::graph::{Node, normalize_domain};
use crate::tensor::byte_size;
use crate::{ALIGNMENT, Allocator, Buffer, ElementType, EngineError, Location, Result, Tensor};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Compute implementation of one operator on one provider
///
/// Kernels are created once per node at session build and shared by every
/// run, so `compute` takes `&self`.
pub trait Kernel: Send + Sync {
    fn compute(&self, ctx: &mut KernelContext) -> Result<()>;
}

/// Builds the kernel for a node, validating its attributes
pub type KernelFactory = Arc<dyn Fn(&Node) -> Result<Box<dyn Kernel>> + Send + Sync>;

/// Where a kernel output will be written
pub(crate) enum OutputTarget {
    /// Slot from the allocation plan, with the slot's buffer when it is free
    Planned {
        buffer: Option<Buffer>,
        capacity: usize,
    },
    /// Never-reused storage for graph outputs
    Dedicated,
    /// Zero-size sentinel
    Empty,
    /// Size unknown at plan time
    Unplanned,
    /// Caller-provided tensor from IO binding
    Bound(Tensor),
    Produced(Tensor),
}

pub(crate) struct OutputSlot {
    pub target: OutputTarget,
    pub allocator: Arc<Allocator>,
}

/// What a finished kernel invocation leaves behind
pub(crate) struct KernelOutputs {
    pub outputs: Vec<Option<Tensor>>,
    /// Planned buffers the kernel didn't use, by output index
    pub leftovers: Vec<(usize, Buffer)>,
    pub fallbacks: usize,
}

/// Inputs and output slots of one kernel invocation
///
/// The context owns everything the kernel touches so it can be shipped to a
/// device queue thread and back.
pub struct KernelContext {
    node: Arc<str>,
    inputs: Vec<Option<Tensor>>,
    outputs: Vec<OutputSlot>,
    leftovers: Vec<(usize, Buffer)>,
    fallbacks: usize,
}

impl KernelContext {
    /// Standalone context whose outputs are allocated from `allocator`
    pub fn new(
        node: &str,
        inputs: Vec<Option<Tensor>>,
        output_count: usize,
        allocator: Arc<Allocator>,
    ) -> Self {
        let outputs = (0..output_count)
            .map(|_| OutputSlot {
                target: OutputTarget::Unplanned,
                allocator: Arc::clone(&allocator),
            })
            .collect();
        KernelContext::with_slots(Arc::from(node), inputs, outputs)
    }

    pub(crate) fn with_slots(
        node: Arc<str>,
        inputs: Vec<Option<Tensor>>,
        outputs: Vec<OutputSlot>,
    ) -> Self {
        KernelContext {
            node,
            inputs,
            outputs,
            leftovers: Vec::new(),
            fallbacks: 0,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Input tensor, `None` when absent or omitted
    pub fn input(&self, index: usize) -> Option<&Tensor> {
        self.inputs.get(index).and_then(|t| t.as_ref())
    }

    /// # Errors
    /// Returns `InvalidArgument` when the input is absent
    pub fn required_input(&self, index: usize) -> Result<&Tensor> {
        self.input(index).ok_or_else(|| {
            EngineError::invalid_argument(format!(
                "node {} is missing required input {}",
                self.node, index
            ))
        })
    }

    /// Location an output will be allocated in
    pub fn output_location(&self, index: usize) -> Option<Location> {
        self.outputs.get(index).map(|slot| match &slot.target {
            OutputTarget::Bound(t) | OutputTarget::Produced(t) => t.location(),
            _ => slot.allocator.location(),
        })
    }

    /// Writable output tensor of the given shape and type
    ///
    /// Planned storage is reused when it is large enough and is not cleared
    /// first, so kernels must write every element. A bound output must match
    /// the requested shape and type exactly.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a bad index, a string type (use
    /// [`KernelContext::set_output`]) or a bound output mismatch, and
    /// `AllocationFailure` when storage can't be obtained.
    pub fn output(
        &mut self,
        index: usize,
        shape: &[usize],
        element_type: ElementType,
    ) -> Result<&mut Tensor> {
        let size = element_type.size().ok_or_else(|| {
            EngineError::invalid_argument("string outputs must be set with set_output")
        })?;
        let node = Arc::clone(&self.node);
        let slot = self.outputs.get_mut(index).ok_or_else(|| {
            EngineError::invalid_argument(format!("node {} has no output {}", node, index))
        })?;
        let needed = byte_size(shape, size)
            .ok_or_else(|| slot.allocator.oversized(element_type, shape))?;

        let tensor = match std::mem::replace(&mut slot.target, OutputTarget::Unplanned) {
            OutputTarget::Produced(t) | OutputTarget::Bound(t) => {
                if t.shape() != shape || t.element_type() != element_type {
                    return Err(EngineError::invalid_argument(format!(
                        "output {} of node {} is {} {:?}, kernel produced {} {:?}",
                        index,
                        node,
                        t.element_type(),
                        t.shape(),
                        element_type,
                        shape
                    )));
                }
                t
            }
            OutputTarget::Planned {
                buffer: Some(mut buffer),
                capacity,
            } => {
                if buffer.resize_within(needed) {
                    Tensor::from_buffer(buffer, element_type, shape)?
                } else {
                    self.leftovers.push((index, buffer));
                    self.fallbacks += 1;
                    log::warn!(
                        "node {} output {} needs {} bytes, planned slot holds {}",
                        node,
                        index,
                        needed,
                        capacity
                    );
                    let buffer = slot.allocator.allocate(needed, ALIGNMENT)?;
                    Tensor::from_buffer(buffer, element_type, shape)?
                }
            }
            OutputTarget::Planned {
                buffer: None,
                capacity,
            } => {
                let mut buffer = if needed <= capacity {
                    slot.allocator.allocate(capacity, ALIGNMENT)?
                } else {
                    self.fallbacks += 1;
                    log::warn!(
                        "node {} output {} needs {} bytes, planned slot holds {}",
                        node,
                        index,
                        needed,
                        capacity
                    );
                    slot.allocator.allocate(needed, ALIGNMENT)?
                };
                buffer.resize_within(needed);
                Tensor::from_buffer(buffer, element_type, shape)?
            }
            OutputTarget::Dedicated => {
                Tensor::from_buffer(slot.allocator.allocate(needed, ALIGNMENT)?, element_type, shape)?
            }
            OutputTarget::Empty | OutputTarget::Unplanned => {
                if needed > 0 {
                    self.fallbacks += 1;
                }
                Tensor::from_buffer(slot.allocator.allocate(needed, ALIGNMENT)?, element_type, shape)?
            }
        };

        slot.target = OutputTarget::Produced(tensor);
        match &mut slot.target {
            OutputTarget::Produced(t) => Ok(t),
            _ => unreachable!(),
        }
    }

    /// Provide an already computed tensor as an output
    ///
    /// Used by kernels that alias an input or build string tensors. A bound
    /// output receives a copy.
    pub fn set_output(&mut self, index: usize, tensor: Tensor) -> Result<()> {
        let node = Arc::clone(&self.node);
        let slot = self.outputs.get_mut(index).ok_or_else(|| {
            EngineError::invalid_argument(format!("node {} has no output {}", node, index))
        })?;
        match std::mem::replace(&mut slot.target, OutputTarget::Unplanned) {
            OutputTarget::Bound(mut bound) => {
                bound.copy_from(&tensor)?;
                slot.target = OutputTarget::Produced(bound);
            }
            OutputTarget::Planned {
                buffer: Some(buffer),
                ..
            } => {
                self.leftovers.push((index, buffer));
                slot.target = OutputTarget::Produced(tensor);
            }
            _ => slot.target = OutputTarget::Produced(tensor),
        }
        Ok(())
    }

    /// Consume the context, returning the produced outputs in order
    ///
    /// # Errors
    /// Returns `DeviceExecution` if the kernel left an output unset
    pub fn into_outputs(self) -> Result<Vec<Tensor>> {
        let node = Arc::clone(&self.node);
        self.into_parts()
            .outputs
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                t.ok_or_else(|| {
                    EngineError::DeviceExecution(format!(
                        "kernel of node {} did not produce output {}",
                        node, i
                    ))
                })
            })
            .collect()
    }

    pub(crate) fn into_parts(self) -> KernelOutputs {
        let mut leftovers = self.leftovers;
        let outputs = self
            .outputs
            .into_iter()
            .enumerate()
            .map(|(i, slot)| match slot.target {
                OutputTarget::Produced(t) => Some(t),
                OutputTarget::Planned {
                    buffer: Some(buffer),
                    ..
                } => {
                    leftovers.push((i, buffer));
                    None
                }
                _ => None,
            })
            .collect();
        KernelOutputs {
            outputs,
            leftovers,
            fallbacks: self.fallbacks,
        }
    }
}

/// Registration record of a kernel
///
/// A definition covers one operator on one provider, an inclusive opset
/// version range (open-ended when `end_version` is `None`) and the element
/// types accepted on its type-determining input.
#[derive(Clone)]
pub struct KernelDef {
    op_type: String,
    domain: String,
    provider: String,
    since_version: i64,
    end_version: Option<i64>,
    types: Vec<ElementType>,
    type_input: usize,
    factory: KernelFactory,
}

impl KernelDef {
    pub fn new<F>(op_type: &str, provider: &str, factory: F) -> Self
    where
        F: Fn(&Node) -> Result<Box<dyn Kernel>> + Send + Sync + 'static,
    {
        KernelDef {
            op_type: op_type.to_string(),
            domain: String::new(),
            provider: provider.to_string(),
            since_version: 1,
            end_version: None,
            types: Vec::new(),
            type_input: 0,
            factory: Arc::new(factory),
        }
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = normalize_domain(domain);
        self
    }

    pub fn versions(mut self, since: i64, end: i64) -> Self {
        self.since_version = since;
        self.end_version = Some(end);
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since_version = since;
        self.end_version = None;
        self
    }

    /// Accepted element types, empty accepts every type
    pub fn types(mut self, types: &[ElementType]) -> Self {
        self.types = types.to_vec();
        self
    }

    /// Input whose element type is checked against [`KernelDef::types`]
    pub fn type_input(mut self, index: usize) -> Self {
        self.type_input = index;
        self
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn version_range(&self) -> (i64, Option<i64>) {
        (self.since_version, self.end_version)
    }

    pub fn covers_version(&self, version: i64) -> bool {
        version >= self.since_version && self.end_version.is_none_or(|end| version <= end)
    }

    pub fn accepts(&self, input_types: &[Option<ElementType>]) -> bool {
        if self.types.is_empty() {
            return true;
        }
        match input_types.get(self.type_input).copied().flatten() {
            Some(ty) => self.types.contains(&ty),
            None => true,
        }
    }

    pub fn create(&self, node: &Node) -> Result<Box<dyn Kernel>> {
        (self.factory)(node)
    }

    fn same_target(&self, other: &KernelDef) -> bool {
        self.op_type == other.op_type
            && self.domain == other.domain
            && self.provider == other.provider
    }

    fn overlaps(&self, other: &KernelDef) -> bool {
        let self_end = self.end_version.unwrap_or(i64::MAX);
        let other_end = other.end_version.unwrap_or(i64::MAX);
        let versions = self.since_version <= other_end && other.since_version <= self_end;
        let types = self.types.is_empty()
            || other.types.is_empty()
            || self.types.iter().any(|t| other.types.contains(t));
        versions && types
    }
}

impl fmt::Debug for KernelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDef")
            .field("op_type", &self.op_type)
            .field("domain", &self.domain)
            .field("provider", &self.provider)
            .field("since_version", &self.since_version)
            .field("end_version", &self.end_version)
            .field("types", &self.types)
            .finish()
    }
}

/// Lookup table from (operator, domain, version, provider, type) to kernel
///
/// Registration rejects any definition that could match the same request as
/// an existing one, so a lookup has at most one answer.
#[derive(Default)]
pub struct KernelRegistry {
    defs: HashMap<(String, String, String), Vec<KernelDef>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        KernelRegistry {
            defs: HashMap::new(),
        }
    }

    /// # Errors
    /// Returns `AmbiguousKernel` if the definition overlaps an existing one
    /// in version range and element types.
    pub fn register(&mut self, def: KernelDef) -> Result<()> {
        let key = (
            def.op_type.clone(),
            def.domain.clone(),
            def.provider.clone(),
        );
        let existing = self.defs.entry(key).or_default();
        if existing.iter().any(|d| d.same_target(&def) && d.overlaps(&def)) {
            return Err(EngineError::AmbiguousKernel {
                op_type: def.op_type,
                domain: def.domain,
                provider: def.provider,
            });
        }
        existing.push(def);
        Ok(())
    }

    /// Find the kernel for an operator invocation
    ///
    /// # Errors
    /// Returns `KernelNotFound` when no definition covers the version and
    /// accepts the input types.
    pub fn lookup(
        &self,
        op_type: &str,
        domain: &str,
        version: i64,
        provider: &str,
        input_types: &[Option<ElementType>],
    ) -> Result<&KernelDef> {
        let domain = normalize_domain(domain);
        let key = (op_type.to_string(), domain.clone(), provider.to_string());
        self.defs
            .get(&key)
            .and_then(|defs| {
                defs.iter()
                    .find(|d| d.covers_version(version) && d.accepts(input_types))
            })
            .ok_or_else(|| EngineError::KernelNotFound {
                op_type: op_type.to_string(),
                domain,
                version,
                provider: provider.to_string(),
            })
    }

    /// Kernel definition for a node on a provider
    pub fn lookup_node(
        &self,
        node: &Node,
        provider: &str,
        input_types: &[Option<ElementType>],
    ) -> Result<&KernelDef> {
        self.lookup(&node.op_type, &node.domain, node.version, provider, input_types)
    }

    pub fn len(&self) -> usize {
        self.defs.values().map(|d| d.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operators registered for a provider, sorted
    pub fn operators(&self, provider: &str) -> Vec<&str> {
        let mut ops: Vec<&str> = self
            .defs
            .keys()
            .filter(|(_, _, p)| p == provider)
            .map(|(op, _, _)| op.as_str())
            .collect();
        ops.sort_unstable();
        ops.dedup();
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl Kernel for Nop {
        fn compute(&self, _ctx: &mut KernelContext) -> Result<()> {
            Ok(())
        }
    }

    fn nop(_: &Node) -> Result<Box<dyn Kernel>> {
        Ok(Box::new(Nop))
    }

    #[test]
    fn test_planned_buffer_reused_when_large_enough() {
        let alloc = Allocator::new("ctx-test", Location::Host);
        let buffer = alloc.allocate(64, ALIGNMENT).unwrap();
        let id = buffer.id();
        let slot = OutputSlot {
            target: OutputTarget::Planned {
                buffer: Some(buffer),
                capacity: 64,
            },
            allocator: Arc::clone(&alloc),
        };
        let mut ctx = KernelContext::with_slots(Arc::from("n"), vec![], vec![slot]);
        let out = ctx.output(0, &[4], ElementType::Float32).unwrap();
        assert_eq!(out.buffer_id(), Some(id));
        let parts = ctx.into_parts();
        assert_eq!(parts.fallbacks, 0);
        assert!(parts.leftovers.is_empty());
    }

    #[test]
    fn test_planned_buffer_too_small_falls_back() {
        let alloc = Allocator::new("ctx-test", Location::Host);
        let buffer = alloc.allocate(64, ALIGNMENT).unwrap();
        let slot = OutputSlot {
            target: OutputTarget::Planned {
                buffer: Some(buffer),
                capacity: 64,
            },
            allocator: Arc::clone(&alloc),
        };
        let mut ctx = KernelContext::with_slots(Arc::from("n"), vec![], vec![slot]);
        ctx.output(0, &[32], ElementType::Float32).unwrap();
        let parts = ctx.into_parts();
        assert_eq!(parts.fallbacks, 1);
        assert_eq!(parts.leftovers.len(), 1);
        assert_eq!(parts.outputs[0].as_ref().unwrap().shape(), &[32]);
    }

    #[test]
    fn test_bound_output_shape_mismatch() {
        let alloc = Allocator::new("ctx-test", Location::Host);
        let bound = Tensor::zeros(&alloc, ElementType::Float32, &[3]).unwrap();
        let slot = OutputSlot {
            target: OutputTarget::Bound(bound),
            allocator: Arc::clone(&alloc),
        };
        let mut ctx = KernelContext::with_slots(Arc::from("n"), vec![], vec![slot]);
        assert!(matches!(
            ctx.output(0, &[4], ElementType::Float32),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_missing_output_reported() {
        let ctx = KernelContext::new("lazy", vec![], 1, Allocator::new("ctx-test", Location::Host));
        assert!(matches!(
            ctx.into_outputs(),
            Err(EngineError::DeviceExecution(_))
        ));
    }

    #[test]
    fn test_version_ranges() {
        let def = KernelDef::new("MatMul", "gpu", nop).versions(1, 12);
        assert!(def.covers_version(1));
        assert!(def.covers_version(12));
        assert!(!def.covers_version(13));
        let open = KernelDef::new("MatMul", "gpu", nop).since(13);
        assert!(open.covers_version(21));
        assert!(!def.overlaps(&open));
    }

    #[test]
    fn test_type_constraint_on_selected_input() {
        let def = KernelDef::new("Range", "cpu", nop)
            .types(&[ElementType::Int64])
            .type_input(1);
        assert!(def.accepts(&[Some(ElementType::Float32), Some(ElementType::Int64)]));
        assert!(!def.accepts(&[Some(ElementType::Int64), Some(ElementType::Float32)]));
    }
}
