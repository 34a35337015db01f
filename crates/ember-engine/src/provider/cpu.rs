use super::{Deadline, ExecutionProvider, Launch, ProviderKind, copy_tensor};
use crate::graph::{Graph, Node};
use crate::{
    Allocator, EngineError, HOST_ALLOCATOR, Kernel, KernelContext, KernelRegistry, Location,
    Result, Tensor,
};
use std::sync::Arc;

pub const CPU_PROVIDER: &str = HOST_ALLOCATOR;

/// Host provider, runs kernels on the calling thread
pub struct CpuProvider {
    registry: Arc<KernelRegistry>,
    host: Arc<Allocator>,
    pinned: Arc<Allocator>,
}

impl CpuProvider {
    pub fn new(registry: Arc<KernelRegistry>) -> Self {
        CpuProvider {
            registry,
            host: Allocator::host(),
            pinned: Allocator::global(CPU_PROVIDER, Location::HostPinned),
        }
    }
}

impl ExecutionProvider for CpuProvider {
    fn name(&self) -> &str {
        CPU_PROVIDER
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Cpu
    }

    fn default_location(&self) -> Location {
        Location::Host
    }

    fn output_locations(&self) -> Vec<Location> {
        vec![Location::Host, Location::HostPinned]
    }

    fn input_locations(&self) -> Vec<Location> {
        vec![Location::Host, Location::HostPinned]
    }

    fn can_execute(&self, node: &Node, graph: &Graph) -> bool {
        self.registry
            .lookup_node(node, CPU_PROVIDER, &graph.input_types(node))
            .is_ok()
    }

    fn allocator(&self, location: Location) -> Result<Arc<Allocator>> {
        match location {
            Location::Host => Ok(Arc::clone(&self.host)),
            Location::HostPinned => Ok(Arc::clone(&self.pinned)),
            Location::Device(_) => Err(EngineError::configuration(format!(
                "provider {} has no allocator for {}",
                CPU_PROVIDER, location
            ))),
        }
    }

    fn create_kernel(&self, node: &Node, graph: &Graph) -> Result<Arc<dyn Kernel>> {
        let def = self
            .registry
            .lookup_node(node, CPU_PROVIDER, &graph.input_types(node))?;
        Ok(Arc::from(def.create(node)?))
    }

    fn can_transfer(&self, from: Location, to: Location) -> bool {
        from.is_host() && to.is_host()
    }

    fn transfer_tensor(&self, src: &Tensor, dst: Location) -> Result<Tensor> {
        if !self.can_transfer(src.location(), dst) {
            return Err(EngineError::configuration(format!(
                "provider {} cannot copy {} to {}",
                CPU_PROVIDER,
                src.location(),
                dst
            )));
        }
        if src.location() == dst {
            return Ok(src.clone());
        }
        copy_tensor(src, &self.allocator(dst)?)
    }

    fn launch(
        &self,
        kernel: Arc<dyn Kernel>,
        mut ctx: KernelContext,
        deadline: Option<Deadline>,
    ) -> Launch {
        if let Some(deadline) = deadline.filter(|d| d.expired()) {
            return Launch::Complete(Err(EngineError::Timeout {
                node: ctx.node_name().to_string(),
                timeout_ms: deadline.timeout_ms,
            }));
        }
        Launch::Complete(kernel.compute(&mut ctx).map(|_| ctx))
    }
}
