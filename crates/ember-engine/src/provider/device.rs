use super::{
    Deadline, ExecutionProvider, Launch, Pending, ProviderKind, Transfer, copy_tensor,
};
use crate::graph::{Graph, Node};
use crate::{
    Allocator, ElementType, EngineError, Kernel, KernelContext, KernelRegistry, Location, Result,
    Tensor,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use tokio::sync::oneshot;

pub const GPU_PROVIDER: &str = "gpu";
pub const COMPUTE_SHADER_PROVIDER: &str = "compute-shader";

type DeviceJob = Box<dyn FnOnce() + Send>;

/// Simulated accelerator
///
/// Device memory is host memory tagged with the device location. Kernels
/// and copies run on a dedicated queue thread in submission order and report
/// completion through a oneshot channel. Host/device copies are staged
/// through pinned memory.
pub struct DeviceProvider {
    name: String,
    kind: ProviderKind,
    ordinal: u32,
    registry: Arc<KernelRegistry>,
    device: Arc<Allocator>,
    staging: Arc<Allocator>,
    queue: Option<mpsc::Sender<DeviceJob>>,
    worker: Option<thread::JoinHandle<()>>,
    submitted: AtomicU64,
}

impl DeviceProvider {
    /// Start a device provider and its queue thread
    ///
    /// # Errors
    /// Returns `Configuration` for a host provider kind and `Io` when the
    /// queue thread can't be spawned.
    pub fn new(
        name: &str,
        kind: ProviderKind,
        ordinal: u32,
        registry: Arc<KernelRegistry>,
    ) -> Result<Self> {
        if kind == ProviderKind::Cpu {
            return Err(EngineError::configuration(
                "a device provider needs an accelerator kind",
            ));
        }

        let (sender, receiver) = mpsc::channel::<DeviceJob>();
        let worker = thread::Builder::new()
            .name(format!("{}-queue", name))
            .spawn(move || {
                // FIFO: jobs run strictly in submission order
                for job in receiver {
                    job();
                }
            })?;

        log::debug!("{} provider {} started on device {}", kind, name, ordinal);

        Ok(DeviceProvider {
            name: name.to_string(),
            kind,
            ordinal,
            registry,
            device: Allocator::global(name, Location::Device(ordinal)),
            staging: Allocator::global(name, Location::HostPinned),
            queue: Some(sender),
            worker: Some(worker),
            submitted: AtomicU64::new(0),
        })
    }

    /// GPU-class provider on device 0
    pub fn gpu(registry: Arc<KernelRegistry>) -> Result<Self> {
        DeviceProvider::new(GPU_PROVIDER, ProviderKind::Gpu, 0, registry)
    }

    /// Compute-shader-class provider on device 1
    pub fn compute_shader(registry: Arc<KernelRegistry>) -> Result<Self> {
        DeviceProvider::new(
            COMPUTE_SHADER_PROVIDER,
            ProviderKind::ComputeShader,
            1,
            registry,
        )
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Number of kernels and copies submitted to the queue so far
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    fn location(&self) -> Location {
        Location::Device(self.ordinal)
    }

    /// Copy to run on the queue, checked up front
    fn copy_job(
        &self,
        src: &Tensor,
        dst: Location,
    ) -> Result<impl FnOnce() -> Result<Tensor> + Send + 'static> {
        let from = src.location();
        if !self.can_transfer(from, dst) {
            return Err(EngineError::configuration(format!(
                "provider {} cannot copy {} to {}",
                self.name, from, dst
            )));
        }
        let src = src.clone();
        let target = self.allocator(dst)?;
        // pageable memory goes through a pinned staging buffer
        let staging = (from == Location::Host || dst == Location::Host)
            .then(|| Arc::clone(&self.staging));
        Ok(move || {
            if from == dst {
                return Ok(src);
            }
            match staging {
                Some(staging) => copy_tensor(&copy_tensor(&src, &staging)?, &target),
                None => copy_tensor(&src, &target),
            }
        })
    }

    fn submit(&self, job: DeviceJob) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| EngineError::DeviceExecution(format!("{} queue is closed", self.name)))?;
        queue
            .send(job)
            .map_err(|_| EngineError::DeviceExecution(format!("{} queue is closed", self.name)))?;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for DeviceProvider {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{} queue thread panicked", self.name);
            }
        }
    }
}

impl ExecutionProvider for DeviceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn default_location(&self) -> Location {
        self.location()
    }

    fn can_execute(&self, node: &Node, graph: &Graph) -> bool {
        let types = graph.input_types(node);
        // strings never live in device memory
        if types.iter().flatten().any(|t| *t == ElementType::String) {
            return false;
        }
        self.registry.lookup_node(node, &self.name, &types).is_ok()
    }

    fn allocator(&self, location: Location) -> Result<Arc<Allocator>> {
        match location {
            l if l == self.location() => Ok(Arc::clone(&self.device)),
            Location::HostPinned => Ok(Arc::clone(&self.staging)),
            Location::Host => Ok(Allocator::host()),
            other => Err(EngineError::configuration(format!(
                "provider {} has no allocator for {}",
                self.name, other
            ))),
        }
    }

    fn create_kernel(&self, node: &Node, graph: &Graph) -> Result<Arc<dyn Kernel>> {
        let def = self
            .registry
            .lookup_node(node, &self.name, &graph.input_types(node))?;
        Ok(Arc::from(def.create(node)?))
    }

    fn can_transfer(&self, from: Location, to: Location) -> bool {
        let own = self.location();
        (from == own && (to.is_host() || to == own)) || (from.is_host() && to == own)
    }

    fn transfer_tensor(&self, src: &Tensor, dst: Location) -> Result<Tensor> {
        let copy = self.copy_job(src, dst)?;
        let (sender, receiver) = mpsc::sync_channel(1);
        self.submit(Box::new(move || {
            let _ = sender.send(copy());
        }))?;
        receiver.recv().map_err(|_| {
            EngineError::DeviceExecution(format!("{} queue dropped a copy to {}", self.name, dst))
        })?
    }

    fn enqueue_transfer(
        &self,
        node: &str,
        src: &Tensor,
        dst: Location,
        deadline: Option<Deadline>,
    ) -> Transfer {
        let copy = match self.copy_job(src, dst) {
            Ok(copy) => copy,
            Err(e) => return Transfer::Complete(Err(e)),
        };
        let (sender, receiver) = oneshot::channel();
        let job: DeviceJob = Box::new(move || {
            let _ = sender.send(copy());
        });
        match self.submit(job) {
            Ok(()) => Transfer::Pending(Pending::new(node.to_string(), receiver, deadline)),
            Err(e) => Transfer::Complete(Err(e)),
        }
    }

    fn launch(
        &self,
        kernel: Arc<dyn Kernel>,
        ctx: KernelContext,
        deadline: Option<Deadline>,
    ) -> Launch {
        let node = ctx.node_name().to_string();
        let (sender, receiver) = oneshot::channel();
        let job_node = node.clone();
        let job: DeviceJob = Box::new(move || {
            let mut ctx = ctx;
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| kernel.compute(&mut ctx))) {
                Ok(Ok(())) => Ok(ctx),
                Ok(Err(e)) => {
                    // release the run's buffers before it hears about the failure
                    drop(ctx);
                    Err(e)
                }
                Err(_) => {
                    drop(ctx);
                    Err(EngineError::DeviceExecution(format!(
                        "kernel of node {} panicked",
                        job_node
                    )))
                }
            };
            // the run may have stopped waiting; the outputs are dropped then
            let _ = sender.send(outcome);
        });

        match self.submit(job) {
            Ok(()) => Launch::Pending(Pending::new(node, receiver, deadline)),
            Err(e) => Launch::Complete(Err(e)),
        }
    }

    fn is_async(&self) -> bool {
        true
    }
}
