mod cpu;
mod device;

pub use cpu::{CPU_PROVIDER, CpuProvider};
pub use device::{COMPUTE_SHADER_PROVIDER, DeviceProvider, GPU_PROVIDER};

use crate::graph::{Graph, Node};
use crate::{
    ALIGNMENT, Allocator, ElementType, EngineError, Kernel, KernelContext, Location, Result,
    Tensor,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Closed set of backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Cpu,
    Gpu,
    ComputeShader,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Cpu => write!(f, "CPU"),
            ProviderKind::Gpu => write!(f, "GPU"),
            ProviderKind::ComputeShader => write!(f, "ComputeShader"),
        }
    }
}

/// Point in time after which a run's kernels fail with `Timeout`
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub at: Instant,
    pub timeout_ms: u64,
}

impl Deadline {
    pub fn after_ms(timeout_ms: u64) -> Self {
        Deadline {
            at: Instant::now() + std::time::Duration::from_millis(timeout_ms),
            timeout_ms,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Result of handing a kernel to a provider
pub enum Launch {
    /// The kernel ran on the calling thread
    Complete(Result<KernelContext>),
    /// The kernel was queued on the device
    Pending(PendingKernel),
}

/// Result of handing a tensor copy to a provider
pub enum Transfer {
    /// The copy ran on the calling thread
    Complete(Result<Tensor>),
    /// The copy was queued on the device
    Pending(PendingTransfer),
}

/// Completion handle of queued device work
///
/// The device queue is the single writer of the completion signal.
pub struct Pending<T> {
    node: String,
    receiver: oneshot::Receiver<Result<T>>,
    deadline: Option<Deadline>,
}

pub type PendingKernel = Pending<KernelContext>;
pub type PendingTransfer = Pending<Tensor>;

impl<T> Pending<T> {
    pub(crate) fn new(
        node: String,
        receiver: oneshot::Receiver<Result<T>>,
        deadline: Option<Deadline>,
    ) -> Self {
        Pending {
            node,
            receiver,
            deadline,
        }
    }

    /// Node the work belongs to
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Wait for the work to finish
    ///
    /// # Errors
    /// Returns `Timeout` when the run deadline passes first, the work's own
    /// error when it failed, and `DeviceExecution` when the queue dropped the
    /// job.
    pub async fn wait(self) -> Result<T> {
        let Pending {
            node,
            receiver,
            deadline,
        } = self;
        let received = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.at, receiver)
                .await
                .map_err(|_| EngineError::Timeout {
                    node: node.clone(),
                    timeout_ms: deadline.timeout_ms,
                })?,
            None => receiver.await,
        };
        received.map_err(|_| {
            EngineError::DeviceExecution(format!("device queue dropped node {}", node))
        })?
    }
}

/// Device backend
///
/// A provider declares which nodes it can run, hands out allocators for the
/// locations it owns, builds kernels and moves tensors across the locations
/// it can reach.
pub trait ExecutionProvider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Location kernel inputs and outputs live in by default
    fn default_location(&self) -> Location;

    /// Locations kernel outputs may be allocated in directly
    fn output_locations(&self) -> Vec<Location> {
        vec![self.default_location()]
    }

    /// Locations kernels can read without a transfer
    fn input_locations(&self) -> Vec<Location> {
        vec![self.default_location()]
    }

    fn can_execute(&self, node: &Node, graph: &Graph) -> bool;

    /// # Errors
    /// Returns `Configuration` for a location the provider doesn't own
    fn allocator(&self, location: Location) -> Result<Arc<Allocator>>;

    fn create_kernel(&self, node: &Node, graph: &Graph) -> Result<Arc<dyn Kernel>>;

    fn can_transfer(&self, from: Location, to: Location) -> bool;

    /// Copy a tensor and wait for the copy
    fn transfer_tensor(&self, src: &Tensor, dst: Location) -> Result<Tensor>;

    /// Start a copy on behalf of `node` within a run
    ///
    /// Asynchronous providers order the copy with the kernels already queued.
    fn enqueue_transfer(
        &self,
        _node: &str,
        src: &Tensor,
        dst: Location,
        _deadline: Option<Deadline>,
    ) -> Transfer {
        Transfer::Complete(self.transfer_tensor(src, dst))
    }

    /// Run or enqueue a kernel
    fn launch(
        &self,
        kernel: Arc<dyn Kernel>,
        ctx: KernelContext,
        deadline: Option<Deadline>,
    ) -> Launch;

    /// Whether kernels complete asynchronously
    fn is_async(&self) -> bool {
        false
    }
}

/// Copy a tensor into a fresh buffer from `allocator`
pub(crate) fn copy_tensor(src: &Tensor, allocator: &Arc<Allocator>) -> Result<Tensor> {
    match src.as_bytes() {
        Some(bytes) => {
            let mut buffer = allocator.allocate(bytes.len(), ALIGNMENT)?;
            buffer.as_bytes_mut().copy_from_slice(bytes);
            Tensor::from_buffer(buffer, src.element_type(), src.shape())
        }
        None if allocator.location().is_host() => Ok(src.clone()),
        None => Err(EngineError::UnsupportedType(ElementType::String)),
    }
}

/// Named providers in registration order
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ExecutionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry {
            providers: Vec::new(),
        }
    }

    /// # Errors
    /// Returns `Configuration` when the name is already taken
    pub fn register(&mut self, provider: Arc<dyn ExecutionProvider>) -> Result<()> {
        if self.get(provider.name()).is_some() {
            return Err(EngineError::configuration(format!(
                "provider {} is already registered",
                provider.name()
            )));
        }
        self.providers.push(provider);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutionProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Providers in execution priority, highest first
    ///
    /// An empty priority list selects every registered provider in
    /// registration order. Host providers always rank lowest, and the first
    /// registered host provider is appended when the list names none.
    ///
    /// # Errors
    /// Returns `Configuration` for an unknown or repeated name, or when no
    /// provider ends up selected.
    pub fn resolve(&self, priority: &[String]) -> Result<Vec<Arc<dyn ExecutionProvider>>> {
        let mut selected: Vec<Arc<dyn ExecutionProvider>> = if priority.is_empty() {
            self.providers.clone()
        } else {
            let mut selected = Vec::with_capacity(priority.len());
            for name in priority {
                let provider = self.get(name).ok_or_else(|| {
                    EngineError::configuration(format!("unknown execution provider {}", name))
                })?;
                if selected
                    .iter()
                    .any(|p: &Arc<dyn ExecutionProvider>| p.name() == name)
                {
                    return Err(EngineError::configuration(format!(
                        "execution provider {} listed twice",
                        name
                    )));
                }
                selected.push(provider);
            }
            selected
        };

        if !selected.iter().any(|p| p.kind() == ProviderKind::Cpu) {
            if let Some(host) = self.providers.iter().find(|p| p.kind() == ProviderKind::Cpu) {
                selected.push(Arc::clone(host));
            }
        }

        // stable: keeps the configured order within each group
        selected.sort_by_key(|p| p.kind() == ProviderKind::Cpu);

        if selected.is_empty() {
            return Err(EngineError::configuration("no execution providers available"));
        }
        Ok(selected)
    }
}
