pub mod allocator;
mod binding;
mod element;
pub mod error;
pub mod executor;
pub mod graph;
pub mod kernel;
mod location;
pub mod options;
pub mod partition;
pub mod plan;
pub mod planner;
mod profiler;
pub mod provider;
pub mod session;
mod tensor;

pub use allocator::{ALIGNMENT, Allocator, AllocatorStats, Buffer, HOST_ALLOCATOR};
pub use element::{ElementType, F16, TensorElement, f16_to_f32, f32_to_f16};
pub use error::{EngineError, ErrorCode, Result};
pub use executor::{RunPhase, RunStats};
pub use graph::{
    Attribute, DEFAULT_OPSET, Dim, Graph, GraphBuilder, MS_DOMAIN, Node, ONNX_DOMAIN, ValueInfo,
    fixed,
};
pub use kernel::{Kernel, KernelContext, KernelDef, KernelFactory, KernelRegistry};
pub use location::Location;
pub use options::{ExecutionMode, OptimizationLevel, SessionBuilder, SessionOptions};
pub use profiler::ProfileEvent;
pub use provider::{
    COMPUTE_SHADER_PROVIDER, CPU_PROVIDER, CpuProvider, DeviceProvider, ExecutionProvider,
    GPU_PROVIDER, ProviderKind, ProviderRegistry,
};
pub use session::Session;
pub use tensor::{Tensor, byte_size};
