//! Kernel set for the ember engine
//!
//! Host kernels run on the `cpu` provider. The device set (Add, Relu,
//! MatMul) is registered per accelerator provider.

mod broadcast;
pub mod cpu;
pub mod device;
mod numeric;

pub use broadcast::broadcast_shapes;
pub use cpu::register_cpu_kernels;
pub use device::register_device_kernels;
pub use numeric::Numeric;

use ember_engine::{
    COMPUTE_SHADER_PROVIDER, CpuProvider, DeviceProvider, GPU_PROVIDER, KernelRegistry,
    ProviderRegistry, Result,
};
use std::sync::Arc;

/// Host kernels plus the device set for both accelerator providers
pub fn default_registry() -> Result<KernelRegistry> {
    let mut registry = KernelRegistry::new();
    register_cpu_kernels(&mut registry)?;
    register_device_kernels(&mut registry, GPU_PROVIDER)?;
    register_device_kernels(&mut registry, COMPUTE_SHADER_PROVIDER)?;
    Ok(registry)
}

/// `cpu`, `gpu` and `compute-shader` providers sharing [`default_registry`]
pub fn default_providers() -> Result<ProviderRegistry> {
    let kernels = Arc::new(default_registry()?);
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(CpuProvider::new(Arc::clone(&kernels))))?;
    providers.register(Arc::new(DeviceProvider::gpu(Arc::clone(&kernels))?))?;
    providers.register(Arc::new(DeviceProvider::compute_shader(kernels)?))?;
    Ok(providers)
}
