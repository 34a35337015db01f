use crate::cpu::{Binary, BinaryOp, MatMul, Relu};
use ember_engine::{ElementType, EngineError, Kernel, KernelContext, KernelDef, KernelRegistry, Result};

const DEVICE_TYPES: [ElementType; 2] = [ElementType::Float16, ElementType::Float32];

/// Kernel run on a device queue, reading operands from device memory
struct OnDevice<K> {
    op_type: &'static str,
    inner: K,
}

impl<K: Kernel> Kernel for OnDevice<K> {
    fn compute(&self, ctx: &mut KernelContext) -> Result<()> {
        for index in 0..ctx.input_count() {
            if let Some(input) = ctx.input(index) {
                if !input.location().is_device() {
                    return Err(EngineError::DeviceExecution(format!(
                        "{} on node {} got input {} in {}",
                        self.op_type,
                        ctx.node_name(),
                        index,
                        input.location()
                    )));
                }
            }
        }
        self.inner.compute(ctx)
    }
}

fn on_device<K: Kernel + 'static>(op_type: &'static str, inner: K) -> Box<dyn Kernel> {
    Box::new(OnDevice { op_type, inner })
}

/// Register the accelerator kernel set under `provider`
///
/// MatMul is registered as two version ranges, 1 to 12 and 13 onwards.
pub fn register_device_kernels(registry: &mut KernelRegistry, provider: &str) -> Result<()> {
    registry.register(
        KernelDef::new("Add", provider, |_| {
            Ok(on_device("Add", Binary { op: BinaryOp::Add }))
        })
        .since(7)
        .types(&DEVICE_TYPES),
    )?;
    registry.register(
        KernelDef::new("Relu", provider, |_| Ok(on_device("Relu", Relu)))
            .since(6)
            .types(&DEVICE_TYPES),
    )?;
    registry.register(
        KernelDef::new("MatMul", provider, |_| Ok(on_device("MatMul", MatMul)))
            .versions(1, 12)
            .types(&[ElementType::Float32]),
    )?;
    registry.register(
        KernelDef::new("MatMul", provider, |_| Ok(on_device("MatMul", MatMul)))
            .since(13)
            .types(&DEVICE_TYPES),
    )?;
    log::debug!("registered device kernels for {}", provider);
    Ok(())
}
