mod cast;
mod elementwise;
mod matmul;
mod nms;
mod range;

pub use cast::Cast;
pub use elementwise::{Binary, BinaryOp, Identity, Relu};
pub use matmul::MatMul;
pub use nms::NonMaxSuppression;
pub use range::Range;

use ember_engine::{CPU_PROVIDER, ElementType, KernelDef, KernelRegistry, MS_DOMAIN, Result};

const NUMERIC: [ElementType; 6] = [
    ElementType::Float16,
    ElementType::Float32,
    ElementType::Float64,
    ElementType::Int16,
    ElementType::Int32,
    ElementType::Int64,
];

/// Register the host kernel set under the `cpu` provider
pub fn register_cpu_kernels(registry: &mut KernelRegistry) -> Result<()> {
    for (op_type, op) in [
        ("Add", BinaryOp::Add),
        ("Sub", BinaryOp::Sub),
        ("Mul", BinaryOp::Mul),
        ("Div", BinaryOp::Div),
    ] {
        registry.register(
            KernelDef::new(op_type, CPU_PROVIDER, move |_| Ok(Box::new(Binary { op })))
                .since(7)
                .types(&NUMERIC),
        )?;
    }
    registry.register(
        KernelDef::new("Relu", CPU_PROVIDER, |_| Ok(Box::new(Relu)))
            .since(6)
            .types(&NUMERIC),
    )?;
    registry.register(KernelDef::new("Identity", CPU_PROVIDER, |_| Ok(Box::new(Identity))))?;
    registry.register(
        KernelDef::new("MatMul", CPU_PROVIDER, |_| Ok(Box::new(MatMul)))
            .since(1)
            .types(&NUMERIC),
    )?;
    registry.register(
        KernelDef::new("Range", CPU_PROVIDER, |_| Ok(Box::new(Range)))
            .since(11)
            .types(&NUMERIC),
    )?;
    registry.register(
        KernelDef::new("Range", CPU_PROVIDER, |_| Ok(Box::new(Range)))
            .domain(MS_DOMAIN)
            .versions(1, 1)
            .types(&[
                ElementType::Float32,
                ElementType::Float64,
                ElementType::Int16,
                ElementType::Int32,
                ElementType::Int64,
            ]),
    )?;
    registry.register(
        KernelDef::new("NonMaxSuppression", CPU_PROVIDER, |node| {
            Ok(Box::new(NonMaxSuppression::from_node(node)?))
        })
        .since(10)
        .types(&[ElementType::Float32]),
    )?;
    registry.register(
        KernelDef::new("Cast", CPU_PROVIDER, |node| Ok(Box::new(Cast::from_node(node)?)))
            .since(6)
            .types(&[
                ElementType::Float16,
                ElementType::Float32,
                ElementType::Float64,
                ElementType::Int32,
                ElementType::Int64,
            ]),
    )?;
    log::debug!("registered {} host kernels", registry.operators(CPU_PROVIDER).len());
    Ok(())
}
