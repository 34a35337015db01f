use crate::broadcast::{broadcast_shapes, broadcast_strides, source_offset};
use crate::dispatch_numeric;
use crate::numeric::Numeric;
use ember_engine::{EngineError, Kernel, KernelContext, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn apply<T: Numeric>(self, a: T, b: T) -> Result<T> {
        match self {
            BinaryOp::Add => Ok(a.add(b)),
            BinaryOp::Sub => Ok(a.sub(b)),
            BinaryOp::Mul => Ok(a.mul(b)),
            BinaryOp::Div => a.div(b),
        }
    }
}

/// Broadcasting binary arithmetic
pub struct Binary {
    pub op: BinaryOp,
}

impl Kernel for Binary {
    fn compute(&self, ctx: &mut KernelContext) -> Result<()> {
        let a = ctx.required_input(0)?.clone();
        let b = ctx.required_input(1)?.clone();
        if a.element_type() != b.element_type() {
            return Err(EngineError::InvalidArgument(format!(
                "{:?} of {} and {}",
                self.op,
                a.element_type(),
                b.element_type()
            )));
        }
        let shape = broadcast_shapes(a.shape(), b.shape())?;
        dispatch_numeric!(a.element_type(), T => binary::<T>(self.op, &a, &b, &shape, ctx))
    }
}

fn binary<T: Numeric>(
    op: BinaryOp,
    a: &Tensor,
    b: &Tensor,
    shape: &[usize],
    ctx: &mut KernelContext,
) -> Result<()> {
    let lhs = a.as_slice::<T>()?;
    let rhs = b.as_slice::<T>()?;
    let out = ctx.output(0, shape, T::ELEMENT_TYPE)?.as_mut_slice::<T>()?;

    if a.shape() == b.shape() {
        for ((o, &x), &y) in out.iter_mut().zip(lhs).zip(rhs) {
            *o = op.apply(x, y)?;
        }
        return Ok(());
    }

    let lhs_strides = broadcast_strides(a.shape(), shape);
    let rhs_strides = broadcast_strides(b.shape(), shape);
    for (i, o) in out.iter_mut().enumerate() {
        let x = lhs[source_offset(i, shape, &lhs_strides)];
        let y = rhs[source_offset(i, shape, &rhs_strides)];
        *o = op.apply(x, y)?;
    }
    Ok(())
}

pub struct Relu;

impl Kernel for Relu {
    fn compute(&self, ctx: &mut KernelContext) -> Result<()> {
        let x = ctx.required_input(0)?.clone();
        dispatch_numeric!(x.element_type(), T => relu::<T>(&x, ctx))
    }
}

fn relu<T: Numeric>(x: &Tensor, ctx: &mut KernelContext) -> Result<()> {
    let input = x.as_slice::<T>()?;
    let out = ctx
        .output(0, x.shape(), T::ELEMENT_TYPE)?
        .as_mut_slice::<T>()?;
    for (o, &v) in out.iter_mut().zip(input) {
        *o = if v > T::zero() { v } else { T::zero() };
    }
    Ok(())
}

/// Passes its input through without copying
pub struct Identity;

impl Kernel for Identity {
    fn compute(&self, ctx: &mut KernelContext) -> Result<()> {
        let x = ctx.required_input(0)?.clone();
        ctx.set_output(0, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_engine::Allocator;

    fn run(kernel: &dyn Kernel, inputs: Vec<Tensor>) -> Result<Tensor> {
        let mut ctx = KernelContext::new(
            "test",
            inputs.into_iter().map(Some).collect(),
            1,
            Allocator::host(),
        );
        kernel.compute(&mut ctx)?;
        Ok(ctx.into_outputs()?.remove(0))
    }

    #[test]
    fn test_add_then_relu() {
        let a = Tensor::from_slice(&[3], &[1.0f32, -2.0, 3.0]).unwrap();
        let b = Tensor::from_slice(&[3], &[1.0f32, 1.0, 1.0]).unwrap();
        let c = run(&Binary { op: BinaryOp::Add }, vec![a, b]).unwrap();
        assert_eq!(c.to_vec::<f32>().unwrap(), vec![2.0, -1.0, 4.0]);
        let d = run(&Relu, vec![c]).unwrap();
        assert_eq!(d.to_vec::<f32>().unwrap(), vec![2.0, 0.0, 4.0]);
    }

    #[test]
    fn test_broadcast_mul() {
        let a = Tensor::from_slice(&[2, 2], &[1i64, 2, 3, 4]).unwrap();
        let b = Tensor::from_slice(&[2], &[10i64, 100]).unwrap();
        let c = run(&Binary { op: BinaryOp::Mul }, vec![a, b]).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.to_vec::<i64>().unwrap(), vec![10, 200, 30, 400]);
    }

    #[test]
    fn test_integer_div_by_zero_fails() {
        let a = Tensor::from_slice(&[2], &[4i32, 6]).unwrap();
        let b = Tensor::from_slice(&[2], &[2i32, 0]).unwrap();
        let err = run(&Binary { op: BinaryOp::Div }, vec![a, b]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_mixed_types_rejected() {
        let a = Tensor::from_slice(&[1], &[1.0f32]).unwrap();
        let b = Tensor::from_slice(&[1], &[1.0f64]).unwrap();
        assert!(run(&Binary { op: BinaryOp::Sub }, vec![a, b]).is_err());
    }

    #[test]
    fn test_identity_shares_buffer() {
        let x = Tensor::from_slice(&[2], &[5u8, 6]).unwrap();
        let y = run(&Identity, vec![x.clone()]).unwrap();
        assert_eq!(y.buffer_id(), x.buffer_id());
    }

    #[test]
    fn test_unsupported_type() {
        let x = Tensor::from_slice(&[1], &[1u8]).unwrap();
        assert!(matches!(
            run(&Relu, vec![x]),
            Err(EngineError::UnsupportedType(_))
        ));
    }
}
