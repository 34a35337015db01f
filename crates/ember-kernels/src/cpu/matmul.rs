use crate::dispatch_numeric;
use crate::numeric::Numeric;
use ember_engine::{EngineError, Kernel, KernelContext, Result, Tensor};

/// Matrix product of `[.., M, K]` and `[.., K, N]`
///
/// Batch dimensions must be equal, or the right operand is a plain matrix
/// shared by every batch.
pub struct MatMul;

struct Dims {
    batch: usize,
    m: usize,
    k: usize,
    n: usize,
    rhs_batched: bool,
    out_shape: Vec<usize>,
}

fn dims(a: &[usize], b: &[usize]) -> Result<Dims> {
    if a.len() < 2 || b.len() < 2 {
        return Err(EngineError::InvalidArgument(format!(
            "MatMul needs operands of rank 2 or more, got {:?} and {:?}",
            a, b
        )));
    }
    let (m, k) = (a[a.len() - 2], a[a.len() - 1]);
    let (kb, n) = (b[b.len() - 2], b[b.len() - 1]);
    if k != kb {
        return Err(EngineError::InvalidArgument(format!(
            "MatMul inner dimensions differ: {:?} x {:?}",
            a, b
        )));
    }
    let a_batch = &a[..a.len() - 2];
    let b_batch = &b[..b.len() - 2];
    let rhs_batched = !b_batch.is_empty();
    if rhs_batched && a_batch != b_batch {
        return Err(EngineError::InvalidArgument(format!(
            "MatMul batch dimensions differ: {:?} x {:?}",
            a, b
        )));
    }

    let mut out_shape = a_batch.to_vec();
    out_shape.extend([m, n]);
    Ok(Dims {
        batch: a_batch.iter().product(),
        m,
        k,
        n,
        rhs_batched,
        out_shape,
    })
}

impl Kernel for MatMul {
    fn compute(&self, ctx: &mut KernelContext) -> Result<()> {
        let a = ctx.required_input(0)?.clone();
        let b = ctx.required_input(1)?.clone();
        if a.element_type() != b.element_type() {
            return Err(EngineError::InvalidArgument(format!(
                "MatMul of {} and {}",
                a.element_type(),
                b.element_type()
            )));
        }
        let dims = dims(a.shape(), b.shape())?;
        dispatch_numeric!(a.element_type(), T => matmul::<T>(&a, &b, &dims, ctx))
    }
}

fn matmul<T: Numeric>(a: &Tensor, b: &Tensor, dims: &Dims, ctx: &mut KernelContext) -> Result<()> {
    let lhs = a.as_slice::<T>()?;
    let rhs = b.as_slice::<T>()?;
    let out = ctx
        .output(0, &dims.out_shape, T::ELEMENT_TYPE)?
        .as_mut_slice::<T>()?;

    let Dims { m, k, n, .. } = *dims;
    for batch in 0..dims.batch {
        let lhs = &lhs[batch * m * k..(batch + 1) * m * k];
        let rhs = if dims.rhs_batched {
            &rhs[batch * k * n..(batch + 1) * k * n]
        } else {
            rhs
        };
        let out = &mut out[batch * m * n..(batch + 1) * m * n];
        for i in 0..m {
            for j in 0..n {
                let mut acc = T::zero();
                for p in 0..k {
                    acc = acc.add(lhs[i * k + p].mul(rhs[p * n + j]));
                }
                out[i * n + j] = acc;
            }
        }
    }
    Ok(())
}
