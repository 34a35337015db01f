use crate::dispatch_numeric;
use crate::numeric::Numeric;
use ember_engine::{ElementType, EngineError, F16, Kernel, KernelContext, Result, Tensor};

/// `[start, start + delta, ...)` up to `limit`, delta defaults to one
pub struct Range;

fn scalar_like<'a>(tensor: &'a Tensor, what: &str) -> Result<&'a Tensor> {
    let scalar = tensor.rank() == 0 || (tensor.rank() == 1 && tensor.shape()[0] == 1);
    if scalar {
        Ok(tensor)
    } else {
        Err(EngineError::InvalidArgument(format!(
            "{} in Range should be a scalar-like tensor, got shape {:?}",
            what,
            tensor.shape()
        )))
    }
}

/// Element count `max(0, ceil((limit - start) / delta))`
fn element_count(start: f64, limit: f64, delta: f64) -> Result<usize> {
    if delta == 0.0 {
        return Err(EngineError::InvalidArgument(
            "delta in Range can not be zero".to_string(),
        ));
    }
    let n = ((limit - start) / delta).ceil();
    if n.is_nan() || n <= 0.0 {
        return Ok(0);
    }
    if n >= isize::MAX as f64 {
        return Err(EngineError::InvalidArgument(format!(
            "Range from {} to {} by {} has too many elements",
            start, limit, delta
        )));
    }
    Ok(n as usize)
}

impl Kernel for Range {
    fn compute(&self, ctx: &mut KernelContext) -> Result<()> {
        let start = scalar_like(ctx.required_input(0)?, "start")?.clone();
        let limit = scalar_like(ctx.required_input(1)?, "limit")?.clone();
        let delta = match ctx.input(2) {
            Some(delta) => Some(scalar_like(delta, "delta")?.clone()),
            None => None,
        };
        let ty = start.element_type();
        if limit.element_type() != ty || delta.as_ref().is_some_and(|d| d.element_type() != ty) {
            return Err(EngineError::InvalidArgument(
                "Range inputs must share one element type".to_string(),
            ));
        }

        if ty == ElementType::Float16 {
            return range_f16(&start, &limit, delta.as_ref(), ctx);
        }
        dispatch_numeric!(ty, T => range::<T>(&start, &limit, delta.as_ref(), ctx))
    }
}

fn range<T: Numeric>(
    start: &Tensor,
    limit: &Tensor,
    delta: Option<&Tensor>,
    ctx: &mut KernelContext,
) -> Result<()> {
    let mut value = start.as_slice::<T>()?[0];
    let end = limit.as_slice::<T>()?[0];
    let step = match delta {
        Some(delta) => delta.as_slice::<T>()?[0],
        None => T::from_f64(1.0),
    };
    let n = element_count(value.to_f64(), end.to_f64(), step.to_f64())?;

    let out = ctx.output(0, &[n], T::ELEMENT_TYPE)?.as_mut_slice::<T>()?;
    for o in out.iter_mut() {
        *o = value;
        value = value.add(step);
    }
    Ok(())
}

fn range_f16(
    start: &Tensor,
    limit: &Tensor,
    delta: Option<&Tensor>,
    ctx: &mut KernelContext,
) -> Result<()> {
    let mut value = start.as_slice::<F16>()?[0].to_f32();
    let end = limit.as_slice::<F16>()?[0].to_f32();
    let step = match delta {
        Some(delta) => delta.as_slice::<F16>()?[0].to_f32(),
        None => 1.0,
    };
    let n = element_count(value as f64, end as f64, step as f64)?;

    let out = ctx
        .output(0, &[n], ElementType::Float16)?
        .as_mut_slice::<F16>()?;
    for o in out.iter_mut() {
        *o = F16::from_f32(value);
        value += step;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_engine::Allocator;

    fn run(inputs: Vec<Option<Tensor>>) -> Result<Tensor> {
        let mut ctx = KernelContext::new("range", inputs, 1, Allocator::host());
        Range.compute(&mut ctx)?;
        Ok(ctx.into_outputs()?.remove(0))
    }

    #[test]
    fn test_integer_range() {
        let out = run(vec![
            Some(Tensor::scalar(0i32).unwrap()),
            Some(Tensor::scalar(10i32).unwrap()),
            Some(Tensor::scalar(3i32).unwrap()),
        ])
        .unwrap();
        assert_eq!(out.shape(), &[4]);
        assert_eq!(out.to_vec::<i32>().unwrap(), vec![0, 3, 6, 9]);
    }

    #[test]
    fn test_zero_delta_is_invalid() {
        let err = run(vec![
            Some(Tensor::scalar(0.0f32).unwrap()),
            Some(Tensor::scalar(10.0f32).unwrap()),
            Some(Tensor::scalar(0.0f32).unwrap()),
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_default_delta_and_empty_range() {
        let out = run(vec![
            Some(Tensor::from_slice(&[1], &[2i64]).unwrap()),
            Some(Tensor::scalar(5i64).unwrap()),
            None,
        ])
        .unwrap();
        assert_eq!(out.to_vec::<i64>().unwrap(), vec![2, 3, 4]);

        let out = run(vec![
            Some(Tensor::scalar(5.0f64).unwrap()),
            Some(Tensor::scalar(1.0f64).unwrap()),
            None,
        ])
        .unwrap();
        assert_eq!(out.shape(), &[0]);
    }

    #[test]
    fn test_negative_delta() {
        let out = run(vec![
            Some(Tensor::scalar(10i16).unwrap()),
            Some(Tensor::scalar(4i16).unwrap()),
            Some(Tensor::scalar(-3i16).unwrap()),
        ])
        .unwrap();
        assert_eq!(out.to_vec::<i16>().unwrap(), vec![10, 7]);
    }

    #[test]
    fn test_non_scalar_start_is_invalid() {
        let err = run(vec![
            Some(Tensor::from_slice(&[2], &[0.0f32, 1.0]).unwrap()),
            Some(Tensor::scalar(10.0f32).unwrap()),
            None,
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_unbounded_range_is_invalid() {
        let err = run(vec![
            Some(Tensor::scalar(0.0f32).unwrap()),
            Some(Tensor::scalar(1e30f32).unwrap()),
            None,
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        let err = run(vec![
            Some(Tensor::scalar(0.0f64).unwrap()),
            Some(Tensor::scalar(f64::INFINITY).unwrap()),
            None,
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_range_larger_than_memory_fails_allocation() {
        // the count fits in usize but its f64 byte size does not
        let err = run(vec![
            Some(Tensor::scalar(0.0f64).unwrap()),
            Some(Tensor::scalar(4e18f64).unwrap()),
            None,
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::AllocationFailure { .. }));
    }

    #[test]
    fn test_f16_range_runs_in_f32() {
        let out = run(vec![
            Some(Tensor::scalar(F16::from_f32(0.0)).unwrap()),
            Some(Tensor::scalar(F16::from_f32(1.0)).unwrap()),
            Some(Tensor::scalar(F16::from_f32(0.25)).unwrap()),
        ])
        .unwrap();
        let values: Vec<f32> = out
            .to_vec::<F16>()
            .unwrap()
            .into_iter()
            .map(|h| h.to_f32())
            .collect();
        assert_eq!(values, vec![0.0, 0.25, 0.5, 0.75]);
    }
}
