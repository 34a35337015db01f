use ember_engine::{ElementType, EngineError, F16, Kernel, KernelContext, Node, Result, Tensor};

const CAST_TYPES: [ElementType; 5] = [
    ElementType::Float16,
    ElementType::Float32,
    ElementType::Float64,
    ElementType::Int32,
    ElementType::Int64,
];

/// Numeric conversion to the type named by the `to` attribute
pub struct Cast {
    to: ElementType,
}

impl Cast {
    /// # Errors
    /// Returns `InvalidArgument` for a missing or unsupported `to` type
    pub fn from_node(node: &Node) -> Result<Cast> {
        let to = node
            .attr_string("to")
            .and_then(ElementType::from_name)
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!("Cast node {} has no valid 'to' type", node.name))
            })?;
        if !CAST_TYPES.contains(&to) {
            return Err(EngineError::UnsupportedType(to));
        }
        Ok(Cast { to })
    }
}

fn to_f64_values(x: &Tensor) -> Result<Vec<f64>> {
    Ok(match x.element_type() {
        ElementType::Float16 => x.as_slice::<F16>()?.iter().map(|v| v.to_f32() as f64).collect(),
        ElementType::Float32 => x.as_slice::<f32>()?.iter().map(|&v| v as f64).collect(),
        ElementType::Float64 => x.to_vec::<f64>()?,
        ElementType::Int32 => x.as_slice::<i32>()?.iter().map(|&v| v as f64).collect(),
        ElementType::Int64 => x.as_slice::<i64>()?.iter().map(|&v| v as f64).collect(),
        other => return Err(EngineError::UnsupportedType(other)),
    })
}

impl Kernel for Cast {
    fn compute(&self, ctx: &mut KernelContext) -> Result<()> {
        let x = ctx.required_input(0)?.clone();
        if x.element_type() == self.to {
            return ctx.set_output(0, x);
        }
        // direct path, going through f64 loses precision past 2^53
        if x.element_type() == ElementType::Int64 && self.to == ElementType::Int32 {
            let values = x.as_slice::<i64>()?;
            let out = ctx.output(0, x.shape(), self.to)?.as_mut_slice::<i32>()?;
            for (o, &v) in out.iter_mut().zip(values) {
                *o = v as i32;
            }
            return Ok(());
        }

        let values = to_f64_values(&x)?;
        let out = ctx.output(0, x.shape(), self.to)?;
        match self.to {
            ElementType::Float16 => fill(out.as_mut_slice::<F16>()?, &values, |v| F16::from_f32(v as f32)),
            ElementType::Float32 => fill(out.as_mut_slice::<f32>()?, &values, |v| v as f32),
            ElementType::Float64 => fill(out.as_mut_slice::<f64>()?, &values, |v| v),
            ElementType::Int32 => fill(out.as_mut_slice::<i32>()?, &values, |v| v as i32),
            ElementType::Int64 => fill(out.as_mut_slice::<i64>()?, &values, |v| v as i64),
            other => return Err(EngineError::UnsupportedType(other)),
        }
        Ok(())
    }
}

fn fill<T>(out: &mut [T], values: &[f64], convert: impl Fn(f64) -> T) {
    for (o, &v) in out.iter_mut().zip(values) {
        *o = convert(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_engine::{Allocator, Attribute};

    fn cast(x: Tensor, to: &str) -> Result<Tensor> {
        let node = Node::new("Cast", &["x"], &["y"])
            .with_attribute("to", Attribute::String(to.to_string()));
        let kernel = Cast::from_node(&node)?;
        let mut ctx = KernelContext::new("cast", vec![Some(x)], 1, Allocator::host());
        kernel.compute(&mut ctx)?;
        Ok(ctx.into_outputs()?.remove(0))
    }

    #[test]
    fn test_f32_to_f16_and_back() {
        let x = Tensor::from_slice(&[3], &[0.5f32, -2.0, 65504.0]).unwrap();
        let half = cast(x, "float16").unwrap();
        assert_eq!(half.element_type(), ElementType::Float16);
        let back = cast(half, "float32").unwrap();
        assert_eq!(back.to_vec::<f32>().unwrap(), vec![0.5, -2.0, 65504.0]);
    }

    #[test]
    fn test_float_to_int_truncates() {
        let x = Tensor::from_slice(&[2], &[2.9f64, -1.5]).unwrap();
        let y = cast(x, "int64").unwrap();
        assert_eq!(y.to_vec::<i64>().unwrap(), vec![2, -1]);
    }

    #[test]
    fn test_bad_target_type() {
        let x = Tensor::from_slice(&[1], &[1.0f32]).unwrap();
        assert!(cast(x.clone(), "bool").is_err());
        assert!(cast(x, "complex").is_err());
    }
}
