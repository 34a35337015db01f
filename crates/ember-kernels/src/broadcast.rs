use ember_engine::{EngineError, Result};

/// Numpy-style broadcast of two shapes
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut shape = vec![1; rank];
    for (i, dim) in shape.iter_mut().enumerate() {
        let da = dim_from_right(a, rank - 1 - i);
        let db = dim_from_right(b, rank - 1 - i);
        *dim = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            (x, y) => {
                return Err(EngineError::InvalidArgument(format!(
                    "shapes {:?} and {:?} don't broadcast: {} vs {}",
                    a, b, x, y
                )));
            }
        };
    }
    Ok(shape)
}

fn dim_from_right(shape: &[usize], from_right: usize) -> usize {
    if from_right < shape.len() {
        shape[shape.len() - 1 - from_right]
    } else {
        1
    }
}

/// Strides of `shape` laid over `out`, zero along broadcast dimensions
pub fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let offset = out.len() - shape.len();
    let mut strides = vec![0; out.len()];
    let mut stride: usize = 1;
    for i in (0..shape.len()).rev() {
        if shape[i] != 1 {
            strides[offset + i] = stride;
        }
        // only a zero-element shape can overflow, and its strides are never read
        stride = stride.saturating_mul(shape[i]);
    }
    strides
}

/// Source offset of output element `flat` given per-dimension strides
pub fn source_offset(mut flat: usize, out: &[usize], strides: &[usize]) -> usize {
    let mut offset = 0;
    for i in (0..out.len()).rev() {
        let dim = out[i];
        offset += (flat % dim) * strides[i];
        flat /= dim;
    }
    offset
}
