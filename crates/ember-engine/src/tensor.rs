use crate::{Allocator, Buffer, ElementType, EngineError, Location, Result, TensorElement};
use std::fmt;
use std::sync::Arc;

/// Typed, shaped, located handle to tensor data
///
/// Cloning a tensor shares its buffer. The buffer is returned to its
/// allocator when the last handle is dropped. Mutable access requires the
/// handle to be the only one.
#[derive(Clone)]
pub struct Tensor {
    element_type: ElementType,
    shape: Vec<usize>,
    data: TensorData,
}

#[derive(Clone)]
enum TensorData {
    Buffer(Arc<Buffer>),
    Strings(Arc<Vec<String>>),
}

/// Element count of `shape`, `None` when the product overflows
fn element_count(shape: &[usize]) -> Option<usize> {
    if shape.contains(&0) {
        return Some(0);
    }
    shape.iter().try_fold(1usize, |n, &dim| n.checked_mul(dim))
}

/// Bytes taken by a tensor of `shape` with `element_size` byte elements
///
/// `None` when the size can't be addressed, i.e. it overflows or exceeds
/// `isize::MAX`.
pub fn byte_size(shape: &[usize], element_size: usize) -> Option<usize> {
    element_count(shape)?
        .checked_mul(element_size)
        .filter(|&bytes| bytes <= isize::MAX as usize)
}

impl Tensor {
    /// Create a host tensor by copying `data`
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the data length doesn't match the shape
    pub fn from_slice<T: TensorElement>(shape: &[usize], data: &[T]) -> Result<Tensor> {
        Tensor::from_slice_in(&Allocator::host(), shape, data)
    }

    /// Create a tensor in the given allocator by copying `data`
    pub fn from_slice_in<T: TensorElement>(
        allocator: &Arc<Allocator>,
        shape: &[usize],
        data: &[T],
    ) -> Result<Tensor> {
        if element_count(shape) != Some(data.len()) {
            return Err(EngineError::invalid_argument(format!(
                "data length {} doesn't match shape {:?}",
                data.len(),
                shape
            )));
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buffer = allocator.allocate(bytes.len(), std::mem::align_of::<T>())?;
        buffer.as_bytes_mut().copy_from_slice(bytes);
        Ok(Tensor {
            element_type: T::ELEMENT_TYPE,
            shape: shape.to_vec(),
            data: TensorData::Buffer(Arc::new(buffer)),
        })
    }

    /// Create a rank-0 host tensor
    pub fn scalar<T: TensorElement>(value: T) -> Result<Tensor> {
        Tensor::from_slice(&[], &[value])
    }

    /// Create a host bool tensor, stored one byte per element
    pub fn from_bools(shape: &[usize], data: &[bool]) -> Result<Tensor> {
        let bytes: Vec<u8> = data.iter().map(|&b| b as u8).collect();
        let mut tensor = Tensor::from_slice(shape, &bytes)?;
        tensor.element_type = ElementType::Bool;
        Ok(tensor)
    }

    /// Create a host string tensor
    pub fn from_strings(shape: &[usize], data: Vec<String>) -> Result<Tensor> {
        if element_count(shape) != Some(data.len()) {
            return Err(EngineError::invalid_argument(format!(
                "{} strings don't match shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Tensor {
            element_type: ElementType::String,
            shape: shape.to_vec(),
            data: TensorData::Strings(Arc::new(data)),
        })
    }

    /// Create a zero-filled tensor in the given allocator
    ///
    /// # Errors
    /// Returns `AllocationFailure` when the shape is too large to address
    pub fn zeros(
        allocator: &Arc<Allocator>,
        element_type: ElementType,
        shape: &[usize],
    ) -> Result<Tensor> {
        let oversized = || allocator.oversized(element_type, shape);
        match element_type.size() {
            Some(size) => {
                let bytes = byte_size(shape, size).ok_or_else(oversized)?;
                Tensor::from_buffer(allocator.allocate(bytes, size)?, element_type, shape)
            }
            None => {
                let count = element_count(shape).ok_or_else(oversized)?;
                let mut strings = Vec::new();
                if strings.try_reserve_exact(count).is_err() {
                    return Err(oversized());
                }
                strings.resize(count, String::new());
                Tensor::from_strings(shape, strings)
            }
        }
    }

    /// Wrap an existing buffer without copying
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the buffer length doesn't match the
    /// shape, or for string tensors which have no fixed element size.
    pub fn from_buffer(buffer: Buffer, element_type: ElementType, shape: &[usize]) -> Result<Tensor> {
        let size = element_type.size().ok_or_else(|| {
            EngineError::invalid_argument("string tensors cannot wrap a raw buffer")
        })?;
        if byte_size(shape, size) != Some(buffer.len()) {
            return Err(EngineError::invalid_argument(format!(
                "buffer of {} bytes doesn't match {} tensor of shape {:?}",
                buffer.len(),
                element_type,
                shape
            )));
        }
        Ok(Tensor {
            element_type,
            shape: shape.to_vec(),
            data: TensorData::Buffer(Arc::new(buffer)),
        })
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements implied by the shape
    pub fn len(&self) -> usize {
        // constructors reject shapes whose count overflows
        element_count(&self.shape).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload size in bytes, 0 for string tensors
    pub fn byte_len(&self) -> usize {
        match &self.data {
            TensorData::Buffer(buffer) => buffer.len(),
            TensorData::Strings(_) => 0,
        }
    }

    pub fn location(&self) -> Location {
        match &self.data {
            TensorData::Buffer(buffer) => buffer.location(),
            TensorData::Strings(_) => Location::Host,
        }
    }

    /// Identity of the underlying buffer, `None` for string tensors
    pub fn buffer_id(&self) -> Option<u64> {
        match &self.data {
            TensorData::Buffer(buffer) => Some(buffer.id()),
            TensorData::Strings(_) => None,
        }
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        match &self.data {
            TensorData::Buffer(buffer) => Some(buffer),
            TensorData::Strings(_) => None,
        }
    }

    /// Whether this handle is the only reference to its data
    pub fn is_unique(&self) -> bool {
        match &self.data {
            TensorData::Buffer(buffer) => Arc::strong_count(buffer) == 1,
            TensorData::Strings(strings) => Arc::strong_count(strings) == 1,
        }
    }

    fn check_type<T: TensorElement>(&self) -> Result<()> {
        let matches = T::ELEMENT_TYPE == self.element_type
            || (self.element_type == ElementType::Bool && T::ELEMENT_TYPE == ElementType::Uint8);
        if matches {
            Ok(())
        } else {
            Err(EngineError::invalid_argument(format!(
                "tensor holds {}, accessed as {}",
                self.element_type,
                T::ELEMENT_TYPE
            )))
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::Buffer(buffer) => Some(buffer.as_bytes()),
            TensorData::Strings(_) => None,
        }
    }

    pub fn as_slice<T: TensorElement>(&self) -> Result<&[T]> {
        self.check_type::<T>()?;
        let bytes = self
            .as_bytes()
            .ok_or_else(|| EngineError::invalid_argument("string tensor has no typed view"))?;
        bytemuck::try_cast_slice(bytes)
            .map_err(|e| EngineError::invalid_argument(format!("tensor view: {}", e)))
    }

    /// Mutable typed view
    ///
    /// # Errors
    /// Returns `InvalidArgument` on a type mismatch or when the data is shared
    /// with another handle.
    pub fn as_mut_slice<T: TensorElement>(&mut self) -> Result<&mut [T]> {
        self.check_type::<T>()?;
        let buffer = self.unique_buffer_mut()?;
        bytemuck::try_cast_slice_mut(buffer.as_bytes_mut())
            .map_err(|e| EngineError::invalid_argument(format!("tensor view: {}", e)))
    }

    pub fn to_vec<T: TensorElement>(&self) -> Result<Vec<T>> {
        Ok(self.as_slice::<T>()?.to_vec())
    }

    pub fn to_bools(&self) -> Result<Vec<bool>> {
        if self.element_type != ElementType::Bool {
            return Err(EngineError::invalid_argument(format!(
                "tensor holds {}, accessed as bool",
                self.element_type
            )));
        }
        Ok(self.as_slice::<u8>()?.iter().map(|&b| b != 0).collect())
    }

    pub fn strings(&self) -> Result<&[String]> {
        match &self.data {
            TensorData::Strings(strings) => Ok(strings),
            TensorData::Buffer(_) => Err(EngineError::invalid_argument(format!(
                "tensor holds {}, accessed as string",
                self.element_type
            ))),
        }
    }

    fn unique_buffer_mut(&mut self) -> Result<&mut Buffer> {
        match &mut self.data {
            TensorData::Buffer(buffer) => Arc::get_mut(buffer).ok_or_else(|| {
                EngineError::invalid_argument("tensor data is shared and cannot be written")
            }),
            TensorData::Strings(_) => Err(EngineError::invalid_argument(
                "string tensor has no byte buffer",
            )),
        }
    }

    /// Copy the contents of `src` into this tensor
    ///
    /// Types and shapes must match exactly.
    pub fn copy_from(&mut self, src: &Tensor) -> Result<()> {
        if self.element_type != src.element_type || self.shape != src.shape {
            return Err(EngineError::invalid_argument(format!(
                "cannot copy {} {:?} into {} {:?}",
                src.element_type, src.shape, self.element_type, self.shape
            )));
        }
        if let TensorData::Strings(values) = &src.data {
            self.data = TensorData::Strings(Arc::clone(values));
            return Ok(());
        }
        let bytes = src
            .as_bytes()
            .ok_or_else(|| EngineError::invalid_argument("mismatched tensor storage"))?;
        self.unique_buffer_mut()?.as_bytes_mut().copy_from_slice(bytes);
        Ok(())
    }

    /// Take the buffer back if this is the last handle
    pub(crate) fn into_buffer(self) -> Option<Buffer> {
        match self.data {
            TensorData::Buffer(buffer) => Arc::try_unwrap(buffer).ok(),
            TensorData::Strings(_) => None,
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("element_type", &self.element_type)
            .field("shape", &self.shape)
            .field("location", &self.location())
            .field("buffer_id", &self.buffer_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::F16;

    #[test]
    fn test_from_slice_shape_mismatch() {
        let result = Tensor::from_slice(&[2, 2], &[1.0f32, 2.0, 3.0]);
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn test_oversized_shapes_are_rejected() {
        let err = Tensor::zeros(&Allocator::host(), ElementType::Float32, &[usize::MAX, 2])
            .unwrap_err();
        assert!(matches!(err, EngineError::AllocationFailure { .. }));

        let err = Tensor::zeros(&Allocator::host(), ElementType::Int64, &[1 << 61]).unwrap_err();
        assert!(matches!(err, EngineError::AllocationFailure { .. }));

        let result = Tensor::from_slice::<f32>(&[usize::MAX, 2], &[]);
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
        assert_eq!(byte_size(&[usize::MAX, 0], 4), Some(0));
        assert_eq!(byte_size(&[1 << 40, 1 << 40, 0], 4), Some(0));
        assert_eq!(byte_size(&[3, 5], 8), Some(120));
    }

    #[test]
    fn test_typed_access_checks_type() {
        let tensor = Tensor::from_slice(&[3], &[1i64, 2, 3]).unwrap();
        assert_eq!(tensor.as_slice::<i64>().unwrap(), &[1, 2, 3]);
        assert!(tensor.as_slice::<f64>().is_err());
        assert_eq!(tensor.byte_len(), 24);
    }

    #[test]
    fn test_shared_tensor_is_read_only() {
        let mut tensor = Tensor::from_slice(&[2], &[1.0f32, 2.0]).unwrap();
        let alias = tensor.clone();
        assert!(tensor.as_mut_slice::<f32>().is_err());
        drop(alias);
        tensor.as_mut_slice::<f32>().unwrap()[0] = 5.0;
        assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![5.0, 2.0]);
    }

    #[test]
    fn test_bool_and_string_tensors() {
        let flags = Tensor::from_bools(&[3], &[true, false, true]).unwrap();
        assert_eq!(flags.element_type(), ElementType::Bool);
        assert_eq!(flags.to_bools().unwrap(), vec![true, false, true]);

        let words = Tensor::from_strings(&[2], vec!["a".into(), "bc".into()]).unwrap();
        assert_eq!(words.strings().unwrap()[1], "bc");
        assert_eq!(words.buffer_id(), None);
        assert!(Tensor::from_strings(&[3], vec![]).is_err());
    }

    #[test]
    fn test_scalar_and_f16() {
        let scalar = Tensor::scalar(F16::from_f32(1.5)).unwrap();
        assert_eq!(scalar.rank(), 0);
        assert_eq!(scalar.len(), 1);
        assert_eq!(scalar.as_slice::<F16>().unwrap()[0].to_f32(), 1.5);
    }

    #[test]
    fn test_copy_from_requires_same_shape() {
        let src = Tensor::from_slice(&[2], &[1i32, 2]).unwrap();
        let mut dst = Tensor::zeros(&Allocator::host(), ElementType::Int32, &[2]).unwrap();
        dst.copy_from(&src).unwrap();
        assert_eq!(dst.to_vec::<i32>().unwrap(), vec![1, 2]);

        let mut wrong = Tensor::zeros(&Allocator::host(), ElementType::Int32, &[3]).unwrap();
        assert!(wrong.copy_from(&src).is_err());
    }

    #[test]
    fn test_into_buffer_only_when_unique() {
        let tensor = Tensor::from_slice(&[1], &[1u8]).unwrap();
        let alias = tensor.clone();
        assert!(tensor.into_buffer().is_none());
        assert!(alias.into_buffer().is_some());
    }
}
