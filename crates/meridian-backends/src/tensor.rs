//! Typed views over buffers

use meridian_core::{DataType, Element, MemoryLocation, TensorShape};

use crate::allocator::Allocator;
use crate::error::{BackendError, Result};
use crate::memory::BufferRef;

/// A typed, shaped view over a buffer. Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct Tensor {
    dtype: DataType,
    shape: TensorShape,
    element_count: usize,
    buffer: BufferRef,
}

fn byte_len(dtype: DataType, shape: &TensorShape) -> Result<(usize, usize)> {
    let elements = shape
        .element_count()
        .ok_or_else(|| BackendError::InvalidShape(shape.to_string()))?;
    let bytes = elements
        .checked_mul(dtype.size())
        .ok_or_else(|| BackendError::InvalidShape(format!("{shape} of {dtype} overflows")))?;
    Ok((elements, bytes))
}

impl Tensor {
    /// Wrap an existing buffer. The buffer may be larger than the tensor.
    pub fn from_buffer(dtype: DataType, shape: impl Into<TensorShape>, buffer: BufferRef) -> Result<Self> {
        let shape = shape.into();
        let (element_count, bytes) = byte_len(dtype, &shape)?;
        if bytes > buffer.len() {
            return Err(BackendError::BufferTooSmall {
                needed: bytes,
                actual: buffer.len(),
            });
        }
        Ok(Self {
            dtype,
            shape,
            element_count,
            buffer,
        })
    }

    /// Zero-filled tensor in `allocator`'s memory.
    pub fn allocate(allocator: &dyn Allocator, dtype: DataType, shape: impl Into<TensorShape>) -> Result<Self> {
        let shape = shape.into();
        let (_, bytes) = byte_len(dtype, &shape)?;
        let buffer = allocator.alloc(bytes)?;
        Self::from_buffer(dtype, shape, buffer)
    }

    /// Tensor holding `data`. The allocator must hand out host-visible memory.
    pub fn from_slice<T: Element>(allocator: &dyn Allocator, shape: impl Into<TensorShape>, data: &[T]) -> Result<Self> {
        let shape = shape.into();
        let (elements, _) = byte_len(T::DATA_TYPE, &shape)?;
        if elements != data.len() {
            return Err(BackendError::ShapeMismatch {
                src: data.len(),
                dst: elements,
            });
        }
        let tensor = Self::allocate(allocator, T::DATA_TYPE, shape)?;
        tensor.buffer.write_bytes(bytemuck::cast_slice(data))?;
        Ok(tensor)
    }

    /// Read the elements back. Host-visible tensors only.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DATA_TYPE != self.dtype {
            return Err(BackendError::TypeMismatch {
                expected: self.dtype,
                actual: T::DATA_TYPE,
            });
        }
        let bytes = self.buffer.read_bytes()?;
        Ok(bytemuck::pod_collect_to_vec(&bytes[..self.size_in_bytes()]))
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn size_in_bytes(&self) -> usize {
        self.element_count * self.dtype.size()
    }

    pub fn buffer(&self) -> &BufferRef {
        &self.buffer
    }

    pub fn location(&self) -> MemoryLocation {
        self.buffer.location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HostAllocator;
    use crate::memory::Buffer;

    #[test]
    fn host_tensor_roundtrip() {
        let alloc = HostAllocator::plain();
        let t = Tensor::from_slice(&alloc, [2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.element_count(), 6);
        assert_eq!(t.size_in_bytes(), 24);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn slice_length_must_match_shape() {
        let alloc = HostAllocator::plain();
        let err = Tensor::from_slice(&alloc, [4], &[1i32, 2]).unwrap_err();
        assert!(matches!(err, BackendError::ShapeMismatch { src: 2, dst: 4 }));
    }

    #[test]
    fn reading_with_wrong_type_fails() {
        let alloc = HostAllocator::plain();
        let t = Tensor::allocate(&alloc, DataType::Float32, [2]).unwrap();
        assert!(matches!(t.to_vec::<i32>(), Err(BackendError::TypeMismatch { .. })));
    }

    #[test]
    fn symbolic_shapes_cannot_be_allocated() {
        let alloc = HostAllocator::plain();
        let err = Tensor::allocate(&alloc, DataType::Float32, [-1, 4]).unwrap_err();
        assert!(matches!(err, BackendError::InvalidShape(_)));
    }

    #[test]
    fn buffer_must_hold_the_tensor() {
        let buf = Buffer::zeroed(MemoryLocation::host(), 7);
        let err = Tensor::from_buffer(DataType::Float64, [1], buf).unwrap_err();
        assert!(matches!(err, BackendError::BufferTooSmall { needed: 8, actual: 7 }));
    }
}
