//! Host-side buffers and typed views over them.
//!
//! A [`NativeBuffer`] is a fixed-length run of host bytes, either ordinary
//! pageable memory or pinned (page-locked) memory allocated through a
//! context. Pinned buffers are what asynchronous transfers want. The typed
//! arrays on top read and write little-endian element encodings.

use std::marker::PhantomData;

use gantry_driver::HostPtr;

use crate::context::{Context, ContextRef};
use crate::error::{Error, Result};

enum Storage {
    Pageable(Vec<u8>),
    Pinned { ptr: HostPtr, owner: ContextRef },
    Freed,
}

/// Fixed-length host memory.
pub struct NativeBuffer {
    storage: Storage,
    len: usize,
}

impl NativeBuffer {
    /// Zeroed pageable memory.
    pub fn new(len: usize) -> Self {
        Self {
            storage: Storage::Pageable(vec![0; len]),
            len,
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self {
            len: bytes.len(),
            storage: Storage::Pageable(bytes),
        }
    }

    /// Zeroed pinned memory allocated through `ctx`.
    ///
    /// `ctx` cannot be destroyed while the buffer is alive.
    pub fn pinned(ctx: &Context, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InputConstraint(
                "cannot allocate an empty pinned buffer".into(),
            ));
        }
        let inner = ctx.inner();
        let ptr = {
            let scope = inner.enter()?;
            scope.driver().mem_alloc_host(len)?
        };
        // Safety: the driver returned a fresh allocation of `len` bytes.
        unsafe { std::ptr::write_bytes(ptr.0, 0, len) };
        inner.pinned_acquired();
        tracing::debug!(ctx = %inner.id(), bytes = len, "pinned host alloc");
        Ok(Self {
            storage: Storage::Pinned {
                ptr,
                owner: ContextRef::new(inner),
            },
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self.storage, Storage::Pinned { .. })
    }

    pub fn is_freed(&self) -> bool {
        matches!(self.storage, Storage::Freed)
    }

    pub fn bytes(&self) -> Result<&[u8]> {
        match &self.storage {
            Storage::Pageable(v) => Ok(v),
            // Safety: the allocation is `len` bytes and lives until `free`.
            Storage::Pinned { ptr, .. } => {
                Ok(unsafe { std::slice::from_raw_parts(ptr.0, self.len) })
            }
            Storage::Freed => Err(Error::freed("native buffer")),
        }
    }

    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.storage {
            Storage::Pageable(v) => Ok(v),
            Storage::Pinned { ptr, .. } => {
                Ok(unsafe { std::slice::from_raw_parts_mut(ptr.0, self.len) })
            }
            Storage::Freed => Err(Error::freed("native buffer")),
        }
    }

    pub fn get_u8(&self, index: usize) -> Result<u8> {
        let bytes = self.bytes()?;
        bytes
            .get(index)
            .copied()
            .ok_or_else(|| out_of_range(index, bytes.len()))
    }

    pub fn set_u8(&mut self, index: usize, value: u8) -> Result<()> {
        let bytes = self.bytes_mut()?;
        let len = bytes.len();
        *bytes.get_mut(index).ok_or_else(|| out_of_range(index, len))? = value;
        Ok(())
    }

    /// Release pinned memory. Idempotent; pageable buffers are left as-is.
    ///
    /// A failed release leaves the buffer pinned and still counted against
    /// its context.
    pub fn free(&mut self) -> Result<()> {
        let Storage::Pinned { ptr, owner } = &self.storage else {
            return Ok(());
        };
        let ptr = *ptr;
        let Ok(ctx) = owner.get() else {
            // the context was leaked, so the allocation is still mapped
            tracing::warn!(ctx = %owner.id(), "pinned buffer outlived its context; leaking");
            self.storage = Storage::Freed;
            return Ok(());
        };
        if !ctx.is_destroyed() {
            let scope = ctx.enter()?;
            scope.driver().mem_free_host(ptr)?;
            tracing::debug!(ctx = %ctx.id(), bytes = self.len, "pinned host free");
        }
        ctx.pinned_released();
        self.storage = Storage::Freed;
        Ok(())
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.free() {
            tracing::warn!("failed to free pinned buffer: {err}");
        }
    }
}

impl std::fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("len", &self.len)
            .field("pinned", &self.is_pinned())
            .field("freed", &self.is_freed())
            .finish()
    }
}

fn out_of_range(index: usize, len: usize) -> Error {
    Error::InputConstraint(format!("index {index} out of range for length {len}"))
}

/// A fixed-size value with a defined byte encoding, including any padding.
pub trait NativeStruct: Sized {
    const BYTE_LEN: usize;

    /// Encode into exactly `BYTE_LEN` bytes.
    fn write_to(&self, out: &mut [u8]);

    /// Decode from exactly `BYTE_LEN` bytes.
    fn read_from(bytes: &[u8]) -> Self;
}

macro_rules! native_scalar {
    ($($t:ty),*) => {$(
        impl NativeStruct for $t {
            const BYTE_LEN: usize = std::mem::size_of::<$t>();

            fn write_to(&self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn read_from(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_le_bytes(raw)
            }
        }
    )*};
}

native_scalar!(u8, i32, u32, f32);

/// Element-indexed view over a [`NativeBuffer`].
#[derive(Debug)]
pub struct NativeArray<T: NativeStruct> {
    buffer: NativeBuffer,
    len: usize,
    _marker: PhantomData<T>,
}

pub type NativeIntArray = NativeArray<i32>;
pub type NativeFloatArray = NativeArray<f32>;

impl<T: NativeStruct> NativeArray<T> {
    /// `len` zeroed elements in pageable memory.
    pub fn new(len: usize) -> Result<Self> {
        Ok(Self::wrap(NativeBuffer::new(Self::byte_len(len)?), len))
    }

    /// `len` zeroed elements in pinned memory.
    pub fn pinned(ctx: &Context, len: usize) -> Result<Self> {
        Ok(Self::wrap(NativeBuffer::pinned(ctx, Self::byte_len(len)?)?, len))
    }

    pub fn from_slice(values: &[T]) -> Self {
        let mut bytes = vec![0u8; values.len() * T::BYTE_LEN];
        for (chunk, v) in bytes.chunks_exact_mut(T::BYTE_LEN).zip(values) {
            v.write_to(chunk);
        }
        Self::wrap(NativeBuffer::from_bytes(bytes), values.len())
    }

    /// View an existing buffer; trailing bytes short of a whole element are
    /// ignored.
    pub fn from_buffer(buffer: NativeBuffer) -> Self {
        let len = buffer.len() / T::BYTE_LEN;
        Self::wrap(buffer, len)
    }

    fn byte_len(len: usize) -> Result<usize> {
        len.checked_mul(T::BYTE_LEN).ok_or_else(|| {
            Error::InputConstraint(format!(
                "{len} elements of {} bytes exceed the address space",
                T::BYTE_LEN
            ))
        })
    }

    fn wrap(buffer: NativeBuffer, len: usize) -> Self {
        Self {
            buffer,
            len,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn range(&self, index: usize) -> Result<std::ops::Range<usize>> {
        if index >= self.len {
            return Err(out_of_range(index, self.len));
        }
        let start = index * T::BYTE_LEN;
        Ok(start..start + T::BYTE_LEN)
    }

    pub fn get(&self, index: usize) -> Result<T> {
        let range = self.range(index)?;
        Ok(T::read_from(&self.buffer.bytes()?[range]))
    }

    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        let range = self.range(index)?;
        value.write_to(&mut self.buffer.bytes_mut()?[range]);
        Ok(())
    }

    /// Overwrite the leading elements with `values`.
    pub fn copy_from_slice(&mut self, values: &[T]) -> Result<()> {
        if values.len() > self.len {
            return Err(Error::InputConstraint(format!(
                "{} values do not fit in an array of {}",
                values.len(),
                self.len
            )));
        }
        let bytes = self.buffer.bytes_mut()?;
        for (chunk, v) in bytes.chunks_exact_mut(T::BYTE_LEN).zip(values) {
            v.write_to(chunk);
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        let bytes = self.buffer.bytes()?;
        Ok(bytes
            .chunks_exact(T::BYTE_LEN)
            .take(self.len)
            .map(T::read_from)
            .collect())
    }

    pub fn buffer(&self) -> &NativeBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut NativeBuffer {
        &mut self.buffer
    }

    pub fn into_buffer(self) -> NativeBuffer {
        self.buffer
    }
}

fn cells(width: usize, height: usize) -> Result<usize> {
    width
        .checked_mul(height)
        .ok_or_else(|| Error::InputConstraint(format!("{width}x{height} exceeds the address space")))
}

/// Row-major 2-D float array, indexed `x + y * width`.
#[derive(Debug)]
pub struct NativeFloatArray2D {
    array: NativeFloatArray,
    width: usize,
    height: usize,
}

impl NativeFloatArray2D {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        Ok(Self {
            array: NativeFloatArray::new(cells(width, height)?)?,
            width,
            height,
        })
    }

    pub fn pinned(ctx: &Context, width: usize, height: usize) -> Result<Self> {
        Ok(Self {
            array: NativeFloatArray::pinned(ctx, cells(width, height)?)?,
            width,
            height,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn index(&self, x: usize, y: usize) -> Result<usize> {
        if x >= self.width || y >= self.height {
            return Err(Error::InputConstraint(format!(
                "({x}, {y}) outside {}x{}",
                self.width, self.height
            )));
        }
        Ok(x + y * self.width)
    }

    pub fn get(&self, x: usize, y: usize) -> Result<f32> {
        self.array.get(self.index(x, y)?)
    }

    pub fn set(&mut self, x: usize, y: usize, value: f32) -> Result<()> {
        let i = self.index(x, y)?;
        self.array.set(i, value)
    }

    pub fn as_array(&self) -> &NativeFloatArray {
        &self.array
    }

    pub fn buffer(&self) -> &NativeBuffer {
        self.array.buffer()
    }

    pub fn buffer_mut(&mut self) -> &mut NativeBuffer {
        self.array.buffer_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Complex {
        re: f32,
        im: f32,
    }

    impl NativeStruct for Complex {
        const BYTE_LEN: usize = 8;

        fn write_to(&self, out: &mut [u8]) {
            self.re.write_to(&mut out[..4]);
            self.im.write_to(&mut out[4..]);
        }

        fn read_from(bytes: &[u8]) -> Self {
            Complex {
                re: f32::read_from(&bytes[..4]),
                im: f32::read_from(&bytes[4..]),
            }
        }
    }

    #[test]
    fn test_bytes() {
        let mut buf = NativeBuffer::new(4);
        assert_eq!(buf.len(), 4);
        assert!(!buf.is_pinned());
        buf.set_u8(2, 9).unwrap();
        assert_eq!(buf.get_u8(2).unwrap(), 9);
        assert_eq!(buf.bytes().unwrap(), &[0, 0, 9, 0]);
        assert!(matches!(buf.get_u8(4), Err(Error::InputConstraint(_))));
    }

    #[test]
    fn test_pageable_free_is_noop() {
        let mut buf = NativeBuffer::from_bytes(vec![1, 2, 3]);
        buf.free().unwrap();
        assert!(!buf.is_freed());
        assert_eq!(buf.bytes().unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_int_array_little_endian() {
        let mut arr = NativeIntArray::new(3).unwrap();
        arr.set(1, 0x0102_0304).unwrap();
        assert_eq!(arr.get(1).unwrap(), 0x0102_0304);
        assert_eq!(&arr.buffer().bytes().unwrap()[4..8], &[4, 3, 2, 1]);
        assert!(arr.set(3, 0).is_err());
    }

    #[test]
    fn test_float_array_from_slice() {
        let arr = NativeFloatArray::from_slice(&[1.5, -2.0, 0.25]);
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.to_vec().unwrap(), vec![1.5, -2.0, 0.25]);
    }

    #[test]
    fn test_struct_array() {
        let mut arr = NativeArray::<Complex>::new(2).unwrap();
        arr.set(1, Complex { re: 1.0, im: -1.0 }).unwrap();
        assert_eq!(arr.buffer().len(), 16);
        assert_eq!(arr.get(1).unwrap(), Complex { re: 1.0, im: -1.0 });
        assert_eq!(arr.get(0).unwrap(), Complex { re: 0.0, im: 0.0 });
    }

    #[test]
    fn test_float_array_2d_row_major() {
        let mut grid = NativeFloatArray2D::new(3, 2).unwrap();
        grid.set(2, 1, 7.0).unwrap();
        assert_eq!(grid.as_array().get(2 + 3).unwrap(), 7.0);
        assert_eq!(grid.get(2, 1).unwrap(), 7.0);
        assert!(grid.get(3, 0).is_err());
        assert!(grid.get(0, 2).is_err());
    }

    #[test]
    fn test_oversized_arrays_rejected() {
        assert!(matches!(
            NativeIntArray::new(usize::MAX / 2),
            Err(Error::InputConstraint(_))
        ));
        assert!(matches!(
            NativeFloatArray2D::new(usize::MAX, 2),
            Err(Error::InputConstraint(_))
        ));
    }

    #[test]
    fn test_copy_from_slice_bounds() {
        let mut arr = NativeIntArray::new(2).unwrap();
        arr.copy_from_slice(&[5]).unwrap();
        assert_eq!(arr.to_vec().unwrap(), vec![5, 0]);
        assert!(arr.copy_from_slice(&[1, 2, 3]).is_err());
    }
}
