//! Device memory and host/device transfers.

use std::sync::Arc;

use gantry_driver::DevicePtr;

use crate::buffer::NativeBuffer;
use crate::context::{Context, ContextInner, ContextRef};
use crate::error::{Error, Result};
use crate::handle::DeviceHandle;
use crate::stack::ContextId;
use crate::stream::Stream;

/// A device allocation of fixed length, owned by the context that made it.
///
/// Freed via `cuMemFree` on drop unless already freed, or released together
/// with its context.
#[derive(Debug)]
pub struct DevicePointer {
    handle: DeviceHandle<DevicePtr>,
    len: usize,
    owner: ContextRef,
}

impl DevicePointer {
    pub(crate) fn alloc(ctx: &Arc<ContextInner>, bytes: usize) -> Result<Self> {
        if bytes == 0 {
            return Err(Error::InputConstraint(
                "cannot allocate zero bytes of device memory".into(),
            ));
        }
        let scope = ctx.enter()?;
        let ptr = scope.driver().mem_alloc(bytes)?;
        tracing::debug!(ctx = %ctx.id(), bytes, ptr = format_args!("{:#x}", ptr.0), "device alloc");
        Ok(Self {
            handle: DeviceHandle::new(ptr, "device pointer"),
            len: bytes,
            owner: ContextRef::new(ctx),
        })
    }

    /// Allocate device memory sized to `src` and copy it over.
    pub fn to_device(ctx: &Context, src: &NativeBuffer) -> Result<Self> {
        let ptr = ctx.alloc(src.len())?;
        ptr.copy_from(src)?;
        Ok(ptr)
    }

    /// Allocate device memory sized to `src` and queue the copy on `stream`.
    ///
    /// # Safety
    /// Same contract as [`DevicePointer::copy_from_async`].
    pub unsafe fn to_device_async(ctx: &Context, src: &NativeBuffer, stream: &Stream) -> Result<Self> {
        let ptr = ctx.alloc(src.len())?;
        ptr.copy_from_async(src, stream)?;
        Ok(ptr)
    }

    /// Length in bytes, fixed at allocation.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_freed(&self) -> bool {
        self.handle.is_freed()
    }

    /// The device address, or `InvalidState` once freed.
    pub fn raw(&self) -> Result<DevicePtr> {
        self.handle.get()
    }

    pub fn context_id(&self) -> ContextId {
        self.owner.id()
    }

    pub(crate) fn owner(&self) -> &ContextRef {
        &self.owner
    }

    fn check_source(&self, src: &NativeBuffer) -> Result<()> {
        if src.len() > self.len {
            return Err(Error::InputConstraint(format!(
                "source of {} bytes does not fit in device pointer of {} bytes",
                src.len(),
                self.len
            )));
        }
        Ok(())
    }

    fn check_destination(&self, dst: &NativeBuffer) -> Result<()> {
        if dst.len() < self.len {
            return Err(Error::InputConstraint(format!(
                "destination of {} bytes cannot hold device pointer of {} bytes",
                dst.len(),
                self.len
            )));
        }
        Ok(())
    }

    /// Copy `src` into the start of this allocation, blocking.
    pub fn copy_from(&self, src: &NativeBuffer) -> Result<()> {
        let ptr = self.raw()?;
        let bytes = src.bytes()?;
        self.check_source(src)?;
        let ctx = self.owner.get()?;
        let scope = ctx.enter()?;
        scope.driver().memcpy_htod(ptr, bytes)?;
        Ok(())
    }

    /// Copy this whole allocation into the start of `dst`, blocking.
    pub fn copy_to(&self, dst: &mut NativeBuffer) -> Result<()> {
        let ptr = self.raw()?;
        self.check_destination(dst)?;
        let len = self.len;
        let bytes = dst.bytes_mut()?;
        let ctx = self.owner.get()?;
        let scope = ctx.enter()?;
        scope.driver().memcpy_dtoh(&mut bytes[..len], ptr)?;
        Ok(())
    }

    /// Queue a copy of `src` into this allocation on `stream`.
    ///
    /// # Safety
    /// `src` must stay alive and unmodified until the copy has completed on
    /// `stream`, e.g. until `stream.synchronize()` or an event recorded
    /// after it is reached.
    pub unsafe fn copy_from_async(&self, src: &NativeBuffer, stream: &Stream) -> Result<()> {
        let ptr = self.raw()?;
        let bytes = src.bytes()?;
        self.check_source(src)?;
        self.owner.same_as(stream.owner(), "stream")?;
        let raw_stream = stream.raw()?;
        let ctx = self.owner.get()?;
        let scope = ctx.enter()?;
        scope
            .driver()
            .memcpy_htod_async(ptr, bytes.as_ptr(), bytes.len(), raw_stream)?;
        Ok(())
    }

    /// Queue a copy of this allocation into `dst` on `stream`.
    ///
    /// # Safety
    /// `dst` must stay alive and must not be read or written until the copy
    /// has completed on `stream`.
    pub unsafe fn copy_to_async(&self, dst: &mut NativeBuffer, stream: &Stream) -> Result<()> {
        let ptr = self.raw()?;
        self.check_destination(dst)?;
        self.owner.same_as(stream.owner(), "stream")?;
        let raw_stream = stream.raw()?;
        let len = self.len;
        let bytes = dst.bytes_mut()?;
        let ctx = self.owner.get()?;
        let scope = ctx.enter()?;
        scope
            .driver()
            .memcpy_dtoh_async(bytes.as_mut_ptr(), ptr, len, raw_stream)?;
        Ok(())
    }

    /// Release the allocation. Idempotent; a failed release leaves the
    /// pointer live so it can be retried.
    pub fn free(&mut self) -> Result<()> {
        let owner = &self.owner;
        let len = self.len;
        self.handle.release(|ptr| {
            let Some(ctx) = owner.live() else {
                return Ok(());
            };
            let scope = ctx.enter()?;
            scope.driver().mem_free(ptr)?;
            tracing::debug!(ctx = %ctx.id(), bytes = len, "device free");
            Ok(())
        })
    }
}

impl Drop for DevicePointer {
    fn drop(&mut self) {
        if let Err(err) = self.free() {
            tracing::warn!("failed to free device pointer: {err}");
        }
    }
}
