//! The driver capability consumed by `gantry-core`.
//!
//! Every method maps to one driver entry point and returns its status as a
//! [`DriverResult`]. Calls that act on "the current context" use whatever the
//! calling thread has pushed; keeping that right is the caller's job.

use std::path::Path;

use crate::error::DriverResult;
use crate::types::{
    DeviceProperties, DevicePtr, HostPtr, LaunchConfig, RawContext, RawEvent, RawFunction,
    RawModule, RawStream,
};

pub trait Driver: Send + Sync {
    /// Short backend name for logs (`"cuda"`, `"sim"`).
    fn name(&self) -> &str;

    // -- initialization and devices ------------------------------------------

    fn init(&self) -> DriverResult<()>;
    fn device_count(&self) -> DriverResult<u32>;
    fn device_properties(&self, ordinal: u32) -> DriverResult<DeviceProperties>;

    // -- contexts -------------------------------------------------------------

    /// Create a context on `ordinal`. The new context is left pushed on the
    /// calling thread's stack.
    fn context_create(&self, flags: u32, ordinal: u32) -> DriverResult<RawContext>;
    fn context_destroy(&self, ctx: RawContext) -> DriverResult<()>;
    fn context_push(&self, ctx: RawContext) -> DriverResult<()>;
    fn context_pop(&self) -> DriverResult<RawContext>;
    fn context_synchronize(&self) -> DriverResult<()>;
    /// Ordinal of the device bound to the current context.
    fn context_device(&self) -> DriverResult<u32>;

    // -- memory ---------------------------------------------------------------

    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr>;
    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()>;
    fn mem_alloc_host(&self, bytes: usize) -> DriverResult<HostPtr>;
    fn mem_free_host(&self, ptr: HostPtr) -> DriverResult<()>;
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()>;
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()>;

    /// Queue a host-to-device copy on `stream`.
    ///
    /// # Safety
    /// `src` must be valid for reads of `len` bytes until the copy has
    /// completed on `stream`.
    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        len: usize,
        stream: RawStream,
    ) -> DriverResult<()>;

    /// Queue a device-to-host copy on `stream`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `len` bytes, and not otherwise
    /// accessed, until the copy has completed on `stream`.
    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        len: usize,
        stream: RawStream,
    ) -> DriverResult<()>;

    // -- streams --------------------------------------------------------------

    fn stream_create(&self) -> DriverResult<RawStream>;
    fn stream_destroy(&self, stream: RawStream) -> DriverResult<()>;
    /// `Ok(true)` when all queued work is complete, `Ok(false)` while pending.
    fn stream_query(&self, stream: RawStream) -> DriverResult<bool>;
    fn stream_synchronize(&self, stream: RawStream) -> DriverResult<()>;
    fn stream_wait_event(&self, stream: RawStream, event: RawEvent) -> DriverResult<()>;

    // -- events ---------------------------------------------------------------

    fn event_create(&self) -> DriverResult<RawEvent>;
    fn event_destroy(&self, event: RawEvent) -> DriverResult<()>;
    fn event_record(&self, event: RawEvent, stream: RawStream) -> DriverResult<()>;
    /// `Ok(true)` once the stream has reached the event, `Ok(false)` before.
    fn event_query(&self, event: RawEvent) -> DriverResult<bool>;
    fn event_synchronize(&self, event: RawEvent) -> DriverResult<()>;
    /// Milliseconds between two recorded events.
    fn event_elapsed_time(&self, start: RawEvent, end: RawEvent) -> DriverResult<f32>;

    // -- modules and launch ---------------------------------------------------

    fn module_load(&self, path: &Path) -> DriverResult<RawModule>;
    fn module_load_data(&self, image: &[u8]) -> DriverResult<RawModule>;
    fn module_unload(&self, module: RawModule) -> DriverResult<()>;
    fn module_get_function(&self, module: RawModule, name: &str) -> DriverResult<RawFunction>;

    /// Launch `func` with a packed parameter block of `params.len()` bytes.
    ///
    /// # Safety
    /// `params` must match the kernel's parameter layout, and every device
    /// address in it must be valid in the current context for the duration
    /// of the kernel.
    unsafe fn launch(
        &self,
        func: RawFunction,
        config: &LaunchConfig,
        params: &[u8],
    ) -> DriverResult<()>;
}
