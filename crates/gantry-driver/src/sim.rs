//! In-process simulated driver.
//!
//! `SimDriver` follows the driver's observable rules closely enough to test the
//! layers above it without a GPU: a per-OS-thread context stack, resources
//! owned by the context that created them, real byte storage for device and
//! pinned host memory, and host-side emulations standing in for kernels.
//!
//! Every call is appended to a log together with the context that was current
//! on the calling thread, so tests can assert which context a driver call ran
//! under.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::Mutex;

use crate::driver::Driver;
use crate::error::{DriverError, DriverResult};
use crate::status::{
    CuResult, CUDA_ERROR_CONTEXT_IS_DESTROYED, CUDA_ERROR_FILE_NOT_FOUND,
    CUDA_ERROR_ILLEGAL_ADDRESS, CUDA_ERROR_INVALID_CONTEXT, CUDA_ERROR_INVALID_DEVICE,
    CUDA_ERROR_INVALID_HANDLE, CUDA_ERROR_INVALID_IMAGE, CUDA_ERROR_INVALID_VALUE,
    CUDA_ERROR_NOT_FOUND, CUDA_ERROR_NOT_INITIALIZED, CUDA_ERROR_NOT_READY,
    CUDA_ERROR_NO_DEVICE, CUDA_ERROR_OUT_OF_MEMORY,
};
use crate::types::{
    DeviceProperties, DevicePtr, HostPtr, LaunchConfig, RawContext, RawEvent, RawFunction,
    RawModule, RawStream,
};

/// First simulated device address; zero stays an invalid pointer.
const DEVICE_BASE: u64 = 0x1000_0000;
/// Alignment of simulated device allocations.
const DEVICE_ALIGN: u64 = 256;

/// Host-side stand-in for a kernel.
pub type SimKernel = Arc<dyn Fn(&mut SimMemory, &SimLaunch) -> Result<(), CuResult> + Send + Sync>;

/// One logged driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    pub call: &'static str,
    /// Context on top of the calling thread's stack when the call was made.
    pub context: Option<RawContext>,
    pub thread: ThreadId,
}

/// One recorded kernel launch.
#[derive(Debug, Clone)]
pub struct SimLaunch {
    pub function: String,
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem_bytes: u32,
    pub stream: RawStream,
    /// The packed parameter block exactly as handed to the driver.
    pub params: Vec<u8>,
}

impl SimLaunch {
    fn bytes(&self, offset: usize, width: usize) -> Result<&[u8], CuResult> {
        self.params
            .get(offset..offset + width)
            .ok_or(CUDA_ERROR_INVALID_VALUE)
    }

    /// Read a device address parameter at `offset`.
    pub fn param_ptr(&self, offset: usize) -> Result<DevicePtr, CuResult> {
        let raw = self.bytes(offset, std::mem::size_of::<usize>())?;
        let addr = usize::from_ne_bytes(raw.try_into().map_err(|_| CUDA_ERROR_INVALID_VALUE)?);
        Ok(DevicePtr(addr as u64))
    }

    pub fn param_i32(&self, offset: usize) -> Result<i32, CuResult> {
        let raw = self.bytes(offset, 4)?;
        Ok(i32::from_ne_bytes(raw.try_into().map_err(|_| CUDA_ERROR_INVALID_VALUE)?))
    }

    pub fn param_f32(&self, offset: usize) -> Result<f32, CuResult> {
        let raw = self.bytes(offset, 4)?;
        Ok(f32::from_ne_bytes(raw.try_into().map_err(|_| CUDA_ERROR_INVALID_VALUE)?))
    }

    /// Total number of threads in the launch.
    pub fn thread_count(&self) -> usize {
        let (gx, gy, gz) = self.grid;
        let (bx, by, bz) = self.block;
        [gx, gy, gz, bx, by, bz]
            .iter()
            .fold(1usize, |acc, &d| acc.saturating_mul(d as usize))
    }
}

struct Allocation {
    ctx: RawContext,
    bytes: Vec<u8>,
}

/// Simulated device memory, addressable by [`DevicePtr`] including interior
/// pointers.
#[derive(Default)]
pub struct SimMemory {
    allocations: BTreeMap<u64, Allocation>,
}

impl SimMemory {
    fn locate(&self, ptr: DevicePtr, len: usize) -> Result<(u64, usize), CuResult> {
        let (&base, alloc) = self
            .allocations
            .range(..=ptr.0)
            .next_back()
            .ok_or(CUDA_ERROR_INVALID_VALUE)?;
        let offset = (ptr.0 - base) as usize;
        if offset + len > alloc.bytes.len() {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        Ok((base, offset))
    }

    /// Borrow `len` bytes starting at `ptr`.
    pub fn read(&self, ptr: DevicePtr, len: usize) -> Result<&[u8], CuResult> {
        let (base, offset) = self.locate(ptr, len)?;
        Ok(&self.allocations[&base].bytes[offset..offset + len])
    }

    /// Mutably borrow `len` bytes starting at `ptr`.
    pub fn read_mut(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8], CuResult> {
        let (base, offset) = self.locate(ptr, len)?;
        let alloc = self
            .allocations
            .get_mut(&base)
            .ok_or(CUDA_ERROR_INVALID_VALUE)?;
        Ok(&mut alloc.bytes[offset..offset + len])
    }

    pub fn write(&mut self, ptr: DevicePtr, data: &[u8]) -> Result<(), CuResult> {
        self.read_mut(ptr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Size of the allocation starting exactly at `ptr`.
    pub fn allocation_len(&self, ptr: DevicePtr) -> Option<usize> {
        self.allocations.get(&ptr.0).map(|a| a.bytes.len())
    }
}

struct SimEvent {
    ctx: RawContext,
    recorded: Option<Instant>,
}

struct SimModule {
    ctx: RawContext,
}

struct SimFunction {
    ctx: RawContext,
    module: RawModule,
    name: String,
}

struct PinnedHost {
    ctx: RawContext,
    storage: Box<[u8]>,
}

struct State {
    initialized: bool,
    devices: Vec<DeviceProperties>,
    next_handle: usize,
    next_address: u64,
    stacks: HashMap<ThreadId, Vec<RawContext>>,
    contexts: HashMap<RawContext, u32>,
    memory: SimMemory,
    pinned: HashMap<usize, PinnedHost>,
    streams: HashMap<RawStream, RawContext>,
    events: HashMap<RawEvent, SimEvent>,
    modules: HashMap<RawModule, SimModule>,
    functions: HashMap<RawFunction, SimFunction>,
    kernels: HashMap<String, SimKernel>,
    failures: HashMap<&'static str, CuResult>,
    pending: bool,
    calls: Vec<SimCall>,
    launches: Vec<SimLaunch>,
}

impl State {
    fn handle(&mut self) -> usize {
        self.next_handle += 1;
        self.next_handle
    }

    fn top(&self) -> Option<RawContext> {
        self.stacks
            .get(&std::thread::current().id())
            .and_then(|s| s.last().copied())
    }

    /// Log the call, apply injected failures and the initialization rule.
    fn enter(&mut self, call: &'static str) -> DriverResult<()> {
        self.calls.push(SimCall {
            call,
            context: self.top(),
            thread: std::thread::current().id(),
        });
        if let Some(code) = self.failures.remove(call) {
            return Err(DriverError::new(code, call));
        }
        if !self.initialized && call != "cuInit" {
            return Err(DriverError::new(CUDA_ERROR_NOT_INITIALIZED, call));
        }
        Ok(())
    }

    /// The calling thread's current context.
    fn current(&self, call: &'static str) -> DriverResult<RawContext> {
        let ctx = self
            .top()
            .ok_or_else(|| DriverError::new(CUDA_ERROR_INVALID_CONTEXT, call))?;
        if !self.contexts.contains_key(&ctx) {
            return Err(DriverError::new(CUDA_ERROR_CONTEXT_IS_DESTROYED, call));
        }
        Ok(ctx)
    }

    /// Require `owner` to be the calling thread's current context.
    fn owned(&self, owner: RawContext, call: &'static str) -> DriverResult<()> {
        if self.current(call)? != owner {
            return Err(DriverError::new(CUDA_ERROR_INVALID_CONTEXT, call));
        }
        Ok(())
    }

    fn stream_owner(&self, stream: RawStream, call: &'static str) -> DriverResult<()> {
        if stream.is_default() {
            self.current(call)?;
            return Ok(());
        }
        let owner = *self
            .streams
            .get(&stream)
            .ok_or_else(|| DriverError::new(CUDA_ERROR_INVALID_HANDLE, call))?;
        self.owned(owner, call)
    }

    fn event(&self, event: RawEvent, call: &'static str) -> DriverResult<&SimEvent> {
        let ev = self
            .events
            .get(&event)
            .ok_or_else(|| DriverError::new(CUDA_ERROR_INVALID_HANDLE, call))?;
        self.owned(ev.ctx, call)?;
        Ok(ev)
    }

    fn device_bytes_in_use(&self, device: u32) -> usize {
        self.memory
            .allocations
            .values()
            .filter(|a| self.contexts.get(&a.ctx) == Some(&device))
            .map(|a| a.bytes.len())
            .sum()
    }
}

/// The simulated driver. See the module docs.
pub struct SimDriver {
    state: Mutex<State>,
}

impl SimDriver {
    /// A driver with `count` identical simulated devices.
    pub fn new(count: u32) -> Self {
        let devices = (0..count)
            .map(|i| DeviceProperties {
                name: format!("Gantry Sim Device {i}"),
                clock_rate_khz: 1_500_000,
                multiprocessor_count: 16,
                total_memory: 1 << 30,
                max_threads_per_block: 1024,
                shared_memory_per_block: 48 * 1024,
                warp_size: 32,
            })
            .collect();
        Self::with_devices(devices)
    }

    /// A driver exposing exactly `devices`.
    pub fn with_devices(devices: Vec<DeviceProperties>) -> Self {
        Self {
            state: Mutex::new(State {
                initialized: false,
                devices,
                next_handle: 0,
                next_address: DEVICE_BASE,
                stacks: HashMap::new(),
                contexts: HashMap::new(),
                memory: SimMemory::default(),
                pinned: HashMap::new(),
                streams: HashMap::new(),
                events: HashMap::new(),
                modules: HashMap::new(),
                functions: HashMap::new(),
                kernels: HashMap::new(),
                failures: HashMap::new(),
                pending: false,
                calls: Vec::new(),
                launches: Vec::new(),
            }),
        }
    }

    /// Make kernel `name` resolvable in every loaded module, running `kernel`
    /// on launch.
    pub fn register_kernel<F>(&self, name: &str, kernel: F)
    where
        F: Fn(&mut SimMemory, &SimLaunch) -> Result<(), CuResult> + Send + Sync + 'static,
    {
        self.state.lock().kernels.insert(name.to_string(), Arc::new(kernel));
    }

    /// Make the next call to `call` fail with `code`.
    pub fn fail_next(&self, call: &'static str, code: CuResult) {
        self.state.lock().failures.insert(call, code);
    }

    /// While pending, stream and event queries report `CUDA_ERROR_NOT_READY`
    /// until the next synchronize.
    pub fn set_pending(&self, pending: bool) {
        self.state.lock().pending = pending;
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    /// Number of logged calls to `call`.
    pub fn call_count(&self, call: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| c.call == call).count()
    }

    /// The last logged call to `call`, if any.
    pub fn last_call(&self, call: &str) -> Option<SimCall> {
        self.state
            .lock()
            .calls
            .iter()
            .rev()
            .find(|c| c.call == call)
            .cloned()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn launches(&self) -> Vec<SimLaunch> {
        self.state.lock().launches.clone()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().memory.allocations.len()
    }

    pub fn live_pinned(&self) -> usize {
        self.state.lock().pinned.len()
    }

    /// Total bytes of pinned host memory still allocated.
    pub fn pinned_bytes(&self) -> usize {
        self.state.lock().pinned.values().map(|p| p.storage.len()).sum()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn live_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn live_events(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn live_modules(&self) -> usize {
        self.state.lock().modules.len()
    }

    /// Top of the calling thread's driver-side stack.
    pub fn current_context(&self) -> Option<RawContext> {
        self.state.lock().top()
    }

    /// Depth of the calling thread's driver-side stack.
    pub fn stack_depth(&self) -> usize {
        self.state
            .lock()
            .stacks
            .get(&std::thread::current().id())
            .map_or(0, Vec::len)
    }
}

impl Driver for SimDriver {
    fn name(&self) -> &str {
        "sim"
    }

    fn init(&self) -> DriverResult<()> {
        let mut st = self.state.lock();
        st.enter("cuInit")?;
        st.initialized = true;
        Ok(())
    }

    fn device_count(&self) -> DriverResult<u32> {
        let mut st = self.state.lock();
        st.enter("cuDeviceGetCount")?;
        Ok(st.devices.len() as u32)
    }

    fn device_properties(&self, ordinal: u32) -> DriverResult<DeviceProperties> {
        let mut st = self.state.lock();
        st.enter("cuDeviceGet")?;
        st.devices
            .get(ordinal as usize)
            .cloned()
            .ok_or_else(|| DriverError::new(CUDA_ERROR_INVALID_DEVICE, "cuDeviceGet"))
    }

    fn context_create(&self, flags: u32, ordinal: u32) -> DriverResult<RawContext> {
        const CALL: &str = "cuCtxCreate";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        if st.devices.is_empty() {
            return Err(DriverError::new(CUDA_ERROR_NO_DEVICE, CALL));
        }
        if ordinal as usize >= st.devices.len() {
            return Err(DriverError::new(CUDA_ERROR_INVALID_DEVICE, CALL));
        }
        if flags > 0x07 {
            return Err(DriverError::new(CUDA_ERROR_INVALID_VALUE, CALL));
        }
        let ctx = RawContext(st.handle());
        st.contexts.insert(ctx, ordinal);
        st.stacks
            .entry(std::thread::current().id())
            .or_default()
            .push(ctx);
        Ok(ctx)
    }

    fn context_destroy(&self, ctx: RawContext) -> DriverResult<()> {
        const CALL: &str = "cuCtxDestroy";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        if st.contexts.remove(&ctx).is_none() {
            return Err(DriverError::new(CUDA_ERROR_INVALID_CONTEXT, CALL));
        }
        // Everything the context owned goes with it. Pinned host memory stays
        // mapped so host views over it remain valid until freed explicitly.
        st.memory.allocations.retain(|_, a| a.ctx != ctx);
        st.streams.retain(|_, owner| *owner != ctx);
        st.events.retain(|_, e| e.ctx != ctx);
        st.modules.retain(|_, m| m.ctx != ctx);
        st.functions.retain(|_, f| f.ctx != ctx);
        if let Some(stack) = st.stacks.get_mut(&std::thread::current().id()) {
            if stack.last() == Some(&ctx) {
                stack.pop();
            }
        }
        Ok(())
    }

    fn context_push(&self, ctx: RawContext) -> DriverResult<()> {
        const CALL: &str = "cuCtxPushCurrent";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        if !st.contexts.contains_key(&ctx) {
            return Err(DriverError::new(CUDA_ERROR_INVALID_CONTEXT, CALL));
        }
        st.stacks
            .entry(std::thread::current().id())
            .or_default()
            .push(ctx);
        Ok(())
    }

    fn context_pop(&self) -> DriverResult<RawContext> {
        const CALL: &str = "cuCtxPopCurrent";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.stacks
            .get_mut(&std::thread::current().id())
            .and_then(Vec::pop)
            .ok_or_else(|| DriverError::new(CUDA_ERROR_INVALID_CONTEXT, CALL))
    }

    fn context_synchronize(&self) -> DriverResult<()> {
        const CALL: &str = "cuCtxSynchronize";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.current(CALL)?;
        st.pending = false;
        Ok(())
    }

    fn context_device(&self) -> DriverResult<u32> {
        const CALL: &str = "cuCtxGetDevice";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let ctx = st.current(CALL)?;
        Ok(st.contexts[&ctx])
    }

    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr> {
        const CALL: &str = "cuMemAlloc";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let ctx = st.current(CALL)?;
        if bytes == 0 {
            return Err(DriverError::new(CUDA_ERROR_INVALID_VALUE, CALL));
        }
        let device = st.contexts[&ctx];
        let capacity = st.devices[device as usize].total_memory;
        if st.device_bytes_in_use(device) + bytes > capacity {
            return Err(DriverError::new(CUDA_ERROR_OUT_OF_MEMORY, CALL));
        }
        let addr = st.next_address;
        st.next_address += (bytes as u64).div_ceil(DEVICE_ALIGN) * DEVICE_ALIGN;
        st.memory.allocations.insert(
            addr,
            Allocation {
                ctx,
                bytes: vec![0; bytes],
            },
        );
        Ok(DevicePtr(addr))
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        const CALL: &str = "cuMemFree";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let owner = st
            .memory
            .allocations
            .get(&ptr.0)
            .map(|a| a.ctx)
            .ok_or_else(|| DriverError::new(CUDA_ERROR_INVALID_VALUE, CALL))?;
        st.owned(owner, CALL)?;
        st.memory.allocations.remove(&ptr.0);
        Ok(())
    }

    fn mem_alloc_host(&self, bytes: usize) -> DriverResult<HostPtr> {
        const CALL: &str = "cuMemAllocHost";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let ctx = st.current(CALL)?;
        if bytes == 0 {
            return Err(DriverError::new(CUDA_ERROR_INVALID_VALUE, CALL));
        }
        let mut storage = vec![0u8; bytes].into_boxed_slice();
        let ptr = storage.as_mut_ptr();
        st.pinned.insert(ptr as usize, PinnedHost { ctx, storage });
        Ok(HostPtr(ptr))
    }

    fn mem_free_host(&self, ptr: HostPtr) -> DriverResult<()> {
        const CALL: &str = "cuMemFreeHost";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let owner = st
            .pinned
            .get(&(ptr.0 as usize))
            .map(|p| p.ctx)
            .ok_or_else(|| DriverError::new(CUDA_ERROR_INVALID_VALUE, CALL))?;
        st.owned(owner, CALL)?;
        st.pinned.remove(&(ptr.0 as usize));
        Ok(())
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        const CALL: &str = "cuMemcpyHtoD";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.current(CALL)?;
        st.memory
            .write(dst, src)
            .map_err(|code| DriverError::new(code, CALL))
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        const CALL: &str = "cuMemcpyDtoH";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.current(CALL)?;
        let bytes = st
            .memory
            .read(src, dst.len())
            .map_err(|code| DriverError::new(code, CALL))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        len: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        const CALL: &str = "cuMemcpyHtoDAsync";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.stream_owner(stream, CALL)?;
        // Simulated streams complete work as soon as it is queued.
        let src = std::slice::from_raw_parts(src, len);
        st.memory
            .write(dst, src)
            .map_err(|code| DriverError::new(code, CALL))
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        len: usize,
        stream: RawStream,
    ) -> DriverResult<()> {
        const CALL: &str = "cuMemcpyDtoHAsync";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.stream_owner(stream, CALL)?;
        let bytes = st
            .memory
            .read(src, len)
            .map_err(|code| DriverError::new(code, CALL))?;
        std::slice::from_raw_parts_mut(dst, len).copy_from_slice(bytes);
        Ok(())
    }

    fn stream_create(&self) -> DriverResult<RawStream> {
        const CALL: &str = "cuStreamCreate";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let ctx = st.current(CALL)?;
        let stream = RawStream(st.handle());
        st.streams.insert(stream, ctx);
        Ok(stream)
    }

    fn stream_destroy(&self, stream: RawStream) -> DriverResult<()> {
        const CALL: &str = "cuStreamDestroy";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        if stream.is_default() {
            return Err(DriverError::new(CUDA_ERROR_INVALID_HANDLE, CALL));
        }
        st.stream_owner(stream, CALL)?;
        st.streams.remove(&stream);
        Ok(())
    }

    fn stream_query(&self, stream: RawStream) -> DriverResult<bool> {
        const CALL: &str = "cuStreamQuery";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.stream_owner(stream, CALL)?;
        Ok(!st.pending)
    }

    fn stream_synchronize(&self, stream: RawStream) -> DriverResult<()> {
        const CALL: &str = "cuStreamSynchronize";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.stream_owner(stream, CALL)?;
        st.pending = false;
        Ok(())
    }

    fn stream_wait_event(&self, stream: RawStream, event: RawEvent) -> DriverResult<()> {
        const CALL: &str = "cuStreamWaitEvent";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.stream_owner(stream, CALL)?;
        st.event(event, CALL)?;
        Ok(())
    }

    fn event_create(&self) -> DriverResult<RawEvent> {
        const CALL: &str = "cuEventCreate";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let ctx = st.current(CALL)?;
        let event = RawEvent(st.handle());
        st.events.insert(event, SimEvent { ctx, recorded: None });
        Ok(event)
    }

    fn event_destroy(&self, event: RawEvent) -> DriverResult<()> {
        const CALL: &str = "cuEventDestroy";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.event(event, CALL)?;
        st.events.remove(&event);
        Ok(())
    }

    fn event_record(&self, event: RawEvent, stream: RawStream) -> DriverResult<()> {
        const CALL: &str = "cuEventRecord";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.event(event, CALL)?;
        st.stream_owner(stream, CALL)?;
        if let Some(ev) = st.events.get_mut(&event) {
            ev.recorded = Some(Instant::now());
        }
        Ok(())
    }

    fn event_query(&self, event: RawEvent) -> DriverResult<bool> {
        const CALL: &str = "cuEventQuery";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let recorded = st.event(event, CALL)?.recorded.is_some();
        // A never-recorded event counts as reached.
        Ok(!recorded || !st.pending)
    }

    fn event_synchronize(&self, event: RawEvent) -> DriverResult<()> {
        const CALL: &str = "cuEventSynchronize";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        st.event(event, CALL)?;
        st.pending = false;
        Ok(())
    }

    fn event_elapsed_time(&self, start: RawEvent, end: RawEvent) -> DriverResult<f32> {
        const CALL: &str = "cuEventElapsedTime";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let started = st.event(start, CALL)?.recorded;
        let ended = st.event(end, CALL)?.recorded;
        match (started, ended) {
            (Some(_), Some(_)) if st.pending => Err(DriverError::new(CUDA_ERROR_NOT_READY, CALL)),
            (Some(a), Some(b)) => {
                let ms = if b >= a {
                    b.duration_since(a).as_secs_f32() * 1000.0
                } else {
                    -(a.duration_since(b).as_secs_f32() * 1000.0)
                };
                Ok(ms)
            }
            _ => Err(DriverError::new(CUDA_ERROR_INVALID_HANDLE, CALL)),
        }
    }

    fn module_load(&self, path: &Path) -> DriverResult<RawModule> {
        const CALL: &str = "cuModuleLoad";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let ctx = st.current(CALL)?;
        let image = std::fs::read(path)
            .map_err(|_| DriverError::new(CUDA_ERROR_FILE_NOT_FOUND, CALL))?;
        if image.is_empty() {
            return Err(DriverError::new(CUDA_ERROR_INVALID_IMAGE, CALL));
        }
        let module = RawModule(st.handle());
        st.modules.insert(module, SimModule { ctx });
        Ok(module)
    }

    fn module_load_data(&self, image: &[u8]) -> DriverResult<RawModule> {
        const CALL: &str = "cuModuleLoadData";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let ctx = st.current(CALL)?;
        if image.is_empty() {
            return Err(DriverError::new(CUDA_ERROR_INVALID_IMAGE, CALL));
        }
        let module = RawModule(st.handle());
        st.modules.insert(module, SimModule { ctx });
        Ok(module)
    }

    fn module_unload(&self, module: RawModule) -> DriverResult<()> {
        const CALL: &str = "cuModuleUnload";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let owner = st
            .modules
            .get(&module)
            .map(|m| m.ctx)
            .ok_or_else(|| DriverError::new(CUDA_ERROR_INVALID_HANDLE, CALL))?;
        st.owned(owner, CALL)?;
        st.modules.remove(&module);
        st.functions.retain(|_, f| f.module != module);
        Ok(())
    }

    fn module_get_function(&self, module: RawModule, name: &str) -> DriverResult<RawFunction> {
        const CALL: &str = "cuModuleGetFunction";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let owner = st
            .modules
            .get(&module)
            .map(|m| m.ctx)
            .ok_or_else(|| DriverError::new(CUDA_ERROR_INVALID_HANDLE, CALL))?;
        st.owned(owner, CALL)?;
        if !st.kernels.contains_key(name) {
            return Err(DriverError::new(CUDA_ERROR_NOT_FOUND, CALL));
        }
        let func = RawFunction(st.handle());
        st.functions.insert(
            func,
            SimFunction {
                ctx: owner,
                module,
                name: name.to_string(),
            },
        );
        Ok(func)
    }

    unsafe fn launch(
        &self,
        func: RawFunction,
        config: &LaunchConfig,
        params: &[u8],
    ) -> DriverResult<()> {
        const CALL: &str = "cuLaunchKernel";
        let mut st = self.state.lock();
        st.enter(CALL)?;
        let (owner, name) = st
            .functions
            .get(&func)
            .map(|f| (f.ctx, f.name.clone()))
            .ok_or_else(|| DriverError::new(CUDA_ERROR_INVALID_HANDLE, CALL))?;
        st.owned(owner, CALL)?;
        st.stream_owner(config.stream, CALL)?;
        let (gx, gy, gz) = config.grid_dim;
        let (bx, by, bz) = config.block_dim;
        if gx == 0 || gy == 0 || gz == 0 || bx == 0 || by == 0 || bz == 0 {
            return Err(DriverError::new(CUDA_ERROR_INVALID_VALUE, CALL));
        }
        let launch = SimLaunch {
            function: name.clone(),
            grid: config.grid_dim,
            block: config.block_dim,
            shared_mem_bytes: config.shared_mem_bytes,
            stream: config.stream,
            params: params.to_vec(),
        };
        let kernel = st
            .kernels
            .get(&name)
            .cloned()
            .ok_or_else(|| DriverError::new(CUDA_ERROR_NOT_FOUND, CALL))?;
        st.launches.push(launch.clone());
        kernel(&mut st.memory, &launch).map_err(|code| {
            let code = if code == 0 { CUDA_ERROR_ILLEGAL_ADDRESS } else { code };
            DriverError::new(code, CALL)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(devices: u32) -> SimDriver {
        let sim = SimDriver::new(devices);
        sim.init().unwrap();
        sim
    }

    #[test]
    fn test_calls_before_init_fail() {
        let sim = SimDriver::new(1);
        let err = sim.device_count().unwrap_err();
        assert_eq!(err.code, CUDA_ERROR_NOT_INITIALIZED);
        sim.init().unwrap();
        assert_eq!(sim.device_count().unwrap(), 1);
    }

    #[test]
    fn test_context_create_pushes() {
        let sim = ready(1);
        let ctx = sim.context_create(0, 0).unwrap();
        assert_eq!(sim.current_context(), Some(ctx));
        assert_eq!(sim.context_pop().unwrap(), ctx);
        assert_eq!(sim.stack_depth(), 0);
        assert!(sim.context_pop().is_err());
    }

    #[test]
    fn test_alloc_requires_current_context() {
        let sim = ready(1);
        let err = sim.mem_alloc(64).unwrap_err();
        assert_eq!(err.code, CUDA_ERROR_INVALID_CONTEXT);
        assert_eq!(err.call, "cuMemAlloc");
    }

    #[test]
    fn test_memory_round_trip_and_interior_pointers() {
        let sim = ready(1);
        sim.context_create(0, 0).unwrap();
        let ptr = sim.mem_alloc(16).unwrap();
        sim.memcpy_htod(ptr, &[1, 2, 3, 4]).unwrap();
        sim.memcpy_htod(DevicePtr(ptr.0 + 4), &[5, 6]).unwrap();
        let mut out = [0u8; 6];
        sim.memcpy_dtoh(&mut out, ptr).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);

        // past the end of the allocation
        let err = sim.memcpy_htod(DevicePtr(ptr.0 + 12), &[0; 8]).unwrap_err();
        assert_eq!(err.code, CUDA_ERROR_INVALID_VALUE);
    }

    #[test]
    fn test_free_from_foreign_context_rejected() {
        let sim = ready(1);
        let a = sim.context_create(0, 0).unwrap();
        let ptr = sim.mem_alloc(8).unwrap();
        sim.context_pop().unwrap();
        sim.context_create(0, 0).unwrap();
        let err = sim.mem_free(ptr).unwrap_err();
        assert_eq!(err.code, CUDA_ERROR_INVALID_CONTEXT);
        sim.context_pop().unwrap();
        sim.context_push(a).unwrap();
        sim.mem_free(ptr).unwrap();
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn test_context_destroy_releases_owned_resources() {
        let sim = ready(1);
        let ctx = sim.context_create(0, 0).unwrap();
        sim.mem_alloc(8).unwrap();
        sim.stream_create().unwrap();
        sim.event_create().unwrap();
        sim.context_destroy(ctx).unwrap();
        assert_eq!(sim.live_contexts(), 0);
        assert_eq!(sim.live_allocations(), 0);
        assert_eq!(sim.live_streams(), 0);
        assert_eq!(sim.live_events(), 0);
        // destroying a current context pops it
        assert_eq!(sim.stack_depth(), 0);
    }

    #[test]
    fn test_out_of_memory() {
        let mut props = SimDriver::new(1).state.lock().devices[0].clone();
        props.total_memory = 1024;
        let sim = SimDriver::with_devices(vec![props]);
        sim.init().unwrap();
        sim.context_create(0, 0).unwrap();
        sim.mem_alloc(1000).unwrap();
        let err = sim.mem_alloc(100).unwrap_err();
        assert_eq!(err.name, "CUDA_ERROR_OUT_OF_MEMORY");
    }

    #[test]
    fn test_pending_queries() {
        let sim = ready(1);
        sim.context_create(0, 0).unwrap();
        let ev = sim.event_create().unwrap();
        sim.event_record(ev, RawStream::DEFAULT).unwrap();
        sim.set_pending(true);
        assert!(!sim.event_query(ev).unwrap());
        assert!(!sim.stream_query(RawStream::DEFAULT).unwrap());
        sim.stream_synchronize(RawStream::DEFAULT).unwrap();
        assert!(sim.event_query(ev).unwrap());
    }

    #[test]
    fn test_fail_next_is_one_shot() {
        let sim = ready(1);
        sim.context_create(0, 0).unwrap();
        sim.fail_next("cuStreamCreate", CUDA_ERROR_OUT_OF_MEMORY);
        assert!(sim.stream_create().is_err());
        assert!(sim.stream_create().is_ok());
    }

    #[test]
    fn test_launch_runs_registered_kernel() {
        let sim = ready(1);
        sim.register_kernel("fill", |mem, launch| {
            let ptr = launch.param_ptr(0)?;
            let value = launch.param_i32(std::mem::size_of::<usize>())?;
            mem.write(ptr, &value.to_ne_bytes())
        });
        sim.context_create(0, 0).unwrap();
        let ptr = sim.mem_alloc(4).unwrap();
        let module = sim.module_load_data(b"image").unwrap();
        let func = sim.module_get_function(module, "fill").unwrap();
        assert!(sim.module_get_function(module, "missing").is_err());

        let mut params = (ptr.0 as usize).to_ne_bytes().to_vec();
        params.extend_from_slice(&42i32.to_ne_bytes());
        let config = LaunchConfig {
            grid_dim: (1, 1, 1),
            block_dim: (1, 1, 1),
            shared_mem_bytes: 0,
            stream: RawStream::DEFAULT,
        };
        unsafe { sim.launch(func, &config, &params).unwrap() };

        let mut out = [0u8; 4];
        sim.memcpy_dtoh(&mut out, ptr).unwrap();
        assert_eq!(i32::from_ne_bytes(out), 42);
        assert_eq!(sim.launches().len(), 1);
        assert_eq!(sim.launches()[0].function, "fill");
    }

    #[test]
    fn test_call_log_records_current_context() {
        let sim = ready(1);
        let ctx = sim.context_create(0, 0).unwrap();
        sim.mem_alloc(8).unwrap();
        let call = sim.last_call("cuMemAlloc").unwrap();
        assert_eq!(call.context, Some(ctx));
        assert_eq!(call.thread, std::thread::current().id());
    }
}
