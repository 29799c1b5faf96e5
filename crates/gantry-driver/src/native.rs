//! Native CUDA driver backend over the dlopen'd entry points in [`crate::ffi`].

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;

use crate::driver::Driver;
use crate::error::{DriverError, DriverResult, LoadError};
use crate::ffi::{self, CudaApi, CuContext, CuDevice, CuEvent, CuModule, CuStream};
use crate::status::{
    CuResult, CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_NOT_READY, CUDA_SUCCESS,
};
use crate::types::{
    DeviceProperties, DevicePtr, HostPtr, LaunchConfig, RawContext, RawEvent, RawFunction,
    RawModule, RawStream,
};

/// The real driver, loaded at runtime.
pub struct CudaDriver {
    api: CudaApi,
}

impl CudaDriver {
    /// Load the driver from the platform's default library names.
    pub fn load() -> Result<Self, LoadError> {
        let api = CudaApi::load_default()?;
        tracing::info!("loaded CUDA driver library");
        Ok(Self { api })
    }

    /// Load the driver from an explicit library path.
    pub fn load_from(path: &Path) -> Result<Self, LoadError> {
        let api = CudaApi::load_from(path)?;
        tracing::info!("loaded CUDA driver library from {}", path.display());
        Ok(Self { api })
    }

    /// Check a return code, naming it through `cuGetErrorName` when possible.
    fn check(&self, code: CuResult, call: &'static str) -> DriverResult<()> {
        if code == CUDA_SUCCESS {
            return Ok(());
        }
        Err(self.error(code, call))
    }

    fn check_query(&self, code: CuResult, call: &'static str) -> DriverResult<bool> {
        match code {
            CUDA_SUCCESS => Ok(true),
            CUDA_ERROR_NOT_READY => Ok(false),
            _ => Err(self.error(code, call)),
        }
    }

    fn error(&self, code: CuResult, call: &'static str) -> DriverError {
        if let Some(get_name) = self.api.cu_get_error_name {
            let mut name: *const c_char = std::ptr::null();
            let status = unsafe { get_name(code, &mut name) };
            if status == CUDA_SUCCESS && !name.is_null() {
                let name = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();
                return DriverError::named(code, name, call);
            }
        }
        DriverError::new(code, call)
    }

    fn device(&self, ordinal: u32) -> DriverResult<CuDevice> {
        let mut dev: CuDevice = 0;
        self.check(
            unsafe { (self.api.cu_device_get)(&mut dev, ordinal as c_int) },
            "cuDeviceGet",
        )?;
        Ok(dev)
    }

    fn attribute(&self, attr: c_int, dev: CuDevice) -> DriverResult<u32> {
        let mut value: c_int = 0;
        self.check(
            unsafe { (self.api.cu_device_get_attribute)(&mut value, attr, dev) },
            "cuDeviceGetAttribute",
        )?;
        Ok(value.max(0) as u32)
    }
}

fn ctx(raw: RawContext) -> CuContext {
    raw.0 as CuContext
}

fn stream(raw: RawStream) -> CuStream {
    raw.0 as CuStream
}

fn event(raw: RawEvent) -> CuEvent {
    raw.0 as CuEvent
}

fn module(raw: RawModule) -> CuModule {
    raw.0 as CuModule
}

impl Driver for CudaDriver {
    fn name(&self) -> &str {
        "cuda"
    }

    fn init(&self) -> DriverResult<()> {
        self.check(unsafe { (self.api.cu_init)(0) }, "cuInit")
    }

    fn device_count(&self) -> DriverResult<u32> {
        let mut count: c_int = 0;
        self.check(
            unsafe { (self.api.cu_device_get_count)(&mut count) },
            "cuDeviceGetCount",
        )?;
        Ok(count.max(0) as u32)
    }

    fn device_properties(&self, ordinal: u32) -> DriverResult<DeviceProperties> {
        let dev = self.device(ordinal)?;

        let mut name_buf = [0 as c_char; 256];
        self.check(
            unsafe {
                (self.api.cu_device_get_name)(name_buf.as_mut_ptr(), name_buf.len() as c_int, dev)
            },
            "cuDeviceGetName",
        )?;
        let name = unsafe { CStr::from_ptr(name_buf.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let mut total_memory: usize = 0;
        self.check(
            unsafe { (self.api.cu_device_total_mem)(&mut total_memory, dev) },
            "cuDeviceTotalMem",
        )?;

        Ok(DeviceProperties {
            name,
            clock_rate_khz: self.attribute(ffi::ATTR_CLOCK_RATE, dev)?,
            multiprocessor_count: self.attribute(ffi::ATTR_MULTIPROCESSOR_COUNT, dev)?,
            total_memory,
            max_threads_per_block: self.attribute(ffi::ATTR_MAX_THREADS_PER_BLOCK, dev)?,
            shared_memory_per_block: self.attribute(ffi::ATTR_MAX_SHARED_MEMORY_PER_BLOCK, dev)?,
            warp_size: self.attribute(ffi::ATTR_WARP_SIZE, dev)?,
        })
    }

    fn context_create(&self, flags: u32, ordinal: u32) -> DriverResult<RawContext> {
        let dev = self.device(ordinal)?;
        let mut raw: CuContext = std::ptr::null_mut();
        self.check(
            unsafe { (self.api.cu_ctx_create)(&mut raw, flags, dev) },
            "cuCtxCreate",
        )?;
        Ok(RawContext(raw as usize))
    }

    fn context_destroy(&self, raw: RawContext) -> DriverResult<()> {
        self.check(unsafe { (self.api.cu_ctx_destroy)(ctx(raw)) }, "cuCtxDestroy")
    }

    fn context_push(&self, raw: RawContext) -> DriverResult<()> {
        self.check(
            unsafe { (self.api.cu_ctx_push_current)(ctx(raw)) },
            "cuCtxPushCurrent",
        )
    }

    fn context_pop(&self) -> DriverResult<RawContext> {
        let mut raw: CuContext = std::ptr::null_mut();
        self.check(
            unsafe { (self.api.cu_ctx_pop_current)(&mut raw) },
            "cuCtxPopCurrent",
        )?;
        Ok(RawContext(raw as usize))
    }

    fn context_synchronize(&self) -> DriverResult<()> {
        self.check(unsafe { (self.api.cu_ctx_synchronize)() }, "cuCtxSynchronize")
    }

    fn context_device(&self) -> DriverResult<u32> {
        let mut dev: CuDevice = 0;
        self.check(unsafe { (self.api.cu_ctx_get_device)(&mut dev) }, "cuCtxGetDevice")?;
        Ok(dev.max(0) as u32)
    }

    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr> {
        let mut ptr: ffi::CuDevicePtr = 0;
        self.check(unsafe { (self.api.cu_mem_alloc)(&mut ptr, bytes) }, "cuMemAlloc")?;
        Ok(DevicePtr(ptr))
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        self.check(unsafe { (self.api.cu_mem_free)(ptr.0) }, "cuMemFree")
    }

    fn mem_alloc_host(&self, bytes: usize) -> DriverResult<HostPtr> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        self.check(
            unsafe { (self.api.cu_mem_alloc_host)(&mut ptr, bytes) },
            "cuMemAllocHost",
        )?;
        Ok(HostPtr(ptr as *mut u8))
    }

    fn mem_free_host(&self, ptr: HostPtr) -> DriverResult<()> {
        self.check(
            unsafe { (self.api.cu_mem_free_host)(ptr.0 as *mut c_void) },
            "cuMemFreeHost",
        )
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        self.check(
            unsafe { (self.api.cu_memcpy_htod)(dst.0, src.as_ptr() as *const c_void, src.len()) },
            "cuMemcpyHtoD",
        )
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        self.check(
            unsafe {
                (self.api.cu_memcpy_dtoh)(dst.as_mut_ptr() as *mut c_void, src.0, dst.len())
            },
            "cuMemcpyDtoH",
        )
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        len: usize,
        raw_stream: RawStream,
    ) -> DriverResult<()> {
        self.check(
            (self.api.cu_memcpy_htod_async)(dst.0, src as *const c_void, len, stream(raw_stream)),
            "cuMemcpyHtoDAsync",
        )
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        len: usize,
        raw_stream: RawStream,
    ) -> DriverResult<()> {
        self.check(
            (self.api.cu_memcpy_dtoh_async)(dst as *mut c_void, src.0, len, stream(raw_stream)),
            "cuMemcpyDtoHAsync",
        )
    }

    fn stream_create(&self) -> DriverResult<RawStream> {
        let mut raw: CuStream = std::ptr::null_mut();
        // flags must be 0
        self.check(unsafe { (self.api.cu_stream_create)(&mut raw, 0) }, "cuStreamCreate")?;
        Ok(RawStream(raw as usize))
    }

    fn stream_destroy(&self, raw: RawStream) -> DriverResult<()> {
        self.check(
            unsafe { (self.api.cu_stream_destroy)(stream(raw)) },
            "cuStreamDestroy",
        )
    }

    fn stream_query(&self, raw: RawStream) -> DriverResult<bool> {
        self.check_query(unsafe { (self.api.cu_stream_query)(stream(raw)) }, "cuStreamQuery")
    }

    fn stream_synchronize(&self, raw: RawStream) -> DriverResult<()> {
        self.check(
            unsafe { (self.api.cu_stream_synchronize)(stream(raw)) },
            "cuStreamSynchronize",
        )
    }

    fn stream_wait_event(&self, raw: RawStream, ev: RawEvent) -> DriverResult<()> {
        self.check(
            unsafe { (self.api.cu_stream_wait_event)(stream(raw), event(ev), 0) },
            "cuStreamWaitEvent",
        )
    }

    fn event_create(&self) -> DriverResult<RawEvent> {
        let mut raw: CuEvent = std::ptr::null_mut();
        self.check(unsafe { (self.api.cu_event_create)(&mut raw, 0) }, "cuEventCreate")?;
        Ok(RawEvent(raw as usize))
    }

    fn event_destroy(&self, raw: RawEvent) -> DriverResult<()> {
        self.check(unsafe { (self.api.cu_event_destroy)(event(raw)) }, "cuEventDestroy")
    }

    fn event_record(&self, raw: RawEvent, on: RawStream) -> DriverResult<()> {
        self.check(
            unsafe { (self.api.cu_event_record)(event(raw), stream(on)) },
            "cuEventRecord",
        )
    }

    fn event_query(&self, raw: RawEvent) -> DriverResult<bool> {
        self.check_query(unsafe { (self.api.cu_event_query)(event(raw)) }, "cuEventQuery")
    }

    fn event_synchronize(&self, raw: RawEvent) -> DriverResult<()> {
        self.check(
            unsafe { (self.api.cu_event_synchronize)(event(raw)) },
            "cuEventSynchronize",
        )
    }

    fn event_elapsed_time(&self, start: RawEvent, end: RawEvent) -> DriverResult<f32> {
        let mut ms: f32 = 0.0;
        self.check(
            unsafe { (self.api.cu_event_elapsed_time)(&mut ms, event(start), event(end)) },
            "cuEventElapsedTime",
        )?;
        Ok(ms)
    }

    fn module_load(&self, path: &Path) -> DriverResult<RawModule> {
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| DriverError::new(CUDA_ERROR_INVALID_VALUE, "cuModuleLoad"))?;
        let mut raw: CuModule = std::ptr::null_mut();
        self.check(
            unsafe { (self.api.cu_module_load)(&mut raw, c_path.as_ptr()) },
            "cuModuleLoad",
        )?;
        Ok(RawModule(raw as usize))
    }

    fn module_load_data(&self, image: &[u8]) -> DriverResult<RawModule> {
        // PTX images are read as C strings; cubin images ignore the trailing NUL.
        let mut data = Vec::with_capacity(image.len() + 1);
        data.extend_from_slice(image);
        if data.last() != Some(&0) {
            data.push(0);
        }
        let mut raw: CuModule = std::ptr::null_mut();
        self.check(
            unsafe { (self.api.cu_module_load_data)(&mut raw, data.as_ptr() as *const c_void) },
            "cuModuleLoadData",
        )?;
        Ok(RawModule(raw as usize))
    }

    fn module_unload(&self, raw: RawModule) -> DriverResult<()> {
        self.check(unsafe { (self.api.cu_module_unload)(module(raw)) }, "cuModuleUnload")
    }

    fn module_get_function(&self, raw: RawModule, name: &str) -> DriverResult<RawFunction> {
        let c_name = CString::new(name)
            .map_err(|_| DriverError::new(CUDA_ERROR_INVALID_VALUE, "cuModuleGetFunction"))?;
        let mut func: ffi::CuFunction = std::ptr::null_mut();
        self.check(
            unsafe { (self.api.cu_module_get_function)(&mut func, module(raw), c_name.as_ptr()) },
            "cuModuleGetFunction",
        )?;
        Ok(RawFunction(func as usize))
    }

    unsafe fn launch(
        &self,
        func: RawFunction,
        config: &LaunchConfig,
        params: &[u8],
    ) -> DriverResult<()> {
        let mut size = params.len();
        let mut extra = [
            ffi::LAUNCH_PARAM_BUFFER_POINTER,
            params.as_ptr() as *mut c_void,
            ffi::LAUNCH_PARAM_BUFFER_SIZE,
            &mut size as *mut usize as *mut c_void,
            ffi::LAUNCH_PARAM_END,
        ];
        self.check(
            (self.api.cu_launch_kernel)(
                func.0 as ffi::CuFunction,
                config.grid_dim.0,
                config.grid_dim.1,
                config.grid_dim.2,
                config.block_dim.0,
                config.block_dim.1,
                config.block_dim.2,
                config.shared_mem_bytes,
                stream(config.stream),
                std::ptr::null_mut(),
                extra.as_mut_ptr(),
            ),
            "cuLaunchKernel",
        )
    }
}
