//! Runtime-loaded CUDA driver function pointers via dlopen.
//!
//! Avoids a build-time CUDA dependency: any driver install that provides
//! `libcuda.so.1` (or `nvcuda.dll`) works. Only the entry points Gantry uses
//! are resolved.

use std::ffi::{c_char, c_float, c_int, c_uint, c_void};
use std::path::Path;

use libloading::Library;

use crate::error::LoadError;
use crate::status::CuResult;

// Opaque handles
pub type CuDevice = c_int;
pub type CuContext = *mut c_void;
pub type CuModule = *mut c_void;
pub type CuFunction = *mut c_void;
pub type CuStream = *mut c_void;
pub type CuEvent = *mut c_void;
pub type CuDevicePtr = u64;

// cuDeviceGetAttribute attribute ids
pub const ATTR_MAX_THREADS_PER_BLOCK: c_int = 1;
pub const ATTR_MAX_SHARED_MEMORY_PER_BLOCK: c_int = 8;
pub const ATTR_WARP_SIZE: c_int = 10;
pub const ATTR_CLOCK_RATE: c_int = 13;
pub const ATTR_MULTIPROCESSOR_COUNT: c_int = 16;

// cuLaunchKernel `extra` markers
pub const LAUNCH_PARAM_END: *mut c_void = std::ptr::null_mut();
pub const LAUNCH_PARAM_BUFFER_POINTER: *mut c_void = 0x01 as *mut c_void;
pub const LAUNCH_PARAM_BUFFER_SIZE: *mut c_void = 0x02 as *mut c_void;

/// Library names tried, in order, when no explicit path is configured.
#[cfg(windows)]
pub const DEFAULT_LIBRARIES: &[&str] = &["nvcuda.dll"];
#[cfg(not(windows))]
pub const DEFAULT_LIBRARIES: &[&str] = &["libcuda.so.1", "libcuda.so"];

// ---------------------------------------------------------------------------
// Driver API function signatures
// ---------------------------------------------------------------------------

type FnCuInit = unsafe extern "C" fn(c_uint) -> CuResult;
type FnCuGetErrorName = unsafe extern "C" fn(CuResult, *mut *const c_char) -> CuResult;
type FnCuDeviceGetCount = unsafe extern "C" fn(*mut c_int) -> CuResult;
type FnCuDeviceGet = unsafe extern "C" fn(*mut CuDevice, c_int) -> CuResult;
type FnCuDeviceGetName = unsafe extern "C" fn(*mut c_char, c_int, CuDevice) -> CuResult;
type FnCuDeviceGetAttribute = unsafe extern "C" fn(*mut c_int, c_int, CuDevice) -> CuResult;
type FnCuDeviceTotalMem = unsafe extern "C" fn(*mut usize, CuDevice) -> CuResult;

type FnCuCtxCreate = unsafe extern "C" fn(*mut CuContext, c_uint, CuDevice) -> CuResult;
type FnCuCtxDestroy = unsafe extern "C" fn(CuContext) -> CuResult;
type FnCuCtxPushCurrent = unsafe extern "C" fn(CuContext) -> CuResult;
type FnCuCtxPopCurrent = unsafe extern "C" fn(*mut CuContext) -> CuResult;
type FnCuCtxSynchronize = unsafe extern "C" fn() -> CuResult;
type FnCuCtxGetDevice = unsafe extern "C" fn(*mut CuDevice) -> CuResult;

type FnCuMemAlloc = unsafe extern "C" fn(*mut CuDevicePtr, usize) -> CuResult;
type FnCuMemFree = unsafe extern "C" fn(CuDevicePtr) -> CuResult;
type FnCuMemAllocHost = unsafe extern "C" fn(*mut *mut c_void, usize) -> CuResult;
type FnCuMemFreeHost = unsafe extern "C" fn(*mut c_void) -> CuResult;
type FnCuMemcpyHtoD = unsafe extern "C" fn(CuDevicePtr, *const c_void, usize) -> CuResult;
type FnCuMemcpyDtoH = unsafe extern "C" fn(*mut c_void, CuDevicePtr, usize) -> CuResult;
type FnCuMemcpyHtoDAsync =
    unsafe extern "C" fn(CuDevicePtr, *const c_void, usize, CuStream) -> CuResult;
type FnCuMemcpyDtoHAsync =
    unsafe extern "C" fn(*mut c_void, CuDevicePtr, usize, CuStream) -> CuResult;

type FnCuStreamCreate = unsafe extern "C" fn(*mut CuStream, c_uint) -> CuResult;
type FnCuStreamDestroy = unsafe extern "C" fn(CuStream) -> CuResult;
type FnCuStreamQuery = unsafe extern "C" fn(CuStream) -> CuResult;
type FnCuStreamSynchronize = unsafe extern "C" fn(CuStream) -> CuResult;
type FnCuStreamWaitEvent = unsafe extern "C" fn(CuStream, CuEvent, c_uint) -> CuResult;

type FnCuEventCreate = unsafe extern "C" fn(*mut CuEvent, c_uint) -> CuResult;
type FnCuEventDestroy = unsafe extern "C" fn(CuEvent) -> CuResult;
type FnCuEventRecord = unsafe extern "C" fn(CuEvent, CuStream) -> CuResult;
type FnCuEventQuery = unsafe extern "C" fn(CuEvent) -> CuResult;
type FnCuEventSynchronize = unsafe extern "C" fn(CuEvent) -> CuResult;
type FnCuEventElapsedTime = unsafe extern "C" fn(*mut c_float, CuEvent, CuEvent) -> CuResult;

type FnCuModuleLoad = unsafe extern "C" fn(*mut CuModule, *const c_char) -> CuResult;
type FnCuModuleLoadData = unsafe extern "C" fn(*mut CuModule, *const c_void) -> CuResult;
type FnCuModuleUnload = unsafe extern "C" fn(CuModule) -> CuResult;
type FnCuModuleGetFunction =
    unsafe extern "C" fn(*mut CuFunction, CuModule, *const c_char) -> CuResult;
type FnCuLaunchKernel = unsafe extern "C" fn(
    CuFunction,
    c_uint, c_uint, c_uint,   // grid x, y, z
    c_uint, c_uint, c_uint,   // block x, y, z
    c_uint,                   // shared mem bytes
    CuStream,                 // stream (null = default)
    *mut *mut c_void,         // kernel params (unused, null)
    *mut *mut c_void,         // extra: packed parameter buffer
) -> CuResult;

// ---------------------------------------------------------------------------
// Loaded API struct
// ---------------------------------------------------------------------------

pub struct CudaApi {
    _lib: Library,
    pub cu_init: FnCuInit,
    pub cu_get_error_name: Option<FnCuGetErrorName>,
    pub cu_device_get_count: FnCuDeviceGetCount,
    pub cu_device_get: FnCuDeviceGet,
    pub cu_device_get_name: FnCuDeviceGetName,
    pub cu_device_get_attribute: FnCuDeviceGetAttribute,
    pub cu_device_total_mem: FnCuDeviceTotalMem,
    pub cu_ctx_create: FnCuCtxCreate,
    pub cu_ctx_destroy: FnCuCtxDestroy,
    pub cu_ctx_push_current: FnCuCtxPushCurrent,
    pub cu_ctx_pop_current: FnCuCtxPopCurrent,
    pub cu_ctx_synchronize: FnCuCtxSynchronize,
    pub cu_ctx_get_device: FnCuCtxGetDevice,
    pub cu_mem_alloc: FnCuMemAlloc,
    pub cu_mem_free: FnCuMemFree,
    pub cu_mem_alloc_host: FnCuMemAllocHost,
    pub cu_mem_free_host: FnCuMemFreeHost,
    pub cu_memcpy_htod: FnCuMemcpyHtoD,
    pub cu_memcpy_dtoh: FnCuMemcpyDtoH,
    pub cu_memcpy_htod_async: FnCuMemcpyHtoDAsync,
    pub cu_memcpy_dtoh_async: FnCuMemcpyDtoHAsync,
    pub cu_stream_create: FnCuStreamCreate,
    pub cu_stream_destroy: FnCuStreamDestroy,
    pub cu_stream_query: FnCuStreamQuery,
    pub cu_stream_synchronize: FnCuStreamSynchronize,
    pub cu_stream_wait_event: FnCuStreamWaitEvent,
    pub cu_event_create: FnCuEventCreate,
    pub cu_event_destroy: FnCuEventDestroy,
    pub cu_event_record: FnCuEventRecord,
    pub cu_event_query: FnCuEventQuery,
    pub cu_event_synchronize: FnCuEventSynchronize,
    pub cu_event_elapsed_time: FnCuEventElapsedTime,
    pub cu_module_load: FnCuModuleLoad,
    pub cu_module_load_data: FnCuModuleLoadData,
    pub cu_module_unload: FnCuModuleUnload,
    pub cu_module_get_function: FnCuModuleGetFunction,
    pub cu_launch_kernel: FnCuLaunchKernel,
}

// Safety: the loaded function pointers are process-global and the driver API
// is internally synchronized.
unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

/// Resolve one symbol from `lib`.
///
/// # Safety
/// `T` must be the correct function pointer type for `name`.
unsafe fn sym<T: Copy>(lib: &Library, name: &'static str) -> Result<T, LoadError> {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    lib.get::<T>(&bytes)
        .map(|s| *s)
        .map_err(|_| LoadError::MissingSymbol { symbol: name.to_string() })
}

impl CudaApi {
    /// Open the first loadable library from [`DEFAULT_LIBRARIES`].
    pub fn load_default() -> Result<Self, LoadError> {
        for name in DEFAULT_LIBRARIES {
            match Self::load_from(Path::new(name)) {
                Ok(api) => return Ok(api),
                Err(LoadError::Open { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(LoadError::NotFound { tried: DEFAULT_LIBRARIES.join(", ") })
    }

    /// Open the driver library at `path` and resolve every entry point.
    pub fn load_from(path: &Path) -> Result<Self, LoadError> {
        let lib = unsafe { Library::new(path) }.map_err(|e| LoadError::Open {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        unsafe {
            Ok(CudaApi {
                cu_init: sym(&lib, "cuInit")?,
                cu_get_error_name: sym(&lib, "cuGetErrorName").ok(),
                cu_device_get_count: sym(&lib, "cuDeviceGetCount")?,
                cu_device_get: sym(&lib, "cuDeviceGet")?,
                cu_device_get_name: sym(&lib, "cuDeviceGetName")?,
                cu_device_get_attribute: sym(&lib, "cuDeviceGetAttribute")?,
                cu_device_total_mem: sym(&lib, "cuDeviceTotalMem_v2")?,
                cu_ctx_create: sym(&lib, "cuCtxCreate_v2")?,
                cu_ctx_destroy: sym(&lib, "cuCtxDestroy_v2")?,
                cu_ctx_push_current: sym(&lib, "cuCtxPushCurrent_v2")?,
                cu_ctx_pop_current: sym(&lib, "cuCtxPopCurrent_v2")?,
                cu_ctx_synchronize: sym(&lib, "cuCtxSynchronize")?,
                cu_ctx_get_device: sym(&lib, "cuCtxGetDevice")?,
                cu_mem_alloc: sym(&lib, "cuMemAlloc_v2")?,
                cu_mem_free: sym(&lib, "cuMemFree_v2")?,
                cu_mem_alloc_host: sym(&lib, "cuMemAllocHost_v2")?,
                cu_mem_free_host: sym(&lib, "cuMemFreeHost")?,
                cu_memcpy_htod: sym(&lib, "cuMemcpyHtoD_v2")?,
                cu_memcpy_dtoh: sym(&lib, "cuMemcpyDtoH_v2")?,
                cu_memcpy_htod_async: sym(&lib, "cuMemcpyHtoDAsync_v2")?,
                cu_memcpy_dtoh_async: sym(&lib, "cuMemcpyDtoHAsync_v2")?,
                cu_stream_create: sym(&lib, "cuStreamCreate")?,
                cu_stream_destroy: sym(&lib, "cuStreamDestroy_v2")?,
                cu_stream_query: sym(&lib, "cuStreamQuery")?,
                cu_stream_synchronize: sym(&lib, "cuStreamSynchronize")?,
                cu_stream_wait_event: sym(&lib, "cuStreamWaitEvent")?,
                cu_event_create: sym(&lib, "cuEventCreate")?,
                cu_event_destroy: sym(&lib, "cuEventDestroy_v2")?,
                cu_event_record: sym(&lib, "cuEventRecord")?,
                cu_event_query: sym(&lib, "cuEventQuery")?,
                cu_event_synchronize: sym(&lib, "cuEventSynchronize")?,
                cu_event_elapsed_time: sym(&lib, "cuEventElapsedTime")?,
                cu_module_load: sym(&lib, "cuModuleLoad")?,
                cu_module_load_data: sym(&lib, "cuModuleLoadData")?,
                cu_module_unload: sym(&lib, "cuModuleUnload")?,
                cu_module_get_function: sym(&lib, "cuModuleGetFunction")?,
                cu_launch_kernel: sym(&lib, "cuLaunchKernel")?,
                _lib: lib,
            })
        }
    }
}
