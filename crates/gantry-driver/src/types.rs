//! Raw handle types shared by every driver backend.
//!
//! Handles are plain integers so they are `Copy + Send + Sync`; the native
//! backend converts them to and from the driver's pointer types at the FFI
//! boundary.

use serde::Serialize;

/// Native context handle (`CUcontext`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawContext(pub usize);

/// Native stream handle (`CUstream`). Zero is the context's default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawStream(pub usize);

impl RawStream {
    /// The implicit per-context stream 0.
    pub const DEFAULT: RawStream = RawStream(0);

    pub fn is_default(&self) -> bool {
        self.0 == 0
    }
}

/// Native event handle (`CUevent`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEvent(pub usize);

/// Native module handle (`CUmodule`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawModule(pub usize);

/// Native function handle (`CUfunction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawFunction(pub usize);

/// Device address (`CUdeviceptr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

/// Page-locked host allocation returned by `cuMemAllocHost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr(pub *mut u8);

// Safety: a pinned allocation is plain host memory; ownership and aliasing are
// managed by the buffer type that holds it.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

/// `CU_CTX_SCHED_*` context creation flags.
pub const CTX_SCHED_AUTO: u32 = 0x00;
pub const CTX_SCHED_SPIN: u32 = 0x01;
pub const CTX_SCHED_YIELD: u32 = 0x02;

/// Properties of one physical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProperties {
    pub name: String,
    pub clock_rate_khz: u32,
    pub multiprocessor_count: u32,
    pub total_memory: usize,
    pub max_threads_per_block: u32,
    pub shared_memory_per_block: u32,
    pub warp_size: u32,
}

impl DeviceProperties {
    /// Relative throughput estimate used to pick the fastest device.
    pub fn gflops_score(&self) -> u64 {
        self.clock_rate_khz as u64 * self.multiprocessor_count.max(1) as u64
    }
}

/// Launch geometry for one kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid_dim: (u32, u32, u32),
    pub block_dim: (u32, u32, u32),
    pub shared_mem_bytes: u32,
    pub stream: RawStream,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(clock: u32, sms: u32) -> DeviceProperties {
        DeviceProperties {
            name: "test".into(),
            clock_rate_khz: clock,
            multiprocessor_count: sms,
            total_memory: 0,
            max_threads_per_block: 1024,
            shared_memory_per_block: 48 * 1024,
            warp_size: 32,
        }
    }

    #[test]
    fn test_gflops_score() {
        assert_eq!(props(1_000, 4).gflops_score(), 4_000);
        // missing SM count still ranks by clock
        assert_eq!(props(1_500, 0).gflops_score(), 1_500);
    }

    #[test]
    fn test_default_stream() {
        assert!(RawStream::DEFAULT.is_default());
        assert!(!RawStream(7).is_default());
    }
}
