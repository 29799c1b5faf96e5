//! # gantry-driver
//!
//! The CUDA driver capability consumed by `gantry-core`.
//!
//! Provides:
//! - The [`Driver`] trait: one method per driver entry point
//! - Status-code names and [`DriverError`]
//! - [`CudaDriver`]: the real driver, loaded at runtime with `libloading`
//!   (no build-time CUDA dependency)
//! - [`SimDriver`]: an in-process simulated driver for tests and GPU-less runs

pub mod status;
pub mod error;
pub mod types;
pub mod driver;
pub mod ffi;
pub mod native;
pub mod sim;

pub use driver::Driver;
pub use error::{check, check_query, DriverError, DriverResult, LoadError};
pub use native::CudaDriver;
pub use sim::{SimDriver, SimLaunch, SimMemory};
pub use types::{
    DeviceProperties, DevicePtr, HostPtr, LaunchConfig, RawContext, RawEvent, RawFunction,
    RawModule, RawStream, CTX_SCHED_AUTO, CTX_SCHED_SPIN, CTX_SCHED_YIELD,
};
