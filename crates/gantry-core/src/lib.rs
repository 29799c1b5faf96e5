//! # gantry-core
//!
//! Context-scoped resource management over the CUDA driver.
//!
//! Provides:
//! - Explicit driver initialization and device enumeration ([`Runtime`], [`Device`])
//! - A per-thread context stack ([`ContextStack`]) and exclusively owned
//!   [`Context`]s whose operations all run push/operate/pop under a
//!   per-context lock
//! - Context-owned resources: [`DevicePointer`], [`Stream`], [`Event`], [`Module`]
//! - Kernel launch with a packed argument block ([`Function`], [`Argument`])
//! - Host buffers, optionally pinned, with typed views ([`NativeBuffer`], [`NativeArray`])
//!
//! ```no_run
//! use std::sync::Arc;
//! use gantry_core::{Argument, BlockSize, Cubin, GridSize, NativeIntArray, Runtime, SchedulingPolicy};
//! use gantry_driver::CudaDriver;
//!
//! # fn main() -> gantry_core::Result<()> {
//! let driver = CudaDriver::load().map_err(|e| gantry_core::Error::DriverUnavailable(e.to_string()))?;
//! let runtime = Runtime::initialize(Arc::new(driver))?;
//! let ctx = runtime.max_gflops_device()?.create_context(SchedulingPolicy::Auto)?;
//!
//! let input = NativeIntArray::from_slice(&[1, 2, 3, 4]);
//! let data = gantry_core::DevicePointer::to_device(&ctx, input.buffer())?;
//!
//! let module = ctx.load_module(&Cubin::new("increment.cubin"))?;
//! let mut kernel = module.function("increment_kernel")?;
//! let block = BlockSize::new(4, 1, 1)?;
//! kernel.set_block_size(block);
//! kernel.set_grid_size(GridSize::to_fit(block, 4, 1));
//! unsafe { kernel.call(&[Argument::Pointer(&data), Argument::Integer(1)])? };
//!
//! let mut output = NativeIntArray::new(4)?;
//! data.copy_to(output.buffer_mut())?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod config;
pub mod stack;
pub mod handle;
pub mod runtime;
pub mod context;
pub mod buffer;
pub mod memory;
pub mod stream;
pub mod module;
pub mod function;

pub use buffer::{
    NativeArray, NativeBuffer, NativeFloatArray, NativeFloatArray2D, NativeIntArray, NativeStruct,
};
pub use config::{DeviceSelection, RuntimeConfig, SchedulingPolicy};
pub use context::Context;
pub use error::{Error, Result};
pub use function::{marshal, Argument, BlockSize, Function, GridSize, ParamBlock};
pub use handle::DeviceHandle;
pub use memory::DevicePointer;
pub use module::{Cubin, Module};
pub use runtime::{Device, Runtime};
pub use stack::{ContextId, ContextStack, ThreadKey};
pub use stream::{Event, Stream};
