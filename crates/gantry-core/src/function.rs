//! Kernel entry points, launch configuration and argument marshaling.
//!
//! A [`Function`] keeps its block shape, grid shape and dynamic shared memory
//! size between launches. Arguments are packed into one flat parameter block:
//! each argument is aligned to its own width and written at the running
//! offset, and the final offset is the block size handed to the driver.

use gantry_driver::{LaunchConfig, RawFunction, RawStream};

use crate::error::{Error, Result};
use crate::memory::DevicePointer;
use crate::module::Module;
use crate::stream::Stream;

/// Threads per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockSize {
    x: u32,
    y: u32,
    z: u32,
}

impl BlockSize {
    pub fn new(x: u32, y: u32, z: u32) -> Result<Self> {
        if x == 0 || y == 0 || z == 0 {
            return Err(Error::InputConstraint(format!(
                "block dimensions must be non-zero, got ({x}, {y}, {z})"
            )));
        }
        Ok(Self { x, y, z })
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn z(&self) -> u32 {
        self.z
    }

    pub fn threads(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// Blocks per grid, in two dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridSize {
    x: u32,
    y: u32,
}

impl Default for GridSize {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}

impl GridSize {
    pub fn new(x: u32, y: u32) -> Result<Self> {
        if x == 0 || y == 0 {
            return Err(Error::InputConstraint(format!(
                "grid dimensions must be non-zero, got ({x}, {y})"
            )));
        }
        Ok(Self { x, y })
    }

    /// The smallest grid of `block`s covering `x` by `y` elements.
    pub fn to_fit(block: BlockSize, x: u32, y: u32) -> Self {
        Self {
            x: x.div_ceil(block.x).max(1),
            y: y.div_ceil(block.y).max(1),
        }
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }
}

/// One kernel argument.
#[derive(Debug, Clone, Copy)]
pub enum Argument<'a> {
    /// A device address, as wide as a host pointer.
    Pointer(&'a DevicePointer),
    Integer(i32),
    Float(f32),
}

impl Argument<'_> {
    /// Bytes this argument occupies in the parameter block.
    pub fn width(&self) -> usize {
        match self {
            Argument::Pointer(_) => std::mem::size_of::<usize>(),
            Argument::Integer(_) => std::mem::size_of::<i32>(),
            Argument::Float(_) => std::mem::size_of::<f32>(),
        }
    }
}

impl<'a> From<&'a DevicePointer> for Argument<'a> {
    fn from(ptr: &'a DevicePointer) -> Self {
        Argument::Pointer(ptr)
    }
}

impl From<i32> for Argument<'_> {
    fn from(value: i32) -> Self {
        Argument::Integer(value)
    }
}

impl From<f32> for Argument<'_> {
    fn from(value: f32) -> Self {
        Argument::Float(value)
    }
}

/// A packed kernel parameter block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamBlock {
    bytes: Vec<u8>,
    offsets: Vec<usize>,
}

impl ParamBlock {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Offset of each argument, in order.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Total size, i.e. the final running offset.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Pack `args` into a parameter block.
///
/// Fails with `InvalidState` if a pointer argument has been freed.
pub fn marshal(args: &[Argument<'_>]) -> Result<ParamBlock> {
    let mut bytes = Vec::new();
    let mut offsets = Vec::with_capacity(args.len());
    for arg in args {
        let width = arg.width();
        let offset = bytes.len().next_multiple_of(width);
        bytes.resize(offset, 0);
        match arg {
            Argument::Pointer(ptr) => {
                let addr = ptr.raw()?.0 as usize;
                bytes.extend_from_slice(&addr.to_ne_bytes());
            }
            Argument::Integer(v) => bytes.extend_from_slice(&v.to_ne_bytes()),
            Argument::Float(v) => bytes.extend_from_slice(&v.to_ne_bytes()),
        }
        offsets.push(offset);
    }
    Ok(ParamBlock { bytes, offsets })
}

/// A kernel entry point in a loaded [`Module`].
#[derive(Debug)]
pub struct Function<'m> {
    module: &'m Module,
    raw: RawFunction,
    name: String,
    block: Option<BlockSize>,
    grid: Option<GridSize>,
    shared_mem_bytes: u32,
}

impl<'m> Function<'m> {
    pub(crate) fn new(module: &'m Module, raw: RawFunction, name: &str) -> Self {
        Self {
            module,
            raw,
            name: name.to_string(),
            block: None,
            grid: None,
            shared_mem_bytes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &'m Module {
        self.module
    }

    pub fn set_block_size(&mut self, block: BlockSize) {
        self.block = Some(block);
    }

    pub fn block_size(&self) -> Option<BlockSize> {
        self.block
    }

    pub fn set_grid_size(&mut self, grid: GridSize) {
        self.grid = Some(grid);
    }

    pub fn grid_size(&self) -> Option<GridSize> {
        self.grid
    }

    /// Dynamic shared memory per block, in bytes.
    pub fn set_shared_memory(&mut self, bytes: u32) {
        self.shared_mem_bytes = bytes;
    }

    pub fn shared_memory(&self) -> u32 {
        self.shared_mem_bytes
    }

    /// Launch on the context's default stream.
    ///
    /// Requires a block size; an unset grid launches a single 1x1 grid.
    ///
    /// # Safety
    /// `args` must match the kernel's parameter list, and the kernel must only
    /// touch memory that stays valid until it finishes.
    pub unsafe fn call(&self, args: &[Argument<'_>]) -> Result<()> {
        self.launch(RawStream::DEFAULT, args)
    }

    /// Launch on `stream`, which must belong to this function's context.
    ///
    /// # Safety
    /// Same contract as [`Function::call`].
    pub unsafe fn call_on(&self, stream: &Stream, args: &[Argument<'_>]) -> Result<()> {
        self.module.owner().same_as(stream.owner(), "stream")?;
        self.launch(stream.raw()?, args)
    }

    unsafe fn launch(&self, stream: RawStream, args: &[Argument<'_>]) -> Result<()> {
        let block = self.block.ok_or_else(|| {
            Error::InvalidState(format!("block size not set for kernel '{}'", self.name))
        })?;
        let grid = self.grid.unwrap_or_else(|| {
            tracing::debug!(kernel = %self.name, "grid size not set; launching a 1x1 grid");
            GridSize::default()
        });
        for arg in args {
            if let Argument::Pointer(ptr) = arg {
                self.module.owner().same_as(ptr.owner(), "pointer argument")?;
            }
        }
        let params = marshal(args)?;

        let ctx = self.module.owner().get()?;
        let scope = ctx.enter()?;
        let config = LaunchConfig {
            grid_dim: (grid.x, grid.y, 1),
            block_dim: (block.x, block.y, block.z),
            shared_mem_bytes: self.shared_mem_bytes,
            stream,
        };
        tracing::debug!(
            kernel = %self.name,
            grid = ?config.grid_dim,
            block = ?config.block_dim,
            params = params.size(),
            "launch"
        );
        scope.driver().launch(self.raw, &config, params.bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SchedulingPolicy;
    use crate::context::Context;
    use crate::runtime::Runtime;
    use gantry_driver::SimDriver;

    const PTR: usize = std::mem::size_of::<usize>();

    fn setup() -> (Arc<SimDriver>, Runtime, Context) {
        let sim = Arc::new(SimDriver::new(1));
        sim.register_kernel("noop", |_, _| Ok(()));
        let runtime = Runtime::initialize(sim.clone()).unwrap();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        (sim, runtime, ctx)
    }

    #[test]
    fn test_to_fit_exact_multiple() {
        let block = BlockSize::new(16, 16, 1).unwrap();
        assert_eq!(GridSize::to_fit(block, 32, 32), GridSize::new(2, 2).unwrap());
    }

    #[test]
    fn test_to_fit_rounds_up() {
        let block = BlockSize::new(16, 8, 1).unwrap();
        let grid = GridSize::to_fit(block, 33, 17);
        assert_eq!((grid.x(), grid.y()), (3, 3));
        let grid = GridSize::to_fit(block, 1, 1);
        assert_eq!((grid.x(), grid.y()), (1, 1));
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(BlockSize::new(0, 1, 1).is_err());
        assert!(GridSize::new(1, 0).is_err());
    }

    #[test]
    fn test_marshal_pointer_then_integer() {
        let (_sim, _runtime, ctx) = setup();
        let ptr = ctx.alloc(64).unwrap();
        let args = [Argument::from(&ptr), Argument::from(7)];
        let block = marshal(&args).unwrap();

        assert_eq!(block.size(), args[0].width() + args[1].width());
        assert_eq!(block.offsets(), &[0, PTR]);
        let addr = ptr.raw().unwrap().0 as usize;
        assert_eq!(&block.bytes()[..PTR], &addr.to_ne_bytes());
        assert_eq!(&block.bytes()[PTR..PTR + 4], &7i32.to_ne_bytes());
    }

    #[test]
    fn test_marshal_aligns_pointer_after_integer() {
        let (_sim, _runtime, ctx) = setup();
        let ptr = ctx.alloc(4).unwrap();
        let block = marshal(&[Argument::Integer(1), Argument::Pointer(&ptr)]).unwrap();
        assert_eq!(block.offsets(), &[0, PTR]);
        assert_eq!(block.size(), 2 * PTR);
    }

    #[test]
    fn test_marshal_freed_pointer() {
        let (_sim, _runtime, ctx) = setup();
        let mut ptr = ctx.alloc(4).unwrap();
        ptr.free().unwrap();
        let args = [Argument::Pointer(&ptr)];
        assert!(matches!(marshal(&args), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_call_requires_block_size() {
        let (sim, _runtime, ctx) = setup();
        let module = Module::load_image(&ctx, b"image").unwrap();
        let func = module.function("noop").unwrap();
        let err = unsafe { func.call(&[]) }.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(sim.call_count("cuLaunchKernel"), 0);
    }

    #[test]
    fn test_unset_grid_defaults_to_one_block() {
        let (sim, _runtime, ctx) = setup();
        let module = Module::load_image(&ctx, b"image").unwrap();
        let mut func = module.function("noop").unwrap();
        func.set_block_size(BlockSize::new(32, 1, 1).unwrap());
        func.set_shared_memory(128);
        unsafe { func.call(&[Argument::Integer(5)]) }.unwrap();

        let launch = &sim.launches()[0];
        assert_eq!(launch.grid, (1, 1, 1));
        assert_eq!(launch.block, (32, 1, 1));
        assert_eq!(launch.shared_mem_bytes, 128);
        assert_eq!(launch.param_i32(0).unwrap(), 5);
    }

    #[test]
    fn test_configuration_persists_across_launches() {
        let (sim, _runtime, ctx) = setup();
        let module = Module::load_image(&ctx, b"image").unwrap();
        let mut func = module.function("noop").unwrap();
        func.set_block_size(BlockSize::new(8, 8, 1).unwrap());
        func.set_grid_size(GridSize::new(4, 2).unwrap());
        unsafe {
            func.call(&[]).unwrap();
            func.call(&[]).unwrap();
        }
        let launches = sim.launches();
        assert_eq!(launches.len(), 2);
        assert!(launches.iter().all(|l| l.grid == (4, 2, 1) && l.block == (8, 8, 1)));
    }

    #[test]
    fn test_foreign_pointer_argument_rejected() {
        let (sim, runtime, ctx) = setup();
        let other = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        let foreign = other.alloc(4).unwrap();
        let module = Module::load_image(&ctx, b"image").unwrap();
        let mut func = module.function("noop").unwrap();
        func.set_block_size(BlockSize::new(1, 1, 1).unwrap());
        let err = unsafe { func.call(&[Argument::Pointer(&foreign)]) }.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(sim.call_count("cuLaunchKernel"), 0);
    }

    #[test]
    fn test_call_on_stream() {
        let (sim, _runtime, ctx) = setup();
        let stream = ctx.create_stream().unwrap();
        let module = Module::load_image(&ctx, b"image").unwrap();
        let mut func = module.function("noop").unwrap();
        func.set_block_size(BlockSize::new(1, 1, 1).unwrap());
        unsafe { func.call_on(&stream, &[]) }.unwrap();
        assert!(!sim.launches()[0].stream.is_default());
    }
}
