//! Loaded device code.

use std::path::{Path, PathBuf};

use gantry_driver::RawModule;

use crate::context::{Context, ContextRef};
use crate::error::Result;
use crate::function::Function;
use crate::handle::DeviceHandle;
use crate::stack::ContextId;

/// A path to compiled device code the driver can load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cubin {
    path: PathBuf,
}

impl Cubin {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<PathBuf> for Cubin {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&Path> for Cubin {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

/// Device code resident in one context.
#[derive(Debug)]
pub struct Module {
    handle: DeviceHandle<RawModule>,
    owner: ContextRef,
    source: String,
}

impl Module {
    /// Load `cubin` into `ctx`.
    pub fn load(ctx: &Context, cubin: &Cubin) -> Result<Self> {
        let inner = ctx.inner();
        let scope = inner.enter()?;
        let raw = scope.driver().module_load(cubin.path())?;
        let source = cubin.path().display().to_string();
        tracing::debug!(ctx = %inner.id(), %source, "module loaded");
        Ok(Self {
            handle: DeviceHandle::new(raw, "module"),
            owner: ContextRef::new(inner),
            source,
        })
    }

    /// Load an in-memory cubin, fatbin or PTX image into `ctx`.
    pub fn load_image(ctx: &Context, image: &[u8]) -> Result<Self> {
        let inner = ctx.inner();
        let scope = inner.enter()?;
        let raw = scope.driver().module_load_data(image)?;
        tracing::debug!(ctx = %inner.id(), bytes = image.len(), "module loaded from image");
        Ok(Self {
            handle: DeviceHandle::new(raw, "module"),
            owner: ContextRef::new(inner),
            source: format!("<image: {} bytes>", image.len()),
        })
    }

    /// Where the module was loaded from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_freed(&self) -> bool {
        self.handle.is_freed()
    }

    pub fn context_id(&self) -> ContextId {
        self.owner.id()
    }

    pub(crate) fn owner(&self) -> &ContextRef {
        &self.owner
    }

    /// Look up the kernel entry point `name`.
    pub fn function(&self, name: &str) -> Result<Function<'_>> {
        let raw = self.handle.get()?;
        let ctx = self.owner.get()?;
        let scope = ctx.enter()?;
        let func = scope.driver().module_get_function(raw, name)?;
        Ok(Function::new(self, func, name))
    }

    /// Unload the module. Idempotent.
    pub fn unload(&mut self) -> Result<()> {
        let owner = &self.owner;
        let source = &self.source;
        self.handle.release(|raw| {
            let Some(ctx) = owner.live() else {
                return Ok(());
            };
            let scope = ctx.enter()?;
            scope.driver().module_unload(raw)?;
            tracing::debug!(ctx = %ctx.id(), %source, "module unloaded");
            Ok(())
        })
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if let Err(err) = self.unload() {
            tracing::warn!(source = %self.source, "failed to unload module: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SchedulingPolicy;
    use crate::error::Error;
    use crate::runtime::Runtime;
    use gantry_driver::SimDriver;

    fn setup() -> (Arc<SimDriver>, Runtime, Context) {
        let sim = Arc::new(SimDriver::new(1));
        sim.register_kernel("noop", |_, _| Ok(()));
        let runtime = Runtime::initialize(sim.clone()).unwrap();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        (sim, runtime, ctx)
    }

    #[test]
    fn test_load_from_file() {
        let (sim, _runtime, ctx) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernels.cubin");
        std::fs::write(&path, b"\x7fELF fake cubin").unwrap();

        let module = ctx.load_module(&Cubin::new(&path)).unwrap();
        assert_eq!(module.source(), path.display().to_string());
        assert!(module.function("noop").is_ok());
        assert_eq!(sim.live_modules(), 1);
    }

    #[test]
    fn test_missing_file_is_driver_error() {
        let (_sim, _runtime, ctx) = setup();
        let dir = tempfile::tempdir().unwrap();
        let err = ctx.load_module(&Cubin::new(dir.path().join("absent.cubin"))).unwrap_err();
        assert_eq!(err.driver_status(), Some("CUDA_ERROR_FILE_NOT_FOUND"));
    }

    #[test]
    fn test_unknown_function() {
        let (_sim, _runtime, ctx) = setup();
        let module = Module::load_image(&ctx, b"image").unwrap();
        let err = module.function("missing").unwrap_err();
        assert_eq!(err.driver_status(), Some("CUDA_ERROR_NOT_FOUND"));
    }

    #[test]
    fn test_unload_idempotent() {
        let (sim, _runtime, ctx) = setup();
        let mut module = Module::load_image(&ctx, b"image").unwrap();
        module.unload().unwrap();
        module.unload().unwrap();
        assert_eq!(sim.call_count("cuModuleUnload"), 1);
        assert!(matches!(module.function("noop"), Err(Error::InvalidState(_))));
    }
}
