//! Driver contexts and the push/operate/pop protocol.
//!
//! A [`Context`] exclusively owns one native context. Every device-touching
//! operation, on the context itself or on anything it created, runs inside a
//! scope that takes the context's re-entrant lock, makes the context current
//! on the calling thread, issues the driver calls, and pops again, also when
//! the operation fails or panics. Distinct contexts never contend.
//!
//! Contexts come back from [`Context::create`] floating: the driver leaves a
//! new context pushed and `create` pops it before returning.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use gantry_driver::{Driver, RawContext};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::config::SchedulingPolicy;
use crate::error::{Error, Result};
use crate::memory::DevicePointer;
use crate::module::{Cubin, Module};
use crate::runtime::{Device, Runtime};
use crate::stack::{ContextId, ContextStack, ThreadKey};
use crate::stream::{Event, Stream};

struct State {
    raw: Option<RawContext>,
}

pub(crate) struct ContextInner {
    id: ContextId,
    ordinal: u32,
    policy: SchedulingPolicy,
    runtime: Runtime,
    state: ReentrantMutex<RefCell<State>>,
    pinned: AtomicUsize,
}

impl ContextInner {
    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    fn driver(&self) -> &dyn Driver {
        &**self.runtime.driver()
    }

    fn stack(&self) -> &ContextStack {
        self.runtime.stack()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().borrow().raw.is_none()
    }

    fn destroyed(&self) -> Error {
        Error::InvalidState(format!("{} has been destroyed", self.id))
    }

    /// Lock this context and make it current on the calling thread.
    ///
    /// Reuses the thread's current entry when this context is already on top,
    /// so scopes nest inside [`Context::run`].
    pub(crate) fn enter(&self) -> Result<Scope<'_>> {
        let guard = self.state.lock();
        let raw = guard.borrow().raw.ok_or_else(|| self.destroyed())?;
        if self.stack().current() == Some(self.id) {
            return Ok(Scope {
                ctx: self,
                raw,
                pushed: false,
                _guard: guard,
            });
        }
        self.push_raw(raw)?;
        Ok(Scope {
            ctx: self,
            raw,
            pushed: true,
            _guard: guard,
        })
    }

    /// Bookkeeping push plus driver push; a failed driver push leaves the
    /// stack as it was.
    fn push_raw(&self, raw: RawContext) -> Result<()> {
        self.stack().push(self.id)?;
        if let Err(err) = self.driver().context_push(raw) {
            self.stack().pop()?;
            return Err(err.into());
        }
        Ok(())
    }

    /// Pop this context off the calling thread. It must be on top.
    fn pop_raw(&self) -> Result<()> {
        if self.stack().current() != Some(self.id) {
            return Err(Error::InvalidState(format!(
                "{} is not the current context of this thread",
                self.id
            )));
        }
        self.driver().context_pop()?;
        self.stack().pop()?;
        Ok(())
    }

    pub(crate) fn pinned_acquired(&self) {
        self.pinned.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn pinned_released(&self) {
        self.pinned.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An active push of one context on the calling thread, holding its lock.
pub(crate) struct Scope<'a> {
    ctx: &'a ContextInner,
    raw: RawContext,
    pushed: bool,
    _guard: ReentrantMutexGuard<'a, RefCell<State>>,
}

impl Scope<'_> {
    pub(crate) fn driver(&self) -> &dyn Driver {
        self.ctx.driver()
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if !self.pushed {
            return;
        }
        match self.ctx.driver().context_pop() {
            Ok(popped) if popped != self.raw => {
                tracing::warn!(ctx = %self.ctx.id, "driver popped an unexpected context");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(ctx = %self.ctx.id, "context pop failed: {err}"),
        }
        if let Err(err) = self.ctx.stack().pop() {
            tracing::warn!(ctx = %self.ctx.id, "context stack pop failed: {err}");
        }
    }
}

/// Non-owning link from a resource to the context that created it.
#[derive(Debug, Clone)]
pub(crate) struct ContextRef {
    inner: Weak<ContextInner>,
    id: ContextId,
}

impl ContextRef {
    pub(crate) fn new(inner: &Arc<ContextInner>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            id: inner.id,
        }
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn get(&self) -> Result<Arc<ContextInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| Error::InvalidState(format!("{} has been dropped", self.id)))
    }

    /// The owner, unless it is gone or destroyed. The driver releases
    /// everything a context owned when the context itself is destroyed.
    pub(crate) fn live(&self) -> Option<Arc<ContextInner>> {
        self.inner.upgrade().filter(|ctx| !ctx.is_destroyed())
    }

    /// Fail unless `other` belongs to the same context.
    pub(crate) fn same_as(&self, other: &ContextRef, what: &str) -> Result<()> {
        if self.id != other.id {
            return Err(Error::InvalidState(format!(
                "{what} belongs to {}, expected {}",
                other.id, self.id
            )));
        }
        Ok(())
    }
}

/// An exclusively owned driver context bound to one device.
pub struct Context {
    inner: Arc<ContextInner>,
    default_stream: OnceLock<Stream>,
}

impl Context {
    /// Create a context on `device`. The returned context is floating.
    pub fn create(device: &Device, policy: SchedulingPolicy) -> Result<Self> {
        let runtime = device.runtime().clone();
        let driver = runtime.driver().clone();
        let raw = driver.context_create(policy.flags(), device.ordinal())?;

        // The driver leaves the new context current.
        match driver.context_pop() {
            Ok(popped) if popped != raw => {
                tracing::warn!("driver popped an unexpected context after create");
            }
            Ok(_) => {}
            Err(err) => {
                if let Err(destroy_err) = driver.context_destroy(raw) {
                    tracing::warn!("failed to destroy half-created context: {destroy_err}");
                }
                return Err(err.into());
            }
        }

        let id = runtime.next_context_id();
        tracing::debug!(ctx = %id, device = device.ordinal(), ?policy, "context created");
        Ok(Self {
            inner: Arc::new(ContextInner {
                id,
                ordinal: device.ordinal(),
                policy,
                runtime,
                state: ReentrantMutex::new(RefCell::new(State { raw: Some(raw) })),
                pinned: AtomicUsize::new(0),
            }),
            default_stream: OnceLock::new(),
        })
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn device(&self) -> Device {
        Device::new(self.inner.ordinal, self.inner.runtime.clone())
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.inner.policy
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// `true` when this context is the calling thread's current context.
    pub fn is_current(&self) -> bool {
        self.inner.stack().current() == Some(self.inner.id)
    }

    /// Make this context current on the calling thread until [`Context::pop`]
    /// or [`Runtime::pop_current`]. Fails with `InvalidState` unless the
    /// context is floating.
    pub fn push(&self) -> Result<()> {
        let guard = self.inner.state.lock();
        let raw = guard.borrow().raw.ok_or_else(|| self.inner.destroyed())?;
        self.inner.push_raw(raw)
    }

    /// Pop this context off the calling thread. It must be on top.
    pub fn pop(&self) -> Result<()> {
        let _guard = self.inner.state.lock();
        self.inner.pop_raw()
    }

    /// Run `action` with this context current, popping afterwards even if
    /// `action` panics.
    pub fn run<R>(&self, action: impl FnOnce() -> R) -> Result<R> {
        let _scope = self.inner.enter()?;
        Ok(action())
    }

    /// Block until all work queued in this context has completed.
    pub fn synchronize(&self) -> Result<()> {
        let scope = self.inner.enter()?;
        scope.driver().context_synchronize()?;
        Ok(())
    }

    /// The context's implicit stream 0, created on first use.
    pub fn default_stream(&self) -> &Stream {
        self.default_stream
            .get_or_init(|| Stream::default_for(&self.inner))
    }

    /// Allocate `bytes` of device memory.
    pub fn alloc(&self, bytes: usize) -> Result<DevicePointer> {
        DevicePointer::alloc(&self.inner, bytes)
    }

    pub fn create_stream(&self) -> Result<Stream> {
        Stream::create(&self.inner)
    }

    pub fn load_module(&self, cubin: &Cubin) -> Result<Module> {
        Module::load(self, cubin)
    }

    /// Record a new event on the default stream.
    pub fn record_default_event(&self) -> Result<Event> {
        self.default_stream().record_event()
    }

    /// Destroy the native context. Idempotent.
    ///
    /// Fails with `InvalidState` while the context is current on any thread
    /// or while pinned buffers allocated through it are alive. Other resources
    /// it created are released by the driver; their later operations fail and
    /// their drops skip the driver.
    pub fn destroy(&self) -> Result<()> {
        let inner = &self.inner;
        let guard = inner.state.lock();
        let Some(raw) = guard.borrow().raw else {
            return Ok(());
        };
        if let Some(thread) = inner.stack().bound_thread(inner.id) {
            let place = if thread == ThreadKey::current() {
                "this thread"
            } else {
                "another thread"
            };
            return Err(Error::InvalidState(format!(
                "{} is current on {place}; pop it before destroying",
                inner.id
            )));
        }
        let pinned = inner.pinned.load(Ordering::SeqCst);
        if pinned > 0 {
            return Err(Error::InvalidState(format!(
                "{} still owns {pinned} pinned host buffer(s)",
                inner.id
            )));
        }

        inner.push_raw(raw)?;
        match inner.driver().context_destroy(raw) {
            Ok(()) => {
                // the driver pops a destroyed context that was current
                inner.stack().pop()?;
                guard.borrow_mut().raw = None;
                tracing::debug!(ctx = %inner.id, "context destroyed");
                Ok(())
            }
            Err(err) => {
                if let Err(pop_err) = inner.pop_raw() {
                    tracing::warn!(ctx = %inner.id, "pop after failed destroy: {pop_err}");
                }
                Err(err.into())
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("device", &self.inner.ordinal)
            .field("policy", &self.inner.policy)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.inner.is_destroyed() {
            return;
        }
        // left pushed by an explicit push() on this thread
        if self.is_current() {
            if let Err(err) = self.pop() {
                tracing::warn!(ctx = %self.inner.id, "failed to pop context on drop: {err}");
            }
        }
        if let Err(err) = self.destroy() {
            tracing::warn!(ctx = %self.inner.id, "leaking context: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_driver::status::{CUDA_ERROR_INVALID_CONTEXT, CUDA_ERROR_LAUNCH_FAILED};
    use gantry_driver::SimDriver;

    fn setup() -> (Arc<SimDriver>, Runtime) {
        let sim = Arc::new(SimDriver::new(1));
        let runtime = Runtime::initialize(sim.clone()).unwrap();
        (sim, runtime)
    }

    #[test]
    fn test_create_returns_floating_context() {
        let (sim, runtime) = setup();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Spin).unwrap();
        assert!(!ctx.is_current());
        assert!(runtime.stack().is_floating(ctx.id()));
        assert_eq!(sim.stack_depth(), 0);
        assert_eq!(ctx.policy(), SchedulingPolicy::Spin);
        assert_eq!(ctx.device().ordinal(), 0);
    }

    #[test]
    fn test_run_pushes_and_pops() {
        let (sim, runtime) = setup();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        let depth = ctx
            .run(|| {
                assert!(ctx.is_current());
                sim.stack_depth()
            })
            .unwrap();
        assert_eq!(depth, 1);
        assert_eq!(sim.stack_depth(), 0);
        assert_eq!(runtime.stack().depth(), 0);
    }

    #[test]
    fn test_run_nests_without_double_push() {
        let (sim, runtime) = setup();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        ctx.run(|| {
            ctx.synchronize().unwrap();
            assert_eq!(sim.stack_depth(), 1);
        })
        .unwrap();
        assert_eq!(sim.call_count("cuCtxPushCurrent"), 1);
        assert_eq!(sim.stack_depth(), 0);
    }

    #[test]
    fn test_run_pops_on_panic() {
        let (sim, runtime) = setup();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ctx.run(|| panic!("boom")).unwrap();
        }));
        assert!(result.is_err());
        assert_eq!(sim.stack_depth(), 0);
        assert_eq!(runtime.stack().depth(), 0);
    }

    #[test]
    fn test_synchronize_failure_restores_stack() {
        let (sim, runtime) = setup();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        sim.fail_next("cuCtxSynchronize", CUDA_ERROR_LAUNCH_FAILED);
        let err = ctx.synchronize().unwrap_err();
        assert_eq!(err.driver_status(), Some("CUDA_ERROR_LAUNCH_FAILED"));
        assert_eq!(sim.stack_depth(), 0);
        assert_eq!(runtime.stack().depth(), 0);
    }

    #[test]
    fn test_failed_driver_push_leaves_stack_unchanged() {
        let (sim, runtime) = setup();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        sim.fail_next("cuCtxPushCurrent", CUDA_ERROR_INVALID_CONTEXT);
        assert!(ctx.synchronize().is_err());
        assert!(runtime.stack().is_floating(ctx.id()));
        assert_eq!(sim.call_count("cuCtxSynchronize"), 0);
    }

    #[test]
    fn test_push_twice_is_invalid_state() {
        let (sim, runtime) = setup();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        ctx.push().unwrap();
        let err = ctx.push().unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(runtime.stack().depth(), 1);
        assert_eq!(sim.stack_depth(), 1);
        ctx.pop().unwrap();
        assert!(ctx.pop().is_err());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (sim, runtime) = setup();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        ctx.destroy().unwrap();
        ctx.destroy().unwrap();
        assert!(ctx.is_destroyed());
        assert_eq!(sim.call_count("cuCtxDestroy"), 1);
        assert_eq!(sim.live_contexts(), 0);
        assert_eq!(sim.stack_depth(), 0);
        assert!(matches!(ctx.synchronize(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_destroy_rejected_while_current() {
        let (sim, runtime) = setup();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        ctx.push().unwrap();
        assert!(matches!(ctx.destroy(), Err(Error::InvalidState(_))));
        ctx.pop().unwrap();
        ctx.destroy().unwrap();
        assert_eq!(sim.live_contexts(), 0);
    }

    #[test]
    fn test_drop_destroys_context() {
        let (sim, runtime) = setup();
        {
            let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
            ctx.push().unwrap();
        }
        assert_eq!(sim.live_contexts(), 0);
        assert_eq!(sim.stack_depth(), 0);
        assert_eq!(runtime.stack().depth(), 0);
    }

    #[test]
    fn test_default_stream_is_memoized() {
        let (_sim, runtime) = setup();
        let ctx = runtime.device(0).unwrap().create_context(SchedulingPolicy::Auto).unwrap();
        let a = ctx.default_stream() as *const Stream;
        let b = ctx.default_stream() as *const Stream;
        assert_eq!(a, b);
        assert!(ctx.default_stream().is_default());
    }
}
