//! Streams and events.

use std::sync::Arc;

use gantry_driver::{RawEvent, RawStream};

use crate::context::{ContextInner, ContextRef};
use crate::error::Result;
use crate::handle::DeviceHandle;
use crate::stack::ContextId;

/// An ordered queue of device work.
#[derive(Debug)]
pub struct Stream {
    handle: DeviceHandle<RawStream>,
    owner: ContextRef,
}

impl Stream {
    /// Wrapper over the context's implicit stream 0. Never destroyed.
    pub(crate) fn default_for(ctx: &Arc<ContextInner>) -> Self {
        Self {
            handle: DeviceHandle::new(RawStream::DEFAULT, "stream"),
            owner: ContextRef::new(ctx),
        }
    }

    pub(crate) fn create(ctx: &Arc<ContextInner>) -> Result<Self> {
        let scope = ctx.enter()?;
        let raw = scope.driver().stream_create()?;
        tracing::debug!(ctx = %ctx.id(), stream = raw.0, "stream created");
        Ok(Self {
            handle: DeviceHandle::new(raw, "stream"),
            owner: ContextRef::new(ctx),
        })
    }

    pub fn is_default(&self) -> bool {
        matches!(self.handle.get(), Ok(raw) if raw.is_default())
    }

    pub fn is_freed(&self) -> bool {
        self.handle.is_freed()
    }

    pub fn context_id(&self) -> ContextId {
        self.owner.id()
    }

    pub(crate) fn raw(&self) -> Result<RawStream> {
        self.handle.get()
    }

    pub(crate) fn owner(&self) -> &ContextRef {
        &self.owner
    }

    /// `Ok(true)` once all queued work has completed, `Ok(false)` while some
    /// is pending. Never blocks.
    pub fn is_ready(&self) -> Result<bool> {
        let raw = self.raw()?;
        let ctx = self.owner.get()?;
        let scope = ctx.enter()?;
        Ok(scope.driver().stream_query(raw)?)
    }

    /// Block until all queued work has completed.
    pub fn synchronize(&self) -> Result<()> {
        let raw = self.raw()?;
        let ctx = self.owner.get()?;
        let scope = ctx.enter()?;
        scope.driver().stream_synchronize(raw)?;
        Ok(())
    }

    /// Record a new event at the current end of this stream.
    pub fn record_event(&self) -> Result<Event> {
        let raw = self.raw()?;
        let ctx = self.owner.get()?;
        let scope = ctx.enter()?;
        let event = scope.driver().event_create()?;
        if let Err(err) = scope.driver().event_record(event, raw) {
            if let Err(destroy_err) = scope.driver().event_destroy(event) {
                tracing::warn!("failed to destroy unrecorded event: {destroy_err}");
            }
            return Err(err.into());
        }
        Ok(Event {
            handle: DeviceHandle::new(event, "event"),
            owner: self.owner.clone(),
        })
    }

    /// Make later work on this stream wait until `event` is reached.
    pub fn wait_event(&self, event: &Event) -> Result<()> {
        self.owner.same_as(&event.owner, "event")?;
        let raw = self.raw()?;
        let ev = event.raw()?;
        let ctx = self.owner.get()?;
        let scope = ctx.enter()?;
        scope.driver().stream_wait_event(raw, ev)?;
        Ok(())
    }

    /// Destroy the stream. Idempotent; a no-op for the default stream.
    pub fn destroy(&mut self) -> Result<()> {
        let owner = &self.owner;
        self.handle.release(|raw| {
            if raw.is_default() {
                return Ok(());
            }
            let Some(ctx) = owner.live() else {
                return Ok(());
            };
            let scope = ctx.enter()?;
            scope.driver().stream_destroy(raw)?;
            tracing::debug!(ctx = %ctx.id(), stream = raw.0, "stream destroyed");
            Ok(())
        })
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            tracing::warn!("failed to destroy stream: {err}");
        }
    }
}

/// A marker recorded at a point in a stream.
#[derive(Debug)]
pub struct Event {
    handle: DeviceHandle<RawEvent>,
    owner: ContextRef,
}

impl Event {
    pub fn is_freed(&self) -> bool {
        self.handle.is_freed()
    }

    pub fn context_id(&self) -> ContextId {
        self.owner.id()
    }

    fn raw(&self) -> Result<RawEvent> {
        self.handle.get()
    }

    /// `Ok(true)` once the stream has reached this event, `Ok(false)` before.
    /// Never blocks.
    pub fn is_reached(&self) -> Result<bool> {
        let raw = self.raw()?;
        let ctx = self.owner.get()?;
        let scope = ctx.enter()?;
        Ok(scope.driver().event_query(raw)?)
    }

    /// Block until the stream has reached this event.
    pub fn synchronize(&self) -> Result<()> {
        let raw = self.raw()?;
        let ctx = self.owner.get()?;
        let scope = ctx.enter()?;
        scope.driver().event_synchronize(raw)?;
        Ok(())
    }

    /// Milliseconds between `start` and `end`.
    ///
    /// Both events must belong to the same context. The driver only defines
    /// the result when both were recorded on that context's default stream;
    /// that part is not checked here.
    pub fn elapsed_time(start: &Event, end: &Event) -> Result<f32> {
        start.owner.same_as(&end.owner, "end event")?;
        let a = start.raw()?;
        let b = end.raw()?;
        let ctx = start.owner.get()?;
        let scope = ctx.enter()?;
        Ok(scope.driver().event_elapsed_time(a, b)?)
    }

    /// Destroy the event. Idempotent.
    pub fn destroy(&mut self) -> Result<()> {
        let owner = &self.owner;
        self.handle.release(|raw| {
            let Some(ctx) = owner.live() else {
                return Ok(());
            };
            let scope = ctx.enter()?;
            scope.driver().event_destroy(raw)?;
            Ok(())
        })
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            tracing::warn!("failed to destroy event: {err}");
        }
    }
}
