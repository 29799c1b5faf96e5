//! Per-thread current-context bookkeeping.
//!
//! `ContextStack` maps each thread to an ordered stack of context ids (top =
//! current) and each bound context back to the one thread it is current on.
//! It never calls the driver; [`crate::Context`] pairs every bookkeeping push
//! or pop with the matching driver call.

use std::collections::HashMap;
use std::fmt;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Process-unique identity of a [`crate::Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Identity of a thread as seen by the stack.
///
/// `Synthetic` keys let a single test thread drive several logical threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKey {
    Os(ThreadId),
    Synthetic(u64),
}

impl ThreadKey {
    pub fn current() -> Self {
        ThreadKey::Os(std::thread::current().id())
    }
}

#[derive(Default)]
struct Stacks {
    stacks: HashMap<ThreadKey, Vec<ContextId>>,
    bound: HashMap<ContextId, ThreadKey>,
}

/// Mapping from thread identity to that thread's context stack.
#[derive(Default)]
pub struct ContextStack {
    inner: Mutex<Stacks>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `ctx` on the calling thread's stack.
    pub fn push(&self, ctx: ContextId) -> Result<()> {
        self.push_on(ThreadKey::current(), ctx)
    }

    /// Push `ctx` on `thread`'s stack. Fails unless `ctx` is floating.
    pub fn push_on(&self, thread: ThreadKey, ctx: ContextId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(owner) = inner.bound.get(&ctx) {
            let msg = if *owner == thread {
                format!("{ctx} is already current on this thread")
            } else {
                format!("{ctx} is current on another thread")
            };
            return Err(Error::InvalidState(msg));
        }
        inner.bound.insert(ctx, thread);
        inner.stacks.entry(thread).or_default().push(ctx);
        tracing::trace!(%ctx, ?thread, "context stack push");
        Ok(())
    }

    /// Pop the calling thread's current context; it becomes floating.
    pub fn pop(&self) -> Result<ContextId> {
        self.pop_on(ThreadKey::current())
    }

    pub fn pop_on(&self, thread: ThreadKey) -> Result<ContextId> {
        let mut inner = self.inner.lock();
        let ctx = inner
            .stacks
            .get_mut(&thread)
            .and_then(Vec::pop)
            .ok_or_else(|| Error::InvalidState("context stack is empty".into()))?;
        inner.bound.remove(&ctx);
        if inner.stacks.get(&thread).is_some_and(Vec::is_empty) {
            inner.stacks.remove(&thread);
        }
        tracing::trace!(%ctx, ?thread, "context stack pop");
        Ok(ctx)
    }

    /// The calling thread's current context.
    pub fn current(&self) -> Option<ContextId> {
        self.current_on(ThreadKey::current())
    }

    pub fn current_on(&self, thread: ThreadKey) -> Option<ContextId> {
        self.inner
            .lock()
            .stacks
            .get(&thread)
            .and_then(|s| s.last().copied())
    }

    pub fn depth(&self) -> usize {
        self.depth_on(ThreadKey::current())
    }

    pub fn depth_on(&self, thread: ThreadKey) -> usize {
        self.inner.lock().stacks.get(&thread).map_or(0, Vec::len)
    }

    /// `true` when `ctx` is not on any thread's stack.
    pub fn is_floating(&self, ctx: ContextId) -> bool {
        !self.inner.lock().bound.contains_key(&ctx)
    }

    /// The thread `ctx` is current on, if any.
    pub fn bound_thread(&self, ctx: ContextId) -> Option<ThreadKey> {
        self.inner.lock().bound.get(&ctx).copied()
    }

    /// Copy of `thread`'s stack, bottom first.
    pub fn snapshot(&self, thread: ThreadKey) -> Vec<ContextId> {
        self.inner
            .lock()
            .stacks
            .get(&thread)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ThreadKey = ThreadKey::Synthetic(1);
    const B: ThreadKey = ThreadKey::Synthetic(2);

    #[test]
    fn test_push_pop_order() {
        let stack = ContextStack::new();
        stack.push_on(A, ContextId(1)).unwrap();
        stack.push_on(A, ContextId(2)).unwrap();
        assert_eq!(stack.current_on(A), Some(ContextId(2)));
        assert_eq!(stack.snapshot(A), vec![ContextId(1), ContextId(2)]);
        assert_eq!(stack.pop_on(A).unwrap(), ContextId(2));
        assert_eq!(stack.pop_on(A).unwrap(), ContextId(1));
        assert_eq!(stack.depth_on(A), 0);
    }

    #[test]
    fn test_pop_empty_is_invalid_state() {
        let stack = ContextStack::new();
        assert!(matches!(stack.pop_on(A), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_push_current_context_leaves_stack_unchanged() {
        let stack = ContextStack::new();
        stack.push_on(A, ContextId(1)).unwrap();
        stack.push_on(A, ContextId(2)).unwrap();
        let before = stack.snapshot(A);

        let err = stack.push_on(A, ContextId(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(stack.snapshot(A), before);
    }

    #[test]
    fn test_context_current_on_one_thread_only() {
        let stack = ContextStack::new();
        stack.push_on(A, ContextId(7)).unwrap();
        let err = stack.push_on(B, ContextId(7)).unwrap_err();
        assert!(err.to_string().contains("another thread"));
        assert_eq!(stack.depth_on(B), 0);
        assert_eq!(stack.bound_thread(ContextId(7)), Some(A));

        stack.pop_on(A).unwrap();
        assert!(stack.is_floating(ContextId(7)));
        stack.push_on(B, ContextId(7)).unwrap();
        assert_eq!(stack.current_on(B), Some(ContextId(7)));
    }

    #[test]
    fn test_threads_are_independent() {
        let stack = ContextStack::new();
        stack.push_on(A, ContextId(1)).unwrap();
        stack.push_on(B, ContextId(2)).unwrap();
        assert_eq!(stack.current_on(A), Some(ContextId(1)));
        assert_eq!(stack.current_on(B), Some(ContextId(2)));
        stack.pop_on(B).unwrap();
        assert_eq!(stack.current_on(A), Some(ContextId(1)));
    }

    #[test]
    fn test_os_threads_get_their_own_stack() {
        let stack = std::sync::Arc::new(ContextStack::new());
        stack.push(ContextId(1)).unwrap();
        let other = stack.clone();
        std::thread::spawn(move || {
            assert_eq!(other.current(), None);
            other.push(ContextId(2)).unwrap();
            assert_eq!(other.depth(), 1);
            other.pop().unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(stack.current(), Some(ContextId(1)));
    }
}
