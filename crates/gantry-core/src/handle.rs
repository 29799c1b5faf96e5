//! Single-owner wrapper for a native handle.

use crate::error::{Error, Result};

/// A native handle that is live until taken, then freed for good.
#[derive(Debug)]
pub struct DeviceHandle<T: Copy> {
    raw: Option<T>,
    kind: &'static str,
}

impl<T: Copy> DeviceHandle<T> {
    pub fn new(raw: T, kind: &'static str) -> Self {
        Self {
            raw: Some(raw),
            kind,
        }
    }

    /// The raw handle, or `InvalidState` once freed.
    pub fn get(&self) -> Result<T> {
        self.raw.ok_or_else(|| Error::freed(self.kind))
    }

    pub fn is_freed(&self) -> bool {
        self.raw.is_none()
    }

    /// Hand the raw handle to `free` and mark it freed only once `free`
    /// succeeds. A no-op when already freed; on error the handle stays live.
    pub fn release(&mut self, free: impl FnOnce(T) -> Result<()>) -> Result<()> {
        let Some(raw) = self.raw else {
            return Ok(());
        };
        free(raw)?;
        self.raw = None;
        Ok(())
    }

    /// Resource kind used in error messages (`"stream"`, `"module"`, ...).
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut h = DeviceHandle::new(42u64, "event");
        assert_eq!(h.get().unwrap(), 42);
        assert!(!h.is_freed());

        let mut seen = Vec::new();
        h.release(|raw| {
            seen.push(raw);
            Ok(())
        })
        .unwrap();
        assert!(h.is_freed());
        h.release(|raw| {
            seen.push(raw);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![42]);

        let err = h.get().unwrap_err();
        assert_eq!(err.to_string(), "invalid state: event already freed");
    }

    #[test]
    fn test_failed_release_keeps_handle() {
        let mut h = DeviceHandle::new(7u64, "stream");
        let err = h
            .release(|_| Err(Error::InvalidState("busy".into())))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(!h.is_freed());
        assert_eq!(h.get().unwrap(), 7);

        h.release(|_| Ok(())).unwrap();
        assert!(h.is_freed());
    }
}
