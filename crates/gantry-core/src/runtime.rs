//! Driver initialization and device enumeration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gantry_driver::{CudaDriver, DeviceProperties, Driver};

use crate::config::{DeviceSelection, RuntimeConfig, SchedulingPolicy};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::stack::{ContextId, ContextStack};

struct Shared {
    driver: Arc<dyn Driver>,
    stack: Arc<ContextStack>,
    device_count: u32,
    next_context_id: AtomicU64,
}

/// An initialized driver plus the context stack every context of this
/// runtime uses. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Initialize `driver` and enumerate its devices.
    ///
    /// Fails with `NoDeviceFound` when the driver reports zero devices.
    pub fn initialize(driver: Arc<dyn Driver>) -> Result<Self> {
        Self::with_stack(driver, Arc::new(ContextStack::new()))
    }

    /// Like [`Runtime::initialize`], with an injected context stack.
    pub fn with_stack(driver: Arc<dyn Driver>, stack: Arc<ContextStack>) -> Result<Self> {
        driver.init()?;
        let device_count = driver.device_count()?;
        if device_count == 0 {
            return Err(Error::NoDeviceFound);
        }
        tracing::info!(driver = driver.name(), devices = device_count, "runtime initialized");
        Ok(Self {
            shared: Arc::new(Shared {
                driver,
                stack,
                device_count,
                next_context_id: AtomicU64::new(1),
            }),
        })
    }

    /// Load the native driver named by `config` and initialize it.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let driver = match &config.driver_library {
            Some(path) => CudaDriver::load_from(path),
            None => CudaDriver::load(),
        }
        .map_err(|e| Error::DriverUnavailable(e.to_string()))?;
        Self::initialize(Arc::new(driver))
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.shared.driver
    }

    pub fn stack(&self) -> &Arc<ContextStack> {
        &self.shared.stack
    }

    pub(crate) fn next_context_id(&self) -> ContextId {
        ContextId(self.shared.next_context_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of devices, fixed at initialization.
    pub fn device_count(&self) -> u32 {
        self.shared.device_count
    }

    pub fn device(&self, ordinal: u32) -> Result<Device> {
        if ordinal >= self.shared.device_count {
            return Err(Error::InputConstraint(format!(
                "device ordinal {ordinal} out of range (found {} devices)",
                self.shared.device_count
            )));
        }
        Ok(Device::new(ordinal, self.clone()))
    }

    pub fn devices(&self) -> Vec<Device> {
        (0..self.shared.device_count)
            .map(|ordinal| Device::new(ordinal, self.clone()))
            .collect()
    }

    /// The device with the highest clock rate times multiprocessor count.
    /// Ties go to the lower ordinal.
    pub fn max_gflops_device(&self) -> Result<Device> {
        let mut best: Option<(u64, Device)> = None;
        for device in self.devices() {
            let score = device.properties()?.gflops_score();
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, device));
            }
        }
        best.map(|(_, d)| d).ok_or(Error::NoDeviceFound)
    }

    pub fn select_device(&self, selection: &DeviceSelection) -> Result<Device> {
        match selection {
            DeviceSelection::MaxGflops => self.max_gflops_device(),
            DeviceSelection::Ordinal(ordinal) => self.device(*ordinal),
        }
    }

    /// The device of the calling thread's current context.
    pub fn current_device(&self) -> Result<Device> {
        if self.shared.stack.current().is_none() {
            return Err(Error::NoCurrentContext);
        }
        let ordinal = self.shared.driver.context_device()?;
        Ok(Device::new(ordinal, self.clone()))
    }

    /// Pop the calling thread's current context, leaving it floating.
    pub fn pop_current(&self) -> Result<ContextId> {
        if self.shared.stack.current().is_none() {
            return Err(Error::InvalidState("context stack is empty".into()));
        }
        self.shared.driver.context_pop()?;
        self.shared.stack.pop()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("driver", &self.shared.driver.name())
            .field("devices", &self.shared.device_count)
            .finish()
    }
}

/// One physical device, by ordinal.
#[derive(Clone)]
pub struct Device {
    ordinal: u32,
    runtime: Runtime,
}

impl Device {
    pub(crate) fn new(ordinal: u32, runtime: Runtime) -> Self {
        Self { ordinal, runtime }
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn properties(&self) -> Result<DeviceProperties> {
        Ok(self.runtime.driver().device_properties(self.ordinal)?)
    }

    /// Create a floating context on this device.
    pub fn create_context(&self, policy: SchedulingPolicy) -> Result<Context> {
        Context::create(self, policy)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.ordinal == other.ordinal && Arc::ptr_eq(&self.runtime.shared, &other.runtime.shared)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device").field(&self.ordinal).finish()
    }
}
