//! Runtime configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming the directory that holds `nvcc`.
pub const ENV_CUDA_BIN_PATH: &str = "CUDA_BIN_PATH";
/// Environment variable naming the driver library to load.
pub const ENV_DRIVER_LIBRARY: &str = "GANTRY_DRIVER_LIBRARY";

/// How a context's host thread waits on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingPolicy {
    /// Let the driver choose between spinning and yielding.
    #[default]
    Auto,
    /// Spin while waiting for results.
    Spin,
    /// Yield the thread while waiting for results.
    Yield,
}

impl SchedulingPolicy {
    /// The `CU_CTX_SCHED_*` creation flag.
    pub fn flags(self) -> u32 {
        match self {
            SchedulingPolicy::Auto => gantry_driver::CTX_SCHED_AUTO,
            SchedulingPolicy::Spin => gantry_driver::CTX_SCHED_SPIN,
            SchedulingPolicy::Yield => gantry_driver::CTX_SCHED_YIELD,
        }
    }
}

/// Which device a runtime picks by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelection {
    /// The device with the largest clock rate times multiprocessor count.
    #[default]
    MaxGflops,
    /// A fixed ordinal.
    Ordinal(u32),
}

/// Configuration for a Gantry runtime and its compiler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path of the driver library. `None` searches the platform defaults.
    pub driver_library: Option<PathBuf>,

    /// Scheduling policy for contexts created from this config.
    pub scheduling: SchedulingPolicy,

    /// Default device choice.
    pub device: DeviceSelection,

    /// The `nvcc` executable. `None` uses `nvcc` from `PATH`.
    pub nvcc: Option<PathBuf>,

    /// Target architecture passed as `-arch`, e.g. `sm_80`.
    pub arch: Option<String>,
}

impl RuntimeConfig {
    /// Parse a JSON config document. Missing fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a JSON config file. Parse errors name the file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Overlay values from the process environment.
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`; set variables win over file values.
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(ENV_CUDA_BIN_PATH).filter(|d| !d.is_empty()) {
            self.nvcc = Some(Path::new(&dir).join(nvcc_file_name()));
        }
        if let Some(lib) = lookup(ENV_DRIVER_LIBRARY).filter(|l| !l.is_empty()) {
            self.driver_library = Some(PathBuf::from(lib));
        }
        self
    }

    /// The compiler executable to run.
    pub fn nvcc_path(&self) -> PathBuf {
        self.nvcc
            .clone()
            .unwrap_or_else(|| PathBuf::from(nvcc_file_name()))
    }
}

fn nvcc_file_name() -> &'static str {
    if cfg!(windows) {
        "nvcc.exe"
    } else {
        "nvcc"
    }
}
