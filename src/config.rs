//! Runtime configuration.
//!
//! Everything has a default, so an empty JSON object is a valid
//! configuration:
//!
//! ```json
//! {
//!     "cpu": { "threads": 4, "thread_name": "sim-worker" },
//!     "heap": { "device": { "page_size": 4194304, "max_size": 536870912 } }
//! }
//! ```

use std::num::NonZero;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::memory::{GRANULARITY, MemoryType};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cpu: CpuConfig,
    pub heap: HeapConfig,
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cpu.validate()?;
        for memory_type in MemoryType::ALL {
            self.heap.get(memory_type).validate(memory_type)?;
        }
        Ok(())
    }
}

/// Worker threads of the CPU dispatchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// `None` uses one thread per available core.
    pub threads: Option<usize>,
    /// Workers are named `{thread_name}-{index}`.
    pub thread_name: String,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            threads: None,
            thread_name: String::from("frametask-worker"),
        }
    }
}

impl CpuConfig {
    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZero::get)
                .unwrap_or(1)
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == Some(0) {
            return Err(ConfigError::Invalid("cpu.threads", "must be at least 1".into()));
        }

        if self.thread_name.is_empty() {
            return Err(ConfigError::Invalid("cpu.thread_name", "must not be empty".into()));
        }

        Ok(())
    }
}

/// Sizes of one memory type's heap, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapTypeConfig {
    /// Reserved up front when the heap is created.
    pub base_size: u64,
    /// Unit of growth, a power of two.
    pub page_size: u64,
    pub max_size: u64,
}

impl HeapTypeConfig {
    const fn new(page_size: u64, max_size: u64) -> Self {
        Self {
            base_size: 0,
            page_size,
            max_size,
        }
    }

    fn validate(&self, memory_type: MemoryType) -> Result<(), ConfigError> {
        let field = match memory_type {
            MemoryType::DeviceMemory => "heap.device",
            MemoryType::PinnedHost => "heap.pinned_host",
            MemoryType::WriteCombined => "heap.write_combined",
            MemoryType::Host => "heap.host",
        };

        if !self.page_size.is_power_of_two() || self.page_size < GRANULARITY {
            return Err(ConfigError::Invalid(
                field,
                format!(
                    "page size {} is not a power of two of at least {GRANULARITY} bytes",
                    self.page_size
                ),
            ));
        }

        if self.base_size > self.max_size {
            return Err(ConfigError::Invalid(
                field,
                format!(
                    "base size {} exceeds maximum size {}",
                    self.base_size, self.max_size
                ),
            ));
        }

        Ok(())
    }
}

impl Default for HeapTypeConfig {
    fn default() -> Self {
        Self::new(1 << 20, 256 << 20)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    pub device: HeapTypeConfig,
    pub pinned_host: HeapTypeConfig,
    pub write_combined: HeapTypeConfig,
    pub host: HeapTypeConfig,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            device: HeapTypeConfig::new(2 << 20, 1 << 30),
            pinned_host: HeapTypeConfig::default(),
            write_combined: HeapTypeConfig::default(),
            host: HeapTypeConfig::default(),
        }
    }
}

impl HeapConfig {
    pub fn get(&self, memory_type: MemoryType) -> &HeapTypeConfig {
        match memory_type {
            MemoryType::DeviceMemory => &self.device,
            MemoryType::PinnedHost => &self.pinned_host,
            MemoryType::WriteCombined => &self.write_combined,
            MemoryType::Host => &self.host,
        }
    }

    pub fn get_mut(&mut self, memory_type: MemoryType) -> &mut HeapTypeConfig {
        match memory_type {
            MemoryType::DeviceMemory => &mut self.device,
            MemoryType::PinnedHost => &mut self.pinned_host,
            MemoryType::WriteCombined => &mut self.write_combined,
            MemoryType::Host => &mut self.host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.heap.device.page_size, 2 << 20);
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_json(
            r#"{ "cpu": { "threads": 3 }, "heap": { "host": { "page_size": 4096 } } }"#,
        )
        .unwrap();

        assert_eq!(config.cpu.worker_threads(), 3);
        assert_eq!(config.cpu.thread_name, "frametask-worker");
        assert_eq!(config.heap.host.page_size, 4096);
        assert_eq!(config.heap.host.max_size, 256 << 20);
    }

    #[test]
    fn test_rejects_zero_threads() {
        let err = Config::from_json(r#"{ "cpu": { "threads": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("cpu.threads", _)));
    }

    #[test]
    fn test_rejects_odd_page_size() {
        let err = Config::from_json(r#"{ "heap": { "pinned_host": { "page_size": 3000 } } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("heap.pinned_host", _)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            Config::from_json("{ cpu: }"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file("/nonexistent/frametask.json"),
            Err(ConfigError::FileSystem(_))
        ));
    }
}
