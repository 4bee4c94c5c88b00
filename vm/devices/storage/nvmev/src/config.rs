// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Controller configuration, loadable from TOML.
//!
//! ```toml
//! [controller]
//! nr_io_workers = 4
//! placement = { policy = "grouped", sqs_per_worker = 2 }
//!
//! [timing]
//! read = { delay = 10000, time = 4000, trailing = 1000 }
//! ```

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Maximum number of I/O queue pairs.
pub const MAX_IO_QUEUES: u16 = 72;
/// Request slots per worker.
pub const MAX_PARALLEL_IO: usize = 16384;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NvmevConfig {
    pub controller: ControllerConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Number of I/O worker threads, each modeling one unit of device
    /// parallelism.
    pub nr_io_workers: usize,
    /// Request slots in each worker's pool.
    pub worker_capacity: usize,
    pub max_io_queues: u16,
    pub max_queue_depth: u32,
    /// Maximum data transfer size, as a power of two in 4KiB pages.
    pub mdts: u8,
    pub placement: Placement,
    /// Copy data for queued requests before their completion time arrives.
    pub eager_copy: bool,
    /// Idle time after which polling threads start sleeping between polls.
    pub idle_timeout_ms: u64,
    pub idle_sleep_us: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            nr_io_workers: 1,
            worker_capacity: MAX_PARALLEL_IO,
            max_io_queues: MAX_IO_QUEUES,
            max_queue_depth: 1024,
            mdts: 5,
            placement: Placement::PerSq,
            eager_copy: true,
            idle_timeout_ms: 60_000,
            idle_sleep_us: 100,
        }
    }
}

/// How submission queues are mapped onto I/O workers.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum Placement {
    /// Submission queue `n` goes to worker `(n - 1) % nr_io_workers`.
    #[default]
    PerSq,
    /// Consecutive runs of `sqs_per_worker` submission queues share a worker.
    Grouped { sqs_per_worker: u16 },
    /// Each command goes to the next worker in turn.
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// Transfer times are charged per `1 << io_unit_shift` bytes.
    pub io_unit_shift: u32,
    pub read: OpLatency,
    pub write: OpLatency,
    /// Latency of flush and other commands that move no data.
    pub other_latency: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            io_unit_shift: 12,
            read: OpLatency {
                delay: 10_000,
                time: 4_000,
                trailing: 1_000,
            },
            write: OpLatency {
                delay: 12_000,
                time: 8_000,
                trailing: 1_000,
            },
            other_latency: 1_000,
        }
    }
}

/// Latency parameters for one command class, in nanoseconds.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpLatency {
    /// Fixed cost before the transfer starts.
    pub delay: u64,
    /// Cost per I/O unit transferred.
    pub time: u64,
    /// Fixed cost after the transfer ends.
    pub trailing: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration")]
    Parse(#[from] toml::de::Error),
    #[error("at least one io worker is required")]
    NoWorkers,
    #[error("worker capacity must be non-zero")]
    NoCapacity,
    #[error("at least one io queue is required")]
    NoQueues,
    #[error("maximum queue depth {0} is outside 2..=65536")]
    QueueDepth(u32),
    #[error("io unit shift {0} is outside 9..=20")]
    IoUnitShift(u32),
    #[error("mdts {0} is too large")]
    Mdts(u8),
    #[error("grouped placement needs at least one queue per worker")]
    EmptyGroup,
}

impl NvmevConfig {
    /// Parses and validates a TOML configuration. Missing fields take their
    /// defaults.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.controller;
        if c.nr_io_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if c.worker_capacity == 0 {
            return Err(ConfigError::NoCapacity);
        }
        if c.max_io_queues == 0 {
            return Err(ConfigError::NoQueues);
        }
        if !(2..=65536).contains(&c.max_queue_depth) {
            return Err(ConfigError::QueueDepth(c.max_queue_depth));
        }
        // Keep the transfer limit within what a 32-bit length can describe.
        if c.mdts > 19 {
            return Err(ConfigError::Mdts(c.mdts));
        }
        if let Placement::Grouped { sqs_per_worker: 0 } = c.placement {
            return Err(ConfigError::EmptyGroup);
        }
        if !(9..=20).contains(&self.timing.io_unit_shift) {
            return Err(ConfigError::IoUnitShift(self.timing.io_unit_shift));
        }
        Ok(())
    }

    /// The maximum data transfer size in bytes.
    pub fn max_transfer_size(&self) -> usize {
        crate::PAGE_SIZE << self.controller.mdts
    }
}
