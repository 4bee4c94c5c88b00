// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The latency model that assigns completion times.

use crate::config::OpLatency;
use crate::config::TimingConfig;

/// The latency class of a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    /// Commands that move no media data.
    Other,
}

/// The shape of a command, as far as the latency model cares.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IoProfile {
    pub kind: IoKind,
    pub len: u64,
}

impl IoProfile {
    pub fn read(len: u64) -> Self {
        Self {
            kind: IoKind::Read,
            len,
        }
    }

    pub fn write(len: u64) -> Self {
        Self {
            kind: IoKind::Write,
            len,
        }
    }

    pub fn other() -> Self {
        Self {
            kind: IoKind::Other,
            len: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimingModel {
    io_unit_shift: u32,
    read: OpLatency,
    write: OpLatency,
    other_latency: u64,
}

impl TimingModel {
    pub fn new(config: &TimingConfig) -> Self {
        Self {
            io_unit_shift: config.io_unit_shift,
            read: config.read,
            write: config.write,
            other_latency: config.other_latency,
        }
    }

    /// The time the device spends on a command once it starts.
    pub fn service_time(&self, profile: IoProfile) -> u64 {
        let latency = match profile.kind {
            IoKind::Read => &self.read,
            IoKind::Write => &self.write,
            IoKind::Other => return self.other_latency,
        };
        let units = profile.len.div_ceil(1 << self.io_unit_shift);
        latency
            .delay
            .saturating_add(latency.time.saturating_mul(units))
            .saturating_add(latency.trailing)
    }

    /// Computes a command's completion time.
    ///
    /// The command cannot start before the owning worker finishes the work it
    /// already has (`latest`), so a busy worker serializes its commands.
    /// `hint_ns` is extra latency reported by the namespace.
    pub fn target(&self, start: u64, latest: u64, profile: IoProfile, hint_ns: u64) -> u64 {
        start
            .max(latest)
            .saturating_add(self.service_time(profile))
            .saturating_add(hint_ns)
    }
}
