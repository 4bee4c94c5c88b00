// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An NVMe controller emulator that completes commands after a simulated
//! device latency instead of performing real media I/O.
//!
//! The host side (or a test) writes commands into [`HostMemory`], rings
//! doorbells through [`queue::Doorbells`], and reaps completions by phase bit.
//! The controller fetches commands, hands them to per-namespace
//! [`CommandProcessor`]s, and completes each one when its modeled completion
//! time arrives.

#![forbid(unsafe_code)]

mod buffer;
pub mod clock;
pub mod config;
mod controller;
pub mod driver;
mod error;
pub mod memory;
pub mod namespace;
mod pool;
mod prp;
pub mod queue;
mod timing;
mod workers;

#[cfg(test)]
mod tests;

pub use buffer::ReleasableBuffer;
pub use buffer::WriteBuffer;
pub use buffer::WriteBufferLease;
pub use controller::BuildError;
pub use controller::ControllerStats;
pub use controller::NvmeController;
pub use controller::NvmeControllerBuilder;
pub use controller::RunningController;
pub use error::CommandResult;
pub use error::NvmeError;
pub use memory::HostMemory;
pub use namespace::CommandProcessor;
pub use prp::PrpRange;
pub use queue::InterruptTarget;
pub use timing::IoKind;
pub use workers::NsidConflict;

pub use nvme_spec as spec;

// Controller identity.
const VENDOR_ID: u16 = 0x0c51;
const SUBSYSTEM_ID: u16 = 0x370d;
const NVME_VERSION: u32 = 0x00010400;
const IOSQES: u8 = 6;
const IOCQES: u8 = 4;
const MAX_ADMIN_QUEUE_DEPTH: u32 = 4096;

// NVMe page sizes.
const PAGE_SIZE: usize = 4096;
const PAGE_SIZE64: u64 = 4096;
const PAGE_MASK: u64 = !(PAGE_SIZE64 - 1);
const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();
