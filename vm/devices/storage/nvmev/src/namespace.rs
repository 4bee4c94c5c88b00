// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The namespace command processor interface and the reference namespaces.
//!
//! The controller does not know how a namespace stores data. It asks the
//! namespace to validate and execute each I/O command, and gets back the
//! command's result, its shape for the latency model, and any data movement
//! to perform when the command completes.

mod kv;
mod ram;
mod zoned;

pub use kv::KvNamespace;
pub use ram::RamNamespace;
pub use zoned::ZonedNamespace;

use crate::buffer::ReleasableBuffer;
use crate::error::CommandResult;
use crate::error::NvmeError;
use crate::memory::HostMemory;
use crate::prp::PrpRange;
use crate::spec;
use crate::spec::nvm;
use crate::timing::IoProfile;
use parking_lot::RwLock;
use std::sync::Arc;
use zerocopy::FromZeros;

/// Data movement between host memory and a namespace's backing store, run
/// by the I/O worker no later than the command's completion.
pub type Transfer = Box<dyn FnOnce(&HostMemory) -> Result<(), NvmeError> + Send>;

/// What the controller needs to know about a namespace to identify it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NamespaceSummary {
    pub csi: spec::Csi,
    pub size_lbas: u64,
    pub block_shift: u32,
    pub partitions: u32,
}

/// Controller state available to a command processor.
#[derive(Debug)]
pub struct CommandContext<'a> {
    pub mem: &'a HostMemory,
    pub max_transfer_size: usize,
}

/// Background work a command leaves behind on its I/O worker.
pub struct InternalOperation {
    /// Delay past the command's own completion time.
    pub delay_ns: u64,
    /// Released when the operation completes.
    pub buffer: Box<dyn ReleasableBuffer>,
}

/// The outcome of executing an I/O command.
pub struct Execution {
    pub result: CommandResult,
    pub io: IoProfile,
    /// Extra latency on top of the modeled service time.
    pub hint_ns: u64,
    pub transfer: Option<Transfer>,
    pub internal: Option<InternalOperation>,
}

impl Execution {
    pub fn new(io: IoProfile) -> Self {
        Self {
            result: CommandResult::default(),
            io,
            hint_ns: 0,
            transfer: None,
            internal: None,
        }
    }

    pub fn with_transfer(mut self, transfer: Transfer) -> Self {
        self.transfer = Some(transfer);
        self
    }

    pub fn with_result(mut self, dw: [u32; 2]) -> Self {
        self.result.dw = dw;
        self
    }

    pub fn with_hint(mut self, hint_ns: u64) -> Self {
        self.hint_ns = hint_ns;
        self
    }
}

/// A namespace's I/O command set implementation.
pub trait CommandProcessor: Send + Sync {
    fn summary(&self) -> NamespaceSummary;

    /// Fills in the Identify Namespace data structure (CNS 0).
    fn identify_namespace(&self, id: &mut nvm::IdentifyNamespace) {
        let summary = self.summary();
        *id = nvm::IdentifyNamespace {
            nsze: summary.size_lbas,
            ncap: summary.size_lbas,
            nuse: summary.size_lbas,
            nlbaf: 0,
            flbas: nvm::Flbas::new().with_low_index(0),
            ..FromZeros::new_zeroed()
        };
        id.lbaf[0] = nvm::Lbaf::new().with_lbads(summary.block_shift as u8);
    }

    /// Fills in the I/O command set specific Identify Namespace data
    /// structure (CNS 5).
    fn identify_command_set(&self, csi: spec::Csi, _buf: &mut [u8]) -> Result<(), NvmeError> {
        if csi == self.summary().csi && csi == spec::Csi::NVM {
            // The NVM command set specific structure carries nothing the
            // controller reports.
            return Ok(());
        }
        Err(spec::Status::INVALID_FIELD_IN_COMMAND.into())
    }

    /// Checks a command's fields before any state changes.
    fn validate(&self, ctx: &CommandContext<'_>, command: &spec::Command) -> Result<(), NvmeError>;

    /// Performs a validated command's semantics.
    fn execute(
        &self,
        ctx: &CommandContext<'_>,
        command: &spec::Command,
    ) -> Result<Execution, NvmeError>;
}

/// An attached namespace.
#[derive(Clone)]
pub struct Namespace {
    pub nsid: u32,
    pub processor: Arc<dyn CommandProcessor>,
}

/// The starting LBA and block count of a read or write style command.
fn lba_range(command: &spec::Command) -> (u64, u64) {
    let cdw10 = nvm::Cdw10ReadWrite::from(command.cdw10);
    let cdw11 = nvm::Cdw11ReadWrite::from(command.cdw11);
    let cdw12 = nvm::Cdw12ReadWrite::from(command.cdw12);
    let lba = cdw10.sbla_low() as u64 | ((cdw11.sbla_high() as u64) << 32);
    (lba, cdw12.nlb_z() as u64 + 1)
}

fn check_lba_range(lba: u64, count: u64, size_lbas: u64) -> Result<(), NvmeError> {
    if size_lbas < lba || size_lbas - lba < count {
        return Err(spec::Status::LBA_OUT_OF_RANGE.into());
    }
    Ok(())
}

fn check_transfer_size(ctx: &CommandContext<'_>, byte_count: usize) -> Result<(), NvmeError> {
    if byte_count > ctx.max_transfer_size {
        return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
    }
    Ok(())
}

/// RAM backing for block namespaces.
#[derive(Clone)]
struct BlockStore {
    data: Arc<RwLock<Vec<u8>>>,
    block_shift: u32,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("len", &self.data.read().len())
            .field("block_shift", &self.block_shift)
            .finish()
    }
}

impl BlockStore {
    fn new(size_lbas: u64, block_shift: u32) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0; (size_lbas << block_shift) as usize])),
            block_shift,
        }
    }

    fn byte_range(&self, lba: u64, count: u64) -> std::ops::Range<usize> {
        let start = (lba << self.block_shift) as usize;
        start..start + (count << self.block_shift) as usize
    }

    /// Copies blocks to the host buffer when run.
    fn read_transfer(&self, prp: PrpRange, lba: u64, count: u64) -> Transfer {
        let data = self.data.clone();
        let range = self.byte_range(lba, count);
        Box::new(move |mem| prp.write(mem, &data.read()[range]))
    }

    /// Copies the host buffer into blocks when run.
    fn write_transfer(&self, prp: PrpRange, lba: u64, count: u64) -> Transfer {
        let data = self.data.clone();
        let range = self.byte_range(lba, count);
        Box::new(move |mem| {
            let mut buf = vec![0; range.len()];
            prp.read(mem, &mut buf)?;
            data.write()[range].copy_from_slice(&buf);
            Ok(())
        })
    }

    fn zero(&self, lba: u64, count: u64) {
        let range = self.byte_range(lba, count);
        self.data.write()[range].fill(0);
    }
}
