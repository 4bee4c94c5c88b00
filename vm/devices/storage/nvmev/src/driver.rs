// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A minimal host-side NVMe driver: enough to place commands in a submission
//! queue, ring doorbells, and reap completions by phase.

use crate::memory::HostMemory;
use crate::memory::MemoryError;
use crate::queue::Doorbells;
use crate::spec;
use crate::spec::nvm;
use crate::PAGE_SIZE;
use crate::PAGE_SIZE64;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

const SQ_ENTRY_SIZE: u64 = size_of::<spec::Command>() as u64;
const CQ_ENTRY_SIZE: u64 = size_of::<spec::Completion>() as u64;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("submission queue {0} is full")]
    SubmissionQueueFull(u16),
    #[error("host memory access failed")]
    Memory(#[from] MemoryError),
}

/// The host's half of a submission/completion queue pair.
#[derive(Debug)]
pub struct HostQueuePair {
    mem: HostMemory,
    doorbells: Arc<Doorbells>,
    qid: u16,
    sq_base: u64,
    sq_depth: u32,
    sq_tail: u32,
    /// The controller's head, as last reported in a completion.
    sq_head: u32,
    cq_base: u64,
    cq_depth: u32,
    cq_head: u32,
    phase: bool,
    next_cid: u16,
}

impl HostQueuePair {
    /// Describes a queue pair whose rings live at `sq_base` and `cq_base`.
    /// The controller-side queues must be created separately.
    pub fn new(
        mem: HostMemory,
        doorbells: Arc<Doorbells>,
        qid: u16,
        sq_base: u64,
        sq_depth: u32,
        cq_base: u64,
        cq_depth: u32,
    ) -> Self {
        Self {
            mem,
            doorbells,
            qid,
            sq_base,
            sq_depth,
            sq_tail: 0,
            sq_head: 0,
            cq_base,
            cq_depth,
            cq_head: 0,
            phase: true,
            next_cid: 0,
        }
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn sq_base(&self) -> u64 {
        self.sq_base
    }

    pub fn cq_base(&self) -> u64 {
        self.cq_base
    }

    pub fn sq_depth(&self) -> u32 {
        self.sq_depth
    }

    pub fn cq_depth(&self) -> u32 {
        self.cq_depth
    }

    /// Writes `command` into the next submission queue entry with a fresh
    /// command id, without ringing the doorbell. Returns the command id.
    pub fn push(&mut self, mut command: spec::Command) -> Result<u16, DriverError> {
        let next_tail = (self.sq_tail + 1) % self.sq_depth;
        if next_tail == self.sq_head {
            return Err(DriverError::SubmissionQueueFull(self.qid));
        }
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        command.cdw0.set_cid(cid);
        self.mem.write_plain(
            self.sq_base + self.sq_tail as u64 * SQ_ENTRY_SIZE,
            &command,
        )?;
        self.sq_tail = next_tail;
        Ok(cid)
    }

    /// Publishes pushed commands to the controller.
    pub fn ring(&self) {
        self.doorbells.ring_sq_tail(self.qid, self.sq_tail);
    }

    /// Pushes one command and rings the doorbell.
    pub fn submit(&mut self, command: spec::Command) -> Result<u16, DriverError> {
        let cid = self.push(command)?;
        self.ring();
        Ok(cid)
    }

    /// Takes the next completion if the controller has posted one, and
    /// returns its entry to the controller.
    pub fn poll_completion(&mut self) -> Result<Option<spec::Completion>, DriverError> {
        let completion: spec::Completion = self
            .mem
            .read_plain(self.cq_base + self.cq_head as u64 * CQ_ENTRY_SIZE)?;
        if completion.status.phase() != self.phase {
            return Ok(None);
        }
        self.cq_head += 1;
        if self.cq_head == self.cq_depth {
            self.cq_head = 0;
            self.phase = !self.phase;
        }
        self.sq_head = completion.sqhd as u32;
        self.doorbells.ring_cq_head(self.qid, self.cq_head);
        Ok(Some(completion))
    }
}

/// The status of a completion, without the phase bit.
pub fn completion_status(completion: &spec::Completion) -> spec::Status {
    spec::Status(completion.status.status())
}

/// Builds the two PRP entries for `len` bytes of host memory starting at
/// `addr`. Transfers spanning more than two pages get a PRP list written at
/// `list_addr`, which must have room for one entry per page.
pub fn build_prp(
    mem: &HostMemory,
    addr: u64,
    len: usize,
    list_addr: u64,
) -> Result<[u64; 2], MemoryError> {
    let first = PAGE_SIZE - (addr as usize & (PAGE_SIZE - 1));
    if len <= first {
        return Ok([addr, 0]);
    }
    let next_page = (addr & !(PAGE_SIZE64 - 1)) + PAGE_SIZE64;
    if len - first <= PAGE_SIZE {
        return Ok([addr, next_page]);
    }
    let pages = (len - first).div_ceil(PAGE_SIZE) as u64;
    let list = (0..pages)
        .map(|i| next_page + i * PAGE_SIZE64)
        .collect::<Vec<_>>();
    mem.write_at(list_addr, list.as_bytes())?;
    Ok([addr, list_addr])
}

fn admin_command(opcode: spec::AdminOpcode) -> spec::Command {
    let mut command = spec::Command::new_zeroed();
    command.cdw0 = spec::Cdw0::new().with_opcode(opcode.0);
    command
}

pub fn identify(cns: spec::Cns, nsid: u32, csi: spec::Csi, buf: u64) -> spec::Command {
    let mut command = admin_command(spec::AdminOpcode::IDENTIFY);
    command.nsid = nsid;
    command.cdw10 = spec::Cdw10Identify::new().with_cns(cns.0).into();
    command.cdw11 = spec::Cdw11Identify::new().with_csi(csi.0).into();
    command.dptr = [buf, 0];
    command
}

/// `iv` of `None` creates the queue with interrupts disabled.
pub fn create_io_completion_queue(
    qid: u16,
    base: u64,
    depth: u32,
    iv: Option<u16>,
) -> spec::Command {
    let mut command = admin_command(spec::AdminOpcode::CREATE_IO_COMPLETION_QUEUE);
    command.cdw10 = spec::Cdw10CreateIoQueue::new()
        .with_qid(qid)
        .with_qsize_z((depth - 1) as u16)
        .into();
    command.cdw11 = spec::Cdw11CreateIoCompletionQueue::new()
        .with_pc(true)
        .with_ien(iv.is_some())
        .with_iv(iv.unwrap_or(0))
        .into();
    command.dptr = [base, 0];
    command
}

pub fn create_io_submission_queue(qid: u16, cqid: u16, base: u64, depth: u32) -> spec::Command {
    let mut command = admin_command(spec::AdminOpcode::CREATE_IO_SUBMISSION_QUEUE);
    command.cdw10 = spec::Cdw10CreateIoQueue::new()
        .with_qid(qid)
        .with_qsize_z((depth - 1) as u16)
        .into();
    command.cdw11 = spec::Cdw11CreateIoSubmissionQueue::new()
        .with_pc(true)
        .with_cqid(cqid)
        .into();
    command.dptr = [base, 0];
    command
}

pub fn delete_io_submission_queue(qid: u16) -> spec::Command {
    let mut command = admin_command(spec::AdminOpcode::DELETE_IO_SUBMISSION_QUEUE);
    command.cdw10 = spec::Cdw10DeleteIoQueue::new().with_qid(qid).into();
    command
}

pub fn delete_io_completion_queue(qid: u16) -> spec::Command {
    let mut command = admin_command(spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE);
    command.cdw10 = spec::Cdw10DeleteIoQueue::new().with_qid(qid).into();
    command
}

pub fn set_features(feature: spec::Feature, cdw11: u32) -> spec::Command {
    let mut command = admin_command(spec::AdminOpcode::SET_FEATURES);
    command.cdw10 = spec::Cdw10SetFeatures::new().with_fid(feature.0).into();
    command.cdw11 = cdw11;
    command
}

pub fn get_features(feature: spec::Feature) -> spec::Command {
    let mut command = admin_command(spec::AdminOpcode::GET_FEATURES);
    command.cdw10 = spec::Cdw10GetFeatures::new().with_fid(feature.0).into();
    command
}

/// Requests `sqs` submission and `cqs` completion queues.
pub fn set_number_of_queues(sqs: u16, cqs: u16) -> spec::Command {
    set_features(
        spec::Feature::NUMBER_OF_QUEUES,
        spec::Cdw11FeatureNumberOfQueues::new()
            .with_nsq_z(sqs - 1)
            .with_ncq_z(cqs - 1)
            .into(),
    )
}

/// Reads `len` bytes (a multiple of four) of a log page into `prp`.
pub fn get_log_page(
    lid: spec::LogPageIdentifier,
    nsid: u32,
    len: usize,
    prp: [u64; 2],
) -> spec::Command {
    let numd_z = (len / 4 - 1) as u32;
    let mut command = admin_command(spec::AdminOpcode::GET_LOG_PAGE);
    command.nsid = nsid;
    command.cdw10 = spec::Cdw10GetLogPage::new()
        .with_lid(lid.0)
        .with_numdl_z(numd_z as u16)
        .into();
    command.cdw11 = spec::Cdw11GetLogPage::new()
        .with_numdu((numd_z >> 16) as u16)
        .into();
    command.dptr = prp;
    command
}

pub fn abort(sqid: u16, cid: u16) -> spec::Command {
    let mut command = admin_command(spec::AdminOpcode::ABORT);
    command.cdw10 = spec::Cdw10Abort::new().with_sqid(sqid).with_cid(cid).into();
    command
}

fn nvm_command(opcode: nvm::NvmOpcode, nsid: u32) -> spec::Command {
    let mut command = spec::Command::new_zeroed();
    command.cdw0 = spec::Cdw0::new().with_opcode(opcode.0);
    command.nsid = nsid;
    command
}

fn rw_command(
    opcode: nvm::NvmOpcode,
    nsid: u32,
    lba: u64,
    blocks: u32,
    prp: [u64; 2],
) -> spec::Command {
    let mut command = nvm_command(opcode, nsid);
    command.cdw10 = lba as u32;
    command.cdw11 = (lba >> 32) as u32;
    command.cdw12 = nvm::Cdw12ReadWrite::new()
        .with_nlb_z((blocks - 1) as u16)
        .into();
    command.dptr = prp;
    command
}

pub fn read(nsid: u32, lba: u64, blocks: u32, prp: [u64; 2]) -> spec::Command {
    rw_command(nvm::NvmOpcode::READ, nsid, lba, blocks, prp)
}

pub fn write(nsid: u32, lba: u64, blocks: u32, prp: [u64; 2]) -> spec::Command {
    rw_command(nvm::NvmOpcode::WRITE, nsid, lba, blocks, prp)
}

pub fn flush(nsid: u32) -> spec::Command {
    nvm_command(nvm::NvmOpcode::FLUSH, nsid)
}
