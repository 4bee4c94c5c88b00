// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A conventional NVM namespace backed by RAM.

use super::check_lba_range;
use super::check_transfer_size;
use super::lba_range;
use super::BlockStore;
use super::CommandContext;
use super::CommandProcessor;
use super::Execution;
use super::InternalOperation;
use super::NamespaceSummary;
use crate::buffer::WriteBuffer;
use crate::error::NvmeError;
use crate::prp::PrpRange;
use crate::spec;
use crate::spec::nvm;
use crate::timing::IoProfile;
use std::sync::Arc;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// A conventional NVM namespace.
///
/// With a write buffer attached, every write holds buffer space until the
/// modeled media program time after its completion. Writes that find the
/// buffer full wait for one program time.
#[derive(Debug)]
pub struct RamNamespace {
    size_lbas: u64,
    store: BlockStore,
    write_buffer: Option<(Arc<WriteBuffer>, u64)>,
}

impl RamNamespace {
    pub fn new(size_lbas: u64, block_shift: u32) -> Self {
        Self {
            size_lbas,
            store: BlockStore::new(size_lbas, block_shift),
            write_buffer: None,
        }
    }

    pub fn with_write_buffer(mut self, capacity: u64, program_ns: u64) -> Self {
        self.write_buffer = Some((WriteBuffer::new(capacity), program_ns));
        self
    }

    pub fn write_buffer(&self) -> Option<&Arc<WriteBuffer>> {
        self.write_buffer.as_ref().map(|(buffer, _)| buffer)
    }

    fn block_shift(&self) -> u32 {
        self.store.block_shift
    }
}

impl CommandProcessor for RamNamespace {
    fn summary(&self) -> NamespaceSummary {
        NamespaceSummary {
            csi: spec::Csi::NVM,
            size_lbas: self.size_lbas,
            block_shift: self.block_shift(),
            partitions: 1,
        }
    }

    fn validate(&self, ctx: &CommandContext<'_>, command: &spec::Command) -> Result<(), NvmeError> {
        match nvm::NvmOpcode(command.cdw0.opcode()) {
            nvm::NvmOpcode::READ | nvm::NvmOpcode::WRITE => {
                let (lba, count) = lba_range(command);
                check_transfer_size(ctx, (count as usize) << self.block_shift())?;
                check_lba_range(lba, count, self.size_lbas)
            }
            nvm::NvmOpcode::WRITE_ZEROES => {
                let (lba, count) = lba_range(command);
                check_lba_range(lba, count, self.size_lbas)
            }
            nvm::NvmOpcode::FLUSH | nvm::NvmOpcode::DSM => Ok(()),
            opcode => {
                tracing::warn!(?opcode, "unsupported nvm opcode");
                Err(spec::Status::INVALID_COMMAND_OPCODE.into())
            }
        }
    }

    fn execute(
        &self,
        ctx: &CommandContext<'_>,
        command: &spec::Command,
    ) -> Result<Execution, NvmeError> {
        let opcode = nvm::NvmOpcode(command.cdw0.opcode());
        let execution = match opcode {
            nvm::NvmOpcode::READ => {
                let (lba, count) = lba_range(command);
                let byte_count = (count as usize) << self.block_shift();
                let prp = PrpRange::parse(ctx.mem, byte_count, command.dptr)?;
                tracing::trace!(lba, count, byte_count, "read");
                Execution::new(IoProfile::read(byte_count as u64))
                    .with_transfer(self.store.read_transfer(prp, lba, count))
            }
            nvm::NvmOpcode::WRITE => {
                let (lba, count) = lba_range(command);
                let byte_count = (count as usize) << self.block_shift();
                let prp = PrpRange::parse(ctx.mem, byte_count, command.dptr)?;
                tracing::trace!(lba, count, byte_count, "write");
                let mut execution = Execution::new(IoProfile::write(byte_count as u64))
                    .with_transfer(self.store.write_transfer(prp, lba, count));
                if let Some((buffer, program_ns)) = &self.write_buffer {
                    match buffer.allocate(byte_count as u64) {
                        Some(lease) => {
                            execution.internal = Some(InternalOperation {
                                delay_ns: *program_ns,
                                buffer: Box::new(lease),
                            });
                        }
                        None => execution.hint_ns = *program_ns,
                    }
                }
                execution
            }
            nvm::NvmOpcode::WRITE_ZEROES => {
                let (lba, count) = lba_range(command);
                tracing::trace!(lba, count, "write zeroes");
                self.store.zero(lba, count);
                Execution::new(IoProfile::other())
            }
            nvm::NvmOpcode::FLUSH => {
                tracing::debug!("flush");
                Execution::new(IoProfile::other())
            }
            nvm::NvmOpcode::DSM => {
                let cdw10 = nvm::Cdw10Dsm::from(command.cdw10);
                let cdw11 = nvm::Cdw11Dsm::from(command.cdw11);
                let mut ranges = vec![nvm::DsmRange::new_zeroed(); cdw10.nr_z() as usize + 1];
                let prp = PrpRange::parse(ctx.mem, ranges.as_bytes().len(), command.dptr)?;
                prp.read(ctx.mem, ranges.as_mut_bytes())?;
                tracing::debug!(?cdw11, count = ranges.len(), "dsm");
                if cdw11.ad() {
                    for range in &ranges {
                        let count = range.lba_count as u64;
                        check_lba_range(range.starting_lba, count, self.size_lbas)?;
                        self.store.zero(range.starting_lba, count);
                    }
                }
                Execution::new(IoProfile::other())
            }
            _ => return Err(spec::Status::INVALID_COMMAND_OPCODE.into()),
        };
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostMemory;
    use crate::namespace::tests::rw_command;
    use crate::PAGE_SIZE64;

    fn ctx(mem: &HostMemory) -> CommandContext<'_> {
        CommandContext {
            mem,
            max_transfer_size: 128 * 1024,
        }
    }

    #[test]
    fn write_then_read() {
        let mem = HostMemory::allocate(0x10000);
        let ns = RamNamespace::new(16, 9);
        let ctx = ctx(&mem);

        mem.write_at(PAGE_SIZE64, &[0x5a; 1024]).unwrap();
        let write = rw_command(nvm::NvmOpcode::WRITE, 2, 2, [PAGE_SIZE64, 0]);
        ns.validate(&ctx, &write).unwrap();
        let execution = ns.execute(&ctx, &write).unwrap();
        assert_eq!(execution.io, IoProfile::write(1024));
        (execution.transfer.unwrap())(&mem).unwrap();

        let read = rw_command(nvm::NvmOpcode::READ, 1, 4, [2 * PAGE_SIZE64, 0]);
        let execution = ns.execute(&ctx, &read).unwrap();
        (execution.transfer.unwrap())(&mem).unwrap();
        let mut back = [0; 2048];
        mem.read_at(2 * PAGE_SIZE64, &mut back).unwrap();
        assert!(back[..512].iter().all(|&b| b == 0));
        assert!(back[512..1536].iter().all(|&b| b == 0x5a));
        assert!(back[1536..].iter().all(|&b| b == 0));
    }

    #[test]
    fn field_checks() {
        let mem = HostMemory::allocate(0x1000);
        let ns = RamNamespace::new(16, 9);
        let ctx = ctx(&mem);
        let err = ns
            .validate(&ctx, &rw_command(nvm::NvmOpcode::READ, 15, 2, [0; 2]))
            .unwrap_err();
        assert_eq!(err.status(), spec::Status::LBA_OUT_OF_RANGE);

        let small = CommandContext {
            mem: &mem,
            max_transfer_size: 512,
        };
        let err = ns
            .validate(&small, &rw_command(nvm::NvmOpcode::WRITE, 0, 2, [0; 2]))
            .unwrap_err();
        assert_eq!(err.status(), spec::Status::INVALID_FIELD_IN_COMMAND);

        let err = ns
            .validate(&ctx, &rw_command(nvm::NvmOpcode::COMPARE, 0, 1, [0; 2]))
            .unwrap_err();
        assert_eq!(err.status(), spec::Status::INVALID_COMMAND_OPCODE);
    }

    #[test]
    fn write_buffer_fills() {
        let mem = HostMemory::allocate(0x10000);
        let ns = RamNamespace::new(64, 12).with_write_buffer(8192, 50_000);
        let ctx = ctx(&mem);
        let write = rw_command(nvm::NvmOpcode::WRITE, 0, 1, [0, 0]);
        let first = ns.execute(&ctx, &write).unwrap();
        let second = ns.execute(&ctx, &write).unwrap();
        assert!(first.internal.is_some() && second.internal.is_some());
        let third = ns.execute(&ctx, &write).unwrap();
        assert!(third.internal.is_none());
        assert_eq!(third.hint_ns, 50_000);
        assert_eq!(ns.write_buffer().unwrap().used(), 8192);

        first.internal.unwrap().buffer.release();
        assert_eq!(ns.write_buffer().unwrap().used(), 4096);
    }

    #[test]
    fn deallocate_zeroes_ranges() {
        let mem = HostMemory::allocate(0x10000);
        let ns = RamNamespace::new(16, 9);
        let ctx = ctx(&mem);
        mem.write_at(PAGE_SIZE64, &[0xff; 8192]).unwrap();
        let write = rw_command(nvm::NvmOpcode::WRITE, 0, 16, [PAGE_SIZE64, 2 * PAGE_SIZE64]);
        (ns.execute(&ctx, &write).unwrap().transfer.unwrap())(&mem).unwrap();

        let range = nvm::DsmRange {
            context_attributes: 0,
            lba_count: 2,
            starting_lba: 4,
        };
        mem.write_plain(4 * PAGE_SIZE64, &range).unwrap();
        let mut dsm = spec::Command::new_zeroed();
        dsm.cdw0 = spec::Cdw0::new().with_opcode(nvm::NvmOpcode::DSM.0);
        dsm.cdw11 = nvm::Cdw11Dsm::new().with_ad(true).into();
        dsm.dptr = [4 * PAGE_SIZE64, 0];
        ns.execute(&ctx, &dsm).unwrap();

        let read = rw_command(nvm::NvmOpcode::READ, 0, 16, [5 * PAGE_SIZE64, 6 * PAGE_SIZE64]);
        (ns.execute(&ctx, &read).unwrap().transfer.unwrap())(&mem).unwrap();
        let mut back = vec![0; 8192];
        mem.read_at(5 * PAGE_SIZE64, &mut back).unwrap();
        assert!(back[..2048].iter().all(|&b| b == 0xff));
        assert!(back[2048..3072].iter().all(|&b| b == 0));
        assert!(back[3072..].iter().all(|&b| b == 0xff));
    }
}
