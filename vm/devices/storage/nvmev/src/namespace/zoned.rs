// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A zoned namespace backed by RAM. Every zone is sequential-write-required
//! and its capacity equals its size.

use super::check_lba_range;
use super::check_transfer_size;
use super::lba_range;
use super::BlockStore;
use super::CommandContext;
use super::CommandProcessor;
use super::Execution;
use super::NamespaceSummary;
use crate::error::NvmeError;
use crate::prp::PrpRange;
use crate::spec;
use crate::spec::nvm;
use crate::spec::zns;
use crate::timing::IoProfile;
use parking_lot::Mutex;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

#[derive(Debug, Copy, Clone)]
struct Zone {
    state: zns::ZoneState,
    wp: u64,
}

#[derive(Debug)]
pub struct ZonedNamespace {
    zone_size: u64,
    store: BlockStore,
    zones: Mutex<Vec<Zone>>,
    reset_latency_ns: u64,
}

impl ZonedNamespace {
    pub fn new(nr_zones: u32, zone_size_lbas: u64, block_shift: u32) -> Self {
        assert!(nr_zones > 0 && zone_size_lbas > 0);
        Self {
            zone_size: zone_size_lbas,
            store: BlockStore::new(nr_zones as u64 * zone_size_lbas, block_shift),
            zones: Mutex::new(
                (0..nr_zones as u64)
                    .map(|i| Zone {
                        state: zns::ZoneState::EMPTY,
                        wp: i * zone_size_lbas,
                    })
                    .collect(),
            ),
            reset_latency_ns: 0,
        }
    }

    /// Reports zone resets as taking an extra `ns` nanoseconds.
    pub fn with_reset_latency(mut self, ns: u64) -> Self {
        self.reset_latency_ns = ns;
        self
    }

    fn nr_zones(&self) -> u64 {
        self.zones.lock().len() as u64
    }

    fn size_lbas(&self) -> u64 {
        self.nr_zones() * self.zone_size
    }

    fn zone_start(&self, index: usize) -> u64 {
        index as u64 * self.zone_size
    }

    /// Checks that `lba` is a zone start within the namespace.
    fn check_zone_start(&self, lba: u64) -> Result<(), NvmeError> {
        check_lba_range(lba, 1, self.size_lbas())?;
        if lba % self.zone_size != 0 {
            return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
        }
        Ok(())
    }

    /// Claims `count` blocks at the write pointer of the zone containing
    /// `lba`, returning the first claimed block. Plain writes must start
    /// exactly at the write pointer.
    fn advance_write_pointer(&self, lba: u64, count: u64, append: bool) -> Result<u64, NvmeError> {
        let mut zones = self.zones.lock();
        let index = (lba / self.zone_size) as usize;
        let zone_end = self.zone_start(index) + self.zone_size;
        let zone = zones
            .get_mut(index)
            .ok_or(spec::Status::LBA_OUT_OF_RANGE)?;
        match zone.state {
            zns::ZoneState::FULL => return Err(spec::Status::ZONE_IS_FULL.into()),
            zns::ZoneState::READ_ONLY => return Err(spec::Status::ZONE_IS_READ_ONLY.into()),
            zns::ZoneState::OFFLINE => return Err(spec::Status::ZONE_IS_OFFLINE.into()),
            _ => {}
        }
        let start = if append { zone.wp } else { lba };
        if start != zone.wp {
            return Err(spec::Status::ZONE_INVALID_WRITE.into());
        }
        if zone_end - start < count {
            return Err(spec::Status::ZONE_BOUNDARY_ERROR.into());
        }
        zone.wp = start + count;
        zone.state = if zone.wp == zone_end {
            zns::ZoneState::FULL
        } else if matches!(zone.state, zns::ZoneState::EMPTY | zns::ZoneState::CLOSED) {
            zns::ZoneState::IMPLICITLY_OPENED
        } else {
            zone.state
        };
        Ok(start)
    }

    /// Applies a zone send action to one zone. Returns whether the zone was
    /// reset.
    fn apply_action(
        &self,
        index: usize,
        zone: &mut Zone,
        action: zns::ZoneSendAction,
    ) -> Result<bool, NvmeError> {
        use zns::ZoneState as S;

        let start = self.zone_start(index);
        let invalid = || -> Result<bool, NvmeError> {
            Err(spec::Status::ZONE_INVALID_STATE_TRANSITION.into())
        };
        match action {
            zns::ZoneSendAction::OPEN => match zone.state {
                S::EMPTY | S::IMPLICITLY_OPENED | S::EXPLICITLY_OPENED | S::CLOSED => {
                    zone.state = S::EXPLICITLY_OPENED;
                }
                _ => return invalid(),
            },
            zns::ZoneSendAction::CLOSE => match zone.state {
                S::IMPLICITLY_OPENED | S::EXPLICITLY_OPENED | S::CLOSED => {
                    zone.state = if zone.wp == start { S::EMPTY } else { S::CLOSED };
                }
                _ => return invalid(),
            },
            zns::ZoneSendAction::FINISH => match zone.state {
                S::EMPTY | S::IMPLICITLY_OPENED | S::EXPLICITLY_OPENED | S::CLOSED | S::FULL => {
                    zone.state = S::FULL;
                    zone.wp = start + self.zone_size;
                }
                _ => return invalid(),
            },
            zns::ZoneSendAction::RESET => match zone.state {
                S::READ_ONLY | S::OFFLINE => return invalid(),
                _ => {
                    zone.state = S::EMPTY;
                    zone.wp = start;
                    return Ok(true);
                }
            },
            zns::ZoneSendAction::OFFLINE => match zone.state {
                S::READ_ONLY | S::OFFLINE => zone.state = S::OFFLINE,
                _ => return invalid(),
            },
            _ => return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into()),
        }
        Ok(false)
    }

    fn zone_management_send(&self, command: &spec::Command) -> Result<Execution, NvmeError> {
        let (lba, _) = lba_range(command);
        let cdw13 = zns::Cdw13ZoneManagementSend::from(command.cdw13);
        let action = zns::ZoneSendAction(cdw13.zsa());
        tracing::debug!(lba, ?action, select_all = cdw13.select_all(), "zone management send");

        let mut reset = Vec::new();
        {
            let mut zones = self.zones.lock();
            if cdw13.select_all() {
                // Select-all applies to every zone the action is valid for.
                for (index, zone) in zones.iter_mut().enumerate() {
                    if let Ok(true) = self.apply_action(index, zone, action) {
                        reset.push(index);
                    }
                }
            } else {
                let index = (lba / self.zone_size) as usize;
                let zone = zones
                    .get_mut(index)
                    .ok_or(spec::Status::LBA_OUT_OF_RANGE)?;
                if self.apply_action(index, zone, action)? {
                    reset.push(index);
                }
            }
        }

        let mut execution = Execution::new(IoProfile::other());
        for &index in &reset {
            self.store.zero(self.zone_start(index), self.zone_size);
            execution.hint_ns += self.reset_latency_ns;
        }
        Ok(execution)
    }

    fn report_zones(
        &self,
        ctx: &CommandContext<'_>,
        command: &spec::Command,
    ) -> Result<Execution, NvmeError> {
        let (lba, _) = lba_range(command);
        let cdw13 = zns::Cdw13ZoneManagementReceive::from(command.cdw13);
        let len = (command.cdw12 as usize + 1) * 4;
        let prp = PrpRange::parse(ctx.mem, len, command.dptr)?;

        let filter = |state: zns::ZoneState| match cdw13.zrasf() {
            0 => true,
            1 => state == zns::ZoneState::EMPTY,
            2 => state == zns::ZoneState::IMPLICITLY_OPENED,
            3 => state == zns::ZoneState::EXPLICITLY_OPENED,
            4 => state == zns::ZoneState::CLOSED,
            5 => state == zns::ZoneState::FULL,
            6 => state == zns::ZoneState::READ_ONLY,
            7 => state == zns::ZoneState::OFFLINE,
            _ => false,
        };

        let header_len = size_of::<zns::ZoneReportHeader>();
        let desc_len = size_of::<zns::ZoneDescriptor>();
        let capacity = len.saturating_sub(header_len) / desc_len;
        let mut descriptors = Vec::new();
        let mut matching = 0;
        {
            let zones = self.zones.lock();
            let first = (lba / self.zone_size) as usize;
            for (index, zone) in zones.iter().enumerate().skip(first) {
                if !filter(zone.state) {
                    continue;
                }
                matching += 1;
                if descriptors.len() < capacity {
                    descriptors.push(zns::ZoneDescriptor {
                        zt: zns::ZONE_TYPE_SEQUENTIAL_WRITE_REQUIRED,
                        zs: zone.state.0 << 4,
                        zcap: self.zone_size,
                        zslba: self.zone_start(index),
                        wp: zone.wp,
                        ..FromZeros::new_zeroed()
                    });
                }
            }
        }
        let header = zns::ZoneReportHeader {
            nr_zones: if cdw13.partial() {
                descriptors.len() as u64
            } else {
                matching
            },
            ..FromZeros::new_zeroed()
        };
        let mut report = vec![0; len];
        let n = header_len.min(len);
        report[..n].copy_from_slice(&header.as_bytes()[..n]);
        for (i, desc) in descriptors.iter().enumerate() {
            let offset = header_len + i * desc_len;
            report[offset..offset + desc_len].copy_from_slice(desc.as_bytes());
        }
        Ok(Execution::new(IoProfile::read(len as u64))
            .with_transfer(Box::new(move |mem| prp.write(mem, &report))))
    }
}

impl CommandProcessor for ZonedNamespace {
    fn summary(&self) -> NamespaceSummary {
        NamespaceSummary {
            csi: spec::Csi::ZONED,
            size_lbas: self.size_lbas(),
            block_shift: self.store.block_shift,
            partitions: 1,
        }
    }

    fn identify_command_set(&self, csi: spec::Csi, buf: &mut [u8]) -> Result<(), NvmeError> {
        if csi != spec::Csi::ZONED {
            return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
        }
        let mut id = zns::IdentifyNamespaceZns {
            // No limits on active or open zones.
            mar: u32::MAX,
            mor: u32::MAX,
            ..FromZeros::new_zeroed()
        };
        id.lbafe[0].zsze = self.zone_size;
        let n = buf.len().min(size_of_val(&id));
        buf[..n].copy_from_slice(&id.as_bytes()[..n]);
        Ok(())
    }

    fn validate(&self, ctx: &CommandContext<'_>, command: &spec::Command) -> Result<(), NvmeError> {
        let opcode = command.cdw0.opcode();
        let (lba, count) = lba_range(command);
        let block_shift = self.store.block_shift;
        match opcode {
            op if op == nvm::NvmOpcode::READ.0 || op == nvm::NvmOpcode::WRITE.0 => {
                check_transfer_size(ctx, (count as usize) << block_shift)?;
                check_lba_range(lba, count, self.size_lbas())
            }
            op if op == zns::ZnsOpcode::ZONE_APPEND.0 => {
                check_transfer_size(ctx, (count as usize) << block_shift)?;
                self.check_zone_start(lba)
            }
            op if op == nvm::NvmOpcode::FLUSH.0 => Ok(()),
            op if op == zns::ZnsOpcode::ZONE_MANAGEMENT_SEND.0 => {
                if zns::Cdw13ZoneManagementSend::from(command.cdw13).select_all() {
                    Ok(())
                } else {
                    self.check_zone_start(lba)
                }
            }
            op if op == zns::ZnsOpcode::ZONE_MANAGEMENT_RECEIVE.0 => {
                let cdw13 = zns::Cdw13ZoneManagementReceive::from(command.cdw13);
                if zns::ZoneReceiveAction(cdw13.zra()) != zns::ZoneReceiveAction::REPORT_ZONES {
                    return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
                }
                check_transfer_size(ctx, (command.cdw12 as usize + 1) * 4)?;
                check_lba_range(lba, 1, self.size_lbas())
            }
            opcode => {
                tracing::warn!(opcode, "unsupported zoned opcode");
                Err(spec::Status::INVALID_COMMAND_OPCODE.into())
            }
        }
    }

    fn execute(
        &self,
        ctx: &CommandContext<'_>,
        command: &spec::Command,
    ) -> Result<Execution, NvmeError> {
        let opcode = command.cdw0.opcode();
        let (lba, count) = lba_range(command);
        let byte_count = (count as usize) << self.store.block_shift;
        let execution = match opcode {
            op if op == nvm::NvmOpcode::READ.0 => {
                let prp = PrpRange::parse(ctx.mem, byte_count, command.dptr)?;
                Execution::new(IoProfile::read(byte_count as u64))
                    .with_transfer(self.store.read_transfer(prp, lba, count))
            }
            op if op == nvm::NvmOpcode::WRITE.0 || op == zns::ZnsOpcode::ZONE_APPEND.0 => {
                let append = op == zns::ZnsOpcode::ZONE_APPEND.0;
                let prp = PrpRange::parse(ctx.mem, byte_count, command.dptr)?;
                let start = self.advance_write_pointer(lba, count, append)?;
                tracing::trace!(lba = start, count, append, "zone write");
                let execution = Execution::new(IoProfile::write(byte_count as u64))
                    .with_transfer(self.store.write_transfer(prp, start, count));
                if append {
                    execution.with_result([start as u32, (start >> 32) as u32])
                } else {
                    execution
                }
            }
            op if op == nvm::NvmOpcode::FLUSH.0 => Execution::new(IoProfile::other()),
            op if op == zns::ZnsOpcode::ZONE_MANAGEMENT_SEND.0 => {
                self.zone_management_send(command)?
            }
            op if op == zns::ZnsOpcode::ZONE_MANAGEMENT_RECEIVE.0 => {
                self.report_zones(ctx, command)?
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

    const ZONE: u64 = 8;

    fn setup() -> (HostMemory, ZonedNamespace) {
        (
            HostMemory::allocate(0x10000),
            ZonedNamespace::new(4, ZONE, 9).with_reset_latency(2_000_000),
        )
    }

    fn ctx(mem: &HostMemory) -> CommandContext<'_> {
        CommandContext {
            mem,
            max_transfer_size: 128 * 1024,
        }
    }

    fn send(zslba: u64, action: zns::ZoneSendAction, select_all: bool) -> spec::Command {
        let opcode = nvm::NvmOpcode(zns::ZnsOpcode::ZONE_MANAGEMENT_SEND.0);
        let mut command = rw_command(opcode, zslba, 1, [0; 2]);
        command.cdw12 = 0;
        command.cdw13 = zns::Cdw13ZoneManagementSend::new()
            .with_zsa(action.0)
            .with_select_all(select_all)
            .into();
        command
    }

    fn run(
        ns: &ZonedNamespace,
        mem: &HostMemory,
        command: &spec::Command,
    ) -> Result<Execution, NvmeError> {
        let ctx = ctx(mem);
        ns.validate(&ctx, command)?;
        let execution = ns.execute(&ctx, command)?;
        Ok(execution)
    }

    #[test]
    fn writes_follow_the_write_pointer() {
        let (mem, ns) = setup();
        let write = |lba, count| rw_command(nvm::NvmOpcode::WRITE, lba, count, [0; 2]);
        run(&ns, &mem, &write(0, 4)).unwrap();
        let err = run(&ns, &mem, &write(2, 1)).err().unwrap();
        assert_eq!(err.status(), spec::Status::ZONE_INVALID_WRITE);
        let err = run(&ns, &mem, &write(4, 5)).err().unwrap();
        assert_eq!(err.status(), spec::Status::ZONE_BOUNDARY_ERROR);
        run(&ns, &mem, &write(4, 4)).unwrap();
        let err = run(&ns, &mem, &write(8 - 1, 1)).err().unwrap();
        assert_eq!(err.status(), spec::Status::ZONE_IS_FULL);
        // The next zone is untouched.
        run(&ns, &mem, &write(ZONE, 1)).unwrap();
    }

    #[test]
    fn append_returns_assigned_lba() {
        let (mem, ns) = setup();
        mem.write_at(PAGE_SIZE64, &[0x11; 1024]).unwrap();
        let opcode = nvm::NvmOpcode(zns::ZnsOpcode::ZONE_APPEND.0);
        let append = rw_command(opcode, ZONE, 2, [PAGE_SIZE64, 0]);
        let first = run(&ns, &mem, &append).unwrap();
        assert_eq!(first.result.dw, [ZONE as u32, 0]);
        (first.transfer.unwrap())(&mem).unwrap();
        let second = run(&ns, &mem, &append).unwrap();
        assert_eq!(second.result.dw, [ZONE as u32 + 2, 0]);

        let read = rw_command(nvm::NvmOpcode::READ, ZONE, 1, [2 * PAGE_SIZE64, 0]);
        (run(&ns, &mem, &read).unwrap().transfer.unwrap())(&mem).unwrap();
        assert_eq!(mem.read_plain::<u64>(2 * PAGE_SIZE64).unwrap(), u64::from_ne_bytes([0x11; 8]));

        // Appends must name a zone start.
        let bad = rw_command(nvm::NvmOpcode(zns::ZnsOpcode::ZONE_APPEND.0), ZONE + 1, 1, [0; 2]);
        let err = run(&ns, &mem, &bad).err().unwrap();
        assert_eq!(err.status(), spec::Status::INVALID_FIELD_IN_COMMAND);
    }

    #[test]
    fn zone_state_transitions() {
        let (mem, ns) = setup();
        run(&ns, &mem, &send(0, zns::ZoneSendAction::OPEN, false)).unwrap();
        assert_eq!(ns.zones.lock()[0].state, zns::ZoneState::EXPLICITLY_OPENED);
        run(&ns, &mem, &send(0, zns::ZoneSendAction::CLOSE, false)).unwrap();
        assert_eq!(ns.zones.lock()[0].state, zns::ZoneState::EMPTY);
        run(&ns, &mem, &send(0, zns::ZoneSendAction::FINISH, false)).unwrap();
        assert_eq!(ns.zones.lock()[0].state, zns::ZoneState::FULL);
        let err = run(&ns, &mem, &send(0, zns::ZoneSendAction::OPEN, false)).err().unwrap();
        assert_eq!(err.status(), spec::Status::ZONE_INVALID_STATE_TRANSITION);

        let reset = run(&ns, &mem, &send(0, zns::ZoneSendAction::RESET, false)).unwrap();
        assert_eq!(reset.hint_ns, 2_000_000);
        assert_eq!(ns.zones.lock()[0].state, zns::ZoneState::EMPTY);
        assert_eq!(ns.zones.lock()[0].wp, 0);

        let all = run(&ns, &mem, &send(0, zns::ZoneSendAction::RESET, true)).unwrap();
        assert_eq!(all.hint_ns, 4 * 2_000_000);
    }

    #[test]
    fn report_zones() {
        let (mem, ns) = setup();
        run(&ns, &mem, &rw_command(nvm::NvmOpcode::WRITE, ZONE, 3, [0; 2])).unwrap();

        let opcode = nvm::NvmOpcode(zns::ZnsOpcode::ZONE_MANAGEMENT_RECEIVE.0);
        let mut report = rw_command(opcode, ZONE, 1, [PAGE_SIZE64, 0]);
        // Room for the header and two descriptors.
        report.cdw12 = (64 * 3 / 4) - 1;
        report.cdw13 = zns::Cdw13ZoneManagementReceive::new()
            .with_zra(zns::ZoneReceiveAction::REPORT_ZONES.0)
            .into();
        (run(&ns, &mem, &report).unwrap().transfer.unwrap())(&mem).unwrap();
        let header: zns::ZoneReportHeader = mem.read_plain(PAGE_SIZE64).unwrap();
        assert_eq!(header.nr_zones, 3);
        let desc: zns::ZoneDescriptor = mem.read_plain(PAGE_SIZE64 + 64).unwrap();
        assert_eq!(desc.zslba, ZONE);
        assert_eq!(desc.wp, ZONE + 3);
        assert_eq!(desc.zs >> 4, zns::ZoneState::IMPLICITLY_OPENED.0);
        let desc: zns::ZoneDescriptor = mem.read_plain(PAGE_SIZE64 + 128).unwrap();
        assert_eq!(desc.zslba, 2 * ZONE);

        report.cdw13 = zns::Cdw13ZoneManagementReceive::from(report.cdw13)
            .with_partial(true)
            .with_zrasf(1)
            .into();
        (run(&ns, &mem, &report).unwrap().transfer.unwrap())(&mem).unwrap();
        let header: zns::ZoneReportHeader = mem.read_plain(PAGE_SIZE64).unwrap();
        assert_eq!(header.nr_zones, 2);
    }
}
