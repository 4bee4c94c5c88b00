// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Admin queue handler.

use super::io::AbortRequest;
use super::io::AbortTicket;
use crate::controller::ControllerContext;
use crate::error::CommandResult;
use crate::error::NvmeError;
use crate::prp::PrpRange;
use crate::queue::Doorbells;
use crate::spec;
use crate::spec::nvm;
use crate::IOCQES;
use crate::IOSQES;
use crate::NVME_VERSION;
use crate::PAGE_MASK;
use crate::SUBSYSTEM_ID;
use crate::VENDOR_ID;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

const MAX_ASYNC_EVENT_REQUESTS: u8 = 4; // minimum recommended by spec
const ERROR_LOG_PAGE_ENTRIES: u8 = 1;
const MAX_CONCURRENT_ABORTS: u8 = 4;
const FIRMWARE_REVISION: &str = "1.0";

/// Features that can be set and read back without further effect.
const STORED_FEATURES: &[(spec::Feature, u32)] = &[
    (spec::Feature::ARBITRATION, 0),
    (spec::Feature::POWER_MANAGEMENT, 0),
    // 343 Kelvin over-temperature threshold.
    (spec::Feature::TEMPERATURE_THRESHOLD, 0x157),
    (spec::Feature::ERROR_RECOVERY, 0),
    (spec::Feature::VOLATILE_WRITE_CACHE, 1),
    (spec::Feature::INTERRUPT_COALESCING, 0),
    (spec::Feature::INTERRUPT_VECTOR_CONFIG, 0),
    (spec::Feature::WRITE_ATOMICITY, 0),
    (spec::Feature::ASYNC_EVENT_CONFIG, 0),
    (spec::Feature::KEEP_ALIVE, 0),
];

#[derive(Debug, Error)]
#[error("namespace id {0} is already attached")]
pub struct NsidConflict(pub u32);

pub(crate) struct AdminHandler {
    ctx: Arc<ControllerContext>,
    features: BTreeMap<spec::Feature, u32>,
    /// Queue pairs granted by the last Set Features (Number of Queues).
    num_sqs: u16,
    num_cqs: u16,
    asynchronous_event_requests: Vec<u16>,
    doorbell_resets: Vec<usize>,
}

impl AdminHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        let max = ctx.queues.max_io_queues();
        Self {
            ctx,
            features: STORED_FEATURES.iter().copied().collect(),
            num_sqs: max,
            num_cqs: max,
            asynchronous_event_requests: Vec::new(),
            doorbell_resets: Vec::new(),
        }
    }

    /// Doorbell registers that queue creation or deletion set back to zero
    /// since the last call.
    pub fn take_doorbell_resets(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.doorbell_resets)
    }

    /// Processes one admin command. Returns `None` if the command completes
    /// later (from an I/O worker or an event).
    pub fn handle(&mut self, command: &spec::Command) -> Option<CommandResult> {
        let opcode = spec::AdminOpcode(command.cdw0.opcode());

        tracing::debug!(?opcode, cid = command.cdw0.cid(), "admin command");

        let result = match opcode {
            spec::AdminOpcode::IDENTIFY => self
                .handle_identify(command)
                .map(|()| Some(Default::default())),
            spec::AdminOpcode::GET_FEATURES => self.handle_get_features(command).map(Some),
            spec::AdminOpcode::SET_FEATURES => self.handle_set_features(command).map(Some),
            spec::AdminOpcode::CREATE_IO_COMPLETION_QUEUE => self
                .handle_create_io_completion_queue(command)
                .map(|()| Some(Default::default())),
            spec::AdminOpcode::CREATE_IO_SUBMISSION_QUEUE => self
                .handle_create_io_submission_queue(command)
                .map(|()| Some(Default::default())),
            spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE => self
                .handle_delete_io_completion_queue(command)
                .map(|()| Some(Default::default())),
            spec::AdminOpcode::DELETE_IO_SUBMISSION_QUEUE => self
                .handle_delete_io_submission_queue(command)
                .map(|()| Some(Default::default())),
            spec::AdminOpcode::ASYNCHRONOUS_EVENT_REQUEST => {
                self.handle_asynchronous_event_request(command)
            }
            spec::AdminOpcode::ABORT => self.handle_abort(command),
            spec::AdminOpcode::GET_LOG_PAGE => self
                .handle_get_log_page(command)
                .map(|()| Some(Default::default())),
            spec::AdminOpcode::KEEP_ALIVE => Ok(Some(Default::default())),
            opcode => {
                tracing::warn!(?opcode, "unsupported opcode");
                Err(spec::Status::INVALID_COMMAND_OPCODE.into())
            }
        };

        match result {
            Ok(cr) => cr,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    cid = command.cdw0.cid(),
                    ?opcode,
                    "command error"
                );
                Some(err.into())
            }
        }
    }

    fn handle_identify(&mut self, command: &spec::Command) -> Result<(), NvmeError> {
        let cdw10: spec::Cdw10Identify = command.cdw10.into();
        let cdw11: spec::Cdw11Identify = command.cdw11.into();
        // All identify results are 4096 bytes.
        let mut buf = [0u64; 512];
        let buf = buf.as_mut_bytes();
        match spec::Cns(cdw10.cns()) {
            spec::Cns::CONTROLLER => {
                buf.copy_from_slice(self.identify_controller().as_bytes());
            }
            spec::Cns::ACTIVE_NAMESPACES => {
                if command.nsid >= 0xfffffffe {
                    return Err(spec::Status::INVALID_NAMESPACE_OR_FORMAT.into());
                }
                for (nsid, dest) in self
                    .ctx
                    .namespaces
                    .keys()
                    .filter(|&&nsid| nsid > command.nsid)
                    .zip(buf.chunks_exact_mut(4))
                {
                    dest.copy_from_slice(&nsid.to_le_bytes());
                }
            }
            spec::Cns::NAMESPACE => {
                if let Some(ns) = self.ctx.namespaces.get(&command.nsid) {
                    let mut id = nvm::IdentifyNamespace::new_zeroed();
                    ns.processor.identify_namespace(&mut id);
                    buf.copy_from_slice(id.as_bytes());
                } else {
                    tracing::warn!(nsid = command.nsid, "unknown namespace id");
                }
            }
            spec::Cns::DESCRIPTOR_NAMESPACE => {
                let ns = self
                    .ctx
                    .namespaces
                    .get(&command.nsid)
                    .ok_or(spec::Status::INVALID_NAMESPACE_OR_FORMAT)?;
                let descriptor = nvm::NamespaceIdentificationDescriptor {
                    nidt: nvm::NamespaceIdentifierType::CSI.0,
                    nidl: 1,
                    rsvd: [0; 2],
                };
                let header = descriptor.as_bytes();
                buf[..header.len()].copy_from_slice(header);
                buf[header.len()] = ns.processor.summary().csi.0;
            }
            spec::Cns::SPECIFIC_NAMESPACE_IO_COMMAND_SET => {
                let ns = self
                    .ctx
                    .namespaces
                    .get(&command.nsid)
                    .ok_or(spec::Status::INVALID_NAMESPACE_OR_FORMAT)?;
                ns.processor
                    .identify_command_set(spec::Csi(cdw11.csi()), buf)?;
            }
            spec::Cns::SPECIFIC_CONTROLLER_IO_COMMAND_SET => {
                // Nothing beyond the base controller data is reported for any
                // supported command set.
                let csi = spec::Csi(cdw11.csi());
                if !self
                    .ctx
                    .namespaces
                    .values()
                    .any(|ns| ns.processor.summary().csi == csi)
                {
                    return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
                }
            }
            cns => {
                tracing::warn!(?cns, "unsupported cns");
                return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
            }
        };
        PrpRange::parse(&self.ctx.mem, buf.len(), command.dptr)?.write(&self.ctx.mem, buf)?;
        Ok(())
    }

    fn identify_controller(&self) -> spec::IdentifyController {
        let mut id = spec::IdentifyController {
            vid: VENDOR_ID,
            ssvid: SUBSYSTEM_ID,
            sn: ascii("NVMEV-0001"),
            mn: ascii("nvmev emulated controller"),
            fr: ascii(FIRMWARE_REVISION),
            mdts: self.ctx.config.controller.mdts,
            ver: NVME_VERSION,
            rtd3r: 400000,
            rtd3e: 400000,
            cntrltype: spec::CONTROLLER_TYPE_IO,
            acl: MAX_CONCURRENT_ABORTS - 1,
            aerl: MAX_ASYNC_EVENT_REQUESTS - 1,
            // Slot 1 is read-only and is the only slot.
            frmw: 0b11,
            elpe: ERROR_LOG_PAGE_ENTRIES - 1,
            sqes: spec::QueueEntrySize::new()
                .with_min(IOSQES)
                .with_max(IOSQES)
                .into(),
            cqes: spec::QueueEntrySize::new()
                .with_min(IOCQES)
                .with_max(IOCQES)
                .into(),
            nn: self.ctx.namespaces.keys().copied().max().unwrap_or(0),
            oncs: spec::Oncs::new()
                .with_dataset_management(true)
                .with_write_zeroes(true)
                .into(),
            vwc: spec::VolatileWriteCache::new().with_present(true).into(),
            ..FromZeros::new_zeroed()
        };
        let subnqn = format!("nqn.2014-08.org.nvmexpress:{VENDOR_ID:04x}{SUBSYSTEM_ID:04x}:nvmev");
        id.subnqn[..subnqn.len()].copy_from_slice(subnqn.as_bytes());
        id
    }

    fn handle_set_features(&mut self, command: &spec::Command) -> Result<CommandResult, NvmeError> {
        let cdw10: spec::Cdw10SetFeatures = command.cdw10.into();
        let mut dw = [0; 2];
        if cdw10.save() {
            return Err(spec::Status::FEATURE_IDENTIFIER_NOT_SAVEABLE.into());
        }
        match spec::Feature(cdw10.fid()) {
            spec::Feature::NUMBER_OF_QUEUES => {
                let max = self.ctx.queues.max_io_queues();
                if (1..=max)
                    .any(|qid| self.ctx.queues.sq_exists(qid) || self.ctx.queues.cq_exists(qid))
                {
                    return Err(spec::Status::COMMAND_SEQUENCE_ERROR.into());
                }
                let cdw11: spec::Cdw11FeatureNumberOfQueues = command.cdw11.into();
                if cdw11.ncq_z() == u16::MAX || cdw11.nsq_z() == u16::MAX {
                    return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
                }
                self.num_sqs = (cdw11.nsq_z() + 1).min(max);
                self.num_cqs = (cdw11.ncq_z() + 1).min(max);
                tracing::debug!(sqs = self.num_sqs, cqs = self.num_cqs, "number of queues");
                dw[0] = self.number_of_queues();
            }
            spec::Feature::VOLATILE_WRITE_CACHE => {
                let cdw11 = spec::Cdw11FeatureVolatileWriteCache::from(command.cdw11);
                self.features.insert(spec::Feature::VOLATILE_WRITE_CACHE, cdw11.wce() as u32);
            }
            feature => match self.features.get_mut(&feature) {
                Some(value) => *value = command.cdw11,
                None => {
                    tracing::warn!(?feature, "unsupported feature");
                    return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
                }
            },
        }
        Ok(CommandResult::new(spec::Status::SUCCESS, dw))
    }

    fn handle_get_features(&mut self, command: &spec::Command) -> Result<CommandResult, NvmeError> {
        let cdw10: spec::Cdw10GetFeatures = command.cdw10.into();
        let feature = spec::Feature(cdw10.fid());
        let current = match feature {
            spec::Feature::NUMBER_OF_QUEUES => self.number_of_queues(),
            feature => match self.features.get(&feature) {
                Some(&value) => value,
                None => {
                    tracing::warn!(?feature, "unsupported feature");
                    return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
                }
            },
        };
        let dw0 = match cdw10.sel() {
            0 => current,
            // Default and saved values are the same since nothing is saveable.
            1 | 2 => match feature {
                spec::Feature::NUMBER_OF_QUEUES => {
                    let max = self.ctx.queues.max_io_queues() - 1;
                    spec::Cdw11FeatureNumberOfQueues::new()
                        .with_nsq_z(max)
                        .with_ncq_z(max)
                        .into()
                }
                feature => STORED_FEATURES
                    .iter()
                    .find(|(f, _)| *f == feature)
                    .map_or(0, |&(_, value)| value),
            },
            // Capabilities: changeable, not saveable, not namespace specific.
            3 => 0b100,
            sel => {
                tracing::warn!(sel, "invalid feature select");
                return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
            }
        };
        Ok(CommandResult::new(spec::Status::SUCCESS, [dw0, 0]))
    }

    fn number_of_queues(&self) -> u32 {
        spec::Cdw11FeatureNumberOfQueues::new()
            .with_nsq_z(self.num_sqs - 1)
            .with_ncq_z(self.num_cqs - 1)
            .into()
    }

    fn handle_create_io_completion_queue(
        &mut self,
        command: &spec::Command,
    ) -> Result<(), NvmeError> {
        let cdw10: spec::Cdw10CreateIoQueue = command.cdw10.into();
        let cdw11: spec::Cdw11CreateIoCompletionQueue = command.cdw11.into();
        let cqid = cdw10.qid();
        if cqid > self.num_cqs {
            return Err(spec::Status::INVALID_QUEUE_IDENTIFIER.into());
        }
        // One vector per queue pair plus the admin queue.
        if cdw11.ien() && cdw11.iv() > self.ctx.queues.max_io_queues() {
            return Err(spec::Status::INVALID_INTERRUPT_VECTOR.into());
        }
        self.ctx.queues.create_completion_queue(
            cqid,
            command.dptr[0] & PAGE_MASK,
            cdw10.qsize_z() as u32 + 1,
            cdw11.iv(),
            cdw11.ien(),
            cdw11.pc(),
        )?;
        self.doorbell_resets.push(Doorbells::cq_head_index(cqid));
        Ok(())
    }

    fn handle_create_io_submission_queue(
        &mut self,
        command: &spec::Command,
    ) -> Result<(), NvmeError> {
        let cdw10: spec::Cdw10CreateIoQueue = command.cdw10.into();
        let cdw11: spec::Cdw11CreateIoSubmissionQueue = command.cdw11.into();
        let sqid = cdw10.qid();
        if sqid > self.num_sqs {
            return Err(spec::Status::INVALID_QUEUE_IDENTIFIER.into());
        }
        self.ctx.queues.create_submission_queue(
            sqid,
            cdw11.cqid(),
            command.dptr[0] & PAGE_MASK,
            cdw10.qsize_z() as u32 + 1,
            cdw11.qprio(),
            cdw11.pc(),
        )?;
        self.doorbell_resets.push(Doorbells::sq_tail_index(sqid));
        Ok(())
    }

    /// Completes right away. Commands already handed to I/O workers still
    /// complete normally while the queue drains.
    fn handle_delete_io_submission_queue(
        &mut self,
        command: &spec::Command,
    ) -> Result<(), NvmeError> {
        let cdw10: spec::Cdw10DeleteIoQueue = command.cdw10.into();
        let sqid = cdw10.qid();
        self.ctx.queues.delete_submission_queue(sqid)?;
        self.doorbell_resets.push(Doorbells::sq_tail_index(sqid));
        Ok(())
    }

    fn handle_delete_io_completion_queue(
        &mut self,
        command: &spec::Command,
    ) -> Result<(), NvmeError> {
        let cdw10: spec::Cdw10DeleteIoQueue = command.cdw10.into();
        let cqid = cdw10.qid();
        self.ctx.queues.delete_completion_queue(cqid)?;
        self.doorbell_resets.push(Doorbells::cq_head_index(cqid));
        Ok(())
    }

    /// No asynchronous events are ever generated, so these stay outstanding.
    fn handle_asynchronous_event_request(
        &mut self,
        command: &spec::Command,
    ) -> Result<Option<CommandResult>, NvmeError> {
        if self.asynchronous_event_requests.len() >= MAX_ASYNC_EVENT_REQUESTS as usize {
            return Err(spec::Status::ASYNCHRONOUS_EVENT_REQUEST_LIMIT_EXCEEDED.into());
        }
        self.asynchronous_event_requests.push(command.cdw0.cid());
        Ok(None)
    }

    /// Asks every I/O worker to look for the command. The last worker to
    /// answer posts the completion.
    fn handle_abort(&self, command: &spec::Command) -> Result<Option<CommandResult>, NvmeError> {
        let cdw10: spec::Cdw10Abort = command.cdw10.into();
        if cdw10.sqid() == 0 || !self.ctx.queues.sq_exists(cdw10.sqid()) {
            // Admin commands are never outstanding long enough to abort.
            return Ok(Some(CommandResult::new(spec::Status::SUCCESS, [1, 0])));
        }
        let ticket = AbortTicket::new(
            command.cdw0.cid(),
            self.ctx.queues.cq_generation(0).unwrap_or_default(),
            self.ctx.workers.len(),
        );
        for worker in &self.ctx.workers {
            worker.abort(AbortRequest {
                sqid: cdw10.sqid(),
                cid: cdw10.cid(),
                ticket: ticket.clone(),
            });
        }
        Ok(None)
    }

    fn handle_get_log_page(&self, command: &spec::Command) -> Result<(), NvmeError> {
        let mem = &self.ctx.mem;
        let cdw10 = spec::Cdw10GetLogPage::from(command.cdw10);
        let cdw11 = spec::Cdw11GetLogPage::from(command.cdw11);
        let numd =
            ((cdw10.numdl_z() as u32) | ((cdw11.numdu() as u32) << 16)).saturating_add(1) as usize;
        let len = numd * 4;
        let prp = PrpRange::parse(mem, len, command.dptr)?;

        match spec::LogPageIdentifier(cdw10.lid()) {
            spec::LogPageIdentifier::ERROR_INFORMATION => {
                // Write empty log entries.
                prp.zero(mem, len.min(ERROR_LOG_PAGE_ENTRIES as usize * 64))?;
            }
            spec::LogPageIdentifier::HEALTH_INFORMATION => {
                if command.nsid != !0 && command.nsid != 0 {
                    return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
                }
                let log = self.health_log();
                let bytes = log.as_bytes();
                prp.write(mem, &bytes[..len.min(bytes.len())])?;
            }
            spec::LogPageIdentifier::FIRMWARE_SLOT_INFORMATION => {
                let mut page = [0u8; 512];
                // Active firmware in slot 1.
                page[0] = 1;
                page[8..16].copy_from_slice(&ascii::<8>(FIRMWARE_REVISION));
                prp.write(mem, &page[..len.min(page.len())])?;
            }
            spec::LogPageIdentifier::CHANGED_NAMESPACE_LIST => {
                // Namespaces never change after the controller is built.
                prp.zero(mem, len.min(4096))?;
            }
            lid => {
                tracing::warn!(?lid, "unsupported log page");
                return Err(spec::Status::INVALID_LOG_PAGE.into());
            }
        }

        Ok(())
    }

    fn health_log(&self) -> spec::HealthLog {
        let counters = &self.ctx.counters;
        let load = |c: &std::sync::atomic::AtomicU64| c.load(Ordering::Relaxed) as u128;
        // Data units are thousands of 512 byte units, rounded up.
        let data_units = |bytes: u128| bytes.div_ceil(512 * 1000);
        let mut log = spec::HealthLog::new_zeroed();
        // 323 Kelvin.
        log.temperature = 323u16.to_le_bytes();
        log.available_spare = 100;
        log.available_spare_threshold = 10;
        log.data_units_read = spec::U128LE::new(data_units(load(&counters.bytes_read)));
        log.data_units_written = spec::U128LE::new(data_units(load(&counters.bytes_written)));
        log.host_read_commands = spec::U128LE::new(load(&counters.read_commands));
        log.host_write_commands = spec::U128LE::new(load(&counters.write_commands));
        log.power_cycles = spec::U128LE::new(1);
        log
    }
}

/// Space-padded ASCII, as identify strings are encoded.
fn ascii<const N: usize>(s: &str) -> [u8; N] {
    let mut v = [b' '; N];
    let len = s.len().min(N);
    v[..len].copy_from_slice(&s.as_bytes()[..len]);
    v
}
