// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVMe submission and completion queue state.
//!
//! Each queue lives behind its own lock. No code path holds a submission queue
//! lock and a completion queue lock at the same time.

use crate::error::CommandResult;
use crate::error::NvmeError;
use crate::memory::HostMemory;
use crate::memory::MemoryError;
use crate::spec;
use crate::MAX_ADMIN_QUEUE_DEPTH;
use event_listener::Event;
use event_listener::Listener;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const SQ_ENTRY_SIZE: u64 = size_of::<spec::Command>() as u64;
const CQ_ENTRY_SIZE: u64 = size_of::<spec::Completion>() as u64;

/// Receives completion queue interrupts.
pub trait InterruptTarget: Send + Sync {
    /// Called at most once per completion batch for each completion queue
    /// with interrupts enabled.
    fn signal(&self, cq_id: u16, vector: u16);
}

/// An [`InterruptTarget`] that drops every interrupt.
#[derive(Debug, Default)]
pub struct NoInterrupts;

impl InterruptTarget for NoInterrupts {
    fn signal(&self, _cq_id: u16, _vector: u16) {}
}

#[derive(Debug, Default)]
pub struct DoorbellRegister {
    value: AtomicU32,
}

impl DoorbellRegister {
    pub fn read(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    fn store(&self, value: u32) {
        self.value.store(value, Ordering::SeqCst);
    }
}

/// The doorbell register file. Register `2 * qid` holds the submission queue
/// tail and `2 * qid + 1` the completion queue head.
#[derive(Debug)]
pub struct Doorbells {
    registers: Vec<DoorbellRegister>,
    event: Event,
}

impl Doorbells {
    pub fn new(max_io_queues: u16) -> Self {
        Self {
            registers: (0..(max_io_queues as usize + 1) * 2)
                .map(|_| DoorbellRegister::default())
                .collect(),
            event: Event::new(),
        }
    }

    pub fn sq_tail_index(qid: u16) -> usize {
        qid as usize * 2
    }

    pub fn cq_head_index(qid: u16) -> usize {
        qid as usize * 2 + 1
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn read(&self, index: usize) -> u32 {
        self.registers.get(index).map_or(0, |r| r.read())
    }

    /// A host doorbell write.
    pub fn write(&self, index: usize, value: u32) {
        let Some(register) = self.registers.get(index) else {
            tracing::warn!(index, value, "write to unknown doorbell");
            return;
        };
        register.store(value);
        self.event.notify(usize::MAX);
    }

    pub fn ring_sq_tail(&self, qid: u16, tail: u32) {
        self.write(Self::sq_tail_index(qid), tail);
    }

    pub fn ring_cq_head(&self, qid: u16, head: u32) {
        self.write(Self::cq_head_index(qid), head);
    }

    fn reset(&self, index: usize) {
        if let Some(register) = self.registers.get(index) {
            register.store(0);
        }
    }

    /// Waits up to `timeout` for any doorbell write, unless `ready` already
    /// reports pending work.
    pub fn wait(&self, timeout: Duration, ready: impl FnOnce() -> bool) {
        let listener = self.event.listen();
        if ready() {
            return;
        }
        listener.wait_timeout(timeout);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueState {
    Active,
    /// No new commands are fetched; requests already in flight still complete.
    Draining,
}

/// Per-submission-queue counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SqStats {
    /// Commands fetched from the queue.
    pub nr_dispatched: u64,
    /// Commands held by I/O workers.
    pub nr_in_flight: u32,
    pub max_nr_in_flight: u32,
    /// Commands admitted to I/O workers.
    pub total_io: u64,
}

#[derive(Debug)]
struct SubmissionQueue {
    cqid: u16,
    cq_generation: u64,
    base: u64,
    depth: u32,
    priority: u8,
    head: u32,
    tail: u32,
    state: QueueState,
    delete_requested: bool,
    stats: SqStats,
}

#[derive(Debug)]
struct CompletionQueue {
    /// Distinguishes this queue from earlier queues with the same id.
    generation: u64,
    base: u64,
    depth: u32,
    irq_vector: u16,
    irq_enabled: bool,
    head: u32,
    tail: u32,
    phase: bool,
    sq_refs: u32,
    state: QueueState,
    interrupt_pending: bool,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue identifier {qid}")]
    InvalidQueueIdentifier {
        qid: u16,
        #[source]
        reason: InvalidQueueIdentifierReason,
    },
    #[error("invalid queue depth {0}")]
    InvalidQueueSize(u32),
    #[error("completion queue {0} does not exist")]
    CompletionQueueInvalid(u16),
    #[error("completion queue {0} is still referenced by a submission queue")]
    CompletionQueueInUse(u16),
    #[error("physically discontiguous queues are not supported")]
    NotContiguous,
    #[error("completion queue {0} is full")]
    CompletionQueueFull(u16),
    #[error("completion queue {0} is not accepting completions")]
    CompletionQueueGone(u16),
    #[error("protocol error on queue {qid}")]
    Protocol {
        qid: u16,
        #[source]
        err: ProtocolError,
    },
    #[error("completion queue write failed")]
    Memory(#[source] MemoryError),
}

#[derive(Debug, Error)]
pub enum InvalidQueueIdentifierReason {
    #[error("queue id is out of bounds")]
    Oob,
    #[error("queue id is in use")]
    InUse,
    #[error("queue id is not in use")]
    NotInUse,
}

/// Host misbehavior that takes a queue out of service.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("doorbell value {0:#x} is beyond the queue depth")]
    BeyondDepth(u32),
    #[error("tail moved backward from {old:#x} to {new:#x}")]
    TailRegressed { old: u32, new: u32 },
    #[error("failed to read submission queue entry")]
    Memory(#[source] MemoryError),
}

impl From<QueueError> for NvmeError {
    fn from(err: QueueError) -> Self {
        let status = match &err {
            QueueError::InvalidQueueIdentifier { .. } => spec::Status::INVALID_QUEUE_IDENTIFIER,
            QueueError::InvalidQueueSize(_) => spec::Status::INVALID_QUEUE_SIZE,
            QueueError::CompletionQueueInvalid(_) => spec::Status::COMPLETION_QUEUE_INVALID,
            QueueError::CompletionQueueInUse(_) => spec::Status::INVALID_QUEUE_DELETION,
            QueueError::NotContiguous => spec::Status::INVALID_FIELD_IN_COMMAND,
            QueueError::CompletionQueueFull(_)
            | QueueError::CompletionQueueGone(_)
            | QueueError::Protocol { .. }
            | QueueError::Memory(_) => spec::Status::INTERNAL_ERROR,
        };
        NvmeError::new(status, err)
    }
}

fn invalid_qid(qid: u16, reason: InvalidQueueIdentifierReason) -> QueueError {
    QueueError::InvalidQueueIdentifier { qid, reason }
}

/// A command fetched from a submission queue.
#[derive(Debug, Clone)]
pub struct FetchedCommand {
    pub command: spec::Command,
    pub cqid: u16,
    /// The generation of `cqid` when the submission queue was created.
    pub cq_generation: u64,
    /// The entry's index within its submission queue.
    pub sq_entry: u16,
}

/// Owns the ring state of the admin queue pair and every I/O queue.
pub struct QueueManager {
    mem: HostMemory,
    doorbells: Arc<Doorbells>,
    interrupts: Arc<dyn InterruptTarget>,
    max_depth: u32,
    sqs: Vec<Mutex<Option<SubmissionQueue>>>,
    cqs: Vec<Mutex<Option<CompletionQueue>>>,
    next_generation: AtomicU64,
}

impl QueueManager {
    pub fn new(
        mem: HostMemory,
        doorbells: Arc<Doorbells>,
        interrupts: Arc<dyn InterruptTarget>,
        max_io_queues: u16,
        max_depth: u32,
    ) -> Self {
        let count = max_io_queues as usize + 1;
        Self {
            mem,
            doorbells,
            interrupts,
            max_depth,
            sqs: (0..count).map(|_| Mutex::new(None)).collect(),
            cqs: (0..count).map(|_| Mutex::new(None)).collect(),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn max_io_queues(&self) -> u16 {
        (self.sqs.len() - 1) as u16
    }

    pub fn doorbells(&self) -> &Arc<Doorbells> {
        &self.doorbells
    }

    fn sq(&self, qid: u16) -> Result<&Mutex<Option<SubmissionQueue>>, QueueError> {
        self.sqs
            .get(qid as usize)
            .ok_or(invalid_qid(qid, InvalidQueueIdentifierReason::Oob))
    }

    fn cq(&self, qid: u16) -> Result<&Mutex<Option<CompletionQueue>>, QueueError> {
        self.cqs
            .get(qid as usize)
            .ok_or(invalid_qid(qid, InvalidQueueIdentifierReason::Oob))
    }

    fn new_cq(&self, base: u64, depth: u32, irq_vector: u16, irq_enabled: bool) -> CompletionQueue {
        CompletionQueue {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            base,
            depth,
            irq_vector,
            irq_enabled,
            head: 0,
            tail: 0,
            phase: true,
            sq_refs: 0,
            state: QueueState::Active,
            interrupt_pending: false,
        }
    }

    fn new_sq(
        cqid: u16,
        cq_generation: u64,
        base: u64,
        depth: u32,
        priority: u8,
    ) -> SubmissionQueue {
        SubmissionQueue {
            cqid,
            cq_generation,
            base,
            depth,
            priority,
            head: 0,
            tail: 0,
            state: QueueState::Active,
            delete_requested: false,
            stats: SqStats::default(),
        }
    }

    /// Creates the admin queue pair (queue id 0).
    pub fn create_admin_queues(
        &self,
        asq: u64,
        asq_depth: u32,
        acq: u64,
        acq_depth: u32,
    ) -> Result<(), QueueError> {
        for depth in [asq_depth, acq_depth] {
            if !(2..=MAX_ADMIN_QUEUE_DEPTH).contains(&depth) {
                return Err(QueueError::InvalidQueueSize(depth));
            }
        }
        let mut cq = self.cqs[0].lock();
        let mut sq = self.sqs[0].lock();
        if cq.is_some() || sq.is_some() {
            return Err(invalid_qid(0, InvalidQueueIdentifierReason::InUse));
        }
        let mut admin_cq = self.new_cq(acq, acq_depth, 0, true);
        admin_cq.sq_refs = 1;
        *sq = Some(Self::new_sq(0, admin_cq.generation, asq, asq_depth, 0));
        *cq = Some(admin_cq);
        self.doorbells.reset(Doorbells::sq_tail_index(0));
        self.doorbells.reset(Doorbells::cq_head_index(0));
        Ok(())
    }

    fn check_io_queue(&self, qid: u16, depth: u32, contiguous: bool) -> Result<(), QueueError> {
        if qid == 0 {
            return Err(invalid_qid(qid, InvalidQueueIdentifierReason::Oob));
        }
        if !contiguous {
            return Err(QueueError::NotContiguous);
        }
        if !(2..=self.max_depth).contains(&depth) {
            return Err(QueueError::InvalidQueueSize(depth));
        }
        Ok(())
    }

    pub fn create_completion_queue(
        &self,
        qid: u16,
        base: u64,
        depth: u32,
        irq_vector: u16,
        irq_enabled: bool,
        contiguous: bool,
    ) -> Result<(), QueueError> {
        let mut cq = self.cq(qid)?.lock();
        self.check_io_queue(qid, depth, contiguous)?;
        if cq.is_some() {
            return Err(invalid_qid(qid, InvalidQueueIdentifierReason::InUse));
        }
        *cq = Some(self.new_cq(base, depth, irq_vector, irq_enabled));
        self.doorbells.reset(Doorbells::cq_head_index(qid));
        tracing::debug!(cqid = qid, depth, irq_vector, irq_enabled, "created completion queue");
        Ok(())
    }

    pub fn create_submission_queue(
        &self,
        qid: u16,
        cq_id: u16,
        base: u64,
        depth: u32,
        priority: u8,
        contiguous: bool,
    ) -> Result<(), QueueError> {
        self.check_io_queue(qid, depth, contiguous)?;
        if self.sq(qid)?.lock().is_some() {
            return Err(invalid_qid(qid, InvalidQueueIdentifierReason::InUse));
        }
        let cq_generation = {
            let mut cq = self
                .cqs
                .get(cq_id as usize)
                .filter(|_| cq_id != 0)
                .ok_or(QueueError::CompletionQueueInvalid(cq_id))?
                .lock();
            let cq = cq
                .as_mut()
                .filter(|cq| cq.state == QueueState::Active)
                .ok_or(QueueError::CompletionQueueInvalid(cq_id))?;
            cq.sq_refs += 1;
            cq.generation
        };
        *self.sq(qid)?.lock() = Some(Self::new_sq(cq_id, cq_generation, base, depth, priority));
        self.doorbells.reset(Doorbells::sq_tail_index(qid));
        tracing::debug!(sqid = qid, cqid = cq_id, depth, priority, "created submission queue");
        Ok(())
    }

    /// Stops fetching from a submission queue. The queue is removed once its
    /// in-flight requests have completed.
    pub fn delete_submission_queue(&self, qid: u16) -> Result<(), QueueError> {
        if qid == 0 {
            return Err(invalid_qid(qid, InvalidQueueIdentifierReason::Oob));
        }
        let cqid = {
            let mut slot = self.sq(qid)?.lock();
            let sq = slot
                .as_mut()
                .filter(|sq| !sq.delete_requested)
                .ok_or(invalid_qid(qid, InvalidQueueIdentifierReason::NotInUse))?;
            sq.delete_requested = true;
            sq.state = QueueState::Draining;
            let cqid = sq.cqid;
            let in_flight = sq.stats.nr_in_flight;
            if in_flight == 0 {
                *slot = None;
                tracing::debug!(sqid = qid, "deleted submission queue");
            } else {
                tracing::debug!(sqid = qid, in_flight, "draining submission queue");
            }
            cqid
        };
        if let Some(cq) = self.cqs[cqid as usize].lock().as_mut() {
            cq.sq_refs -= 1;
        }
        self.doorbells.reset(Doorbells::sq_tail_index(qid));
        Ok(())
    }

    pub fn delete_completion_queue(&self, qid: u16) -> Result<(), QueueError> {
        if qid == 0 {
            return Err(invalid_qid(qid, InvalidQueueIdentifierReason::Oob));
        }
        let mut slot = self.cq(qid)?.lock();
        let cq = slot
            .as_ref()
            .ok_or(invalid_qid(qid, InvalidQueueIdentifierReason::NotInUse))?;
        if cq.sq_refs > 0 {
            return Err(QueueError::CompletionQueueInUse(qid));
        }
        *slot = None;
        self.doorbells.reset(Doorbells::cq_head_index(qid));
        tracing::debug!(cqid = qid, "deleted completion queue");
        Ok(())
    }

    pub fn sq_exists(&self, qid: u16) -> bool {
        self.sqs.get(qid as usize).is_some_and(|sq| sq.lock().is_some())
    }

    pub fn cq_exists(&self, qid: u16) -> bool {
        self.cqs.get(qid as usize).is_some_and(|cq| cq.lock().is_some())
    }

    pub fn cq_generation(&self, qid: u16) -> Option<u64> {
        self.cqs.get(qid as usize)?.lock().as_ref().map(|cq| cq.generation)
    }

    pub fn sq_state(&self, qid: u16) -> Option<QueueState> {
        self.sqs.get(qid as usize)?.lock().as_ref().map(|sq| sq.state)
    }

    pub fn sq_stats(&self, qid: u16) -> Option<SqStats> {
        self.sqs.get(qid as usize)?.lock().as_ref().map(|sq| sq.stats)
    }

    /// Returns whether fetched-but-unconsumed entries remain between the
    /// queue's head and the last observed tail.
    pub fn has_pending(&self, qid: u16) -> bool {
        self.sqs.get(qid as usize).is_some_and(|sq| {
            sq.lock()
                .as_ref()
                .is_some_and(|sq| sq.state == QueueState::Active && sq.head != sq.tail)
        })
    }

    /// Accepts a new tail reported through the doorbell and returns the
    /// commands between the head and that tail. The head advances as the
    /// returned iterator is consumed; entries left unconsumed stay queued.
    pub fn fetch_new_commands(
        &self,
        sq_id: u16,
        observed_tail: u32,
    ) -> Result<CommandFetch<'_>, QueueError> {
        let mut slot = self.sq(sq_id)?.lock();
        let sq = slot
            .as_mut()
            .ok_or(invalid_qid(sq_id, InvalidQueueIdentifierReason::NotInUse))?;
        if sq.state == QueueState::Active {
            let err = if observed_tail >= sq.depth {
                Some(ProtocolError::BeyondDepth(observed_tail))
            } else {
                let pending = |tail: u32| (tail + sq.depth - sq.head) % sq.depth;
                (pending(observed_tail) < pending(sq.tail)).then_some(
                    ProtocolError::TailRegressed {
                        old: sq.tail,
                        new: observed_tail,
                    },
                )
            };
            if let Some(err) = err {
                sq.state = QueueState::Draining;
                return Err(QueueError::Protocol { qid: sq_id, err });
            }
            sq.tail = observed_tail;
        }
        Ok(CommandFetch {
            queues: self,
            sq_id,
        })
    }

    /// Accepts a new completion queue head reported through the doorbell.
    pub fn update_cq_head(&self, cq_id: u16, head: u32) -> Result<(), QueueError> {
        let mut slot = self.cq(cq_id)?.lock();
        let cq = slot
            .as_mut()
            .ok_or(invalid_qid(cq_id, InvalidQueueIdentifierReason::NotInUse))?;
        if head >= cq.depth {
            cq.state = QueueState::Draining;
            return Err(QueueError::Protocol {
                qid: cq_id,
                err: ProtocolError::BeyondDepth(head),
            });
        }
        cq.head = head;
        Ok(())
    }

    /// Writes a completion at the tail of `cq_id`, stamped with the ring's
    /// current phase.
    ///
    /// Fails with [`QueueError::CompletionQueueFull`] if the host has not
    /// consumed enough entries (retry later), or
    /// [`QueueError::CompletionQueueGone`] if the queue no longer exists.
    pub fn post_completion(
        &self,
        cq_id: u16,
        command_id: u16,
        sq_id: u16,
        result: &CommandResult,
    ) -> Result<(), QueueError> {
        self.post(cq_id, None, command_id, sq_id, result)
    }

    /// Like [`Self::post_completion`], but also fails with
    /// [`QueueError::CompletionQueueGone`] if `cq_id` was deleted and created
    /// again since `generation` was observed.
    pub fn post_completion_to(
        &self,
        cq_id: u16,
        generation: u64,
        command_id: u16,
        sq_id: u16,
        result: &CommandResult,
    ) -> Result<(), QueueError> {
        self.post(cq_id, Some(generation), command_id, sq_id, result)
    }

    fn post(
        &self,
        cq_id: u16,
        generation: Option<u64>,
        command_id: u16,
        sq_id: u16,
        result: &CommandResult,
    ) -> Result<(), QueueError> {
        let sqhd = self
            .sqs
            .get(sq_id as usize)
            .and_then(|sq| sq.lock().as_ref().map(|sq| sq.head as u16))
            .unwrap_or(0);

        let mut slot = self
            .cqs
            .get(cq_id as usize)
            .ok_or(QueueError::CompletionQueueGone(cq_id))?
            .lock();
        let cq = slot
            .as_mut()
            .filter(|cq| {
                cq.state == QueueState::Active
                    && generation.is_none_or(|generation| generation == cq.generation)
            })
            .ok_or(QueueError::CompletionQueueGone(cq_id))?;

        let next_tail = advance(cq.tail, cq.depth);
        if next_tail == cq.head {
            // The dispatcher may not have observed the latest head yet.
            let head = self.doorbells.read(Doorbells::cq_head_index(cq_id));
            if head < cq.depth {
                cq.head = head;
            }
            if next_tail == cq.head {
                return Err(QueueError::CompletionQueueFull(cq_id));
            }
        }

        let completion = spec::Completion {
            dw0: result.dw[0],
            dw1: result.dw[1],
            sqhd,
            sqid: sq_id,
            cid: command_id,
            status: result.completion_status().with_phase(cq.phase),
        };
        self.mem
            .write_plain(cq.base.wrapping_add(cq.tail as u64 * CQ_ENTRY_SIZE), &completion)
            .map_err(QueueError::Memory)?;
        cq.tail = next_tail;
        if cq.tail == 0 {
            cq.phase = !cq.phase;
        }
        if cq.irq_enabled {
            cq.interrupt_pending = true;
        }
        Ok(())
    }

    /// Signals the interrupt for `cq_id` if completions were posted since the
    /// last call.
    pub fn flush_interrupt(&self, cq_id: u16) {
        let vector = {
            let Some(cq) = self.cqs.get(cq_id as usize) else {
                return;
            };
            let mut cq = cq.lock();
            match cq.as_mut() {
                Some(cq) if cq.interrupt_pending => {
                    cq.interrupt_pending = false;
                    cq.irq_vector
                }
                _ => return,
            }
        };
        self.interrupts.signal(cq_id, vector);
    }

    /// Records that a command from `sq_id` was handed to an I/O worker.
    pub fn admit(&self, sq_id: u16) {
        if let Some(sq) = self.sqs[sq_id as usize].lock().as_mut() {
            sq.stats.nr_in_flight += 1;
            sq.stats.max_nr_in_flight = sq.stats.max_nr_in_flight.max(sq.stats.nr_in_flight);
            sq.stats.total_io += 1;
        }
    }

    /// Records that an I/O worker finished a command from `sq_id`, removing
    /// the queue if it was waiting to drain.
    pub fn retire(&self, sq_id: u16) {
        let mut slot = self.sqs[sq_id as usize].lock();
        if let Some(sq) = slot.as_mut() {
            assert!(sq.stats.nr_in_flight > 0, "retired more commands than admitted");
            sq.stats.nr_in_flight -= 1;
            if sq.delete_requested && sq.stats.nr_in_flight == 0 {
                *slot = None;
                tracing::debug!(sqid = sq_id, "drained submission queue deleted");
            }
        }
    }
}

/// The commands made visible by one doorbell update. Single use.
pub struct CommandFetch<'a> {
    queues: &'a QueueManager,
    sq_id: u16,
}

impl CommandFetch<'_> {
    /// Returns the command at the head of the queue without consuming it.
    pub fn peek(&self) -> Option<FetchedCommand> {
        self.read_head(false)
    }

    fn read_head(&self, consume: bool) -> Option<FetchedCommand> {
        let mut slot = self.queues.sqs[self.sq_id as usize].lock();
        let sq = slot.as_mut()?;
        if sq.state != QueueState::Active || sq.head == sq.tail {
            return None;
        }
        let command = match self
            .queues
            .mem
            .read_plain::<spec::Command>(sq.base.wrapping_add(sq.head as u64 * SQ_ENTRY_SIZE))
        {
            Ok(command) => command,
            Err(err) => {
                sq.state = QueueState::Draining;
                let err = QueueError::Protocol {
                    qid: self.sq_id,
                    err: ProtocolError::Memory(err),
                };
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    sqid = self.sq_id,
                    "submission queue out of service"
                );
                return None;
            }
        };
        let sq_entry = sq.head as u16;
        if consume {
            sq.head = advance(sq.head, sq.depth);
            sq.stats.nr_dispatched += 1;
        }
        Some(FetchedCommand {
            command,
            cqid: sq.cqid,
            cq_generation: sq.cq_generation,
            sq_entry,
        })
    }
}

impl Iterator for CommandFetch<'_> {
    type Item = FetchedCommand;

    fn next(&mut self) -> Option<FetchedCommand> {
        self.read_head(true)
    }
}

fn advance(n: u32, l: u32) -> u32 {
    if n + 1 < l {
        n + 1
    } else {
        0
    }
}
