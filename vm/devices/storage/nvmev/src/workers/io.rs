// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! I/O worker: holds dispatched requests until their completion time and then
//! posts their completions.

use super::poll_loop;
use super::Counters;
use super::HeldCompletion;
use super::HeldCompletions;
use super::IdlePolicy;
use crate::controller::ControllerContext;
use crate::error::CommandResult;
use crate::pool::Request;
use crate::pool::SlotIndex;
use crate::pool::SlotPool;
use crate::queue::QueueError;
use crate::spec;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// The dispatcher's view of an I/O worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    id: usize,
    incoming: Mutex<VecDeque<WorkerMessage>>,
    /// Slots claimed by requests that are queued or active.
    reserved: AtomicUsize,
    capacity: usize,
    /// The latest completion target handed to this worker.
    latest: AtomicU64,
}

#[derive(Debug, Error)]
#[error("io worker {worker} has no free request slot")]
pub(crate) struct AdmissionError {
    pub worker: usize,
}

#[derive(Debug)]
enum WorkerMessage {
    Submit(Request),
    Abort(AbortRequest),
}

#[derive(Debug)]
pub(crate) struct AbortRequest {
    pub sqid: u16,
    pub cid: u16,
    pub ticket: Arc<AbortTicket>,
}

/// Shared by the copies of one abort command sent to every worker. The last
/// worker to look for the command completes the abort.
#[derive(Debug)]
pub(crate) struct AbortTicket {
    admin_cid: u16,
    cq_generation: u64,
    remaining: AtomicUsize,
    aborted: AtomicBool,
}

impl AbortTicket {
    pub fn new(admin_cid: u16, cq_generation: u64, workers: usize) -> Arc<Self> {
        Arc::new(Self {
            admin_cid,
            cq_generation,
            remaining: AtomicUsize::new(workers),
            aborted: AtomicBool::new(false),
        })
    }
}

/// A claim on one free slot of a worker's pool.
#[must_use]
pub(crate) struct SlotReservation<'a> {
    worker: &'a WorkerHandle,
    submitted: bool,
}

impl SlotReservation<'_> {
    /// Hands the request to the worker. The slot is guaranteed to be free
    /// when the worker picks it up.
    pub fn submit(mut self, request: Request) {
        self.worker
            .incoming
            .lock()
            .push_back(WorkerMessage::Submit(request));
        self.submitted = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.submitted {
            self.worker.unreserve();
        }
    }
}

impl WorkerHandle {
    pub fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            incoming: Mutex::new(VecDeque::new()),
            reserved: AtomicUsize::new(0),
            capacity,
            latest: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Claims a slot, failing if every slot is taken.
    pub fn try_reserve(&self) -> Result<SlotReservation<'_>, AdmissionError> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map_err(|_| AdmissionError { worker: self.id })?;
        Ok(SlotReservation {
            worker: self,
            submitted: false,
        })
    }

    fn unreserve(&self) {
        let prev = self.reserved.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "released more slots than reserved");
    }

    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn latest(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    pub fn set_latest(&self, target: u64) {
        self.latest.fetch_max(target, Ordering::AcqRel);
    }

    pub fn abort(&self, request: AbortRequest) {
        self.incoming
            .lock()
            .push_back(WorkerMessage::Abort(request));
    }
}

pub(crate) struct IoWorker {
    handle: Arc<WorkerHandle>,
    ctx: Arc<ControllerContext>,
    pool: SlotPool,
    eager_copy: bool,
    held: HeldCompletions,
    touched: Vec<u16>,
}

impl IoWorker {
    pub fn new(handle: Arc<WorkerHandle>, ctx: Arc<ControllerContext>) -> Self {
        let pool = SlotPool::new(handle.capacity);
        Self {
            eager_copy: ctx.config.controller.eager_copy,
            handle,
            ctx,
            pool,
            held: HeldCompletions::default(),
            touched: Vec::new(),
        }
    }

    /// Runs until `stop` is set.
    pub fn run(mut self, stop: &AtomicBool, idle: IdlePolicy) {
        tracing::debug!(worker = self.handle.id, "io worker starting");
        poll_loop(
            stop,
            idle,
            &mut self,
            |worker| {
                let progress = worker.poll(worker.ctx.clock.now_ns());
                (
                    progress,
                    worker.pool.active_len() > 0 || !worker.held.is_empty(),
                )
            },
            |_, duration| std::thread::sleep(duration),
        );
        tracing::debug!(
            worker = self.handle.id,
            active = self.pool.active_len(),
            "io worker stopped"
        );
    }

    /// Performs one pass: accepts new requests, copies data, and completes
    /// every request whose target time has passed. Returns whether anything
    /// happened.
    pub fn poll(&mut self, now: u64) -> bool {
        let mut progress = self.drain_incoming(now);
        if self.eager_copy {
            self.copy_pending(now);
        }
        progress |= self.complete_ready(now);
        progress |= self
            .held
            .flush(&self.ctx.queues, &self.ctx.counters, &mut self.touched);
        for cqid in self.touched.drain(..) {
            self.ctx.queues.flush_interrupt(cqid);
        }
        progress
    }

    fn drain_incoming(&mut self, now: u64) -> bool {
        let messages = std::mem::take(&mut *self.handle.incoming.lock());
        let progress = !messages.is_empty();
        for message in messages {
            match message {
                WorkerMessage::Submit(mut request) => {
                    request.nsecs_enqueue = now;
                    if self.pool.admit(request).is_err() {
                        panic!(
                            "io worker {} admitted a request without a free slot",
                            self.handle.id
                        );
                    }
                }
                WorkerMessage::Abort(abort) => self.abort(abort, now),
            }
        }
        progress
    }

    /// Completes the target command early, unless its data has already
    /// moved.
    fn abort(&mut self, abort: AbortRequest, now: u64) {
        if let Some(idx) = self.pool.find_active(abort.sqid, abort.cid) {
            if !self.pool.get(idx).is_copied {
                let mut request = self.pool.retire(idx);
                request.nsecs_target = now;
                request.result = spec::Status::COMMAND_ABORT_REQUESTED.into();
                request.transfer = None;
                request.is_copied = true;
                if self.pool.admit(request).is_err() {
                    panic!("slot vanished while requeueing an aborted request");
                }
                abort.ticket.aborted.store(true, Ordering::Release);
                Counters::bump(&self.ctx.counters.aborted);
                tracing::debug!(sqid = abort.sqid, cid = abort.cid, "aborted command");
            }
        }

        if abort.ticket.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let aborted = abort.ticket.aborted.load(Ordering::Acquire);
            // Bit 0 of dword 0 is set when the command was not aborted.
            let result = CommandResult::new(spec::Status::SUCCESS, [(!aborted) as u32, 0]);
            // Posted after this pass's completions, including the aborted
            // command's own.
            self.held.hold(HeldCompletion {
                cqid: 0,
                cq_generation: abort.ticket.cq_generation,
                sqid: 0,
                cid: abort.ticket.admin_cid,
                result,
            });
        }
    }

    /// Moves data for a request. A fault fails the command instead of the
    /// worker.
    fn copy(&mut self, idx: SlotIndex, now: u64) {
        let request = self.pool.get_mut(idx);
        if request.is_copied {
            return;
        }
        request.nsecs_copy_start = now;
        if let Some(transfer) = request.transfer.take() {
            if let Err(err) = transfer(&self.ctx.mem) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    sqid = request.sqid,
                    cid = request.command_id,
                    "data transfer failed"
                );
                request.result = err.into();
            }
        }
        request.is_copied = true;
        request.nsecs_copy_done = now;
    }

    fn copy_pending(&mut self, now: u64) {
        let mut next = self.pool.head();
        while let Some(idx) = next {
            self.copy(idx, now);
            next = self.pool.next(idx);
        }
    }

    /// Completes every request whose target has passed. A request whose
    /// completion queue is full keeps its slot, and later requests for other
    /// queues still complete.
    fn complete_ready(&mut self, now: u64) -> bool {
        let mut progress = false;
        let mut full = Vec::new();
        let mut next = self.pool.head();
        while let Some(idx) = next {
            let request = self.pool.get(idx);
            if request.nsecs_target > now {
                break;
            }
            next = self.pool.next(idx);
            if request.is_internal {
                let request = self.pool.retire(idx);
                self.release(request);
                progress = true;
                continue;
            }
            if full.contains(&request.cqid) {
                continue;
            }

            self.copy(idx, now);
            let request = self.pool.get_mut(idx);
            match self.ctx.queues.post_completion_to(
                request.cqid,
                request.cq_generation,
                request.command_id,
                request.sqid,
                &request.result,
            ) {
                Ok(()) => {
                    request.nsecs_cq_filled = now;
                    request.is_completed = true;
                    if !self.touched.contains(&request.cqid) {
                        self.touched.push(request.cqid);
                    }
                }
                Err(QueueError::CompletionQueueFull(cqid)) => {
                    // Try again once the host frees entries.
                    tracing::trace!(cqid, "completion queue full");
                    full.push(cqid);
                    continue;
                }
                Err(err) => {
                    Counters::bump(&self.ctx.counters.dropped_completions);
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        sqid = request.sqid,
                        cqid = request.cqid,
                        cid = request.command_id,
                        "dropped completion"
                    );
                }
            }

            let request = self.pool.retire(idx);
            self.ctx.queues.retire(request.sqid);
            self.release(request);
            progress = true;
        }
        progress
    }

    fn release(&self, mut request: Request) {
        if let Some(buffer) = request.buffer.take() {
            buffer.release();
        }
        self.handle.unreserve();
    }
}
