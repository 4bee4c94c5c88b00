// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The dispatcher: watches doorbells, fetches commands, runs admin commands
//! inline, and hands I/O commands to the I/O workers.

use super::admin::AdminHandler;
use super::io::SlotReservation;
use super::io::WorkerHandle;
use super::poll_loop;
use super::Counters;
use super::HeldCompletion;
use super::HeldCompletions;
use super::IdlePolicy;
use crate::buffer::ReleasableBuffer;
use crate::config::Placement;
use crate::controller::ControllerContext;
use crate::error::CommandResult;
use crate::error::NvmeError;
use crate::namespace::CommandContext;
use crate::namespace::Namespace;
use crate::pool::Request;
use crate::queue::CommandFetch;
use crate::queue::Doorbells;
use crate::queue::FetchedCommand;
use crate::queue::QueueError;
use crate::spec;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub(crate) struct Dispatcher {
    ctx: Arc<ControllerContext>,
    admin: AdminHandler,
    /// The last value seen in each doorbell register.
    old_dbs: Vec<u32>,
    /// Next worker for round-robin placement.
    turn: usize,
    /// Set when a command could not be admitted and is waiting for a slot,
    /// or a completion is waiting for room in its queue.
    backlog: bool,
    held: HeldCompletions,
    touched: Vec<u16>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self {
            admin: AdminHandler::new(ctx.clone()),
            old_dbs: vec![0; ctx.queues.doorbells().len()],
            turn: 0,
            backlog: false,
            held: HeldCompletions::default(),
            touched: Vec::new(),
            ctx,
        }
    }

    /// Runs until `stop` is set. Once idle, waits for doorbell writes instead
    /// of spinning.
    pub fn run(mut self, stop: &AtomicBool, idle: IdlePolicy) {
        tracing::debug!("dispatcher starting");
        let doorbells = self.ctx.queues.doorbells().clone();
        poll_loop(
            stop,
            idle,
            &mut self,
            |dispatcher| (dispatcher.poll(), dispatcher.backlog),
            |dispatcher, timeout| doorbells.wait(timeout, || dispatcher.doorbells_changed()),
        );
        tracing::debug!("dispatcher stopped");
    }

    fn doorbells_changed(&self) -> bool {
        let doorbells = self.ctx.queues.doorbells();
        self.old_dbs
            .iter()
            .enumerate()
            .any(|(i, &old)| doorbells.read(i) != old)
    }

    /// Performs one pass over every doorbell. Returns whether anything
    /// happened.
    pub fn poll(&mut self) -> bool {
        let ctx = self.ctx.clone();
        let max = ctx.queues.max_io_queues();
        self.backlog = false;

        // Completion queue heads first, so completions held back by a full
        // queue can go out in this pass.
        let mut progress = false;
        for qid in 0..=max {
            let index = Doorbells::cq_head_index(qid);
            let head = ctx.queues.doorbells().read(index);
            if head == self.old_dbs[index] {
                continue;
            }
            self.old_dbs[index] = head;
            progress = true;
            if let Err(err) = ctx.queues.update_cq_head(qid, head) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    cqid = qid,
                    head,
                    "invalid completion queue head doorbell"
                );
            }
        }
        progress |= self
            .held
            .flush(&ctx.queues, &ctx.counters, &mut self.touched);

        progress |= self.poll_admin(&ctx);
        for qid in 1..=max {
            progress |= self.poll_io_queue(&ctx, qid);
        }

        for cqid in self.touched.drain(..) {
            ctx.queues.flush_interrupt(cqid);
        }
        self.backlog |= !self.held.is_empty();
        progress
    }

    /// Returns the commands newly visible in submission queue `qid`, if the
    /// tail moved or earlier commands are still waiting.
    fn fetch<'a>(&mut self, ctx: &'a ControllerContext, qid: u16) -> Option<CommandFetch<'a>> {
        let index = Doorbells::sq_tail_index(qid);
        let tail = ctx.queues.doorbells().read(index);
        let changed = tail != self.old_dbs[index];
        if !changed && !ctx.queues.has_pending(qid) {
            return None;
        }
        self.old_dbs[index] = tail;
        match ctx.queues.fetch_new_commands(qid, tail) {
            Ok(fetch) => Some(fetch),
            Err(err @ QueueError::Protocol { .. }) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    sqid = qid,
                    tail,
                    "submission queue out of service"
                );
                None
            }
            Err(err) => {
                // Only complain about each bad doorbell write once.
                if changed {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        sqid = qid,
                        tail,
                        "invalid submission queue doorbell"
                    );
                }
                None
            }
        }
    }

    fn poll_admin(&mut self, ctx: &ControllerContext) -> bool {
        // New admin commands wait until earlier admin completions are out.
        if self.held.holds_for(0) {
            return false;
        }
        let Some(fetch) = self.fetch(ctx, 0) else {
            return false;
        };
        let mut progress = false;
        for fetched in fetch {
            progress = true;
            if let Some(result) = self.admin.handle(&fetched.command) {
                self.complete_now(ctx, 0, &fetched, result);
            }
            for index in self.admin.take_doorbell_resets() {
                self.old_dbs[index] = 0;
            }
        }
        progress
    }

    fn poll_io_queue(&mut self, ctx: &ControllerContext, qid: u16) -> bool {
        let Some(mut fetch) = self.fetch(ctx, qid) else {
            return false;
        };
        let mut progress = false;
        while let Some(peeked) = fetch.peek() {
            // Commands that cannot run complete without taking a slot.
            let ns = match resolve(ctx, qid, &peeked) {
                Ok(ns) => ns,
                Err(err) => {
                    let Some(fetched) = fetch.next() else {
                        break;
                    };
                    progress = true;
                    self.complete_now(ctx, qid, &fetched, err.into());
                    continue;
                }
            };

            let index = self.select_worker(ctx, qid);
            let worker = &ctx.workers[index];
            let reservation = match worker.try_reserve() {
                Ok(reservation) => reservation,
                Err(err) => {
                    // Leave the command in the queue and retry next pass.
                    Counters::bump(&ctx.counters.admission_retries);
                    tracing::trace!(
                        error = &err as &dyn std::error::Error,
                        sqid = qid,
                        "admission deferred"
                    );
                    self.backlog = true;
                    break;
                }
            };
            let Some(fetched) = fetch.next() else {
                break;
            };
            progress = true;
            if self.dispatch_io(ctx, qid, fetched, ns, worker, reservation) {
                self.turn = (index + 1) % ctx.workers.len();
            }
        }
        progress
    }

    fn select_worker(&self, ctx: &ControllerContext, sqid: u16) -> usize {
        let n = ctx.workers.len();
        match ctx.config.controller.placement {
            Placement::PerSq => (sqid as usize - 1) % n,
            Placement::Grouped { sqs_per_worker } => {
                ((sqid as usize - 1) / sqs_per_worker as usize) % n
            }
            Placement::RoundRobin => self.turn,
        }
    }

    /// Executes a validated command and schedules it on `worker`. Returns
    /// whether the worker received it.
    fn dispatch_io(
        &mut self,
        ctx: &ControllerContext,
        sqid: u16,
        fetched: FetchedCommand,
        ns: &Namespace,
        worker: &WorkerHandle,
        reservation: SlotReservation<'_>,
    ) -> bool {
        let command = &fetched.command;
        let cid = command.cdw0.cid();
        let nsid = command.nsid;
        let now = ctx.clock.now_ns();

        let execution = match ns.processor.execute(&command_context(ctx), command) {
            Ok(execution) => execution,
            Err(err) => {
                log_failure(&err, sqid, command);
                drop(reservation);
                self.complete_now(ctx, sqid, &fetched, err.into());
                return false;
            }
        };

        let target = ctx
            .timing
            .target(now, worker.latest(), execution.io, execution.hint_ns);
        worker.set_latest(target);
        ctx.counters.record(execution.io);
        tracing::trace!(
            sqid,
            cid,
            nsid,
            worker = worker.id(),
            start = now,
            target,
            "dispatched"
        );

        ctx.queues.admit(sqid);
        reservation.submit(Request {
            sqid,
            cqid: fetched.cqid,
            cq_generation: fetched.cq_generation,
            sq_entry: fetched.sq_entry,
            command_id: cid,
            nsecs_start: now,
            nsecs_target: target,
            result: execution.result,
            transfer: execution.transfer,
            ..Default::default()
        });

        if let Some(internal) = execution.internal {
            self.schedule_internal_operation(
                ctx,
                worker,
                sqid,
                target.saturating_add(internal.delay_ns),
                internal.buffer,
            );
        }
        true
    }

    /// Places device work that no host command waits for on `worker`. The
    /// buffer is released when the work completes.
    fn schedule_internal_operation(
        &self,
        ctx: &ControllerContext,
        worker: &WorkerHandle,
        sqid: u16,
        target: u64,
        buffer: Box<dyn ReleasableBuffer>,
    ) {
        match worker.try_reserve() {
            Ok(reservation) => reservation.submit(Request {
                sqid,
                nsecs_start: ctx.clock.now_ns(),
                nsecs_target: target,
                is_internal: true,
                is_copied: true,
                buffer: Some(buffer),
                ..Default::default()
            }),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    sqid,
                    "no slot for internal operation, releasing its buffer early"
                );
                buffer.release();
            }
        }
    }

    /// Completes a command without scheduling it. If its completion queue is
    /// full, the completion is held until the host makes room.
    fn complete_now(
        &mut self,
        ctx: &ControllerContext,
        sqid: u16,
        fetched: &FetchedCommand,
        result: CommandResult,
    ) {
        let held = HeldCompletion {
            cqid: fetched.cqid,
            cq_generation: fetched.cq_generation,
            sqid,
            cid: fetched.command.cdw0.cid(),
            result,
        };
        if self.held.holds_for(held.cqid) {
            self.held.hold(held);
            return;
        }
        match ctx.queues.post_completion_to(
            held.cqid,
            held.cq_generation,
            held.cid,
            held.sqid,
            &held.result,
        ) {
            Ok(()) => {
                if !self.touched.contains(&held.cqid) {
                    self.touched.push(held.cqid);
                }
            }
            Err(QueueError::CompletionQueueFull(_)) => self.held.hold(held),
            Err(err) => {
                Counters::bump(&ctx.counters.dropped_completions);
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    sqid,
                    cid = held.cid,
                    "dropped completion"
                );
            }
        }
    }
}

fn command_context(ctx: &ControllerContext) -> CommandContext<'_> {
    CommandContext {
        mem: &ctx.mem,
        max_transfer_size: ctx.config.max_transfer_size(),
    }
}

/// Finds the command's namespace and checks the command's fields.
fn resolve<'a>(
    ctx: &'a ControllerContext,
    sqid: u16,
    fetched: &FetchedCommand,
) -> Result<&'a Namespace, NvmeError> {
    let command = &fetched.command;
    let nsid = command.nsid;
    let Some(ns) = ctx.namespaces.get(&nsid) else {
        tracing::warn!(
            nsid,
            sqid,
            cid = command.cdw0.cid(),
            "unknown namespace id"
        );
        return Err(spec::Status::INVALID_NAMESPACE_OR_FORMAT.into());
    };
    ns.processor
        .validate(&command_context(ctx), command)
        .inspect_err(|err| log_failure(err, sqid, command))?;
    Ok(ns)
}

fn log_failure(err: &NvmeError, sqid: u16, command: &spec::Command) {
    tracing::debug!(
        error = err as &dyn std::error::Error,
        sqid,
        cid = command.cdw0.cid(),
        nsid = command.nsid,
        opcode = command.cdw0.opcode(),
        "command failed"
    );
}
