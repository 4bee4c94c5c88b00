// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The dispatcher, inline admin command handling, and I/O workers.

mod admin;
mod dispatcher;
mod io;

pub use admin::NsidConflict;
pub(crate) use dispatcher::Dispatcher;
pub(crate) use io::IoWorker;
pub(crate) use io::WorkerHandle;

use crate::config::ControllerConfig;
use crate::error::CommandResult;
use crate::queue::QueueError;
use crate::queue::QueueManager;
use crate::timing::IoKind;
use crate::timing::IoProfile;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

/// Controller-wide command counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub read_commands: AtomicU64,
    pub write_commands: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub admission_retries: AtomicU64,
    pub dropped_completions: AtomicU64,
    pub aborted: AtomicU64,
}

impl Counters {
    fn record(&self, io: IoProfile) {
        let (commands, bytes) = match io.kind {
            IoKind::Read => (&self.read_commands, &self.bytes_read),
            IoKind::Write => (&self.write_commands, &self.bytes_written),
            IoKind::Other => return,
        };
        commands.fetch_add(1, Ordering::Relaxed);
        bytes.fetch_add(io.len, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A completion waiting for room in its completion queue.
#[derive(Debug)]
pub(crate) struct HeldCompletion {
    pub cqid: u16,
    pub cq_generation: u64,
    pub sqid: u16,
    pub cid: u16,
    pub result: CommandResult,
}

/// Completions that found their queue full, in the order they were
/// produced.
#[derive(Debug, Default)]
pub(crate) struct HeldCompletions {
    entries: VecDeque<HeldCompletion>,
}

impl HeldCompletions {
    pub fn hold(&mut self, completion: HeldCompletion) {
        tracing::trace!(
            cqid = completion.cqid,
            cid = completion.cid,
            "completion queue full, holding completion"
        );
        self.entries.push_back(completion);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn holds_for(&self, cqid: u16) -> bool {
        self.entries.iter().any(|held| held.cqid == cqid)
    }

    /// Posts held completions in order. Queues that are still full keep
    /// their completions without holding up other queues. Returns whether
    /// any completion left the list.
    pub fn flush(
        &mut self,
        queues: &QueueManager,
        counters: &Counters,
        touched: &mut Vec<u16>,
    ) -> bool {
        let mut full = Vec::new();
        let mut progress = false;
        self.entries.retain(|held| {
            if full.contains(&held.cqid) {
                return true;
            }
            match queues.post_completion_to(
                held.cqid,
                held.cq_generation,
                held.cid,
                held.sqid,
                &held.result,
            ) {
                Ok(()) => {
                    if !touched.contains(&held.cqid) {
                        touched.push(held.cqid);
                    }
                }
                Err(QueueError::CompletionQueueFull(cqid)) => {
                    full.push(cqid);
                    return true;
                }
                Err(err) => {
                    Counters::bump(&counters.dropped_completions);
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        sqid = held.sqid,
                        cqid = held.cqid,
                        cid = held.cid,
                        "dropped completion"
                    );
                }
            }
            progress = true;
            false
        });
        progress
    }
}

/// When a polling thread may start sleeping between polls.
#[derive(Debug, Copy, Clone)]
pub(crate) struct IdlePolicy {
    timeout: Duration,
    sleep: Duration,
}

impl IdlePolicy {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.idle_timeout_ms),
            sleep: Duration::from_micros(config.idle_sleep_us),
        }
    }
}

/// Calls `poll` until `stop` is set. Yields between polls while there is
/// work, and calls `sleep` once nothing has happened for the idle timeout.
///
/// `poll` returns whether it made progress and whether work is still
/// outstanding.
pub(crate) fn poll_loop<S>(
    stop: &AtomicBool,
    idle: IdlePolicy,
    state: &mut S,
    mut poll: impl FnMut(&mut S) -> (bool, bool),
    mut sleep: impl FnMut(&mut S, Duration),
) {
    let mut last_busy = Instant::now();
    while !stop.load(Ordering::Acquire) {
        let (progress, outstanding) = poll(state);
        if progress {
            last_busy = Instant::now();
        }
        if progress || outstanding || last_busy.elapsed() < idle.timeout {
            std::thread::yield_now();
        } else {
            sleep(state, idle.sleep);
        }
    }
}
