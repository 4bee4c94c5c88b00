// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The controller context, its construction, and its threads.

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::config::ConfigError;
use crate::config::NvmevConfig;
use crate::memory::HostMemory;
use crate::namespace::CommandProcessor;
use crate::namespace::Namespace;
use crate::queue::Doorbells;
use crate::queue::InterruptTarget;
use crate::queue::NoInterrupts;
use crate::queue::QueueError;
use crate::queue::QueueManager;
use crate::queue::SqStats;
use crate::timing::TimingModel;
use crate::workers::Counters;
use crate::workers::Dispatcher;
use crate::workers::IdlePolicy;
use crate::workers::IoWorker;
use crate::workers::NsidConflict;
use crate::workers::WorkerHandle;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

/// State shared by the dispatcher and every I/O worker, built once and
/// immutable apart from its interior locks and counters.
pub(crate) struct ControllerContext {
    pub config: NvmevConfig,
    pub clock: Arc<dyn Clock>,
    pub timing: TimingModel,
    pub mem: HostMemory,
    pub queues: QueueManager,
    pub namespaces: BTreeMap<u32, Namespace>,
    pub workers: Vec<Arc<WorkerHandle>>,
    pub counters: Counters,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("namespace id {0:#x} is reserved")]
    InvalidNsid(u32),
}

/// Collects what a controller needs before it can be built.
pub struct NvmeControllerBuilder {
    config: NvmevConfig,
    mem: HostMemory,
    clock: Arc<dyn Clock>,
    interrupts: Arc<dyn InterruptTarget>,
    namespaces: BTreeMap<u32, Namespace>,
}

impl NvmeControllerBuilder {
    pub fn new(config: NvmevConfig, mem: HostMemory) -> Self {
        Self {
            config,
            mem,
            clock: Arc::new(SystemClock::new()),
            interrupts: Arc::new(NoInterrupts),
            namespaces: BTreeMap::new(),
        }
    }

    /// Replaces the default wall clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn interrupts(mut self, interrupts: Arc<dyn InterruptTarget>) -> Self {
        self.interrupts = interrupts;
        self
    }

    /// Attaches a namespace.
    pub fn add_namespace(
        &mut self,
        nsid: u32,
        processor: Arc<dyn CommandProcessor>,
    ) -> Result<(), NsidConflict> {
        match self.namespaces.entry(nsid) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(Namespace { nsid, processor });
                Ok(())
            }
            btree_map::Entry::Occupied(_) => Err(NsidConflict(nsid)),
        }
    }

    pub fn build(self) -> Result<NvmeController, BuildError> {
        self.config.validate()?;
        if let Some(&nsid) = self
            .namespaces
            .keys()
            .find(|&&nsid| nsid == 0 || nsid >= 0xfffffffe)
        {
            return Err(BuildError::InvalidNsid(nsid));
        }

        let controller = &self.config.controller;
        let doorbells = Arc::new(Doorbells::new(controller.max_io_queues));
        let queues = QueueManager::new(
            self.mem.clone(),
            doorbells,
            self.interrupts,
            controller.max_io_queues,
            controller.max_queue_depth,
        );
        let workers = (0..controller.nr_io_workers)
            .map(|id| Arc::new(WorkerHandle::new(id, controller.worker_capacity)))
            .collect::<Vec<_>>();

        tracing::info!(
            workers = workers.len(),
            namespaces = self.namespaces.len(),
            max_io_queues = controller.max_io_queues,
            "nvme controller built"
        );

        let ctx = Arc::new(ControllerContext {
            timing: TimingModel::new(&self.config.timing),
            clock: self.clock,
            mem: self.mem,
            queues,
            namespaces: self.namespaces,
            workers,
            counters: Counters::default(),
            config: self.config,
        });
        let dispatcher = Dispatcher::new(ctx.clone());
        let workers = ctx
            .workers
            .iter()
            .map(|handle| IoWorker::new(handle.clone(), ctx.clone()))
            .collect();
        Ok(NvmeController {
            ctx,
            dispatcher,
            workers,
        })
    }
}

/// A snapshot of the controller-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub read_commands: u64,
    pub write_commands: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Times a command had to wait in its queue for a free request slot.
    pub admission_retries: u64,
    /// Completions that could not be posted because their queue was gone.
    pub dropped_completions: u64,
    pub aborted: u64,
    /// Request slots in use, per worker.
    pub slots_in_use: Vec<usize>,
}

fn stats(ctx: &ControllerContext) -> ControllerStats {
    let c = &ctx.counters;
    ControllerStats {
        read_commands: c.read_commands.load(Ordering::Relaxed),
        write_commands: c.write_commands.load(Ordering::Relaxed),
        bytes_read: c.bytes_read.load(Ordering::Relaxed),
        bytes_written: c.bytes_written.load(Ordering::Relaxed),
        admission_retries: c.admission_retries.load(Ordering::Relaxed),
        dropped_completions: c.dropped_completions.load(Ordering::Relaxed),
        aborted: c.aborted.load(Ordering::Relaxed),
        slots_in_use: ctx.workers.iter().map(|w| w.reserved()).collect(),
    }
}

/// An emulated NVMe controller, polled by its owner.
///
/// Call [`NvmeController::poll`] to run one dispatcher pass followed by one
/// pass of every I/O worker, or [`NvmeController::start`] to give each of
/// them its own thread.
pub struct NvmeController {
    ctx: Arc<ControllerContext>,
    dispatcher: Dispatcher,
    workers: Vec<IoWorker>,
}

impl NvmeController {
    /// Creates the admin queue pair, as the host does by programming AQA,
    /// ASQ and ACQ and setting CC.EN.
    pub fn enable(
        &self,
        asq: u64,
        asq_depth: u32,
        acq: u64,
        acq_depth: u32,
    ) -> Result<(), QueueError> {
        self.ctx
            .queues
            .create_admin_queues(asq, asq_depth, acq, acq_depth)?;
        tracing::info!(asq_depth, acq_depth, "nvme controller enabled");
        Ok(())
    }

    pub fn doorbells(&self) -> Arc<Doorbells> {
        self.ctx.queues.doorbells().clone()
    }

    pub fn memory(&self) -> &HostMemory {
        &self.ctx.mem
    }

    pub fn config(&self) -> &NvmevConfig {
        &self.ctx.config
    }

    /// Runs one pass of the dispatcher and then of each worker. Returns
    /// whether anything happened.
    pub fn poll(&mut self) -> bool {
        let mut progress = self.dispatcher.poll();
        let now = self.ctx.clock.now_ns();
        for worker in &mut self.workers {
            progress |= worker.poll(now);
        }
        progress
    }

    pub fn stats(&self) -> ControllerStats {
        stats(&self.ctx)
    }

    pub fn sq_stats(&self, qid: u16) -> Option<SqStats> {
        self.ctx.queues.sq_stats(qid)
    }

    /// Moves the dispatcher and every worker onto their own threads.
    pub fn start(self) -> std::io::Result<RunningController> {
        let idle = IdlePolicy::new(&self.ctx.config.controller);
        let mut running = RunningController {
            ctx: self.ctx,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        };

        let stop = running.stop.clone();
        let dispatcher = self.dispatcher;
        running.threads.push(
            std::thread::Builder::new()
                .name("nvmev_dispatcher".into())
                .spawn(move || dispatcher.run(&stop, idle))?,
        );
        for (i, worker) in self.workers.into_iter().enumerate() {
            let stop = running.stop.clone();
            running.threads.push(
                std::thread::Builder::new()
                    .name(format!("nvmev_io_worker_{i}"))
                    .spawn(move || worker.run(&stop, idle))?,
            );
        }
        tracing::info!(threads = running.threads.len(), "nvme controller started");
        Ok(running)
    }
}

/// A controller whose dispatcher and workers run on their own threads.
/// Dropping it stops and joins them.
pub struct RunningController {
    ctx: Arc<ControllerContext>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl RunningController {
    pub fn doorbells(&self) -> Arc<Doorbells> {
        self.ctx.queues.doorbells().clone()
    }

    pub fn memory(&self) -> &HostMemory {
        &self.ctx.mem
    }

    pub fn stats(&self) -> ControllerStats {
        stats(&self.ctx)
    }

    pub fn sq_stats(&self, qid: u16) -> Option<SqStats> {
        self.ctx.queues.sq_stats(qid)
    }

    pub fn shutdown(mut self) {
        self.stop_threads();
    }

    fn stop_threads(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or_default().to_owned();
            if thread.join().is_err() {
                tracing::error!(thread = name, "controller thread panicked");
            }
        }
        tracing::info!("nvme controller stopped");
    }
}

impl Drop for RunningController {
    fn drop(&mut self) {
        self.stop_threads();
    }
}
