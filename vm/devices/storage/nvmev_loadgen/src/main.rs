// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Drives a threaded nvmev controller with random reads and writes and
//! reports the observed completion latencies.

use anyhow::bail;
use anyhow::Context;
use clap::Parser;
use nvmev::config::NvmevConfig;
use nvmev::driver;
use nvmev::driver::HostQueuePair;
use nvmev::namespace::RamNamespace;
use nvmev::spec;
use nvmev::HostMemory;
use nvmev::NvmeControllerBuilder;
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const PAGE_SIZE: u64 = 4096;
const BLOCK_SHIFT: u32 = 12;
const ADMIN_DEPTH: u32 = 16;
const ASQ: u64 = 0;
const ACQ: u64 = PAGE_SIZE;
const FIRST_QUEUE_REGION: u64 = 4 * PAGE_SIZE;
const NSID: u32 = 1;
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Generates random I/O against an emulated NVMe controller.
#[derive(Parser)]
struct Options {
    /// TOML controller configuration. Defaults apply to anything omitted.
    #[clap(long)]
    config: Option<PathBuf>,
    /// Overrides the number of I/O workers.
    #[clap(long)]
    workers: Option<usize>,
    /// Number of I/O queue pairs.
    #[clap(long, default_value_t = 2)]
    queues: u16,
    /// Entries in each submission and completion queue.
    #[clap(long, default_value_t = 32)]
    depth: u32,
    /// Commands to issue per queue.
    #[clap(long, default_value_t = 10_000)]
    ios: u64,
    /// Bytes per command, a multiple of 4096.
    #[clap(long, default_value_t = 4096)]
    io_size: u64,
    /// Percentage of commands that are reads.
    #[clap(long, default_value_t = 50)]
    read_percent: u8,
    /// Namespace size in MiB.
    #[clap(long, default_value_t = 64)]
    namespace_mb: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("NVMEV_LOG")
                .from_env_lossy(),
        )
        .init();

    let opts = Options::parse();
    let mut config = match &opts.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            NvmevConfig::from_toml(&text)
                .with_context(|| format!("invalid configuration in {}", path.display()))?
        }
        None => NvmevConfig::default(),
    };
    if let Some(workers) = opts.workers {
        config.controller.nr_io_workers = workers;
    }
    check_options(&opts, &config)?;
    run(&opts, config)
}

fn check_options(opts: &Options, config: &NvmevConfig) -> anyhow::Result<()> {
    if opts.io_size == 0 || opts.io_size % PAGE_SIZE != 0 {
        bail!("io size {} is not a multiple of {PAGE_SIZE}", opts.io_size);
    }
    if opts.io_size > config.max_transfer_size() as u64 {
        bail!(
            "io size {} exceeds the maximum transfer size {}",
            opts.io_size,
            config.max_transfer_size()
        );
    }
    if opts.queues == 0 || opts.queues > config.controller.max_io_queues {
        bail!(
            "queue count must be between 1 and {}",
            config.controller.max_io_queues
        );
    }
    if opts.depth < 2 {
        bail!("queue depth must be at least 2");
    }
    if opts.read_percent > 100 {
        bail!("read percentage {} is over 100", opts.read_percent);
    }
    if opts.namespace_mb << 20 < opts.io_size {
        bail!("namespace is smaller than one command");
    }
    Ok(())
}

/// Host memory for one queue pair: its two rings followed by one data
/// buffer and PRP list page per outstanding command.
struct QueueLayout {
    sq: u64,
    cq: u64,
    data: u64,
    slot_size: u64,
}

impl QueueLayout {
    fn new(base: u64, depth: u32, io_size: u64) -> Self {
        let sq_bytes = (depth as u64 * 64).next_multiple_of(PAGE_SIZE);
        let cq_bytes = (depth as u64 * 16).next_multiple_of(PAGE_SIZE);
        Self {
            sq: base,
            cq: base + sq_bytes,
            data: base + sq_bytes + cq_bytes,
            slot_size: io_size + PAGE_SIZE,
        }
    }

    fn slot(&self, index: usize) -> (u64, u64) {
        let addr = self.data + index as u64 * self.slot_size;
        (addr, addr + self.slot_size - PAGE_SIZE)
    }

    fn end(&self, depth: u32) -> u64 {
        self.data + depth as u64 * self.slot_size
    }
}

struct Queue {
    pair: HostQueuePair,
    layout: QueueLayout,
    free_slots: Vec<usize>,
    outstanding: HashMap<u16, (Instant, usize)>,
    submitted: u64,
}

#[derive(Default)]
struct Results {
    latencies: Vec<Duration>,
    errors: u64,
}

fn run(opts: &Options, config: NvmevConfig) -> anyhow::Result<()> {
    let mut layouts = Vec::new();
    let mut end = FIRST_QUEUE_REGION;
    for _ in 0..opts.queues {
        let layout = QueueLayout::new(end, opts.depth, opts.io_size);
        end = layout.end(opts.depth);
        layouts.push(layout);
    }
    let mem = HostMemory::allocate(end as usize);

    let size_lbas = (opts.namespace_mb << 20) >> BLOCK_SHIFT;
    let mut builder = NvmeControllerBuilder::new(config, mem.clone());
    builder.add_namespace(NSID, Arc::new(RamNamespace::new(size_lbas, BLOCK_SHIFT)))?;
    let controller = builder.build().context("failed to build controller")?;
    controller
        .enable(ASQ, ADMIN_DEPTH, ACQ, ADMIN_DEPTH)
        .context("failed to enable controller")?;
    let running = controller.start().context("failed to start controller")?;

    let mut admin = HostQueuePair::new(
        mem.clone(),
        running.doorbells(),
        0,
        ASQ,
        ADMIN_DEPTH,
        ACQ,
        ADMIN_DEPTH,
    );
    let mut queues = Vec::new();
    for (qid, layout) in (1..).zip(layouts) {
        admin_command(
            &mut admin,
            driver::create_io_completion_queue(qid, layout.cq, opts.depth, None),
        )
        .with_context(|| format!("failed to create completion queue {qid}"))?;
        admin_command(
            &mut admin,
            driver::create_io_submission_queue(qid, qid, layout.sq, opts.depth),
        )
        .with_context(|| format!("failed to create submission queue {qid}"))?;
        queues.push(Queue {
            pair: HostQueuePair::new(
                mem.clone(),
                running.doorbells(),
                qid,
                layout.sq,
                opts.depth,
                layout.cq,
                opts.depth,
            ),
            free_slots: (0..opts.depth as usize - 1).collect(),
            layout,
            outstanding: HashMap::new(),
            submitted: 0,
        });
    }
    tracing::info!(queues = opts.queues, depth = opts.depth, "queues created");

    let start = Instant::now();
    let results = drive(opts, &mem, size_lbas, &mut queues)?;
    let elapsed = start.elapsed();
    let stats = running.stats();
    let sq_stats = (1..=opts.queues)
        .filter_map(|qid| Some((qid, running.sq_stats(qid)?)))
        .collect::<Vec<_>>();
    running.shutdown();

    report(opts, results, elapsed);
    println!(
        "controller: reads {} writes {} read bytes {} written bytes {} admission retries {}",
        stats.read_commands,
        stats.write_commands,
        stats.bytes_read,
        stats.bytes_written,
        stats.admission_retries
    );
    for (qid, sq) in sq_stats {
        println!(
            "sq {qid}: dispatched {} max in flight {}",
            sq.nr_dispatched, sq.max_nr_in_flight
        );
    }
    Ok(())
}

fn admin_command(admin: &mut HostQueuePair, command: spec::Command) -> anyhow::Result<()> {
    admin.submit(command)?;
    let deadline = Instant::now() + STALL_TIMEOUT;
    loop {
        if let Some(completion) = admin.poll_completion()? {
            let status = driver::completion_status(&completion);
            if status != spec::Status::SUCCESS {
                bail!("admin command failed with status {:#x}", status.0);
            }
            return Ok(());
        }
        if Instant::now() > deadline {
            bail!("admin command timed out");
        }
        std::thread::yield_now();
    }
}

fn drive(
    opts: &Options,
    mem: &HostMemory,
    size_lbas: u64,
    queues: &mut [Queue],
) -> anyhow::Result<Results> {
    let mut rng = rand::thread_rng();
    let blocks = (opts.io_size >> BLOCK_SHIFT) as u32;
    let total = opts.ios * queues.len() as u64;
    let mut results = Results::default();
    let mut last_progress = Instant::now();

    while (results.latencies.len() as u64) < total {
        let mut progress = false;
        for queue in queues.iter_mut() {
            let mut pushed = false;
            while queue.submitted < opts.ios {
                let Some(slot) = queue.free_slots.pop() else {
                    break;
                };
                let (addr, list) = queue.layout.slot(slot);
                let prp = driver::build_prp(mem, addr, opts.io_size as usize, list)?;
                let lba = rng.gen_range(0..=size_lbas - blocks as u64);
                let command = if rng.gen_range(0..100) < opts.read_percent {
                    driver::read(NSID, lba, blocks, prp)
                } else {
                    driver::write(NSID, lba, blocks, prp)
                };
                let cid = queue.pair.push(command)?;
                queue.outstanding.insert(cid, (Instant::now(), slot));
                queue.submitted += 1;
                pushed = true;
            }
            if pushed {
                queue.pair.ring();
            }

            while let Some(completion) = queue.pair.poll_completion()? {
                let Some((issued, slot)) = queue.outstanding.remove(&completion.cid) else {
                    bail!(
                        "unexpected completion for command {} on queue {}",
                        completion.cid,
                        queue.pair.qid()
                    );
                };
                let status = driver::completion_status(&completion);
                if status != spec::Status::SUCCESS {
                    tracing::warn!(
                        qid = queue.pair.qid(),
                        cid = completion.cid,
                        status = status.0,
                        "command failed"
                    );
                    results.errors += 1;
                }
                results.latencies.push(issued.elapsed());
                queue.free_slots.push(slot);
                progress = true;
            }
        }

        if progress {
            last_progress = Instant::now();
        } else if last_progress.elapsed() > STALL_TIMEOUT {
            bail!(
                "no completions for {:?} with {} of {total} done",
                STALL_TIMEOUT,
                results.latencies.len()
            );
        } else {
            std::thread::yield_now();
        }
    }
    Ok(results)
}

fn report(opts: &Options, mut results: Results, elapsed: Duration) {
    results.latencies.sort_unstable();
    let n = results.latencies.len();
    if n == 0 {
        println!("no commands issued");
        return;
    }
    let percentile = |p: usize| results.latencies[(n * p / 100).min(n - 1)];
    let total: Duration = results.latencies.iter().sum();
    let secs = elapsed.as_secs_f64();
    println!(
        "{n} commands ({} failed) in {secs:.3}s: {:.0} IOPS, {:.1} MiB/s",
        results.errors,
        n as f64 / secs,
        (n as u64 * opts.io_size) as f64 / secs / (1 << 20) as f64
    );
    println!(
        "latency: avg {:?} p50 {:?} p99 {:?} max {:?}",
        total / n as u32,
        percentile(50),
        percentile(99),
        results.latencies[n - 1]
    );
}
