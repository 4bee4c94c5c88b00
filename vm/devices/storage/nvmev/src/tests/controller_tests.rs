// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::test_helpers::data_page;
use super::test_helpers::init_tracing;
use super::test_helpers::test_config;
use super::test_helpers::test_memory;
use super::test_helpers::TestController;
use super::test_helpers::ADMIN_BUF;
use super::test_helpers::ADMIN_DEPTH;
use crate::config::NvmevConfig;
use crate::config::Placement;
use crate::driver;
use crate::driver::HostQueuePair;
use crate::namespace::CommandProcessor;
use crate::namespace::KvNamespace;
use crate::namespace::RamNamespace;
use crate::namespace::ZonedNamespace;
use crate::spec;
use crate::spec::kv;
use crate::spec::nvm;
use crate::spec::zns;
use crate::NvmeControllerBuilder;
use crate::PAGE_SIZE;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use zerocopy::FromZeros;

const READ_4K_NS: u64 = 15_000;
const WRITE_4K_NS: u64 = 21_000;
const OTHER_NS: u64 = 1_000;

fn ram_namespace() -> Arc<dyn CommandProcessor> {
    Arc::new(RamNamespace::new(256, 12))
}

fn single_namespace(config: NvmevConfig) -> TestController {
    TestController::new(config, vec![(1, ram_namespace())])
}

fn status(completion: &spec::Completion) -> spec::Status {
    driver::completion_status(completion)
}

fn write_page(nsid: u32, lba: u64, page: u64) -> spec::Command {
    driver::write(nsid, lba, 1, [data_page(page), 0])
}

fn read_page(nsid: u32, lba: u64, page: u64) -> spec::Command {
    driver::read(nsid, lba, 1, [data_page(page), 0])
}

#[test]
fn identify_controller_and_namespaces() {
    let mut t = TestController::new(
        test_config(),
        vec![(1, ram_namespace()), (3, Arc::new(ZonedNamespace::new(4, 16, 12)))],
    );

    t.admin_ok(driver::identify(spec::Cns::CONTROLLER, 0, spec::Csi::NVM, ADMIN_BUF));
    let id: spec::IdentifyController = t.mem.read_plain(ADMIN_BUF).unwrap();
    assert_eq!(id.vid, 0x0c51);
    assert_eq!(id.ssvid, 0x370d);
    assert_eq!(id.ver, 0x00010400);
    assert_eq!(id.nn, 3);
    assert_eq!(id.mdts, 5);
    assert_eq!(id.cntrltype, spec::CONTROLLER_TYPE_IO);
    assert!(id.subnqn.starts_with(b"nqn.2014-08.org.nvmexpress:0c51370d:nvmev\0"));

    t.admin_ok(driver::identify(spec::Cns::ACTIVE_NAMESPACES, 0, spec::Csi::NVM, ADMIN_BUF));
    let list: [u32; 4] = t.mem.read_plain(ADMIN_BUF).unwrap();
    assert_eq!(list, [1, 3, 0, 0]);
    t.admin_ok(driver::identify(spec::Cns::ACTIVE_NAMESPACES, 1, spec::Csi::NVM, ADMIN_BUF));
    let list: [u32; 2] = t.mem.read_plain(ADMIN_BUF).unwrap();
    assert_eq!(list, [3, 0]);

    t.admin_ok(driver::identify(spec::Cns::NAMESPACE, 1, spec::Csi::NVM, ADMIN_BUF));
    let ns: nvm::IdentifyNamespace = t.mem.read_plain(ADMIN_BUF).unwrap();
    assert_eq!(ns.nsze, 256);
    assert_eq!(ns.lbaf[0].lbads(), 12);

    t.admin_ok(driver::identify(
        spec::Cns::DESCRIPTOR_NAMESPACE,
        3,
        spec::Csi::NVM,
        ADMIN_BUF,
    ));
    let descriptor: [u8; 5] = t.mem.read_plain(ADMIN_BUF).unwrap();
    assert_eq!(
        descriptor,
        [nvm::NamespaceIdentifierType::CSI.0, 1, 0, 0, spec::Csi::ZONED.0]
    );

    let completion = t.admin_command(driver::identify(
        spec::Cns::DESCRIPTOR_NAMESPACE,
        2,
        spec::Csi::NVM,
        ADMIN_BUF,
    ));
    assert_eq!(status(&completion), spec::Status::INVALID_NAMESPACE_OR_FORMAT);

    // Only a zoned namespace reports zoned command set data.
    t.admin_ok(driver::identify(
        spec::Cns::SPECIFIC_NAMESPACE_IO_COMMAND_SET,
        3,
        spec::Csi::ZONED,
        ADMIN_BUF,
    ));
    let completion = t.admin_command(driver::identify(
        spec::Cns::SPECIFIC_CONTROLLER_IO_COMMAND_SET,
        0,
        spec::Csi::KEY_VALUE,
        ADMIN_BUF,
    ));
    assert_eq!(status(&completion), spec::Status::INVALID_FIELD_IN_COMMAND);
}

#[test]
fn read_completes_after_modeled_latency() {
    let mut t = single_namespace(test_config());
    let mut qp = t.create_io_queue_pair(1, 8, None);

    t.mem.write_at(data_page(0), &[0xa5; PAGE_SIZE]).unwrap();
    qp.submit(write_page(1, 7, 0)).unwrap();
    t.poll();
    t.advance(WRITE_4K_NS - 1);
    assert!(t.reap(&mut qp).is_empty());
    t.advance(1);
    let completions = t.reap(&mut qp);
    assert_eq!(completions.len(), 1);
    assert_eq!(status(&completions[0]), spec::Status::SUCCESS);

    qp.submit(read_page(1, 7, 1)).unwrap();
    t.poll();
    t.advance(READ_4K_NS - 1);
    assert!(t.reap(&mut qp).is_empty());
    t.advance(1);
    let completions = t.reap(&mut qp);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].sqid, 1);
    assert_eq!(status(&completions[0]), spec::Status::SUCCESS);

    let mut data = vec![0; PAGE_SIZE];
    t.mem.read_at(data_page(1), &mut data).unwrap();
    assert!(data.iter().all(|&b| b == 0xa5));

    let stats = t.controller.stats();
    assert_eq!(stats.read_commands, 1);
    assert_eq!(stats.write_commands, 1);
    assert_eq!(stats.bytes_read, 4096);
    assert_eq!(stats.slots_in_use, [0]);
    let sq = t.controller.sq_stats(1).unwrap();
    assert_eq!(sq.nr_dispatched, 2);
    assert_eq!(sq.total_io, 2);
    assert_eq!(sq.nr_in_flight, 0);
}

#[test]
fn commands_on_one_worker_serialize() {
    let mut t = single_namespace(test_config());
    let mut qp = t.create_io_queue_pair(1, 8, None);

    let first = qp.push(write_page(1, 0, 0)).unwrap();
    let second = qp.push(write_page(1, 1, 1)).unwrap();
    qp.ring();
    t.poll();

    t.advance(WRITE_4K_NS);
    let completions = t.reap(&mut qp);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].cid, first);

    t.advance(WRITE_4K_NS - 1);
    assert!(t.reap(&mut qp).is_empty());
    t.advance(1);
    let completions = t.reap(&mut qp);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].cid, second);
}

#[test]
fn invalid_commands_complete_without_a_slot() {
    let mut t = single_namespace(test_config());
    let mut qp = t.create_io_queue_pair(1, 8, None);

    qp.submit(read_page(9, 0, 0)).unwrap();
    t.poll();
    let completions = t.reap(&mut qp);
    assert_eq!(completions.len(), 1);
    assert_eq!(status(&completions[0]), spec::Status::INVALID_NAMESPACE_OR_FORMAT);

    qp.submit(read_page(1, 256, 0)).unwrap();
    t.poll();
    let completions = t.reap(&mut qp);
    assert_eq!(status(&completions[0]), spec::Status::LBA_OUT_OF_RANGE);

    let stats = t.controller.stats();
    assert_eq!(stats.slots_in_use, [0]);
    assert_eq!(stats.read_commands, 0);
    assert_eq!(t.controller.sq_stats(1).unwrap().total_io, 0);
}

#[test]
fn deleted_queues_drain_in_flight_commands() {
    let mut t = single_namespace(test_config());
    let mut qp = t.create_io_queue_pair(1, 8, None);

    qp.submit(read_page(1, 0, 0)).unwrap();
    t.poll();
    assert_eq!(t.controller.sq_stats(1).unwrap().nr_in_flight, 1);

    t.admin_ok(driver::delete_io_submission_queue(1));
    // Still present until the read finishes.
    assert_eq!(t.controller.sq_stats(1).unwrap().nr_in_flight, 1);
    t.admin_ok(driver::delete_io_completion_queue(1));
    let completion = t.admin_command(driver::delete_io_completion_queue(1));
    assert_eq!(status(&completion), spec::Status::INVALID_QUEUE_IDENTIFIER);

    t.advance(READ_4K_NS);
    assert!(t.controller.sq_stats(1).is_none());
    let stats = t.controller.stats();
    assert_eq!(stats.dropped_completions, 1);
    assert_eq!(stats.slots_in_use, [0]);
}

#[test]
fn completion_queue_in_use_cannot_be_deleted() {
    let mut t = single_namespace(test_config());
    let _qp = t.create_io_queue_pair(1, 8, None);
    let completion = t.admin_command(driver::delete_io_completion_queue(1));
    assert_eq!(status(&completion), spec::Status::INVALID_QUEUE_DELETION);

    let completion = t.admin_command(driver::create_io_submission_queue(2, 5, 0x80000, 8));
    assert_eq!(status(&completion), spec::Status::COMPLETION_QUEUE_INVALID);
}

#[test]
fn phase_flips_on_wrap() {
    let mut t = single_namespace(test_config());
    let mut qp = t.create_io_queue_pair_with(1, 4, 2, None);

    let mut phases = Vec::new();
    for _ in 0..5 {
        qp.submit(driver::flush(1)).unwrap();
        t.poll();
        t.advance(OTHER_NS);
        let completions = t.reap(&mut qp);
        assert_eq!(completions.len(), 1);
        phases.push(completions[0].status.phase());
    }
    assert_eq!(phases, [true, true, false, false, true]);
}

#[test]
fn full_completion_queue_holds_completions() {
    let mut t = single_namespace(test_config());
    let mut qp = t.create_io_queue_pair_with(1, 4, 2, None);

    qp.push(driver::flush(1)).unwrap();
    qp.push(driver::flush(1)).unwrap();
    qp.ring();
    t.poll();
    t.advance(2 * OTHER_NS);
    assert_eq!(t.controller.stats().slots_in_use, [1]);

    // Reaping one entry frees room for the held completion.
    assert!(qp.poll_completion().unwrap().is_some());
    assert!(qp.poll_completion().unwrap().is_none());
    t.poll();
    assert!(qp.poll_completion().unwrap().is_some());
    assert_eq!(t.controller.stats().slots_in_use, [0]);
    assert_eq!(t.controller.stats().dropped_completions, 0);
}

#[test]
fn abort_before_data_moves() {
    let mut config = test_config();
    config.controller.eager_copy = false;
    let mut t = single_namespace(config);
    let mut qp = t.create_io_queue_pair(1, 8, None);

    let cid = qp.submit(read_page(1, 0, 0)).unwrap();
    t.poll();
    let completion = t.admin_ok(driver::abort(1, cid));
    assert_eq!(completion.dw0 & 1, 0);

    let completions = t.reap(&mut qp);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].cid, cid);
    assert_eq!(status(&completions[0]), spec::Status::COMMAND_ABORT_REQUESTED);
    let stats = t.controller.stats();
    assert_eq!(stats.aborted, 1);
    assert_eq!(stats.slots_in_use, [0]);
}

#[test]
fn abort_after_data_moves_is_refused() {
    let mut t = single_namespace(test_config());
    let mut qp = t.create_io_queue_pair(1, 8, None);

    let cid = qp.submit(read_page(1, 0, 0)).unwrap();
    t.poll();
    let completion = t.admin_ok(driver::abort(1, cid));
    assert_eq!(completion.dw0 & 1, 1);

    // Unknown queues and the admin queue are never aborted.
    assert_eq!(t.admin_ok(driver::abort(0, 0)).dw0 & 1, 1);
    assert_eq!(t.admin_ok(driver::abort(7, 0)).dw0 & 1, 1);

    t.advance(READ_4K_NS);
    let completions = t.reap(&mut qp);
    assert_eq!(status(&completions[0]), spec::Status::SUCCESS);
    assert_eq!(t.controller.stats().aborted, 0);
}

#[test]
fn admin_completions_wait_for_admin_queue_room() {
    let mut config = test_config();
    config.controller.eager_copy = false;
    // A two entry ring holds a single completion.
    let mut t =
        TestController::with_admin_depths(config, vec![(1, ram_namespace())], ADMIN_DEPTH, 2);
    let mut qp = t.create_io_queue_pair(1, 8, None);
    let cid = qp.submit(read_page(1, 0, 0)).unwrap();
    t.poll();

    let features = t
        .admin
        .push(driver::get_features(spec::Feature::NUMBER_OF_QUEUES))
        .unwrap();
    let abort = t.admin.push(driver::abort(1, cid)).unwrap();
    t.admin.ring();
    t.poll();

    // The read is aborted even though the abort's own completion has to wait.
    let completions = t.reap(&mut qp);
    assert_eq!(completions.len(), 1);
    assert_eq!(status(&completions[0]), spec::Status::COMMAND_ABORT_REQUESTED);

    let mut reaped = Vec::new();
    for _ in 0..8 {
        while let Some(completion) = t.admin.poll_completion().unwrap() {
            reaped.push(completion);
        }
        t.poll();
    }
    let cids = reaped.iter().map(|c| c.cid).collect::<Vec<_>>();
    assert_eq!(cids, [features, abort]);
    assert_eq!(reaped[1].dw0 & 1, 0);
    assert_eq!(t.controller.stats().dropped_completions, 0);

    // Completions from the dispatcher wait the same way.
    let number_of_queues = driver::get_features(spec::Feature::NUMBER_OF_QUEUES);
    let first = t.admin.push(number_of_queues).unwrap();
    let second = t.admin.push(number_of_queues).unwrap();
    t.admin.ring();
    t.poll();
    assert_eq!(t.admin.poll_completion().unwrap().unwrap().cid, first);
    assert!(t.admin.poll_completion().unwrap().is_none());
    t.poll();
    assert_eq!(t.admin.poll_completion().unwrap().unwrap().cid, second);
    assert_eq!(t.controller.stats().dropped_completions, 0);
}

#[test]
fn recreated_completion_queue_gets_no_stale_completions() {
    let mut t = single_namespace(test_config());
    let mut qp = t.create_io_queue_pair(1, 8, None);
    qp.submit(read_page(1, 0, 0)).unwrap();
    t.poll();

    t.admin_ok(driver::delete_io_submission_queue(1));
    t.admin_ok(driver::delete_io_completion_queue(1));
    let cq_base = data_page(32);
    t.admin_ok(driver::create_io_completion_queue(1, cq_base, 8, None));
    let mut new_cq = HostQueuePair::new(
        t.mem.clone(),
        t.controller.doorbells(),
        1,
        data_page(33),
        8,
        cq_base,
        8,
    );

    t.advance(READ_4K_NS);
    t.advance(READ_4K_NS);
    assert!(t.reap(&mut new_cq).is_empty());
    assert!(t.controller.sq_stats(1).is_none());
    let stats = t.controller.stats();
    assert_eq!(stats.dropped_completions, 1);
    assert_eq!(stats.slots_in_use, [0]);
}

#[test]
fn invalid_commands_bypass_a_full_worker() {
    let mut config = test_config();
    config.controller.worker_capacity = 1;
    let mut t = single_namespace(config);
    let mut qp = t.create_io_queue_pair(1, 8, None);

    qp.submit(read_page(1, 0, 0)).unwrap();
    t.poll();
    assert_eq!(t.controller.stats().slots_in_use, [1]);

    qp.push(read_page(9, 0, 1)).unwrap();
    qp.push(read_page(1, 256, 1)).unwrap();
    qp.ring();
    t.poll();
    let completions = t.reap(&mut qp);
    let statuses = completions.iter().map(status).collect::<Vec<_>>();
    assert_eq!(
        statuses,
        [
            spec::Status::INVALID_NAMESPACE_OR_FORMAT,
            spec::Status::LBA_OUT_OF_RANGE
        ]
    );
    assert_eq!(t.controller.stats().slots_in_use, [1]);

    // A valid command behind them still waits for the slot.
    qp.submit(read_page(1, 1, 1)).unwrap();
    t.poll();
    assert!(t.reap(&mut qp).is_empty());
    assert_eq!(t.controller.sq_stats(1).unwrap().total_io, 1);
    for _ in 0..3 {
        t.advance(READ_4K_NS);
    }
    assert_eq!(t.reap(&mut qp).len(), 2);
}

#[test]
fn full_completion_queue_does_not_stall_other_queues() {
    let mut config = test_config();
    config.controller.placement = Placement::Grouped { sqs_per_worker: 2 };
    let mut t = single_namespace(config);
    let mut qp1 = t.create_io_queue_pair_with(1, 4, 2, None);
    let mut qp2 = t.create_io_queue_pair(2, 8, None);

    qp1.push(driver::flush(1)).unwrap();
    qp1.push(driver::flush(1)).unwrap();
    qp1.ring();
    qp2.submit(driver::flush(1)).unwrap();
    t.poll();
    t.advance(3 * OTHER_NS);

    assert_eq!(t.reap(&mut qp2).len(), 1);
    assert_eq!(t.controller.stats().slots_in_use, [1]);
    assert!(qp1.poll_completion().unwrap().is_some());
    assert!(qp1.poll_completion().unwrap().is_none());
    t.poll();
    assert!(qp1.poll_completion().unwrap().is_some());
    assert_eq!(t.controller.stats().slots_in_use, [0]);
}

#[test]
fn round_robin_retries_the_same_worker() {
    let mut config = test_config();
    config.controller.nr_io_workers = 3;
    config.controller.worker_capacity = 1;
    config.controller.placement = Placement::RoundRobin;
    let mut t = single_namespace(config);
    let mut qp = t.create_io_queue_pair(1, 8, None);

    // The read finishes first, so worker 0 frees up before the others.
    qp.push(read_page(1, 0, 0)).unwrap();
    qp.push(write_page(1, 1, 1)).unwrap();
    qp.push(write_page(1, 2, 2)).unwrap();
    qp.push(read_page(1, 3, 3)).unwrap();
    qp.ring();
    t.poll();
    assert_eq!(t.controller.stats().slots_in_use, [1, 1, 1]);
    assert_eq!(t.controller.sq_stats(1).unwrap().nr_dispatched, 3);

    t.advance(READ_4K_NS);
    assert_eq!(t.controller.stats().slots_in_use, [0, 1, 1]);
    t.poll();
    assert_eq!(t.controller.stats().slots_in_use, [1, 1, 1]);
    assert_eq!(t.controller.sq_stats(1).unwrap().nr_dispatched, 4);
}

#[test]
fn admission_waits_for_free_slots() {
    let mut config = test_config();
    config.controller.worker_capacity = 2;
    let mut t = single_namespace(config);
    let mut qp = t.create_io_queue_pair(1, 8, None);

    for i in 0..4 {
        qp.push(read_page(1, i, i)).unwrap();
    }
    qp.ring();
    t.poll();
    assert_eq!(t.controller.stats().slots_in_use, [2]);
    assert_eq!(t.controller.sq_stats(1).unwrap().nr_dispatched, 2);
    assert!(t.controller.stats().admission_retries > 0);

    let mut completions = Vec::new();
    for _ in 0..8 {
        t.advance(READ_4K_NS);
        completions.extend(t.reap(&mut qp));
    }
    assert_eq!(completions.len(), 4);
    assert!(completions.iter().all(|c| status(c) == spec::Status::SUCCESS));
    let sq = t.controller.sq_stats(1).unwrap();
    assert_eq!(sq.max_nr_in_flight, 2);
    assert_eq!(sq.total_io, 4);
}

fn two_queue_writes(placement: Placement) -> (TestController, HostQueuePair, HostQueuePair) {
    let mut config = test_config();
    config.controller.nr_io_workers = 2;
    config.controller.placement = placement;
    let mut t = single_namespace(config);
    let mut qp1 = t.create_io_queue_pair(1, 8, None);
    let mut qp2 = t.create_io_queue_pair(2, 8, None);
    qp1.submit(write_page(1, 0, 0)).unwrap();
    qp2.submit(write_page(1, 1, 1)).unwrap();
    t.poll();
    (t, qp1, qp2)
}

#[test]
fn per_queue_placement_runs_queues_in_parallel() {
    let (mut t, mut qp1, mut qp2) = two_queue_writes(Placement::PerSq);
    assert_eq!(t.controller.stats().slots_in_use, [1, 1]);
    t.advance(WRITE_4K_NS);
    assert_eq!(t.reap(&mut qp1).len(), 1);
    assert_eq!(t.reap(&mut qp2).len(), 1);
}

#[test]
fn grouped_placement_shares_a_worker() {
    let (mut t, mut qp1, mut qp2) = two_queue_writes(Placement::Grouped { sqs_per_worker: 2 });
    assert_eq!(t.controller.stats().slots_in_use, [2, 0]);
    t.advance(WRITE_4K_NS);
    assert_eq!(t.reap(&mut qp1).len(), 1);
    assert!(t.reap(&mut qp2).is_empty());
    t.advance(WRITE_4K_NS);
    assert_eq!(t.reap(&mut qp2).len(), 1);
}

#[test]
fn write_buffer_released_after_program_time() {
    const PROGRAM_NS: u64 = 50_000;
    let ns = Arc::new(RamNamespace::new(256, 12).with_write_buffer(PAGE_SIZE as u64, PROGRAM_NS));
    let mut t = TestController::new(test_config(), vec![(1, ns.clone())]);
    let mut qp = t.create_io_queue_pair(1, 8, None);
    let buffer = ns.write_buffer().unwrap().clone();

    qp.submit(write_page(1, 0, 0)).unwrap();
    t.poll();
    assert_eq!(buffer.used(), PAGE_SIZE as u64);
    t.advance(WRITE_4K_NS);
    assert_eq!(t.reap(&mut qp).len(), 1);
    // The write completed but the program operation still holds its slot.
    assert_eq!(t.controller.stats().slots_in_use, [1]);
    assert_eq!(buffer.used(), PAGE_SIZE as u64);

    t.advance(PROGRAM_NS - 1);
    assert_eq!(buffer.used(), PAGE_SIZE as u64);
    t.advance(1);
    assert_eq!(buffer.used(), 0);
    assert_eq!(t.controller.stats().slots_in_use, [0]);
}

#[test]
fn full_write_buffer_delays_writes() {
    const PROGRAM_NS: u64 = 50_000;
    let ns = Arc::new(RamNamespace::new(256, 12).with_write_buffer(PAGE_SIZE as u64, PROGRAM_NS));
    let mut t = TestController::new(test_config(), vec![(1, ns)]);
    let mut qp = t.create_io_queue_pair(1, 8, None);

    qp.push(write_page(1, 0, 0)).unwrap();
    qp.push(write_page(1, 1, 1)).unwrap();
    qp.ring();
    t.poll();
    t.advance(WRITE_4K_NS);
    assert_eq!(t.reap(&mut qp).len(), 1);
    t.advance(WRITE_4K_NS + PROGRAM_NS - 1);
    assert!(t.reap(&mut qp).is_empty());
    t.advance(1);
    assert_eq!(t.reap(&mut qp).len(), 1);
}

#[test]
fn number_of_queues() {
    let mut t = single_namespace(test_config());

    let completion = t.admin_ok(driver::get_features(spec::Feature::NUMBER_OF_QUEUES));
    assert_eq!(completion.dw0, 7 | (7 << 16));

    let completion = t.admin_ok(driver::set_number_of_queues(2, 2));
    assert_eq!(completion.dw0, 1 | (1 << 16));
    let completion = t.admin_ok(driver::set_number_of_queues(64, 64));
    assert_eq!(completion.dw0, 7 | (7 << 16));
    t.admin_ok(driver::set_number_of_queues(2, 2));

    let completion = t.admin_command(driver::create_io_completion_queue(3, 0x80000, 8, None));
    assert_eq!(status(&completion), spec::Status::INVALID_QUEUE_IDENTIFIER);
    let _qp = t.create_io_queue_pair(2, 8, None);

    let completion = t.admin_command(driver::set_number_of_queues(4, 4));
    assert_eq!(status(&completion), spec::Status::COMMAND_SEQUENCE_ERROR);
}

#[test]
fn interrupt_vector_bounds() {
    let mut t = single_namespace(test_config());
    let completion = t.admin_command(driver::create_io_completion_queue(1, 0x80000, 8, Some(9)));
    assert_eq!(status(&completion), spec::Status::INVALID_INTERRUPT_VECTOR);
    let completion = t.admin_command(driver::create_io_completion_queue(1, 0x80000, 1, None));
    assert_eq!(status(&completion), spec::Status::INVALID_QUEUE_SIZE);
}

#[test]
fn features_round_trip() {
    let mut t = single_namespace(test_config());

    let get = |sel: u8| {
        let mut command = driver::get_features(spec::Feature::VOLATILE_WRITE_CACHE);
        command.cdw10 = spec::Cdw10GetFeatures::new()
            .with_fid(spec::Feature::VOLATILE_WRITE_CACHE.0)
            .with_sel(sel)
            .into();
        command
    };

    assert_eq!(t.admin_ok(get(0)).dw0, 1);
    t.admin_ok(driver::set_features(spec::Feature::VOLATILE_WRITE_CACHE, 0));
    assert_eq!(t.admin_ok(get(0)).dw0, 0);
    // Default is unchanged.
    assert_eq!(t.admin_ok(get(1)).dw0, 1);
    assert_eq!(t.admin_ok(get(3)).dw0, 0b100);

    t.admin_ok(driver::set_features(spec::Feature::ARBITRATION, 0x0303));
    assert_eq!(
        t.admin_ok(driver::get_features(spec::Feature::ARBITRATION)).dw0,
        0x0303
    );

    let mut saved = driver::set_features(spec::Feature::ARBITRATION, 0);
    saved.cdw10 = spec::Cdw10SetFeatures::new()
        .with_fid(spec::Feature::ARBITRATION.0)
        .with_save(true)
        .into();
    let completion = t.admin_command(saved);
    assert_eq!(status(&completion), spec::Status::FEATURE_IDENTIFIER_NOT_SAVEABLE);

    let completion = t.admin_command(driver::get_features(spec::Feature(0x7f)));
    assert_eq!(status(&completion), spec::Status::INVALID_FIELD_IN_COMMAND);
}

#[test]
fn health_log_counts_io() {
    let mut t = single_namespace(test_config());
    let mut qp = t.create_io_queue_pair(1, 8, None);

    qp.push(driver::write(1, 0, 2, [data_page(0), data_page(1)]))
        .unwrap();
    qp.push(read_page(1, 0, 2)).unwrap();
    qp.ring();
    t.poll();

    t.admin_ok(driver::get_log_page(
        spec::LogPageIdentifier::HEALTH_INFORMATION,
        !0,
        512,
        [ADMIN_BUF, 0],
    ));
    let log: spec::HealthLog = t.mem.read_plain(ADMIN_BUF).unwrap();
    assert_eq!(log.host_write_commands.get(), 1);
    assert_eq!(log.host_read_commands.get(), 1);
    assert_eq!(log.data_units_written.get(), 1);
    assert_eq!(log.data_units_read.get(), 1);
    assert_eq!(u16::from_le_bytes(log.temperature), 323);
    assert_eq!(log.available_spare, 100);

    let completion = t.admin_command(driver::get_log_page(
        spec::LogPageIdentifier::HEALTH_INFORMATION,
        1,
        512,
        [ADMIN_BUF, 0],
    ));
    assert_eq!(status(&completion), spec::Status::INVALID_FIELD_IN_COMMAND);

    t.admin_ok(driver::get_log_page(
        spec::LogPageIdentifier::FIRMWARE_SLOT_INFORMATION,
        0,
        64,
        [ADMIN_BUF, 0],
    ));
    let page: [u8; 16] = t.mem.read_plain(ADMIN_BUF).unwrap();
    assert_eq!(page[0], 1);
    assert_eq!(&page[8..], b"1.0     ");

    let completion = t.admin_command(driver::get_log_page(
        spec::LogPageIdentifier(0x70),
        0,
        64,
        [ADMIN_BUF, 0],
    ));
    assert_eq!(status(&completion), spec::Status::INVALID_LOG_PAGE);
}

#[test]
fn asynchronous_event_request_limit() {
    let mut t = single_namespace(test_config());
    for _ in 0..4 {
        let mut command = spec::Command::new_zeroed();
        command.cdw0 =
            spec::Cdw0::new().with_opcode(spec::AdminOpcode::ASYNCHRONOUS_EVENT_REQUEST.0);
        t.admin.submit(command).unwrap();
    }
    t.poll();
    assert!(t.admin.poll_completion().unwrap().is_none());

    let mut command = spec::Command::new_zeroed();
    command.cdw0 = spec::Cdw0::new().with_opcode(spec::AdminOpcode::ASYNCHRONOUS_EVENT_REQUEST.0);
    let completion = t.admin_command(command);
    assert_eq!(
        status(&completion),
        spec::Status::ASYNCHRONOUS_EVENT_REQUEST_LIMIT_EXCEEDED
    );

    let mut command = spec::Command::new_zeroed();
    command.cdw0 = spec::Cdw0::new().with_opcode(0x7f);
    let completion = t.admin_command(command);
    assert_eq!(status(&completion), spec::Status::INVALID_COMMAND_OPCODE);
}

#[test]
fn interrupts_signal_once_per_batch() {
    let mut t = single_namespace(test_config());
    let mut qp1 = t.create_io_queue_pair(1, 8, Some(1));
    let mut qp2 = t.create_io_queue_pair(2, 8, None);
    assert!(t.interrupts.take().iter().all(|&(cq, _)| cq == 0));

    qp1.push(driver::flush(1)).unwrap();
    qp1.push(driver::flush(1)).unwrap();
    qp1.ring();
    qp2.submit(driver::flush(1)).unwrap();
    t.poll();
    t.advance(3 * OTHER_NS);
    assert_eq!(t.reap(&mut qp1).len(), 2);
    assert_eq!(t.reap(&mut qp2).len(), 1);
    assert_eq!(t.interrupts.take(), [(1, 1)]);
}

#[test]
fn bad_doorbell_takes_queue_out_of_service() {
    let mut t = single_namespace(test_config());
    let mut qp = t.create_io_queue_pair(1, 4, None);

    t.controller.doorbells().ring_sq_tail(1, 9);
    t.poll();

    qp.submit(driver::flush(1)).unwrap();
    t.poll();
    t.advance(OTHER_NS);
    assert!(t.reap(&mut qp).is_empty());
    assert_eq!(t.controller.sq_stats(1).unwrap().nr_dispatched, 0);

    // Other queues keep working.
    let mut qp2 = t.create_io_queue_pair(2, 4, None);
    qp2.submit(driver::flush(1)).unwrap();
    t.poll();
    t.advance(OTHER_NS);
    assert_eq!(t.reap(&mut qp2).len(), 1);
}

#[test]
fn zoned_append_through_controller() {
    let mut t = TestController::new(
        test_config(),
        vec![(1, Arc::new(ZonedNamespace::new(4, 16, 12)))],
    );
    let mut qp = t.create_io_queue_pair(1, 8, None);

    let append = || {
        let mut command = write_page(1, 16, 0);
        command.cdw0.set_opcode(zns::ZnsOpcode::ZONE_APPEND.0);
        command
    };
    qp.push(append()).unwrap();
    qp.push(append()).unwrap();
    qp.ring();
    t.poll();
    t.advance(2 * WRITE_4K_NS);
    let completions = t.reap(&mut qp);
    assert_eq!(completions.len(), 2);
    assert_eq!(completions[0].dw0, 16);
    assert_eq!(completions[1].dw0, 17);

    qp.submit(write_page(1, 16, 0)).unwrap();
    t.poll();
    let completions = t.reap(&mut qp);
    assert_eq!(status(&completions[0]), spec::Status::ZONE_INVALID_WRITE);
}

#[test]
fn key_value_through_controller() {
    let mut t = TestController::new(
        test_config(),
        vec![(2, Arc::new(KvNamespace::new(1 << 20)))],
    );
    let mut qp = t.create_io_queue_pair(1, 8, None);

    let command = |opcode: kv::KvOpcode, len: u32, page: u64| {
        let mut command = spec::Command::new_zeroed();
        command.cdw0 = spec::Cdw0::new().with_opcode(opcode.0);
        command.nsid = 2;
        command.cdw10 = len;
        command.dptr = [data_page(page), 0];
        kv::set_command_key(&mut command, b"key");
        command
    };

    t.mem.write_at(data_page(0), b"value").unwrap();
    qp.submit(command(kv::KvOpcode::STORE, 5, 0)).unwrap();
    t.poll();
    t.advance(WRITE_4K_NS);
    assert_eq!(status(&t.reap(&mut qp)[0]), spec::Status::SUCCESS);

    qp.submit(command(kv::KvOpcode::RETRIEVE, 64, 1)).unwrap();
    t.poll();
    t.advance(READ_4K_NS);
    let completions = t.reap(&mut qp);
    assert_eq!(status(&completions[0]), spec::Status::SUCCESS);
    assert_eq!(completions[0].dw0, 5);
    let mut value = [0; 5];
    t.mem.read_at(data_page(1), &mut value).unwrap();
    assert_eq!(&value, b"value");

    qp.submit(command(kv::KvOpcode::DELETE, 0, 0)).unwrap();
    qp.submit(command(kv::KvOpcode::EXIST, 0, 0)).unwrap();
    t.poll();
    t.advance(2 * OTHER_NS);
    // The failed lookup completes at dispatch, ahead of the delete.
    let completions = t.reap(&mut qp);
    assert_eq!(status(&completions[0]), spec::Status::KV_KEY_DOES_NOT_EXIST);
    assert_eq!(status(&completions[1]), spec::Status::SUCCESS);
}

#[test]
fn duplicate_and_reserved_namespace_ids() {
    init_tracing();
    let mut builder = NvmeControllerBuilder::new(test_config(), test_memory());
    builder.add_namespace(1, ram_namespace()).unwrap();
    let err = builder.add_namespace(1, ram_namespace()).unwrap_err();
    assert_eq!(err.0, 1);

    builder.add_namespace(0xffffffff, ram_namespace()).unwrap();
    assert!(matches!(
        builder.build(),
        Err(crate::BuildError::InvalidNsid(0xffffffff))
    ));

    let mut config = test_config();
    config.controller.nr_io_workers = 0;
    assert!(matches!(
        NvmeControllerBuilder::new(config, test_memory()).build(),
        Err(crate::BuildError::Config(_))
    ));
}

fn wait_completion(qp: &mut HostQueuePair) -> spec::Completion {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(completion) = qp.poll_completion().unwrap() {
            return completion;
        }
        assert!(Instant::now() < deadline, "timed out waiting for completion");
        std::thread::yield_now();
    }
}

#[test]
fn threaded_controller() {
    init_tracing();
    let mem = test_memory();
    let mut config = test_config();
    config.controller.nr_io_workers = 2;
    config.controller.idle_timeout_ms = 1;
    let mut builder = NvmeControllerBuilder::new(config, mem.clone());
    builder.add_namespace(1, ram_namespace()).unwrap();
    let controller = builder.build().unwrap();
    controller.enable(0x1000, 16, 0x2000, 16).unwrap();
    let running = controller.start().unwrap();

    let mut admin = HostQueuePair::new(mem.clone(), running.doorbells(), 0, 0x1000, 16, 0x2000, 16);
    let mut queues = Vec::new();
    for qid in 1..=2u16 {
        let sq = 0x10000 + qid as u64 * 0x4000;
        let cq = sq + 0x2000;
        admin
            .submit(driver::create_io_completion_queue(qid, cq, 16, None))
            .unwrap();
        assert_eq!(status(&wait_completion(&mut admin)), spec::Status::SUCCESS);
        admin
            .submit(driver::create_io_submission_queue(qid, qid, sq, 16))
            .unwrap();
        assert_eq!(status(&wait_completion(&mut admin)), spec::Status::SUCCESS);
        queues.push(HostQueuePair::new(mem.clone(), running.doorbells(), qid, sq, 16, cq, 16));
    }

    for (i, qp) in queues.iter_mut().enumerate() {
        let i = i as u64;
        mem.write_at(data_page(i), &[i as u8 + 1; PAGE_SIZE]).unwrap();
        qp.submit(write_page(1, i, i)).unwrap();
    }
    for qp in &mut queues {
        assert_eq!(status(&wait_completion(qp)), spec::Status::SUCCESS);
    }
    for (i, qp) in queues.iter_mut().enumerate() {
        let i = i as u64;
        qp.submit(read_page(1, i, 8 + i)).unwrap();
        assert_eq!(status(&wait_completion(qp)), spec::Status::SUCCESS);
        let mut data = vec![0; PAGE_SIZE];
        mem.read_at(data_page(8 + i), &mut data).unwrap();
        assert!(data.iter().all(|&b| b == i as u8 + 1));
    }

    let stats = running.stats();
    assert_eq!(stats.write_commands, 2);
    assert_eq!(stats.read_commands, 2);
    running.shutdown();
}
