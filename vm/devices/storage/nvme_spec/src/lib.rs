// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions from the NVMe specifications, limited to what the
//! emulated controller reads from submission queues and writes to completion
//! queues and admin data buffers. All multi-byte fields are little endian.
//!
//! Base 2.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-Base-Specification-2.0c-2022.10.04-Ratified.pdf>

#![no_std]

pub mod kv;
pub mod nvm;
pub mod zns;

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub type U128LE = zerocopy::U128<zerocopy::LE>;

/// A submission queue entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Command {
    pub cdw0: Cdw0,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub dptr: [u64; 2],
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(size_of::<Command>() == 64);

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw0 {
    pub opcode: u8,
    #[bits(2)]
    pub fuse: u8,
    #[bits(4)]
    pub reserved: u8,
    #[bits(2)]
    pub psdt: u8,
    pub cid: u16,
}

/// A completion queue entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Completion {
    pub dw0: u32,
    pub dw1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub status: CompletionStatus,
}

const _: () = assert!(size_of::<Completion>() == 16);

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CompletionStatus {
    pub phase: bool,
    /// 8 bits of status code followed by 3 bits of the status code type.
    #[bits(11)]
    pub status: u16,
    #[bits(2)]
    pub crd: u8,
    pub more: bool,
    pub dnr: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct StatusCodeType(pub u8);

impl StatusCodeType {
    pub const GENERIC: Self = Self(0);
    pub const COMMAND_SPECIFIC: Self = Self(1);
    pub const MEDIA_ERROR: Self = Self(2);
    pub const PATH_RELATED: Self = Self(3);
    pub const VENDOR_SPECIFIC: Self = Self(7);
}

/// A status code (low 8 bits) combined with its status code type (next 3
/// bits), as stored in [`CompletionStatus::status`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Self = Self(0x00);
    pub const INVALID_COMMAND_OPCODE: Self = Self(0x01);
    pub const INVALID_FIELD_IN_COMMAND: Self = Self(0x02);
    pub const COMMAND_ID_CONFLICT: Self = Self(0x03);
    pub const DATA_TRANSFER_ERROR: Self = Self(0x04);
    pub const INTERNAL_ERROR: Self = Self(0x06);
    pub const COMMAND_ABORT_REQUESTED: Self = Self(0x07);
    pub const COMMAND_ABORTED_DUE_TO_SQ_DELETION: Self = Self(0x08);
    pub const INVALID_NAMESPACE_OR_FORMAT: Self = Self(0x0b);
    pub const COMMAND_SEQUENCE_ERROR: Self = Self(0x0c);

    pub const LBA_OUT_OF_RANGE: Self = Self(0x80);
    pub const CAPACITY_EXCEEDED: Self = Self(0x81);
    pub const NAMESPACE_NOT_READY: Self = Self(0x82);

    pub const COMPLETION_QUEUE_INVALID: Self = Self(0x100);
    pub const INVALID_QUEUE_IDENTIFIER: Self = Self(0x101);
    pub const INVALID_QUEUE_SIZE: Self = Self(0x102);
    pub const ABORT_COMMAND_LIMIT_EXCEEDED: Self = Self(0x103);
    pub const ASYNCHRONOUS_EVENT_REQUEST_LIMIT_EXCEEDED: Self = Self(0x105);
    pub const INVALID_INTERRUPT_VECTOR: Self = Self(0x108);
    pub const INVALID_LOG_PAGE: Self = Self(0x109);
    pub const INVALID_QUEUE_DELETION: Self = Self(0x10c);
    pub const FEATURE_IDENTIFIER_NOT_SAVEABLE: Self = Self(0x10d);
    pub const FEATURE_NOT_CHANGEABLE: Self = Self(0x10e);

    pub const CONFLICTING_ATTRIBUTES: Self = Self(0x180);
    pub const ATTEMPTED_WRITE_TO_READ_ONLY_RANGE: Self = Self(0x182);

    // Key value command set.
    pub const KV_INVALID_VALUE_SIZE: Self = Self(0x185);
    pub const KV_INVALID_KEY_SIZE: Self = Self(0x186);
    pub const KV_KEY_DOES_NOT_EXIST: Self = Self(0x187);

    // Zoned namespace command set.
    pub const ZONE_BOUNDARY_ERROR: Self = Self(0x1b8);
    pub const ZONE_IS_FULL: Self = Self(0x1b9);
    pub const ZONE_IS_READ_ONLY: Self = Self(0x1ba);
    pub const ZONE_IS_OFFLINE: Self = Self(0x1bb);
    pub const ZONE_INVALID_WRITE: Self = Self(0x1bc);
    pub const ZONE_INVALID_STATE_TRANSITION: Self = Self(0x1bf);

    pub const MEDIA_WRITE_FAULT: Self = Self(0x280);
    pub const MEDIA_UNRECOVERED_READ_ERROR: Self = Self(0x281);
    pub const MEDIA_COMPARE_FAILURE: Self = Self(0x285);

    pub fn status_code(&self) -> u8 {
        self.0 as u8
    }

    pub fn status_code_type(&self) -> StatusCodeType {
        StatusCodeType((self.0 >> 8) as u8)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct AdminOpcode(pub u8);

impl AdminOpcode {
    pub const DELETE_IO_SUBMISSION_QUEUE: Self = Self(0x00);
    pub const CREATE_IO_SUBMISSION_QUEUE: Self = Self(0x01);
    pub const GET_LOG_PAGE: Self = Self(0x02);
    pub const DELETE_IO_COMPLETION_QUEUE: Self = Self(0x04);
    pub const CREATE_IO_COMPLETION_QUEUE: Self = Self(0x05);
    pub const IDENTIFY: Self = Self(0x06);
    pub const ABORT: Self = Self(0x08);
    pub const SET_FEATURES: Self = Self(0x09);
    pub const GET_FEATURES: Self = Self(0x0a);
    pub const ASYNCHRONOUS_EVENT_REQUEST: Self = Self(0x0c);
    pub const NAMESPACE_MANAGEMENT: Self = Self(0x0d);
    pub const FIRMWARE_COMMIT: Self = Self(0x10);
    pub const FIRMWARE_IMAGE_DOWNLOAD: Self = Self(0x11);
    pub const NAMESPACE_ATTACHMENT: Self = Self(0x15);
    pub const KEEP_ALIVE: Self = Self(0x18);
    pub const DOORBELL_BUFFER_CONFIG: Self = Self(0x7c);
    pub const FORMAT_NVM: Self = Self(0x80);
}

/// I/O command set identifier.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Csi(pub u8);

impl Csi {
    pub const NVM: Self = Self(0x0);
    pub const KEY_VALUE: Self = Self(0x1);
    pub const ZONED: Self = Self(0x2);
}

// Identify
#[bitfield(u32)]
pub struct Cdw10Identify {
    pub cns: u8,
    pub reserved: u8,
    pub cntid: u16,
}

#[bitfield(u32)]
pub struct Cdw11Identify {
    pub cnssid: u16,
    pub reserved: u8,
    pub csi: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Cns(pub u8);

impl Cns {
    pub const NAMESPACE: Self = Self(0x0);
    pub const CONTROLLER: Self = Self(0x1);
    pub const ACTIVE_NAMESPACES: Self = Self(0x2);
    pub const DESCRIPTOR_NAMESPACE: Self = Self(0x3);
    pub const SPECIFIC_NAMESPACE_IO_COMMAND_SET: Self = Self(0x5);
    pub const SPECIFIC_CONTROLLER_IO_COMMAND_SET: Self = Self(0x6);
}

/// The identify controller data structure, with the fields this controller
/// reports broken out and everything else left reserved.
#[repr(C)]
#[derive(Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    pub sn: [u8; 20],
    pub mn: [u8; 40],
    pub fr: [u8; 8],
    pub rab: u8,
    pub ieee: [u8; 3],
    pub cmic: u8,
    /// Maximum data transfer size (in minimum page size units, as power of
    /// two).
    pub mdts: u8,
    pub cntlid: u16,
    pub ver: u32,
    pub rtd3r: u32,
    pub rtd3e: u32,
    pub oaes: u32,
    pub ctratt: u32,
    pub rsvd1: [u8; 11],
    pub cntrltype: u8,
    pub rsvd2: [u8; 144],
    pub oacs: u16,
    pub acl: u8,
    pub aerl: u8,
    pub frmw: u8,
    pub lpa: u8,
    pub elpe: u8,
    pub npss: u8,
    pub rsvd3: [u8; 248],
    pub sqes: u8,
    pub cqes: u8,
    pub maxcmd: u16,
    pub nn: u32,
    pub oncs: u16,
    pub fuses: u16,
    pub fna: u8,
    pub vwc: u8,
    pub awun: u16,
    pub awupf: u16,
    pub rsvd4: [u8; 238],
    pub subnqn: [u8; 256],
    pub rsvd5: [u8; 3072],
}

const _: () = assert!(size_of::<IdentifyController>() == 4096);

pub const CONTROLLER_TYPE_IO: u8 = 1;

#[bitfield(u8)]
pub struct QueueEntrySize {
    #[bits(4)]
    pub min: u8,
    #[bits(4)]
    pub max: u8,
}

/// Optional NVM command support
#[bitfield(u16)]
pub struct Oncs {
    pub compare: bool,
    pub write_uncorrectable: bool,
    pub dataset_management: bool,
    pub write_zeroes: bool,
    pub save: bool,
    pub reservations: bool,
    pub timestamp: bool,
    pub verify: bool,
    pub copy: bool,
    #[bits(7)]
    _rsvd: u16,
}

#[bitfield(u8)]
pub struct VolatileWriteCache {
    pub present: bool,
    #[bits(2)]
    pub broadcast_flush_behavior: u8,
    #[bits(5)]
    _rsvd: u8,
}

// Features
#[bitfield(u32)]
pub struct Cdw10SetFeatures {
    pub fid: u8,
    #[bits(23)]
    _rsvd: u32,
    pub save: bool,
}

#[bitfield(u32)]
pub struct Cdw10GetFeatures {
    pub fid: u8,
    #[bits(3)]
    pub sel: u8,
    #[bits(21)]
    _rsvd: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Feature(pub u8);

impl Feature {
    pub const ARBITRATION: Self = Self(0x01);
    pub const POWER_MANAGEMENT: Self = Self(0x02);
    pub const TEMPERATURE_THRESHOLD: Self = Self(0x04);
    pub const ERROR_RECOVERY: Self = Self(0x05);
    pub const VOLATILE_WRITE_CACHE: Self = Self(0x06);
    pub const NUMBER_OF_QUEUES: Self = Self(0x07);
    pub const INTERRUPT_COALESCING: Self = Self(0x08);
    pub const INTERRUPT_VECTOR_CONFIG: Self = Self(0x09);
    pub const WRITE_ATOMICITY: Self = Self(0x0a);
    pub const ASYNC_EVENT_CONFIG: Self = Self(0x0b);
    pub const KEEP_ALIVE: Self = Self(0x0f);
}

#[bitfield(u32)]
pub struct Cdw11FeatureNumberOfQueues {
    pub nsq_z: u16,
    pub ncq_z: u16,
}

#[bitfield(u32)]
pub struct Cdw11FeatureVolatileWriteCache {
    pub wce: bool,
    #[bits(31)]
    _rsvd: u32,
}

// Queue management
#[bitfield(u32)]
pub struct Cdw10CreateIoQueue {
    pub qid: u16,
    pub qsize_z: u16,
}

#[bitfield(u32)]
pub struct Cdw11CreateIoCompletionQueue {
    pub pc: bool,
    pub ien: bool,
    #[bits(14)]
    pub rsvd: u16,
    pub iv: u16,
}

#[bitfield(u32)]
pub struct Cdw11CreateIoSubmissionQueue {
    pub pc: bool,
    #[bits(2)]
    pub qprio: u8,
    #[bits(13)]
    pub rsvd: u16,
    pub cqid: u16,
}

#[bitfield(u32)]
pub struct Cdw10DeleteIoQueue {
    pub qid: u16,
    pub rsvd: u16,
}

#[bitfield(u32)]
pub struct Cdw10Abort {
    pub sqid: u16,
    pub cid: u16,
}

// Log pages
#[bitfield(u32)]
pub struct Cdw10GetLogPage {
    /// Log page identifier
    pub lid: u8,
    #[bits(7)]
    pub lsp: u8,
    /// Retain asynchronous event
    pub rae: bool,
    pub numdl_z: u16,
}

#[bitfield(u32)]
pub struct Cdw11GetLogPage {
    pub numdu: u16,
    pub lsi: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct LogPageIdentifier(pub u8);

impl LogPageIdentifier {
    pub const ERROR_INFORMATION: Self = Self(1);
    pub const HEALTH_INFORMATION: Self = Self(2);
    pub const FIRMWARE_SLOT_INFORMATION: Self = Self(3);
    pub const CHANGED_NAMESPACE_LIST: Self = Self(4);
}

/// SMART / health information log page.
#[repr(C)]
#[derive(Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HealthLog {
    pub critical_warning: u8,
    pub temperature: [u8; 2],
    pub available_spare: u8,
    pub available_spare_threshold: u8,
    pub percentage_used: u8,
    pub endurance_group_critical_warning: u8,
    pub rsvd1: [u8; 25],
    /// In thousands of 512-byte units.
    pub data_units_read: U128LE,
    pub data_units_written: U128LE,
    pub host_read_commands: U128LE,
    pub host_write_commands: U128LE,
    pub controller_busy_time: U128LE,
    pub power_cycles: U128LE,
    pub power_on_hours: U128LE,
    pub unsafe_shutdowns: U128LE,
    pub media_errors: U128LE,
    pub error_log_entries: U128LE,
    pub rsvd2: [u8; 320],
}

const _: () = assert!(size_of::<HealthLog>() == 512);
