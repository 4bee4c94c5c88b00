// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Zoned namespace command set definitions
//!
//! NVM Express Zoned Namespace Command Set 1.1c

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ZnsOpcode(pub u8);

impl ZnsOpcode {
    pub const ZONE_MANAGEMENT_SEND: Self = Self(0x79);
    pub const ZONE_MANAGEMENT_RECEIVE: Self = Self(0x7a);
    pub const ZONE_APPEND: Self = Self(0x7d);
}

#[bitfield(u32)]
pub struct Cdw13ZoneManagementSend {
    /// Zone send action
    pub zsa: u8,
    /// Apply to all zones, ignoring the starting LBA.
    pub select_all: bool,
    #[bits(23)]
    _rsvd: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ZoneSendAction(pub u8);

impl ZoneSendAction {
    pub const CLOSE: Self = Self(0x1);
    pub const FINISH: Self = Self(0x2);
    pub const OPEN: Self = Self(0x3);
    pub const RESET: Self = Self(0x4);
    pub const OFFLINE: Self = Self(0x5);
}

#[bitfield(u32)]
pub struct Cdw13ZoneManagementReceive {
    /// Zone receive action
    pub zra: u8,
    /// Zone receive action specific field (state filter for reports).
    pub zrasf: u8,
    /// Partial report: count only the zones returned.
    pub partial: bool,
    #[bits(15)]
    _rsvd: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ZoneReceiveAction(pub u8);

impl ZoneReceiveAction {
    pub const REPORT_ZONES: Self = Self(0x0);
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ZoneState(pub u8);

impl ZoneState {
    pub const EMPTY: Self = Self(0x1);
    pub const IMPLICITLY_OPENED: Self = Self(0x2);
    pub const EXPLICITLY_OPENED: Self = Self(0x3);
    pub const CLOSED: Self = Self(0x4);
    pub const READ_ONLY: Self = Self(0xd);
    pub const FULL: Self = Self(0xe);
    pub const OFFLINE: Self = Self(0xf);
}

pub const ZONE_TYPE_SEQUENTIAL_WRITE_REQUIRED: u8 = 0x2;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ZoneReportHeader {
    pub nr_zones: u64,
    pub rsvd: [u8; 56],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ZoneDescriptor {
    /// Zone type
    pub zt: u8,
    /// Zone state, in the upper nibble.
    pub zs: u8,
    /// Zone attributes
    pub za: u8,
    pub zai: u8,
    pub rsvd1: [u8; 4],
    /// Zone capacity
    pub zcap: u64,
    /// Zone start LBA
    pub zslba: u64,
    /// Write pointer
    pub wp: u64,
    pub rsvd2: [u8; 32],
}

const _: () = assert!(size_of::<ZoneDescriptor>() == 64);

/// Zoned namespace specific identify namespace data (CNS 05h, CSI 02h).
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IdentifyNamespaceZns {
    /// Zone operation characteristics
    pub zoc: u16,
    /// Optional zoned command support
    pub ozcs: u16,
    /// Maximum active resources, zero based.
    pub mar: u32,
    /// Maximum open resources, zero based.
    pub mor: u32,
    /// Reset recommended limit, in seconds.
    pub rrl: u32,
    /// Finish recommended limit, in seconds.
    pub frl: u32,
    pub rsvd1: [u8; 2796],
    pub lbafe: [LbaFormatExtension; 16],
    pub vs: [u8; 1024],
}

const _: () = assert!(size_of::<IdentifyNamespaceZns>() == 4096);

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct LbaFormatExtension {
    /// Zone size in logical blocks.
    pub zsze: u64,
    /// Zone descriptor extension size, in 64-byte units.
    pub zdes: u8,
    pub rsvd: [u8; 7],
}
