// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVM command set definitions
//!
//! NVM Command Set 1.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-NVM-Command-Set-Specification-1.0c-2022.10.03-Ratified.pdf>

use crate::U128LE;
use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[repr(C)]
#[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Clone)]
pub struct IdentifyNamespace {
    pub nsze: u64,
    pub ncap: u64,
    pub nuse: u64,
    pub nsfeat: Nsfeat,
    /// Number of LBA formats. Zero based.
    pub nlbaf: u8,
    pub flbas: Flbas,
    pub mc: u8,
    pub dpc: u8,
    pub dps: u8,
    pub nmic: u8,
    pub rescap: u8,
    pub fpi: u8,
    pub dlfeat: u8,
    pub nawun: u16,
    pub nawupf: u16,
    pub nacwu: u16,
    pub nabsn: u16,
    pub nabo: u16,
    pub nabspf: u16,
    pub noiob: u16,
    pub nvmcap: U128LE,
    pub npwg: u16,
    pub npwa: u16,
    pub npdg: u16,
    pub npda: u16,
    pub nows: u16,
    pub mssrl: u16,
    pub mcl: u32,
    pub msrc: u8,
    pub rsvd1: [u8; 11],
    pub anagrpid: u32,
    pub rsvd2: [u8; 3],
    pub nsattr: u8,
    pub nvmsetid: u16,
    pub endgid: u16,
    pub nguid: [u8; 16],
    pub eui64: [u8; 8],
    pub lbaf: [Lbaf; 16],
    pub rsvd3: [u8; 192],
    pub vs: [u8; 3712],
}

const _: () = assert!(size_of::<IdentifyNamespace>() == 4096);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct NamespaceIdentifierType(pub u8);

impl NamespaceIdentifierType {
    pub const RESERVED: Self = Self(0x00);
    pub const IEEE: Self = Self(0x01);
    pub const NSGUID: Self = Self(0x02);
    pub const NSUUID: Self = Self(0x03);
    pub const CSI: Self = Self(0x04);
}

#[repr(C)]
#[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct NamespaceIdentificationDescriptor {
    pub nidt: u8, // NamespaceIdentifierType
    pub nidl: u8,
    pub rsvd: [u8; 2],
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Nsfeat {
    /// Thin provisioning
    pub thinp: bool,
    /// NAWUN, NAWUPF, NACWU are defined.
    pub nsabp: bool,
    /// Namespace supports deallocated or unwritten logical block error.
    pub dae: bool,
    pub uidreuse: bool,
    /// NPWG, NPWA, NPDG, NPDA, and NOWS are defined for this namespace.
    pub optperf: bool,
    #[bits(3)]
    _rsvd: u8,
}

/// LBA format
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Lbaf {
    /// Metadata size
    pub ms: u16,
    /// LBA data size (as power of two)
    pub lbads: u8,
    /// Relative performance
    #[bits(2)]
    pub rp: u8,
    #[bits(6)]
    _rsvd: u8,
}

/// Formatted LBA size
#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Flbas {
    #[bits(4)]
    pub low_index: u8,
    pub inband_metadata: bool,
    /// High bits of the index. Only valid if NLBAF > 16.
    #[bits(2)]
    pub high_index: u8,
    #[bits(1)]
    _rsvd: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct NvmOpcode(pub u8);

impl NvmOpcode {
    pub const FLUSH: Self = Self(0x00);
    pub const WRITE: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_UNCORRECTABLE: Self = Self(0x04);
    pub const COMPARE: Self = Self(0x05);
    pub const WRITE_ZEROES: Self = Self(0x08);
    /// Dataset management.
    pub const DSM: Self = Self(0x09);
}

#[bitfield(u32)]
pub struct Cdw10ReadWrite {
    /// Starting LBA, low 32 bits.
    pub sbla_low: u32,
}

#[bitfield(u32)]
pub struct Cdw11ReadWrite {
    /// Starting LBA, high 32 bits.
    pub sbla_high: u32,
}

#[bitfield(u32)]
pub struct Cdw12ReadWrite {
    /// Number of logical blocks. Zero-based.
    pub nlb_z: u16,
    #[bits(4)]
    _rsvd: u8,
    /// Directive type (write only).
    #[bits(4)]
    pub dtype: u8,
    /// Storage tag check.
    pub stc: bool,
    _rsvd2: bool,
    /// Protection information
    #[bits(4)]
    pub prinfo: u8,
    /// Force unit access
    pub fua: bool,
    /// Limited retry
    pub lr: bool,
}

#[bitfield(u32)]
pub struct Cdw10Dsm {
    /// Number of ranges. Zero-based.
    pub nr_z: u8,
    #[bits(24)]
    _rsvd: u32,
}

#[bitfield(u32)]
pub struct Cdw11Dsm {
    /// Integral dataset for read.
    pub idr: bool,
    /// Integral dataset for write.
    pub idw: bool,
    /// Deallocate.
    pub ad: bool,
    #[bits(29)]
    _rsvd: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DsmRange {
    pub context_attributes: u32,
    pub lba_count: u32,
    pub starting_lba: u64,
}
