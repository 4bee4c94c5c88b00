// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key value command set definitions
//!
//! The key is carried inline in the command: bytes 0..8 in CDW2 and CDW3,
//! bytes 8..16 in CDW14 and CDW15.

use crate::Command;
use bitfield_struct::bitfield;

pub const MAX_KEY_LENGTH: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct KvOpcode(pub u8);

impl KvOpcode {
    pub const STORE: Self = Self(0x81);
    pub const APPEND: Self = Self(0x83);
    pub const BATCH: Self = Self(0x85);
    pub const RETRIEVE: Self = Self(0x90);
    pub const DELETE: Self = Self(0xa1);
    pub const ITERATE_REQUEST: Self = Self(0xb1);
    pub const ITERATE_READ: Self = Self(0xb2);
    pub const EXIST: Self = Self(0xb3);
}

/// CDW10 carries the host buffer (value) size in bytes.
#[bitfield(u32)]
pub struct Cdw11Kv {
    /// Key length in bytes. Not zero based.
    pub key_length: u8,
    /// Store or retrieve options.
    pub options: u8,
    _rsvd: u16,
}

/// Extracts the inline key bytes from a key value command. Returns `None`
/// if the key length is zero or larger than [`MAX_KEY_LENGTH`].
pub fn command_key(command: &Command) -> Option<([u8; MAX_KEY_LENGTH], usize)> {
    let len = Cdw11Kv::from(command.cdw11).key_length() as usize;
    if len == 0 || len > MAX_KEY_LENGTH {
        return None;
    }
    let mut key = [0; MAX_KEY_LENGTH];
    key[0..4].copy_from_slice(&command.cdw2.to_le_bytes());
    key[4..8].copy_from_slice(&command.cdw3.to_le_bytes());
    key[8..12].copy_from_slice(&command.cdw14.to_le_bytes());
    key[12..16].copy_from_slice(&command.cdw15.to_le_bytes());
    Some((key, len))
}

/// Stores `key` into a command's key fields and key length.
pub fn set_command_key(command: &mut Command, key: &[u8]) {
    let mut buf = [0; MAX_KEY_LENGTH];
    let len = key.len().min(MAX_KEY_LENGTH);
    buf[..len].copy_from_slice(&key[..len]);
    let dword = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
    command.cdw2 = dword(0);
    command.cdw3 = dword(4);
    command.cdw14 = dword(8);
    command.cdw15 = dword(12);
    command.cdw11 = Cdw11Kv::from(command.cdw11)
        .with_key_length(len as u8)
        .into();
}
