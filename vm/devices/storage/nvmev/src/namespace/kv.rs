// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A key value namespace held in memory.

use super::check_transfer_size;
use super::CommandContext;
use super::CommandProcessor;
use super::Execution;
use super::NamespaceSummary;
use crate::error::NvmeError;
use crate::prp::PrpRange;
use crate::spec;
use crate::spec::kv;
use crate::timing::IoProfile;
use parking_lot::Mutex;
use std::collections::BTreeMap;

const KV_BLOCK_SHIFT: u32 = 12;

#[derive(Debug, Default)]
struct KvStore {
    values: BTreeMap<Vec<u8>, Vec<u8>>,
    used: u64,
}

/// A key value namespace with a fixed byte capacity.
#[derive(Debug)]
pub struct KvNamespace {
    capacity: u64,
    store: Mutex<KvStore>,
}

impl KvNamespace {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            store: Mutex::new(KvStore::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.store.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(command: &spec::Command) -> Result<Vec<u8>, NvmeError> {
        let (key, len) = kv::command_key(command).ok_or(spec::Status::KV_INVALID_KEY_SIZE)?;
        Ok(key[..len].to_vec())
    }

    /// Reads the value carried by a store or append command.
    fn read_value(
        ctx: &CommandContext<'_>,
        command: &spec::Command,
    ) -> Result<Vec<u8>, NvmeError> {
        let len = command.cdw10 as usize;
        let prp = PrpRange::parse(ctx.mem, len, command.dptr)?;
        let mut value = vec![0; len];
        prp.read(ctx.mem, &mut value)?;
        Ok(value)
    }
}

impl CommandProcessor for KvNamespace {
    fn summary(&self) -> NamespaceSummary {
        NamespaceSummary {
            csi: spec::Csi::KEY_VALUE,
            size_lbas: self.capacity >> KV_BLOCK_SHIFT,
            block_shift: KV_BLOCK_SHIFT,
            partitions: 1,
        }
    }

    fn validate(&self, ctx: &CommandContext<'_>, command: &spec::Command) -> Result<(), NvmeError> {
        let opcode = kv::KvOpcode(command.cdw0.opcode());
        match opcode {
            kv::KvOpcode::STORE | kv::KvOpcode::APPEND => {
                Self::key(command)?;
                let len = command.cdw10 as usize;
                if len == 0 {
                    return Err(spec::Status::KV_INVALID_VALUE_SIZE.into());
                }
                check_transfer_size(ctx, len)
                    .map_err(|_| NvmeError::from(spec::Status::KV_INVALID_VALUE_SIZE))
            }
            kv::KvOpcode::RETRIEVE => {
                Self::key(command)?;
                check_transfer_size(ctx, command.cdw10 as usize)
            }
            kv::KvOpcode::DELETE | kv::KvOpcode::EXIST => Self::key(command).map(drop),
            opcode => {
                tracing::warn!(?opcode, "unsupported key value opcode");
                Err(spec::Status::INVALID_COMMAND_OPCODE.into())
            }
        }
    }

    fn execute(
        &self,
        ctx: &CommandContext<'_>,
        command: &spec::Command,
    ) -> Result<Execution, NvmeError> {
        let opcode = kv::KvOpcode(command.cdw0.opcode());
        let key = Self::key(command)?;
        tracing::trace!(?opcode, key_len = key.len(), "key value command");
        let execution = match opcode {
            kv::KvOpcode::STORE | kv::KvOpcode::APPEND => {
                let value = Self::read_value(ctx, command)?;
                let len = value.len() as u64;
                let mut store = self.store.lock();
                let store = &mut *store;
                let old_len = store.values.get(&key).map_or(0, |v| v.len() as u64);
                let new_len = if opcode == kv::KvOpcode::APPEND {
                    old_len + len
                } else {
                    len
                };
                if store.used - old_len + new_len > self.capacity {
                    return Err(spec::Status::CAPACITY_EXCEEDED.into());
                }
                store.used = store.used - old_len + new_len;
                if opcode == kv::KvOpcode::APPEND {
                    store.values.entry(key).or_default().extend(value);
                } else {
                    store.values.insert(key, value);
                }
                Execution::new(IoProfile::write(len))
            }
            kv::KvOpcode::RETRIEVE => {
                let value = self
                    .store
                    .lock()
                    .values
                    .get(&key)
                    .cloned()
                    .ok_or(spec::Status::KV_KEY_DOES_NOT_EXIST)?;
                let value_len = value.len();
                let len = value_len.min(command.cdw10 as usize);
                let prp = PrpRange::parse(ctx.mem, len, command.dptr)?;
                Execution::new(IoProfile::read(len as u64))
                    .with_result([value_len as u32, 0])
                    .with_transfer(Box::new(move |mem| prp.write(mem, &value[..len])))
            }
            kv::KvOpcode::DELETE => {
                let mut store = self.store.lock();
                let value = store
                    .values
                    .remove(&key)
                    .ok_or(spec::Status::KV_KEY_DOES_NOT_EXIST)?;
                store.used -= value.len() as u64;
                Execution::new(IoProfile::other())
            }
            kv::KvOpcode::EXIST => {
                if !self.store.lock().values.contains_key(&key) {
                    return Err(spec::Status::KV_KEY_DOES_NOT_EXIST.into());
                }
                Execution::new(IoProfile::other())
            }
            _ => return Err(spec::Status::INVALID_COMMAND_OPCODE.into()),
        };
        Ok(execution)
    }
}
