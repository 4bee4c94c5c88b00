// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types for parsing NVMe PRP (Physical Region Page) entries and lists.

use crate::error::NvmeError;
use crate::memory::HostMemory;
use crate::memory::MemoryError;
use crate::spec;
use crate::PAGE_MASK;
use crate::PAGE_SHIFT;
use crate::PAGE_SIZE;
use thiserror::Error;
use zerocopy::IntoBytes;

const PRP_PER_PAGE: usize = PAGE_SIZE / 8;

#[derive(Debug, Error)]
#[error("transfer of {len:#x} bytes exceeds the {range_len:#x} byte data pointer range")]
struct RangeTooShort {
    len: usize,
    range_len: usize,
}

#[derive(Debug)]
enum PrpPfns {
    Short([u64; 2]),
    Long(Vec<u64>),
}

/// A host data buffer described by a command's data pointer.
#[derive(Debug)]
pub struct PrpRange {
    offset: usize,
    len: usize,
    pfns: PrpPfns,
}

impl PrpRange {
    /// Parses a PRP range for memory of `len` bytes, from the two PRP values
    /// in `prp`.
    pub fn parse(mem: &HostMemory, len: usize, prp: [u64; 2]) -> Result<Self, NvmeError> {
        let offset = prp[0] as usize & (PAGE_SIZE - 1);
        let pfns = if len + offset <= PAGE_SIZE * 2 {
            PrpPfns::Short(prp.map(|x| x >> PAGE_SHIFT))
        } else {
            let count = (offset + len).div_ceil(PAGE_SIZE);
            let mut v = vec![0; count];
            v[0] = prp[0];
            let mut pfns = &mut v[1..];
            let mut next_prp_list = prp[1];
            loop {
                let n = pfns.len().min(PRP_PER_PAGE);
                mem.read_at(next_prp_list, pfns[..n].as_mut_bytes())
                    .map_err(|err| NvmeError::new(spec::Status::DATA_TRANSFER_ERROR, err))?;
                if n == pfns.len() {
                    break;
                }
                // The last entry of a full list page chains to the next page.
                next_prp_list = pfns[n - 1] & PAGE_MASK;
                pfns = &mut pfns[n - 1..];
            }
            for gpa in &mut v {
                *gpa >>= PAGE_SHIFT;
            }
            PrpPfns::Long(v)
        };
        Ok(Self { offset, len, pfns })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn pfns(&self) -> &[u64] {
        match &self.pfns {
            PrpPfns::Short(pfns) => pfns,
            PrpPfns::Long(pfns) => pfns,
        }
    }

    /// Calls `f` with the host address and buffer range of each page-bounded
    /// chunk of the first `len` bytes.
    fn for_each_chunk(
        &self,
        len: usize,
        mut f: impl FnMut(u64, std::ops::Range<usize>) -> Result<(), MemoryError>,
    ) -> Result<(), NvmeError> {
        if len > self.len {
            return Err(NvmeError::new(
                spec::Status::DATA_TRANSFER_ERROR,
                RangeTooShort {
                    len,
                    range_len: self.len,
                },
            ));
        }
        let mut done = 0;
        let mut offset = self.offset;
        for &pfn in self.pfns() {
            if done == len {
                break;
            }
            let n = (PAGE_SIZE - offset).min(len - done);
            f((pfn << PAGE_SHIFT) + offset as u64, done..done + n)
                .map_err(|err| NvmeError::new(spec::Status::DATA_TRANSFER_ERROR, err))?;
            done += n;
            offset = 0;
        }
        Ok(())
    }

    /// Reads from the range.
    pub fn read(&self, mem: &HostMemory, buf: &mut [u8]) -> Result<(), NvmeError> {
        self.for_each_chunk(buf.len(), |addr, range| mem.read_at(addr, &mut buf[range]))
    }

    /// Writes to the range.
    pub fn write(&self, mem: &HostMemory, buf: &[u8]) -> Result<(), NvmeError> {
        self.for_each_chunk(buf.len(), |addr, range| mem.write_at(addr, &buf[range]))
    }

    /// Writes zeroes to the range.
    pub fn zero(&self, mem: &HostMemory, len: usize) -> Result<(), NvmeError> {
        self.for_each_chunk(len, |addr, range| mem.zero(addr, range.len()))
    }
}
