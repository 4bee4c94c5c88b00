// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A fixed-capacity pool of request slots.
//!
//! Every slot is on exactly one of two lists: the free list, or the active
//! list, which is kept sorted by completion target time. Links are slot
//! indices, so the pool never allocates after construction.

use crate::buffer::ReleasableBuffer;
use crate::error::CommandResult;
use crate::namespace::Transfer;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SlotIndex(u32);

impl SlotIndex {
    fn get(self) -> usize {
        self.0 as usize
    }
}

/// A command (or internal operation) scheduled on an I/O worker.
#[derive(Default)]
pub struct Request {
    pub sqid: u16,
    pub cqid: u16,
    /// Which incarnation of `cqid` the completion belongs to.
    pub cq_generation: u64,
    pub sq_entry: u16,
    pub command_id: u16,
    /// When the dispatcher fetched the command.
    pub nsecs_start: u64,
    /// When the command completes.
    pub nsecs_target: u64,
    pub nsecs_enqueue: u64,
    pub nsecs_copy_start: u64,
    pub nsecs_copy_done: u64,
    pub nsecs_cq_filled: u64,
    pub is_copied: bool,
    pub is_completed: bool,
    /// Internal operations hold device resources and never reach a
    /// completion queue.
    pub is_internal: bool,
    pub result: CommandResult,
    /// Data movement to host memory, run no later than completion.
    pub transfer: Option<Transfer>,
    pub buffer: Option<Box<dyn ReleasableBuffer>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("sqid", &self.sqid)
            .field("cqid", &self.cqid)
            .field("command_id", &self.command_id)
            .field("nsecs_target", &self.nsecs_target)
            .field("is_internal", &self.is_internal)
            .field("result", &self.result)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Slot {
    request: Option<Request>,
    prev: Option<SlotIndex>,
    next: Option<SlotIndex>,
}

#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<Slot>,
    free_head: Option<SlotIndex>,
    free_len: usize,
    active_head: Option<SlotIndex>,
    active_tail: Option<SlotIndex>,
    active_len: usize,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= u32::MAX as usize);
        let slots = (0..capacity)
            .map(|i| Slot {
                next: (i + 1 < capacity).then_some(SlotIndex(i as u32 + 1)),
                ..Default::default()
            })
            .collect();
        Self {
            slots,
            free_head: Some(SlotIndex(0)),
            free_len: capacity,
            active_head: None,
            active_tail: None,
            active_len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_len(&self) -> usize {
        self.free_len
    }

    pub fn active_len(&self) -> usize {
        self.active_len
    }

    /// The active request with the earliest target.
    pub fn head(&self) -> Option<SlotIndex> {
        self.active_head
    }

    pub fn next(&self, idx: SlotIndex) -> Option<SlotIndex> {
        self.slots[idx.get()].next
    }

    pub fn get(&self, idx: SlotIndex) -> &Request {
        self.slots[idx.get()]
            .request
            .as_ref()
            .unwrap_or_else(|| panic!("slot {idx:?} is not active"))
    }

    pub fn get_mut(&mut self, idx: SlotIndex) -> &mut Request {
        self.slots[idx.get()]
            .request
            .as_mut()
            .unwrap_or_else(|| panic!("slot {idx:?} is not active"))
    }

    /// Active slots in completion order.
    pub fn iter_active(&self) -> impl '_ + Iterator<Item = SlotIndex> {
        std::iter::successors(self.active_head, |&idx| self.next(idx))
    }

    pub fn find_active(&self, sqid: u16, command_id: u16) -> Option<SlotIndex> {
        self.iter_active().find(|&idx| {
            let r = self.get(idx);
            !r.is_internal && r.sqid == sqid && r.command_id == command_id
        })
    }

    /// Moves a free slot onto the active list, keeping the list ordered by
    /// target time. Requests with equal targets stay in admission order.
    ///
    /// Returns the request back if no slot is free.
    pub fn admit(&mut self, request: Request) -> Result<SlotIndex, Request> {
        let Some(idx) = self.free_head else {
            return Err(request);
        };
        self.free_head = self.slots[idx.get()].next;
        self.free_len -= 1;

        // Walk back from the tail: new requests usually complete last.
        let target = request.nsecs_target;
        let mut after = self.active_tail;
        while let Some(cur) = after {
            if self.get(cur).nsecs_target <= target {
                break;
            }
            after = self.slots[cur.get()].prev;
        }

        let before = match after {
            Some(after) => self.slots[after.get()].next,
            None => self.active_head,
        };
        let slot = &mut self.slots[idx.get()];
        slot.request = Some(request);
        slot.prev = after;
        slot.next = before;
        match after {
            Some(after) => self.slots[after.get()].next = Some(idx),
            None => self.active_head = Some(idx),
        }
        match before {
            Some(before) => self.slots[before.get()].prev = Some(idx),
            None => self.active_tail = Some(idx),
        }
        self.active_len += 1;
        Ok(idx)
    }

    /// Moves an active slot back to the free list.
    pub fn retire(&mut self, idx: SlotIndex) -> Request {
        let slot = &mut self.slots[idx.get()];
        let request = slot
            .request
            .take()
            .unwrap_or_else(|| panic!("slot {idx:?} is not active"));
        let (prev, next) = (slot.prev.take(), slot.next.take());
        match prev {
            Some(prev) => self.slots[prev.get()].next = next,
            None => self.active_head = next,
        }
        match next {
            Some(next) => self.slots[next.get()].prev = prev,
            None => self.active_tail = prev,
        }
        self.active_len -= 1;

        self.slots[idx.get()].next = self.free_head;
        self.free_head = Some(idx);
        self.free_len += 1;
        request
    }

    #[cfg(test)]
    pub fn check_invariants(&self) {
        let mut seen = vec![false; self.capacity()];
        let mut prev: Option<SlotIndex> = None;
        let mut last_target = 0;
        let mut active = 0;
        for idx in self.iter_active() {
            assert!(!seen[idx.get()]);
            seen[idx.get()] = true;
            assert_eq!(self.slots[idx.get()].prev, prev);
            let target = self.get(idx).nsecs_target;
            assert!(target >= last_target);
            last_target = target;
            prev = Some(idx);
            active += 1;
        }
        assert_eq!(self.active_tail, prev);
        assert_eq!(active, self.active_len);

        let mut free = 0;
        let mut cur = self.free_head;
        while let Some(idx) = cur {
            assert!(!seen[idx.get()]);
            seen[idx.get()] = true;
            assert!(self.slots[idx.get()].request.is_none());
            cur = self.slots[idx.get()].next;
            free += 1;
        }
        assert_eq!(free, self.free_len);
        assert!(seen.iter().all(|&s| s));
    }
}
