//! Request slots and the fixed pool that vends them.
//!
//! The pool owns `ring_size` slots and an index free list of the same
//! length. Sizing the pool to the ring makes admission control implicit: the
//! drainer never pulls more requests than it can hold, and every slot is, at
//! any instant, either on the free list or owned by exactly one in-flight
//! request.

use crate::bounce::PageBuf;
use crate::error::Error;
use crate::gnttab::Prot;
use crate::image::{BlkOp, IoSpan};
use crate::invariants::{debug_assert_free_bounded, debug_assert_not_free, debug_assert_slot_idle};
use crate::wire::{Segment, MAX_SEGMENTS};

/// One request slot: the wire-header snapshot paired with the request's
/// in-flight state.
#[derive(Debug)]
pub struct TapReq {
    /// Wire id, echoed in the response.
    pub id: u64,
    /// Wire operation byte, echoed in the response (even when unsupported).
    pub wire_op: u8,
    /// Resolved operation. Meaningless until translation classifies it.
    pub op: BlkOp,
    /// Grant-map protection derived from the operation.
    pub prot: Prot,
    pub sector: u64,
    pub nr_segments: usize,
    /// Grant references captured from the snapshot's segments.
    pub grefs: [u32; MAX_SEGMENTS],
    /// Sector ranges captured from the snapshot's segments.
    pub segs: [Segment; MAX_SEGMENTS],
    /// Scratch pages for the payload; present exactly while in flight
    /// between translation success and completion end.
    pub bounce: Option<PageBuf>,
    /// Scatter/gather vector over the bounce buffer.
    pub iov: [IoSpan; MAX_SEGMENTS],
    pub iovcnt: usize,
    /// Stable name for log correlation.
    pub name: String,
}

impl TapReq {
    pub(crate) fn new() -> Self {
        Self {
            id: 0,
            wire_op: 0,
            op: BlkOp::Read,
            prot: Prot::Read,
            sector: 0,
            nr_segments: 0,
            grefs: [0; MAX_SEGMENTS],
            segs: [Segment::default(); MAX_SEGMENTS],
            bounce: None,
            iov: [IoSpan::default(); MAX_SEGMENTS],
            iovcnt: 0,
            name: String::new(),
        }
    }
}

/// Fixed pool of request slots with an index free list.
#[derive(Debug)]
pub struct ReqPool {
    slots: Box<[TapReq]>,
    free: Vec<usize>,
}

impl ReqPool {
    /// Allocates `size` slots and pushes every one onto the free list.
    pub fn new(size: usize) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::OutOfMemory);
        }
        let slots: Box<[TapReq]> = (0..size).map(|_| TapReq::new()).collect();
        let free: Vec<usize> = (0..size).collect();
        Ok(Self { slots, free })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Takes a free slot, or `None` when every slot is in flight.
    pub fn acquire(&mut self) -> Option<usize> {
        let idx = self.free.pop()?;
        debug_assert_slot_idle!(self.slots[idx], idx);
        Some(idx)
    }

    /// Returns a retired slot to the free list.
    pub fn release(&mut self, idx: usize) {
        debug_assert_not_free!(self.free, idx);
        debug_assert_slot_idle!(self.slots[idx], idx);
        self.free.push(idx);
        debug_assert_free_bounded!(self.free.len(), self.slots.len());
    }

    #[inline]
    pub(crate) fn slot(&self, idx: usize) -> &TapReq {
        &self.slots[idx]
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, idx: usize) -> &mut TapReq {
        &mut self.slots[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_full() {
        let pool = ReqPool::new(32).unwrap();
        assert_eq!(pool.size(), 32);
        assert_eq!(pool.free_count(), 32);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let mut pool = ReqPool::new(4).unwrap();
        let mut held = Vec::new();
        while let Some(idx) = pool.acquire() {
            held.push(idx);
        }
        assert_eq!(held.len(), 4);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.in_flight(), 4);

        // All four indices are distinct.
        held.sort_unstable();
        held.dedup();
        assert_eq!(held.len(), 4);
    }

    #[test]
    fn test_release_restores_free_count() {
        let mut pool = ReqPool::new(4).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already on the free list")]
    fn test_double_release_asserts() {
        let mut pool = ReqPool::new(2).unwrap();
        let idx = pool.acquire().unwrap();
        pool.release(idx);
        pool.release(idx);
    }

    #[test]
    fn test_zero_size_pool_rejected() {
        assert!(matches!(ReqPool::new(0), Err(Error::OutOfMemory)));
    }
}
