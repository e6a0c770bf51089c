//! Shared-ring endpoints.
//!
//! One 4096-byte page carries requests one way and responses the other, with
//! free-running u32 producer/consumer indices and an event-threshold
//! notification scheme. [`BackRing`] is the backend half the core drives;
//! [`FrontRing`] is the guest half, included so tests, demos, and in-process
//! frontends can drive a backend end to end.
//!
//! # Memory ordering & notification protocol
//!
//! Each side owns one private index (`req_cons` / `rsp_prod_pvt` for the
//! backend) that never touches shared memory, plus the shared header:
//!
//! - `req_prod` is written by the frontend with Release after it has encoded
//!   its requests; the backend reads it with Acquire before decoding.
//! - `rsp_prod` is written by the backend with Release after it has encoded
//!   its responses; the frontend reads it with Acquire before decoding.
//! - `req_event` / `rsp_event` are the notification thresholds. A producer
//!   notifies its peer only when the just-published range crosses the
//!   peer's threshold: `new - event < new - old` in wrapping u32 space.
//! - Re-arming (`final_check_*`) stores `event = cons + 1`, then a full
//!   fence, then re-checks the producer index. The fence closes the race
//!   where the peer publishes between the last check and the store.
//!
//! Entry payloads need no ordering of their own: an entry is only decoded
//! after the Acquire load that observed its index published, and only
//! overwritten after the peer's consumer index has moved past it.

use crate::invariants::debug_assert_responses_fit;
use crate::wire::{
    Protocol, RingLayout, RingRequest, RingResponse, REQ_EVENT, REQ_PROD, RSP_EVENT, RSP_PROD,
};
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, Ordering};

#[inline]
unsafe fn hdr<'a>(page: NonNull<u8>, off: usize) -> &'a AtomicU32 {
    // SAFETY: the header indices live at 4-aligned offsets within the
    // page-aligned shared page; the caller guarantees the page outlives 'a.
    unsafe { AtomicU32::from_ptr(page.as_ptr().add(off).cast()) }
}

/// The backend endpoint: consumes requests, produces responses.
#[derive(Debug)]
pub struct BackRing {
    page: NonNull<u8>,
    layout: &'static RingLayout,
    size: u32,
    /// Next request index to consume. Private to the backend.
    req_cons: u32,
    /// Next response index to fill. Private until published.
    rsp_prod_pvt: u32,
}

impl BackRing {
    /// Wraps the backend half of an initialised shared ring page.
    ///
    /// # Safety
    ///
    /// `page` must point to a 4096-byte shared ring page, initialised by the
    /// frontend, that outlives the ring; no other backend endpoint may drive
    /// the same page.
    pub unsafe fn new(page: NonNull<u8>, proto: Protocol) -> Self {
        Self {
            page,
            layout: proto.layout(),
            size: proto.ring_size(),
            req_cons: 0,
            rsp_prod_pvt: 0,
        }
    }

    /// Number of request descriptors the ring holds.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Requests published but not yet consumed.
    pub fn pending(&self) -> u32 {
        let prod = unsafe { hdr(self.page, REQ_PROD) }.load(Ordering::Acquire);
        let work = prod.wrapping_sub(self.req_cons);
        if work > self.size {
            // A broken or malicious frontend ran its producer off the ring.
            // The mask keeps decoding in bounds either way; stop at a full
            // ring's worth.
            tracing::error!(prod, cons = self.req_cons, "request producer overflow");
            return self.size;
        }
        work
    }

    /// Snapshots and consumes the next pending request, if any.
    pub fn take_request(&mut self) -> Option<RingRequest> {
        if self.pending() == 0 {
            return None;
        }
        // SAFETY: the page is live per the constructor contract and the
        // index is masked into the entry array.
        let req = unsafe {
            RingRequest::read(self.page.as_ptr(), self.layout, self.req_cons, self.size)
        };
        self.req_cons = self.req_cons.wrapping_add(1);
        Some(req)
    }

    /// Writes a response at the private producer index and reserves the slot
    /// by advancing it. Nothing is visible to the guest until
    /// [`BackRing::push_responses_and_check_notify`].
    pub fn put_response(&mut self, rsp: &RingResponse) {
        let shared = unsafe { hdr(self.page, RSP_PROD) }.load(Ordering::Relaxed);
        debug_assert_responses_fit!(self.rsp_prod_pvt.wrapping_add(1), shared, self.size);
        // SAFETY: as in `take_request`, with the page writable by this side.
        unsafe {
            rsp.write(self.page.as_ptr(), self.layout, self.rsp_prod_pvt, self.size);
        }
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
    }

    /// Publishes every outstanding response and evaluates the notification
    /// predicate: `true` when the guest asked to be woken for this range.
    pub fn push_responses_and_check_notify(&mut self) -> bool {
        let rsp_prod = unsafe { hdr(self.page, RSP_PROD) };
        let old = rsp_prod.load(Ordering::Relaxed);
        let new = self.rsp_prod_pvt;
        rsp_prod.store(new, Ordering::Release);
        fence(Ordering::SeqCst);
        let event = unsafe { hdr(self.page, RSP_EVENT) }.load(Ordering::Relaxed);
        new.wrapping_sub(event) < new.wrapping_sub(old)
    }

    /// Re-arms the request notification threshold and re-checks for work.
    /// Returns the number of requests that slipped in before the re-arm.
    pub fn final_check_for_requests(&mut self) -> u32 {
        let work = self.pending();
        if work != 0 {
            return work;
        }
        unsafe { hdr(self.page, REQ_EVENT) }
            .store(self.req_cons.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.pending()
    }
}

/// The guest endpoint: produces requests, consumes responses.
#[derive(Debug)]
pub struct FrontRing {
    page: NonNull<u8>,
    layout: &'static RingLayout,
    size: u32,
    /// Next request index to fill. Private until published.
    req_prod_pvt: u32,
    /// Next response index to consume. Private to the frontend.
    rsp_cons: u32,
}

impl FrontRing {
    /// Initialises a fresh shared ring page: indices zeroed, both event
    /// thresholds armed at 1 so the first publish on either side notifies.
    ///
    /// # Safety
    ///
    /// `page` must point to 4096 zeroed bytes not yet shared with a peer.
    pub unsafe fn init(page: NonNull<u8>) {
        unsafe {
            hdr(page, REQ_PROD).store(0, Ordering::Relaxed);
            hdr(page, RSP_PROD).store(0, Ordering::Relaxed);
            hdr(page, REQ_EVENT).store(1, Ordering::Relaxed);
            hdr(page, RSP_EVENT).store(1, Ordering::Release);
        }
    }

    /// Wraps the guest half of an initialised shared ring page.
    ///
    /// # Safety
    ///
    /// Same contract as [`BackRing::new`], for the frontend side.
    pub unsafe fn new(page: NonNull<u8>, proto: Protocol) -> Self {
        Self {
            page,
            layout: proto.layout(),
            size: proto.ring_size(),
            req_prod_pvt: 0,
            rsp_cons: 0,
        }
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Room left for unpublished requests.
    pub fn free_entries(&self) -> u32 {
        self.size - self.req_prod_pvt.wrapping_sub(self.rsp_cons)
    }

    /// Writes a request at the private producer index.
    ///
    /// # Panics
    ///
    /// Panics when the ring is full; callers throttle on `free_entries`.
    pub fn push_request(&mut self, req: &RingRequest) {
        assert!(self.free_entries() > 0, "request ring full");
        // SAFETY: the page is live per the constructor contract and the
        // index is masked into the entry array.
        unsafe {
            req.write(self.page.as_ptr(), self.layout, self.req_prod_pvt, self.size);
        }
        self.req_prod_pvt = self.req_prod_pvt.wrapping_add(1);
    }

    /// Publishes every outstanding request; `true` when the backend asked to
    /// be woken for this range.
    pub fn push_requests_and_check_notify(&mut self) -> bool {
        let req_prod = unsafe { hdr(self.page, REQ_PROD) };
        let old = req_prod.load(Ordering::Relaxed);
        let new = self.req_prod_pvt;
        req_prod.store(new, Ordering::Release);
        fence(Ordering::SeqCst);
        let event = unsafe { hdr(self.page, REQ_EVENT) }.load(Ordering::Relaxed);
        new.wrapping_sub(event) < new.wrapping_sub(old)
    }

    /// Responses published but not yet consumed.
    pub fn pending_responses(&self) -> u32 {
        let prod = unsafe { hdr(self.page, RSP_PROD) }.load(Ordering::Acquire);
        prod.wrapping_sub(self.rsp_cons).min(self.size)
    }

    /// Snapshots and consumes the next pending response, if any.
    pub fn take_response(&mut self) -> Option<RingResponse> {
        if self.pending_responses() == 0 {
            return None;
        }
        // SAFETY: as in `push_request`, reading the backend's entries.
        let rsp = unsafe {
            RingResponse::read(self.page.as_ptr(), self.layout, self.rsp_cons, self.size)
        };
        self.rsp_cons = self.rsp_cons.wrapping_add(1);
        Some(rsp)
    }

    /// Re-arms the response notification threshold and re-checks.
    pub fn final_check_for_responses(&mut self) -> u32 {
        let work = self.pending_responses();
        if work != 0 {
            return work;
        }
        unsafe { hdr(self.page, RSP_EVENT) }
            .store(self.rsp_cons.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.pending_responses()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounce::PageBuf;
    use crate::wire::{OP_READ, RSP_OKAY};

    fn ring_pair(proto: Protocol) -> (PageBuf, FrontRing, BackRing) {
        let page = PageBuf::alloc(1).unwrap();
        // SAFETY: freshly allocated zeroed page, kept alive by the caller
        // holding the returned PageBuf.
        unsafe {
            FrontRing::init(page.as_ptr());
            let front = FrontRing::new(page.as_ptr(), proto);
            let back = BackRing::new(page.as_ptr(), proto);
            (page, front, back)
        }
    }

    fn read_request(id: u64) -> RingRequest {
        let mut req = RingRequest {
            operation: OP_READ,
            nr_segments: 1,
            id,
            ..RingRequest::default()
        };
        req.segs[0].gref = 0x10;
        req.segs[0].last_sect = 7;
        req
    }

    #[test]
    fn test_request_flow_and_notify() {
        let (_page, mut front, mut back) = ring_pair(Protocol::Native);
        assert_eq!(back.pending(), 0);

        front.push_request(&read_request(1));
        front.push_request(&read_request(2));
        // Threshold was armed at 1, so the first publish notifies.
        assert!(front.push_requests_and_check_notify());

        assert_eq!(back.pending(), 2);
        assert_eq!(back.take_request().unwrap().id, 1);
        assert_eq!(back.take_request().unwrap().id, 2);
        assert!(back.take_request().is_none());
    }

    #[test]
    fn test_no_notify_until_rearm() {
        let (_page, mut front, mut back) = ring_pair(Protocol::Native);

        front.push_request(&read_request(1));
        assert!(front.push_requests_and_check_notify());
        assert_eq!(back.take_request().unwrap().id, 1);

        // Backend has not re-armed: further publishes stay silent.
        front.push_request(&read_request(2));
        assert!(!front.push_requests_and_check_notify());

        // Re-arm finds the request that slipped in.
        assert_eq!(back.final_check_for_requests(), 1);
        assert_eq!(back.take_request().unwrap().id, 2);
        assert_eq!(back.final_check_for_requests(), 0);

        // Armed again: the next publish notifies.
        front.push_request(&read_request(3));
        assert!(front.push_requests_and_check_notify());
    }

    #[test]
    fn test_response_flow_and_notify() {
        let (_page, mut front, mut back) = ring_pair(Protocol::X86_32);

        front.push_request(&read_request(7));
        front.push_requests_and_check_notify();
        let req = back.take_request().unwrap();

        back.put_response(&RingResponse { id: req.id, operation: req.operation, status: RSP_OKAY });
        // Frontend armed its threshold at init time.
        assert!(back.push_responses_and_check_notify());

        let rsp = front.take_response().unwrap();
        assert_eq!(rsp.id, 7);
        assert_eq!(rsp.status, RSP_OKAY);
        assert_eq!(front.pending_responses(), 0);
        // Nothing slipped in, and the response threshold is re-armed.
        assert_eq!(front.final_check_for_responses(), 0);
    }

    #[test]
    fn test_batched_responses_single_notify() {
        let (_page, mut front, mut back) = ring_pair(Protocol::Native);

        for id in 0..4 {
            front.push_request(&read_request(id));
        }
        front.push_requests_and_check_notify();
        for _ in 0..4 {
            let req = back.take_request().unwrap();
            back.put_response(&RingResponse {
                id: req.id,
                operation: req.operation,
                status: RSP_OKAY,
            });
        }

        // One publish covers the whole batch and fires once.
        assert!(back.push_responses_and_check_notify());
        assert_eq!(front.pending_responses(), 4);
        // Publishing again with nothing new stays silent.
        assert!(!back.push_responses_and_check_notify());
    }

    #[test]
    fn test_producer_overflow_is_clamped() {
        let (page, mut front, back) = ring_pair(Protocol::Native);
        front.push_request(&read_request(1));
        front.push_requests_and_check_notify();

        // A hostile frontend runs the producer far ahead.
        unsafe { hdr(page.as_ptr(), REQ_PROD) }.store(1000, Ordering::Release);
        assert_eq!(back.pending(), back.size());
    }

    #[test]
    fn test_index_wraparound() {
        let (_page, mut front, mut back) = ring_pair(Protocol::Native);

        // Drive both indices several times around the 32-entry ring.
        for round in 0..100u64 {
            front.push_request(&read_request(round));
            front.push_requests_and_check_notify();
            let req = back.take_request().unwrap();
            assert_eq!(req.id, round);
            back.put_response(&RingResponse {
                id: req.id,
                operation: req.operation,
                status: RSP_OKAY,
            });
            back.push_responses_and_check_notify();
            assert_eq!(front.take_response().unwrap().id, round);
        }
    }
}
