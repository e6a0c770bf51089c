//! The block interface: one attached virtual disk and its request lifecycle.
//!
//! A `Blkif` drains its shared ring in bounded batches, translates each
//! request into an image descriptor, and finalises requests as the image
//! subsystem completes them. Everything runs on one thread; the only
//! blocking points are grant map/unmap and the event-channel notify, which
//! run to completion inline.

use crate::error::Error;
use crate::evtchn::EventChannel;
use crate::gnttab::GrantTable;
use crate::image::{BlkOp, Completion, ImageIo, ImageRequest};
use crate::pool::ReqPool;
use crate::ring::BackRing;
use crate::stats::BlkifStats;
use crate::translate;
use crate::wire::{Protocol, RingRequest, RingResponse, RSP_OKAY};
use std::rc::Rc;

/// Attach-time parameters of one block interface.
#[derive(Debug, Clone, Copy)]
pub struct BlkifConfig {
    /// Guest domain the ring and grants belong to.
    pub domid: u16,
    /// Device id within that domain.
    pub devid: u16,
    /// Ring layout negotiated at attach. Immutable afterwards.
    pub protocol: Protocol,
    /// Event-channel port bound to the ring.
    pub port: u32,
}

/// One attached virtual disk.
///
/// Must outlive every request it owns: completions reference pool slots and
/// the image subsystem holds bounce-buffer pointers until they are drained.
pub struct Blkif {
    domid: u16,
    devid: u16,
    port: u32,
    token: u64,
    ring: BackRing,
    pool: ReqPool,
    stats: BlkifStats,
    gnttab: Rc<dyn GrantTable>,
    evtchn: Rc<dyn EventChannel>,
    image: Box<dyn ImageIo>,
    completions: Vec<Completion>,
}

impl Blkif {
    /// Attaches the interface: sizes the request pool to the ring.
    ///
    /// Only pool allocation can fail here; ring-protocol validation happens
    /// when the caller parses the protocol tag.
    pub fn new(
        cfg: BlkifConfig,
        ring: BackRing,
        gnttab: Rc<dyn GrantTable>,
        evtchn: Rc<dyn EventChannel>,
        image: Box<dyn ImageIo>,
    ) -> Result<Self, Error> {
        let pool = ReqPool::new(ring.size() as usize)?;
        tracing::info!(
            domid = cfg.domid,
            devid = cfg.devid,
            protocol = ?cfg.protocol,
            ring_size = ring.size(),
            "block interface attached"
        );
        Ok(Self {
            domid: cfg.domid,
            devid: cfg.devid,
            port: cfg.port,
            token: (u64::from(cfg.domid) << 16) | u64::from(cfg.devid),
            ring,
            pool,
            stats: BlkifStats::new(),
            gnttab,
            evtchn,
            image,
            completions: Vec::new(),
        })
    }

    /// Opaque identity echoed through image completions.
    #[inline]
    pub fn token(&self) -> u64 {
        self.token
    }

    #[inline]
    pub fn stats(&self) -> &BlkifStats {
        &self.stats
    }

    /// Requests currently between slot acquisition and completion end.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Handles one ring wakeup: drains pending requests in batches bounded
    /// by the free slot count, re-arming the ring's notification threshold
    /// before concluding it is empty.
    pub fn kick(&mut self) {
        self.stats.kicks_in += 1;
        loop {
            let budget = self.pool.free_count();
            if budget == 0 {
                return;
            }

            let mut batch: Vec<RingRequest> = Vec::with_capacity(budget);
            while batch.len() < budget {
                match self.ring.take_request() {
                    Some(msg) => batch.push(msg),
                    None => break,
                }
            }

            if batch.is_empty() {
                if self.ring.final_check_for_requests() == 0 {
                    return;
                }
                continue;
            }

            self.stats.reqs_in += batch.len() as u64;
            self.queue_requests(&batch);
        }
    }

    /// Queues one batch. A request that fails translation or submission is
    /// completed inline, alone in its response push; after the batch, any
    /// failure forces a response-less publish so the guest wakes even when
    /// every successful response went out unpublished.
    fn queue_requests(&mut self, batch: &[RingRequest]) {
        let mut errors = 0u32;
        for msg in batch {
            let Some(idx) = self.pool.acquire() else {
                // kick() never pulls more than free_count requests.
                debug_assert!(false, "pool exhausted mid-batch");
                break;
            };
            if let Err(err) = self.queue_request(idx, msg) {
                errors += 1;
                self.complete_request(idx, Some(err), true);
            }
        }
        if errors > 0 {
            self.push_and_notify();
        }
    }

    fn queue_request(&mut self, idx: usize, msg: &RingRequest) -> Result<(), Error> {
        let descriptor = self.make_image_request(idx, msg).map_err(|err| {
            tracing::warn!(
                domid = self.domid,
                devid = self.devid,
                id = msg.id,
                error = %err,
                "failed to translate request"
            );
            self.stats.map_errors += 1;
            err
        })?;

        self.image.submit(descriptor).map_err(|err| {
            tracing::warn!(
                domid = self.domid,
                devid = self.devid,
                id = msg.id,
                error = %err,
                "failed to queue request"
            );
            self.stats.submit_errors += 1;
            Error::from(err)
        })
    }

    fn make_image_request(&mut self, idx: usize, msg: &RingRequest) -> Result<ImageRequest, Error> {
        translate::prepare(
            self.pool.slot_mut(idx),
            idx,
            self.token,
            msg,
            self.domid,
            self.devid,
            &self.gnttab,
        )
    }

    /// Drains image completions and finalises each owning request. Call
    /// whenever the image subsystem signals progress.
    pub fn pump(&mut self) {
        let mut done = std::mem::take(&mut self.completions);
        self.image.drain_completions(&mut done);
        for c in &done {
            debug_assert_eq!(c.token, self.token, "completion for a foreign interface");
            let err = if c.error == 0 {
                None
            } else {
                self.stats.image_errors += 1;
                Some(Error::Image(c.error))
            };
            self.complete_request(c.slot, err, c.last);
        }
        done.clear();
        self.completions = done;
    }

    /// Finalises one request: read payloads are pushed out to the guest, the
    /// bounce buffer is released, a response is placed in the ring, and the
    /// slot returns to the pool. With `last` set, outstanding responses are
    /// published and the guest is notified if it asked to be.
    fn complete_request(&mut self, idx: usize, mut err: Option<Error>, last: bool) {
        if self.pool.slot(idx).bounce.is_some() {
            if self.pool.slot(idx).op == BlkOp::Read && err.is_none() {
                if let Err(copy_err) =
                    translate::copy_to_guest(&self.gnttab, self.domid, self.pool.slot(idx))
                {
                    tracing::warn!(
                        domid = self.domid,
                        devid = self.devid,
                        name = %self.pool.slot(idx).name,
                        error = %copy_err,
                        "failed to copy to guest"
                    );
                    err = Some(copy_err);
                }
            }
            self.pool.slot_mut(idx).bounce = None;
        }

        let status = err.as_ref().map_or(RSP_OKAY, Error::response_status);
        let slot = self.pool.slot(idx);
        self.ring.put_response(&RingResponse {
            id: slot.id,
            operation: slot.wire_op,
            status,
        });

        if last {
            self.push_and_notify();
        }

        self.pool.release(idx);
        self.stats.reqs_out += 1;
    }

    /// Publishes outstanding responses; notifies the event channel when the
    /// guest's threshold fires. A failed notify is logged and counted, never
    /// surfaced: the responses are already on the ring.
    fn push_and_notify(&mut self) -> bool {
        if !self.ring.push_responses_and_check_notify() {
            return false;
        }
        match self.evtchn.notify(self.port) {
            Ok(()) => {
                self.stats.kicks_out += 1;
                true
            }
            Err(err) => {
                self.stats.notify_errors += 1;
                tracing::error!(
                    domid = self.domid,
                    devid = self.devid,
                    port = self.port,
                    error = %err,
                    "failed to notify event channel"
                );
                false
            }
        }
    }

    /// Teardown drain: pumps completions until no request is in flight.
    /// Logs and gives up if the image subsystem stops making progress.
    pub fn quiesce(&mut self) {
        while self.pool.in_flight() > 0 {
            let before = self.pool.in_flight();
            self.pump();
            if self.pool.in_flight() == before {
                tracing::error!(
                    domid = self.domid,
                    devid = self.devid,
                    in_flight = before,
                    "image subsystem stalled during teardown"
                );
                return;
            }
        }
    }
}

impl Drop for Blkif {
    fn drop(&mut self) {
        tracing::info!(
            domid = self.domid,
            devid = self.devid,
            reqs_in = self.stats.reqs_in,
            reqs_out = self.stats.reqs_out,
            "block interface detached"
        );
    }
}
