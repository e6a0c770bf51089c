//! Image-subsystem interface: where translated requests are queued, and how
//! their completions come back.
//!
//! The disk-image stack itself is a collaborator. The core hands it an
//! [`ImageRequest`] descriptor and later learns the outcome from a
//! [`Completion`]; completions are delivered by draining, so they always run
//! on the caller's thread no matter how the image subsystem is built inside.

use crate::wire::SECTOR_SIZE;
use std::collections::VecDeque;
use std::ptr::NonNull;
use thiserror::Error;

const EIO: i32 = 5;

/// Resolved block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkOp {
    Read,
    Write,
}

/// One scatter/gather element: a byte range within the request's bounce
/// buffer. Elements describe logically consecutive disk bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoSpan {
    pub off: usize,
    pub len: usize,
}

/// Descriptor for one queued request.
///
/// `slot` and `token` identify the request to its owner: `token` names the
/// block interface that submitted it, `slot` the pool slot inside that
/// interface. Both are echoed verbatim in the [`Completion`].
///
/// `data` points at the base of the request's bounce buffer and stays valid
/// until the completion for this descriptor has been drained; the image
/// subsystem must not touch it afterwards.
#[derive(Debug)]
pub struct ImageRequest {
    pub slot: usize,
    pub token: u64,
    pub op: BlkOp,
    /// Starting disk sector.
    pub sector: u64,
    /// Stable name for log correlation.
    pub name: String,
    pub data: NonNull<u8>,
    /// Total bounce-buffer bytes backing `iov`.
    pub len: usize,
    pub iov: Vec<IoSpan>,
}

/// Outcome of one queued request. `error` is errno-style: zero for success.
/// `last` marks the end of a completion batch; intermediate completions leave
/// guest notification to the batch's last member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub slot: usize,
    pub token: u64,
    pub error: i32,
    pub last: bool,
}

/// The image subsystem refused to queue a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("image subsystem rejected request")]
pub struct SubmitError;

/// Upward interface to the disk-image stack.
pub trait ImageIo {
    /// Queues a descriptor for asynchronous processing.
    fn submit(&mut self, req: ImageRequest) -> Result<(), SubmitError>;

    /// Appends every completion that has become available. Completions may
    /// arrive in any order relative to submission.
    fn drain_completions(&mut self, out: &mut Vec<Completion>);
}

/// In-memory disk image.
///
/// Reference [`ImageIo`] backend for tests, demos, and loopback setups:
/// accepted descriptors are performed against a RAM-backed sector array when
/// completions are drained. Out-of-range I/O completes with `EIO`; submission
/// failure and forced completion errors can be injected for error-path tests.
pub struct RamImage {
    disk: Vec<u8>,
    pending: VecDeque<ImageRequest>,
    reject_submissions: bool,
    forced_errors: VecDeque<i32>,
}

impl RamImage {
    /// Creates an all-zero disk of `sectors` sectors.
    pub fn new(sectors: usize) -> Self {
        Self {
            disk: vec![0u8; sectors * SECTOR_SIZE],
            pending: VecDeque::new(),
            reject_submissions: false,
            forced_errors: VecDeque::new(),
        }
    }

    pub fn sectors(&self) -> usize {
        self.disk.len() / SECTOR_SIZE
    }

    pub fn disk(&self) -> &[u8] {
        &self.disk
    }

    pub fn disk_mut(&mut self) -> &mut [u8] {
        &mut self.disk
    }

    /// Makes every subsequent `submit` fail.
    pub fn reject_submissions(&mut self, reject: bool) {
        self.reject_submissions = reject;
    }

    /// Forces the next drained completion to carry `errno` without touching
    /// the disk.
    pub fn fail_next_completion(&mut self, errno: i32) {
        self.forced_errors.push_back(errno);
    }

    /// Descriptors accepted but not yet completed.
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    fn perform(&mut self, req: &ImageRequest) -> i32 {
        let total: usize = req.iov.iter().map(|s| s.len).sum();
        let start = req.sector as usize * SECTOR_SIZE;
        if start + total > self.disk.len() {
            return EIO;
        }

        // SAFETY: the descriptor contract keeps `data` valid for `len` bytes
        // until this completion is drained, and no other code touches the
        // bounce buffer while the request is queued.
        let bounce = unsafe { std::slice::from_raw_parts_mut(req.data.as_ptr(), req.len) };

        let mut pos = start;
        for span in &req.iov {
            match req.op {
                BlkOp::Read => {
                    bounce[span.off..span.off + span.len]
                        .copy_from_slice(&self.disk[pos..pos + span.len]);
                }
                BlkOp::Write => {
                    self.disk[pos..pos + span.len]
                        .copy_from_slice(&bounce[span.off..span.off + span.len]);
                }
            }
            pos += span.len;
        }
        0
    }
}

impl ImageIo for RamImage {
    fn submit(&mut self, req: ImageRequest) -> Result<(), SubmitError> {
        if self.reject_submissions {
            return Err(SubmitError);
        }
        tracing::trace!(name = %req.name, sector = req.sector, iovcnt = req.iov.len(), "queued");
        self.pending.push_back(req);
        Ok(())
    }

    fn drain_completions(&mut self, out: &mut Vec<Completion>) {
        let first_new = out.len();
        while let Some(req) = self.pending.pop_front() {
            let error = match self.forced_errors.pop_front() {
                Some(errno) => errno,
                None => self.perform(&req),
            };
            out.push(Completion {
                slot: req.slot,
                token: req.token,
                error,
                last: false,
            });
        }
        if out.len() > first_new {
            if let Some(tail) = out.last_mut() {
                tail.last = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounce::PageBuf;
    use crate::wire::PAGE_SIZE;

    fn request(buf: &PageBuf, op: BlkOp, sector: u64, iov: Vec<IoSpan>) -> ImageRequest {
        ImageRequest {
            slot: 0,
            token: 1,
            op,
            sector,
            name: "backend-0-0.0".into(),
            data: buf.as_ptr(),
            len: buf.len(),
            iov,
        }
    }

    #[test]
    fn test_write_then_read() {
        let mut img = RamImage::new(64);
        let mut buf = PageBuf::alloc(1).unwrap();
        buf.as_mut_slice().fill(0x5A);

        let mut done = Vec::new();
        img.submit(request(&buf, BlkOp::Write, 8, vec![IoSpan { off: 0, len: PAGE_SIZE }]))
            .unwrap();
        img.drain_completions(&mut done);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].error, 0);
        assert!(done[0].last);

        buf.as_mut_slice().fill(0);
        done.clear();
        img.submit(request(&buf, BlkOp::Read, 8, vec![IoSpan { off: 0, len: PAGE_SIZE }]))
            .unwrap();
        img.drain_completions(&mut done);
        assert_eq!(done[0].error, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_out_of_range_completes_with_eio() {
        let mut img = RamImage::new(4);
        let buf = PageBuf::alloc(1).unwrap();

        let mut done = Vec::new();
        img.submit(request(&buf, BlkOp::Read, 2, vec![IoSpan { off: 0, len: PAGE_SIZE }]))
            .unwrap();
        img.drain_completions(&mut done);
        assert_eq!(done[0].error, EIO);
    }

    #[test]
    fn test_only_batch_tail_is_last() {
        let mut img = RamImage::new(64);
        let buf = PageBuf::alloc(1).unwrap();
        for slot in 0..3 {
            let mut req = request(&buf, BlkOp::Read, 0, vec![IoSpan { off: 0, len: 512 }]);
            req.slot = slot;
            img.submit(req).unwrap();
        }

        let mut done = Vec::new();
        img.drain_completions(&mut done);
        assert_eq!(done.iter().filter(|c| c.last).count(), 1);
        assert!(done[2].last);
    }

    #[test]
    fn test_rejection_and_forced_errors() {
        let mut img = RamImage::new(64);
        let buf = PageBuf::alloc(1).unwrap();

        img.reject_submissions(true);
        assert!(img
            .submit(request(&buf, BlkOp::Read, 0, vec![IoSpan { off: 0, len: 512 }]))
            .is_err());

        img.reject_submissions(false);
        img.fail_next_completion(71);
        img.submit(request(&buf, BlkOp::Read, 0, vec![IoSpan { off: 0, len: 512 }]))
            .unwrap();
        let mut done = Vec::new();
        img.drain_completions(&mut done);
        assert_eq!(done[0].error, 71);
    }
}
