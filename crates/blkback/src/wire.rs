//! Wire formats of the shared request/response ring.
//!
//! The ring lives in a single 4096-byte page shared with the guest. A small
//! header carries the producer/consumer indices and the two event thresholds;
//! the rest of the page is an array of fixed-size entries, each holding either
//! a request (guest to backend) or a response (backend to guest).
//!
//! Guests speak one of three layouts, fixed at attach time. The layouts agree
//! on the header and on every response field offset; they differ in the
//! alignment of the 64-bit request fields, which shifts the request offsets
//! and the entry stride:
//!
//! - native / x86-64: `id` at byte 8, segments from byte 24, 112-byte entries
//! - x86-32:          `id` at byte 4, segments from byte 20, 108-byte entries
//!
//! Rather than punning `repr(C)` structs onto guest-writable memory, each
//! layout is a table of field offsets and decode copies the whole entry into
//! a local buffer first. Every guest-controlled field is therefore read
//! exactly once; validation and translation operate on the snapshot.

use crate::error::Error;

/// Size of one guest page, and of the shared ring page.
pub const PAGE_SIZE: usize = 4096;

/// Size of one sector.
pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_SHIFT: u32 = 9;

/// Sectors addressable within one page-sized segment.
pub const SECTORS_PER_PAGE: u8 = 8;

/// Maximum number of segments a single ring request may carry.
pub const MAX_SEGMENTS: usize = 11;

/// Ring request operations recognised by the core.
pub const OP_READ: u8 = 0;
pub const OP_WRITE: u8 = 1;

/// Ring response statuses.
pub const RSP_OKAY: i16 = 0;
pub const RSP_ERROR: i16 = -1;
pub const RSP_EOPNOTSUPP: i16 = -2;

// Shared-page header offsets. The four u32 indices sit at the top of the
// page; entries start after 64 bytes of header.
pub(crate) const REQ_PROD: usize = 0;
pub(crate) const REQ_EVENT: usize = 4;
pub(crate) const RSP_PROD: usize = 8;
pub(crate) const RSP_EVENT: usize = 12;
pub(crate) const RING_HDR: usize = 64;

// Response field offsets, identical across layouts.
const RSP_ID_OFF: usize = 0;
const RSP_OP_OFF: usize = 8;
const RSP_STATUS_OFF: usize = 10;

// Segment descriptor: gref u32, first_sect u8, last_sect u8, 2 bytes pad.
const SEG_STRIDE: usize = 8;
const SEG_GREF_OFF: usize = 0;
const SEG_FIRST_OFF: usize = 4;
const SEG_LAST_OFF: usize = 5;

/// Ring layout selected by the guest at attach time. Immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Native,
    X86_32,
    X86_64,
}

impl Protocol {
    #[inline]
    pub(crate) fn layout(self) -> &'static RingLayout {
        match self {
            // On a 64-bit host the native layout and the x86-64 compat
            // layout coincide; x86-32 packs the 64-bit fields tighter.
            Protocol::Native | Protocol::X86_64 => &NATIVE_LAYOUT,
            Protocol::X86_32 => &X86_32_LAYOUT,
        }
    }

    /// Number of request descriptors the ring holds under this layout.
    #[inline]
    pub fn ring_size(self) -> u32 {
        self.layout().ring_size()
    }
}

impl TryFrom<u8> for Protocol {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self, Error> {
        match tag {
            1 => Ok(Protocol::Native),
            2 => Ok(Protocol::X86_32),
            3 => Ok(Protocol::X86_64),
            other => Err(Error::UnsupportedProtocol(other)),
        }
    }
}

/// Field-offset table for one ring layout.
#[derive(Debug)]
pub(crate) struct RingLayout {
    pub entry_size: usize,
    pub id_off: usize,
    pub sector_off: usize,
    pub seg_off: usize,
}

static NATIVE_LAYOUT: RingLayout = RingLayout {
    entry_size: 112,
    id_off: 8,
    sector_off: 16,
    seg_off: 24,
};

static X86_32_LAYOUT: RingLayout = RingLayout {
    entry_size: 108,
    id_off: 4,
    sector_off: 12,
    seg_off: 20,
};

impl RingLayout {
    /// Largest power of two of entries that fits in the page after the header.
    pub(crate) fn ring_size(&self) -> u32 {
        let n = (PAGE_SIZE - RING_HDR) / self.entry_size;
        1 << (usize::BITS - 1 - n.leading_zeros())
    }

    #[inline]
    fn entry_off(&self, idx: u32, size: u32) -> usize {
        RING_HDR + ((idx & (size - 1)) as usize) * self.entry_size
    }
}

/// One segment of a ring request: a guest page (by grant reference) and an
/// inclusive sector range within it. `first_sect == last_sect` transfers a
/// single sector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub gref: u32,
    pub first_sect: u8,
    pub last_sect: u8,
}

/// Snapshot of one ring request.
///
/// Decoding copies the whole entry out of shared memory in one pass; the
/// guest may keep scribbling on the ring afterwards without affecting
/// validation or translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingRequest {
    pub operation: u8,
    pub nr_segments: u8,
    pub handle: u16,
    pub id: u64,
    pub sector_number: u64,
    pub segs: [Segment; MAX_SEGMENTS],
}

impl Default for RingRequest {
    fn default() -> Self {
        Self {
            operation: 0,
            nr_segments: 0,
            handle: 0,
            id: 0,
            sector_number: 0,
            segs: [Segment::default(); MAX_SEGMENTS],
        }
    }
}

/// One ring response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingResponse {
    pub id: u64,
    pub operation: u8,
    pub status: i16,
}

#[inline]
fn le_u16(b: &[u8], off: usize) -> u16 {
    let mut a = [0u8; 2];
    a.copy_from_slice(&b[off..off + 2]);
    u16::from_le_bytes(a)
}

#[inline]
fn le_u32(b: &[u8], off: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[off..off + 4]);
    u32::from_le_bytes(a)
}

#[inline]
fn le_u64(b: &[u8], off: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(a)
}

impl RingRequest {
    /// Snapshots the request at ring index `idx`.
    ///
    /// # Safety
    ///
    /// `page` must point to a live shared ring page of `PAGE_SIZE` bytes laid
    /// out per `layout`, and `size` must be the ring size for that layout.
    pub(crate) unsafe fn read(
        page: *const u8,
        layout: &RingLayout,
        idx: u32,
        size: u32,
    ) -> Self {
        let mut entry = [0u8; 112];
        // SAFETY: entry_off masks idx into the ring, so the source range lies
        // within the page; one bulk copy is the single read of guest memory.
        unsafe {
            std::ptr::copy_nonoverlapping(
                page.add(layout.entry_off(idx, size)),
                entry.as_mut_ptr(),
                layout.entry_size,
            );
        }

        let mut req = RingRequest {
            operation: entry[0],
            nr_segments: entry[1],
            handle: le_u16(&entry, 2),
            id: le_u64(&entry, layout.id_off),
            sector_number: le_u64(&entry, layout.sector_off),
            ..RingRequest::default()
        };
        for (i, seg) in req.segs.iter_mut().enumerate() {
            let off = layout.seg_off + i * SEG_STRIDE;
            seg.gref = le_u32(&entry, off + SEG_GREF_OFF);
            seg.first_sect = entry[off + SEG_FIRST_OFF];
            seg.last_sect = entry[off + SEG_LAST_OFF];
        }
        req
    }

    /// Encodes the request at ring index `idx` (the frontend half).
    ///
    /// # Safety
    ///
    /// Same contract as [`RingRequest::read`], with `page` writable.
    pub(crate) unsafe fn write(&self, page: *mut u8, layout: &RingLayout, idx: u32, size: u32) {
        let mut entry = [0u8; 112];
        entry[0] = self.operation;
        entry[1] = self.nr_segments;
        entry[2..4].copy_from_slice(&self.handle.to_le_bytes());
        entry[layout.id_off..layout.id_off + 8].copy_from_slice(&self.id.to_le_bytes());
        entry[layout.sector_off..layout.sector_off + 8]
            .copy_from_slice(&self.sector_number.to_le_bytes());
        for (i, seg) in self.segs.iter().enumerate() {
            let off = layout.seg_off + i * SEG_STRIDE;
            entry[off..off + 4].copy_from_slice(&seg.gref.to_le_bytes());
            entry[off + SEG_FIRST_OFF] = seg.first_sect;
            entry[off + SEG_LAST_OFF] = seg.last_sect;
        }
        // SAFETY: destination range is one masked entry within the page.
        unsafe {
            std::ptr::copy_nonoverlapping(
                entry.as_ptr(),
                page.add(layout.entry_off(idx, size)),
                layout.entry_size,
            );
        }
    }
}

impl RingResponse {
    /// Snapshots the response at ring index `idx` (the frontend half).
    ///
    /// # Safety
    ///
    /// Same contract as [`RingRequest::read`].
    pub(crate) unsafe fn read(page: *const u8, layout: &RingLayout, idx: u32, size: u32) -> Self {
        let mut entry = [0u8; 12];
        // SAFETY: responses occupy the head of a masked entry within the page.
        unsafe {
            std::ptr::copy_nonoverlapping(
                page.add(layout.entry_off(idx, size)),
                entry.as_mut_ptr(),
                entry.len(),
            );
        }
        RingResponse {
            id: le_u64(&entry, RSP_ID_OFF),
            operation: entry[RSP_OP_OFF],
            status: le_u16(&entry, RSP_STATUS_OFF) as i16,
        }
    }

    /// Encodes the response at ring index `idx`.
    ///
    /// # Safety
    ///
    /// Same contract as [`RingRequest::write`].
    pub(crate) unsafe fn write(&self, page: *mut u8, layout: &RingLayout, idx: u32, size: u32) {
        let mut entry = [0u8; 12];
        entry[RSP_ID_OFF..RSP_ID_OFF + 8].copy_from_slice(&self.id.to_le_bytes());
        entry[RSP_OP_OFF] = self.operation;
        entry[RSP_STATUS_OFF..RSP_STATUS_OFF + 2]
            .copy_from_slice(&self.status.to_le_bytes());
        // SAFETY: destination range is the head of a masked entry within the
        // page; requests are at least as large as responses.
        unsafe {
            std::ptr::copy_nonoverlapping(
                entry.as_ptr(),
                page.add(layout.entry_off(idx, size)),
                entry.len(),
            );
        }
    }
}
