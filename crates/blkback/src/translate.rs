//! Request translation: from a wire snapshot to a ready-to-queue image
//! descriptor.
//!
//! Operates exclusively on the decoded snapshot; nothing here ever re-reads
//! ring memory. On any failure after the bounce buffer is allocated, the
//! buffer is dropped before returning, so an errored slot never owns
//! resources.

use crate::bounce::PageBuf;
use crate::error::Error;
use crate::gnttab::{GrantMapping, GrantTable, Prot};
use crate::image::{BlkOp, ImageRequest, IoSpan};
use crate::pool::TapReq;
use crate::wire::{
    RingRequest, MAX_SEGMENTS, OP_READ, OP_WRITE, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SHIFT,
};
use std::rc::Rc;

/// Translates `msg` into the slot and builds the image descriptor.
///
/// For writes, the guest payload is pulled into the bounce buffer here,
/// under a grant mapping scoped to this call.
pub(crate) fn prepare(
    slot: &mut TapReq,
    idx: usize,
    token: u64,
    msg: &RingRequest,
    domid: u16,
    devid: u16,
    gnttab: &Rc<dyn GrantTable>,
) -> Result<ImageRequest, Error> {
    slot.id = msg.id;
    slot.wire_op = msg.operation;
    slot.sector = msg.sector_number;

    let (op, prot) = match msg.operation {
        OP_READ => (BlkOp::Read, Prot::Write),
        OP_WRITE => (BlkOp::Write, Prot::Read),
        other => {
            tracing::warn!(domid, devid, op = other, "invalid request type");
            return Err(Error::UnsupportedOp(other));
        }
    };
    slot.op = op;
    slot.prot = prot;

    let nr_segments = msg.nr_segments as usize;
    if nr_segments < 1 || nr_segments > MAX_SEGMENTS {
        tracing::warn!(domid, devid, nr_segments, "invalid segment count");
        return Err(Error::InvalidSegmentCount(msg.nr_segments));
    }
    slot.nr_segments = nr_segments;

    let mut bounce = PageBuf::alloc(nr_segments)?;

    for (i, seg) in msg.segs[..nr_segments].iter().enumerate() {
        slot.grefs[i] = seg.gref;
        slot.segs[i] = *seg;

        // first and last may be equal: a single sector.
        if seg.first_sect > seg.last_sect || seg.last_sect >= SECTORS_PER_PAGE {
            tracing::warn!(
                domid,
                devid,
                first = seg.first_sect,
                last = seg.last_sect,
                "invalid sectors"
            );
            return Err(Error::InvalidSectorRange {
                first: seg.first_sect,
                last: seg.last_sect,
            });
        }
    }

    vectorise(slot);

    if op == BlkOp::Write {
        copy_from_guest(gnttab, domid, slot, &mut bounce)?;
    }

    slot.name = format!("backend-{}-{}.{:x}", domid, devid, slot.id);

    let descriptor = ImageRequest {
        slot: idx,
        token,
        op,
        sector: slot.sector,
        name: slot.name.clone(),
        data: bounce.as_ptr(),
        len: bounce.len(),
        iov: slot.iov[..slot.iovcnt].to_vec(),
    };
    slot.bounce = Some(bounce);
    Ok(descriptor)
}

/// Builds the scatter/gather vector over the bounce buffer, merging
/// consecutive segments.
///
/// Segment `i` occupies bounce page `i`, so two segments are consecutive
/// exactly when the earlier one runs to the end of its page and the later
/// one starts at sector 0.
fn vectorise(slot: &mut TapReq) {
    let mut iovcnt = 0usize;
    let mut page = 0usize;
    let mut last_end = usize::MAX;

    for seg in &slot.segs[..slot.nr_segments] {
        let start = page + ((seg.first_sect as usize) << SECTOR_SHIFT);
        let len = ((seg.last_sect - seg.first_sect) as usize + 1) << SECTOR_SHIFT;

        if start == last_end {
            slot.iov[iovcnt - 1].len += len;
        } else {
            slot.iov[iovcnt] = IoSpan { off: start, len };
            iovcnt += 1;
        }
        last_end = slot.iov[iovcnt - 1].off + slot.iov[iovcnt - 1].len;
        page += PAGE_SIZE;
    }
    slot.iovcnt = iovcnt;
}

/// Pulls guest bytes into the bounce buffer (WRITE ingest).
fn copy_from_guest(
    gnttab: &Rc<dyn GrantTable>,
    domid: u16,
    slot: &TapReq,
    bounce: &mut PageBuf,
) -> Result<(), Error> {
    let mapping = GrantMapping::map(gnttab, domid, &slot.grefs[..slot.nr_segments], slot.prot)?;
    let src = mapping.as_slice();
    let dst = bounce.as_mut_slice();
    for span in &slot.iov[..slot.iovcnt] {
        dst[span.off..span.off + span.len].copy_from_slice(&src[span.off..span.off + span.len]);
    }
    mapping.release()?;
    Ok(())
}

/// Pushes bounce-buffer bytes out to guest memory (READ completion).
pub(crate) fn copy_to_guest(
    gnttab: &Rc<dyn GrantTable>,
    domid: u16,
    slot: &TapReq,
) -> Result<(), Error> {
    let Some(bounce) = slot.bounce.as_ref() else {
        return Ok(());
    };
    let mut mapping = GrantMapping::map(gnttab, domid, &slot.grefs[..slot.nr_segments], slot.prot)?;
    let src = bounce.as_slice();
    let dst = mapping.as_mut_slice();
    for span in &slot.iov[..slot.iovcnt] {
        dst[span.off..span.off + span.len].copy_from_slice(&src[span.off..span.off + span.len]);
    }
    mapping.release()?;
    Ok(())
}
