//! blkback - guest block-request processing core
//!
//! The backend half of a split-driver virtual block device: a guest
//! publishes block I/O requests on a shared-memory ring, this crate drains
//! the ring, moves payload bytes across the guest boundary through granted
//! pages, hands the I/O to a disk-image subsystem, and publishes responses
//! with an event-channel notification.
//!
//! # Key pieces
//!
//! - Three ring wire layouts (native / x86-32 / x86-64) behind one
//!   layout-agnostic endpoint pair
//! - A request pool sized to the ring, so admission control is implicit
//! - Scoped grant mappings: every map is paired with exactly one unmap on
//!   every exit path
//! - Batched completion with amortised guest notification
//!
//! # Example
//!
//! ```
//! use blkback::{
//!     BackRing, Blkif, BlkifConfig, CountingEventChannel, FrontRing, GrantTable,
//!     HeapGrantTable, PageBuf, Protocol, RamImage, RingRequest, Segment, OP_READ, RSP_OKAY,
//! };
//! use std::rc::Rc;
//!
//! // Shared ring page plus one granted data page.
//! let ring_page = PageBuf::alloc(1).unwrap();
//! let gnttab = Rc::new(HeapGrantTable::new());
//! gnttab.grant(0x10);
//!
//! let (mut front, back) = unsafe {
//!     FrontRing::init(ring_page.as_ptr());
//!     (
//!         FrontRing::new(ring_page.as_ptr(), Protocol::Native),
//!         BackRing::new(ring_page.as_ptr(), Protocol::Native),
//!     )
//! };
//!
//! let cfg = BlkifConfig { domid: 1, devid: 0, protocol: Protocol::Native, port: 9 };
//! let table: Rc<dyn GrantTable> = gnttab.clone();
//! let mut blkif = Blkif::new(
//!     cfg,
//!     back,
//!     table,
//!     Rc::new(CountingEventChannel::new()),
//!     Box::new(RamImage::new(1024)),
//! )
//! .unwrap();
//!
//! // Guest reads one page from sector 0.
//! let mut req = RingRequest { operation: OP_READ, nr_segments: 1, id: 1, ..Default::default() };
//! req.segs[0] = Segment { gref: 0x10, first_sect: 0, last_sect: 7 };
//! front.push_request(&req);
//! front.push_requests_and_check_notify();
//!
//! blkif.kick();
//! blkif.pump();
//! assert_eq!(front.take_response().unwrap().status, RSP_OKAY);
//! ```

mod blkif;
mod bounce;
mod error;
mod evtchn;
mod gnttab;
mod image;
mod invariants;
mod pool;
mod ring;
mod stats;
mod translate;
mod wire;

pub use blkif::{Blkif, BlkifConfig};
pub use bounce::PageBuf;
pub use error::Error;
pub use evtchn::{CountingEventChannel, EventChannel, NotifyError};
pub use gnttab::{GrantError, GrantMapping, GrantTable, HeapGrantTable, Prot};
pub use image::{BlkOp, Completion, ImageIo, ImageRequest, IoSpan, RamImage, SubmitError};
pub use ring::{BackRing, FrontRing};
pub use stats::BlkifStats;
pub use wire::{
    Protocol, RingRequest, RingResponse, Segment, MAX_SEGMENTS, OP_READ, OP_WRITE, PAGE_SIZE,
    RSP_EOPNOTSUPP, RSP_ERROR, RSP_OKAY, SECTORS_PER_PAGE, SECTOR_SIZE,
};
