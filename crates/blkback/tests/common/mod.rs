//! Shared harness: an in-process frontend driving a backend over one shared
//! ring page, with a heap grant table, a counting event channel, and a
//! RAM-backed image.
#![allow(dead_code)]

use blkback::{
    BackRing, Blkif, BlkifConfig, Completion, CountingEventChannel, EventChannel, FrontRing,
    GrantTable, HeapGrantTable, ImageIo, ImageRequest, IoSpan, NotifyError, PageBuf, Protocol,
    RamImage, RingRequest, RingResponse, Segment, SubmitError, OP_READ, OP_WRITE, PAGE_SIZE,
};
use std::cell::RefCell;
use std::rc::Rc;

pub const DOMID: u16 = 1;
pub const DEVID: u16 = 51712;
pub const PORT: u32 = 17;

/// What the image subsystem was asked to do, captured at submit time.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub name: String,
    pub sector: u64,
    pub iov: Vec<IoSpan>,
    pub len: usize,
}

/// Image wrapper that records submissions and keeps the RAM image reachable
/// from the test after the backend takes ownership.
pub struct SharedImage {
    pub inner: Rc<RefCell<RamImage>>,
    pub submits: Rc<RefCell<Vec<SubmitRecord>>>,
}

impl ImageIo for SharedImage {
    fn submit(&mut self, req: ImageRequest) -> Result<(), SubmitError> {
        self.submits.borrow_mut().push(SubmitRecord {
            name: req.name.clone(),
            sector: req.sector,
            iov: req.iov.clone(),
            len: req.len,
        });
        self.inner.borrow_mut().submit(req)
    }

    fn drain_completions(&mut self, out: &mut Vec<Completion>) {
        self.inner.borrow_mut().drain_completions(out);
    }
}

/// Event channel whose notifies always fail.
pub struct BrokenEventChannel;

impl EventChannel for BrokenEventChannel {
    fn notify(&self, port: u32) -> Result<(), NotifyError> {
        Err(NotifyError(format!("port {port} is closed")))
    }
}

pub struct Harness {
    // Keeps the shared ring page alive for the two endpoints.
    _page: PageBuf,
    pub front: FrontRing,
    pub blkif: Blkif,
    pub gnttab: Rc<HeapGrantTable>,
    pub evtchn: Rc<CountingEventChannel>,
    pub image: Rc<RefCell<RamImage>>,
    pub submits: Rc<RefCell<Vec<SubmitRecord>>>,
}

impl Harness {
    pub fn new(proto: Protocol, disk_sectors: usize) -> Self {
        let page = PageBuf::alloc(1).unwrap();
        let gnttab = Rc::new(HeapGrantTable::new());
        let evtchn = Rc::new(CountingEventChannel::new());
        let image = Rc::new(RefCell::new(RamImage::new(disk_sectors)));
        let submits = Rc::new(RefCell::new(Vec::new()));

        // SAFETY: fresh zeroed page owned by the harness, which outlives
        // both endpoints.
        let (front, back) = unsafe {
            FrontRing::init(page.as_ptr());
            (
                FrontRing::new(page.as_ptr(), proto),
                BackRing::new(page.as_ptr(), proto),
            )
        };

        let table: Rc<dyn GrantTable> = gnttab.clone();
        let blkif = Blkif::new(
            BlkifConfig { domid: DOMID, devid: DEVID, protocol: proto, port: PORT },
            back,
            table,
            evtchn.clone(),
            Box::new(SharedImage { inner: image.clone(), submits: submits.clone() }),
        )
        .unwrap();

        Self { _page: page, front, blkif, gnttab, evtchn, image, submits }
    }

    pub fn native(disk_sectors: usize) -> Self {
        Self::new(Protocol::Native, disk_sectors)
    }

    /// Grants `gref` and fills its page with `byte`.
    pub fn grant_filled(&self, gref: u32, byte: u8) {
        self.gnttab.write_page(gref, &[byte; PAGE_SIZE]);
    }

    /// Builds a request; segments are `(gref, first_sect, last_sect)`.
    pub fn request(op: u8, id: u64, sector: u64, segs: &[(u32, u8, u8)]) -> RingRequest {
        let mut req = RingRequest {
            operation: op,
            nr_segments: segs.len() as u8,
            id,
            sector_number: sector,
            ..RingRequest::default()
        };
        for (i, &(gref, first_sect, last_sect)) in segs.iter().enumerate() {
            req.segs[i] = Segment { gref, first_sect, last_sect };
        }
        req
    }

    pub fn push_read(&mut self, id: u64, sector: u64, segs: &[(u32, u8, u8)]) {
        self.front.push_request(&Self::request(OP_READ, id, sector, segs));
    }

    pub fn push_write(&mut self, id: u64, sector: u64, segs: &[(u32, u8, u8)]) {
        self.front.push_request(&Self::request(OP_WRITE, id, sector, segs));
    }

    /// Publishes pushed requests and runs one backend wakeup plus one
    /// completion pass.
    pub fn run(&mut self) {
        self.front.push_requests_and_check_notify();
        self.blkif.kick();
        self.blkif.pump();
    }

    /// Collects every published response.
    pub fn responses(&mut self) -> Vec<RingResponse> {
        let mut out = Vec::new();
        while let Some(rsp) = self.front.take_response() {
            out.push(rsp);
        }
        out
    }

    /// Asserts the pool is full again and every grant map was unmapped.
    pub fn assert_drained(&self) {
        assert_eq!(self.blkif.in_flight(), 0, "requests still in flight");
        assert_eq!(self.gnttab.active_mappings(), 0, "grant mappings leaked");
        assert_eq!(
            self.gnttab.map_count(),
            self.gnttab.unmap_count(),
            "unbalanced grant map/unmap"
        );
    }
}
