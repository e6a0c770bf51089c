//! Loopback demo: a frontend and a backend in one process, over one shared
//! ring page and a RAM-backed image.
//!
//! Run with: cargo run --example loopback

use blkback::{
    BackRing, Blkif, BlkifConfig, CountingEventChannel, FrontRing, GrantTable, HeapGrantTable,
    PageBuf, Protocol, RamImage, RingRequest, Segment, OP_READ, OP_WRITE, PAGE_SIZE,
};
use std::rc::Rc;

fn request(op: u8, id: u64, sector: u64, gref: u32) -> RingRequest {
    let mut req = RingRequest {
        operation: op,
        nr_segments: 1,
        id,
        sector_number: sector,
        ..RingRequest::default()
    };
    req.segs[0] = Segment { gref, first_sect: 0, last_sect: 7 };
    req
}

fn main() {
    let ring_page = PageBuf::alloc(1).expect("ring page");
    let gnttab = Rc::new(HeapGrantTable::new());
    let evtchn = Rc::new(CountingEventChannel::new());

    // The "guest" grants one data page full of 0x42.
    gnttab.write_page(0x10, &[0x42; PAGE_SIZE]);

    // SAFETY: fresh zeroed page, owned by main for the whole run.
    let (mut front, back) = unsafe {
        FrontRing::init(ring_page.as_ptr());
        (
            FrontRing::new(ring_page.as_ptr(), Protocol::Native),
            BackRing::new(ring_page.as_ptr(), Protocol::Native),
        )
    };

    let table: Rc<dyn GrantTable> = gnttab.clone();
    let mut blkif = Blkif::new(
        BlkifConfig { domid: 1, devid: 768, protocol: Protocol::Native, port: 9 },
        back,
        table,
        evtchn.clone(),
        Box::new(RamImage::new(2048)),
    )
    .expect("attach");

    // Write the granted page to sector 64, scrub it, read it back.
    front.push_request(&request(OP_WRITE, 1, 64, 0x10));
    front.push_requests_and_check_notify();
    blkif.kick();
    blkif.pump();

    gnttab.write_page(0x10, &[0; PAGE_SIZE]);
    front.push_request(&request(OP_READ, 2, 64, 0x10));
    front.push_requests_and_check_notify();
    blkif.kick();
    blkif.pump();

    for rsp in std::iter::from_fn(|| front.take_response()) {
        println!("response id={} status={}", rsp.id, rsp.status);
    }

    let page = gnttab.read_page(0x10).expect("granted page");
    println!(
        "read-back intact: {}",
        page.iter().all(|&b| b == 0x42)
    );
    println!(
        "stats: in={} out={} kicks_out={}",
        blkif.stats().reqs_in,
        blkif.stats().reqs_out,
        blkif.stats().kicks_out
    );
}
