//! Grant-table binding: mapping guest-owned pages into the backend.
//!
//! The hypervisor binding itself is a collaborator, modelled by the
//! [`GrantTable`] trait. The core only ever holds a mapping through
//! [`GrantMapping`], a scoped guard that pairs every successful map with
//! exactly one unmap on every exit path: explicit [`GrantMapping::release`]
//! on the request path (so unmap errors reach the caller), a logged
//! best-effort unmap on drop everywhere else. Double-release and leak are
//! both unrepresentable.

use crate::bounce::PageBuf;
use crate::wire::PAGE_SIZE;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::rc::Rc;
use thiserror::Error;

/// Protection requested for a grant mapping, from the backend's point of
/// view: `Write` for READ requests (the backend fills guest pages), `Read`
/// for WRITE requests (the backend pulls guest bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prot {
    Read,
    Write,
}

/// Grant map/unmap failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrantError {
    /// The guest revoked a reference, the protection did not match, or the
    /// hypervisor ran out of mapping resources.
    #[error("failed to grant map: {0}")]
    MapFailed(String),

    /// The region could not be returned; logical request state is unchanged.
    #[error("failed to grant unmap: {0}")]
    UnmapFailed(String),
}

/// Grant-table operations consumed from the hypervisor binding.
///
/// `map` translates an ordered set of grant references from one guest domain
/// into a contiguous host region of `grefs.len()` pages. The region stays
/// valid until the matching `unmap`, and is accessed by at most one request
/// at a time.
pub trait GrantTable {
    fn map(&self, domid: u16, grefs: &[u32], prot: Prot) -> Result<NonNull<u8>, GrantError>;
    fn unmap(&self, va: NonNull<u8>, pages: usize) -> Result<(), GrantError>;
}

/// Scoped grant mapping: `n` guest pages contiguous in host memory.
pub struct GrantMapping {
    table: Rc<dyn GrantTable>,
    va: NonNull<u8>,
    pages: usize,
    released: bool,
}

impl GrantMapping {
    /// Maps `grefs` with the given protection, scoped to the returned guard.
    pub fn map(
        table: &Rc<dyn GrantTable>,
        domid: u16,
        grefs: &[u32],
        prot: Prot,
    ) -> Result<Self, GrantError> {
        let va = table.map(domid, grefs, prot)?;
        Ok(Self {
            table: Rc::clone(table),
            va,
            pages: grefs.len(),
            released: false,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is live until release/drop and exclusively
        // owned by this guard.
        unsafe { std::slice::from_raw_parts(self.va.as_ptr(), self.len()) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.va.as_ptr(), self.len()) }
    }

    /// Unmaps now, reporting the unmap outcome to the caller.
    pub fn release(mut self) -> Result<(), GrantError> {
        self.released = true;
        self.table.unmap(self.va, self.pages)
    }
}

impl Drop for GrantMapping {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.table.unmap(self.va, self.pages) {
                tracing::warn!(pages = self.pages, error = %err, "grant unmap failed on drop");
            }
        }
    }
}

struct MapRecord {
    grefs: Vec<u32>,
    prot: Prot,
    region: PageBuf,
}

/// In-process grant table for frontends that share the backend's address
/// space: tests, demos, loopback setups.
///
/// Granted pages live on the heap, keyed by grant reference. `map` copies
/// the current page contents into a fresh contiguous region; `unmap` writes
/// the region back for `Prot::Write` mappings, which is equivalent to a real
/// mapping for a backend that only touches the region between map and unmap.
#[derive(Default)]
pub struct HeapGrantTable {
    pages: RefCell<HashMap<u32, Box<[u8]>>>,
    active: RefCell<HashMap<usize, MapRecord>>,
    maps: std::cell::Cell<u64>,
    unmaps: std::cell::Cell<u64>,
}

impl HeapGrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a grant for a fresh zeroed page.
    pub fn grant(&self, gref: u32) {
        self.pages
            .borrow_mut()
            .insert(gref, vec![0u8; PAGE_SIZE].into_boxed_slice());
    }

    /// Revokes a grant; subsequent maps of `gref` fail.
    pub fn revoke(&self, gref: u32) {
        self.pages.borrow_mut().remove(&gref);
    }

    /// Copies `data` into the granted page (granting it first if needed).
    pub fn write_page(&self, gref: u32, data: &[u8]) {
        let mut pages = self.pages.borrow_mut();
        let page = pages
            .entry(gref)
            .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
        page[..data.len()].copy_from_slice(data);
    }

    /// Returns a copy of the granted page, if the grant is live.
    pub fn read_page(&self, gref: u32) -> Option<Vec<u8>> {
        self.pages.borrow().get(&gref).map(|p| p.to_vec())
    }

    /// Mappings currently outstanding. Zero once every request has retired.
    pub fn active_mappings(&self) -> usize {
        self.active.borrow().len()
    }

    pub fn map_count(&self) -> u64 {
        self.maps.get()
    }

    pub fn unmap_count(&self) -> u64 {
        self.unmaps.get()
    }
}

impl GrantTable for HeapGrantTable {
    fn map(&self, _domid: u16, grefs: &[u32], prot: Prot) -> Result<NonNull<u8>, GrantError> {
        let mut region = PageBuf::alloc(grefs.len())
            .map_err(|_| GrantError::MapFailed("out of mapping resources".into()))?;
        {
            let pages = self.pages.borrow();
            let dst = region.as_mut_slice();
            for (i, gref) in grefs.iter().enumerate() {
                let page = pages
                    .get(gref)
                    .ok_or_else(|| GrantError::MapFailed(format!("bad grant ref {gref:#x}")))?;
                dst[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].copy_from_slice(page);
            }
        }
        let va = region.as_ptr();
        self.active.borrow_mut().insert(
            va.as_ptr() as usize,
            MapRecord { grefs: grefs.to_vec(), prot, region },
        );
        self.maps.set(self.maps.get() + 1);
        Ok(va)
    }

    fn unmap(&self, va: NonNull<u8>, pages: usize) -> Result<(), GrantError> {
        let record = self
            .active
            .borrow_mut()
            .remove(&(va.as_ptr() as usize))
            .ok_or_else(|| GrantError::UnmapFailed("unknown mapping".into()))?;
        if record.region.pages() != pages {
            return Err(GrantError::UnmapFailed("mapping size mismatch".into()));
        }
        if record.prot == Prot::Write {
            let mut guest = self.pages.borrow_mut();
            let src = record.region.as_slice();
            for (i, gref) in record.grefs.iter().enumerate() {
                // The guest may have revoked the grant while mapped; its page
                // is simply gone by then.
                if let Some(page) = guest.get_mut(gref) {
                    page.copy_from_slice(&src[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]);
                }
            }
        }
        self.unmaps.set(self.unmaps.get() + 1);
        Ok(())
    }
}
