use std::{
    alloc::{Layout, alloc_zeroed, dealloc},
    ptr::NonNull,
    sync::atomic::AtomicI32,
};

use crate::error::{Result, ShmemError};

/// Alignment of every per-rank region. Large enough for any vectorized
/// access the kernels perform (16-byte message headers, f32 lanes).
pub const REGION_ALIGN: usize = 64;

/// One rank's registered region.
///
/// The pointer is shared across rank threads; all cross-thread access goes
/// through atomics or is serialized by the communication protocol.
struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// The symmetric heap: one equally-sized, equally-laid-out region per rank.
/// The same offset names the corresponding buffer on every rank.
///
/// Ranks within the same node (as given by `node_size`) are P2P-mapped:
/// `peer_ptr` hands out a direct pointer and the caller may issue plain
/// stores plus a fence. Any rank is reachable through `fabric_ptr`, which
/// is reserved for the proxied transfer worker.
pub struct SymmetricHeap {
    regions: Vec<Region>,
    region_len: usize,
    node_size: usize,
}

impl SymmetricHeap {
    pub fn new(world_size: usize, node_size: usize, region_len: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(ShmemError::InvalidWorld("world_size must be positive".into()));
        }
        if node_size == 0 || world_size % node_size != 0 {
            return Err(ShmemError::InvalidWorld(format!(
                "node_size {node_size} must divide world_size {world_size}"
            )));
        }
        if region_len == 0 {
            return Err(ShmemError::InvalidWorld("region_len must be positive".into()));
        }

        let layout = Layout::from_size_align(region_len, REGION_ALIGN)
            .map_err(|_| ShmemError::InvalidWorld(format!("bad region_len {region_len}")))?;
        let mut regions = Vec::with_capacity(world_size);
        for _ in 0..world_size {
            // SAFETY: layout has non-zero size, checked above.
            let ptr = unsafe { alloc_zeroed(layout) };
            let Some(ptr) = NonNull::new(ptr) else {
                // Free whatever we managed to allocate.
                drop(Self { regions, region_len, node_size });
                return Err(ShmemError::Custom("symmetric heap allocation failed"));
            };
            regions.push(Region { ptr, len: region_len });
        }
        Ok(Self { regions, region_len, node_size })
    }

    pub fn world_size(&self) -> usize {
        self.regions.len()
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    pub fn region_len(&self) -> usize {
        self.region_len
    }

    fn node_of(&self, rank: usize) -> usize {
        rank / self.node_size
    }

    fn checked_ptr(&self, rank: usize, offset: usize, len: usize) -> Result<*mut u8> {
        let region = self
            .regions
            .get(rank)
            .ok_or(ShmemError::OutOfBounds { rank, offset, len })?;
        if offset.checked_add(len).is_none_or(|end| end > region.len) {
            return Err(ShmemError::OutOfBounds { rank, offset, len });
        }
        // SAFETY: offset + len is within the allocation.
        Ok(unsafe { region.ptr.as_ptr().add(offset) })
    }

    /// Direct pointer into a peer's region, available only when the peer is
    /// P2P-mapped (same node). Mirrors `nvshmem_ptr`: `None` means the
    /// destination is reachable only through the fabric.
    pub fn peer_ptr(&self, rank: usize, peer: usize, offset: usize, len: usize) -> Option<*mut u8> {
        if self.node_of(rank) != self.node_of(peer) {
            return None;
        }
        self.checked_ptr(peer, offset, len).ok()
    }

    /// Pointer into any rank's region. Only the transfer worker (the fabric
    /// path) and collective operations go through this.
    pub fn fabric_ptr(&self, rank: usize, offset: usize, len: usize) -> Result<*mut u8> {
        self.checked_ptr(rank, offset, len)
    }

    /// View a 4-byte word of a rank's region as an atomic.
    ///
    /// Panics on out-of-bounds or misaligned offsets: control words live at
    /// fixed layout offsets, so a bad index is a programming error.
    pub fn atomic_i32(&self, rank: usize, offset: usize) -> &AtomicI32 {
        assert!(offset % 4 == 0, "atomic offset {offset} not 4-aligned");
        let ptr = self
            .checked_ptr(rank, offset, 4)
            .unwrap_or_else(|e| panic!("atomic_i32: {e}"));
        // SAFETY: in-bounds, 4-aligned, and the allocation lives as long as
        // `self`. All concurrent access to this word is atomic.
        unsafe { AtomicI32::from_ptr(ptr.cast()) }
    }

    /// Zero `len` bytes of a rank's own region. The caller must hold the
    /// protocol-level right to write this range (cleaner between iterations,
    /// or the owner of a staging area).
    pub fn zero(&self, rank: usize, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let ptr = self.checked_ptr(rank, offset, len)?;
        // SAFETY: in-bounds; exclusivity is a protocol invariant.
        unsafe { std::ptr::write_bytes(ptr, 0, len) };
        Ok(())
    }
}

impl Drop for SymmetricHeap {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.region_len, REGION_ALIGN)
            .expect("layout was validated at construction");
        for region in self.regions.drain(..) {
            // SAFETY: allocated with this exact layout in `new`.
            unsafe { dealloc(region.ptr.as_ptr(), layout) };
        }
    }
}
