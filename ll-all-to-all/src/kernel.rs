//! Shared plumbing for the dispatch/combine kernels: the per-launch
//! environment, the transport selector, and grid-wide synchronization.

use std::sync::atomic::{Ordering, fence};

use shmem_lib::{SpinBudget, SymmetricHeap, Team, TransferEngine, spin_until};

use crate::{
    config::{self, AllToAllConfig},
    error::Result,
    layout::BufferLayout,
};

/// Spin budget for every in-kernel poll (counts, flags, sync totals).
pub(crate) const KERNEL_SPIN_BUDGET: SpinBudget = SpinBudget::DEFAULT;

/// Everything a kernel launch needs, borrowed for the duration of the call.
pub(crate) struct KernelEnv<'a> {
    pub cfg: &'a AllToAllConfig,
    pub layout: &'a BufferLayout,
    pub heap: &'a SymmetricHeap,
    pub engine: &'a TransferEngine,
    pub team: &'a Team,
    pub rank: usize,
}

impl KernelEnv<'_> {
    pub fn transport(&self) -> Transport<'_> {
        Transport { heap: self.heap, engine: self.engine, rank: self.rank }
    }

    /// Grid-wide cooperative sync point. Block work is serialized within a
    /// launch, so the sync collapses to a full fence between loop phases.
    pub fn grid_sync(&self) {
        fence(Ordering::SeqCst);
    }

    /// The sync between the send loop and the count posting. This is the
    /// only one `DEEPEP_SKIP_GRID_SYNC` elides; single-node debug only.
    pub fn grid_sync_post_send(&self) {
        if !config::skip_grid_sync() {
            fence(Ordering::SeqCst);
        }
    }

    /// Read-only view of a range of this rank's own region.
    pub fn own_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let ptr = self.heap.fabric_ptr(self.rank, offset, len)?;
        // SAFETY: in-bounds; the protocol serializes writers on this range
        // before the caller reads it (count/flag acquire precedes reads).
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// Mutable view of a staging range of this rank's own region. Staging
    /// areas are written only by their owning rank.
    #[allow(clippy::mut_from_ref)]
    pub fn own_bytes_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let ptr = self.heap.fabric_ptr(self.rank, offset, len)?;
        // SAFETY: in-bounds; exclusivity is a protocol invariant.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    /// Spin on a word of this rank's region until `pred` accepts its value.
    /// Returns the accepted value, or `None` once the budget is exhausted.
    pub fn poll_i32(&self, offset: usize, pred: impl Fn(i32) -> bool) -> Option<i32> {
        let word = self.heap.atomic_i32(self.rank, offset);
        let mut seen = 0;
        let ok = spin_until(KERNEL_SPIN_BUDGET, || {
            seen = word.load(Ordering::Acquire);
            pred(seen)
        });
        ok.then_some(seen)
    }
}

/// Chooses the path to a destination rank: direct stores over the P2P
/// mapping when one exists, proxied one-sided operations otherwise.
pub(crate) struct Transport<'a> {
    heap: &'a SymmetricHeap,
    engine: &'a TransferEngine,
    rank: usize,
}

impl Transport<'_> {
    /// Copy `len` bytes from this rank's region into a peer's region.
    pub fn put(
        &self,
        src_offset: usize,
        dst_rank: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        if let Some(dst) = self.heap.peer_ptr(self.rank, dst_rank, dst_offset, len) {
            let src = self.heap.fabric_ptr(self.rank, src_offset, len)?;
            // SAFETY: both ranges in-bounds; the destination slot is not
            // read until the trailing count/flag atomic is observed.
            unsafe { std::ptr::copy_nonoverlapping(src, dst, len) };
            fence(Ordering::SeqCst);
        } else {
            self.engine.put(self.rank, src_offset, dst_rank, dst_offset, len)?;
        }
        Ok(())
    }

    /// Atomic add on a peer's word, ordered after this rank's prior puts
    /// to the same peer.
    pub fn atomic_add(&self, dst_rank: usize, dst_offset: usize, value: i32) -> Result<()> {
        if self.heap.peer_ptr(self.rank, dst_rank, dst_offset, 4).is_some() {
            fence(Ordering::SeqCst);
            self.heap.atomic_i32(dst_rank, dst_offset).fetch_add(value, Ordering::AcqRel);
        } else {
            self.engine.atomic_add(dst_rank, dst_offset, value)?;
        }
        Ok(())
    }
}

/// `layout_range` packing: token count in the high 32 bits, begin offset
/// into the packed arrays in the low 32.
pub(crate) fn pack_layout_range(num: usize, begin: usize) -> i64 {
    ((num as i64) << 32) | begin as i64
}

pub(crate) fn unpack_layout_range(packed: i64) -> (usize, usize) {
    ((packed >> 32) as usize, (packed & 0xffff_ffff) as usize)
}
