use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::{
    error::{Result, ShmemError},
    heap::SymmetricHeap,
    spin::{SpinBudget, spin_until},
};

/// Elements reduced per chunk. Keeps the working set cache-resident while
/// amortizing the per-chunk loop overhead.
const REDUCE_CHUNK: usize = 4096;

/// The world team: every rank is a member, and every collective must be
/// entered by every member the same number of times with consistent sizes.
pub struct Team {
    world_size: u32,
    arrived: AtomicU32,
    generation: AtomicU32,
}

impl Team {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size: world_size as u32,
            arrived: AtomicU32::new(0),
            generation: AtomicU32::new(0),
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size as usize
    }

    /// World barrier. Panics on budget exhaustion: a missing member is a
    /// fatal protocol fault, not a recoverable condition.
    pub fn barrier_all(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.world_size {
            self.arrived.store(0, Ordering::Release);
            self.generation.fetch_add(1, Ordering::AcqRel);
        } else if !spin_until(SpinBudget::DEFAULT, || {
            self.generation.load(Ordering::Acquire) != generation
        }) {
            panic!("world barrier: spin budget exhausted waiting for {} members", self.world_size);
        }
        fence(Ordering::SeqCst);
    }

    /// Element-wise f32 sum across all ranks' `src` windows, written to the
    /// caller's own `dst` window: `dst[i] = Σ_r src_r[i]`.
    ///
    /// Collective; every rank must call with the same offsets and length.
    /// Source and destination must be distinct windows so that no rank's
    /// writes race another rank's reads between the two barriers.
    pub fn float_sum_reduce(
        &self,
        heap: &SymmetricHeap,
        rank: usize,
        src_offset: usize,
        dst_offset: usize,
        num_elems: usize,
    ) -> Result<()> {
        let len = num_elems * size_of::<f32>();
        if src_offset % 4 != 0 {
            return Err(ShmemError::Misaligned { offset: src_offset, align: 4 });
        }
        if dst_offset % 4 != 0 {
            return Err(ShmemError::Misaligned { offset: dst_offset, align: 4 });
        }
        if src_offset < dst_offset + len && dst_offset < src_offset + len {
            return Err(ShmemError::Custom("reduce source and destination overlap"));
        }

        // Every rank's source is final before anyone starts reading.
        self.barrier_all();

        let world = self.world_size as usize;
        let mut acc = [0f32; REDUCE_CHUNK];
        let mut done = 0usize;
        while done < num_elems {
            let chunk = REDUCE_CHUNK.min(num_elems - done);
            let acc = &mut acc[..chunk];
            acc.fill(0.0);
            for peer in 0..world {
                let src = heap.fabric_ptr(peer, src_offset + done * 4, chunk * 4)?;
                for (i, slot) in acc.iter_mut().enumerate() {
                    // SAFETY: in-bounds; all ranks are read-only on the
                    // source windows between the two barriers.
                    *slot += unsafe { src.cast::<f32>().add(i).read() };
                }
            }
            let dst = heap.fabric_ptr(rank, dst_offset + done * 4, chunk * 4)?;
            // SAFETY: in-bounds; each rank writes only its own destination.
            unsafe { std::ptr::copy_nonoverlapping(acc.as_ptr(), dst.cast::<f32>(), chunk) };
            done += chunk;
        }

        // Nobody leaves before every rank's result is complete.
        self.barrier_all();
        Ok(())
    }
}
