//! Cleaner: barrier, zero the ephemeral buffers, barrier.
//!
//! The count-handshake words are deliberately not part of the default
//! inputs. A count posted by a SEND-only peer must survive until the
//! matching receive consumes it; the receive phase zeroes each word as it
//! reads it, which is what keeps the atomic-add delivery idempotent
//! across iterations.

use crate::{error::Result, kernel::KernelEnv, layout::Section};

pub(crate) fn clean(
    env: &KernelEnv<'_>,
    regions: &[Section],
    clean_sync_info: bool,
) -> Result<()> {
    if regions.iter().all(Section::is_empty) && !clean_sync_info {
        return Ok(());
    }

    env.team.barrier_all();
    for section in regions {
        if !section.is_empty() {
            env.heap.zero(env.rank, section.offset, section.len)?;
        }
    }
    if clean_sync_info {
        env.heap
            .zero(env.rank, env.layout.sync_info.offset, env.layout.sync_info.len)?;
    }
    env.team.barrier_all();
    Ok(())
}
