use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crossbeam_channel::TryRecvError;
use tracing::error;

use crate::heap::SymmetricHeap;

/// A one-sided operation executed by the transfer worker on behalf of a
/// rank. Requests submitted by one rank are executed in submission order,
/// which is what makes a trailing count/flag atomic a valid "payload has
/// landed" signal for everything the same rank submitted before it.
pub enum TransferRequest {
    /// Copy bytes from the source rank's region into the destination
    /// rank's region.
    Put {
        src_rank: usize,
        src_offset: usize,
        dst_rank: usize,
        dst_offset: usize,
        len: usize,
    },
    /// Remote atomic add on a 4-byte word of the destination rank's region.
    AtomicAdd {
        dst_rank: usize,
        dst_offset: usize,
        value: i32,
    },
    /// Reply once every previously submitted request has executed.
    Flush(oneshot::Sender<()>),
}

pub(crate) fn worker_thread(
    heap: Arc<SymmetricHeap>,
    rx: crossbeam_channel::Receiver<TransferRequest>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match rx.try_recv() {
            Ok(req) => execute(&heap, req, &failed),
            Err(TryRecvError::Empty) => std::hint::spin_loop(),
            Err(TryRecvError::Disconnected) => return,
        }
    }
    // Drain what was already submitted so that `stop` never truncates a
    // sequence whose trailing atomic was already handed to us.
    while let Ok(req) = rx.try_recv() {
        execute(&heap, req, &failed);
    }
}

fn execute(heap: &SymmetricHeap, req: TransferRequest, failed: &AtomicBool) {
    match req {
        TransferRequest::Put { src_rank, src_offset, dst_rank, dst_offset, len } => {
            let src = heap.fabric_ptr(src_rank, src_offset, len);
            let dst = heap.fabric_ptr(dst_rank, dst_offset, len);
            match (src, dst) {
                (Ok(src), Ok(dst)) => {
                    // SAFETY: both ranges are in-bounds and the protocol
                    // guarantees nobody reads the destination slot before
                    // the trailing count/flag atomic is observed.
                    unsafe { std::ptr::copy_nonoverlapping(src, dst, len) };
                    std::sync::atomic::fence(Ordering::Release);
                }
                (src, dst) => {
                    error!(
                        src_rank,
                        dst_rank,
                        ?src,
                        ?dst,
                        "put rejected, marking transfer engine failed"
                    );
                    failed.store(true, Ordering::Release);
                }
            }
        }
        TransferRequest::AtomicAdd { dst_rank, dst_offset, value } => {
            if heap.fabric_ptr(dst_rank, dst_offset, 4).is_err() || dst_offset % 4 != 0 {
                error!(dst_rank, dst_offset, "atomic add rejected, marking transfer engine failed");
                failed.store(true, Ordering::Release);
                return;
            }
            heap.atomic_i32(dst_rank, dst_offset).fetch_add(value, Ordering::AcqRel);
        }
        TransferRequest::Flush(ret) => {
            // Everything before us in the queue has executed.
            let _ = ret.send(());
        }
    }
}
