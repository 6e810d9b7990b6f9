use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;

use crate::{
    error::{Result, ShmemError},
    heap::SymmetricHeap,
    worker::{TransferRequest, worker_thread},
};

/// Proxy for one-sided transfers between ranks that are not P2P-mapped.
///
/// A single worker thread executes requests in the order they were
/// submitted. Per submitting rank this gives the same ordering guarantee a
/// hardware queue pair does: a count or flag atomic submitted after a batch
/// of puts becomes visible only after those puts have landed.
pub struct TransferEngine {
    cmd_tx: crossbeam_channel::Sender<TransferRequest>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TransferEngine {
    pub fn new(heap: Arc<SymmetricHeap>) -> Result<Self> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(1024);
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = stop.clone();
            let failed = failed.clone();
            std::thread::Builder::new()
                .name("shmem_transfer_worker".to_string())
                .spawn(move || worker_thread(heap, cmd_rx, stop, failed))
                .map_err(|_| ShmemError::Custom("failed to spawn transfer worker"))?
        };

        Ok(Self { cmd_tx, stop, failed, thread: Mutex::new(Some(thread)) })
    }

    fn submit(&self, req: TransferRequest) -> Result<()> {
        self.cmd_tx.send(req).map_err(|_| ShmemError::WorkerDown)
    }

    /// One-sided put of `len` bytes from the submitter's region into the
    /// destination rank's region.
    pub fn put(
        &self,
        src_rank: usize,
        src_offset: usize,
        dst_rank: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.submit(TransferRequest::Put { src_rank, src_offset, dst_rank, dst_offset, len })
    }

    /// One-sided atomic add on a 4-byte word of the destination's region.
    pub fn atomic_add(&self, dst_rank: usize, dst_offset: usize, value: i32) -> Result<()> {
        self.submit(TransferRequest::AtomicAdd { dst_rank, dst_offset, value })
    }

    /// Block until every request submitted so far has executed.
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(TransferRequest::Flush(tx))?;
        rx.recv().map_err(|_| ShmemError::WorkerDown)
    }

    /// True once any submitted request was rejected. Kernels consult this
    /// after a launch; a failed engine poisons the iteration.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.lock().take()
            && thread.join().is_err()
        {
            self.failed.store(true, Ordering::Release);
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
