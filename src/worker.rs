//! Parallel tracing worker pool (spec §5), grounded on the job-queue shape
//! of `otter-runtime::worker`'s `run_worker` loop: a bounded pool of
//! threads pulling `Job`s off a `crossbeam_channel::Receiver` until told to
//! shut down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::gray::GrayQueue;
use crate::object::GcHeader;

#[cfg(feature = "gc_logging")]
use tracing::debug;

/// A unit of tracing work handed to the pool.
pub enum Job {
    /// Trace a batch of gray objects, pushing newly-discovered gray
    /// objects back onto the shared queue.
    TraceBatch(Vec<*const GcHeader>),
    /// Ask every worker to exit its loop.
    Shutdown,
}

// Jobs only ever carry pointers that are valid for the duration of a
// single STW collection, during which the pool is the only consumer.
unsafe impl Send for Job {}

/// A pool of tracing worker threads sharing one gray queue and one job
/// channel.
pub struct WorkerPool {
    sender: Sender<Job>,
    handles: Vec<std::thread::JoinHandle<()>>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `worker_count` worker threads, each tracing into `gray` and
    /// invoking `trace_fn` on every object it pops to discover further
    /// references.
    pub fn new<F>(worker_count: usize, gray: Arc<GrayQueue>, trace_fn: F) -> Self
    where
        F: Fn(*const GcHeader, &GrayQueue) + Send + Sync + 'static,
    {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = crossbeam_channel::unbounded();
        let trace_fn = Arc::new(trace_fn);
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let receiver = receiver.clone();
            let gray = gray.clone();
            let trace_fn = trace_fn.clone();
            let active = active.clone();

            let handle = std::thread::Builder::new()
                .name(format!("gc-worker-{worker_id}"))
                .spawn(move || run_worker(worker_id, receiver, gray, trace_fn, active))
                .expect("failed to spawn GC worker thread");
            handles.push(handle);
        }

        Self {
            sender,
            handles,
            active,
        }
    }

    /// Submit a batch of gray objects for parallel tracing.
    pub fn submit(&self, batch: Vec<*const GcHeader>) {
        if !batch.is_empty() {
            let _ = self.sender.send(Job::TraceBatch(batch));
        }
    }

    /// Number of workers currently processing a batch (not idle).
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Block until every submitted job has been picked up and the pool is
    /// idle. Callers still need to check `gray.is_empty()` afterward since
    /// tracing may have produced new work.
    pub fn wait_idle(&self) {
        while !self.sender.is_empty() || self.active_count() > 0 {
            std::thread::yield_now();
        }
    }

    /// Shut down every worker and join their threads.
    pub fn shutdown(mut self) {
        for _ in &self.handles {
            let _ = self.sender.send(Job::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_worker<F>(
    worker_id: usize,
    receiver: Receiver<Job>,
    gray: Arc<GrayQueue>,
    trace_fn: Arc<F>,
    active: Arc<AtomicUsize>,
) where
    F: Fn(*const GcHeader, &GrayQueue) + Send + Sync + 'static,
{
    #[cfg(feature = "gc_logging")]
    debug!(worker_id, "GC worker started");

    while let Ok(job) = receiver.recv() {
        match job {
            Job::TraceBatch(batch) => {
                active.fetch_add(1, Ordering::AcqRel);
                for header in batch {
                    trace_fn(header, &gray);
                }
                active.fetch_sub(1, Ordering::AcqRel);
            }
            Job::Shutdown => break,
        }
    }

    #[cfg(feature = "gc_logging")]
    debug!(worker_id, "GC worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{tags, MarkColor};

    #[test]
    fn test_pool_traces_submitted_batch() {
        let gray = Arc::new(GrayQueue::new());
        let header = GcHeader::new(tags::OBJECT, std::ptr::null());
        let ptr: *const GcHeader = &header;
        header.set_mark(MarkColor::Gray);

        let pool = WorkerPool::new(1, gray.clone(), move |h, g| {
            // SAFETY: test-local header, alive for the whole test.
            unsafe { (*h).set_mark(MarkColor::Black) };
            g.push_batch(std::iter::empty());
        });

        pool.submit(vec![ptr]);
        pool.wait_idle();
        assert_eq!(header.mark(), MarkColor::Black);
        pool.shutdown();
    }
}
