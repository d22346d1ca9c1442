//! Kernel-global state and context management.
//!
//! All mutable scheduler state — the running thread, the ready queue, the
//! scheduler-lock counter, and the timeout engine's globals — lives in a
//! single [`KernelState`] instance designated by
//! [`KernelTraits::state`](crate::KernelTraits::state). The instance is
//! constructed with [`KernelState::new`] in a `static`; there is no reliance
//! on static construction order.
use core::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{
    error::{BadContextError, LockSchedulerError, UnlockSchedulerError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    thread::{self, readyqueue::ReadyQueue, ThreadCb},
    timeout::TimeoutGlobals,
    KernelTraits, PortThreading,
};

/// The kernel-global state.
pub struct KernelState<Traits: PortThreading> {
    /// The currently running thread. `None` before the first dispatch, while
    /// the processor is idle, and briefly while the running thread exits.
    pub(super) running_thread: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    /// Every thread in the Ready state, ordered by descending effective
    /// priority.
    pub(super) ready_queue: ReadyQueue<Traits>,

    /// The number of outstanding [`lock_scheduler`] calls. While this is
    /// nonzero, the dispatcher keeps the current thread running and the
    /// preemption check is deferred until the count drops back to zero.
    ///
    /// Only mutated from a thread context with interrupts able to observe it,
    /// hence the atomic; mutation never races because only the running thread
    /// changes it.
    sched_lock_count: AtomicU32,

    /// The state of the clock and the timeout engine.
    pub(super) timeout: TimeoutGlobals<Traits>,
}

impl<Traits: PortThreading> KernelState<Traits> {
    pub const fn new() -> Self {
        Self {
            running_thread: CpuLockCell::new(None),
            ready_queue: ReadyQueue::new(),
            sched_lock_count: AtomicU32::new(0),
            timeout: TimeoutGlobals::new(),
        }
    }

    /// Get the currently running thread.
    pub(super) fn running_thread(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        self.running_thread.get(&*lock)
    }

    /// Return a flag indicating whether the scheduler lock is held.
    pub(super) fn is_scheduler_locked(&self) -> bool {
        self.sched_lock_count.load(Ordering::Acquire) != 0
    }

    /// Force-release the scheduler lock. Used when the thread that held it
    /// exits and can never release it itself.
    pub(super) fn clear_scheduler_lock(&self) {
        self.sched_lock_count.store(0, Ordering::Release);
    }
}

impl<Traits: PortThreading> Default for KernelState<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for KernelState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelState")
            .field(
                "running_thread",
                &self
                    .running_thread
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field("ready_queue", &self.ready_queue)
            .field("sched_lock_count", &self.sched_lock_count)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// If the current context is not a thread context, return `Err(BadContext)`.
pub(super) fn expect_thread_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_thread_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable (not a thread context, or the
/// scheduler lock is held), return `Err(BadContext)`.
pub(super) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_thread_context() || Traits::state().is_scheduler_locked() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// Acquire the scheduler lock, suppressing thread switching until the
/// matching [`unlock_scheduler`] call.
///
/// The lock nests: each call increments a counter that
/// [`unlock_scheduler`] decrements. Interrupts stay enabled; waking
/// operations (`signal`, `raise`, …) remain available and simply leave the
/// woken threads in the ready queue. Blocking operations return `BadContext`
/// while the lock is held.
pub fn lock_scheduler<Traits: KernelTraits>() -> Result<(), LockSchedulerError> {
    if !Traits::is_thread_context() || Traits::is_cpu_lock_active() {
        return Err(LockSchedulerError::BadContext);
    }

    let state = Traits::state();

    // No race here: only the running thread mutates the counter, and a
    // preempting thread restores it before this thread resumes.
    let count = state.sched_lock_count.load(Ordering::Relaxed);
    let count = count
        .checked_add(1)
        .ok_or(LockSchedulerError::QueueOverflow)?;
    state.sched_lock_count.store(count, Ordering::Release);

    Ok(())
}

/// Release the scheduler lock. When the count reaches zero, the preemption
/// decision that was deferred while the lock was held is re-examined.
pub fn unlock_scheduler<Traits: KernelTraits>() -> Result<(), UnlockSchedulerError> {
    if !Traits::is_thread_context() || Traits::is_cpu_lock_active() {
        return Err(UnlockSchedulerError::BadContext);
    }

    let state = Traits::state();

    let count = state.sched_lock_count.load(Ordering::Relaxed);
    if count == 0 {
        return Err(UnlockSchedulerError::BadObjectState);
    }
    state.sched_lock_count.store(count - 1, Ordering::Release);

    if count == 1 {
        // The scheduler just became unlocked. A higher-priority thread might
        // have become Ready while switching was suppressed.
        let lock = klock::lock_cpu::<Traits>()?;
        thread::unlock_cpu_and_check_preemption(lock);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{LockSchedulerError, UnlockSchedulerError},
        test_utils::define_test_kernel,
    };

    #[test]
    fn scheduler_lock_nests_and_underflows() {
        define_test_kernel!(struct Tr);

        assert!(!Tr::state().is_scheduler_locked());

        lock_scheduler::<Tr>().unwrap();
        lock_scheduler::<Tr>().unwrap();
        assert!(Tr::state().is_scheduler_locked());

        // Blocking is not allowed while the scheduler is locked
        assert_eq!(
            expect_waitable_context::<Tr>(),
            Err(BadContextError::BadContext)
        );

        unlock_scheduler::<Tr>().unwrap();
        assert!(Tr::state().is_scheduler_locked());
        unlock_scheduler::<Tr>().unwrap();
        assert!(!Tr::state().is_scheduler_locked());

        assert_eq!(
            unlock_scheduler::<Tr>(),
            Err(UnlockSchedulerError::BadObjectState)
        );

        assert_eq!(expect_waitable_context::<Tr>(), Ok(()));
    }

    #[test]
    fn scheduler_lock_rejects_a_cpu_locked_context() {
        define_test_kernel!(struct Tr);

        let _lock = klock::lock_cpu::<Tr>().unwrap();
        assert_eq!(lock_scheduler::<Tr>(), Err(LockSchedulerError::BadContext));
        assert_eq!(
            unlock_scheduler::<Tr>(),
            Err(UnlockSchedulerError::BadContext)
        );
    }
}
