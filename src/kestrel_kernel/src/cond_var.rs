//! Condition variables.
//!
//! A condition variable pairs with a [`MutexCb`]: `wait` atomically releases
//! the mutex and blocks, and re-acquires the mutex before returning, no
//! matter how the wait ended. The caller is expected to re-check its
//! predicate in a loop, since a wake-up only signals that the predicate *may*
//! have changed.
use core::fmt;

use crate::{
    error::{
        NotifyCondVarError, WaitCondVarError, WaitCondVarTimeoutError, WaitError,
        WaitTimeoutError,
    },
    klock::{self, CpuLockGuard},
    mutex::{self, MutexCb},
    state, thread,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, PortThreading, Ticks,
};

/// *Condition variable control block* - the state data of a condition
/// variable.
pub struct CondVarCb<Traits: PortThreading> {
    pub(super) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> CondVarCb<Traits> {
    pub const fn new() -> Self {
        Self::with_queue_order(QueueOrder::ThreadPriority)
    }

    pub const fn with_queue_order(queue_order: QueueOrder) -> Self {
        Self {
            wait_queue: WaitQueue::new(queue_order),
        }
    }
}

impl<Traits: PortThreading> Default for CondVarCb<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for CondVarCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CondVarCb")
            .field("self", &(self as *const _))
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> CondVarCb<Traits> {
    /// Atomically release `mutex_cb` and block until notified. The mutex is
    /// re-acquired before this method returns, even if the wait was
    /// interrupted.
    ///
    /// The calling thread must own `mutex_cb` with a lock count of one.
    pub fn wait(&'static self, mutex_cb: &'static MutexCb<Traits>) -> Result<(), WaitCondVarError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        precheck_mutex(&lock, mutex_cb)?;

        // Release the mutex and enqueue in one critical section, so a
        // notification between the two can't be missed
        mutex::unlock_for_cond_wait(lock.borrow_mut(), mutex_cb);
        let result = self
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::CondVar);

        // Re-acquire the mutex before reporting the wake reason
        let relock_interrupted = mutex::relock_after_cond_wait(lock.borrow_mut(), mutex_cb);
        if mutex_cb.unrecoverable.get(&*lock) {
            return Err(WaitCondVarError::BadObjectState);
        }

        match result {
            Ok(_) if !relock_interrupted => Ok(()),
            Ok(_) => Err(WaitCondVarError::Interrupted),
            Err(WaitError::Interrupted) => Err(WaitCondVarError::Interrupted),
        }
    }

    /// [`Self::wait`] with a timeout of `duration` ticks. The timeout only
    /// bounds the wait for a notification; the mutex re-acquisition is
    /// unbounded, like a plain `lock`.
    pub fn wait_timeout(
        &'static self,
        mutex_cb: &'static MutexCb<Traits>,
        duration: Ticks,
    ) -> Result<(), WaitCondVarTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        match precheck_mutex(&lock, mutex_cb) {
            Ok(()) => {}
            Err(WaitCondVarError::NotOwner) => return Err(WaitCondVarTimeoutError::NotOwner),
            Err(WaitCondVarError::BadObjectState) => {
                return Err(WaitCondVarTimeoutError::BadObjectState)
            }
            Err(_) => unreachable!(),
        }

        mutex::unlock_for_cond_wait(lock.borrow_mut(), mutex_cb);
        let result =
            self.wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::CondVar, duration);

        let relock_interrupted = mutex::relock_after_cond_wait(lock.borrow_mut(), mutex_cb);
        if mutex_cb.unrecoverable.get(&*lock) {
            return Err(WaitCondVarTimeoutError::BadObjectState);
        }

        match result {
            Ok(_) if !relock_interrupted => Ok(()),
            Ok(_) => Err(WaitCondVarTimeoutError::Interrupted),
            Err(WaitTimeoutError::Interrupted) => Err(WaitCondVarTimeoutError::Interrupted),
            Err(WaitTimeoutError::Timeout) => Err(WaitCondVarTimeoutError::Timeout),
        }
    }

    /// Wake up the highest-priority waiter, if any. The woken thread
    /// competes for the mutex through the normal lock path.
    pub fn notify_one(&'static self) -> Result<(), NotifyCondVarError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.wait_queue.wake_up_one(lock.borrow_mut()) {
            thread::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Wake up every waiter.
    pub fn notify_all(&'static self) -> Result<(), NotifyCondVarError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.wait_queue.wake_up_all(lock.borrow_mut()) {
            thread::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }
}

/// Verify that the calling thread may wait with `mutex_cb`: it must own the
/// mutex exactly once, and the mutex must be usable.
fn precheck_mutex<Traits: KernelTraits>(
    lock: &CpuLockGuard<Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> Result<(), WaitCondVarError> {
    if mutex_cb.unrecoverable.get(&**lock) {
        return Err(WaitCondVarError::BadObjectState);
    }

    // The context was already checked to be waitable, so a running thread
    // exists
    let running_thread = Traits::state().running_thread.get(&**lock).unwrap();
    let is_owner = match mutex_cb.owning_thread.get(&**lock) {
        Some(owner) => core::ptr::eq(owner, running_thread),
        None => false,
    };
    if !is_owner {
        return Err(WaitCondVarError::NotOwner);
    }

    if mutex_cb.count.get(&**lock) != 1 {
        // Waiting with a recursively-locked mutex would silently drop the
        // outer lock levels
        return Err(WaitCondVarError::BadObjectState);
    }

    Ok(())
}
