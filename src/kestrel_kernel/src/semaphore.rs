//! Semaphores.
use core::fmt;

use crate::{
    error::{
        GetSemaphoreError, PollSemaphoreError, SignalSemaphoreError, WaitSemaphoreError,
        WaitSemaphoreTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard},
    state, thread,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, PortThreading, Ticks,
};

/// Unsigned integer type representing the number of permits held by a
/// semaphore.
pub type SemaphoreValue = u32;

/// *Semaphore control block* - the state data of a semaphore.
pub struct SemaphoreCb<Traits: PortThreading> {
    pub(super) value: CpuLockCell<Traits, SemaphoreValue>,
    pub(super) max_value: SemaphoreValue,

    pub(super) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> SemaphoreCb<Traits> {
    /// Construct a `SemaphoreCb` with the given initial and maximum values.
    /// A binary semaphore is one with `max_value == 1`.
    pub const fn new(initial_value: SemaphoreValue, max_value: SemaphoreValue) -> Self {
        assert!(initial_value <= max_value);
        Self::with_queue_order(initial_value, max_value, QueueOrder::ThreadPriority)
    }

    pub const fn with_queue_order(
        initial_value: SemaphoreValue,
        max_value: SemaphoreValue,
        queue_order: QueueOrder,
    ) -> Self {
        Self {
            value: CpuLockCell::new(initial_value),
            max_value,
            wait_queue: WaitQueue::new(queue_order),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> SemaphoreCb<Traits> {
    /// Add `count` permits, waking up as many waiters (in queue order).
    /// Fails with `QueueOverflow` if the value would exceed the maximum.
    pub fn signal(&'static self, count: SemaphoreValue) -> Result<(), SignalSemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        signal(self, lock, count)
    }

    /// Add one permit. Equivalent to `signal(1)`.
    pub fn signal_one(&'static self) -> Result<(), SignalSemaphoreError> {
        self.signal(1)
    }

    /// Take one permit, blocking until one becomes available.
    pub fn wait_one(&'static self) -> Result<(), WaitSemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait_one(self, lock)
    }

    /// Take one permit, blocking for at most `duration` ticks.
    pub fn wait_one_timeout(
        &'static self,
        duration: Ticks,
    ) -> Result<(), WaitSemaphoreTimeoutError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait_one_timeout(self, lock, duration)
    }

    /// Take one permit if one is available; fail with `Timeout` otherwise.
    pub fn poll_one(&'static self) -> Result<(), PollSemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        poll_one(self, lock)
    }

    /// Get the current number of permits.
    pub fn value(&self) -> Result<SemaphoreValue, GetSemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.value.get(&*lock))
    }
}

#[inline]
fn poll_one<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), PollSemaphoreError> {
    if poll_core(semaphore_cb.value.write(&mut *lock)) {
        Ok(())
    } else {
        Err(PollSemaphoreError::Timeout)
    }
}

#[inline]
fn wait_one<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), WaitSemaphoreError> {
    if poll_core(semaphore_cb.value.write(&mut *lock)) {
        Ok(())
    } else {
        // The current state does not satisfy the wait condition. Start
        // waiting. The wake-upper hands one permit directly to this thread,
        // so there's nothing to re-check on wake-up.
        semaphore_cb
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Semaphore)?;

        Ok(())
    }
}

#[inline]
fn wait_one_timeout<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
    duration: Ticks,
) -> Result<(), WaitSemaphoreTimeoutError> {
    if poll_core(semaphore_cb.value.write(&mut *lock)) {
        Ok(())
    } else {
        semaphore_cb.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::Semaphore,
            duration,
        )?;

        Ok(())
    }
}

/// Check if the current state of a semaphore, `value`, satisfies the wait
/// condition.
///
/// If `value` satisfies the wait condition, this function updates `value`
/// and returns `true`. Otherwise, it returns `false`.
#[inline]
fn poll_core(value: &mut SemaphoreValue) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}

#[inline]
fn signal<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
    mut count: SemaphoreValue,
) -> Result<(), SignalSemaphoreError> {
    let value = semaphore_cb.value.get(&*lock);

    if semaphore_cb.max_value - value < count {
        return Err(SignalSemaphoreError::QueueOverflow);
    }

    let orig_count = count;

    // Wake up waiters first, handing each one permit directly; deposit
    // whatever remains. This is equivalent to calling `poll_core` on behalf
    // of each waiting thread, but never lets the value bounce above zero
    // while waiters exist.
    while count > 0 {
        if semaphore_cb.wait_queue.wake_up_one(lock.borrow_mut()) {
            // We just woke up a thread. Give one permit to that thread.
            count -= 1;
        } else {
            // There are no more threads to wake up; deposit the remaining
            // permits to the semaphore
            semaphore_cb.value.replace(&mut *lock, value + count);
            break;
        }
    }

    // If we woke up at least one thread in the process, check for preemption
    if count != orig_count {
        thread::unlock_cpu_and_check_preemption(lock);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::define_test_kernel;

    #[test]
    fn poll_core_consumes_permits() {
        let mut value = 2;
        assert!(poll_core(&mut value));
        assert!(poll_core(&mut value));
        assert!(!poll_core(&mut value));
        assert_eq!(value, 0);
    }

    #[test]
    fn value_never_exceeds_the_maximum() {
        define_test_kernel!(struct Tr);
        static SEM: SemaphoreCb<Tr> = SemaphoreCb::new(1, 2);

        assert_eq!(SEM.value().unwrap(), 1);
        SEM.signal_one().unwrap();
        assert_eq!(SEM.value().unwrap(), 2);

        assert_eq!(SEM.signal_one(), Err(SignalSemaphoreError::QueueOverflow));
        assert_eq!(SEM.signal(5), Err(SignalSemaphoreError::QueueOverflow));
        assert_eq!(SEM.value().unwrap(), 2);
    }

    #[test]
    fn poll_one_reports_an_empty_semaphore() {
        define_test_kernel!(struct Tr);
        static SEM: SemaphoreCb<Tr> = SemaphoreCb::new(2, 2);

        SEM.poll_one().unwrap();
        SEM.poll_one().unwrap();
        assert_eq!(SEM.poll_one(), Err(PollSemaphoreError::Timeout));
        assert_eq!(SEM.value().unwrap(), 0);

        // Never drops below zero after any sequence of waits
        SEM.signal_one().unwrap();
        SEM.poll_one().unwrap();
        assert_eq!(SEM.poll_one(), Err(PollSemaphoreError::Timeout));
    }
}
