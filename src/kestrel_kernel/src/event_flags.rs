//! Event-flag groups.
use core::{fmt, sync::atomic::Ordering};

use bitflags::bitflags;

use crate::{
    error::{
        GetEventFlagsError, PollEventFlagsError, UpdateEventFlagsError, WaitEventFlagsError,
        WaitEventFlagsTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard},
    state, thread,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, PortThreading, Ticks,
};

/// Unsigned integer type representing the raised flags of an event-flag
/// group.
pub type EventFlagBits = u32;

/// Atomic cell of [`EventFlagBits`], used by a waiter to receive the mask
/// observed at its wake-up.
pub type AtomicEventFlagBits = core::sync::atomic::AtomicU32;

bitflags! {
    /// Options for the event-flag wait operations.
    pub struct EventFlagsWaitFlags: u8 {
        /// Wait until *all* of the requested bits are raised, not just any
        /// of them.
        const ALL = 1 << 0;
        /// Clear the requested bits when the wait condition is satisfied.
        const CLEAR = 1 << 1;
    }
}

/// *Event-flag group control block* - the state data of an event-flag group.
pub struct EventFlagsCb<Traits: PortThreading> {
    /// The mask of currently raised flags.
    pub(super) bits: CpuLockCell<Traits, EventFlagBits>,

    pub(super) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> EventFlagsCb<Traits> {
    pub const fn new(initial_bits: EventFlagBits) -> Self {
        Self::with_queue_order(initial_bits, QueueOrder::ThreadPriority)
    }

    pub const fn with_queue_order(initial_bits: EventFlagBits, queue_order: QueueOrder) -> Self {
        Self {
            bits: CpuLockCell::new(initial_bits),
            wait_queue: WaitQueue::new(queue_order),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for EventFlagsCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFlagsCb")
            .field("self", &(self as *const _))
            .field("bits", &self.bits)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> EventFlagsCb<Traits> {
    /// OR the specified bits into the group, then wake up every waiter whose
    /// own wait condition became satisfied.
    pub fn raise(&'static self, bits: EventFlagBits) -> Result<(), UpdateEventFlagsError> {
        let lock = klock::lock_cpu::<Traits>()?;
        raise(self, lock, bits);
        Ok(())
    }

    /// AND the specified bits out of the group.
    pub fn clear(&'static self, bits: EventFlagBits) -> Result<(), UpdateEventFlagsError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.bits.replace_with(&mut *lock, |b| *b & !bits);
        Ok(())
    }

    /// Get the currently raised flags.
    pub fn get(&self) -> Result<EventFlagBits, GetEventFlagsError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.bits.get(&*lock))
    }

    /// Wait until the wait condition given by `(bits, flags)` is satisfied,
    /// returning the mask observed at that point (before any auto-clear).
    pub fn wait(
        &'static self,
        bits: EventFlagBits,
        flags: EventFlagsWaitFlags,
    ) -> Result<EventFlagBits, WaitEventFlagsError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait(self, lock, bits, flags)
    }

    /// [`Self::wait`] with a timeout of `duration` ticks.
    pub fn wait_timeout(
        &'static self,
        bits: EventFlagBits,
        flags: EventFlagsWaitFlags,
        duration: Ticks,
    ) -> Result<EventFlagBits, WaitEventFlagsTimeoutError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait_timeout(self, lock, bits, flags, duration)
    }

    /// Check the wait condition without blocking; fail with `Timeout` if it
    /// isn't currently satisfied.
    pub fn poll(
        &'static self,
        bits: EventFlagBits,
        flags: EventFlagsWaitFlags,
    ) -> Result<EventFlagBits, PollEventFlagsError> {
        let lock = klock::lock_cpu::<Traits>()?;
        poll(self, lock, bits, flags)
    }
}

fn poll<Traits: KernelTraits>(
    event_flags_cb: &'static EventFlagsCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
    bits: EventFlagBits,
    flags: EventFlagsWaitFlags,
) -> Result<EventFlagBits, PollEventFlagsError> {
    if let Some(original_value) = poll_core(event_flags_cb.bits.write(&mut *lock), bits, flags) {
        Ok(original_value)
    } else {
        Err(PollEventFlagsError::Timeout)
    }
}

fn wait<Traits: KernelTraits>(
    event_flags_cb: &'static EventFlagsCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
    bits: EventFlagBits,
    flags: EventFlagsWaitFlags,
) -> Result<EventFlagBits, WaitEventFlagsError> {
    if let Some(original_value) = poll_core(event_flags_cb.bits.write(&mut *lock), bits, flags) {
        Ok(original_value)
    } else {
        // The current state does not satisfy the wait condition. Start
        // waiting. The wake-upper evaluates `poll_core` on behalf of each
        // waiter, so every waiter's own mask and mode are honored.
        let result = event_flags_cb.wait_queue.wait(
            lock.borrow_mut(),
            WaitPayload::EventFlags {
                bits,
                flags,
                orig_bits: AtomicEventFlagBits::new(0),
            },
        )?;

        // The mask observed at wake-up was stored into `orig_bits`
        if let WaitPayload::EventFlags { orig_bits, .. } = result {
            Ok(orig_bits.load(Ordering::Relaxed))
        } else {
            unreachable!()
        }
    }
}

fn wait_timeout<Traits: KernelTraits>(
    event_flags_cb: &'static EventFlagsCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
    bits: EventFlagBits,
    flags: EventFlagsWaitFlags,
    duration: Ticks,
) -> Result<EventFlagBits, WaitEventFlagsTimeoutError> {
    if let Some(original_value) = poll_core(event_flags_cb.bits.write(&mut *lock), bits, flags) {
        Ok(original_value)
    } else {
        let result = event_flags_cb.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::EventFlags {
                bits,
                flags,
                orig_bits: AtomicEventFlagBits::new(0),
            },
            duration,
        )?;

        if let WaitPayload::EventFlags { orig_bits, .. } = result {
            Ok(orig_bits.load(Ordering::Relaxed))
        } else {
            unreachable!()
        }
    }
}

/// Given a wait condition `(bits, flags)`, check if the current state of an
/// event-flag group, `event_flag_bits`, satisfies the wait condition.
///
/// If `event_flag_bits` satisfies the wait condition, this function clears
/// some bits of `event_flag_bits` (if requested by `flags`), and returns
/// `Some(original_value)`. Otherwise, it returns `None`.
fn poll_core(
    event_flag_bits: &mut EventFlagBits,
    bits: EventFlagBits,
    flags: EventFlagsWaitFlags,
) -> Option<EventFlagBits> {
    let success = if flags.contains(EventFlagsWaitFlags::ALL) {
        (*event_flag_bits & bits) == bits
    } else {
        (*event_flag_bits & bits) != 0
    };

    if success {
        let original_value = *event_flag_bits;
        if flags.contains(EventFlagsWaitFlags::CLEAR) {
            *event_flag_bits &= !bits;
        }
        Some(original_value)
    } else {
        None
    }
}

fn raise<Traits: KernelTraits>(
    event_flags_cb: &'static EventFlagsCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
    raised_bits: EventFlagBits,
) {
    let mut event_flag_bits = event_flags_cb.bits.get(&*lock);

    // Return early if no bits will change
    if (event_flag_bits | raised_bits) == event_flag_bits {
        return;
    }

    event_flag_bits |= raised_bits;

    // Wake up threads whose wake-up conditions are now fulfilled.
    //
    // When waking up a thread, some bits of `event_flag_bits` might be
    // cleared if the waiter requested clearing. Clearing is handled by
    // `poll_core`.
    let mut woke_up_any = false;

    event_flags_cb
        .wait_queue
        .wake_up_all_conditional(lock.borrow_mut(), |wait_payload| match wait_payload {
            WaitPayload::EventFlags {
                bits,
                flags,
                orig_bits,
            } => {
                if let Some(orig) = poll_core(&mut event_flag_bits, *bits, *flags) {
                    woke_up_any = true;
                    orig_bits.store(orig, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
            _ => unreachable!(),
        });

    event_flags_cb.bits.replace(&mut *lock, event_flag_bits);

    if woke_up_any {
        thread::unlock_cpu_and_check_preemption(lock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_core_any() {
        let mut bits = 0b0110;
        assert_eq!(
            poll_core(&mut bits, 0b0010, EventFlagsWaitFlags::empty()),
            Some(0b0110)
        );
        assert_eq!(bits, 0b0110);

        assert_eq!(poll_core(&mut bits, 0b1000, EventFlagsWaitFlags::empty()), None);
    }

    #[test]
    fn poll_core_all() {
        let mut bits = 0b0110;
        // Not all requested bits are raised yet
        assert_eq!(poll_core(&mut bits, 0b0111, EventFlagsWaitFlags::ALL), None);

        bits |= 0b0001;
        assert_eq!(
            poll_core(&mut bits, 0b0111, EventFlagsWaitFlags::ALL),
            Some(0b0111)
        );
    }

    #[test]
    fn poll_core_clear() {
        let mut bits = 0b0110;
        assert_eq!(
            poll_core(
                &mut bits,
                0b0010,
                EventFlagsWaitFlags::CLEAR,
            ),
            Some(0b0110)
        );
        // Only the requested bits are cleared
        assert_eq!(bits, 0b0100);
    }

    #[test]
    fn poll_core_all_clear() {
        let mut bits = 0b1111;
        assert_eq!(
            poll_core(
                &mut bits,
                0b0011,
                EventFlagsWaitFlags::ALL | EventFlagsWaitFlags::CLEAR,
            ),
            Some(0b1111)
        );
        assert_eq!(bits, 0b1100);
    }
}
