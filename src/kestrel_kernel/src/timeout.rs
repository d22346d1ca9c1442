//! The clock and the timeout engine.
//!
//! # Ticks
//!
//! The kernel's notion of time is a monotonic **tick count**, a `u64` that
//! starts at zero and is incremented exactly once per call to
//! [`PortToKernel::timer_tick`], which the port's periodic timer interrupt
//! drives at [`PortTimer::TICKS_PER_SECOND`]. At 1 MHz the count would take
//! half a million years to wrap, so expiry comparisons are plain integer
//! comparisons.
//!
//! # Timeouts
//!
//! A [`Timeout`] is a timestamp node: an absolute expiry tick plus a
//! [`TimeoutAction`] fired when the expiry tick is reached. All pending
//! timeouts form one intrusive list ordered ascending by expiry tick — the
//! same ordering discipline as the ready queue, keyed on time instead of
//! priority. Both timed waits and software timers ([`crate::timer`]) put
//! their nodes in this list, which is why the fire behavior is a closed
//! variant rather than separate node types.
//!
//! # System time
//!
//! The observable **system time** is the tick count plus a settable offset
//! ([`set_system_time`]). Timeouts are keyed on the steady tick count, so a
//! retroactive time adjustment never reorders or re-fires already-queued
//! timeouts.
//!
//! [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
//! [`PortTimer::TICKS_PER_SECOND`]: crate::PortTimer::TICKS_PER_SECOND
use core::{fmt, marker::PhantomPinned, pin::Pin, ptr::NonNull};

use crate::{
    error::TimeError,
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    thread::{self, ThreadCb},
    timer::{self, TimerCb},
    utils::intrusive_list::{self, ListAccessorCell, UnsafeStatic},
    wait, KernelTraits, PortThreading, Ticks, Time,
};

// ---------------------------------------------------------------------------

/// A kernel-global state for timed event management.
pub(super) struct TimeoutGlobals<Traits: PortThreading> {
    /// The number of ticks elapsed since boot.
    tick_count: CpuLockCell<Traits, Time>,

    /// The difference between the system time and `tick_count`.
    /// Mutated only by [`set_system_time`].
    system_time_offset: CpuLockCell<Traits, i64>,

    /// The pending timeouts, ordered ascending by [`Timeout::at`].
    ///
    /// All elements of this linked list must be valid.
    timeouts: CpuLockCell<Traits, intrusive_list::ListHead<TimeoutRef<Traits>>>,
}

impl<Traits: PortThreading> TimeoutGlobals<Traits> {
    pub(super) const fn new() -> Self {
        Self {
            tick_count: CpuLockCell::new(0),
            system_time_offset: CpuLockCell::new(0),
            timeouts: CpuLockCell::new(intrusive_list::ListHead::new()),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TimeoutGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("tick_count", &self.tick_count)
            .field("system_time_offset", &self.system_time_offset)
            .field(
                "timeouts",
                &self.timeouts.debug_fmt_with(|head, f| head.fmt(f)),
            )
            .finish()
    }
}

// Timeouts
// ---------------------------------------------------------------------------

/// What firing a timeout does. The set of node kinds is fixed at design
/// time, so this is a closed variant dispatched by `match`, not an open
/// polymorphic hierarchy.
pub(super) enum TimeoutAction<Traits: PortThreading> {
    /// Wake the carried thread, completing its wait with a timeout result.
    WakeThread(&'static ThreadCb<Traits>),
    /// Run the software timer's expiry processing (callback and re-arm).
    InvokeTimer(&'static TimerCb<Traits>),
}

impl<Traits: PortThreading> Clone for TimeoutAction<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for TimeoutAction<Traits> {}

impl<Traits: PortThreading> fmt::Debug for TimeoutAction<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WakeThread(thread) => write!(f, "WakeThread({:p})", *thread),
            Self::InvokeTimer(timer) => write!(f, "InvokeTimer({:p})", *timer),
        }
    }
}

/// A timeout (timestamp node).
///
/// `Timeout` is a `!Unpin` type. Once registered by [`insert_timeout`], the
/// `Timeout` must stay in the same memory location until it's unregistered.
/// Dropping isn't allowed either. `Timeout::drop` can detect the violation
/// of this requirement and cause a panic.
///
/// `Timeout` is unregistered by one of the following ways:
///
///  - On expiration, right before its action is fired.
///  - [`remove_timeout`] can unregister a `Timeout` at any time. The RAII
///    guard type [`TimeoutGuard`] does this automatically.
pub(super) struct Timeout<Traits: PortThreading> {
    /// The expiry time, as an absolute tick count.
    at: CpuLockCell<Traits, Time>,

    /// Forms the linked list headed by [`TimeoutGlobals::timeouts`].
    link: CpuLockCell<Traits, Option<intrusive_list::Link<TimeoutRef<Traits>>>>,

    /// The fire behavior. `None` only for a timer's node that has never been
    /// armed; arming always assigns an action first.
    action: CpuLockCell<Traits, Option<TimeoutAction<Traits>>>,

    /// Un-implement `Unpin`.
    _pin: PhantomPinned,
}

impl<Traits: PortThreading> Drop for Timeout<Traits> {
    #[inline]
    fn drop(&mut self) {
        if self.link.get_mut().is_some() {
            // The timeout is still in the timeout list. Dropping `self` now
            // would cause a use-after-free when the list is next walked. The
            // owner of `Timeout` is responsible for unregistering it first;
            // `TimeoutGuard` exists to make that automatic.
            panic!("timeout is still linked");
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for Timeout<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("at", &self.at)
            .field("action", &self.action)
            .finish()
    }
}

impl<Traits: PortThreading> Timeout<Traits> {
    /// Construct a `Timeout` with the given fire behavior. The expiry time
    /// is set to zero.
    pub(super) const fn new(action: TimeoutAction<Traits>) -> Self {
        Self {
            at: CpuLockCell::new(0),
            link: CpuLockCell::new(None),
            action: CpuLockCell::new(Some(action)),
            _pin: PhantomPinned,
        }
    }

    /// Construct a `Timeout` with no fire behavior assigned yet. Used for
    /// timer nodes, whose action is assigned when the timer is first armed.
    pub(super) const fn unarmed() -> Self {
        Self {
            at: CpuLockCell::new(0),
            link: CpuLockCell::new(None),
            action: CpuLockCell::new(None),
            _pin: PhantomPinned,
        }
    }
}

impl<Traits: KernelTraits> Timeout<Traits> {
    /// Get a flag indicating whether the `Timeout` is currently registered.
    pub(super) fn is_linked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.link.read(&*lock).is_some()
    }

    /// Assign the fire behavior.
    pub(super) fn set_action(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        action: TimeoutAction<Traits>,
    ) {
        self.action.replace(&mut *lock, Some(action));
    }

    /// Configure the `Timeout` to expire in the specified duration.
    pub(super) fn set_expiration_after(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        duration: Ticks,
    ) {
        let now = current_time::<Traits>(lock.borrow_mut());
        self.at.replace(&mut *lock, now.wrapping_add(duration));
    }

    /// Advance the expiry time by `duration`. Intended to be used by
    /// periodic timers before re-registering the `Timeout`, so that the
    /// period is measured from the previous expiry rather than from "now".
    pub(super) fn adjust_expiration(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        duration: Ticks,
    ) {
        self.at
            .replace_with(&mut *lock, |at| at.wrapping_add(duration));
    }

    /// Calculate the duration until the `Timeout` expires. Returns `0` if
    /// the expiry time has already been reached.
    pub(super) fn saturating_ticks_until_expiry(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Ticks {
        let now = current_time::<Traits>(lock.borrow_mut());
        self.at.get(&*lock).saturating_sub(now)
    }
}

/// A reference to a [`Timeout`].
pub(super) struct TimeoutRef<Traits: PortThreading>(NonNull<Timeout<Traits>>);

// Safety: `Timeout` is only accessed with CPU Lock active, which forms a
//         total order on accesses
unsafe impl<Traits: PortThreading> Send for TimeoutRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for TimeoutRef<Traits> {}

impl<Traits: PortThreading> Clone for TimeoutRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for TimeoutRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for TimeoutRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TimeoutRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> PartialEq for TimeoutRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for TimeoutRef<Traits> {}

impl<Traits: PortThreading> core::ops::Index<TimeoutRef<Traits>> for UnsafeStatic {
    type Output = Timeout<Traits>;

    fn index(&self, index: TimeoutRef<Traits>) -> &Self::Output {
        // Safety: See `timeout_list_accessor`.
        unsafe { &*index.0.as_ptr() }
    }
}

/// Get a `ListAccessorCell` used to access the timeout list.
///
/// # Safety
///
/// All elements of the timeout list must be extant.
macro_rules! timeout_list_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new(
            $list,
            UnsafeStatic::new(),
            |timeout: &Timeout<_>| &timeout.link,
            $key,
        )
    };
}

// Global time management
// ---------------------------------------------------------------------------

/// Get the current tick count.
#[inline]
pub(super) fn current_time<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> Time {
    Traits::state().timeout.tick_count.get(&*lock)
}

/// Get the number of ticks elapsed since boot.
pub fn now<Traits: KernelTraits>() -> Result<Time, TimeError> {
    let mut lock = lock_cpu::<Traits>()?;
    Ok(current_time::<Traits>(lock.borrow_mut()))
}

/// Get the current system time.
///
/// The system time is the tick count plus the offset established by
/// [`set_system_time`]; it starts out equal to the tick count.
pub fn system_time<Traits: KernelTraits>() -> Result<Time, TimeError> {
    let mut lock = lock_cpu::<Traits>()?;
    let g_timeout = &Traits::state().timeout;
    let offset = g_timeout.system_time_offset.get(&*lock.borrow_mut());
    Ok(current_time::<Traits>(lock.borrow_mut()).wrapping_add(offset as Time))
}

/// Set the current system time.
///
/// This only adjusts the observable system time. Timeouts are scheduled
/// against the steady tick count, so pending timed waits and timers are
/// unaffected.
pub fn set_system_time<Traits: KernelTraits>(new_time: Time) -> Result<(), TimeError> {
    let mut lock = lock_cpu::<Traits>()?;
    let tick_count = current_time::<Traits>(lock.borrow_mut());
    let offset = new_time.wrapping_sub(tick_count) as i64;
    Traits::state()
        .timeout
        .system_time_offset
        .replace(&mut *lock.borrow_mut(), offset);
    Ok(())
}

// Tick processing
// ---------------------------------------------------------------------------

/// Implements [`PortToKernel::timer_tick`].
///
/// Precondition: CPU Lock inactive, an interrupt context.
///
/// [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
pub(super) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = lock_cpu::<Traits>().unwrap();

    let g_timeout = &Traits::state().timeout;

    // Advance the clock
    g_timeout
        .tick_count
        .replace_with(&mut *lock.borrow_mut(), |t| t.wrapping_add(1));
    let now = g_timeout.tick_count.get(&*lock.borrow_mut());

    // Fire every timeout that has been reached. The list is sorted, so the
    // sweep stops at the first node whose expiry time is in the future.
    loop {
        // Safety: All elements of the timeout list are extant.
        let front = {
            let accessor =
                unsafe { timeout_list_accessor!(&g_timeout.timeouts, lock.borrow_mut()) };
            accessor.front()
        };

        let timeout_ref = if let Some(timeout_ref) = front {
            timeout_ref
        } else {
            break;
        };

        // Safety: `timeout_ref` is in the timeout list, so the pointee is
        // valid
        let timeout = unsafe { &*timeout_ref.0.as_ptr() };

        if timeout.at.get(&*lock.borrow_mut()) > now {
            break;
        }

        // The timeout has expired. Remove it from the list.
        // Safety: All elements of the timeout list are extant, and
        //         `timeout_ref` is linked.
        let mut accessor = unsafe { timeout_list_accessor!(&g_timeout.timeouts, lock.borrow_mut()) };
        unsafe { accessor.remove(timeout_ref).unwrap_unchecked() };

        let action = timeout.action.get(&*lock.borrow_mut());

        // (Note: `timeout` is considered invalid at this point — waking its
        // thread lets the stack frame owning it go away)
        match action {
            Some(TimeoutAction::WakeThread(thread_cb)) => {
                wait::interrupt_thread_by_timeout(lock.borrow_mut(), thread_cb);
            }
            Some(TimeoutAction::InvokeTimer(timer_cb)) => {
                lock = timer::timer_expiry_handler(timer_cb, lock);
            }
            None => {
                debug_assert!(false, "unarmed timeout was linked");
            }
        }
    }

    // The fired actions might have woken up some threads. Check for dispatch
    // and release CPU Lock.
    thread::unlock_cpu_and_check_preemption(lock);
}

// Timeout management
// ---------------------------------------------------------------------------

/// Register the specified timeout, keeping the timeout list ordered
/// ascending by expiry time.
///
/// Insertion at the tail (a new latest timeout) and at the head (a new
/// earliest timeout) are recognized before the general backward scan to keep
/// the common cases O(1).
pub(super) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: Pin<&Timeout<Traits>>,
) {
    // For each `Timeout`, there can be at most one list entry pointing to it;
    // `link` indicates whether such an entry exists. Double registration
    // would let one of the entries dangle after the first removal.
    assert!(
        timeout.link.read(&*lock).is_none(),
        "timeout is already registered",
    );

    let at = timeout.at.get(&*lock);
    let g_timeout = &Traits::state().timeout;

    // Safety: All elements of the timeout list are extant. `*timeout` is
    // pinned and `Timeout::drop` ensures it's not dropped while it's still
    // linked, so it is safe to link a reference to it into the list.
    let mut accessor = unsafe { timeout_list_accessor!(&g_timeout.timeouts, lock.borrow_mut()) };

    // Safety: This linked list is structurally sound, so `back` can't return
    //         `InconsistentError`
    let back = unsafe { accessor.back().unwrap_unchecked() };

    let insert_at = if let Some(back) = back {
        let back_at = *accessor.pool()[back].at.read(&**accessor.cell_key());
        if back_at <= at {
            // Not earlier than the current tail - insert at the back
            None
        } else {
            // Safety: The list is non-empty
            let front = accessor.front().unwrap();
            let front_at = *accessor.pool()[front].at.read(&**accessor.cell_key());
            if at < front_at {
                // Earlier than the current head - insert at the front
                Some(front)
            } else {
                // Scan backward for the first node whose expiry time is not
                // later than `at`; insert after it. Ties keep registration
                // order.
                let mut insert_at = None;
                let mut cursor = Some(back);
                while let Some(next_cursor) = cursor {
                    let cursor_at = *accessor.pool()[next_cursor].at.read(&**accessor.cell_key());
                    if cursor_at > at {
                        insert_at = Some(next_cursor);
                        // Safety: `next_cursor` is linked, so `prev` can't
                        //         return `ItemError::NotLinked`
                        cursor = unsafe { accessor.prev(next_cursor).unwrap_unchecked() };
                    } else {
                        break;
                    }
                }
                insert_at
            }
        }
    } else {
        None
    };

    // Safety: `timeout` was just confirmed unlinked
    unsafe {
        accessor
            .insert(TimeoutRef((&*timeout).into()), insert_at)
            .unwrap_unchecked()
    };
}

/// Unregister the specified `Timeout`. Does nothing if it's not registered —
/// the cleanup paths of a timed wait call this without knowing whether the
/// timeout has already fired.
#[inline]
pub(super) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &Timeout<Traits>,
) {
    let g_timeout = &Traits::state().timeout;

    // Safety: All elements of the timeout list are extant.
    let mut accessor = unsafe { timeout_list_accessor!(&g_timeout.timeouts, lock.borrow_mut()) };

    match accessor.remove(TimeoutRef(timeout.into())) {
        // Either the timeout was unlinked just fine, or it was never (or no
        // longer) registered, which is equally acceptable here
        Ok(_) | Err(intrusive_list::ItemError::NotLinked) => {}
        Err(intrusive_list::ItemError::Inconsistent(_)) => {
            unreachable!("timeout list is corrupted")
        }
    }
}

/// RAII guard that automatically unregisters `Timeout` when dropped.
pub(super) struct TimeoutGuard<'a, 'b, Traits: KernelTraits> {
    pub(super) timeout: Pin<&'a Timeout<Traits>>,
    pub(super) lock: CpuLockTokenRefMut<'b, Traits>,
}

impl<Traits: KernelTraits> Drop for TimeoutGuard<'_, '_, Traits> {
    #[inline]
    fn drop(&mut self) {
        remove_timeout(self.lock.borrow_mut(), &self.timeout);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        test_utils::define_test_kernel,
        timer::{TimerAttr, TimerCb},
        PortToKernel,
    };
    use std::sync::Mutex;

    /// Advance the simulated clock by `n` ticks.
    fn tick_n<Traits: PortToKernel>(n: u64) {
        for _ in 0..n {
            // Safety: CPU Lock inactive between iterations; the unit-test
            //         port treats every context as tick-capable
            unsafe { Traits::timer_tick() };
        }
    }

    #[test]
    fn timers_fire_in_timestamp_order() {
        define_test_kernel!(struct Tr);

        static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        fn record(param: usize) {
            FIRED.lock().unwrap().push(param);
        }

        // Registration order deliberately differs from expiry order
        static T_LATE: TimerCb<Tr> = TimerCb::new(TimerAttr {
            callback: record,
            callback_param: 3,
            delay: 3,
            period: None,
        });
        static T_EARLY: TimerCb<Tr> = TimerCb::new(TimerAttr {
            callback: record,
            callback_param: 1,
            delay: 1,
            period: None,
        });
        static T_MID: TimerCb<Tr> = TimerCb::new(TimerAttr {
            callback: record,
            callback_param: 2,
            delay: 2,
            period: None,
        });

        T_LATE.start().unwrap();
        T_EARLY.start().unwrap();
        T_MID.start().unwrap();

        tick_n::<Tr>(4);

        assert_eq!(*FIRED.lock().unwrap(), [1, 2, 3]);
    }

    #[test]
    fn equal_timestamps_fire_in_registration_order() {
        define_test_kernel!(struct Tr);

        static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        fn record(param: usize) {
            FIRED.lock().unwrap().push(param);
        }

        static T_A: TimerCb<Tr> = TimerCb::new(TimerAttr {
            callback: record,
            callback_param: 10,
            delay: 2,
            period: None,
        });
        static T_B: TimerCb<Tr> = TimerCb::new(TimerAttr {
            callback: record,
            callback_param: 20,
            delay: 2,
            period: None,
        });

        T_A.start().unwrap();
        T_B.start().unwrap();

        tick_n::<Tr>(2);

        assert_eq!(*FIRED.lock().unwrap(), [10, 20]);
    }

    #[test]
    fn periodic_timer_rearms_until_stopped() {
        define_test_kernel!(struct Tr);

        static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        fn record(param: usize) {
            FIRED.lock().unwrap().push(param);
        }

        static T: TimerCb<Tr> = TimerCb::new(TimerAttr {
            callback: record,
            callback_param: 0,
            delay: 2,
            period: Some(2),
        });

        T.start().unwrap();
        tick_n::<Tr>(7);

        // Fires at ticks 2, 4 and 6
        assert_eq!(FIRED.lock().unwrap().len(), 3);

        T.stop().unwrap();
        tick_n::<Tr>(5);
        assert_eq!(FIRED.lock().unwrap().len(), 3);
    }

    #[test]
    fn stop_captures_the_remaining_delay() {
        define_test_kernel!(struct Tr);

        static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        fn record(param: usize) {
            FIRED.lock().unwrap().push(param);
        }

        static T: TimerCb<Tr> = TimerCb::new(TimerAttr {
            callback: record,
            callback_param: 0,
            delay: 5,
            period: None,
        });

        T.start().unwrap();
        tick_n::<Tr>(3);
        assert!(FIRED.lock().unwrap().is_empty());

        // 2 ticks of the delay remain at this point
        T.stop().unwrap();
        tick_n::<Tr>(10);
        assert!(FIRED.lock().unwrap().is_empty());

        T.start().unwrap();
        tick_n::<Tr>(1);
        assert!(FIRED.lock().unwrap().is_empty());
        tick_n::<Tr>(1);
        assert_eq!(FIRED.lock().unwrap().len(), 1);
    }

    #[test]
    fn single_shot_restores_configured_delay() {
        define_test_kernel!(struct Tr);

        static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        fn record(param: usize) {
            FIRED.lock().unwrap().push(param);
        }

        static T: TimerCb<Tr> = TimerCb::new(TimerAttr {
            callback: record,
            callback_param: 0,
            delay: 2,
            period: None,
        });

        T.start().unwrap();
        tick_n::<Tr>(3);
        assert_eq!(FIRED.lock().unwrap().len(), 1);

        // Stopping an already-fired single-shot timer is a no-op
        T.stop().unwrap();

        // A fired single-shot timer starts over with its configured delay
        T.start().unwrap();
        tick_n::<Tr>(2);
        assert_eq!(FIRED.lock().unwrap().len(), 2);
    }

    #[test]
    fn set_delay_reschedules_an_active_timer() {
        define_test_kernel!(struct Tr);

        static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        fn record(param: usize) {
            FIRED.lock().unwrap().push(param);
        }

        static T: TimerCb<Tr> = TimerCb::new(TimerAttr {
            callback: record,
            callback_param: 0,
            delay: 100,
            period: None,
        });

        T.start().unwrap();
        T.set_delay(2).unwrap();
        tick_n::<Tr>(2);
        assert_eq!(FIRED.lock().unwrap().len(), 1);
    }

    #[test]
    fn system_time_adjustment_leaves_timeouts_alone() {
        define_test_kernel!(struct Tr);

        static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        fn record(param: usize) {
            FIRED.lock().unwrap().push(param);
        }

        static T: TimerCb<Tr> = TimerCb::new(TimerAttr {
            callback: record,
            callback_param: 0,
            delay: 5,
            period: None,
        });

        T.start().unwrap();

        // A large retroactive adjustment must not re-fire or reorder the
        // pending timeout
        super::set_system_time::<Tr>(1_000_000).unwrap();
        assert!(FIRED.lock().unwrap().is_empty());

        tick_n::<Tr>(5);
        assert_eq!(FIRED.lock().unwrap().len(), 1);

        assert_eq!(super::now::<Tr>().unwrap(), 5);
        assert_eq!(super::system_time::<Tr>().unwrap(), 1_000_005);
    }
}
