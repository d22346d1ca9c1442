//! Software timers.
//!
//! A timer is a [`Timeout`] node in the clock's timeout list, with an
//! `InvokeTimer` fire behavior. On expiry the node is unlinked, the callback
//! runs in the tick handler's interrupt context with CPU Lock released, and
//! a periodic timer re-arms itself with its period measured from the
//! previous expiry (so periods don't drift).
use core::fmt;

use crate::{
    error::{SetTimerDelayError, SetTimerPeriodError, StartTimerError, StopTimerError},
    klock::{self, assume_cpu_lock, lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    timeout::{self, Timeout, TimeoutAction},
    utils::pin::static_pin,
    KernelTraits, PortThreading, Ticks,
};

/// The static properties of a timer.
#[derive(Debug, Clone, Copy)]
pub struct TimerAttr {
    /// The callback to invoke on each expiry. Called in an interrupt
    /// context; blocking services are unavailable to it, nonblocking ones
    /// (`signal`, `raise`, `notify_*`, …) are.
    pub callback: fn(usize),

    /// The parameter supplied for `callback`.
    pub callback_param: usize,

    /// The initial delay from `start` to the (first) expiry.
    pub delay: Ticks,

    /// `Some(period)` makes the timer re-arm after every expiry;
    /// `None` makes it single-shot.
    pub period: Option<Ticks>,
}

/// *Timer control block* - the state data of a software timer.
pub struct TimerCb<Traits: PortThreading> {
    /// The static properties of the timer.
    pub(super) attr: TimerAttr,

    /// The timeout node for the timer. Linked into the timeout list iff the
    /// timer is active.
    pub(super) timeout: Timeout<Traits>,

    /// `true` iff the timer is in the Active state.
    pub(super) active: CpuLockCell<Traits, bool>,

    /// The delay that the next `start` will arm the timer with. Updated by
    /// `stop` to the remaining time, so a stopped timer resumes where it
    /// left off.
    pub(super) delay: CpuLockCell<Traits, Ticks>,

    pub(super) period: CpuLockCell<Traits, Option<Ticks>>,
}

impl<Traits: PortThreading> TimerCb<Traits> {
    pub const fn new(attr: TimerAttr) -> Self {
        Self {
            attr,
            timeout: Timeout::unarmed(),
            active: CpuLockCell::new(false),
            delay: CpuLockCell::new(attr.delay),
            period: CpuLockCell::new(attr.period),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .field("timeout", &self.timeout)
            .field("active", &self.active)
            .field("delay", &self.delay)
            .field("period", &self.period)
            .finish()
    }
}

impl<Traits: KernelTraits> TimerCb<Traits> {
    /// Arm the timer to expire after the configured delay. A no-op if the
    /// timer is already active.
    pub fn start(&'static self) -> Result<(), StartTimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        start_timer(lock.borrow_mut(), self);
        Ok(())
    }

    /// Disarm the timer, capturing the remaining delay so a later `start`
    /// resumes from it. A no-op if the timer is not active — including a
    /// single-shot timer that has already fired.
    pub fn stop(&'static self) -> Result<(), StopTimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        stop_timer(lock.borrow_mut(), self);
        Ok(())
    }

    /// Change the delay until the (first) expiry. If the timer is active,
    /// it's re-armed to expire `delay` ticks from now.
    pub fn set_delay(&'static self, delay: Ticks) -> Result<(), SetTimerDelayError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        set_timer_delay(lock.borrow_mut(), self, delay);
        Ok(())
    }

    /// Change the period. Takes effect at the next expiry.
    pub fn set_period(&'static self, period: Option<Ticks>) -> Result<(), SetTimerPeriodError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.period.replace(&mut *lock, period);
        Ok(())
    }
}

/// The core portion of [`TimerCb::start`].
fn start_timer<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
) {
    if timer_cb.active.get(&*lock) {
        return;
    }

    let delay = timer_cb.delay.get(&*lock);

    timer_cb
        .timeout
        .set_action(lock.borrow_mut(), TimeoutAction::InvokeTimer(timer_cb));
    timer_cb
        .timeout
        .set_expiration_after(lock.borrow_mut(), delay);
    timeout::insert_timeout(lock.borrow_mut(), static_pin(&timer_cb.timeout));

    timer_cb.active.replace(&mut *lock, true);
}

/// The core portion of [`TimerCb::stop`].
fn stop_timer<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer_cb: &TimerCb<Traits>,
) {
    if timer_cb.timeout.is_linked(lock.borrow_mut()) {
        debug_assert!(timer_cb.active.get(&*lock));

        // Capture the remaining delay before unlinking
        let remaining = timer_cb
            .timeout
            .saturating_ticks_until_expiry(lock.borrow_mut());

        timeout::remove_timeout(lock.borrow_mut(), &timer_cb.timeout);

        timer_cb.delay.replace(&mut *lock, remaining);
    }

    timer_cb.active.replace(&mut *lock, false);
}

/// The core portion of [`TimerCb::set_delay`].
fn set_timer_delay<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
    delay: Ticks,
) {
    if timer_cb.timeout.is_linked(lock.borrow_mut()) {
        timeout::remove_timeout(lock.borrow_mut(), &timer_cb.timeout);
    }

    timer_cb.delay.replace(&mut *lock, delay);

    if timer_cb.active.get(&*lock) {
        timer_cb
            .timeout
            .set_expiration_after(lock.borrow_mut(), delay);
        timeout::insert_timeout(lock.borrow_mut(), static_pin(&timer_cb.timeout));
    }
}

/// The expiry processing for a timer, fired by the tick handler through
/// [`TimeoutAction::InvokeTimer`]. Re-arms a periodic timer, then runs the
/// callback with CPU Lock released.
pub(super) fn timer_expiry_handler<Traits: KernelTraits>(
    timer_cb: &'static TimerCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    debug_assert!(!timer_cb.timeout.is_linked(lock.borrow_mut()));
    debug_assert!(timer_cb.active.get(&*lock));

    if let Some(period) = timer_cb.period.get(&*lock) {
        // Measure the period from the previous expiry, not from "now", so
        // the schedule doesn't drift
        timer_cb
            .timeout
            .adjust_expiration(lock.borrow_mut(), period);
        timeout::insert_timeout(lock.borrow_mut(), static_pin(&timer_cb.timeout));
    } else {
        // A single-shot timer returns to the stopped state; the configured
        // delay is restored for the next `start`
        timer_cb.active.replace(&mut *lock, false);
        timer_cb.delay.replace(&mut *lock, timer_cb.attr.delay);
    }

    // Release CPU Lock before calling the application-provided callback
    drop(lock);

    let TimerAttr {
        callback,
        callback_param,
        ..
    } = timer_cb.attr;
    callback(callback_param);

    // Re-acquire CPU Lock
    lock_cpu().unwrap_or_else(|_| {
        // Safety: If `lock_cpu` failed, the callback left CPU Lock active;
        //         either way it's active now and we own it
        unsafe { assume_cpu_lock() }
    })
}
