//! Kestrel — a preemptive, priority-based RTOS kernel core for single-core
//! microcontroller-class targets.
//!
//! The kernel provides a thread scheduler, a family of blocking
//! synchronization primitives (mutex, counting semaphore, event-flag group,
//! condition variable, fixed-block memory pool, software timer), and the
//! tick-driven timeout engine they all share. Everything is built on two
//! in-kernel data structures: an intrusive ordered list and a per-object wait
//! queue of stack-scoped wait objects.
//!
//! # Contexts
//!
//! Code runs in one of the following contexts:
//!
//!  - **Thread context** — inside a thread started by [`ThreadCb::start`].
//!    All services are available here. A thread context is *waitable* unless
//!    the scheduler lock is held.
//!  - **Interrupt context** — inside an interrupt handler, including the tick
//!    handler and timer callbacks. Blocking services return `BadContext`
//!    here; nonblocking services (`signal`, `raise`, `notify_*`, `try_*`,
//!    `free`, timer control) are available.
//!  - **Boot context** — inside the closure passed to [`PortToKernel::boot`],
//!    before the first dispatch. Object creation and `start` are available.
//!
//! # Protection levels
//!
//! Two nested protection levels guard kernel state:
//!
//!  - **CPU Lock** masks interrupts up to the port's managed priority
//!    threshold and protects list and counter mutation. It is held only for
//!    short, bounded sections; internally, a token-lock cell type makes the
//!    discipline a type-system fact.
//!  - **The scheduler lock** ([`lock_scheduler`]) suppresses thread switching
//!    without masking interrupts. Signaling and thread creation remain
//!    available while it is held; blocking does not. The preemption decision
//!    is re-examined when the last lock is released.
//!
//! # Ports
//!
//! The kernel is generic over a `Traits` type supplied by a *port*, which
//! binds the architecture-specific mechanisms: context switching
//! ([`PortThreading`]), the tick source ([`PortTimer`]), and the location of
//! the kernel-global state ([`KernelTraits`]). The kernel's entry points for
//! the port are collected in [`PortToKernel`].
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod utils;

mod klock;
pub mod cond_var;
pub mod error;
pub mod event_flags;
pub mod mem_pool;
pub mod mutex;
pub mod semaphore;
pub mod state;
pub mod thread;
pub mod timeout;
pub mod timer;
mod wait;

#[cfg(test)]
mod test_utils;

use core::fmt;

use crate::utils::Init;

pub use crate::{
    cond_var::CondVarCb,
    error::*,
    event_flags::{AtomicEventFlagBits, EventFlagBits, EventFlagsCb, EventFlagsWaitFlags},
    mem_pool::MemoryPoolCb,
    mutex::{MutexAttr, MutexCb, MutexKind, MutexProtocol, MutexRobustness},
    semaphore::{SemaphoreCb, SemaphoreValue},
    state::{lock_scheduler, unlock_scheduler, KernelState},
    thread::{current, exit_current, sleep, sleep_until, StackRegion, ThreadAttr, ThreadCb, ThreadSt},
    timeout::{now, set_system_time, system_time},
    timer::{TimerAttr, TimerCb},
    wait::QueueOrder,
};

/// A thread priority. A higher numeric value is more urgent.
pub type Priority = u8;

/// A relative duration, measured in timer ticks.
pub type Ticks = u64;

/// An absolute point in time, measured in timer ticks since boot.
pub type Time = u64;

/// Provides access to the system-global kernel state.
///
/// This is the umbrella trait a port implements (usually through an
/// instantiation macro) to bind the kernel to its architecture layer.
pub trait KernelTraits: PortThreading + PortTimer {
    /// The kernel-global state object. Must refer to the same instance for
    /// the entire lifetime of the system.
    fn state() -> &'static KernelState<Self>;
}

/// Implemented by a port to provide the low-level context-switching and
/// interrupt-masking mechanisms.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel. The implementor
/// must uphold each method's documented contract; the kernel's memory safety
/// depends on it.
pub unsafe trait PortThreading: Sized + 'static {
    /// The port-specific part of a thread's state, embedded at the beginning
    /// of every [`ThreadCb`] so that context-switching code can locate it.
    type PortThreadState: Send + Sync + Init + fmt::Debug + 'static;

    /// Hand the processor to the thread chosen by
    /// [`PortToKernel::choose_running_thread`], never returning to the
    /// caller. Precondition: CPU Lock active, boot context.
    unsafe fn dispatch_first_thread() -> !;

    /// Yield the processor so that the dispatcher can switch to the thread
    /// chosen by [`PortToKernel::choose_running_thread`].
    /// Precondition: CPU Lock inactive.
    unsafe fn yield_cpu();

    /// Destroy the calling thread's execution context and dispatch the next
    /// thread. Precondition: CPU Lock active, thread context.
    unsafe fn exit_and_dispatch(thread: &'static ThreadCb<Self>) -> !;

    /// Enter the interrupt critical section (mask interrupts up to the
    /// managed priority threshold). Precondition: CPU Lock inactive.
    unsafe fn enter_cpu_lock();

    /// Enter the interrupt critical section if it's inactive. Returns `true`
    /// on success.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave the interrupt critical section. Precondition: CPU Lock active.
    unsafe fn leave_cpu_lock();

    /// Prepare the thread's execution context so that it starts from its
    /// entry point the next time it's dispatched. Precondition: CPU Lock
    /// active, the thread is not running and owns no live context.
    unsafe fn initialize_thread_state(thread: &'static ThreadCb<Self>);

    /// Return a flag indicating whether the CPU Lock is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a thread
    /// context.
    fn is_thread_context() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// context.
    fn is_interrupt_context() -> bool;

    /// Return a flag indicating whether the dispatcher has started (i.e.,
    /// [`PortToKernel::boot`] has completed the boot phase). The kernel
    /// suppresses preemption checks until then.
    fn is_scheduler_active() -> bool;
}

/// Implemented by a port to describe its tick source.
///
/// The tick source is a periodic interrupt whose handler calls
/// [`PortToKernel::timer_tick`] exactly once per period.
pub trait PortTimer: Sized + 'static {
    /// The tick frequency, in ticks per second.
    const TICKS_PER_SECOND: u32;
}

/// The kernel's entry points for the port. Implemented by the kernel itself
/// for every type implementing [`KernelTraits`].
pub trait PortToKernel: KernelTraits {
    /// Complete the boot phase and dispatch the first thread.
    ///
    /// `init` runs in the boot context with CPU Lock inactive; it is expected
    /// to create kernel objects and start the initial threads.
    ///
    /// # Safety
    ///
    /// Precondition: CPU Lock active, boot context, called exactly once.
    unsafe fn boot(init: impl FnOnce()) -> !;

    /// Process a single timer tick: advance the tick count and fire every
    /// timeout that has been reached.
    ///
    /// # Safety
    ///
    /// Precondition: CPU Lock inactive, an interrupt context.
    unsafe fn timer_tick();

    /// Make a scheduling decision, transitioning the chosen thread into the
    /// Running state, and return it so the port can switch to its execution
    /// context. Returns `None` if there's no runnable thread (the port should
    /// idle until an interrupt arrives).
    ///
    /// # Safety
    ///
    /// Precondition: CPU Lock active. The CPU Lock remains active when this
    /// method returns.
    unsafe fn choose_running_thread() -> Option<&'static ThreadCb<Self>>;
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot(init: impl FnOnce()) -> ! {
        // Safety: CPU Lock is active per this method's precondition, and no
        //         `CpuLockGuard` can exist before boot
        let lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        // Leave CPU Lock so that `init` can use the normal services
        drop(lock);

        init();

        // Safety: CPU Lock inactive (released above)
        unsafe { Traits::enter_cpu_lock() };

        // Choose the first thread to run
        // Safety: CPU Lock active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        thread::choose_next_running_thread(lock.borrow_mut());
        core::mem::forget(lock);

        // Safety: CPU Lock active, boot context
        unsafe { Traits::dispatch_first_thread() }
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }

    unsafe fn choose_running_thread() -> Option<&'static ThreadCb<Self>> {
        // Safety: CPU Lock is active per this method's precondition, and the
        //         port is not inside another kernel entry point, so no
        //         `CpuLockGuard` exists
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        thread::choose_next_running_thread(lock.borrow_mut());
        let running_thread = Traits::state().running_thread(lock.borrow_mut());

        // The CPU Lock must remain active; the guard was only borrowed from
        // the port
        core::mem::forget(lock);

        running_thread
    }
}
