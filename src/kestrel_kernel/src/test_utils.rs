//! A minimal port used by the unit tests.
//!
//! It provides just enough of the port contract to exercise the kernel's
//! non-blocking paths from a single OS thread: the CPU Lock is an atomic
//! flag, the dispatcher never becomes active (`is_scheduler_active` is
//! `false`, so preemption checks are no-ops), and any attempt to actually
//! switch contexts fails the test. Tests that need a "running thread" play
//! the scheduler's role themselves with [`make_running`].
//!
//! [`define_test_kernel!`] is invoked *inside a test function*, giving every
//! test its own kernel instance; the tests stay parallel-safe that way.
use crate::{klock, thread::ThreadSt, KernelTraits, Priority, StackRegion, ThreadAttr, ThreadCb};

macro_rules! define_test_kernel {
    (struct $SystemTraits:ident) => {
        struct $SystemTraits;

        const _: () = {
            static CPU_LOCK: ::core::sync::atomic::AtomicBool =
                ::core::sync::atomic::AtomicBool::new(false);
            static KERNEL_STATE: $crate::KernelState<$SystemTraits> =
                $crate::KernelState::new();

            unsafe impl $crate::PortThreading for $SystemTraits {
                type PortThreadState = ();

                unsafe fn dispatch_first_thread() -> ! {
                    unreachable!("the unit-test port cannot dispatch")
                }

                unsafe fn yield_cpu() {
                    unreachable!("the unit-test port cannot switch contexts")
                }

                unsafe fn exit_and_dispatch(_thread: &'static $crate::ThreadCb<Self>) -> ! {
                    unreachable!("the unit-test port cannot dispatch")
                }

                unsafe fn enter_cpu_lock() {
                    assert!(!CPU_LOCK.swap(true, ::core::sync::atomic::Ordering::Acquire));
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    CPU_LOCK
                        .compare_exchange(
                            false,
                            true,
                            ::core::sync::atomic::Ordering::Acquire,
                            ::core::sync::atomic::Ordering::Relaxed,
                        )
                        .is_ok()
                }

                unsafe fn leave_cpu_lock() {
                    CPU_LOCK.store(false, ::core::sync::atomic::Ordering::Release);
                }

                unsafe fn initialize_thread_state(_thread: &'static $crate::ThreadCb<Self>) {}

                fn is_cpu_lock_active() -> bool {
                    CPU_LOCK.load(::core::sync::atomic::Ordering::Relaxed)
                }

                fn is_thread_context() -> bool {
                    true
                }

                fn is_interrupt_context() -> bool {
                    false
                }

                fn is_scheduler_active() -> bool {
                    false
                }
            }

            impl $crate::PortTimer for $SystemTraits {
                const TICKS_PER_SECOND: u32 = 1000;
            }

            impl $crate::KernelTraits for $SystemTraits {
                fn state() -> &'static $crate::KernelState<Self> {
                    &KERNEL_STATE
                }
            }
        };
    };
}

pub(crate) use define_test_kernel;

pub(crate) fn noop_entry(_: usize) {}

pub(crate) const fn thread_attr(priority: Priority) -> ThreadAttr {
    ThreadAttr {
        entry_point: noop_entry,
        entry_param: 0,
        stack: StackRegion::AUTO,
        priority,
    }
}

/// Fabricate a Running thread, playing the role the dispatcher would.
pub(crate) fn make_running<Traits: KernelTraits>(thread_cb: &'static ThreadCb<Traits>) {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    thread_cb.st.replace(&mut *lock, ThreadSt::Running);
    Traits::state()
        .running_thread
        .replace(&mut *lock, Some(thread_cb));
}
