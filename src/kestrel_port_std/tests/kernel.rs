//! Kernel behavior tests, driven through the simulator port.
//!
//! Every test hosts its own kernel instance (its own `Traits` type and
//! statics), so the tests are independent and can run in parallel. A test's
//! "main" thread runs at a high priority, spawns lower- or higher-priority
//! worker threads, and shuts the simulation down once it has joined them.
//!
//! Durations are in ticks (≈1 ms each under this port); the sleeps are
//! spaced widely enough that scheduling jitter cannot reorder them.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::Mutex;

use kestrel_kernel::{
    thread, CondVarCb, EventFlagsCb, EventFlagsWaitFlags, LockMutexError,
    LockMutexTimeoutError, MemoryPoolCb, MutexAttr, MutexCb, MutexProtocol, MutexRobustness,
    SemaphoreCb, SleepError, StackRegion, ThreadAttr, ThreadCb, ThreadSt, TimerAttr, TimerCb,
    WaitCondVarTimeoutError,
};

const fn attr(entry_point: fn(usize), entry_param: usize, priority: u8) -> ThreadAttr {
    ThreadAttr {
        entry_point,
        entry_param,
        stack: StackRegion::AUTO,
        priority,
    }
}

mod semaphore_releases_by_priority {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static SEM: SemaphoreCb<Tr> = SemaphoreCb::new(0, 16);
    static RESULT: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 20));
    // Created (and started) in this order: 5, 10, 7
    static W5: ThreadCb<Tr> = ThreadCb::new(attr(waiter_body, 5, 5));
    static W10: ThreadCb<Tr> = ThreadCb::new(attr(waiter_body, 10, 10));
    static W7: ThreadCb<Tr> = ThreadCb::new(attr(waiter_body, 7, 7));

    fn waiter_body(id: usize) {
        SEM.wait_one().unwrap();
        RESULT.lock().unwrap().push(id as u8);
    }

    fn main_body(_: usize) {
        W5.start().unwrap();
        W10.start().unwrap();
        W7.start().unwrap();

        // Let all three block on the semaphore
        thread::sleep::<Tr>(50).unwrap();
        assert_eq!(W5.state().unwrap(), ThreadSt::Waiting);
        assert_eq!(W10.state().unwrap(), ThreadSt::Waiting);
        assert_eq!(W7.state().unwrap(), ThreadSt::Waiting);

        // One post releases the highest-priority waiter, not the
        // first-created one
        SEM.signal_one().unwrap();
        thread::sleep::<Tr>(50).unwrap();
        assert_eq!(*RESULT.lock().unwrap(), [10]);

        SEM.signal_one().unwrap();
        thread::sleep::<Tr>(50).unwrap();
        SEM.signal_one().unwrap();

        W10.join().unwrap();
        W7.join().unwrap();
        W5.join().unwrap();
        assert_eq!(*RESULT.lock().unwrap(), [10, 7, 5]);

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn semaphore_releases_by_priority() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod mutex_hands_ownership_to_the_waiter {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static M: MutexCb<Tr> = MutexCb::new(MutexAttr::DEFAULT);
    static RESULT: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 10));
    static CONTENDER: ThreadCb<Tr> = ThreadCb::new(attr(contender_body, 0, 20));

    fn contender_body(_: usize) {
        // Blocks: the mutex is held by the main thread
        M.lock().unwrap();

        // Ownership was granted before this thread even resumed
        assert!(std::ptr::eq(
            M.owning_thread().unwrap().unwrap(),
            &CONTENDER
        ));
        RESULT.lock().unwrap().push("contender-acquired");

        M.unlock().unwrap();
    }

    fn main_body(_: usize) {
        M.lock().unwrap();
        RESULT.lock().unwrap().push("main-locked");

        // The contender preempts us and immediately blocks on the mutex
        CONTENDER.start().unwrap();
        assert_eq!(CONTENDER.state().unwrap(), ThreadSt::Waiting);
        assert!(std::ptr::eq(M.owning_thread().unwrap().unwrap(), &MAIN));

        // Unlock hands the mutex directly to the contender
        M.unlock().unwrap();

        CONTENDER.join().unwrap();
        assert_eq!(
            *RESULT.lock().unwrap(),
            ["main-locked", "contender-acquired"]
        );
        assert!(!M.is_locked().unwrap());

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn mutex_hands_ownership_to_the_waiter() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod timed_mutex_lock_expires {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static M: MutexCb<Tr> = MutexCb::new(MutexAttr::DEFAULT);
    static TIMED_OUT: AtomicBool = AtomicBool::new(false);

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 10));
    static WAITER: ThreadCb<Tr> = ThreadCb::new(attr(waiter_body, 0, 5));

    fn waiter_body(_: usize) {
        assert_eq!(
            M.lock_timeout(20),
            Err(LockMutexTimeoutError::Timeout)
        );
        TIMED_OUT.store(true, Ordering::Relaxed);
    }

    fn main_body(_: usize) {
        M.lock().unwrap();
        WAITER.start().unwrap();

        // Keep the mutex held well past the waiter's deadline
        thread::sleep::<Tr>(100).unwrap();

        WAITER.join().unwrap();
        assert!(TIMED_OUT.load(Ordering::Relaxed));

        // The expired wait left the queue empty, so the unlock keeps the
        // mutex free
        M.unlock().unwrap();
        assert!(!M.is_locked().unwrap());

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn timed_mutex_lock_expires() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod event_flags_wait_for_all_bits {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static FLAGS: EventFlagsCb<Tr> = EventFlagsCb::new(0);
    static OBSERVED: AtomicU32 = AtomicU32::new(0);

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 10));
    static WAITER: ThreadCb<Tr> = ThreadCb::new(attr(waiter_body, 0, 20));

    fn waiter_body(_: usize) {
        let observed = FLAGS
            .wait(0b11, EventFlagsWaitFlags::ALL | EventFlagsWaitFlags::CLEAR)
            .unwrap();
        OBSERVED.store(observed, Ordering::Relaxed);
    }

    fn main_body(_: usize) {
        // The waiter preempts us and blocks for *all* of `0b11`
        WAITER.start().unwrap();
        assert_eq!(WAITER.state().unwrap(), ThreadSt::Waiting);

        // One of the two requested bits is not enough
        FLAGS.raise(0b01).unwrap();
        assert_eq!(WAITER.state().unwrap(), ThreadSt::Waiting);

        // The second raise completes the mask and releases the waiter
        FLAGS.raise(0b10).unwrap();
        WAITER.join().unwrap();

        assert_eq!(OBSERVED.load(Ordering::Relaxed), 0b11);
        // The waiter asked for auto-clearing
        assert_eq!(FLAGS.get().unwrap(), 0);

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn event_flags_wait_for_all_bits() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod timed_waits_fire_in_duration_order {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static RESULT: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 20));
    // Started longest-sleep first, to rule out accidental FIFO ordering
    static W90: ThreadCb<Tr> = ThreadCb::new(attr(sleeper_body, 90, 5));
    static W60: ThreadCb<Tr> = ThreadCb::new(attr(sleeper_body, 60, 6));
    static W30: ThreadCb<Tr> = ThreadCb::new(attr(sleeper_body, 30, 7));

    fn sleeper_body(duration: usize) {
        thread::sleep::<Tr>(duration as u64).unwrap();
        RESULT.lock().unwrap().push(duration);
    }

    fn main_body(_: usize) {
        W90.start().unwrap();
        W60.start().unwrap();
        W30.start().unwrap();

        thread::sleep::<Tr>(200).unwrap();

        W90.join().unwrap();
        W60.join().unwrap();
        W30.join().unwrap();

        // A wait scheduled to expire sooner never fires after one scheduled
        // later
        assert_eq!(*RESULT.lock().unwrap(), [30, 60, 90]);

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn timed_waits_fire_in_duration_order() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod cond_var_wakes_the_consumer {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static M: MutexCb<Tr> = MutexCb::new(MutexAttr::DEFAULT);
    static CV: CondVarCb<Tr> = CondVarCb::new();
    static FLAG: AtomicBool = AtomicBool::new(false);
    static CONSUMED: AtomicBool = AtomicBool::new(false);

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 10));
    static CONSUMER: ThreadCb<Tr> = ThreadCb::new(attr(consumer_body, 0, 5));

    fn consumer_body(_: usize) {
        M.lock().unwrap();
        // The classic predicate loop: a wake-up only means "look again"
        while !FLAG.load(Ordering::Relaxed) {
            CV.wait(&M).unwrap();
        }
        M.unlock().unwrap();
        CONSUMED.store(true, Ordering::Relaxed);
    }

    fn main_body(_: usize) {
        CONSUMER.start().unwrap();

        // Let the consumer take the mutex and block on the condition
        // variable (which releases the mutex)
        thread::sleep::<Tr>(50).unwrap();
        assert_eq!(CONSUMER.state().unwrap(), ThreadSt::Waiting);

        M.lock().unwrap();
        FLAG.store(true, Ordering::Relaxed);
        M.unlock().unwrap();
        CV.notify_one().unwrap();

        CONSUMER.join().unwrap();
        assert!(CONSUMED.load(Ordering::Relaxed));

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn cond_var_wakes_the_consumer() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod cond_var_timeout_reacquires_the_mutex {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static M: MutexCb<Tr> = MutexCb::new(MutexAttr::DEFAULT);
    static CV: CondVarCb<Tr> = CondVarCb::new();

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 10));

    fn main_body(_: usize) {
        M.lock().unwrap();

        // Nobody notifies; the wait times out with the whole system idle
        assert_eq!(
            CV.wait_timeout(&M, 20),
            Err(WaitCondVarTimeoutError::Timeout)
        );

        // The mutex was re-acquired on the way out
        assert!(std::ptr::eq(M.owning_thread().unwrap().unwrap(), &MAIN));
        M.unlock().unwrap();

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn cond_var_timeout_reacquires_the_mutex() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod interrupt_aborts_a_sleep {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static INTERRUPTED: AtomicBool = AtomicBool::new(false);

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 10));
    static SLEEPER: ThreadCb<Tr> = ThreadCb::new(attr(sleeper_body, 0, 5));

    fn sleeper_body(_: usize) {
        assert_eq!(thread::sleep::<Tr>(100_000), Err(SleepError::Interrupted));
        INTERRUPTED.store(true, Ordering::Relaxed);
    }

    fn main_body(_: usize) {
        SLEEPER.start().unwrap();
        thread::sleep::<Tr>(30).unwrap();

        assert_eq!(SLEEPER.state().unwrap(), ThreadSt::Waiting);
        SLEEPER.interrupt().unwrap();

        SLEEPER.join().unwrap();
        assert!(INTERRUPTED.load(Ordering::Relaxed));

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn interrupt_aborts_a_sleep() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod priority_protocols_bound_inversion {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static M_INHERIT: MutexCb<Tr> = MutexCb::new(MutexAttr {
        protocol: MutexProtocol::Inherit,
        ..MutexAttr::DEFAULT
    });
    static M_CEILING: MutexCb<Tr> = MutexCb::new(MutexAttr {
        protocol: MutexProtocol::Ceiling(20),
        ..MutexAttr::DEFAULT
    });

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 5));
    static CONTENDER: ThreadCb<Tr> = ThreadCb::new(attr(contender_body, 0, 15));

    fn contender_body(_: usize) {
        M_INHERIT.lock().unwrap();
        M_INHERIT.unlock().unwrap();
    }

    fn main_body(_: usize) {
        // The ceiling protocol elevates the owner to the ceiling while held
        M_CEILING.lock().unwrap();
        assert_eq!(MAIN.effective_priority().unwrap(), 20);
        assert_eq!(MAIN.priority().unwrap(), 5);
        M_CEILING.unlock().unwrap();
        assert_eq!(MAIN.effective_priority().unwrap(), 5);

        // The inheritance protocol elevates the owner to the blocked
        // waiter's priority, for exactly as long as the contention lasts
        M_INHERIT.lock().unwrap();
        CONTENDER.start().unwrap();
        assert_eq!(CONTENDER.state().unwrap(), ThreadSt::Waiting);
        assert_eq!(MAIN.effective_priority().unwrap(), 15);
        assert_eq!(MAIN.priority().unwrap(), 5);

        M_INHERIT.unlock().unwrap();
        assert_eq!(MAIN.effective_priority().unwrap(), 5);

        CONTENDER.join().unwrap();

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn priority_protocols_bound_inversion() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod robust_mutex_survives_owner_death {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static M: MutexCb<Tr> = MutexCb::new(MutexAttr {
        robustness: MutexRobustness::Robust,
        ..MutexAttr::DEFAULT
    });

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 10));
    static VICTIM: ThreadCb<Tr> = ThreadCb::new(attr(victim_body, 0, 20));

    fn victim_body(_: usize) {
        M.lock().unwrap();
        // Exits while holding the mutex
    }

    fn main_body(_: usize) {
        // The victim preempts us, takes the mutex, and dies with it
        VICTIM.start().unwrap();
        VICTIM.join().unwrap();

        // The next acquisition succeeds but reports the abandonment
        assert_eq!(M.lock(), Err(LockMutexError::Abandoned));
        assert!(std::ptr::eq(M.owning_thread().unwrap().unwrap(), &MAIN));

        M.mark_consistent().unwrap();
        M.unlock().unwrap();

        // Normal operation has resumed
        M.lock().unwrap();
        M.unlock().unwrap();

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn robust_mutex_survives_owner_death() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod scheduler_lock_defers_preemption {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static RESULT: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 5));
    static URGENT: ThreadCb<Tr> = ThreadCb::new(attr(urgent_body, 0, 20));

    fn urgent_body(_: usize) {
        RESULT.lock().unwrap().push("urgent");
    }

    fn main_body(_: usize) {
        kestrel_kernel::lock_scheduler::<Tr>().unwrap();

        // A higher-priority thread becomes Ready but cannot preempt us while
        // the scheduler is locked
        URGENT.start().unwrap();
        assert_eq!(URGENT.state().unwrap(), ThreadSt::Ready);
        assert!(RESULT.lock().unwrap().is_empty());

        // Blocking is a contract violation while the lock is held
        assert_eq!(thread::sleep::<Tr>(10), Err(SleepError::BadContext));

        RESULT.lock().unwrap().push("main");

        // Releasing the lock re-examines the deferred decision
        kestrel_kernel::unlock_scheduler::<Tr>().unwrap();

        URGENT.join().unwrap();
        assert_eq!(*RESULT.lock().unwrap(), ["main", "urgent"]);

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn scheduler_lock_defers_preemption() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod memory_pool_hands_a_block_to_the_waiter {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static POOL: MemoryPoolCb<Tr> = MemoryPoolCb::new(16, 2);
    static GRANTED: AtomicPtr<u8> = AtomicPtr::new(std::ptr::null_mut());

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 10));
    static WAITER: ThreadCb<Tr> = ThreadCb::new(attr(waiter_body, 0, 20));

    fn waiter_body(_: usize) {
        // The pool is empty at this point; `free` hands us a block directly
        let block = POOL.alloc().unwrap();
        GRANTED.store(block.as_ptr(), Ordering::Relaxed);
        POOL.free(block).unwrap();
    }

    fn main_body(_: usize) {
        let region = Box::leak(vec![0usize; 16 * 2 / core::mem::size_of::<usize>()].into_boxed_slice());
        // Safety: The region was freshly leaked and is used by nothing else
        unsafe { POOL.init(region.as_mut_ptr().cast(), 16 * 2).unwrap() };

        let a = POOL.alloc().unwrap();
        let b = POOL.alloc().unwrap();

        // The waiter preempts us and blocks on the exhausted pool
        WAITER.start().unwrap();
        assert_eq!(WAITER.state().unwrap(), ThreadSt::Waiting);

        // Freeing a block passes it straight to the waiter
        POOL.free(a).unwrap();
        WAITER.join().unwrap();
        assert_eq!(GRANTED.load(Ordering::Relaxed), a.as_ptr());

        POOL.free(b).unwrap();

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn memory_pool_hands_a_block_to_the_waiter() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod periodic_timer_fires_repeatedly {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static COUNT: AtomicU32 = AtomicU32::new(0);

    static TIMER: TimerCb<Tr> = TimerCb::new(TimerAttr {
        callback: tick,
        callback_param: 0,
        delay: 20,
        period: Some(20),
    });

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 10));

    fn tick(_: usize) {
        COUNT.fetch_add(1, Ordering::Relaxed);
    }

    fn main_body(_: usize) {
        TIMER.start().unwrap();
        thread::sleep::<Tr>(110).unwrap();
        TIMER.stop().unwrap();

        // Expiries at ticks 20, 40, 60, 80 and 100; leave slack for the
        // tick or two that may elapse between `start` and `sleep`
        let count = COUNT.load(Ordering::Relaxed);
        assert!((4..=6).contains(&count), "fired {count} times");

        let stopped_at = COUNT.load(Ordering::Relaxed);
        thread::sleep::<Tr>(60).unwrap();
        assert_eq!(COUNT.load(Ordering::Relaxed), stopped_at);

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn periodic_timer_fires_repeatedly() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod threads_restart_after_reclamation {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static RUNS: AtomicU32 = AtomicU32::new(0);

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 10));
    static WORKER: ThreadCb<Tr> = ThreadCb::new(attr(worker_body, 0, 20));

    fn worker_body(_: usize) {
        RUNS.fetch_add(1, Ordering::Relaxed);
    }

    fn main_body(_: usize) {
        WORKER.start().unwrap();
        WORKER.join().unwrap();
        assert_eq!(WORKER.state().unwrap(), ThreadSt::Reclaimed);
        assert_eq!(RUNS.load(Ordering::Relaxed), 1);

        // A reclaimed control block is reusable
        WORKER.start().unwrap();
        WORKER.join().unwrap();
        assert_eq!(RUNS.load(Ordering::Relaxed), 2);

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn threads_restart_after_reclamation() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}

mod timed_semaphore_wait_expires {
    use super::*;

    kestrel_port_std::use_sim_port!(unsafe struct Tr);

    static SEM: SemaphoreCb<Tr> = SemaphoreCb::new(0, 1);

    static MAIN: ThreadCb<Tr> = ThreadCb::new(attr(main_body, 0, 10));

    fn main_body(_: usize) {
        use kestrel_kernel::WaitSemaphoreTimeoutError;

        let before = kestrel_kernel::now::<Tr>().unwrap();
        assert_eq!(
            SEM.wait_one_timeout(30),
            Err(WaitSemaphoreTimeoutError::Timeout)
        );
        let elapsed = kestrel_kernel::now::<Tr>().unwrap() - before;
        assert!(elapsed >= 30, "woke after only {elapsed} ticks");

        // A permit that arrives in time is consumed normally
        SEM.signal_one().unwrap();
        SEM.wait_one_timeout(30).unwrap();

        kestrel_port_std::shutdown::<Tr>();
    }

    #[test]
    fn timed_semaphore_wait_expires() {
        kestrel_port_std::run::<Tr>(|| MAIN.start().unwrap());
    }
}
