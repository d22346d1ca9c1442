//! Simulator port of the Kestrel kernel for hosted environments.
//!
//! Each kernel thread is backed by an OS thread, but the port enforces the
//! kernel's single-core execution model: only the *scheduled* worker may
//! enter the kernel, and the CPU Lock is a real mutual exclusion between the
//! workers and the interrupt-simulating threads. A timer thread delivers a
//! tick roughly every millisecond ([`TICKS_PER_SECOND`]).
//!
//! One deliberate simplification relative to real hardware: preemption of a
//! thread that is executing *application* code (making no kernel calls)
//! takes effect at that thread's next kernel entry rather than instantly.
//! The kernel's observable scheduling decisions are unaffected, which is
//! what the test suite exercises.
//!
//! Use [`use_sim_port!`] to instantiate a kernel, and [`run`] to boot it:
//!
//! ```ignore
//! kestrel_port_std::use_sim_port!(unsafe struct SystemTraits);
//!
//! static MAIN: ThreadCb<SystemTraits> = ThreadCb::new(ThreadAttr { /* … */ });
//!
//! kestrel_port_std::run::<SystemTraits>(|| {
//!     MAIN.start().unwrap();
//! });
//! ```
use std::{
    any::Any,
    cell::Cell,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{Condvar, Mutex, MutexGuard, Once},
    thread::ThreadId,
    time::Duration,
};

use kestrel_kernel::{utils::Init, KernelTraits, PortThreading, PortToKernel, ThreadCb};
use spin::Mutex as SpinMutex;

/// The tick frequency the timer thread approximates.
pub const TICKS_PER_SECOND: u32 = 1000;

/// Implemented on a kernel traits type by [`use_sim_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_sim_port!`].
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortThreadState = ThreadState> + PortToKernel
{
    fn port_state() -> &'static State;
}

/// Identifies a worker thread backing a kernel thread.
type WorkerId = usize;

/// The role of an OS thread participating in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The backing thread for an interrupt context (the timer thread).
    Interrupt,
    /// The backing thread for a kernel thread.
    Thread,
}

thread_local! {
    /// The current OS thread's role. Assigned when the port creates the
    /// thread.
    static ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);

    /// The worker ID of the current OS thread, if it backs a kernel thread.
    static CURRENT_WORKER: Cell<Option<WorkerId>> = Cell::new(None);
}

/// Payload of the panic used to destroy a worker's execution context (the
/// hosted stand-in for `exit_and_dispatch` discarding a stack).
struct ThreadExitToken;

/// The port-specific part of a thread's state.
pub struct ThreadState {
    /// The thread's position in the worker-thread state machine.
    ///
    /// Accessed with CPU Lock or the port scheduler's mutex held, so a spin
    /// mutex is sufficient; runtime performance is not a concern here.
    tsm: SpinMutex<Tsm>,
}

impl ThreadState {
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

impl Init for ThreadState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("tsm", &*self.tsm.lock())
            .finish()
    }
}

/// Worker-thread state machine.
///
/// These don't exactly align with the thread states defined in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tsm {
    /// No execution context exists. The kernel must call
    /// `initialize_thread_state` before this thread can be dispatched.
    Uninit,
    /// The context is initialized but no OS thread has been spawned yet.
    Dormant,
    /// The kernel thread is backed by the given worker.
    Running(WorkerId),
}

#[derive(Debug)]
struct SchedState {
    /// The OS thread currently inside the interrupt critical section, if
    /// any.
    cpu_lock: Option<ThreadId>,

    /// The worker allowed to execute kernel-thread code. `None` while the
    /// processor idles.
    current: Option<WorkerId>,

    next_worker_id: WorkerId,

    shutdown: bool,

    /// The first real panic observed in any port-managed thread, re-thrown
    /// by [`run`].
    panic_payload: Option<Box<dyn Any + Send>>,
}

/// The internal state of the port. One instance exists per
/// [`use_sim_port!`]-instantiated kernel.
pub struct State {
    sched: Mutex<SchedState>,
    cond: Condvar,
}

impl State {
    pub const fn new() -> Self {
        Self {
            sched: Mutex::new(SchedState {
                cpu_lock: None,
                current: None,
                next_worker_id: 0,
                shutdown: false,
                panic_payload: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Lock the port scheduler. A panic in another port-managed thread may
    /// have poisoned the mutex; the state it guards stays consistent
    /// regardless, so poisoning is ignored.
    fn sched(&self) -> MutexGuard<'_, SchedState> {
        self.sched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait_sched<'a>(&self, guard: MutexGuard<'a, SchedState>) -> MutexGuard<'a, SchedState> {
        self.cond
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire the CPU Lock without the scheduled-worker gate. Used by the
    /// boot and interrupt contexts, and by the dispatcher itself.
    fn raw_acquire_cpu_lock(&self) {
        let mut sched = self.sched();
        while sched.cpu_lock.is_some() {
            sched = self.wait_sched(sched);
        }
        sched.cpu_lock = Some(std::thread::current().id());
    }

    fn release_cpu_lock(&self) {
        let mut sched = self.sched();
        assert_eq!(sched.cpu_lock, Some(std::thread::current().id()));
        sched.cpu_lock = None;
        drop(sched);
        self.cond.notify_all();
    }

    /// Record a real panic and initiate shutdown so [`run`] can re-throw it.
    fn record_panic(&self, payload: Box<dyn Any + Send>) {
        let mut sched = self.sched();
        if sched.panic_payload.is_none() {
            sched.panic_payload = Some(payload);
        }
        sched.shutdown = true;
        drop(sched);
        self.cond.notify_all();
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub unsafe fn enter_cpu_lock<Traits: PortInstance>(&self) {
        log::trace!("enter_cpu_lock");
        match ROLE.with(|r| r.get()) {
            ThreadRole::Thread => {
                let me = CURRENT_WORKER.with(|w| w.get()).unwrap();
                let mut sched = self.sched();
                // Only the scheduled worker may enter the kernel; a deposed
                // worker parks here until it's scheduled again
                loop {
                    if sched.shutdown {
                        // The simulation is over and this worker will never
                        // be scheduled again. Sleep forever — unwinding here
                        // would trip the cleanup assertions of the kernel
                        // code up the stack.
                        sched = self.wait_sched(sched);
                        continue;
                    }
                    if sched.cpu_lock.is_none() && sched.current == Some(me) {
                        break;
                    }
                    sched = self.wait_sched(sched);
                }
                sched.cpu_lock = Some(std::thread::current().id());
            }
            _ => self.raw_acquire_cpu_lock(),
        }
    }

    pub unsafe fn try_enter_cpu_lock<Traits: PortInstance>(&self) -> bool {
        {
            let sched = self.sched();
            if sched.cpu_lock == Some(std::thread::current().id()) {
                // CPU Lock is already active in this context
                return false;
            }
        }
        // Safety: Upheld by the caller
        unsafe { self.enter_cpu_lock::<Traits>() };
        true
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&self) {
        log::trace!("leave_cpu_lock");
        self.release_cpu_lock();
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&self) -> bool {
        let sched = self.sched();
        sched.cpu_lock == Some(std::thread::current().id())
    }

    pub fn is_thread_context<Traits: PortInstance>(&self) -> bool {
        ROLE.with(|r| r.get()) == ThreadRole::Thread
    }

    pub fn is_interrupt_context<Traits: PortInstance>(&self) -> bool {
        ROLE.with(|r| r.get()) == ThreadRole::Interrupt
    }

    pub fn is_scheduler_active<Traits: PortInstance>(&self) -> bool {
        ROLE.with(|r| r.get()) != ThreadRole::Boot
    }

    pub unsafe fn initialize_thread_state<Traits: PortInstance>(
        &self,
        thread: &'static ThreadCb<Traits>,
    ) {
        log::trace!("initialize_thread_state({thread:p})");
        let mut tsm = thread.port_thread_state.tsm.lock();
        match &*tsm {
            Tsm::Dormant => {}
            Tsm::Uninit => {
                *tsm = Tsm::Dormant;
            }
            Tsm::Running(_) => {
                unreachable!("initializing a thread that still has a live context");
            }
        }
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        self.dispatch::<Traits>();
    }

    pub unsafe fn dispatch_first_thread<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_thread");
        assert_eq!(ROLE.with(|r| r.get()), ThreadRole::Boot);

        // `PortToKernel::boot` leaves CPU Lock active for this call
        self.release_cpu_lock();

        self.dispatch::<Traits>();

        // The boot context is no longer needed; park until shutdown
        let mut sched = self.sched();
        while !sched.shutdown {
            sched = self.wait_sched(sched);
        }
        drop(sched);
        std::panic::panic_any(ThreadExitToken)
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        thread: &'static ThreadCb<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch({thread:p})");
        assert_eq!(ROLE.with(|r| r.get()), ThreadRole::Thread);

        // Dissociate the worker from the kernel thread so the control block
        // can be started again later
        {
            let mut tsm = thread.port_thread_state.tsm.lock();
            assert!(matches!(&*tsm, Tsm::Running(_)));
            *tsm = Tsm::Uninit;
        }

        // The kernel leaves CPU Lock active across `exit_and_dispatch`
        self.release_cpu_lock();

        self.dispatch::<Traits>();

        CURRENT_WORKER.with(|w| w.set(None));

        // Destroy this worker's execution context
        std::panic::panic_any(ThreadExitToken)
    }

    /// Run the dispatcher: let the kernel choose the next running thread,
    /// then reflect the decision in the port scheduler, spawning a worker
    /// for a thread that has never run.
    fn dispatch<Traits: PortInstance>(&'static self) {
        // Make the scheduling decision with CPU Lock active
        self.raw_acquire_cpu_lock();
        // Safety: CPU Lock active, and this is a port
        let chosen = unsafe { Traits::choose_running_thread() };

        let mut sched = self.sched();

        let new_current = if let Some(thread_cb) = chosen {
            log::trace!("dispatching thread {thread_cb:p}");

            let mut tsm = thread_cb.port_thread_state.tsm.lock();
            let worker_id = match &*tsm {
                Tsm::Running(worker_id) => *worker_id,
                Tsm::Dormant => {
                    let worker_id = sched.next_worker_id;
                    sched.next_worker_id += 1;
                    *tsm = Tsm::Running(worker_id);
                    spawn_worker::<Traits>(self, thread_cb, worker_id);
                    worker_id
                }
                Tsm::Uninit => unreachable!(),
            };
            Some(worker_id)
        } else {
            log::trace!("dispatching the idle processor");
            None
        };
        sched.current = new_current;

        assert_eq!(sched.cpu_lock, Some(std::thread::current().id()));
        sched.cpu_lock = None;
        drop(sched);
        self.cond.notify_all();
    }
}

/// Spawn the OS thread backing a kernel thread. The thread immediately
/// starts executing the entry point — the caller has already made it the
/// scheduled worker.
fn spawn_worker<Traits: PortInstance>(
    state: &'static State,
    thread_cb: &'static ThreadCb<Traits>,
    worker_id: WorkerId,
) {
    std::thread::Builder::new()
        .name(format!("kestrel worker {worker_id}"))
        .spawn(move || {
            ROLE.with(|r| r.set(ThreadRole::Thread));
            CURRENT_WORKER.with(|w| w.set(Some(worker_id)));

            log::debug!("thread {thread_cb:p} is now running on worker {worker_id}");

            let result = catch_unwind(AssertUnwindSafe(|| {
                (thread_cb.attr.entry_point)(thread_cb.attr.entry_param);

                // The entry point returned; terminate the kernel thread.
                // `exit_current` does not return except by destroying this
                // context.
                let _ = kestrel_kernel::thread::exit_current::<Traits>();
                unreachable!("exit_current returned");
            }));

            if let Err(payload) = result {
                if !payload.is::<ThreadExitToken>() {
                    state.record_panic(payload);
                }
            }
        })
        .unwrap();
}

/// Install the process-wide panic hook that silences the
/// [`ThreadExitToken`] panics the port uses to destroy worker contexts.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().is::<ThreadExitToken>() {
                return;
            }
            default_hook(info);
        }));
    });
}

/// Boot the kernel and run it until [`shutdown`] is called.
///
/// `init` runs in the boot context; it is expected to initialize kernel
/// objects and start the initial threads. Panics raised in any port-managed
/// thread (including assertion failures in a test's kernel threads) are
/// re-thrown from this function.
pub fn run<Traits: PortInstance>(init: impl FnOnce() + Send + 'static) {
    install_panic_hook();
    let _ = env_logger::builder().is_test(true).try_init();

    let state = Traits::port_state();

    // The boot thread carries the boot context and later parks as the idle
    // processor
    let boot_join_handle = std::thread::Builder::new()
        .name("kestrel boot".to_owned())
        .spawn(move || {
            ROLE.with(|r| r.set(ThreadRole::Boot));

            // Enter CPU Lock for `PortToKernel::boot`
            state.raw_acquire_cpu_lock();

            let result = catch_unwind(AssertUnwindSafe(|| -> ! {
                // Safety: CPU Lock active, boot context, called once
                unsafe { Traits::boot(init) }
            }));

            // `boot` never returns normally; the only way here is a panic
            match result {
                Err(payload) => {
                    if !payload.is::<ThreadExitToken>() {
                        state.record_panic(payload);
                    }
                }
                Ok(never) => match never {},
            }
        })
        .unwrap();

    // The timer thread approximates the periodic tick interrupt
    let timer_join_handle = std::thread::Builder::new()
        .name("kestrel timer".to_owned())
        .spawn(move || {
            ROLE.with(|r| r.set(ThreadRole::Interrupt));
            let period = Duration::from_secs(1) / Traits::TICKS_PER_SECOND;
            loop {
                std::thread::sleep(period);
                {
                    let sched = state.sched();
                    if sched.shutdown {
                        break;
                    }
                }
                let result = catch_unwind(AssertUnwindSafe(|| {
                    // Safety: CPU Lock inactive, an interrupt context
                    unsafe { Traits::timer_tick() };
                }));
                if let Err(payload) = result {
                    if !payload.is::<ThreadExitToken>() {
                        state.record_panic(payload);
                    }
                    break;
                }
            }
            log::trace!("timer thread stopped");
        })
        .unwrap();

    // Wait until the simulation shuts down
    let panic_payload = {
        let mut sched = state.sched();
        while !sched.shutdown {
            sched = state.wait_sched(sched);
        }
        sched.panic_payload.take()
    };
    state.cond.notify_all();

    let _ = boot_join_handle.join();
    let _ = timer_join_handle.join();

    // Propagate any panic that occurred in a worker thread
    if let Some(payload) = panic_payload {
        resume_unwind(payload);
    }
}

/// Initiate shutdown. [`run`] returns once the boot and timer threads wind
/// down; workers that are still blocked are discarded.
pub fn shutdown<Traits: PortInstance>() {
    log::trace!("shutdown");
    let state = Traits::port_state();
    let mut sched = state.sched();
    sched.shutdown = true;
    drop(sched);
    state.cond.notify_all();
}

/// Instantiate the static state binding the Kestrel kernel to this port.
///
/// Defines `$SystemTraits` and implements [`kestrel_kernel::KernelTraits`]
/// (plus the port traits) on it. Each instantiation is a fully independent
/// kernel, which is what lets every test in a file host its own.
#[macro_export]
macro_rules! use_sim_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        const _: () = {
            static PORT_STATE: $crate::State = $crate::State::new();
            static KERNEL_STATE: ::kestrel_kernel::KernelState<$SystemTraits> =
                ::kestrel_kernel::KernelState::new();

            unsafe impl $crate::PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static $crate::State {
                    &PORT_STATE
                }
            }

            unsafe impl ::kestrel_kernel::PortThreading for $SystemTraits {
                type PortThreadState = $crate::ThreadState;

                unsafe fn dispatch_first_thread() -> ! {
                    unsafe { PORT_STATE.dispatch_first_thread::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(
                    thread: &'static ::kestrel_kernel::ThreadCb<Self>,
                ) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(thread) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock::<Self>() }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                unsafe fn initialize_thread_state(
                    thread: &'static ::kestrel_kernel::ThreadCb<Self>,
                ) {
                    unsafe { PORT_STATE.initialize_thread_state::<Self>(thread) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }

                fn is_thread_context() -> bool {
                    PORT_STATE.is_thread_context::<Self>()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context::<Self>()
                }

                fn is_scheduler_active() -> bool {
                    PORT_STATE.is_scheduler_active::<Self>()
                }
            }

            impl ::kestrel_kernel::PortTimer for $SystemTraits {
                const TICKS_PER_SECOND: u32 = $crate::TICKS_PER_SECOND;
            }

            impl ::kestrel_kernel::KernelTraits for $SystemTraits {
                #[inline]
                fn state() -> &'static ::kestrel_kernel::KernelState<Self> {
                    &KERNEL_STATE
                }
            }
        };
    };
}
