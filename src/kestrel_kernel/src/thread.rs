//! Threads and the scheduler core.
//!
//! A thread is described by a [`ThreadCb`] constructed by the application
//! (typically in a `static`) and operated through a `&'static` reference.
//! Exactly one thread is Running at any instant; every other started thread
//! is Ready (in the ready queue) or Waiting (in at most one wait queue and
//! at most one timeout node, both owned by the blocking call's stack frame).
//!
//! [`choose_next_running_thread`] is the single dispatch chokepoint: it
//! returns the current thread to the ready queue (if it is still runnable)
//! and promotes the queue's head to Running. The port invokes it through
//! [`PortToKernel::choose_running_thread`] whenever the kernel requested a
//! yield.
//!
//! [`PortToKernel::choose_running_thread`]: crate::PortToKernel::choose_running_thread
use core::{convert::Infallible, fmt, ptr};

use crate::{
    error::{
        ActivateThreadError, ExitThreadError, GetCurrentThreadError, GetThreadPriorityError,
        InterruptThreadError, JoinThreadError, QueryThreadError, SetThreadPriorityError,
        SleepError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex, state, timeout,
    utils::{intrusive_list::StaticLink, Init},
    wait, KernelTraits, PortThreading, Priority, Ticks,
};

pub(crate) mod readyqueue;

/// A raw memory region serving as a thread's stack.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    base: *mut u8,
    len: usize,
}

// Safety: The region is only dereferenced by the port, from the owning
//         thread's execution context
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl StackRegion {
    /// A region with no storage of its own, directing the port to provide
    /// the stack by its own means. Hosted ports do this; bare-metal ports
    /// generally require a real region.
    pub const AUTO: Self = Self {
        base: core::ptr::null_mut(),
        len: 0,
    };

    pub const fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Get a raw pointer to the region's contents. This is mainly used by
    /// [`PortThreading::initialize_thread_state`] to calculate the initial
    /// stack pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut [u8] {
        ptr::slice_from_raw_parts_mut(self.base, self.len)
    }

    pub const fn is_auto(&self) -> bool {
        self.base.is_null()
    }
}

/// The static properties of a thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadAttr {
    /// The entry point of the thread. Called by the port in the thread's
    /// execution context when the thread is dispatched for the first time.
    pub entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The stack region for the thread.
    pub stack: StackRegion,

    /// The initial base priority of the thread.
    pub priority: Priority,
}

/// Thread state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSt {
    /// The thread has not been started.
    Inactive,

    /// The thread is in the ready queue, runnable but not running.
    Ready,

    /// The thread is currently executing. At most one thread is in this
    /// state.
    Running,

    /// The thread is blocked in a wait operation.
    Waiting,

    /// The thread finished execution and awaits reclamation by `join`.
    Terminated,

    /// The thread was reclaimed. The control block and stack can be reused
    /// by starting the thread again.
    Reclaimed,
}

impl Init for ThreadSt {
    const INIT: Self = Self::Inactive;
}

/// *Thread control block* - the state data of a thread.
#[repr(C)]
pub struct ThreadCb<Traits: PortThreading> {
    /// The port-specific part of the thread's state.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that context-switching code can refer to it easily.
    pub port_thread_state: Traits::PortThreadState,

    /// The static properties of the thread.
    pub attr: ThreadAttr,

    /// The thread's base priority, as assigned by [`ThreadCb::set_priority`].
    pub(super) base_priority: CpuLockCell<Traits, Priority>,

    /// The thread's effective priority. It's calculated based on
    /// `base_priority` and may be temporarily elevated by a mutex locking
    /// protocol (the ceiling of a held ceiling mutex, or the priority of a
    /// waiter blocked on a held inheritance mutex).
    ///
    /// The effective priority determines the thread's position within the
    /// ready queue and within every priority-ordered wait queue. After
    /// updating it, the thread must be repositioned in whichever of those
    /// lists currently contains it.
    pub(super) effective_priority: CpuLockCell<Traits, Priority>,

    pub(super) st: CpuLockCell<Traits, ThreadSt>,

    /// Links this thread into the ready queue while it is Ready.
    pub(super) link: CpuLockCell<Traits, Option<StaticLink<ThreadCb<Traits>>>>,

    /// The wait state of the thread.
    pub(super) wait: wait::ThreadWait<Traits>,

    /// The last mutex locked by this thread — the head of the singly-linked
    /// list of all mutexes it currently holds.
    pub(super) last_mutex_held: CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,

    /// Threads blocked in `join`, waiting for this thread to terminate.
    pub(super) join_wait_queue: wait::WaitQueue<Traits>,
}

impl<Traits: PortThreading> ThreadCb<Traits> {
    /// Construct a `ThreadCb`. The thread starts out Inactive; call
    /// [`ThreadCb::start`] to make it runnable.
    pub const fn new(attr: ThreadAttr) -> Self {
        let priority = attr.priority;
        Self {
            port_thread_state: Traits::PortThreadState::INIT,
            attr,
            base_priority: CpuLockCell::new(priority),
            effective_priority: CpuLockCell::new(priority),
            st: CpuLockCell::new(ThreadSt::Inactive),
            link: CpuLockCell::new(None),
            wait: wait::ThreadWait::INIT,
            last_mutex_held: CpuLockCell::new(None),
            join_wait_queue: wait::WaitQueue::new(wait::QueueOrder::ThreadPriority),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("wait", &self.wait)
            .field(
                "last_mutex_held",
                // Don't print the mutex's contents to avoid unbounded
                // recursion (MutexCb → ThreadCb → MutexCb → …)
                &self
                    .last_mutex_held
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field("join_wait_queue", &self.join_wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> ThreadCb<Traits> {
    /// Start the thread: transition it from Inactive (or Reclaimed) into
    /// Ready, making it eligible for dispatch. The thread will begin
    /// executing its entry point when the scheduler selects it.
    pub fn start(&'static self) -> Result<(), ActivateThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        match *self.st.read(&*lock) {
            ThreadSt::Inactive | ThreadSt::Reclaimed => {}
            _ => return Err(ActivateThreadError::BadObjectState),
        }

        // Safety: CPU Lock active, the thread owns no live execution context
        unsafe { Traits::initialize_thread_state(self) };

        // Reset the thread priority
        self.base_priority.replace(&mut *lock, self.attr.priority);
        self.effective_priority
            .replace(&mut *lock, self.attr.priority);

        // Safety: The previous state is Inactive/Reclaimed and the execution
        // context was just initialized, so this is safe
        unsafe { make_ready(lock.borrow_mut(), self) };

        // If `self` has a higher priority than the current thread, perform a
        // context switch.
        unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Interrupt the thread's ongoing wait operation, making its blocking
    /// call return `Interrupted`.
    pub fn interrupt(&'static self) -> Result<(), InterruptThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        wait::interrupt_thread(
            lock.borrow_mut(),
            self,
            Err(WaitTimeoutError::Interrupted),
        )?;

        // The thread is now awake, check dispatch
        unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Block the calling thread until this thread terminates, then reclaim
    /// it. The wait uses the same mechanism as every other blocking service
    /// and can be interrupted.
    pub fn join(&'static self) -> Result<(), JoinThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
        if ptr::eq(running_thread, self) {
            return Err(JoinThreadError::WouldDeadlock);
        }

        match *self.st.read(&*lock) {
            ThreadSt::Inactive | ThreadSt::Reclaimed => {
                return Err(JoinThreadError::BadObjectState)
            }
            ThreadSt::Terminated => {
                self.st.replace(&mut *lock, ThreadSt::Reclaimed);
                return Ok(());
            }
            _ => {}
        }

        self.join_wait_queue
            .wait(lock.borrow_mut(), wait::WaitPayload::Join(self))?;

        // `exit_current` woke us up, so the thread has terminated. The first
        // joiner to get here reclaims it.
        if *self.st.read(&*lock) == ThreadSt::Terminated {
            self.st.replace(&mut *lock, ThreadSt::Reclaimed);
        }

        Ok(())
    }

    /// Get the thread's base priority.
    pub fn priority(&self) -> Result<Priority, GetThreadPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;

        match self.st.get(&*lock) {
            ThreadSt::Inactive | ThreadSt::Reclaimed => {
                Err(GetThreadPriorityError::BadObjectState)
            }
            _ => Ok(self.base_priority.get(&*lock)),
        }
    }

    /// Get the thread's effective priority, which may be elevated above the
    /// base priority by a mutex locking protocol.
    pub fn effective_priority(&self) -> Result<Priority, GetThreadPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;

        match self.st.get(&*lock) {
            ThreadSt::Inactive | ThreadSt::Reclaimed => {
                Err(GetThreadPriorityError::BadObjectState)
            }
            _ => Ok(self.effective_priority.get(&*lock)),
        }
    }

    /// Change the thread's base priority.
    pub fn set_priority(&'static self, priority: Priority) -> Result<(), SetThreadPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;
        set_thread_base_priority(lock, self, priority)
    }

    /// Get the thread's current state.
    pub fn state(&self) -> Result<ThreadSt, QueryThreadError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.st.get(&*lock))
    }
}

/// Get the currently running thread.
pub fn current<Traits: KernelTraits>() -> Result<&'static ThreadCb<Traits>, GetCurrentThreadError>
{
    if !Traits::is_thread_context() {
        return Err(GetCurrentThreadError::BadContext);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().running_thread(lock.borrow_mut()).unwrap())
}

/// Terminate the calling thread.
///
/// Any held robust mutexes are abandoned (their next owners will observe
/// `Abandoned`); threads blocked in [`ThreadCb::join`] on this thread are
/// woken up.
pub fn exit_current<Traits: KernelTraits>() -> Result<Infallible, ExitThreadError> {
    if !Traits::is_thread_context() {
        return Err(ExitThreadError::BadContext);
    }

    // If CPU Lock is inactive, activate it.
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            // Safety: CPU Lock inactive
            Traits::enter_cpu_lock();
        }
        // Safety: CPU Lock active, and any outstanding guard belonged to an
        //         abandoned stack frame of this thread
        klock::assume_cpu_lock::<Traits>()
    };

    // An exiting thread can't release the scheduler lock later
    Traits::state().clear_scheduler_lock();

    let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    // Abandon held mutexes, waking up their next waiters (if any)
    mutex::abandon_held_mutexes(lock.borrow_mut(), running_thread);

    // Transition the current thread to Terminated and wake up the joiners
    assert_eq!(*running_thread.st.read(&*lock), ThreadSt::Running);
    running_thread.st.replace(&mut *lock, ThreadSt::Terminated);
    running_thread.join_wait_queue.wake_up_all(lock.borrow_mut());

    // Erase `running_thread`
    Traits::state().running_thread.replace(&mut *lock, None);

    core::mem::forget(lock);

    // Safety: (1) The user of `exit_current` acknowledges that all
    // preexisting data on the thread stack will be invalidated. (2) CPU Lock
    // active
    unsafe { Traits::exit_and_dispatch(running_thread) }
}

/// Block the calling thread for the specified duration.
pub fn sleep<Traits: KernelTraits>(duration: Ticks) -> Result<(), SleepError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    // Wait until woken up by the timeout
    match wait::wait_no_queue_timeout(lock.borrow_mut(), wait::WaitPayload::Sleep, duration) {
        Ok(_) => unreachable!("a sleep can only end by timeout or interruption"),
        Err(WaitTimeoutError::Timeout) => Ok(()),
        Err(WaitTimeoutError::Interrupted) => Err(SleepError::Interrupted),
    }
}

/// Block the calling thread until the tick count reaches `time`. Returns
/// immediately if it already has.
pub fn sleep_until<Traits: KernelTraits>(time: crate::Time) -> Result<(), SleepError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    let duration = time.saturating_sub(timeout::current_time::<Traits>(lock.borrow_mut()));
    if duration == 0 {
        return Ok(());
    }

    match wait::wait_no_queue_timeout(lock.borrow_mut(), wait::WaitPayload::Sleep, duration) {
        Ok(_) => unreachable!("a sleep can only end by timeout or interruption"),
        Err(WaitTimeoutError::Timeout) => Ok(()),
        Err(WaitTimeoutError::Interrupted) => Err(SleepError::Interrupted),
    }
}

/// Transition the thread into the Ready state and insert it into the ready
/// queue. This function doesn't do any proper cleanup for a previous state.
///
/// # Safety
///
/// The thread's execution context must be ready to resume (or start), and
/// the thread must not currently be in the ready queue.
pub(crate) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) {
    // Make the thread Ready
    thread_cb.st.replace(&mut *lock, ThreadSt::Ready);

    // Insert the thread into the ready queue.
    // Safety: `thread_cb` is not in the ready queue
    unsafe {
        Traits::state()
            .ready_queue
            .push_back_thread(lock, thread_cb);
    }
}

/// Relinquish CPU Lock. After that, if there's a higher-priority Ready
/// thread than the running thread, call [`PortThreading::yield_cpu`].
///
/// System services that transition a thread into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let state = Traits::state();

    // While the scheduler lock is held the decision is deferred until the
    // lock is released; before the first dispatch there's nothing to preempt.
    if state.is_scheduler_locked() || !Traits::is_scheduler_active() {
        return;
    }

    let prev_priority = match state.running_thread(lock.borrow_mut()) {
        Some(thread_cb) if *thread_cb.st.read(&*lock) == ThreadSt::Running => {
            Some(thread_cb.effective_priority.get(&*lock))
        }
        _ => None,
    };

    let has_preempting_thread = state
        .ready_queue
        .has_thread_exceeding_priority(lock.borrow_mut(), prev_priority);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_thread {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// The dispatch chokepoint: elect the next running thread.
///
/// If the current thread is still runnable, it goes back into the ready
/// queue — behind other threads of its priority — and the queue's head
/// becomes the new running thread. The new head is marked Running
/// immediately, even though the actual context switch may be deferred, so
/// that a re-entrant call observes a consistent state.
///
/// A no-op while the scheduler lock is held; the state is re-examined when
/// the lock is released.
pub(crate) fn choose_next_running_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let state = Traits::state();

    if state.is_scheduler_locked() {
        return;
    }

    let prev_running_thread = state.running_thread(lock.borrow_mut());
    if let Some(prev) = prev_running_thread {
        if *prev.st.read(&*lock) == ThreadSt::Running {
            // Still runnable - back into the ready queue it goes.
            // Safety: A Running thread is never in the ready queue
            unsafe { make_ready(lock.borrow_mut(), prev) };
        }
    }

    let next_running_thread = state.ready_queue.pop_front_thread(lock.borrow_mut());
    if let Some(next) = next_running_thread {
        // The label must be correct even if the context switch is deferred
        next.st.replace(&mut *lock, ThreadSt::Running);
    }

    state
        .running_thread
        .replace(&mut *lock, next_running_thread);
}

/// Transition the currently running thread into the Waiting state. Returns
/// when woken up.
///
/// The current context must be waitable (this function doesn't check that).
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert_eq!(state::expect_waitable_context::<Traits>(), Ok(()));

    // Transition the current thread to Waiting
    let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
    assert_eq!(*running_thread.st.read(&*lock), ThreadSt::Running);
    running_thread.st.replace(&mut *lock, ThreadSt::Waiting);

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`.
        // Safety: (1) No protected state is accessed while unlocked.
        //         (2) CPU Lock is currently active.
        //         (3) CPU Lock is re-acquired before this function returns.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Safety: CPU Lock inactive
        unsafe { Traits::enter_cpu_lock() };

        if *running_thread.st.read(&*lock) == ThreadSt::Running {
            break;
        }

        assert_eq!(*running_thread.st.read(&*lock), ThreadSt::Waiting);
    }
}

/// Recalculate and assign the thread's effective priority after a change in
/// the inputs of the calculation (a mutex was acquired, released, or its
/// waiter set changed), repositioning the thread in whichever priority-
/// ordered list currently contains it.
pub(crate) fn update_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) {
    let base_priority = thread_cb.base_priority.get(&*lock);
    let effective_priority =
        mutex::evaluate_thread_effective_priority(lock.borrow_mut(), thread_cb, base_priority);
    let old_effective_priority = thread_cb
        .effective_priority
        .replace(&mut *lock, effective_priority);

    if old_effective_priority == effective_priority {
        return;
    }

    match *thread_cb.st.read(&*lock) {
        ThreadSt::Ready => unsafe {
            // Safety: A Ready thread is in the ready queue
            Traits::state()
                .ready_queue
                .reorder_thread(lock.borrow_mut(), thread_cb);
        },
        ThreadSt::Waiting => {
            wait::reorder_wait_of_thread(lock.borrow_mut(), thread_cb);
        }
        _ => {}
    }
}

/// Implements [`ThreadCb::set_priority`].
fn set_thread_base_priority<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    thread_cb: &'static ThreadCb<Traits>,
    base_priority: Priority,
) -> Result<(), SetThreadPriorityError> {
    let st = *thread_cb.st.read(&*lock);

    if matches!(
        st,
        ThreadSt::Inactive | ThreadSt::Reclaimed | ThreadSt::Terminated
    ) {
        return Err(SetThreadPriorityError::BadObjectState);
    }

    let old_base_priority = thread_cb.base_priority.get(&*lock);

    if old_base_priority == base_priority {
        return Ok(());
    }

    // Fail with `BadParam` if the operation would violate the precondition
    // of the locking protocol used in any of the held or awaited mutexes.
    // This check is only needed when raising the priority.
    if base_priority > old_base_priority {
        // Get the currently awaited mutex (if any).
        let waited_mutex =
            wait::with_current_wait_payload(lock.borrow_mut(), thread_cb, |payload| {
                if let Some(&wait::WaitPayload::Mutex(mutex_cb)) = payload {
                    Some(mutex_cb)
                } else {
                    None
                }
            });

        if let Some(waited_mutex) = waited_mutex {
            if !mutex::does_mutex_allow_thread_base_priority(
                lock.borrow_mut(),
                waited_mutex,
                base_priority,
            ) {
                return Err(SetThreadPriorityError::BadParam);
            }
        }

        // Check the precondition for all currently-held mutexes
        if !mutex::do_held_mutexes_allow_thread_base_priority(
            lock.borrow_mut(),
            thread_cb,
            base_priority,
        ) {
            return Err(SetThreadPriorityError::BadParam);
        }
    }

    // Recalculate `effective_priority` according to the locking protocols of
    // the held mutexes
    let effective_priority =
        mutex::evaluate_thread_effective_priority(lock.borrow_mut(), thread_cb, base_priority);

    // Assign the new priorities
    thread_cb.base_priority.replace(&mut *lock, base_priority);
    let old_effective_priority = thread_cb
        .effective_priority
        .replace(&mut *lock, effective_priority);

    if old_effective_priority != effective_priority {
        match st {
            ThreadSt::Ready => unsafe {
                // Safety: A Ready thread is in the ready queue, inserted with
                // its previous effective priority
                Traits::state()
                    .ready_queue
                    .reorder_thread(lock.borrow_mut(), thread_cb);
            },
            ThreadSt::Running => {}
            ThreadSt::Waiting => {
                // Reposition the thread in the wait queue it's in
                wait::reorder_wait_of_thread(lock.borrow_mut(), thread_cb);

                // If the thread is blocked on a priority-inheritance mutex,
                // the owner's inherited priority follows the change
                let waited_mutex =
                    wait::with_current_wait_payload(lock.borrow_mut(), thread_cb, |payload| {
                        if let Some(&wait::WaitPayload::Mutex(mutex_cb)) = payload {
                            Some(mutex_cb)
                        } else {
                            None
                        }
                    });
                if let Some(waited_mutex) = waited_mutex {
                    mutex::update_inherited_priority(lock.borrow_mut(), waited_mutex);
                }
            }
            ThreadSt::Inactive | ThreadSt::Reclaimed | ThreadSt::Terminated => unreachable!(),
        }
    }

    if let ThreadSt::Running | ThreadSt::Ready = st {
        // - If `st == Running` and the priority was lowered, the thread could
        //   be preempted by a Ready thread.
        // - If `st == Ready` and the priority was raised, it could preempt
        //   the running thread.
        unlock_cpu_and_check_preemption(lock);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{ActivateThreadError, GetCurrentThreadError},
        test_utils::{define_test_kernel, make_running, thread_attr},
    };

    #[test]
    fn start_makes_a_thread_ready() {
        define_test_kernel!(struct Tr);
        static THREAD: ThreadCb<Tr> = ThreadCb::new(thread_attr(7));

        assert_eq!(THREAD.state().unwrap(), ThreadSt::Inactive);
        THREAD.start().unwrap();
        assert_eq!(THREAD.state().unwrap(), ThreadSt::Ready);

        // A started thread can't be started again
        assert_eq!(THREAD.start(), Err(ActivateThreadError::BadObjectState));

        // It ended up in the ready queue
        let mut lock = klock::lock_cpu::<Tr>().unwrap();
        let popped = Tr::state().ready_queue.pop_front_thread(lock.borrow_mut());
        assert!(core::ptr::eq(popped.unwrap(), &THREAD));
    }

    #[test]
    fn priority_queries_track_set_priority() {
        define_test_kernel!(struct Tr);
        static THREAD: ThreadCb<Tr> = ThreadCb::new(thread_attr(7));

        // Queries are rejected before the thread is started
        assert_eq!(
            THREAD.priority(),
            Err(GetThreadPriorityError::BadObjectState)
        );

        THREAD.start().unwrap();
        assert_eq!(THREAD.priority().unwrap(), 7);
        assert_eq!(THREAD.effective_priority().unwrap(), 7);

        THREAD.set_priority(9).unwrap();
        assert_eq!(THREAD.priority().unwrap(), 9);
        assert_eq!(THREAD.effective_priority().unwrap(), 9);
    }

    #[test]
    fn set_priority_reorders_ready_threads() {
        define_test_kernel!(struct Tr);
        static T_A: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static T_B: ThreadCb<Tr> = ThreadCb::new(thread_attr(7));

        T_A.start().unwrap();
        T_B.start().unwrap();

        T_A.set_priority(9).unwrap();

        let mut lock = klock::lock_cpu::<Tr>().unwrap();
        let first = Tr::state().ready_queue.pop_front_thread(lock.borrow_mut());
        assert!(core::ptr::eq(first.unwrap(), &T_A));
        let second = Tr::state().ready_queue.pop_front_thread(lock.borrow_mut());
        assert!(core::ptr::eq(second.unwrap(), &T_B));
    }

    #[test]
    fn current_returns_the_running_thread() {
        define_test_kernel!(struct Tr);
        static THREAD: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));

        make_running(&THREAD);
        let current = current::<Tr>().unwrap();
        assert!(core::ptr::eq(current, &THREAD));
    }

    #[test]
    fn join_rejects_self_and_unstarted_targets() {
        define_test_kernel!(struct Tr);
        static MAIN: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static OTHER: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));

        make_running(&MAIN);

        assert_eq!(MAIN.join(), Err(JoinThreadError::WouldDeadlock));
        assert_eq!(OTHER.join(), Err(JoinThreadError::BadObjectState));
    }

    #[test]
    fn join_reclaims_a_terminated_thread() {
        define_test_kernel!(struct Tr);
        static MAIN: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static OTHER: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));

        make_running(&MAIN);

        // Fabricate a thread that has run to completion
        {
            let mut lock = klock::lock_cpu::<Tr>().unwrap();
            OTHER.st.replace(&mut *lock, ThreadSt::Terminated);
        }

        OTHER.join().unwrap();
        assert_eq!(OTHER.state().unwrap(), ThreadSt::Reclaimed);

        // A reclaimed thread can't be joined again, but can be restarted
        assert_eq!(OTHER.join(), Err(JoinThreadError::BadObjectState));
        OTHER.start().unwrap();
        assert_eq!(OTHER.state().unwrap(), ThreadSt::Ready);
    }

    #[test]
    fn interrupt_requires_a_waiting_thread() {
        define_test_kernel!(struct Tr);
        static THREAD: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));

        assert_eq!(
            THREAD.interrupt(),
            Err(InterruptThreadError::BadObjectState)
        );

        THREAD.start().unwrap();
        assert_eq!(
            THREAD.interrupt(),
            Err(InterruptThreadError::BadObjectState)
        );
    }

    #[test]
    fn current_is_rejected_outside_a_thread_context() {
        define_test_kernel!(struct Tr);

        // The unit-test port always reports a thread context, so only the
        // CPU Lock rejection is observable here
        let _lock = klock::lock_cpu::<Tr>().unwrap();
        assert_eq!(current::<Tr>(), Err(GetCurrentThreadError::BadContext));
    }
}
