//! Mutexes.
//!
//! The mutex is the most intricate state machine in the kernel: on top of
//! the plain owned/unowned protocol it layers recursion counting, three
//! locking protocols (none, priority inheritance, priority ceiling), and
//! robustness against owner death.
//!
//! Ownership is handed over directly: `unlock` grants the mutex to the
//! highest-priority waiter *before* waking it, so a woken waiter never races
//! other threads for the mutex.
//!
//! Every mutex a thread holds is a node of a singly-linked list headed by
//! [`ThreadCb::last_mutex_held`]; mutexes must be released in reverse
//! acquisition order, which keeps the re-evaluation of the owner's effective
//! priority linear in the number of held mutexes.
use core::{fmt, ptr};

use crate::{
    error::{
        LockMutexError, LockMutexPrecheckError, LockMutexTimeoutError, MarkConsistentMutexError,
        QueryMutexError, TryLockMutexError, UnlockMutexError, WaitError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, thread,
    thread::{ThreadCb, ThreadSt},
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, PortThreading, Priority, Ticks,
};

/// What happens when the owning thread locks a mutex it already owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    /// Re-entry fails with `WouldDeadlock`.
    Normal,
    /// Re-entry increments a recursion count; the mutex is released when the
    /// count returns to zero.
    Recursive,
    /// Re-entry fails with `WouldDeadlock`, and unlock by a non-owner is
    /// diagnosed. (Unlock by a non-owner is always diagnosed here; the kind
    /// exists so intent is recorded at creation.)
    ErrorCheck,
}

/// The priority protocol of a mutex, bounding priority inversion while the
/// mutex is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    /// Locking does not affect the owner's priority.
    None,
    /// The owner's effective priority is raised to that of the
    /// highest-priority blocked waiter for as long as the contention lasts.
    Inherit,
    /// The owner's effective priority is raised to the given ceiling while
    /// the mutex is held. Locking from a thread whose base priority exceeds
    /// the ceiling is a `BadParam` error.
    Ceiling(Priority),
}

/// What happens when a thread exits while holding the mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexRobustness {
    /// The mutex remains locked by the dead thread forever.
    Stalled,
    /// The mutex is handed to the next waiter with an `Abandoned`
    /// indication and must be restored with
    /// [`MutexCb::mark_consistent`] before normal operation resumes.
    Robust,
}

/// The static properties of a mutex.
#[derive(Debug, Clone, Copy)]
pub struct MutexAttr {
    pub kind: MutexKind,
    pub protocol: MutexProtocol,
    pub robustness: MutexRobustness,
    /// The maximum lock count of a `Recursive` mutex. Exceeding it fails
    /// with `RecursionOverflow`.
    pub max_recursion: u32,
    /// The processing order of the wait queue. Priority inheritance assumes
    /// `ThreadPriority` (with `Fifo`, the queue's head waiter is the one
    /// whose priority is inherited).
    pub queue_order: QueueOrder,
}

impl MutexAttr {
    pub const DEFAULT: Self = Self {
        kind: MutexKind::Normal,
        protocol: MutexProtocol::None,
        robustness: MutexRobustness::Stalled,
        max_recursion: u32::MAX,
        queue_order: QueueOrder::ThreadPriority,
    };
}

impl Default for MutexAttr {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// *Mutex control block* - the state data of a mutex.
pub struct MutexCb<Traits: PortThreading> {
    pub(super) attr: MutexAttr,

    /// The thread that currently owns the mutex lock.
    pub(super) owning_thread: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    /// The lock count. Nonzero iff `owning_thread` is `Some(_)`; greater
    /// than one only for a `Recursive` mutex.
    pub(super) count: CpuLockCell<Traits, u32>,

    /// The previous owner exited while holding the lock, and
    /// `mark_consistent` hasn't been called yet.
    pub(super) inconsistent: CpuLockCell<Traits, bool>,

    /// An inconsistent mutex was released without `mark_consistent`; the
    /// mutex is permanently unusable.
    pub(super) unrecoverable: CpuLockCell<Traits, bool>,

    pub(super) wait_queue: WaitQueue<Traits>,

    /// The next element in the singly-linked list headed by
    /// [`ThreadCb::last_mutex_held`], containing all mutexes currently held
    /// by the owning thread.
    pub(super) prev_mutex_held: CpuLockCell<Traits, Option<&'static Self>>,
}

impl<Traits: PortThreading> MutexCb<Traits> {
    pub const fn new(attr: MutexAttr) -> Self {
        Self {
            attr,
            owning_thread: CpuLockCell::new(None),
            count: CpuLockCell::new(0),
            inconsistent: CpuLockCell::new(false),
            unrecoverable: CpuLockCell::new(false),
            wait_queue: WaitQueue::new(attr.queue_order),
            prev_mutex_held: CpuLockCell::new(None),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .field(
                "owning_thread",
                // break infinite recursion (ThreadCb → MutexCb → ThreadCb → …)
                &self
                    .owning_thread
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field("count", &self.count)
            .field("inconsistent", &self.inconsistent)
            .field("unrecoverable", &self.unrecoverable)
            .field("wait_queue", &self.wait_queue)
            .field(
                "prev_mutex_held",
                // prevent O((# of held mutexes)²)-order debug printing
                &self
                    .prev_mutex_held
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .finish()
    }
}

impl<Traits: KernelTraits> MutexCb<Traits> {
    /// Acquire the mutex, blocking until it becomes available.
    pub fn lock(&'static self) -> Result<(), LockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        lock_mutex(self, lock)
    }

    /// Acquire the mutex if it is not currently owned; fail with `Timeout`
    /// otherwise.
    pub fn try_lock(&'static self) -> Result<(), TryLockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;
        try_lock_mutex(self, lock)
    }

    /// Acquire the mutex, blocking for at most `duration` ticks.
    pub fn lock_timeout(&'static self, duration: Ticks) -> Result<(), LockMutexTimeoutError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        lock_mutex_timeout(self, lock, duration)
    }

    /// Release the mutex.
    pub fn unlock(&'static self) -> Result<(), UnlockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        unlock_mutex(self, lock)
    }

    /// Restore an inconsistent (abandoned) mutex to normal operation. Only
    /// the thread currently holding the lock can do this.
    pub fn mark_consistent(&'static self) -> Result<(), MarkConsistentMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;

        let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

        if ptr_from_option_ref(self.owning_thread.get(&*lock)) != running_thread as *const _ {
            return Err(MarkConsistentMutexError::NotOwner);
        }

        if self.inconsistent.replace(&mut *lock, false) {
            Ok(())
        } else {
            Err(MarkConsistentMutexError::BadObjectState)
        }
    }

    /// Get a flag indicating whether the mutex is currently owned.
    pub fn is_locked(&self) -> Result<bool, QueryMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.owning_thread.get(&*lock).is_some())
    }

    /// Get the current owner.
    pub fn owning_thread(&self) -> Result<Option<&'static ThreadCb<Traits>>, QueryMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.owning_thread.get(&*lock))
    }
}

/// Check the error conditions covered by [`LockMutexPrecheckError`] and
/// handle re-entry by the current owner.
///
///  - `BadObjectState`: The mutex is unrecoverable.
///
///  - `WouldDeadlock`: The current thread already owns the mutex and its
///    kind is not `Recursive`.
///
///  - `RecursionOverflow`: The configured maximum lock count is reached.
///
///  - `BadParam`: The mutex uses the ceiling protocol and the current
///    thread's base priority is above the ceiling.
///
/// Returns `Ok(None)` if the lock operation was completed as a recursive
/// re-entry, or `Ok(Some(running_thread))` if the caller should proceed with
/// the acquisition.
#[inline]
fn precheck_and_try_relock<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> Result<Option<&'static ThreadCb<Traits>>, LockMutexPrecheckError> {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    if mutex_cb.unrecoverable.get(&*lock) {
        return Err(LockMutexPrecheckError::BadObjectState);
    }

    if ptr_from_option_ref(mutex_cb.owning_thread.get(&*lock)) == thread as *const _ {
        return match mutex_cb.attr.kind {
            MutexKind::Recursive => {
                let count = mutex_cb.count.get(&*lock);
                if count >= mutex_cb.attr.max_recursion {
                    Err(LockMutexPrecheckError::RecursionOverflow)
                } else {
                    mutex_cb.count.replace(&mut *lock, count + 1);
                    Ok(None)
                }
            }
            MutexKind::Normal | MutexKind::ErrorCheck => {
                Err(LockMutexPrecheckError::WouldDeadlock)
            }
        };
    }

    if let MutexProtocol::Ceiling(ceiling) = mutex_cb.attr.protocol {
        if thread.base_priority.get(&*lock) > ceiling {
            return Err(LockMutexPrecheckError::BadParam);
        }
    }

    Ok(Some(thread))
}

/// Check if the specified mutex, which is currently held or awaited by a
/// thread, is compatible with the new thread base priority according to the
/// mutex's locking protocol.
///
/// The check is only needed when raising the priority.
#[inline]
pub(super) fn does_mutex_allow_thread_base_priority<Traits: KernelTraits>(
    _lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    new_base_priority: Priority,
) -> bool {
    if let MutexProtocol::Ceiling(ceiling) = mutex_cb.attr.protocol {
        if new_base_priority > ceiling {
            return false;
        }
    }

    true
}

/// Check if the thread's held mutexes are all compatible with the new thread
/// base priority according to the mutexes' locking protocols.
///
/// The check is only needed when raising the priority.
#[inline]
pub(super) fn do_held_mutexes_allow_thread_base_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    new_base_priority: Priority,
) -> bool {
    let mut maybe_mutex_cb = thread.last_mutex_held.get(&*lock);
    while let Some(mutex_cb) = maybe_mutex_cb {
        if !does_mutex_allow_thread_base_priority(lock.borrow_mut(), mutex_cb, new_base_priority)
        {
            return false;
        }

        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }
    true
}

/// Reevaluate the thread's effective priority and return the result.
/// (This function doesn't update [`ThreadCb::effective_priority`].)
/// The base priority is assumed to be `base_priority`.
pub(super) fn evaluate_thread_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    base_priority: Priority,
) -> Priority {
    let mut effective_priority = base_priority;
    let mut maybe_mutex_cb = thread.last_mutex_held.get(&*lock);

    while let Some(mutex_cb) = maybe_mutex_cb {
        match mutex_cb.attr.protocol {
            MutexProtocol::Ceiling(ceiling) => {
                effective_priority = effective_priority.max(ceiling);
            }
            MutexProtocol::Inherit => {
                // The queue is priority-ordered, so the head waiter is the
                // highest-priority one
                if let Some(waiter) = mutex_cb.wait_queue.first_waiting_thread(lock.borrow_mut())
                {
                    effective_priority =
                        effective_priority.max(waiter.effective_priority.get(&*lock));
                }
            }
            MutexProtocol::None => {}
        }

        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }

    effective_priority
}

/// Re-evaluate the effective priority of the mutex's owner after a change in
/// the mutex's waiter set. A no-op unless the mutex uses the priority
/// inheritance protocol.
pub(crate) fn update_inherited_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    if mutex_cb.attr.protocol != MutexProtocol::Inherit {
        return;
    }

    if let Some(owner) = mutex_cb.owning_thread.get(&*lock) {
        if matches!(
            *owner.st.read(&*lock),
            ThreadSt::Terminated | ThreadSt::Reclaimed
        ) {
            // A stalled mutex can be owned by a dead thread, whose priority
            // no longer matters
            return;
        }
        thread::update_effective_priority(lock.borrow_mut(), owner);
    }
}

/// Raise the owner's effective priority to at least that of a newly arriving
/// waiter (the priority inheritance protocol). Must be called *before* the
/// waiter is linked into the wait queue, hence the explicit floor instead of
/// a re-evaluation.
fn boost_owner_for_inherit<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    if mutex_cb.attr.protocol != MutexProtocol::Inherit {
        return;
    }

    let waiter_priority = {
        let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
        thread.effective_priority.get(&*lock)
    };

    if let Some(owner) = mutex_cb.owning_thread.get(&*lock) {
        if matches!(
            *owner.st.read(&*lock),
            ThreadSt::Terminated | ThreadSt::Reclaimed
        ) {
            return;
        }

        if owner.effective_priority.get(&*lock) < waiter_priority {
            owner
                .effective_priority
                .replace(&mut *lock, waiter_priority);

            match *owner.st.read(&*lock) {
                ThreadSt::Ready => unsafe {
                    // Safety: A Ready thread is in the ready queue
                    Traits::state()
                        .ready_queue
                        .reorder_thread(lock.borrow_mut(), owner);
                },
                ThreadSt::Waiting => {
                    crate::wait::reorder_wait_of_thread(lock.borrow_mut(), owner);
                }
                _ => {}
            }
        }
    }
}

/// Check if the current state of a mutex satisfies the wait condition.
///
/// If it does, this function grants the ownership to `running_thread` and
/// returns `true`. Otherwise, it returns `false`, indicating the calling
/// thread should be blocked.
#[inline]
fn poll_core<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    running_thread: &'static ThreadCb<Traits>,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    if mutex_cb.owning_thread.get(&*lock).is_some() {
        false
    } else {
        lock_core(mutex_cb, running_thread, lock);
        true
    }
}

/// Give the ownership of the mutex to `thread`.
///
/// The thread must be in the Running or Waiting state.
#[inline]
fn lock_core<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    thread: &'static ThreadCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert!(matches!(
        *thread.st.read(&*lock),
        ThreadSt::Running | ThreadSt::Waiting
    ));

    mutex_cb.owning_thread.replace(&mut *lock, Some(thread));
    mutex_cb.count.replace(&mut *lock, 1);

    // Push `mutex_cb` onto the list of the mutexes held by the thread
    let prev_mutex_held = thread.last_mutex_held.replace(&mut *lock, Some(mutex_cb));
    mutex_cb.prev_mutex_held.replace(&mut *lock, prev_mutex_held);

    if let MutexProtocol::Ceiling(ceiling) = mutex_cb.attr.protocol {
        let effective_priority = thread.effective_priority.write(&mut *lock);
        *effective_priority = (*effective_priority).max(ceiling);
    }
}

/// Evaluate the post-acquisition robustness state.
#[inline]
fn post_acquisition_result<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    lock: &CpuLockGuard<Traits>,
) -> Result<(), LockMutexError> {
    if mutex_cb.unrecoverable.get(&**lock) {
        // Woken by the mutex becoming unrecoverable; no ownership was granted
        Err(LockMutexError::BadObjectState)
    } else if mutex_cb.inconsistent.get(&**lock) {
        Err(LockMutexError::Abandoned)
    } else {
        Ok(())
    }
}

#[inline]
fn lock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), LockMutexError> {
    let running_thread = match precheck_and_try_relock(lock.borrow_mut(), mutex_cb)? {
        // Recursive re-entry, already completed
        None => return Ok(()),
        Some(thread) => thread,
    };

    if !poll_core(mutex_cb, running_thread, lock.borrow_mut()) {
        // The current state does not satisfy the wait condition. Start
        // waiting; the wake-upper hands over the ownership directly.
        boost_owner_for_inherit(lock.borrow_mut(), mutex_cb);
        mutex_cb
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Mutex(mutex_cb))?;
    }

    post_acquisition_result(mutex_cb, &lock)
}

#[inline]
fn try_lock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), TryLockMutexError> {
    let running_thread = match precheck_and_try_relock(lock.borrow_mut(), mutex_cb)? {
        None => return Ok(()),
        Some(thread) => thread,
    };

    if !poll_core(mutex_cb, running_thread, lock.borrow_mut()) {
        return Err(TryLockMutexError::Timeout);
    }

    match post_acquisition_result(mutex_cb, &lock) {
        Ok(()) => Ok(()),
        Err(LockMutexError::BadObjectState) => Err(TryLockMutexError::BadObjectState),
        Err(LockMutexError::Abandoned) => Err(TryLockMutexError::Abandoned),
        Err(_) => unreachable!(),
    }
}

#[inline]
fn lock_mutex_timeout<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
    duration: Ticks,
) -> Result<(), LockMutexTimeoutError> {
    let running_thread = match precheck_and_try_relock(lock.borrow_mut(), mutex_cb)? {
        None => return Ok(()),
        Some(thread) => thread,
    };

    if !poll_core(mutex_cb, running_thread, lock.borrow_mut()) {
        boost_owner_for_inherit(lock.borrow_mut(), mutex_cb);
        mutex_cb.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::Mutex(mutex_cb),
            duration,
        )?;
    }

    match post_acquisition_result(mutex_cb, &lock) {
        Ok(()) => Ok(()),
        Err(LockMutexError::BadObjectState) => Err(LockMutexTimeoutError::BadObjectState),
        Err(LockMutexError::Abandoned) => Err(LockMutexTimeoutError::Abandoned),
        Err(_) => unreachable!(),
    }
}

#[inline]
fn unlock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), UnlockMutexError> {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    if ptr_from_option_ref(mutex_cb.owning_thread.get(&*lock)) != thread as *const _ {
        // The current thread does not currently own the mutex.
        return Err(UnlockMutexError::NotOwner);
    }

    let count = mutex_cb.count.get(&*lock);
    if count > 1 {
        // A recursive lock is released one level at a time
        mutex_cb.count.replace(&mut *lock, count - 1);
        return Ok(());
    }

    if ptr_from_option_ref(thread.last_mutex_held.get(&*lock)) != mutex_cb as *const _ {
        // The correct mutex unlocking order is violated.
        return Err(UnlockMutexError::BadObjectState);
    }

    // Remove `mutex_cb` from the list of the mutexes held by the thread
    let prev_mutex_held = mutex_cb.prev_mutex_held.get(&*lock);
    thread.last_mutex_held.replace(&mut *lock, prev_mutex_held);
    mutex_cb.prev_mutex_held.replace(&mut *lock, None);

    if mutex_cb.inconsistent.get(&*lock) {
        // Releasing an inconsistent mutex without restoring it first makes
        // the mutex permanently unusable. The waiters are woken up
        // empty-handed and will observe the state in their post-acquisition
        // check.
        mutex_cb.inconsistent.replace(&mut *lock, false);
        mutex_cb.unrecoverable.replace(&mut *lock, true);
        mutex_cb.owning_thread.replace(&mut *lock, None);
        mutex_cb.count.replace(&mut *lock, 0);
        mutex_cb.wait_queue.wake_up_all(lock.borrow_mut());
    } else {
        // Wake up the next waiter, handing the ownership over
        unlock_mutex_unchecked(mutex_cb, lock.borrow_mut());
    }

    // Lower this thread's effective priority now that the mutex no longer
    // contributes to it. This may cause preemption.
    thread::update_effective_priority(lock.borrow_mut(), thread);

    thread::unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Abandon all mutexes held by the exiting thread.
///
/// `Robust` mutexes are marked inconsistent and handed to their next
/// waiters; `Stalled` mutexes stay locked by the dead thread forever.
///
/// This function doesn't restore the thread's effective priority — the
/// thread is about to stop running for good.
///
/// This function may make threads Ready, but doesn't yield the processor.
pub(super) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let mut maybe_mutex_cb = thread.last_mutex_held.replace(&mut *lock, None);
    while let Some(mutex_cb) = maybe_mutex_cb {
        maybe_mutex_cb = mutex_cb.prev_mutex_held.replace(&mut *lock, None);

        match mutex_cb.attr.robustness {
            MutexRobustness::Robust => {
                mutex_cb.inconsistent.replace(&mut *lock, true);
                unlock_mutex_unchecked(mutex_cb, lock.borrow_mut());
            }
            MutexRobustness::Stalled => {
                // Left locked; the owner reference now refers to a dead
                // thread and the waiters stay blocked
            }
        }
    }
}

/// Wake up the next waiter of the mutex, handing the ownership over, or
/// clear the ownership if nobody is waiting.
///
/// This function doesn't restore the previous owner's effective priority.
///
/// This function may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
fn unlock_mutex_unchecked<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    // Check if there are any other threads waiting on the mutex
    if let Some(next_thread) = mutex_cb.wait_queue.first_waiting_thread(lock.borrow_mut()) {
        // Give the ownership of the mutex to `next_thread` before waking it,
        // so it never has to re-race for the resource
        lock_core(mutex_cb, next_thread, lock.borrow_mut());

        // Wake up the next waiter
        assert!(mutex_cb.wait_queue.wake_up_one(lock.borrow_mut()));

        // Under priority inheritance the new owner inherits from the
        // remaining waiters
        update_inherited_priority(lock.borrow_mut(), mutex_cb);
    } else {
        // There's no one waiting
        mutex_cb.owning_thread.replace(&mut *lock, None);
        mutex_cb.count.replace(&mut *lock, 0);
    }
}

/// Re-acquire the mutex after a condition variable wait, blocking as needed.
/// Returns `true` if any of the wait operations involved was interrupted.
///
/// Unlike [`lock_mutex`], interruption does not abort the operation — a
/// condition-variable wait must hold the mutex when it returns — so the
/// acquisition is retried until it succeeds or the mutex becomes
/// unrecoverable.
pub(crate) fn relock_after_cond_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> bool {
    let mut interrupted = false;

    loop {
        if mutex_cb.unrecoverable.get(&*lock) {
            break;
        }

        let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
        if poll_core(mutex_cb, running_thread, lock.borrow_mut()) {
            break;
        }

        boost_owner_for_inherit(lock.borrow_mut(), mutex_cb);
        match mutex_cb
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Mutex(mutex_cb))
        {
            // Ownership was handed over
            Ok(_) => break,
            Err(WaitError::Interrupted) => {
                // Remember the interruption but keep going; the caller
                // reports it once the mutex is held again
                interrupted = true;
            }
        }
    }

    interrupted
}

/// Release the mutex on behalf of a condition-variable wait. The caller has
/// verified ownership and a lock count of one.
pub(crate) fn unlock_for_cond_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    debug_assert_eq!(
        ptr_from_option_ref(mutex_cb.owning_thread.get(&*lock)),
        thread as *const _
    );
    debug_assert_eq!(mutex_cb.count.get(&*lock), 1);

    // Remove `mutex_cb` from the list of the mutexes held by the thread
    let prev_mutex_held = mutex_cb.prev_mutex_held.get(&*lock);
    thread.last_mutex_held.replace(&mut *lock, prev_mutex_held);
    mutex_cb.prev_mutex_held.replace(&mut *lock, None);

    unlock_mutex_unchecked(mutex_cb, lock.borrow_mut());

    thread::update_effective_priority(lock.borrow_mut(), thread);
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        ptr::null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{define_test_kernel, make_running, thread_attr};

    #[test]
    fn uncontended_lock_and_unlock() {
        define_test_kernel!(struct Tr);
        static THREAD: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static M: MutexCb<Tr> = MutexCb::new(MutexAttr::DEFAULT);

        make_running(&THREAD);

        assert!(!M.is_locked().unwrap());
        M.lock().unwrap();
        assert!(M.is_locked().unwrap());
        assert!(core::ptr::eq(M.owning_thread().unwrap().unwrap(), &THREAD));

        M.unlock().unwrap();
        assert!(!M.is_locked().unwrap());
        assert_eq!(M.owning_thread().unwrap().map(|t| t as *const _), None);
    }

    #[test]
    fn ceiling_elevates_the_owner_while_held() {
        define_test_kernel!(struct Tr);
        static THREAD: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static M: MutexCb<Tr> = MutexCb::new(MutexAttr {
            protocol: MutexProtocol::Ceiling(20),
            ..MutexAttr::DEFAULT
        });

        make_running(&THREAD);

        M.lock().unwrap();
        assert_eq!(THREAD.effective_priority().unwrap(), 20);
        assert_eq!(THREAD.priority().unwrap(), 5);

        M.unlock().unwrap();
        assert_eq!(THREAD.effective_priority().unwrap(), 5);
    }

    #[test]
    fn nested_ceilings_restore_in_reverse_order() {
        define_test_kernel!(struct Tr);
        static THREAD: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static M20: MutexCb<Tr> = MutexCb::new(MutexAttr {
            protocol: MutexProtocol::Ceiling(20),
            ..MutexAttr::DEFAULT
        });
        static M30: MutexCb<Tr> = MutexCb::new(MutexAttr {
            protocol: MutexProtocol::Ceiling(30),
            ..MutexAttr::DEFAULT
        });

        make_running(&THREAD);

        M20.lock().unwrap();
        assert_eq!(THREAD.effective_priority().unwrap(), 20);
        M30.lock().unwrap();
        assert_eq!(THREAD.effective_priority().unwrap(), 30);

        M30.unlock().unwrap();
        assert_eq!(THREAD.effective_priority().unwrap(), 20);
        M20.unlock().unwrap();
        assert_eq!(THREAD.effective_priority().unwrap(), 5);
    }

    #[test]
    fn ceiling_rejects_a_too_urgent_locker() {
        define_test_kernel!(struct Tr);
        static THREAD: ThreadCb<Tr> = ThreadCb::new(thread_attr(25));
        static M: MutexCb<Tr> = MutexCb::new(MutexAttr {
            protocol: MutexProtocol::Ceiling(20),
            ..MutexAttr::DEFAULT
        });

        make_running(&THREAD);

        assert_eq!(M.lock(), Err(LockMutexError::BadParam));
        assert_eq!(M.try_lock(), Err(TryLockMutexError::BadParam));
    }

    #[test]
    fn reentry_would_deadlock() {
        define_test_kernel!(struct Tr);
        static THREAD: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static M_NORMAL: MutexCb<Tr> = MutexCb::new(MutexAttr::DEFAULT);
        static M_CHECKED: MutexCb<Tr> = MutexCb::new(MutexAttr {
            kind: MutexKind::ErrorCheck,
            ..MutexAttr::DEFAULT
        });

        make_running(&THREAD);

        M_NORMAL.lock().unwrap();
        assert_eq!(M_NORMAL.lock(), Err(LockMutexError::WouldDeadlock));

        M_CHECKED.lock().unwrap();
        assert_eq!(M_CHECKED.lock(), Err(LockMutexError::WouldDeadlock));
        assert_eq!(M_CHECKED.try_lock(), Err(TryLockMutexError::WouldDeadlock));
    }

    #[test]
    fn recursive_locking_counts() {
        define_test_kernel!(struct Tr);
        static THREAD: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static M: MutexCb<Tr> = MutexCb::new(MutexAttr {
            kind: MutexKind::Recursive,
            max_recursion: 3,
            ..MutexAttr::DEFAULT
        });

        make_running(&THREAD);

        M.lock().unwrap();
        M.lock().unwrap();
        M.lock().unwrap();
        assert_eq!(M.lock(), Err(LockMutexError::RecursionOverflow));

        // Exactly as many unlocks as successful locks release the mutex
        M.unlock().unwrap();
        assert!(M.is_locked().unwrap());
        M.unlock().unwrap();
        assert!(M.is_locked().unwrap());
        M.unlock().unwrap();
        assert!(!M.is_locked().unwrap());

        assert_eq!(M.unlock(), Err(UnlockMutexError::NotOwner));
    }

    #[test]
    fn contention_and_non_owner_errors() {
        define_test_kernel!(struct Tr);
        static OWNER: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static OTHER: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static M: MutexCb<Tr> = MutexCb::new(MutexAttr::DEFAULT);

        make_running(&OWNER);
        M.lock().unwrap();

        // Pretend a context switch happened
        make_running(&OTHER);

        assert_eq!(M.try_lock(), Err(TryLockMutexError::Timeout));
        assert_eq!(M.unlock(), Err(UnlockMutexError::NotOwner));
    }

    #[test]
    fn unlock_order_is_enforced() {
        define_test_kernel!(struct Tr);
        static THREAD: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static M1: MutexCb<Tr> = MutexCb::new(MutexAttr::DEFAULT);
        static M2: MutexCb<Tr> = MutexCb::new(MutexAttr::DEFAULT);

        make_running(&THREAD);

        M1.lock().unwrap();
        M2.lock().unwrap();

        assert_eq!(M1.unlock(), Err(UnlockMutexError::BadObjectState));

        M2.unlock().unwrap();
        M1.unlock().unwrap();
    }

    #[test]
    fn abandonment_and_recovery() {
        define_test_kernel!(struct Tr);
        static VICTIM: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static SURVIVOR: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static M: MutexCb<Tr> = MutexCb::new(MutexAttr {
            robustness: MutexRobustness::Robust,
            ..MutexAttr::DEFAULT
        });

        make_running(&VICTIM);
        M.lock().unwrap();

        // The owner dies while holding the mutex
        {
            let mut lock = klock::lock_cpu::<Tr>().unwrap();
            abandon_held_mutexes(lock.borrow_mut(), &VICTIM);
        }
        assert!(!M.is_locked().unwrap());

        make_running(&SURVIVOR);

        // The next acquisition succeeds but reports the abandonment
        assert_eq!(M.lock(), Err(LockMutexError::Abandoned));
        assert!(core::ptr::eq(M.owning_thread().unwrap().unwrap(), &SURVIVOR));

        M.mark_consistent().unwrap();
        assert_eq!(
            M.mark_consistent(),
            Err(MarkConsistentMutexError::BadObjectState)
        );

        M.unlock().unwrap();
        M.lock().unwrap();
        M.unlock().unwrap();
    }

    #[test]
    fn releasing_an_inconsistent_mutex_makes_it_unrecoverable() {
        define_test_kernel!(struct Tr);
        static VICTIM: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static SURVIVOR: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static M: MutexCb<Tr> = MutexCb::new(MutexAttr {
            robustness: MutexRobustness::Robust,
            ..MutexAttr::DEFAULT
        });

        make_running(&VICTIM);
        M.lock().unwrap();
        {
            let mut lock = klock::lock_cpu::<Tr>().unwrap();
            abandon_held_mutexes(lock.borrow_mut(), &VICTIM);
        }

        make_running(&SURVIVOR);
        assert_eq!(M.lock(), Err(LockMutexError::Abandoned));

        // Unlocking without restoring consistency finishes the mutex off
        M.unlock().unwrap();
        assert_eq!(M.lock(), Err(LockMutexError::BadObjectState));
        assert_eq!(M.try_lock(), Err(TryLockMutexError::BadObjectState));
    }

    #[test]
    fn stalled_mutex_stays_locked_after_owner_death() {
        define_test_kernel!(struct Tr);
        static VICTIM: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static SURVIVOR: ThreadCb<Tr> = ThreadCb::new(thread_attr(5));
        static M: MutexCb<Tr> = MutexCb::new(MutexAttr::DEFAULT);

        make_running(&VICTIM);
        M.lock().unwrap();
        {
            let mut lock = klock::lock_cpu::<Tr>().unwrap();
            abandon_held_mutexes(lock.borrow_mut(), &VICTIM);
        }

        // A stalled mutex is left locked by the dead owner
        assert!(M.is_locked().unwrap());
        make_running(&SURVIVOR);
        assert_eq!(M.try_lock(), Err(TryLockMutexError::Timeout));
    }
}
