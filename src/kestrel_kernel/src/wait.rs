//! The generic wait-list mechanism shared by all blocking primitives.
//!
//! Every blocking service follows the same two-phase protocol: check the
//! primitive-specific "already satisfied" predicate under CPU Lock and return
//! immediately if it holds; otherwise construct a [`Wait`] object *on the
//! caller's stack*, link it into the primitive's [`WaitQueue`] (and, for a
//! bounded wait, link a timeout object into the clock's timeout list), and
//! yield the processor. A wake-upper — a signaling thread, the timeout
//! engine, or [`interrupt_thread`] — unlinks the wait object, records the
//! wake reason in the thread's [`ThreadWait`], and makes the thread Ready.
//! By the time a blocking call returns, both nodes are guaranteed to be
//! unlinked on every exit path.
use core::{fmt, ops, ptr::NonNull, sync::atomic::Ordering};

use crate::{
    error::{expect_not_timeout, BadObjectStateError, WaitError, WaitTimeoutError},
    event_flags, mutex, thread,
    thread::ThreadCb,
    timeout,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::{
        intrusive_list::{self, ListAccessorCell, UnsafeStatic},
        Init,
    },
    KernelTraits, PortThreading,
};

// Type definitions and trait implementations for wait lists
// ---------------------------------------------------------------------------

/// A reference to a [`Wait`].
pub(super) struct WaitRef<Traits: PortThreading>(NonNull<Wait<Traits>>);

// Safety: `Wait` is only accessed with CPU Lock active, which forms a total
//         order on accesses
unsafe impl<Traits: PortThreading> Send for WaitRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for WaitRef<Traits> {}

impl<Traits: PortThreading> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for WaitRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for WaitRef<Traits> {}

impl<Traits: PortThreading> ops::Index<WaitRef<Traits>> for UnsafeStatic {
    type Output = Wait<Traits>;

    fn index(&self, index: WaitRef<Traits>) -> &Self::Output {
        // Safety: See `wait_queue_accessor`.
        unsafe { &*index.0.as_ptr() }
    }
}

/// Get a `ListAccessorCell` used to access a wait queue.
///
/// # Safety
///
/// All elements of `$list` must be extant.
macro_rules! wait_queue_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new(
            $list,
            UnsafeStatic::new(),
            |wait: &Wait<_>| &wait.link,
            $key,
        )
    };
}

// ---------------------------------------------------------------------------

/// A wait object describing *which thread* is waiting on *what condition*.
///
/// # Lifetime
///
/// This object is constructed by `WaitQueue::wait` on a waiting thread's
/// stack and only survives until the method returns, which means a `Wait`
/// can expire only when its thread is not waiting anymore. Everything that
/// links a `Wait` into a queue unlinks it before the owning call returns.
pub(super) struct Wait<Traits: PortThreading> {
    /// The thread that is waiting for something.
    thread: &'static ThreadCb<Traits>,

    /// Forms a linked list headed by `wait_queue.waits`.
    link: CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,

    /// The containing [`WaitQueue`], if any.
    wait_queue: Option<&'static WaitQueue<Traits>>,

    payload: WaitPayload<Traits>,
}

/// Additional information included in a [`Wait`], specific to the waitable
/// object type.
pub(super) enum WaitPayload<Traits: PortThreading> {
    EventFlags {
        bits: event_flags::EventFlagBits,
        flags: event_flags::EventFlagsWaitFlags,
        orig_bits: event_flags::AtomicEventFlagBits,
    },
    Semaphore,
    Mutex(&'static mutex::MutexCb<Traits>),
    CondVar,
    PoolBlock {
        /// Receives the block handed over by a `free` call. Null until then.
        granted: core::sync::atomic::AtomicPtr<u8>,
    },
    Join(&'static ThreadCb<Traits>),
    Sleep,
}

/// A queue of wait objects ([`Wait`]) waiting on a particular waitable
/// object.
pub(super) struct WaitQueue<Traits: PortThreading> {
    /// Wait objects waiting on the waitable object associated with this
    /// instance of `WaitQueue`. The waiting threads (`Wait::thread`) must be
    /// in the Waiting state.
    ///
    /// All elements of this linked list must be valid.
    waits: CpuLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,

    order: QueueOrder,
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(QueueOrder::ThreadPriority);
}

/// Specifies the sorting order of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    Fifo,
    /// The wait queue is processed in a thread priority order. Threads with
    /// the same priority follow a FIFO order.
    ThreadPriority,
}

/// The wait state of a thread.
pub(super) struct ThreadWait<Traits: PortThreading> {
    /// The wait object describing the ongoing Waiting state of the thread.
    /// Is `None` iff the thread is not in the Waiting state.
    ///
    /// The pointee must be valid.
    current_wait: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    /// The result of the last wait operation. Set by a wake-upper. Returned
    /// by [`WaitQueue::wait`].
    wait_result: CpuLockCell<Traits, Result<(), WaitTimeoutError>>,
}

impl<Traits: PortThreading> Init for ThreadWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current_wait: CpuLockCell::new(None),
        wait_result: CpuLockCell::new(Ok(())),
    };
}

/// Register a timeout object to interrupt `$thread_cb` after the duration
/// `$duration` (in ticks). The timeout object remains valid throughout the
/// current lexical scope and is unregistered when the scope is left, no
/// matter how.
///
/// This macro is used inside a blocking operation with timeout.
macro_rules! setup_timeout_wait {
    ($lock:ident, $thread_cb:expr, $duration:expr) => {
        // Create a timeout object on this stack frame.
        let timeout_object = new_timeout_object_for_thread($lock.borrow_mut(), $thread_cb, $duration);
        pin_utils::pin_mut!(timeout_object);

        // Use `TimeoutGuard` to automatically unregister the timeout when
        // leaving the current lexical scope.
        let mut timeout_guard = timeout::TimeoutGuard {
            timeout: timeout_object.as_ref(),
            lock: $lock,
        };
        let mut $lock = timeout_guard.lock.borrow_mut();

        // Register the timeout object
        timeout::insert_timeout($lock.borrow_mut(), timeout_guard.timeout);
    };
}

impl<Traits: PortThreading> WaitQueue<Traits> {
    /// Construct a `WaitQueue`.
    pub(super) const fn new(order: QueueOrder) -> Self {
        Self {
            waits: CpuLockCell::new(intrusive_list::ListHead::new()),
            order,
        }
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Insert a wait object pertaining to the currently running thread to
    /// `self`, transitioning the thread into the Waiting state.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    #[inline]
    pub(super) fn wait(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<WaitPayload<Traits>, WaitError> {
        let thread = expect_running_thread(lock.borrow_mut());
        let wait = Wait {
            thread,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };

        self.wait_inner(lock, &wait)
            .map_err(expect_not_timeout)?;

        Ok(wait.payload)
    }

    /// Insert a wait object pertaining to the currently running thread to
    /// `self`, transitioning the thread into the Waiting state. The operation
    /// will time out after `duration` ticks.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    #[inline]
    pub(super) fn wait_timeout(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        duration: crate::Ticks,
    ) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
        let thread = expect_running_thread(lock.borrow_mut());
        let wait = Wait {
            thread,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };

        // Configure a timeout
        setup_timeout_wait!(lock, thread, duration);

        self.wait_inner(lock, &wait)?;

        Ok(wait.payload)
    }

    /// The core portion of `Self::wait`.
    ///
    /// Passing `WaitPayload` by value is expensive, so moving `WaitPayload`
    /// into and out of `Wait` is done in the outer functions with
    /// `#[inline]`.
    fn wait_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait: &Wait<Traits>,
    ) -> Result<(), WaitTimeoutError> {
        let thread = wait.thread;
        let wait_ref = WaitRef(wait.into());

        debug_assert!(core::ptr::eq(
            wait.thread,
            Traits::state().running_thread(lock.borrow_mut()).unwrap()
        ));
        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        // Insert `wait_ref` into `self.waits`
        // Safety: All elements of `self.waits` are extant.
        let mut accessor = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) };
        let insert_at = match self.order {
            QueueOrder::Fifo => {
                // FIFO order - insert at the back
                None
            }
            QueueOrder::ThreadPriority => {
                let cur_pri = thread.effective_priority.read(&**accessor.cell_key());
                Self::find_insertion_position_by_thread_priority(*cur_pri, &accessor)
            }
        };

        // Safety: `wait_ref` is not linked, so `insert` can't return
        //         `InsertError::AlreadyLinked`
        unsafe { accessor.insert(wait_ref, insert_at).unwrap_unchecked() };

        // Set `thread.wait.current_wait`
        thread.wait.current_wait.replace(&mut *lock, Some(wait_ref));

        // Transition the thread into Waiting. This statement will complete
        // when the thread is woken up.
        thread::wait_until_woken_up(lock.borrow_mut());

        // `wait_ref` should have been removed from the wait queue by a
        // wake-upper
        assert!(wait.link.read(&*lock).is_none());
        assert!(thread.wait.current_wait.get(&*lock).is_none());

        // Return the wait result
        thread.wait.wait_result.get(&*lock)
    }

    /// Find the insertion position for a wait object owned by a thread whose
    /// effective priority is `cur_pri`: as close to the back as possible
    /// without placing it behind a lower-priority waiter.
    fn find_insertion_position_by_thread_priority<MapLink>(
        cur_pri: crate::Priority,
        accessor: &ListAccessorCell<
            '_,
            &CpuLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,
            UnsafeStatic,
            MapLink,
            CpuLockTokenRefMut<'_, Traits>,
        >,
    ) -> Option<WaitRef<Traits>>
    where
        MapLink: Fn(
            &Wait<Traits>,
        ) -> &CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,
    {
        let mut insert_at = None;
        // Safety: This linked list is structurally sound, so `back` can't
        //         return `InconsistentError`
        let mut cursor = unsafe { accessor.back().unwrap_unchecked() };
        while let Some(next_cursor) = cursor {
            // Should the new wait object be inserted at this or an earlier
            // position?
            let next_cursor_thread = accessor.pool()[next_cursor].thread;
            let next_cursor_pri = *next_cursor_thread
                .effective_priority
                .read(&**accessor.cell_key());
            if next_cursor_pri < cur_pri {
                // If so, update `insert_at`. Continue searching because
                // there might be a viable position that is even earlier.
                insert_at = Some(next_cursor);
                // Safety: `next_cursor` is linked, so `prev` can't return
                //         `ItemError::NotLinked`
                cursor = unsafe { accessor.prev(next_cursor).unwrap_unchecked() };
            } else {
                break;
            }
        }
        insert_at
    }

    /// Reposition `wait` in the wait queue. This is necessary after changing
    /// the waiting thread's priority.
    fn reorder_wait(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, wait: &Wait<Traits>) {
        match self.order {
            QueueOrder::Fifo => return,
            QueueOrder::ThreadPriority => {}
        }

        let wait_ref = WaitRef(wait.into());
        let thread = wait.thread;
        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        // Safety: All elements of `self.waits` are extant.
        let mut accessor = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) };

        // Remove `wait_ref` first.
        // Safety: `wait_ref` is linked, so `remove` can't return
        //         `ItemError::NotLinked`
        unsafe {
            accessor.remove(wait_ref).unwrap_unchecked();
        }

        // Re-insert `wait_ref` at the position appropriate for the thread's
        // new effective priority.
        let cur_pri = *thread.effective_priority.read(&**accessor.cell_key());
        let insert_at = Self::find_insertion_position_by_thread_priority(cur_pri, &accessor);
        // Safety: `wait_ref` was just unlinked
        unsafe {
            accessor.insert(wait_ref, insert_at).unwrap_unchecked();
        }
    }

    /// Get the next waiting thread to be woken up, without waking it.
    pub(super) fn first_waiting_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        // Safety: All elements of `self.waits` are extant.
        let accessor = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) };
        accessor.front_data().map(|wait| wait.thread)
    }

    /// Wake up up to one waiting thread. Returns `true` if it has
    /// successfully woken up a thread.
    ///
    /// This method may make a thread Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_one(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        // Get the first wait object
        // Safety: All elements of `self.waits` are extant.
        let mut accessor = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) };
        // Safety: This linked list is structurally sound, so `pop_front`
        //         can't return `InconsistentError`
        let wait_ref = unsafe { accessor.pop_front().unwrap_unchecked() };

        let wait_ref = if let Some(wait_ref) = wait_ref {
            wait_ref
        } else {
            return false;
        };

        // Safety: `wait_ref` points to a valid `Wait` because `wait_ref` was
        // in `self.waits` at the beginning of this function call.
        let wait = unsafe { wait_ref.0.as_ref() };

        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        complete_wait(lock.borrow_mut(), wait, Ok(()));

        true
    }

    /// Wake up all waiting threads. Returns `true` if it has woken up at
    /// least one thread.
    ///
    /// This method may make threads Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_all(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.wake_up_one(lock.borrow_mut()) && {
            while self.wake_up_one(lock.borrow_mut()) {}
            true
        }
    }

    /// Conditionally wake up waiting threads. `cond` is evaluated for each
    /// waiter, in queue order; returning `true` wakes that waiter.
    ///
    /// This method may make threads Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_all_conditional(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut cond: impl FnMut(&WaitPayload<Traits>) -> bool,
    ) {
        // Safety: All elements of `self.waits` are extant.
        let mut cur =
            unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) }.front();

        while let Some(wait_ref) = cur {
            // Find the next wait object before we possibly remove `wait_ref`
            // from `self.waits`.
            cur = {
                // Safety: All elements of `self.waits` are extant.
                let accessor = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) };
                // Safety: `wait_ref` is still linked, so `next` can't return
                //         `ItemError::NotLinked`
                unsafe { accessor.next(wait_ref).unwrap_unchecked() }
            };

            // Dereference `wait_ref` and get `&Wait`
            // Safety: `wait_ref` points to a valid `Wait` because `wait_ref`
            // is in `self.waits`.
            let wait = unsafe { wait_ref.0.as_ref() };

            debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

            // Should this thread be woken up?
            if !cond(&wait.payload) {
                continue;
            }

            // Wake up the thread
            // Safety: All elements of `self.waits` are extant, and `wait_ref`
            //         is still linked.
            let mut accessor = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) };
            unsafe { accessor.remove(wait_ref).unwrap_unchecked() };

            complete_wait(lock.borrow_mut(), wait, Ok(()));
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for Wait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ thread: {:p}, payload: {:?} }}",
            self.thread, self.payload
        )
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitPayload<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventFlags {
                bits,
                flags,
                orig_bits,
            } => f
                .debug_struct("EventFlags")
                .field("bits", bits)
                .field("flags", flags)
                .field("orig_bits", &orig_bits.load(Ordering::Relaxed))
                .finish(),
            Self::Semaphore => f.write_str("Semaphore"),
            Self::Mutex(mutex) => write!(f, "Mutex({:p})", *mutex),
            Self::CondVar => f.write_str("CondVar"),
            Self::PoolBlock { granted } => f
                .debug_struct("PoolBlock")
                .field("granted", &granted.load(Ordering::Relaxed))
                .finish(),
            Self::Join(thread) => write!(f, "Join({:p})", *thread),
            Self::Sleep => f.write_str("Sleep"),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field(
                "waits",
                &self.waits.debug_fmt_with(|head, f| head.fmt(f)),
            )
            .field("order", &self.order)
            .finish()
    }
}

impl<Traits: KernelTraits> fmt::Debug for ThreadWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadWait")
            .field("current_wait", &self.current_wait)
            .field("wait_result", &self.wait_result)
            .finish()
    }
}

/// Get the currently running thread, which must exist because the caller is
/// it.
#[inline]
fn expect_running_thread<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> &'static ThreadCb<Traits> {
    let thread = Traits::state().running_thread(lock);
    // The caller has already checked that this is a waitable (thread) context
    thread.unwrap()
}

/// Call the given closure with a reference to the specified thread's current
/// wait payload object as the closure's parameter.
///
/// The wait object might get deallocated when the thread starts running.
/// This function allows access to the wait object while ensuring the
/// reference to it doesn't escape from the scope.
pub(super) fn with_current_wait_payload<Traits: KernelTraits, R>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &ThreadCb<Traits>,
    f: impl FnOnce(Option<&WaitPayload<Traits>>) -> R,
) -> R {
    let wait_ref = thread_cb.wait.current_wait.get(&*lock);

    // Safety: `wait_ref` must point to an existing `Wait`
    let wait = wait_ref.map(|r| &unsafe { &*r.0.as_ptr() }.payload);

    f(wait)
}

/// Reposition the given thread's wait object within its wait queue. This is
/// necessary after changing the thread's effective priority because wait
/// queues are sorted by it ([`QueueOrder::ThreadPriority`]).
///
/// Does nothing if the thread is not currently in the Waiting state or the
/// wait object is not associated with any wait queue.
pub(super) fn reorder_wait_of_thread<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &ThreadCb<Traits>,
) {
    if let Some(wait_ref) = thread_cb.wait.current_wait.get(&*lock) {
        // Safety: `wait_ref` must point to an existing `Wait`
        let wait = unsafe { &*wait_ref.0.as_ptr() };

        if let Some(wait_queue) = wait.wait_queue {
            wait_queue.reorder_wait(lock, wait);
        }
    }
}

/// Create a wait object pertaining to the currently running thread but not
/// pertaining to any wait queue. Transition the thread into the Waiting
/// state.
///
/// The only way to end such a wait operation is to call [`interrupt_thread`].
///
/// The current context must be waitable (this function doesn't check that).
#[inline]
#[allow(dead_code)]
pub(super) fn wait_no_queue<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
) -> Result<WaitPayload<Traits>, WaitError> {
    let thread = expect_running_thread(lock.borrow_mut());
    let wait = Wait {
        thread,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };

    wait_no_queue_inner(lock, &wait).map_err(expect_not_timeout)?;

    Ok(wait.payload)
}

/// Create a wait object pertaining to the currently running thread but not
/// pertaining to any wait queue. Transition the thread into the Waiting
/// state. The operation will time out after `duration` ticks.
///
/// The only way to end such a wait operation is to call [`interrupt_thread`]
/// or to wait until it times out.
///
/// The current context must be waitable (this function doesn't check that).
#[inline]
pub(super) fn wait_no_queue_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
    duration: crate::Ticks,
) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
    let thread = expect_running_thread(lock.borrow_mut());
    let wait = Wait {
        thread,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };

    // Configure a timeout
    setup_timeout_wait!(lock, thread, duration);

    wait_no_queue_inner(lock, &wait)?;

    Ok(wait.payload)
}

/// The core portion of [`wait_no_queue`].
fn wait_no_queue_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
) -> Result<(), WaitTimeoutError> {
    let thread = wait.thread;
    let wait_ref = WaitRef(wait.into());

    debug_assert!(wait.wait_queue.is_none());
    debug_assert!(wait.link.read(&*lock).is_none());

    // Set `thread.wait.current_wait`
    thread.wait.current_wait.replace(&mut *lock, Some(wait_ref));

    // Transition the thread into Waiting. This statement will complete when
    // the thread is woken up.
    thread::wait_until_woken_up(lock.borrow_mut());

    // `wait_ref` should have been removed from `current_wait` by a wake-upper
    assert!(thread.wait.current_wait.get(&*lock).is_none());

    // Return the wait result
    thread.wait.wait_result.get(&*lock)
}

/// Deassociate the specified wait object from its waiting thread
/// (`wait.thread`) and wake up the thread.
///
/// This method doesn't remove `wait` from `WaitQueue::waits`.
///
/// This method may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
    wait_result: Result<(), WaitTimeoutError>,
) {
    let thread_cb = wait.thread;

    // Clear `ThreadWait::current_wait`
    assert_eq!(
        *thread_cb.wait.current_wait.read(&*lock),
        Some(WaitRef(wait.into()))
    );
    thread_cb.wait.current_wait.replace(&mut *lock, None);

    // Set a wait result
    thread_cb.wait.wait_result.replace(&mut *lock, wait_result);

    assert_eq!(*thread_cb.st.read(&*lock), thread::ThreadSt::Waiting);

    // Make the thread Ready
    //
    // Safety: The thread is in the Waiting state, meaning its execution
    // context is valid and ready to resume from the point where it was
    // previously suspended. The clean-up for exiting the Waiting state is
    // already done as well.
    unsafe { thread::make_ready(lock, thread_cb) };
}

/// Interrupt any ongoing wait operation of the specified thread.
///
/// This method may make the thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
///
/// Returns `Err(BadObjectState)` if the thread is not in the Waiting state.
///
/// `wait_result` must be valid for the wait operation type. As a rule of
/// thumb, code outside this module should not pass
/// `WaitTimeoutError::Timeout` to this method.
pub(super) fn interrupt_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
    wait_result: Result<(), WaitTimeoutError>,
) -> Result<(), BadObjectStateError> {
    match *thread_cb.st.read(&*lock) {
        thread::ThreadSt::Waiting => {
            // Interrupt the ongoing wait operation.
            let wait_ref = thread_cb.wait.current_wait.get(&*lock);

            // The thread is in the Waiting state, so `wait_ref` must be
            // `Some(_)`
            let wait_ref = wait_ref.unwrap();

            // Safety: ... and `wait_ref` must point to an existing `Wait`
            let wait = unsafe { wait_ref.0.as_ref() };

            // Remove `wait` from the wait queue it belongs to
            if let Some(wait_queue) = wait.wait_queue {
                // Safety: All elements of `wait_queue.waits` are extant, and
                //         `wait_ref` is linked
                let mut accessor =
                    unsafe { wait_queue_accessor!(&wait_queue.waits, lock.borrow_mut()) };
                unsafe { accessor.remove(wait_ref).unwrap_unchecked() };
            }

            // A waiter departing without taking ownership may lower the
            // priority inherited by the mutex's owner
            if let WaitPayload::Mutex(mutex_cb) = &wait.payload {
                mutex::update_inherited_priority(lock.borrow_mut(), *mutex_cb);
            }

            // Wake up the thread
            complete_wait(lock.borrow_mut(), wait, wait_result);

            Ok(())
        }
        _ => Err(BadObjectStateError::BadObjectState),
    }
}

/// Construct a [`timeout::Timeout`] that interrupts the specified thread with
/// [`WaitTimeoutError::Timeout`] when it fires.
fn new_timeout_object_for_thread<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
    duration: crate::Ticks,
) -> timeout::Timeout<Traits> {
    let timeout_object = timeout::Timeout::new(timeout::TimeoutAction::WakeThread(thread_cb));

    // Configure the `Timeout` to expire in `duration` ticks
    timeout_object.set_expiration_after(lock, duration);

    timeout_object
}

/// The timeout engine's half of the timed-wait protocol: interrupt the
/// thread's wait with a `Timeout` result. Invoked by a firing
/// [`timeout::TimeoutAction::WakeThread`].
pub(super) fn interrupt_thread_by_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) {
    match interrupt_thread(
        lock.borrow_mut(),
        thread_cb,
        Err(WaitTimeoutError::Timeout),
    ) {
        // Even if the thread was already unblocked, we don't care
        Ok(()) | Err(BadObjectStateError::BadObjectState) => {}
    }
}
