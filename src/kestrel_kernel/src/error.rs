//! Error types returned by the kernel services.
//!
//! Each service has its own error enum carrying exactly the conditions that
//! service can produce. The variants fall into a small shared vocabulary:
//!
//!  - `BadContext` — the calling context is not allowed to make the call
//!    (interrupt context or an active scheduler lock for a blocking service,
//!    CPU Lock already active).
//!  - `Timeout` / `Interrupted` — normal outcomes of a bounded or
//!    interruptible wait, returned as status values and never treated as
//!    fatal.
//!  - `BadParam`, `NotOwner`, `QueueOverflow`, `WouldDeadlock`,
//!    `RecursionOverflow`, `Abandoned`, `BadObjectState` — resource, protocol
//!    and recoverability errors as described by the respective services.
use core::fmt;

macro_rules! define_error {
    (
        $( #[doc = $doc:literal] )*
        pub enum $Name:ident {
            $(
                $( #[doc = $vdoc:literal] )*
                $Variant:ident,
            )*
        }
    ) => {
        $( #[doc = $doc] )*
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub enum $Name {
            $(
                $( #[doc = $vdoc] )*
                $Variant,
            )*
        }

        impl fmt::Debug for $Name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $( Self::$Variant => f.write_str(stringify!($Variant)), )*
                }
            }
        }
    };
}

// Thread services
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for [`ThreadCb::start`](crate::thread::ThreadCb::start).
    pub enum ActivateThreadError {
        /// CPU Lock is active.
        BadContext,
        /// The thread is already started and not yet reclaimed.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`ThreadCb::join`](crate::thread::ThreadCb::join).
    pub enum JoinThreadError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The wait operation was interrupted.
        Interrupted,
        /// The calling thread attempted to join itself.
        WouldDeadlock,
        /// The target thread was never started.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`ThreadCb::interrupt`](crate::thread::ThreadCb::interrupt).
    pub enum InterruptThreadError {
        /// CPU Lock is active.
        BadContext,
        /// The target thread is not in a blocked state.
        BadObjectState,
    }
}

define_error! {
    /// Error type for
    /// [`ThreadCb::set_priority`](crate::thread::ThreadCb::set_priority).
    pub enum SetThreadPriorityError {
        /// CPU Lock is active.
        BadContext,
        /// The priority is out of range, or incompatible with the locking
        /// protocol of a held or awaited mutex.
        BadParam,
        /// The thread is not started.
        BadObjectState,
    }
}

define_error! {
    /// Error type for the thread priority queries.
    pub enum GetThreadPriorityError {
        /// CPU Lock is active.
        BadContext,
        /// The thread is not started.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`thread::exit_current`](crate::thread::exit_current).
    pub enum ExitThreadError {
        /// The current context is not a thread context.
        BadContext,
    }
}

define_error! {
    /// Error type for [`thread::current`](crate::thread::current).
    pub enum GetCurrentThreadError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
    }
}

define_error! {
    /// Error type for [`ThreadCb::state`](crate::thread::ThreadCb::state).
    pub enum QueryThreadError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    /// Error type for [`thread::sleep`](crate::thread::sleep).
    pub enum SleepError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The sleep was interrupted.
        Interrupted,
    }
}

// Scheduler services
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for [`lock_scheduler`](crate::state::lock_scheduler).
    pub enum LockSchedulerError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The scheduler lock count reached its maximum.
        QueueOverflow,
    }
}

define_error! {
    /// Error type for [`unlock_scheduler`](crate::state::unlock_scheduler).
    pub enum UnlockSchedulerError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The scheduler is not currently locked.
        BadObjectState,
    }
}

// Time services
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for [`system_time`](crate::timeout::system_time) and
    /// [`set_system_time`](crate::timeout::set_system_time).
    pub enum TimeError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
    }
}

// Mutex services
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for [`MutexCb::lock`](crate::mutex::MutexCb::lock).
    pub enum LockMutexError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The wait operation was interrupted.
        Interrupted,
        /// The current thread already owns the mutex.
        WouldDeadlock,
        /// The mutex uses the priority ceiling protocol and the current
        /// thread's base priority is above the ceiling.
        BadParam,
        /// The configured maximum recursion count was exceeded.
        RecursionOverflow,
        /// The previous owner exited while holding the mutex. The mutex was
        /// acquired, but the protected state may be inconsistent.
        Abandoned,
        /// The mutex was left inconsistent and is no longer usable.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`MutexCb::try_lock`](crate::mutex::MutexCb::try_lock).
    pub enum TryLockMutexError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The mutex is currently owned by another thread.
        Timeout,
        /// The current thread already owns the mutex.
        WouldDeadlock,
        /// The mutex uses the priority ceiling protocol and the current
        /// thread's base priority is above the ceiling.
        BadParam,
        /// The configured maximum recursion count was exceeded.
        RecursionOverflow,
        /// The previous owner exited while holding the mutex. The mutex was
        /// acquired, but the protected state may be inconsistent.
        Abandoned,
        /// The mutex was left inconsistent and is no longer usable.
        BadObjectState,
    }
}

define_error! {
    /// Error type for
    /// [`MutexCb::lock_timeout`](crate::mutex::MutexCb::lock_timeout).
    pub enum LockMutexTimeoutError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The wait operation was interrupted.
        Interrupted,
        /// The wait operation timed out.
        Timeout,
        /// The current thread already owns the mutex.
        WouldDeadlock,
        /// The mutex uses the priority ceiling protocol and the current
        /// thread's base priority is above the ceiling.
        BadParam,
        /// The configured maximum recursion count was exceeded.
        RecursionOverflow,
        /// The previous owner exited while holding the mutex. The mutex was
        /// acquired, but the protected state may be inconsistent.
        Abandoned,
        /// The mutex was left inconsistent and is no longer usable.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`MutexCb::unlock`](crate::mutex::MutexCb::unlock).
    pub enum UnlockMutexError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The current thread does not own the mutex.
        NotOwner,
        /// The correct mutex unlocking order is violated.
        BadObjectState,
    }
}

define_error! {
    /// Error type for
    /// [`MutexCb::mark_consistent`](crate::mutex::MutexCb::mark_consistent).
    pub enum MarkConsistentMutexError {
        /// CPU Lock is active.
        BadContext,
        /// The current thread does not hold the mutex.
        NotOwner,
        /// The mutex is not in an inconsistent state.
        BadObjectState,
    }
}

define_error! {
    /// Error type for the mutex state queries.
    pub enum QueryMutexError {
        /// CPU Lock is active.
        BadContext,
    }
}

// Semaphore services
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for [`SemaphoreCb::signal`](crate::semaphore::SemaphoreCb::signal).
    pub enum SignalSemaphoreError {
        /// CPU Lock is active.
        BadContext,
        /// The semaphore value would exceed the configured maximum.
        QueueOverflow,
    }
}

define_error! {
    /// Error type for [`SemaphoreCb::wait_one`](crate::semaphore::SemaphoreCb::wait_one).
    pub enum WaitSemaphoreError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The wait operation was interrupted.
        Interrupted,
    }
}

define_error! {
    /// Error type for
    /// [`SemaphoreCb::wait_one_timeout`](crate::semaphore::SemaphoreCb::wait_one_timeout).
    pub enum WaitSemaphoreTimeoutError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The wait operation was interrupted.
        Interrupted,
        /// The wait operation timed out.
        Timeout,
    }
}

define_error! {
    /// Error type for [`SemaphoreCb::poll_one`](crate::semaphore::SemaphoreCb::poll_one).
    pub enum PollSemaphoreError {
        /// CPU Lock is active.
        BadContext,
        /// The semaphore value is currently zero.
        Timeout,
    }
}

define_error! {
    /// Error type for the semaphore value query.
    pub enum GetSemaphoreError {
        /// CPU Lock is active.
        BadContext,
    }
}

// Event-flag services
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for [`EventFlagsCb::raise`](crate::event_flags::EventFlagsCb::raise)
    /// and [`EventFlagsCb::clear`](crate::event_flags::EventFlagsCb::clear).
    pub enum UpdateEventFlagsError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    /// Error type for the event-flag mask query.
    pub enum GetEventFlagsError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    /// Error type for [`EventFlagsCb::wait`](crate::event_flags::EventFlagsCb::wait).
    pub enum WaitEventFlagsError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The wait operation was interrupted.
        Interrupted,
    }
}

define_error! {
    /// Error type for
    /// [`EventFlagsCb::wait_timeout`](crate::event_flags::EventFlagsCb::wait_timeout).
    pub enum WaitEventFlagsTimeoutError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The wait operation was interrupted.
        Interrupted,
        /// The wait operation timed out.
        Timeout,
    }
}

define_error! {
    /// Error type for [`EventFlagsCb::poll`](crate::event_flags::EventFlagsCb::poll).
    pub enum PollEventFlagsError {
        /// CPU Lock is active.
        BadContext,
        /// The wait condition is not currently satisfied.
        Timeout,
    }
}

// Memory pool services
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for [`MemoryPoolCb::init`](crate::mem_pool::MemoryPoolCb::init).
    pub enum InitPoolError {
        /// CPU Lock is active.
        BadContext,
        /// The region is too small for the configured block size and count,
        /// or the block size cannot hold a free-list link.
        BadParam,
        /// The pool is already initialized.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`MemoryPoolCb::alloc`](crate::mem_pool::MemoryPoolCb::alloc).
    pub enum AllocBlockError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The wait operation was interrupted.
        Interrupted,
        /// The pool is not initialized.
        BadObjectState,
    }
}

define_error! {
    /// Error type for
    /// [`MemoryPoolCb::alloc_timeout`](crate::mem_pool::MemoryPoolCb::alloc_timeout).
    pub enum AllocBlockTimeoutError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The wait operation was interrupted.
        Interrupted,
        /// The wait operation timed out.
        Timeout,
        /// The pool is not initialized.
        BadObjectState,
    }
}

define_error! {
    /// Error type for
    /// [`MemoryPoolCb::try_alloc`](crate::mem_pool::MemoryPoolCb::try_alloc).
    pub enum TryAllocBlockError {
        /// CPU Lock is active.
        BadContext,
        /// No free block is currently available.
        Timeout,
        /// The pool is not initialized.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`MemoryPoolCb::free`](crate::mem_pool::MemoryPoolCb::free).
    pub enum FreeBlockError {
        /// CPU Lock is active.
        BadContext,
        /// The pointer does not refer to a block of this pool.
        BadParam,
        /// The pool is not initialized.
        BadObjectState,
    }
}

// Condition variable services
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for [`CondVarCb::wait`](crate::cond_var::CondVarCb::wait).
    pub enum WaitCondVarError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The wait operation was interrupted. The mutex was re-acquired.
        Interrupted,
        /// The current thread does not own the mutex.
        NotOwner,
        /// The mutex is locked recursively, or is no longer usable.
        BadObjectState,
    }
}

define_error! {
    /// Error type for
    /// [`CondVarCb::wait_timeout`](crate::cond_var::CondVarCb::wait_timeout).
    pub enum WaitCondVarTimeoutError {
        /// CPU Lock is active, or the current context is not waitable.
        BadContext,
        /// The wait operation was interrupted. The mutex was re-acquired.
        Interrupted,
        /// The wait operation timed out. The mutex was re-acquired.
        Timeout,
        /// The current thread does not own the mutex.
        NotOwner,
        /// The mutex is locked recursively, or is no longer usable.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`CondVarCb::notify_one`](crate::cond_var::CondVarCb::notify_one)
    /// and [`CondVarCb::notify_all`](crate::cond_var::CondVarCb::notify_all).
    pub enum NotifyCondVarError {
        /// CPU Lock is active.
        BadContext,
    }
}

// Timer services
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for [`TimerCb::start`](crate::timer::TimerCb::start).
    pub enum StartTimerError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    /// Error type for [`TimerCb::stop`](crate::timer::TimerCb::stop).
    pub enum StopTimerError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    /// Error type for [`TimerCb::set_delay`](crate::timer::TimerCb::set_delay).
    pub enum SetTimerDelayError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    /// Error type for [`TimerCb::set_period`](crate::timer::TimerCb::set_period).
    pub enum SetTimerPeriodError {
        /// CPU Lock is active.
        BadContext,
    }
}

// Wait results
// ---------------------------------------------------------------------------

define_error! {
    /// The result of an untimed wait operation, as recorded by a wake-upper.
    pub enum WaitError {
        /// The wait operation was interrupted.
        Interrupted,
    }
}

define_error! {
    /// The result of a timed wait operation, as recorded by a wake-upper.
    pub enum WaitTimeoutError {
        /// The wait operation was interrupted.
        Interrupted,
        /// The wait operation timed out.
        Timeout,
    }
}

impl From<WaitError> for WaitTimeoutError {
    #[inline]
    fn from(x: WaitError) -> Self {
        match x {
            WaitError::Interrupted => Self::Interrupted,
        }
    }
}

macro_rules! impl_from_wait_error {
    ( $Sub:ident $Variants:tt => $( $Super:ident ),* ) => {
        $(
            impl_from_wait_error!(@one $Sub $Variants => $Super);
        )*
    };
    ( @one $Sub:ident { $( $Variant:ident ),* } => $Super:ident ) => {
        impl From<$Sub> for $Super {
            #[inline]
            fn from(x: $Sub) -> Self {
                match x {
                    $( $Sub::$Variant => Self::$Variant ),*
                }
            }
        }
    };
}

impl_from_wait_error! {
    WaitError { Interrupted } =>
        JoinThreadError, SleepError, LockMutexError, WaitSemaphoreError,
        WaitEventFlagsError, AllocBlockError, WaitCondVarError
}

impl_from_wait_error! {
    WaitTimeoutError { Interrupted, Timeout } =>
        LockMutexTimeoutError, WaitSemaphoreTimeoutError,
        WaitEventFlagsTimeoutError, AllocBlockTimeoutError,
        WaitCondVarTimeoutError
}

/// Convert `e` to [`WaitError`], panicking if `e == Timeout`. Used by untimed
/// wait paths, which can never observe a timeout.
#[inline]
pub(super) fn expect_not_timeout(e: WaitTimeoutError) -> WaitError {
    match e {
        WaitTimeoutError::Interrupted => WaitError::Interrupted,
        WaitTimeoutError::Timeout => {
            unreachable!("got timeout result for a non-timeout wait")
        }
    }
}

// Internal sub-errors
// ---------------------------------------------------------------------------

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[derive(Debug, PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant ),*
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_suberror! {
    /// `BadContext`
    #[into(ActivateThreadError)]
    #[into(JoinThreadError)]
    #[into(InterruptThreadError)]
    #[into(SetThreadPriorityError)]
    #[into(GetThreadPriorityError)]
    #[into(ExitThreadError)]
    #[into(GetCurrentThreadError)]
    #[into(QueryThreadError)]
    #[into(SleepError)]
    #[into(LockSchedulerError)]
    #[into(UnlockSchedulerError)]
    #[into(TimeError)]
    #[into(LockMutexError)]
    #[into(TryLockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(UnlockMutexError)]
    #[into(MarkConsistentMutexError)]
    #[into(QueryMutexError)]
    #[into(SignalSemaphoreError)]
    #[into(WaitSemaphoreError)]
    #[into(WaitSemaphoreTimeoutError)]
    #[into(PollSemaphoreError)]
    #[into(GetSemaphoreError)]
    #[into(UpdateEventFlagsError)]
    #[into(GetEventFlagsError)]
    #[into(WaitEventFlagsError)]
    #[into(WaitEventFlagsTimeoutError)]
    #[into(PollEventFlagsError)]
    #[into(InitPoolError)]
    #[into(AllocBlockError)]
    #[into(AllocBlockTimeoutError)]
    #[into(TryAllocBlockError)]
    #[into(FreeBlockError)]
    #[into(WaitCondVarError)]
    #[into(WaitCondVarTimeoutError)]
    #[into(NotifyCondVarError)]
    #[into(StartTimerError)]
    #[into(StopTimerError)]
    #[into(SetTimerDelayError)]
    #[into(SetTimerPeriodError)]
    pub(super) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadObjectState`
    #[into(ActivateThreadError)]
    #[into(JoinThreadError)]
    #[into(InterruptThreadError)]
    #[into(SetThreadPriorityError)]
    #[into(GetThreadPriorityError)]
    #[into(UnlockSchedulerError)]
    #[into(AllocBlockError)]
    #[into(AllocBlockTimeoutError)]
    #[into(TryAllocBlockError)]
    #[into(FreeBlockError)]
    #[into(InitPoolError)]
    pub(super) enum BadObjectStateError {
        BadObjectState,
    }
}

define_suberror! {
    /// The error codes shared by [`TryLockMutexError`], [`LockMutexError`],
    /// and [`LockMutexTimeoutError`] that are detected before a lock attempt
    /// touches the wait queue. Used internally by the mutex implementation.
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(TryLockMutexError)]
    pub(super) enum LockMutexPrecheckError {
        WouldDeadlock,
        BadParam,
        RecursionOverflow,
        BadObjectState,
    }
}
