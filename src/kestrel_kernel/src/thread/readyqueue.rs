//! The thread ready queue.
//!
//! A single intrusive list of every Ready thread, ordered by descending
//! effective priority with FIFO order within one priority. Insertion walks
//! from the tail backward, so the common case — a thread whose priority does
//! not exceed the current tail's — is O(1); insertion at the head is
//! recognized before the scan to keep that case O(1) as well.
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    thread::ThreadCb,
    utils::intrusive_list::{Ident, ListAccessorCell, Static, StaticListHead},
    KernelTraits, PortThreading, Priority,
};

/// Get a `ListAccessorCell` used to access the ready queue.
macro_rules! list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new(
            $head,
            &Static,
            |thread_cb: &ThreadCb<_>| &thread_cb.link,
            $key,
        )
    };
}

/// The thread ready queue.
pub(crate) struct ReadyQueue<Traits: PortThreading> {
    /// The Ready threads, linked through [`ThreadCb::link`].
    head: CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,
}

impl<Traits: PortThreading> ReadyQueue<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            head: CpuLockCell::new(StaticListHead::new()),
        }
    }
}

impl<Traits: KernelTraits> ReadyQueue<Traits> {
    /// Return a flag indicating whether there's a Ready thread whose
    /// effective priority exceeds `pri`. `None` compares below everything,
    /// i.e. any Ready thread qualifies.
    pub(crate) fn has_thread_exceeding_priority(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        pri: Option<Priority>,
    ) -> bool {
        let accessor = list_accessor!(&self.head, lock.borrow_mut());
        if let Some(front) = accessor.front() {
            match pri {
                None => true,
                Some(pri) => {
                    *accessor.pool()[front]
                        .effective_priority
                        .read(&**accessor.cell_key())
                        > pri
                }
            }
        } else {
            false
        }
    }

    /// Insert `thread_cb` into the queue, as close to the back as possible
    /// without violating the priority ordering. I.e., if there are one or
    /// more threads having effective priorities identical to that of
    /// `thread_cb`, `thread_cb` is inserted after them.
    ///
    /// # Safety
    ///
    /// `thread_cb` must not already be included in the queue.
    pub(crate) unsafe fn push_back_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread_cb: &'static ThreadCb<Traits>,
    ) {
        let mut accessor = list_accessor!(&self.head, lock.borrow_mut());
        let pri = *thread_cb
            .effective_priority
            .read(&**accessor.cell_key());

        // Tail and head fast paths before the general backward scan
        // Safety: This linked list is structurally sound, so `back` can't
        //         return `InconsistentError`
        let back = unsafe { accessor.back().unwrap_unchecked() };
        let insert_at = if let Some(back) = back {
            let back_pri = *accessor.pool()[back]
                .effective_priority
                .read(&**accessor.cell_key());
            if back_pri >= pri {
                // No lower-priority thread in the queue - insert at the back
                None
            } else {
                // Safety: The list is non-empty
                let front = accessor.front().unwrap();
                let front_pri = *accessor.pool()[front]
                    .effective_priority
                    .read(&**accessor.cell_key());
                if pri > front_pri {
                    // More urgent than everything - insert at the front
                    Some(front)
                } else {
                    // Walk from the tail backward past every lower-priority
                    // thread
                    let mut insert_at = None;
                    let mut cursor = Some(back);
                    while let Some(next_cursor) = cursor {
                        let cursor_pri = *accessor.pool()[next_cursor]
                            .effective_priority
                            .read(&**accessor.cell_key());
                        if cursor_pri < pri {
                            insert_at = Some(next_cursor);
                            // Safety: `next_cursor` is linked, so `prev`
                            //         can't return `ItemError::NotLinked`
                            cursor =
                                unsafe { accessor.prev(next_cursor).unwrap_unchecked() };
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

        // Safety: `thread_cb` is unlinked per this method's precondition
        unsafe {
            accessor
                .insert(Ident(thread_cb), insert_at)
                .unwrap_unchecked()
        };
    }

    /// Remove and return the highest-priority Ready thread, or `None` if the
    /// queue is empty.
    pub(crate) fn pop_front_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        let mut accessor = list_accessor!(&self.head, lock.borrow_mut());
        // Safety: This linked list is structurally sound, so `pop_front`
        //         can't return `InconsistentError`
        unsafe { accessor.pop_front().unwrap_unchecked() }.map(|Ident(thread_cb)| thread_cb)
    }

    /// Reposition the specified thread within the queue after a change in
    /// its effective priority.
    ///
    /// # Safety
    ///
    /// `thread_cb` must be included in the queue.
    pub(crate) unsafe fn reorder_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread_cb: &'static ThreadCb<Traits>,
    ) {
        {
            let mut accessor = list_accessor!(&self.head, lock.borrow_mut());
            // Safety: `thread_cb` is linked per this method's precondition
            unsafe { accessor.remove(Ident(thread_cb)).unwrap_unchecked() };
        }

        // Safety: `thread_cb` was just unlinked
        unsafe { self.push_back_thread(lock, thread_cb) };
    }
}

impl<Traits: KernelTraits> fmt::Debug for ReadyQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyQueue")
            .field("head", &self.head.debug_fmt_with(|head, f| head.fmt(f)))
            .finish()
    }
}
