//! Fixed-block memory pools.
//!
//! A pool carves a caller-supplied raw memory region into equal-size blocks
//! and keeps the unused ones on a singly-linked free list threaded through
//! the block storage itself, so the bookkeeping costs no extra memory.
//! `alloc` blocks when the pool is empty; `free` hands the returned block
//! directly to the head waiter, if there is one, without it ever touching
//! the free list.
use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
    error::{
        AllocBlockError, AllocBlockTimeoutError, FreeBlockError, InitPoolError,
        TryAllocBlockError,
    },
    klock::{self, CpuLockCell},
    state, thread,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, PortThreading, Ticks,
};

/// A free block's storage doubles as its free-list link while it's unused.
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

/// The mutable portion of a pool's state. Everything lives in one CPU Lock
/// cell since it's always updated together.
struct PoolState {
    /// The start of the backing region. Null until [`MemoryPoolCb::init`].
    region: *mut u8,

    /// The head of the free list.
    free_head: Option<NonNull<FreeBlock>>,

    /// The number of blocks currently lent out.
    allocated: usize,
}

// Safety: The pool's storage is only accessed with CPU Lock active, which
//         forms a total order on accesses
unsafe impl Send for PoolState {}

/// *Memory pool control block* - the state data of a fixed-block memory
/// pool.
pub struct MemoryPoolCb<Traits: PortThreading> {
    /// The size of every block, in bytes.
    pub(super) block_size: usize,

    /// The number of blocks the backing region is divided into.
    pub(super) block_count: usize,

    pub(super) pool_state: CpuLockCell<Traits, PoolState>,

    /// Threads blocked in `alloc` while the pool is empty.
    pub(super) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> MemoryPoolCb<Traits> {
    /// Construct a `MemoryPoolCb` managing `block_count` blocks of
    /// `block_size` bytes each. The pool is unusable until
    /// [`MemoryPoolCb::init`] supplies the backing region.
    pub const fn new(block_size: usize, block_count: usize) -> Self {
        Self::with_queue_order(block_size, block_count, QueueOrder::ThreadPriority)
    }

    pub const fn with_queue_order(
        block_size: usize,
        block_count: usize,
        queue_order: QueueOrder,
    ) -> Self {
        Self {
            block_size,
            block_count,
            pool_state: CpuLockCell::new(PoolState {
                region: core::ptr::null_mut(),
                free_head: None,
                allocated: 0,
            }),
            wait_queue: WaitQueue::new(queue_order),
        }
    }

    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    pub const fn block_count(&self) -> usize {
        self.block_count
    }
}

impl<Traits: KernelTraits> fmt::Debug for MemoryPoolCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPoolCb")
            .field("self", &(self as *const _))
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field(
                "pool_state",
                &self.pool_state.debug_fmt_with(|st, f| {
                    f.debug_struct("PoolState")
                        .field("region", &st.region)
                        .field("allocated", &st.allocated)
                        .finish()
                }),
            )
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> MemoryPoolCb<Traits> {
    /// Supply the backing region and build the free list through it.
    ///
    /// The region must hold `block_size * block_count` bytes; every block
    /// must be able to store a free-list link, so `block_size` must be at
    /// least pointer-sized and pointer-aligned (as must the region itself).
    ///
    /// # Safety
    ///
    /// `base .. base + len` must be valid for reads and writes for the
    /// lifetime of the pool and not used by anything else.
    pub unsafe fn init(&'static self, base: *mut u8, len: usize) -> Result<(), InitPoolError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let align = core::mem::align_of::<FreeBlock>();
        if self.block_size < core::mem::size_of::<FreeBlock>()
            || self.block_size % align != 0
            || base.align_offset(align) != 0
            || len / self.block_size < self.block_count
        {
            return Err(InitPoolError::BadParam);
        }

        let pool_state = self.pool_state.write(&mut *lock);

        if !pool_state.region.is_null() {
            return Err(InitPoolError::BadObjectState);
        }

        // Thread the free list through the block storage, first block on
        // top
        let mut free_head = None;
        for i in (0..self.block_count).rev() {
            // Safety: The block lies within the region, which the caller
            //         promised to be valid and exclusively ours; alignment
            //         was checked above
            let block = unsafe {
                let p = base.add(i * self.block_size).cast::<FreeBlock>();
                p.write(FreeBlock { next: free_head });
                NonNull::new_unchecked(p)
            };
            free_head = Some(block);
        }

        pool_state.region = base;
        pool_state.free_head = free_head;
        pool_state.allocated = 0;

        Ok(())
    }

    /// Take a block, blocking until one becomes available.
    pub fn alloc(&'static self) -> Result<NonNull<u8>, AllocBlockError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let pool_state = self.pool_state.write(&mut *lock);
        if pool_state.region.is_null() {
            return Err(AllocBlockError::BadObjectState);
        }

        if let Some(block) = poll_core(pool_state) {
            return Ok(block);
        }

        // The pool is empty. Start waiting; `free` hands a block directly to
        // this thread.
        let payload = self.wait_queue.wait(
            lock.borrow_mut(),
            WaitPayload::PoolBlock {
                granted: AtomicPtr::new(core::ptr::null_mut()),
            },
        )?;

        Ok(granted_block(&payload))
    }

    /// Take a block, blocking for at most `duration` ticks.
    pub fn alloc_timeout(
        &'static self,
        duration: Ticks,
    ) -> Result<NonNull<u8>, AllocBlockTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let pool_state = self.pool_state.write(&mut *lock);
        if pool_state.region.is_null() {
            return Err(AllocBlockTimeoutError::BadObjectState);
        }

        if let Some(block) = poll_core(pool_state) {
            return Ok(block);
        }

        let payload = self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::PoolBlock {
                granted: AtomicPtr::new(core::ptr::null_mut()),
            },
            duration,
        )?;

        Ok(granted_block(&payload))
    }

    /// Take a block if one is available; fail with `Timeout` otherwise.
    pub fn try_alloc(&'static self) -> Result<NonNull<u8>, TryAllocBlockError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let pool_state = self.pool_state.write(&mut *lock);
        if pool_state.region.is_null() {
            return Err(TryAllocBlockError::BadObjectState);
        }

        poll_core(pool_state).ok_or(TryAllocBlockError::Timeout)
    }

    /// Return a block to the pool, waking up the head waiter if any is
    /// queued.
    pub fn free(&'static self, block: NonNull<u8>) -> Result<(), FreeBlockError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        {
            let pool_state = self.pool_state.read(&*lock);
            if pool_state.region.is_null() {
                return Err(FreeBlockError::BadObjectState);
            }

            // The pointer must refer to a block of this pool
            let offset = (block.as_ptr() as usize).wrapping_sub(pool_state.region as usize);
            if offset % self.block_size != 0 || offset / self.block_size >= self.block_count {
                return Err(FreeBlockError::BadParam);
            }

            if pool_state.allocated == 0 {
                // Nothing is lent out; this must be a double free
                return Err(FreeBlockError::BadParam);
            }
        }

        // Hand the block directly to the head waiter, bypassing the free
        // list
        let mut handed_over = false;
        self.wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |wait_payload| {
                if handed_over {
                    return false;
                }
                match wait_payload {
                    WaitPayload::PoolBlock { granted } => {
                        granted.store(block.as_ptr(), Ordering::Relaxed);
                        handed_over = true;
                        true
                    }
                    _ => unreachable!(),
                }
            });

        if handed_over {
            // The block went straight to another thread; the outstanding
            // count is unchanged
            thread::unlock_cpu_and_check_preemption(lock);
        } else {
            let pool_state = self.pool_state.write(&mut *lock);
            // Safety: The pointer was verified to denote a block of this
            //         pool, and the block is no longer in use
            let free_block = unsafe {
                let p = block.as_ptr().cast::<FreeBlock>();
                p.write(FreeBlock {
                    next: pool_state.free_head,
                });
                NonNull::new_unchecked(p)
            };
            pool_state.free_head = Some(free_block);
            pool_state.allocated -= 1;
        }

        Ok(())
    }
}

/// Check if the pool can satisfy an allocation right away.
///
/// On success, unlinks and returns the free list's head block.
#[inline]
fn poll_core(pool_state: &mut PoolState) -> Option<NonNull<u8>> {
    let block = pool_state.free_head?;
    // Safety: Blocks on the free list hold a valid `FreeBlock`
    pool_state.free_head = unsafe { block.as_ref().next };
    pool_state.allocated += 1;
    Some(block.cast())
}

/// Extract the block stored by the wake-upper into a `PoolBlock` payload.
#[inline]
fn granted_block<Traits: PortThreading>(payload: &WaitPayload<Traits>) -> NonNull<u8> {
    if let WaitPayload::PoolBlock { granted } = payload {
        let p = granted.load(Ordering::Relaxed);
        debug_assert!(!p.is_null());
        // Safety: The wake-upper always stores the granted block before
        //         waking the waiter
        unsafe { NonNull::new_unchecked(p) }
    } else {
        unreachable!()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{klock, test_utils::define_test_kernel};

    fn leak_region(words: usize) -> *mut u8 {
        Box::leak(vec![0usize; words].into_boxed_slice())
            .as_mut_ptr()
            .cast()
    }

    #[test]
    fn alloc_free_round_trip_restores_the_free_list() {
        define_test_kernel!(struct Tr);
        static POOL: MemoryPoolCb<Tr> = MemoryPoolCb::new(16, 4);

        let region = leak_region(16 * 4 / core::mem::size_of::<usize>());
        // Safety: The region was freshly leaked and is used by nothing else
        unsafe { POOL.init(region, 16 * 4).unwrap() };

        let (head_before, allocated_before) = {
            let lock = klock::lock_cpu::<Tr>().unwrap();
            let pool_state = POOL.pool_state.read(&*lock);
            (pool_state.free_head, pool_state.allocated)
        };

        let block = POOL.try_alloc().unwrap();
        assert_eq!(Some(block.cast()), head_before);

        POOL.free(block).unwrap();

        // The pool is back in its pre-allocation state: same head pointer,
        // same outstanding count
        let lock = klock::lock_cpu::<Tr>().unwrap();
        let pool_state = POOL.pool_state.read(&*lock);
        assert_eq!(pool_state.free_head, head_before);
        assert_eq!(pool_state.allocated, allocated_before);
    }

    #[test]
    fn exhaustion_and_replenishment() {
        define_test_kernel!(struct Tr);
        static POOL: MemoryPoolCb<Tr> = MemoryPoolCb::new(16, 2);

        let region = leak_region(16 * 2 / core::mem::size_of::<usize>());
        unsafe { POOL.init(region, 16 * 2).unwrap() };

        let a = POOL.try_alloc().unwrap();
        let b = POOL.try_alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(POOL.try_alloc(), Err(TryAllocBlockError::Timeout));

        POOL.free(a).unwrap();
        let c = POOL.try_alloc().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn free_rejects_foreign_and_double_frees() {
        define_test_kernel!(struct Tr);
        static POOL: MemoryPoolCb<Tr> = MemoryPoolCb::new(16, 2);

        let region = leak_region(16 * 2 / core::mem::size_of::<usize>());
        unsafe { POOL.init(region, 16 * 2).unwrap() };

        let block = POOL.try_alloc().unwrap();

        // A pointer into the middle of a block is not a block
        let inner = NonNull::new(block.as_ptr().wrapping_add(1)).unwrap();
        assert_eq!(POOL.free(inner), Err(FreeBlockError::BadParam));

        // A pointer past the region is not a block
        let outside = NonNull::new(region.wrapping_add(16 * 4)).unwrap();
        assert_eq!(POOL.free(outside), Err(FreeBlockError::BadParam));

        POOL.free(block).unwrap();

        // Nothing is lent out anymore, so this can only be a double free
        assert_eq!(POOL.free(block), Err(FreeBlockError::BadParam));
    }

    #[test]
    fn init_validates_its_inputs() {
        define_test_kernel!(struct Tr);

        // Block size too small to hold a free-list link
        static POOL_TINY: MemoryPoolCb<Tr> = MemoryPoolCb::new(1, 4);
        let region = leak_region(8);
        assert_eq!(
            unsafe { POOL_TINY.init(region, 64) },
            Err(InitPoolError::BadParam)
        );

        // Region too small for the configured geometry
        static POOL_BIG: MemoryPoolCb<Tr> = MemoryPoolCb::new(16, 8);
        let region = leak_region(8);
        assert_eq!(
            unsafe { POOL_BIG.init(region, 64) },
            Err(InitPoolError::BadParam)
        );

        // Double initialization
        static POOL: MemoryPoolCb<Tr> = MemoryPoolCb::new(16, 2);
        let region = leak_region(4);
        unsafe { POOL.init(region, 32).unwrap() };
        let region2 = leak_region(4);
        assert_eq!(
            unsafe { POOL.init(region2, 32) },
            Err(InitPoolError::BadObjectState)
        );
    }

    #[test]
    fn uninitialized_pool_is_reported() {
        define_test_kernel!(struct Tr);
        static POOL: MemoryPoolCb<Tr> = MemoryPoolCb::new(16, 2);

        assert_eq!(POOL.try_alloc(), Err(TryAllocBlockError::BadObjectState));
        assert_eq!(
            POOL.free(NonNull::dangling()),
            Err(FreeBlockError::BadObjectState)
        );
    }
}
