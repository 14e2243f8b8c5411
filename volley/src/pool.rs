//! Worker slot pool.
//!
//! A slot is the execution context a worker needs to run iterations (a "VU"). The pool
//! creates slots lazily up to a fixed ceiling and hands them out as [`WorkerSlot`]
//! guards; dropping a guard returns the slot to the idle list, where the next
//! [`WorkerSlotPool::try_acquire`] picks it up.
//!
//! The ceiling is the global backstop on in-flight iterations: every executor draws
//! from the same pool, and the pool never blocks. A caller that gets `None` is expected
//! to try again later (or to count the attempt as dropped).
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

/// Per-slot lifecycle hooks, e.g. to set up a script runtime once per slot.
pub trait SlotHooks: Send + Sync {
    /// Called once, the first time slot `index` is created.
    fn init(&self, _index: usize) {}
    /// Called once per created slot when the pool is torn down.
    fn teardown(&self, _index: usize) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SlotHooks for NoopHooks {}

struct SlotState {
    busy: AtomicBool,
    iterations: AtomicU64,
}

struct PoolInner {
    slots: Box<[SlotState]>,
    /// Indexes of created slots that are not handed out.
    idle: Mutex<Vec<usize>>,
    created: AtomicUsize,
    busy: AtomicUsize,
    torn_down: AtomicBool,
    hooks: Arc<dyn SlotHooks>,
}

/// Shared, cloneable handle to the pool.
#[derive(Clone)]
pub struct WorkerSlotPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerSlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSlotPool")
            .field("ceiling", &self.ceiling())
            .field("created", &self.created())
            .field("busy", &self.busy())
            .finish()
    }
}

impl WorkerSlotPool {
    pub fn new(ceiling: usize) -> Self {
        Self::with_hooks(ceiling, 0, Arc::new(NoopHooks))
    }

    /// Creates a pool of at most `ceiling` slots, `preallocate` of which are created
    /// (and initialized) right away.
    pub fn with_hooks(ceiling: usize, preallocate: usize, hooks: Arc<dyn SlotHooks>) -> Self {
        let slots = (0..ceiling)
            .map(|_| SlotState {
                busy: AtomicBool::new(false),
                iterations: AtomicU64::new(0),
            })
            .collect();
        let pool = Self {
            inner: Arc::new(PoolInner {
                slots,
                idle: Mutex::new(Vec::with_capacity(ceiling)),
                created: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                torn_down: AtomicBool::new(false),
                hooks,
            }),
        };

        let preallocate = preallocate.min(ceiling);
        for index in 0..preallocate {
            pool.inner.hooks.init(index);
        }
        pool.inner.created.store(preallocate, Ordering::Release);
        // popped from the back, so slot 0 is handed out first
        pool.inner.idle.lock().extend((0..preallocate).rev());
        tracing::debug!(ceiling, preallocate, "Worker slot pool ready");
        pool
    }

    /// Hands out an idle slot, creating one if the ceiling allows. Never blocks on
    /// availability.
    pub fn try_acquire(&self) -> Option<WorkerSlot> {
        let index = {
            let mut idle = self.inner.idle.lock();
            match idle.pop() {
                Some(index) => index,
                None => {
                    let created = self.inner.created.load(Ordering::Acquire);
                    if created >= self.inner.slots.len() {
                        return None;
                    }
                    // reserve the index while still holding the lock
                    self.inner.created.store(created + 1, Ordering::Release);
                    drop(idle);
                    self.inner.hooks.init(created);
                    created
                }
            }
        };

        let was_busy = self.inner.slots[index].busy.swap(true, Ordering::AcqRel);
        debug_assert!(!was_busy, "slot {index} handed out twice");
        self.inner.busy.fetch_add(1, Ordering::AcqRel);
        Some(WorkerSlot {
            index,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Acquires up to `n` slots, all or nothing.
    pub fn try_acquire_many(&self, n: usize) -> Option<Vec<WorkerSlot>> {
        let mut slots = Vec::with_capacity(n);
        for _ in 0..n {
            // partial grabs go back to the pool when `slots` drops
            slots.push(self.try_acquire()?);
        }
        Some(slots)
    }

    /// Returns a slot to the pool. Same as dropping it.
    pub fn release(&self, slot: WorkerSlot) {
        drop(slot);
    }

    pub fn ceiling(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Acquire)
    }

    pub fn busy(&self) -> usize {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Runs the teardown hook for every slot ever created. Subsequent calls are no-ops.
    pub fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let created = self.created();
        for index in 0..created {
            self.inner.hooks.teardown(index);
        }
        tracing::debug!(created, "Worker slot pool torn down");
    }
}

/// Exclusive handle to one slot. Not `Clone`: a slot has exactly one holder.
pub struct WorkerSlot {
    index: usize,
    pool: Arc<PoolInner>,
}

impl WorkerSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Iterations started on this slot so far, across every executor that held it.
    pub fn iterations(&self) -> u64 {
        self.pool.slots[self.index].iterations.load(Ordering::Acquire)
    }

    /// Bumps the slot's iteration counter, returning the sequence number of the new
    /// iteration.
    pub(crate) fn begin_iteration(&self) -> u64 {
        self.pool.slots[self.index]
            .iterations
            .fetch_add(1, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("index", &self.index)
            .finish()
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.pool.slots[self.index]
            .busy
            .store(false, Ordering::Release);
        self.pool.busy.fetch_sub(1, Ordering::AcqRel);
        self.pool.idle.lock().push(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn hands_out_up_to_ceiling() {
        let pool = WorkerSlotPool::new(3);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        let c = pool.try_acquire().unwrap();

        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.busy(), 3);

        let indexes: HashSet<_> = [a.index(), b.index(), c.index()].into();
        assert_eq!(indexes.len(), 3);

        pool.release(b);
        assert_eq!(pool.busy(), 2);
        let again = pool.try_acquire().unwrap();
        assert_eq!(again.index(), 1);
        drop((a, c, again));
        assert_eq!(pool.busy(), 0);
        assert_eq!(pool.idle(), 3);
    }

    #[test]
    fn grows_lazily() {
        let pool = WorkerSlotPool::with_hooks(10, 2, Arc::new(NoopHooks));
        assert_eq!(pool.created(), 2);

        let slots = pool.try_acquire_many(3).unwrap();
        assert_eq!(pool.created(), 3);
        assert_eq!(slots[0].index(), 0);
        assert_eq!(slots[2].index(), 2);
    }

    #[test]
    fn acquire_many_is_all_or_nothing() {
        let pool = WorkerSlotPool::new(4);
        let held = pool.try_acquire().unwrap();

        assert!(pool.try_acquire_many(4).is_none());
        assert_eq!(pool.busy(), 1);
        drop(held);
        assert_eq!(pool.try_acquire_many(4).unwrap().len(), 4);
    }

    #[test]
    fn iteration_counter_survives_release() {
        let pool = WorkerSlotPool::new(1);
        let slot = pool.try_acquire().unwrap();
        assert_eq!(slot.begin_iteration(), 0);
        assert_eq!(slot.begin_iteration(), 1);
        drop(slot);

        let slot = pool.try_acquire().unwrap();
        assert_eq!(slot.iterations(), 2);
    }

    #[derive(Default)]
    struct Recording {
        init: Mutex<Vec<usize>>,
        teardown: Mutex<Vec<usize>>,
    }

    impl SlotHooks for Recording {
        fn init(&self, index: usize) {
            self.init.lock().push(index);
        }
        fn teardown(&self, index: usize) {
            self.teardown.lock().push(index);
        }
    }

    #[test]
    fn hooks_run_once_per_slot() {
        let hooks = Arc::new(Recording::default());
        let pool = WorkerSlotPool::with_hooks(5, 2, hooks.clone());
        let held = pool.try_acquire_many(3).unwrap();
        drop(held);
        let _again = pool.try_acquire_many(3).unwrap();

        pool.teardown();
        pool.teardown();

        assert_eq!(*hooks.init.lock(), vec![0, 1, 2]);
        assert_eq!(*hooks.teardown.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn concurrent_acquirers_never_share_a_slot() {
        let ceiling = 8;
        let pool = WorkerSlotPool::new(ceiling);
        let holders: Arc<Vec<AtomicBool>> =
            Arc::new((0..ceiling).map(|_| AtomicBool::new(false)).collect());
        let peak = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                let holders = holders.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        if let Some(slot) = pool.try_acquire() {
                            let taken = holders[slot.index()].swap(true, Ordering::SeqCst);
                            assert!(!taken, "slot {} shared", slot.index());
                            peak.fetch_max(pool.busy(), Ordering::SeqCst);
                            std::thread::yield_now();
                            holders[slot.index()].store(false, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= ceiling);
        assert_eq!(pool.busy(), 0);
        assert_eq!(pool.idle(), pool.created());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn busy_never_exceeds_ceiling(
                ceiling in 1usize..16,
                ops in prop::collection::vec(any::<bool>(), 1..200),
            ) {
                let pool = WorkerSlotPool::new(ceiling);
                let mut held: Vec<WorkerSlot> = Vec::new();
                for acquire in ops {
                    if acquire {
                        match pool.try_acquire() {
                            Some(slot) => {
                                prop_assert!(held.iter().all(|h| h.index() != slot.index()));
                                held.push(slot);
                            }
                            None => prop_assert_eq!(held.len(), ceiling),
                        }
                    } else if !held.is_empty() {
                        held.swap_remove(0);
                    }
                    prop_assert!(pool.busy() <= ceiling);
                    prop_assert_eq!(pool.busy(), held.len());
                }
            }
        }
    }
}
