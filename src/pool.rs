//! A generic pool of reusable resources.
//!
//! Handlers that need per-request resources (scratch buffers, database
//! handles) borrow them here instead of constructing them per request.
//! The pool keeps at least `min_count` resources alive, allocates on
//! demand up to `max_count`, and blocks further `acquire` calls until a
//! borrow returns. Surplus above the floor is handed to an optional
//! recycler hook on release, for resources whose teardown is more than a
//! drop. The pool is an explicitly constructed object shared by
//! reference; nothing here is process-global.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Builds a fresh resource.
pub type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Tears down a surplus resource released above the pool floor.
pub type Recycler<T> = Box<dyn Fn(T) + Send + Sync>;

struct PoolState<T> {
    idle: VecDeque<T>,
    /// Resources currently alive, idle or borrowed.
    allocated: usize,
}

/// A bounded pool of `T` handing out RAII guards.
///
/// # Examples
///
/// ```
/// use erebus::pool::ResourcePool;
///
/// let pool = ResourcePool::new(1, 4, Box::new(Vec::<u8>::new));
/// let mut buf = pool.acquire();
/// buf.extend_from_slice(b"scratch");
/// drop(buf); // returns to the pool
/// ```
pub struct ResourcePool<T> {
    factory: Factory<T>,
    recycler: Option<Recycler<T>>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
    min_count: usize,
    max_count: usize,
}

impl<T> ResourcePool<T> {
    /// Creates a pool holding at least `min_count` and at most `max_count`
    /// resources. `min_count` resources are allocated eagerly; surplus
    /// above the floor is simply dropped on release.
    pub fn new(min_count: usize, max_count: usize, factory: Factory<T>) -> Self {
        Self::build(min_count, max_count, factory, None)
    }

    /// [`new`](Self::new), with a recycler invoked for every surplus
    /// resource released above the pool floor.
    pub fn with_recycler(
        min_count: usize,
        max_count: usize,
        factory: Factory<T>,
        recycler: Recycler<T>,
    ) -> Self {
        Self::build(min_count, max_count, factory, Some(recycler))
    }

    fn build(
        min_count: usize,
        max_count: usize,
        factory: Factory<T>,
        recycler: Option<Recycler<T>>,
    ) -> Self {
        let max_count = max_count.max(min_count).max(1);
        let idle: VecDeque<T> = (0..min_count).map(|_| factory()).collect();
        let allocated = idle.len();
        Self {
            factory,
            recycler,
            state: Mutex::new(PoolState { idle, allocated }),
            available: Condvar::new(),
            min_count,
            max_count,
        }
    }

    /// Borrows a resource, blocking while `max_count` are outstanding.
    pub fn acquire(&self) -> PooledResource<'_, T> {
        let mut state = self.lock_state();
        loop {
            if let Some(res) = state.idle.pop_front() {
                return self.guard(res);
            }
            if state.allocated < self.max_count {
                state.allocated += 1;
                drop(state);
                return self.guard((self.factory)());
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Borrows a resource without blocking.
    ///
    /// Returns `None` when `max_count` resources are already outstanding.
    pub fn try_acquire(&self) -> Option<PooledResource<'_, T>> {
        let mut state = self.lock_state();
        if let Some(res) = state.idle.pop_front() {
            return Some(self.guard(res));
        }
        if state.allocated < self.max_count {
            state.allocated += 1;
            return Some(self.guard((self.factory)()));
        }
        None
    }

    /// Resources currently idle in the pool.
    pub fn free_count(&self) -> usize {
        self.lock_state().idle.len()
    }

    /// Resources currently alive, idle or borrowed.
    pub fn allocated_count(&self) -> usize {
        self.lock_state().allocated
    }

    /// A panicking borrower cannot leave the queue half-mutated, so a
    /// poisoned lock is recovered rather than spread to every later
    /// borrower.
    fn lock_state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn guard(&self, res: T) -> PooledResource<'_, T> {
        PooledResource {
            pool: self,
            res: Some(res),
        }
    }

    fn give_back(&self, res: T) {
        let mut state = self.lock_state();
        if state.idle.len() >= self.min_count {
            // Surplus above the floor is released rather than hoarded.
            state.allocated -= 1;
            drop(state);
            match &self.recycler {
                Some(recycle) => recycle(res),
                None => drop(res),
            }
        } else {
            state.idle.push_back(res);
            drop(state);
        }
        self.available.notify_one();
    }
}

/// An RAII borrow from a [`ResourcePool`]; returns the resource on drop.
pub struct PooledResource<'a, T> {
    pool: &'a ResourcePool<T>,
    res: Option<T>,
}

impl<T> std::ops::Deref for PooledResource<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.res.as_ref().expect("resource present until drop")
    }
}

impl<T> std::ops::DerefMut for PooledResource<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.res.as_mut().expect("resource present until drop")
    }
}

impl<T> Drop for PooledResource<'_, T> {
    fn drop(&mut self) {
        if let Some(res) = self.res.take() {
            self.pool.give_back(res);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Tests eager minimum allocation and the acquire/release cycle.
    #[test]
    fn test_acquire_release() {
        let built = Arc::new(AtomicUsize::new(0));
        let b = built.clone();
        let pool = ResourcePool::new(
            2,
            4,
            Box::new(move || {
                b.fetch_add(1, Ordering::SeqCst);
                String::from("res")
            }),
        );
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(pool.free_count(), 2);

        {
            let one = pool.acquire();
            let _two = pool.acquire();
            assert_eq!(&*one, "res");
            assert_eq!(pool.free_count(), 0);
            assert_eq!(pool.allocated_count(), 2);
        }
        assert_eq!(pool.free_count(), 2);
    }

    /// Tests on-demand growth up to `max_count` and `try_acquire` refusal
    /// beyond it.
    #[test]
    fn test_bounded_growth() {
        let pool = ResourcePool::new(0, 2, Box::new(|| 0u32));
        let a = pool.try_acquire();
        let b = pool.try_acquire();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(pool.try_acquire().is_none());
        drop(a);
        assert!(pool.try_acquire().is_some());
        drop(b);
    }

    /// Tests that a blocked `acquire` wakes when a borrow returns.
    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = Arc::new(ResourcePool::new(0, 1, Box::new(|| ())));
        let held = pool.acquire();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let _res = pool.acquire();
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        drop(held);
        waiter.join().unwrap();
    }

    /// Tests that surplus resources above the floor are dropped on return.
    #[test]
    fn test_surplus_released() {
        let pool = ResourcePool::new(1, 8, Box::new(|| vec![0u8; 16]));
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert_eq!(pool.allocated_count(), 3);
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.allocated_count(), 1);
    }

    /// Tests that the recycler hook sees every surplus resource, and only
    /// surplus: returns that refill the floor bypass it.
    #[test]
    fn test_recycler_sees_surplus_only() {
        let recycled = Arc::new(AtomicUsize::new(0));
        let r = recycled.clone();
        let pool = ResourcePool::with_recycler(
            1,
            8,
            Box::new(|| String::from("res")),
            Box::new(move |res| {
                assert_eq!(res, "res");
                r.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        drop(a); // refills the floor; not recycled
        assert_eq!(recycled.load(Ordering::SeqCst), 0);
        drop(b); // surplus
        drop(c); // surplus
        assert_eq!(recycled.load(Ordering::SeqCst), 2);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.allocated_count(), 1);
    }
}
