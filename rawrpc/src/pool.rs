//! Fixed-capacity object pool.
//!
//! Items are materialised lazily by a factory, up to the capacity, and never
//! freed individually. A rented item is wrapped in [`Pooled`], which hands it
//! back when dropped, so every exit path of an I/O operation returns it.
//!
//! Each materialised item owns a slot index. A slot is either in the free
//! list or checked out by exactly one `Pooled`, never both.

use std::borrow::{Borrow, BorrowMut};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::macros::error;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

pub struct Pool<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    capacity: usize,
    factory: Factory<T>,
    reset: Option<Reset<T>>,
    state: Mutex<State<T>>,
    returned: Condvar,
}

struct State<T> {
    free: Vec<(usize, T)>,
    // indexed by slot, true while checked out
    out: Vec<bool>,
    checked_out: usize,
    disposed: bool,
}

/// Snapshot of the pool accounting.
///
/// `idle + unmaterialised + checked_out == capacity` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub materialised: usize,
    pub idle: usize,
    pub checked_out: usize,
}

impl PoolStats {
    pub fn available(&self) -> usize {
        self.capacity - self.checked_out
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::build(capacity, Box::new(factory), None)
    }

    /// Like `new`, with a hook run on every item when it comes back.
    pub fn with_reset<F, R>(capacity: usize, factory: F, reset: R) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self::build(capacity, Box::new(factory), Some(Box::new(reset)))
    }

    fn build(capacity: usize, factory: Factory<T>, reset: Option<Reset<T>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                factory,
                reset,
                state: Mutex::new(State {
                    free: Vec::with_capacity(capacity),
                    out: Vec::with_capacity(capacity),
                    checked_out: 0,
                    disposed: false,
                }),
                returned: Condvar::new(),
            }),
        }
    }

    /// Materialise up to `n` items ahead of time.
    pub fn prefill(&self, n: usize) {
        let mut state = self.inner.state.lock();
        while state.out.len() < n.min(self.inner.capacity) {
            let slot = state.out.len();
            state.out.push(false);
            let item = (self.inner.factory)();
            state.free.push((slot, item));
        }
    }

    /// Rent one item, or `None` if all are checked out or the pool is disposed.
    pub fn try_rent(&self) -> Option<Pooled<T>> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return None;
        }
        if let Some((slot, item)) = state.free.pop() {
            state.out[slot] = true;
            state.checked_out += 1;
            return Some(self.wrap(slot, item));
        }
        if state.out.len() < self.inner.capacity {
            let slot = state.out.len();
            state.out.push(true);
            state.checked_out += 1;
            drop(state);
            let item = (self.inner.factory)();
            return Some(self.wrap(slot, item));
        }
        None
    }

    /// Rent one item, waiting for a return when exhausted.
    ///
    /// Returns `None` only once the pool is disposed.
    pub fn rent(&self) -> Option<Pooled<T>> {
        loop {
            if let Some(item) = self.try_rent() {
                return Some(item);
            }
            let mut state = self.inner.state.lock();
            if state.disposed {
                return None;
            }
            if state.checked_out == self.inner.capacity {
                self.inner.returned.wait(&mut state);
            }
        }
    }

    /// Rent one item, giving up after `timeout`.
    pub fn rent_timeout(&self, timeout: Duration) -> Option<Pooled<T>> {
        if let Some(item) = self.try_rent() {
            return Some(item);
        }
        let mut state = self.inner.state.lock();
        if !state.disposed && state.checked_out == self.inner.capacity {
            self.inner.returned.wait_for(&mut state, timeout);
        }
        drop(state);
        self.try_rent()
    }

    /// Hand an item back explicitly.
    ///
    /// Dropping the `Pooled` does the same. Giving back an item rented from
    /// another pool is a caller bug.
    pub fn give_back(&self, item: Pooled<T>) {
        if !Arc::ptr_eq(&self.inner, &item.pool) {
            debug_assert!(false, "item returned to a foreign pool");
            error!("pool: item returned to a foreign pool, routing to its owner");
        }
        drop(item);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            capacity: self.inner.capacity,
            materialised: state.out.len(),
            idle: state.free.len(),
            checked_out: state.checked_out,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Release every idle item and refuse further rents.
    ///
    /// Items still checked out are dropped when they come back. The pool
    /// does not track them beyond that: callers must stop using them.
    pub fn dispose(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            state.disposed = true;
            std::mem::take(&mut state.free)
        };
        drop(idle);
        self.inner.returned.notify_all();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    fn wrap(&self, slot: usize, item: T) -> Pooled<T> {
        Pooled {
            pool: self.inner.clone(),
            slot,
            item: Some(item),
        }
    }
}

impl<T> Inner<T> {
    fn release(&self, slot: usize, mut item: T) {
        if let Some(reset) = &self.reset {
            reset(&mut item);
        }

        let mut state = self.state.lock();
        let checked_out = state.out.get(slot).copied().unwrap_or(false);
        if !checked_out {
            debug_assert!(false, "slot {slot} returned twice");
            error!("pool: slot {} returned twice, discarding", slot);
            return;
        }
        state.out[slot] = false;
        state.checked_out -= 1;
        if !state.disposed {
            state.free.push((slot, item));
        }
        drop(state);
        self.returned.notify_one();
    }
}

/// A rented item. Goes back to its pool on drop.
pub struct Pooled<T> {
    pool: Arc<Inner<T>>,
    slot: usize,
    item: Option<T>,
}

impl<T> Pooled<T> {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // only taken in drop
        self.item.as_ref().unwrap()
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap()
    }
}

impl<T> Borrow<T> for Pooled<T> {
    fn borrow(&self) -> &T {
        self
    }
}

impl<T> BorrowMut<T> for Pooled<T> {
    fn borrow_mut(&mut self) -> &mut T {
        self
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(self.slot, item);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("slot", &self.slot)
            .field("item", &self.item)
            .finish()
    }
}

/// Pool of byte buffers of `size` bytes, shrunk back to `size` on return.
pub fn buffer_pool(capacity: usize, size: usize) -> Pool<Vec<u8>> {
    Pool::with_reset(
        capacity,
        move || vec![0; size],
        move |buf: &mut Vec<u8>| {
            buf.resize(size, 0);
            buf.shrink_to(size);
        },
    )
}

/// Pool of empty byte buffers with `size` bytes reserved, cleared on return.
pub fn send_buffer_pool(capacity: usize, size: usize) -> Pool<Vec<u8>> {
    Pool::with_reset(
        capacity,
        move || Vec::with_capacity(size),
        move |buf: &mut Vec<u8>| {
            buf.clear();
            buf.shrink_to(size);
        },
    )
}
