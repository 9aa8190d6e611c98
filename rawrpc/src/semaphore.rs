//! Counting semaphore bounding the number of live connections.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    released: Condvar,
    max: usize,
}

struct State {
    permits: usize,
    closed: bool,
}

/// One unit of the semaphore. Released on drop.
pub struct Permit {
    inner: Arc<Inner>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    permits,
                    closed: false,
                }),
                released: Condvar::new(),
                max: permits,
            }),
        }
    }

    /// Wait for a permit. `None` once the semaphore is closed.
    pub fn acquire(&self) -> Option<Permit> {
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if state.permits > 0 {
                state.permits -= 1;
                return Some(self.permit());
            }
            self.inner.released.wait(&mut state);
        }
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.inner.state.lock();
        if state.closed || state.permits == 0 {
            return None;
        }
        state.permits -= 1;
        Some(self.permit())
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> Option<Permit> {
        let mut state = self.inner.state.lock();
        if state.permits == 0 && !state.closed {
            self.inner.released.wait_for(&mut state, timeout);
        }
        if state.closed || state.permits == 0 {
            return None;
        }
        state.permits -= 1;
        Some(self.permit())
    }

    /// Wake every waiter and refuse further acquisitions.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.released.notify_all();
    }

    pub fn available(&self) -> usize {
        self.inner.state.lock().permits
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    fn permit(&self) -> Permit {
        Permit {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.permits += 1;
        debug_assert!(state.permits <= self.inner.max);
        drop(state);
        self.inner.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn permits_are_bounded() {
        let sem = Semaphore::new(2);
        let a = sem.try_acquire().unwrap();
        let _b = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());
        assert_eq!(sem.available(), 0);

        drop(a);
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire().is_some());
    }

    #[test]
    fn acquire_blocks_until_release() {
        let sem = Semaphore::new(1);
        let held = sem.acquire().unwrap();

        let s = sem.clone();
        let waiter = thread::spawn(move || s.acquire().is_some());
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn close_wakes_waiters() {
        let sem = Semaphore::new(1);
        let _held = sem.acquire().unwrap();

        let s = sem.clone();
        let waiter = thread::spawn(move || s.acquire().is_none());
        thread::sleep(Duration::from_millis(20));
        sem.close();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn acquire_timeout_expires() {
        let sem = Semaphore::new(1);
        let _held = sem.acquire().unwrap();
        assert!(sem.acquire_timeout(Duration::from_millis(20)).is_none());
    }
}
