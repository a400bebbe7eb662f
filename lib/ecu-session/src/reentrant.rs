//! A reentrant (recursive) mutex.
//!
//! `§5`: "the source relies on ad-hoc `enter/exit_critical` with nesting via
//! a counter... non-reentrant locks must be used wherever reentrancy is not
//! required, and a dedicated reentrant lock type used only where `§5`
//! requires it." The one place that requires it is session-FSM timer
//! processing calling back into `destroy_session` while already holding the
//! session table's lock.
//!
//! Grounded on the classic recursive-mutex pattern (an owner-thread-id plus
//! a depth counter guarding a condvar), the same shape `pthread_mutex`'s
//! `PTHREAD_MUTEX_RECURSIVE` attribute gives the original source. Unlike a
//! plain `Mutex`, this type hands out only a shared `&T`; mutation of the
//! protected value goes through ordinary `RefCell` borrows with short
//! lifetimes so two nested same-thread acquisitions never alias a `&mut T`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

pub struct ReentrantLock<T> {
    owner: Mutex<Option<ThreadId>>,
    depth: AtomicUsize,
    cond: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for ReentrantLock<T> {}
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    pub fn new(data: T) -> Self {
        ReentrantLock {
            owner: Mutex::new(None),
            depth: AtomicUsize::new(0),
            cond: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock. If the calling thread already holds it, this
    /// succeeds immediately and increments the nesting depth instead of
    /// deadlocking.
    pub fn lock(&self) -> ReentrantGuard<'_, T> {
        let this_thread = std::thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        loop {
            match *owner {
                Some(id) if id == this_thread => break,
                None => {
                    *owner = Some(this_thread);
                    break;
                }
                Some(_) => {
                    owner = self.cond.wait(owner).unwrap();
                }
            }
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
        ReentrantGuard { lock: self }
    }
}

pub struct ReentrantGuard<'a, T> {
    lock: &'a ReentrantLock<T>,
}

impl<'a, T> std::ops::Deref for ReentrantGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: only the thread currently recorded as `owner` ever reaches
        // here, and that thread may hold arbitrarily many nested guards
        // simultaneously, all aliasing as shared references only.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for ReentrantGuard<'a, T> {
    fn drop(&mut self) {
        if self.lock.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            let mut owner = self.lock.owner.lock().unwrap();
            *owner = None;
            self.lock.cond.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::Arc;

    #[test]
    fn same_thread_reentry_does_not_deadlock() {
        let lock = ReentrantLock::new(RefCell::new(0));
        let outer = lock.lock();
        *outer.borrow_mut() += 1;
        {
            let inner = lock.lock();
            *inner.borrow_mut() += 1;
        }
        assert_eq!(*outer.borrow(), 2);
    }

    #[test]
    fn other_thread_blocks_until_released() {
        let lock = Arc::new(ReentrantLock::new(RefCell::new(0)));
        let guard = lock.lock();
        *guard.borrow_mut() = 10;

        let lock2 = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            let g = lock2.lock();
            *g.borrow()
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);
        assert_eq!(handle.join().unwrap(), 10);
    }
}
