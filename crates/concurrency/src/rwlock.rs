//! Fair reader/writer lock
//!
//! Multiple readers may hold the lock at once; a writer holds it exclusively.
//! Scheduling is fair with writer preference: once a writer is queued, new
//! readers wait behind it, so a steady stream of readers cannot starve a
//! writer.
//!
//! Holders are tracked by thread id so re-entrant acquisition (including
//! read-to-write upgrade) fails fast with [`LockError::Upgrade`] instead of
//! deadlocking. Guards release on drop and are not transferable across
//! threads.

use crate::error::LockError;
use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

#[derive(Default)]
struct State {
    /// Thread ids of current read holders.
    readers: Vec<ThreadId>,
    /// Current exclusive holder.
    writer: Option<ThreadId>,
    /// Writers waiting for exclusive access. New readers queue behind them.
    queued_writers: usize,
}

struct Shared {
    state: Mutex<State>,
    /// Readers wait here while a writer is active or queued.
    read_ready: Condvar,
    /// Writers wait here for exclusive access.
    write_ready: Condvar,
}

/// Fair multiple-reader/single-writer lock with deadline-aware acquisition.
///
/// The lock is cheaply cloneable; clones share one lock state. Acquisition
/// takes an absolute deadline and fails with [`LockError::Timeout`] when it
/// passes.
#[derive(Clone)]
pub struct FairRwLock {
    shared: Arc<Shared>,
}

impl FairRwLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        FairRwLock {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                read_ready: Condvar::new(),
                write_ready: Condvar::new(),
            }),
        }
    }

    /// Acquire a shared read hold before `deadline`.
    ///
    /// Fails with [`LockError::Upgrade`] if the calling thread already holds
    /// the lock in either mode.
    pub fn read(&self, deadline: Instant) -> Result<ReadGuard, LockError> {
        let me = thread::current().id();
        let mut state = self.shared.state.lock();

        if state.writer == Some(me) || state.readers.contains(&me) {
            return Err(LockError::Upgrade);
        }

        while state.writer.is_some() || state.queued_writers > 0 {
            if self
                .shared
                .read_ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(LockError::Timeout);
            }
        }

        state.readers.push(me);
        Ok(ReadGuard {
            shared: Arc::clone(&self.shared),
            _not_send: PhantomData,
        })
    }

    /// Acquire an exclusive write hold before `deadline`.
    ///
    /// Fails with [`LockError::Upgrade`] if the calling thread already holds
    /// the lock in either mode.
    pub fn write(&self, deadline: Instant) -> Result<WriteGuard, LockError> {
        let me = thread::current().id();
        let mut state = self.shared.state.lock();

        if state.writer == Some(me) || state.readers.contains(&me) {
            return Err(LockError::Upgrade);
        }

        state.queued_writers += 1;
        while state.writer.is_some() || !state.readers.is_empty() {
            if self
                .shared
                .write_ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                state.queued_writers -= 1;
                if state.queued_writers == 0 {
                    // Readers queued behind us may now proceed.
                    self.shared.read_ready.notify_all();
                }
                return Err(LockError::Timeout);
            }
        }
        state.queued_writers -= 1;
        state.writer = Some(me);

        Ok(WriteGuard {
            shared: Arc::clone(&self.shared),
            _not_send: PhantomData,
        })
    }

    /// Number of current read holders (diagnostics).
    pub fn reader_count(&self) -> usize {
        self.shared.state.lock().readers.len()
    }

    /// Whether a writer currently holds the lock (diagnostics).
    pub fn is_write_locked(&self) -> bool {
        self.shared.state.lock().writer.is_some()
    }
}

impl Default for FairRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FairRwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("FairRwLock")
            .field("readers", &state.readers.len())
            .field("writer", &state.writer.is_some())
            .field("queued_writers", &state.queued_writers)
            .finish()
    }
}

/// Shared read hold; released on drop. Not transferable across threads.
pub struct ReadGuard {
    shared: Arc<Shared>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let me = thread::current().id();
        let mut state = self.shared.state.lock();
        if let Some(pos) = state.readers.iter().position(|&id| id == me) {
            state.readers.swap_remove(pos);
        }
        if state.readers.is_empty() && state.queued_writers > 0 {
            self.shared.write_ready.notify_one();
        }
    }
}

/// Exclusive write hold; released on drop. Not transferable across threads.
pub struct WriteGuard {
    shared: Arc<Shared>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.writer = None;
        if state.queued_writers > 0 {
            self.shared.write_ready.notify_one();
        } else {
            self.shared.read_ready.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn short() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[test]
    fn test_multiple_readers() {
        let lock = FairRwLock::new();
        let a = lock.read(soon()).unwrap();
        let lock2 = lock.clone();
        let handle = thread::spawn(move || {
            let _b = lock2.read(soon()).unwrap();
            lock2.reader_count()
        });
        assert_eq!(handle.join().unwrap(), 2);
        drop(a);
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = FairRwLock::new();
        let guard = lock.write(soon()).unwrap();
        let lock2 = lock.clone();
        let handle = thread::spawn(move || lock2.read(short()).is_err());
        assert!(handle.join().unwrap());
        drop(guard);
        assert!(lock.read(soon()).is_ok());
    }

    #[test]
    fn test_upgrade_is_rejected() {
        let lock = FairRwLock::new();
        let _read = lock.read(soon()).unwrap();
        assert!(matches!(lock.write(soon()), Err(LockError::Upgrade)));
        assert!(matches!(lock.read(soon()), Err(LockError::Upgrade)));
    }

    #[test]
    fn test_reentrant_write_is_rejected() {
        let lock = FairRwLock::new();
        let _write = lock.write(soon()).unwrap();
        assert!(matches!(lock.write(soon()), Err(LockError::Upgrade)));
        assert!(matches!(lock.read(soon()), Err(LockError::Upgrade)));
    }

    #[test]
    fn test_write_timeout_releases_queue_slot() {
        let lock = FairRwLock::new();
        let read = lock.read(soon()).unwrap();

        let lock2 = lock.clone();
        let writer = thread::spawn(move || lock2.write(short()).is_err());
        assert!(writer.join().unwrap());

        // The timed-out writer must not leave readers blocked.
        let lock3 = lock.clone();
        let reader = thread::spawn(move || lock3.read(soon()).is_ok());
        assert!(reader.join().unwrap());
        drop(read);
    }

    #[test]
    fn test_queued_writer_blocks_new_readers() {
        let lock = FairRwLock::new();
        let read = lock.read(soon()).unwrap();

        let lock2 = lock.clone();
        let writer_in = Arc::new(AtomicBool::new(false));
        let writer_in2 = Arc::clone(&writer_in);
        let writer = thread::spawn(move || {
            let guard = lock2.write(soon()).unwrap();
            writer_in2.store(true, Ordering::SeqCst);
            drop(guard);
        });

        // Give the writer time to queue, then try to read: it must wait
        // behind the queued writer and fail its short deadline.
        thread::sleep(Duration::from_millis(20));
        let lock3 = lock.clone();
        let late_reader = thread::spawn(move || lock3.read(short()).is_err());
        assert!(late_reader.join().unwrap());

        drop(read);
        writer.join().unwrap();
        assert!(writer_in.load(Ordering::SeqCst));
    }

    #[test]
    fn test_writer_not_starved_by_reader_churn() {
        let lock = FairRwLock::new();
        let stop = Arc::new(AtomicBool::new(false));
        let cycles = Arc::new(AtomicUsize::new(0));

        let mut readers = Vec::new();
        for _ in 0..10 {
            let lock = lock.clone();
            let stop = Arc::clone(&stop);
            let cycles = Arc::clone(&cycles);
            readers.push(thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if let Ok(guard) = lock.read(soon()) {
                        cycles.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(200));
                        drop(guard);
                    }
                }
            }));
        }

        // The writer must get through while readers keep churning.
        thread::sleep(Duration::from_millis(10));
        let acquired = lock.write(Instant::now() + Duration::from_secs(2)).is_ok();
        stop.store(true, Ordering::SeqCst);
        for r in readers {
            r.join().unwrap();
        }
        assert!(acquired, "writer starved by reader churn");
    }
}
