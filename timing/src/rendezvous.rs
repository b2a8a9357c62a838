use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Where the execution thread parks while it has nothing useful to do.
///
/// A notify that lands before the wait is not lost: it leaves a pending flag the next wait
/// consumes immediately. Several notifies before a wait collapse into a single wakeup.
#[derive(Default)]
pub struct Rendezvous {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until another thread calls `cpu_thread_notify`
    pub fn cpu_thread_wait(&self) {
        let mut pending = self.lock();
        while !*pending {
            pending = self.condvar.wait(pending).expect("rendezvous poisoned");
        }
        *pending = false;
    }

    /// Like `cpu_thread_wait`, but gives up after `timeout`. Returns true if it was notified.
    pub fn cpu_thread_wait_timeout(&self, timeout: Duration) -> bool {
        let pending = self.lock();
        let (mut pending, _) = self.condvar
            .wait_timeout_while(pending, timeout, |pending| !*pending)
            .expect("rendezvous poisoned");
        let notified = *pending;
        *pending = false;
        notified
    }

    /// Releases the execution thread if it is parked, or the next time it parks
    pub fn cpu_thread_notify(&self) {
        *self.lock() = true;
        self.condvar.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.pending.lock().expect("rendezvous poisoned")
    }
}

/// Remembers which host thread is executing guest code.
///
/// Components use this to assert their callbacks only run where they are allowed to.
#[derive(Default)]
pub struct CpuThread {
    id: Mutex<Option<ThreadId>>,
}

impl CpuThread {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the calling thread as the execution thread
    pub fn bind_current(&self) {
        *self.id.lock().expect("cpu thread poisoned") = Some(thread::current().id());
    }

    pub fn release(&self) {
        *self.id.lock().expect("cpu thread poisoned") = None;
    }

    pub fn is_current(&self) -> bool {
        *self.id.lock().expect("cpu thread poisoned") == Some(thread::current().id())
    }
}
