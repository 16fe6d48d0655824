// Copyright 2024 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Thread groups and the process-wide shutdown token.

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::mem::drop;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use log::error;

////////////////////////////////////////////////////////////////////////
// THREAD GROUPS                                                      //
////////////////////////////////////////////////////////////////////////

/// A group of threads managed together.
///
/// A `ThreadGroup` manages the creation and operation of a number of
/// long-running pipeline threads. Each thread runs its task once (see
/// [`ThreadGroup::start`]); tasks are expected to loop internally until
/// their input channel closes or the shutdown token fires.
///
/// A `ThreadGroup` may be shut down through [`ThreadGroup::shut_down`].
/// New threads cannot be started in a `ThreadGroup` once shutdown is
/// initiated. [`ThreadGroup::await_shutdown`] can be used to wait for
/// shutdown to complete; this condition requires all threads to have
/// exited, so long-running tasks should check
/// [`ThreadGroup::is_shutting_down`] (or select on the shutdown token)
/// to exit in a timely fashion.
pub struct ThreadGroup {
    records: Mutex<GroupRecords>,

    /// Allows threads to wait for group shutdown events. This is used
    /// with the `records` mutex. All waiting threads are notified when
    /// (1) shutdown is initiated and (2) shutdown is complete.
    shutdown_wakeup: Condvar,
}

/// The internal records of a [`ThreadGroup`].
#[derive(Default)]
struct GroupRecords {
    thread_count: usize,
    shutting_down: bool,
}

impl ThreadGroup {
    /// Creates a new thread group.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(GroupRecords::default()),
            shutdown_wakeup: Condvar::new(),
        })
    }

    /// Starts a thread in the `ThreadGroup`. The thread will execute
    /// `task` once. The task will not be restarted, even if the thread
    /// panics.
    pub fn start<F>(self: &Arc<Self>, name: impl Into<String>, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut records = self.records.lock().unwrap();
        if records.shutting_down {
            Err(Error::ShuttingDown)
        } else {
            start_thread(self.clone(), &mut records, name.into(), task).map_err(Into::into)
        }
    }

    /// Shuts down the `ThreadGroup`.
    pub fn shut_down(&self) {
        let mut records = self.records.lock().unwrap();
        records.shutting_down = true;
        self.shutdown_wakeup.notify_all();
    }

    /// Waits for the `ThreadGroup` to shut down. This is defined as (1)
    /// shutdown having been initiated ([`ThreadGroup::shut_down`]) and
    /// (2) the thread count having dropped to zero. Note that if this
    /// is called from a thread within the group, a deadlock will occur
    /// (since the thread count will never become zero).
    pub fn await_shutdown(&self) {
        let records = self.records.lock().unwrap();
        let _guard = self
            .shutdown_wakeup
            .wait_while(records, |r| !r.shutting_down || r.thread_count > 0)
            .unwrap();
    }

    /// Returns whether the `ThreadGroup` is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.records.lock().unwrap().shutting_down
    }
}

/// A handle owned by a group thread. When dropped (when the thread
/// exits or panics), it will perform necessary clean-up actions (see
/// [`end_thread`]).
struct ThreadHandle {
    group: Arc<ThreadGroup>,
    parent: ThreadId,
}

/// The implementation of thread creation.
fn start_thread<F>(
    group: Arc<ThreadGroup>,
    records: &mut MutexGuard<GroupRecords>,
    name: String,
    task: F,
) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    records.thread_count += 1;
    let handle = ThreadHandle {
        group,
        parent: thread::current().id(),
    };
    let result = thread::Builder::new().name(name).spawn(move || {
        task();
        drop(handle);
    });
    if result.is_err() {
        records.thread_count -= 1;
    }
    result.and(Ok(()))
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        let current_thread = thread::current();

        // If we are being dropped in the parent thread, then the new
        // thread failed to start (on the OS level). In this case,
        // start_thread handles any necessary clean-up. This is
        // important, since otherwise we would be locking the records
        // mutex twice from the same thread!
        if current_thread.id() == self.parent {
            return;
        }

        if thread::panicking() {
            let thread_name = current_thread.name().unwrap_or("anonymous");
            error!("Thread {} panicked", thread_name);
        }

        let mut records = self.group.records.lock().unwrap();
        end_thread(&mut records, &self.group.shutdown_wakeup);
    }
}

/// Performs clean-up actions when a thread exits.
fn end_thread(records: &mut MutexGuard<GroupRecords>, shutdown_wakeup: &Condvar) {
    records.thread_count -= 1;
    if records.shutting_down && records.thread_count == 0 {
        shutdown_wakeup.notify_all();
    }
}

////////////////////////////////////////////////////////////////////////
// SHUTDOWN TOKEN                                                     //
////////////////////////////////////////////////////////////////////////

/// The receiving end of the process-wide shutdown signal.
///
/// The token is a zero-capacity channel that never carries a message;
/// it becomes "ready" (with a disconnection error) the moment the
/// corresponding [`ShutdownTrigger`] is dropped or fired. This makes it
/// usable both in `crossbeam_channel::select!` arms and through
/// [`ShutdownToken::is_cancelled`] polling.
#[derive(Clone)]
pub struct ShutdownToken(Receiver<Infallible>);

/// The firing end of the process-wide shutdown signal. Dropping it (or
/// calling [`ShutdownTrigger::fire`]) cancels every associated
/// [`ShutdownToken`].
pub struct ShutdownTrigger(#[allow(dead_code)] Sender<Infallible>);

/// Creates a connected trigger/token pair.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownToken) {
    let (tx, rx) = bounded(0);
    (ShutdownTrigger(tx), ShutdownToken(rx))
}

impl ShutdownToken {
    /// Returns whether shutdown has been signalled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.0.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Returns the underlying channel receiver, for use in `select!`.
    pub fn receiver(&self) -> &Receiver<Infallible> {
        &self.0
    }
}

impl ShutdownTrigger {
    /// Fires the shutdown signal.
    pub fn fire(self) {
        drop(self);
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for [`ThreadGroup`] operations.
#[derive(Debug)]
pub enum Error {
    /// An OS-level error occurred during the creation of a thread.
    Io(io::Error),

    /// The [`ThreadGroup`] is shutting down.
    ShuttingDown,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::ShuttingDown => f.write_str("thread group is shutting down"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn await_shutdown_works() {
        let exited = Arc::new(Mutex::new(0));
        let group = ThreadGroup::new();
        const SLEEP_DURATION: Duration = Duration::from_millis(100);
        let start = Instant::now();
        for _ in 0..2 {
            let exited_cloned = exited.clone();
            let group_cloned = group.clone();
            group
                .start("test", move || loop {
                    thread::sleep(SLEEP_DURATION);
                    if group_cloned.is_shutting_down() {
                        *exited_cloned.lock().unwrap() += 1;
                        return;
                    }
                })
                .unwrap();
        }
        group.shut_down();
        group.await_shutdown();
        assert!(Instant::now().duration_since(start) > SLEEP_DURATION);
        assert_eq!(*exited.lock().unwrap(), 2);
    }

    #[test]
    fn thread_group_rejects_new_threads_after_shutdown() {
        let group = ThreadGroup::new();
        group.shut_down();
        assert!(matches!(
            group.start("test", || ()),
            Err(Error::ShuttingDown)
        ));
    }

    #[test]
    fn shutdown_token_fires_on_trigger_drop() {
        let (trigger, token) = shutdown_channel();
        let token_cloned = token.clone();
        assert!(!token.is_cancelled());
        trigger.fire();
        assert!(token.is_cancelled());
        assert!(token_cloned.is_cancelled());
    }

    #[test]
    fn shutdown_token_wakes_selects() {
        let (trigger, token) = shutdown_channel();
        let handle = thread::spawn(move || {
            // A recv on the token blocks until the trigger fires, then
            // returns a disconnection error.
            assert!(token.receiver().recv().is_err());
        });
        thread::sleep(Duration::from_millis(50));
        trigger.fire();
        handle.join().unwrap();
    }
}
