//! Timeout dispatcher
//!
//! A single timing thread per dispatcher fires scheduled callbacks in due
//! order. Callbacks decide themselves whether they run again by returning a
//! [`Rearm`] value, which is how re-announcement gets a fresh random
//! interval at every cycle.
//!
//! ## Guarantees
//!
//! - callbacks of one dispatcher never run concurrently with each other
//! - firing order is by due time, ties by insertion order
//! - `add` / `remove` are callable from any thread, including from inside a
//!   firing callback: the internal lock is released while callbacks run
//! - `remove` is idempotent; removing a handle whose callback is currently
//!   running prevents it from being re-armed

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

use crate::error::{Result, SsdpError};

/// What a fired callback wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    /// Fire again after this interval, counted from now
    After(Duration),
    /// Drop the entry
    Cancel,
}

/// Opaque handle of a scheduled callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutHandle(u64);

impl fmt::Display for TimeoutHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timeout#{}", self.0)
    }
}

/// The callback receives the interval it was last armed with.
type Callback = Box<dyn FnMut(Duration) -> Rearm + Send>;

struct Entry {
    due: Instant,
    interval: Duration,
    seq: u64,
    /// `None` while the callback is running on the timing thread
    callback: Option<Callback>,
}

#[derive(Default)]
struct State {
    entries: HashMap<u64, Entry>,
    /// (due, insertion sequence, handle); stale items are skipped lazily
    queue: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    next_handle: u64,
    next_seq: u64,
    disposed: bool,
}

impl State {
    fn push(&mut self, handle: u64, due: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse((due, seq, handle)));
        seq
    }

    fn is_live(&self, handle: u64, seq: u64) -> bool {
        self.entries
            .get(&handle)
            .is_some_and(|e| e.seq == seq && e.callback.is_some())
    }
}

struct Shared {
    name: String,
    state: Mutex<State>,
    wakeup: Condvar,
}

/// Scheduler of delayed / recurring callbacks shared by every announcer or
/// browser of one owner.
pub struct TimeoutDispatcher {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl fmt::Debug for TimeoutDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutDispatcher")
            .field("name", &self.shared.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl TimeoutDispatcher {
    /// Starts the timing thread
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(State::default()),
            wakeup: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("{}-timeouts", shared.name))
            .spawn(move || run(worker))?;
        let thread_id = thread.thread().id();

        debug!(dispatcher = %shared.name, "⏱️ Timeout dispatcher started");

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
            thread_id,
        })
    }

    /// Schedules `callback` to fire no earlier than `now + delay`.
    pub fn add<F>(&self, delay: Duration, callback: F) -> Result<TimeoutHandle>
    where
        F: FnMut(Duration) -> Rearm + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return Err(SsdpError::disposed(format!(
                "dispatcher {}",
                self.shared.name
            )));
        }

        let handle = state.next_handle;
        state.next_handle += 1;

        let due = Instant::now() + delay;
        let seq = state.push(handle, due);
        state.entries.insert(
            handle,
            Entry {
                due,
                interval: delay,
                seq,
                callback: Some(Box::new(callback)),
            },
        );
        drop(state);

        self.shared.wakeup.notify_one();
        trace!(dispatcher = %self.shared.name, handle, ?delay, "timeout scheduled");
        Ok(TimeoutHandle(handle))
    }

    /// Cancels future firings of `handle`. Unknown or already fired handles are ignored.
    pub fn remove(&self, handle: TimeoutHandle) {
        let removed = self.shared.state.lock().entries.remove(&handle.0);
        if removed.is_some() {
            trace!(dispatcher = %self.shared.name, handle = handle.0, "timeout removed");
        }
        // the callback is dropped here, outside the lock
        drop(removed);
    }

    /// True while `handle` is registered (including while its callback runs)
    pub fn is_scheduled(&self, handle: TimeoutHandle) -> bool {
        self.shared.state.lock().entries.contains_key(&handle.0)
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    /// Cancels everything and stops the timing thread. Later `add` calls fail.
    pub fn dispose(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.queue.clear();
            std::mem::take(&mut state.entries)
        };
        self.shared.wakeup.notify_all();
        debug!(
            dispatcher = %self.shared.name,
            cancelled = dropped.len(),
            "⏱️ Timeout dispatcher disposed"
        );
        drop(dropped);

        // disposing from a callback must not join its own thread
        if thread::current().id() != self.thread_id {
            if let Some(thread) = self.thread.lock().take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for TimeoutDispatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let (handle, interval, mut callback) = {
            let mut state = shared.state.lock();
            let handle = loop {
                if state.disposed {
                    return;
                }
                let Some(&Reverse((due, seq, handle))) = state.queue.peek() else {
                    shared.wakeup.wait(&mut state);
                    continue;
                };
                if !state.is_live(handle, seq) {
                    state.queue.pop();
                    continue;
                }
                if due > Instant::now() {
                    shared.wakeup.wait_until(&mut state, due);
                    continue;
                }
                state.queue.pop();
                break handle;
            };

            let Some(entry) = state.entries.get_mut(&handle) else {
                continue;
            };
            let Some(callback) = entry.callback.take() else {
                continue;
            };
            (handle, entry.interval, callback)
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| callback(interval))) {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(
                    dispatcher = %shared.name,
                    handle,
                    "❌ Timeout callback panicked, cancelling it"
                );
                Rearm::Cancel
            }
        };

        let mut state = shared.state.lock();
        let rearm = match outcome {
            Rearm::After(next) if state.entries.contains_key(&handle) => Some(next),
            _ => None,
        };
        match rearm {
            Some(next) => {
                let due = Instant::now() + next;
                let seq = state.push(handle, due);
                if let Some(entry) = state.entries.get_mut(&handle) {
                    entry.due = due;
                    entry.interval = next;
                    entry.seq = seq;
                    entry.callback = Some(callback);
                }
                trace!(dispatcher = %shared.name, handle, ?next, "timeout re-armed");
            }
            None => {
                let entry = state.entries.remove(&handle);
                drop(state);
                drop(entry);
                drop(callback);
            }
        }
    }
}
