//! Pending-request correlation table.
//!
//! The generic mechanism every resource connector uses to turn "send a
//! request, later receive an asynchronous reply on some other thread"
//! into "observe a [`Completion`]": register the request id with the
//! completion before sending, resolve it from the reply path when the
//! answer arrives.
//!
//! A request id is registered at most once while pending. Resolving or
//! cancelling removes it. An unknown id on resolve or cancel is a loud
//! error (an unmatched reply is a protocol violation, not something to
//! drop silently) with one deliberate exception: an id that was
//! *explicitly cancelled* leaves a tombstone, and its late reply resolves
//! as a benign [`Resolution::Superseded`] no-op.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use stratus_core::Fault;
use stratus_dispatch::Completion;

/// Errors reported by the correlation table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PendingError {
    /// The request id is already registered.
    #[error("request id already registered")]
    Duplicate,

    /// No pending entry (and no cancellation tombstone) for the id.
    #[error("unknown request id")]
    Unknown,

    /// The table was closed by `cancel_all`; the session is gone.
    #[error("correlation table closed")]
    Closed,
}

/// How a resolve call landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The completion was resolved and handed to its waiters.
    Delivered,

    /// The id was explicitly cancelled earlier; the reply was discarded
    /// as a benign no-op and the tombstone cleared.
    Superseded,
}

enum Slot<T> {
    Waiting(Completion<T>),
    Cancelled,
}

struct TableState<K, T> {
    entries: HashMap<K, Slot<T>>,
    waiting: usize,
    closed: bool,
}

/// Concurrent map from request id to the completion awaiting its reply.
///
/// Register and cancel-all synchronize on the same lock, so no entry
/// registered during session teardown is left dangling: once the table
/// closes, registration fails and the caller fails its completion
/// instead.
pub struct PendingTable<K, T> {
    state: Mutex<TableState<K, T>>,
    idle: Condvar,
}

impl<K, T> Default for PendingTable<K, T>
where
    K: Eq + Hash + Clone,
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> PendingTable<K, T>
where
    K: Eq + Hash + Clone,
    T: Send + Sync + 'static,
{
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                entries: HashMap::new(),
                waiting: 0,
                closed: false,
            }),
            idle: Condvar::new(),
        }
    }

    /// Register a completion under `key` before sending the request.
    ///
    /// # Errors
    ///
    /// [`PendingError::Duplicate`] if the key is pending or tombstoned,
    /// [`PendingError::Closed`] once `cancel_all` has torn the table
    /// down.
    pub fn register(&self, key: K, completion: Completion<T>) -> Result<(), PendingError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PendingError::Closed);
        }
        if state.entries.contains_key(&key) {
            return Err(PendingError::Duplicate);
        }
        state.entries.insert(key, Slot::Waiting(completion));
        state.waiting += 1;
        Ok(())
    }

    /// Resolve the entry for `key` with a success value.
    ///
    /// # Errors
    ///
    /// [`PendingError::Unknown`] if nothing is registered under the key:
    /// the reply matched no outstanding request.
    pub fn resolve_success(&self, key: &K, value: T) -> Result<Resolution, PendingError> {
        match self.take(key)? {
            Some(completion) => {
                completion.resolve(value);
                Ok(Resolution::Delivered)
            }
            None => Ok(Resolution::Superseded),
        }
    }

    /// Resolve the entry for `key` with a fault.
    ///
    /// # Errors
    ///
    /// [`PendingError::Unknown`] if nothing is registered under the key.
    pub fn resolve_failure(&self, key: &K, fault: Fault) -> Result<Resolution, PendingError> {
        match self.take(key)? {
            Some(completion) => {
                completion.fail(fault);
                Ok(Resolution::Delivered)
            }
            None => Ok(Resolution::Superseded),
        }
    }

    /// Remove the slot for `key`; `None` means it was a tombstone.
    fn take(&self, key: &K) -> Result<Option<Completion<T>>, PendingError> {
        let (slot, empty) = {
            let mut state = self.state.lock();
            let slot = state.entries.remove(key).ok_or(PendingError::Unknown)?;
            if matches!(slot, Slot::Waiting(_)) {
                state.waiting -= 1;
            }
            (slot, state.waiting == 0)
        };
        if empty {
            self.idle.notify_all();
        }
        match slot {
            Slot::Waiting(completion) => Ok(Some(completion)),
            Slot::Cancelled => Ok(None),
        }
    }

    /// Cancel one pending request, failing its completion with
    /// [`Fault::Cancelled`] and leaving a tombstone so the late reply is
    /// ignored.
    ///
    /// # Errors
    ///
    /// [`PendingError::Unknown`] if the key is absent or already
    /// resolved/cancelled; reported to the caller, never a crash.
    pub fn cancel(&self, key: &K) -> Result<(), PendingError> {
        let (completion, empty) = {
            let mut state = self.state.lock();
            match state.entries.get_mut(key) {
                Some(slot @ Slot::Waiting(_)) => {
                    let previous = std::mem::replace(slot, Slot::Cancelled);
                    state.waiting -= 1;
                    match previous {
                        Slot::Waiting(completion) => (completion, state.waiting == 0),
                        Slot::Cancelled => return Err(PendingError::Unknown),
                    }
                }
                Some(Slot::Cancelled) | None => return Err(PendingError::Unknown),
            }
        };
        completion.fail(Fault::Cancelled);
        if empty {
            self.idle.notify_all();
        }
        Ok(())
    }

    /// Cancel every pending request and close the table.
    ///
    /// Used on session loss. Atomic with respect to `register`: entries
    /// registered after this call fail with [`PendingError::Closed`]
    /// instead of dangling. Leaves the table empty and returns how many
    /// pending requests were failed.
    pub fn cancel_all(&self, fault: Fault) -> usize {
        let completions: Vec<Completion<T>> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.waiting = 0;
            state
                .entries
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Waiting(completion) => Some(completion),
                    Slot::Cancelled => None,
                })
                .collect()
        };
        self.idle.notify_all();
        let count = completions.len();
        for completion in completions {
            completion.fail(fault.clone());
        }
        count
    }

    /// Number of requests currently awaiting replies.
    pub fn len(&self) -> usize {
        self.state.lock().waiting
    }

    /// Whether no requests are awaiting replies.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until no requests are pending, or the timeout elapses.
    ///
    /// Returns whether the table went idle in time.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.waiting > 0 {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return state.waiting == 0;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve_success() {
        let table: PendingTable<u64, u32> = PendingTable::new();
        let completion = Completion::new();
        table.register(1, completion.clone()).expect("register");
        assert_eq!(table.len(), 1);

        let resolution = table.resolve_success(&1, 7).expect("resolve");
        assert_eq!(resolution, Resolution::Delivered);
        assert_eq!(completion.value(), Some(7));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let table: PendingTable<u64, u32> = PendingTable::new();
        table.register(1, Completion::new()).expect("register");
        assert_eq!(
            table.register(1, Completion::new()),
            Err(PendingError::Duplicate)
        );
    }

    #[test]
    fn test_second_resolve_fails_loudly() {
        let table: PendingTable<u64, u32> = PendingTable::new();
        let completion = Completion::new();
        table.register(1, completion.clone()).expect("register");
        table.resolve_success(&1, 7).expect("first resolve");

        assert_eq!(table.resolve_success(&1, 8), Err(PendingError::Unknown));
        assert_eq!(
            table.resolve_failure(&1, Fault::Cancelled),
            Err(PendingError::Unknown)
        );
        assert_eq!(completion.value(), Some(7));
    }

    #[test]
    fn test_resolve_failure_carries_fault() {
        let table: PendingTable<u64, u32> = PendingTable::new();
        let completion = Completion::new();
        table.register(9, completion.clone()).expect("register");

        table
            .resolve_failure(&9, Fault::remote("peer refused"))
            .expect("resolve failure");
        assert_eq!(completion.fault(), Some(Fault::remote("peer refused")));
    }

    #[test]
    fn test_cancel_fails_completion_and_tombstones() {
        let table: PendingTable<u64, u32> = PendingTable::new();
        let completion = Completion::new();
        table.register(3, completion.clone()).expect("register");

        table.cancel(&3).expect("cancel");
        assert_eq!(completion.fault(), Some(Fault::Cancelled));
        assert!(table.is_empty());

        // Late reply for a cancelled id is a benign no-op.
        assert_eq!(
            table.resolve_success(&3, 1).expect("late reply"),
            Resolution::Superseded
        );
        // The tombstone is gone after the first reply.
        assert_eq!(table.resolve_success(&3, 1), Err(PendingError::Unknown));
    }

    #[test]
    fn test_cancel_unknown_id_is_an_error() {
        let table: PendingTable<u64, u32> = PendingTable::new();
        assert_eq!(table.cancel(&42), Err(PendingError::Unknown));
    }

    #[test]
    fn test_cancel_all_empties_the_table() {
        let table: PendingTable<u64, u32> = PendingTable::new();
        let completions: Vec<_> = (0..3)
            .map(|key| {
                let completion = Completion::new();
                table.register(key, completion.clone()).expect("register");
                completion
            })
            .collect();

        assert_eq!(table.cancel_all(Fault::Cancelled), 3);
        assert!(table.is_empty());
        for completion in completions {
            assert_eq!(completion.fault(), Some(Fault::Cancelled));
        }
    }

    #[test]
    fn test_register_after_cancel_all_is_refused() {
        let table: PendingTable<u64, u32> = PendingTable::new();
        table.cancel_all(Fault::Cancelled);
        assert_eq!(
            table.register(1, Completion::new()),
            Err(PendingError::Closed)
        );
    }

    #[test]
    fn test_wait_idle() {
        let table: std::sync::Arc<PendingTable<u64, u32>> =
            std::sync::Arc::new(PendingTable::new());
        let completion = Completion::new();
        table.register(1, completion).expect("register");

        assert!(!table.wait_idle(Duration::from_millis(20)));

        let resolver = std::sync::Arc::clone(&table);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            resolver.resolve_success(&1, 0).expect("resolve");
        });
        assert!(table.wait_idle(Duration::from_secs(2)));
        handle.join().expect("resolver thread");
    }
}
