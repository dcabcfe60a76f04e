//! Sequence-keyed pending-call table.
//!
//! Three producers race to finish any given call: the response path, the
//! timeout sweep, and the send-failure path. At-most-once completion is
//! structural: removing the entry from the table is the claim, and only the
//! claimant holds the single-shot sender. Enumeration and removal in
//! [`PendingTable::sweep`] happen under one lock acquisition, so the sweep
//! can never return an entry another actor already took.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::wire::Response;

/// Outcome of the send attempt for one call, shared between the send path
/// and the waiter. The waiter uses it to tell a timeout (send succeeded,
/// peer never answered) from a send failure.
#[derive(Debug)]
enum SendOutcome {
    Unknown,
    Succeeded,
    Failed(Option<TransportError>),
}

/// Shared tri-state send result cell.
#[derive(Debug, Clone)]
pub struct SendState(Arc<Mutex<SendOutcome>>);

impl SendState {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(SendOutcome::Unknown)))
    }

    pub fn mark_succeeded(&self) {
        let mut outcome = self.0.lock();
        if matches!(*outcome, SendOutcome::Unknown) {
            *outcome = SendOutcome::Succeeded;
        }
    }

    pub fn mark_failed(&self, error: TransportError) {
        let mut outcome = self.0.lock();
        if !matches!(*outcome, SendOutcome::Failed(_)) {
            *outcome = SendOutcome::Failed(Some(error));
        }
    }

    /// Take the failure cause, if the send failed. Subsequent calls after a
    /// failure yield `TransportError::Closed`.
    pub fn take_failure(&self) -> Option<TransportError> {
        match &mut *self.0.lock() {
            SendOutcome::Failed(cause) => Some(cause.take().unwrap_or(TransportError::Closed)),
            _ => None,
        }
    }
}

impl Default for SendState {
    fn default() -> Self {
        Self::new()
    }
}

/// One outstanding, correlated call.
#[derive(Debug)]
pub struct PendingCall {
    pub seq: u64,
    pub code: i32,
    pub timeout: Duration,
    pub deadline: Instant,
    pub send_state: SendState,
    completion: oneshot::Sender<Option<Response>>,
}

impl PendingCall {
    pub fn new(
        seq: u64,
        code: i32,
        timeout: Duration,
        send_state: SendState,
    ) -> (Self, oneshot::Receiver<Option<Response>>) {
        let (tx, rx) = oneshot::channel();
        let call = Self {
            seq,
            code,
            timeout,
            deadline: Instant::now() + timeout,
            send_state,
            completion: tx,
        };
        (call, rx)
    }

    /// Fire the completion sink. `None` is the no-response sentinel; the
    /// waiter classifies it via the send state.
    pub fn complete(self, response: Option<Response>) {
        if self.completion.send(response).is_err() {
            tracing::debug!(seq = self.seq, "completion receiver already gone");
        }
    }
}

/// Concurrent map of outstanding calls, keyed by sequence.
#[derive(Debug, Default)]
pub struct PendingTable {
    calls: Mutex<HashMap<u64, PendingCall>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic insert-if-absent. A collision returns the new call unchanged;
    /// the existing entry is untouched.
    pub fn insert(&self, call: PendingCall) -> Result<(), PendingCall> {
        match self.calls.lock().entry(call.seq) {
            Entry::Occupied(_) => Err(call),
            Entry::Vacant(slot) => {
                slot.insert(call);
                Ok(())
            }
        }
    }

    /// Atomic take.
    pub fn remove(&self, seq: u64) -> Option<PendingCall> {
        self.calls.lock().remove(&seq)
    }

    /// Remove and return every call whose deadline has passed.
    pub fn sweep(&self, now: Instant) -> Vec<PendingCall> {
        let mut calls = self.calls.lock();
        let expired: Vec<u64> = calls
            .iter()
            .filter(|(_, call)| now >= call.deadline)
            .map(|(seq, _)| *seq)
            .collect();
        expired
            .into_iter()
            .filter_map(|seq| calls.remove(&seq))
            .collect()
    }

    /// Take everything. Shutdown path.
    pub fn drain(&self) -> Vec<PendingCall> {
        self.calls.lock().drain().map(|(_, call)| call).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn call(seq: u64, timeout: Duration) -> (PendingCall, oneshot::Receiver<Option<Response>>) {
        PendingCall::new(seq, 0, timeout, SendState::new())
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let table = PendingTable::new();
        let (first, _rx1) = call(5, Duration::from_secs(1));
        let (second, _rx2) = call(5, Duration::from_secs(1));
        table.insert(first).unwrap();
        let rejected = table.insert(second).unwrap_err();
        assert_eq!(rejected.seq, 5);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_is_a_take() {
        let table = PendingTable::new();
        let (c, _rx) = call(1, Duration::from_secs(1));
        table.insert(c).unwrap();
        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
    }

    #[test]
    fn sweep_returns_only_expired_entries() {
        let table = PendingTable::new();
        let (expired, _rx1) = call(1, Duration::from_millis(0));
        let (alive, _rx2) = call(2, Duration::from_secs(60));
        table.insert(expired).unwrap();
        table.insert(alive).unwrap();

        let swept = table.sweep(Instant::now() + Duration::from_millis(1));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].seq, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn sweep_never_sees_a_removed_entry() {
        let table = PendingTable::new();
        let (c, _rx) = call(3, Duration::from_millis(0));
        table.insert(c).unwrap();
        let taken = table.remove(3).unwrap();
        assert!(table.sweep(Instant::now() + Duration::from_secs(1)).is_empty());
        taken.complete(None);
    }

    #[test]
    fn completion_fires_at_most_once() {
        let (c, mut rx) = call(7, Duration::from_secs(1));
        c.complete(Some(Response {
            sequence: 7,
            code: 0,
            payload: Bytes::new(),
        }));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.unwrap().sequence, 7);
        // The sender is consumed by value; a second completion cannot exist.
    }

    #[test]
    fn send_state_keeps_first_failure() {
        let state = SendState::new();
        state.mark_failed(TransportError::Closed);
        state.mark_succeeded();
        assert!(state.take_failure().is_some());
        // Cause was taken; later reads degrade to Closed.
        assert!(matches!(
            state.take_failure(),
            Some(TransportError::Closed)
        ));
    }

    #[test]
    fn concurrent_remove_race_has_a_single_winner() {
        let table = Arc::new(PendingTable::new());
        for round in 0..100u64 {
            let (c, _rx) = call(round, Duration::from_secs(1));
            table.insert(c).unwrap();
            let a = {
                let table = table.clone();
                std::thread::spawn(move || table.remove(round).is_some())
            };
            let b = {
                let table = table.clone();
                std::thread::spawn(move || table.remove(round).is_some())
            };
            let wins = a.join().unwrap() as u8 + b.join().unwrap() as u8;
            assert_eq!(wins, 1);
        }
    }
}
