use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::wire::envelope::Response;

use super::DispatchError;

pub(crate) type Outcome = Result<Response, DispatchError>;

#[derive(Default)]
struct Entries {
    waiting: HashMap<u64, SyncSender<Outcome>>,
    closed: bool,
}

/// Requests awaiting a response on one connection, keyed by sequence number.
///
/// Each entry is a one-slot channel. Whoever removes the entry under the lock
/// owns the single resolution, so a waiter is woken exactly once whether the
/// response, a connection failure, or its own deadline wins. Once
/// `fail_all` has run the table stays closed and refuses registrations.
#[derive(Default)]
pub(crate) struct OutstandingTable {
    entries: Mutex<Entries>,
}

impl OutstandingTable {
    fn entries(&self) -> MutexGuard<'_, Entries> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns `None` when the connection is already being torn down.
    pub(crate) fn register(&self, sequence: u64) -> Option<Receiver<Outcome>> {
        let mut entries = self.entries();
        if entries.closed {
            return None;
        }
        let (tx, rx) = sync_channel(1);
        entries.waiting.insert(sequence, tx);
        Some(rx)
    }

    /// Drops a registration whose request never made it onto the wire.
    pub(crate) fn cancel(&self, sequence: u64) -> bool {
        self.entries().waiting.remove(&sequence).is_some()
    }

    /// Returns false when nobody is waiting for `sequence` any more.
    pub(crate) fn resolve(&self, sequence: u64, outcome: Outcome) -> bool {
        let mut entries = self.entries();
        match entries.waiting.remove(&sequence) {
            Some(slot) => {
                let _ = slot.try_send(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn fail_all(&self, error: impl Fn(u64) -> DispatchError) -> usize {
        let mut entries = self.entries();
        entries.closed = true;
        let failed = entries.waiting.len();
        for (sequence, slot) in entries.waiting.drain() {
            let _ = slot.try_send(Err(error(sequence)));
        }
        failed
    }

    pub(crate) fn wait(&self, sequence: u64, slot: Receiver<Outcome>, deadline: Instant) -> Outcome {
        let started = Instant::now();
        match slot.recv_timeout(deadline.saturating_duration_since(started)) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if self.entries().waiting.remove(&sequence).is_some() {
                    return Err(DispatchError::Timeout {
                        sequence,
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                // Resolved between the timeout and the lock; the value is already queued.
                slot.recv().unwrap_or(Err(DispatchError::ResolverDropped { sequence }))
            }
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::ResolverDropped { sequence }),
        }
    }

    pub(crate) fn contains(&self, sequence: u64) -> bool {
        self.entries().waiting.contains_key(&sequence)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::transport::DispatchError;
    use crate::wire::envelope::{Request, Response, Routing};

    use super::OutstandingTable;

    fn response(sequence: u64) -> Response {
        let mut request = Request::new(Routing::default(), Vec::new());
        request.sequence = sequence;
        Response::for_request(&request, Vec::new(), false)
    }

    #[test]
    fn resolution_wakes_waiter_and_removes_entry() {
        let table = Arc::new(OutstandingTable::default());
        let slot = table.register(7).expect("table is open");

        let resolver = Arc::clone(&table);
        let handle = thread::spawn(move || resolver.resolve(7, Ok(response(7))));

        let outcome = table.wait(7, slot, Instant::now() + Duration::from_secs(2));
        assert!(handle.join().expect("resolver should not panic"));
        assert_eq!(outcome.expect("response expected").sequence, 7);
        assert_eq!(table.len(), 0);
        assert!(!table.resolve(7, Ok(response(7))), "late resolution must be dropped");
    }

    #[test]
    fn deadline_expiry_times_out_and_clears_entry() {
        let table = OutstandingTable::default();
        let slot = table.register(3).expect("table is open");

        let err = table
            .wait(3, slot, Instant::now() + Duration::from_millis(30))
            .expect_err("silent peer should time out");
        assert!(matches!(err, DispatchError::Timeout { sequence: 3, .. }));
        assert!(!table.contains(3));
    }

    #[test]
    fn fail_all_resolves_every_waiter_once() {
        let table = OutstandingTable::default();
        let first = table.register(1).expect("table is open");
        let second = table.register(2).expect("table is open");

        let failed = table.fail_all(|_| DispatchError::AgentUnavailable {
            connection_id: 9,
            reason: "connection lost".to_owned(),
        });
        assert_eq!(failed, 2);

        let deadline = Instant::now() + Duration::from_millis(100);
        for (sequence, slot) in [(1, first), (2, second)] {
            assert!(matches!(
                table.wait(sequence, slot, deadline),
                Err(DispatchError::AgentUnavailable { .. })
            ));
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn registration_after_fail_all_is_refused() {
        let table = OutstandingTable::default();
        let failed = table.fail_all(|_| DispatchError::AgentUnavailable {
            connection_id: 4,
            reason: "connection lost".to_owned(),
        });

        assert_eq!(failed, 0);
        assert!(table.register(1).is_none());
        assert!(!table.contains(1));
        assert_eq!(table.len(), 0);
    }
}
