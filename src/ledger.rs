//! Bookkeeping of in-flight requests for one device.
//!
//! Every request is tracked from registration until it is retired. A request
//! is `Pending` until its PDU has been handed to the transport and `Sent`
//! afterwards; replies are only matched against sent requests. Each tracked
//! request is completed exactly once, either by [`Ledger::retire`] or by one
//! of the cancellation paths, and the completion always runs without the
//! ledger lock held.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    proto::{Direction, SeqNum},
    urb::{Completed, Completion, RequestKind, TrackedRequest, TransferError},
};

const COUNTER_MASK: u32 = u32::MAX >> 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger is closed, the device is going away")]
    Closed,
    #[error("no sequence numbers left")]
    Exhausted,
    #[error("request {0} is not tracked")]
    NotFound(SeqNum),
    #[error("request {0} has already been sent")]
    AlreadySent(SeqNum),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Sent,
}

#[derive(Debug)]
pub struct PendingRequest {
    seqnum: SeqNum,
    state: RequestState,
    cancelable: bool,
    request: TrackedRequest,
    completion: Completion,
}

impl PendingRequest {
    pub fn seqnum(&self) -> SeqNum {
        self.seqnum
    }

    pub fn direction(&self) -> Direction {
        self.seqnum.direction()
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn kind(&self) -> RequestKind {
        self.request.kind()
    }

    pub fn request(&self) -> &TrackedRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut TrackedRequest {
        &mut self.request
    }

    fn complete(self, result: Result<(), TransferError>) {
        let Self {
            seqnum,
            request,
            completion,
            ..
        } = self;

        completion.deliver(Completed {
            seqnum,
            request,
            result,
        });
    }

    fn fail(mut self, error: TransferError) {
        if let TrackedRequest::Transfer(request) = &mut self.request {
            request.set_status(error.status());
        }

        self.complete(Err(error));
    }
}

/// One entry of [`Ledger::entries`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct LedgerEntry {
    pub seqnum: SeqNum,
    pub kind: RequestKind,
    pub state: RequestState,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<SeqNum, PendingRequest>,
    counter: u32,
    closed: bool,
}

impl Inner {
    /// Next free number, skipping zero and numbers still in use after the
    /// counter wrapped
    fn next_seqnum(&mut self, direction: Direction) -> Result<SeqNum, LedgerError> {
        for _ in 0..=COUNTER_MASK {
            self.counter = self.counter.wrapping_add(1) & COUNTER_MASK;

            let seqnum = SeqNum::new(self.counter, direction);

            if seqnum.is_valid() && !self.entries.contains_key(&seqnum) {
                return Ok(seqnum);
            }
        }

        Err(LedgerError::Exhausted)
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    inner: Mutex<Inner>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // completions never run under the lock, so a poisoned ledger is
        // still consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking a request and assigns its sequence number
    pub fn register(
        &self,
        request: TrackedRequest,
        direction: Direction,
        completion: Completion,
    ) -> Result<SeqNum, LedgerError> {
        let mut inner = self.lock();

        if inner.closed {
            return Err(LedgerError::Closed);
        }

        let seqnum = inner.next_seqnum(direction)?;
        let cancelable = !matches!(request, TrackedRequest::Unlink { .. });

        tracing::trace!(%seqnum, kind = ?request.kind(), "registered request");

        inner.entries.insert(
            seqnum,
            PendingRequest {
                seqnum,
                state: RequestState::Pending,
                cancelable,
                request,
                completion,
            },
        );

        Ok(seqnum)
    }

    /// Marks a request as handed to the transport
    pub fn mark_sent(&self, seqnum: SeqNum) -> Result<(), LedgerError> {
        let mut inner = self.lock();

        let entry = inner
            .entries
            .get_mut(&seqnum)
            .ok_or(LedgerError::NotFound(seqnum))?;

        if entry.state == RequestState::Sent {
            return Err(LedgerError::AlreadySent(seqnum));
        }

        entry.state = RequestState::Sent;

        Ok(())
    }

    /// Detaches the sent request a reply belongs to. The caller owns it from
    /// here on and must hand it to [`Ledger::retire`].
    pub fn find_sent(&self, seqnum: SeqNum) -> Option<PendingRequest> {
        let mut inner = self.lock();

        match inner.entries.get(&seqnum).map(|e| e.state) {
            Some(RequestState::Sent) => inner.entries.remove(&seqnum),
            Some(RequestState::Pending) => {
                tracing::warn!(%seqnum, "reply for a request that was never sent");
                None
            }
            None => None,
        }
    }

    /// Completes a request obtained from [`Ledger::find_sent`]
    pub fn retire(&self, request: PendingRequest, result: Result<(), TransferError>) {
        debug_assert!(
            !self.lock().entries.contains_key(&request.seqnum),
            "retired request {} is still tracked",
            request.seqnum
        );

        tracing::trace!(seqnum = %request.seqnum, ok = result.is_ok(), "retiring request");

        request.complete(result);
    }

    /// Cancels a request and completes it with [`TransferError::Canceled`].
    ///
    /// Returns the state it was in, or `None` if it is not tracked or cannot
    /// be canceled. A `Sent` request may still get a reply, which will then
    /// find nothing to match.
    pub fn cancel(&self, seqnum: SeqNum) -> Option<RequestState> {
        let entry = {
            let mut inner = self.lock();

            if !inner.entries.get(&seqnum).is_some_and(|e| e.cancelable) {
                return None;
            }

            inner.entries.remove(&seqnum)?
        };

        let state = entry.state;

        tracing::debug!(%seqnum, ?state, "request canceled");

        entry.fail(TransferError::Canceled);

        Some(state)
    }

    /// Removes a request in any state and fails it with `error`
    pub fn abort(&self, seqnum: SeqNum, error: TransferError) -> bool {
        let Some(entry) = self.lock().entries.remove(&seqnum) else {
            return false;
        };

        entry.fail(error);

        true
    }

    /// Closes the ledger and fails everything still tracked with
    /// [`TransferError::DeviceGone`]. Returns the number of requests failed.
    pub fn drain(&self) -> usize {
        let entries = {
            let mut inner = self.lock();
            inner.closed = true;
            core::mem::take(&mut inner.entries)
        };

        let count = entries.len();

        if count > 0 {
            tracing::debug!(count, "draining in-flight requests");
        }

        for entry in entries.into_values() {
            entry.fail(TransferError::DeviceGone);
        }

        count
    }

    /// Accepts registrations again after [`Ledger::drain`]
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, seqnum: SeqNum) -> bool {
        self.lock().entries.contains_key(&seqnum)
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.lock()
            .entries
            .values()
            .map(|e| LedgerEntry {
                seqnum: e.seqnum,
                kind: e.kind(),
                state: e.state,
            })
            .collect()
    }

    #[cfg(test)]
    fn with_counter(counter: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                counter,
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{
        status::UsbdStatus,
        urb::{ResetPipe, TransferRequest},
    };

    fn reset_pipe() -> TrackedRequest {
        TrackedRequest::Transfer(TransferRequest::ResetPipe(ResetPipe {
            endpoint_address: 0x81,
            status: UsbdStatus::Success,
        }))
    }

    #[test]
    fn seqnums_are_unique_and_tagged() {
        let ledger = Ledger::new();

        let a = ledger
            .register(reset_pipe(), Direction::In, Completion::none())
            .unwrap();
        let b = ledger
            .register(reset_pipe(), Direction::Out, Completion::none())
            .unwrap();

        assert_ne!(a, b);
        assert!(a.is_valid() && b.is_valid());
        assert_eq!(a.direction(), Direction::In);
        assert_eq!(b.direction(), Direction::Out);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn counter_wrap_skips_zero_and_live_numbers() {
        let ledger = Ledger::with_counter(COUNTER_MASK - 1);

        let last = ledger
            .register(reset_pipe(), Direction::Out, Completion::none())
            .unwrap();
        assert_eq!(last.counter(), COUNTER_MASK);

        let first = ledger
            .register(reset_pipe(), Direction::Out, Completion::none())
            .unwrap();
        assert_eq!(first.counter(), 1);

        // push the counter all the way around again
        let ledger = Ledger::with_counter(COUNTER_MASK);
        let live = ledger
            .register(reset_pipe(), Direction::In, Completion::none())
            .unwrap();
        assert_eq!(live.counter(), 1);

        ledger.lock().counter = COUNTER_MASK;
        let next = ledger
            .register(reset_pipe(), Direction::In, Completion::none())
            .unwrap();
        assert_eq!(next.counter(), 2);
    }

    #[test]
    fn only_sent_requests_match_replies() {
        let ledger = Ledger::new();
        let seqnum = ledger
            .register(reset_pipe(), Direction::Out, Completion::none())
            .unwrap();

        assert!(ledger.find_sent(seqnum).is_none());
        assert!(ledger.contains(seqnum));

        ledger.mark_sent(seqnum).unwrap();
        assert_eq!(
            ledger.mark_sent(seqnum),
            Err(LedgerError::AlreadySent(seqnum))
        );

        let entry = ledger.find_sent(seqnum).unwrap();
        assert_eq!(entry.state(), RequestState::Sent);
        assert!(ledger.is_empty());
        assert!(ledger.find_sent(seqnum).is_none());

        let (tx, rx) = mpsc::channel();
        let entry = PendingRequest {
            completion: tx.into(),
            ..entry
        };
        ledger.retire(entry, Ok(()));

        let completed = rx.try_recv().unwrap();
        assert_eq!(completed.seqnum, seqnum);
        assert!(completed.result.is_ok());
    }

    #[test]
    fn cancel_completes_once_with_canceled() {
        let ledger = Ledger::new();
        let (tx, rx) = mpsc::channel();

        let seqnum = ledger
            .register(reset_pipe(), Direction::Out, tx.into())
            .unwrap();

        assert_eq!(ledger.cancel(seqnum), Some(RequestState::Pending));
        assert_eq!(ledger.cancel(seqnum), None);

        let completed = rx.try_recv().unwrap();
        assert_eq!(completed.result, Err(TransferError::Canceled));
        assert_eq!(
            completed.request.as_transfer().map(|r| r.status()),
            Some(UsbdStatus::Canceled)
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unlink_entries_are_not_cancelable() {
        let ledger = Ledger::new();
        let seqnum = ledger
            .register(
                TrackedRequest::Unlink {
                    target: SeqNum::new(5, Direction::In),
                },
                Direction::Out,
                Completion::none(),
            )
            .unwrap();

        assert_eq!(ledger.cancel(seqnum), None);
        assert!(ledger.contains(seqnum));
    }

    #[test]
    fn drain_fails_everything_and_closes() {
        let ledger = Ledger::new();
        let (tx, rx) = mpsc::channel();

        for _ in 0..3 {
            let seqnum = ledger
                .register(reset_pipe(), Direction::In, tx.clone().into())
                .unwrap();
            ledger.mark_sent(seqnum).unwrap();
        }
        ledger
            .register(reset_pipe(), Direction::Out, tx.into())
            .unwrap();

        assert_eq!(ledger.drain(), 4);
        assert!(ledger.is_empty());

        let results: Vec<_> = rx.try_iter().map(|c| c.result).collect();
        assert_eq!(results, vec![Err(TransferError::DeviceGone); 4]);

        assert_eq!(
            ledger.register(reset_pipe(), Direction::Out, Completion::none()),
            Err(LedgerError::Closed)
        );

        ledger.reopen();
        assert!(
            ledger
                .register(reset_pipe(), Direction::Out, Completion::none())
                .is_ok()
        );
    }

    #[test]
    fn abort_removes_pending_and_sent() {
        let ledger = Ledger::new();
        let (tx, rx) = mpsc::channel();

        let seqnum = ledger
            .register(reset_pipe(), Direction::Out, tx.into())
            .unwrap();
        ledger.mark_sent(seqnum).unwrap();

        assert!(ledger.abort(seqnum, TransferError::DeviceGone));
        assert!(!ledger.abort(seqnum, TransferError::DeviceGone));
        assert_eq!(
            rx.try_recv().map(|c| c.result).ok(),
            Some(Err(TransferError::DeviceGone))
        );
    }
}
