//! Racing replies against cancellations: every request completes exactly once.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use rand::seq::SliceRandom;
use usbip::{
    ledger::Ledger,
    proto::{Direction, SeqNum},
    status::{TransferFlags, UsbdStatus},
    urb::{
        BulkOrInterruptTransfer, Completion, TrackedRequest, TransferBuffer, TransferError,
        TransferRequest,
    },
};

const REQUESTS: usize = 10_000;
const THREADS: usize = 8;

#[derive(Debug, Clone, Copy)]
enum Op {
    Reply(SeqNum),
    Cancel(SeqNum),
}

fn request(i: usize) -> TrackedRequest {
    TrackedRequest::Transfer(TransferRequest::BulkOrInterrupt(BulkOrInterruptTransfer {
        endpoint_address: if i % 2 == 0 { 0x81 } else { 0x02 },
        flags: TransferFlags::empty(),
        buffer: TransferBuffer::for_read(4),
        status: UsbdStatus::Pending,
    }))
}

#[test]
fn every_request_completes_exactly_once() {
    let ledger = Arc::new(Ledger::new());
    let completions: Arc<Vec<AtomicUsize>> =
        Arc::new((0..REQUESTS).map(|_| AtomicUsize::new(0)).collect());
    let canceled = Arc::new(AtomicUsize::new(0));

    let mut ops = Vec::with_capacity(REQUESTS * 2);

    for i in 0..REQUESTS {
        let direction = if i % 2 == 0 { Direction::In } else { Direction::Out };

        let completion = {
            let completions = Arc::clone(&completions);
            let canceled = Arc::clone(&canceled);

            Completion::new(move |completed| {
                completions[i].fetch_add(1, Ordering::SeqCst);

                if completed.result == Err(TransferError::Canceled) {
                    canceled.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let seqnum = ledger.register(request(i), direction, completion).unwrap();
        assert_eq!(seqnum.direction(), direction);

        // a third of the requests never reach the wire
        if i % 3 != 0 {
            ledger.mark_sent(seqnum).unwrap();
        }

        ops.push(Op::Reply(seqnum));
        ops.push(Op::Cancel(seqnum));
    }

    assert_eq!(ledger.len(), REQUESTS);

    ops.shuffle(&mut rand::rng());

    let chunk = ops.len().div_ceil(THREADS);
    let workers: Vec<_> = ops
        .chunks(chunk)
        .map(|ops| {
            let ops = ops.to_vec();
            let ledger = Arc::clone(&ledger);

            thread::spawn(move || {
                for op in ops {
                    match op {
                        Op::Reply(seqnum) => {
                            if let Some(entry) = ledger.find_sent(seqnum) {
                                ledger.retire(entry, Ok(()));
                            }
                        }
                        Op::Cancel(seqnum) => {
                            ledger.cancel(seqnum);
                        }
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    // requests that were never sent can only be canceled
    let stuck = (0..REQUESTS).filter(|i| i % 3 == 0).count();

    assert!(ledger.is_empty());
    assert!(
        completions
            .iter()
            .all(|count| count.load(Ordering::SeqCst) == 1)
    );
    assert!(canceled.load(Ordering::SeqCst) >= stuck);
}

#[test]
fn drain_races_with_replies() {
    let ledger = Arc::new(Ledger::new());
    let completed = Arc::new(AtomicUsize::new(0));

    let seqnums: Vec<_> = (0..REQUESTS)
        .map(|i| {
            let completed = Arc::clone(&completed);
            let seqnum = ledger
                .register(
                    request(i),
                    Direction::In,
                    Completion::new(move |_| {
                        completed.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
            ledger.mark_sent(seqnum).unwrap();
            seqnum
        })
        .collect();

    let replier = {
        let ledger = Arc::clone(&ledger);

        thread::spawn(move || {
            for seqnum in seqnums {
                if let Some(entry) = ledger.find_sent(seqnum) {
                    ledger.retire(entry, Ok(()));
                }
            }
        })
    };

    let drained = ledger.drain();
    replier.join().unwrap();

    assert!(drained <= REQUESTS);
    assert!(ledger.is_empty());
    assert!(ledger.is_closed());
    assert_eq!(completed.load(Ordering::SeqCst), REQUESTS);
}
