//! Integration tests for capacity admission
//!
//! Exercises Capacity, Acquisition, and Waiting together, including grants
//! delivered from other threads.

mod common;

use std::sync::Arc;
use std::thread;

use common::RecordingWaiter;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use stagehand::{Acquisition, Capacity, CapacityDefinition, CapacityError, WaitSignal, Waiting};

fn capacity(name: &str, initial: u32) -> Arc<Capacity> {
    Arc::new(Capacity::new(CapacityDefinition::new(name, initial)))
}

fn assert_balanced(capacity: &Capacity) {
    assert_eq!(
        capacity.value() + capacity.outstanding(),
        capacity.initial_value()
    );
}

#[test]
fn test_partial_release_grants_queued_acquisition() {
    let fog = capacity("fog", 2);
    let x = Acquisition::new(fog.clone());
    let y = Acquisition::new(fog.clone());
    let y_waiter = RecordingWaiter::new("y");

    assert!(x.acquire(2, RecordingWaiter::new("x")).unwrap());
    assert_eq!((fog.value(), fog.outstanding()), (0, 2));

    assert!(!y.acquire(1, y_waiter.clone()).unwrap());
    assert_eq!((fog.value(), fog.outstanding()), (0, 2));

    x.release(1).unwrap();
    assert_eq!(y_waiter.grants(), vec![1]);
    assert_eq!((fog.value(), fog.outstanding()), (0, 2));
    assert_eq!((x.held(), y.held()), (1, 1));
}

#[test]
fn test_grants_follow_arrival_order() {
    let fog = capacity("fog", 3);
    let holder = Acquisition::new(fog.clone());
    holder.acquire(3, RecordingWaiter::new("holder")).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let first = Acquisition::new(fog.clone());
    let second = Acquisition::new(fog.clone());
    let third = Acquisition::new(fog.clone());
    first.acquire(1, RecordingWaiter::logging("first", &log)).unwrap();
    second.acquire(1, RecordingWaiter::logging("second", &log)).unwrap();
    third.acquire(1, RecordingWaiter::logging("third", &log)).unwrap();

    let queued: Vec<String> = fog.waiting_list().into_iter().map(|e| e.name).collect();
    assert_eq!(queued, vec!["first", "second", "third"]);

    holder.release(3).unwrap();
    assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    assert_balanced(&fog);
}

#[test]
fn test_large_head_request_blocks_later_small_ones() {
    let fog = capacity("fog", 4);
    let holder = Acquisition::new(fog.clone());
    holder.acquire(4, RecordingWaiter::new("holder")).unwrap();

    let big = Acquisition::new(fog.clone());
    let small = Acquisition::new(fog.clone());
    let big_waiter = RecordingWaiter::new("big");
    let small_waiter = RecordingWaiter::new("small");
    big.acquire(3, big_waiter.clone()).unwrap();
    small.acquire(1, small_waiter.clone()).unwrap();

    holder.release(2).unwrap();
    assert!(big_waiter.grants().is_empty());
    assert!(small_waiter.grants().is_empty());

    holder.release(2).unwrap();
    assert_eq!(big_waiter.grants(), vec![3]);
    assert_eq!(small_waiter.grants(), vec![1]);
    assert_balanced(&fog);
}

#[test]
fn test_reset_refused_until_everything_returned() {
    let fog = capacity("fog", 2);
    let acq = Acquisition::new(fog.clone());
    acq.acquire(2, RecordingWaiter::new("acq")).unwrap();

    assert!(matches!(fog.reset(), Err(CapacityError::InUse { outstanding: 2, .. })));
    assert_eq!(fog.value(), 0);
    assert!(matches!(
        fog.set_initial_value(5),
        Err(CapacityError::InUse { .. })
    ));

    drop(acq);
    fog.reset().unwrap();
    fog.set_initial_value(5).unwrap();
    assert_eq!(fog.value(), 5);
}

#[test]
fn test_dropping_acquisition_never_leaks() {
    let fog = capacity("fog", 3);
    let waiter = RecordingWaiter::new("late");

    let early = Acquisition::new(fog.clone());
    early.acquire(2, RecordingWaiter::new("early")).unwrap();

    let late = Acquisition::new(fog.clone());
    // One unit granted at once, then topped up asynchronously
    late.acquire(1, RecordingWaiter::new("late")).unwrap();
    assert!(!late.ensure(2, waiter.clone()).unwrap());

    drop(early);
    assert_eq!(waiter.grants(), vec![1]);
    assert_eq!(late.held(), 2);

    drop(late);
    assert_eq!(fog.outstanding(), 0);
    assert_eq!(fog.value(), 3);
}

#[test]
fn test_waiter_dropped_while_queued_is_skipped() {
    let fog = capacity("fog", 1);
    let holder = Acquisition::new(fog.clone());
    holder.acquire(1, RecordingWaiter::new("holder")).unwrap();

    let gone = RecordingWaiter::new("gone");
    let gone_dyn: Arc<dyn Waiting> = gone.clone();
    fog.acquire(1, &gone_dyn).unwrap();
    drop(gone_dyn);
    drop(gone);

    let survivor = Acquisition::new(fog.clone());
    let survivor_waiter = RecordingWaiter::new("survivor");
    survivor.acquire(1, survivor_waiter.clone()).unwrap();

    holder.release(1).unwrap();
    assert_eq!(survivor_waiter.grants(), vec![1]);
    assert_balanced(&fog);
}

#[test]
fn test_contended_threads_keep_capacity_balanced() {
    let fog = capacity("fog", 2);
    let mut workers = Vec::new();

    for worker in 0..6 {
        let fog = fog.clone();
        workers.push(thread::spawn(move || {
            for round in 0..50 {
                let acq = Acquisition::new(fog.clone());
                let signal = WaitSignal::new(format!("worker {worker} round {round}"));
                if !acq.acquire(1, signal.clone()).unwrap() {
                    while signal.take().is_none() {
                        thread::yield_now();
                    }
                }
                assert_eq!(acq.held(), 1);
                acq.release(1).unwrap();
            }
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(fog.outstanding(), 0);
    assert_eq!(fog.value(), 2);
    assert!(fog.waiting_list().is_empty());
}
