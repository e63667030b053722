use std::{
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
    thread, time,
};

use super::*;

#[test]
fn test_register() {
    let registry = Registry::new(2);
    assert!(registry.is_empty());
    assert_eq!(registry.register().unwrap(), 0);
    assert_eq!(registry.register().unwrap(), 1);
    assert_eq!(registry.len(), 2);
    assert!(registry.register().is_err());
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_barrier_skips_waiting_workers() {
    let registry = Registry::new(4);
    let w0 = registry.register().unwrap();
    let w1 = registry.register().unwrap();

    // w1 is registered but off-line, a fresh worker starts waiting and
    // the barrier must not spin on it.
    registry.stop_waiting(w0);
    registry.start_waiting(w0);
    registry.barrier(w0);
    let _ = w1;
}

#[test]
fn test_barrier_waits_for_reader() {
    let registry = Arc::new(Registry::new(4));
    let barrier_worker = registry.register().unwrap();
    let reader_worker = registry.register().unwrap();

    // reader goes on-line and holds a reference.
    registry.stop_waiting(reader_worker);

    let done = Arc::new(AtomicBool::new(false));
    let handle = {
        let (registry, done) = (Arc::clone(&registry), Arc::clone(&done));
        thread::spawn(move || {
            registry.barrier(barrier_worker);
            done.store(true, SeqCst);
        })
    };

    // barrier must not complete while the reader sits between quiescent
    // points.
    thread::sleep(time::Duration::from_millis(100));
    assert!(!done.load(SeqCst), "barrier finished early");

    // the reader passes a quiescent point, the barrier goes through.
    registry.progress(reader_worker);
    handle.join().unwrap();
    assert!(done.load(SeqCst));

    registry.start_waiting(reader_worker);
}

#[test]
fn test_barrier_release_by_waiting() {
    let registry = Arc::new(Registry::new(4));
    let barrier_worker = registry.register().unwrap();
    let reader_worker = registry.register().unwrap();

    registry.stop_waiting(reader_worker);

    let done = Arc::new(AtomicBool::new(false));
    let handle = {
        let (registry, done) = (Arc::clone(&registry), Arc::clone(&done));
        thread::spawn(move || {
            registry.barrier(barrier_worker);
            done.store(true, SeqCst);
        })
    };

    thread::sleep(time::Duration::from_millis(100));
    assert!(!done.load(SeqCst), "barrier finished early");

    // going off-line also releases the barrier.
    registry.start_waiting(reader_worker);
    handle.join().unwrap();
}
