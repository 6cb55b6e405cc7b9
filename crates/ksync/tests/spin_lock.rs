use std::sync::Arc;
use std::thread;

use ksync::{RawSpinLock, SpinLock};

#[test]
fn basic_lock_and_raii() {
    let l = SpinLock::new(0_u32);

    // take the lock, mutate, and drop
    {
        let mut g = l.lock();
        *g = 41;
    }

    // lock again; previous drop must have unlocked
    {
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
}

#[test]
fn try_lock_semantics() {
    let l = SpinLock::new(1_u8);

    // first try_lock should succeed
    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert_eq!(**g1.as_ref().unwrap(), 1);

    // while held, try_lock must fail
    let g2 = l.try_lock();
    assert!(g2.is_none());

    // dropping the guard allows another try_lock
    drop(g1);
    let g3 = l.try_lock();
    assert!(g3.is_some());
}

#[test]
fn with_lock_works_and_unlocks() {
    let l = SpinLock::new(String::from("a"));
    let len = l.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);

    // lock must be free now
    let got = l.with_lock(|s| s.clone());
    assert_eq!(got, "ab");
}

#[test]
fn get_mut_allows_direct_mutation() {
    let mut l = SpinLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.lock().as_slice(), &[1, 2, 3, 4]);
}

#[test]
fn contended_increments_are_exclusive() {
    let l = Arc::new(SpinLock::new(0_u64));
    let mut handles = Vec::new();

    for _ in 0..4 {
        let l = Arc::clone(&l);
        handles.push(thread::spawn(move || {
            for _ in 0..10_000 {
                *l.lock() += 1;
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*l.lock(), 40_000);
}

#[test]
fn raw_lock_hands_off_between_threads() {
    let l = Arc::new(RawSpinLock::new());
    l.lock();

    let l2 = Arc::clone(&l);
    let waiter = thread::spawn(move || {
        // spins until the main thread releases
        l2.lock();
        l2.unlock();
    });

    thread::sleep(std::time::Duration::from_millis(10));
    l.unlock();
    waiter.join().unwrap();
}

#[test]
fn force_unlock_recovers_a_wedged_lock() {
    let l = SpinLock::new(7_u32);
    let g = l.lock();
    std::mem::forget(g);
    assert!(l.try_lock().is_none());

    // the "owner" is gone for good; the panic path may force it open
    unsafe { l.force_unlock() };
    assert_eq!(*l.lock(), 7);
}
