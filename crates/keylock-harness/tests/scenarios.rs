//! End-to-end timing scenarios driven across real threads.
//!
//! Timing assertions only bound from below (a release at `t+30` cannot
//! produce a grant before `t+30`) or with generous slack above, so the
//! suite stays stable on loaded machines.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use keylock::{BasicLocker, ConflictKind, LockConflict, LockManager, LockRequest, Locker};
use keylock_harness::init_tracing;

fn manager(timeout_ms: u64) -> Arc<LockManager<&'static str>> {
    init_tracing();
    Arc::new(LockManager::new(Duration::from_millis(timeout_ms), 16))
}

#[test]
fn readers_coexist() {
    let mgr = manager(100);
    let l1 = BasicLocker::new(&mgr);
    let l2 = BasicLocker::new(&mgr);

    assert_eq!(mgr.lock(&l1, "a", false).unwrap(), None);
    assert_eq!(mgr.lock(&l2, "a", false).unwrap(), None);

    let owners = mgr.get_owners(&"a");
    assert_eq!(owners.len(), 2);
    let ids: Vec<_> = owners.iter().map(LockRequest::locker).collect();
    assert!(ids.contains(&l1.core().id()));
    assert!(ids.contains(&l2.core().id()));
}

#[test]
fn blocked_reader_is_granted_at_release_time() {
    let mgr = manager(500);
    let l1 = BasicLocker::new(&mgr);
    let l2 = Arc::new(BasicLocker::new(&mgr));

    assert_eq!(mgr.lock(&l1, "a", true).unwrap(), None);

    let t0 = Instant::now();
    let reader = {
        let mgr = Arc::clone(&mgr);
        let l2 = Arc::clone(&l2);
        thread::spawn(move || {
            let outcome = mgr.lock(&*l2, "a", false).unwrap();
            (outcome, t0.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(30));
    mgr.release_lock(&l1, &"a").unwrap();

    let (outcome, granted_at) = reader.join().unwrap();
    assert_eq!(outcome, None);
    assert!(
        granted_at >= Duration::from_millis(30),
        "grant preceded the release: {granted_at:?}"
    );
    assert_eq!(mgr.get_owners(&"a")[0].locker(), l2.core().id());
}

#[test]
fn late_readers_do_not_starve_a_waiting_writer() {
    let mgr = manager(500);
    let l1 = BasicLocker::new(&mgr);
    let l2 = BasicLocker::new(&mgr);
    let l3 = BasicLocker::new(&mgr);

    assert_eq!(mgr.lock(&l1, "a", false).unwrap(), None);
    let w = mgr.lock_no_wait(&l2, "a", true).unwrap().unwrap();
    assert_eq!(w.kind(), ConflictKind::Blocked);

    // l3's read must queue behind l2's write, not slip past it.
    let r = mgr.lock_no_wait(&l3, "a", false).unwrap().unwrap();
    assert_eq!(r.kind(), ConflictKind::Blocked);

    let waiters = mgr.get_waiters(&"a");
    assert_eq!(waiters.len(), 2);
    assert_eq!(waiters[0].locker(), l2.core().id());
    assert_eq!(waiters[1].locker(), l3.core().id());

    // Handoff order on release: writer first, then the reader.
    mgr.release_lock(&l1, &"a").unwrap();
    assert_eq!(mgr.wait_for_lock(&l2).unwrap(), None);
    assert!(mgr.get_owners(&"a")[0].for_write());

    mgr.release_lock(&l2, &"a").unwrap();
    assert_eq!(mgr.wait_for_lock(&l3).unwrap(), None);
    assert!(!mgr.get_owners(&"a")[0].for_write());
}

#[test]
fn unreleased_writer_times_out_the_reader() {
    let mgr = manager(50);
    let l1 = BasicLocker::new(&mgr);
    let l2 = BasicLocker::new(&mgr);

    assert_eq!(mgr.lock(&l1, "a", true).unwrap(), None);

    let t0 = Instant::now();
    let conflict = mgr.lock(&l2, "a", false).unwrap().unwrap();
    let elapsed = t0.elapsed();

    assert_eq!(conflict.kind(), ConflictKind::Timeout);
    assert!(elapsed >= Duration::from_millis(50), "early timeout: {elapsed:?}");
    assert!(
        elapsed < Duration::from_secs(5),
        "timeout wildly overshot: {elapsed:?}"
    );
    assert!(mgr.get_waiters(&"a").is_empty());
}

#[test]
fn arbiter_verdict_aborts_the_victim_everywhere() {
    let mgr = manager(5_000);
    let l1 = Arc::new(BasicLocker::new(&mgr));
    let l2 = BasicLocker::new(&mgr);

    assert_eq!(mgr.lock(&l2, "a", true).unwrap(), None);

    let victim = {
        let mgr = Arc::clone(&mgr);
        let l1 = Arc::clone(&l1);
        thread::spawn(move || mgr.lock(&*l1, "a", true).unwrap())
    };
    thread::sleep(Duration::from_millis(30));

    // The external arbiter names l1 the victim of a cycle with l2.
    l1.core().inject_conflict(LockConflict::new(
        ConflictKind::Deadlock,
        LockRequest::new(l2.core().id(), "a", true, false),
    ));

    let conflict = victim.join().unwrap().unwrap();
    assert_eq!(conflict.kind(), ConflictKind::Deadlock);

    // Sticky: a fresh request on an unrelated key fails fast.
    let t0 = Instant::now();
    let conflict = mgr.lock(&*l1, "b", false).unwrap().unwrap();
    assert_eq!(conflict.kind(), ConflictKind::Deadlock);
    assert!(t0.elapsed() < Duration::from_millis(100), "sticky verdict blocked");
    assert!(mgr.get_owners(&"b").is_empty());

    // The survivor is untouched.
    mgr.release_lock(&l2, &"a").unwrap();
    assert_eq!(mgr.lock_count(), 0);
}

#[test]
fn upgrade_promotes_in_place() {
    let mgr = manager(100);
    let l1 = BasicLocker::new(&mgr);

    assert_eq!(mgr.lock(&l1, "a", false).unwrap(), None);
    assert_eq!(mgr.lock(&l1, "a", true).unwrap(), None);

    let owners = mgr.get_owners(&"a");
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].locker(), l1.core().id());
    assert!(owners[0].for_write());
    assert!(owners[0].upgrade());
}
