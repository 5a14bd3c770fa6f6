use super::*;

use std::sync::{atomic::AtomicUsize as StdAtomicUsize, Arc, Mutex};

use crate::backing::tests::CountingBacking;

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Signal(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Other(u64);

/// Payload with a destructor
struct Owning {
    drops: Arc<StdAtomicUsize>,
}
impl Drop for Owning {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

type SmallDispatcher = Dispatcher<DefaultLock, SystemBacking, 512>;

#[test]
fn ensure_dispatcher_send_sync() {
    assert_send::<Dispatcher>();
    assert_sync::<Dispatcher>();
}

#[cfg(not(loom))]
#[test]
fn drain_empty() {
    let d = Dispatcher::<DefaultLock>::new().unwrap();
    let mut called = false;
    let report = d.drain(|_| {
        called = true;
        1
    });
    assert!(!called);
    assert_eq!(report, DrainReport::default());
}

#[cfg(not(loom))]
#[test]
fn drain_boundary() {
    let d = Dispatcher::<DefaultLock>::new().unwrap();
    for i in 1..=3 {
        d.publish(Signal(i)).unwrap();
    }
    assert_eq!(d.pending(), 3);

    let mut seen = Vec::new();
    let report = d.drain(|env| {
        let sig = *env.downcast_ref::<Signal>().unwrap();
        if sig == Signal(1) {
            d.publish(Signal(4)).unwrap();
        }
        seen.push(sig);
        1
    });
    assert_eq!(
        report,
        DrainReport {
            dispatched: 3,
            handled: 3
        }
    );
    assert_eq!(seen, [Signal(1), Signal(2), Signal(3)]);
    assert_eq!(d.pending(), 1);

    let mut seen = Vec::new();
    let report = d.drain(|env| {
        seen.push(*env.downcast_ref::<Signal>().unwrap());
        0
    });
    assert_eq!(
        report,
        DrainReport {
            dispatched: 1,
            handled: 0
        }
    );
    assert_eq!(seen, [Signal(4)]);
    assert_eq!(d.pending(), 0);
}

#[cfg(not(loom))]
#[test]
fn arenas_alternate() {
    let d = Dispatcher::<DefaultLock>::new().unwrap();
    let active = || unsafe { (*d.state.get()).active };
    assert_eq!(active(), ActiveArena::A);
    d.drain(|_| 0);
    assert_eq!(active(), ActiveArena::B);
    d.drain(|_| 0);
    assert_eq!(active(), ActiveArena::A);
}

#[cfg(not(loom))]
#[test]
fn mixed_payload_types() {
    let d = Dispatcher::<DefaultLock>::new().unwrap();
    d.publish(Signal(1)).unwrap();
    d.publish(Other(2)).unwrap();
    d.publish(String::from("three")).unwrap();
    d.publish(Signal(4)).unwrap();

    let mut log = Vec::new();
    let report = d.drain(|env| {
        if let Some(s) = env.downcast_ref::<Signal>() {
            log.push(format!("signal {}", s.0));
            1
        } else if let Some(o) = env.downcast_ref::<Other>() {
            log.push(format!("other {}", o.0));
            1
        } else {
            assert_eq!(env.tag(), crate::TypeTag::of::<String>());
            0
        }
    });
    assert_eq!(log, ["signal 1", "other 2", "signal 4"]);
    assert_eq!(
        report,
        DrainReport {
            dispatched: 4,
            handled: 3
        }
    );
}

#[cfg(not(loom))]
#[test]
fn payloads_dropped_after_drain() {
    let drops = Arc::new(StdAtomicUsize::new(0));
    let d = Dispatcher::<DefaultLock>::new().unwrap();
    for _ in 0..5 {
        d.publish(Owning {
            drops: drops.clone(),
        })
        .unwrap();
    }
    d.drain(|_| {
        // nothing torn down while still being handled
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        1
    });
    assert_eq!(drops.load(Ordering::SeqCst), 5);
}

#[cfg(not(loom))]
#[test]
fn undrained_payloads_dropped_with_dispatcher() {
    let drops = Arc::new(StdAtomicUsize::new(0));
    {
        let d = Dispatcher::<DefaultLock>::new().unwrap();
        d.publish(Owning {
            drops: drops.clone(),
        })
        .unwrap();
    }
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[cfg(not(loom))]
#[test]
fn overflow_keeps_order() {
    let d = SmallDispatcher::new().unwrap();
    for i in 0..500 {
        d.publish(Signal(i)).unwrap();
    }
    let mut next = 0;
    let report = d.drain(|env| {
        assert_eq!(env.downcast_ref::<Signal>(), Some(&Signal(next)));
        next += 1;
        1
    });
    assert_eq!(report.dispatched, 500);
    assert_eq!(next, 500);
}

#[cfg(not(loom))]
#[test]
fn oversized_payload_is_an_error() {
    let d = SmallDispatcher::new().unwrap();
    assert!(matches!(
        d.publish([0u8; 1024]),
        Err(ArenaError::OutOfCapacity { .. })
    ));
    assert_eq!(d.pending(), 0);
    assert_eq!(d.drain(|_| 1).dispatched, 0);
}

#[cfg(not(loom))]
#[test]
fn arenas_come_from_backing() {
    let backing = CountingBacking::default();
    let d = Dispatcher::<DefaultLock, CountingBacking, 256>::with_backing(backing.clone()).unwrap();
    assert_eq!(backing.live.load(Ordering::SeqCst), 2);
    drop(d);
    assert_eq!(backing.live.load(Ordering::SeqCst), 0);

    let refusing = CountingBacking {
        refuse: true,
        ..Default::default()
    };
    assert!(matches!(
        Dispatcher::<DefaultLock, CountingBacking, 256>::with_backing(refusing),
        Err(ArenaError::BackingExhausted { .. })
    ));
}

#[cfg(not(loom))]
#[test]
#[should_panic(expected = "already in progress")]
fn reentrant_drain_panics() {
    let d = Dispatcher::<DefaultLock>::new().unwrap();
    d.publish(Signal(0)).unwrap();
    d.drain(|_| d.drain(|_| 0).dispatched);
}

#[cfg(not(loom))]
#[test]
fn handler_panic_still_purges() {
    let drops = Arc::new(StdAtomicUsize::new(0));
    let d = Dispatcher::<DefaultLock>::new().unwrap();
    d.publish(Owning {
        drops: drops.clone(),
    })
    .unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        d.drain(|_| panic!("handler failed"));
    }));
    assert!(result.is_err());
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    // dispatcher is still usable
    d.publish(Signal(9)).unwrap();
    assert_eq!(d.drain(|_| 1).handled, 1);
}

/// Payload whose destructor panics the first time
struct PanicOnDrop {
    drops: Arc<StdAtomicUsize>,
}
impl Drop for PanicOnDrop {
    fn drop(&mut self) {
        if self.drops.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("PanicOnDrop dropped");
        }
    }
}

#[cfg(not(loom))]
#[test]
fn payload_destructor_panic_ends_drain() {
    let quiet = Arc::new(StdAtomicUsize::new(0));
    let loud = Arc::new(StdAtomicUsize::new(0));
    let d = Dispatcher::<DefaultLock>::new().unwrap();
    d.publish(Owning {
        drops: quiet.clone(),
    })
    .unwrap();
    d.publish(PanicOnDrop {
        drops: loud.clone(),
    })
    .unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        d.drain(|_| 1);
    }));
    assert!(result.is_err());
    assert_eq!(loud.load(Ordering::SeqCst), 1);
    assert_eq!(quiet.load(Ordering::SeqCst), 1);

    // no longer marked as draining, and nothing is dropped twice
    d.publish(Signal(3)).unwrap();
    assert_eq!(d.drain(|_| 1).handled, 1);
    d.publish(Signal(4)).unwrap();
    assert_eq!(d.drain(|_| 1).handled, 1);
    drop(d);
    assert_eq!(loud.load(Ordering::SeqCst), 1);
    assert_eq!(quiet.load(Ordering::SeqCst), 1);
}

#[cfg(not(loom))]
#[test]
fn large_dispatcher_on_small_stack() {
    std::thread::Builder::new()
        .stack_size(256 * 1024)
        .spawn(|| {
            let d = Dispatcher::<DefaultLock, SystemBacking, { 1024 * 1024 }>::new().unwrap();
            for i in 0..4 {
                d.publish(Signal(i)).unwrap();
            }
            assert_eq!(d.drain(|_| 1).handled, 4);
        })
        .unwrap()
        .join()
        .unwrap();
}

#[cfg(not(loom))]
#[test]
fn os_mutex_dispatcher() {
    let d = Dispatcher::<crate::OsMutex>::new().unwrap();
    d.publish(Signal(1)).unwrap();
    assert_eq!(d.drain(|_| 1).handled, 1);
}

#[cfg(not(loom))]
#[test]
fn concurrent_publishers() {
    const THREADS: u32 = 4;
    const PER_THREAD: u32 = 1000;

    let d = Dispatcher::<DefaultLock>::new().unwrap();
    let done = StdAtomicUsize::new(0);
    // last value seen from each producer, to check per-producer FIFO
    let last = Mutex::new(vec![None::<u32>; THREADS as usize]);
    let mut total = 0;

    let mut check = |env: &Envelope| {
        let (t, i) = *env.downcast_ref::<(u32, u32)>().unwrap();
        let mut last = last.lock().unwrap();
        let slot = &mut last[t as usize];
        assert!(slot.map_or(true, |prev| prev < i));
        *slot = Some(i);
        1
    };

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let d = &d;
            let done = &done;
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    d.publish((t, i)).unwrap();
                }
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        while done.load(Ordering::SeqCst) < THREADS as usize {
            total += d.drain(&mut check).handled;
        }
    });
    total += d.drain(&mut check).handled;

    assert_eq!(total, (THREADS * PER_THREAD) as usize);
    assert!(last
        .lock()
        .unwrap()
        .iter()
        .all(|l| *l == Some(PER_THREAD - 1)));
}

#[cfg(not(loom))]
#[test]
fn debug_output() {
    let d = Dispatcher::<DefaultLock>::new().unwrap();
    d.publish(Signal(0)).unwrap();
    let s = format!("{:?}", d);
    assert!(s.contains("active: A"));
    assert!(s.contains("pending: 1"));
}

#[cfg(loom)]
#[test]
fn loom_publish_during_drain() {
    loom::model(|| {
        let d = &*Box::leak(Box::new(
            Dispatcher::<DefaultLock, SystemBacking, 256>::new().unwrap(),
        ));

        let t = (0..2u32)
            .map(|i| loom::thread::spawn(move || d.publish(Signal(i)).unwrap()))
            .collect::<Vec<_>>();

        let mut seen = d.drain(|_| 1).handled;
        for t in t {
            t.join().unwrap();
        }
        seen += d.drain(|_| 1).handled;
        assert_eq!(seen, 2);
        assert_eq!(d.pending(), 0);
    });
}
