//! Observer slot stress: no delivery reaches an observer after it is removed

mod harness;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use harness::init_test_tracing;
use rand::Rng;
use remotemedia_rtc_bridge::ObserverSlot;

trait Listener: Send + Sync {
    fn notify(&self);
}

struct Tracked {
    retired: AtomicBool,
    hits: AtomicUsize,
    late_hits: Arc<AtomicUsize>,
}

impl Tracked {
    fn new(late_hits: &Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            retired: AtomicBool::new(false),
            hits: AtomicUsize::new(0),
            late_hits: late_hits.clone(),
        })
    }
}

impl Listener for Tracked {
    fn notify(&self) {
        if self.retired.load(Ordering::SeqCst) {
            self.late_hits.fetch_add(1, Ordering::SeqCst);
        }
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_swaps_under_load_never_leak_deliveries() {
    init_test_tracing();
    let slot: Arc<ObserverSlot<dyn Listener>> = Arc::new(ObserverSlot::new("stress"));
    let stop = Arc::new(AtomicBool::new(false));
    let late_hits = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));

    let deliverers: Vec<_> = (0..4)
        .map(|_| {
            let (slot, stop, delivered) = (slot.clone(), stop.clone(), delivered.clone());
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if slot.deliver(|listener| listener.notify()) {
                        delivered.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    let mut rng = rand::thread_rng();
    let mut current: Option<Arc<Tracked>> = None;
    let mut retired = Vec::new();
    for _ in 0..2_000 {
        if rng.gen_bool(0.7) {
            let next = Tracked::new(&late_hits);
            slot.register(next.clone());
            retired.extend(current.replace(next));
        } else {
            slot.unregister();
            retired.extend(current.take());
        }
        // Once register/unregister has returned, the old listener is done.
        if let Some(previous) = retired.last() {
            previous.retired.store(true, Ordering::SeqCst);
        }
        thread::yield_now();
    }

    slot.unregister();
    if let Some(last) = current.take() {
        last.retired.store(true, Ordering::SeqCst);
        retired.push(last);
    }
    thread::yield_now();
    stop.store(true, Ordering::SeqCst);
    for deliverer in deliverers {
        deliverer.join().unwrap();
    }

    assert_eq!(late_hits.load(Ordering::SeqCst), 0);
    let total: usize = retired
        .iter()
        .map(|listener| listener.hits.load(Ordering::SeqCst))
        .sum();
    assert_eq!(total, delivered.load(Ordering::SeqCst));
}

#[test]
fn test_self_unregister_during_storm() {
    init_test_tracing();
    let slot: Arc<ObserverSlot<dyn Listener>> = Arc::new(ObserverSlot::new("self-removal"));

    struct OneShot {
        slot: Arc<ObserverSlot<dyn Listener>>,
        fired: AtomicUsize,
    }
    impl Listener for OneShot {
        fn notify(&self) {
            self.fired.fetch_add(1, Ordering::SeqCst);
            drop(self.slot.unregister());
        }
    }

    let listener = Arc::new(OneShot {
        slot: slot.clone(),
        fired: AtomicUsize::new(0),
    });
    slot.register(listener.clone());

    let deliverers: Vec<_> = (0..4)
        .map(|_| {
            let slot = slot.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    slot.deliver(|listener| listener.notify());
                }
            })
        })
        .collect();
    for deliverer in deliverers {
        deliverer.join().unwrap();
    }

    assert_eq!(listener.fired.load(Ordering::SeqCst), 1);
    assert!(!slot.is_registered());
}
