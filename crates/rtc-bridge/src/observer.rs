//! Observer slot: one replaceable callback adapter per bridged object.
//!
//! Native objects push notifications from engine threads. The slot guarantees
//! that once [`ObserverSlot::unregister`] (or a replacing
//! [`ObserverSlot::register`]) returns, the previous observer is never called
//! again: unregistration waits for an in-flight delivery to finish, and a
//! delivery that starts afterwards finds the slot empty and drops the event.
//!
//! The slot mutex is never held while foreign code runs. Instead the slot
//! records which thread is delivering, so an observer that unregisters itself
//! from inside its own callback does not deadlock.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

struct SlotState<O: ?Sized> {
    observer: Option<Arc<O>>,
    generation: u64,
    delivering: Option<ThreadId>,
}

pub struct ObserverSlot<O: ?Sized> {
    name: &'static str,
    state: Mutex<SlotState<O>>,
    delivery_done: Condvar,
}

impl<O: ?Sized> ObserverSlot<O> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(SlotState {
                observer: None,
                generation: 0,
                delivering: None,
            }),
            delivery_done: Condvar::new(),
        }
    }

    /// Install `observer`, replacing any previous one.
    ///
    /// Returns `true` if an observer was replaced.
    pub fn register(&self, observer: Arc<O>) -> bool {
        let previous = {
            let mut state = self.state.lock();
            self.wait_for_delivery(&mut state);
            state.generation += 1;
            trace!(slot = self.name, generation = state.generation, "observer registered");
            state.observer.replace(observer)
        };
        previous.is_some()
    }

    /// Remove the observer, blocking until any in-flight delivery on another
    /// thread has returned. Returns the removed observer, if any.
    pub fn unregister(&self) -> Option<Arc<O>> {
        let mut state = self.state.lock();
        self.wait_for_delivery(&mut state);
        let previous = state.observer.take();
        if previous.is_some() {
            state.generation += 1;
            trace!(slot = self.name, generation = state.generation, "observer unregistered");
        }
        previous
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().observer.is_some()
    }

    /// Bumped on every register and effective unregister
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Invoke `f` with the current observer on this thread.
    ///
    /// Deliveries are serialized per slot. Returns `false` when no observer
    /// is registered and the event was dropped.
    pub fn deliver<F>(&self, f: F) -> bool
    where
        F: FnOnce(&O),
    {
        let me = thread::current().id();
        let (observer, nested) = {
            let mut state = self.state.lock();
            while matches!(state.delivering, Some(owner) if owner != me) {
                self.delivery_done.wait(&mut state);
            }
            let Some(observer) = state.observer.clone() else {
                trace!(slot = self.name, "event dropped, no observer");
                return false;
            };
            let nested = state.delivering.is_some();
            state.delivering = Some(me);
            (observer, nested)
        };

        // Resets the delivering mark even if the observer panics.
        let _guard = DeliveryGuard {
            slot: self,
            nested,
        };
        f(&observer);
        drop(observer);
        true
    }

    fn wait_for_delivery(&self, state: &mut MutexGuard<'_, SlotState<O>>) {
        let me = thread::current().id();
        while let Some(owner) = state.delivering {
            if owner == me {
                // Called from inside the observer itself.
                break;
            }
            self.delivery_done.wait(state);
        }
    }
}

struct DeliveryGuard<'a, O: ?Sized> {
    slot: &'a ObserverSlot<O>,
    nested: bool,
}

impl<O: ?Sized> Drop for DeliveryGuard<'_, O> {
    fn drop(&mut self) {
        if self.nested {
            return;
        }
        let mut state = self.slot.state.lock();
        state.delivering = None;
        drop(state);
        self.slot.delivery_done.notify_all();
    }
}
