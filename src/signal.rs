//! Typed one-to-many notifications with scoped subscriptions.
//!
//! A [`Subscription`] removes its listener when dropped, so a listener can
//! never outlive the object that registered it.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

type Listener<T> = Rc<dyn Fn(&T)>;

struct Listeners<T> {
    entries: RefCell<Vec<(u64, Listener<T>)>>,
    next: Cell<u64>,
}

pub struct Signal<T> {
    inner: Rc<Listeners<T>>,
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Listeners {
                entries: RefCell::new(Vec::new()),
                next: Cell::new(0),
            }),
        }
    }

    #[must_use = "dropping the subscription removes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + 'static,
    {
        let id = self.inner.next.get();
        self.inner.next.set(id + 1);
        self.inner
            .entries
            .borrow_mut()
            .push((id, Rc::new(listener)));

        let weak: Weak<Listeners<T>> = Rc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    listeners.entries.borrow_mut().retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Calls every listener registered at the time of the call. Listeners
    /// may subscribe or unsubscribe while being notified.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .inner
            .entries
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.entries.borrow().len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a listener registered for as long as it lives
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Removes the listener now
    pub fn cancel(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_subscribers() {
        let signal = Signal::<u32>::new();
        let total = Rc::new(Cell::new(0));

        let sum = Rc::clone(&total);
        let _a = signal.subscribe(move |v| sum.set(sum.get() + v));
        let sum = Rc::clone(&total);
        let _b = signal.subscribe(move |v| sum.set(sum.get() + v * 10));

        signal.emit(&2);
        assert_eq!(total.get(), 22);
    }

    #[test]
    fn test_dropped_subscription_stops_delivery() {
        let signal = Signal::<()>::new();
        let hits = Rc::new(Cell::new(0));

        let count = Rc::clone(&hits);
        let sub = signal.subscribe(move |_| count.set(count.get() + 1));
        signal.emit(&());
        drop(sub);
        signal.emit(&());

        assert_eq!(hits.get(), 1);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn test_subscription_outliving_signal() {
        let signal = Signal::<()>::new();
        let sub = signal.subscribe(|_| {});
        drop(signal);
        sub.cancel();
    }

    #[test]
    fn test_listener_may_unsubscribe_during_emit() {
        let signal = Signal::<()>::new();
        let slot: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));

        let own = Rc::clone(&slot);
        let sub = signal.subscribe(move |_| {
            own.borrow_mut().take();
        });
        *slot.borrow_mut() = Some(sub);

        signal.emit(&());
        assert_eq!(signal.listener_count(), 0);
    }
}
