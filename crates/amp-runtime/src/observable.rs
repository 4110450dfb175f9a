//! Observable
//!
//! Minimal single-threaded event fan-out.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

type Handler<T> = Rc<dyn Fn(&T)>;

struct Handlers<T> {
    next_id: Cell<u64>,
    list: RefCell<Vec<(u64, Handler<T>)>>,
}

/// A list of handlers fired with a shared event value.
pub struct Observable<T> {
    handlers: Rc<Handlers<T>>,
}

/// Removes a handler when called. Dropping it keeps the handler registered.
#[must_use = "dropping an Unlisten keeps the handler registered"]
pub struct Unlisten(Box<dyn FnOnce()>);

impl Unlisten {
    pub fn new<F: FnOnce() + 'static>(f: F) -> Self {
        Self(Box::new(f))
    }

    pub fn call(self) {
        (self.0)()
    }
}

impl std::fmt::Debug for Unlisten {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Unlisten")
    }
}

impl<T: 'static> Observable<T> {
    pub fn new() -> Self {
        Self {
            handlers: Rc::new(Handlers {
                next_id: Cell::new(0),
                list: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Register `handler`.
    pub fn add<F>(&self, handler: F) -> Unlisten
    where
        F: Fn(&T) + 'static,
    {
        let id = self.handlers.next_id.get();
        self.handlers.next_id.set(id + 1);
        self.handlers.list.borrow_mut().push((id, Rc::new(handler)));

        let handlers: Weak<Handlers<T>> = Rc::downgrade(&self.handlers);
        Unlisten::new(move || {
            if let Some(handlers) = handlers.upgrade() {
                handlers.list.borrow_mut().retain(|(other, _)| *other != id);
            }
        })
    }

    /// Call every handler registered at the time of the call.
    ///
    /// Handlers may add or remove handlers while running.
    pub fn fire(&self, event: &T) {
        let snapshot: Vec<Handler<T>> = self
            .handlers
            .list
            .borrow()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn remove_all(&self) {
        self.handlers.list.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.list.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}
