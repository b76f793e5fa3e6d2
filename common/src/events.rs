//! Per-object publish/subscribe event bus
//!
//! Listeners are registered per event kind. Internal ("protected") listeners
//! always run before public ones, and dispatch iterates over a snapshot of the
//! listener list so that `on`/`off` calls made from inside a listener never
//! cause a skipped or duplicated call for the event currently being delivered.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

/// An event that can be routed by kind
pub trait Event {
    type Kind: Copy + Eq + Hash + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by `on`, used to remove the listener again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Rc<dyn Fn(&E)>;

struct Listener<E> {
    id: ListenerId,
    protected: bool,
    callback: Callback<E>,
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            protected: self.protected,
            callback: Rc::clone(&self.callback),
        }
    }
}

/// Event bus owned by a single simulation object
pub struct EventDispatcher<E: Event> {
    listeners: RefCell<HashMap<E::Kind, Vec<Listener<E>>>>,
    next_id: Cell<u64>,
}

impl<E: Event> EventDispatcher<E> {
    pub fn new() -> Self {
        Self {
            listeners: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        }
    }

    /// Register a public listener
    pub fn on<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) + 'static,
    {
        self.register(kind, false, Rc::new(callback))
    }

    /// Register an internal listener that runs before every public one
    pub fn on_protected<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) + 'static,
    {
        self.register(kind, true, Rc::new(callback))
    }

    fn register(&self, kind: E::Kind, protected: bool, callback: Callback<E>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners
            .borrow_mut()
            .entry(kind)
            .or_default()
            .push(Listener {
                id,
                protected,
                callback,
            });
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        for list in listeners.values_mut() {
            if let Some(index) = list.iter().position(|l| l.id == id) {
                list.remove(index);
                return true;
            }
        }
        false
    }

    /// Remove every listener for one kind
    pub fn clear(&self, kind: E::Kind) {
        self.listeners.borrow_mut().remove(&kind);
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners
            .borrow()
            .get(&kind)
            .map_or(0, |list| list.len())
    }

    /// Deliver an event to every listener registered for its kind
    pub fn trigger(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = {
            let listeners = self.listeners.borrow();
            match listeners.get(&event.kind()) {
                Some(list) => {
                    let mut ordered: Vec<Listener<E>> =
                        list.iter().filter(|l| l.protected).cloned().collect();
                    ordered.extend(list.iter().filter(|l| !l.protected).cloned());
                    ordered
                }
                None => return,
            }
        };

        for listener in &snapshot {
            (listener.callback)(event);
        }
    }
}

impl<E: Event> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for EventDispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.borrow();
        let counts: HashMap<E::Kind, usize> =
            listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventDispatcher")
            .field("listeners", &counts)
            .finish()
    }
}
