//! Frame scheduler
//!
//! The host owns an `AnimationManager`, registers every object that needs a
//! per-frame update, and calls `tick` once per frame. Objects are ticked in
//! registration order.

use std::cell::RefCell;
use std::rc::Rc;

/// Anything advanced once per frame
pub trait Animate {
    /// `t` is the absolute clock in seconds, `delta` the frame duration
    fn animate(&mut self, t: f64, delta: f64);
}

/// Handle for a registered object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnimationHandle(u64);

struct Entry {
    handle: AnimationHandle,
    target: Rc<RefCell<dyn Animate>>,
}

/// Registry ticking every registered object once per frame
pub struct AnimationManager {
    entries: Vec<Entry>,
    next_handle: u64,
    /// Accumulated clock
    pub time: f64,
    /// Multiplier applied to every frame delta
    pub time_scale: f64,
}

impl AnimationManager {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_handle: 0,
            time: 0.0,
            time_scale: 1.0,
        }
    }

    pub fn register(&mut self, target: Rc<RefCell<dyn Animate>>) -> AnimationHandle {
        let handle = AnimationHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.push(Entry { handle, target });
        log::debug!("Registered animated object {:?}", handle);
        handle
    }

    pub fn unregister(&mut self, handle: AnimationHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.handle != handle);
        before != self.entries.len()
    }

    pub fn is_registered(&self, handle: AnimationHandle) -> bool {
        self.entries.iter().any(|e| e.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tick every registered object with an explicit clock
    pub fn tick(&mut self, t: f64, delta: f64) {
        self.time = t;
        let snapshot: Vec<Rc<RefCell<dyn Animate>>> =
            self.entries.iter().map(|e| Rc::clone(&e.target)).collect();
        for target in snapshot {
            target.borrow_mut().animate(t, delta);
        }
    }

    /// Advance the internal clock by `dt` (scaled) and tick
    pub fn advance(&mut self, dt: f64) {
        let delta = dt * self.time_scale;
        let t = self.time + delta;
        self.tick(t, delta);
    }
}

impl Default for AnimationManager {
    fn default() -> Self {
        Self::new()
    }
}
