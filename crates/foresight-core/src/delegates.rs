//! Reject / caught-up callback registry keyed by prediction key.
//!
//! Each key owns two ordered callback lists. Resolving the key one way fires
//! that list in registration order and erases the whole entry, so the other
//! list can never fire afterwards. Resolving a key nothing was registered for
//! is a no-op: it just means nothing was predicted under it.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::key::{key_distance, key_issued_before_or_at, KeyId};

/// Fire-once callback attached to a key.
pub type KeyCallback = Box<dyn FnOnce()>;

/// How a key was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyEvent {
    Rejected,
    CaughtUp,
}

#[derive(Default)]
struct KeyDelegates {
    rejected: Vec<KeyCallback>,
    caught_up: Vec<KeyCallback>,
}

/// Registry of outstanding prediction keys for one prediction domain.
///
/// Always handled through an `Rc`: dependency callbacks hold a weak reference
/// back to the registry.
pub struct PredictionKeyDelegates {
    entries: RefCell<BTreeMap<KeyId, KeyDelegates>>,
    self_ref: Weak<PredictionKeyDelegates>,
    soft_limit: usize,
    over_limit: Cell<bool>,
}

impl std::fmt::Debug for PredictionKeyDelegates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionKeyDelegates")
            .field("outstanding", &self.outstanding())
            .field("soft_limit", &self.soft_limit)
            .finish()
    }
}

impl PredictionKeyDelegates {
    pub fn new(soft_limit: usize) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| Self {
            entries: RefCell::new(BTreeMap::new()),
            self_ref: self_ref.clone(),
            soft_limit,
            over_limit: Cell::new(false),
        })
    }

    /// Number of keys with at least one registered callback.
    pub fn outstanding(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_outstanding(&self, key: KeyId) -> bool {
        self.entries.borrow().contains_key(&key)
    }

    pub fn new_rejected_delegate(&self, key: KeyId, callback: impl FnOnce() + 'static) {
        self.register(key, KeyEvent::Rejected, Box::new(callback));
    }

    pub fn new_caught_up_delegate(&self, key: KeyId, callback: impl FnOnce() + 'static) {
        self.register(key, KeyEvent::CaughtUp, Box::new(callback));
    }

    /// Register one cleanup action that runs whichever way the key resolves.
    pub fn new_reject_or_caught_up_delegate(&self, key: KeyId, callback: impl FnOnce() + 'static) {
        let shared: Rc<Cell<Option<KeyCallback>>> = Rc::new(Cell::new(Some(Box::new(callback))));
        let on_reject = Rc::clone(&shared);
        self.new_rejected_delegate(key, move || {
            if let Some(callback) = on_reject.take() {
                callback();
            }
        });
        self.new_caught_up_delegate(key, move || {
            if let Some(callback) = shared.take() {
                callback();
            }
        });
    }

    /// Resolving `depends_on` also resolves `this` the same way.
    pub fn add_dependency(&self, this: KeyId, depends_on: KeyId) {
        let registry = self.self_ref.clone();
        self.new_rejected_delegate(depends_on, move || {
            if let Some(registry) = registry.upgrade() {
                registry.reject(this);
            }
        });

        let registry = self.self_ref.clone();
        self.new_caught_up_delegate(depends_on, move || {
            if let Some(registry) = registry.upgrade() {
                registry.catch_up_to(this);
            }
        });
    }

    pub fn reject(&self, key: KeyId) {
        self.fire(key, KeyEvent::Rejected);
    }

    pub fn catch_up_to(&self, key: KeyId) {
        self.fire(key, KeyEvent::CaughtUp);
    }

    /// Catch up every outstanding key issued no later than `key`, oldest
    /// first. Order follows the counter across its wrap, so keys issued
    /// after a wrap are left alone.
    pub fn catch_up_through(&self, key: KeyId) {
        let mut keys: Vec<KeyId> = self
            .entries
            .borrow()
            .keys()
            .copied()
            .filter(|k| key_issued_before_or_at(*k, key))
            .collect();
        keys.sort_by_key(|k| std::cmp::Reverse(key_distance(*k, key)));
        for k in keys {
            self.catch_up_to(k);
        }
    }

    fn register(&self, key: KeyId, event: KeyEvent, callback: KeyCallback) {
        if key <= 0 {
            warn!(key, ?event, "ignoring delegate registration for invalid prediction key");
            return;
        }

        let outstanding = {
            let mut entries = self.entries.borrow_mut();
            let entry = entries.entry(key).or_default();
            match event {
                KeyEvent::Rejected => entry.rejected.push(callback),
                KeyEvent::CaughtUp => entry.caught_up.push(callback),
            }
            entries.len()
        };

        if outstanding > self.soft_limit {
            if !self.over_limit.replace(true) {
                warn!(
                    outstanding,
                    soft_limit = self.soft_limit,
                    "outstanding prediction keys exceed soft limit"
                );
            }
        } else {
            self.over_limit.set(false);
        }
    }

    fn fire(&self, key: KeyId, event: KeyEvent) {
        // Detach the entry before running anything: callbacks may register or
        // resolve other keys on this registry.
        let entry = self.entries.borrow_mut().remove(&key);
        let Some(entry) = entry else {
            trace!(key, ?event, "no delegates registered");
            return;
        };

        let callbacks = match event {
            KeyEvent::Rejected => entry.rejected,
            KeyEvent::CaughtUp => entry.caught_up,
        };

        debug!(key, ?event, callbacks = callbacks.len(), "resolving prediction key");
        for callback in callbacks {
            callback();
        }
    }
}

/// Wrap `f` so it only runs while `target` is still alive.
pub fn bind_weak<T: ?Sized + 'static>(
    target: &Rc<T>,
    f: impl FnOnce(&T) + 'static,
) -> impl FnOnce() + 'static {
    let weak = Rc::downgrade(target);
    move || match weak.upgrade() {
        Some(target) => f(&target),
        None => trace!("delegate owner dropped; skipping callback"),
    }
}
