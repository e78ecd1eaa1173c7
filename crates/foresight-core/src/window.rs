//! Scoped prediction windows.
//!
//! The key a block of speculative work runs under is held by the owning
//! ability system. A window swaps a key in for the lifetime of a guard and
//! puts the previous one back when the guard drops, so code inside the window
//! reads the key from its owner instead of threading it through every call.

use std::ops::{Deref, DerefMut};

use tracing::trace;

use crate::domain::PredictionDomain;
use crate::key::PredictionKey;

/// Immutable snapshot of the prediction state a piece of code runs under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PredictionContext {
    pub key: PredictionKey,
    pub is_authority: bool,
}

impl PredictionContext {
    /// Side effects made under this context are speculative.
    pub fn is_predicting(&self) -> bool {
        !self.is_authority && self.key.is_local_client_key()
    }
}

/// Anything that owns a scoped prediction key slot.
pub trait PredictionScope {
    fn is_authority(&self) -> bool;

    fn prediction_domain(&self) -> &PredictionDomain;

    fn scoped_prediction_key(&self) -> PredictionKey;

    fn set_scoped_prediction_key(&mut self, key: PredictionKey);

    /// Send `key` back to the connection it came from.
    fn replicate_prediction_key(&mut self, key: PredictionKey);

    fn prediction_context(&self) -> PredictionContext {
        PredictionContext {
            key: self.scoped_prediction_key(),
            is_authority: self.is_authority(),
        }
    }
}

/// Guard that owns a scoped key for its lifetime. Dereferences to the owner.
pub struct ScopedPredictionWindow<'a, S: PredictionScope> {
    owner: &'a mut S,
    restore: Option<PredictionKey>,
    replicate_on_exit: bool,
}

impl<'a, S: PredictionScope> ScopedPredictionWindow<'a, S> {
    /// Server side: run under a key the client sent. Inactive off the
    /// authority. With `set_replicated`, a valid key is echoed back to its
    /// originator when the window closes; an invalid key never is.
    pub fn with_key(owner: &'a mut S, key: PredictionKey, set_replicated: bool) -> Self {
        if !owner.is_authority() {
            return Self::inactive(owner);
        }

        let previous = owner.scoped_prediction_key();
        owner.set_scoped_prediction_key(key);
        trace!(%key, %previous, "entering server prediction window");
        Self {
            owner,
            restore: Some(previous),
            replicate_on_exit: set_replicated && key.is_valid_key(),
        }
    }

    /// Client side: chain a dependent key off the current scoped key. A no-op
    /// on the authority or when `can_generate_new_key` is false.
    pub fn predict(owner: &'a mut S, can_generate_new_key: bool) -> Self {
        if owner.is_authority() || !can_generate_new_key {
            return Self::inactive(owner);
        }

        let previous = owner.scoped_prediction_key();
        let mut key = previous;
        key.generate_dependent(owner.prediction_domain());
        owner.set_scoped_prediction_key(key);
        trace!(%key, %previous, "entering client prediction window");
        Self {
            owner,
            restore: Some(previous),
            replicate_on_exit: false,
        }
    }

    fn inactive(owner: &'a mut S) -> Self {
        Self {
            owner,
            restore: None,
            replicate_on_exit: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.restore.is_some()
    }

    pub fn key(&self) -> PredictionKey {
        self.owner.scoped_prediction_key()
    }
}

impl<S: PredictionScope> Deref for ScopedPredictionWindow<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &*self.owner
    }
}

impl<S: PredictionScope> DerefMut for ScopedPredictionWindow<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut *self.owner
    }
}

impl<S: PredictionScope> Drop for ScopedPredictionWindow<'_, S> {
    fn drop(&mut self) {
        let Some(previous) = self.restore.take() else {
            return;
        };

        if self.replicate_on_exit {
            let key = self.owner.scoped_prediction_key();
            if key.is_valid_key() {
                self.owner.replicate_prediction_key(key);
            }
        }
        self.owner.set_scoped_prediction_key(previous);
    }
}
