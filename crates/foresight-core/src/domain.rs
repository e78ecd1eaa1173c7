//! One simulated process worth of prediction state.

use std::rc::Rc;

use crate::config::PredictionConfig;
use crate::delegates::PredictionKeyDelegates;
use crate::key::{KeyAllocator, PredictionKey};

/// Key counter, delegate registry and settings shared by every ability system
/// living in the same process. A loopback harness creates one per peer.
#[derive(Debug)]
pub struct PredictionDomain {
    allocator: KeyAllocator,
    delegates: Rc<PredictionKeyDelegates>,
    config: PredictionConfig,
}

impl PredictionDomain {
    pub fn new(config: PredictionConfig) -> Rc<Self> {
        Self::with_allocator(config, KeyAllocator::new())
    }

    pub fn with_allocator(config: PredictionConfig, allocator: KeyAllocator) -> Rc<Self> {
        Rc::new(Self {
            allocator,
            delegates: PredictionKeyDelegates::new(config.delegate_soft_limit),
            config,
        })
    }

    pub fn allocator(&self) -> &KeyAllocator {
        &self.allocator
    }

    pub fn delegates(&self) -> &Rc<PredictionKeyDelegates> {
        &self.delegates
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    pub fn create_new_prediction_key(&self, is_authority: bool) -> PredictionKey {
        self.allocator.create_new_prediction_key(is_authority)
    }

    pub fn create_new_server_initiated_key(&self, is_authority: bool) -> PredictionKey {
        self.allocator.create_new_server_initiated_key(is_authority)
    }
}
