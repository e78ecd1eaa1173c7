//! The active effects container and its application/removal state machine.
//!
//! Records move `Pending -> Inhibited <-> Active -> PendingRemove -> Removed`.
//! `Pending` and `PendingRemove` only exist while a scope lock is held: code
//! iterating the records may add or remove effects, and those structural
//! changes are queued until the outermost lock is released.
//!
//! Attribute recalculation is batched the same way. Every public mutation
//! runs inside an aggregator batch, so an attribute touched by several
//! effects in one operation is evaluated once, at the end.

mod replication;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use foresight_core::{
    bind_weak, ConnectionId, GameplayTag, HandleArena, KeyEvent, NetTime, PredictionDomain,
    PredictionKey, TagCountContainer, TimerHandle, TimerManager,
};
use tracing::{debug, error, trace, warn};

use crate::active::{ActiveEffect, EffectHandle, EffectOrigin, EffectState, ReplicationId};
use crate::aggregator::Aggregator;
use crate::attribute::{Attribute, AttributeSet};
use crate::definition::{
    DefinitionError, EffectLibrary, GameplayEffectDef, StackDurationRefreshPolicy,
    StackExpirationPolicy, StackPeriodResetPolicy, StackingPolicy, StackingType,
};
use crate::events::{CueEvent, CueKind, EffectEvent};
use crate::spec::{EffectSpec, InstigatorId};

pub use replication::{EffectDelta, ReplicatedAttribute, ReplicatedEffect};

/// Process-wide handle to owner map.
pub type EffectHandleArena = HandleArena<RefCell<ActiveEffectsContainer>>;

/// Rounds of inhibition re-checks before giving up on a tag feedback loop.
const MAX_TAG_SETTLE_ROUNDS: usize = 8;

/// Everything containers in one process share.
#[derive(Clone, Debug)]
pub struct EffectContext {
    pub domain: Rc<PredictionDomain>,
    pub handles: Rc<RefCell<EffectHandleArena>>,
    pub library: Rc<EffectLibrary>,
}

impl EffectContext {
    pub fn new(domain: Rc<PredictionDomain>, library: EffectLibrary) -> Self {
        Self {
            domain,
            handles: Rc::new(RefCell::new(HandleArena::new())),
            library: Rc::new(library),
        }
    }

    /// Container that still owns `handle`, if any.
    pub fn owner_of(&self, handle: EffectHandle) -> Option<Rc<RefCell<ActiveEffectsContainer>>> {
        self.handles.borrow().owner(handle.slot())
    }
}

/// Result of [`ActiveEffectsContainer::apply_effect`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new record was created.
    Added(EffectHandle),
    /// Merged into an existing stack.
    Stacked(EffectHandle),
    /// Instant effect executed against base values.
    Executed,
    NotApplied(SkipReason),
}

impl ApplyOutcome {
    pub fn handle(&self) -> Option<EffectHandle> {
        match self {
            ApplyOutcome::Added(h) | ApplyOutcome::Stacked(h) => Some(*h),
            _ => None,
        }
    }

    pub fn was_applied(&self) -> bool {
        !matches!(self, ApplyOutcome::NotApplied(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    ApplicationTagRequirements,
    /// Clients only apply effects under a live prediction key.
    NoPredictionKey,
    PeriodicNotPredicted,
    StackingNotPredicted,
    OverflowDenied,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EffectTimer {
    Duration(EffectHandle),
    Period(EffectHandle),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Removal {
    Explicit,
    Expired,
    Overflow,
    CaughtUp,
    Rejected,
    Replicated { premature: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CueDispatch {
    None,
    Fire { on_active: bool },
    Defer { on_active: bool, while_active: bool },
}

pub struct ActiveEffectsContainer {
    self_ref: Weak<RefCell<ActiveEffectsContainer>>,
    ctx: EffectContext,
    is_authority: bool,
    now: NetTime,

    effects: Vec<ActiveEffect>,
    pending_adds: Vec<ActiveEffect>,
    scope_lock: u32,
    pending_removes: usize,

    tags: TagCountContainer,
    attributes: AttributeSet,
    aggregators: BTreeMap<Attribute, Aggregator>,
    batch_depth: u32,
    dirty_attributes: BTreeSet<Attribute>,

    in_net_update: bool,
    net_update_id: u64,
    pending_server_values: BTreeMap<Attribute, f64>,

    timers: TimerManager<EffectTimer>,
    events: Vec<EffectEvent>,
    deferred_resolutions: Rc<RefCell<Vec<(EffectHandle, KeyEvent)>>>,
    over_soft_limit: bool,

    next_replication_id: u32,
    sent_effects: BTreeMap<ConnectionId, BTreeMap<ReplicationId, u32>>,
    sent_attributes: BTreeMap<ConnectionId, BTreeMap<Attribute, f64>>,
    replicated_ids: BTreeMap<ReplicationId, EffectHandle>,

    /// Stacks whose overflow effects are being applied right now.
    overflowing: BTreeSet<EffectHandle>,
}

impl std::fmt::Debug for ActiveEffectsContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveEffectsContainer")
            .field("is_authority", &self.is_authority)
            .field("effects", &self.effects.len())
            .field("pending_adds", &self.pending_adds.len())
            .field("scope_lock", &self.scope_lock)
            .field("attributes", &self.attributes)
            .finish()
    }
}

impl Drop for ActiveEffectsContainer {
    fn drop(&mut self) {
        let Ok(mut handles) = self.ctx.handles.try_borrow_mut() else {
            warn!("handle arena busy; leaking slots of dropped container");
            return;
        };
        let released = self
            .effects
            .iter()
            .chain(self.pending_adds.iter())
            .filter(|e| handles.release(e.handle.slot()))
            .count();
        if released > 0 {
            trace!(released, "released handles of dropped container");
        }
    }
}

impl ActiveEffectsContainer {
    pub fn new(ctx: &EffectContext, is_authority: bool, attributes: AttributeSet) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                self_ref: self_ref.clone(),
                ctx: ctx.clone(),
                is_authority,
                now: NetTime::default(),
                effects: Vec::new(),
                pending_adds: Vec::new(),
                scope_lock: 0,
                pending_removes: 0,
                tags: TagCountContainer::new(),
                attributes,
                aggregators: BTreeMap::new(),
                batch_depth: 0,
                dirty_attributes: BTreeSet::new(),
                in_net_update: false,
                net_update_id: 0,
                pending_server_values: BTreeMap::new(),
                timers: TimerManager::new(),
                events: Vec::new(),
                deferred_resolutions: Rc::new(RefCell::new(Vec::new())),
                over_soft_limit: false,
                next_replication_id: 0,
                sent_effects: BTreeMap::new(),
                sent_attributes: BTreeMap::new(),
                replicated_ids: BTreeMap::new(),
                overflowing: BTreeSet::new(),
            })
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn is_authority(&self) -> bool {
        self.is_authority
    }

    pub fn now(&self) -> NetTime {
        self.now
    }

    pub fn context(&self) -> &EffectContext {
        &self.ctx
    }

    pub fn tags(&self) -> &TagCountContainer {
        &self.tags
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    /// Current (aggregated) value of `attribute`.
    pub fn attribute(&self, attribute: &Attribute) -> f64 {
        self.attributes.current(attribute)
    }

    pub fn base_value(&self, attribute: &Attribute) -> f64 {
        self.attributes.base(attribute)
    }

    /// Alive records, including ones still pending behind a scope lock.
    pub fn active_effects(&self) -> impl Iterator<Item = &ActiveEffect> {
        self.effects
            .iter()
            .chain(self.pending_adds.iter())
            .filter(|e| e.state.is_alive())
    }

    pub fn len(&self) -> usize {
        self.active_effects().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, handle: EffectHandle) -> Option<&ActiveEffect> {
        self.record(handle)
    }

    pub fn handles_named(&self, name: &str) -> Vec<EffectHandle> {
        self.active_effects()
            .filter(|e| e.name() == name)
            .map(|e| e.handle)
            .collect()
    }

    pub fn has_predicted_effect_with_key(&self, key: &PredictionKey) -> bool {
        self.active_effects()
            .any(|e| e.is_predicted() && e.prediction_key == *key)
    }

    pub fn is_scope_locked(&self) -> bool {
        self.scope_lock > 0
    }

    pub fn drain_events(&mut self) -> Vec<EffectEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether executing `spec` would leave every attribute it touches at or
    /// above zero. Used for ability costs.
    pub fn can_apply_attribute_modifiers(&self, spec: &EffectSpec) -> bool {
        spec.def.modifiers.iter().enumerate().all(|(index, modifier)| {
            let Some(magnitude) = spec.stacked_magnitude(index) else {
                return true;
            };
            let current = self.attributes.current(&modifier.attribute);
            modifier.op.apply_to_base(current, magnitude) >= 0.0
        })
    }

    // ------------------------------------------------------------------
    // Application
    // ------------------------------------------------------------------

    pub fn apply_effect_by_name(
        &mut self,
        name: &str,
        level: f64,
        key: PredictionKey,
    ) -> Result<ApplyOutcome, DefinitionError> {
        let def = self.ctx.library.get(name)?;
        Ok(self.apply_effect(EffectSpec::new(def, level), key))
    }

    /// Apply `spec` under `key`.
    ///
    /// On a client the key must be a live local key; the record is then
    /// predicted and undone or retired when the key resolves. Periodic
    /// effects and stacking are never predicted.
    pub fn apply_effect(&mut self, spec: EffectSpec, key: PredictionKey) -> ApplyOutcome {
        self.process_deferred_resolutions();
        self.batched(|this| this.apply_effect_inner(spec, key))
    }

    fn apply_effect_inner(&mut self, mut spec: EffectSpec, mut key: PredictionKey) -> ApplyOutcome {
        let def = Arc::clone(&spec.def);
        spec.capture_tags(&self.tags);

        if !def.application_tag_requirements.requirements_met(&self.tags) {
            debug!(effect = %def.name, "application tag requirements not met");
            return ApplyOutcome::NotApplied(SkipReason::ApplicationTagRequirements);
        }

        let predicting = !self.is_authority && key.is_valid_for_more_prediction();
        if !self.is_authority && !predicting {
            warn!(effect = %def.name, %key, "client cannot apply an effect without a live prediction key");
            return ApplyOutcome::NotApplied(SkipReason::NoPredictionKey);
        }

        if def.is_periodic() && key.is_valid_key() {
            if predicting {
                debug!(effect = %def.name, %key, "periodic effects are not predicted");
                return ApplyOutcome::NotApplied(SkipReason::PeriodicNotPredicted);
            }
            key = PredictionKey::invalid();
        }

        if let Some(stacking) = &def.stacking {
            if let Some(existing) = self.find_stackable(&def, spec.instigator, stacking.kind) {
                if !self.is_authority {
                    debug!(effect = %def.name, %key, "stacking is not predicted; waiting for the server");
                    return ApplyOutcome::NotApplied(SkipReason::StackingNotPredicted);
                }
                return self.stack_onto(existing, &spec, stacking);
            }
        }

        if def.is_instant() && self.is_authority {
            self.execute(&spec, EffectHandle::INVALID, false);
            return ApplyOutcome::Executed;
        }

        ApplyOutcome::Added(self.add_record(spec, key, predicting))
    }

    fn find_stackable(
        &self,
        def: &Arc<GameplayEffectDef>,
        instigator: Option<InstigatorId>,
        kind: StackingType,
    ) -> Option<EffectHandle> {
        self.active_effects()
            .find(|e| {
                (Arc::ptr_eq(&e.spec.def, def) || e.spec.def.name == def.name)
                    && (kind == StackingType::AggregateByTarget || e.spec.instigator == instigator)
            })
            .map(|e| e.handle)
    }

    fn stack_onto(
        &mut self,
        handle: EffectHandle,
        incoming: &EffectSpec,
        stacking: &StackingPolicy,
    ) -> ApplyOutcome {
        let Some(existing) = self.record(handle) else {
            return ApplyOutcome::NotApplied(SkipReason::OverflowDenied);
        };
        let old = existing.stack_count();

        if stacking.limit > 0 && old >= stacking.limit {
            let level = existing.spec.level;
            if !self.handle_stack_overflow(handle, level, stacking) {
                return ApplyOutcome::NotApplied(SkipReason::OverflowDenied);
            }
        }

        let mut new = old.saturating_add(incoming.stack_count.max(1));
        if stacking.limit > 0 {
            new = new.min(stacking.limit);
        }

        if new != old {
            self.change_stack_count(handle, new);
        }
        if stacking.duration_refresh == StackDurationRefreshPolicy::RefreshOnSuccessfulApplication {
            self.restart_duration(handle);
        }
        if stacking.period_reset == StackPeriodResetPolicy::ResetOnSuccessfulApplication {
            self.reset_period(handle);
        }
        if let Some(record) = self.record_mut(handle) {
            record.replication_version += 1;
        }
        ApplyOutcome::Stacked(handle)
    }

    /// Returns whether the overflowing application may still proceed.
    fn handle_stack_overflow(&mut self, handle: EffectHandle, level: f64, stacking: &StackingPolicy) -> bool {
        debug!(%handle, limit = stacking.limit, "stack overflow");

        if !self.overflowing.insert(handle) {
            warn!(%handle, "overflow effects re-entered the same stack; skipping");
        } else {
            for name in &stacking.overflow_effects {
                match self.ctx.library.get(name) {
                    Ok(def) => {
                        self.apply_effect_inner(EffectSpec::new(def, level), PredictionKey::invalid());
                    }
                    Err(err) => warn!(%err, "skipping overflow effect"),
                }
            }
            self.overflowing.remove(&handle);
        }

        let allow = !stacking.deny_overflow_application;
        if !allow && stacking.clear_stack_on_overflow {
            self.remove_internal(handle, Removal::Overflow);
        }
        allow
    }

    fn add_record(&mut self, mut spec: EffectSpec, key: PredictionKey, predicting: bool) -> EffectHandle {
        let handle = self.allocate_handle();
        let predicted_instant = predicting && spec.def.is_instant();

        // Duration may read attributes, so it is computed after capture.
        spec.duration = if predicted_instant {
            None
        } else {
            match spec.raw_duration(&self.attributes) {
                Some(duration) if duration <= 0.0 => {
                    let clamped = self.ctx.domain.config().min_duration_secs;
                    error!(
                        effect = %spec.def.name,
                        duration,
                        clamped,
                        "non-positive effect duration; clamping"
                    );
                    Some(clamped)
                }
                other => other,
            }
        };

        let replication_id = if self.is_authority {
            self.next_replication_id += 1;
            ReplicationId(self.next_replication_id)
        } else {
            ReplicationId::default()
        };

        let record = ActiveEffect {
            handle,
            replication_id,
            replication_version: 1,
            prediction_key: key,
            spec,
            state: if self.scope_lock > 0 {
                EffectState::Pending
            } else {
                EffectState::Inhibited
            },
            is_inhibited: true,
            origin: if predicting {
                EffectOrigin::LocalPredicted
            } else {
                EffectOrigin::Authority
            },
            start_world_time: self.now.world,
            start_server_time: self.now.server,
            duration_timer: TimerHandle::INVALID,
            period_timer: TimerHandle::INVALID,
            predicted_instant,
            superseded: false,
            pending_rep_on_active: false,
            pending_rep_while_active: false,
            corrupt: false,
        };
        let def = Arc::clone(&record.spec.def);
        let duration = record.spec.duration;
        let period = record.spec.period;
        self.insert_record(record);

        self.events.push(EffectEvent::Applied {
            handle,
            effect: def.name.clone(),
            predicted: predicting,
        });

        if self.is_authority {
            if let Some(duration) = duration {
                let timer = self.timers.set_timer(duration, EffectTimer::Duration(handle));
                if let Some(record) = self.record_mut(handle) {
                    record.duration_timer = timer;
                }
            }
            if let Some(period) = period {
                let timer = self.timers.set_looping_timer(period, EffectTimer::Period(handle));
                if let Some(record) = self.record_mut(handle) {
                    record.period_timer = timer;
                }
            }
        }

        if predicting {
            self.register_prediction_delegates(handle, key);
        }

        let mut flipped = false;
        if def.ongoing_tag_requirements.requirements_met(&self.tags) {
            flipped = self.set_inhibited(handle, false, CueDispatch::Fire { on_active: true });
        }

        if predicted_instant {
            self.emit_executed(handle, &def, true);
        }

        if self.is_authority && def.execute_periodic_on_application && def.is_periodic() {
            self.execute_periodic(handle);
        }

        if flipped {
            self.check_ongoing_tag_requirements_inner();
        }

        debug!(%handle, effect = %def.name, %key, predicting, "effect added");
        handle
    }

    fn insert_record(&mut self, record: ActiveEffect) {
        if self.scope_lock > 0 {
            self.pending_adds.push(record);
        } else {
            self.effects.push(record);
        }

        let live = self.effects.len() + self.pending_adds.len();
        let soft_limit = self.ctx.domain.config().effect_soft_limit;
        if live > soft_limit {
            if !self.over_soft_limit {
                warn!(live, soft_limit, "active effects exceed soft limit");
                self.over_soft_limit = true;
            }
        } else {
            self.over_soft_limit = false;
        }
    }

    fn allocate_handle(&mut self) -> EffectHandle {
        EffectHandle::from_slot(self.ctx.handles.borrow_mut().allocate(self.self_ref.clone()))
    }

    fn register_prediction_delegates(&mut self, handle: EffectHandle, key: PredictionKey) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let delegates = self.ctx.domain.delegates();

        let deferred = Rc::clone(&self.deferred_resolutions);
        delegates.new_rejected_delegate(
            key.current,
            bind_weak(&this, move |cell| {
                resolve_prediction(cell, &deferred, handle, KeyEvent::Rejected)
            }),
        );

        let deferred = Rc::clone(&self.deferred_resolutions);
        delegates.new_caught_up_delegate(
            key.current,
            bind_weak(&this, move |cell| {
                resolve_prediction(cell, &deferred, handle, KeyEvent::CaughtUp)
            }),
        );
    }

    /// Key resolutions that arrived while the container was busy.
    pub fn process_deferred_resolutions(&mut self) {
        let queued = std::mem::take(&mut *self.deferred_resolutions.borrow_mut());
        for (handle, event) in queued {
            self.on_prediction_resolved(handle, event);
        }
    }

    fn on_prediction_resolved(&mut self, handle: EffectHandle, event: KeyEvent) {
        let Some(record) = self.record_mut(handle).filter(|r| r.state.is_alive()) else {
            debug!(%handle, ?event, "prediction resolved for an effect that is already gone");
            return;
        };
        record.prediction_key.mark_stale();
        let key = record.prediction_key;
        let effect = record.name().to_string();

        match event {
            KeyEvent::CaughtUp => {
                debug!(%handle, %key, %effect, "retiring caught-up predicted effect");
                self.batched(|this| this.remove_internal(handle, Removal::CaughtUp));
            }
            KeyEvent::Rejected => {
                warn!(%handle, %key, %effect, "predicted effect rejected; rolling back");
                self.batched(|this| this.remove_internal(handle, Removal::Rejected));
            }
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn execute(&mut self, spec: &EffectSpec, handle: EffectHandle, predicted: bool) {
        for (index, modifier) in spec.def.modifiers.iter().enumerate() {
            let Some(magnitude) = spec.stacked_magnitude(index) else {
                continue;
            };
            let base = self.attributes.base(&modifier.attribute);
            let updated = modifier.op.apply_to_base(base, magnitude);
            self.set_base_value(&modifier.attribute, updated);
        }
        self.emit_executed(handle, &spec.def, predicted);
    }

    fn emit_executed(&mut self, handle: EffectHandle, def: &GameplayEffectDef, predicted: bool) {
        self.events.push(EffectEvent::Executed {
            handle,
            effect: def.name.clone(),
            predicted,
        });
        self.push_cues(handle, &def.cues, CueKind::Executed, predicted);
    }

    fn execute_periodic(&mut self, handle: EffectHandle) {
        let Some(record) = self.record(handle) else {
            return;
        };
        if !record.state.is_alive() || record.is_inhibited {
            trace!(%handle, "skipping periodic execution of inhibited effect");
            return;
        }
        let spec = record.spec.clone();
        self.execute(&spec, handle, false);
    }

    fn set_base_value(&mut self, attribute: &Attribute, base: f64) {
        self.attributes.set_base(attribute, base);
        if let Some(aggregator) = self.aggregators.get_mut(attribute) {
            aggregator.set_base(base);
        }
        self.mark_dirty(attribute);
    }

    // ------------------------------------------------------------------
    // Inhibition
    // ------------------------------------------------------------------

    /// Add `delta` references to a tag that is not granted by any effect.
    pub fn update_loose_tag(&mut self, tag: &GameplayTag, delta: i32) {
        self.process_deferred_resolutions();
        if self.tags.update_count(tag, delta) {
            self.check_ongoing_tag_requirements();
        }
    }

    /// Re-evaluate every record's ongoing tag requirements against the
    /// owner's tags and toggle inhibition where it changed. All resulting
    /// attribute changes are evaluated once, after every record was visited.
    pub fn check_ongoing_tag_requirements(&mut self) {
        self.batched(|this| this.check_ongoing_tag_requirements_inner());
    }

    fn check_ongoing_tag_requirements_inner(&mut self) {
        for _ in 0..MAX_TAG_SETTLE_ROUNDS {
            let flipped = self.with_scope_lock(|this| {
                let mut flipped = false;
                for handle in this.live_handles() {
                    let Some(record) = this.record(handle) else {
                        continue;
                    };
                    if record.superseded || record.corrupt {
                        continue;
                    }
                    let should_inhibit = !record
                        .spec
                        .def
                        .ongoing_tag_requirements
                        .requirements_met(&this.tags);
                    if should_inhibit != record.is_inhibited {
                        flipped |= this.set_inhibited(handle, should_inhibit, CueDispatch::Fire { on_active: false });
                    }
                }
                flipped
            });
            if !flipped {
                return;
            }
        }
        warn!(rounds = MAX_TAG_SETTLE_ROUNDS, "ongoing tag requirements did not settle");
    }

    /// Returns whether any owner tag presence flipped.
    fn set_inhibited(&mut self, handle: EffectHandle, inhibited: bool, cues: CueDispatch) -> bool {
        let Some(record) = self.record_mut(handle) else {
            return false;
        };
        if record.is_inhibited == inhibited {
            return false;
        }
        record.is_inhibited = inhibited;
        if record.state != EffectState::Pending {
            record.state = if inhibited {
                EffectState::Inhibited
            } else {
                EffectState::Active
            };
        }

        if inhibited {
            self.events.push(EffectEvent::Inhibited { handle });
            self.detach(handle, true)
        } else {
            if cues == (CueDispatch::Fire { on_active: false }) {
                self.events.push(EffectEvent::Uninhibited { handle });
            }
            self.attach(handle, cues)
        }
    }

    fn attach(&mut self, handle: EffectHandle, cues: CueDispatch) -> bool {
        let Some(record) = self.record(handle) else {
            return false;
        };
        let def = Arc::clone(&record.spec.def);
        let predicted = record.is_predicted();
        let predicted_instant = record.predicted_instant;
        let mods: Vec<_> = def
            .modifiers
            .iter()
            .enumerate()
            .filter_map(|(i, m)| record.spec.stacked_magnitude(i).map(|mag| (i, m.attribute.clone(), m.op, mag)))
            .collect();

        let mut flipped = false;
        for tag in &def.granted_tags {
            flipped |= self.tags.update_count(tag, 1);
        }
        for (index, attribute, op, magnitude) in mods {
            let base = self.attributes.base(&attribute);
            self.aggregators
                .entry(attribute.clone())
                .or_insert_with(|| Aggregator::new(base))
                .set_mod(handle, index, op, magnitude, predicted);
            self.mark_dirty(&attribute);
        }

        if predicted_instant {
            return flipped;
        }
        match cues {
            CueDispatch::None => {}
            CueDispatch::Fire { on_active } => {
                if on_active {
                    self.push_cues(handle, &def.cues, CueKind::OnActive, predicted);
                }
                self.push_cues(handle, &def.cues, CueKind::WhileActive, predicted);
            }
            CueDispatch::Defer {
                on_active,
                while_active,
            } => {
                if let Some(record) = self.record_mut(handle) {
                    record.pending_rep_on_active = on_active;
                    record.pending_rep_while_active = while_active;
                }
            }
        }
        flipped
    }

    fn detach(&mut self, handle: EffectHandle, removed_cue: bool) -> bool {
        let Some(record) = self.record(handle) else {
            return false;
        };
        let def = Arc::clone(&record.spec.def);
        let predicted = record.is_predicted();
        let predicted_instant = record.predicted_instant;

        let mut flipped = false;
        for tag in &def.granted_tags {
            flipped |= self.tags.update_count(tag, -1);
        }
        for modifier in &def.modifiers {
            let removed = self
                .aggregators
                .get_mut(&modifier.attribute)
                .is_some_and(|agg| agg.remove_mods(handle));
            if removed {
                self.mark_dirty(&modifier.attribute);
            }
        }

        if removed_cue && !predicted_instant {
            self.push_cues(handle, &def.cues, CueKind::Removed, predicted);
        }
        flipped
    }

    fn push_cues(&mut self, handle: EffectHandle, tags: &[GameplayTag], kind: CueKind, predicted: bool) {
        for tag in tags {
            self.events.push(EffectEvent::Cue(CueEvent {
                tag: tag.clone(),
                kind,
                handle,
                predicted,
            }));
        }
    }

    // ------------------------------------------------------------------
    // Stacks, levels and timers
    // ------------------------------------------------------------------

    pub fn set_active_effect_level(&mut self, handle: EffectHandle, level: f64) -> bool {
        self.process_deferred_resolutions();
        let Some(record) = self.record_mut(handle).filter(|r| r.state.is_alive()) else {
            warn!(%handle, "set level: no such active effect");
            return false;
        };
        record.spec.set_level(level);
        record.replication_version += 1;
        self.batched(|this| this.reapply_modifiers(handle));
        true
    }

    fn change_stack_count(&mut self, handle: EffectHandle, new: u32) {
        let Some(record) = self.record_mut(handle) else {
            return;
        };
        let old = record.spec.stack_count;
        record.spec.stack_count = new;
        record.replication_version += 1;
        self.reapply_modifiers(handle);
        self.events.push(EffectEvent::StackChanged { handle, old, new });
    }

    fn reapply_modifiers(&mut self, handle: EffectHandle) {
        let Some(record) = self.record(handle) else {
            return;
        };
        if !record.drives_side_effects() {
            return;
        }
        let predicted = record.is_predicted();
        let mods: Vec<_> = record
            .spec
            .def
            .modifiers
            .iter()
            .enumerate()
            .filter_map(|(i, m)| record.spec.stacked_magnitude(i).map(|mag| (i, m.attribute.clone(), m.op, mag)))
            .collect();

        for (index, attribute, op, magnitude) in mods {
            let base = self.attributes.base(&attribute);
            self.aggregators
                .entry(attribute.clone())
                .or_insert_with(|| Aggregator::new(base))
                .set_mod(handle, index, op, magnitude, predicted);
            self.mark_dirty(&attribute);
        }
    }

    fn restart_duration(&mut self, handle: EffectHandle) {
        let now = self.now;
        let is_authority = self.is_authority;
        let Some(record) = self.record_mut(handle) else {
            return;
        };
        record.start_world_time = now.world;
        record.start_server_time = now.server;
        record.replication_version += 1;
        let (old_timer, duration) = (record.duration_timer, record.spec.duration);

        self.timers.clear(old_timer);
        if let (true, Some(duration)) = (is_authority, duration) {
            let timer = self.timers.set_timer(duration, EffectTimer::Duration(handle));
            if let Some(record) = self.record_mut(handle) {
                record.duration_timer = timer;
            }
        }
    }

    fn reset_period(&mut self, handle: EffectHandle) {
        let Some(record) = self.record(handle) else {
            return;
        };
        let (old_timer, period) = (record.period_timer, record.spec.period);
        if !self.is_authority || period.is_none() {
            return;
        }
        self.timers.clear(old_timer);
        if let Some(period) = period {
            let timer = self.timers.set_looping_timer(period, EffectTimer::Period(handle));
            if let Some(record) = self.record_mut(handle) {
                record.period_timer = timer;
            }
        }
    }

    /// Advance the clocks and run every timer that came due.
    pub fn tick(&mut self, now: NetTime) {
        self.process_deferred_resolutions();
        self.now = now;
        let fired = self.timers.advance(now.world);
        if fired.is_empty() {
            return;
        }

        self.batched(|this| {
            this.with_scope_lock(|this| {
                for (_, timer) in fired {
                    match timer {
                        EffectTimer::Duration(handle) => this.on_duration_expired(handle),
                        EffectTimer::Period(handle) => this.execute_periodic(handle),
                    }
                }
            })
        });
    }

    fn on_duration_expired(&mut self, handle: EffectHandle) {
        let Some(record) = self.record(handle).filter(|r| r.state.is_alive()) else {
            return;
        };
        let stacks = record.stack_count();
        let policy = record
            .spec
            .def
            .stacking
            .as_ref()
            .map(|s| s.expiration)
            .unwrap_or_default();

        match policy {
            StackExpirationPolicy::ClearEntireStack => {
                self.remove_internal(handle, Removal::Expired);
            }
            StackExpirationPolicy::RemoveSingleStackAndRefreshDuration if stacks > 1 => {
                self.change_stack_count(handle, stacks - 1);
                self.restart_duration(handle);
            }
            StackExpirationPolicy::RemoveSingleStackAndRefreshDuration => {
                self.remove_internal(handle, Removal::Expired);
            }
            StackExpirationPolicy::RefreshDuration => self.restart_duration(handle),
        }
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Remove `stacks_to_remove` stacks, or the whole record for `None` or a
    /// count covering every stack. Unknown or already removed handles are a
    /// logged no-op.
    pub fn remove_effect(&mut self, handle: EffectHandle, stacks_to_remove: Option<u32>) -> bool {
        self.process_deferred_resolutions();
        self.batched(|this| {
            let Some(record) = this.record(handle).filter(|r| r.state.is_alive()) else {
                warn!(%handle, "remove: no such active effect");
                return false;
            };
            let stacks = record.stack_count();
            match stacks_to_remove {
                Some(0) => false,
                Some(n) if n < stacks => {
                    this.change_stack_count(handle, stacks - n);
                    true
                }
                _ => this.remove_internal(handle, Removal::Explicit),
            }
        })
    }

    fn remove_internal(&mut self, handle: EffectHandle, removal: Removal) -> bool {
        let server_now = self.now.server;
        let Some(record) = self.record_mut(handle) else {
            warn!(%handle, ?removal, "remove: no such effect");
            return false;
        };
        if !record.state.is_alive() {
            warn!(%handle, ?removal, "remove: effect already being removed");
            return false;
        }

        let was_driving = record.drives_side_effects();
        let notify = !matches!(removal, Removal::CaughtUp);
        let premature = match removal {
            Removal::Expired => false,
            Removal::Replicated { premature } => premature,
            _ => record.is_premature_at(server_now),
        };
        let timers = [record.duration_timer, record.period_timer];
        let replication_id = record.replication_id;
        let origin = record.origin;
        let stack_count = record.stack_count();
        let effect = record.name().to_string();
        record.state = EffectState::PendingRemove;

        for timer in timers {
            self.timers.clear(timer);
        }

        let flipped = if was_driving {
            self.detach(handle, notify)
        } else {
            false
        };

        if notify {
            self.events.push(EffectEvent::Removed {
                handle,
                effect: effect.clone(),
                premature,
                stack_count,
            });
        }

        if origin == EffectOrigin::Replicated {
            self.replicated_ids.remove(&replication_id);
        }
        self.ctx.handles.borrow_mut().release(handle.slot());

        if self.scope_lock > 0 {
            self.pending_removes += 1;
        } else {
            self.erase(handle);
        }

        debug!(%handle, %effect, ?removal, premature, "effect removed");

        if flipped {
            self.check_ongoing_tag_requirements_inner();
        }
        true
    }

    fn erase(&mut self, handle: EffectHandle) {
        if let Some(index) = self.effects.iter().position(|e| e.handle == handle) {
            self.effects.remove(index);
        } else if let Some(index) = self.pending_adds.iter().position(|e| e.handle == handle) {
            self.pending_adds.remove(index);
        }
    }

    // ------------------------------------------------------------------
    // Scope lock and batching
    // ------------------------------------------------------------------

    /// Run `f` with structural changes deferred. Adds made inside are queued
    /// as pending and removals only marked; both are applied once the
    /// outermost lock is released.
    pub fn with_scope_lock<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.scope_lock += 1;
        let result = f(self);
        self.scope_lock -= 1;
        if self.scope_lock == 0 {
            self.flush_scope_lock();
        }
        result
    }

    fn flush_scope_lock(&mut self) {
        if self.pending_removes > 0 {
            self.effects.retain(|e| e.state != EffectState::PendingRemove);
            self.pending_adds.retain(|e| e.state != EffectState::PendingRemove);
            self.pending_removes = 0;
        }

        for mut record in self.pending_adds.drain(..) {
            if record.state == EffectState::Pending {
                record.state = if record.is_inhibited {
                    EffectState::Inhibited
                } else {
                    EffectState::Active
                };
            }
            self.effects.push(record);
        }
    }

    fn batched<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.batch_depth += 1;
        let result = f(self);
        self.batch_depth -= 1;
        if self.batch_depth == 0 {
            self.flush_dirty_attributes();
        }
        result
    }

    fn mark_dirty(&mut self, attribute: &Attribute) {
        self.dirty_attributes.insert(attribute.clone());
        if self.batch_depth == 0 {
            self.flush_dirty_attributes();
        }
    }

    fn flush_dirty_attributes(&mut self) {
        let dirty = std::mem::take(&mut self.dirty_attributes);
        for attribute in dirty {
            let base = self.attributes.base(&attribute);
            let aggregator = self
                .aggregators
                .entry(attribute.clone())
                .or_insert_with(|| Aggregator::new(base));

            if let Some(server_value) = self.pending_server_values.remove(&attribute) {
                if !self.is_authority && aggregator.net_update_id() != self.net_update_id {
                    let base = aggregator.reverse_evaluate(server_value, false);
                    aggregator.set_base(base);
                    aggregator.set_net_update_id(self.net_update_id);
                    self.attributes.set_base(&attribute, base);
                }
            }

            let new = aggregator.evaluate(true);
            let old = self.attributes.set_current(&attribute, new);
            if (old - new).abs() > f64::EPSILON {
                trace!(%attribute, old, new, "attribute changed");
                self.events.push(EffectEvent::AttributeChanged {
                    attribute,
                    old,
                    new,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Record access
    // ------------------------------------------------------------------

    fn record(&self, handle: EffectHandle) -> Option<&ActiveEffect> {
        self.effects
            .iter()
            .chain(self.pending_adds.iter())
            .find(|e| e.handle == handle && e.state != EffectState::Removed)
    }

    fn record_mut(&mut self, handle: EffectHandle) -> Option<&mut ActiveEffect> {
        self.effects
            .iter_mut()
            .chain(self.pending_adds.iter_mut())
            .find(|e| e.handle == handle && e.state != EffectState::Removed)
    }

    fn live_handles(&self) -> Vec<EffectHandle> {
        self.active_effects().map(|e| e.handle).collect()
    }

    /// Current state of `handle`, as seen from outside.
    pub fn effect_state(&self, handle: EffectHandle) -> EffectState {
        self.record(handle).map_or(EffectState::Removed, |e| e.state)
    }
}

fn resolve_prediction(
    cell: &RefCell<ActiveEffectsContainer>,
    deferred: &RefCell<Vec<(EffectHandle, KeyEvent)>>,
    handle: EffectHandle,
    event: KeyEvent,
) {
    match cell.try_borrow_mut() {
        Ok(mut container) => container.on_prediction_resolved(handle, event),
        Err(_) => {
            debug!(%handle, ?event, "container busy; deferring key resolution");
            deferred.borrow_mut().push((handle, event));
        }
    }
}
