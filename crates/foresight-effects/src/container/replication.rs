//! Delta replication of effect records and attribute values.
//!
//! The authority keeps, per connection, the replication versions it last sent
//! and diffs against them. Prediction keys are filtered per connection, so a
//! key only ever reaches the client that produced it (or everyone, for
//! server-initiated keys).
//!
//! The receiving side applies a delta inside a network update: removals, then
//! adds, then changes. Attribute values from the same update are held until
//! the update ends, and cues of newly received records wait until then too.

use std::collections::BTreeMap;
use std::sync::Arc;

use foresight_core::{ConnectionId, GameplayTag, PredictionKey, WireKey, WireTarget};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{ActiveEffectsContainer, CueDispatch, Removal};
use crate::active::{ActiveEffect, EffectHandle, EffectOrigin, EffectState, ReplicationId};
use crate::attribute::Attribute;
use crate::events::{CueKind, EffectEvent};
use crate::spec::{EffectSpec, InstigatorId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedEffect {
    pub replication_id: ReplicationId,
    pub version: u32,
    pub effect: String,
    pub level: f64,
    pub stack_count: u32,
    pub duration: Option<f64>,
    pub period: Option<f64>,
    pub modifier_magnitudes: Vec<f64>,
    pub prediction_key: WireKey,
    pub start_server_time: f64,
    pub instigator: Option<InstigatorId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_tags: Vec<GameplayTag>,
}

impl ReplicatedEffect {
    fn from_record(record: &ActiveEffect, target: WireTarget) -> Self {
        Self {
            replication_id: record.replication_id,
            version: record.replication_version,
            effect: record.name().to_string(),
            level: record.spec.level,
            stack_count: record.spec.stack_count,
            duration: record.spec.duration,
            period: record.spec.period,
            modifier_magnitudes: record.spec.modifier_magnitudes.clone(),
            prediction_key: record.prediction_key.to_wire(target),
            start_server_time: record.start_server_time,
            instigator: record.spec.instigator,
            source_tags: record.spec.captured_source_tags.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectDelta {
    pub added: Vec<ReplicatedEffect>,
    pub changed: Vec<ReplicatedEffect>,
    pub removed: Vec<ReplicationId>,
}

impl EffectDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedAttribute {
    pub attribute: Attribute,
    pub value: f64,
}

impl ActiveEffectsContainer {
    // ------------------------------------------------------------------
    // Authority side
    // ------------------------------------------------------------------

    /// Changes to authoritative records since the last delta for `conn`.
    pub fn replication_delta(&mut self, conn: ConnectionId) -> EffectDelta {
        if !self.is_authority {
            return EffectDelta::default();
        }

        let target = WireTarget::Client(conn);
        let sent = self.sent_effects.entry(conn).or_default();
        let mut current = BTreeMap::new();
        let mut delta = EffectDelta::default();

        for record in self
            .effects
            .iter()
            .chain(self.pending_adds.iter())
            .filter(|e| e.state.is_alive() && e.origin == EffectOrigin::Authority)
        {
            current.insert(record.replication_id, record.replication_version);
            match sent.get(&record.replication_id) {
                None => delta.added.push(ReplicatedEffect::from_record(record, target)),
                Some(version) if *version != record.replication_version => {
                    delta.changed.push(ReplicatedEffect::from_record(record, target))
                }
                Some(_) => {}
            }
        }

        delta.removed = sent
            .keys()
            .filter(|id| !current.contains_key(id))
            .copied()
            .collect();
        *sent = current;
        delta
    }

    /// Current attribute values that changed since the last call for `conn`.
    pub fn attribute_delta(&mut self, conn: ConnectionId) -> Vec<ReplicatedAttribute> {
        if !self.is_authority {
            return Vec::new();
        }

        let sent = self.sent_attributes.entry(conn).or_default();
        let mut changed = Vec::new();
        for (attribute, value) in self.attributes.iter() {
            if sent.get(attribute) != Some(&value.current) {
                sent.insert(attribute.clone(), value.current);
                changed.push(ReplicatedAttribute {
                    attribute: attribute.clone(),
                    value: value.current,
                });
            }
        }
        changed
    }

    // ------------------------------------------------------------------
    // Receiving side
    // ------------------------------------------------------------------

    /// Open a network update. Attribute evaluation and replicated cues are
    /// held until [`end_net_update`](Self::end_net_update).
    pub fn begin_net_update(&mut self) {
        if self.in_net_update {
            warn!("network update already open");
            return;
        }
        self.in_net_update = true;
        self.net_update_id += 1;
        self.batch_depth += 1;
    }

    pub fn end_net_update(&mut self) {
        if !self.in_net_update {
            warn!("end_net_update without begin_net_update");
            return;
        }
        self.process_deferred_resolutions();
        self.batch_depth -= 1;
        if self.batch_depth == 0 {
            self.flush_dirty_attributes();
        }
        self.in_net_update = false;
        self.flush_replicated_cues();
    }

    pub fn in_net_update(&self) -> bool {
        self.in_net_update
    }

    pub fn apply_effect_delta(&mut self, delta: &EffectDelta, from: ConnectionId) {
        if self.is_authority {
            warn!("authority ignores replicated effect deltas");
            return;
        }

        self.in_standalone_update(|this| {
            this.with_scope_lock(|this| {
                for id in &delta.removed {
                    this.pre_replicated_remove(*id);
                }
                for rep in &delta.added {
                    this.post_replicated_add(rep, from);
                }
                for rep in &delta.changed {
                    this.post_replicated_change(rep, from);
                }
            })
        });
    }

    /// Final attribute values as the authority sees them. Reconciled with
    /// local predictions when the network update ends.
    pub fn receive_attribute_values(&mut self, values: &[ReplicatedAttribute]) {
        if self.is_authority {
            warn!("authority ignores replicated attribute values");
            return;
        }

        self.in_standalone_update(|this| {
            for value in values {
                this.pending_server_values
                    .insert(value.attribute.clone(), value.value);
                this.mark_dirty(&value.attribute);
            }
        });
    }

    fn in_standalone_update(&mut self, f: impl FnOnce(&mut Self)) {
        let standalone = !self.in_net_update;
        if standalone {
            self.begin_net_update();
        }
        f(self);
        if standalone {
            self.end_net_update();
        }
    }

    fn pre_replicated_remove(&mut self, id: ReplicationId) {
        let Some(handle) = self.replicated_ids.get(&id).copied() else {
            debug!(?id, "remove for unknown replicated effect");
            return;
        };
        let premature = self
            .record(handle)
            .map_or(true, |r| r.is_premature_at(self.now.server));
        self.remove_internal(handle, Removal::Replicated { premature });
    }

    fn post_replicated_add(&mut self, rep: &ReplicatedEffect, from: ConnectionId) {
        if self.replicated_ids.contains_key(&rep.replication_id) {
            debug!(id = ?rep.replication_id, "duplicate replicated add; treating as change");
            self.post_replicated_change(rep, from);
            return;
        }

        let def = match self.ctx.library.get(&rep.effect) {
            Ok(def) => def,
            Err(err) => {
                error!(%err, "dropping replicated effect");
                return;
            }
        };

        let key = if rep.prediction_key.is_valid() {
            PredictionKey::from_wire(rep.prediction_key, from)
        } else {
            PredictionKey::invalid()
        };

        let mut spec = EffectSpec::new(Arc::clone(&def), rep.level);
        spec.stack_count = rep.stack_count;
        spec.duration = rep.duration;
        spec.period = rep.period;
        spec.instigator = rep.instigator;
        spec.captured_source_tags = rep.source_tags.clone();
        spec.captured_target_tags = self.tags.explicit_tags().cloned().collect();

        let corrupt = rep.modifier_magnitudes.len() != def.modifiers.len();
        if corrupt {
            error!(
                effect = %def.name,
                expected = def.modifiers.len(),
                received = rep.modifier_magnitudes.len(),
                "replicated modifier count does not match definition; clearing modifiers"
            );
            spec.modifier_magnitudes.clear();
        } else {
            spec.modifier_magnitudes = rep.modifier_magnitudes.clone();
        }

        // My own prediction, confirmed: the replicated record takes over.
        let twin = if key.is_valid_key() {
            self.find_predicted_twin(&key)
        } else {
            None
        };
        let mut flipped = false;
        if let Some(twin) = twin {
            debug!(%twin, %key, effect = %def.name, "replicated effect confirms predicted effect");
            flipped |= self.supersede(twin);
        }

        let age = self.now.server - rep.start_server_time;
        let recent = age.abs() < self.ctx.domain.config().max_rep_cue_delta_secs;

        let handle = self.allocate_handle();
        let record = ActiveEffect {
            handle,
            replication_id: rep.replication_id,
            replication_version: rep.version,
            prediction_key: key,
            spec,
            state: if self.scope_lock > 0 {
                EffectState::Pending
            } else {
                EffectState::Inhibited
            },
            is_inhibited: true,
            origin: EffectOrigin::Replicated,
            start_world_time: self.now.world - age,
            start_server_time: rep.start_server_time,
            duration_timer: foresight_core::TimerHandle::INVALID,
            period_timer: foresight_core::TimerHandle::INVALID,
            predicted_instant: false,
            superseded: false,
            pending_rep_on_active: false,
            pending_rep_while_active: false,
            corrupt,
        };
        self.insert_record(record);
        self.replicated_ids.insert(rep.replication_id, handle);
        self.events.push(EffectEvent::Applied {
            handle,
            effect: def.name.clone(),
            predicted: false,
        });

        if !corrupt && def.ongoing_tag_requirements.requirements_met(&self.tags) {
            let cues = if twin.is_some() {
                CueDispatch::None
            } else {
                CueDispatch::Defer {
                    on_active: recent,
                    while_active: true,
                }
            };
            flipped |= self.set_inhibited(handle, false, cues);
        }

        if flipped {
            self.check_ongoing_tag_requirements_inner();
        }
    }

    fn post_replicated_change(&mut self, rep: &ReplicatedEffect, from: ConnectionId) {
        let Some(handle) = self.replicated_ids.get(&rep.replication_id).copied() else {
            warn!(id = ?rep.replication_id, "change for unknown replicated effect; treating as add");
            self.post_replicated_add(rep, from);
            return;
        };

        let world_now = self.now.world;
        let server_now = self.now.server;
        let Some(record) = self.record_mut(handle) else {
            return;
        };
        if record.replication_version == rep.version {
            return;
        }
        record.replication_version = rep.version;

        if rep.modifier_magnitudes.len() != record.spec.def.modifiers.len() {
            error!(
                effect = %record.name(),
                expected = record.spec.def.modifiers.len(),
                received = rep.modifier_magnitudes.len(),
                "replicated modifier count does not match definition; clearing modifiers"
            );
            let driving = record.drives_side_effects();
            record.spec.modifier_magnitudes.clear();
            if driving {
                self.detach(handle, false);
            }
            if let Some(record) = self.record_mut(handle) {
                record.corrupt = true;
            }
            return;
        }

        let old = record.spec.stack_count;
        record.spec.level = rep.level;
        record.spec.stack_count = rep.stack_count;
        record.spec.modifier_magnitudes = rep.modifier_magnitudes.clone();
        record.spec.duration = rep.duration;
        record.spec.period = rep.period;
        if record.start_server_time != rep.start_server_time {
            record.start_server_time = rep.start_server_time;
            record.start_world_time = world_now - (server_now - rep.start_server_time);
        }
        let new = record.spec.stack_count;

        self.reapply_modifiers(handle);
        if old != new {
            self.events
                .push(EffectEvent::StackChanged { handle, old, new });
        }
    }

    fn find_predicted_twin(&self, key: &PredictionKey) -> Option<EffectHandle> {
        self.active_effects()
            .find(|e| {
                e.is_predicted()
                    && !e.superseded
                    && e.prediction_key.was_locally_generated()
                    && e.prediction_key == *key
            })
            .map(|e| e.handle)
    }

    /// Hand a predicted record's side effects over to its replicated twin.
    /// Detaches silently; the record itself stays until its key resolves.
    fn supersede(&mut self, handle: EffectHandle) -> bool {
        let Some(record) = self.record_mut(handle) else {
            return false;
        };
        let driving = record.drives_side_effects();
        let flipped = if driving {
            self.detach(handle, false)
        } else {
            false
        };
        if let Some(record) = self.record_mut(handle) {
            record.superseded = true;
        }
        flipped
    }

    fn flush_replicated_cues(&mut self) {
        let mut fire = Vec::new();
        for record in self
            .effects
            .iter_mut()
            .chain(self.pending_adds.iter_mut())
            .filter(|e| e.pending_rep_on_active || e.pending_rep_while_active)
        {
            if record.drives_side_effects() {
                fire.push((
                    record.handle,
                    Arc::clone(&record.spec.def),
                    record.pending_rep_on_active,
                    record.pending_rep_while_active,
                ));
            }
            record.pending_rep_on_active = false;
            record.pending_rep_while_active = false;
        }

        for (handle, def, on_active, while_active) in fire {
            if on_active {
                self.push_cues(handle, &def.cues, CueKind::OnActive, false);
            }
            if while_active {
                self.push_cues(handle, &def.cues, CueKind::WhileActive, false);
            }
        }
    }
}
