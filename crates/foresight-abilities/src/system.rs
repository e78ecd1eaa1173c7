//! One actor's abilities on one peer.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use foresight_core::{
    bind_weak, ConnectionId, KeyId, NetTime, PredictionDomain, PredictionKey, PredictionScope,
    ScopedPredictionWindow, WireKey, WireTarget,
};
use foresight_effects::{
    ActiveEffectsContainer, Attribute, AttributeSet, EffectContext, EffectSpec,
};
use foresight_protocol::{
    AbilityId, ClientMessage, EventPayload, ReplicatedEventKind, ReplicationUpdate, ServerMessage,
};
use tracing::{debug, info, trace, warn};

use crate::activation::{AbilitySpec, ActivationInfo, ActivationMode};
use crate::definition::{AbilityDef, EndPolicy, NetExecutionPolicy};
use crate::error::ActivationError;
use crate::events::AbilityEvent;
use crate::key_ring::{self, ReplicatedKeyRing};
use crate::replicated_events::ReplicatedEventCache;

/// Which copy of the actor this system drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetRole {
    /// Server copy of an actor controlled by a remote client.
    Authority { owner: ConnectionId },
    /// Server copy controlled on the server itself.
    LocalAuthority,
    /// The owning client's copy.
    AutonomousProxy { server: ConnectionId },
}

impl NetRole {
    pub fn is_authority(&self) -> bool {
        !matches!(self, NetRole::AutonomousProxy { .. })
    }

    pub fn is_locally_controlled(&self) -> bool {
        !matches!(self, NetRole::Authority { .. })
    }
}

/// How a successful activation attempt played out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    /// Ran on the authority under this key.
    Authority(PredictionKey),
    /// Ran on the client ahead of the server under this key.
    Predicted(PredictionKey),
    /// Ran locally with no server involvement.
    Local,
    /// Passed on to the server, which runs it first.
    Requested,
}

pub struct AbilitySystem {
    role: NetRole,
    ctx: EffectContext,
    effects: Rc<RefCell<ActiveEffectsContainer>>,
    scoped_key: PredictionKey,
    abilities: BTreeMap<AbilityId, AbilitySpec>,
    next_ability: u32,
    event_cache: ReplicatedEventCache,
    key_ring: ReplicatedKeyRing,
    to_server: Vec<ClientMessage>,
    to_client: Vec<ServerMessage>,
    events: Vec<AbilityEvent>,
    /// Predicted activations whose key caught up, checked at the end of the
    /// network update that caught them up.
    caught_up: Rc<RefCell<Vec<(AbilityId, KeyId)>>>,
}

impl std::fmt::Debug for AbilitySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbilitySystem")
            .field("role", &self.role)
            .field("abilities", &self.abilities.len())
            .field("scoped_key", &self.scoped_key)
            .finish_non_exhaustive()
    }
}

impl AbilitySystem {
    pub fn new(ctx: &EffectContext, role: NetRole, attributes: AttributeSet) -> Self {
        let effects = ActiveEffectsContainer::new(ctx, role.is_authority(), attributes);
        Self {
            role,
            ctx: ctx.clone(),
            effects,
            scoped_key: PredictionKey::invalid(),
            abilities: BTreeMap::new(),
            next_ability: 0,
            event_cache: ReplicatedEventCache::new(),
            key_ring: ReplicatedKeyRing::new(ctx.domain.config().replicated_key_slots),
            to_server: Vec::new(),
            to_client: Vec::new(),
            events: Vec::new(),
            caught_up: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn role(&self) -> NetRole {
        self.role
    }

    pub fn domain(&self) -> &Rc<PredictionDomain> {
        &self.ctx.domain
    }

    pub fn effects(&self) -> &Rc<RefCell<ActiveEffectsContainer>> {
        &self.effects
    }

    /// Current value of an attribute, predictions included.
    pub fn attribute(&self, name: &str) -> f64 {
        self.effects.borrow().attribute(&Attribute::new(name))
    }

    pub fn event_cache(&self) -> &ReplicatedEventCache {
        &self.event_cache
    }

    pub fn key_ring(&self) -> &ReplicatedKeyRing {
        &self.key_ring
    }

    /// Grant an ability. Peers that grant the same abilities in the same order
    /// agree on their ids.
    pub fn give_ability(&mut self, def: AbilityDef, level: f64) -> AbilityId {
        let id = AbilityId(self.next_ability);
        self.next_ability += 1;
        for effect in def.referenced_effects() {
            if let Err(err) = self.ctx.library.get(effect) {
                warn!(ability = %def.name, %err, "granted ability refers to an unknown effect");
            }
        }
        debug!(%id, name = %def.name, policy = ?def.net_execution, "ability granted");
        self.abilities
            .insert(id, AbilitySpec::new(id, Arc::new(def), level));
        id
    }

    pub fn find_ability(&self, name: &str) -> Option<AbilityId> {
        self.abilities
            .values()
            .find(|spec| spec.name() == name)
            .map(|spec| spec.id)
    }

    pub fn spec(&self, ability: AbilityId) -> Option<&AbilitySpec> {
        self.abilities.get(&ability)
    }

    pub fn is_active(&self, ability: AbilityId) -> bool {
        self.spec(ability).is_some_and(AbilitySpec::is_active)
    }

    pub fn activation(&self, ability: AbilityId) -> Option<ActivationInfo> {
        self.spec(ability).map(|spec| spec.activation)
    }

    pub fn take_messages_to_server(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.to_server)
    }

    pub fn take_messages_to_client(&mut self) -> Vec<ServerMessage> {
        std::mem::take(&mut self.to_client)
    }

    pub fn drain_events(&mut self) -> Vec<AbilityEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn tick(&mut self, now: NetTime) {
        self.effects.borrow_mut().tick(now);
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// Check everything that would stop `ability` from activating right now.
    pub fn can_activate(&self, ability: AbilityId) -> Result<(), ActivationError> {
        let spec = self.spec_or_err(ability)?;
        if spec.is_active() {
            return Err(ActivationError::AlreadyActive(ability));
        }

        let def = &spec.def;
        let effects = self.effects.borrow();
        let tags = effects.tags();
        if let Some(tag) = def
            .activation_blocked_tags
            .iter()
            .find(|tag| tags.has_tag(tag))
        {
            return Err(ActivationError::Blocked {
                ability,
                tag: tag.clone(),
            });
        }
        if let Some(tag) = def
            .activation_required_tags
            .iter()
            .find(|tag| !tags.has_tag(tag))
        {
            return Err(ActivationError::MissingTag {
                ability,
                tag: tag.clone(),
            });
        }
        if let Some(cooldown) = &def.cooldown_effect {
            let cooldown = self.ctx.library.get(cooldown)?;
            if tags.has_any(&cooldown.granted_tags) {
                return Err(ActivationError::Cooldown(ability));
            }
        }
        if let Some(cost) = &def.cost_effect {
            let cost = EffectSpec::new(self.ctx.library.get(cost)?, spec.level);
            if !effects.can_apply_attribute_modifiers(&cost) {
                return Err(ActivationError::Cost(ability));
            }
        }
        Ok(())
    }

    /// Activate an ability on behalf of the local player (or the server's own
    /// logic).
    pub fn try_activate_ability(&mut self, ability: AbilityId) -> Result<Activation, ActivationError> {
        let result = self.try_activate_local(ability);
        if let Err(err) = &result {
            let reason = err.failure_tag();
            debug!(%ability, %reason, %err, "activation failed");
            self.events
                .push(AbilityEvent::ActivationFailed { ability, reason });
        }
        result
    }

    fn try_activate_local(&mut self, ability: AbilityId) -> Result<Activation, ActivationError> {
        let policy = self.spec_or_err(ability)?.def.net_execution;
        if !self.role.is_authority()
            && matches!(
                policy,
                NetExecutionPolicy::ServerInitiated | NetExecutionPolicy::ServerOnly
            )
        {
            self.can_activate(ability)?;
            self.to_server.push(ClientMessage::ServerTryActivate {
                ability,
                key: WireKey::INVALID,
            });
            debug!(%ability, ?policy, "asking the server to activate");
            return Ok(Activation::Requested);
        }
        self.internal_try_activate(ability, PredictionKey::invalid())
    }

    fn internal_try_activate(
        &mut self,
        ability: AbilityId,
        key: PredictionKey,
    ) -> Result<Activation, ActivationError> {
        let policy = self.spec_or_err(ability)?.def.net_execution;
        let authority = self.role.is_authority();

        if !self.role.is_locally_controlled()
            && (policy == NetExecutionPolicy::LocalOnly
                || (policy == NetExecutionPolicy::LocalPredicted && !key.is_valid_key()))
        {
            return Err(ActivationError::NetworkPolicy { ability, policy });
        }
        if !authority
            && matches!(
                policy,
                NetExecutionPolicy::ServerInitiated | NetExecutionPolicy::ServerOnly
            )
        {
            return Err(ActivationError::NetworkPolicy { ability, policy });
        }
        self.can_activate(ability)?;

        if authority || policy == NetExecutionPolicy::LocalOnly {
            let key = if authority
                && (!key.is_valid_key()
                    || matches!(
                        policy,
                        NetExecutionPolicy::ServerInitiated | NetExecutionPolicy::ServerOnly
                    )) {
                self.ctx.domain.create_new_server_initiated_key(true)
            } else {
                key
            };
            if let Some(spec) = self.abilities.get_mut(&ability) {
                let mut info = ActivationInfo::new(authority);
                info.server_set_activation_key(key);
                spec.activation = info;
            }

            let mut window = ScopedPredictionWindow::with_key(self, key, true);
            if let NetRole::Authority { owner } = window.role {
                if policy != NetExecutionPolicy::ServerOnly {
                    window.to_client.push(ServerMessage::ClientActivateSucceeded {
                        ability,
                        key: key.to_wire(WireTarget::Client(owner)),
                    });
                }
            }
            window.activate(ability);
            return Ok(if authority {
                Activation::Authority(key)
            } else {
                Activation::Local
            });
        }

        // A locally predicted activation on the owning client.
        let mut window = ScopedPredictionWindow::predict(self, true);
        let key = window.key();
        if let Some(spec) = window.abilities.get_mut(&ability) {
            spec.activation = ActivationInfo::new(false);
            spec.activation.set_predicting(key);
        }
        window.to_server.push(ClientMessage::ServerTryActivate {
            ability,
            key: key.to_wire(WireTarget::Server),
        });
        let note = bind_weak(&window.caught_up, move |caught_up| {
            caught_up.borrow_mut().push((ability, key.current));
        });
        window
            .ctx
            .domain
            .delegates()
            .new_caught_up_delegate(key.current, note);
        window.activate(ability);
        Ok(Activation::Predicted(key))
    }

    /// Run an activation under the current scoped key.
    fn activate(&mut self, ability: AbilityId) {
        let key = self.scoped_key;
        let Some(spec) = self.abilities.get_mut(&ability) else {
            return;
        };
        spec.active_count += 1;
        let def = Arc::clone(&spec.def);
        let level = spec.level;
        let mode = spec.activation.mode();
        let activation_key = spec.activation.activation_key();

        for effect in def
            .cost_effect
            .iter()
            .chain(&def.cooldown_effect)
            .chain(&def.effects_on_activate)
        {
            self.apply_ability_effect(ability, effect, level, key);
        }
        self.update_owned_tags(&def, 1);
        debug!(%ability, name = %def.name, %key, ?mode, "ability activated");
        self.events.push(AbilityEvent::Activated {
            ability,
            key: activation_key,
            mode,
        });

        if let Some(wait) = &def.wait_for_event {
            if let Some(cached) =
                self.event_cache
                    .call_or_add_waiter(wait.event, ability, activation_key.current)
            {
                trace!(%ability, event = %wait.event, "replaying cached event");
                self.handle_wait_event(ability, wait.event, cached.current_key, cached.payload);
            }
        }

        if def.end_policy == EndPolicy::Immediately && self.is_active(ability) {
            let mirror = self.mirrors_implicit_end(def.net_execution);
            self.end_activation(ability, false, mirror);
        }
    }

    fn apply_ability_effect(&mut self, ability: AbilityId, effect: &str, level: f64, key: PredictionKey) {
        let outcome = self
            .effects
            .borrow_mut()
            .apply_effect_by_name(effect, level, key);
        match outcome {
            Ok(outcome) => trace!(%ability, effect, %key, ?outcome, "ability effect applied"),
            Err(err) => warn!(%ability, %err, "ability effect could not be applied"),
        }
    }

    fn update_owned_tags(&mut self, def: &AbilityDef, delta: i32) {
        if def.activation_owned_tags.is_empty() {
            return;
        }
        let mut effects = self.effects.borrow_mut();
        for tag in &def.activation_owned_tags {
            effects.update_loose_tag(tag, delta);
        }
    }

    // ------------------------------------------------------------------
    // End and cancel
    // ------------------------------------------------------------------

    pub fn end_ability(&mut self, ability: AbilityId) -> bool {
        self.end_activation(ability, false, true)
    }

    pub fn cancel_ability(&mut self, ability: AbilityId) -> bool {
        self.end_activation(ability, true, true)
    }

    /// The client never runs server-initiated logic, so ends the authority
    /// reaches on its own are mirrored explicitly.
    fn mirrors_implicit_end(&self, policy: NetExecutionPolicy) -> bool {
        self.role.is_authority() && policy == NetExecutionPolicy::ServerInitiated
    }

    fn end_activation(&mut self, ability: AbilityId, cancelled: bool, replicate: bool) -> bool {
        let Some(spec) = self.abilities.get(&ability) else {
            warn!(%ability, "end requested for an ability that is not granted");
            return false;
        };
        if !spec.is_active() {
            trace!(%ability, "end requested for an inactive ability");
            return false;
        }
        let def = Arc::clone(&spec.def);
        let activation_key = spec.activation.activation_key();

        if replicate && def.net_execution.replicates_end() {
            self.replicate_end(ability, activation_key, cancelled);
        }
        if let Some(spec) = self.abilities.get_mut(&ability) {
            spec.active_count = spec.active_count.saturating_sub(1);
        }
        self.update_owned_tags(&def, -1);
        self.event_cache.consume_all(ability, activation_key.current);
        debug!(%ability, cancelled, %activation_key, "ability ended");
        self.events.push(AbilityEvent::Ended { ability, cancelled });
        true
    }

    fn replicate_end(&mut self, ability: AbilityId, activation_key: PredictionKey, cancelled: bool) {
        match self.role {
            NetRole::Authority { owner } => {
                let activation_key = activation_key.to_wire(WireTarget::Client(owner));
                self.to_client.push(if cancelled {
                    ServerMessage::ClientCancelAbility {
                        ability,
                        activation_key,
                    }
                } else {
                    ServerMessage::ClientEndAbility {
                        ability,
                        activation_key,
                    }
                });
            }
            NetRole::AutonomousProxy { .. } => {
                let activation_key = activation_key.to_wire(WireTarget::Server);
                self.to_server.push(if cancelled {
                    ClientMessage::ServerCancelAbility {
                        ability,
                        activation_key,
                    }
                } else {
                    ClientMessage::ServerEndAbility {
                        ability,
                        activation_key,
                        key: self.scoped_key.to_wire(WireTarget::Server),
                    }
                });
            }
            NetRole::LocalAuthority => {}
        }
    }

    /// The other peer ended an activation; end ours if it is the same one.
    fn remote_end(&mut self, ability: AbilityId, activation_key: PredictionKey, cancelled: bool) {
        let same_activation = self.abilities.get(&ability).is_some_and(|spec| {
            spec.is_active() && spec.activation.activation_key() == activation_key
        });
        if !same_activation {
            debug!(%ability, %activation_key, cancelled, "remote end for an activation not running here");
            return;
        }
        self.end_activation(ability, cancelled, false);
    }

    // ------------------------------------------------------------------
    // Replicated events
    // ------------------------------------------------------------------

    /// Fire a generic event for an active ability from local input. On the
    /// owning client the event goes to the server and, for predicted
    /// abilities, its consequences are predicted under a fresh key. Returns
    /// whether a waiter on this peer handled it.
    pub fn invoke_local_event(
        &mut self,
        ability: AbilityId,
        event: ReplicatedEventKind,
        payload: Option<EventPayload>,
    ) -> bool {
        let Some(spec) = self.abilities.get(&ability) else {
            warn!(%ability, %event, "event for an ability that is not granted");
            return false;
        };
        if !spec.is_active() {
            debug!(%ability, %event, "event for an inactive ability dropped");
            return false;
        }
        let activation_key = spec.activation.activation_key();
        let predicted = spec.def.net_execution == NetExecutionPolicy::LocalPredicted;

        match self.role {
            NetRole::AutonomousProxy { .. } => {
                let mut window = ScopedPredictionWindow::predict(self, predicted);
                let current = window.key();
                window.to_server.push(ClientMessage::ServerSetReplicatedEvent {
                    event,
                    ability,
                    original_key: activation_key.to_wire(WireTarget::Server),
                    current_key: current.to_wire(WireTarget::Server),
                    payload,
                });
                predicted
                    && window.invoke_replicated_event(event, ability, activation_key, current, payload)
            }
            NetRole::Authority { .. } | NetRole::LocalAuthority => {
                let current = self.scoped_key;
                self.invoke_replicated_event(event, ability, activation_key, current, payload)
            }
        }
    }

    fn invoke_replicated_event(
        &mut self,
        event: ReplicatedEventKind,
        ability: AbilityId,
        original_key: PredictionKey,
        current_key: PredictionKey,
        payload: Option<EventPayload>,
    ) -> bool {
        if !self
            .event_cache
            .invoke(event, ability, original_key.current, current_key, payload)
        {
            return false;
        }
        self.handle_wait_event(ability, event, current_key, payload);
        true
    }

    fn handle_wait_event(
        &mut self,
        ability: AbilityId,
        event: ReplicatedEventKind,
        current_key: PredictionKey,
        payload: Option<EventPayload>,
    ) {
        let Some(spec) = self.abilities.get(&ability).filter(|spec| spec.is_active()) else {
            return;
        };
        let def = Arc::clone(&spec.def);
        let level = spec.level;
        let Some(wait) = def.wait_for_event.as_ref().filter(|wait| wait.event == event) else {
            return;
        };

        let mut window = ScopedPredictionWindow::with_key(self, current_key, false);
        let key = window.scoped_key;
        for effect in &wait.effects {
            window.apply_ability_effect(ability, effect, level, key);
        }
        debug!(%ability, %event, %key, "ability handled replicated event");
        window.events.push(AbilityEvent::EventHandled {
            ability,
            event,
            payload,
        });

        if def.end_policy == EndPolicy::AfterEvent {
            let mirror = window.mirrors_implicit_end(def.net_execution);
            window.end_activation(ability, false, mirror);
        }
    }

    // ------------------------------------------------------------------
    // Inbound RPCs
    // ------------------------------------------------------------------

    /// Server side: handle an RPC from the owning client.
    pub fn handle_client_message(&mut self, msg: ClientMessage) {
        let NetRole::Authority { owner } = self.role else {
            warn!(ability = %msg.ability(), "client message on a peer that does not serve a remote owner");
            return;
        };

        match msg {
            ClientMessage::ServerTryActivate { ability, key } => {
                self.server_try_activate(ability, PredictionKey::from_wire(key, owner));
            }
            ClientMessage::ServerSetReplicatedEvent {
                event,
                ability,
                original_key,
                current_key,
                payload,
            } => {
                let original_key = PredictionKey::from_wire(original_key, owner);
                let current_key = PredictionKey::from_wire(current_key, owner);
                let mut window = ScopedPredictionWindow::with_key(self, current_key, true);
                window.invoke_replicated_event(event, ability, original_key, current_key, payload);
            }
            ClientMessage::ServerEndAbility {
                ability,
                activation_key,
                key,
            } => {
                let key = PredictionKey::from_wire(key, owner);
                let mut window = ScopedPredictionWindow::with_key(self, key, true);
                window.remote_end(ability, PredictionKey::from_wire(activation_key, owner), false);
            }
            ClientMessage::ServerCancelAbility {
                ability,
                activation_key,
            } => {
                self.remote_end(ability, PredictionKey::from_wire(activation_key, owner), true);
            }
        }
    }

    fn server_try_activate(&mut self, ability: AbilityId, key: PredictionKey) {
        let mut window = ScopedPredictionWindow::with_key(self, key, true);
        if let Err(err) = window.internal_try_activate(ability, key) {
            let reason = err.failure_tag();
            info!(%ability, %key, %reason, %err, "refusing client activation");
            window.event_cache.consume_all(ability, key.current);
            window.to_client.push(ServerMessage::ClientActivateFailed {
                ability,
                key: key.current,
            });
            window
                .events
                .push(AbilityEvent::ActivationFailed { ability, reason });
        }
    }

    /// Client side: handle an RPC or replication update from the server.
    pub fn handle_server_message(&mut self, msg: ServerMessage) {
        let NetRole::AutonomousProxy { server } = self.role else {
            warn!("server message on a peer that is not an owning client");
            return;
        };

        match msg {
            ServerMessage::ClientActivateSucceeded { ability, key } => {
                self.client_activate_succeeded(ability, PredictionKey::from_wire(key, server));
            }
            ServerMessage::ClientActivateFailed { ability, key } => {
                self.client_activate_failed(ability, key);
            }
            ServerMessage::ClientEndAbility {
                ability,
                activation_key,
            } => self.remote_end(ability, PredictionKey::from_wire(activation_key, server), false),
            ServerMessage::ClientCancelAbility {
                ability,
                activation_key,
            } => self.remote_end(ability, PredictionKey::from_wire(activation_key, server), true),
            ServerMessage::Replication(update) => self.receive_replication(&update),
        }
    }

    fn client_activate_succeeded(&mut self, ability: AbilityId, key: PredictionKey) {
        let Some(spec) = self.abilities.get_mut(&ability) else {
            warn!(%ability, %key, "server confirmed an ability that is not granted");
            return;
        };

        if spec.def.net_execution == NetExecutionPolicy::LocalPredicted {
            if spec.activation.mode() == ActivationMode::Predicting
                && spec.activation.activation_key() == key
            {
                spec.activation.set_confirmed();
                debug!(%ability, %key, "predicted activation confirmed");
                self.events.push(AbilityEvent::Confirmed { ability, key });
            } else {
                trace!(%ability, %key, "confirmation for an activation no longer predicting");
            }
            return;
        }

        // Server-initiated: the client only mirrors the activation and its
        // owned tags. Effects arrive through replication.
        let def = Arc::clone(&spec.def);
        spec.active_count += 1;
        let mut info = ActivationInfo::new(false);
        if key.is_server_initiated() {
            info.server_set_activation_key(key);
        }
        spec.activation = info;
        self.update_owned_tags(&def, 1);
        debug!(%ability, %key, "server-initiated activation mirrored");
        self.events.push(AbilityEvent::Activated {
            ability,
            key,
            mode: ActivationMode::NonAuthority,
        });
    }

    fn client_activate_failed(&mut self, ability: AbilityId, key: KeyId) {
        if key > 0 {
            self.ctx.domain.delegates().reject(key);
            self.effects.borrow_mut().process_deferred_resolutions();
        }

        let Some(spec) = self.abilities.get_mut(&ability) else {
            warn!(%ability, key, "server refused an ability that is not granted");
            return;
        };
        let activation_key = spec.activation.activation_key();
        if activation_key.current != key {
            debug!(%ability, key, %activation_key, "refusal for an earlier activation");
            return;
        }
        spec.activation.set_rejected();
        warn!(%ability, key, "server rejected predicted activation");
        self.events.push(AbilityEvent::Rejected {
            ability,
            key: activation_key,
        });
        self.end_activation(ability, false, false);
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    pub fn begin_net_update(&mut self) {
        self.effects.borrow_mut().begin_net_update();
    }

    /// Close a network update: re-evaluate attributes and flush deferred cues,
    /// then look at activations the update caught up.
    pub fn end_net_update(&mut self) {
        self.effects.borrow_mut().end_net_update();

        let caught_up = std::mem::take(&mut *self.caught_up.borrow_mut());
        for (ability, key) in caught_up {
            let still_predicting = self.abilities.get(&ability).is_some_and(|spec| {
                spec.is_active()
                    && spec.activation.mode() == ActivationMode::Predicting
                    && spec.activation.activation_key().current == key
            });
            if still_predicting {
                info!(%ability, key, "activation caught up while still predicting");
            }
        }
    }

    /// Client side: apply one replication batch from the server.
    pub fn receive_replication(&mut self, update: &ReplicationUpdate) {
        let NetRole::AutonomousProxy { server } = self.role else {
            warn!(tick = update.tick, "replication update on a peer that is not an owning client");
            return;
        };

        self.begin_net_update();
        {
            let mut effects = self.effects.borrow_mut();
            effects.apply_effect_delta(&update.effects, server);
            effects.receive_attribute_values(&update.attributes);
        }
        key_ring::catch_up_received(
            self.ctx.domain.delegates(),
            &update.prediction_keys,
            self.ctx.domain.config().catch_up_older_keys,
        );
        self.end_net_update();
    }

    /// Server side: everything the owning client has not seen yet.
    pub fn replication_update(&mut self, tick: u64) -> Option<ReplicationUpdate> {
        let NetRole::Authority { owner } = self.role else {
            return None;
        };
        let mut effects = self.effects.borrow_mut();
        Some(ReplicationUpdate {
            tick,
            server_time: effects.now().server,
            effects: effects.replication_delta(owner),
            attributes: effects.attribute_delta(owner),
            prediction_keys: self.key_ring.take_dirty(WireTarget::Client(owner)),
        })
    }

    fn spec_or_err(&self, ability: AbilityId) -> Result<&AbilitySpec, ActivationError> {
        self.abilities
            .get(&ability)
            .ok_or(ActivationError::UnknownAbility(ability))
    }
}

impl PredictionScope for AbilitySystem {
    fn is_authority(&self) -> bool {
        self.role.is_authority()
    }

    fn prediction_domain(&self) -> &PredictionDomain {
        &self.ctx.domain
    }

    fn scoped_prediction_key(&self) -> PredictionKey {
        self.scoped_key
    }

    fn set_scoped_prediction_key(&mut self, key: PredictionKey) {
        self.scoped_key = key;
    }

    fn replicate_prediction_key(&mut self, key: PredictionKey) {
        // Only keys the owner produced, or server-initiated ones, mean
        // anything to it.
        if key.was_received() || key.is_server_initiated() {
            self.key_ring.replicate(key);
        }
    }
}
