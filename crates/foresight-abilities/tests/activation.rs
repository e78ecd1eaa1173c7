use foresight_abilities::{
    AbilityDef, AbilityEvent, AbilitySystem, Activation, ActivationError, ActivationMode,
    EndPolicy, NetExecutionPolicy, NetRole,
};
use foresight_core::{ConnectionId, GameplayTag, PredictionConfig, PredictionDomain, WireKey};
use foresight_effects::{
    AttributeSet, DurationMagnitude, DurationPolicy, EffectContext, EffectLibrary,
    GameplayEffectDef, ModOp, ScalableFloat,
};
use foresight_protocol::{
    AbilityId, ClientMessage, EventPayload, ReplicatedEventKind, ServerMessage,
};

/// How the client sees the server.
const SERVER: ConnectionId = ConnectionId(0);
/// How the server sees the client.
const CLIENT: ConnectionId = ConnectionId(1);

fn timed(name: &str, secs: f64) -> GameplayEffectDef {
    GameplayEffectDef::named(name).with_duration(DurationPolicy::HasDuration(
        DurationMagnitude::Fixed(ScalableFloat::fixed(secs)),
    ))
}

fn library() -> EffectLibrary {
    EffectLibrary::from_defs([
        GameplayEffectDef::named("mana_cost").with_modifier("mana", ModOp::Additive, -10.0),
        timed("fireball_cooldown", 5.0).with_granted_tag("cooldown.fireball"),
        timed("haste", 10.0)
            .with_modifier("speed", ModOp::Additive, 5.0)
            .with_granted_tag("buff.haste"),
    ])
    .unwrap()
}

fn abilities() -> Vec<AbilityDef> {
    vec![
        AbilityDef::named("fireball")
            .with_cost("mana_cost")
            .with_cooldown("fireball_cooldown")
            .with_owned_tag("state.casting")
            .with_blocked_tag("debuff.silenced"),
        AbilityDef::named("blink")
            .with_owned_tag("state.aiming")
            .with_wait_for_event(ReplicatedEventKind::GenericConfirm, ["haste"])
            .with_end_policy(EndPolicy::AfterEvent),
        AbilityDef::named("shout")
            .with_policy(NetExecutionPolicy::ServerInitiated)
            .with_activation_effect("haste")
            .with_owned_tag("state.shouting")
            .with_end_policy(EndPolicy::Manual),
        AbilityDef::named("channel")
            .with_owned_tag("state.channeling")
            .with_end_policy(EndPolicy::Manual),
        AbilityDef::named("emote").with_policy(NetExecutionPolicy::LocalOnly),
    ]
}

struct Peers {
    server: AbilitySystem,
    client: AbilitySystem,
    tick: u64,
}

impl Peers {
    fn new(mana: f64) -> Self {
        let attributes = || AttributeSet::new().with("mana", mana).with("speed", 0.0);
        let system = |role| {
            let ctx = EffectContext::new(PredictionDomain::new(PredictionConfig::default()), library());
            let mut system = AbilitySystem::new(&ctx, role, attributes());
            for def in abilities() {
                system.give_ability(def, 1.0);
            }
            system
        };
        Self {
            server: system(NetRole::Authority { owner: CLIENT }),
            client: system(NetRole::AutonomousProxy { server: SERVER }),
            tick: 0,
        }
    }

    fn id(&self, name: &str) -> AbilityId {
        self.client.find_ability(name).unwrap()
    }

    /// Deliver client RPCs, then server RPCs, then one replication update.
    fn pump(&mut self) {
        self.tick += 1;
        for msg in self.client.take_messages_to_server() {
            self.server.handle_client_message(msg);
        }
        let mut inbound = self.server.take_messages_to_client();
        inbound.extend(
            self.server
                .replication_update(self.tick)
                .map(ServerMessage::Replication),
        );
        for msg in inbound {
            self.client.handle_server_message(msg);
        }
    }

    fn client_has_tag(&self, tag: &str) -> bool {
        self.client
            .effects()
            .borrow()
            .tags()
            .has_tag(&GameplayTag::new(tag))
    }
}

#[test]
fn predicted_activation_is_confirmed_without_double_counting() {
    let mut peers = Peers::new(100.0);
    let fireball = peers.id("fireball");

    let Ok(Activation::Predicted(key)) = peers.client.try_activate_ability(fireball) else {
        panic!("fireball should be predicted");
    };
    assert_eq!((key.current, key.base), (1, 0));
    assert_eq!(peers.client.attribute("mana"), 90.0);
    assert!(peers.client_has_tag("cooldown.fireball"));
    assert!(!peers.client.is_active(fireball));

    peers.pump();

    assert_eq!(peers.server.attribute("mana"), 90.0);
    assert_eq!(peers.client.attribute("mana"), 90.0);
    assert!(peers.client_has_tag("cooldown.fireball"));
    assert_eq!(peers.client.effects().borrow().len(), 1);
    assert_eq!(peers.client.domain().delegates().outstanding(), 0);
    assert_eq!(
        peers.client.activation(fireball).map(|a| a.mode()),
        Some(ActivationMode::Confirmed)
    );
    assert!(peers
        .client
        .drain_events()
        .contains(&AbilityEvent::Confirmed {
            ability: fireball,
            key
        }));
}

#[test]
fn rejected_activation_rolls_back_everything_predicted() {
    let mut peers = Peers::new(100.0);
    let fireball = peers.id("fireball");
    // Only the server knows the owner is silenced.
    peers
        .server
        .effects()
        .borrow_mut()
        .update_loose_tag(&GameplayTag::new("debuff.silenced"), 1);

    let Ok(Activation::Predicted(key)) = peers.client.try_activate_ability(fireball) else {
        panic!("fireball should be predicted");
    };
    assert_eq!(peers.client.attribute("mana"), 90.0);

    peers.pump();

    assert_eq!(peers.client.attribute("mana"), 100.0);
    assert!(!peers.client_has_tag("cooldown.fireball"));
    assert!(peers.client.effects().borrow().is_empty());
    assert_eq!(peers.client.domain().delegates().outstanding(), 0);
    assert_eq!(
        peers.client.activation(fireball).map(|a| a.mode()),
        Some(ActivationMode::Rejected)
    );
    assert!(peers
        .client
        .drain_events()
        .contains(&AbilityEvent::Rejected {
            ability: fireball,
            key
        }));
    assert!(peers
        .server
        .drain_events()
        .contains(&AbilityEvent::ActivationFailed {
            ability: fireball,
            reason: GameplayTag::new("activate.fail.tags_blocked"),
        }));
}

#[test]
fn predicted_cooldown_blocks_a_second_activation() {
    let mut peers = Peers::new(100.0);
    let fireball = peers.id("fireball");

    peers.client.try_activate_ability(fireball).unwrap();
    let err = peers.client.try_activate_ability(fireball).unwrap_err();
    assert!(matches!(err, ActivationError::Cooldown(id) if id == fireball));
    assert_eq!(err.failure_tag(), GameplayTag::new("activate.fail.cooldown"));
    assert_eq!(peers.client.take_messages_to_server().len(), 1);
}

#[test]
fn unaffordable_cost_fails_before_predicting() {
    let mut peers = Peers::new(5.0);
    let fireball = peers.id("fireball");

    let err = peers.client.try_activate_ability(fireball).unwrap_err();
    assert!(matches!(err, ActivationError::Cost(_)));
    assert!(peers.client.take_messages_to_server().is_empty());
    assert_eq!(peers.client.attribute("mana"), 5.0);
}

#[test]
fn confirm_event_is_predicted_and_reconciled() {
    let mut peers = Peers::new(100.0);
    let blink = peers.id("blink");

    peers.client.try_activate_ability(blink).unwrap();
    assert!(peers.client.is_active(blink));
    assert!(peers.client_has_tag("state.aiming"));

    let aim = Some(EventPayload::new(4.0, 0.0, 2.0));
    assert!(peers
        .client
        .invoke_local_event(blink, ReplicatedEventKind::GenericConfirm, aim));
    assert_eq!(peers.client.attribute("speed"), 5.0);
    assert!(!peers.client.is_active(blink));
    assert!(!peers.client_has_tag("state.aiming"));

    peers.pump();

    assert!(peers.server.drain_events().contains(&AbilityEvent::EventHandled {
        ability: blink,
        event: ReplicatedEventKind::GenericConfirm,
        payload: aim,
    }));
    assert!(!peers.server.is_active(blink));
    assert_eq!(peers.server.attribute("speed"), 5.0);

    let client = peers.client.effects().borrow();
    assert_eq!(client.len(), 1);
    assert_eq!(peers.client.attribute("speed"), 5.0);
    assert_eq!(client.tags().count(&GameplayTag::new("buff.haste")), 1);
    assert_eq!(peers.client.domain().delegates().outstanding(), 0);
}

#[test]
fn event_arriving_before_its_waiter_is_replayed() {
    let mut peers = Peers::new(100.0);
    let blink = peers.id("blink");

    peers.client.try_activate_ability(blink).unwrap();
    peers
        .client
        .invoke_local_event(blink, ReplicatedEventKind::GenericConfirm, None);
    let mut outbound = peers.client.take_messages_to_server();
    assert!(matches!(outbound[0], ClientMessage::ServerTryActivate { .. }));
    assert!(matches!(outbound[1], ClientMessage::ServerSetReplicatedEvent { .. }));

    // Deliver the event first.
    outbound.swap(0, 1);
    for msg in outbound {
        peers.server.handle_client_message(msg);
    }

    assert_eq!(peers.server.attribute("speed"), 5.0);
    assert!(!peers.server.is_active(blink));
    assert!(peers.server.event_cache().is_empty());
}

#[test]
fn server_initiated_ability_is_mirrored_and_ended_by_the_server() {
    let mut peers = Peers::new(100.0);
    let shout = peers.id("shout");

    assert_eq!(
        peers.client.try_activate_ability(shout).unwrap(),
        Activation::Requested
    );
    assert!(!peers.client.is_active(shout));

    peers.pump();

    assert!(peers.server.is_active(shout));
    assert!(peers.client.is_active(shout));
    assert!(peers.client_has_tag("state.shouting"));
    assert_eq!(peers.client.attribute("speed"), 5.0);
    let activation = peers.client.activation(shout).unwrap();
    assert_eq!(activation.mode(), ActivationMode::NonAuthority);
    assert!(activation.activation_key().is_server_initiated());

    assert!(peers.server.end_ability(shout));
    peers.pump();

    assert!(!peers.client.is_active(shout));
    assert!(!peers.client_has_tag("state.shouting"));
    // Effects outlive the activation that applied them.
    assert_eq!(peers.client.attribute("speed"), 5.0);
}

#[test]
fn client_cancel_reaches_the_server() {
    let mut peers = Peers::new(100.0);
    let channel = peers.id("channel");

    peers.client.try_activate_ability(channel).unwrap();
    peers.pump();
    assert!(peers.server.is_active(channel));

    assert!(peers.client.cancel_ability(channel));
    assert!(!peers.client_has_tag("state.channeling"));
    peers.pump();

    assert!(!peers.server.is_active(channel));
    assert!(peers.server.drain_events().contains(&AbilityEvent::Ended {
        ability: channel,
        cancelled: true,
    }));
}

#[test]
fn local_only_abilities_never_reach_the_server() {
    let mut peers = Peers::new(100.0);
    let emote = peers.id("emote");

    assert_eq!(
        peers.client.try_activate_ability(emote).unwrap(),
        Activation::Local
    );
    assert!(peers.client.take_messages_to_server().is_empty());

    // A forged request for it is refused.
    peers.server.handle_client_message(ClientMessage::ServerTryActivate {
        ability: emote,
        key: WireKey {
            current: 9,
            base: 0,
            server_initiated: false,
        },
    });
    assert_eq!(
        peers.server.take_messages_to_client(),
        vec![ServerMessage::ClientActivateFailed {
            ability: emote,
            key: 9
        }]
    );
}
