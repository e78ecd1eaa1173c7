use std::cell::RefCell;
use std::rc::Rc;

use foresight_core::{
    ConnectionId, GameplayTag, NetTime, PredictionConfig, PredictionDomain, PredictionKey,
    WireKey, WireTarget,
};
use foresight_effects::{
    ActiveEffectsContainer, ApplyOutcome, Attribute, AttributeSet, CueKind, DurationMagnitude,
    DurationPolicy, EffectContext, EffectDelta, EffectEvent, EffectLibrary, GameplayEffectDef, ModOp,
    ReplicatedAttribute, ReplicatedEffect, ReplicationId, ScalableFloat,
};

type Container = Rc<RefCell<ActiveEffectsContainer>>;

/// How the client sees the server.
const SERVER: ConnectionId = ConnectionId(0);
/// How the server sees the client.
const CLIENT: ConnectionId = ConnectionId(1);

fn library() -> EffectLibrary {
    EffectLibrary::from_defs([
        GameplayEffectDef::named("mana_cost")
            .with_modifier("mana", ModOp::Additive, -10.0)
            .with_cue("cue.mana_spent"),
        GameplayEffectDef::named("haste")
            .with_duration(DurationPolicy::HasDuration(DurationMagnitude::Fixed(
                ScalableFloat::fixed(10.0),
            )))
            .with_modifier("speed", ModOp::Additive, 5.0)
            .with_granted_tag("buff.haste")
            .with_cue("cue.haste"),
        GameplayEffectDef::named("aura")
            .with_duration(DurationPolicy::Infinite)
            .with_granted_tag("buff.aura")
            .with_cue("cue.aura"),
    ])
    .unwrap()
}

fn peer(is_authority: bool) -> (EffectContext, Container) {
    let ctx = EffectContext::new(PredictionDomain::new(PredictionConfig::default()), library());
    let container = ActiveEffectsContainer::new(
        &ctx,
        is_authority,
        AttributeSet::new().with("mana", 100.0).with("speed", 0.0),
    );
    (ctx, container)
}

/// The server's copy of a key the client sent up.
fn received(key: PredictionKey) -> PredictionKey {
    PredictionKey::from_wire(key.to_wire(WireTarget::Server), CLIENT)
}

/// Ship everything the server has for the client in one network update,
/// then catch up `key` the way the owner's key ring does.
fn replicate(server: &Container, client: &Container, client_ctx: &EffectContext, key: Option<PredictionKey>) {
    let (delta, values) = {
        let mut server = server.borrow_mut();
        (server.replication_delta(CLIENT), server.attribute_delta(CLIENT))
    };

    client.borrow_mut().begin_net_update();
    client.borrow_mut().apply_effect_delta(&delta, SERVER);
    client.borrow_mut().receive_attribute_values(&values);
    if let Some(key) = key {
        client_ctx.domain.delegates().catch_up_through(key.current);
    }
    client.borrow_mut().end_net_update();
}

fn cue_kinds(events: &[EffectEvent], tag: &str) -> Vec<CueKind> {
    let tag = GameplayTag::new(tag);
    events
        .iter()
        .filter_map(EffectEvent::cue)
        .filter(|cue| cue.tag == tag)
        .map(|cue| cue.kind)
        .collect()
}

#[test]
fn rejected_instant_prediction_restores_attribute() {
    let (ctx, client) = peer(false);
    let mana = Attribute::new("mana");

    let key = ctx.domain.create_new_prediction_key(false);
    assert_eq!((key.current, key.base), (1, 0));

    let outcome = client
        .borrow_mut()
        .apply_effect_by_name("mana_cost", 1.0, key)
        .unwrap();
    assert!(matches!(outcome, ApplyOutcome::Added(_)));
    assert_eq!(client.borrow().attribute(&mana), 90.0);
    assert_eq!(client.borrow().base_value(&mana), 100.0);

    let events = client.borrow_mut().drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EffectEvent::Executed { predicted: true, .. }
    )));
    assert_eq!(cue_kinds(&events, "cue.mana_spent"), vec![CueKind::Executed]);

    ctx.domain.delegates().reject(key.current);

    let client = client.borrow_mut();
    assert_eq!(client.attribute(&mana), 100.0);
    assert!(client.is_empty());
    assert!(!client.has_predicted_effect_with_key(&key));
    assert_eq!(ctx.domain.delegates().outstanding(), 0);
}

#[test]
fn confirmed_instant_prediction_is_not_counted_twice() {
    let (client_ctx, client) = peer(false);
    let (_, server) = peer(true);
    let mana = Attribute::new("mana");

    let key = client_ctx.domain.create_new_prediction_key(false);
    client
        .borrow_mut()
        .apply_effect_by_name("mana_cost", 1.0, key)
        .unwrap();
    assert_eq!(client.borrow().attribute(&mana), 90.0);

    let outcome = server
        .borrow_mut()
        .apply_effect_by_name("mana_cost", 1.0, received(key))
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Executed);
    assert_eq!(server.borrow().base_value(&mana), 90.0);

    client.borrow_mut().drain_events();
    replicate(&server, &client, &client_ctx, Some(key));

    let mut client = client.borrow_mut();
    assert_eq!(client.attribute(&mana), 90.0);
    assert_eq!(client.base_value(&mana), 90.0);
    assert!(client.is_empty());

    let events = client.drain_events();
    assert!(!events.iter().any(|e| matches!(e, EffectEvent::Removed { .. })));
    assert!(cue_kinds(&events, "cue.mana_spent").is_empty());
}

#[test]
fn confirmed_duration_prediction_hands_over_silently() {
    let (client_ctx, client) = peer(false);
    let (_, server) = peer(true);
    let speed = Attribute::new("speed");
    let haste = GameplayTag::new("buff.haste");

    let key = client_ctx.domain.create_new_prediction_key(false);
    client
        .borrow_mut()
        .apply_effect_by_name("haste", 1.0, key)
        .unwrap();
    {
        let mut c = client.borrow_mut();
        assert_eq!(c.attribute(&speed), 5.0);
        assert_eq!(c.tags().count(&haste), 1);
        let events = c.drain_events();
        assert_eq!(
            cue_kinds(&events, "cue.haste"),
            vec![CueKind::OnActive, CueKind::WhileActive]
        );
    }

    server
        .borrow_mut()
        .apply_effect_by_name("haste", 1.0, received(key))
        .unwrap();
    replicate(&server, &client, &client_ctx, Some(key));

    {
        let mut c = client.borrow_mut();
        assert_eq!(c.len(), 1);
        assert!(!c.has_predicted_effect_with_key(&key));
        assert_eq!(c.attribute(&speed), 5.0);
        assert_eq!(c.tags().count(&haste), 1);

        let events = c.drain_events();
        assert!(cue_kinds(&events, "cue.haste").is_empty());
        assert!(!events.iter().any(|e| matches!(e, EffectEvent::Removed { .. })));
        assert!(!events.iter().any(|e| matches!(e, EffectEvent::AttributeChanged { .. })));
    }

    // The authoritative record runs out on the server and the removal reaches
    // the client like any other.
    server.borrow_mut().tick(NetTime::synced(10.5));
    client.borrow_mut().tick(NetTime::synced(10.5));
    replicate(&server, &client, &client_ctx, None);

    let mut c = client.borrow_mut();
    assert!(c.is_empty());
    assert_eq!(c.attribute(&speed), 0.0);
    assert_eq!(c.tags().count(&haste), 0);
    let events = c.drain_events();
    assert_eq!(cue_kinds(&events, "cue.haste"), vec![CueKind::Removed]);
    assert!(events.iter().any(|e| matches!(
        e,
        EffectEvent::Removed { premature: false, .. }
    )));
}

#[test]
fn keys_only_reach_the_connection_that_sent_them() {
    let (client_ctx, _) = peer(false);
    let (server_ctx, server) = peer(true);
    let other = ConnectionId(2);

    let key = client_ctx.domain.create_new_prediction_key(false);
    server
        .borrow_mut()
        .apply_effect_by_name("haste", 1.0, received(key))
        .unwrap();
    let server_key = server_ctx.domain.create_new_server_initiated_key(true);
    server
        .borrow_mut()
        .apply_effect_by_name("aura", 1.0, server_key)
        .unwrap();

    let mine = server.borrow_mut().replication_delta(CLIENT);
    let theirs = server.borrow_mut().replication_delta(other);

    let key_of = |delta: &EffectDelta, name: &str| {
        delta
            .added
            .iter()
            .find(|rep| rep.effect == name)
            .map(|rep| rep.prediction_key)
            .unwrap()
    };

    assert_eq!(key_of(&mine, "haste").current, key.current);
    assert_eq!(key_of(&theirs, "haste"), WireKey::INVALID);
    assert!(key_of(&mine, "aura").server_initiated);
    assert_eq!(key_of(&theirs, "aura").current, server_key.current);

    // Nothing changed, so the next delta is empty.
    assert!(server.borrow_mut().replication_delta(CLIENT).is_empty());
}

#[test]
fn malformed_replicated_effect_is_kept_inert() {
    let (_, client) = peer(false);
    let speed = Attribute::new("speed");

    let delta = EffectDelta {
        added: vec![ReplicatedEffect {
            replication_id: ReplicationId(7),
            version: 1,
            effect: "haste".into(),
            level: 1.0,
            stack_count: 1,
            duration: Some(10.0),
            period: None,
            modifier_magnitudes: Vec::new(),
            prediction_key: WireKey::INVALID,
            start_server_time: 0.0,
            instigator: None,
            source_tags: Vec::new(),
        }],
        ..Default::default()
    };
    client.borrow_mut().apply_effect_delta(&delta, SERVER);

    let mut c = client.borrow_mut();
    assert_eq!(c.len(), 1);
    assert_eq!(c.attribute(&speed), 0.0);
    assert!(!c.tags().has_tag(&GameplayTag::new("buff.haste")));
    let events = c.drain_events();
    assert!(cue_kinds(&events, "cue.haste").is_empty());
}

#[test]
fn stale_replicated_effect_skips_on_active_cue() {
    let (client_ctx, client) = peer(false);
    let (_, server) = peer(true);

    server
        .borrow_mut()
        .apply_effect_by_name("aura", 1.0, PredictionKey::invalid())
        .unwrap();
    client.borrow_mut().tick(NetTime::synced(20.0));
    replicate(&server, &client, &client_ctx, None);

    let events = client.borrow_mut().drain_events();
    assert_eq!(cue_kinds(&events, "cue.aura"), vec![CueKind::WhileActive]);
    assert!(client.borrow().tags().has_tag(&GameplayTag::new("buff.aura")));

    // A fresh one still plays its activation cue.
    server.borrow_mut().tick(NetTime::synced(20.0));
    server
        .borrow_mut()
        .apply_effect_by_name("aura", 1.0, PredictionKey::invalid())
        .unwrap();
    replicate(&server, &client, &client_ctx, None);

    let events = client.borrow_mut().drain_events();
    assert_eq!(
        cue_kinds(&events, "cue.aura"),
        vec![CueKind::OnActive, CueKind::WhileActive]
    );
}

#[test]
fn attribute_values_from_the_server_keep_local_predictions_on_top() {
    let (client_ctx, client) = peer(false);
    let speed = Attribute::new("speed");

    let key = client_ctx.domain.create_new_prediction_key(false);
    client
        .borrow_mut()
        .apply_effect_by_name("haste", 1.0, key)
        .unwrap();

    // The server has not seen the prediction yet and reports a changed base.
    client.borrow_mut().receive_attribute_values(&[ReplicatedAttribute {
        attribute: speed.clone(),
        value: 2.0,
    }]);

    let c = client.borrow();
    assert_eq!(c.base_value(&speed), 2.0);
    assert_eq!(c.attribute(&speed), 7.0);
}
