use std::cell::RefCell;
use std::rc::Rc;

use foresight_core::{ConnectionId, NetTime, PredictionConfig, PredictionDomain, PredictionKey, WireTarget};
use foresight_effects::{
    ActiveEffectsContainer, ApplyOutcome, Attribute, AttributeSet, DurationMagnitude,
    DurationPolicy, EffectContext, EffectLibrary, EffectSpec, GameplayEffectDef, InstigatorId,
    ModOp, ScalableFloat, SkipReason, StackExpirationPolicy, StackingPolicy, StackingType,
};

type Container = Rc<RefCell<ActiveEffectsContainer>>;

const SERVER: ConnectionId = ConnectionId(0);
const CLIENT: ConnectionId = ConnectionId(1);

fn rage(name: &str, stacking: StackingPolicy) -> GameplayEffectDef {
    GameplayEffectDef::named(name)
        .with_duration(DurationPolicy::HasDuration(DurationMagnitude::Fixed(
            ScalableFloat::fixed(10.0),
        )))
        .with_modifier("power", ModOp::Additive, 1.0)
        .with_stacking(stacking)
}

fn library() -> EffectLibrary {
    EffectLibrary::from_defs([
        rage(
            "rage",
            StackingPolicy {
                limit: 2,
                deny_overflow_application: true,
                ..StackingPolicy::default()
            },
        ),
        rage(
            "rage_exhausting",
            StackingPolicy {
                limit: 2,
                overflow_effects: vec!["exhaust".into()],
                ..StackingPolicy::default()
            },
        ),
        rage(
            "rage_fragile",
            StackingPolicy {
                limit: 2,
                deny_overflow_application: true,
                clear_stack_on_overflow: true,
                ..StackingPolicy::default()
            },
        ),
        rage(
            "rage_personal",
            StackingPolicy {
                kind: StackingType::AggregateBySource,
                ..StackingPolicy::default()
            },
        ),
        GameplayEffectDef::named("exhaust").with_modifier("stamina", ModOp::Additive, -5.0),
    ])
    .unwrap()
}

fn peer(is_authority: bool) -> (EffectContext, Container) {
    let ctx = EffectContext::new(PredictionDomain::new(PredictionConfig::default()), library());
    let container = ActiveEffectsContainer::new(
        &ctx,
        is_authority,
        AttributeSet::new().with("power", 0.0).with("stamina", 100.0),
    );
    (ctx, container)
}

fn apply(container: &Container, name: &str) -> ApplyOutcome {
    container
        .borrow_mut()
        .apply_effect_by_name(name, 1.0, PredictionKey::invalid())
        .unwrap()
}

#[test]
fn denied_overflow_leaves_the_stack_alone() {
    let (_, server) = peer(true);
    let power = Attribute::new("power");

    let ApplyOutcome::Added(handle) = apply(&server, "rage") else {
        panic!("first application should add a record");
    };
    server.borrow_mut().tick(NetTime::synced(3.0));
    assert_eq!(apply(&server, "rage"), ApplyOutcome::Stacked(handle));

    server.borrow_mut().tick(NetTime::synced(5.0));
    assert_eq!(
        apply(&server, "rage"),
        ApplyOutcome::NotApplied(SkipReason::OverflowDenied)
    );

    let s = server.borrow();
    assert_eq!(s.len(), 1);
    let record = s.get(handle).unwrap();
    assert_eq!(record.stack_count(), 2);
    // Refreshed by the second application, not by the denied third.
    assert_eq!(record.start_world_time, 3.0);
    assert_eq!(s.attribute(&power), 2.0);
}

#[test]
fn overflow_effects_fire_at_the_limit() {
    let (_, server) = peer(true);
    let stamina = Attribute::new("stamina");

    apply(&server, "rage_exhausting");
    apply(&server, "rage_exhausting");
    assert_eq!(server.borrow().base_value(&stamina), 100.0);

    let outcome = apply(&server, "rage_exhausting");
    assert!(matches!(outcome, ApplyOutcome::Stacked(_)));

    let s = server.borrow();
    assert_eq!(s.base_value(&stamina), 95.0);
    assert_eq!(s.len(), 1);
    assert_eq!(s.active_effects().next().map(|e| e.stack_count()), Some(2));
}

#[test]
fn clearing_overflow_removes_the_stack() {
    let (_, server) = peer(true);
    let power = Attribute::new("power");

    apply(&server, "rage_fragile");
    apply(&server, "rage_fragile");
    assert_eq!(server.borrow().attribute(&power), 2.0);

    assert_eq!(
        apply(&server, "rage_fragile"),
        ApplyOutcome::NotApplied(SkipReason::OverflowDenied)
    );
    let s = server.borrow();
    assert!(s.is_empty());
    assert_eq!(s.attribute(&power), 0.0);
}

#[test]
fn aggregate_by_source_keeps_one_stack_per_instigator() {
    let (ctx, server) = peer(true);
    let def = ctx.library.get("rage_personal").unwrap();

    for instigator in [1, 1, 2] {
        let spec = EffectSpec::new(def.clone(), 1.0).with_instigator(InstigatorId(instigator));
        server.borrow_mut().apply_effect(spec, PredictionKey::invalid());
    }

    let s = server.borrow();
    let mut stacks: Vec<_> = s
        .active_effects()
        .map(|e| (e.spec.instigator, e.stack_count()))
        .collect();
    stacks.sort_by_key(|(instigator, _)| instigator.map(|i| i.0));
    assert_eq!(
        stacks,
        vec![(Some(InstigatorId(1)), 2), (Some(InstigatorId(2)), 1)]
    );
    assert_eq!(s.attribute(&Attribute::new("power")), 3.0);
}

#[test]
fn expiring_a_single_stack_refreshes_the_rest() {
    let library = EffectLibrary::from_defs([rage(
        "rage",
        StackingPolicy {
            expiration: StackExpirationPolicy::RemoveSingleStackAndRefreshDuration,
            ..StackingPolicy::default()
        },
    )])
    .unwrap();
    let ctx = EffectContext::new(PredictionDomain::new(PredictionConfig::default()), library);
    let server = ActiveEffectsContainer::new(&ctx, true, AttributeSet::new());

    apply(&server, "rage");
    apply(&server, "rage");
    apply(&server, "rage");

    server.borrow_mut().tick(NetTime::synced(10.0));
    assert_eq!(
        server.borrow().active_effects().next().map(|e| e.stack_count()),
        Some(2)
    );
    server.borrow_mut().tick(NetTime::synced(20.0));
    server.borrow_mut().tick(NetTime::synced(30.0));
    assert!(server.borrow().is_empty());
}

#[test]
fn client_never_predicts_extra_stacks() {
    let (client_ctx, client) = peer(false);
    let (_, server) = peer(true);
    let power = Attribute::new("power");

    let first = client_ctx.domain.create_new_prediction_key(false);
    let second = client_ctx.domain.create_new_prediction_key(false);

    let outcome = client
        .borrow_mut()
        .apply_effect_by_name("rage", 1.0, first)
        .unwrap();
    assert!(matches!(outcome, ApplyOutcome::Added(_)));
    let outcome = client
        .borrow_mut()
        .apply_effect_by_name("rage", 1.0, second)
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::NotApplied(SkipReason::StackingNotPredicted));

    // The server sees both requests, one replication batch after each.
    for key in [first, second] {
        let received = PredictionKey::from_wire(key.to_wire(WireTarget::Server), CLIENT);
        server
            .borrow_mut()
            .apply_effect_by_name("rage", 1.0, received)
            .unwrap();

        let (delta, values) = {
            let mut s = server.borrow_mut();
            (s.replication_delta(CLIENT), s.attribute_delta(CLIENT))
        };
        client.borrow_mut().begin_net_update();
        client.borrow_mut().apply_effect_delta(&delta, SERVER);
        client.borrow_mut().receive_attribute_values(&values);
        client_ctx.domain.delegates().catch_up_through(key.current);
        client.borrow_mut().end_net_update();
    }

    let c = client.borrow();
    assert_eq!(c.len(), 1);
    assert_eq!(c.active_effects().next().map(|e| e.stack_count()), Some(2));
    assert_eq!(c.attribute(&power), 2.0);
    assert_eq!(client_ctx.domain.delegates().outstanding(), 0);
}

#[test]
fn overflow_that_reaches_its_own_stack_terminates() {
    let overflowing = |name: &str, into: &str| {
        rage(
            name,
            StackingPolicy {
                limit: 1,
                overflow_effects: vec![into.into()],
                ..StackingPolicy::default()
            },
        )
    };
    // `insert` skips library validation, so cycles can still be built.
    let mut library = EffectLibrary::new();
    library.insert(overflowing("echo", "echo")).unwrap();
    library.insert(overflowing("ping", "pong")).unwrap();
    library.insert(overflowing("pong", "ping")).unwrap();
    let ctx = EffectContext::new(PredictionDomain::new(PredictionConfig::default()), library);
    let server = ActiveEffectsContainer::new(&ctx, true, AttributeSet::new().with("power", 0.0));

    let echo = apply(&server, "echo").handle().unwrap();
    assert_eq!(apply(&server, "echo"), ApplyOutcome::Stacked(echo));

    apply(&server, "ping");
    apply(&server, "pong");
    assert!(apply(&server, "ping").was_applied());

    let server = server.borrow();
    assert_eq!(server.len(), 3);
    assert!(server.active_effects().all(|e| e.stack_count() == 1));
    assert_eq!(server.attribute(&Attribute::new("power")), 3.0);
}
