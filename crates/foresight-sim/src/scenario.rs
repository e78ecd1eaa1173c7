//! Scripted runs over a [`Session`], each producing a [`ScenarioReport`].

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::ValueEnum;
use foresight_abilities::{AbilityDef, AbilityEvent, AbilitySystem, Activation, ActivationMode};
use foresight_core::{GameplayTag, KeyAllocator, KeyId, PredictionDomain, PredictionKey};
use foresight_effects::{
    ActiveEffectsContainer, ApplyOutcome, AttributeSet, CueKind, DurationMagnitude,
    DurationPolicy, EffectContext, EffectEvent, EffectLibrary, GameplayEffectDef, ModOp,
    ScalableFloat, SkipReason, StackingPolicy,
};
use tracing::info;

use crate::config::SimConfig;
use crate::report::ScenarioReport;
use crate::session::{Definitions, Session};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// A predicted cost the server refuses is rolled back.
    #[value(alias = "a")]
    Rejected,
    /// A confirmed prediction hands over to the replicated record.
    #[value(alias = "b")]
    Confirmed,
    /// Rejecting a chain head rejects every dependent key.
    #[value(alias = "c")]
    DependentChain,
    /// A denied overflow leaves a full stack untouched.
    #[value(alias = "d")]
    StackOverflow,
    /// Unpredicted stacks converge on the server's count.
    #[value(alias = "p5")]
    StackingIdempotence,
}

impl Scenario {
    pub const ALL: [Scenario; 5] = [
        Scenario::Rejected,
        Scenario::Confirmed,
        Scenario::DependentChain,
        Scenario::StackOverflow,
        Scenario::StackingIdempotence,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scenario::Rejected => "rejected",
            Scenario::Confirmed => "confirmed",
            Scenario::DependentChain => "dependent-chain",
            Scenario::StackOverflow => "stack-overflow",
            Scenario::StackingIdempotence => "stacking-idempotence",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Scenario::Rejected => {
                "client predicts a 10 mana cost, the server refuses, mana returns to 100"
            }
            Scenario::Confirmed => {
                "client predicts a cost and a buff, the server agrees, nothing is applied twice"
            }
            Scenario::DependentChain => {
                "keys 5 -> 6 -> 7 are chained; rejecting 5 undoes effects under all three"
            }
            Scenario::StackOverflow => {
                "a third application of a two-stack effect is denied on the authority"
            }
            Scenario::StackingIdempotence => {
                "two quick stacking activations settle to the server's stack count"
            }
        }
    }

    pub fn run(self, config: &SimConfig) -> Result<ScenarioReport> {
        let mut report = ScenarioReport::new(self.as_str(), self.description());
        match self {
            Scenario::Rejected => rejected(config, &mut report)?,
            Scenario::Confirmed => confirmed(config, &mut report)?,
            Scenario::DependentChain => dependent_chain(config, &mut report)?,
            Scenario::StackOverflow => stack_overflow(config, &mut report)?,
            Scenario::StackingIdempotence => stacking_idempotence(config, &mut report)?,
        }
        info!(
            scenario = self.as_str(),
            passed = report.passed,
            ticks = report.ticks,
            "scenario finished"
        );
        Ok(report)
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn run_all(config: &SimConfig) -> Result<Vec<ScenarioReport>> {
    Scenario::ALL.iter().map(|s| s.run(config)).collect()
}

fn timed(name: &str, secs: f64) -> GameplayEffectDef {
    GameplayEffectDef::named(name).with_duration(DurationPolicy::HasDuration(
        DurationMagnitude::Fixed(ScalableFloat::fixed(secs)),
    ))
}

/// Content shared by every scenario.
pub fn demo_definitions() -> Definitions {
    Definitions {
        effects: vec![
            GameplayEffectDef::named("mana_cost").with_modifier("mana", ModOp::Additive, -10.0),
            timed("focus", 10.0)
                .with_modifier("power", ModOp::Additive, 5.0)
                .with_granted_tag("buff.focus")
                .with_cue("cue.focus"),
            timed("rallied", 10.0)
                .with_modifier("power", ModOp::Additive, 1.0)
                .with_stacking(StackingPolicy {
                    limit: 5,
                    ..StackingPolicy::default()
                }),
            timed("rage", 10.0)
                .with_modifier("power", ModOp::Additive, 1.0)
                .with_stacking(StackingPolicy {
                    limit: 2,
                    deny_overflow_application: true,
                    ..StackingPolicy::default()
                }),
        ],
        abilities: vec![
            AbilityDef::named("bolt")
                .with_cost("mana_cost")
                .with_blocked_tag("debuff.silenced"),
            AbilityDef::named("focus")
                .with_cost("mana_cost")
                .with_activation_effect("focus"),
            AbilityDef::named("rally").with_activation_effect("rallied"),
        ],
        attributes: AttributeSet::new().with("mana", 100.0).with("power", 0.0),
    }
}

fn finish(report: &mut ScenarioReport, session: &Session) {
    report.ticks = session.tick();
    report.wire = session.stats();
    report.transcript = session.transcript().to_vec();
}

fn client_records(session: &Session) -> (usize, usize) {
    let effects = session.client().effects().borrow();
    let predicted = effects.active_effects().filter(|e| e.is_predicted()).count();
    (effects.len(), predicted)
}

fn rejected(config: &SimConfig, report: &mut ScenarioReport) -> Result<()> {
    let mut session = Session::new(config, &demo_definitions())?;
    // Only the server knows the owner is silenced.
    session
        .server()
        .effects()
        .borrow_mut()
        .update_loose_tag(&GameplayTag::new("debuff.silenced"), 1);
    let bolt = session.ability("bolt")?;

    let activation = session.client_mut().try_activate_ability(bolt)?;
    let key = match activation {
        Activation::Predicted(key) => key,
        _ => PredictionKey::invalid(),
    };
    report.check("key", (1, 0), (key.current, key.base));
    report.check("predicted mana", 90.0, session.client().attribute("mana"));

    report.check("settled", true, session.run_until_settled()?);
    report.check("mana", 100.0, session.client().attribute("mana"));
    report.check(
        "activation mode",
        Some(ActivationMode::Rejected),
        session.client().activation(bolt).map(|a| a.mode()),
    );
    report.check("client records", (0, 0), client_records(&session));
    report.check(
        "outstanding keys",
        0,
        session.client().domain().delegates().outstanding(),
    );
    let events = session.take_client_events();
    report.check(
        "rejection reported",
        true,
        events.contains(&AbilityEvent::Rejected { ability: bolt, key }),
    );
    finish(report, &session);
    Ok(())
}

fn confirmed(config: &SimConfig, report: &mut ScenarioReport) -> Result<()> {
    let mut session = Session::new(config, &demo_definitions())?;
    let focus = session.ability("focus")?;

    session.client_mut().try_activate_ability(focus)?;
    report.check("predicted mana", 90.0, session.client().attribute("mana"));
    report.check("predicted power", 5.0, session.client().attribute("power"));

    report.check("settled", true, session.run_until_settled()?);
    report.check("mana", 90.0, session.client().attribute("mana"));
    report.check("power", 5.0, session.client().attribute("power"));
    report.check("server mana", 90.0, session.server().attribute("mana"));
    report.check(
        "activation mode",
        Some(ActivationMode::Confirmed),
        session.client().activation(focus).map(|a| a.mode()),
    );
    report.check("client records", (1, 0), client_records(&session));
    report.check(
        "outstanding keys",
        0,
        session.client().domain().delegates().outstanding(),
    );

    let events = session.take_client_effect_events();
    let on_active = events
        .iter()
        .filter_map(EffectEvent::cue)
        .filter(|cue| cue.kind == CueKind::OnActive && cue.tag.as_str() == "cue.focus")
        .count();
    report.check("focus cue fired", 1, on_active);
    let removed = events
        .iter()
        .filter(|e| matches!(e, EffectEvent::Removed { .. }))
        .count();
    report.check("removal notifications", 0, removed);
    finish(report, &session);
    Ok(())
}

fn dependent_chain(config: &SimConfig, report: &mut ScenarioReport) -> Result<()> {
    let defs = demo_definitions();
    let library = EffectLibrary::from_defs(defs.effects).context("Failed to build effect library")?;
    let domain = PredictionDomain::with_allocator(
        config.prediction.clone(),
        KeyAllocator::starting_after(4),
    );
    let ctx = EffectContext::new(Rc::clone(&domain), library);
    let client = ActiveEffectsContainer::new(&ctx, false, defs.attributes);

    let rejected: Rc<RefCell<Vec<KeyId>>> = Rc::default();
    let mut key = domain.create_new_prediction_key(false);
    let mut chain = Vec::new();
    for link in 0..3 {
        if link > 0 {
            key.generate_dependent(&domain);
        }
        let log = Rc::clone(&rejected);
        let id = key.current;
        domain
            .delegates()
            .new_rejected_delegate(id, move || log.borrow_mut().push(id));
        client
            .borrow_mut()
            .apply_effect_by_name("focus", 1.0, key)
            .context("Failed to apply focus")?;
        chain.push((key.current, key.base));
    }
    report.check("chain", vec![(5, 0), (6, 5), (7, 5)], chain);
    report.check("predicted records", 3, client.borrow().len());
    report.check("predicted power", 15.0, client.borrow().attribute(&"power".into()));

    domain.delegates().reject(5);

    report.check("rejected keys", vec![5, 6, 7], rejected.borrow().clone());
    report.check("records", 0, client.borrow().len());
    report.check("power", 0.0, client.borrow().attribute(&"power".into()));
    report.check("outstanding keys", 0, domain.delegates().outstanding());
    Ok(())
}

fn stack_overflow(config: &SimConfig, report: &mut ScenarioReport) -> Result<()> {
    let mut session = Session::new(config, &demo_definitions())?;

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let outcome = session
            .server()
            .effects()
            .borrow_mut()
            .apply_effect_by_name("rage", 1.0, PredictionKey::invalid())?;
        outcomes.push(outcome);
    }
    report.check(
        "third application",
        format!("{:?}", ApplyOutcome::NotApplied(SkipReason::OverflowDenied)),
        format!("{:?}", outcomes[2]),
    );
    report.check(
        "second application stacks",
        true,
        matches!(outcomes[0], ApplyOutcome::Added(_))
            && matches!(outcomes[1], ApplyOutcome::Stacked(_))
            && outcomes[0].handle() == outcomes[1].handle(),
    );

    let stacks = |system: &AbilitySystem| -> Vec<u32> {
        system
            .effects()
            .borrow()
            .active_effects()
            .map(|e| e.stack_count())
            .collect()
    };
    report.check("server stacks", vec![2], stacks(session.server()));
    report.check("settled", true, session.run_until_settled()?);
    report.check("client stacks", vec![2], stacks(session.client()));
    report.check("client power", 2.0, session.client().attribute("power"));
    finish(report, &session);
    Ok(())
}

fn stacking_idempotence(config: &SimConfig, report: &mut ScenarioReport) -> Result<()> {
    let mut session = Session::new(config, &demo_definitions())?;
    let rally = session.ability("rally")?;

    session.client_mut().try_activate_ability(rally)?;
    session.step()?;
    session.client_mut().try_activate_ability(rally)?;
    // The second application is never predicted as an extra stack.
    let stacks = |session: &Session| -> Vec<u32> {
        session
            .client()
            .effects()
            .borrow()
            .active_effects()
            .map(|e| e.stack_count())
            .collect()
    };
    report.check("predicted stacks", vec![1], stacks(&session));
    report.check("predicted power", 1.0, session.client().attribute("power"));

    report.check("settled", true, session.run_until_settled()?);
    report.check("stacks", vec![2], stacks(&session));
    report.check("client records", (1, 0), client_records(&session));
    report.check("power", 2.0, session.client().attribute("power"));
    report.check("server power", 2.0, session.server().attribute("power"));
    report.check(
        "outstanding keys",
        0,
        session.client().domain().delegates().outstanding(),
    );
    finish(report, &session);
    Ok(())
}
