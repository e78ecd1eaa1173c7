use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use foresight_abilities::{AbilityDef, AbilitySystem, NetRole};
use foresight_core::{ConnectionId, PredictionConfig, PredictionDomain};
use foresight_effects::{AttributeSet, EffectContext, EffectLibrary, GameplayEffectDef, ModOp};
use foresight_protocol::ServerMessage;

fn system(role: NetRole) -> AbilitySystem {
    let library = EffectLibrary::from_defs([
        GameplayEffectDef::named("mana_cost").with_modifier("mana", ModOp::Additive, -1.0)
    ])
    .unwrap();
    let ctx = EffectContext::new(PredictionDomain::new(PredictionConfig::default()), library);
    let mut system = AbilitySystem::new(&ctx, role, AttributeSet::new().with("mana", 1.0e9));
    system.give_ability(AbilityDef::named("jab").with_cost("mana_cost"), 1.0);
    system
}

fn bench_predict_and_reconcile(c: &mut Criterion) {
    c.bench_function("foresight-abilities/predict_and_reconcile(activations=16)", |b| {
        b.iter_batched(
            || {
                (
                    system(NetRole::Authority {
                        owner: ConnectionId(1),
                    }),
                    system(NetRole::AutonomousProxy {
                        server: ConnectionId(0),
                    }),
                )
            },
            |(mut server, mut client)| {
                let jab = client.find_ability("jab").unwrap();
                for tick in 0..16 {
                    client.try_activate_ability(jab).unwrap();
                    for msg in client.take_messages_to_server() {
                        server.handle_client_message(msg);
                    }
                    for msg in server.take_messages_to_client() {
                        client.handle_server_message(msg);
                    }
                    if let Some(update) = server.replication_update(tick) {
                        client.handle_server_message(ServerMessage::Replication(update));
                    }
                }
                black_box(client.attribute("mana"))
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_predict_and_reconcile);
criterion_main!(benches);
