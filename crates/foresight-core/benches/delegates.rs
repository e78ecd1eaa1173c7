use std::cell::Cell;
use std::rc::Rc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use foresight_core::{PredictionConfig, PredictionDomain, PredictionKey};

fn bench_register_and_catch_up(c: &mut Criterion) {
    let domain = PredictionDomain::new(PredictionConfig::default());
    let fired = Rc::new(Cell::new(0u64));

    c.bench_function("foresight-core/register+catch_up(keys=64)", |b| {
        b.iter(|| {
            let registry = domain.delegates();
            let mut keys = Vec::with_capacity(64);
            for _ in 0..64 {
                let key = domain.create_new_prediction_key(false);
                let counter = Rc::clone(&fired);
                registry.new_reject_or_caught_up_delegate(key.current, move || {
                    counter.set(counter.get() + 1)
                });
                keys.push(key.current);
            }
            for key in keys {
                registry.catch_up_to(key);
            }
            black_box(fired.get());
        })
    });
}

fn bench_dependent_chain_reject(c: &mut Criterion) {
    let domain = PredictionDomain::new(PredictionConfig::default());

    c.bench_function("foresight-core/reject(chain=16)", |b| {
        b.iter(|| {
            let mut key = domain.create_new_prediction_key(false);
            let head = key.current;
            for _ in 0..16 {
                key.generate_dependent(&domain);
            }
            domain.delegates().reject(head);
            black_box::<PredictionKey>(key);
        })
    });
}

criterion_group!(benches, bench_register_and_catch_up, bench_dependent_chain_reject);
criterion_main!(benches);
