use std::cell::RefCell;
use std::rc::Rc;

use foresight_core::{KeyAllocator, KeyId, PredictionConfig, PredictionDomain};

type Log = Rc<RefCell<Vec<(&'static str, KeyId)>>>;

fn watch(domain: &PredictionDomain, log: &Log, key: KeyId) {
    let rejected = Rc::clone(log);
    domain
        .delegates()
        .new_rejected_delegate(key, move || rejected.borrow_mut().push(("rejected", key)));
    let caught_up = Rc::clone(log);
    domain
        .delegates()
        .new_caught_up_delegate(key, move || caught_up.borrow_mut().push(("caught_up", key)));
}

fn domain_starting_at(first: KeyId) -> Rc<PredictionDomain> {
    PredictionDomain::with_allocator(
        PredictionConfig::default(),
        KeyAllocator::starting_after(first - 1),
    )
}

#[test]
fn rejecting_chain_head_rejects_every_dependent() {
    let domain = domain_starting_at(5);
    let log: Log = Rc::default();

    let mut key = domain.create_new_prediction_key(false);
    assert_eq!((key.current, key.base), (5, 0));
    watch(&domain, &log, key.current);

    key.generate_dependent(&domain);
    assert_eq!((key.current, key.base), (6, 5));
    watch(&domain, &log, key.current);

    key.generate_dependent(&domain);
    assert_eq!((key.current, key.base), (7, 5));
    watch(&domain, &log, key.current);

    domain.delegates().reject(5);

    let log = log.borrow();
    assert_eq!(
        *log,
        vec![("rejected", 5), ("rejected", 6), ("rejected", 7)]
    );
    assert_eq!(domain.delegates().outstanding(), 0);
}

#[test]
fn catching_up_propagates_through_long_chains() {
    let domain = PredictionDomain::new(PredictionConfig::default());
    let log: Log = Rc::default();

    let mut key = domain.create_new_prediction_key(false);
    let head = key.current;
    watch(&domain, &log, head);
    let mut chain = vec![head];
    for _ in 0..4 {
        key.generate_dependent(&domain);
        watch(&domain, &log, key.current);
        chain.push(key.current);
    }

    domain.delegates().catch_up_to(head);
    let fired: Vec<KeyId> = log.borrow().iter().map(|(_, k)| *k).collect();
    assert_eq!(fired, chain);
    assert!(log.borrow().iter().all(|(event, _)| *event == "caught_up"));
}

#[test]
fn resolving_a_key_makes_the_other_outcome_unfireable() {
    let domain = PredictionDomain::new(PredictionConfig::default());
    let log: Log = Rc::default();
    let key = domain.create_new_prediction_key(false);
    watch(&domain, &log, key.current);

    domain.delegates().catch_up_to(key.current);
    domain.delegates().reject(key.current);
    domain.delegates().catch_up_to(key.current);

    assert_eq!(*log.borrow(), vec![("caught_up", key.current)]);
}

#[test]
fn resolving_a_child_leaves_the_parent_outstanding() {
    let domain = PredictionDomain::new(PredictionConfig::default());
    let log: Log = Rc::default();

    let mut key = domain.create_new_prediction_key(false);
    let parent = key.current;
    watch(&domain, &log, parent);
    key.generate_dependent(&domain);
    watch(&domain, &log, key.current);

    domain.delegates().reject(key.current);
    assert_eq!(*log.borrow(), vec![("rejected", key.current)]);
    assert!(domain.delegates().is_outstanding(parent));

    domain.delegates().catch_up_to(parent);
    assert_eq!(log.borrow().last(), Some(&("caught_up", parent)));
}

#[test]
fn catching_up_through_a_pre_wrap_key_spares_newer_keys() {
    let domain = domain_starting_at(KeyId::MAX);
    let log: Log = Rc::default();

    let old = domain.create_new_prediction_key(false);
    let new = domain.create_new_prediction_key(false);
    assert_eq!((old.current, new.current), (KeyId::MAX, 1));
    watch(&domain, &log, old.current);
    watch(&domain, &log, new.current);

    domain.delegates().catch_up_through(old.current);
    assert_eq!(*log.borrow(), vec![("caught_up", KeyId::MAX)]);
    assert!(domain.delegates().is_outstanding(new.current));

    domain.delegates().reject(new.current);
    assert_eq!(
        *log.borrow(),
        vec![("caught_up", KeyId::MAX), ("rejected", 1)]
    );
}

#[test]
fn catching_up_through_a_post_wrap_key_retires_older_keys_first() {
    let domain = domain_starting_at(KeyId::MAX - 1);
    let log: Log = Rc::default();

    for _ in 0..3 {
        let key = domain.create_new_prediction_key(false);
        watch(&domain, &log, key.current);
    }

    domain.delegates().catch_up_through(1);
    assert_eq!(
        *log.borrow(),
        vec![
            ("caught_up", KeyId::MAX - 1),
            ("caught_up", KeyId::MAX),
            ("caught_up", 1)
        ]
    );
    assert_eq!(domain.delegates().outstanding(), 0);
}
