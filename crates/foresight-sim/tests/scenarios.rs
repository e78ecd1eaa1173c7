use foresight_sim::{demo_definitions, run_all, Scenario, Session, SimConfig};

fn config_with_latency(latency_ticks: u64) -> SimConfig {
    let mut config = SimConfig::default();
    config.network.latency_ticks = latency_ticks;
    config
}

fn assert_passed(report: &foresight_sim::ScenarioReport) {
    let failed: Vec<_> = report.failed_checks().collect();
    assert!(report.passed, "{} failed: {:#?}", report.scenario, failed);
}

#[test]
fn every_scenario_passes_with_default_latency() {
    let reports = run_all(&SimConfig::default()).unwrap();
    assert_eq!(reports.len(), Scenario::ALL.len());
    for report in &reports {
        assert_passed(report);
    }
}

#[test]
fn scenarios_do_not_depend_on_latency() {
    for latency in [0, 1, 8] {
        let config = config_with_latency(latency);
        for scenario in [
            Scenario::Rejected,
            Scenario::Confirmed,
            Scenario::StackingIdempotence,
        ] {
            assert_passed(&scenario.run(&config).unwrap());
        }
    }
}

#[test]
fn report_serializes_with_transcript() {
    let mut config = SimConfig::default();
    config.record_transcript = true;
    let report = Scenario::Confirmed.run(&config).unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["scenario"], "confirmed");
    assert_eq!(json["passed"], true);
    let transcript = json["transcript"].as_array().unwrap();
    let types: Vec<_> = transcript
        .iter()
        .map(|entry| entry["message"]["type"].as_str().unwrap())
        .collect();
    assert_eq!(
        types,
        ["ServerTryActivate", "ClientActivateSucceeded", "Replication"]
    );
    assert!(report.wire.client_bytes > 0);
    assert_eq!(report.wire.replication_updates, 1);
}

#[test]
fn server_initiated_keys_survive_the_codec() {
    // The authority activates on its own; the owner sees the activation and
    // the echoed key without ever predicting it.
    let mut session = Session::new(&SimConfig::default(), &demo_definitions()).unwrap();
    let focus = session.ability("focus").unwrap();

    session.server_mut().try_activate_ability(focus).unwrap();
    assert!(session.run_until_settled().unwrap());

    assert_eq!(session.client().attribute("mana"), 90.0);
    assert_eq!(session.client().attribute("power"), 5.0);
    assert_eq!(session.client().domain().delegates().outstanding(), 0);
    assert!(session.client().key_ring().latest().is_none());
}
