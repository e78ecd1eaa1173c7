//! JSON report for a scenario run.

use serde::Serialize;
use serde_json::Value;

use crate::session::{TranscriptEntry, WireStats};

#[derive(Clone, Debug, Serialize)]
pub struct Check {
    pub name: String,
    pub expected: Value,
    pub actual: Value,
    pub passed: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub description: String,
    pub passed: bool,
    pub ticks: u64,
    pub wire: WireStats,
    pub checks: Vec<Check>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transcript: Vec<TranscriptEntry>,
}

impl ScenarioReport {
    pub fn new(scenario: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            description: description.into(),
            passed: true,
            ticks: 0,
            wire: WireStats::default(),
            checks: Vec::new(),
            transcript: Vec::new(),
        }
    }

    /// Record an expectation. The report fails if any check does.
    pub fn check<T>(&mut self, name: &str, expected: T, actual: T)
    where
        T: Serialize + PartialEq,
    {
        let passed = expected == actual;
        if !passed {
            tracing::warn!(scenario = %self.scenario, check = name, "check failed");
        }
        self.passed &= passed;
        self.checks.push(Check {
            name: name.to_string(),
            expected: to_value(&expected),
            actual: to_value(&actual),
            passed,
        });
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
