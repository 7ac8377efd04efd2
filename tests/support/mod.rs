#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use rlsaudit::config::{
    load_config, Expectation, JwtClaims, Op, PolicyConfig, Scenario,
};
use rlsaudit::probe::ProbeResultKind;
use rlsaudit::runner::{TestResult, TestResults};

pub(crate) fn fixture_path(fixture: &str, file: &str) -> PathBuf {
    PathBuf::from("tests/fixtures").join(fixture).join(file)
}

pub(crate) fn load_fixture_config(fixture: &str, file: &str) -> PolicyConfig {
    load_config(&fixture_path(fixture, file)).expect("fixture config should load")
}

pub(crate) fn scenario(
    name: &str,
    claims: &[(&str, serde_json::Value)],
    expected: &[(Op, Expectation)],
) -> Scenario {
    let mut jwt_claims = JwtClaims::new();
    for (key, value) in claims {
        jwt_claims.insert((*key).to_string(), value.clone());
    }
    Scenario {
        name: name.to_string(),
        jwt_claims,
        expected: expected.iter().copied().collect::<BTreeMap<_, _>>(),
    }
}

pub(crate) fn test_result(
    table_key: &str,
    scenario_name: &str,
    op: Op,
    expected: Expectation,
    actual: ProbeResultKind,
) -> TestResult {
    TestResult {
        table_key: table_key.to_string(),
        scenario_name: scenario_name.to_string(),
        op,
        expected,
        passed: TestResult::expectation_met(expected, actual),
        actual,
        error_message: None,
        duration_ms: 2,
    }
}

pub(crate) fn aggregate(results: Vec<TestResult>) -> TestResults {
    TestResults::aggregate(results, Vec::new(), 10)
}
