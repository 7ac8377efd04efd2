use serde::{Deserialize, Serialize};

use crate::config::{Expectation, Op};
use crate::probe::ProbeResultKind;

/// One record per executed (or structurally skipped) probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// `schema.name` of the probed table, or `storage:<bucket>` for buckets.
    pub table_key: String,
    /// Scenario the probe ran under.
    pub scenario_name: String,
    /// The attempted operation.
    pub op: Op,
    /// Declared expectation.
    pub expected: Expectation,
    /// Observed classification.
    pub actual: ProbeResultKind,
    /// True when observed matched declared. SKIPPED and ERROR never pass.
    pub passed: bool,
    /// Reason for ERROR/SKIPPED outcomes, or the captured non-policy error
    /// behind an ALLOW classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Wall-clock duration of the probe.
    pub duration_ms: u64,
}

impl TestResult {
    /// True when the declared expectation matches the observed outcome.
    pub fn expectation_met(expected: Expectation, actual: ProbeResultKind) -> bool {
        matches!(
            (expected, actual),
            (Expectation::Allow, ProbeResultKind::Allow)
                | (Expectation::Deny, ProbeResultKind::Deny)
        )
    }

    /// True for the worst failure mode: a probe that was expected to be
    /// denied but succeeded.
    pub fn is_leak_candidate(&self) -> bool {
        !self.passed
            && self.expected == Expectation::Deny
            && self.actual == ProbeResultKind::Allow
    }
}

/// Aggregated outcome of a test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResults {
    /// Number of probes planned.
    pub total: usize,
    /// Probes whose outcome matched the expectation.
    pub passed: usize,
    /// Probes whose outcome contradicted the expectation.
    pub failed: usize,
    /// Probes that could not execute.
    pub errored: usize,
    /// Probes skipped for structural reasons.
    pub skipped: usize,
    /// Every record, sorted by `(table_key, scenario_name, op)`.
    pub results: Vec<TestResult>,
    /// Tables excluded from probing because RLS is disabled on them.
    pub rls_disabled_tables: Vec<String>,
    /// Total wall-clock duration of the run.
    pub duration_ms: u64,
}

impl TestResults {
    /// Aggregate raw records into counts, sorting for deterministic output.
    ///
    /// Scheduling order is nondeterministic above `parallelism = 1`; the
    /// sort here is what makes two identical runs render identically.
    pub fn aggregate(
        mut results: Vec<TestResult>,
        rls_disabled_tables: Vec<String>,
        duration_ms: u64,
    ) -> Self {
        results.sort_by(|a, b| {
            a.table_key
                .cmp(&b.table_key)
                .then_with(|| a.scenario_name.cmp(&b.scenario_name))
                .then_with(|| a.op.cmp(&b.op))
        });

        let mut passed = 0;
        let mut failed = 0;
        let mut errored = 0;
        let mut skipped = 0;
        for result in &results {
            match result.actual {
                ProbeResultKind::Error => errored += 1,
                ProbeResultKind::Skipped => skipped += 1,
                _ if result.passed => passed += 1,
                _ => failed += 1,
            }
        }

        TestResults {
            total: results.len(),
            passed,
            failed,
            errored,
            skipped,
            results,
            rls_disabled_tables,
            duration_ms,
        }
    }

    /// Exit signal for the CLI collaborator: success only with zero failed
    /// and zero errored probes.
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 && self.errored == 0 {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(
        table_key: &str,
        scenario: &str,
        op: Op,
        expected: Expectation,
        actual: ProbeResultKind,
    ) -> TestResult {
        TestResult {
            table_key: table_key.to_string(),
            scenario_name: scenario.to_string(),
            op,
            expected,
            passed: TestResult::expectation_met(expected, actual),
            actual,
            error_message: None,
            duration_ms: 3,
        }
    }

    #[test]
    fn expectation_matching_is_exact() {
        assert!(TestResult::expectation_met(
            Expectation::Allow,
            ProbeResultKind::Allow
        ));
        assert!(TestResult::expectation_met(
            Expectation::Deny,
            ProbeResultKind::Deny
        ));
        assert!(!TestResult::expectation_met(
            Expectation::Allow,
            ProbeResultKind::Deny
        ));
        assert!(!TestResult::expectation_met(
            Expectation::Deny,
            ProbeResultKind::Skipped
        ));
        assert!(!TestResult::expectation_met(
            Expectation::Allow,
            ProbeResultKind::Error
        ));
    }

    #[test]
    fn skipped_counts_separately_and_never_passes() {
        let results = TestResults::aggregate(
            vec![
                result(
                    "public.nopk",
                    "authenticated",
                    Op::Update,
                    Expectation::Allow,
                    ProbeResultKind::Skipped,
                ),
                result(
                    "public.todos",
                    "anonymous",
                    Op::Select,
                    Expectation::Deny,
                    ProbeResultKind::Deny,
                ),
            ],
            Vec::new(),
            10,
        );
        assert_eq!(results.total, 2);
        assert_eq!(results.passed, 1);
        assert_eq!(results.skipped, 1);
        assert_eq!(results.failed, 0);
        assert_eq!(results.exit_code(), 0);
    }

    #[test]
    fn failures_and_errors_set_the_exit_signal() {
        let failing = TestResults::aggregate(
            vec![result(
                "public.leaky",
                "anonymous",
                Op::Select,
                Expectation::Deny,
                ProbeResultKind::Allow,
            )],
            Vec::new(),
            5,
        );
        assert_eq!(failing.failed, 1);
        assert_eq!(failing.exit_code(), 1);
        assert!(failing.results[0].is_leak_candidate());

        let errored = TestResults::aggregate(
            vec![result(
                "public.todos",
                "anonymous",
                Op::Select,
                Expectation::Deny,
                ProbeResultKind::Error,
            )],
            Vec::new(),
            5,
        );
        assert_eq!(errored.errored, 1);
        assert_eq!(errored.exit_code(), 1);
    }

    #[test]
    fn aggregation_sorts_by_table_scenario_op() {
        let results = TestResults::aggregate(
            vec![
                result(
                    "public.todos",
                    "anonymous",
                    Op::Update,
                    Expectation::Deny,
                    ProbeResultKind::Deny,
                ),
                result(
                    "public.todos",
                    "anonymous",
                    Op::Select,
                    Expectation::Deny,
                    ProbeResultKind::Deny,
                ),
                result(
                    "public.posts",
                    "owner",
                    Op::Select,
                    Expectation::Allow,
                    ProbeResultKind::Allow,
                ),
            ],
            Vec::new(),
            7,
        );
        let keys: Vec<(&str, &str, Op)> = results
            .results
            .iter()
            .map(|r| (r.table_key.as_str(), r.scenario_name.as_str(), r.op))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("public.posts", "owner", Op::Select),
                ("public.todos", "anonymous", Op::Select),
                ("public.todos", "anonymous", Op::Update),
            ]
        );
    }

    #[test]
    fn expected_deny_observed_deny_is_not_a_leak() {
        let r = result(
            "public.todos",
            "anonymous",
            Op::Select,
            Expectation::Deny,
            ProbeResultKind::Deny,
        );
        assert!(!r.is_leak_candidate());
    }
}
