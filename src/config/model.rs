use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// JWT claim payload attached to a scenario.
///
/// Claims are an open-ended JSON object. The only key the engine inspects is
/// `role`; everything else is opaque payload serialized into the session GUC.
pub type JwtClaims = serde_json::Map<String, serde_json::Value>;

/// The SQL operation a probe attempts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// Row visibility via `SELECT ... LIMIT 1`.
    Select,
    /// Row creation via a synthesized minimal `INSERT`.
    Insert,
    /// No-op targeted `UPDATE` on one visible row.
    Update,
    /// Targeted `DELETE` of one visible row.
    Delete,
}

impl Op {
    /// All four operations, in presentation order.
    pub const ALL: [Op; 4] = [Op::Select, Op::Insert, Op::Update, Op::Delete];
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Select => write!(f, "SELECT"),
            Op::Insert => write!(f, "INSERT"),
            Op::Update => write!(f, "UPDATE"),
            Op::Delete => write!(f, "DELETE"),
        }
    }
}

impl std::str::FromStr for Op {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "select" => Ok(Op::Select),
            "insert" => Ok(Op::Insert),
            "update" => Ok(Op::Update),
            "delete" => Ok(Op::Delete),
            _ => Err(format!("Unknown operation: {s}")),
        }
    }
}

/// Declared expectation for one operation under one scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expectation {
    /// The operation should succeed for this caller.
    Allow,
    /// The operation should be blocked by policy for this caller.
    Deny,
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Allow => write!(f, "ALLOW"),
            Expectation::Deny => write!(f, "DENY"),
        }
    }
}

/// One simulated caller: a name, its JWT claims, and per-op expectations.
///
/// Operations absent from `expected` are not probed for this scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name, e.g. `anonymous` or `owner`.
    pub name: String,
    /// Claims injected into `request.jwt.claims` for the probe session.
    #[serde(default)]
    pub jwt_claims: JwtClaims,
    /// Expected outcome per operation.
    #[serde(default)]
    pub expected: BTreeMap<Op, Expectation>,
}

impl Scenario {
    /// The session role this scenario's claims resolve to.
    ///
    /// `authenticated` only when the claims literally say so; every other
    /// claim set (including an empty one) probes as `anon`.
    pub fn session_role(&self) -> &'static str {
        match self.jwt_claims.get("role").and_then(|v| v.as_str()) {
            Some("authenticated") => "authenticated",
            _ => "anon",
        }
    }

    /// The claim role when it is present and not `authenticated`.
    ///
    /// Policies that read the `role` GUC instead of the session role still
    /// need to see this value.
    pub fn guc_role(&self) -> Option<&str> {
        self.jwt_claims
            .get("role")
            .and_then(|v| v.as_str())
            .filter(|r| *r != "authenticated")
    }
}

/// Test specification for one table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableTestSpec {
    /// Scenarios to run against the table.
    #[serde(default)]
    pub test_scenarios: Vec<Scenario>,
    /// Restrict probing to these operations, regardless of expectations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_operations: Option<Vec<Op>>,
}

/// Test specification for one storage bucket.
///
/// Buckets share the policy set of `storage.objects`; only the `bucket_id`
/// filter differs between them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketTestSpec {
    /// Scenarios to run against the bucket's object rows.
    #[serde(default)]
    pub test_scenarios: Vec<Scenario>,
    /// Restrict probing to these operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_operations: Option<Vec<Op>>,
}

/// Default claim sets per simulated caller kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultClaims {
    /// Claims for the synthesized `anonymous` scenario.
    #[serde(default)]
    pub anonymous: JwtClaims,
    /// Claims for the synthesized `authenticated` scenario.
    #[serde(default)]
    pub authenticated: JwtClaims,
}

/// Fallbacks applied to tables that declare no scenarios of their own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Defaults {
    /// Per-op expectations for the synthesized `anonymous` scenario.
    #[serde(default)]
    pub anonymous_user_expectations: BTreeMap<Op, Expectation>,
    /// Per-op expectations for the synthesized `authenticated` scenario.
    #[serde(default)]
    pub authenticated_user_expectations: BTreeMap<Op, Expectation>,
    /// Claim payloads for the synthesized scenarios.
    #[serde(default)]
    pub default_jwt_claims: DefaultClaims,
}

/// The whole declarative test plan.
///
/// Table keys are `schema.name`. Bucket keys are bucket names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Per-table test specifications, keyed by `schema.name`.
    #[serde(default)]
    pub tables: BTreeMap<String, TableTestSpec>,
    /// Per-bucket test specifications, keyed by bucket name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage_buckets: BTreeMap<String, BucketTestSpec>,
    /// Fallback scenarios for tables without explicit ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Defaults>,
}

impl PolicyConfig {
    /// Scenarios to run for one table entry, synthesizing from `defaults`
    /// when the entry declares none.
    pub fn scenarios_for(&self, spec: &TableTestSpec) -> Vec<Scenario> {
        if !spec.test_scenarios.is_empty() {
            return spec.test_scenarios.clone();
        }
        let Some(defaults) = &self.defaults else {
            return Vec::new();
        };
        let mut scenarios = Vec::new();
        if !defaults.anonymous_user_expectations.is_empty() {
            scenarios.push(Scenario {
                name: "anonymous".to_string(),
                jwt_claims: defaults.default_jwt_claims.anonymous.clone(),
                expected: defaults.anonymous_user_expectations.clone(),
            });
        }
        if !defaults.authenticated_user_expectations.is_empty() {
            let mut claims = defaults.default_jwt_claims.authenticated.clone();
            claims
                .entry("role".to_string())
                .or_insert_with(|| serde_json::Value::String("authenticated".to_string()));
            scenarios.push(Scenario {
                name: "authenticated".to_string(),
                jwt_claims: claims,
                expected: defaults.authenticated_user_expectations.clone(),
            });
        }
        scenarios
    }
}
