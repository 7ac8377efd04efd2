//! Declarative test plan: which tables to probe, as whom, expecting what.

mod loader;
mod model;

pub use loader::{load_config, parse_config, validate_config};
pub use model::{
    BucketTestSpec, DefaultClaims, Defaults, Expectation, JwtClaims, Op, PolicyConfig, Scenario,
    TableTestSpec,
};
