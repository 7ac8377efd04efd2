//! Plain-text rendering of structured results for the CLI collaborator.

mod render;

pub use render::{
    render_audit_results, render_coverage, render_diff, render_lint_results,
    render_test_results, suggest_fix,
};
