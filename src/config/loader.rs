use std::collections::HashMap;
use std::path::Path;

use crate::config::model::PolicyConfig;
use crate::error::{AuditError, Result};

/// Load and validate a policy configuration file.
///
/// The format is chosen by extension: `.json` parses as JSON, everything
/// else as YAML.
pub fn load_config(path: &Path) -> Result<PolicyConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AuditError::Configuration(format!("Failed to read {}: {e}", path.display()))
    })?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    parse_config(&content, is_json)
}

/// Parse a policy configuration from a string and validate it.
pub fn parse_config(content: &str, json: bool) -> Result<PolicyConfig> {
    let config: PolicyConfig = if json {
        serde_json::from_str(content)
            .map_err(|e| AuditError::Configuration(format!("Invalid policy config JSON: {e}")))?
    } else {
        serde_yaml::from_str(content)
            .map_err(|e| AuditError::Configuration(format!("Invalid policy config YAML: {e}")))?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Validate structural invariants the type system cannot express.
///
/// Table keys must be schema-qualified, and two keys that differ only in
/// case would address the same relation, so both are load-time errors.
pub fn validate_config(config: &PolicyConfig) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::new();

    for key in config.tables.keys() {
        let mut parts = key.splitn(2, '.');
        let schema = parts.next().unwrap_or_default().trim();
        let name = parts.next().unwrap_or_default().trim();
        if schema.is_empty() || name.is_empty() {
            return Err(AuditError::Configuration(format!(
                "Table key '{key}' must be schema-qualified as 'schema.name'"
            )));
        }

        let normalized = key.to_ascii_lowercase();
        if let Some(previous) = seen.insert(normalized, key.as_str()) {
            return Err(AuditError::Configuration(format!(
                "Table keys '{previous}' and '{key}' address the same relation"
            )));
        }
    }

    for (key, spec) in &config.tables {
        for scenario in &spec.test_scenarios {
            if scenario.name.trim().is_empty() {
                return Err(AuditError::Configuration(format!(
                    "Table '{key}' has a scenario with an empty name"
                )));
            }
        }
    }

    for (bucket, spec) in &config.storage_buckets {
        if bucket.trim().is_empty() {
            return Err(AuditError::Configuration(
                "Storage bucket keys must be non-empty".to_string(),
            ));
        }
        for scenario in &spec.test_scenarios {
            if scenario.name.trim().is_empty() {
                return Err(AuditError::Configuration(format!(
                    "Bucket '{bucket}' has a scenario with an empty name"
                )));
            }
        }
    }

    Ok(())
}
