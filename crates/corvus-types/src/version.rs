use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PIPELINE_VERSION: &str = "0.1.0";
pub const DEFAULT_SCHEMA_VERSION: &str = "2026-02";
pub const DEFAULT_TOOLCHAIN_VERSION: &str = "rust+tokio+sqlx+clap";

/// Versions pinned for a run. Every ledger entry records the pin that was
/// current when it was written so a replay can detect drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionPin {
    pub pipeline_version: String,
    pub schema_version: String,
    pub toolchain_version: String,
    pub ruleset_versions: BTreeMap<String, String>,
}

impl Default for VersionPin {
    fn default() -> Self {
        Self {
            pipeline_version: DEFAULT_PIPELINE_VERSION.to_string(),
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            toolchain_version: DEFAULT_TOOLCHAIN_VERSION.to_string(),
            ruleset_versions: BTreeMap::from([
                ("accessibility".to_string(), "wcag-2.1-aa".to_string()),
                ("security".to_string(), "1.0.0".to_string()),
            ]),
        }
    }
}

impl VersionPin {
    /// Describe every field where `self` (current) differs from `recorded`.
    ///
    /// Each line reads `"<field>: recorded=<a>, current=<b>"`. Rulesets are
    /// compared per name; a ruleset missing on one side shows as `<none>`.
    pub fn drift_from(&self, recorded: &VersionPin) -> Vec<String> {
        let mut drifts = Vec::new();
        let mut check = |field: &str, recorded: Option<&String>, current: Option<&String>| {
            if recorded != current {
                drifts.push(format!(
                    "{field}: recorded={}, current={}",
                    recorded.map_or("<none>", String::as_str),
                    current.map_or("<none>", String::as_str),
                ));
            }
        };

        check(
            "pipeline_version",
            Some(&recorded.pipeline_version),
            Some(&self.pipeline_version),
        );
        check(
            "schema_version",
            Some(&recorded.schema_version),
            Some(&self.schema_version),
        );
        check(
            "toolchain_version",
            Some(&recorded.toolchain_version),
            Some(&self.toolchain_version),
        );

        let mut names: Vec<&String> = recorded
            .ruleset_versions
            .keys()
            .chain(self.ruleset_versions.keys())
            .collect();
        names.sort();
        names.dedup();
        for name in names {
            check(
                &format!("ruleset_versions.{name}"),
                recorded.ruleset_versions.get(name),
                self.ruleset_versions.get(name),
            );
        }

        drifts
    }
}
