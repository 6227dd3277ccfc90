//! Engine configuration: TOML file, then environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use corvus_types::{default_stage_definitions, CorvusError, Result, StageDefinition, TrustContext, VersionPin};

pub const DEFAULT_CONFIG_FILE: &str = "corvus.toml";
pub const DEFAULT_LEDGER_PATH: &str = ".corvusforge/ledger.db";

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorvusConfig {
    pub ledger_path: PathBuf,
    pub log_level: String,
    pub max_connections: u32,
    /// Refuse to resume a run whose recorded versions differ from ours.
    pub strict_version_pins: bool,
    pub versions: VersionPin,
    /// Trust key fingerprints stamped onto every entry this process writes.
    pub trust_context: TrustContext,
    /// Custom stage table. The standard template is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<StageDefinition>>,
}

impl Default for CorvusConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from(DEFAULT_LEDGER_PATH),
            log_level: "info".to_string(),
            max_connections: 4,
            strict_version_pins: true,
            versions: VersionPin::default(),
            trust_context: TrustContext::new(),
            stages: None,
        }
    }
}

impl CorvusConfig {
    /// Load from `path`, or from `corvus.toml` in the working directory if
    /// it exists, or fall back to defaults. Environment overrides are
    /// applied last, then the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CorvusError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&contents)
            .map_err(|e| CorvusError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| CorvusError::Config(e.to_string()))
    }

    /// Apply `CORVUS_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("CORVUS_LEDGER_PATH") {
            self.ledger_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("CORVUS_LOG_LEVEL") {
            self.log_level = level.trim().to_ascii_lowercase();
        }
        if let Some(raw) = lookup("CORVUS_MAX_CONNECTIONS") {
            self.max_connections = raw.trim().parse().map_err(|_| {
                CorvusError::Config(format!("CORVUS_MAX_CONNECTIONS must be a positive integer, got {raw:?}"))
            })?;
        }
        if let Some(raw) = lookup("CORVUS_STRICT_VERSION_PINS") {
            self.strict_version_pins = parse_bool(&raw).ok_or_else(|| {
                CorvusError::Config(format!("CORVUS_STRICT_VERSION_PINS must be true or false, got {raw:?}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(CorvusError::Config("max_connections must be at least 1".into()));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(CorvusError::Config(format!(
                "log_level must be one of {}, got {:?}",
                LOG_LEVELS.join("|"),
                self.log_level
            )));
        }
        if self.ledger_path.as_os_str().is_empty() {
            return Err(CorvusError::Config("ledger_path must not be empty".into()));
        }
        Ok(())
    }

    pub fn stage_definitions(&self) -> Vec<StageDefinition> {
        self.stages.clone().unwrap_or_else(default_stage_definitions)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = CorvusConfig::default();
        assert_eq!(config.ledger_path, PathBuf::from(".corvusforge/ledger.db"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.max_connections, 4);
        assert!(config.strict_version_pins);
        assert!(config.trust_context.is_empty());
        assert_eq!(config.stage_definitions().len(), 10);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = CorvusConfig::from_toml(
            r#"
            ledger_path = "/var/lib/corvus/ledger.db"
            strict_version_pins = false

            [versions]
            pipeline_version = "0.2.0"

            [trust_context]
            plugin_key = "fp-123"
            "#,
        )
        .unwrap();
        assert_eq!(config.ledger_path, PathBuf::from("/var/lib/corvus/ledger.db"));
        assert!(!config.strict_version_pins);
        assert_eq!(config.versions.pipeline_version, "0.2.0");
        assert_eq!(config.versions.schema_version, "2026-02");
        assert_eq!(config.trust_context["plugin_key"], "fp-123");
        assert_eq!(config.max_connections, 4);
    }

    #[test]
    fn custom_stage_table_from_toml() {
        let config = CorvusConfig::from_toml(
            r#"
            [[stages]]
            stage_id = "build"
            display_name = "Build"
            ordinal = 0.0

            [[stages]]
            stage_id = "ship"
            display_name = "Ship"
            ordinal = 1.0
            prerequisites = ["build"]
            is_mandatory_gate = true
            "#,
        )
        .unwrap();
        let stages = config.stage_definitions();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[1].prerequisites, vec!["build"]);
        assert!(stages[1].is_mandatory_gate);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = CorvusConfig::from_toml("max_connections = \"lots\"").unwrap_err();
        assert!(matches!(err, CorvusError::Config(_)));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = CorvusConfig::default();
        config
            .apply_overrides(env(&[
                ("CORVUS_LEDGER_PATH", "/tmp/other.db"),
                ("CORVUS_LOG_LEVEL", "DEBUG"),
                ("CORVUS_MAX_CONNECTIONS", "8"),
                ("CORVUS_STRICT_VERSION_PINS", "off"),
            ]))
            .unwrap();
        assert_eq!(config.ledger_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_connections, 8);
        assert!(!config.strict_version_pins);
        config.validate().unwrap();
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let mut config = CorvusConfig::default();
        assert!(config
            .apply_overrides(env(&[("CORVUS_MAX_CONNECTIONS", "-1")]))
            .is_err());
        assert!(config
            .apply_overrides(env(&[("CORVUS_STRICT_VERSION_PINS", "maybe")]))
            .is_err());
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut config = CorvusConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.max_connections = 1;
        config.log_level = "loud".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("error|warn|info|debug|trace"));
    }

    #[test]
    fn explicit_path_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corvus.toml");
        std::fs::write(&path, "log_level = \"warn\"\n").unwrap();
        let config = CorvusConfig::from_file(&path).unwrap();
        assert_eq!(config.log_level, "warn");

        let missing = CorvusConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, CorvusError::Config(_)));
    }
}
