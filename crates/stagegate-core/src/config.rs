//! Configuration for Stagegate.
//!
//! Read from a TOML file, then overlaid with `STAGEGATE_*` environment
//! variables. Every field has a default, so an empty file is valid.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stagegate_state::RepairCounter;

use crate::checks::{CommandCheck, DanglingReferenceCheck, DuplicateIdentifierCheck, ForbiddenPathCheck};
use crate::classification::{ClassificationRules, RuleSet};
use crate::error::{GateError, Result};
use crate::verification::Check;

/// An external command run as a verification step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Attempts per verification cycle before escalation
    #[serde(default = "default_repair_budget")]
    pub repair_budget: u32,

    /// Directory holding pipeline workspaces
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Glob patterns no build may write
    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,

    /// Timeout for each command check
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    /// Command checks, run after the static checks
    #[serde(default)]
    pub commands: Vec<CommandSpec>,

    /// Classification rules; built-in defaults when absent
    #[serde(default)]
    pub classification: Option<RuleSet>,
}

fn default_repair_budget() -> u32 {
    RepairCounter::DEFAULT_BUDGET
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".stagegate/workspaces")
}

fn default_forbidden_paths() -> Vec<String> {
    [".git/**", ".env", ".env.*", "*.pem", "*.key"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_check_timeout() -> u64 {
    300
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            repair_budget: default_repair_budget(),
            workspace_root: default_workspace_root(),
            forbidden_paths: default_forbidden_paths(),
            check_timeout_secs: default_check_timeout(),
            commands: Vec::new(),
            classification: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| GateError::Config(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}

impl GateConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: GateConfig =
            toml::from_str(content).map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `STAGEGATE_REPAIR_BUDGET`, `STAGEGATE_WORKSPACE_ROOT`,
    /// `STAGEGATE_CHECK_TIMEOUT_SECS` and `STAGEGATE_FORBIDDEN_PATHS`
    /// (comma-separated).
    pub fn apply_env(mut self) -> Result<Self> {
        if let Some(budget) = env_parse("STAGEGATE_REPAIR_BUDGET")? {
            self.repair_budget = budget;
        }
        if let Ok(root) = std::env::var("STAGEGATE_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(root);
        }
        if let Some(secs) = env_parse("STAGEGATE_CHECK_TIMEOUT_SECS")? {
            self.check_timeout_secs = secs;
        }
        if let Ok(paths) = std::env::var("STAGEGATE_FORBIDDEN_PATHS") {
            self.forbidden_paths = paths
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        self.validate()?;
        Ok(self)
    }

    /// File (if given) then environment.
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        base.apply_env()
    }

    fn validate(&self) -> Result<()> {
        if self.repair_budget == 0 {
            return Err(GateError::Config("repair_budget must be at least 1".into()));
        }
        if let Some(empty) = self.commands.iter().find(|c| c.command.is_empty()) {
            return Err(GateError::Config(format!(
                "command check '{}' has no program",
                empty.name
            )));
        }
        Ok(())
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn classification_rules(&self) -> Result<ClassificationRules> {
        match &self.classification {
            Some(rules) => ClassificationRules::from_rule_set(rules),
            None => Ok(ClassificationRules::default()),
        }
    }

    /// Built-in static checks followed by the configured commands.
    pub fn builtin_checks(&self) -> Result<Vec<Arc<dyn Check>>> {
        let mut checks: Vec<Arc<dyn Check>> = vec![
            Arc::new(ForbiddenPathCheck::new(&self.forbidden_paths)?),
            Arc::new(DuplicateIdentifierCheck::new()?),
            Arc::new(DanglingReferenceCheck::new()?),
        ];
        for spec in &self.commands {
            checks.push(Arc::new(CommandCheck::new(
                spec.name.clone(),
                spec.command.clone(),
                self.check_timeout(),
            )));
        }
        Ok(checks)
    }

    /// Directory of one pipeline's workspace.
    pub fn workspace_dir(&self, workspace_ref: &str) -> PathBuf {
        self.workspace_root.join(workspace_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = GateConfig::from_toml_str("").expect("config");
        assert_eq!(config, GateConfig::default());
        assert_eq!(config.repair_budget, 3);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
repair_budget = 5
forbidden_paths = ["secrets/**"]
check_timeout_secs = 30

[[commands]]
name = "typecheck"
command = ["npx", "tsc", "--noEmit"]

[classification]
non_repairable = ["license violation"]
"#
        )
        .expect("write");

        let config = GateConfig::load(file.path()).expect("load");
        assert_eq!(config.repair_budget, 5);
        assert_eq!(config.forbidden_paths, vec!["secrets/**".to_string()]);
        assert_eq!(config.check_timeout(), Duration::from_secs(30));
        assert_eq!(config.commands[0].name, "typecheck");

        let checks = config.builtin_checks().expect("checks");
        let names: Vec<&str> = checks.iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec![
                "forbidden-paths",
                "duplicate-identifiers",
                "dangling-references",
                "typecheck"
            ]
        );
        let rules = config.classification_rules().expect("rules").rule_set();
        assert_eq!(rules.non_repairable, vec!["license violation".to_string()]);
    }

    #[test]
    fn test_zero_budget_rejected() {
        let err = GateConfig::from_toml_str("repair_budget = 0").unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = GateConfig::from_toml_str(
            r#"
[[commands]]
name = "nothing"
command = []
"#,
        )
        .unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }

    #[test]
    fn test_invalid_classification_rule_rejected() {
        let config = GateConfig {
            classification: Some(RuleSet {
                non_repairable: vec!["[".to_string()],
                repairable: vec![],
            }),
            ..GateConfig::default()
        };
        assert!(config.builtin_checks().is_ok());
        assert!(config.classification_rules().is_err());
    }
}
