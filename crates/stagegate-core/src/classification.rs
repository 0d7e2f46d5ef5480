//! Failure classification: ordered, case-insensitive regex rule lists over
//! verification diagnostics.
//!
//! Non-repairable rules are checked against every line first and always
//! win. When nothing matches the failure is `Unclassified`.

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use stagegate_state::FailureClassification;

use crate::error::{GateError, Result};

pub const DEFAULT_NON_REPAIRABLE: &[&str] = &[
    "security violation",
    "ruleset violation",
    "architecture violation",
    "data loss",
    "unauthorized dependency",
    "forbidden file",
];

pub const DEFAULT_REPAIRABLE: &[&str] = &[
    "missing identifier",
    "duplicate identifier",
    "runtime error",
    "missing file",
    "unresolved import|bad import",
    "logic error",
    "bad path",
    "undefined reference|is undefined",
    "compile error",
];

/// Rule lists as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default = "default_non_repairable")]
    pub non_repairable: Vec<String>,
    #[serde(default = "default_repairable")]
    pub repairable: Vec<String>,
}

fn default_non_repairable() -> Vec<String> {
    DEFAULT_NON_REPAIRABLE.iter().map(|s| s.to_string()).collect()
}

fn default_repairable() -> Vec<String> {
    DEFAULT_REPAIRABLE.iter().map(|s| s.to_string()).collect()
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            non_repairable: default_non_repairable(),
            repairable: default_repairable(),
        }
    }
}

/// Outcome of classifying a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub class: FailureClassification,
    /// Diagnostic line that decided the class; the first line when
    /// unclassified.
    pub matched_line: Option<String>,
    /// Pattern that matched.
    pub rule: Option<String>,
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    regex: Regex,
}

impl Rule {
    fn compile(pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| GateError::Config(format!("bad classification rule '{pattern}': {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }
}

/// Compiled classification rules.
#[derive(Debug, Clone)]
pub struct ClassificationRules {
    non_repairable: Vec<Rule>,
    repairable: Vec<Rule>,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        // The built-in patterns are literals and always compile.
        let compile_all = |patterns: &[&str]| {
            patterns
                .iter()
                .filter_map(|p| Rule::compile(p).ok())
                .collect()
        };
        Self {
            non_repairable: compile_all(DEFAULT_NON_REPAIRABLE),
            repairable: compile_all(DEFAULT_REPAIRABLE),
        }
    }
}

impl ClassificationRules {
    pub fn new<S: AsRef<str>>(non_repairable: &[S], repairable: &[S]) -> Result<Self> {
        Ok(Self {
            non_repairable: non_repairable
                .iter()
                .map(|p| Rule::compile(p.as_ref()))
                .collect::<Result<_>>()?,
            repairable: repairable
                .iter()
                .map(|p| Rule::compile(p.as_ref()))
                .collect::<Result<_>>()?,
        })
    }

    pub fn from_rule_set(rules: &RuleSet) -> Result<Self> {
        Self::new(&rules.non_repairable, &rules.repairable)
    }

    /// Parse a TOML document with `non_repairable` and `repairable` arrays.
    /// A missing list keeps its defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let rules: RuleSet = toml::from_str(content)
            .map_err(|e| GateError::Config(format!("invalid classification rules: {e}")))?;
        Self::from_rule_set(&rules)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn rule_set(&self) -> RuleSet {
        RuleSet {
            non_repairable: self.non_repairable.iter().map(|r| r.pattern.clone()).collect(),
            repairable: self.repairable.iter().map(|r| r.pattern.clone()).collect(),
        }
    }

    fn first_match<'a>(rules: &'a [Rule], lines: &'a [String]) -> Option<(&'a str, &'a Rule)> {
        lines.iter().find_map(|line| {
            rules
                .iter()
                .find(|r| r.regex.is_match(line))
                .map(|r| (line.as_str(), r))
        })
    }

    /// Classify the diagnostic lines of a failed verification.
    pub fn classify(&self, diagnostics: &[String]) -> Classification {
        if let Some((line, rule)) = Self::first_match(&self.non_repairable, diagnostics) {
            return Classification {
                class: FailureClassification::NonRepairable,
                matched_line: Some(line.to_string()),
                rule: Some(rule.pattern.clone()),
            };
        }
        if let Some((line, rule)) = Self::first_match(&self.repairable, diagnostics) {
            return Classification {
                class: FailureClassification::Repairable,
                matched_line: Some(line.to_string()),
                rule: Some(rule.pattern.clone()),
            };
        }
        Classification {
            class: FailureClassification::Unclassified,
            matched_line: diagnostics.first().cloned(),
            rule: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_rules() {
        let rules = ClassificationRules::default();
        let c = rules.classify(&lines(&["Runtime error: x is undefined"]));
        assert_eq!(c.class, FailureClassification::Repairable);
        assert_eq!(c.rule.as_deref(), Some("runtime error"));

        let c = rules.classify(&lines(&["Security violation: forbidden API"]));
        assert_eq!(c.class, FailureClassification::NonRepairable);
    }

    #[test]
    fn test_non_repairable_wins_regardless_of_line_order() {
        let rules = ClassificationRules::default();
        let c = rules.classify(&lines(&[
            "Duplicate identifier 'App' in src/App.tsx",
            "Forbidden file mutation: .env",
        ]));
        assert_eq!(c.class, FailureClassification::NonRepairable);
        assert_eq!(
            c.matched_line.as_deref(),
            Some("Forbidden file mutation: .env")
        );
    }

    #[test]
    fn test_unclassified_keeps_first_line() {
        let rules = ClassificationRules::default();
        let c = rules.classify(&lines(&["segfault at 0x0", "core dumped"]));
        assert_eq!(c.class, FailureClassification::Unclassified);
        assert_eq!(c.matched_line.as_deref(), Some("segfault at 0x0"));
        assert!(c.rule.is_none());
    }

    #[test]
    fn test_builtin_check_wording_is_classified() {
        let rules = ClassificationRules::default();
        for line in [
            "Unresolved import './x' in src/a.ts",
            "Duplicate identifier 'x' in a.py",
            "Compile error: expected ';'",
        ] {
            assert_eq!(
                rules.classify(&lines(&[line])).class,
                FailureClassification::Repairable,
                "{line}"
            );
        }
    }

    #[test]
    fn test_from_toml_overrides_one_list() {
        let rules = ClassificationRules::from_toml_str(
            r#"
non_repairable = ["license violation"]
"#,
        )
        .expect("rules");
        let set = rules.rule_set();
        assert_eq!(set.non_repairable, vec!["license violation".to_string()]);
        assert_eq!(set.repairable, default_repairable());
        assert_eq!(
            rules
                .classify(&lines(&["LICENSE VIOLATION in vendor/"]))
                .class,
            FailureClassification::NonRepairable
        );
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        let err = ClassificationRules::new(&["(unclosed"], &[]).unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }
}
