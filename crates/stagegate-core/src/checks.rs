//! Built-in verification checks.
//!
//! The static checks read the workspace only. Their diagnostic wording is
//! picked up by the default classification rules.

use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use tokio::process::Command;

use crate::error::{GateError, Result};
use crate::verification::{Check, CheckOutcome, WorkspaceView};
use crate::workspace::normalize;

const SCRIPT_EXTENSIONS: &[&str] = &["js", "jsx", "mjs", "cjs", "ts", "tsx"];
const RESOLVE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs", "json", "css"];

fn extension(path: &str) -> &str {
    path.rsplit_once('.')
        .filter(|(stem, _)| !stem.ends_with('/') && !stem.is_empty())
        .map(|(_, ext)| ext)
        .unwrap_or("")
}

fn is_script(path: &str) -> bool {
    SCRIPT_EXTENSIONS.contains(&extension(path))
}

/// Anchor a forbidden-path glob to the workspace root. A pattern without
/// `/` matches a file name at any depth.
pub fn normalize_pattern(raw: &str) -> String {
    let pattern = raw.trim().trim_start_matches('/');
    if !pattern.contains('/') && !pattern.starts_with("**") {
        format!("**/{pattern}")
    } else {
        pattern.to_string()
    }
}

// ---------------------------------------------------------------------------
// Forbidden paths
// ---------------------------------------------------------------------------

/// Fails when the workspace contains a file matching a forbidden pattern.
///
/// `*` and `?` stay within one path segment; `**` crosses segments.
pub struct ForbiddenPathCheck {
    patterns: Vec<String>,
    matchers: GlobSet,
}

impl ForbiddenPathCheck {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for raw in patterns {
            let glob = GlobBuilder::new(&normalize_pattern(raw))
                .literal_separator(true)
                .build()
                .map_err(|e| GateError::Config(format!("bad path pattern '{raw}': {e}")))?;
            builder.add(glob);
        }
        let matchers = builder
            .build()
            .map_err(|e| GateError::Config(format!("bad path patterns: {e}")))?;
        Ok(Self {
            patterns: patterns.to_vec(),
            matchers,
        })
    }

    /// Whether a workspace-relative path matches any pattern.
    pub fn is_forbidden(&self, path: &str) -> bool {
        self.matchers.is_match(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Check for ForbiddenPathCheck {
    fn name(&self) -> &str {
        "forbidden-paths"
    }

    fn command(&self) -> String {
        format!("forbidden-paths {}", self.patterns.join(" "))
    }

    async fn run(&self, view: &WorkspaceView<'_>) -> anyhow::Result<CheckOutcome> {
        let diagnostics = view
            .list_files()
            .context("listing workspace files")?
            .into_iter()
            .filter(|f| self.is_forbidden(f))
            .map(|f| format!("Forbidden file mutation: {f}"))
            .collect();
        Ok(CheckOutcome::from_diagnostics(diagnostics))
    }
}

// ---------------------------------------------------------------------------
// Duplicate identifiers
// ---------------------------------------------------------------------------

/// Flags top-level declarations that bind the same name twice in one file.
pub struct DuplicateIdentifierCheck {
    script: Regex,
    python: Regex,
}

impl DuplicateIdentifierCheck {
    pub fn new() -> Result<Self> {
        let script = Regex::new(
            r"(?m)^(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:async\s+)?(?:function\*?|class|const|let|var|interface|type|enum)\s+([A-Za-z_$][A-Za-z0-9_$]*)",
        )
        .map_err(|e| GateError::Config(e.to_string()))?;
        let python = Regex::new(r"(?m)^(?:async\s+)?(?:def|class)\s+([A-Za-z_][A-Za-z0-9_]*)")
            .map_err(|e| GateError::Config(e.to_string()))?;
        Ok(Self { script, python })
    }

    fn declarations<'t>(&self, path: &str, source: &'t str) -> Vec<&'t str> {
        let re = if is_script(path) {
            &self.script
        } else if extension(path) == "py" {
            &self.python
        } else {
            return Vec::new();
        };
        re.captures_iter(source)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .collect()
    }
}

#[async_trait]
impl Check for DuplicateIdentifierCheck {
    fn name(&self) -> &str {
        "duplicate-identifiers"
    }

    fn command(&self) -> String {
        "duplicate-identifiers".to_string()
    }

    async fn run(&self, view: &WorkspaceView<'_>) -> anyhow::Result<CheckOutcome> {
        let mut diagnostics = Vec::new();
        for path in view.list_files().context("listing workspace files")? {
            if !is_script(&path) && extension(&path) != "py" {
                continue;
            }
            let source = view
                .read_to_string(&path)
                .with_context(|| format!("reading {path}"))?;
            let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
            for name in self.declarations(&path, &source) {
                *seen.entry(name).or_default() += 1;
            }
            diagnostics.extend(
                seen.into_iter()
                    .filter(|(_, count)| *count > 1)
                    .map(|(name, _)| format!("Duplicate identifier '{name}' in {path}")),
            );
        }
        Ok(CheckOutcome::from_diagnostics(diagnostics))
    }
}

// ---------------------------------------------------------------------------
// Dangling references
// ---------------------------------------------------------------------------

/// Every relative import of a script must resolve to a workspace file.
pub struct DanglingReferenceCheck {
    patterns: Vec<Regex>,
}

impl DanglingReferenceCheck {
    pub fn new() -> Result<Self> {
        let patterns = [
            r#"(?:import|export)\s[^;'"]*?\bfrom\s*['"](\.{1,2}/[^'"]*)['"]"#,
            r#"\bimport\s*['"](\.{1,2}/[^'"]*)['"]"#,
            r#"\bimport\(\s*['"](\.{1,2}/[^'"]*)['"]\s*\)"#,
            r#"\brequire\(\s*['"](\.{1,2}/[^'"]*)['"]\s*\)"#,
        ]
        .iter()
        .map(|p| Regex::new(p).map_err(|e| GateError::Config(e.to_string())))
        .collect::<Result<_>>()?;
        Ok(Self { patterns })
    }

    fn imports<'t>(&self, source: &'t str) -> BTreeSet<&'t str> {
        self.patterns
            .iter()
            .flat_map(|re| re.captures_iter(source))
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .collect()
    }
}

/// Whether `spec`, imported from `from`, names a file in `files`.
fn resolves(files: &BTreeSet<String>, from: &str, spec: &str) -> bool {
    let dir = from.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    let Some(target) = normalize(&format!("{dir}/{spec}")) else {
        return false;
    };
    if files.contains(&target) {
        return true;
    }
    RESOLVE_EXTENSIONS.iter().any(|ext| {
        files.contains(&format!("{target}.{ext}"))
            || files.contains(&format!("{target}/index.{ext}"))
    })
}

#[async_trait]
impl Check for DanglingReferenceCheck {
    fn name(&self) -> &str {
        "dangling-references"
    }

    fn command(&self) -> String {
        "dangling-references".to_string()
    }

    async fn run(&self, view: &WorkspaceView<'_>) -> anyhow::Result<CheckOutcome> {
        let files: BTreeSet<String> = view
            .list_files()
            .context("listing workspace files")?
            .into_iter()
            .collect();
        let mut diagnostics = Vec::new();
        for path in files.iter().filter(|p| is_script(p)) {
            let source = view
                .read_to_string(path)
                .with_context(|| format!("reading {path}"))?;
            diagnostics.extend(
                self.imports(&source)
                    .into_iter()
                    .filter(|spec| !resolves(&files, path, spec))
                    .map(|spec| format!("Unresolved import '{spec}' in {path}")),
            );
        }
        Ok(CheckOutcome::from_diagnostics(diagnostics))
    }
}

// ---------------------------------------------------------------------------
// External command
// ---------------------------------------------------------------------------

/// Runs a command in the workspace root; a non-zero exit fails the step.
pub struct CommandCheck {
    name: String,
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandCheck {
    pub fn new(name: impl Into<String>, argv: Vec<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            argv,
            timeout,
        }
    }
}

#[async_trait]
impl Check for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> String {
        self.argv.join(" ")
    }

    async fn run(&self, view: &WorkspaceView<'_>) -> anyhow::Result<CheckOutcome> {
        let root = view
            .root()
            .ok_or_else(|| anyhow::anyhow!("workspace has no filesystem root"))?;
        let (exe, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("check {} has empty command", self.name))?;

        let child = Command::new(exe)
            .args(args)
            .current_dir(root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {exe}"))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Ok(CheckOutcome {
                    exit_code: 124,
                    stdout: String::new(),
                    diagnostics: vec![format!(
                        "Command timed out after {}s: {}",
                        self.timeout.as_secs(),
                        self.command()
                    )],
                })
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let mut diagnostics: Vec<String> = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::to_string)
            .collect();
        if exit_code != 0 && diagnostics.iter().all(|d| d.trim().is_empty()) {
            diagnostics.push(format!(
                "Command exited with status {exit_code}: {}",
                self.command()
            ));
        }
        Ok(CheckOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{FsWorkspace, MemoryWorkspace, Workspace};
    use stagegate_state::PipelineId;

    async fn run(check: &dyn Check, ws: &dyn Workspace) -> CheckOutcome {
        let pid = PipelineId::from("p");
        let view = WorkspaceView::new(&pid, 1, ws);
        check.run(&view).await.expect("check ran")
    }

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(normalize_pattern(".env*"), "**/.env*");
        assert_eq!(normalize_pattern("/.git/**"), ".git/**");
        assert_eq!(normalize_pattern("**/*.key"), "**/*.key");
    }

    #[test]
    fn test_forbidden_path_globs() {
        let env = ForbiddenPathCheck::new(&[".env*".to_string()]).expect("glob");
        assert!(env.is_forbidden(".env"));
        assert!(env.is_forbidden("config/.env.local"));
        assert!(!env.is_forbidden("src/env.ts"));

        let git = ForbiddenPathCheck::new(&[".git/**".to_string()]).expect("glob");
        assert!(git.is_forbidden(".git/config"));
        assert!(git.is_forbidden(".git/refs/heads/main"));
        assert!(!git.is_forbidden("src/.git/config"));

        let deep = ForbiddenPathCheck::new(&["src/**/secret?.ts".to_string()]).expect("glob");
        assert!(deep.is_forbidden("src/secret1.ts"));
        assert!(deep.is_forbidden("src/a/b/secret2.ts"));
        assert!(!deep.is_forbidden("src/a/secret10.ts"));

        let shallow = ForbiddenPathCheck::new(&["src/*.pem".to_string()]).expect("glob");
        assert!(shallow.is_forbidden("src/key.pem"));
        assert!(!shallow.is_forbidden("src/nested/key.pem"));
    }

    #[test]
    fn test_invalid_glob_is_config_error() {
        let err = ForbiddenPathCheck::new(&["src/[".to_string()]).err().expect("error");
        assert!(matches!(err, GateError::Config(_)));
    }

    #[tokio::test]
    async fn test_forbidden_paths() {
        let check =
            ForbiddenPathCheck::new(&[".env*".to_string(), "*.pem".to_string()]).expect("check");
        let ws = MemoryWorkspace::new()
            .with_file("src/app.ts", "")
            .with_file(".env", "KEY=1")
            .with_file("certs/server.pem", "");
        let outcome = run(&check, &ws).await;
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(
            outcome.diagnostics,
            vec![
                "Forbidden file mutation: .env".to_string(),
                "Forbidden file mutation: certs/server.pem".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_identifiers() {
        let check = DuplicateIdentifierCheck::new().expect("check");
        let ws = MemoryWorkspace::new()
            .with_file(
                "src/App.tsx",
                "export function App() {}\nconst x = 1;\nexport default function App() {}\n  const x = 2;\n",
            )
            .with_file("tools/gen.py", "def main():\n    pass\n\ndef main():\n    pass\n")
            .with_file("README.md", "function App\nfunction App\n");
        let outcome = run(&check, &ws).await;
        assert_eq!(
            outcome.diagnostics,
            vec![
                "Duplicate identifier 'App' in src/App.tsx".to_string(),
                "Duplicate identifier 'main' in tools/gen.py".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_dangling_references() {
        let check = DanglingReferenceCheck::new().expect("check");
        let ws = MemoryWorkspace::new()
            .with_file(
                "src/main.ts",
                "import { App } from './App';\nimport './styles.css';\nimport { api } from '../lib/api';\nimport React from 'react';\nconst cfg = require('./config');\n",
            )
            .with_file("src/App.tsx", "export const App = 1;")
            .with_file("src/styles.css", "")
            .with_file("lib/api/index.ts", "export const api = {};");
        let outcome = run(&check, &ws).await;
        assert_eq!(
            outcome.diagnostics,
            vec!["Unresolved import './config' in src/main.ts".to_string()]
        );
    }

    #[tokio::test]
    async fn test_import_escaping_root_is_unresolved() {
        let check = DanglingReferenceCheck::new().expect("check");
        let ws = MemoryWorkspace::new().with_file("main.js", "import x from '../outside';");
        let outcome = run(&check, &ws).await;
        assert_eq!(outcome.exit_code, 1);
    }

    #[tokio::test]
    async fn test_command_check_needs_filesystem_root() {
        let check = CommandCheck::new("echo", vec!["echo".into()], Duration::from_secs(5));
        let pid = PipelineId::from("p");
        let ws = MemoryWorkspace::new();
        let view = WorkspaceView::new(&pid, 1, &ws);
        assert!(check.run(&view).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_check_exit_codes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = FsWorkspace::new(dir.path());

        let ok = CommandCheck::new(
            "echo",
            vec!["echo".into(), "hello".into()],
            Duration::from_secs(10),
        );
        let outcome = run(&ok, &ws).await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.trim(), "hello");

        let failing = CommandCheck::new(
            "fail",
            vec![
                "sh".into(),
                "-c".into(),
                "echo 'Compile error: missing semicolon' >&2; exit 2".into(),
            ],
            Duration::from_secs(10),
        );
        let outcome = run(&failing, &ws).await;
        assert_eq!(outcome.exit_code, 2);
        assert_eq!(
            outcome.diagnostics,
            vec!["Compile error: missing semicolon".to_string()]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_check_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = FsWorkspace::new(dir.path());
        let slow = CommandCheck::new(
            "slow",
            vec!["sleep".into(), "5".into()],
            Duration::from_millis(100),
        );
        let outcome = run(&slow, &ws).await;
        assert_eq!(outcome.exit_code, 124);
        assert!(outcome.diagnostics[0].starts_with("Command timed out"));
    }
}
