//! Read-only access to a pipeline's build workspace.
//!
//! Paths are relative, `/`-separated and may not climb out of the root.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Workspace capability handed to checks and the precondition validator.
pub trait Workspace: Send + Sync {
    /// Whether a file or directory exists at `path`.
    fn exists(&self, path: &str) -> bool;

    fn read_to_string(&self, path: &str) -> io::Result<String>;

    /// Every file, relative and sorted.
    fn list_files(&self) -> io::Result<Vec<String>>;

    /// Filesystem root, if the workspace lives on disk.
    fn root(&self) -> Option<&Path> {
        None
    }
}

fn invalid_path(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("path escapes workspace: {path}"),
    )
}

/// Collapse `.` and `..` segments; `None` if the path leaves the root.
pub fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

/// Workspace rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
}

impl FsWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let rel = Path::new(path);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(invalid_path(path));
        }
        Ok(self.root.join(rel))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.walk(&path, out)?;
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    let rel: Vec<String> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    out.push(rel.join("/"));
                }
            }
        }
        Ok(())
    }
}

impl Workspace for FsWorkspace {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn read_to_string(&self, path: &str) -> io::Result<String> {
        std::fs::read_to_string(self.resolve(path)?)
    }

    fn list_files(&self) -> io::Result<Vec<String>> {
        let mut files = Vec::new();
        if self.root.is_dir() {
            self.walk(&self.root, &mut files)?;
        }
        files.sort();
        Ok(files)
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

/// In-memory workspace for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkspace {
    files: BTreeMap<String, String>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.insert(path, content);
        self
    }

    pub fn insert(&mut self, path: &str, content: &str) {
        if let Some(path) = normalize(path) {
            self.files.insert(path, content.to_string());
        }
    }
}

impl Workspace for MemoryWorkspace {
    fn exists(&self, path: &str) -> bool {
        let Some(path) = normalize(path) else {
            return false;
        };
        if path.is_empty() {
            return true;
        }
        let dir = format!("{path}/");
        self.files.contains_key(&path) || self.files.keys().any(|k| k.starts_with(&dir))
    }

    fn read_to_string(&self, path: &str) -> io::Result<String> {
        let key = normalize(path).ok_or_else(|| invalid_path(path))?;
        self.files
            .get(&key)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such file: {path}")))
    }

    fn list_files(&self) -> io::Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("src/./a/../b.ts").as_deref(), Some("src/b.ts"));
        assert_eq!(normalize("../x"), None);
        assert_eq!(normalize("a/../../x"), None);
    }

    #[test]
    fn test_memory_workspace_dirs_exist() {
        let ws = MemoryWorkspace::new().with_file("src/app/main.ts", "x");
        assert!(ws.exists("src"));
        assert!(ws.exists("src/app"));
        assert!(ws.exists("src/app/main.ts"));
        assert!(!ws.exists("src/ap"));
        assert!(!ws.exists("../src"));
    }

    #[test]
    fn test_fs_workspace_lists_relative_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("src/ui")).expect("mkdir");
        std::fs::write(dir.path().join("src/ui/b.ts"), "b").expect("write");
        std::fs::write(dir.path().join("a.json"), "{}").expect("write");

        let ws = FsWorkspace::new(dir.path());
        assert_eq!(
            ws.list_files().expect("list"),
            vec!["a.json".to_string(), "src/ui/b.ts".to_string()]
        );
        assert!(ws.exists("src/ui"));
        assert_eq!(ws.read_to_string("src/ui/b.ts").expect("read"), "b");
        assert!(ws.read_to_string("../etc/passwd").is_err());
        assert!(!ws.exists("/etc"));
    }
}
