//! Virtual filesystem over the sandbox root.
//!
//! The same directory is pre-opened for the module, so files written here are
//! what the VM sees under `/src`. Paths are relative to the sandbox root and
//! may not be absolute or climb out with `..`.

use crate::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Default directory for [`Vfs::list_tree`].
pub const CORE_DIR: &str = "core";

/// Entry type of a [`CoreFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// A directory; carries no content.
    Tree,
    /// A file with text content.
    Blob,
}

/// One entry of the sandbox, addressed by its sandbox-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreFile {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub content: String,
}

impl CoreFile {
    pub fn tree(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::Tree,
            content: String::new(),
        }
    }

    pub fn blob(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::Blob,
            content: content.into(),
        }
    }

    pub fn is_tree(&self) -> bool {
        self.kind == FileKind::Tree
    }
}

/// Filesystem facade rooted at a host directory.
#[derive(Debug, Clone)]
pub struct Vfs {
    root: PathBuf,
}

impl Vfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Host directory backing the sandbox.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a sandbox-relative path onto the host.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(RuntimeError::InvalidPath(path.to_string()));
                }
            }
        }
        Ok(resolved)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.exists())
    }

    /// Flattened pre-order listing of `dir` and everything below it.
    ///
    /// Sibling order is whatever the host directory yields.
    pub fn list_tree(&self, dir: &str) -> Result<Vec<CoreFile>> {
        let mut files = Vec::new();
        self.walk(dir, &mut files)?;
        Ok(files)
    }

    fn walk(&self, dir: &str, files: &mut Vec<CoreFile>) -> Result<()> {
        let host = self.resolve(dir)?;
        let entries = std::fs::read_dir(&host).map_err(|e| not_found(e, dir))?;

        files.push(CoreFile::tree(dir));
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = join(dir, &name);

            if entry.file_type()?.is_dir() {
                self.walk(&path, files)?;
            } else {
                let content = std::fs::read_to_string(entry.path())?;
                files.push(CoreFile::blob(path, content));
            }
        }
        Ok(())
    }

    /// Immediate entry names of `dir`.
    pub fn list(&self, dir: &str) -> Result<Vec<String>> {
        let host = self.resolve(dir)?;
        let entries = std::fs::read_dir(&host).map_err(|e| not_found(e, dir))?;
        entries
            .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
            .collect()
    }

    /// Create `path` unless a directory is already there.
    ///
    /// The parent must exist. A file at `path` is an error.
    pub fn make_dir(&self, path: &str) -> Result<()> {
        let host = self.resolve(path)?;
        if host.is_dir() {
            debug!(path, "Directory already exists");
            return Ok(());
        }
        if host.exists() {
            return Err(RuntimeError::AlreadyExists(path.to_string()));
        }

        std::fs::create_dir(&host).map_err(|e| not_found(e, path))?;
        info!(path, "Created directory");
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> Result<CoreFile> {
        let host = self.resolve(path)?;
        if host.is_dir() {
            return Err(RuntimeError::AlreadyExists(format!("{} is a directory", path)));
        }
        let content = std::fs::read_to_string(&host).map_err(|e| not_found(e, path))?;
        Ok(CoreFile::blob(path, content))
    }

    /// Create or truncate `path` and write `content`.
    ///
    /// Fails with [`RuntimeError::AlreadyExists`] when a directory occupies
    /// `path`.
    pub fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let host = self.resolve(path)?;
        if host.is_dir() {
            return Err(RuntimeError::AlreadyExists(format!("{} is a directory", path)));
        }

        std::fs::write(&host, content).map_err(|e| not_found(e, path))?;
        info!(path, len = content.len(), "Wrote file");
        Ok(())
    }

    pub fn remove_file(&self, path: &str) -> Result<()> {
        let host = self.resolve(path)?;
        if host.is_dir() {
            return Err(RuntimeError::AlreadyExists(format!("{} is a directory", path)));
        }

        std::fs::remove_file(&host).map_err(|e| not_found(e, path))?;
        info!(path, "Removed file");
        Ok(())
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

fn not_found(e: std::io::Error, path: &str) -> RuntimeError {
    if e.kind() == ErrorKind::NotFound {
        RuntimeError::NotFound(path.to_string())
    } else {
        RuntimeError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sandbox() -> (tempfile::TempDir, Vfs) {
        let dir = tempfile::tempdir().unwrap();
        let vfs = Vfs::new(dir.path());
        (dir, vfs)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, vfs) = sandbox();
        vfs.write_file("main.nat", "let z = [1 3 4];\n").unwrap();

        let file = vfs.read_file("main.nat").unwrap();
        assert_eq!(file, CoreFile::blob("main.nat", "let z = [1 3 4];\n"));
    }

    #[test]
    fn test_write_truncates() {
        let (_dir, vfs) = sandbox();
        vfs.write_file("a", "a much longer first version").unwrap();
        vfs.write_file("a", "short").unwrap();
        assert_eq!(vfs.read_file("a").unwrap().content, "short");
    }

    #[test]
    fn test_missing_files() {
        let (_dir, vfs) = sandbox();
        assert!(vfs.read_file("nope").unwrap_err().is_not_found());
        assert!(vfs.remove_file("nope").unwrap_err().is_not_found());
        assert!(vfs.list("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_file() {
        let (_dir, vfs) = sandbox();
        vfs.write_file("gone", "x").unwrap();
        vfs.remove_file("gone").unwrap();
        assert!(!vfs.exists("gone").unwrap());
    }

    #[test]
    fn test_make_dir_is_idempotent() {
        let (_dir, vfs) = sandbox();
        vfs.make_dir("core").unwrap();
        vfs.make_dir("core").unwrap();
        assert_eq!(vfs.list(".").unwrap(), vec!["core"]);
    }

    #[test]
    fn test_make_dir_requires_parent() {
        let (_dir, vfs) = sandbox();
        assert!(vfs.make_dir("a/b").unwrap_err().is_not_found());
    }

    #[test]
    fn test_file_directory_conflicts() {
        let (_dir, vfs) = sandbox();
        vfs.make_dir("doc").unwrap();
        vfs.write_file("note", "x").unwrap();

        assert!(matches!(vfs.write_file("doc", "x"), Err(RuntimeError::AlreadyExists(_))));
        assert!(matches!(vfs.make_dir("note"), Err(RuntimeError::AlreadyExists(_))));
        assert!(matches!(vfs.remove_file("doc"), Err(RuntimeError::AlreadyExists(_))));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let (_dir, vfs) = sandbox();
        assert!(matches!(vfs.read_file("../etc/passwd"), Err(RuntimeError::InvalidPath(_))));
        assert!(matches!(vfs.write_file("/abs", "x"), Err(RuntimeError::InvalidPath(_))));
        assert!(vfs.resolve("./a/./b").unwrap().ends_with("a/b"));
    }

    #[test]
    fn test_list_is_shallow() {
        let (_dir, vfs) = sandbox();
        vfs.make_dir("core").unwrap();
        vfs.make_dir("core/lib").unwrap();
        vfs.write_file("core/index", "").unwrap();
        vfs.write_file("core/lib/seq", "").unwrap();

        let names: HashSet<String> = vfs.list("core").unwrap().into_iter().collect();
        assert_eq!(names, ["index", "lib"].iter().map(|s| s.to_string()).collect());
    }

    #[test]
    fn test_list_tree_preorder() {
        let (_dir, vfs) = sandbox();
        vfs.make_dir("core").unwrap();
        vfs.make_dir("core/lib").unwrap();
        vfs.make_dir("core/lib/empty").unwrap();
        vfs.write_file("core/index", "root").unwrap();
        vfs.write_file("core/lib/seq", "seq").unwrap();
        vfs.write_file("core/lib/map", "map").unwrap();

        let files = vfs.list_tree(CORE_DIR).unwrap();

        assert_eq!(files[0], CoreFile::tree("core"));
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        let unique: HashSet<&str> = paths.iter().copied().collect();
        assert_eq!(paths.len(), unique.len());
        assert_eq!(
            unique,
            [
                "core",
                "core/index",
                "core/lib",
                "core/lib/empty",
                "core/lib/seq",
                "core/lib/map"
            ]
            .into_iter()
            .collect()
        );

        // every entry appears after the directory containing it
        for (i, file) in files.iter().enumerate() {
            if let Some((parent, _)) = file.path.rsplit_once('/') {
                let parent_pos = paths.iter().position(|p| *p == parent).unwrap();
                assert!(parent_pos < i);
                assert!(files[parent_pos].is_tree());
            }
        }

        let seq = files.iter().find(|f| f.path == "core/lib/seq").unwrap();
        assert_eq!(seq.content, "seq");
        assert!(files.iter().filter(|f| f.is_tree()).all(|f| f.content.is_empty()));
    }

    #[test]
    fn test_list_tree_missing_dir() {
        let (_dir, vfs) = sandbox();
        assert!(vfs.list_tree(CORE_DIR).unwrap_err().is_not_found());
    }
}
