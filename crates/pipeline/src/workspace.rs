//! The confined filesystem root a run operates against.
//!
//! Every path a step touches is resolved relative to the workspace root and
//! checked against [`pipeline_policy::PathPolicy`] before the operation
//! runs. Paths that normalize outside the root — `..` escapes, or
//! symlinks resolving outside it — are rejected as
//! [`PipelineError::SecurityViolation`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use pipeline_policy::{FsOperation, PathPolicy};
use pipeline_types::error::PipelineError;

/// A file reference resolved and confined to a workspace root.
#[derive(Debug, Clone)]
pub struct FileRef {
    /// Absolute path on disk.
    pub absolute: PathBuf,
    /// Path relative to the workspace root, as given by the caller.
    pub relative: PathBuf,
}

/// A confined filesystem root. Cloning a `Workspace` is cheap and shares
/// the same root and policy — concurrent steps operate on the same
/// instance, serialized at the OS filesystem layer.
pub struct Workspace {
    root: PathBuf,
    policy: PathPolicy,
}

impl Workspace {
    /// A workspace rooted at `root` with the default permissive path
    /// policy.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            policy: PathPolicy::permissive(),
        }
    }

    /// A workspace rooted at `root` enforcing `policy`.
    pub fn with_policy(root: PathBuf, policy: PathPolicy) -> Self {
        Self { root, policy }
    }

    /// The workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path policy this workspace enforces.
    pub fn policy(&self) -> PathPolicy {
        self.policy.clone()
    }

    /// Build (creating it if absent) a workspace rooted at the
    /// subdirectory `rel`, inheriting this workspace's path policy.
    pub fn scoped(&self, rel: impl AsRef<Path>) -> Result<Workspace, PipelineError> {
        let rel = rel.as_ref();
        self.mkdir(rel, true)?;
        let absolute = self.check(rel, FsOperation::Read)?;
        Ok(Workspace::with_policy(absolute, self.policy.clone()))
    }

    /// Resolve `rel` against the root, rejecting escapes and symlinks that
    /// point outside the root, without checking operation policy.
    fn resolve(&self, rel: &Path) -> Result<PathBuf, PipelineError> {
        PathPolicy::confine(rel)?;
        let absolute = self.root.join(rel);

        // A symlink target is only knowable once something exists at the
        // path; for a not-yet-created path we confine on the parent chain
        // instead.
        if let Ok(canonical) = fs::canonicalize(&absolute) {
            let canonical_root = fs::canonicalize(&self.root)
                .map_err(|e| PipelineError::Internal(anyhow::anyhow!(e)))?;
            if !canonical.starts_with(&canonical_root) {
                return Err(PipelineError::SecurityViolation(format!(
                    "`{}` resolves outside the workspace root",
                    rel.display()
                )));
            }
        }

        Ok(absolute)
    }

    fn check(&self, rel: &Path, operation: FsOperation) -> Result<PathBuf, PipelineError> {
        let absolute = self.resolve(rel)?;
        self.policy.check(rel, operation)?;
        Ok(absolute)
    }

    /// Resolve `rel` to a [`FileRef`] without touching the filesystem.
    pub fn file(&self, rel: impl AsRef<Path>) -> Result<FileRef, PipelineError> {
        let rel = rel.as_ref();
        let absolute = self.resolve(rel)?;
        Ok(FileRef {
            absolute,
            relative: rel.to_path_buf(),
        })
    }

    /// Whether `rel` exists under the workspace.
    pub fn exists(&self, rel: impl AsRef<Path>) -> Result<bool, PipelineError> {
        let absolute = self.check(rel.as_ref(), FsOperation::Read)?;
        Ok(absolute.exists())
    }

    /// Read `rel` as UTF-8 text.
    pub fn read_to_string(&self, rel: impl AsRef<Path>) -> Result<String, PipelineError> {
        let absolute = self.check(rel.as_ref(), FsOperation::Read)?;
        fs::read_to_string(&absolute)
            .with_context(|| format!("failed to read `{}`", absolute.display()))
            .map_err(|e| PipelineError::Internal(e))
    }

    /// Write `text` to `rel`, creating parent directories as needed.
    pub fn write(&self, rel: impl AsRef<Path>, text: &str) -> Result<(), PipelineError> {
        let rel = rel.as_ref();
        let absolute = self.check(rel, FsOperation::Write)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create `{}`", parent.display()))
                .map_err(PipelineError::Internal)?;
        }
        fs::write(&absolute, text)
            .with_context(|| format!("failed to write `{}`", absolute.display()))
            .map_err(PipelineError::Internal)
    }

    /// Create a directory under the workspace.
    pub fn mkdir(&self, rel: impl AsRef<Path>, recursive: bool) -> Result<(), PipelineError> {
        let absolute = self.check(rel.as_ref(), FsOperation::Write)?;
        let result = if recursive {
            fs::create_dir_all(&absolute)
        } else {
            fs::create_dir(&absolute)
        };
        result
            .with_context(|| format!("failed to create directory `{}`", absolute.display()))
            .map_err(PipelineError::Internal)
    }

    /// List entries directly under `rel` (or, recursively, every file
    /// beneath it).
    pub fn list(&self, rel: impl AsRef<Path>, recursive: bool) -> Result<Vec<PathBuf>, PipelineError> {
        let rel = rel.as_ref();
        let absolute = self.check(rel, FsOperation::Read)?;
        let mut out = Vec::new();
        self.list_into(&absolute, rel, recursive, &mut out)?;
        Ok(out)
    }

    fn list_into(
        &self,
        absolute_dir: &Path,
        rel_dir: &Path,
        recursive: bool,
        out: &mut Vec<PathBuf>,
    ) -> Result<(), PipelineError> {
        let entries = fs::read_dir(absolute_dir)
            .with_context(|| format!("failed to list `{}`", absolute_dir.display()))
            .map_err(PipelineError::Internal)?;
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to list `{}`", absolute_dir.display()))
                .map_err(PipelineError::Internal)?;
            let rel_path = rel_dir.join(entry.file_name());
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && recursive {
                self.list_into(&entry.path(), &rel_path, recursive, out)?;
            } else {
                out.push(rel_path);
            }
        }
        Ok(())
    }

    /// Find files under the workspace root whose relative path matches a
    /// shell-style glob (`*` for any run of non-separator characters, `**`
    /// for any run of path segments).
    pub fn find_files(&self, pattern: &str) -> Result<Vec<PathBuf>, PipelineError> {
        let all = self.list(".", true)?;
        Ok(all
            .into_iter()
            .filter(|p| glob_match(pattern, &p.to_string_lossy()))
            .collect())
    }

    /// Remove a path (file or directory tree) under the workspace.
    pub fn remove(&self, rel: impl AsRef<Path>) -> Result<(), PipelineError> {
        let absolute = self.check(rel.as_ref(), FsOperation::Delete)?;
        if !absolute.exists() {
            return Ok(());
        }
        let result = if absolute.is_dir() {
            fs::remove_dir_all(&absolute)
        } else {
            fs::remove_file(&absolute)
        };
        result
            .with_context(|| format!("failed to remove `{}`", absolute.display()))
            .map_err(PipelineError::Internal)
    }

    /// Remove everything under the workspace root, leaving the root itself
    /// in place.
    pub fn clean(&self) -> Result<(), PipelineError> {
        for entry in self.list(".", false)? {
            self.remove(&entry)?;
        }
        Ok(())
    }

    /// Run `body` against a workspace scoped to `rel` (a subdirectory of
    /// this workspace, created if absent).
    pub fn with_subdir<T>(
        &self,
        rel: impl AsRef<Path>,
        body: impl FnOnce(&Workspace) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let sub = self.scoped(rel)?;
        body(&sub)
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    fn match_here(pat: &[char], txt: &[char]) -> bool {
        match pat.first() {
            None => txt.is_empty(),
            Some('*') if pat.get(1) == Some(&'*') => {
                // `**` matches any number of path segments, including none.
                let rest = &pat[2..];
                let rest = if rest.first() == Some(&'/') { &rest[1..] } else { rest };
                (0..=txt.len()).any(|i| match_here(rest, &txt[i..]))
            }
            Some('*') => {
                let rest = &pat[1..];
                for i in 0..=txt.len() {
                    if txt[..i].contains(&'/') {
                        break;
                    }
                    if match_here(rest, &txt[i..]) {
                        return true;
                    }
                }
                false
            }
            Some(&c) => !txt.is_empty() && txt[0] == c && match_here(&pat[1..], &txt[1..]),
        }
    }

    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    match_here(&pat, &txt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf());
        (dir, ws)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, ws) = workspace();
        ws.write("nested/file.txt", "hello").unwrap();
        assert_eq!(ws.read_to_string("nested/file.txt").unwrap(), "hello");
    }

    #[test]
    fn exists_reports_presence() {
        let (_dir, ws) = workspace();
        assert!(!ws.exists("missing.txt").unwrap());
        ws.write("present.txt", "x").unwrap();
        assert!(ws.exists("present.txt").unwrap());
    }

    #[test]
    fn parent_dir_escape_is_rejected() {
        let (_dir, ws) = workspace();
        let err = ws.write("../escape.txt", "x").unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn absolute_path_is_rejected() {
        let (_dir, ws) = workspace();
        let err = ws.read_to_string("/etc/passwd").unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn forbidden_operation_under_policy_prefix_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PathPolicy::permissive().forbid("locked", &[FsOperation::Write]);
        let ws = Workspace::with_policy(dir.path().to_path_buf(), policy);
        ws.mkdir("locked", true).unwrap();
        let err = ws.write("locked/file.txt", "x").unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn list_recursive_finds_nested_files() {
        let (_dir, ws) = workspace();
        ws.write("a.txt", "1").unwrap();
        ws.write("sub/b.txt", "2").unwrap();
        let mut files: Vec<_> = ws
            .list(".", true)
            .unwrap()
            .into_iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        files.sort();
        assert_eq!(files, vec!["a.txt", "sub/b.txt"]);
    }

    #[test]
    fn find_files_matches_glob() {
        let (_dir, ws) = workspace();
        ws.write("src/lib.rs", "").unwrap();
        ws.write("src/main.rs", "").unwrap();
        ws.write("README.md", "").unwrap();
        let mut matches: Vec<_> = ws
            .find_files("**/*.rs")
            .unwrap()
            .into_iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        matches.sort();
        assert_eq!(matches, vec!["src/lib.rs", "src/main.rs"]);
    }

    #[test]
    fn clean_removes_everything_but_keeps_root() {
        let (dir, ws) = workspace();
        ws.write("a.txt", "1").unwrap();
        ws.write("sub/b.txt", "2").unwrap();
        ws.clean().unwrap();
        assert!(ws.list(".", true).unwrap().is_empty());
        assert!(dir.path().exists());
    }

    #[test]
    fn with_subdir_scopes_operations() {
        let (_dir, ws) = workspace();
        ws.with_subdir("child", |sub| sub.write("f.txt", "v")).unwrap();
        assert_eq!(ws.read_to_string("child/f.txt").unwrap(), "v");
    }
}
