//! Execution policy: the security ceiling a run enforces on every step
//! dispatch, and the per-path filesystem policy a workspace enforces on
//! every filesystem step.
//!
//! A [`ExecutionPolicy`] is attached to a run before its first stage
//! starts and does not change mid-run. [`pipeline_registry`] (one layer
//! up) consults [`ExecutionPolicy::check`] before invoking a step's
//! implementation; this crate never touches the registry or the
//! filesystem itself, it only answers "is this allowed".

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use pipeline_types::error::PipelineError;
use pipeline_types::step::{SecurityLevel, StepDescriptor};
use serde::{Deserialize, Serialize};

/// The security ceiling a run enforces on step dispatch.
///
/// Every step carries a [`SecurityLevel`]; a step whose level exceeds the
/// policy's ceiling is refused before its implementation ever runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    ceiling: SecurityLevel,
}

impl ExecutionPolicy {
    /// Build a policy with the given ceiling.
    pub fn with_ceiling(ceiling: SecurityLevel) -> Self {
        Self { ceiling }
    }

    /// The most permissive policy: every security level is allowed.
    pub fn unrestricted() -> Self {
        Self::with_ceiling(SecurityLevel::Trusted)
    }

    /// The ceiling this policy enforces.
    pub fn ceiling(&self) -> SecurityLevel {
        self.ceiling
    }

    /// Check a step descriptor against the ceiling. Returns
    /// [`PipelineError::SecurityViolation`] rather than dispatching when the
    /// step's level exceeds it.
    pub fn check(&self, step: &StepDescriptor) -> Result<(), PipelineError> {
        if step.permitted_under(self.ceiling) {
            Ok(())
        } else {
            Err(PipelineError::SecurityViolation(format!(
                "step `{}` requires security level {:?}, policy ceiling is {:?}",
                step.name, step.required_level, self.ceiling
            )))
        }
    }
}

impl Default for ExecutionPolicy {
    /// The safest default: only unrestricted steps run unless a policy is
    /// explicitly configured otherwise.
    fn default() -> Self {
        Self::with_ceiling(SecurityLevel::Unrestricted)
    }
}

/// The filesystem operations a [`PathPolicy`] can forbid on a per-path basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsOperation {
    Read,
    Write,
    Delete,
    Execute,
}

/// A rule forbidding one or more operations under a path prefix, relative to
/// the workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRule {
    /// Path prefix the rule applies to, relative to the workspace root.
    pub prefix: PathBuf,
    /// Operations forbidden under this prefix.
    pub forbidden: Vec<FsOperation>,
}

/// Per-path filesystem policy for a workspace. Default permits all
/// operations within the workspace root; explicit rules narrow that down.
/// Symbolic links resolving outside the root are always rejected regardless
/// of rules (enforced by the workspace, not here — this type only answers
/// the prefix/operation question).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathPolicy {
    rules: Vec<PathRule>,
}

impl PathPolicy {
    /// A policy with no rules: every operation is permitted anywhere under
    /// the workspace root.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Add a rule forbidding `operations` under `prefix`.
    pub fn forbid(mut self, prefix: impl Into<PathBuf>, operations: &[FsOperation]) -> Self {
        self.rules.push(PathRule {
            prefix: prefix.into(),
            forbidden: operations.to_vec(),
        });
        self
    }

    /// Check whether `operation` is permitted on `relative_path` (already
    /// resolved relative to the workspace root, with `..` components
    /// rejected by the caller).
    pub fn check(&self, relative_path: &Path, operation: FsOperation) -> Result<(), PipelineError> {
        for rule in &self.rules {
            if relative_path.starts_with(&rule.prefix) && rule.forbidden.contains(&operation) {
                return Err(PipelineError::SecurityViolation(format!(
                    "{:?} is forbidden under `{}`",
                    operation,
                    rule.prefix.display()
                )));
            }
        }
        Ok(())
    }

    /// Reject a path that escapes the workspace root via `..` components or
    /// is absolute. Callers resolve symlinks separately before trusting a
    /// path is confined.
    pub fn confine(relative_path: &Path) -> Result<(), PipelineError> {
        if relative_path.is_absolute() {
            return Err(PipelineError::SecurityViolation(format!(
                "absolute path `{}` is not confined to the workspace root",
                relative_path.display()
            )));
        }
        for component in relative_path.components() {
            if matches!(component, Component::ParentDir) {
                return Err(PipelineError::SecurityViolation(format!(
                    "path `{}` escapes the workspace root",
                    relative_path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Named execution policies a pipeline config can select between (e.g. a
/// looser policy for a sandboxed PR build, a stricter one for a deploy run).
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    named: HashMap<String, ExecutionPolicy>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, policy: ExecutionPolicy) {
        self.named.insert(name.into(), policy);
    }

    pub fn get(&self, name: &str) -> Option<ExecutionPolicy> {
        self.named.get(name).copied()
    }
}
