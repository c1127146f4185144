//! Step registration: what a step is called, what category it falls into,
//! and the security ceiling it requires to run.

use serde::{Deserialize, Serialize};

/// Ordered trust tiers a step can demand of its execution context.
///
/// Ordering matters: a script running under a `Restricted` ceiling may call
/// `Unrestricted` steps but never `Trusted` ones. Derive order follows
/// declaration order, so `Unrestricted < Restricted < Trusted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// No special trust required — pure computation, string manipulation.
    Unrestricted,
    /// Filesystem or process access confined to the workspace.
    Restricted,
    /// Full host access: credential materialization, arbitrary shell.
    Trusted,
}

/// Broad functional grouping of a step, used for dispatch and for
/// interceptor chains that only care about one kind of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    /// Runs an external process (shell, script interpreter).
    Process,
    /// Reads or writes the workspace filesystem.
    FileSystem,
    /// Resolves or binds credentials.
    Credentials,
    /// Emits a log line or notification.
    Logging,
    /// Structural control flow: `parallel`, `retry`, `timeout`, `stage`.
    ControlFlow,
    /// Anything that doesn't fit the above (custom/plugin steps).
    Other,
}

/// A registered step: its name, the trust tier it demands, and its category.
///
/// This is metadata only — the registry holds the actual dispatch closure
/// separately, keyed by `name`, so this type can be freely cloned and shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// The step's invocation name, e.g. `"sh"` or `"withCredentials"`.
    pub name: String,
    /// Functional grouping used for coarse dispatch and auditing.
    pub category: StepCategory,
    /// Minimum security ceiling the calling context must satisfy.
    pub required_level: SecurityLevel,
}

impl StepDescriptor {
    /// Build a descriptor for a built-in step.
    pub fn new(
        name: impl Into<String>,
        category: StepCategory,
        required_level: SecurityLevel,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            required_level,
        }
    }

    /// Whether a context whose ceiling is `context_level` is permitted to
    /// invoke this step.
    pub fn permitted_under(&self, context_level: SecurityLevel) -> bool {
        context_level >= self.required_level
    }
}
