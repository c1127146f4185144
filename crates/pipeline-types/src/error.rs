//! The error taxonomy shared across every pipeline crate.
//!
//! Each variant corresponds to one of the failure classes the engine
//! distinguishes when deciding whether to retry, fail a stage, or abort the
//! whole run. Crates further up the stack (`pipeline-resolver`,
//! `pipeline-credentials`, `pipeline-registry`, `pipeline`) construct these
//! directly rather than wrapping them in `anyhow`, since callers need to
//! match on the variant to decide propagation policy; `anyhow::Error` is
//! reserved for truly unrecoverable host-level failures, which fold into
//! [`PipelineError::Internal`] at the boundary.

use thiserror::Error;

/// The full set of ways a pipeline run can fail.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A script failed to compile (syntax error, unknown step, policy
    /// violation caught at compile time).
    #[error("failed to compile script: {0}")]
    Compile(String),

    /// A `${...}` token could not be resolved after exhausting its
    /// lookup chain and it had no default value.
    #[error("failed to resolve secret or config token `{token}`: {reason}")]
    SecretResolution {
        /// The raw token text, e.g. `env:MISSING_VAR`.
        token: String,
        /// Why resolution failed.
        reason: String,
    },

    /// A specific lookup provider failed (e.g. a file provider couldn't
    /// read its path). Distinct from [`PipelineError::SecretResolution`]
    /// because a lookup failure on a non-last provider in the chain is
    /// often recoverable by falling through.
    #[error("lookup provider `{provider}` failed for key `{key}`: {reason}")]
    LookupFailure {
        /// Name of the provider that failed (`env`, `file`, `json`, ...).
        provider: String,
        /// The key passed to the provider.
        key: String,
        /// The underlying failure reason.
        reason: String,
    },

    /// A credential binding could not be resolved to a usable `SecretValue`
    /// (unknown id, no provider claims it, provider returned an error).
    #[error("failed to resolve credential `{id}`: {reason}")]
    CredentialResolution {
        /// The credential id that failed to resolve.
        id: String,
        /// Why resolution failed.
        reason: String,
    },

    /// A step attempted to run above the security ceiling of its context,
    /// or a workspace path escape was detected.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// A single step failed during execution.
    #[error("step `{step}` failed: {reason}")]
    StepFailure {
        /// Name of the step that failed.
        step: String,
        /// The failure reason.
        reason: String,
    },

    /// A stage failed, wrapping the step failure (or post-hook failure)
    /// that caused it.
    #[error("stage `{stage}` failed: {source}")]
    StageFailure {
        /// Name of the stage that failed.
        stage: String,
        /// The underlying cause.
        #[source]
        source: Box<PipelineError>,
    },

    /// The run was cancelled (explicit abort, timeout, or upstream
    /// cancellation propagated from a sibling parallel branch).
    #[error("cancelled: {0}")]
    Cancellation(String),

    /// An unexpected, non-domain failure (I/O error, poisoned lock, a bug).
    /// Carries the original error for diagnostics via `anyhow`'s chain.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether this error class should, by policy, trigger a retry of the
    /// step that produced it (transient process/lookup failures) rather
    /// than immediately failing the enclosing stage.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::LookupFailure { .. } | PipelineError::StepFailure { .. }
        )
    }

    /// Whether this error represents an operator-caused security boundary
    /// violation, which must never be retried or silently downgraded.
    pub fn is_security_violation(&self) -> bool {
        matches!(self, PipelineError::SecurityViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_failure_is_retryable() {
        let err = PipelineError::LookupFailure {
            provider: "file".into(),
            key: "secret.txt".into(),
            reason: "not found".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn security_violation_is_never_retryable() {
        let err = PipelineError::SecurityViolation("path escapes workspace".into());
        assert!(!err.is_retryable());
        assert!(err.is_security_violation());
    }

    #[test]
    fn stage_failure_displays_nested_cause() {
        let err = PipelineError::StageFailure {
            stage: "build".into(),
            source: Box::new(PipelineError::StepFailure {
                step: "sh".into(),
                reason: "exit code 1".into(),
            }),
        };
        let message = err.to_string();
        assert!(message.contains("build"));
        assert!(message.contains("sh"));
    }
}
