//! The execution context: a service locator bundling every shared
//! subsystem a running pipeline needs — the step registry, the execution
//! policy, the credential store, the secret resolver, the redactor, the
//! logging core, and the active [`Workspace`].
//!
//! One [`ExecutionContext`] is built per run and handed to every stage and
//! step dispatch. It never changes identity mid-run (the registry is
//! append-only before the first dispatch, the policy ceiling is fixed),
//! though the pieces it wraps — the cache, the credential store's active
//! scopes, the logger's drop counter — mutate under their own locks.

use std::sync::Arc;

use pipeline_credentials::CredentialStore;
use pipeline_logging::LoggingCore;
use pipeline_policy::ExecutionPolicy;
use pipeline_redact::Redactor;
use pipeline_registry::StepRegistry;
use pipeline_resolver::SecretResolver;
use pipeline_types::step::SecurityLevel;
use std::sync::Mutex;

use crate::workspace::Workspace;

/// Everything a step implementation or stage executor needs to do its job,
/// bundled so it can be passed as a single `&ExecutionContext` argument.
pub struct ExecutionContext {
    /// The append-only table of step implementations.
    pub registry: Arc<StepRegistry<ExecutionContext>>,
    /// The security ceiling this run enforces.
    pub policy: ExecutionPolicy,
    /// Resolves `${...}` tokens in step arguments.
    pub resolver: Arc<SecretResolver>,
    /// Resolves and materializes credential bindings.
    pub credentials: Arc<CredentialStore>,
    /// Accumulates secret literals to scrub from captured output. Shared
    /// (rather than owned outright) so a derived context — e.g. one scoped
    /// to a `dir` subworkspace — still redacts secrets registered by its
    /// parent, and vice versa.
    pub redactor: Arc<Mutex<Redactor>>,
    /// Push-based logging core shared by every step and stage.
    pub logging: Arc<LoggingCore>,
    /// The confined filesystem root for this run.
    pub workspace: Arc<Workspace>,
    /// Correlation id for this run, copied onto every published log event.
    pub run_id: String,
}

impl pipeline_registry::ExecutionContext for ExecutionContext {
    fn security_ceiling(&self) -> SecurityLevel {
        self.policy.ceiling()
    }
}

impl ExecutionContext {
    /// Expand `${...}` tokens in `text`, returning the resolved string.
    /// Resolution failures are logged as diagnostics, never raised — the
    /// resolver is a best-effort service per the engine's propagation
    /// policy.
    pub fn resolve(&self, text: &str) -> String {
        let outcome = self.resolver.resolve(text);
        for diagnostic in &outcome.diagnostics {
            self.logging.push(pipeline_types::LogEvent::new(
                pipeline_types::LogLevel::Warn,
                format!(
                    "unresolved token `{}`: {}",
                    diagnostic.token, diagnostic.reason
                ),
                crate::timing::now_ms(),
            ));
        }
        outcome.value
    }

    /// Scrub any registered secrets out of `text` before it's logged or
    /// captured as step output.
    pub fn redact(&self, text: &str) -> String {
        self.redactor.lock().unwrap().redact(text)
    }

    /// Derive a context identical to this one but rooted at a different
    /// workspace — used by the `dir` step to scope its body to a
    /// subdirectory without disturbing the enclosing stage's context.
    pub fn with_workspace(&self, workspace: Arc<Workspace>) -> ExecutionContext {
        ExecutionContext {
            registry: self.registry.clone(),
            policy: self.policy,
            resolver: self.resolver.clone(),
            credentials: self.credentials.clone(),
            redactor: self.redactor.clone(),
            logging: self.logging.clone(),
            workspace,
            run_id: self.run_id.clone(),
        }
    }
}
