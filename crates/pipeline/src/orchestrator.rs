//! Top-level entry point: compile a script, build a [`PipelineResult`] by
//! running it through the stage executor, and map the outcome onto the
//! process exit codes the orchestrator's public contract promises.

use std::sync::Arc;

use pipeline_types::error::PipelineError;
use pipeline_types::stage::{PipelineResult, PipelineStatus};

use crate::context::ExecutionContext;
use crate::script::{diagnostics_to_pipeline_error, CompilationConfig, EvalConfig, ScriptEngine};
use crate::stage::StageExecutor;

/// Every stage succeeded (or only degraded via a non-fatal post-hook).
pub const EXIT_SUCCESS: i32 = 0;
/// At least one stage failed.
pub const EXIT_FAILURE: i32 = 1;
/// The run was cancelled before completing.
pub const EXIT_ABORTED: i32 = 2;
/// The script failed to compile.
pub const EXIT_COMPILE_FAILURE: i32 = 3;
/// A step attempted to run above the execution policy's security ceiling.
pub const EXIT_SECURITY_VIOLATION: i32 = 4;

/// Loads a script, resolves it to a runnable [`crate::script::PipelineDefinition`],
/// and drives it to completion against a caller-supplied [`ExecutionContext`].
///
/// The context already carries the step registry (with built-ins
/// registered), the security policy, credentials, and workspace — the
/// orchestrator's only job is wiring compilation to execution and
/// translating the result into an exit code.
pub struct Orchestrator {
    engine: ScriptEngine,
}

impl Orchestrator {
    pub fn new(engine: ScriptEngine) -> Self {
        Self { engine }
    }

    /// An orchestrator backed by the default YAML dialect and cache
    /// settings.
    pub fn with_defaults() -> Self {
        Self::new(ScriptEngine::with_defaults())
    }

    /// Compile `source` and run it to completion under `context`.
    ///
    /// A compile failure is returned as a [`PipelineError::Compile`]
    /// without ever constructing a [`PipelineResult`] — there are no
    /// stages to report on. Once execution starts, failures are captured
    /// per-stage in the returned result rather than propagated as `Err`.
    pub async fn run(
        &self,
        source: &str,
        compile_config: &CompilationConfig,
        context: Arc<ExecutionContext>,
    ) -> Result<PipelineResult, PipelineError> {
        let outcome = self
            .engine
            .compile_and_execute(source, compile_config, &EvalConfig)
            .map_err(diagnostics_to_pipeline_error)?;

        let executor = StageExecutor::new(context);
        Ok(executor.run_pipeline(&outcome.definition).await)
    }
}

/// Map a top-level failure — one that prevented any stage from running —
/// to the process exit code the orchestrator promises.
pub fn exit_code_for_error(err: &PipelineError) -> i32 {
    match err {
        PipelineError::Compile(_) => EXIT_COMPILE_FAILURE,
        PipelineError::SecurityViolation(_) => EXIT_SECURITY_VIOLATION,
        _ => EXIT_FAILURE,
    }
}

/// Map a completed run's aggregate status to the process exit code the
/// orchestrator promises. `Unstable` exits `0`: every stage's body
/// succeeded, a post-hook merely degraded the report.
pub fn exit_code_for_result(result: &PipelineResult) -> i32 {
    match result.status {
        PipelineStatus::Success | PipelineStatus::Unstable => EXIT_SUCCESS,
        PipelineStatus::Failure => EXIT_FAILURE,
        PipelineStatus::Aborted => EXIT_ABORTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::register_builtin_steps;
    use crate::workspace::Workspace;
    use pipeline_credentials::CredentialStore;
    use pipeline_policy::ExecutionPolicy;
    use pipeline_redact::Redactor;
    use pipeline_registry::StepRegistry;
    use pipeline_resolver::SecretResolver;
    use std::sync::Mutex;

    fn context() -> Arc<ExecutionContext> {
        let mut registry = StepRegistry::new();
        register_builtin_steps(&mut registry).unwrap();
        Arc::new(ExecutionContext {
            registry: Arc::new(registry),
            policy: ExecutionPolicy::unrestricted(),
            resolver: Arc::new(SecretResolver::with_defaults()),
            credentials: Arc::new(CredentialStore::new()),
            redactor: Arc::new(Mutex::new(Redactor::new())),
            logging: Arc::new(pipeline_logging::LoggingCore::new()),
            workspace: Arc::new(Workspace::new(tempfile::tempdir().unwrap().keep())),
            run_id: "orchestrator-test".to_string(),
        })
    }

    const PIPELINE: &str = r#"
pipeline:
  stages:
    - name: build
      steps:
        kind: step
        name: echo
        arguments: "building"
"#;

    #[tokio::test]
    async fn successful_run_exits_zero() {
        let orchestrator = Orchestrator::with_defaults();
        let config = CompilationConfig { dialect: "yaml".into() };
        let result = orchestrator.run(PIPELINE, &config, context()).await.unwrap();
        assert_eq!(result.status, PipelineStatus::Success);
        assert_eq!(exit_code_for_result(&result), EXIT_SUCCESS);
    }

    #[tokio::test]
    async fn compile_failure_never_produces_a_result() {
        let orchestrator = Orchestrator::with_defaults();
        let config = CompilationConfig { dialect: "yaml".into() };
        let err = orchestrator.run("not: [valid", &config, context()).await.unwrap_err();
        assert_eq!(exit_code_for_error(&err), EXIT_COMPILE_FAILURE);
    }

    #[test]
    fn security_violation_maps_to_its_own_exit_code() {
        let err = PipelineError::SecurityViolation("nope".into());
        assert_eq!(exit_code_for_error(&err), EXIT_SECURITY_VIOLATION);
    }

    #[test]
    fn aborted_pipeline_maps_to_its_own_exit_code() {
        let result = PipelineResult {
            status: PipelineStatus::Aborted,
            stages: vec![],
            duration: std::time::Duration::ZERO,
        };
        assert_eq!(exit_code_for_result(&result), EXIT_ABORTED);
    }
}
