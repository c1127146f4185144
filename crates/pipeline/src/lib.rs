//! # pipeline
//!
//! The execution core of a CI/CD pipeline engine: compiles a declarative
//! pipeline script, runs its stages against a sandboxed workspace, and
//! resolves secrets and credentials along the way.
//!
//! ## Pipeline
//!
//! The core flow is **compile → evaluate → execute**:
//!
//! 1. [`script::ScriptEngine`] compiles pipeline script source into a
//!    [`script::PipelineDefinition`], consulting a fingerprinted
//!    compilation cache and never caching a failed compile.
//! 2. [`orchestrator::Orchestrator`] evaluates the compiled definition and
//!    drives it to completion via [`stage::StageExecutor`].
//! 3. [`stage::StageExecutor`] interprets each stage's step tree:
//!    dispatching leaf steps through the step registry, scoping `dir`
//!    blocks to subworkspaces, binding credentials for `withCredentials`,
//!    retrying `retry` blocks, and running `parallel` branches
//!    concurrently with cooperative cancellation.
//! 4. [`orchestrator::exit_code_for_result`] / [`orchestrator::exit_code_for_error`]
//!    map the outcome onto the process exit codes the engine promises.
//!
//! ## Key Types
//!
//! - [`context::ExecutionContext`] — the service locator bundling the step
//!   registry, security policy, credential store, secret resolver,
//!   redactor, logging core, and active workspace for a single run.
//! - [`workspace::Workspace`] — the confined filesystem root a run operates
//!   against, rejecting path escapes and symlink traversal.
//! - [`script::PipelineDefinition`] / [`script::StepNode`] — the compiled,
//!   executable form of a pipeline script.
//!
//! ## Modules
//!
//! - [`context`] — the per-run service locator
//! - [`workspace`] — the sandboxed filesystem root
//! - [`script`] — script compilation, caching, and the DSL engine seam
//! - [`stage`] — the stage/step executor and built-in steps
//! - [`orchestrator`] — top-level compile-and-run entry point
//! - [`timing`] — monotonic-enough wall clock helpers shared across the crate
//!
//! Secret interpolation ([`pipeline_resolver`]), execution policy
//! ([`pipeline_policy`]), credential binding ([`pipeline_credentials`]),
//! output redaction ([`pipeline_redact`]), the compilation cache
//! ([`pipeline_cache`]), retry strategies ([`pipeline_retry`]), process
//! execution ([`pipeline_process`]), step dispatch ([`pipeline_registry`]),
//! the logging core ([`pipeline_logging`]), and the shared domain types
//! ([`pipeline_types`]) each live in their own crate; `pipeline` is the
//! layer that wires them together into a runnable engine.

/// The per-run service locator: step registry, policy, credentials,
/// resolver, redactor, logging core, and workspace.
pub mod context;

/// The confined filesystem root a run operates against.
pub mod workspace;

/// Script compilation, the fingerprinted compilation cache, and the
/// pluggable DSL engine seam.
pub mod script;

/// The stage/step executor and the built-in leaf steps (`sh`, `echo`,
/// `readFile`, `writeFile`, `fileExists`, `error`).
pub mod stage;

/// Top-level compile-and-run entry point and exit code mapping.
pub mod orchestrator;

/// Wall-clock helpers shared across the crate.
pub mod timing;
