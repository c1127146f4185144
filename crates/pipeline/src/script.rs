//! The script engine wrapper: compiles pipeline script source into a
//! [`PipelineDefinition`] and evaluates it, consulting the compilation
//! cache on the way in and never caching a failed compile.
//!
//! A pipeline script is declarative — `pipeline { agent environment
//! stages { stage(name) { steps {} post {} } } }` — so "compilation" here
//! means parsing and validating that shape out of a textual format, not
//! generating bytecode. [`DslEngine`] is the pluggable seam: an embedder
//! can register one engine per file extension / dialect id, matching the
//! "multi-DSL dispatch" facade. [`YamlDslEngine`] is the one dialect this
//! crate ships.

use std::collections::HashMap;
use std::sync::Arc;

use pipeline_cache::ScriptCache;
use pipeline_types::error::PipelineError;
use pipeline_types::ScriptFingerprint;
use serde::{Deserialize, Serialize};

use crate::timing::now_ms;

/// A single step invocation or control-flow node in a compiled pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StepNode {
    /// Dispatch a leaf step (`sh`, `echo`, `readFile`, ...) through the
    /// step registry with the given JSON arguments.
    Step {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    /// Run a list of nodes in program order.
    Sequence(Vec<StepNode>),
    /// `dir(relativePath) { body }` — scope the body to a subdirectory of
    /// the active workspace.
    Dir { path: String, body: Box<StepNode> },
    /// `withCredentials(bindings) { body }`.
    WithCredentials {
        bindings: Vec<pipeline_types::credential::CredentialBinding>,
        body: Box<StepNode>,
    },
    /// `retry(times) { body }`.
    Retry { times: u32, body: Box<StepNode> },
    /// `parallel(name -> block, ...)`, in declaration order.
    Parallel { branches: Vec<(String, StepNode)> },
    /// `timeout(durationMs) { body }`.
    Timeout { duration_ms: u64, body: Box<StepNode> },
}

/// The `post { always {} success {} failure {} }` triple attached to a
/// stage, each optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostHooks {
    #[serde(default)]
    pub always: Option<StepNode>,
    #[serde(default)]
    pub on_success: Option<StepNode>,
    #[serde(default)]
    pub on_failure: Option<StepNode>,
}

/// One `stage(name) { steps {} post {} }` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub steps: StepNode,
    #[serde(default)]
    pub post: PostHooks,
}

/// A fully parsed `pipeline { ... }` block: the unit the script engine
/// compiles and the executor runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub stages: Vec<StageDefinition>,
}

/// Options controlling how a script is compiled — which built-in symbols
/// are implicitly in scope, essentially. Kept minimal: this engine has no
/// optional imports to toggle, but the struct is the explicit stand-in the
/// source's "implicit receiver defaults" re-architect to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompilationConfig {
    /// Dialect id / file extension this source should be compiled under.
    pub dialect: String,
}

impl CompilationConfig {
    /// A stable byte encoding used as the cache fingerprint's config half.
    fn cache_key(&self) -> Vec<u8> {
        self.dialect.as_bytes().to_vec()
    }
}

/// Options controlling a single evaluation of an already-compiled
/// definition. Currently empty; reserved for evaluation-time overrides
/// (e.g. a dry-run flag) that don't affect the compiled shape and so
/// shouldn't bust the cache key.
#[derive(Debug, Clone, Default)]
pub struct EvalConfig;

/// The result of evaluating a compiled definition against an execution
/// context: for this engine, evaluation is just handing the definition to
/// the stage executor, so the "outcome" is the definition itself, ready to
/// run. Kept as a distinct type so a future DSL engine with a real
/// evaluation step (e.g. producing a different executable form) has
/// somewhere to put it.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub definition: Arc<PipelineDefinition>,
}

/// Compile-time or evaluation-time diagnostics: one or more human-readable
/// problems, none of which should ever be silently swallowed.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub messages: Vec<String>,
}

impl Diagnostics {
    fn single(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.messages.join("; "))
    }
}

/// A pluggable backend that knows how to compile and evaluate scripts of
/// one dialect. The core ships [`YamlDslEngine`]; an embedder registers
/// others by file extension in a [`DslRegistry`].
pub trait DslEngine: Send + Sync {
    /// The dialect id this engine answers to (matched against
    /// [`CompilationConfig::dialect`] or a script's file extension).
    fn dialect(&self) -> &str;

    /// Parse and validate `source` into a [`PipelineDefinition`].
    fn compile(&self, source: &str) -> Result<PipelineDefinition, Diagnostics>;
}

/// Declarative YAML dialect: a `pipeline:` document mapping directly onto
/// [`PipelineDefinition`] (stage `steps`/`post` are YAML-encoded
/// [`StepNode`] trees). This is the one dialect shipped with the core;
/// nothing stops an embedder registering a second engine for a different
/// file extension.
#[derive(Debug, Default)]
pub struct YamlDslEngine;

#[derive(Debug, Deserialize)]
struct YamlDocument {
    pipeline: PipelineDefinition,
}

impl DslEngine for YamlDslEngine {
    fn dialect(&self) -> &str {
        "yaml"
    }

    fn compile(&self, source: &str) -> Result<PipelineDefinition, Diagnostics> {
        let document: YamlDocument = serde_yaml::from_str(source)
            .map_err(|e| Diagnostics::single(format!("failed to parse pipeline document: {e}")))?;
        if document.pipeline.stages.is_empty() {
            return Err(Diagnostics::single(
                "pipeline must declare at least one stage",
            ));
        }
        Ok(document.pipeline)
    }
}

/// Dialect-keyed lookup of registered [`DslEngine`]s.
#[derive(Default)]
pub struct DslRegistry {
    engines: HashMap<String, Arc<dyn DslEngine>>,
}

impl DslRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine registry with [`YamlDslEngine`] registered under `"yaml"`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(YamlDslEngine));
        registry
    }

    pub fn register(&mut self, engine: Arc<dyn DslEngine>) {
        self.engines.insert(engine.dialect().to_string(), engine);
    }

    pub fn get(&self, dialect: &str) -> Option<Arc<dyn DslEngine>> {
        self.engines.get(dialect).cloned()
    }
}

/// Compiles pipeline scripts via a [`DslRegistry`], caching successful
/// compiles by content fingerprint and never caching a failure.
pub struct ScriptEngine {
    engines: DslRegistry,
    cache: ScriptCache<Arc<PipelineDefinition>>,
}

impl ScriptEngine {
    pub fn new(engines: DslRegistry, cache: ScriptCache<Arc<PipelineDefinition>>) -> Self {
        Self { engines, cache }
    }

    /// An engine with the default YAML dialect and a cache bounded to 256
    /// entries and 16 MiB, with a 60-minute TTL (the spec's canonical
    /// default).
    pub fn with_defaults() -> Self {
        Self::new(
            DslRegistry::with_defaults(),
            ScriptCache::new(256, 16 * 1024 * 1024, 60 * 60 * 1000),
        )
    }

    /// Compile `source` under `config`, consulting the cache first.
    /// Successful compiles are stored; failures never are.
    pub fn compile(
        &self,
        source: &str,
        config: &CompilationConfig,
    ) -> Result<Arc<PipelineDefinition>, Diagnostics> {
        let fingerprint = ScriptFingerprint::compute(source.as_bytes(), &config.cache_key());
        if let Some(cached) = self.cache.get(&fingerprint, now_ms()) {
            return Ok(cached);
        }

        let engine = self.engines.get(&config.dialect).ok_or_else(|| {
            Diagnostics::single(format!("no script engine registered for dialect `{}`", config.dialect))
        })?;
        let definition = Arc::new(engine.compile(source)?);

        let size_estimate = source.len();
        self.cache
            .put(fingerprint, definition.clone(), size_estimate, None, now_ms());
        Ok(definition)
    }

    /// Evaluate an already-compiled definition. For this engine, evaluation
    /// is trivial — the executor runs the definition directly — but the
    /// method exists so `compileAndExecute` has a single seam regardless
    /// of how elaborate a future dialect's evaluation step becomes.
    pub fn evaluate(
        &self,
        artifact: Arc<PipelineDefinition>,
        _eval_config: &EvalConfig,
    ) -> Result<EvaluationOutcome, Diagnostics> {
        Ok(EvaluationOutcome { definition: artifact })
    }

    /// `compile` then `evaluate`, terminating early on compile failure.
    pub fn compile_and_execute(
        &self,
        source: &str,
        compile_config: &CompilationConfig,
        eval_config: &EvalConfig,
    ) -> Result<EvaluationOutcome, Diagnostics> {
        let artifact = self.compile(source, compile_config)?;
        self.evaluate(artifact, eval_config)
    }
}

/// Wrap a compile/evaluate [`Diagnostics`] failure as a
/// [`PipelineError::Compile`] for callers that need the engine's uniform
/// error type rather than raw diagnostics.
pub fn diagnostics_to_pipeline_error(diagnostics: Diagnostics) -> PipelineError {
    PipelineError::Compile(diagnostics.to_string())
}
