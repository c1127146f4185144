use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use pipeline::context::ExecutionContext;
use pipeline::orchestrator::{self, Orchestrator};
use pipeline::script::{CompilationConfig, DslRegistry, ScriptEngine};
use pipeline::stage::register_builtin_steps;
use pipeline::workspace::Workspace;
use pipeline_credentials::{CredentialStore, StaticCredentialProvider};
use pipeline_logging::{LogConsumer, LoggingCore};
use pipeline_policy::ExecutionPolicy;
use pipeline_redact::Redactor;
use pipeline_registry::StepRegistry;
use pipeline_resolver::SecretResolver;
use pipeline_types::log::{LogEvent, LogLevel};
use pipeline_types::secret::SecretValue;
use pipeline_types::step::SecurityLevel;

mod progress;

#[derive(Parser, Debug)]
#[command(name = "pipeline-cli", version)]
#[command(about = "Compile and run declarative CI/CD pipeline scripts")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile and execute a pipeline script.
    Run(RunArgs),
    /// Compile a pipeline script without executing it.
    Validate(ValidateArgs),
    /// Print environment diagnostics.
    Doctor,
}

#[derive(clap::Args, Debug)]
struct CompileArgs {
    /// Path to the pipeline script file.
    file: PathBuf,

    /// Dialect to compile under.
    #[arg(long, default_value = "yaml")]
    dialect: String,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    compile: CompileArgs,

    /// Confined filesystem root steps operate against (default: current directory).
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Security ceiling the run enforces.
    #[arg(long, value_enum, default_value = "trusted")]
    ceiling: Ceiling,

    /// Environment variables made available to `${env:...}` tokens, repeatable (KEY=VALUE).
    #[arg(long = "env", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Plaintext credentials made resolvable by id, repeatable (ID=VALUE).
    #[arg(long = "credential", value_parser = parse_key_value)]
    credentials: Vec<(String, String)>,

    /// Directory for the on-disk compilation cache tier (default: memory-only).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Minimum severity printed to stderr.
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevelArg,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    #[command(flatten)]
    compile: CompileArgs,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum Ceiling {
    Unrestricted,
    Restricted,
    Trusted,
}

impl From<Ceiling> for SecurityLevel {
    fn from(c: Ceiling) -> Self {
        match c {
            Ceiling::Unrestricted => SecurityLevel::Unrestricted,
            Ceiling::Restricted => SecurityLevel::Restricted,
            Ceiling::Trusted => SecurityLevel::Trusted,
        }
    }
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for LogLevel {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => LogLevel::Trace,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Error => LogLevel::Error,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

/// Forwards batches of log events to stderr, filtering below `threshold`.
struct StderrLogConsumer {
    threshold: LogLevel,
}

impl LogConsumer for StderrLogConsumer {
    fn consume(&self, batch: &[LogEvent]) {
        for event in batch {
            if event.level.0 < self.threshold {
                continue;
            }
            let stage = event.stage.as_deref().unwrap_or("-");
            eprintln!("[{:?}] ({stage}) {}", event.level.0, event.message);
        }
    }

    fn name(&self) -> &str {
        "stderr"
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Commands::Run(args) => run(args),
        Commands::Validate(args) => validate(args),
        Commands::Doctor => doctor(),
    }
}

fn validate(args: ValidateArgs) -> Result<()> {
    let source = std::fs::read_to_string(&args.compile.file)
        .with_context(|| format!("reading {}", args.compile.file.display()))?;
    let engine = ScriptEngine::with_defaults();
    let config = CompilationConfig {
        dialect: args.compile.dialect.clone(),
    };
    match engine.compile(&source, &config) {
        Ok(definition) => {
            println!("ok: {} stage(s)", definition.stages.len());
            Ok(())
        }
        Err(diagnostics) => bail!("{diagnostics}"),
    }
}

fn doctor() -> Result<()> {
    println!("cwd: {}", std::env::current_dir()?.display());
    println!("sh available: {}", pipeline_process::command_exists("sh"));
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    for (key, value) in &args.env {
        unsafe { std::env::set_var(key, value) };
    }

    let source = std::fs::read_to_string(&args.compile.file)
        .with_context(|| format!("reading {}", args.compile.file.display()))?;

    let mut registry = StepRegistry::new();
    register_builtin_steps(&mut registry)?;

    let mut credential_provider = StaticCredentialProvider::new();
    for (id, value) in &args.credentials {
        credential_provider.insert(
            id.clone(),
            SecretValue::PlainText {
                value: value.clone(),
            },
        );
    }
    let mut credential_store = CredentialStore::new();
    credential_store.register_provider(credential_provider);

    let workspace_root = match args.workspace.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    std::fs::create_dir_all(&workspace_root)
        .with_context(|| format!("creating workspace at {}", workspace_root.display()))?;

    let threshold: LogLevel = args.log_level.into();
    let logging = LoggingCore::builder()
        .consumer(Arc::new(StderrLogConsumer { threshold }))
        .build();

    let context = Arc::new(ExecutionContext {
        registry: Arc::new(registry),
        policy: ExecutionPolicy::with_ceiling(args.ceiling.into()),
        resolver: Arc::new(SecretResolver::with_defaults()),
        credentials: Arc::new(credential_store),
        redactor: Arc::new(Mutex::new(Redactor::new())),
        logging: Arc::new(logging),
        workspace: Arc::new(Workspace::new(workspace_root)),
        run_id: format!("run-{}", pipeline::timing::now_ms()),
    });

    let mut cache = pipeline_cache::ScriptCache::new(256, 16 * 1024 * 1024, 60 * 60 * 1000);
    if let Some(dir) = args.cache_dir.clone() {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating cache dir at {}", dir.display()))?;
        cache = cache.with_disk_dir(dir);
    }
    let orchestrator = Orchestrator::new(ScriptEngine::new(DslRegistry::with_defaults(), cache));
    let compile_config = CompilationConfig {
        dialect: args.compile.dialect.clone(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let outcome = runtime.block_on(orchestrator.run(&source, &compile_config, context.clone()));
    context.logging.flush();

    match outcome {
        Ok(result) => {
            for stage in &result.stages {
                println!("{}: {:?} ({:?})", stage.name, stage.status, stage.duration);
                if let Some(message) = &stage.error_message {
                    println!("  {message}");
                }
            }
            println!("overall: {:?}", result.status);
            std::process::exit(orchestrator::exit_code_for_result(&result));
        }
        Err(err) => {
            eprintln!("compile failed: {err}");
            std::process::exit(orchestrator::exit_code_for_error(&err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_value_splits_on_first_equals() {
        assert_eq!(
            parse_key_value("FOO=bar=baz").unwrap(),
            ("FOO".to_string(), "bar=baz".to_string())
        );
    }

    #[test]
    fn parse_key_value_rejects_missing_equals() {
        assert!(parse_key_value("nope").is_err());
    }

    #[test]
    fn ceiling_maps_to_security_level() {
        assert_eq!(SecurityLevel::from(Ceiling::Trusted), SecurityLevel::Trusted);
        assert_eq!(
            SecurityLevel::from(Ceiling::Unrestricted),
            SecurityLevel::Unrestricted
        );
    }
}
