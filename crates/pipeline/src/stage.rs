//! Built-in steps and the stage/step executor.
//!
//! [`register_builtin_steps`] wires the leaf steps (`sh`, `echo`,
//! `readFile`, `writeFile`, `fileExists`, `error`, `notify`) into a
//! [`pipeline_registry::StepRegistry`]. The control-flow constructs
//! (`dir`, `withCredentials`, `retry`, `parallel`, `timeout`, and plain
//! sequencing) aren't registry dispatches — they recurse into nested
//! [`StepNode`]s, which a JSON-args-in/JSON-result-out registry slot can't
//! express — so [`StageExecutor`] interprets them directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pipeline_credentials::with_credentials;
use pipeline_registry::StepRegistry;
use pipeline_retry::{RetryExecutor, RetryPolicy};
use pipeline_types::error::PipelineError;
use pipeline_types::stage::{PipelineResult, StageResult, StageStatus};
use pipeline_types::step::{SecurityLevel, StepCategory, StepDescriptor};
use serde_json::{json, Value};

use crate::context::ExecutionContext;
use crate::script::{PipelineDefinition, StageDefinition, StepNode};
use crate::timing::now_ms;

/// Register every built-in leaf step against `registry`. Control-flow
/// nodes are interpreted by [`StageExecutor`] and never reach the registry.
pub fn register_builtin_steps(registry: &mut StepRegistry<ExecutionContext>) -> Result<(), PipelineError> {
    registry.register(
        StepDescriptor::new("sh", StepCategory::Process, SecurityLevel::Trusted),
        |arguments, ctx| {
            let command = arguments
                .get("command")
                .and_then(Value::as_str)
                .ok_or_else(|| PipelineError::StepFailure {
                    step: "sh".into(),
                    reason: "missing required `command` argument".into(),
                })?;
            let return_stdout = arguments
                .get("returnStdout")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let return_status = arguments
                .get("returnStatus")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let resolved = ctx.resolve(command);
            let result = pipeline_process::run_command_in_dir(
                "sh",
                &["-c", &resolved],
                ctx.workspace.root(),
            )
            .map_err(|e| PipelineError::StepFailure {
                step: "sh".into(),
                reason: e.to_string(),
            })?;

            if !result.success && !return_status {
                return Err(PipelineError::StepFailure {
                    step: "sh".into(),
                    reason: format!(
                        "exit code {:?}: {}",
                        result.exit_code,
                        ctx.redact(&result.stderr)
                    ),
                });
            }

            if return_stdout {
                Ok(json!(ctx.redact(result.stdout.trim_end())))
            } else if return_status {
                Ok(json!(result.exit_code.unwrap_or(-1)))
            } else {
                Ok(Value::Null)
            }
        },
    )?;

    registry.register(
        StepDescriptor::new("echo", StepCategory::Logging, SecurityLevel::Unrestricted),
        |arguments, ctx| {
            let message = arguments
                .as_str()
                .or_else(|| arguments.get("message").and_then(Value::as_str))
                .unwrap_or_default();
            let resolved = ctx.resolve(message);
            ctx.logging.push(pipeline_types::LogEvent::new(
                pipeline_types::LogLevel::Info,
                ctx.redact(&resolved),
                now_ms(),
            ));
            Ok(Value::Null)
        },
    )?;

    registry.register(
        StepDescriptor::new("readFile", StepCategory::FileSystem, SecurityLevel::Restricted),
        |arguments, ctx| {
            let path = arguments
                .as_str()
                .or_else(|| arguments.get("path").and_then(Value::as_str))
                .ok_or_else(|| PipelineError::StepFailure {
                    step: "readFile".into(),
                    reason: "missing required `path` argument".into(),
                })?;
            let contents = ctx
                .workspace
                .read_to_string(path)
                .map_err(|e| PipelineError::StepFailure {
                    step: "readFile".into(),
                    reason: e.to_string(),
                })?;
            Ok(json!(contents))
        },
    )?;

    registry.register(
        StepDescriptor::new("writeFile", StepCategory::FileSystem, SecurityLevel::Restricted),
        |arguments, ctx| {
            let path = arguments.get("path").and_then(Value::as_str).ok_or_else(|| {
                PipelineError::StepFailure {
                    step: "writeFile".into(),
                    reason: "missing required `path` argument".into(),
                }
            })?;
            let text = arguments.get("text").and_then(Value::as_str).ok_or_else(|| {
                PipelineError::StepFailure {
                    step: "writeFile".into(),
                    reason: "missing required `text` argument".into(),
                }
            })?;
            let resolved = ctx.resolve(text);
            ctx.workspace
                .write(path, &resolved)
                .map_err(|e| PipelineError::StepFailure {
                    step: "writeFile".into(),
                    reason: e.to_string(),
                })?;
            Ok(Value::Null)
        },
    )?;

    registry.register(
        StepDescriptor::new("fileExists", StepCategory::FileSystem, SecurityLevel::Restricted),
        |arguments, ctx| {
            let path = arguments
                .as_str()
                .or_else(|| arguments.get("path").and_then(Value::as_str))
                .ok_or_else(|| PipelineError::StepFailure {
                    step: "fileExists".into(),
                    reason: "missing required `path` argument".into(),
                })?;
            let exists = ctx
                .workspace
                .exists(path)
                .map_err(|e| PipelineError::StepFailure {
                    step: "fileExists".into(),
                    reason: e.to_string(),
                })?;
            Ok(json!(exists))
        },
    )?;

    registry.register(
        StepDescriptor::new("error", StepCategory::Other, SecurityLevel::Unrestricted),
        |arguments, _ctx| {
            let message = arguments
                .as_str()
                .or_else(|| arguments.get("message").and_then(Value::as_str))
                .unwrap_or("step failed");
            Err(PipelineError::StepFailure {
                step: "error".into(),
                reason: message.to_string(),
            })
        },
    )?;

    registry.register(
        StepDescriptor::new("notify", StepCategory::Other, SecurityLevel::Restricted),
        |arguments, ctx| {
            let url = arguments
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| PipelineError::StepFailure {
                    step: "notify".into(),
                    reason: "missing required `url` argument".into(),
                })?;
            let kind = match arguments.get("type").and_then(Value::as_str) {
                Some("slack") => pipeline_webhook::WebhookType::Slack,
                Some("discord") => pipeline_webhook::WebhookType::Discord,
                _ => pipeline_webhook::WebhookType::Generic,
            };
            let message = arguments
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("pipeline notification");
            let resolved_url = ctx.resolve(url);
            let resolved_message = ctx.resolve(message);
            let config = pipeline_webhook::WebhookConfig {
                url: resolved_url,
                webhook_type: kind,
                ..Default::default()
            };
            let payload = pipeline_webhook::WebhookPayload {
                message: ctx.redact(&resolved_message),
                ..Default::default()
            };
            pipeline_webhook::send_webhook(&config, &payload).map_err(|e| {
                PipelineError::StepFailure {
                    step: "notify".into(),
                    reason: e.to_string(),
                }
            })?;
            Ok(Value::Null)
        },
    )?;

    Ok(())
}

/// Cooperative cancellation signal shared by a `parallel` block's branches:
/// set once by the first branch to fail, polled by siblings between their
/// own suspension points.
#[derive(Clone, Default)]
struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs stages in sequence and interprets a stage's step tree.
pub struct StageExecutor {
    context: Arc<ExecutionContext>,
}

impl StageExecutor {
    pub fn new(context: Arc<ExecutionContext>) -> Self {
        Self { context }
    }

    /// Run every stage of `definition` in sequence, stopping at the first
    /// `Failure`/`Aborted` stage (fail-fast; non-critical stages are a
    /// reserved future feature, so every stage is critical today).
    pub async fn run_pipeline(&self, definition: &PipelineDefinition) -> PipelineResult {
        let start = Instant::now();
        let mut results = Vec::with_capacity(definition.stages.len());

        for stage in &definition.stages {
            let result = self.run_stage(stage).await;
            let terminate = matches!(result.status, StageStatus::Failure | StageStatus::Aborted);
            results.push(result);
            if terminate {
                break;
            }
        }

        PipelineResult::from_stages(results, start.elapsed())
    }

    /// Run a single stage: body, then post-hooks, producing a
    /// [`StageResult`] per the lifecycle in the executor's contract.
    pub async fn run_stage(&self, stage: &StageDefinition) -> StageResult {
        let start = Instant::now();
        let token = CancellationToken::new();

        let body_outcome = self.run_node(&stage.steps, &token).await;

        let (mut status, mut error_message) = match &body_outcome {
            Ok(_) => (StageStatus::Success, None),
            Err(PipelineError::Cancellation(msg)) => (StageStatus::Aborted, Some(msg.clone())),
            Err(err) => (StageStatus::Failure, Some(err.to_string())),
        };

        let post_hook = match status {
            StageStatus::Success => &stage.post.on_success,
            _ => &stage.post.on_failure,
        };
        if let Some(node) = post_hook {
            if let Err(err) = self.run_node(node, &token).await {
                status = demote_on_post_hook_failure(status);
                error_message = Some(match error_message {
                    Some(existing) => format!("{existing}; post-hook failed: {err}"),
                    None => format!("post-hook failed: {err}"),
                });
            }
        }
        if let Some(node) = &stage.post.always {
            if let Err(err) = self.run_node(node, &token).await {
                status = demote_on_post_hook_failure(status);
                error_message = Some(match error_message {
                    Some(existing) => format!("{existing}; always-hook failed: {err}"),
                    None => format!("always-hook failed: {err}"),
                });
            }
        }

        StageResult {
            name: stage.name.clone(),
            status,
            duration: start.elapsed(),
            error_message,
        }
    }

    /// Interpret `node`, yielding the JSON value it evaluates to: a leaf
    /// `Step`'s dispatch result, the last child's value for a `Sequence`,
    /// the body's value for the control-flow wrappers, or (for `Parallel`)
    /// a name-keyed object whose key order matches declaration order.
    fn run_node<'a>(
        &'a self,
        node: &'a StepNode,
        token: &'a CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, PipelineError>> + Send + 'a>>
    {
        Box::pin(async move {
            if token.is_cancelled() {
                return Err(PipelineError::Cancellation(
                    "sibling parallel branch failed".into(),
                ));
            }

            match node {
                StepNode::Step { name, arguments } => {
                    // Leaf steps (`sh`, `readFile`, `writeFile`, ...) run
                    // blocking I/O synchronously; keep it off the async
                    // worker thread.
                    tokio::task::block_in_place(|| {
                        self.context.registry.dispatch(name, arguments, &self.context)
                    })
                }
                StepNode::Sequence(nodes) => {
                    let mut last = Value::Null;
                    for child in nodes {
                        last = self.run_node(child, token).await?;
                    }
                    Ok(last)
                }
                StepNode::Dir { path, body } => {
                    let sub_workspace = Arc::new(self.context.workspace.scoped(path)?);
                    let scoped_context = Arc::new(self.context.with_workspace(sub_workspace));
                    let executor = StageExecutor::new(scoped_context);
                    executor.run_node(body, token).await
                }
                StepNode::WithCredentials { bindings, body } => {
                    let token = token.clone();
                    with_credentials(&self.context.credentials, bindings, None, move |scope_vars| {
                        for secret_value in scope_vars.values() {
                            self.context
                                .redactor
                                .lock()
                                .unwrap()
                                .register_literal(secret_value.clone());
                        }
                        futures_block_on(self.run_node(body, &token))
                    })
                }
                StepNode::Retry { times, body } => {
                    let mut config = RetryPolicy::Default.to_config();
                    config.max_attempts = (*times).max(1);
                    let executor = RetryExecutor::new(config);
                    let token = token.clone();
                    // `RetryExecutor::run` sleeps between attempts with
                    // `std::thread::sleep`; run the whole thing off the
                    // async worker thread rather than just the inner call.
                    tokio::task::block_in_place(|| {
                        executor.run(|_attempt| futures_block_on(self.run_node(body, &token)))
                    })
                }
                StepNode::Parallel { branches } => self.run_parallel(branches, token).await,
                StepNode::Timeout { duration_ms, body } => {
                    let duration = Duration::from_millis(*duration_ms);
                    match tokio::time::timeout(duration, self.run_node(body, token)).await {
                        Ok(result) => result,
                        Err(_) => Err(PipelineError::Cancellation(format!(
                            "block did not complete within {duration_ms}ms"
                        ))),
                    }
                }
            }
        })
    }

    /// Run `branches` concurrently and return a JSON object keyed by branch
    /// name, iterated in declaration order regardless of completion order.
    async fn run_parallel(
        &self,
        branches: &[(String, StepNode)],
        token: &CancellationToken,
    ) -> Result<Value, PipelineError> {
        let mut handles = Vec::with_capacity(branches.len());
        for (name, node) in branches {
            let context = self.context.clone();
            let node = node.clone();
            let branch_token = token.clone();
            handles.push((
                name.clone(),
                tokio::spawn(async move {
                    let executor = StageExecutor::new(context);
                    executor.run_node(&node, &branch_token).await
                }),
            ));
        }

        let mut ordered_results: Vec<(String, Result<Value, PipelineError>)> = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(PipelineError::Internal(anyhow::anyhow!(join_err))),
            };
            if outcome.is_err() {
                token.cancel();
            }
            ordered_results.push((name, outcome));
        }

        if ordered_results.iter().any(|(_, result)| result.is_err()) {
            let (_, err) = ordered_results
                .into_iter()
                .find(|(_, result)| result.is_err())
                .expect("just checked a failing branch exists");
            return Err(err.expect_err("filtered to the failing branch"));
        }

        let mut map = serde_json::Map::with_capacity(ordered_results.len());
        for (name, result) in ordered_results {
            map.insert(name, result.expect("checked for errors above"));
        }
        Ok(Value::Object(map))
    }
}

fn demote_on_post_hook_failure(status: StageStatus) -> StageStatus {
    match status {
        StageStatus::Success => StageStatus::Unstable,
        other => other,
    }
}

/// Bridge a future back to synchronous code inside a step closure (the
/// registry's `StepImpl` is a plain sync `Fn`, and credential/retry
/// control flow needs to call back into the async node interpreter from
/// there). Safe to call from within a multi-threaded Tokio runtime's
/// worker thread since the blocked task is this one, not the reactor.
fn futures_block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::task::block_in_place(|| {
        tokio::runtime::Handle::current().block_on(future)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Workspace;
    use pipeline_credentials::CredentialStore;
    use pipeline_policy::ExecutionPolicy;
    use pipeline_redact::Redactor;
    use pipeline_resolver::SecretResolver;
    use std::sync::Mutex;

    fn test_context() -> Arc<ExecutionContext> {
        test_context_with_ceiling(SecurityLevel::Trusted)
    }

    fn test_context_with_ceiling(ceiling: SecurityLevel) -> Arc<ExecutionContext> {
        let mut registry = StepRegistry::new();
        register_builtin_steps(&mut registry).unwrap();
        Arc::new(ExecutionContext {
            registry: Arc::new(registry),
            policy: ExecutionPolicy::with_ceiling(ceiling),
            resolver: Arc::new(SecretResolver::with_defaults()),
            credentials: Arc::new(CredentialStore::new()),
            redactor: Arc::new(Mutex::new(Redactor::new())),
            logging: Arc::new(pipeline_logging::LoggingCore::new()),
            workspace: Arc::new(Workspace::new(tempfile::tempdir().unwrap().keep())),
            run_id: "test-run".to_string(),
        })
    }

    fn step(name: &str, arguments: Value) -> StepNode {
        StepNode::Step { name: name.into(), arguments }
    }

    #[tokio::test]
    async fn sequential_stage_runs_every_step_and_succeeds() {
        let ctx = test_context();
        let executor = StageExecutor::new(ctx);
        let stage = StageDefinition {
            name: "build".into(),
            steps: StepNode::Sequence(vec![
                step("echo", json!("one")),
                step("echo", json!("two")),
            ]),
            post: Default::default(),
        };
        let result = executor.run_stage(&stage).await;
        assert_eq!(result.status, StageStatus::Success);
    }

    #[tokio::test]
    async fn failing_step_fails_the_stage_with_its_message() {
        let ctx = test_context();
        let executor = StageExecutor::new(ctx);
        let stage = StageDefinition {
            name: "build".into(),
            steps: step("error", json!("boom")),
            post: Default::default(),
        };
        let result = executor.run_stage(&stage).await;
        assert_eq!(result.status, StageStatus::Failure);
        assert!(result.error_message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn on_failure_then_always_both_run_and_status_stays_failure() {
        let ctx = test_context();
        let executor = StageExecutor::new(ctx);
        let stage = StageDefinition {
            name: "build".into(),
            steps: step("error", json!("boom")),
            post: crate::script::PostHooks {
                always: Some(step("echo", json!("cleanup"))),
                on_success: Some(step("error", json!("should not run"))),
                on_failure: Some(step("echo", json!("handling failure"))),
            },
        };
        let result = executor.run_stage(&stage).await;
        assert_eq!(result.status, StageStatus::Failure);
    }

    #[tokio::test]
    async fn post_hook_failure_demotes_success_to_unstable() {
        let ctx = test_context();
        let executor = StageExecutor::new(ctx);
        let stage = StageDefinition {
            name: "build".into(),
            steps: step("echo", json!("ok")),
            post: crate::script::PostHooks {
                always: Some(step("error", json!("cleanup failed"))),
                on_success: None,
                on_failure: None,
            },
        };
        let result = executor.run_stage(&stage).await;
        assert_eq!(result.status, StageStatus::Unstable);
    }

    #[tokio::test]
    async fn security_ceiling_blocks_sh_under_restricted_policy() {
        let ctx = test_context_with_ceiling(SecurityLevel::Restricted);
        let executor = StageExecutor::new(ctx);
        let stage = StageDefinition {
            name: "build".into(),
            steps: step("sh", json!({"command": "true"})),
            post: Default::default(),
        };
        let result = executor.run_stage(&stage).await;
        assert_eq!(result.status, StageStatus::Failure);
        assert!(result.error_message.unwrap().contains("security"));
    }

    fn sh_returning(command: &str) -> StepNode {
        step(
            "sh",
            json!({"command": command, "returnStdout": true}),
        )
    }

    #[tokio::test]
    async fn parallel_returns_a_map_in_declaration_order_regardless_of_completion_order() {
        // Seed scenario S6: branch "a" finishes last, "b" first, "c" second,
        // but the returned map's keys and values still follow declaration
        // order (a, b, c).
        let ctx = test_context();
        let executor = StageExecutor::new(ctx.clone());
        let token = CancellationToken::new();
        let node = StepNode::Parallel {
            branches: vec![
                ("a".into(), sh_returning("sleep 0.06 && printf A")),
                ("b".into(), sh_returning("printf B")),
                ("c".into(), sh_returning("sleep 0.02 && printf C")),
            ],
        };
        let result = executor.run_node(&node, &token).await.unwrap();
        let map = result.as_object().expect("parallel result is a JSON object");
        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        let values: Vec<&Value> = map.values().collect();
        assert_eq!(values, vec![&json!("A"), &json!("B"), &json!("C")]);
    }

    #[tokio::test]
    async fn a_failing_branch_fails_the_whole_parallel_block() {
        let ctx = test_context();
        let executor = StageExecutor::new(ctx.clone());
        let token = CancellationToken::new();
        let node = StepNode::Parallel {
            branches: vec![
                ("a".into(), step("echo", json!("A"))),
                ("b".into(), step("error", json!("boom"))),
            ],
        };
        let result = executor.run_node(&node, &token).await;
        assert!(matches!(result, Err(PipelineError::StepFailure { .. })));
    }

    #[tokio::test]
    async fn timeout_cancels_a_block_that_overruns() {
        let ctx = test_context();
        let executor = StageExecutor::new(ctx);
        let token = CancellationToken::new();
        let node = StepNode::Timeout {
            duration_ms: 1,
            body: Box::new(step(
                "sh",
                json!({"command": "sleep 1"}),
            )),
        };
        let result = executor.run_node(&node, &token).await;
        assert!(matches!(result, Err(PipelineError::Cancellation(_))));
    }
}
