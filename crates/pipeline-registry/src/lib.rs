//! Step registry and dispatch for the pipeline engine.
//!
//! A [`StepRegistry`] holds an append-only table of [`StepDescriptor`]s
//! paired with their implementations, plus an ordered chain of
//! [`Interceptor`]s wrapping every dispatch. Dispatch enforces the calling
//! context's security ceiling before the implementation — real or mocked —
//! ever runs.
//!
//! # Example
//!
//! ```
//! use pipeline_registry::{ExecutionContext, StepRegistry};
//! use pipeline_types::step::{SecurityLevel, StepCategory, StepDescriptor};
//! use serde_json::json;
//!
//! struct Ctx { ceiling: SecurityLevel }
//! impl ExecutionContext for Ctx {
//!     fn security_ceiling(&self) -> SecurityLevel { self.ceiling }
//! }
//!
//! let mut registry = StepRegistry::<Ctx>::new();
//! registry
//!     .register(
//!         StepDescriptor::new("echo", StepCategory::Logging, SecurityLevel::Unrestricted),
//!         |args, _ctx| Ok(args.clone()),
//!     )
//!     .unwrap();
//!
//! let ctx = Ctx { ceiling: SecurityLevel::Unrestricted };
//! let out = registry.dispatch("echo", &json!("hi"), &ctx).unwrap();
//! assert_eq!(out, json!("hi"));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pipeline_types::error::PipelineError;
use pipeline_types::step::{SecurityLevel, StepDescriptor};

/// Whatever the call site dispatching a step needs to expose: at minimum,
/// the security ceiling in force for the duration of the call.
pub trait ExecutionContext {
    /// The maximum [`SecurityLevel`] steps may run at under this context.
    fn security_ceiling(&self) -> SecurityLevel;
}

/// A step's implementation: arguments in, a JSON result or a
/// [`PipelineError`] out.
pub type StepImpl<Ctx> =
    Arc<dyn Fn(&serde_json::Value, &Ctx) -> Result<serde_json::Value, PipelineError> + Send + Sync>;

/// One link in the interceptor chain wrapping every step dispatch.
/// Interceptors compose: the first registered is outermost, the real
/// implementation is innermost. A mock interceptor installed by a test
/// harness can inspect `descriptor`/`arguments` and return a canned result
/// without ever calling `next`.
pub trait Interceptor<Ctx>: Send + Sync {
    /// Handle (or pass through to `next`) a single dispatch.
    fn intercept(
        &self,
        descriptor: &StepDescriptor,
        arguments: &serde_json::Value,
        context: &Ctx,
        next: &(dyn Fn(&serde_json::Value, &Ctx) -> Result<serde_json::Value, PipelineError>
              + Send
              + Sync),
    ) -> Result<serde_json::Value, PipelineError>;
}

struct RegisteredStep<Ctx> {
    descriptor: StepDescriptor,
    implementation: StepImpl<Ctx>,
}

/// Append-only table of registered steps plus the interceptor chain wrapping
/// every dispatch through it.
pub struct StepRegistry<Ctx> {
    steps: HashMap<String, RegisteredStep<Ctx>>,
    interceptors: Vec<Arc<dyn Interceptor<Ctx>>>,
}

impl<Ctx: 'static + ExecutionContext> StepRegistry<Ctx> {
    /// A registry with no steps and no interceptors.
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
            interceptors: Vec::new(),
        }
    }

    /// Register a step. Fails if a step under this name is already
    /// registered — the registry never allows silently replacing a step
    /// mid-run.
    pub fn register<F>(&mut self, descriptor: StepDescriptor, implementation: F) -> Result<(), PipelineError>
    where
        F: Fn(&serde_json::Value, &Ctx) -> Result<serde_json::Value, PipelineError> + Send + Sync + 'static,
    {
        if self.steps.contains_key(&descriptor.name) {
            return Err(PipelineError::Compile(format!(
                "step `{}` is already registered",
                descriptor.name
            )));
        }
        self.steps.insert(
            descriptor.name.clone(),
            RegisteredStep {
                descriptor,
                implementation: Arc::new(implementation),
            },
        );
        Ok(())
    }

    /// Append an interceptor to the end of the chain (it becomes the
    /// innermost of the interceptors registered so far, still outside the
    /// real implementation).
    pub fn add_interceptor(&mut self, interceptor: Arc<dyn Interceptor<Ctx>>) {
        self.interceptors.push(interceptor);
    }

    /// Look up a step's descriptor without dispatching it.
    pub fn descriptor(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.get(name).map(|s| &s.descriptor)
    }

    /// Dispatch `name` with `arguments` under `context`. Enforces the
    /// context's security ceiling before the interceptor chain — and
    /// therefore before any real implementation — runs.
    pub fn dispatch(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        context: &Ctx,
    ) -> Result<serde_json::Value, PipelineError> {
        let step = self.steps.get(name).ok_or_else(|| PipelineError::StepFailure {
            step: name.to_string(),
            reason: "no such step registered".to_string(),
        })?;

        if !step.descriptor.permitted_under(context.security_ceiling()) {
            return Err(PipelineError::SecurityViolation(format!(
                "step `{}` requires security level {:?}, context ceiling is {:?}",
                step.descriptor.name,
                step.descriptor.required_level,
                context.security_ceiling()
            )));
        }

        let chain = self.build_chain(step.descriptor.clone(), step.implementation.clone());
        chain(arguments, context)
    }

    fn build_chain(&self, descriptor: StepDescriptor, base: StepImpl<Ctx>) -> StepImpl<Ctx> {
        let mut next = base;
        for interceptor in self.interceptors.iter().rev() {
            let interceptor = Arc::clone(interceptor);
            let descriptor = descriptor.clone();
            let inner = next.clone();
            next = Arc::new(move |args: &serde_json::Value, ctx: &Ctx| {
                interceptor.intercept(&descriptor, args, ctx, &*inner)
            });
        }
        next
    }
}

impl<Ctx: 'static + ExecutionContext> Default for StepRegistry<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

/// A test-harness interceptor that records every call it sees and, for
/// step names with a canned result installed, returns that result without
/// reaching the real implementation.
pub struct MockInterceptor {
    canned: Mutex<HashMap<String, Result<serde_json::Value, String>>>,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MockInterceptor {
    pub fn new() -> Self {
        Self {
            canned: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Install a canned success result for `step_name`, short-circuiting
    /// its real implementation.
    pub fn when(&self, step_name: impl Into<String>, result: serde_json::Value) {
        self.canned
            .lock()
            .unwrap()
            .insert(step_name.into(), Ok(result));
    }

    /// Install a canned failure for `step_name`.
    pub fn when_fails(&self, step_name: impl Into<String>, reason: impl Into<String>) {
        self.canned
            .lock()
            .unwrap()
            .insert(step_name.into(), Err(reason.into()));
    }

    /// Every `(step name, arguments)` pair dispatched through this
    /// interceptor, in call order, whether mocked or passed through.
    pub fn recorded_calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> Interceptor<Ctx> for MockInterceptor {
    fn intercept(
        &self,
        descriptor: &StepDescriptor,
        arguments: &serde_json::Value,
        context: &Ctx,
        next: &(dyn Fn(&serde_json::Value, &Ctx) -> Result<serde_json::Value, PipelineError>
              + Send
              + Sync),
    ) -> Result<serde_json::Value, PipelineError> {
        self.calls
            .lock()
            .unwrap()
            .push((descriptor.name.clone(), arguments.clone()));

        if let Some(canned) = self.canned.lock().unwrap().get(&descriptor.name) {
            return match canned {
                Ok(value) => Ok(value.clone()),
                Err(reason) => Err(PipelineError::StepFailure {
                    step: descriptor.name.clone(),
                    reason: reason.clone(),
                }),
            };
        }

        next(arguments, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::step::StepCategory;
    use serde_json::json;

    struct TestContext {
        ceiling: SecurityLevel,
    }

    impl ExecutionContext for TestContext {
        fn security_ceiling(&self) -> SecurityLevel {
            self.ceiling
        }
    }

    fn registry_with_echo() -> StepRegistry<TestContext> {
        let mut registry = StepRegistry::new();
        registry
            .register(
                StepDescriptor::new("echo", StepCategory::Logging, SecurityLevel::Unrestricted),
                |args, _ctx| Ok(args.clone()),
            )
            .unwrap();
        registry
    }

    #[test]
    fn dispatch_invokes_the_registered_implementation() {
        let registry = registry_with_echo();
        let ctx = TestContext {
            ceiling: SecurityLevel::Unrestricted,
        };
        let out = registry.dispatch("echo", &json!("hi"), &ctx).unwrap();
        assert_eq!(out, json!("hi"));
    }

    #[test]
    fn dispatching_unknown_step_is_a_step_failure() {
        let registry = registry_with_echo();
        let ctx = TestContext {
            ceiling: SecurityLevel::Trusted,
        };
        let err = registry.dispatch("nope", &json!(null), &ctx).unwrap_err();
        assert!(matches!(err, PipelineError::StepFailure { .. }));
    }

    #[test]
    fn re_registering_a_step_name_fails() {
        let mut registry = registry_with_echo();
        let err = registry
            .register(
                StepDescriptor::new("echo", StepCategory::Logging, SecurityLevel::Unrestricted),
                |args, _ctx| Ok(args.clone()),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Compile(_)));
    }

    #[test]
    fn dispatch_above_ceiling_is_a_security_violation_and_does_not_invoke_impl() {
        let mut registry = StepRegistry::new();
        let invoked = Arc::new(Mutex::new(false));
        let invoked_clone = invoked.clone();
        registry
            .register(
                StepDescriptor::new("sh", StepCategory::Process, SecurityLevel::Trusted),
                move |_args, _ctx| {
                    *invoked_clone.lock().unwrap() = true;
                    Ok(json!(null))
                },
            )
            .unwrap();

        let ctx = TestContext {
            ceiling: SecurityLevel::Restricted,
        };
        let err = registry.dispatch("sh", &json!(null), &ctx).unwrap_err();
        assert!(err.is_security_violation());
        assert!(!*invoked.lock().unwrap());
    }

    #[test]
    fn mock_interceptor_short_circuits_the_real_implementation() {
        let mut registry = StepRegistry::new();
        let invoked = Arc::new(Mutex::new(false));
        let invoked_clone = invoked.clone();
        registry
            .register(
                StepDescriptor::new("sh", StepCategory::Process, SecurityLevel::Trusted),
                move |_args, _ctx| {
                    *invoked_clone.lock().unwrap() = true;
                    Ok(json!("real output"))
                },
            )
            .unwrap();

        let mock = Arc::new(MockInterceptor::new());
        mock.when("sh", json!("mocked output"));
        registry.add_interceptor(mock.clone());

        let ctx = TestContext {
            ceiling: SecurityLevel::Trusted,
        };
        let out = registry.dispatch("sh", &json!({"command": "echo hi"}), &ctx).unwrap();
        assert_eq!(out, json!("mocked output"));
        assert!(!*invoked.lock().unwrap());
        assert_eq!(mock.recorded_calls().len(), 1);
    }

    #[test]
    fn interceptors_compose_with_the_first_registered_outermost() {
        let mut registry = registry_with_echo();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct OrderRecording {
            label: &'static str,
            order: Arc<Mutex<Vec<&'static str>>>,
        }
        impl Interceptor<TestContext> for OrderRecording {
            fn intercept(
                &self,
                descriptor: &StepDescriptor,
                arguments: &serde_json::Value,
                context: &TestContext,
                next: &(dyn Fn(&serde_json::Value, &TestContext) -> Result<serde_json::Value, PipelineError>
                      + Send
                      + Sync),
            ) -> Result<serde_json::Value, PipelineError> {
                let _ = descriptor;
                self.order.lock().unwrap().push(self.label);
                next(arguments, context)
            }
        }

        registry.add_interceptor(Arc::new(OrderRecording {
            label: "outer",
            order: order.clone(),
        }));
        registry.add_interceptor(Arc::new(OrderRecording {
            label: "inner",
            order: order.clone(),
        }));

        let ctx = TestContext {
            ceiling: SecurityLevel::Unrestricted,
        };
        registry.dispatch("echo", &json!("x"), &ctx).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn descriptor_lookup_does_not_dispatch() {
        let registry = registry_with_echo();
        let descriptor = registry.descriptor("echo").unwrap();
        assert_eq!(descriptor.category, StepCategory::Logging);
        assert!(registry.descriptor("missing").is_none());
    }
}
