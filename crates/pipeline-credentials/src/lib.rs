//! Credential storage and the `withCredentials` scope lifecycle.
//!
//! A [`CredentialStore`] holds an ordered list of [`CredentialProvider`]s —
//! the first provider that recognizes an id wins, mirroring how Jenkins'
//! credential plugins chain together. [`with_credentials`] takes a list of
//! [`CredentialBinding`]s, resolves each through the store, materializes
//! any file-backed secrets under a private temp directory, and guarantees
//! cleanup (files removed, env vars unset or restored to their prior value)
//! on every exit path — including early return, panic unwinding, and
//! partial materialization failure.
//!
//! Nested `withCredentials` blocks compose LIFO: the inner scope's env vars
//! shadow the outer scope's for the duration of the inner block and are
//! rolled back to the outer scope's values when it exits.
//!
//! # Example
//!
//! ```
//! use pipeline_credentials::{CredentialStore, StaticCredentialProvider, with_credentials};
//! use pipeline_types::{CredentialBinding, SecretValue};
//! use std::collections::HashMap;
//!
//! let mut provider = StaticCredentialProvider::new();
//! provider.insert("github-token", SecretValue::PlainText { value: "ghp_example".into() });
//!
//! let mut store = CredentialStore::new();
//! store.register_provider(provider);
//!
//! let bindings = vec![CredentialBinding::StringBinding {
//!     id: "github-token".into(),
//!     var: "GITHUB_TOKEN".into(),
//! }];
//!
//! let result = with_credentials(&store, &bindings, None, |env| {
//!     assert_eq!(env.get("GITHUB_TOKEN").map(String::as_str), Some("ghp_example"));
//!     Ok::<_, pipeline_types::PipelineError>(())
//! });
//! assert!(result.is_ok());
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use pipeline_types::{CredentialBinding, PipelineError, SecretValue};

/// A source of resolved credentials, consulted in registration order.
///
/// Implementations might back onto an in-memory map (tests,
/// [`StaticCredentialProvider`]), a secrets-manager API, or an on-disk
/// vault. A provider that doesn't recognize an id returns `None` so the
/// store can fall through to the next one.
pub trait CredentialProvider: Send + Sync {
    /// Resolve `id` to a [`SecretValue`], or `None` if this provider has no
    /// such credential.
    fn get(&self, id: &str) -> Option<SecretValue>;

    /// A name for this provider, used in diagnostics when every provider
    /// in the chain misses.
    fn name(&self) -> &str;
}

/// A fixed, in-memory credential provider — the common case in tests and
/// for pipelines whose secrets are injected wholesale by the caller.
#[derive(Debug, Default)]
pub struct StaticCredentialProvider {
    entries: HashMap<String, SecretValue>,
}

impl StaticCredentialProvider {
    /// An empty provider; populate it with [`StaticCredentialProvider::insert`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a credential under `id`, overwriting any prior value.
    pub fn insert(&mut self, id: impl Into<String>, value: SecretValue) -> &mut Self {
        self.entries.insert(id.into(), value);
        self
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn get(&self, id: &str) -> Option<SecretValue> {
        self.entries.get(id).cloned()
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// An ordered chain of [`CredentialProvider`]s.
#[derive(Default)]
pub struct CredentialStore {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl CredentialStore {
    /// A store with no providers registered.
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Append a provider to the end of the lookup chain.
    pub fn register_provider(&mut self, provider: impl CredentialProvider + 'static) {
        self.providers.push(Box::new(provider));
    }

    /// Resolve `id` against each registered provider in order, returning
    /// the first hit.
    pub fn get(&self, id: &str) -> Result<SecretValue, PipelineError> {
        for provider in &self.providers {
            if let Some(value) = provider.get(id) {
                return Ok(value);
            }
        }
        Err(PipelineError::CredentialResolution {
            id: id.to_string(),
            reason: if self.providers.is_empty() {
                "no credential providers registered".to_string()
            } else {
                "no registered provider recognizes this id".to_string()
            },
        })
    }
}

static TEMP_FILE_SEQ: AtomicU64 = AtomicU64::new(0);

/// The result of materializing one [`CredentialBinding`]: the environment
/// variables it populated and any temp files it created, so they can be
/// torn down when the scope exits.
struct MaterializedBinding {
    env_vars: Vec<(String, String)>,
    temp_files: Vec<PathBuf>,
}

fn materialize(
    store: &CredentialStore,
    binding: &CredentialBinding,
    secret: &SecretValue,
    temp_dir: &Path,
) -> Result<MaterializedBinding, PipelineError> {
    let mut env_vars = Vec::new();
    let mut temp_files = Vec::new();

    match (binding, secret) {
        (CredentialBinding::StringBinding { var, .. }, SecretValue::PlainText { value }) => {
            env_vars.push((var.clone(), value.clone()));
        }
        (
            CredentialBinding::UserPasswordBinding {
                user_var, pass_var, ..
            },
            SecretValue::UserPassword { user, pass },
        ) => {
            env_vars.push((user_var.clone(), user.clone()));
            env_vars.push((pass_var.clone(), pass.clone()));
        }
        (CredentialBinding::FileBinding { var, .. }, SecretValue::FileBacked { path }) => {
            let contents = fs::read(path)
                .with_context(|| format!("failed to read source file: {path}"))?;
            let materialized = write_temp_file(temp_dir, &contents)?;
            env_vars.push((var.clone(), materialized.display().to_string()));
            temp_files.push(materialized);
        }
        (
            CredentialBinding::SshKeyBinding {
                user_var, key_var, ..
            },
            SecretValue::SshKey { user, key_path, .. },
        ) => {
            let contents = fs::read(key_path).with_context(|| {
                format!("failed to read SSH key source file: {key_path}")
            })?;
            let materialized = write_temp_file(temp_dir, &contents)?;
            env_vars.push((user_var.clone(), user.clone()));
            env_vars.push((key_var.clone(), materialized.display().to_string()));
            temp_files.push(materialized);
        }
        (
            CredentialBinding::CertBinding {
                keystore_var,
                pass_var,
                ..
            },
            SecretValue::Certificate {
                keystore_path,
                password_id,
            },
        ) => {
            let contents = fs::read(keystore_path).with_context(|| {
                format!("failed to read keystore source file: {keystore_path}")
            })?;
            let materialized = write_temp_file(temp_dir, &contents)?;
            let password = match password_id {
                Some(id) => match store.get(id)? {
                    SecretValue::PlainText { value } => value,
                    other => {
                        return Err(PipelineError::CredentialResolution {
                            id: id.clone(),
                            reason: format!(
                                "keystore password secret must be plain text, got `{}`",
                                other.kind()
                            ),
                        });
                    }
                },
                None => String::new(),
            };
            env_vars.push((keystore_var.clone(), materialized.display().to_string()));
            env_vars.push((pass_var.clone(), password));
            temp_files.push(materialized);
        }
        (
            CredentialBinding::AwsBinding { ak_var, sk_var, .. },
            SecretValue::AwsKeys {
                access_key_id,
                secret_access_key,
            },
        ) => {
            env_vars.push((ak_var.clone(), access_key_id.clone()));
            env_vars.push((sk_var.clone(), secret_access_key.clone()));
        }
        _ => {
            return Err(PipelineError::CredentialResolution {
                id: binding.credential_id().to_string(),
                reason: format!(
                    "binding kind does not match resolved secret kind `{}`",
                    secret.kind()
                ),
            });
        }
    }

    Ok(MaterializedBinding {
        env_vars,
        temp_files,
    })
}

fn write_temp_file(temp_dir: &Path, contents: &[u8]) -> Result<PathBuf, PipelineError> {
    let seq = TEMP_FILE_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = temp_dir.join(format!("cred-{}-{seq}", std::process::id()));
    fs::write(&path, contents)
        .with_context(|| format!("failed to materialize credential file at {}", path.display()))?;
    restrict_permissions(&path)?;
    Ok(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), PipelineError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict permissions on {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), PipelineError> {
    Ok(())
}

/// Clean up every file and env var a set of [`MaterializedBinding`]s
/// produced, restoring any env var that was shadowed rather than newly set.
fn teardown(materialized: Vec<MaterializedBinding>, previous: &HashMap<String, Option<String>>) {
    for binding in &materialized {
        for (name, _) in &binding.env_vars {
            match previous.get(name) {
                Some(Some(prior)) => unsafe { std::env::set_var(name, prior) },
                Some(None) | None => unsafe { std::env::remove_var(name) },
            }
        }
        for file in &binding.temp_files {
            let _ = fs::remove_file(file);
        }
    }
}

/// Run `f` with `bindings` resolved and exported as environment variables,
/// guaranteeing cleanup on every exit path (including the closure panicking).
///
/// `temp_dir` is where file-backed secrets are materialized; pass `None` to
/// use [`std::env::temp_dir`]. The map handed to `f` contains only the
/// variables this scope just bound (not the full process environment),
/// letting a step enumerate exactly what it was given.
pub fn with_credentials<T, F>(
    store: &CredentialStore,
    bindings: &[CredentialBinding],
    temp_dir: Option<&Path>,
    f: F,
) -> Result<T, PipelineError>
where
    F: FnOnce(&HashMap<String, String>) -> Result<T, PipelineError>,
{
    let temp_dir = temp_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);

    let mut materialized = Vec::with_capacity(bindings.len());
    let mut previous = HashMap::new();
    let mut scope_vars = HashMap::new();

    for binding in bindings {
        let secret = match store.get(binding.credential_id()) {
            Ok(secret) => secret,
            Err(err) => {
                teardown(materialized, &previous);
                return Err(err);
            }
        };
        let bound = match materialize(store, binding, &secret, &temp_dir) {
            Ok(bound) => bound,
            Err(err) => {
                teardown(materialized, &previous);
                return Err(err);
            }
        };
        for (name, value) in &bound.env_vars {
            previous
                .entry(name.clone())
                .or_insert_with(|| std::env::var(name).ok());
            unsafe {
                std::env::set_var(name, value);
            }
            scope_vars.insert(name.clone(), value.clone());
        }
        materialized.push(bound);
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&scope_vars)));
    teardown(materialized, &previous);

    match result {
        Ok(inner) => inner,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_with(id: &str, value: SecretValue) -> CredentialStore {
        let mut provider = StaticCredentialProvider::new();
        provider.insert(id, value);
        let mut store = CredentialStore::new();
        store.register_provider(provider);
        store
    }

    #[test]
    fn unknown_credential_id_fails_resolution() {
        let store = CredentialStore::new();
        let err = store.get("missing").unwrap_err();
        assert!(matches!(err, PipelineError::CredentialResolution { .. }));
    }

    #[test]
    fn string_binding_sets_and_clears_env_var() {
        let store = store_with(
            "token",
            SecretValue::PlainText {
                value: "s3cr3t".into(),
            },
        );
        let bindings = vec![CredentialBinding::StringBinding {
            id: "token".into(),
            var: "PIPELINE_TEST_TOKEN".into(),
        }];

        let result = with_credentials(&store, &bindings, None, |env| {
            assert_eq!(env.get("PIPELINE_TEST_TOKEN").map(String::as_str), Some("s3cr3t"));
            assert_eq!(std::env::var("PIPELINE_TEST_TOKEN").unwrap(), "s3cr3t");
            Ok::<_, PipelineError>(())
        });

        assert!(result.is_ok());
        assert!(std::env::var("PIPELINE_TEST_TOKEN").is_err());
    }

    #[test]
    fn nested_scopes_restore_outer_value_on_exit() {
        let store = store_with(
            "inner-token",
            SecretValue::PlainText {
                value: "inner".into(),
            },
        );
        unsafe {
            std::env::set_var("PIPELINE_TEST_NESTED", "outer");
        }

        let bindings = vec![CredentialBinding::StringBinding {
            id: "inner-token".into(),
            var: "PIPELINE_TEST_NESTED".into(),
        }];

        with_credentials(&store, &bindings, None, |_| {
            assert_eq!(std::env::var("PIPELINE_TEST_NESTED").unwrap(), "inner");
            Ok::<_, PipelineError>(())
        })
        .unwrap();

        assert_eq!(std::env::var("PIPELINE_TEST_NESTED").unwrap(), "outer");
        unsafe {
            std::env::remove_var("PIPELINE_TEST_NESTED");
        }
    }

    #[test]
    fn file_binding_materializes_and_cleans_up() {
        let source_dir = tempdir().unwrap();
        let source_path = source_dir.path().join("service-account.json");
        fs::write(&source_path, b"{}").unwrap();

        let store = store_with(
            "gcp-key",
            SecretValue::FileBacked {
                path: source_path.display().to_string(),
            },
        );
        let bindings = vec![CredentialBinding::FileBinding {
            id: "gcp-key".into(),
            var: "GOOGLE_APPLICATION_CREDENTIALS".into(),
        }];

        let scope_dir = tempdir().unwrap();
        let mut seen_path = None;
        with_credentials(&store, &bindings, Some(scope_dir.path()), |env| {
            let path = env.get("GOOGLE_APPLICATION_CREDENTIALS").unwrap().clone();
            assert!(Path::new(&path).exists());
            seen_path = Some(path);
            Ok::<_, PipelineError>(())
        })
        .unwrap();

        assert!(!Path::new(&seen_path.unwrap()).exists());
    }

    #[test]
    fn cert_binding_resolves_password_id_through_the_store() {
        let keystore_dir = tempdir().unwrap();
        let keystore_path = keystore_dir.path().join("keystore.p12");
        fs::write(&keystore_path, b"not-a-real-keystore").unwrap();

        let mut provider = StaticCredentialProvider::new();
        provider.insert(
            "signing-cert",
            SecretValue::Certificate {
                keystore_path: keystore_path.display().to_string(),
                password_id: Some("signing-cert-password".into()),
            },
        );
        provider.insert(
            "signing-cert-password",
            SecretValue::PlainText {
                value: "correct-horse".into(),
            },
        );
        let mut store = CredentialStore::new();
        store.register_provider(provider);

        let bindings = vec![CredentialBinding::CertBinding {
            id: "signing-cert".into(),
            keystore_var: "KEYSTORE_PATH".into(),
            pass_var: "KEYSTORE_PASSWORD".into(),
        }];

        with_credentials(&store, &bindings, Some(keystore_dir.path()), |env| {
            assert_eq!(
                env.get("KEYSTORE_PASSWORD").map(String::as_str),
                Some("correct-horse")
            );
            Ok::<_, PipelineError>(())
        })
        .unwrap();
    }

    #[test]
    fn materialization_failure_rolls_back_prior_bindings() {
        let mut provider = StaticCredentialProvider::new();
        provider.insert(
            "first",
            SecretValue::PlainText {
                value: "v1".into(),
            },
        );
        provider.insert(
            "second",
            SecretValue::SshKey {
                user: "git".into(),
                key_path: "/nonexistent/path/to/key".into(),
                passphrase_id: None,
            },
        );
        let mut store = CredentialStore::new();
        store.register_provider(provider);

        let bindings = vec![
            CredentialBinding::StringBinding {
                id: "first".into(),
                var: "PIPELINE_TEST_ROLLBACK".into(),
            },
            CredentialBinding::SshKeyBinding {
                id: "second".into(),
                user_var: "PIPELINE_TEST_SSH_USER".into(),
                key_var: "PIPELINE_TEST_SSH_KEY".into(),
            },
        ];

        let result = with_credentials(&store, &bindings, None, |_| Ok::<_, PipelineError>(()));
        assert!(result.is_err());
        assert!(std::env::var("PIPELINE_TEST_ROLLBACK").is_err());
    }

    #[test]
    fn mismatched_binding_and_secret_kind_is_rejected() {
        let store = store_with(
            "token",
            SecretValue::PlainText {
                value: "v".into(),
            },
        );
        let bindings = vec![CredentialBinding::AwsBinding {
            id: "token".into(),
            ak_var: "AK".into(),
            sk_var: "SK".into(),
        }];

        let result = with_credentials(&store, &bindings, None, |_| Ok::<_, PipelineError>(()));
        assert!(result.is_err());
    }
}
