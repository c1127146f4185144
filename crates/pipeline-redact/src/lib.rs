//! Redact resolved secret values out of step output and log text before
//! either one leaves the engine.
//!
//! [`pipeline_types::secret::SecretValue`] already refuses to print itself;
//! this crate closes the other hole: once a secret has been expanded into a
//! shell command, an env var, or a file, its raw text can still show up
//! verbatim in captured stdout/stderr or in a log message built from it. A
//! [`Redactor`] tracks the literal strings that must never reach a sink and
//! replaces every occurrence with a placeholder.

use std::collections::HashSet;

use pipeline_types::SecretValue;

const PLACEHOLDER: &str = "***";

/// Disclosed (non-sensitive) fragments of a [`SecretValue`] that are safe to
/// leave in place even though they're registered alongside the secret.
fn sensitive_fragments(secret: &SecretValue) -> Vec<String> {
    match secret {
        SecretValue::PlainText { value } => vec![value.clone()],
        SecretValue::UserPassword { pass, .. } => vec![pass.clone()],
        SecretValue::FileBacked { .. } => vec![],
        SecretValue::SshKey { .. } => vec![],
        SecretValue::Certificate { .. } => vec![],
        SecretValue::AwsKeys {
            secret_access_key, ..
        } => vec![secret_access_key.clone()],
    }
}

/// A set of literal strings to scrub from text, longest first so a secret
/// that is a substring of another is never half-redacted.
#[derive(Debug, Default, Clone)]
pub struct Redactor {
    needles: HashSet<String>,
}

impl Redactor {
    /// An empty redactor that passes text through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every sensitive fragment of a resolved secret for redaction.
    pub fn register_secret(&mut self, secret: &SecretValue) {
        for fragment in sensitive_fragments(secret) {
            self.register_literal(fragment);
        }
    }

    /// Register an arbitrary literal string (a resolved template token, a
    /// copied env var value) for redaction.
    pub fn register_literal(&mut self, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.needles.insert(value);
        }
    }

    /// Whether any non-empty secret has been registered.
    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    /// Replace every occurrence of every registered secret in `text` with a
    /// placeholder. Longest needles are matched first so overlapping
    /// secrets don't leave a partial value exposed.
    pub fn redact(&self, text: &str) -> String {
        if self.needles.is_empty() {
            return text.to_string();
        }

        let mut ordered: Vec<&str> = self.needles.iter().map(String::as_str).collect();
        ordered.sort_unstable_by_key(|s| std::cmp::Reverse(s.len()));

        let mut out = text.to_string();
        for needle in ordered {
            if !out.contains(needle) {
                continue;
            }
            out = out.replace(needle, PLACEHOLDER);
        }
        out
    }

    /// Merge another redactor's needles into this one (used when a nested
    /// `withCredentials` scope closes but its parent scope is still open).
    pub fn merge(&mut self, other: &Redactor) {
        self.needles.extend(other.needles.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_secret_is_scrubbed() {
        let mut r = Redactor::new();
        r.register_secret(&SecretValue::PlainText {
            value: "super-secret-token".into(),
        });
        let out = r.redact("Authorization: Bearer super-secret-token");
        assert_eq!(out, "Authorization: Bearer ***");
    }

    #[test]
    fn username_is_not_redacted_only_password() {
        let mut r = Redactor::new();
        r.register_secret(&SecretValue::UserPassword {
            user: "deploy-bot".into(),
            pass: "hunter2".into(),
        });
        let out = r.redact("login as deploy-bot with hunter2");
        assert_eq!(out, "login as deploy-bot with ***");
    }

    #[test]
    fn file_backed_and_ssh_secrets_register_nothing_literal() {
        let mut r = Redactor::new();
        r.register_secret(&SecretValue::FileBacked {
            path: "/tmp/sa.json".into(),
        });
        assert!(r.is_empty());
    }

    #[test]
    fn aws_secret_key_is_scrubbed_but_access_key_id_survives() {
        let mut r = Redactor::new();
        r.register_secret(&SecretValue::AwsKeys {
            access_key_id: "AKIAEXAMPLE".into(),
            secret_access_key: "do-not-leak".into(),
        });
        let out = r.redact("AKIAEXAMPLE / do-not-leak");
        assert_eq!(out, "AKIAEXAMPLE / ***");
    }

    #[test]
    fn longer_overlapping_secrets_are_matched_first() {
        let mut r = Redactor::new();
        r.register_literal("secret");
        r.register_literal("secret-extended");
        let out = r.redact("value is secret-extended here");
        assert_eq!(out, "value is *** here");
    }

    #[test]
    fn empty_redactor_passes_text_through() {
        let r = Redactor::new();
        assert_eq!(r.redact("nothing to hide"), "nothing to hide");
    }

    #[test]
    fn merge_combines_needles_from_a_nested_scope() {
        let mut outer = Redactor::new();
        outer.register_literal("outer-secret");
        let mut inner = Redactor::new();
        inner.register_literal("inner-secret");
        outer.merge(&inner);
        let out = outer.redact("outer-secret then inner-secret");
        assert_eq!(out, "*** then ***");
    }
}
