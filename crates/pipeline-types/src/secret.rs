//! The credential payload model.
//!
//! [`SecretValue`] is the one type in this crate that is not safe to print.
//! Its [`std::fmt::Display`] and [`std::fmt::Debug`] impls are both redacted:
//! callers get the variant name and any non-sensitive identifier, never the
//! secret bytes.

use serde::{Deserialize, Serialize};

/// A resolved credential, tagged by the shape Jenkins-style credential
/// providers commonly expose.
///
/// `Serialize`/`Deserialize` are intentionally *not* derived here: a
/// `SecretValue` is produced by the credential store at bind time and is
/// never meant to cross a serialization boundary. Persisted configuration
/// refers to secrets by id (see [`crate::credential::CredentialBinding`]),
/// not by value.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretValue {
    /// An opaque string secret (API token, webhook secret, ...).
    PlainText {
        /// The secret bytes.
        value: String,
    },
    /// A username paired with a password.
    UserPassword {
        /// The (non-sensitive) username.
        user: String,
        /// The password.
        pass: String,
    },
    /// A secret backed by a file on disk (e.g. a service-account JSON blob).
    FileBacked {
        /// Path to the file holding the secret bytes.
        path: String,
    },
    /// An SSH private key, optionally passphrase-protected.
    SshKey {
        /// The username to authenticate as.
        user: String,
        /// Path to the private key file.
        key_path: String,
        /// Id of a separate secret holding the key passphrase, if any.
        passphrase_id: Option<String>,
    },
    /// A Java keystore / PKCS12 certificate bundle.
    Certificate {
        /// Path to the keystore file.
        keystore_path: String,
        /// Id of a separate secret holding the keystore password, if any.
        password_id: Option<String>,
    },
    /// An AWS access key pair.
    AwsKeys {
        /// The (non-sensitive) access key id.
        access_key_id: String,
        /// The secret access key.
        secret_access_key: String,
    },
}

impl SecretValue {
    /// The variant name, used in redacted output and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            SecretValue::PlainText { .. } => "PlainText",
            SecretValue::UserPassword { .. } => "UserPassword",
            SecretValue::FileBacked { .. } => "FileBacked",
            SecretValue::SshKey { .. } => "SshKey",
            SecretValue::Certificate { .. } => "Certificate",
            SecretValue::AwsKeys { .. } => "AwsKeys",
        }
    }

    /// Any non-sensitive identifier worth surfacing alongside the kind
    /// (a username, an access key id, a file path) — never the secret itself.
    fn disclosed_identifier(&self) -> Option<&str> {
        match self {
            SecretValue::PlainText { .. } => None,
            SecretValue::UserPassword { user, .. } => Some(user),
            SecretValue::FileBacked { path } => Some(path),
            SecretValue::SshKey { user, .. } => Some(user),
            SecretValue::Certificate { keystore_path, .. } => Some(keystore_path),
            SecretValue::AwsKeys { access_key_id, .. } => Some(access_key_id),
        }
    }
}

impl std::fmt::Display for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.disclosed_identifier() {
            Some(id) => write!(f, "Secret({}: {})", self.kind(), id),
            None => write!(f, "Secret({})", self.kind()),
        }
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_never_reveals_value() {
        let s = SecretValue::PlainText {
            value: "super-secret-token".into(),
        };
        let shown = format!("{s} {s:?}");
        assert!(!shown.contains("super-secret-token"));
        assert!(shown.contains("PlainText"));
    }

    #[test]
    fn user_password_reveals_user_not_pass() {
        let s = SecretValue::UserPassword {
            user: "deploy-bot".into(),
            pass: "hunter2".into(),
        };
        let shown = s.to_string();
        assert!(shown.contains("deploy-bot"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn aws_keys_reveal_access_key_not_secret() {
        let s = SecretValue::AwsKeys {
            access_key_id: "AKIAEXAMPLE".into(),
            secret_access_key: "do-not-leak".into(),
        };
        let shown = format!("{s:?}");
        assert!(shown.contains("AKIAEXAMPLE"));
        assert!(!shown.contains("do-not-leak"));
    }

    #[test]
    fn ssh_key_reveals_user_and_path_not_passphrase() {
        let s = SecretValue::SshKey {
            user: "git".into(),
            key_path: "/tmp/id_rsa".into(),
            passphrase_id: Some("ssh-passphrase".into()),
        };
        let shown = s.to_string();
        assert!(shown.contains("git"));
        assert!(!shown.contains("ssh-passphrase"));
    }
}
