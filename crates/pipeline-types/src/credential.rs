//! Bindings: how a stored credential maps onto environment variables (and,
//! for file-backed kinds, a temporary file path) during a `withCredentials`
//! scope.

use serde::{Deserialize, Serialize};

/// A declared mapping from a credential id to one or more environment
/// variable names. The shape mirrors [`crate::secret::SecretValue`]'s
/// variants one-to-one, so a binding always knows which env vars it will
/// populate before the credential store is even consulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialBinding {
    /// Bind a plaintext secret to a single env var.
    StringBinding {
        /// Credential id to resolve.
        id: String,
        /// Env var to populate.
        var: String,
    },
    /// Bind a username/password pair to two env vars.
    UserPasswordBinding {
        /// Credential id to resolve.
        id: String,
        /// Env var for the username.
        user_var: String,
        /// Env var for the password.
        pass_var: String,
    },
    /// Materialize a file-backed secret and bind its path to an env var.
    FileBinding {
        /// Credential id to resolve.
        id: String,
        /// Env var to populate with the materialized file's path.
        var: String,
    },
    /// Bind an SSH key: materialize the key to a temp file, bind its path
    /// and the associated username.
    SshKeyBinding {
        /// Credential id to resolve.
        id: String,
        /// Env var for the username.
        user_var: String,
        /// Env var for the materialized private key path.
        key_var: String,
    },
    /// Bind a certificate/keystore: materialize the keystore to a temp
    /// file, bind its path and password.
    CertBinding {
        /// Credential id to resolve.
        id: String,
        /// Env var for the materialized keystore path.
        keystore_var: String,
        /// Env var for the keystore password.
        pass_var: String,
    },
    /// Bind an AWS key pair to two env vars.
    AwsBinding {
        /// Credential id to resolve.
        id: String,
        /// Env var for the access key id.
        ak_var: String,
        /// Env var for the secret access key.
        sk_var: String,
    },
}

impl CredentialBinding {
    /// The credential id this binding resolves through the credential store.
    pub fn credential_id(&self) -> &str {
        match self {
            CredentialBinding::StringBinding { id, .. }
            | CredentialBinding::UserPasswordBinding { id, .. }
            | CredentialBinding::FileBinding { id, .. }
            | CredentialBinding::SshKeyBinding { id, .. }
            | CredentialBinding::CertBinding { id, .. }
            | CredentialBinding::AwsBinding { id, .. } => id,
        }
    }

    /// Whether this binding kind requires materializing a temporary file
    /// (as opposed to only setting environment variables).
    pub fn requires_file(&self) -> bool {
        matches!(
            self,
            CredentialBinding::FileBinding { .. }
                | CredentialBinding::SshKeyBinding { .. }
                | CredentialBinding::CertBinding { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_id_extracted_for_every_variant() {
        let bindings = vec![
            CredentialBinding::StringBinding {
                id: "a".into(),
                var: "A".into(),
            },
            CredentialBinding::UserPasswordBinding {
                id: "b".into(),
                user_var: "U".into(),
                pass_var: "P".into(),
            },
            CredentialBinding::FileBinding {
                id: "c".into(),
                var: "F".into(),
            },
            CredentialBinding::SshKeyBinding {
                id: "d".into(),
                user_var: "U".into(),
                key_var: "K".into(),
            },
            CredentialBinding::CertBinding {
                id: "e".into(),
                keystore_var: "KS".into(),
                pass_var: "P".into(),
            },
            CredentialBinding::AwsBinding {
                id: "f".into(),
                ak_var: "AK".into(),
                sk_var: "SK".into(),
            },
        ];
        for (binding, expected) in bindings.iter().zip(["a", "b", "c", "d", "e", "f"]) {
            assert_eq!(binding.credential_id(), expected);
        }
    }

    #[test]
    fn only_file_backed_kinds_require_materialization() {
        assert!(
            !CredentialBinding::StringBinding {
                id: "a".into(),
                var: "A".into(),
            }
            .requires_file()
        );
        assert!(
            CredentialBinding::FileBinding {
                id: "a".into(),
                var: "A".into(),
            }
            .requires_file()
        );
    }

    #[test]
    fn serde_roundtrip() {
        let b = CredentialBinding::UserPasswordBinding {
            id: "docker-hub".into(),
            user_var: "DOCKER_USER".into(),
            pass_var: "DOCKER_PASS".into(),
        };
        let json = serde_json::to_string(&b).unwrap();
        let back: CredentialBinding = serde_json::from_str(&json).unwrap();
        assert_eq!(b, back);
    }
}
