//! # Types
//!
//! Core domain types shared across the pipeline engine crates: the secret and
//! credential model, step descriptors and security levels, stage/pipeline
//! results, log events, and the error taxonomy.
//!
//! This crate carries no behavior beyond small pure helpers (fingerprinting,
//! redacted `Display`/`Debug` impls) — everything that touches the filesystem,
//! the network, or a lock lives one layer up, in `pipeline` or one of the
//! micro-crates.
//!
//! ## Modules
//!
//! - [`secret`] — [`secret::SecretValue`], the tagged credential payload that never reveals itself
//! - [`credential`] — [`credential::CredentialBinding`], mapping a credential id to env vars / files
//! - [`fingerprint`] — [`fingerprint::ScriptFingerprint`] and [`fingerprint::CacheEntry`]
//! - [`step`] — [`step::StepDescriptor`], [`step::SecurityLevel`], [`step::StepCategory`]
//! - [`stage`] — [`stage::StageStatus`], [`stage::StageResult`], [`stage::PipelineResult`]
//! - [`log`] — [`log::LogLevel`], [`log::LogEvent`]
//! - [`error`] — [`error::PipelineError`], the error taxonomy from the design doc

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod credential;
pub mod error;
pub mod fingerprint;
pub mod log;
pub mod secret;
pub mod stage;
pub mod step;

pub use credential::CredentialBinding;
pub use error::PipelineError;
pub use fingerprint::{CacheEntry, CacheStats, ScriptFingerprint};
pub use log::{LogEvent, LogLevel};
pub use secret::SecretValue;
pub use stage::{PipelineResult, PipelineStatus, StageResult, StageStatus};
pub use step::{SecurityLevel, StepCategory, StepDescriptor};

/// Deserialize a [`Duration`] from either a human-readable string (`"30s"`) or
/// a plain integer number of milliseconds.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a [`Duration`] as milliseconds so it round-trips with [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(
            serialize_with = "serialize_duration",
            deserialize_with = "deserialize_duration"
        )]
        d: Duration,
    }

    #[test]
    fn duration_roundtrips_through_millis() {
        let w = Wrapper {
            d: Duration::from_millis(1500),
        };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"d":1500}"#);
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.d, Duration::from_millis(1500));
    }

    #[test]
    fn duration_accepts_human_readable_string() {
        let w: Wrapper = serde_json::from_str(r#"{"d":"30s"}"#).unwrap();
        assert_eq!(w.d, Duration::from_secs(30));
    }
}
