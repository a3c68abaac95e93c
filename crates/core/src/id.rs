//! Strongly-typed identifiers used across the framework.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of the actor (administrator, operator) that triggers or controls a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(Uuid);

/// Identifier of an authenticated session (used for rate-limit identity resolution).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(ActorId, "ActorId");
impl_uuid_newtype!(SessionId, "SessionId");

/// Identity of a job execution (the record's `version`).
///
/// Generated ids are UUIDv7 strings, so they sort by creation time. Callers
/// running named migrations may supply their own version token instead
/// (e.g. `20250107_000001_add_passkeys`); uniqueness is enforced by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh, time-ordered job id.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Use a caller-chosen version token as the job id.
    pub fn from_version(version: impl Into<String>) -> Result<Self, DomainError> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(DomainError::invalid_id("JobId: empty version"));
        }
        if version.len() > 128 {
            return Err(DomainError::invalid_id("JobId: version longer than 128 bytes"));
        }
        if version.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(DomainError::invalid_id(
                "JobId: version contains whitespace or control characters",
            ));
        }
        Ok(Self(version))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_version(s)
    }
}
