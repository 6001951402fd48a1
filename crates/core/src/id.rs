//! Strongly-typed identifiers used across the pipeline.
//!
//! Identifiers are opaque strings: job ids are generated by the submitting
//! caller, user ids come from the identity provider, and archive/retrieval ids
//! are handed out by the cold tier.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of an annotation job (caller-generated, globally unique).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Identifier of a user (owner of jobs, subject of tier changes).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// Opaque handle returned by the cold-archive tier for a stored archive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveId(String);

/// Identifier of an asynchronous cold-tier retrieval job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetrievalId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal, $forbidden:expr) => {
        impl $t {
            /// Generate a fresh identifier (UUIDv7, time-ordered).
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Wrap an existing identifier after validating it.
            pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: empty", $name)));
                }
                let forbidden: &[char] = $forbidden;
                if let Some(c) = value.chars().find(|c| forbidden.contains(c) || c.is_control()) {
                    return Err(DomainError::invalid_id(format!(
                        "{}: forbidden character {:?} in {:?}",
                        $name, c, value
                    )));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }
    };
}

// Job ids are embedded in object keys as `<user>/<job_id>~<file>`.
impl_string_newtype!(JobId, "JobId", &['/', '~']);
impl_string_newtype!(UserId, "UserId", &['/']);
impl_string_newtype!(ArchiveId, "ArchiveId", &['/']);
impl_string_newtype!(RetrievalId, "RetrievalId", &['/']);
