//! Derived object names: `{base}-{suffix}`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SUFFIX_LEN: usize = 8;
const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Longest base that still yields a valid DNS-1123 label (63 chars) once suffixed.
pub const MAX_BASE_LEN: usize = 63 - 1 - SUFFIX_LEN;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("no job name available: set JOB_NAME or run inside a Job-owned pod")]
    NoIdentity,
    #[error("invalid base name {name:?}: {reason}")]
    InvalidBaseName { name: String, reason: &'static str },
}

/// Validated job-family name used as the prefix of every derived name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseName(String);

impl BaseName {
    pub fn new(name: impl Into<String>) -> Result<Self, ResolutionError> {
        let name = name.into();
        let invalid = |reason| ResolutionError::InvalidBaseName { name: name.clone(), reason };
        if name.is_empty() { return Err(invalid("empty")); }
        if name.len() > MAX_BASE_LEN { return Err(invalid("longer than 54 characters")); }
        if !name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-') {
            return Err(invalid("only lowercase alphanumerics and '-' are allowed"));
        }
        let first = name.as_bytes()[0];
        let last = name.as_bytes()[name.len() - 1];
        if first == b'-' || last == b'-' {
            return Err(invalid("must start and end with an alphanumeric character"));
        }
        Ok(Self(name))
    }

    /// Base taken from an existing object's name. Object names are DNS-1123
    /// subdomains, so dots become dashes; the result is cut down so the
    /// suffixed name still fits.
    pub fn from_object_name(name: &str) -> Result<Self, ResolutionError> {
        let label: String = name
            .chars()
            .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
            .take(MAX_BASE_LEN)
            .collect();
        let label = label.trim_matches('-');
        if label.is_empty() {
            return Err(ResolutionError::InvalidBaseName { name: name.to_string(), reason: "no usable characters" });
        }
        Self::new(label)
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for BaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// A freshly derived, practically unique name for one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    name: String,
}

impl JobIdentity {
    pub fn derive(base: &BaseName) -> Self {
        Self { name: format!("{}-{}", base, random_suffix()) }
    }

    pub fn name(&self) -> &str { &self.name }
}

impl std::fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.name) }
}

/// Eight base-36 digits taken from the random low bits of a v4 UUID.
fn random_suffix() -> String {
    let mut n = Uuid::new_v4().as_u128();
    let mut out = String::with_capacity(SUFFIX_LEN);
    for _ in 0..SUFFIX_LEN {
        out.push(ALPHABET[(n % 36) as usize] as char);
        n /= 36;
    }
    out
}
