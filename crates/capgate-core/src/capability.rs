use crate::pattern::{covered_by_any, is_valid_pattern, pattern_covers, TAIL_WILDCARD};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const CURRENT_CAPABILITY_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("capability decode failed: {0}")]
    Decode(String),
    #[error("capability encode failed: {0}")]
    Encode(String),
    #[error("unsupported capability version: {0}")]
    UnsupportedVersion(u16),
}

/// Immutable authorization snapshot for one identity.
///
/// `buckets` maps a bucket pattern to the key patterns allowed inside it;
/// `streams` maps a stream pattern to the allowed filter subject patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default = "current_version")]
    pub version: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub subjects: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub buckets: BTreeMap<String, Vec<String>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub streams: BTreeMap<String, Vec<String>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub commands: Vec<String>,
}

fn current_version() -> u16 {
    CURRENT_CAPABILITY_VERSION
}

// Policy writers may emit `null` for empty lists and maps.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::deny_all()
    }
}

impl CapabilitySet {
    pub fn deny_all() -> Self {
        Self {
            version: CURRENT_CAPABILITY_VERSION,
            subjects: Vec::new(),
            buckets: BTreeMap::new(),
            streams: BTreeMap::new(),
            commands: Vec::new(),
        }
    }

    /// Parses a serialized set and checks its version tag. Patterns are not
    /// validated here; see [`CapabilitySet::retain_valid_patterns`].
    pub fn parse(bytes: &[u8]) -> Result<Self, CapabilityError> {
        let caps: Self =
            serde_json::from_slice(bytes).map_err(|err| CapabilityError::Decode(err.to_string()))?;
        if caps.version == 0 || caps.version > CURRENT_CAPABILITY_VERSION {
            return Err(CapabilityError::UnsupportedVersion(caps.version));
        }
        Ok(caps)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CapabilityError> {
        serde_json::to_vec(self).map_err(|err| CapabilityError::Encode(err.to_string()))
    }

    /// Drops every malformed pattern and returns how many were removed.
    /// Dropping only ever narrows the grant.
    pub fn retain_valid_patterns(&mut self) -> usize {
        let mut dropped = 0;
        dropped += retain_valid(&mut self.subjects);
        dropped += retain_valid(&mut self.commands);
        dropped += retain_valid_scoped(&mut self.buckets);
        dropped += retain_valid_scoped(&mut self.streams);
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
            && self.buckets.is_empty()
            && self.streams.is_empty()
            && self.commands.is_empty()
    }

    /// A target may itself be a wildcard pattern, so it is allowed only when
    /// some grant covers every subject it could match.
    pub fn allows_subject(&self, subject: &str) -> bool {
        covered_by_any(&self.subjects, subject)
    }

    pub fn allows_command(&self, command: &str) -> bool {
        covered_by_any(&self.commands, command)
    }

    pub fn allows_bucket(&self, bucket: &str, key_pattern: Option<&str>) -> bool {
        scoped_allows(&self.buckets, bucket, key_pattern)
    }

    pub fn allows_stream(&self, stream: &str, filter: Option<&str>) -> bool {
        scoped_allows(&self.streams, stream, filter)
    }
}

fn retain_valid(patterns: &mut Vec<String>) -> usize {
    let before = patterns.len();
    patterns.retain(|pattern| is_valid_pattern(pattern));
    before - patterns.len()
}

fn retain_valid_scoped(scoped: &mut BTreeMap<String, Vec<String>>) -> usize {
    let mut dropped = 0;
    scoped.retain(|outer, inner| {
        if !is_valid_pattern(outer) {
            dropped += 1 + inner.len();
            return false;
        }
        dropped += retain_valid(inner);
        true
    });
    dropped
}

fn scoped_allows(scoped: &BTreeMap<String, Vec<String>>, name: &str, requested: Option<&str>) -> bool {
    let requested = requested.map(str::trim).filter(|value| !value.is_empty());
    scoped
        .iter()
        .filter(|(outer, _)| pattern_covers(outer, name))
        .any(|(_, allowed)| match requested {
            Some(pattern) => covered_by_any(allowed, pattern),
            None => allowed.iter().any(|pattern| pattern == TAIL_WILDCARD),
        })
}
