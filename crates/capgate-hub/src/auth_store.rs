use crate::bus::{Bus, BusError, KvEntry, KvOperation, KvWatch};
use capgate_core::{CapabilityError, CapabilitySet};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_AUTH_BUCKET: &str = "auth.users";
pub const DEFAULT_ANONYMOUS_KEY: &str = "anonymous";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Capability sets stored as JSON in one KV bucket, keyed by identity.
#[derive(Clone)]
pub struct CapabilityStore {
    bus: Arc<dyn Bus>,
    bucket: String,
    anonymous_key: String,
}

impl CapabilityStore {
    pub fn new(bus: Arc<dyn Bus>, bucket: impl Into<String>, anonymous_key: impl Into<String>) -> Self {
        Self {
            bus,
            bucket: bucket.into(),
            anonymous_key: anonymous_key.into(),
        }
    }

    pub fn key_for<'a>(&'a self, identity: &'a str) -> &'a str {
        if identity.is_empty() {
            &self.anonymous_key
        } else {
            identity
        }
    }

    /// Initial snapshot. Anything short of a valid stored entry denies all.
    pub async fn load(&self, identity: &str) -> CapabilitySet {
        let key = self.key_for(identity);
        match self.bus.kv_get(&self.bucket, key).await {
            Ok(Some(entry)) => decode_entry(&entry),
            Ok(None) => {
                debug!(event = "caps_absent", bucket = %self.bucket, key = %key);
                CapabilitySet::deny_all()
            }
            Err(err) => {
                warn!(event = "caps_load_error", bucket = %self.bucket, key = %key, error = %err);
                CapabilitySet::deny_all()
            }
        }
    }

    pub async fn watch(&self, identity: &str) -> Result<KvWatch, BusError> {
        let key = self.key_for(identity);
        self.bus.kv_watch(&self.bucket, Some(key)).await
    }

    pub async fn put(&self, identity: &str, caps: &CapabilitySet) -> Result<u64, StoreError> {
        let key = self.key_for(identity).to_string();
        let encoded = caps.encode()?;
        Ok(self.bus.kv_put(&self.bucket, &key, encoded).await?)
    }

    pub async fn seed(&self, entries: &BTreeMap<String, CapabilitySet>) -> Result<usize, StoreError> {
        for (identity, caps) in entries {
            self.put(identity, caps).await?;
        }
        Ok(entries.len())
    }
}

/// Delete, purge and unreadable entries all fail closed.
pub fn decode_entry(entry: &KvEntry) -> CapabilitySet {
    match entry.operation {
        KvOperation::Delete | KvOperation::Purge => CapabilitySet::deny_all(),
        KvOperation::Put => match CapabilitySet::parse(&entry.value) {
            Ok(mut caps) => {
                let dropped = caps.retain_valid_patterns();
                if dropped > 0 {
                    warn!(event = "caps_invalid_patterns", key = %entry.key, dropped);
                }
                caps
            }
            Err(err) => {
                warn!(event = "caps_decode_error", key = %entry.key, error = %err);
                CapabilitySet::deny_all()
            }
        },
    }
}
