use capgate_core::CapabilitySet;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Subject,
    Bucket,
    Stream,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Subject => "subject",
            TargetKind::Bucket => "bucket",
            TargetKind::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
    Subject,
    KeyValueWatch { key_pattern: Option<String> },
    StreamConsumer { filter: String, durable: String },
}

impl SubscriptionKind {
    pub fn target_kind(&self) -> TargetKind {
        match self {
            SubscriptionKind::Subject => TargetKind::Subject,
            SubscriptionKind::KeyValueWatch { .. } => TargetKind::Bucket,
            SubscriptionKind::StreamConsumer { .. } => TargetKind::Stream,
        }
    }

    pub fn allowed_by(&self, target: &str, caps: &CapabilitySet) -> bool {
        match self {
            SubscriptionKind::Subject => caps.allows_subject(target),
            SubscriptionKind::KeyValueWatch { key_pattern } => {
                caps.allows_bucket(target, key_pattern.as_deref())
            }
            SubscriptionKind::StreamConsumer { filter, .. } => {
                caps.allows_stream(target, Some(filter))
            }
        }
    }
}

/// One live delivery task. The task owns the bus handle, so awaiting its
/// exit is what guarantees the handle has been released.
pub struct Registration {
    kind: SubscriptionKind,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Registration {
    pub fn new(kind: SubscriptionKind, stop: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { kind, stop, task }
    }

    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

pub type RegistryKey = (TargetKind, String);

#[derive(Default)]
pub struct Registry {
    entries: HashMap<RegistryKey, Registration>,
}

impl Registry {
    /// Returns the registration previously held under the same key.
    pub fn insert(&mut self, target: String, registration: Registration) -> Option<Registration> {
        let key = (registration.kind.target_kind(), target);
        self.entries.insert(key, registration)
    }

    /// Removes every registration for `target`, whatever its kind.
    pub fn remove_target(&mut self, target: &str) -> Vec<(RegistryKey, Registration)> {
        let keys = self
            .entries
            .keys()
            .filter(|(_, name)| name == target)
            .cloned()
            .collect::<Vec<_>>();
        keys.into_iter()
            .filter_map(|key| self.entries.remove_entry(&key))
            .collect()
    }

    /// Removes every registration `caps` no longer authorizes.
    pub fn revoke(&mut self, caps: &CapabilitySet) -> Vec<(RegistryKey, Registration)> {
        let keys = self
            .entries
            .iter()
            .filter(|((_, target), registration)| !registration.kind.allowed_by(target, caps))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        keys.into_iter()
            .filter_map(|key| self.entries.remove_entry(&key))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Registration> {
        self.entries.drain().map(|(_, registration)| registration).collect()
    }

}

#[cfg(test)]
impl Registry {
    fn contains(&self, kind: TargetKind, target: &str) -> bool {
        self.entries.contains_key(&(kind, target.to_string()))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
