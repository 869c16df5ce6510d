// Copyright 2025 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::informer::Change;
use crate::types::condition::{Reason, Severity};
use crate::utils::lock;
use k8s_openapi::api::core::v1::Event;
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Index key of an event: `<subject uid>:<type>:<reason>`.
pub fn event_key(subject_uid: &str, event_type: &str, reason: &str) -> String {
    format!("{subject_uid}:{event_type}:{reason}")
}

/// Recent events grouped by subject, type and reason.
///
/// Fed from the Event watch. A key stays present while at least one event
/// object with that key exists in the cluster. Recovery markers hang off
/// the Warning key they answer and go away with it.
#[derive(Debug, Default)]
pub struct EventIndex {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    events: HashMap<String, HashSet<String>>,
    recovered: HashSet<String>,
}

fn index_key(event: &Event) -> Option<String> {
    let uid = event
        .involved_object
        .uid
        .as_deref()
        .filter(|u| !u.is_empty())?;
    let event_type = event.type_.as_deref()?;
    let reason = event.reason.as_deref()?;
    Some(event_key(uid, event_type, reason))
}

fn object_key(event: &Event) -> String {
    format!(
        "{}/{}",
        event.namespace().unwrap_or_default(),
        event.name_any()
    )
}

fn warning_key(subject_uid: &str, reason: Reason) -> String {
    event_key(subject_uid, Severity::Warning.as_ref(), reason.as_ref())
}

impl EventIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, event: &Event) {
        let Some(key) = index_key(event) else {
            return;
        };
        lock(&self.inner)
            .events
            .entry(key)
            .or_default()
            .insert(object_key(event));
    }

    pub fn remove(&self, event: &Event) {
        let Some(key) = index_key(event) else {
            return;
        };
        let mut inner = lock(&self.inner);
        let Some(events) = inner.events.get_mut(&key) else {
            return;
        };
        events.remove(&object_key(event));
        if events.is_empty() {
            inner.events.remove(&key);
            inner.recovered.remove(&key);
        }
    }

    pub fn apply(&self, change: &Change<Event>) {
        match change {
            Change::Added(event) => self.insert(event),
            Change::Updated { old, new } => {
                self.remove(old);
                self.insert(new);
            }
            Change::Deleted(event) => self.remove(event),
        }
    }

    /// Whether an event of `severity` and `reason` exists for the subject.
    pub fn contains(&self, subject_uid: &str, severity: Severity, reason: Reason) -> bool {
        let key = event_key(subject_uid, severity.as_ref(), reason.as_ref());
        lock(&self.inner).events.contains_key(&key)
    }

    /// Whether a Warning of `reason` is on record for the subject and has
    /// not been answered by a recovery yet.
    pub fn needs_recovery(&self, subject_uid: &str, reason: Reason) -> bool {
        let key = warning_key(subject_uid, reason);
        let inner = lock(&self.inner);
        inner.events.contains_key(&key) && !inner.recovered.contains(&key)
    }

    /// Records that the Warning of `reason` was answered. No-op when no such
    /// Warning is on record.
    pub fn mark_recovered(&self, subject_uid: &str, reason: Reason) {
        let key = warning_key(subject_uid, reason);
        let mut inner = lock(&self.inner);
        if inner.events.contains_key(&key) {
            inner.recovered.insert(key);
        }
    }

    /// Re-arms recovery after a new abnormal condition.
    pub fn clear_recovered(&self, subject_uid: &str, reason: Reason) {
        lock(&self.inner)
            .recovered
            .remove(&warning_key(subject_uid, reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::create_event;
    use std::sync::Arc;

    #[test]
    fn test_key_layout() {
        assert_eq!(
            event_key("uid-1", "Warning", "VolumeConditionAbnormal"),
            "uid-1:Warning:VolumeConditionAbnormal"
        );
    }

    #[test]
    fn test_insert_and_remove() {
        let index = EventIndex::new();
        let event = create_event(
            "ev1",
            "default",
            "uid-1",
            "Warning",
            "VolumeConditionAbnormal",
        );

        let abnormal = Reason::VolumeConditionAbnormal;

        index.insert(&event);
        assert!(index.contains("uid-1", Severity::Warning, abnormal));
        assert!(!index.contains("uid-1", Severity::Normal, abnormal));
        assert!(!index.contains("uid-2", Severity::Warning, abnormal));

        index.remove(&event);
        assert!(!index.contains("uid-1", Severity::Warning, abnormal));
    }

    #[test]
    fn test_key_survives_until_last_event_is_removed() {
        let index = EventIndex::new();
        let first = create_event("ev1", "default", "uid-1", "Warning", "NodeFailed");
        let second = create_event("ev2", "default", "uid-1", "Warning", "NodeFailed");
        index.insert(&first);
        index.insert(&second);

        let reason = Reason::NodeFailed;

        index.remove(&first);
        assert!(index.contains("uid-1", Severity::Warning, reason));

        index.remove(&second);
        assert!(!index.contains("uid-1", Severity::Warning, reason));
    }

    #[test]
    fn test_events_without_subject_uid_are_ignored() {
        let index = EventIndex::new();
        index.insert(&create_event("ev1", "default", "", "Warning", "NodeFailed"));
        assert!(lock(&index.inner).events.is_empty());
    }

    #[test]
    fn test_apply_changes() {
        let index = EventIndex::new();
        let warning = Arc::new(create_event(
            "ev1",
            "default",
            "uid-1",
            "Warning",
            "VolumeConditionAbnormal",
        ));
        let normal = Arc::new(create_event(
            "ev1",
            "default",
            "uid-1",
            "Normal",
            "VolumeConditionNormal",
        ));

        let abnormal = Reason::VolumeConditionAbnormal;
        let recovered = Reason::VolumeConditionNormal;

        index.apply(&Change::Added(warning.clone()));
        assert!(index.contains("uid-1", Severity::Warning, abnormal));

        index.apply(&Change::Updated {
            old: warning,
            new: normal.clone(),
        });
        assert!(!index.contains("uid-1", Severity::Warning, abnormal));
        assert!(index.contains("uid-1", Severity::Normal, recovered));

        index.apply(&Change::Deleted(normal));
        assert!(!index.contains("uid-1", Severity::Normal, recovered));
    }

    #[test]
    fn test_recovery_marker_follows_the_warning() {
        let index = EventIndex::new();
        let reason = Reason::VolumeConditionAbnormal;

        index.mark_recovered("uid-1", reason);
        assert!(lock(&index.inner).recovered.is_empty());

        let warning = create_event("ev1", "default", "uid-1", "Warning", reason.as_ref());
        index.insert(&warning);
        assert!(index.needs_recovery("uid-1", reason));

        index.mark_recovered("uid-1", reason);
        assert!(!index.needs_recovery("uid-1", reason));

        index.clear_recovered("uid-1", reason);
        assert!(index.needs_recovery("uid-1", reason));
    }

    #[test]
    fn test_recovery_marker_is_dropped_with_the_last_warning() {
        let index = EventIndex::new();
        let reason = Reason::VolumeConditionAbnormal;
        let warning = create_event("ev1", "default", "uid-1", "Warning", reason.as_ref());

        index.insert(&warning);
        index.mark_recovered("uid-1", reason);
        index.remove(&warning);

        let inner = lock(&index.inner);
        assert!(inner.events.is_empty());
        assert!(inner.recovered.is_empty());
    }
}
