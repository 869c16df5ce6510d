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

use crate::types::object::{ClaimKey, PodExt};
use crate::utils::lock;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Reverse index from a claim to the pods mounting it.
///
/// Pods are keyed by `namespace/name` inside each claim entry, so adding the
/// same pod twice keeps a single entry holding the latest object.
#[derive(Debug, Default)]
pub struct PvcPodIndex {
    inner: Mutex<HashMap<ClaimKey, HashMap<String, Arc<Pod>>>>,
}

impl PvcPodIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, pod: &Arc<Pod>) {
        let Some(namespace) = pod.namespace() else {
            return;
        };
        let pod_key = format!("{}/{}", namespace, pod.name_any());

        let mut inner = lock(&self.inner);
        for claim in pod.claim_names() {
            inner
                .entry(ClaimKey::new(namespace.as_str(), claim))
                .or_default()
                .insert(pod_key.clone(), pod.clone());
        }
    }

    pub fn remove_pod(&self, pod: &Pod) {
        let Some(namespace) = pod.namespace() else {
            return;
        };
        let pod_key = format!("{}/{}", namespace, pod.name_any());

        let mut inner = lock(&self.inner);
        for claim in pod.claim_names() {
            let key = ClaimKey::new(namespace.as_str(), claim);
            if let Some(pods) = inner.get_mut(&key) {
                pods.remove(&pod_key);
                if pods.is_empty() {
                    inner.remove(&key);
                }
            }
        }
    }

    /// Replaces `old` with `new`, dropping claims the pod no longer mounts.
    pub fn update_pod(&self, old: &Pod, new: &Arc<Pod>) {
        self.remove_pod(old);
        self.add_pod(new);
    }

    /// Pods currently mounting `claim`, empty when none do.
    pub fn lookup(&self, claim: &ClaimKey) -> Vec<Arc<Pod>> {
        lock(&self.inner)
            .get(claim)
            .map(|pods| pods.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains_claim(&self, claim: &ClaimKey) -> bool {
        lock(&self.inner).contains_key(claim)
    }
}
