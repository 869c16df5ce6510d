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

//! Read-only helpers over the core/v1 objects the monitor watches.

use k8s_openapi::api::core::v1 as corev1;
use kube::Resource;
use std::fmt;

pub const VOLUME_BOUND: &str = "Bound";
pub const CLAIM_BOUND: &str = "Bound";
pub const VOLUME_MODE_BLOCK: &str = "Block";
pub const NODE_READY: &str = "Ready";
pub const NODE_TERMINATED: &str = "Terminated";
pub const CONDITION_TRUE: &str = "True";

/// Namespace and name of a PersistentVolumeClaim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimKey {
    pub namespace: String,
    pub name: String,
}

impl ClaimKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub trait PersistentVolumeExt {
    /// Name of the CSI driver backing this volume, if it is a CSI volume.
    fn csi_driver(&self) -> Option<&str>;

    /// Driver assigned volume handle. Empty handles are returned as-is.
    fn volume_handle(&self) -> Option<&str>;

    fn phase(&self) -> Option<&str>;

    fn claim(&self) -> Option<ClaimKey>;

    fn is_block(&self) -> bool;

    fn is_bound(&self) -> bool {
        self.phase() == Some(VOLUME_BOUND)
    }

    fn is_managed_by(&self, driver: &str) -> bool {
        self.csi_driver() == Some(driver)
    }
}

impl PersistentVolumeExt for corev1::PersistentVolume {
    fn csi_driver(&self) -> Option<&str> {
        self.spec
            .as_ref()
            .and_then(|spec| spec.csi.as_ref())
            .map(|csi| csi.driver.as_str())
    }

    fn volume_handle(&self) -> Option<&str> {
        self.spec
            .as_ref()
            .and_then(|spec| spec.csi.as_ref())
            .map(|csi| csi.volume_handle.as_str())
    }

    fn phase(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
    }

    fn claim(&self) -> Option<ClaimKey> {
        let claim_ref = self.spec.as_ref()?.claim_ref.as_ref()?;
        Some(ClaimKey::new(
            claim_ref.namespace.clone()?,
            claim_ref.name.clone()?,
        ))
    }

    fn is_block(&self) -> bool {
        self.spec
            .as_ref()
            .and_then(|spec| spec.volume_mode.as_deref())
            == Some(VOLUME_MODE_BLOCK)
    }
}

pub trait PodExt {
    fn node_name(&self) -> Option<&str>;

    /// Names of the claims mounted through `persistentVolumeClaim` volumes.
    fn claim_names(&self) -> Vec<&str>;

    fn is_scheduled(&self) -> bool {
        self.node_name().is_some_and(|name| !name.is_empty())
    }
}

impl PodExt for corev1::Pod {
    fn node_name(&self) -> Option<&str> {
        self.spec
            .as_ref()
            .and_then(|spec| spec.node_name.as_deref())
    }

    fn claim_names(&self) -> Vec<&str> {
        self.spec
            .as_ref()
            .and_then(|spec| spec.volumes.as_ref())
            .map(|volumes| {
                volumes
                    .iter()
                    .filter_map(|v| v.persistent_volume_claim.as_ref())
                    .map(|pvc| pvc.claim_name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub trait ClaimExt {
    fn is_bound(&self) -> bool;

    fn bound_volume_name(&self) -> Option<&str>;
}

impl ClaimExt for corev1::PersistentVolumeClaim {
    fn is_bound(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some(CLAIM_BOUND)
    }

    fn bound_volume_name(&self) -> Option<&str> {
        self.spec
            .as_ref()
            .and_then(|spec| spec.volume_name.as_deref())
            .filter(|name| !name.is_empty())
    }
}

pub trait NodeExt {
    fn is_ready(&self) -> bool;

    fn is_terminated(&self) -> bool;
}

impl NodeExt for corev1::Node {
    fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == NODE_READY && c.status == CONDITION_TRUE)
            })
    }

    fn is_terminated(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some(NODE_TERMINATED)
    }
}

/// Whether the object carries a deletion timestamp.
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{create_node, create_pod, create_pv};

    #[test]
    fn test_pv_accessors() {
        let pv = create_pv("pv1", "handle-1", VOLUME_BOUND, Some(("default", "pvc1")));
        assert_eq!(pv.csi_driver(), Some(crate::tests::DRIVER_NAME));
        assert_eq!(pv.volume_handle(), Some("handle-1"));
        assert!(pv.is_bound());
        assert!(pv.is_managed_by(crate::tests::DRIVER_NAME));
        assert!(!pv.is_managed_by("other.csi.io"));
        assert_eq!(pv.claim(), Some(ClaimKey::new("default", "pvc1")));
        assert!(!pv.is_block());
    }

    #[test]
    fn test_pv_without_claim_ref() {
        let pv = create_pv("pv1", "handle-1", "Available", None);
        assert!(!pv.is_bound());
        assert_eq!(pv.claim(), None);
    }

    #[test]
    fn test_pod_claim_names_and_scheduling() {
        let pod = create_pod("pod1", "default", "uid-1", "node1", &["pvc1", "pvc2"]);
        assert_eq!(pod.claim_names(), vec!["pvc1", "pvc2"]);
        assert!(pod.is_scheduled());

        let pending = create_pod("pod2", "default", "uid-2", "", &["pvc1"]);
        assert!(!pending.is_scheduled());
    }

    #[test]
    fn test_node_readiness() {
        assert!(create_node("node1", true).is_ready());
        assert!(!create_node("node1", false).is_ready());
        assert!(!create_node("node1", false).is_terminated());
    }
}
