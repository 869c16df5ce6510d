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

use crate::checker::{self, HealthChecker};
use crate::context::EventRecorder;
use crate::csi::CsiClient;
use crate::types::object::{ClaimExt, PersistentVolumeExt, PodExt, is_deleting};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use snafu::Snafu;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{} of {} volumes of pod {} failed", failed, total, pod))]
    Check {
        pod: String,
        failed: usize,
        total: usize,
    },
}

/// A volume as mounted by one pod on this node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodVolumeItem {
    pub namespace: String,
    pub pod_name: String,
    pub volume_name: String,
}

impl PodVolumeItem {
    pub fn is_valid(&self) -> bool {
        !self.namespace.is_empty() && !self.pod_name.is_empty() && !self.volume_name.is_empty()
    }
}

impl fmt::Display for PodVolumeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.pod_name, self.volume_name)
    }
}

#[derive(Clone, Debug)]
pub struct PodVolumeReconcilerConfig {
    pub workers: u16,
    /// Gap between two checks of the volumes of the same pod.
    pub monitor_interval: Duration,
}

pub type ReconcileError = controller::Error<Error, watcher::Error>;

/// Node-side counterpart of the volume reconciler, probing each volume
/// through the mount of every local pod using it.
///
/// A pod's volumes are resolved again on every cycle, so claims that show
/// up or bind after the pod are picked up on its next check.
pub struct PodVolumeReconciler<C, R> {
    checker: Arc<HealthChecker<C, R>>,
    volumes: Store<PersistentVolume>,
    claims: Store<PersistentVolumeClaim>,
    config: PodVolumeReconcilerConfig,
}

impl<C: CsiClient, R: EventRecorder> PodVolumeReconciler<C, R> {
    pub fn new(
        checker: Arc<HealthChecker<C, R>>,
        volumes: Store<PersistentVolume>,
        claims: Store<PersistentVolumeClaim>,
        config: PodVolumeReconcilerConfig,
    ) -> Self {
        Self {
            checker,
            volumes,
            claims,
            config,
        }
    }

    /// Bound driver volumes the pod mounts.
    pub fn volume_items(&self, pod: &Pod) -> Vec<PodVolumeItem> {
        let namespace = pod.namespace().unwrap_or_default();
        let pod_name = pod.name_any();
        let mut items = Vec::new();

        for claim_name in pod.claim_names() {
            let Some(pvc) = self
                .claims
                .get(&ObjectRef::new(claim_name).within(&namespace))
            else {
                debug!(pod = %pod_name, pvc = %claim_name, "claim not cached yet");
                continue;
            };
            if !pvc.is_bound() {
                continue;
            }
            let Some(volume_name) = pvc.bound_volume_name() else {
                continue;
            };
            let Some(pv) = self.volumes.get(&ObjectRef::new(volume_name)) else {
                continue;
            };
            if !pv.is_managed_by(self.checker.driver()) {
                continue;
            }

            items.push(PodVolumeItem {
                namespace: namespace.clone(),
                pod_name: pod_name.clone(),
                volume_name: volume_name.to_string(),
            });
        }

        items
    }

    /// Checks one volume of `pod`. Returns whether the driver was asked.
    async fn check(&self, pod: &Pod, item: &PodVolumeItem) -> Result<bool, checker::Error> {
        if !item.is_valid() {
            warn!(item = %item, "invalid pod volume item, drop");
            return Ok(false);
        }

        let Some(pv) = self.volumes.get(&ObjectRef::new(&item.volume_name)) else {
            debug!(item = %item, "volume is gone, skip");
            return Ok(false);
        };
        if is_deleting(&*pv) || !pv.is_bound() {
            debug!(item = %item, "volume is not bound or being deleted, skip");
            return Ok(false);
        }

        let condition = self.checker.check_node_volume(&pv, pod).await?;
        debug!(item = %item, abnormal = condition.abnormal, "volume checked");
        Ok(true)
    }

    pub fn handle_result(&self, result: Result<(ObjectRef<Pod>, Action), ReconcileError>) {
        match result {
            Ok((pod, _)) => debug!(pod = %pod.name, "pod volumes reconciled"),
            Err(controller::Error::ObjectNotFound(pod)) => {
                debug!(pod = %pod.name, "pod is gone, stop monitoring")
            }
            Err(controller::Error::ReconcilerFailed(e, pod)) => {
                error!(pod = %pod.name, "check pod volumes failed: {}", e)
            }
            Err(e) => warn!("pod volume reconcile failed: {}", e),
        }
    }

    /// Runs the pod controller until `token` is cancelled.
    pub async fn run(self: Arc<Self>, pods: Controller<Pod>, token: CancellationToken) {
        let ready = futures::future::try_join(
            self.volumes.wait_until_ready(),
            self.claims.wait_until_ready(),
        )
        .await;
        if let Err(e) = ready {
            error!("caches never became ready: {}", e);
            return;
        }

        info!(workers = self.config.workers, "pod volume reconciler started");
        pods.graceful_shutdown_on(token.cancelled_owned())
            .run(reconcile_pod, error_policy, self.clone())
            .for_each(|result| {
                self.handle_result(result);
                futures::future::ready(())
            })
            .await;
        info!("pod volume reconciler stopped");
    }
}

/// Controller over the pods scheduled to `node`.
pub fn controller(
    api: Api<Pod>,
    node: &str,
    config: &PodVolumeReconcilerConfig,
) -> Controller<Pod> {
    let selector = format!("spec.nodeName={node}");
    Controller::new(api, watcher::Config::default().fields(&selector))
        .with_config(controller::Config::default().concurrency(config.workers))
}

/// Checks every volume the pod mounts, then schedules the next round.
pub async fn reconcile_pod<C: CsiClient, R: EventRecorder>(
    pod: Arc<Pod>,
    ctx: Arc<PodVolumeReconciler<C, R>>,
) -> Result<Action, Error> {
    if is_deleting(&*pod) || !pod.is_scheduled() {
        return Ok(Action::await_change());
    }

    let items = ctx.volume_items(&pod);
    let mut failed: usize = 0;
    for item in &items {
        if let Err(e) = ctx.check(&pod, item).await {
            error!(item = %item, "check node volume failed: {}", e);
            failed += 1;
        }
    }

    if failed > 0 {
        return CheckSnafu {
            pod: pod.name_any(),
            failed,
            total: items.len(),
        }
        .fail();
    }
    Ok(Action::requeue(ctx.config.monitor_interval))
}

pub fn error_policy<C: CsiClient, R: EventRecorder>(
    _pod: Arc<Pod>,
    _error: &Error,
    ctx: Arc<PodVolumeReconciler<C, R>>,
) -> Action {
    Action::requeue(ctx.config.monitor_interval)
}
