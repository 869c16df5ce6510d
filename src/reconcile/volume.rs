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
use crate::csi::{CsiClient, DriverCapabilities};
use crate::types::object::{PersistentVolumeExt, is_deleting};
use crate::utils::lock;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How the controller checks volumes, fixed for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckMode {
    /// One ListVolumes sweep per interval.
    Batch,
    /// One ControllerGetVolume call per volume and interval.
    PerVolume,
}

impl CheckMode {
    pub fn from_capabilities(caps: &DriverCapabilities) -> Self {
        if caps.list_volumes {
            CheckMode::Batch
        } else {
            CheckMode::PerVolume
        }
    }
}

#[derive(Clone, Debug)]
pub struct VolumeReconcilerConfig {
    pub workers: u16,
    /// Gap between two checks of the same volume.
    pub monitor_interval: Duration,
    pub list_volumes_interval: Duration,
    pub volume_list_add_interval: Duration,
}

#[derive(Clone, Debug)]
struct Due {
    uid: Option<String>,
    at: Instant,
}

pub type ReconcileError = controller::Error<checker::Error, watcher::Error>;

/// Keeps every bound volume of the driver under continuous probing.
///
/// Every volume the controller hands over is checked at most once per
/// `monitor_interval`, however often it is triggered in between.
pub struct VolumeReconciler<C, R> {
    checker: Arc<HealthChecker<C, R>>,
    /// Next check of every volume under monitoring.
    tracked: Mutex<HashMap<String, Due>>,
    config: VolumeReconcilerConfig,
}

impl<C: CsiClient, R: EventRecorder> VolumeReconciler<C, R> {
    pub fn new(checker: Arc<HealthChecker<C, R>>, config: VolumeReconcilerConfig) -> Self {
        Self {
            checker,
            tracked: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        lock(&self.tracked).contains_key(name)
    }

    /// Stops monitoring `name`. A later bound volume of that name starts fresh.
    pub fn forget(&self, name: &str) {
        if lock(&self.tracked).remove(name).is_some() {
            debug!(pv = %name, "stop monitoring volume");
        }
    }

    /// Claims the check slot of `pv` at `now`, or returns the time left
    /// until the slot opens.
    fn claim_slot(&self, pv: &PersistentVolume, now: Instant) -> Option<Duration> {
        let uid = pv.uid();
        let mut tracked = lock(&self.tracked);
        let pending = tracked
            .get(&pv.name_any())
            .filter(|due| due.uid == uid && due.at > now);
        if let Some(due) = pending {
            return Some(due.at - now);
        }

        let at = now + self.config.monitor_interval;
        tracked.insert(pv.name_any(), Due { uid, at });
        None
    }

    pub fn handle_result(
        &self,
        result: Result<(ObjectRef<PersistentVolume>, Action), ReconcileError>,
    ) {
        match result {
            Ok((pv, _)) => debug!(pv = %pv.name, "volume reconciled"),
            Err(controller::Error::ObjectNotFound(pv)) => self.forget(&pv.name),
            Err(controller::Error::ReconcilerFailed(e, pv)) => {
                error!(pv = %pv.name, "check volume failed: {}", e)
            }
            Err(e) => warn!("volume reconcile failed: {}", e),
        }
    }

    /// Runs the per-volume controller until `token` is cancelled.
    pub async fn run(
        self: Arc<Self>,
        volumes: Controller<PersistentVolume>,
        token: CancellationToken,
    ) {
        if let Err(e) = self.checker.wait_until_ready().await {
            error!("claim cache never became ready: {}", e);
            return;
        }

        info!(workers = self.config.workers, "volume reconciler started");
        volumes
            .graceful_shutdown_on(token.cancelled_owned())
            .run(reconcile_volume, error_policy, self.clone())
            .for_each(|result| {
                self.handle_result(result);
                futures::future::ready(())
            })
            .await;
        info!("volume reconciler stopped");
    }

    /// Sweeps every volume of `volumes` once per `list_volumes_interval`
    /// until `token` is cancelled.
    pub async fn run_batch(
        self: Arc<Self>,
        volumes: Store<PersistentVolume>,
        token: CancellationToken,
    ) {
        if let Err(e) = volumes.wait_until_ready().await {
            error!("volume cache never became ready: {}", e);
            return;
        }
        if let Err(e) = self.checker.wait_until_ready().await {
            error!("claim cache never became ready: {}", e);
            return;
        }

        info!("volume batch sweep started");
        let mut ticker = tokio::time::interval(self.config.list_volumes_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let state = volumes.state();
                    match self.checker.check_controller_volumes(&state).await {
                        Ok(n) => debug!("listed volume conditions, reported on {} volumes", n),
                        Err(e) => error!("list volume conditions failed: {}", e),
                    }
                }
            }
        }
        info!("volume batch sweep stopped");
    }
}

/// Controller over every PersistentVolume, resynced on `volume_list_add_interval`.
pub fn controller(
    api: Api<PersistentVolume>,
    config: &VolumeReconcilerConfig,
) -> Controller<PersistentVolume> {
    let period = config.volume_list_add_interval;
    let resync = tokio::time::interval_at(Instant::now() + period, period);

    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(config.workers))
        .reconcile_all_on(IntervalStream::new(resync).map(|_| ()))
}

/// Checks one volume and schedules the next check.
///
/// Volumes that are being deleted, unbound or owned by another driver leave
/// monitoring until their next change.
pub async fn reconcile_volume<C: CsiClient, R: EventRecorder>(
    pv: Arc<PersistentVolume>,
    ctx: Arc<VolumeReconciler<C, R>>,
) -> Result<Action, checker::Error> {
    let name = pv.name_any();
    if is_deleting(&*pv) || !pv.is_managed_by(ctx.checker.driver()) || !pv.is_bound() {
        ctx.forget(&name);
        return Ok(Action::await_change());
    }

    if let Some(remaining) = ctx.claim_slot(&pv, Instant::now()) {
        return Ok(Action::requeue(remaining));
    }

    let condition = ctx.checker.check_controller_volume(&pv).await?;
    debug!(pv = %name, abnormal = condition.abnormal, "volume checked");
    Ok(Action::requeue(ctx.config.monitor_interval))
}

pub fn error_policy<C: CsiClient, R: EventRecorder>(
    _pv: Arc<PersistentVolume>,
    _error: &checker::Error,
    ctx: Arc<VolumeReconciler<C, R>>,
) -> Action {
    Action::requeue(ctx.config.monitor_interval)
}
