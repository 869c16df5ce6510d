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

use crate::cache::EventIndex;
use crate::context::EventRecorder;
use crate::csi::CsiClient;
use crate::types::condition::{RECOVERY_MESSAGE, Reason, Severity, VolumeCondition};
use crate::types::object::{ClaimKey, PersistentVolumeExt};
use crate::utils::paths;
use crate::{context, csi};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::runtime::reflector::store::WriterDropped;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Resource, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("volume {} is not managed by driver {}", pv, driver))]
    DriverMismatch { pv: String, driver: String },

    #[snafu(display("volume {} is not bound", pv))]
    NotBound { pv: String },

    #[snafu(display("volume handle of {} is empty", pv))]
    EmptyVolumeHandle { pv: String },

    #[snafu(display("volume {} has no claim reference", pv))]
    MissingClaimRef { pv: String },

    #[snafu(display("claim {} not found", claim))]
    ClaimNotFound { claim: ClaimKey },

    #[snafu(display("{} {} has no uid", kind, name))]
    MissingUid { kind: &'static str, name: String },

    #[snafu(display("probing volume {} timed out after {:?}", pv, timeout))]
    Timeout {
        pv: String,
        timeout: Duration,
        source: tokio::time::error::Elapsed,
    },

    #[snafu(transparent)]
    Csi { source: csi::Error },

    #[snafu(transparent)]
    Record { source: context::Error },

    #[snafu(transparent)]
    Path { source: paths::Error },
}

impl Error {
    /// Whether the volume was rejected before any driver call.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::DriverMismatch { .. }
                | Error::NotBound { .. }
                | Error::EmptyVolumeHandle { .. }
                | Error::MissingClaimRef { .. }
        )
    }
}

#[derive(Clone, Debug)]
pub struct CheckerConfig {
    pub driver: String,
    /// Deadline applied to every single driver call.
    pub timeout: Duration,
    pub kubelet_root: PathBuf,
    /// Whether node checks carry the staging path.
    pub stage_unstage: bool,
}

/// Checks volume health through the driver and turns the result into events.
///
/// Abnormal conditions always produce a Warning. A normal condition produces
/// one recovery event, and only when a Warning for the same subject is still
/// on record and was not answered yet.
pub struct HealthChecker<C, R> {
    csi: Arc<C>,
    recorder: Arc<R>,
    events: Arc<EventIndex>,
    claims: Store<PersistentVolumeClaim>,
    config: CheckerConfig,
}

impl<C: CsiClient, R: EventRecorder> HealthChecker<C, R> {
    pub fn new(
        csi: Arc<C>,
        recorder: Arc<R>,
        events: Arc<EventIndex>,
        claims: Store<PersistentVolumeClaim>,
        config: CheckerConfig,
    ) -> Self {
        Self {
            csi,
            recorder,
            events,
            claims,
            config,
        }
    }

    pub fn driver(&self) -> &str {
        &self.config.driver
    }

    /// Waits for the claim cache subjects are resolved from.
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        self.claims.wait_until_ready().await
    }

    /// Returns the volume handle of an eligible volume.
    pub fn validate<'a>(&self, pv: &'a PersistentVolume) -> Result<&'a str, Error> {
        let name = pv.name_any();
        ensure!(
            pv.is_managed_by(&self.config.driver),
            DriverMismatchSnafu {
                pv: name,
                driver: self.config.driver.as_str(),
            }
        );
        ensure!(pv.is_bound(), NotBoundSnafu { pv: name });

        let handle = pv.volume_handle().unwrap_or_default();
        ensure!(!handle.is_empty(), EmptyVolumeHandleSnafu { pv: name });
        Ok(handle)
    }

    fn bound_claim(&self, pv: &PersistentVolume) -> Result<Arc<PersistentVolumeClaim>, Error> {
        let key = pv
            .claim()
            .context(MissingClaimRefSnafu { pv: pv.name_any() })?;
        self.claims
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
            .context(ClaimNotFoundSnafu { claim: key })
    }

    async fn call_driver<F>(&self, pv: &PersistentVolume, call: F) -> Result<VolumeCondition, Error>
    where
        F: Future<Output = Result<VolumeCondition, csi::Error>>,
    {
        let condition = tokio::time::timeout(self.config.timeout, call)
            .await
            .context(TimeoutSnafu {
                pv: pv.name_any(),
                timeout: self.config.timeout,
            })??;
        Ok(condition)
    }

    /// Checks one volume from the controller side and reports on its claim.
    pub async fn check_controller_volume(
        &self,
        pv: &PersistentVolume,
    ) -> Result<VolumeCondition, Error> {
        let handle = self.validate(pv)?;
        let claim = self.bound_claim(pv)?;

        let condition = self
            .call_driver(pv, self.csi.controller_volume_condition(handle))
            .await?;
        debug!(
            pv = %pv.name_any(),
            abnormal = condition.abnormal,
            "controller check finished"
        );

        self.report(&*claim, &condition).await?;
        Ok(condition)
    }

    /// Checks one volume as mounted by `pod` and reports on the pod.
    pub async fn check_node_volume(
        &self,
        pv: &PersistentVolume,
        pod: &Pod,
    ) -> Result<VolumeCondition, Error> {
        let handle = self.validate(pv)?;
        let pv_name = pv.name_any();
        let pod_uid = pod.uid().context(MissingUidSnafu {
            kind: "pod",
            name: pod.name_any(),
        })?;

        let root = &self.config.kubelet_root;
        let volume_path = paths::volume_path(root, &pod_uid, &pv_name, pv.is_block());
        let staging_path = if self.config.stage_unstage {
            paths::staging_path(root, &pv_name)?
                .to_string_lossy()
                .into_owned()
        } else {
            String::new()
        };

        let condition = self
            .call_driver(
                pv,
                self.csi.node_volume_condition(
                    handle,
                    &volume_path.to_string_lossy(),
                    &staging_path,
                ),
            )
            .await?;
        debug!(
            pv = %pv_name,
            pod = %pod.name_any(),
            abnormal = condition.abnormal,
            "node check finished"
        );

        self.report(pod, &condition).await?;
        Ok(condition)
    }

    /// Lists every volume condition once and reports on each eligible volume
    /// found in the listing. Returns the number of volumes reported on.
    pub async fn check_controller_volumes(
        &self,
        volumes: &[Arc<PersistentVolume>],
    ) -> Result<usize, Error> {
        let timeout = self.config.timeout;
        let conditions = tokio::time::timeout(timeout, self.csi.list_volume_conditions())
            .await
            .context(TimeoutSnafu { pv: "*", timeout })??;

        let mut reported = 0;
        for pv in volumes {
            let Ok(handle) = self.validate(pv) else {
                continue;
            };
            let Some(condition) = conditions.get(handle) else {
                debug!(pv = %pv.name_any(), "volume missing from listing");
                continue;
            };

            let result = match self.bound_claim(pv) {
                Ok(claim) => self.report(&*claim, condition).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => reported += 1,
                Err(e) => error!(pv = %pv.name_any(), "report volume condition failed: {}", e),
            }
        }

        Ok(reported)
    }

    async fn report<K>(&self, subject: &K, condition: &VolumeCondition) -> Result<(), Error>
    where
        K: Resource<DynamicType = ()>,
    {
        let reference: ObjectReference = subject.object_ref(&());
        let uid = reference.uid.clone().context(MissingUidSnafu {
            kind: "subject",
            name: reference.name.clone().unwrap_or_default(),
        })?;

        let reason = Reason::VolumeConditionAbnormal;
        if condition.abnormal {
            self.events.clear_recovered(&uid, reason);
            self.recorder
                .publish(&reference, Severity::Warning, reason, &condition.message)
                .await?;
            return Ok(());
        }

        if !self.events.needs_recovery(&uid, reason) {
            return Ok(());
        }

        self.recorder
            .publish(
                &reference,
                Severity::Normal,
                Reason::VolumeConditionNormal,
                RECOVERY_MESSAGE,
            )
            .await?;
        self.events.mark_recovered(&uid, reason);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tests::{
        FakeCsi, FakeRecorder, cache, checker_config, create_event, create_pod, create_pv,
        test_checker, with_driver,
    };
    use crate::types::object::VOLUME_BOUND;

    fn bound_pv() -> PersistentVolume {
        create_pv("pv1", "handle-1", VOLUME_BOUND, Some(("default", "pvc1")))
    }

    fn warning_on(uid: &str) -> Arc<EventIndex> {
        let events = Arc::new(EventIndex::new());
        events.insert(&create_event(
            "pvc1.warning",
            "default",
            uid,
            "Warning",
            "VolumeConditionAbnormal",
        ));
        events
    }

    #[tokio::test]
    async fn test_abnormal_condition_emits_one_warning() {
        let csi = Arc::new(FakeCsi::with_condition(
            "handle-1",
            VolumeCondition::abnormal("Volume not found"),
        ));
        let recorder = Arc::new(FakeRecorder::default());
        let checker = test_checker(csi.clone(), recorder.clone(), Arc::new(EventIndex::new()));

        let condition = checker.check_controller_volume(&bound_pv()).await.unwrap();
        assert!(condition.abnormal);

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Warning);
        assert_eq!(events[0].reason, Reason::VolumeConditionAbnormal);
        assert_eq!(events[0].message, "Volume not found");
        assert_eq!(events[0].subject_name, "pvc1");
        assert_eq!(events[0].subject_uid, "pvc1-uid");
    }

    #[tokio::test]
    async fn test_normal_condition_without_prior_warning_is_silent() {
        let condition = VolumeCondition::normal("");
        let csi = Arc::new(FakeCsi::with_condition("handle-1", condition));
        let recorder = Arc::new(FakeRecorder::default());
        let checker = test_checker(csi, recorder.clone(), Arc::new(EventIndex::new()));

        checker.check_controller_volume(&bound_pv()).await.unwrap();
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_normal_condition_after_warning_emits_one_recovery() {
        let condition = VolumeCondition::normal("");
        let csi = Arc::new(FakeCsi::with_condition("handle-1", condition));
        let recorder = Arc::new(FakeRecorder::default());
        let checker = test_checker(csi, recorder.clone(), warning_on("pvc1-uid"));

        checker.check_controller_volume(&bound_pv()).await.unwrap();
        checker.check_controller_volume(&bound_pv()).await.unwrap();

        let recorded = recorder.events();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].severity, Severity::Normal);
        assert_eq!(recorded[0].reason, Reason::VolumeConditionNormal);
        assert_eq!(recorded[0].message, RECOVERY_MESSAGE);
    }

    #[tokio::test]
    async fn test_new_warning_rearms_recovery() {
        let condition = VolumeCondition::normal("");
        let csi = Arc::new(FakeCsi::with_condition("handle-1", condition));
        let recorder = Arc::new(FakeRecorder::default());
        let checker = test_checker(csi.clone(), recorder.clone(), warning_on("pvc1-uid"));

        checker.check_controller_volume(&bound_pv()).await.unwrap();
        csi.set_condition("handle-1", VolumeCondition::abnormal("io error"));
        checker.check_controller_volume(&bound_pv()).await.unwrap();
        csi.set_condition("handle-1", VolumeCondition::normal(""));
        checker.check_controller_volume(&bound_pv()).await.unwrap();

        let reasons: Vec<_> = recorder.events().into_iter().map(|e| e.reason).collect();
        assert_eq!(
            reasons,
            vec![
                Reason::VolumeConditionNormal,
                Reason::VolumeConditionAbnormal,
                Reason::VolumeConditionNormal
            ]
        );
    }

    #[tokio::test]
    async fn test_expired_warning_stops_recovery() {
        let condition = VolumeCondition::normal("");
        let csi = Arc::new(FakeCsi::with_condition("handle-1", condition));
        let recorder = Arc::new(FakeRecorder::default());
        let events = warning_on("pvc1-uid");
        let checker = test_checker(csi, recorder.clone(), events.clone());

        checker.check_controller_volume(&bound_pv()).await.unwrap();
        events.remove(&create_event(
            "pvc1.warning",
            "default",
            "pvc1-uid",
            "Warning",
            "VolumeConditionAbnormal",
        ));
        checker.check_controller_volume(&bound_pv()).await.unwrap();

        assert_eq!(recorder.events().len(), 1);
        let reason = Reason::VolumeConditionAbnormal;
        assert!(!events.needs_recovery("pvc1-uid", reason));
    }

    #[tokio::test]
    async fn test_ineligible_volumes_never_reach_the_driver() {
        let condition = VolumeCondition::abnormal("boom");
        let csi = Arc::new(FakeCsi::with_condition("handle-1", condition));
        let recorder = Arc::new(FakeRecorder::default());
        let checker = test_checker(csi.clone(), recorder.clone(), Arc::new(EventIndex::new()));

        let other_driver = with_driver(bound_pv(), "other.csi.io");
        let err = checker
            .check_controller_volume(&other_driver)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DriverMismatch { .. }));

        let pending = create_pv("pv1", "handle-1", "Pending", Some(("default", "pvc1")));
        let err = checker.check_controller_volume(&pending).await.unwrap_err();
        assert!(matches!(err, Error::NotBound { .. }));

        let empty = create_pv("pv1", "", VOLUME_BOUND, Some(("default", "pvc1")));
        let err = checker.check_controller_volume(&empty).await.unwrap_err();
        assert!(matches!(err, Error::EmptyVolumeHandle { .. }));
        assert!(err.is_precondition());

        let pod = create_pod("pod1", "default", "pod-uid", "node1", &["pvc1"]);
        let err = checker.check_node_volume(&empty, &pod).await.unwrap_err();
        assert!(err.is_precondition());

        assert_eq!(csi.calls(), 0);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_rpc_failure_is_inconclusive() {
        let csi = Arc::new(FakeCsi::default());
        csi.fail(true);
        let recorder = Arc::new(FakeRecorder::default());
        let checker = test_checker(csi.clone(), recorder.clone(), Arc::new(EventIndex::new()));

        let pv = bound_pv();
        let err = checker.check_controller_volume(&pv).await.unwrap_err();
        assert!(matches!(err, Error::Csi { .. }));
        assert!(!err.is_precondition());
        assert_eq!(csi.calls(), 1);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_driver_call_gets_its_own_deadline() {
        let csi = Arc::new(FakeCsi::with_condition(
            "handle-1",
            VolumeCondition::abnormal("Volume not found"),
        ));
        csi.delay(Duration::from_secs(60));
        let recorder = Arc::new(FakeRecorder::default());
        let checker = test_checker(csi.clone(), recorder.clone(), Arc::new(EventIndex::new()));

        let pv = bound_pv();
        for _ in 0..2 {
            let started = tokio::time::Instant::now();
            let err = checker.check_controller_volume(&pv).await.unwrap_err();
            assert!(matches!(err, Error::Timeout { .. }));
            assert_eq!(started.elapsed(), checker_config().timeout);
        }

        assert_eq!(csi.calls(), 2);
        assert!(recorder.events().is_empty());

        csi.delay(Duration::from_secs(1));
        checker.check_controller_volume(&pv).await.unwrap();
        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn test_node_check_reports_on_pod_with_kubelet_paths() {
        let csi = Arc::new(FakeCsi::with_condition(
            "handle-1",
            VolumeCondition::abnormal("stale mount"),
        ));
        let recorder = Arc::new(FakeRecorder::default());
        let checker = test_checker(csi.clone(), recorder.clone(), Arc::new(EventIndex::new()));
        let pod = create_pod("pod1", "default", "pod-uid", "node1", &["pvc1"]);

        checker.check_node_volume(&bound_pv(), &pod).await.unwrap();

        let requests = csi.node_requests();
        assert_eq!(
            requests,
            vec![(
                "handle-1".to_string(),
                "/var/lib/kubelet/pods/pod-uid/volumes/kubernetes.io~csi/pv1/mount".to_string(),
                "/var/lib/kubelet/plugins/kubernetes.io/csi/pv/pv1/globalmount".to_string(),
            )]
        );

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject_uid, "pod-uid");
        assert_eq!(events[0].message, "stale mount");
    }

    #[tokio::test]
    async fn test_batch_check_reports_listed_volumes_only() {
        let csi = Arc::new(FakeCsi::with_condition(
            "handle-1",
            VolumeCondition::abnormal("degraded"),
        ));
        let recorder = Arc::new(FakeRecorder::default());
        let checker = test_checker(csi.clone(), recorder.clone(), Arc::new(EventIndex::new()));

        let pv2 = create_pv("pv2", "handle-2", VOLUME_BOUND, Some(("default", "pvc2")));
        let pv3 = create_pv("pv3", "handle-3", "Released", Some(("default", "pvc3")));
        let volumes = vec![Arc::new(bound_pv()), Arc::new(pv2), Arc::new(pv3)];
        let reported = checker.check_controller_volumes(&volumes).await.unwrap();

        assert_eq!(reported, 1);
        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject_name, "pvc1");
    }

    #[tokio::test]
    async fn test_missing_claim_is_reported_without_event() {
        let condition = VolumeCondition::abnormal("x");
        let csi = Arc::new(FakeCsi::with_condition("handle-1", condition));
        let recorder = Arc::new(FakeRecorder::default());
        let events = Arc::new(EventIndex::new());
        let claims = cache(Vec::<PersistentVolumeClaim>::new());
        let checker = HealthChecker::new(
            csi.clone(),
            recorder.clone(),
            events,
            claims.as_reader(),
            checker_config(),
        );

        let pv = bound_pv();
        let err = checker.check_controller_volume(&pv).await.unwrap_err();
        assert!(matches!(err, Error::ClaimNotFound { .. }));
        assert_eq!(csi.calls(), 0);
        assert!(recorder.events().is_empty());
    }
}
