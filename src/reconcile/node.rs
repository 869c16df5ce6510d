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

use crate::cache::PvcPodIndex;
use crate::context::{self, EventRecorder};
use crate::types::condition::{Reason, Severity};
use crate::types::object::{ClaimKey, NodeExt, PersistentVolumeExt, PodExt};
use crate::utils::lock;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, Resource, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_NOT_READY_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("claim {} not found", claim))]
    ClaimNotFound { claim: ClaimKey },

    #[snafu(display("failed to notify claim {}: {}", claim, source))]
    Notify {
        claim: ClaimKey,
        source: context::Error,
    },
}

/// What the watcher has to do after observing a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeAction {
    Nothing,
    MarkFailed,
    NotifyRecovered,
}

/// Per-node failure bookkeeping.
///
/// A node not ready for longer than the threshold, terminated, or deleted is
/// broken. Not-ready nodes are only re-evaluated when observed again, so the
/// monitor interval bounds how late a node is declared broken.
#[derive(Debug)]
pub struct NodeTracker {
    threshold: Duration,
    first_not_ready: HashMap<String, Instant>,
    marked_down: HashSet<String>,
}

impl NodeTracker {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            first_not_ready: HashMap::new(),
            marked_down: HashSet::new(),
        }
    }

    pub fn observe(&mut self, node: &Node, now: Instant) -> NodeAction {
        let name = node.name_any();

        if node.is_ready() {
            self.first_not_ready.remove(&name);
            return if self.marked_down.contains(&name) {
                NodeAction::NotifyRecovered
            } else {
                NodeAction::Nothing
            };
        }

        if node.is_terminated() {
            return NodeAction::MarkFailed;
        }

        match self.first_not_ready.get(&name) {
            Some(since) if now.saturating_duration_since(*since) > self.threshold => {
                NodeAction::MarkFailed
            }
            Some(_) => NodeAction::Nothing,
            None => {
                self.first_not_ready.insert(name, now);
                NodeAction::Nothing
            }
        }
    }

    /// Records a successful failure marking.
    pub fn marked(&mut self, node: &str) {
        self.first_not_ready.remove(node);
        self.marked_down.insert(node.to_string());
    }

    /// Records a successful recovery notification.
    pub fn recovered(&mut self, node: &str) {
        self.marked_down.remove(node);
    }

    /// Forgets a deleted node after its claims were marked.
    pub fn forget(&mut self, node: &str) {
        self.first_not_ready.remove(node);
        self.marked_down.remove(node);
    }

    pub fn is_marked_down(&self, node: &str) -> bool {
        self.marked_down.contains(node)
    }

    pub fn is_pending(&self, node: &str) -> bool {
        self.first_not_ready.contains_key(node)
    }
}

#[derive(Clone, Debug)]
pub struct NodeWatcherConfig {
    pub driver: String,
    pub not_ready_threshold: Duration,
    /// Gap between two checks of the same node.
    pub monitor_interval: Duration,
    pub node_list_add_interval: Duration,
    /// Attempts at marking a node in one go.
    pub mark_attempts: usize,
    /// Pause between attempts, also the delay before a failed node is retried.
    pub retry_delay: Duration,
}

pub type ReconcileError = controller::Error<Error, watcher::Error>;

/// Reports claims whose consumers sit on a failed node.
pub struct NodeWatcher<R> {
    recorder: Arc<R>,
    volumes: Store<PersistentVolume>,
    claims: Store<PersistentVolumeClaim>,
    pods: Arc<PvcPodIndex>,
    tracker: Mutex<NodeTracker>,
    config: NodeWatcherConfig,
}

impl<R: EventRecorder> NodeWatcher<R> {
    pub fn new(
        recorder: Arc<R>,
        volumes: Store<PersistentVolume>,
        claims: Store<PersistentVolumeClaim>,
        pods: Arc<PvcPodIndex>,
        config: NodeWatcherConfig,
    ) -> Self {
        Self {
            recorder,
            volumes,
            claims,
            pods,
            tracker: Mutex::new(NodeTracker::new(config.not_ready_threshold)),
            config,
        }
    }

    async fn process(&self, node: &Node, now: Instant) -> Result<(), Error> {
        let name = node.name_any();
        let action = lock(&self.tracker).observe(node, now);
        match action {
            NodeAction::Nothing => {}
            NodeAction::MarkFailed => {
                info!(node = %name, "node is broken");
                self.mark_with_retry(&name).await?;
                lock(&self.tracker).marked(&name);
            }
            NodeAction::NotifyRecovered => {
                self.notify_recovered(&name).await?;
                lock(&self.tracker).recovered(&name);
            }
        }
        Ok(())
    }

    /// Marks the claims on `node`, retrying up to `mark_attempts` times.
    async fn mark_with_retry(&self, node: &str) -> Result<(), Error> {
        let attempts = self.config.mark_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.mark_failed(node).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => warn!(node = %node, attempt, "mark volumes on failed node failed: {}", e),
            }
            attempt += 1;
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Marks the claims on a deleted node until it succeeds, then forgets
    /// the node.
    pub async fn handle_deleted(self: Arc<Self>, node: String, token: CancellationToken) {
        loop {
            match self.mark_with_retry(&node).await {
                Ok(()) => {
                    lock(&self.tracker).forget(&node);
                    debug!(node = %node, "deleted node handled");
                    return;
                }
                Err(e) => error!(node = %node, "mark volumes on deleted node failed: {}", e),
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }
    }

    pub fn handle_result(
        self: &Arc<Self>,
        result: Result<(ObjectRef<Node>, Action), ReconcileError>,
        token: &CancellationToken,
    ) {
        match result {
            Ok((node, _)) => debug!(node = %node.name, "node reconciled"),
            Err(controller::Error::ObjectNotFound(node)) => {
                info!(node = %node.name, "node is deleted, mark the volumes on it");
                tokio::spawn(self.clone().handle_deleted(node.name, token.clone()));
            }
            Err(controller::Error::ReconcilerFailed(e, node)) => {
                error!(node = %node.name, "check node failed: {}", e)
            }
            Err(e) => warn!("node reconcile failed: {}", e),
        }
    }

    /// Claims of the driver with at least one consumer on `node`, with the
    /// names of those consumers.
    fn affected_claims(
        &self,
        node: &str,
    ) -> Result<Vec<(Arc<PersistentVolumeClaim>, Vec<String>)>, Error> {
        let mut affected = Vec::new();

        for pv in self.volumes.state() {
            if !pv.is_managed_by(&self.config.driver) || !pv.is_bound() {
                continue;
            }
            let Some(claim) = pv.claim() else {
                continue;
            };

            let mut pods: Vec<String> = self
                .pods
                .lookup(&claim)
                .iter()
                .filter(|pod| pod.node_name() == Some(node))
                .map(|pod| pod.name_any())
                .collect();
            if pods.is_empty() {
                continue;
            }
            pods.sort();

            let pvc = self
                .claims
                .get(&ObjectRef::new(&claim.name).within(&claim.namespace))
                .context(ClaimNotFoundSnafu { claim })?;
            affected.push((pvc, pods));
        }

        Ok(affected)
    }

    async fn mark_failed(&self, node: &str) -> Result<(), Error> {
        for (pvc, pods) in self.affected_claims(node)? {
            let message = format!(
                "Pods: [ {} ] consuming PVC: {} in namespace: {} are now on a failed node: {}",
                pods.join(" "),
                pvc.name_any(),
                pvc.namespace().unwrap_or_default(),
                node
            );
            self.publish(&pvc, Severity::Warning, Reason::NodeFailed, &message)
                .await?;
        }
        Ok(())
    }

    async fn notify_recovered(&self, node: &str) -> Result<(), Error> {
        let message = format!("Node: {node} recovered");
        for (pvc, _) in self.affected_claims(node)? {
            self.publish(&pvc, Severity::Normal, Reason::NodeRecovered, &message)
                .await?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        pvc: &PersistentVolumeClaim,
        severity: Severity,
        reason: Reason,
        message: &str,
    ) -> Result<(), Error> {
        let claim = ClaimKey::new(pvc.namespace().unwrap_or_default(), pvc.name_any());
        self.recorder
            .publish(&pvc.object_ref(&()), severity, reason, message)
            .await
            .context(NotifySnafu { claim })
    }

    /// Runs the node controller until `token` is cancelled.
    pub async fn run(self: Arc<Self>, nodes: Controller<Node>, token: CancellationToken) {
        if let Err(e) = self.volumes.wait_until_ready().await {
            error!("volume cache never became ready: {}", e);
            return;
        }
        if let Err(e) = self.claims.wait_until_ready().await {
            error!("claim cache never became ready: {}", e);
            return;
        }

        info!("node watcher started");
        nodes
            .graceful_shutdown_on(token.clone().cancelled_owned())
            .run(reconcile_node, error_policy, self.clone())
            .for_each(|result| {
                self.handle_result(result, &token);
                futures::future::ready(())
            })
            .await;
        info!("node watcher stopped");
    }
}

/// Controller over every Node, one node at a time, resynced on
/// `node_list_add_interval`.
pub fn controller(api: Api<Node>, config: &NodeWatcherConfig) -> Controller<Node> {
    let period = config.node_list_add_interval;
    let resync = tokio::time::interval_at(Instant::now() + period, period);

    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(1))
        .reconcile_all_on(IntervalStream::new(resync).map(|_| ()))
}

pub async fn reconcile_node<R: EventRecorder>(
    node: Arc<Node>,
    ctx: Arc<NodeWatcher<R>>,
) -> Result<Action, Error> {
    ctx.process(&node, Instant::now()).await?;
    Ok(Action::requeue(ctx.config.monitor_interval))
}

/// A node whose claims could not be marked keeps its tracking state and is
/// retried after `retry_delay`.
pub fn error_policy<R: EventRecorder>(
    _node: Arc<Node>,
    _error: &Error,
    ctx: Arc<NodeWatcher<R>>,
) -> Action {
    Action::requeue(ctx.config.retry_delay)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tests::{
        DRIVER_NAME, FakeRecorder, cache, create_node, create_pod, create_pv, create_pvc,
    };
    use crate::types::object::VOLUME_BOUND;

    const THRESHOLD: Duration = DEFAULT_NOT_READY_THRESHOLD;
    const MONITOR_INTERVAL: Duration = Duration::from_secs(60);
    const RETRY_DELAY: Duration = Duration::from_secs(1);

    #[test]
    fn test_threshold_boundary() {
        let mut tracker = NodeTracker::new(THRESHOLD);
        let node = create_node("node1", false);
        let t0 = Instant::now();

        assert_eq!(tracker.observe(&node, t0), NodeAction::Nothing);
        assert!(tracker.is_pending("node1"));
        assert_eq!(
            tracker.observe(&node, t0 + THRESHOLD - Duration::from_secs(1)),
            NodeAction::Nothing
        );
        assert_eq!(
            tracker.observe(&node, t0 + THRESHOLD + Duration::from_secs(1)),
            NodeAction::MarkFailed
        );
    }

    #[test]
    fn test_ready_clears_pending_and_recovers_marked_nodes() {
        let mut tracker = NodeTracker::new(THRESHOLD);
        let t0 = Instant::now();
        tracker.observe(&create_node("node1", false), t0);

        let ready = create_node("node1", true);
        assert_eq!(tracker.observe(&ready, t0), NodeAction::Nothing);
        assert!(!tracker.is_pending("node1"));

        tracker.marked("node1");
        assert_eq!(tracker.observe(&ready, t0), NodeAction::NotifyRecovered);
        // stays eligible until the notification succeeded
        assert_eq!(tracker.observe(&ready, t0), NodeAction::NotifyRecovered);
        tracker.recovered("node1");
        assert_eq!(tracker.observe(&ready, t0), NodeAction::Nothing);
    }

    #[test]
    fn test_terminated_node_is_broken_immediately() {
        let mut tracker = NodeTracker::new(THRESHOLD);
        let mut node = create_node("node1", false);
        node.status.as_mut().unwrap().phase = Some("Terminated".into());

        let action = tracker.observe(&node, Instant::now());
        assert_eq!(action, NodeAction::MarkFailed);
    }

    struct Fixture {
        recorder: Arc<FakeRecorder>,
        watcher: Arc<NodeWatcher<FakeRecorder>>,
    }

    fn fixture() -> Fixture {
        let volumes = cache(vec![
            create_pv("pv1", "handle-1", VOLUME_BOUND, Some(("default", "pvc1"))),
            create_pv("pv2", "handle-2", VOLUME_BOUND, Some(("default", "pvc2"))),
        ]);
        let claims = cache(vec![
            create_pvc("pvc1", "default", "pvc1-uid", "pv1", "Bound"),
            create_pvc("pvc2", "default", "pvc2-uid", "pv2", "Bound"),
        ]);
        let pods = Arc::new(PvcPodIndex::new());
        for (name, uid, node, claim) in [
            ("app-0", "uid-a", "node1", "pvc1"),
            ("app-1", "uid-b", "node2", "pvc2"),
        ] {
            pods.add_pod(&Arc::new(create_pod(name, "default", uid, node, &[claim])));
        }

        let recorder = Arc::new(FakeRecorder::default());
        let watcher = NodeWatcher::new(
            recorder.clone(),
            volumes.as_reader(),
            claims.as_reader(),
            pods,
            NodeWatcherConfig {
                driver: DRIVER_NAME.to_string(),
                not_ready_threshold: THRESHOLD,
                monitor_interval: MONITOR_INTERVAL,
                node_list_add_interval: THRESHOLD,
                mark_attempts: 2,
                retry_delay: RETRY_DELAY,
            },
        );

        Fixture {
            recorder,
            watcher: Arc::new(watcher),
        }
    }

    #[tokio::test]
    async fn test_node_failure_and_recovery() {
        let f = fixture();
        let down = create_node("node1", false);
        let t0 = Instant::now();

        f.watcher.process(&down, t0).await.unwrap();
        assert!(f.recorder.events().is_empty());

        let later = t0 + Duration::from_secs(6 * 60);
        f.watcher.process(&down, later).await.unwrap();
        let events = f.recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Warning);
        assert_eq!(events[0].reason, Reason::NodeFailed);
        assert_eq!(events[0].subject_name, "pvc1");
        assert_eq!(
            events[0].message,
            "Pods: [ app-0 ] consuming PVC: pvc1 in namespace: default are now on a failed node: node1"
        );
        assert!(lock(&f.watcher.tracker).is_marked_down("node1"));

        let up = create_node("node1", true);
        let later = t0 + Duration::from_secs(7 * 60);
        f.watcher.process(&up, later).await.unwrap();

        let events = f.recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].severity, Severity::Normal);
        assert_eq!(events[1].reason, Reason::NodeRecovered);
        assert_eq!(events[1].subject_name, "pvc1");
        assert_eq!(events[1].message, "Node: node1 recovered");
        assert!(!lock(&f.watcher.tracker).is_marked_down("node1"));
    }

    #[tokio::test]
    async fn test_node_is_checked_again_after_the_monitor_interval() {
        let f = fixture();
        let node = Arc::new(create_node("node1", true));

        let action = reconcile_node(node, f.watcher.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(MONITOR_INTERVAL));
    }

    #[tokio::test]
    async fn test_deleted_node_is_marked_without_waiting() {
        let f = fixture();
        let token = CancellationToken::new();
        let node = create_node("node1", false);
        f.watcher.process(&node, Instant::now()).await.unwrap();

        let node1 = ObjectRef::<Node>::new("node1").erase();
        let gone = Err(controller::Error::ObjectNotFound(node1));
        f.watcher.handle_result(gone, &token);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = f.recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, Reason::NodeFailed);
        assert!(!lock(&f.watcher.tracker).is_pending("node1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_node_is_retried_until_marked() {
        let f = fixture();
        let token = CancellationToken::new();
        f.recorder.fail(true);

        let handle = tokio::spawn(f.watcher.clone().handle_deleted("node1".into(), token));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(f.recorder.events().is_empty());

        f.recorder.fail(false);
        handle.await.unwrap();
        assert_eq!(f.recorder.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_node_retries_stop_on_cancel() {
        let f = fixture();
        let token = CancellationToken::new();
        f.recorder.fail(true);

        let watcher = f.watcher.clone();
        let handle = tokio::spawn(watcher.handle_deleted("node1".into(), token.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(f.recorder.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_marking_failure_is_retried_and_keeps_state() {
        let f = fixture();
        let node = Arc::new(create_node("node1", false));
        let t0 = Instant::now();
        f.watcher.process(&node, t0).await.unwrap();

        f.recorder.fail(true);
        let later = t0 + Duration::from_secs(6 * 60);
        let err = f.watcher.process(&node, later).await.unwrap_err();
        assert!(matches!(err, Error::Notify { .. }));
        assert!(f.recorder.events().is_empty());
        assert!(!lock(&f.watcher.tracker).is_marked_down("node1"));
        assert!(lock(&f.watcher.tracker).is_pending("node1"));

        let action = error_policy(node.clone(), &err, f.watcher.clone());
        assert_eq!(action, Action::requeue(RETRY_DELAY));

        f.recorder.fail(false);
        let later = t0 + Duration::from_secs(7 * 60);
        f.watcher.process(&node, later).await.unwrap();
        assert_eq!(f.recorder.events().len(), 1);
        assert!(lock(&f.watcher.tracker).is_marked_down("node1"));
    }
}
