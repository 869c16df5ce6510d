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

use crate::cache::{EventIndex, PvcPodIndex};
use crate::checker::{CheckerConfig, HealthChecker};
use crate::config::{AgentArgs, CommonArgs, ControllerArgs};
use crate::context::{AGENT_REPORTER_PREFIX, CONTROLLER_REPORTER_PREFIX, KubeRecorder};
use crate::csi::GrpcClient;
use crate::informer::{Change, Informer};
use crate::reconcile::{
    CheckMode, NodeWatcher, NodeWatcherConfig, PodVolumeReconciler, PodVolumeReconcilerConfig,
    VolumeReconciler, VolumeReconcilerConfig, node, pod_volume, volume,
};
use crate::utils::paths::DEFAULT_KUBELET_ROOT;
use k8s_openapi::api::core::v1 as corev1;
use kube::Client;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use snafu::{ResultExt, Snafu, ensure};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub mod cache;
pub mod checker;
pub mod config;
pub mod context;
pub mod csi;
pub mod informer;
pub mod reconcile;
pub mod types;
pub mod utils;


shadow_rs::shadow!(build);

const MARK_ATTEMPTS: usize = 3;
const MARK_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Config { source: config::Error },

    #[snafu(transparent)]
    Csi { source: csi::Error },

    #[snafu(display("driver does not support {}", capability))]
    MissingCapability { capability: &'static str },

    #[snafu(display("failed to load kubeconfig: {}", source))]
    Kubeconfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("Kubernetes API error: {}", source))]
    Kube { source: kube::Error },
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();
}

async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let Some(path) = kubeconfig else {
        return Client::try_default().await.context(KubeSnafu);
    };

    let kubeconfig = Kubeconfig::read_from(path).context(KubeconfigSnafu)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context(KubeconfigSnafu)?;
    Client::try_from(config).context(KubeSnafu)
}

/// Token cancelled on Ctrl-C or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        trigger.cancel();
    });

    token
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

async fn connect_driver(common: &CommonArgs) -> Result<(Arc<GrpcClient>, String), Error> {
    let csi = GrpcClient::connect(&common.csi_address).await?;
    let driver = csi.driver_name().await?;
    info!(driver = %driver, address = %common.csi_address, "connected to csi driver");
    Ok((Arc::new(csi), driver))
}

fn watch<K, F>(
    informer: Informer<K>,
    api: Api<K>,
    config: watcher::Config,
    token: &CancellationToken,
    handler: F,
) -> JoinHandle<()>
where
    K: kube::Resource
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone + Default,
    F: FnMut(Change<K>) + Send + 'static,
{
    tokio::spawn(informer.run(api, config, token.clone(), handler))
}

/// Runs the cluster wide monitor until a shutdown signal arrives.
pub async fn run_controller(args: ControllerArgs) -> Result<(), Error> {
    args.validate()?;
    info!(
        version = build::PKG_VERSION,
        commit = build::SHORT_COMMIT,
        "starting volume health controller"
    );

    let (csi, driver) = connect_driver(&args.common).await?;
    let caps = csi.controller_capabilities().await?;
    ensure!(
        caps.controller_service,
        MissingCapabilitySnafu {
            capability: "CONTROLLER_SERVICE"
        }
    );
    ensure!(
        caps.controller_volume_condition,
        MissingCapabilitySnafu {
            capability: "controller VOLUME_CONDITION"
        }
    );
    ensure!(
        caps.supports_controller_monitoring(),
        MissingCapabilitySnafu {
            capability: "LIST_VOLUMES or GET_VOLUME"
        }
    );
    let mode = CheckMode::from_capabilities(&caps);

    let client = kube_client(args.common.kubeconfig.as_deref()).await?;
    let token = shutdown_token();

    let recorder = Arc::new(KubeRecorder::new(
        client.clone(),
        CONTROLLER_REPORTER_PREFIX,
        &driver,
    ));
    let events = Arc::new(EventIndex::new());

    let pvc_informer = Informer::<corev1::PersistentVolumeClaim>::new();
    let claims = pvc_informer.store();

    let checker = Arc::new(HealthChecker::new(
        csi,
        recorder.clone(),
        events.clone(),
        claims.clone(),
        CheckerConfig {
            driver: driver.clone(),
            timeout: *args.common.timeout,
            kubelet_root: PathBuf::from(DEFAULT_KUBELET_ROOT),
            stage_unstage: false,
        },
    ));
    let config = VolumeReconcilerConfig {
        workers: args.common.worker_threads,
        monitor_interval: *args.common.monitor_interval,
        list_volumes_interval: *args.list_volumes_interval,
        volume_list_add_interval: *args.volume_list_add_interval,
    };
    let reconciler = Arc::new(VolumeReconciler::new(checker, config.clone()));

    let mut tasks = vec![
        watch(
            pvc_informer,
            Api::all(client.clone()),
            watcher::Config::default(),
            &token,
            |_| {},
        ),
        watch(
            Informer::<corev1::Event>::new(),
            Api::all(client.clone()),
            watcher::Config::default().fields("involvedObject.kind=PersistentVolumeClaim"),
            &token,
            {
                let events = events.clone();
                move |change| events.apply(&change)
            },
        ),
    ];

    info!(mode = ?mode, "volume check mode selected");
    let volumes = match mode {
        CheckMode::PerVolume => {
            let controller = volume::controller(Api::all(client.clone()), &config);
            let volumes = controller.store();
            tasks.push(tokio::spawn(reconciler.run(controller, token.clone())));
            volumes
        }
        CheckMode::Batch => {
            let pv_informer = Informer::<corev1::PersistentVolume>::new();
            let volumes = pv_informer.store();
            tasks.push(watch(
                pv_informer,
                Api::all(client.clone()),
                watcher::Config::default(),
                &token,
                |_| {},
            ));
            tasks.push(tokio::spawn(
                reconciler.run_batch(volumes.clone(), token.clone()),
            ));
            volumes
        }
    };

    if args.enable_node_watcher {
        let pods = Arc::new(PvcPodIndex::new());
        let config = NodeWatcherConfig {
            driver: driver.clone(),
            not_ready_threshold: *args.node_not_ready_threshold,
            monitor_interval: *args.common.monitor_interval,
            node_list_add_interval: *args.node_list_add_interval,
            mark_attempts: MARK_ATTEMPTS,
            retry_delay: MARK_RETRY_DELAY,
        };
        let controller = node::controller(Api::all(client.clone()), &config);
        let node_watcher = Arc::new(NodeWatcher::new(
            recorder,
            volumes,
            claims,
            pods.clone(),
            config,
        ));

        tasks.push(watch(
            Informer::<corev1::Pod>::new(),
            Api::all(client.clone()),
            watcher::Config::default(),
            &token,
            move |change| match change {
                Change::Added(pod) => pods.add_pod(&pod),
                Change::Updated { old, new } => pods.update_pod(&old, &new),
                Change::Deleted(pod) => pods.remove_pod(&pod),
            },
        ));
        tasks.push(tokio::spawn(node_watcher.run(controller, token.clone())));
    }

    futures::future::join_all(tasks).await;
    info!("volume health controller stopped");
    Ok(())
}

/// Runs the per-node monitor until a shutdown signal arrives.
pub async fn run_agent(args: AgentArgs) -> Result<(), Error> {
    args.validate()?;
    info!(
        version = build::PKG_VERSION,
        commit = build::SHORT_COMMIT,
        node = %args.node_name,
        "starting volume health agent"
    );

    let (csi, driver) = connect_driver(&args.common).await?;
    let caps = csi.node_capabilities().await?;
    ensure!(
        caps.supports_node_monitoring(),
        MissingCapabilitySnafu {
            capability: "node VOLUME_CONDITION"
        }
    );

    let client = kube_client(args.common.kubeconfig.as_deref()).await?;
    let token = shutdown_token();

    let recorder = Arc::new(KubeRecorder::new(
        client.clone(),
        AGENT_REPORTER_PREFIX,
        &driver,
    ));
    let events = Arc::new(EventIndex::new());

    let pv_informer = Informer::<corev1::PersistentVolume>::new();
    let pvc_informer = Informer::<corev1::PersistentVolumeClaim>::new();
    let claims = pvc_informer.store();

    let checker = Arc::new(HealthChecker::new(
        csi,
        recorder,
        events.clone(),
        claims.clone(),
        CheckerConfig {
            driver,
            timeout: *args.common.timeout,
            kubelet_root: args.kubelet_root_path.clone(),
            stage_unstage: caps.stage_unstage,
        },
    ));
    let config = PodVolumeReconcilerConfig {
        workers: args.common.worker_threads,
        monitor_interval: *args.common.monitor_interval,
    };
    let controller = pod_volume::controller(Api::all(client.clone()), &args.node_name, &config);
    let reconciler = Arc::new(PodVolumeReconciler::new(
        checker,
        pv_informer.store(),
        claims,
        config,
    ));

    let tasks = vec![
        watch(
            pv_informer,
            Api::all(client.clone()),
            watcher::Config::default(),
            &token,
            |_| {},
        ),
        watch(
            pvc_informer,
            Api::all(client.clone()),
            watcher::Config::default(),
            &token,
            |_| {},
        ),
        watch(
            Informer::<corev1::Event>::new(),
            Api::all(client.clone()),
            watcher::Config::default().fields("involvedObject.kind=Pod"),
            &token,
            move |change| events.apply(&change),
        ),
        tokio::spawn(reconciler.run(controller, token.clone())),
    ];

    futures::future::join_all(tasks).await;
    info!("volume health agent stopped");
    Ok(())
}
