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

//! Command line configuration of the controller and the agent.

use crate::utils::paths::DEFAULT_KUBELET_ROOT;
use clap::Args;
use snafu::{Snafu, ensure};
use std::path::PathBuf;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("--worker-threads must be greater than zero"))]
    NoWorkers,

    #[snafu(display("node name is required, set --node-name or NODE_NAME"))]
    MissingNodeName,
}

/// Flags shared by both deployment shapes.
#[derive(Args, Clone, Debug)]
pub struct CommonArgs {
    /// CSI endpoint, a unix socket path or an http:// URL.
    #[arg(long, default_value = "/run/csi/socket")]
    pub csi_address: String,

    /// Deadline of every CSI call.
    #[arg(long, default_value = "15s")]
    pub timeout: humantime::Duration,

    /// Gap between two checks of the same volume or node.
    #[arg(long, default_value = "1m")]
    pub monitor_interval: humantime::Duration,

    /// Volumes or pods checked concurrently.
    #[arg(long, default_value_t = 10)]
    pub worker_threads: u16,

    /// Kubeconfig to use instead of the in-cluster or default config.
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
}

impl CommonArgs {
    pub fn validate(&self) -> Result<(), Error> {
        ensure!(self.worker_threads > 0, NoWorkersSnafu);
        Ok(())
    }
}

#[derive(Args, Clone, Debug)]
pub struct ControllerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Interval of the ListVolumes sweep on drivers supporting it.
    #[arg(long, default_value = "5m")]
    pub list_volumes_interval: humantime::Duration,

    /// Interval at which every known volume is reconciled again.
    #[arg(long, default_value = "5m")]
    pub volume_list_add_interval: humantime::Duration,

    /// Interval at which every known node is reconciled again.
    #[arg(long, default_value = "5m")]
    pub node_list_add_interval: humantime::Duration,

    /// How long a node may stay not ready before its volumes are marked.
    #[arg(long, default_value = "5m")]
    pub node_not_ready_threshold: humantime::Duration,

    /// Report claims used by pods on failed nodes.
    #[arg(long, default_value_t = false)]
    pub enable_node_watcher: bool,
}

impl ControllerArgs {
    pub fn validate(&self) -> Result<(), Error> {
        self.common.validate()
    }
}

#[derive(Args, Clone, Debug)]
pub struct AgentArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, default_value = DEFAULT_KUBELET_ROOT)]
    pub kubelet_root_path: PathBuf,

    /// Node this agent runs on.
    #[arg(long, env = "NODE_NAME", default_value = "")]
    pub node_name: String,
}

impl AgentArgs {
    pub fn validate(&self) -> Result<(), Error> {
        self.common.validate()?;
        ensure!(!self.node_name.trim().is_empty(), MissingNodeNameSnafu);
        Ok(())
    }
}
