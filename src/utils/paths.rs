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

//! Kubelet directory layout used by node-side volume checks.

use snafu::{Snafu, ensure};
use std::path::{Path, PathBuf};

pub const CSI_PLUGIN_NAME: &str = "kubernetes.io/csi";
pub const DEFAULT_KUBELET_ROOT: &str = "/var/lib/kubelet";

const PLUGINS_DIR: &str = "plugins";
const PODS_DIR: &str = "pods";
const VOLUMES_DIR: &str = "volumes";
const VOLUME_DEVICES_DIR: &str = "volumeDevices";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cannot build staging path: volume name is empty"))]
    EmptyVolumeName,
}

/// Escapes a qualified name for use as a single path segment.
pub fn escape_qualified_name(name: &str) -> String {
    name.replace('/', "~")
}

/// Path the kubelet publishes the volume at for one pod.
pub fn volume_path(root: &Path, pod_uid: &str, pv_name: &str, is_block: bool) -> PathBuf {
    let pod_dir = root.join(PODS_DIR).join(pod_uid);
    let plugin = escape_qualified_name(CSI_PLUGIN_NAME);
    let volume = escape_qualified_name(pv_name);

    if is_block {
        pod_dir.join(VOLUME_DEVICES_DIR).join(plugin).join(volume)
    } else {
        pod_dir
            .join(VOLUMES_DIR)
            .join(plugin)
            .join(volume)
            .join("mount")
    }
}

/// Global staging path of a volume on drivers with a stage/unstage step.
pub fn staging_path(root: &Path, pv_name: &str) -> Result<PathBuf, Error> {
    ensure!(!pv_name.is_empty(), EmptyVolumeNameSnafu);

    Ok(root
        .join(PLUGINS_DIR)
        .join(CSI_PLUGIN_NAME)
        .join("pv")
        .join(pv_name)
        .join("globalmount"))
}
