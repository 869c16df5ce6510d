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

use crate::types::condition::VolumeCondition;
use snafu::Snafu;
use std::collections::HashMap;
use std::future::Future;

pub mod grpc;
pub mod proto;

pub use grpc::GrpcClient;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid csi address '{}': {}", address, source))]
    InvalidAddress {
        address: String,
        source: tonic::transport::Error,
    },

    #[snafu(display("cannot connect to csi driver at '{}': {}", address, source))]
    Connect {
        address: String,
        source: tonic::transport::Error,
    },

    #[snafu(display("csi driver is not ready: {}", source))]
    NotReady { source: tonic::transport::Error },

    #[snafu(display("{} failed: {}", method, source))]
    Rpc {
        method: &'static str,
        source: tonic::Status,
    },

    #[snafu(display("{} returned no volume condition", method))]
    MissingCondition { method: &'static str },
}

/// Health-check RPC surface of a storage driver.
///
/// Transport errors and driver failures surface as `Err`; callers treat them
/// as inconclusive and retry on their own cadence.
pub trait CsiClient: Send + Sync + 'static {
    /// Conditions of every volume known to the driver, keyed by volume handle.
    fn list_volume_conditions(
        &self,
    ) -> impl Future<Output = Result<HashMap<String, VolumeCondition>, Error>> + Send;

    fn controller_volume_condition(
        &self,
        volume_handle: &str,
    ) -> impl Future<Output = Result<VolumeCondition, Error>> + Send;

    /// `staging_path` is empty when the driver has no stage/unstage step.
    fn node_volume_condition(
        &self,
        volume_handle: &str,
        volume_path: &str,
        staging_path: &str,
    ) -> impl Future<Output = Result<VolumeCondition, Error>> + Send;
}

/// Capabilities resolved once at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub controller_service: bool,
    pub list_volumes: bool,
    pub get_volume: bool,
    pub controller_volume_condition: bool,
    pub node_volume_condition: bool,
    pub stage_unstage: bool,
}

impl DriverCapabilities {
    /// Whether the controller side can monitor volumes at all.
    pub fn supports_controller_monitoring(&self) -> bool {
        self.controller_service
            && (self.list_volumes || self.get_volume)
            && self.controller_volume_condition
    }

    pub fn supports_node_monitoring(&self) -> bool {
        self.node_volume_condition
    }
}

impl From<proto::VolumeCondition> for VolumeCondition {
    fn from(c: proto::VolumeCondition) -> Self {
        Self {
            abnormal: c.abnormal,
            message: c.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_monitoring_requires_condition_and_a_read_rpc() {
        let mut caps = DriverCapabilities {
            controller_service: true,
            controller_volume_condition: true,
            ..Default::default()
        };
        assert!(!caps.supports_controller_monitoring());

        caps.get_volume = true;
        assert!(caps.supports_controller_monitoring());

        caps.controller_volume_condition = false;
        assert!(!caps.supports_controller_monitoring());
    }

    #[test]
    fn test_controller_monitoring_requires_controller_service() {
        let caps = DriverCapabilities {
            list_volumes: true,
            controller_volume_condition: true,
            ..Default::default()
        };
        assert!(!caps.supports_controller_monitoring());
    }
}
