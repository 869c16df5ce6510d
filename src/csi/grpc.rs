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

use super::proto;
use super::proto::controller_service_capability::rpc::Type as ControllerRpc;
use super::proto::node_service_capability::rpc::Type as NodeRpc;
use super::proto::plugin_capability::service::Type as PluginService;
use super::{
    ConnectSnafu, CsiClient, DriverCapabilities, Error, InvalidAddressSnafu,
    MissingConditionSnafu, NotReadySnafu, RpcSnafu,
};
use crate::types::condition::VolumeCondition;
use http::Uri;
use http::uri::PathAndQuery;
use hyper_util::rt::TokioIo;
use snafu::{OptionExt, ResultExt};
use std::collections::HashMap;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint};
use tower::service_fn;
use tracing::debug;

/// CSI client speaking gRPC over a unix socket or a plain http endpoint.
#[derive(Clone, Debug)]
pub struct GrpcClient {
    channel: Channel,
}

impl GrpcClient {
    /// Connects to `address`, which is either a socket path (optionally
    /// prefixed with `unix://`) or an `http://` URL.
    pub async fn connect(address: &str) -> Result<Self, Error> {
        if address.starts_with("http://") || address.starts_with("https://") {
            let channel = Endpoint::from_shared(address.to_owned())
                .context(InvalidAddressSnafu { address })?
                .connect()
                .await
                .context(ConnectSnafu { address })?;
            return Ok(Self { channel });
        }

        let path = address
            .strip_prefix("unix://")
            .unwrap_or(address)
            .to_owned();

        // the authority is ignored, every connection goes to the socket
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
                }
            }))
            .await
            .context(ConnectSnafu { address })?;

        debug!(%address, "connected to csi driver");
        Ok(Self { channel })
    }

    async fn unary<Req, Resp>(&self, method: &'static str, request: Req) -> Result<Resp, Error>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.context(NotReadySnafu)?;

        let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(method),
                codec,
            )
            .await
            .context(RpcSnafu { method })?;

        Ok(response.into_inner())
    }

    pub async fn driver_name(&self) -> Result<String, Error> {
        let info: proto::GetPluginInfoResponse = self
            .unary(proto::GET_PLUGIN_INFO, proto::GetPluginInfoRequest {})
            .await?;
        Ok(info.name)
    }

    /// Plugin and controller service capabilities.
    pub async fn controller_capabilities(&self) -> Result<DriverCapabilities, Error> {
        let plugin: proto::GetPluginCapabilitiesResponse = self
            .unary(
                proto::GET_PLUGIN_CAPABILITIES,
                proto::GetPluginCapabilitiesRequest {},
            )
            .await?;

        let controller_service = plugin.capabilities.iter().any(|cap| {
            matches!(
                &cap.r#type,
                Some(proto::plugin_capability::Type::Service(s))
                    if s.r#type == PluginService::ControllerService as i32
            )
        });

        let mut caps = DriverCapabilities {
            controller_service,
            ..Default::default()
        };
        if !controller_service {
            return Ok(caps);
        }

        let controller: proto::ControllerGetCapabilitiesResponse = self
            .unary(
                proto::CONTROLLER_GET_CAPABILITIES,
                proto::ControllerGetCapabilitiesRequest {},
            )
            .await?;

        for cap in &controller.capabilities {
            let Some(proto::controller_service_capability::Type::Rpc(rpc)) = &cap.r#type else {
                continue;
            };
            match ControllerRpc::try_from(rpc.r#type) {
                Ok(ControllerRpc::ListVolumes) => caps.list_volumes = true,
                Ok(ControllerRpc::GetVolume) => caps.get_volume = true,
                Ok(ControllerRpc::VolumeCondition) => caps.controller_volume_condition = true,
                _ => {}
            }
        }

        Ok(caps)
    }

    pub async fn node_capabilities(&self) -> Result<DriverCapabilities, Error> {
        let node: proto::NodeGetCapabilitiesResponse = self
            .unary(
                proto::NODE_GET_CAPABILITIES,
                proto::NodeGetCapabilitiesRequest {},
            )
            .await?;

        let mut caps = DriverCapabilities::default();
        for cap in &node.capabilities {
            let Some(proto::node_service_capability::Type::Rpc(rpc)) = &cap.r#type else {
                continue;
            };
            match NodeRpc::try_from(rpc.r#type) {
                Ok(NodeRpc::StageUnstageVolume) => caps.stage_unstage = true,
                Ok(NodeRpc::VolumeCondition) => caps.node_volume_condition = true,
                _ => {}
            }
        }

        Ok(caps)
    }
}

impl CsiClient for GrpcClient {
    async fn list_volume_conditions(&self) -> Result<HashMap<String, VolumeCondition>, Error> {
        let mut conditions = HashMap::new();
        let mut token = String::new();

        loop {
            let page: proto::ListVolumesResponse = self
                .unary(
                    proto::LIST_VOLUMES,
                    proto::ListVolumesRequest {
                        max_entries: 0,
                        starting_token: token,
                    },
                )
                .await?;

            for entry in page.entries {
                let Some(volume) = entry.volume else {
                    continue;
                };
                // entries without a condition carry no health information
                let Some(condition) = entry.status.and_then(|s| s.volume_condition) else {
                    continue;
                };
                conditions.insert(volume.volume_id, condition.into());
            }

            if page.next_token.is_empty() {
                break;
            }
            token = page.next_token;
        }

        Ok(conditions)
    }

    async fn controller_volume_condition(
        &self,
        volume_handle: &str,
    ) -> Result<VolumeCondition, Error> {
        let response: proto::ControllerGetVolumeResponse = self
            .unary(
                proto::CONTROLLER_GET_VOLUME,
                proto::ControllerGetVolumeRequest {
                    volume_id: volume_handle.to_owned(),
                },
            )
            .await?;

        // VOLUME_CONDITION is a startup requirement, so a missing status is a driver bug
        response
            .status
            .and_then(|s| s.volume_condition)
            .map(VolumeCondition::from)
            .context(MissingConditionSnafu {
                method: proto::CONTROLLER_GET_VOLUME,
            })
    }

    async fn node_volume_condition(
        &self,
        volume_handle: &str,
        volume_path: &str,
        staging_path: &str,
    ) -> Result<VolumeCondition, Error> {
        let response: proto::NodeGetVolumeStatsResponse = self
            .unary(
                proto::NODE_GET_VOLUME_STATS,
                proto::NodeGetVolumeStatsRequest {
                    volume_id: volume_handle.to_owned(),
                    volume_path: volume_path.to_owned(),
                    staging_target_path: staging_path.to_owned(),
                },
            )
            .await?;

        response
            .volume_condition
            .map(VolumeCondition::from)
            .context(MissingConditionSnafu {
                method: proto::NODE_GET_VOLUME_STATS,
            })
    }
}
