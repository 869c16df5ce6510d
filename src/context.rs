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

use crate::types::condition::{Reason, Severity};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use snafu::Snafu;
use snafu::futures::TryFutureExt;
use std::future::Future;

pub const CONTROLLER_REPORTER_PREFIX: &str = "csi-pv-monitor-controller";
pub const AGENT_REPORTER_PREFIX: &str = "csi-pv-monitor-agent";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("record event error: {}", source))]
    Record { source: kube::Error },
}

/// Sink for the health events attached to claims and pods.
pub trait EventRecorder: Send + Sync + 'static {
    fn publish(
        &self,
        subject: &ObjectReference,
        severity: Severity,
        reason: Reason,
        message: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Publishes events through the cluster API.
#[derive(Clone)]
pub struct KubeRecorder {
    recorder: Recorder,
}

impl KubeRecorder {
    /// `prefix` is one of the reporter prefixes, suffixed with the driver name.
    pub fn new(client: kube::Client, prefix: &str, driver: &str) -> Self {
        let reporter = Reporter {
            controller: format!("{prefix}-{driver}"),
            instance: std::env::var("HOSTNAME").ok(),
        };

        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

impl EventRecorder for KubeRecorder {
    async fn publish(
        &self,
        subject: &ObjectReference,
        severity: Severity,
        reason: Reason,
        message: &str,
    ) -> Result<(), Error> {
        let type_ = match severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        };

        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.to_string(),
                    note: Some(message.into()),
                    action: "HealthCheck".into(),
                    secondary: None,
                },
                subject,
            )
            .context(RecordSnafu)
            .await
    }
}
