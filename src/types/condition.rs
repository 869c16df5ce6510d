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

//! Health check results and the event vocabulary used to report them.

use strum::{AsRefStr, Display};

/// Message attached to the Normal event sent when a volume that was reported
/// abnormal becomes healthy again.
pub const RECOVERY_MESSAGE: &str = "The Volume returns to the healthy state";

/// Result of one health check against the storage driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeCondition {
    pub abnormal: bool,
    pub message: String,
}

impl VolumeCondition {
    pub fn normal(message: impl Into<String>) -> Self {
        Self {
            abnormal: false,
            message: message.into(),
        }
    }

    pub fn abnormal(message: impl Into<String>) -> Self {
        Self {
            abnormal: true,
            message: message.into(),
        }
    }
}

/// Event reasons emitted by the monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum Reason {
    #[strum(to_string = "VolumeConditionAbnormal")]
    VolumeConditionAbnormal,

    #[strum(to_string = "VolumeConditionNormal")]
    VolumeConditionNormal,

    #[strum(to_string = "NodeFailed")]
    NodeFailed,

    #[strum(to_string = "NodeRecovered")]
    NodeRecovered,
}

/// Event type as it appears in `Event.type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum Severity {
    #[strum(to_string = "Normal")]
    Normal,

    #[strum(to_string = "Warning")]
    Warning,
}
