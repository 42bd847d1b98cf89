//! Wire types for the three channels the leader speaks:
//!
//! - HTTP bodies for the device (`/handshake`, `/list`, `/run`, `/cancel`)
//! - `/ws/internal`: `FollowerMessage` (follower → leader) and
//!   `LeaderMessage` (leader → follower)
//! - `/ws`: `DeviceMessage` pushed to device clients
//!
//! All frames are JSON objects tagged by `type`. A frame whose tag is unknown
//! fails to deserialize; receivers log and drop it.

use serde::{Deserialize, Serialize};

use crate::error::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Idle,
    Running,
}

/// One runnable command as the device sees it.
///
/// Inside a provider `id` is the provider-local id; once aggregated it is
/// rewritten to the composite `windowId:providerId:localId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    #[serde(rename = "scriptId")]
    pub id: String,
    /// Opaque rendering payload (an image data URI), produced by the provider.
    pub svg: String,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResult {
    Success,
    Error,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl RunResult {
    pub fn started(task_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message: None,
            task_id: Some(task_id.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            task_id: None,
        }
    }
}

impl From<CommandError> for RunResult {
    fn from(err: CommandError) -> Self {
        Self::failed(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CancelResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

impl From<CommandError> for CancelResult {
    fn from(err: CommandError) -> Self {
        Self::failed(err.to_string())
    }
}

/// A finished task, as published on a registry's task feed.
/// `slot_id` is `providerId:localId`; the window prefix is added by whoever
/// forwards the event off-process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompleteEvent {
    pub slot_id: String,
    pub result: TaskResult,
}

// =============================================================================
// Internal channel (/ws/internal)
// =============================================================================

/// Frames a follower sends to the leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FollowerMessage {
    Register {
        window_id: String,
    },
    Focus {
        window_id: String,
    },
    Blur {
        window_id: String,
    },
    Change {
        window_id: String,
    },
    Disconnect {
        window_id: String,
    },
    SlotsResponse {
        request_id: String,
        items: Vec<Slot>,
    },
    RunResponse {
        request_id: String,
        result: RunResult,
    },
    CancelResponse {
        request_id: String,
        result: CancelResult,
    },
    TaskCompleteForward {
        window_id: String,
        /// `providerId:localId`, without the window prefix.
        slot_data_id: String,
        result: TaskResult,
    },
}

/// Frames the leader sends to a follower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LeaderMessage {
    /// Acknowledges `register`; the follower's connect completes on receipt.
    Registered {
        window_id: String,
    },
    GetSlots {
        request_id: String,
    },
    Run {
        request_id: String,
        slot_data_id: String,
    },
    Cancel {
        request_id: String,
        slot_data_id: String,
    },
}

// =============================================================================
// Device channel (/ws) and HTTP bodies
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DeviceMessage {
    Refresh,
    Activate,
    Deactivate,
    TaskComplete {
        slot_data_id: String,
        result: TaskResult,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub items: Vec<Slot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRequest {
    pub slot_data_id: String,
}

// =============================================================================
// Composite ids
// =============================================================================

/// A parsed `windowId:providerId:localId`.
///
/// Window and provider ids never contain a colon; the local id is everything
/// after the second colon and may contain colons of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAddress<'a> {
    pub window_id: &'a str,
    pub provider_id: &'a str,
    pub local_id: &'a str,
}

impl<'a> SlotAddress<'a> {
    pub fn parse(id: &'a str) -> Result<Self, CommandError> {
        let (window_id, rest) = id.split_once(':').ok_or(CommandError::MalformedId)?;
        let (provider_id, local_id) = rest.split_once(':').ok_or(CommandError::MalformedId)?;
        if window_id.is_empty() || provider_id.is_empty() {
            return Err(CommandError::MalformedId);
        }
        Ok(Self {
            window_id,
            provider_id,
            local_id,
        })
    }
}

/// The window segment of a composite id, if the id has one.
pub fn window_of(id: &str) -> Option<&str> {
    id.split_once(':')
        .map(|(window, _)| window)
        .filter(|w| !w.is_empty())
}

pub fn composite_id(window_id: &str, provider_id: &str, local_id: &str) -> String {
    format!("{window_id}:{provider_id}:{local_id}")
}
