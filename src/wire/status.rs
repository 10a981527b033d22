//! JSON control messages

use serde::{Deserialize, Serialize};

use super::WireError;

/// Text messages sent alongside binary frames, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Status(StatusMessage),
}

/// Periodic summary of upstream health and server load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub connected: bool,

    /// Production rate rounded to one decimal place
    pub fps: f64,

    pub clients: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl StatusMessage {
    pub fn new(connected: bool, fps: f64, clients: usize, dimensions: Option<(u32, u32)>) -> Self {
        Self {
            connected,
            fps: round_one_decimal(fps),
            clients,
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
        }
    }
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Control(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text).map_err(|e| WireError::Control(e.to_string()))
    }
}

impl From<StatusMessage> for ControlMessage {
    fn from(status: StatusMessage) -> Self {
        ControlMessage::Status(status)
    }
}

fn round_one_decimal(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (value * 10.0).round() / 10.0
}
