use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::Credential;

/// Streaming mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Idle,
    FullDuplex,
    Listen,
    Speak,
}

impl SessionMode {
    /// Whether the mode needs the local microphone.
    pub fn uses_microphone(self) -> bool {
        matches!(self, SessionMode::FullDuplex | SessionMode::Speak)
    }

    /// Whether the mode plays device audio locally.
    pub fn uses_speaker(self) -> bool {
        matches!(self, SessionMode::FullDuplex | SessionMode::Listen)
    }

    pub fn start_command(self) -> Option<ClientCommand> {
        match self {
            SessionMode::Idle => None,
            SessionMode::FullDuplex => Some(ClientCommand::StartStream),
            SessionMode::Listen => Some(ClientCommand::StartListen),
            SessionMode::Speak => Some(ClientCommand::StartSpeak),
        }
    }

    pub fn stop_command(self) -> Option<ClientCommand> {
        match self {
            SessionMode::Idle => None,
            SessionMode::FullDuplex => Some(ClientCommand::StopStream),
            SessionMode::Listen => Some(ClientCommand::StopListen),
            SessionMode::Speak => Some(ClientCommand::StopSpeak),
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Idle => write!(f, "idle"),
            SessionMode::FullDuplex => write!(f, "full_duplex"),
            SessionMode::Listen => write!(f, "listen"),
            SessionMode::Speak => write!(f, "speak"),
        }
    }
}

/// Which device gain a `set_*_gain` command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainTarget {
    Mic,
    Speaker,
}

impl GainTarget {
    /// Accepted multiplier range on the device.
    pub fn range(self) -> (f32, f32) {
        match self {
            GainTarget::Mic => (0.1, 5.0),
            GainTarget::Speaker => (0.1, 3.0),
        }
    }

    pub fn clamp(self, value: f32) -> f32 {
        let (lo, hi) = self.range();
        value.clamp(lo, hi)
    }
}

/// Client → device control message. Serialized as `{"cmd": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    Auth { key: Credential },
    StartStream,
    StopStream,
    StartListen,
    StopListen,
    StartSpeak,
    StopSpeak,
    Doorbell,
    StartAlarm,
    StopAlarm,
    SetMicGain { value: f32 },
    SetSpeakerGain { value: f32 },
    SetField { index: u32, icon: String, text: String },
    ClearField { index: u32 },
}

impl ClientCommand {
    pub fn set_gain(target: GainTarget, value: f32) -> Self {
        match target {
            GainTarget::Mic => ClientCommand::SetMicGain { value },
            GainTarget::Speaker => ClientCommand::SetSpeakerGain { value },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Device → client control message, keyed on `type`.
///
/// Unknown types are kept as `Other` so newer firmware does not break parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    AuthRequired,
    AuthSuccess,
    AuthFailed,
    Other(String),
}

#[derive(Deserialize)]
struct RawDeviceMessage {
    #[serde(rename = "type", default)]
    msg_type: String,
}

impl DeviceMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let raw: RawDeviceMessage = serde_json::from_str(text)?;
        Ok(match raw.msg_type.as_str() {
            "auth_required" => DeviceMessage::AuthRequired,
            "auth_success" => DeviceMessage::AuthSuccess,
            "auth_failed" => DeviceMessage::AuthFailed,
            _ => DeviceMessage::Other(raw.msg_type),
        })
    }
}

/// Body of the status endpoint. Missing fields fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub streaming: StreamingFlags,
    #[serde(default)]
    pub audio: AudioStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct StreamingFlags {
    #[serde(default)]
    pub full_duplex: bool,
    #[serde(default)]
    pub listen: bool,
    #[serde(default)]
    pub speak: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AudioStatus {
    #[serde(default)]
    pub alarm_active: bool,
    #[serde(default)]
    pub doorbell_playing: bool,
    #[serde(default = "unity_gain")]
    pub mic_gain: f32,
    #[serde(default = "unity_gain")]
    pub speaker_gain: f32,
}

fn unity_gain() -> f32 {
    1.0
}

impl Default for AudioStatus {
    fn default() -> Self {
        Self {
            alarm_active: false,
            doorbell_playing: false,
            mic_gain: unity_gain(),
            speaker_gain: unity_gain(),
        }
    }
}
