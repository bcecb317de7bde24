use std::fmt;

use crate::error::CallError;

/// Caller-visible lifecycle of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// Everything a caller can observe about a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: CallState,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub sharing_screen: bool,
    /// Why the call failed, or why the last `connect()` was refused.
    pub error: Option<CallError>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            video_enabled: false,
            audio_enabled: false,
            sharing_screen: false,
            error: None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} video={} audio={} screen={}",
            self.state, self.video_enabled, self.audio_enabled, self.sharing_screen
        )?;
        if let Some(err) = &self.error {
            write!(f, " error=\"{err}\"")?;
        }
        Ok(())
    }
}
