//! Error taxonomy for a call.

use std::fmt;

use thiserror::Error;

/// Why local capture could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionFailure {
    PermissionDenied,
    DeviceNotFound,
    /// Device held by another application. Worth retrying.
    DeviceBusy,
}

impl fmt::Display for AcquisitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PermissionDenied => "permission denied",
            Self::DeviceNotFound => "device not found",
            Self::DeviceBusy => "device busy",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {detail}")]
pub struct AcquisitionError {
    pub reason: AcquisitionFailure,
    pub detail: String,
}

impl AcquisitionError {
    pub fn new(reason: AcquisitionFailure, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.reason == AcquisitionFailure::DeviceBusy
    }
}

/// Everything a call can fail with.
///
/// Only `ChannelLost` and transient `Acquisition` errors are retried
/// automatically. The rest end the call, or are returned to the caller
/// without touching call state (`AlreadyActive`, `NotConnected`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("media acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("signaling channel lost")]
    ChannelLost,

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("ice candidate rejected: {0}")]
    CandidateApply(String),

    #[error("call already active")]
    AlreadyActive,

    #[error("call not connected")]
    NotConnected,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("call cancelled")]
    Cancelled,
}

impl CallError {
    pub fn negotiation(msg: impl fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    pub fn candidate(msg: impl fmt::Display) -> Self {
        Self::CandidateApply(msg.to_string())
    }

    pub fn timeout(msg: impl fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Errors the session retries on its own before giving up.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ChannelLost => true,
            Self::Acquisition(err) => err.is_transient(),
            _ => false,
        }
    }
}
