use thiserror::Error;

/// Errors surfaced by the call pipeline.
///
/// `MalformedFrame`, `WriteBackpressure` and `NotConnected` describe a single
/// dropped frame and are logged where they happen. The rest end a call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("microphone permission not granted")]
    PermissionDenied,

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("outbound queue full, frame dropped")]
    WriteBackpressure,

    #[error("not connected")]
    NotConnected,

    #[error("another call session is active")]
    SessionBusy,
}

impl CallError {
    /// Device-class failures: the microphone or speaker could not be used.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::DeviceUnavailable(_))
    }
}
