//! Protocol errors

use thiserror::Error;

use super::frame::FrameFault;

/// Errors that can occur on the ECU link or while translating frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The physical link could not be opened at all
    #[error("link unavailable: {0}")]
    LinkUnavailable(String),

    /// No valid reply arrived within the configured timeout
    #[error("link timeout")]
    Timeout,

    /// The link dropped unexpectedly mid-session
    #[error("link disconnected")]
    Disconnected,

    /// A frame failed structural or checksum validation.
    ///
    /// Non-fatal: the frame is discarded and the request retried by the
    /// caller up to a bounded count.
    #[error("frame corrupt: {0}")]
    FrameCorrupt(FrameFault),

    /// A structurally valid frame carried a payload we refuse to interpret.
    ///
    /// Never recovered silently; misreading tuning data is worse than
    /// failing loudly.
    #[error("decode error: {0}")]
    Decode(String),

    /// Parameter id not present in the loaded parameter table
    #[error("unknown parameter id {0:#04x}")]
    UnknownPid(u8),

    /// Map id byte not recognized
    #[error("unknown map id {0:#04x}")]
    UnknownMap(u8),

    /// The serialized ECU channel worker has shut down
    #[error("ECU channel closed")]
    ChannelClosed,

    /// Underlying serial port error
    #[error("serial port error: {0}")]
    SerialError(String),

    /// I/O error on the channel
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Transient errors are retried locally; everything else propagates.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::Timeout | ProtocolError::FrameCorrupt(_))
    }
}
