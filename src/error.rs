//! Error types

use crate::codec::CodecError;
use crate::protocol::pairing::PairingError;
use crate::protocol::rtsp::RtspError;
use crate::stream::StreamError;

/// Top-level error for airtap operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RTSP exchange with the sender failed.
    #[error(transparent)]
    Rtsp(#[from] RtspError),

    /// Pair-verify or auth-setup failed.
    #[error(transparent)]
    Pairing(#[from] PairingError),

    /// Codec seam misuse or configuration problem.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Streaming session could not be set up or torn down.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
