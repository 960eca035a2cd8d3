//! Error taxonomy for the capture engine.
//!
//! Only session-level failures are fatal. Everything that can go wrong while
//! a stream is running (bad params, failed imports, decode errors) is handled
//! inside the engine: logged, recovered from, never surfaced as a panic.

use thiserror::Error;

/// Fatal errors that tear down a whole transport session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The processing thread could not be spawned.
    #[error("failed to start PipeWire loop thread: {0}")]
    Thread(#[from] std::io::Error),

    /// Connecting the context/core to the daemon failed.
    #[error("failed to connect to PipeWire: {0}")]
    Connect(String),

    /// The processing thread is gone (panicked or already shut down).
    #[error("PipeWire loop thread is not running")]
    LoopGone,

    /// The processing thread did not answer in time.
    #[error("timed out waiting for the PipeWire loop thread")]
    Timeout,

    /// Initial format proposals could not be built.
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

/// Non-fatal negotiation failures. A stream that hits one of these keeps its
/// previous state; the session stays up.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("failed to serialize pod: {0}")]
    Serialize(String),

    #[error("malformed pod in {0}")]
    MalformedPod(&'static str),

    #[error("no supported formats to offer")]
    NoFormats,

    #[error("{0}")]
    Unsupported(&'static str),

    #[error("decoder init failed: {0}")]
    Decoder(String),
}

/// Failures while negotiating access through the desktop portals.
#[derive(Debug, Error)]
pub enum PortalError {
    /// The portal request itself failed, including denial or cancellation
    /// by the user.
    #[error("portal request failed: {0}")]
    Request(#[from] ashpd::Error),

    /// The screencast started but advertised no streams.
    #[error("portal returned no streams")]
    NoStreams,

    /// The host has no camera the portal is willing to share.
    #[error("no camera present")]
    NoCamera,
}

/// Errors from the compressed-frame decoder collaborator. A failed decode
/// drops that one frame; a failed init aborts the format transition.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no decoder available for {0}")]
    UnsupportedCodec(&'static str),

    #[error("decoder error: {0}")]
    Decode(String),
}
