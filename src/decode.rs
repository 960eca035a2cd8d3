//! Decoder seam for compressed camera formats.
//!
//! Webcams commonly deliver MJPEG or H.264 alongside raw formats. The engine
//! does not link a codec library; a host that wants compressed formats
//! supplies a [`DecoderFactory`], and the camera path creates one decoder per
//! negotiated codec. Without a factory only raw formats are advertised.

use crate::error::DecodeError;
use crate::video::VideoFrame;

/// Compressed bitstreams the camera path can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedCodec {
    Mjpeg,
    H264,
}

impl CompressedCodec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mjpeg => "mjpeg",
            Self::H264 => "h264",
        }
    }
}

/// One decoding session, created when a compressed format is negotiated and
/// dropped when the stream renegotiates or ends.
pub trait VideoDecoder: Send {
    /// Decodes one access unit. The returned frame borrows the decoder's
    /// internal storage and stays valid until the next call.
    fn decode(&mut self, data: &[u8]) -> Result<VideoFrame<'_>, DecodeError>;
}

/// Host-supplied codec backend.
pub trait DecoderFactory: Send {
    fn create(&self, codec: CompressedCodec) -> Result<Box<dyn VideoDecoder>, DecodeError>;
}
