//! Desktop video capture and virtual-camera export over PipeWire.
//!
//! A [`PipeWireSession`] owns the daemon connection and runs it on a
//! dedicated loop thread. On top of it sit three stream roles: display
//! capture, which imports frames as GPU textures through a host
//! [`render::Renderer`]; camera capture, which delivers CPU frames to a
//! [`FrameSink`] (decoding MJPEG/H.264 cameras through a host
//! [`decode::DecoderFactory`]); and virtual-camera export, which feeds
//! frames to any consumer on the desktop. The [`portal`] module runs the
//! XDG desktop portal handshake that yields the scoped connection fd the
//! capture roles need.

pub mod decode;
pub(crate) mod engine;
pub mod error;
pub mod format;
pub(crate) mod params;
pub mod portal;
pub mod render;
pub mod session;
pub mod sink;
pub mod video;

pub use crate::error::{DecodeError, NegotiationError, PortalError, SessionError};
pub use crate::format::ServerVersion;
pub use crate::session::{
    CameraStreamConfig, DiscoveredNode, DiscoveryListener, DisplayStreamConfig,
    ExportStreamConfig, PipeWireSession, PipeWireStream,
};
pub use crate::sink::{ChannelSink, FrameSink};
pub use crate::video::{Framerate, OwnedVideoFrame, VideoFrame, VideoFrameFormat};
