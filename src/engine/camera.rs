//! Camera capture: raw CPU frames, with decoder fallback for compressed
//! webcam formats.

use tracing::{debug, error, info, warn};

use crate::decode::{DecoderFactory, VideoDecoder};
use crate::error::NegotiationError;
use crate::format::lookup_format_info;
use crate::params::{self, CompressedFormat, RawFormat};
use crate::sink::FrameSink;
use crate::video::{aligned_stride, VideoFrame, VideoFrameFormat, VideoPlane};

use super::buffer::{BufferPlanes, BufferView};

enum CameraFormat {
    Raw {
        raw: RawFormat,
        frame: VideoFrameFormat,
    },
    Compressed(CompressedFormat),
}

/// Adapter for webcam streams. Every converted frame goes straight to the
/// host's sink; there is no texture path.
pub(crate) struct CameraAdapter {
    sink: Box<dyn FrameSink>,
    decoders: Option<Box<dyn DecoderFactory>>,
    decoder: Option<Box<dyn VideoDecoder>>,
    format: Option<CameraFormat>,
}

impl CameraAdapter {
    pub fn new(sink: Box<dyn FrameSink>, decoders: Option<Box<dyn DecoderFactory>>) -> Self {
        Self {
            sink,
            decoders,
            decoder: None,
            format: None,
        }
    }

    pub fn width(&self) -> u32 {
        match &self.format {
            Some(CameraFormat::Raw { raw, .. }) => raw.width,
            Some(CameraFormat::Compressed(compressed)) => compressed.width,
            None => 0,
        }
    }

    pub fn height(&self) -> u32 {
        match &self.format {
            Some(CameraFormat::Raw { raw, .. }) => raw.height,
            Some(CameraFormat::Compressed(compressed)) => compressed.height,
            None => 0,
        }
    }

    pub fn negotiate_raw(
        &mut self,
        name: &str,
        raw: RawFormat,
    ) -> Result<Vec<Vec<u8>>, NegotiationError> {
        let frame = lookup_format_info(raw.format)
            .and_then(|info| info.frame_format)
            .ok_or(NegotiationError::Unsupported("camera pixel format not in catalog"))?;
        info!(
            stream = %name,
            format = ?raw.format,
            width = raw.width,
            height = raw.height,
            framerate = ?raw.framerate,
            "Negotiated camera format"
        );
        let stream_params = params::build_camera_stream_params()?;
        self.decoder = None;
        self.format = Some(CameraFormat::Raw { raw, frame });
        Ok(stream_params)
    }

    /// A compressed transition stands or falls with its decoder: if the
    /// factory cannot produce one, the whole transition is aborted and the
    /// previous negotiation state stays in place.
    pub fn negotiate_compressed(
        &mut self,
        name: &str,
        compressed: CompressedFormat,
    ) -> Result<Vec<Vec<u8>>, NegotiationError> {
        let factory = self
            .decoders
            .as_ref()
            .ok_or(NegotiationError::Unsupported("no decoder backend for compressed formats"))?;
        let decoder = factory
            .create(compressed.codec)
            .map_err(|err| NegotiationError::Decoder(err.to_string()))?;
        info!(
            stream = %name,
            codec = compressed.codec.name(),
            width = compressed.width,
            height = compressed.height,
            framerate = ?compressed.framerate,
            "Negotiated compressed camera format"
        );
        let stream_params = params::build_camera_stream_params()?;
        self.decoder = Some(decoder);
        self.format = Some(CameraFormat::Compressed(compressed));
        Ok(stream_params)
    }

    pub fn process(&mut self, name: &str, view: BufferView<'_>) {
        let Some(format) = &self.format else {
            return;
        };
        let planes = match view.planes {
            BufferPlanes::Memory(planes) => planes,
            BufferPlanes::Empty => return,
            BufferPlanes::DmaBuf(_) => {
                debug!(stream = %name, "Unexpected GPU buffer on camera stream");
                return;
            }
            BufferPlanes::Unmapped => {
                error!(stream = %name, "Cannot access camera buffer data");
                return;
            }
        };

        match format {
            CameraFormat::Raw { raw, frame } => {
                // The producer's stride can be tighter than consumers
                // expect; re-expose the first plane with the aligned one.
                let stride = aligned_stride(raw.width, frame.bytes_per_pixel());
                let video_planes: Vec<VideoPlane<'_>> = planes
                    .iter()
                    .enumerate()
                    .map(|(index, plane)| VideoPlane {
                        data: plane.data,
                        stride: if index == 0 { stride } else { plane.stride },
                    })
                    .collect();
                let frame = VideoFrame {
                    format: *frame,
                    width: raw.width,
                    height: raw.height,
                    colorspace: raw.colorspace,
                    range: raw.range,
                    planes: video_planes,
                };
                self.sink.output_video(Some(&frame));
            }
            CameraFormat::Compressed(compressed) => {
                let Some(decoder) = self.decoder.as_mut() else {
                    return;
                };
                let Some(payload) = planes.first() else {
                    return;
                };
                match decoder.decode(payload.data) {
                    Ok(frame) => self.sink.output_video(Some(&frame)),
                    Err(err) => {
                        warn!(
                            stream = %name,
                            codec = compressed.codec.name(),
                            error = %err,
                            "Dropping undecodable frame"
                        );
                    }
                }
            }
        }
    }

    /// Tells the sink the feed ended and drops the decoder.
    pub fn teardown(&mut self) {
        self.sink.output_video(None);
        self.decoder = None;
    }
}
