//! Frame types crossing the engine boundary.
//!
//! A [`VideoFrame`] borrows plane memory that is only valid inside a stream
//! process callback; sinks that need the pixels past that point copy them
//! into an [`OwnedVideoFrame`]. The owned form is also what a virtual-camera
//! export consumes.

/// Upper bound on planes a single frame can carry.
pub const MAX_PLANES: usize = 4;

/// Pixel layout of frames delivered to a sink or exported to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameFormat {
    Bgra,
    Rgba,
    Bgrx,
    /// Packed YUV 4:2:2, two bytes per pixel.
    Yuy2,
}

impl VideoFrameFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::Bgra | Self::Rgba | Self::Bgrx => 4,
            Self::Yuy2 => 2,
        }
    }
}

/// Color matrix hint carried alongside decoded or negotiated frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Colorspace {
    #[default]
    Default,
    Bt601,
    Bt709,
}

/// Quantization range hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorRange {
    #[default]
    Default,
    /// 16..235 studio swing.
    Partial,
    /// 0..255 full swing.
    Full,
}

/// Frame rate expressed as a fraction of frames per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Default for Framerate {
    fn default() -> Self {
        Self { num: 30, den: 1 }
    }
}

/// Row stride for a packed format, rounded up to a 4-byte boundary.
pub fn aligned_stride(width: u32, bytes_per_pixel: u32) -> u32 {
    (width * bytes_per_pixel + 3) & !3
}

/// One plane of pixel data with its row stride.
#[derive(Debug, Clone, Copy)]
pub struct VideoPlane<'a> {
    pub data: &'a [u8],
    pub stride: u32,
}

/// A borrowed frame view. Plane slices point into buffer memory owned by the
/// transport and stay valid only for the duration of the callback that built
/// the frame.
#[derive(Debug, Clone)]
pub struct VideoFrame<'a> {
    pub format: VideoFrameFormat,
    pub width: u32,
    pub height: u32,
    pub colorspace: Colorspace,
    pub range: ColorRange,
    pub planes: Vec<VideoPlane<'a>>,
}

impl VideoFrame<'_> {
    pub fn to_owned_frame(&self, timestamp_ns: i64) -> OwnedVideoFrame {
        OwnedVideoFrame {
            format: self.format,
            width: self.width,
            height: self.height,
            colorspace: self.colorspace,
            range: self.range,
            timestamp_ns,
            planes: self
                .planes
                .iter()
                .map(|p| OwnedVideoPlane {
                    data: p.data.to_vec(),
                    stride: p.stride,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OwnedVideoPlane {
    pub data: Vec<u8>,
    pub stride: u32,
}

/// A frame that owns its pixels. Produced by copying a [`VideoFrame`] or
/// synthesized by a host that feeds a virtual camera.
#[derive(Debug, Clone)]
pub struct OwnedVideoFrame {
    pub format: VideoFrameFormat,
    pub width: u32,
    pub height: u32,
    pub colorspace: Colorspace,
    pub range: ColorRange,
    pub timestamp_ns: i64,
    pub planes: Vec<OwnedVideoPlane>,
}

impl OwnedVideoFrame {
    pub fn as_view(&self) -> VideoFrame<'_> {
        VideoFrame {
            format: self.format,
            width: self.width,
            height: self.height,
            colorspace: self.colorspace,
            range: self.range,
            planes: self
                .planes
                .iter()
                .map(|p| VideoPlane {
                    data: &p.data,
                    stride: p.stride,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_roundtrip_preserves_planes() {
        let data = vec![0u8, 1, 2, 3, 4, 5, 6, 7];
        let frame = VideoFrame {
            format: VideoFrameFormat::Bgra,
            width: 2,
            height: 1,
            colorspace: Colorspace::Bt709,
            range: ColorRange::Full,
            planes: vec![VideoPlane {
                data: &data,
                stride: 8,
            }],
        };

        let owned = frame.to_owned_frame(42);
        assert_eq!(owned.timestamp_ns, 42);
        assert_eq!(owned.planes.len(), 1);
        assert_eq!(owned.planes[0].data, data);

        let view = owned.as_view();
        assert_eq!(view.width, 2);
        assert_eq!(view.colorspace, Colorspace::Bt709);
        assert_eq!(view.planes[0].stride, 8);
    }

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(VideoFrameFormat::Bgra.bytes_per_pixel(), 4);
        assert_eq!(VideoFrameFormat::Yuy2.bytes_per_pixel(), 2);
    }

    #[test]
    fn test_aligned_stride_rounds_to_four_bytes() {
        assert_eq!(aligned_stride(1280, 4), 5120);
        assert_eq!(aligned_stride(3, 2), 8);
        assert_eq!(aligned_stride(2, 2), 4);
        assert_eq!(aligned_stride(1, 4), 4);
    }
}
