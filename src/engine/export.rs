//! Virtual-camera export: fills outgoing buffers from host frames.

use std::slice;

use pipewire::spa::buffer::DataType;
use pipewire::sys as pw_sys;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::format::lookup_format_info;
use crate::params::{self, RawFormat};
use crate::video::{aligned_stride, OwnedVideoFrame, OwnedVideoPlane};

use super::buffer;

// SPA_DATA_FLAG_READABLE from spa/buffer/buffer.h.
const DATA_FLAG_READABLE: u32 = 1 << 0;

struct ExportFormat {
    raw: RawFormat,
    bytes_per_pixel: u32,
}

/// Row stride and total plane size for an exported frame.
pub(crate) fn export_layout(width: u32, height: u32, bytes_per_pixel: u32) -> (u32, u32) {
    let stride = aligned_stride(width, bytes_per_pixel);
    (stride, height * stride)
}

/// Adapter for the outgoing virtual-camera stream. Consumers drive the
/// negotiated size; the adapter follows whatever the daemon settled on.
pub(crate) struct ExportAdapter {
    format: Option<ExportFormat>,
    seq: u64,
}

impl ExportAdapter {
    pub fn new() -> Self {
        Self {
            format: None,
            seq: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.format.as_ref().map_or(0, |f| f.raw.width)
    }

    pub fn height(&self) -> u32 {
        self.format.as_ref().map_or(0, |f| f.raw.height)
    }

    pub fn negotiate(
        &mut self,
        name: &str,
        raw: RawFormat,
    ) -> Result<Vec<Vec<u8>>, NegotiationError> {
        let info = lookup_format_info(raw.format)
            .ok_or(NegotiationError::Unsupported("export pixel format not in catalog"))?;
        let (stride, size) = export_layout(raw.width, raw.height, info.bpp);
        info!(
            stream = %name,
            format = ?raw.format,
            width = raw.width,
            height = raw.height,
            framerate = ?raw.framerate,
            stride,
            "Negotiated export format"
        );
        let stream_params = params::build_export_stream_params(stride, size)?;
        self.format = Some(ExportFormat {
            raw,
            bytes_per_pixel: info.bpp,
        });
        Ok(stream_params)
    }

    /// Writes one host frame into a dequeued outgoing buffer: plane
    /// descriptors, pixel rows, and the header meta timestamp/sequence.
    ///
    /// # Safety
    ///
    /// `raw_buffer` must be dequeued from the export stream and stay
    /// dequeued for the duration of the call.
    pub unsafe fn fill_buffer(
        &mut self,
        name: &str,
        raw_buffer: *mut pw_sys::pw_buffer,
        frame: &OwnedVideoFrame,
    ) -> bool {
        let Some(format) = &self.format else {
            debug!(stream = %name, "Dropping export frame before negotiation");
            return false;
        };
        let (stride, size) =
            export_layout(format.raw.width, format.raw.height, format.bytes_per_pixel);

        let datas = buffer::datas_mut(raw_buffer);
        if datas.is_empty() {
            return false;
        }
        for (index, data) in datas.iter_mut().enumerate() {
            if data.data.is_null() || data.chunk.is_null() {
                warn!(stream = %name, "Export buffer has no mapped memory");
                return false;
            }
            if data.maxsize < size {
                warn!(
                    stream = %name,
                    maxsize = data.maxsize,
                    needed = size,
                    "Export buffer smaller than negotiated frame"
                );
                return false;
            }
            data.mapoffset = 0;
            data.maxsize = size;
            data.flags = DATA_FLAG_READABLE;
            data.type_ = DataType::MemPtr.as_raw();
            let chunk = &mut *data.chunk;
            chunk.offset = 0;
            chunk.stride = stride as i32;
            chunk.size = size;

            let dst = slice::from_raw_parts_mut(data.data.cast::<u8>(), size as usize);
            if let Some(plane) = frame.planes.get(index) {
                copy_plane(dst, stride, format.raw.height, plane);
            }
        }

        if let Some(header) = buffer::header_meta_mut(raw_buffer) {
            header.pts = frame.timestamp_ns;
            header.dts_offset = 0;
            header.flags = 0;
            header.seq = self.seq;
            self.seq += 1;
        }
        true
    }
}

/// Row-wise copy bounded by both strides, so a frame that does not exactly
/// match the negotiated layout never writes out of bounds.
fn copy_plane(dst: &mut [u8], dst_stride: u32, height: u32, plane: &OwnedVideoPlane) {
    let src_stride = plane.stride as usize;
    if src_stride == 0 {
        return;
    }
    let dst_stride = dst_stride as usize;
    let copy = src_stride.min(dst_stride);
    let rows = (plane.data.len() / src_stride).min(height as usize);
    for row in 0..rows {
        dst[row * dst_stride..row * dst_stride + copy]
            .copy_from_slice(&plane.data[row * src_stride..row * src_stride + copy]);
    }
}

#[cfg(test)]
mod tests {
    use super::super::buffer::testing::{header_payload, FakeBuffer};
    use super::super::buffer::{self, BufferPlanes};
    use super::*;
    use crate::video::{ColorRange, Colorspace, VideoFrameFormat};
    use pipewire::spa::param::video::VideoFormat;
    use pipewire::spa::sys as spa_sys;
    use pipewire::spa::utils::Fraction;
    use test_log::test;

    fn raw(format: VideoFormat, width: u32, height: u32) -> RawFormat {
        RawFormat {
            format,
            width,
            height,
            framerate: Fraction { num: 30, denom: 1 },
            modifier: None,
            colorspace: Colorspace::Default,
            range: ColorRange::Default,
        }
    }

    fn frame(width: u32, height: u32, stride: u32, value: u8) -> OwnedVideoFrame {
        OwnedVideoFrame {
            format: VideoFrameFormat::Rgba,
            width,
            height,
            colorspace: Colorspace::Default,
            range: ColorRange::Default,
            timestamp_ns: 9_000,
            planes: vec![OwnedVideoPlane {
                data: vec![value; (stride * height) as usize],
                stride,
            }],
        }
    }

    #[test]
    fn test_layout_rounds_stride_up() {
        assert_eq!(export_layout(1280, 720, 4), (5120, 3_686_400));
        // Odd widths still land on a 4-byte boundary.
        assert_eq!(export_layout(3, 2, 2), (8, 16));
    }

    #[test]
    fn test_negotiate_builds_three_params() {
        let mut adapter = ExportAdapter::new();
        let stream_params = adapter.negotiate("vcam", raw(VideoFormat::RGBA, 4, 2)).unwrap();
        assert_eq!(stream_params.len(), 3);
        assert_eq!((adapter.width(), adapter.height()), (4, 2));
    }

    #[test]
    fn test_fill_writes_chunks_pixels_and_header() {
        let mut adapter = ExportAdapter::new();
        adapter.negotiate("vcam", raw(VideoFormat::RGBA, 4, 2)).unwrap();

        // 4 px * 4 bytes = 16-byte stride, 2 rows.
        let mut fake = FakeBuffer::new(vec![0u8; 32], 0, 0)
            .with_metas(vec![(spa_sys::SPA_META_Header, header_payload())]);
        let ok = unsafe { adapter.fill_buffer("vcam", fake.ptr(), &frame(4, 2, 16, 0x5a)) };
        assert!(ok);

        assert!(fake.pixels().iter().all(|&b| b == 0x5a));
        let view = unsafe { buffer::view_buffer(fake.ptr()) }.unwrap();
        match view.planes {
            BufferPlanes::Memory(planes) => {
                assert_eq!(planes[0].stride, 16);
                assert_eq!(planes[0].data.len(), 32);
            }
            _ => panic!("expected memory planes"),
        }

        let header = unsafe { buffer::header_meta_mut(fake.ptr()) }.unwrap();
        assert_eq!(header.pts, 9_000);
        assert_eq!(header.seq, 0);
        assert_eq!(header.dts_offset, 0);

        // The sequence number advances per exported frame.
        let ok = unsafe { adapter.fill_buffer("vcam", fake.ptr(), &frame(4, 2, 16, 0x5b)) };
        assert!(ok);
        let header = unsafe { buffer::header_meta_mut(fake.ptr()) }.unwrap();
        assert_eq!(header.seq, 1);
    }

    #[test]
    fn test_fill_bounds_copy_to_smaller_frame() {
        let mut adapter = ExportAdapter::new();
        adapter.negotiate("vcam", raw(VideoFormat::RGBA, 4, 2)).unwrap();

        let mut fake = FakeBuffer::new(vec![0u8; 32], 0, 0);
        // One 1-px row: only four bytes of the first destination row may
        // change.
        let ok = unsafe { adapter.fill_buffer("vcam", fake.ptr(), &frame(1, 1, 4, 0x77)) };
        assert!(ok);
        assert!(fake.pixels()[..4].iter().all(|&b| b == 0x77));
        assert!(fake.pixels()[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fill_refuses_undersized_buffer() {
        let mut adapter = ExportAdapter::new();
        adapter.negotiate("vcam", raw(VideoFormat::RGBA, 4, 2)).unwrap();

        let mut fake = FakeBuffer::new(vec![0u8; 8], 0, 0);
        let ok = unsafe { adapter.fill_buffer("vcam", fake.ptr(), &frame(4, 2, 16, 0x5a)) };
        assert!(!ok);
    }

    #[test]
    fn test_fill_before_negotiation_is_refused() {
        let mut adapter = ExportAdapter::new();
        let mut fake = FakeBuffer::new(vec![0u8; 32], 0, 0);
        let ok = unsafe { adapter.fill_buffer("vcam", fake.ptr(), &frame(4, 2, 16, 1)) };
        assert!(!ok);
    }
}
