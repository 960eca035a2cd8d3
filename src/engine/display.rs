//! Display capture: GPU import or CPU upload, crop and cursor compositing.

use pipewire::spa::param::video::VideoFormat;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::format::{lookup_format_info, ServerVersion, SupportedFormats, DRM_FORMAT_MOD_INVALID};
use crate::params::{self, RawFormat};
use crate::render::{DmaBufImage, DmaBufPlane, Renderer, Texture};

use super::buffer::{BufferPlanes, BufferView, CropMeta, CursorMeta, MemoryPlane};
use super::ProcessDisposition;

/// Producer-driven crop rectangle, refreshed from buffer metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CropRegion {
    pub valid: bool,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    /// A crop only changes rendering when it cuts something off the frame.
    pub fn is_effective(&self, frame_width: u32, frame_height: u32) -> bool {
        self.valid
            && (self.x != 0
                || self.y != 0
                || self.width < frame_width
                || self.height < frame_height)
    }
}

/// Cursor overlay fed by buffer metadata. The bitmap texture is replaced
/// wholesale whenever the producer ships a new shape.
#[derive(Default)]
pub(crate) struct CursorState {
    pub valid: bool,
    pub x: i32,
    pub y: i32,
    pub hotspot_x: i32,
    pub hotspot_y: i32,
    pub width: u32,
    pub height: u32,
    pub texture: Option<Box<dyn Texture>>,
}

/// Adapter for screen-content streams. Converts incoming buffers into a host
/// texture and composites crop and cursor on render.
pub(crate) struct DisplayAdapter {
    renderer: Box<dyn Renderer>,
    show_cursor: bool,
    format: Option<RawFormat>,
    texture: Option<Box<dyn Texture>>,
    swap_red_blue: bool,
    crop: CropRegion,
    cursor: CursorState,
}

impl DisplayAdapter {
    pub fn new(renderer: Box<dyn Renderer>, show_cursor: bool) -> Self {
        Self {
            renderer,
            show_cursor,
            format: None,
            texture: None,
            swap_red_blue: false,
            crop: CropRegion::default(),
            cursor: CursorState::default(),
        }
    }

    /// A valid crop overrides the negotiated size in queries.
    pub fn width(&self) -> u32 {
        if self.crop.valid {
            self.crop.width
        } else {
            self.format.map_or(0, |f| f.width)
        }
    }

    pub fn height(&self) -> u32 {
        if self.crop.valid {
            self.crop.height
        } else {
            self.format.map_or(0, |f| f.height)
        }
    }

    pub fn set_cursor_visible(&mut self, visible: bool) {
        self.show_cursor = visible;
    }

    pub fn negotiate(
        &mut self,
        name: &str,
        version: &ServerVersion,
        raw: RawFormat,
    ) -> Result<Vec<Vec<u8>>, NegotiationError> {
        info!(
            stream = %name,
            format = ?raw.format,
            width = raw.width,
            height = raw.height,
            framerate = ?raw.framerate,
            modifier = raw.modifier,
            "Negotiated display format"
        );
        // Zero-copy buffers are offered when the producer pinned a modifier
        // or the daemon is new enough to handle them without one.
        let dma_buf = raw.modifier.is_some() || version.supports_implicit_dmabuf();
        let stream_params = params::build_display_stream_params(params::data_type_mask(dma_buf))?;
        self.format = Some(raw);
        Ok(stream_params)
    }

    pub fn process(
        &mut self,
        name: &str,
        version: &ServerVersion,
        formats: &mut SupportedFormats,
        view: BufferView<'_>,
    ) -> ProcessDisposition {
        let mut disposition = ProcessDisposition::Continue;
        match view.planes {
            BufferPlanes::Empty => {}
            BufferPlanes::Unmapped => {
                debug!(stream = %name, "Buffer reports pixels but maps none, skipping");
            }
            BufferPlanes::DmaBuf(planes) => {
                disposition = self.import_gpu_frame(name, version, formats, planes);
            }
            BufferPlanes::Memory(planes) => {
                self.upload_cpu_frame(name, &planes);
            }
        }
        self.update_crop(view.crop);
        self.update_cursor(name, view.cursor);
        disposition
    }

    fn import_gpu_frame(
        &mut self,
        name: &str,
        version: &ServerVersion,
        formats: &mut SupportedFormats,
        planes: Vec<DmaBufPlane<'_>>,
    ) -> ProcessDisposition {
        let Some(raw) = self.format else {
            debug!(stream = %name, "Dropping buffer that arrived before negotiation");
            return ProcessDisposition::Continue;
        };
        let Some(info) = lookup_format_info(raw.format) else {
            debug!(stream = %name, format = ?raw.format, "Pixel format not in catalog");
            return ProcessDisposition::Continue;
        };
        let Some(texture_format) = info.texture_format else {
            debug!(stream = %name, format = ?raw.format, "Pixel format has no texture mapping");
            return ProcessDisposition::Continue;
        };

        self.texture = None;
        let image = DmaBufImage {
            width: raw.width,
            height: raw.height,
            drm_format: info.drm_format,
            modifier: raw.modifier,
            planes,
        };
        match self.renderer.import_dmabuf(&image, texture_format) {
            Some(texture) => {
                self.texture = Some(texture);
                self.swap_red_blue = info.swap_red_blue;
                ProcessDisposition::Continue
            }
            None => {
                let failing = raw.modifier.unwrap_or(DRM_FORMAT_MOD_INVALID);
                warn!(
                    stream = %name,
                    format = ?raw.format,
                    modifier = failing,
                    "DMA-BUF import failed, narrowing modifiers and renegotiating"
                );
                formats.remove_modifier(version, raw.format, failing);
                ProcessDisposition::Renegotiate
            }
        }
    }

    fn upload_cpu_frame(&mut self, name: &str, planes: &[MemoryPlane<'_>]) {
        let Some(raw) = self.format else {
            debug!(stream = %name, "Dropping buffer that arrived before negotiation");
            return;
        };
        let Some(info) = lookup_format_info(raw.format) else {
            debug!(stream = %name, format = ?raw.format, "Pixel format not in catalog");
            return;
        };
        let Some(texture_format) = info.texture_format else {
            debug!(stream = %name, format = ?raw.format, "Pixel format has no texture mapping");
            return;
        };
        let Some(plane) = planes.first() else {
            return;
        };

        self.texture = None;
        self.texture =
            self.renderer
                .create_texture(raw.width, raw.height, texture_format, plane.data, plane.stride);
        if self.texture.is_none() {
            debug!(stream = %name, "Texture upload failed");
        }
        self.swap_red_blue = info.swap_red_blue;
    }

    fn update_crop(&mut self, meta: Option<CropMeta>) {
        match meta {
            Some(meta) if meta.width > 0 && meta.height > 0 => {
                self.crop = CropRegion {
                    valid: true,
                    x: meta.x,
                    y: meta.y,
                    width: meta.width,
                    height: meta.height,
                };
            }
            _ => self.crop.valid = false,
        }
    }

    fn update_cursor(&mut self, name: &str, meta: Option<CursorMeta<'_>>) {
        let Some(meta) = meta else {
            self.cursor.valid = false;
            return;
        };
        self.cursor.valid = meta.is_valid();
        if !(self.show_cursor && self.cursor.valid) {
            return;
        }

        if let Some(bitmap) = meta.bitmap {
            let texture_format = lookup_format_info(VideoFormat::from_raw(bitmap.format))
                .and_then(|info| info.texture_format);
            match texture_format {
                Some(texture_format) => {
                    self.cursor.hotspot_x = meta.hotspot_x;
                    self.cursor.hotspot_y = meta.hotspot_y;
                    self.cursor.width = bitmap.width;
                    self.cursor.height = bitmap.height;
                    self.cursor.texture = None;
                    self.cursor.texture = self.renderer.create_texture(
                        bitmap.width,
                        bitmap.height,
                        texture_format,
                        bitmap.data,
                        bitmap.stride,
                    );
                }
                None => {
                    debug!(
                        stream = %name,
                        format = bitmap.format,
                        "Cursor bitmap format not supported"
                    )
                }
            }
        }
        self.cursor.x = meta.position_x;
        self.cursor.y = meta.position_y;
    }

    /// Draws the current texture (cropped if an effective crop is set) and
    /// the cursor overlay on top.
    pub fn render(&mut self) {
        let Some(raw) = self.format else { return };
        let Some(texture) = self.texture.as_deref() else {
            return;
        };
        if self.crop.is_effective(raw.width, raw.height) {
            self.renderer.draw_region(
                texture,
                self.crop.x.max(0) as u32,
                self.crop.y.max(0) as u32,
                self.crop.width,
                self.crop.height,
                self.swap_red_blue,
            );
        } else {
            self.renderer.draw(texture, self.swap_red_blue);
        }

        if self.show_cursor && self.cursor.valid {
            if let Some(cursor) = self.cursor.texture.as_deref() {
                self.renderer.draw_at(
                    cursor,
                    self.cursor.x - self.cursor.hotspot_x,
                    self.cursor.y - self.cursor.hotspot_y,
                );
            }
        }
    }

    pub fn teardown(&mut self) {
        self.texture = None;
        self.cursor.texture = None;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{DrawCall, FakeRenderer, RendererLog};
    use super::*;
    use pipewire::spa::utils::Fraction;
    use std::fs::File;
    use std::os::fd::AsFd;
    use std::sync::{Arc, Mutex};
    use test_log::test;

    fn raw(format: VideoFormat, width: u32, height: u32, modifier: Option<u64>) -> RawFormat {
        RawFormat {
            format,
            width,
            height,
            framerate: Fraction { num: 30, denom: 1 },
            modifier,
            colorspace: crate::video::Colorspace::Bt709,
            range: crate::video::ColorRange::Full,
        }
    }

    fn adapter(fail_imports: bool) -> (DisplayAdapter, Arc<Mutex<RendererLog>>) {
        let (mut renderer, log) = FakeRenderer::new();
        renderer.fail_imports = fail_imports;
        (DisplayAdapter::new(Box::new(renderer), true), log)
    }

    // The import is faked, so any real fd stands in for a DMA-BUF handle.
    fn gpu_view(file: &File) -> BufferView<'_> {
        BufferView {
            planes: BufferPlanes::DmaBuf(vec![DmaBufPlane {
                fd: file.as_fd(),
                offset: 0,
                stride: 7680,
            }]),
            crop: None,
            cursor: None,
        }
    }

    fn memory_view(data: &[u8], stride: u32) -> BufferView<'_> {
        BufferView {
            planes: BufferPlanes::Memory(vec![MemoryPlane { data, stride }]),
            crop: None,
            cursor: None,
        }
    }

    #[test]
    fn test_import_failure_narrows_and_keeps_format() {
        let version = ServerVersion::parse("0.3.77").unwrap();
        let (mut adapter, _log) = adapter(true);
        let mut formats = SupportedFormats::for_display(Some(
            &crate::render::DmaBufCapabilities {
                implicit_modifiers: false,
                formats: vec![crate::render::DmaBufFormat {
                    fourcc: drm_fourcc::DrmFourcc::Argb8888,
                    modifiers: vec![42, 43],
                }],
            },
        ));
        adapter
            .negotiate("d", &version, raw(VideoFormat::BGRA, 1920, 1080, Some(42)))
            .unwrap();

        let file = tempfile::tempfile().unwrap();
        let disposition = adapter.process("d", &version, &mut formats, gpu_view(&file));
        assert_eq!(disposition, ProcessDisposition::Renegotiate);
        // Only the failing modifier is dropped on a new daemon.
        assert_eq!(formats.entries()[0].modifiers, vec![43]);
        // The negotiated format survives until the daemon answers with a
        // new one.
        assert_eq!(adapter.width(), 1920);
        assert!(adapter.texture.is_none());
    }

    #[test]
    fn test_implicit_import_failure_drops_invalid_tag() {
        let version = ServerVersion::parse("0.3.77").unwrap();
        let (mut adapter, _log) = adapter(true);
        let mut formats = SupportedFormats::for_display(Some(
            &crate::render::DmaBufCapabilities {
                implicit_modifiers: true,
                formats: vec![crate::render::DmaBufFormat {
                    fourcc: drm_fourcc::DrmFourcc::Argb8888,
                    modifiers: vec![],
                }],
            },
        ));
        assert_eq!(formats.entries()[0].modifiers, vec![DRM_FORMAT_MOD_INVALID]);
        adapter
            .negotiate("d", &version, raw(VideoFormat::BGRA, 1920, 1080, None))
            .unwrap();

        let file = tempfile::tempfile().unwrap();
        let disposition = adapter.process("d", &version, &mut formats, gpu_view(&file));
        assert_eq!(disposition, ProcessDisposition::Renegotiate);
        assert!(formats.entries()[0].modifiers.is_empty());
    }

    #[test]
    fn test_cpu_upload_recreates_texture_every_frame() {
        let version = ServerVersion::parse("0.3.77").unwrap();
        let (mut adapter, log) = adapter(false);
        let mut formats = SupportedFormats::for_display(None);
        adapter
            .negotiate("d", &version, raw(VideoFormat::BGRx, 4, 2, None))
            .unwrap();

        let data = vec![0u8; 32];
        adapter.process("d", &version, &mut formats, memory_view(&data, 16));
        adapter.process("d", &version, &mut formats, memory_view(&data, 16));
        assert_eq!(log.lock().unwrap().uploads, 2);
        assert!(adapter.texture.is_some());
    }

    #[test]
    fn test_metadata_only_cycle_updates_crop_not_texture() {
        let version = ServerVersion::parse("0.3.77").unwrap();
        let (mut adapter, log) = adapter(false);
        let mut formats = SupportedFormats::for_display(None);
        adapter
            .negotiate("d", &version, raw(VideoFormat::BGRA, 1920, 1080, None))
            .unwrap();

        let view = BufferView {
            planes: BufferPlanes::Empty,
            crop: Some(CropMeta {
                x: 10,
                y: 20,
                width: 640,
                height: 480,
            }),
            cursor: None,
        };
        adapter.process("d", &version, &mut formats, view);
        assert_eq!(log.lock().unwrap().uploads, 0);
        assert!(adapter.crop.valid);
        // A valid crop takes over the size queries.
        assert_eq!(adapter.width(), 640);
        assert_eq!(adapter.height(), 480);
    }

    #[test]
    fn test_degenerate_crop_invalidates() {
        let version = ServerVersion::parse("0.3.77").unwrap();
        let (mut adapter, _log) = adapter(false);
        adapter
            .negotiate("d", &version, raw(VideoFormat::BGRA, 1920, 1080, None))
            .unwrap();

        adapter.update_crop(Some(CropMeta {
            x: 0,
            y: 0,
            width: 100,
            height: 100,
        }));
        assert!(adapter.crop.valid);
        adapter.update_crop(Some(CropMeta {
            x: 0,
            y: 0,
            width: 0,
            height: 100,
        }));
        assert!(!adapter.crop.valid);
        assert_eq!(adapter.width(), 1920);
    }

    #[test]
    fn test_crop_effectiveness() {
        let full = CropRegion {
            valid: true,
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
        };
        assert!(!full.is_effective(1920, 1080));

        let shifted = CropRegion { x: 10, ..full };
        assert!(shifted.is_effective(1920, 1080));

        let smaller = CropRegion {
            width: 1280,
            height: 720,
            ..full
        };
        assert!(smaller.is_effective(1920, 1080));

        let invalid = CropRegion {
            valid: false,
            ..shifted
        };
        assert!(!invalid.is_effective(1920, 1080));
    }

    #[test]
    fn test_render_draws_effective_crop_subregion() {
        let version = ServerVersion::parse("0.3.77").unwrap();
        let (mut adapter, log) = adapter(false);
        let mut formats = SupportedFormats::for_display(None);
        adapter
            .negotiate("d", &version, raw(VideoFormat::BGRA, 1920, 1080, None))
            .unwrap();

        let data = vec![0u8; 1920 * 1080 * 4];
        let view = BufferView {
            planes: BufferPlanes::Memory(vec![MemoryPlane {
                data: &data,
                stride: 7680,
            }]),
            crop: Some(CropMeta {
                x: 10,
                y: 0,
                width: 1280,
                height: 720,
            }),
            cursor: None,
        };
        adapter.process("d", &version, &mut formats, view);
        adapter.render();

        let draws = log.lock().unwrap().draws.clone();
        assert_eq!(
            draws,
            vec![DrawCall::Region {
                x: 10,
                y: 0,
                width: 1280,
                height: 720,
            }]
        );
    }

    #[test]
    fn test_cursor_bitmap_replace_and_translated_draw() {
        let version = ServerVersion::parse("0.3.77").unwrap();
        let (mut adapter, log) = adapter(false);
        let mut formats = SupportedFormats::for_display(None);
        adapter
            .negotiate("d", &version, raw(VideoFormat::BGRA, 16, 16, None))
            .unwrap();

        let pixels = vec![0u8; 16 * 16 * 4];
        let bitmap = vec![0xffu8; 8 * 8 * 4];
        let view = BufferView {
            planes: BufferPlanes::Memory(vec![MemoryPlane {
                data: &pixels,
                stride: 64,
            }]),
            crop: None,
            cursor: Some(CursorMeta {
                id: 3,
                position_x: 100,
                position_y: 60,
                hotspot_x: 4,
                hotspot_y: 6,
                bitmap: Some(super::super::buffer::CursorBitmap {
                    format: VideoFormat::BGRA.as_raw(),
                    width: 8,
                    height: 8,
                    stride: 32,
                    data: &bitmap,
                }),
            }),
        };
        adapter.process("d", &version, &mut formats, view);
        assert!(adapter.cursor.texture.is_some());
        assert_eq!((adapter.cursor.width, adapter.cursor.height), (8, 8));

        adapter.render();
        let draws = log.lock().unwrap().draws.clone();
        assert_eq!(draws.len(), 2);
        // Cursor lands at position minus hotspot.
        assert_eq!(draws[1], DrawCall::At { x: 96, y: 54 });
    }

    #[test]
    fn test_hidden_cursor_keeps_texture_but_skips_draw() {
        let version = ServerVersion::parse("0.3.77").unwrap();
        let (mut adapter, log) = adapter(false);
        let mut formats = SupportedFormats::for_display(None);
        adapter
            .negotiate("d", &version, raw(VideoFormat::BGRA, 16, 16, None))
            .unwrap();

        let pixels = vec![0u8; 16 * 16 * 4];
        adapter.process("d", &version, &mut formats, memory_view(&pixels, 64));
        // Producer reports the cursor left this stream.
        adapter.update_cursor(
            "d",
            Some(CursorMeta {
                id: 0,
                position_x: -1,
                position_y: -1,
                hotspot_x: 0,
                hotspot_y: 0,
                bitmap: None,
            }),
        );
        adapter.render();
        let draws = log.lock().unwrap().draws.clone();
        assert_eq!(draws.len(), 1);
        assert!(matches!(draws[0], DrawCall::Full { .. }));
    }
}
