//! Pixel-format catalog and negotiation bookkeeping.
//!
//! The catalog is the fixed table of transport formats this crate can carry
//! end to end: SPA format id, DRM fourcc for DMA-BUF import, the texture
//! format a renderer allocates for it and the frame format a sink receives.
//! Streams advertise a per-adapter subset of it, and narrow their modifier
//! sets whenever a GPU import fails.

use drm_fourcc::DrmFourcc;
use pipewire::spa::param::video::VideoFormat;
use pipewire::spa::sys as spa_sys;

use crate::decode::CompressedCodec;
use crate::render::{DmaBufCapabilities, TextureFormat};
use crate::video::{ColorRange, Colorspace, VideoFrameFormat};

/// Layout tag for "driver picks, no explicit modifier".
pub const DRM_FORMAT_MOD_INVALID: u64 = (1u64 << 56) - 1;
/// Plain linear layout.
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// One row of the fixed pixel-format table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub spa_format: VideoFormat,
    pub drm_format: DrmFourcc,
    /// Renderer-side layout, `None` when no texture can be made of it.
    pub texture_format: Option<TextureFormat>,
    /// Sink-side layout, `None` when frames of it cannot be forwarded raw.
    pub frame_format: Option<VideoFrameFormat>,
    pub swap_red_blue: bool,
    pub bpp: u32,
    pub pretty_name: &'static str,
}

const SUPPORTED_FORMATS: [FormatInfo; 5] = [
    FormatInfo {
        spa_format: VideoFormat::BGRA,
        drm_format: DrmFourcc::Argb8888,
        texture_format: Some(TextureFormat::Bgra),
        frame_format: Some(VideoFrameFormat::Bgra),
        swap_red_blue: false,
        bpp: 4,
        pretty_name: "ARGB8888",
    },
    FormatInfo {
        spa_format: VideoFormat::RGBA,
        drm_format: DrmFourcc::Abgr8888,
        texture_format: Some(TextureFormat::Rgba),
        frame_format: Some(VideoFrameFormat::Rgba),
        swap_red_blue: false,
        bpp: 4,
        pretty_name: "ABGR8888",
    },
    FormatInfo {
        spa_format: VideoFormat::BGRx,
        drm_format: DrmFourcc::Xrgb8888,
        texture_format: Some(TextureFormat::Bgrx),
        frame_format: Some(VideoFrameFormat::Bgrx),
        swap_red_blue: false,
        bpp: 4,
        pretty_name: "XRGB8888",
    },
    FormatInfo {
        spa_format: VideoFormat::RGBx,
        drm_format: DrmFourcc::Xbgr8888,
        texture_format: Some(TextureFormat::Bgrx),
        frame_format: None,
        swap_red_blue: true,
        bpp: 4,
        pretty_name: "XBGR8888",
    },
    FormatInfo {
        spa_format: VideoFormat::YUY2,
        drm_format: DrmFourcc::Yuyv,
        texture_format: None,
        frame_format: Some(VideoFrameFormat::Yuy2),
        swap_red_blue: false,
        bpp: 2,
        pretty_name: "YUYV422",
    },
];

/// Formats the display (zero-copy) path offers, most preferred first.
const DISPLAY_FORMATS: [VideoFormat; 4] = [
    VideoFormat::BGRA,
    VideoFormat::RGBA,
    VideoFormat::BGRx,
    VideoFormat::RGBx,
];

/// Formats the CPU (camera) path offers.
const CAMERA_FORMATS: [VideoFormat; 2] = [VideoFormat::RGBA, VideoFormat::YUY2];

pub fn lookup_format_info(spa_format: VideoFormat) -> Option<FormatInfo> {
    SUPPORTED_FORMATS
        .iter()
        .copied()
        .find(|f| f.spa_format == spa_format)
}

/// Reverse lookup from the frame format a host produces to the wire format
/// offered for it. Formats without a frame mapping have no reverse entry.
pub fn spa_from_frame_format(format: VideoFrameFormat) -> Option<VideoFormat> {
    SUPPORTED_FORMATS
        .iter()
        .find(|f| f.frame_format == Some(format))
        .map(|f| f.spa_format)
}

// ---------------------------------------------------------------------------

/// Remote daemon version, from the core info greeting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerVersion {
    pub major: i32,
    pub minor: i32,
    pub micro: i32,
}

impl ServerVersion {
    /// Parses "major.minor.micro". Trailing junk after the micro digits is
    /// ignored; a missing component is a parse failure.
    pub fn parse(version: &str) -> Option<Self> {
        fn leading_int(part: &str) -> Option<i32> {
            let end = part
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(part.len());
            part[..end].parse().ok()
        }

        let mut parts = version.split('.');
        let major = leading_int(parts.next()?)?;
        let minor = leading_int(parts.next()?)?;
        let micro = leading_int(parts.next()?)?;
        Some(Self {
            major,
            minor,
            micro,
        })
    }

    pub fn check(&self, major: i32, minor: i32, micro: i32) -> bool {
        (self.major, self.minor, self.micro) >= (major, minor, micro)
    }

    /// Old enough daemons choke on modifier-qualified format proposals.
    pub fn supports_explicit_modifiers(&self) -> bool {
        self.check(0, 3, 33)
    }

    /// Below this, dropping one modifier from an offer is not understood;
    /// the whole modifier set has to go instead.
    pub fn supports_selective_modifier_removal(&self) -> bool {
        self.check(0, 3, 40)
    }

    /// DMA-BUF buffers may be negotiated without an explicit modifier.
    pub fn supports_implicit_dmabuf(&self) -> bool {
        self.check(0, 3, 24)
    }
}

// ---------------------------------------------------------------------------

/// Color matrix id from a raw video format pod, mapped to the sink enum.
/// Unknown values take the default branch.
pub fn colorspace_from_spa_matrix(matrix: u32) -> Colorspace {
    match matrix {
        spa_sys::SPA_VIDEO_COLOR_MATRIX_RGB => Colorspace::Default,
        spa_sys::SPA_VIDEO_COLOR_MATRIX_BT601 => Colorspace::Bt601,
        spa_sys::SPA_VIDEO_COLOR_MATRIX_BT709 => Colorspace::Bt709,
        _ => Colorspace::Default,
    }
}

/// Color range id from a raw video format pod, mapped to the sink enum.
pub fn color_range_from_spa_range(range: u32) -> ColorRange {
    match range {
        spa_sys::SPA_VIDEO_COLOR_RANGE_0_255 => ColorRange::Full,
        spa_sys::SPA_VIDEO_COLOR_RANGE_16_235 => ColorRange::Partial,
        _ => ColorRange::Default,
    }
}

// ---------------------------------------------------------------------------

/// One advertised format and the GPU layout modifiers importable for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedFormat {
    pub spa_format: VideoFormat,
    pub drm_format: DrmFourcc,
    pub modifiers: Vec<u64>,
}

/// The format set one stream offers. Built once at stream creation and only
/// ever narrowed afterwards, when a modifier turns out not to import.
#[derive(Debug, Clone, Default)]
pub struct SupportedFormats {
    entries: Vec<SupportedFormat>,
    compressed: Vec<CompressedCodec>,
}

impl SupportedFormats {
    /// Display path: catalog order, filtered down to what the renderer can
    /// actually import. Without DMA-BUF capability every format is offered
    /// for shared memory only.
    pub fn for_display(caps: Option<&DmaBufCapabilities>) -> Self {
        let mut entries = Vec::new();
        for spa_format in DISPLAY_FORMATS {
            let Some(info) = lookup_format_info(spa_format) else {
                continue;
            };
            let mut modifiers = Vec::new();
            if let Some(caps) = caps {
                let Some(format_caps) = caps
                    .formats
                    .iter()
                    .find(|f| f.fourcc == info.drm_format)
                else {
                    continue;
                };
                modifiers.extend_from_slice(&format_caps.modifiers);
                if caps.implicit_modifiers {
                    modifiers.push(DRM_FORMAT_MOD_INVALID);
                }
            }
            entries.push(SupportedFormat {
                spa_format: info.spa_format,
                drm_format: info.drm_format,
                modifiers,
            });
        }
        Self {
            entries,
            compressed: Vec::new(),
        }
    }

    /// Camera path: CPU formats plus the compressed codecs webcams commonly
    /// deliver. Never carries modifiers.
    pub fn for_camera() -> Self {
        let entries = CAMERA_FORMATS
            .iter()
            .filter_map(|&f| lookup_format_info(f))
            .map(|info| SupportedFormat {
                spa_format: info.spa_format,
                drm_format: info.drm_format,
                modifiers: Vec::new(),
            })
            .collect();
        Self {
            entries,
            compressed: vec![CompressedCodec::Mjpeg, CompressedCodec::H264],
        }
    }

    /// Drops the compressed codecs. Used when the host supplies no decoder
    /// backend, so compressed formats must not be offered.
    pub fn clear_compressed(&mut self) {
        self.compressed.clear();
    }

    /// Export path: the single format the host produces.
    pub fn for_export(format: VideoFormat) -> Self {
        let entries = lookup_format_info(format)
            .map(|info| SupportedFormat {
                spa_format: info.spa_format,
                drm_format: info.drm_format,
                modifiers: Vec::new(),
            })
            .into_iter()
            .collect();
        Self {
            entries,
            compressed: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[SupportedFormat] {
        &self.entries
    }

    pub fn compressed(&self) -> &[CompressedCodec] {
        &self.compressed
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.compressed.is_empty()
    }

    /// Drops a modifier that failed to import. Old daemons only understand
    /// losing the whole modifier set; newer ones accept removing just the
    /// failing value, keeping the rest for the next renegotiation.
    pub fn remove_modifier(
        &mut self,
        server_version: &ServerVersion,
        spa_format: VideoFormat,
        modifier: u64,
    ) {
        for entry in self.entries.iter_mut() {
            if entry.spa_format != spa_format {
                continue;
            }
            if !server_version.supports_selective_modifier_removal() {
                entry.modifiers.clear();
                continue;
            }
            entry.modifiers.retain(|&m| m != modifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::DmaBufFormat;

    #[test]
    fn test_catalog_lookup() {
        let bgra = lookup_format_info(VideoFormat::BGRA).expect("BGRA should be in the catalog");
        assert_eq!(bgra.drm_format, DrmFourcc::Argb8888, "BGRA maps to ARGB8888");
        assert_eq!(bgra.bpp, 4);
        assert!(!bgra.swap_red_blue);

        let yuy2 = lookup_format_info(VideoFormat::YUY2).expect("YUY2 should be in the catalog");
        assert_eq!(yuy2.bpp, 2, "YUY2 is a packed 2-byte format");
        assert!(yuy2.texture_format.is_none(), "YUY2 has no texture path");

        let rgbx = lookup_format_info(VideoFormat::RGBx).expect("RGBx should be in the catalog");
        assert!(rgbx.swap_red_blue, "RGBx needs the channel swap");
        assert!(rgbx.frame_format.is_none(), "RGBx cannot be forwarded raw");

        assert!(lookup_format_info(VideoFormat::NV12).is_none());
    }

    #[test]
    fn test_server_version_parse() {
        assert_eq!(
            ServerVersion::parse("0.3.58"),
            Some(ServerVersion {
                major: 0,
                minor: 3,
                micro: 58
            })
        );
        // Trailing junk after the micro digits is tolerated.
        assert_eq!(
            ServerVersion::parse("1.2.3-rc1"),
            Some(ServerVersion {
                major: 1,
                minor: 2,
                micro: 3
            })
        );
        assert_eq!(ServerVersion::parse("0.3"), None);
        assert_eq!(ServerVersion::parse("garbage"), None);
        assert_eq!(ServerVersion::parse(""), None);
    }

    #[test]
    fn test_server_version_gates() {
        let old = ServerVersion {
            major: 0,
            minor: 3,
            micro: 32,
        };
        assert!(!old.supports_explicit_modifiers());
        assert!(!old.supports_selective_modifier_removal());
        assert!(old.supports_implicit_dmabuf());

        let current = ServerVersion {
            major: 0,
            minor: 3,
            micro: 58,
        };
        assert!(current.supports_explicit_modifiers());
        assert!(current.supports_selective_modifier_removal());

        let unparsed = ServerVersion::default();
        assert!(
            !unparsed.supports_implicit_dmabuf(),
            "an unparsed version must disable optional features"
        );

        let newer_major = ServerVersion {
            major: 1,
            minor: 0,
            micro: 0,
        };
        assert!(newer_major.check(0, 3, 40));
    }

    #[test]
    fn test_color_mappings() {
        assert_eq!(
            colorspace_from_spa_matrix(spa_sys::SPA_VIDEO_COLOR_MATRIX_BT709),
            Colorspace::Bt709
        );
        assert_eq!(
            colorspace_from_spa_matrix(spa_sys::SPA_VIDEO_COLOR_MATRIX_RGB),
            Colorspace::Default
        );
        assert_eq!(colorspace_from_spa_matrix(0xdead), Colorspace::Default);

        assert_eq!(
            color_range_from_spa_range(spa_sys::SPA_VIDEO_COLOR_RANGE_0_255),
            ColorRange::Full
        );
        assert_eq!(
            color_range_from_spa_range(spa_sys::SPA_VIDEO_COLOR_RANGE_16_235),
            ColorRange::Partial
        );
        assert_eq!(color_range_from_spa_range(0xdead), ColorRange::Default);
    }

    fn caps_with(fourcc: DrmFourcc, modifiers: &[u64], implicit: bool) -> DmaBufCapabilities {
        DmaBufCapabilities {
            implicit_modifiers: implicit,
            formats: vec![DmaBufFormat {
                fourcc,
                modifiers: modifiers.to_vec(),
            }],
        }
    }

    #[test]
    fn test_display_formats_filtered_by_capabilities() {
        let caps = caps_with(DrmFourcc::Argb8888, &[DRM_FORMAT_MOD_LINEAR, 0x123], true);
        let formats = SupportedFormats::for_display(Some(&caps));

        assert_eq!(formats.entries().len(), 1, "only ARGB8888 was importable");
        let entry = &formats.entries()[0];
        assert_eq!(entry.spa_format, VideoFormat::BGRA);
        assert_eq!(
            entry.modifiers,
            vec![DRM_FORMAT_MOD_LINEAR, 0x123, DRM_FORMAT_MOD_INVALID],
            "implicit support appends the invalid modifier"
        );
    }

    #[test]
    fn test_display_formats_without_dmabuf() {
        let formats = SupportedFormats::for_display(None);
        assert_eq!(formats.entries().len(), 4);
        assert!(
            formats.entries().iter().all(|e| e.modifiers.is_empty()),
            "no renderer capability means shared memory only"
        );
    }

    #[test]
    fn test_camera_formats() {
        let formats = SupportedFormats::for_camera();
        let spa: Vec<_> = formats.entries().iter().map(|e| e.spa_format).collect();
        assert_eq!(spa, vec![VideoFormat::RGBA, VideoFormat::YUY2]);
        assert!(formats.entries().iter().all(|e| e.modifiers.is_empty()));
        assert_eq!(
            formats.compressed(),
            &[CompressedCodec::Mjpeg, CompressedCodec::H264]
        );
    }

    #[test]
    fn test_remove_modifier_selective() {
        let version = ServerVersion {
            major: 0,
            minor: 3,
            micro: 40,
        };
        let caps = caps_with(DrmFourcc::Argb8888, &[1, 2, 1, 3], false);
        let mut formats = SupportedFormats::for_display(Some(&caps));

        formats.remove_modifier(&version, VideoFormat::BGRA, 1);
        assert_eq!(
            formats.entries()[0].modifiers,
            vec![2, 3],
            "every occurrence of the failing modifier goes away"
        );

        // Removing it again changes nothing.
        formats.remove_modifier(&version, VideoFormat::BGRA, 1);
        assert_eq!(formats.entries()[0].modifiers, vec![2, 3]);

        // Unrelated formats are untouched.
        formats.remove_modifier(&version, VideoFormat::RGBA, 2);
        assert_eq!(formats.entries()[0].modifiers, vec![2, 3]);
    }

    #[test]
    fn test_remove_modifier_clears_all_on_old_server() {
        let version = ServerVersion {
            major: 0,
            minor: 3,
            micro: 39,
        };
        let caps = caps_with(DrmFourcc::Argb8888, &[1, 2, 3], false);
        let mut formats = SupportedFormats::for_display(Some(&caps));

        formats.remove_modifier(&version, VideoFormat::BGRA, 2);
        assert!(
            formats.entries()[0].modifiers.is_empty(),
            "old servers lose the whole modifier set"
        );
    }

    #[test]
    fn test_export_formats() {
        let formats = SupportedFormats::for_export(VideoFormat::RGBA);
        assert_eq!(formats.entries().len(), 1);
        assert_eq!(formats.entries()[0].spa_format, VideoFormat::RGBA);
        assert!(formats.compressed().is_empty());
    }
}
