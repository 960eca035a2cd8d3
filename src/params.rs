//! SPA parameter pods exchanged during stream negotiation.
//!
//! Proposal pods (EnumFormat) advertise a stream's format set to the daemon;
//! once a format comes back, the post-parse set announces metadata slots and
//! buffer requirements. Everything is built as serialized bytes so callers
//! can stage parameters before the loop thread turns them into pod
//! references.

use std::io::Cursor;
use std::mem::size_of;

use pipewire::spa::buffer::DataType;
use pipewire::spa::param::format::{FormatProperties, MediaSubtype, MediaType};
use pipewire::spa::param::format_utils::parse_format;
use pipewire::spa::param::video::{VideoFormat, VideoInfoRaw};
use pipewire::spa::param::ParamType;
use pipewire::spa::pod::deserialize::{PodDeserialize, PodDeserializer};
use pipewire::spa::pod::serialize::PodSerializer;
use pipewire::spa::pod::{ChoiceValue, Object, Pod, Property, PropertyFlags, Value};
use pipewire::spa::sys as spa_sys;
use pipewire::spa::utils::{Choice, ChoiceEnum, ChoiceFlags, Fraction, Id, Rectangle, SpaTypes};

use crate::decode::CompressedCodec;
use crate::error::NegotiationError;
use crate::format::{colorspace_from_spa_matrix, color_range_from_spa_range};
use crate::format::{ServerVersion, SupportedFormat, SupportedFormats};
use crate::video::{ColorRange, Colorspace};

/// Size bounds every proposal advertises.
const DEFAULT_SIZE: Rectangle = Rectangle {
    width: 320,
    height: 240,
};
const MIN_SIZE: Rectangle = Rectangle {
    width: 1,
    height: 1,
};
const MAX_SIZE: Rectangle = Rectangle {
    width: 8192,
    height: 4320,
};

const MIN_FRAMERATE: Fraction = Fraction { num: 0, denom: 1 };
const MAX_FRAMERATE: Fraction = Fraction { num: 360, denom: 1 };

fn serialize(object: Object) -> Result<Vec<u8>, NegotiationError> {
    PodSerializer::serialize(Cursor::new(Vec::new()), &Value::Object(object))
        .map(|(cursor, _)| cursor.into_inner())
        .map_err(|err| NegotiationError::Serialize(format!("{err:?}")))
}

fn media_type_property() -> Property {
    Property::new(
        FormatProperties::MediaType.as_raw(),
        Value::Id(Id(MediaType::Video.as_raw())),
    )
}

fn media_subtype_property(subtype: MediaSubtype) -> Property {
    Property::new(
        FormatProperties::MediaSubtype.as_raw(),
        Value::Id(Id(subtype.as_raw())),
    )
}

fn size_range_property() -> Property {
    Property::new(
        FormatProperties::VideoSize.as_raw(),
        Value::Choice(ChoiceValue::Rectangle(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range {
                default: DEFAULT_SIZE,
                min: MIN_SIZE,
                max: MAX_SIZE,
            },
        ))),
    )
}

fn framerate_range_property(framerate: Fraction) -> Property {
    Property::new(
        FormatProperties::VideoFramerate.as_raw(),
        Value::Choice(ChoiceValue::Fraction(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range {
                default: framerate,
                min: MIN_FRAMERATE,
                max: MAX_FRAMERATE,
            },
        ))),
    )
}

fn raw_format_pod(
    entry: &SupportedFormat,
    with_modifiers: bool,
    framerate: Fraction,
) -> Result<Vec<u8>, NegotiationError> {
    let mut properties = vec![
        media_type_property(),
        media_subtype_property(MediaSubtype::Raw),
        Property::new(
            FormatProperties::VideoFormat.as_raw(),
            Value::Id(Id(entry.spa_format.as_raw())),
        ),
    ];

    if with_modifiers {
        if let Some(&preferred) = entry.modifiers.first() {
            // The choice body repeats the preferred modifier: first as the
            // default, then within the full alternative list.
            let alternatives: Vec<i64> = entry.modifiers.iter().map(|&m| m as i64).collect();
            properties.push(Property {
                key: FormatProperties::VideoModifier.as_raw(),
                flags: PropertyFlags::MANDATORY | PropertyFlags::DONT_FIXATE,
                value: Value::Choice(ChoiceValue::Long(Choice(
                    ChoiceFlags::empty(),
                    ChoiceEnum::Enum {
                        default: preferred as i64,
                        alternatives,
                    },
                ))),
            });
        }
    }

    properties.push(size_range_property());
    properties.push(framerate_range_property(framerate));

    serialize(Object {
        type_: SpaTypes::ObjectParamFormat.as_raw(),
        id: ParamType::EnumFormat.as_raw(),
        properties,
    })
}

fn compressed_format_pod(
    codec: CompressedCodec,
    framerate: Fraction,
) -> Result<Vec<u8>, NegotiationError> {
    let subtype = match codec {
        CompressedCodec::Mjpeg => MediaSubtype::Mjpg,
        CompressedCodec::H264 => MediaSubtype::H264,
    };
    serialize(Object {
        type_: SpaTypes::ObjectParamFormat.as_raw(),
        id: ParamType::EnumFormat.as_raw(),
        properties: vec![
            media_type_property(),
            media_subtype_property(subtype),
            size_range_property(),
            framerate_range_property(framerate),
        ],
    })
}

/// Builds the EnumFormat proposals for one stream, most preferred first.
///
/// Modifier-qualified proposals for every entry come first, then one plain
/// proposal per entry, then the compressed codecs. The grouping steers
/// daemons that accept several matches toward a zero-copy capable format.
/// Daemons too old for modifier choices only get the plain group.
pub fn build_format_params(
    formats: &SupportedFormats,
    server_version: &ServerVersion,
    framerate: Fraction,
) -> Result<Vec<Vec<u8>>, NegotiationError> {
    let mut params = Vec::new();
    if server_version.supports_explicit_modifiers() {
        for entry in formats.entries() {
            if !entry.modifiers.is_empty() {
                params.push(raw_format_pod(entry, true, framerate)?);
            }
        }
    }
    for entry in formats.entries() {
        params.push(raw_format_pod(entry, false, framerate)?);
    }
    for &codec in formats.compressed() {
        params.push(compressed_format_pod(codec, framerate)?);
    }
    if params.is_empty() {
        return Err(NegotiationError::NoFormats);
    }
    Ok(params)
}

// ---------------------------------------------------------------------------
// Post-negotiation parameter sets

fn meta_param(meta_type: u32, size: Value) -> Result<Vec<u8>, NegotiationError> {
    serialize(Object {
        type_: SpaTypes::ObjectParamMeta.as_raw(),
        id: ParamType::Meta.as_raw(),
        properties: vec![
            Property::new(spa_sys::SPA_PARAM_META_type, Value::Id(Id(meta_type))),
            Property::new(spa_sys::SPA_PARAM_META_size, size),
        ],
    })
}

fn crop_meta_param() -> Result<Vec<u8>, NegotiationError> {
    meta_param(
        spa_sys::SPA_META_VideoCrop,
        Value::Int(size_of::<spa_sys::spa_meta_region>() as i32),
    )
}

fn header_meta_param() -> Result<Vec<u8>, NegotiationError> {
    meta_param(
        spa_sys::SPA_META_Header,
        Value::Int(size_of::<spa_sys::spa_meta_header>() as i32),
    )
}

/// Bytes a cursor metadata slot needs for a width x height ARGB bitmap.
pub fn cursor_meta_size(width: u32, height: u32) -> i32 {
    (size_of::<spa_sys::spa_meta_cursor>() + size_of::<spa_sys::spa_meta_bitmap>()) as i32
        + (width * height * 4) as i32
}

fn cursor_meta_param() -> Result<Vec<u8>, NegotiationError> {
    meta_param(
        spa_sys::SPA_META_Cursor,
        Value::Choice(ChoiceValue::Int(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range {
                default: cursor_meta_size(64, 64),
                min: cursor_meta_size(1, 1),
                max: cursor_meta_size(1024, 1024),
            },
        ))),
    )
}

/// Buffer data-type bitmask. Shared memory is always acceptable; DMA-BUF is
/// added when the negotiated format (or daemon version) allows it.
pub fn data_type_mask(dma_buf: bool) -> i32 {
    let mut mask = 1u32 << DataType::MemPtr.as_raw();
    if dma_buf {
        mask |= 1 << DataType::DmaBuf.as_raw();
    }
    mask as i32
}

fn buffers_param(data_types: i32) -> Result<Vec<u8>, NegotiationError> {
    serialize(Object {
        type_: SpaTypes::ObjectParamBuffers.as_raw(),
        id: ParamType::Buffers.as_raw(),
        properties: vec![Property::new(
            spa_sys::SPA_PARAM_BUFFERS_dataType,
            Value::Int(data_types),
        )],
    })
}

fn export_buffers_param(stride: u32, size: u32) -> Result<Vec<u8>, NegotiationError> {
    serialize(Object {
        type_: SpaTypes::ObjectParamBuffers.as_raw(),
        id: ParamType::Buffers.as_raw(),
        properties: vec![
            Property::new(
                spa_sys::SPA_PARAM_BUFFERS_buffers,
                Value::Choice(ChoiceValue::Int(Choice(
                    ChoiceFlags::empty(),
                    ChoiceEnum::Range {
                        default: 4,
                        min: 1,
                        max: 32,
                    },
                ))),
            ),
            Property::new(spa_sys::SPA_PARAM_BUFFERS_blocks, Value::Int(1)),
            Property::new(spa_sys::SPA_PARAM_BUFFERS_size, Value::Int(size as i32)),
            Property::new(spa_sys::SPA_PARAM_BUFFERS_stride, Value::Int(stride as i32)),
            Property::new(spa_sys::SPA_PARAM_BUFFERS_align, Value::Int(16)),
            Property::new(
                spa_sys::SPA_PARAM_BUFFERS_dataType,
                Value::Int(data_type_mask(false)),
            ),
        ],
    })
}

/// Parameter set a display stream sends after a format lands: crop and
/// cursor metadata slots plus the buffer data-type mask.
pub fn build_display_stream_params(data_types: i32) -> Result<Vec<Vec<u8>>, NegotiationError> {
    Ok(vec![
        crop_meta_param()?,
        cursor_meta_param()?,
        buffers_param(data_types)?,
    ])
}

/// Parameter set a camera stream sends after a format lands. Cameras only
/// ever deliver shared memory.
pub fn build_camera_stream_params() -> Result<Vec<Vec<u8>>, NegotiationError> {
    Ok(vec![crop_meta_param()?, buffers_param(data_type_mask(false))?])
}

/// Parameter set an export stream sends after a format lands: header
/// metadata for timestamps plus an explicit buffer geometry.
pub fn build_export_stream_params(
    stride: u32,
    size: u32,
) -> Result<Vec<Vec<u8>>, NegotiationError> {
    Ok(vec![
        crop_meta_param()?,
        header_meta_param()?,
        export_buffers_param(stride, size)?,
    ])
}

// ---------------------------------------------------------------------------
// Negotiated format parsing

/// A raw video format the daemon settled on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawFormat {
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
    /// Set only when the pod carried a modifier property. The value decides
    /// between DMA-BUF import paths; absence forces shared memory.
    pub modifier: Option<u64>,
    pub colorspace: Colorspace,
    pub range: ColorRange,
}

/// A compressed video format the daemon settled on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressedFormat {
    pub codec: CompressedCodec,
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatedFormat {
    Raw(RawFormat),
    Compressed(CompressedFormat),
    /// Video subtypes this crate does not handle, or non-video media.
    Unsupported,
}

fn find_prop_value<'a, T: PodDeserialize<'a>>(param: &'a Pod, key: u32) -> Option<T> {
    let object = param.as_object().ok()?;
    let prop = object.find_prop(Id(key))?;
    PodDeserializer::deserialize_from::<T>(prop.value().as_bytes())
        .ok()
        .map(|(_, value)| value)
}

fn prop_id(param: &Pod, key: u32) -> Option<u32> {
    find_prop_value::<Id>(param, key).map(|id| id.0)
}

fn has_prop(param: &Pod, key: u32) -> bool {
    param
        .as_object()
        .ok()
        .and_then(|object| object.find_prop(Id(key)))
        .is_some()
}

fn parse_raw_format(param: &Pod) -> Result<RawFormat, NegotiationError> {
    let mut info = VideoInfoRaw::new();
    info.parse(param)
        .map_err(|_| NegotiationError::MalformedPod("raw video info"))?;

    let modifier = has_prop(param, FormatProperties::VideoModifier.as_raw())
        .then(|| info.modifier());

    let colorspace = match prop_id(param, spa_sys::SPA_FORMAT_VIDEO_colorMatrix) {
        Some(matrix) => colorspace_from_spa_matrix(matrix),
        None => Colorspace::Default,
    };
    let range = match prop_id(param, spa_sys::SPA_FORMAT_VIDEO_colorRange) {
        Some(value) => color_range_from_spa_range(value),
        None => ColorRange::Default,
    };

    Ok(RawFormat {
        format: info.format(),
        width: info.size().width,
        height: info.size().height,
        framerate: info.framerate(),
        modifier,
        colorspace,
        range,
    })
}

fn parse_compressed_format(param: &Pod, codec: CompressedCodec) -> CompressedFormat {
    let size = find_prop_value::<Rectangle>(param, FormatProperties::VideoSize.as_raw())
        .unwrap_or(Rectangle {
            width: 0,
            height: 0,
        });
    let framerate = find_prop_value::<Fraction>(param, FormatProperties::VideoFramerate.as_raw())
        .unwrap_or(Fraction { num: 0, denom: 1 });
    CompressedFormat {
        codec,
        width: size.width,
        height: size.height,
        framerate,
    }
}

/// Classifies and parses the format pod a param-changed event delivered.
pub fn parse_stream_format(param: &Pod) -> Result<NegotiatedFormat, NegotiationError> {
    let (media_type, media_subtype) =
        parse_format(param).map_err(|_| NegotiationError::MalformedPod("not a format object"))?;
    if media_type != MediaType::Video {
        return Ok(NegotiatedFormat::Unsupported);
    }
    match media_subtype {
        MediaSubtype::Raw => parse_raw_format(param).map(NegotiatedFormat::Raw),
        MediaSubtype::Mjpg => Ok(NegotiatedFormat::Compressed(parse_compressed_format(
            param,
            CompressedCodec::Mjpeg,
        ))),
        MediaSubtype::H264 => Ok(NegotiatedFormat::Compressed(parse_compressed_format(
            param,
            CompressedCodec::H264,
        ))),
        _ => Ok(NegotiatedFormat::Unsupported),
    }
}
