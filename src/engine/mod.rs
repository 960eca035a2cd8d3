//! Per-stream state machines.
//!
//! Every connected stream is backed by an [`EngineSlot`] living in the
//! session's shared state. The slot owns the negotiation flags common to all
//! stream kinds and an [`Adapter`] with the kind-specific state: display
//! capture renders into host textures, camera capture feeds a frame sink,
//! export fills outgoing buffers from host frames.
//!
//! Slots never touch the transport directly. The session loop parses buffers
//! into [`buffer::BufferView`]s and applies the returned
//! [`ProcessDisposition`]; parameter updates flow back as serialized pods.

pub(crate) mod buffer;
mod camera;
mod display;
mod export;

pub(crate) use camera::CameraAdapter;
pub(crate) use display::DisplayAdapter;
pub(crate) use export::ExportAdapter;

use pipewire::spa::pod::Pod;
use pipewire::spa::utils::Fraction;
use pipewire::sys as pw_sys;
use tracing::{debug, warn};

use crate::error::NegotiationError;
use crate::format::{ServerVersion, SupportedFormats};
use crate::params;
use crate::video::{Framerate, OwnedVideoFrame};

use self::buffer::BufferView;

/// Key of one engine within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EngineId(pub(crate) u64);

/// Kind-specific half of a stream engine.
pub(crate) enum Adapter {
    Display(DisplayAdapter),
    Camera(CameraAdapter),
    Export(ExportAdapter),
}

impl Adapter {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Display(_) => "display",
            Self::Camera(_) => "camera",
            Self::Export(_) => "export",
        }
    }
}

/// What the session loop should do after a buffer was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessDisposition {
    Continue,
    /// A GPU import failed; rebuild and resend the format proposals.
    Renegotiate,
}

/// One stream engine: negotiation state plus its adapter.
pub(crate) struct EngineSlot {
    pub name: String,
    pub formats: SupportedFormats,
    pub framerate: Framerate,
    pub adapter: Adapter,
    /// Set only after the follow-up stream params were sent successfully.
    pub negotiated: bool,
    /// Tracks the transport's Streaming sub-state.
    pub streaming: bool,
    pub node_id: Option<u32>,
}

impl EngineSlot {
    pub fn new(
        name: String,
        formats: SupportedFormats,
        framerate: Framerate,
        adapter: Adapter,
    ) -> Self {
        Self {
            name,
            formats,
            framerate,
            adapter,
            negotiated: false,
            streaming: false,
            node_id: None,
        }
    }

    pub fn width(&self) -> u32 {
        if !self.negotiated {
            return 0;
        }
        match &self.adapter {
            Adapter::Display(display) => display.width(),
            Adapter::Camera(camera) => camera.width(),
            Adapter::Export(export) => export.width(),
        }
    }

    pub fn height(&self) -> u32 {
        if !self.negotiated {
            return 0;
        }
        match &self.adapter {
            Adapter::Display(display) => display.height(),
            Adapter::Camera(camera) => camera.height(),
            Adapter::Export(export) => export.height(),
        }
    }

    /// Applies a Format param. On success returns the follow-up stream
    /// params (metas, buffer requirements) to send back; the slot counts as
    /// negotiated only once [`EngineSlot::mark_negotiated`] confirms that
    /// send went through.
    pub fn handle_format(&mut self, version: &ServerVersion, param: &Pod) -> Option<Vec<Vec<u8>>> {
        let format = match params::parse_stream_format(param) {
            Ok(format) => format,
            Err(err) => {
                warn!(stream = %self.name, error = %err, "Dropping malformed format param");
                return None;
            }
        };
        if let params::NegotiatedFormat::Unsupported = format {
            debug!(stream = %self.name, "Ignoring format param for unsupported media");
            return None;
        }

        self.negotiated = false;
        let built = match (&mut self.adapter, format) {
            (Adapter::Display(display), params::NegotiatedFormat::Raw(raw)) => {
                display.negotiate(&self.name, version, raw)
            }
            (Adapter::Camera(camera), params::NegotiatedFormat::Raw(raw)) => {
                camera.negotiate_raw(&self.name, raw)
            }
            (Adapter::Camera(camera), params::NegotiatedFormat::Compressed(compressed)) => {
                camera.negotiate_compressed(&self.name, compressed)
            }
            (Adapter::Export(export), params::NegotiatedFormat::Raw(raw)) => {
                export.negotiate(&self.name, raw)
            }
            (adapter, _) => Err(NegotiationError::Unsupported(match adapter {
                Adapter::Display(_) => "display streams carry raw video only",
                _ => "export streams carry raw video only",
            })),
        };

        match built {
            Ok(stream_params) => Some(stream_params),
            Err(err) => {
                warn!(stream = %self.name, error = %err, "Format transition aborted");
                None
            }
        }
    }

    pub fn mark_negotiated(&mut self) {
        self.negotiated = true;
    }

    /// Applies one dequeued buffer to the adapter.
    pub fn handle_buffer(
        &mut self,
        version: &ServerVersion,
        view: BufferView<'_>,
    ) -> ProcessDisposition {
        let Self {
            name,
            formats,
            adapter,
            ..
        } = self;
        match adapter {
            Adapter::Display(display) => display.process(name, version, formats, view),
            Adapter::Camera(camera) => {
                camera.process(name, view);
                ProcessDisposition::Continue
            }
            Adapter::Export(_) => {
                debug!(stream = %name, "Ignoring incoming buffer on export stream");
                ProcessDisposition::Continue
            }
        }
    }

    /// Writes a host frame into a dequeued outgoing buffer. Only export
    /// slots produce anything; the result says whether the buffer carries a
    /// frame worth queueing.
    ///
    /// # Safety
    ///
    /// `buffer` must be dequeued from this slot's stream and not yet
    /// requeued.
    pub unsafe fn fill_export(
        &mut self,
        buffer: *mut pw_sys::pw_buffer,
        frame: &OwnedVideoFrame,
    ) -> bool {
        let Self { name, adapter, .. } = self;
        match adapter {
            Adapter::Export(export) => export.fill_buffer(name, buffer, frame),
            _ => false,
        }
    }

    /// Rebuilds the format proposals from the current (possibly narrowed)
    /// format list, for renegotiation after an import failure.
    pub fn rebuild_proposals(
        &self,
        version: &ServerVersion,
    ) -> Result<Vec<Vec<u8>>, NegotiationError> {
        params::build_format_params(
            &self.formats,
            version,
            Fraction {
                num: self.framerate.num,
                denom: self.framerate.den,
            },
        )
    }

    pub fn set_cursor_visible(&mut self, visible: bool) {
        if let Adapter::Display(display) = &mut self.adapter {
            display.set_cursor_visible(visible);
        }
    }

    /// Draws the current frame and cursor. No-op for adapters without a
    /// render path.
    pub fn render(&mut self) {
        if let Adapter::Display(display) = &mut self.adapter {
            if self.negotiated {
                display.render();
            }
        }
    }

    /// Releases adapter resources and notifies downstream consumers. The
    /// slot is dropped right after.
    pub fn teardown(&mut self) {
        match &mut self.adapter {
            Adapter::Display(display) => display.teardown(),
            Adapter::Camera(camera) => camera.teardown(),
            Adapter::Export(_) => {}
        }
    }
}
