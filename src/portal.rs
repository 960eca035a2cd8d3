//! XDG desktop portal glue for screencast and camera access.
//!
//! The portals are the only sanctioned way for a sandboxable app to reach
//! screen content or cameras: the compositor side shows the picker dialog,
//! then hands back a PipeWire fd scoped to exactly the granted sources.
//! Feed that fd to [`PipeWireSession::connect_fd`](crate::session::PipeWireSession::connect_fd)
//! and connect streams to the node ids the portal advertised.
//!
//! Works against the usual backends (xdg-desktop-portal-gnome, -kde, -wlr).

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use ashpd::desktop::camera::Camera;
use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType};
use ashpd::desktop::Session;
use ashpd::enumflags2::BitFlags;
use ashpd::WindowIdentifier;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::PortalError;
use crate::session::{DiscoveredNode, DiscoveryListener};

pub use ashpd::desktop::PersistMode;

/// Media role camera nodes carry. Their media.class is the generic
/// "Video/Source" shared by every video producer, so the role is the
/// discriminating key.
const CAMERA_MEDIA_ROLE: &str = "Camera";

/// What the screencast picker dialog offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureType {
    /// A whole output.
    #[default]
    Monitor,
    /// A single toplevel window.
    Window,
    /// A compositor-created virtual output.
    Virtual,
}

impl CaptureType {
    fn source_type(self) -> SourceType {
        match self {
            CaptureType::Monitor => SourceType::Monitor,
            CaptureType::Window => SourceType::Window,
            CaptureType::Virtual => SourceType::Virtual,
        }
    }
}

/// Options for [`open_screencast`].
pub struct ScreencastOptions {
    pub capture_type: CaptureType,
    /// Ask the compositor to paint the cursor into the frames. Ignored by
    /// compositors that can send the cursor as stream metadata instead.
    pub show_cursor: bool,
    /// Token from a previous grant; skips the picker dialog while the
    /// compositor still honors it.
    pub restore_token: Option<String>,
    pub persist_mode: PersistMode,
}

impl Default for ScreencastOptions {
    fn default() -> Self {
        Self {
            capture_type: CaptureType::Monitor,
            show_cursor: true,
            restore_token: None,
            persist_mode: PersistMode::ExplicitlyRevoked,
        }
    }
}

/// Keeps the portal grant alive. Dropping it (or the fd it scoped) ends the
/// compositor's obligation to keep streaming.
pub struct ScreencastSession {
    session: Session<'static, Screencast<'static>>,
}

impl ScreencastSession {
    /// Tell the portal the session is over instead of letting the grant
    /// linger until the connection drops.
    pub async fn close(self) -> Result<(), PortalError> {
        self.session.close().await?;
        Ok(())
    }
}

impl Drop for ScreencastSession {
    fn drop(&mut self) {
        info!("Screencast portal session closed");
    }
}

/// Everything a transport session needs from a granted screencast.
pub struct OpenedScreencast {
    /// Keep alive for as long as the capture runs.
    pub session: ScreencastSession,
    /// The node to connect the display stream to.
    pub node_id: u32,
    /// Daemon connection scoped to the granted source.
    pub fd: OwnedFd,
    /// Pass to the next [`open_screencast`] to skip the picker.
    pub restore_token: Option<String>,
    /// Logical size hint, when the compositor advertises one.
    pub size: Option<(i32, i32)>,
}

/// Metadata-capable compositors win outright since the cursor arrives out of
/// band and stays toggleable; otherwise embedding is only requested when the
/// cursor should actually show.
fn pick_cursor_mode(available: BitFlags<CursorMode>, show_cursor: bool) -> CursorMode {
    if available.contains(CursorMode::Metadata) {
        CursorMode::Metadata
    } else if show_cursor && available.contains(CursorMode::Embedded) {
        CursorMode::Embedded
    } else {
        CursorMode::Hidden
    }
}

/// Run the full screencast handshake: create a session, select sources,
/// start, and open the scoped daemon connection.
pub async fn open_screencast(options: ScreencastOptions) -> Result<OpenedScreencast, PortalError> {
    debug!("Connecting to the screencast portal");
    let proxy = Screencast::new().await?;

    let available = proxy.available_cursor_modes().await?;
    let cursor_mode = pick_cursor_mode(available, options.show_cursor);
    debug!(?cursor_mode, capture_type = ?options.capture_type, "Creating screencast session");

    let session = proxy.create_session().await?;
    proxy
        .select_sources(
            &session,
            cursor_mode,
            options.capture_type.source_type().into(),
            false,
            options.restore_token.as_deref(),
            options.persist_mode,
        )
        .await?
        .response()?;

    let response = proxy
        .start(&session, &WindowIdentifier::default())
        .await?
        .response()?;

    let streams = response.streams();
    if streams.len() > 1 {
        warn!("Received more than one stream when only one was expected");
    }
    // The KDE portal sometimes attaches extra streams; the real one is last.
    let stream = streams.last().ok_or(PortalError::NoStreams)?;
    let node_id = stream.pipe_wire_node_id();
    let size = stream.size();
    let restore_token = response.restore_token().map(str::to_owned);

    let fd = proxy.open_pipe_wire_remote(&session).await?;

    info!(node_id, ?size, "Screencast started");

    Ok(OpenedScreencast {
        session: ScreencastSession { session },
        node_id,
        fd,
        restore_token,
        size,
    })
}

/// Ask for camera access and open the scoped daemon connection. The shared
/// camera nodes then show up through the session's discovery listener.
pub async fn open_camera() -> Result<OwnedFd, PortalError> {
    debug!("Connecting to the camera portal");
    let camera = Camera::new().await?;
    if !camera.is_present().await? {
        return Err(PortalError::NoCamera);
    }
    camera.request_access().await?.response()?;
    let fd = camera.open_pipe_wire_remote().await?;
    info!("Camera portal access granted");
    Ok(fd)
}

/// A camera advertised on a portal-scoped connection.
#[derive(Debug, Clone)]
pub struct CameraDevice {
    /// Stable id: the object serial, or the node name for nodes without one.
    pub device_id: String,
    /// Registry global, used to target the capture stream.
    pub global_id: u32,
    /// Human-readable name for pickers.
    pub display_name: String,
}

/// Tracks camera nodes as the registry announces and withdraws them.
///
/// Clone handles share state: hand one clone to
/// [`PipeWireSession::connect_fd`](crate::session::PipeWireSession::connect_fd)
/// as the discovery listener and keep another for lookups.
#[derive(Default, Clone)]
pub struct CameraDeviceRegistry {
    devices: Arc<Mutex<HashMap<u32, CameraDevice>>>,
}

impl CameraDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices currently advertised, in no particular order.
    pub fn devices(&self) -> Vec<CameraDevice> {
        self.devices.lock().values().cloned().collect()
    }

    /// Look up a device by its stable id.
    pub fn find(&self, device_id: &str) -> Option<CameraDevice> {
        self.devices
            .lock()
            .values()
            .find(|device| device.device_id == device_id)
            .cloned()
    }
}

impl DiscoveryListener for CameraDeviceRegistry {
    fn node_added(&mut self, node: &DiscoveredNode) {
        if node.media_role.as_deref() != Some(CAMERA_MEDIA_ROLE) {
            return;
        }
        let Some(device_id) = node.serial.clone().or_else(|| node.node_name.clone()) else {
            debug!(global_id = node.global_id, "Skipping camera node without serial or name");
            return;
        };
        let display_name = node
            .description
            .clone()
            .or_else(|| node.node_name.clone())
            .unwrap_or_else(|| device_id.clone());
        info!(device = %device_id, name = %display_name, "Camera appeared");
        self.devices.lock().insert(
            node.global_id,
            CameraDevice {
                device_id,
                global_id: node.global_id,
                display_name,
            },
        );
    }

    fn node_removed(&mut self, global_id: u32) {
        if let Some(device) = self.devices.lock().remove(&global_id) {
            info!(device = %device.device_id, "Camera removed");
        }
    }
}
