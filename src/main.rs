//! Capture and virtual-camera demo.
//!
//! Modes:
//! - screencast: pick a monitor or window through the portal dialog, then
//!   drive the display path with a stats-only renderer (no GPU required).
//! - camera: request camera access, deliver CPU frames through a channel
//!   sink, and log frame statistics until Ctrl-C.
//! - virtual-camera: publish a camera node other applications can open and
//!   feed it a moving test pattern.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pipewire_video_core::portal::{self, CaptureType, ScreencastOptions};
use pipewire_video_core::render::{
    DmaBufCapabilities, DmaBufImage, Renderer, Texture, TextureFormat,
};
use pipewire_video_core::video::{aligned_stride, ColorRange, Colorspace, OwnedVideoPlane};
use pipewire_video_core::{
    CameraStreamConfig, ChannelSink, DisplayStreamConfig, ExportStreamConfig, Framerate,
    OwnedVideoFrame, PipeWireSession, VideoFrameFormat,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Capture the desktop through the screencast portal.
    Screencast,
    /// Capture a camera through the camera portal.
    Camera,
    /// Publish a virtual camera fed with a test pattern.
    VirtualCamera,
}

#[derive(Parser, Debug)]
#[command(name = "pipewire-video-core")]
#[command(about = "Desktop capture and virtual camera demo")]
struct Args {
    /// What to run
    #[arg(long, value_enum, default_value = "screencast")]
    mode: Mode,

    /// Offer windows instead of monitors in the portal picker
    #[arg(long)]
    window: bool,

    /// Leave the cursor out of captured frames
    #[arg(long)]
    hide_cursor: bool,

    /// Token from a previous run; skips the portal picker when still valid
    #[arg(long)]
    restore_token: Option<String>,

    /// Camera to open, by the id printed when listing devices
    #[arg(long)]
    device: Option<String>,

    /// Target frame rate
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Node description of the published virtual camera
    #[arg(long, default_value = "Virtual Camera")]
    name: String,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.fps == 0 {
        bail!("--fps must be at least 1");
    }

    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))
        .context("failed to install the Ctrl-C handler")?;

    match args.mode {
        Mode::Screencast => run_screencast(&args, &running).await,
        Mode::Camera => run_camera(&args, &running).await,
        Mode::VirtualCamera => run_virtual_camera(&args, &running).await,
    }
}

async fn run_screencast(args: &Args, running: &AtomicBool) -> Result<()> {
    let capture_type = if args.window {
        CaptureType::Window
    } else {
        CaptureType::Monitor
    };
    let opened = portal::open_screencast(ScreencastOptions {
        capture_type,
        show_cursor: !args.hide_cursor,
        restore_token: args.restore_token.clone(),
        ..Default::default()
    })
    .await
    .context("screencast portal handshake failed")?;

    if let Some(token) = &opened.restore_token {
        info!(token = %token, "Pass this token via --restore-token to skip the picker next time");
    }
    if let Some((width, height)) = opened.size {
        debug!(width, height, "Compositor advertised size");
    }

    let session = PipeWireSession::connect_fd(opened.fd, None)
        .context("could not reach the daemon over the portal fd")?;
    info!(version = ?session.server_version(), "Connected");

    let stream = session.connect_display_stream(DisplayStreamConfig {
        name: "screencast-demo".to_string(),
        target_node: Some(opened.node_id),
        framerate: Framerate {
            num: args.fps,
            den: 1,
        },
        show_cursor: !args.hide_cursor,
        renderer: Box::new(StatsRenderer::default()),
    })?;

    info!("Capturing; press Ctrl-C to stop");
    let mut last_size = (0, 0);
    while running.load(Ordering::SeqCst) {
        stream.render();
        let size = (stream.width(), stream.height());
        if size != last_size && size.0 != 0 {
            info!(width = size.0, height = size.1, "Stream negotiated");
            last_size = size;
        }
        tokio::time::sleep(Duration::from_millis(16)).await;
    }

    info!("Shutting down");
    stream.close()?;
    if let Err(err) = opened.session.close().await {
        warn!(error = %err, "Portal session close failed");
    }
    Ok(())
}

async fn run_camera(args: &Args, running: &AtomicBool) -> Result<()> {
    let fd = portal::open_camera()
        .await
        .context("camera portal access failed")?;

    let registry = portal::CameraDeviceRegistry::new();
    let session = PipeWireSession::connect_fd(fd, Some(Box::new(registry.clone())))
        .context("could not reach the daemon over the portal fd")?;
    // One roundtrip guarantees the registry has announced every device.
    session.roundtrip()?;

    let devices = registry.devices();
    for device in &devices {
        info!(id = %device.device_id, name = %device.display_name, "Camera available");
    }
    let target = match &args.device {
        Some(id) => registry
            .find(id)
            .with_context(|| format!("no camera with id {id}"))?,
        None => devices
            .into_iter()
            .next()
            .context("no cameras advertised")?,
    };
    info!(name = %target.display_name, "Opening camera");

    let (sink, frames) = ChannelSink::new(8);
    let stream = session.connect_camera_stream(CameraStreamConfig {
        name: "camera-demo".to_string(),
        target_node: Some(target.global_id),
        framerate: Framerate {
            num: args.fps,
            den: 1,
        },
        sink: Box::new(sink),
        decoders: None,
    })?;

    info!("Capturing; press Ctrl-C to stop");
    let mut count: u64 = 0;
    let mut bytes: u64 = 0;
    while running.load(Ordering::SeqCst) {
        match frames.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(frame)) => {
                count += 1;
                bytes += frame.planes.iter().map(|p| p.data.len() as u64).sum::<u64>();
                if count % 100 == 0 {
                    info!(
                        frames = count,
                        mebibytes = bytes >> 20,
                        format = ?frame.format,
                        width = frame.width,
                        height = frame.height,
                        "Camera frames"
                    );
                }
            }
            Ok(None) => {
                info!("Camera feed ended");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("Shutting down");
    stream.close()?;
    Ok(())
}

async fn run_virtual_camera(args: &Args, running: &AtomicBool) -> Result<()> {
    let session =
        PipeWireSession::connect(None).context("could not reach the session daemon")?;
    info!(version = ?session.server_version(), "Connected");

    let stream = session.connect_export_stream(ExportStreamConfig {
        name: args.name.clone(),
        format: VideoFrameFormat::Bgrx,
        framerate: Framerate {
            num: args.fps,
            den: 1,
        },
    })?;

    info!(name = %args.name, "Virtual camera published; open it from any video application");

    let frame_time = Duration::from_secs_f64(1.0 / f64::from(args.fps));
    let started = Instant::now();
    let mut tick: u64 = 0;
    let mut sent: u64 = 0;
    while running.load(Ordering::SeqCst) {
        let (width, height) = (stream.width(), stream.height());
        if width == 0 || !stream.is_streaming() {
            // No consumer has connected and negotiated yet.
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }

        let timestamp_ns = started.elapsed().as_nanos() as i64;
        stream.export_frame(gradient_frame(width, height, tick, timestamp_ns))?;
        sent += 1;
        tick += 1;
        if sent % 300 == 0 {
            info!(frames = sent, width, height, "Virtual camera frames");
        }
        tokio::time::sleep(frame_time).await;
    }

    info!("Shutting down");
    stream.close()?;
    Ok(())
}

/// A diagonal BGRX gradient that shifts every tick so consumers see motion.
fn gradient_frame(width: u32, height: u32, tick: u64, timestamp_ns: i64) -> OwnedVideoFrame {
    let stride = aligned_stride(width, 4);
    let mut data = vec![0u8; (stride * height) as usize];
    let shift = (tick % 256) as u32;
    for y in 0..height {
        let row = (y * stride) as usize;
        for x in 0..width {
            let px = row + (x * 4) as usize;
            data[px] = ((x + shift) % 256) as u8;
            data[px + 1] = ((y + shift) % 256) as u8;
            data[px + 2] = ((x + y) % 256) as u8;
            data[px + 3] = 0xff;
        }
    }
    OwnedVideoFrame {
        format: VideoFrameFormat::Bgrx,
        width,
        height,
        colorspace: Colorspace::Default,
        range: ColorRange::Full,
        timestamp_ns,
        planes: vec![OwnedVideoPlane { data, stride }],
    }
}

/// Counts texture uploads and draw calls instead of touching a GPU. Every
/// frame still flows through the same import/upload/draw path a real
/// renderer would see.
#[derive(Default)]
struct StatsRenderer {
    uploads: u64,
    draws: u64,
}

struct SizeTexture {
    width: u32,
    height: u32,
}

impl Texture for SizeTexture {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

impl Renderer for StatsRenderer {
    fn dmabuf_capabilities(&self) -> Option<DmaBufCapabilities> {
        // Shared memory only; the compositor falls back to CPU buffers.
        None
    }

    fn import_dmabuf(
        &mut self,
        _image: &DmaBufImage<'_>,
        _format: TextureFormat,
    ) -> Option<Box<dyn Texture>> {
        warn!("DMA-BUF import requested without GPU support");
        None
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        _format: TextureFormat,
        _data: &[u8],
        _stride: u32,
    ) -> Option<Box<dyn Texture>> {
        self.uploads += 1;
        Some(Box::new(SizeTexture { width, height }))
    }

    fn draw(&mut self, texture: &dyn Texture, _swap_red_blue: bool) {
        self.draws += 1;
        if self.draws % 300 == 0 {
            info!(
                draws = self.draws,
                uploads = self.uploads,
                width = texture.width(),
                height = texture.height(),
                "Render stats"
            );
        }
    }

    fn draw_region(
        &mut self,
        _texture: &dyn Texture,
        _x: u32,
        _y: u32,
        _width: u32,
        _height: u32,
        _swap_red_blue: bool,
    ) {
        self.draws += 1;
    }

    fn draw_at(&mut self, _texture: &dyn Texture, _x: i32, _y: i32) {}
}
