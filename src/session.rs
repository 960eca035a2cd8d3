//! The connection to the daemon and the thread running its loop.
//!
//! All transport objects are single-threaded, so a [`PipeWireSession`] spawns
//! one thread that owns the loop, context, core and every stream, and
//! everything else talks to it through a loop-attached command channel.
//! Stream state the host reads synchronously (sizes, negotiation results,
//! the engines themselves) lives in a shared mutex instead, so queries never
//! wait for a loop turn.
//!
//! Callbacks must never join the loop thread or block on it; anything that
//! has to happen on the loop is sent as a [`SessionCommand`] and picked up on
//! the next iteration.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender as ReplySender};
use parking_lot::Mutex;
use pipewire::channel::Sender as LoopSender;
use pipewire::context::Context;
use pipewire::core::{Core, PW_ID_CORE};
use pipewire::main_loop::MainLoop;
use pipewire::properties::{properties, Properties};
use pipewire::registry::GlobalObject;
use pipewire::spa::param::ParamType;
use pipewire::spa::pod::Pod;
use pipewire::spa::utils::dict::DictRef;
use pipewire::spa::utils::result::AsyncSeq;
use pipewire::spa::utils::Direction;
use pipewire::stream::{Stream, StreamFlags, StreamListener, StreamState};
use pipewire::types::ObjectType;
use tracing::{debug, error, info, warn};

use crate::decode::DecoderFactory;
use crate::engine::{
    buffer, Adapter, CameraAdapter, DisplayAdapter, EngineId, EngineSlot, ExportAdapter,
    ProcessDisposition,
};
use crate::error::{NegotiationError, SessionError};
use crate::format::{spa_from_frame_format, ServerVersion, SupportedFormats};
use crate::render::Renderer;
use crate::sink::FrameSink;
use crate::video::{Framerate, OwnedVideoFrame, VideoFrameFormat};

/// How long the spawning thread waits for the daemon greeting.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long blocking commands wait for their reply.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A node that appeared in the daemon's global registry.
#[derive(Debug, Clone)]
pub struct DiscoveredNode {
    pub global_id: u32,
    pub media_class: Option<String>,
    pub media_role: Option<String>,
    pub node_name: Option<String>,
    pub serial: Option<String>,
    pub description: Option<String>,
}

impl DiscoveredNode {
    fn from_global(global: &GlobalObject<&DictRef>) -> Self {
        let get = |key: &str| global.props.and_then(|p| p.get(key)).map(str::to_owned);
        Self {
            global_id: global.id,
            media_class: get(*pipewire::keys::MEDIA_CLASS),
            media_role: get(*pipewire::keys::MEDIA_ROLE),
            node_name: get(*pipewire::keys::NODE_NAME),
            serial: get("object.serial"),
            description: get(*pipewire::keys::NODE_DESCRIPTION),
        }
    }
}

/// Registry watcher, driven from the loop thread. Removals are reported for
/// every global, not just nodes; implementations match on ids they know.
pub trait DiscoveryListener: Send {
    fn node_added(&mut self, node: &DiscoveredNode);
    fn node_removed(&mut self, global_id: u32);
}

/// Screen capture stream settings.
pub struct DisplayStreamConfig {
    pub name: String,
    /// Node to connect to, usually from a portal response. `None` lets the
    /// daemon pick.
    pub target_node: Option<u32>,
    pub framerate: Framerate,
    pub show_cursor: bool,
    pub renderer: Box<dyn Renderer>,
}

/// Camera capture stream settings.
pub struct CameraStreamConfig {
    pub name: String,
    pub target_node: Option<u32>,
    pub framerate: Framerate,
    pub sink: Box<dyn FrameSink>,
    /// Without a decoder backend the stream only offers raw formats.
    pub decoders: Option<Box<dyn DecoderFactory>>,
}

/// Virtual camera stream settings.
pub struct ExportStreamConfig {
    pub name: String,
    pub format: VideoFrameFormat,
    pub framerate: Framerate,
}

enum SessionCommand {
    ConnectStream(ConnectStreamRequest),
    Roundtrip {
        done: ReplySender<()>,
    },
    SetActive {
        engine: EngineId,
        active: bool,
    },
    /// Resend the (narrowed) format proposals after a failed GPU import.
    UpdateFormatParams {
        engine: EngineId,
    },
    ExportFrame {
        engine: EngineId,
        frame: OwnedVideoFrame,
    },
    DisconnectStream {
        engine: EngineId,
        done: ReplySender<()>,
    },
    Quit,
}

struct ConnectStreamRequest {
    engine: EngineId,
    name: String,
    role: StreamRole,
    target_node: Option<u32>,
    proposals: Vec<Vec<u8>>,
    result: ReplySender<Result<(), SessionError>>,
}

/// How a stream presents itself to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamRole {
    Screen,
    Camera,
    Export,
}

impl StreamRole {
    fn direction(self) -> Direction {
        match self {
            Self::Screen | Self::Camera => Direction::Input,
            Self::Export => Direction::Output,
        }
    }

    fn flags(self) -> StreamFlags {
        match self {
            Self::Screen | Self::Camera => StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
            Self::Export => {
                StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS | StreamFlags::DRIVER
            }
        }
    }

    fn properties(self, name: &str) -> Properties {
        match self {
            Self::Screen => properties! {
                *pipewire::keys::MEDIA_TYPE => "Video",
                *pipewire::keys::MEDIA_CATEGORY => "Capture",
                *pipewire::keys::MEDIA_ROLE => "Screen",
            },
            Self::Camera => properties! {
                *pipewire::keys::MEDIA_TYPE => "Video",
                *pipewire::keys::MEDIA_CATEGORY => "Capture",
                *pipewire::keys::MEDIA_ROLE => "Camera",
            },
            Self::Export => properties! {
                *pipewire::keys::NODE_DESCRIPTION => name,
                *pipewire::keys::MEDIA_CLASS => "Video/Source",
                *pipewire::keys::MEDIA_ROLE => "Camera",
            },
        }
    }
}

/// State shared between the loop thread and the host-facing handles.
struct SessionShared {
    state: Mutex<SessionState>,
}

struct SessionState {
    server_version: ServerVersion,
    engines: HashMap<EngineId, EngineSlot>,
    /// Set when the loop thread is gone or going; no new work is accepted.
    dead: bool,
}

/// Loop-thread-only state the command handlers mutate.
struct LoopData {
    streams: RefCell<HashMap<EngineId, StreamSlot>>,
    pending_syncs: RefCell<Vec<(AsyncSeq, ReplySender<()>)>>,
}

/// Field order matters: the listener detaches before its stream goes away.
struct StreamSlot {
    _listener: StreamListener<EngineId>,
    stream: Stream,
}

/// A live daemon connection. Dropping it shuts the loop thread down and
/// tears down every stream still connected.
pub struct PipeWireSession {
    thread: Option<JoinHandle<()>>,
    commands: LoopSender<SessionCommand>,
    shared: Arc<SessionShared>,
    next_engine: AtomicU64,
}

/// Handle to one connected stream. All methods are safe from any thread;
/// none of them waits for the loop except [`PipeWireStream::close`].
pub struct PipeWireStream {
    shared: Arc<SessionShared>,
    commands: LoopSender<SessionCommand>,
    engine: EngineId,
}

impl PipeWireSession {
    /// Connects to the user's session daemon.
    pub fn connect(discovery: Option<Box<dyn DiscoveryListener>>) -> Result<Self, SessionError> {
        Self::spawn(None, discovery)
    }

    /// Connects over an already-open daemon socket, as handed out by the
    /// camera portal.
    pub fn connect_fd(
        fd: OwnedFd,
        discovery: Option<Box<dyn DiscoveryListener>>,
    ) -> Result<Self, SessionError> {
        Self::spawn(Some(fd), discovery)
    }

    fn spawn(
        fd: Option<OwnedFd>,
        discovery: Option<Box<dyn DiscoveryListener>>,
    ) -> Result<Self, SessionError> {
        let (commands, receiver) = pipewire::channel::channel();
        let loop_tx = commands.clone();
        let shared = Arc::new(SessionShared {
            state: Mutex::new(SessionState {
                server_version: ServerVersion::default(),
                engines: HashMap::new(),
                dead: false,
            }),
        });
        let (ready_tx, ready_rx) = bounded(1);

        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("pipewire-session".to_string())
            .spawn(move || {
                session_thread(fd, receiver, loop_tx, thread_shared, discovery, ready_tx);
            })?;

        match ready_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                thread: Some(thread),
                commands,
                shared,
                next_engine: AtomicU64::new(0),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                shared.state.lock().dead = true;
                Err(SessionError::Timeout)
            }
        }
    }

    /// The daemon version from the connection greeting.
    pub fn server_version(&self) -> ServerVersion {
        self.shared.state.lock().server_version
    }

    /// Blocks until the daemon has processed everything sent so far. Events
    /// already queued on the loop, registry announcements included, have
    /// been dispatched once this returns.
    pub fn roundtrip(&self) -> Result<(), SessionError> {
        let (done_tx, done_rx) = bounded(1);
        if self
            .commands
            .send(SessionCommand::Roundtrip { done: done_tx })
            .is_err()
        {
            return Err(SessionError::LoopGone);
        }
        match done_rx.recv_timeout(COMMAND_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(SessionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::LoopGone),
        }
    }

    /// Starts a screen capture stream rendering into `config.renderer`.
    pub fn connect_display_stream(
        &self,
        config: DisplayStreamConfig,
    ) -> Result<PipeWireStream, SessionError> {
        let caps = config.renderer.dmabuf_capabilities();
        let formats = SupportedFormats::for_display(caps.as_ref());
        let adapter = Adapter::Display(DisplayAdapter::new(config.renderer, config.show_cursor));
        self.connect_stream(
            config.name,
            StreamRole::Screen,
            config.target_node,
            formats,
            config.framerate,
            adapter,
        )
    }

    /// Starts a camera capture stream feeding `config.sink`.
    pub fn connect_camera_stream(
        &self,
        config: CameraStreamConfig,
    ) -> Result<PipeWireStream, SessionError> {
        let mut formats = SupportedFormats::for_camera();
        if config.decoders.is_none() {
            formats.clear_compressed();
        }
        let adapter = Adapter::Camera(CameraAdapter::new(config.sink, config.decoders));
        self.connect_stream(
            config.name,
            StreamRole::Camera,
            config.target_node,
            formats,
            config.framerate,
            adapter,
        )
    }

    /// Publishes a virtual camera node other applications can capture from.
    pub fn connect_export_stream(
        &self,
        config: ExportStreamConfig,
    ) -> Result<PipeWireStream, SessionError> {
        let spa_format = spa_from_frame_format(config.format).ok_or(SessionError::Negotiation(
            NegotiationError::Unsupported("no wire format for the requested pixel format"),
        ))?;
        let formats = SupportedFormats::for_export(spa_format);
        let adapter = Adapter::Export(ExportAdapter::new());
        self.connect_stream(
            config.name,
            StreamRole::Export,
            None,
            formats,
            config.framerate,
            adapter,
        )
    }

    fn connect_stream(
        &self,
        name: String,
        role: StreamRole,
        target_node: Option<u32>,
        formats: SupportedFormats,
        framerate: Framerate,
        adapter: Adapter,
    ) -> Result<PipeWireStream, SessionError> {
        let engine = EngineId(self.next_engine.fetch_add(1, Ordering::Relaxed));

        // The slot goes into shared state before the stream exists, so the
        // very first callback already finds it.
        let proposals = {
            let mut state = self.shared.state.lock();
            if state.dead {
                return Err(SessionError::LoopGone);
            }
            let slot = EngineSlot::new(name.clone(), formats, framerate, adapter);
            debug!(stream = %name, kind = slot.adapter.kind_name(), "Registering stream engine");
            let proposals = slot.rebuild_proposals(&state.server_version)?;
            state.engines.insert(engine, slot);
            proposals
        };

        let (result_tx, result_rx) = bounded(1);
        let request = ConnectStreamRequest {
            engine,
            name,
            role,
            target_node,
            proposals,
            result: result_tx,
        };
        if self
            .commands
            .send(SessionCommand::ConnectStream(request))
            .is_err()
        {
            self.drop_engine(engine);
            return Err(SessionError::LoopGone);
        }

        match result_rx.recv_timeout(COMMAND_TIMEOUT) {
            Ok(Ok(())) => Ok(PipeWireStream {
                shared: self.shared.clone(),
                commands: self.commands.clone(),
                engine,
            }),
            Ok(Err(err)) => {
                self.drop_engine(engine);
                Err(err)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.drop_engine(engine);
                Err(SessionError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.drop_engine(engine);
                Err(SessionError::LoopGone)
            }
        }
    }

    fn drop_engine(&self, engine: EngineId) {
        self.shared.state.lock().engines.remove(&engine);
    }
}

impl Drop for PipeWireSession {
    fn drop(&mut self) {
        if self.commands.send(SessionCommand::Quit).is_err() {
            debug!("Session loop already gone at shutdown");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Session thread panicked");
            }
        }
    }
}

impl PipeWireStream {
    /// Pauses or resumes the stream. Applied on the next loop turn.
    pub fn set_active(&self, active: bool) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::SetActive {
                engine: self.engine,
                active,
            })
            .map_err(|_| SessionError::LoopGone)
    }

    /// Negotiated width, after crop for display streams. Zero until the
    /// format handshake completed.
    pub fn width(&self) -> u32 {
        let state = self.shared.state.lock();
        state.engines.get(&self.engine).map_or(0, |s| s.width())
    }

    /// Negotiated height, after crop for display streams.
    pub fn height(&self) -> u32 {
        let state = self.shared.state.lock();
        state.engines.get(&self.engine).map_or(0, |s| s.height())
    }

    /// Whether the daemon is currently driving buffers through the stream.
    pub fn is_streaming(&self) -> bool {
        let state = self.shared.state.lock();
        state.engines.get(&self.engine).is_some_and(|s| s.streaming)
    }

    /// The stream's node id, once the daemon assigned one. Export streams
    /// hand this to consumers that want to capture the virtual camera.
    pub fn node_id(&self) -> Option<u32> {
        let state = self.shared.state.lock();
        state.engines.get(&self.engine).and_then(|s| s.node_id)
    }

    /// Shows or hides the cursor overlay on a display stream.
    pub fn set_cursor_visible(&self, visible: bool) {
        let mut state = self.shared.state.lock();
        if let Some(slot) = state.engines.get_mut(&self.engine) {
            slot.set_cursor_visible(visible);
        }
    }

    /// Draws the latest display frame with the host's renderer. Called from
    /// the host's render thread, not the loop.
    pub fn render(&self) {
        let mut state = self.shared.state.lock();
        if let Some(slot) = state.engines.get_mut(&self.engine) {
            slot.render();
        }
    }

    /// Queues one frame for the virtual camera. Dropped silently when the
    /// stream is not streaming or no outgoing buffer is free.
    pub fn export_frame(&self, frame: OwnedVideoFrame) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::ExportFrame {
                engine: self.engine,
                frame,
            })
            .map_err(|_| SessionError::LoopGone)
    }

    /// Disconnects the stream and waits until the loop released it.
    pub fn close(self) -> Result<(), SessionError> {
        let (done_tx, done_rx) = bounded(1);
        if self
            .commands
            .send(SessionCommand::DisconnectStream {
                engine: self.engine,
                done: done_tx,
            })
            .is_err()
        {
            return Err(SessionError::LoopGone);
        }
        match done_rx.recv_timeout(COMMAND_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(SessionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::LoopGone),
        }
    }
}

// ---------------------------------------------------------------------------
// Loop thread
// ---------------------------------------------------------------------------

fn session_thread(
    fd: Option<OwnedFd>,
    receiver: pipewire::channel::Receiver<SessionCommand>,
    loop_tx: LoopSender<SessionCommand>,
    shared: Arc<SessionShared>,
    discovery: Option<Box<dyn DiscoveryListener>>,
    ready: ReplySender<Result<(), SessionError>>,
) {
    if let Err(err) = run_loop(fd, receiver, loop_tx, &shared, discovery, ready) {
        error!(error = %err, "Session loop failed");
    }

    let mut state = shared.state.lock();
    state.dead = true;
    for slot in state.engines.values_mut() {
        slot.teardown();
    }
    state.engines.clear();
}

fn connect_error(err: pipewire::Error) -> SessionError {
    SessionError::Connect(err.to_string())
}

/// Reports a pre-ready failure to the waiting spawner and hands back a copy
/// for the loop thread's own log. Only string-carrying variants reach this
/// path, so the duplicate is cheap.
fn fail_startup(ready: &ReplySender<Result<(), SessionError>>, err: SessionError) -> SessionError {
    let copy = match &err {
        SessionError::Connect(message) => SessionError::Connect(message.clone()),
        SessionError::Timeout => SessionError::Timeout,
        other => SessionError::Connect(other.to_string()),
    };
    let _ = ready.send(Err(copy));
    err
}

fn run_loop(
    fd: Option<OwnedFd>,
    receiver: pipewire::channel::Receiver<SessionCommand>,
    loop_tx: LoopSender<SessionCommand>,
    shared: &Arc<SessionShared>,
    discovery: Option<Box<dyn DiscoveryListener>>,
    ready: ReplySender<Result<(), SessionError>>,
) -> Result<(), SessionError> {
    pipewire::init();

    let mainloop = match MainLoop::new(None) {
        Ok(mainloop) => mainloop,
        Err(err) => return Err(fail_startup(&ready, connect_error(err))),
    };
    let context = match Context::new(&mainloop) {
        Ok(context) => context,
        Err(err) => return Err(fail_startup(&ready, connect_error(err))),
    };
    let core = match fd {
        Some(fd) => context.connect_fd(fd, None),
        None => context.connect(None),
    };
    let core = match core {
        Ok(core) => Rc::new(core),
        Err(err) => return Err(fail_startup(&ready, connect_error(err))),
    };

    // Phase one: wait for the core info greeting so every later format
    // decision knows the daemon version.
    let version = Rc::new(RefCell::new(None::<ServerVersion>));
    let greeting_error = Rc::new(RefCell::new(None::<String>));
    let init_seq = match core.sync(0) {
        Ok(seq) => seq,
        Err(err) => return Err(fail_startup(&ready, connect_error(err))),
    };
    let init_listener = core
        .add_listener_local()
        .info({
            let version = version.clone();
            move |info| {
                let parsed = ServerVersion::parse(info.version());
                if parsed.is_none() {
                    warn!(version = info.version(), "Unparseable daemon version");
                }
                *version.borrow_mut() = Some(parsed.unwrap_or_default());
            }
        })
        .done({
            let mainloop = mainloop.clone();
            move |id, seq| {
                if id == PW_ID_CORE && seq == init_seq {
                    mainloop.quit();
                }
            }
        })
        .error({
            let greeting_error = greeting_error.clone();
            let mainloop = mainloop.clone();
            move |id, _seq, res, message| {
                if id == PW_ID_CORE {
                    *greeting_error.borrow_mut() = Some(format!("{message} (res {res})"));
                    mainloop.quit();
                }
            }
        })
        .register();
    let greeting_timer = mainloop.loop_().add_timer({
        let mainloop = mainloop.clone();
        move |_| mainloop.quit()
    });
    if let Err(err) = greeting_timer
        .update_timer(Some(CONNECT_TIMEOUT), None)
        .into_result()
    {
        debug!(error = %err, "Could not arm the greeting timer");
    }
    mainloop.run();
    drop(greeting_timer);
    drop(init_listener);

    if let Some(message) = greeting_error.borrow_mut().take() {
        return Err(fail_startup(&ready, SessionError::Connect(message)));
    }
    let server_version = match *version.borrow() {
        Some(v) => v,
        None => return Err(fail_startup(&ready, SessionError::Timeout)),
    };
    info!(
        major = server_version.major,
        minor = server_version.minor,
        micro = server_version.micro,
        "Connected to PipeWire daemon"
    );
    shared.state.lock().server_version = server_version;

    // Phase two: steady state. Commands, sync completions and registry
    // events all dispatch from the same loop.
    let loop_data = Rc::new(LoopData {
        streams: RefCell::new(HashMap::new()),
        pending_syncs: RefCell::new(Vec::new()),
    });

    let _core_listener = core
        .add_listener_local()
        .done({
            let loop_data = loop_data.clone();
            move |id, seq| {
                if id != PW_ID_CORE {
                    return;
                }
                loop_data.pending_syncs.borrow_mut().retain(|(pending, tx)| {
                    if *pending == seq {
                        let _ = tx.send(());
                        false
                    } else {
                        true
                    }
                });
            }
        })
        .error({
            let shared = shared.clone();
            let mainloop = mainloop.clone();
            move |id, _seq, res, message| {
                error!(id, res, message, "PipeWire core error");
                if id == PW_ID_CORE {
                    shared.state.lock().dead = true;
                    mainloop.quit();
                }
            }
        })
        .register();

    let _registry_guard = match discovery {
        Some(listener) => {
            let registry = match core.get_registry() {
                Ok(registry) => registry,
                Err(err) => return Err(fail_startup(&ready, connect_error(err))),
            };
            let listener = Rc::new(RefCell::new(listener));
            let registry_listener = registry
                .add_listener_local()
                .global({
                    let listener = listener.clone();
                    move |global| {
                        if global.type_ != ObjectType::Node {
                            return;
                        }
                        let node = DiscoveredNode::from_global(global);
                        listener.borrow_mut().node_added(&node);
                    }
                })
                .global_remove({
                    let listener = listener.clone();
                    move |global_id| {
                        listener.borrow_mut().node_removed(global_id);
                    }
                })
                .register();
            Some((registry, registry_listener))
        }
        None => None,
    };

    let _receiver = receiver.attach(mainloop.loop_(), {
        let mainloop = mainloop.clone();
        let shared = shared.clone();
        let loop_data = loop_data.clone();
        let core = core.clone();
        move |command| match command {
            SessionCommand::ConnectStream(request) => {
                let outcome = connect_stream(&core, &shared, &loop_data, &loop_tx, &request);
                if let Err(err) = &outcome {
                    warn!(stream = %request.name, error = %err, "Stream connect failed");
                }
                let _ = request.result.send(outcome);
            }
            SessionCommand::Roundtrip { done } => match core.sync(0) {
                Ok(seq) => loop_data.pending_syncs.borrow_mut().push((seq, done)),
                Err(err) => warn!(error = %err, "Core sync failed"),
            },
            SessionCommand::SetActive { engine, active } => {
                if let Some(slot) = loop_data.streams.borrow().get(&engine) {
                    if let Err(err) = slot.stream.set_active(active) {
                        warn!(active, error = %err, "set_active failed");
                    }
                }
            }
            SessionCommand::UpdateFormatParams { engine } => {
                renegotiate(&mainloop, &shared, &loop_data, engine);
            }
            SessionCommand::ExportFrame { engine, frame } => {
                export_frame(&shared, &loop_data, engine, frame);
            }
            SessionCommand::DisconnectStream { engine, done } => {
                let removed = loop_data.streams.borrow_mut().remove(&engine);
                if let Some(slot) = removed {
                    if let Err(err) = slot.stream.disconnect() {
                        debug!(error = %err, "Stream disconnect failed");
                    }
                }
                if let Some(mut slot) = shared.state.lock().engines.remove(&engine) {
                    slot.teardown();
                }
                let _ = done.send(());
            }
            SessionCommand::Quit => mainloop.quit(),
        }
    });

    let _ = ready.send(Ok(()));
    mainloop.run();

    // The loop is done; disconnect whatever is still up before the engines
    // are torn down by the caller.
    let streams = loop_data.streams.take();
    for (_, slot) in streams {
        if let Err(err) = slot.stream.disconnect() {
            debug!(error = %err, "Stream disconnect failed during shutdown");
        }
    }
    Ok(())
}

fn connect_stream(
    core: &Core,
    shared: &Arc<SessionShared>,
    loop_data: &Rc<LoopData>,
    loop_tx: &LoopSender<SessionCommand>,
    request: &ConnectStreamRequest,
) -> Result<(), SessionError> {
    let engine = request.engine;
    let properties = request.role.properties(&request.name);
    let stream = Stream::new(core, &request.name, properties).map_err(connect_error)?;

    let listener = stream
        .add_local_listener_with_user_data(engine)
        .state_changed({
            let shared = shared.clone();
            move |stream, engine, old, new| {
                let engine = *engine;
                let mut state = shared.state.lock();
                let Some(slot) = state.engines.get_mut(&engine) else {
                    return;
                };
                info!(stream = %slot.name, ?old, ?new, "Stream state changed");
                let node_id = stream.node_id();
                if node_id != u32::MAX {
                    slot.node_id = Some(node_id);
                }
                match new {
                    StreamState::Streaming => slot.streaming = true,
                    StreamState::Error(message) => {
                        error!(stream = %slot.name, %message, "Stream entered error state");
                        slot.streaming = false;
                    }
                    _ => slot.streaming = false,
                }
            }
        })
        .param_changed({
            let shared = shared.clone();
            move |stream, engine, id, pod| {
                if id != ParamType::Format.as_raw() {
                    return;
                }
                let Some(param) = pod else {
                    return;
                };
                let engine = *engine;
                let mut guard = shared.state.lock();
                let SessionState {
                    server_version,
                    engines,
                    ..
                } = &mut *guard;
                let Some(slot) = engines.get_mut(&engine) else {
                    return;
                };
                let Some(follow_up) = slot.handle_format(server_version, param) else {
                    return;
                };
                let mut pods: Vec<&Pod> = follow_up
                    .iter()
                    .filter_map(|bytes| Pod::from_bytes(bytes))
                    .collect();
                if pods.len() != follow_up.len() {
                    warn!(stream = %slot.name, "Skipping malformed stream params");
                    return;
                }
                match stream.update_params(&mut pods) {
                    Ok(()) => slot.mark_negotiated(),
                    Err(err) => {
                        warn!(stream = %slot.name, error = %err, "update_params failed")
                    }
                }
            }
        })
        .process({
            let shared = shared.clone();
            let loop_tx = loop_tx.clone();
            move |stream, engine| {
                let engine = *engine;
                let latest = buffer::drain_to_newest(
                    || stream.dequeue_raw_buffer(),
                    |stale| unsafe { stream.queue_raw_buffer(stale) },
                );
                if latest.is_null() {
                    return;
                }

                let disposition = {
                    let mut guard = shared.state.lock();
                    let SessionState {
                        server_version,
                        engines,
                        ..
                    } = &mut *guard;
                    match engines.get_mut(&engine) {
                        Some(slot) => match unsafe { buffer::view_buffer(latest) } {
                            Some(view) => slot.handle_buffer(server_version, view),
                            None => ProcessDisposition::Continue,
                        },
                        None => ProcessDisposition::Continue,
                    }
                };
                unsafe { stream.queue_raw_buffer(latest) };

                if disposition == ProcessDisposition::Renegotiate
                    && loop_tx
                        .send(SessionCommand::UpdateFormatParams { engine })
                        .is_err()
                {
                    warn!("Command channel closed during renegotiation");
                }
            }
        })
        .register()
        .map_err(connect_error)?;

    let mut pods: Vec<&Pod> = request
        .proposals
        .iter()
        .filter_map(|bytes| Pod::from_bytes(bytes))
        .collect();
    if pods.len() != request.proposals.len() {
        return Err(NegotiationError::MalformedPod("initial stream proposals").into());
    }
    if pods.is_empty() {
        return Err(NegotiationError::NoFormats.into());
    }
    stream
        .connect(
            request.role.direction(),
            request.target_node,
            request.role.flags(),
            &mut pods,
        )
        .map_err(connect_error)?;

    loop_data.streams.borrow_mut().insert(
        engine,
        StreamSlot {
            _listener: listener,
            stream,
        },
    );
    Ok(())
}

/// Rebuilds and resends the format proposals after a failed import. Running
/// out of formats entirely is unrecoverable; the session shuts down.
fn renegotiate(
    mainloop: &MainLoop,
    shared: &Arc<SessionShared>,
    loop_data: &Rc<LoopData>,
    engine: EngineId,
) {
    let mut guard = shared.state.lock();
    let SessionState {
        server_version,
        engines,
        dead,
    } = &mut *guard;
    let Some(slot) = engines.get_mut(&engine) else {
        return;
    };
    match slot.rebuild_proposals(server_version) {
        Ok(proposals) => {
            let streams = loop_data.streams.borrow();
            let Some(stream_slot) = streams.get(&engine) else {
                return;
            };
            let mut pods: Vec<&Pod> = proposals
                .iter()
                .filter_map(|bytes| Pod::from_bytes(bytes))
                .collect();
            info!(stream = %slot.name, proposals = pods.len(), "Renegotiating format");
            if let Err(err) = stream_slot.stream.update_params(&mut pods) {
                warn!(stream = %slot.name, error = %err, "Renegotiation update failed");
            }
        }
        Err(err) => {
            error!(stream = %slot.name, error = %err, "No usable formats left, shutting down");
            *dead = true;
            mainloop.quit();
        }
    }
}

fn export_frame(
    shared: &Arc<SessionShared>,
    loop_data: &Rc<LoopData>,
    engine: EngineId,
    frame: OwnedVideoFrame,
) {
    let streams = loop_data.streams.borrow();
    let Some(stream_slot) = streams.get(&engine) else {
        return;
    };
    let mut state = shared.state.lock();
    let Some(slot) = state.engines.get_mut(&engine) else {
        return;
    };
    if !slot.streaming {
        debug!(stream = %slot.name, "No consumer streaming, dropping export frame");
        return;
    }
    let buffer = stream_slot.stream.dequeue_raw_buffer();
    if buffer.is_null() {
        debug!(stream = %slot.name, "Out of outgoing buffers, dropping export frame");
        return;
    }
    unsafe {
        if !slot.fill_export(buffer, &frame) {
            debug!(stream = %slot.name, "Export frame not written");
        }
        stream_slot.stream.queue_raw_buffer(buffer);
    }
}
