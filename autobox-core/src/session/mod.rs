//! The dongle session: owns the device, drives the handshake FSM,
//! and fans media out to the pipelines.
//!
//! ```text
//!                ┌───────────── Session ─────────────┐
//! bulk-in ──► reader thread ──► codec ──► demux ──► session loop
//!                                  │                │  (FSM, timers)
//!                                  ├─► video task ──► frame cell ─► render task
//!                                  └─► audio ───────► rings ──► worklets (host)
//! host cmds ─► outbound queue ──► writer thread ──► bulk-out
//! ```
//!
//! One session per device: the endpoint is claimed at construction and
//! released by `stop`, which also drains pending writes (bounded by a
//! short grace) and cancels every session-owned task and timer. A
//! session that has been stopped cannot be restarted — the host builds
//! a fresh one against a freshly claimed device.
//!
//! | Module     | Purpose                                  |
//! |----------- |------------------------------------------|
//! | `state`    | Validated lifecycle FSM                  |
//! | `outbound` | Category-aware bounded writer queue      |

pub mod outbound;
pub mod state;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::codec::Decoder as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioPipeline, PlayerHandoff};
use crate::config::DongleConfig;
use crate::control::{CoreEvent, HostCommand, MediaMetaState};
use crate::demux::Demux;
use crate::error::AutoboxError;
use crate::input::{self, MultiTouchTracker};
use crate::mic::{CaptureBackend, Microphone, NullBackend};
use crate::protocol::{
    AudioData, CommandValue, DongleCodec, JsonBlob, MediaPayload, Message, OpenInfo, PhoneType,
};
use crate::usb::{DeviceIdentity, DongleEndpoint, HotplugEvent};
use crate::video::{present_loop, FrameCell, Renderer, VideoDecoder, VideoPipeline};

pub use outbound::{FrameCategory, Outbound, OutboundQueue, PopResult};
pub use state::SessionPhase;

/// Writer queue depth.
const OUTBOUND_CAPACITY: usize = 256;

/// Protocol decode errors tolerated inside [`STRIKE_WINDOW`] before
/// the session fails.
const PROTOCOL_STRIKE_LIMIT: usize = 8;
const STRIKE_WINDOW: Duration = Duration::from_secs(2);

// ── Timing ───────────────────────────────────────────────────────

/// Session timer tuning. Defaults match the protocol contract.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// Link keep-alive cadence.
    pub link_heartbeat: Duration,
    /// WiFi pair nudge when no media arrives after configuration.
    pub pair_timeout: Duration,
    /// Bound on the whole open→streaming handshake.
    pub init_timeout: Duration,
    /// How long `stop` lets pending writes drain.
    pub write_grace: Duration,
    /// Bulk-in poll window.
    pub read_timeout: Duration,
    /// Per-write bound on bulk-out.
    pub write_timeout: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            link_heartbeat: Duration::from_secs(2),
            pair_timeout: Duration::from_secs(15),
            init_timeout: Duration::from_secs(10),
            write_grace: Duration::from_millis(200),
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_secs(1),
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────

/// Assembles a [`Session`] and its output channels.
pub struct SessionBuilder {
    config: DongleConfig,
    endpoint: Arc<dyn DongleEndpoint>,
    decoder: Option<Box<dyn VideoDecoder>>,
    renderer: Option<Box<dyn Renderer>>,
    mic_backend: Option<Box<dyn CaptureBackend>>,
    hotplug: Option<mpsc::UnboundedReceiver<HotplugEvent>>,
    timing: SessionTiming,
}

/// Channels the host consumes.
pub struct SessionOutputs {
    pub events: mpsc::UnboundedReceiver<CoreEvent>,
    /// One hand-off per lazily created audio stream.
    pub audio_handoffs: mpsc::UnboundedReceiver<PlayerHandoff>,
}

impl SessionBuilder {
    pub fn new(config: DongleConfig, endpoint: Arc<dyn DongleEndpoint>) -> Self {
        Self {
            config,
            endpoint,
            decoder: None,
            renderer: None,
            mic_backend: None,
            hotplug: None,
            timing: SessionTiming::default(),
        }
    }

    /// Video decoder to drive; without one the video lane idles.
    pub fn with_decoder(mut self, decoder: Box<dyn VideoDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Paint target for decoded frames.
    pub fn with_renderer(mut self, renderer: Box<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Microphone backend (defaults to [`NullBackend`]).
    pub fn with_mic_backend(mut self, backend: Box<dyn CaptureBackend>) -> Self {
        self.mic_backend = Some(backend);
        self
    }

    /// Transport attach/detach events; Detached closes the session.
    pub fn with_hotplug(mut self, events: mpsc::UnboundedReceiver<HotplugEvent>) -> Self {
        self.hotplug = Some(events);
        self
    }

    pub fn with_timing(mut self, timing: SessionTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn build(self) -> (Session, SessionOutputs) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let (phase_tx, _) = watch::channel(SessionPhase::Closed);

        (
            Session {
                config: StdMutex::new(Arc::new(self.config)),
                endpoint: StdMutex::new(Some(self.endpoint)),
                phase_tx,
                events_tx,
                handoff_tx,
                start_lock: tokio::sync::Mutex::new(()),
                touch: StdMutex::new(MultiTouchTracker::new()),
                decoder: StdMutex::new(self.decoder),
                renderer: StdMutex::new(self.renderer),
                mic_backend: StdMutex::new(self.mic_backend),
                hotplug: StdMutex::new(self.hotplug),
                run: StdMutex::new(None),
                timing: self.timing,
            },
            SessionOutputs {
                events: events_rx,
                audio_handoffs: handoff_rx,
            },
        )
    }
}

// ── Session ──────────────────────────────────────────────────────

/// Messages the reader/writer threads post to the session loop.
#[derive(Debug)]
enum SessionMsg {
    Inbound(Message),
    DeviceGone,
    Fatal(String),
}

struct RunHandles {
    cancel: CancellationToken,
    outbound: Arc<OutboundQueue>,
    threads: Vec<thread::JoinHandle<()>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// A live (or startable) dongle session.
pub struct Session {
    config: StdMutex<Arc<DongleConfig>>,
    endpoint: StdMutex<Option<Arc<dyn DongleEndpoint>>>,
    phase_tx: watch::Sender<SessionPhase>,
    events_tx: mpsc::UnboundedSender<CoreEvent>,
    handoff_tx: mpsc::UnboundedSender<PlayerHandoff>,
    start_lock: tokio::sync::Mutex<()>,
    touch: StdMutex<MultiTouchTracker>,
    decoder: StdMutex<Option<Box<dyn VideoDecoder>>>,
    renderer: StdMutex<Option<Box<dyn Renderer>>>,
    mic_backend: StdMutex<Option<Box<dyn CaptureBackend>>>,
    hotplug: StdMutex<Option<mpsc::UnboundedReceiver<HotplugEvent>>>,
    run: StdMutex<Option<RunHandles>>,
    timing: SessionTiming,
}

impl Session {
    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        *self.phase_tx.borrow()
    }

    /// Watch phase changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    /// Bring the session to Streaming.
    ///
    /// Concurrent calls coalesce: the first does the work, the rest
    /// wait on the same lock and observe the already-streaming state.
    pub async fn start(&self) -> Result<(), AutoboxError> {
        let _guard = self.start_lock.lock().await;

        match self.phase() {
            SessionPhase::Streaming => return Ok(()),
            SessionPhase::Closed => {}
            other => {
                return Err(AutoboxError::InvalidState {
                    op: "start",
                    state: other.name(),
                })
            }
        }

        let endpoint = self
            .endpoint
            .lock()
            .expect("endpoint lock")
            .clone()
            .ok_or(AutoboxError::NoDevice)?;
        let config = Arc::clone(&*self.config.lock().expect("config lock"));

        self.phase_tx.send_modify(|p| {
            let _ = p.open();
        });

        let cancel = CancellationToken::new();
        let outbound = Arc::new(OutboundQueue::new(OUTBOUND_CAPACITY));
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (demux, streams) = Demux::new();
        let media_seen = demux.media_seen_flag();

        // ── Reader thread ────────────────────────────────────────
        let reader = {
            let endpoint = Arc::clone(&endpoint);
            let cancel = cancel.clone();
            let tx = session_tx.clone();
            let timing = self.timing;
            thread::Builder::new()
                .name("dongle-reader".into())
                .spawn(move || reader_loop(endpoint, demux, tx, cancel, timing))
                .expect("spawn dongle-reader")
        };

        // ── Writer thread ────────────────────────────────────────
        let writer = {
            let endpoint = Arc::clone(&endpoint);
            let cancel = cancel.clone();
            let tx = session_tx.clone();
            let outbound = Arc::clone(&outbound);
            let timing = self.timing;
            thread::Builder::new()
                .name("dongle-writer".into())
                .spawn(move || writer_loop(endpoint, outbound, tx, cancel, timing))
                .expect("spawn dongle-writer")
        };

        // ── Media pipelines ──────────────────────────────────────
        let mic_backend = self
            .mic_backend
            .lock()
            .expect("mic lock")
            .take()
            .unwrap_or_else(|| Box::new(NullBackend));
        let mic = Microphone::new(mic_backend, Arc::clone(&outbound));
        let audio = AudioPipeline::new(
            &config,
            mic,
            self.events_tx.clone(),
            self.handoff_tx.clone(),
        );

        let cell = Arc::new(FrameCell::new());
        let video_reset = Arc::new(Notify::new());
        let mut tasks = Vec::new();

        if let Some(decoder) = self.decoder.lock().expect("decoder lock").take() {
            let mut pipeline =
                VideoPipeline::new(decoder, Arc::clone(&cell), self.events_tx.clone());
            let mut video_rx = streams.video;
            let cancel = cancel.clone();
            let reset = Arc::clone(&video_reset);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = reset.notified() => pipeline.reset(),
                        changed = video_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let frame = video_rx.borrow_and_update().clone();
                            if let Some(video) = frame {
                                pipeline.feed(video);
                            }
                        }
                    }
                }
            }));
        }

        if let Some(mut renderer) = self.renderer.lock().expect("renderer lock").take() {
            let cell = Arc::clone(&cell);
            let cancel = cancel.clone();
            let fps = config.fps;
            tasks.push(tokio::spawn(async move {
                let _ = present_loop(cell.as_ref(), renderer.as_mut(), fps, cancel).await;
            }));
        }

        // ── Session control loop ─────────────────────────────────
        let loop_ctx = SessionLoop {
            config: Arc::clone(&config),
            outbound: Arc::clone(&outbound),
            phase: self.phase_tx.clone(),
            events: self.events_tx.clone(),
            identity: endpoint.identity(),
            session_rx,
            audio,
            audio_rx: streams.audio,
            media_rx: streams.media,
            commands_rx: streams.commands,
            hotplug_rx: self.hotplug.lock().expect("hotplug lock").take(),
            media_seen,
            video_reset,
            cancel: cancel.clone(),
            timing: self.timing,
        };
        tasks.push(tokio::spawn(loop_ctx.run()));

        *self.run.lock().expect("run lock") = Some(RunHandles {
            cancel,
            outbound,
            threads: vec![reader, writer],
            tasks,
        });

        // ── Await Streaming ──────────────────────────────────────
        let mut phase_rx = self.phase_tx.subscribe();
        let wait = phase_rx.wait_for(|p| {
            p.is_streaming() || p.is_failed() || p.is_closed()
        });
        let resolved = {
            let outcome = tokio::time::timeout(self.timing.init_timeout, wait).await;
            match outcome {
                Ok(Ok(phase)) if phase.is_streaming() => Some(Ok(())),
                Ok(Ok(phase)) if phase.is_closed() => Some(Err(AutoboxError::DeviceGone)),
                Ok(Ok(_)) => Some(Err(AutoboxError::InvalidState {
                    op: "start",
                    state: "Failed",
                })),
                Ok(Err(_)) => Some(Err(AutoboxError::ChannelClosed)),
                Err(_) => None,
            }
        };
        match resolved {
            Some(result) => result,
            None => {
                warn!("handshake did not reach streaming in time");
                self.fail("handshake timeout");
                self.teardown().await;
                Err(AutoboxError::Timeout(self.timing.init_timeout))
            }
        }
    }

    /// Stop the session: cancel timers and tasks, drain pending
    /// writes (bounded by the write grace), release the device.
    /// Idempotent.
    pub async fn stop(&self) {
        let _guard = self.start_lock.lock().await;
        self.teardown().await;
        *self.endpoint.lock().expect("endpoint lock") = None;
        self.phase_tx.send_modify(|p| p.reset());
    }

    /// Handle one host command.
    pub async fn command(&self, command: HostCommand) -> Result<(), AutoboxError> {
        match command {
            HostCommand::Start => self.start().await,
            HostCommand::Stop => {
                self.stop().await;
                Ok(())
            }
            HostCommand::SendKey(value) => {
                self.push_streaming(FrameCategory::Control, input::encode_key(value))
            }
            HostCommand::SendTouch(touch) => self.push_streaming(
                FrameCategory::Touch,
                input::encode_touch(touch.x, touch.y, touch.action),
            ),
            HostCommand::SendMultiTouch(update) => {
                let frame = self.touch.lock().expect("touch lock").update(update);
                match frame {
                    Some(frame) => self.push_streaming(FrameCategory::Touch, frame),
                    None => Ok(()), // unknown pointer, nothing to send
                }
            }
            HostCommand::SetConfig(config) => {
                if !self.phase().is_closed() {
                    return Err(AutoboxError::InvalidState {
                        op: "set config",
                        state: self.phase().name(),
                    });
                }
                *self.config.lock().expect("config lock") = Arc::new(*config);
                Ok(())
            }
            HostCommand::ForceReset => {
                let endpoint = self.endpoint.lock().expect("endpoint lock").clone();
                self.stop().await;
                match endpoint {
                    Some(endpoint) => endpoint.reset(),
                    None => Err(AutoboxError::NoDevice),
                }
            }
        }
    }

    fn push_streaming(
        &self,
        category: FrameCategory,
        message: Message,
    ) -> Result<(), AutoboxError> {
        let phase = self.phase();
        if !phase.is_streaming() {
            return Err(AutoboxError::InvalidState {
                op: "send",
                state: phase.name(),
            });
        }
        let outbound = self
            .run
            .lock()
            .expect("run lock")
            .as_ref()
            .map(|r| Arc::clone(&r.outbound))
            .ok_or(AutoboxError::ChannelClosed)?;
        outbound.push(category, message)
    }

    fn fail(&self, reason: &str) {
        self.phase_tx.send_modify(|p| p.fail());
        let _ = self.events_tx.send(CoreEvent::Failure(reason.to_string()));
    }

    async fn teardown(&self) {
        let run = self.run.lock().expect("run lock").take();
        let Some(run) = run else { return };

        // Let the writer drain what it can, then cut everything.
        run.outbound.close();
        run.cancel.cancel();

        for task in run.tasks {
            task.abort();
        }

        let grace = self.timing.write_grace;
        let threads = run.threads;
        let join = tokio::task::spawn_blocking(move || {
            for t in threads {
                let _ = t.join();
            }
        });
        // Reader exits within a poll window, writer within the grace.
        // If either overruns we detach; the thread holds its endpoint
        // clone for at most one more transfer timeout.
        let budget = grace + self.timing.read_timeout + self.timing.write_timeout;
        if tokio::time::timeout(budget, join).await.is_err() {
            warn!("session threads exceeded the stop grace");
        }
    }
}

// ── Reader / writer loops ────────────────────────────────────────

/// Counts protocol strikes within a sliding window.
struct StrikeWindow {
    times: VecDeque<Instant>,
}

impl StrikeWindow {
    fn new() -> Self {
        Self {
            times: VecDeque::new(),
        }
    }

    /// Record one strike; `true` when the window overflows.
    fn strike(&mut self) -> bool {
        let now = Instant::now();
        self.times.push_back(now);
        while let Some(&front) = self.times.front() {
            if now.duration_since(front) > STRIKE_WINDOW {
                self.times.pop_front();
            } else {
                break;
            }
        }
        self.times.len() >= PROTOCOL_STRIKE_LIMIT
    }
}

fn reader_loop(
    endpoint: Arc<dyn DongleEndpoint>,
    demux: Demux,
    tx: mpsc::UnboundedSender<SessionMsg>,
    cancel: CancellationToken,
    timing: SessionTiming,
) {
    let mut codec = DongleCodec::new();
    let mut buf = BytesMut::with_capacity(128 * 1024);
    // At least packet_max, or libusb reports overflow on large bulks.
    let mut chunk = vec![0u8; 64 * 1024];
    let mut strikes = StrikeWindow::new();

    while !cancel.is_cancelled() {
        let n = match endpoint.read_bulk(&mut chunk, timing.read_timeout) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(err) if err.is_device_gone() => {
                let _ = tx.send(SessionMsg::DeviceGone);
                return;
            }
            Err(err) => {
                let _ = tx.send(SessionMsg::Fatal(format!("bulk read: {err}")));
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match codec.decode(&mut buf) {
                Ok(Some(message)) => {
                    if let Some(control) = demux.route(message) {
                        if tx.send(SessionMsg::Inbound(control)).is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("dropping malformed frame: {err}");
                    if strikes.strike() {
                        let _ = tx.send(SessionMsg::Fatal(format!(
                            "repeated protocol errors: {err}"
                        )));
                        return;
                    }
                }
            }
        }
    }
}

fn writer_loop(
    endpoint: Arc<dyn DongleEndpoint>,
    outbound: Arc<OutboundQueue>,
    tx: mpsc::UnboundedSender<SessionMsg>,
    cancel: CancellationToken,
    timing: SessionTiming,
) {
    let mut drain_deadline: Option<Instant> = None;

    loop {
        if cancel.is_cancelled() && drain_deadline.is_none() {
            drain_deadline = Some(Instant::now() + timing.write_grace);
        }
        if let Some(deadline) = drain_deadline {
            if Instant::now() >= deadline {
                debug!("abandoning {} undrained frames", outbound.len());
                return;
            }
        }

        match outbound.pop_blocking(Duration::from_millis(50)) {
            PopResult::Frame(frame) => {
                let bytes = frame.message.encode_frame();
                match endpoint.write_bulk(&bytes, timing.write_timeout) {
                    Ok(()) => {}
                    Err(err) if err.is_device_gone() => {
                        let _ = tx.send(SessionMsg::DeviceGone);
                        return;
                    }
                    Err(err) => {
                        let _ = tx.send(SessionMsg::Fatal(format!("bulk write: {err}")));
                        return;
                    }
                }
            }
            PopResult::Empty => continue,
            PopResult::Closed => return,
        }
    }
}

// ── Session control loop ─────────────────────────────────────────

struct SessionLoop {
    config: Arc<DongleConfig>,
    outbound: Arc<OutboundQueue>,
    phase: watch::Sender<SessionPhase>,
    events: mpsc::UnboundedSender<CoreEvent>,
    identity: Option<DeviceIdentity>,
    session_rx: mpsc::UnboundedReceiver<SessionMsg>,
    audio: AudioPipeline,
    audio_rx: mpsc::UnboundedReceiver<AudioData>,
    media_rx: mpsc::UnboundedReceiver<MediaPayload>,
    commands_rx: mpsc::UnboundedReceiver<CommandValue>,
    hotplug_rx: Option<mpsc::UnboundedReceiver<HotplugEvent>>,
    media_seen: Arc<AtomicBool>,
    video_reset: Arc<Notify>,
    cancel: CancellationToken,
    timing: SessionTiming,
}

impl SessionLoop {
    async fn run(mut self) {
        let mut meta = MediaMetaState::default();
        let mut phone_type: Option<PhoneType> = None;
        let mut sw_version: Option<String> = None;
        let mut frame_tick: Option<tokio::time::Interval> = None;
        let mut pair_deadline: Option<Pin<Box<tokio::time::Sleep>>> = None;
        let mut link_hb = tokio::time::interval(self.timing.link_heartbeat);
        link_hb.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Opened: push the initialise blobs, then let the FSM advance
        // on the device's responses.
        if self.push_init_sequence().is_err() {
            self.fatal("writer queue rejected the initialise sequence");
            return;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                _ = link_hb.tick() => {
                    if self.push_control(Message::HeartBeat).is_err() {
                        break;
                    }
                }

                _ = async { frame_tick.as_mut().expect("guarded").tick().await },
                    if frame_tick.is_some() =>
                {
                    if self.push_control(Message::Command(CommandValue::Frame)).is_err() {
                        break;
                    }
                }

                _ = async { pair_deadline.as_mut().expect("guarded").as_mut().await },
                    if pair_deadline.is_some() =>
                {
                    pair_deadline = None;
                    if !self.media_seen.load(Ordering::Relaxed) {
                        info!("no media after configuration, nudging wifi pairing");
                        if self.push_control(Message::Command(CommandValue::WifiPair)).is_err() {
                            break;
                        }
                    }
                }

                event = async { self.hotplug_rx.as_mut().expect("guarded").recv().await },
                    if self.hotplug_rx.is_some() =>
                {
                    match event {
                        Some(HotplugEvent::Detached) | None => {
                            info!("transport detach, closing session");
                            let _ = self.events.send(CoreEvent::Unplugged);
                            self.phase.send_modify(|p| { let _ = p.close(); });
                            self.cancel.cancel();
                            break;
                        }
                        Some(HotplugEvent::Attached) => {
                            debug!("transport attach (already running, ignored)");
                        }
                    }
                }

                Some(msg) = self.session_rx.recv() => {
                    match msg {
                        SessionMsg::Inbound(message) => {
                            if self
                                .handle_inbound(
                                    message,
                                    &mut phone_type,
                                    &mut sw_version,
                                    &mut frame_tick,
                                    &mut pair_deadline,
                                )
                                .is_err()
                            {
                                break;
                            }
                        }
                        SessionMsg::DeviceGone => {
                            info!("device gone, closing session");
                            let _ = self.events.send(CoreEvent::Unplugged);
                            self.phase.send_modify(|p| { let _ = p.close(); });
                            self.cancel.cancel();
                            break;
                        }
                        SessionMsg::Fatal(reason) => {
                            self.fatal(&reason);
                            break;
                        }
                    }
                }

                Some(frame) = self.audio_rx.recv() => {
                    self.audio.handle(frame);
                }

                Some(payload) = self.media_rx.recv() => {
                    match meta.apply(&payload) {
                        Ok(snapshot) => {
                            let _ = self.events.send(CoreEvent::MediaMeta(snapshot));
                        }
                        Err(err) => debug!("unusable media payload: {err}"),
                    }
                }

                Some(value) = self.commands_rx.recv() => {
                    let _ = self.events.send(CoreEvent::Command(value));
                }
            }
        }
    }

    /// FSM + event handling for one session-level message.
    fn handle_inbound(
        &mut self,
        message: Message,
        phone_type: &mut Option<PhoneType>,
        sw_version: &mut Option<String>,
        frame_tick: &mut Option<tokio::time::Interval>,
        pair_deadline: &mut Option<Pin<Box<tokio::time::Sleep>>>,
    ) -> Result<(), ()> {
        let phase = *self.phase.borrow();
        match message {
            Message::Ack { value } => {
                debug!("ack {value:#x} in {phase}");
                if matches!(phase, SessionPhase::Opened) {
                    self.advance_initialised()?;
                }
            }
            Message::Open(info) => {
                debug!(
                    "open echo {}x{}@{} in {phase}",
                    info.width, info.height, info.fps
                );
                if matches!(phase, SessionPhase::Opened) {
                    self.advance_initialised()?;
                }
            }
            Message::BoxInfo(blob) => {
                if matches!(phase, SessionPhase::Initialised) {
                    self.phase.send_modify(|p| {
                        let _ = p.configure();
                    });
                    self.emit_dongle_info(&blob, sw_version.as_deref());

                    // Start streaming and arm the pair timeout.
                    self.push_control(Message::Command(CommandValue::WifiConnect))
                        .map_err(|_| ())?;
                    self.phase.send_modify(|p| {
                        let _ = p.stream();
                    });
                    *pair_deadline = Some(Box::pin(tokio::time::sleep(self.timing.pair_timeout)));
                    self.arm_frame_tick(*phone_type, frame_tick);
                    info!("session streaming");
                } else {
                    debug!("box info outside Initialised ignored");
                }
            }
            Message::SoftwareVersion(raw) => {
                let text = String::from_utf8_lossy(&raw)
                    .trim_end_matches('\0')
                    .to_string();
                debug!("dongle software: {text}");
                *sw_version = Some(text);
            }
            Message::Plugged { phone_type: pt, wifi } => {
                info!("phone plugged: {pt} (wifi {wifi:?})");
                *phone_type = Some(pt);
                self.arm_frame_tick(*phone_type, frame_tick);
                let _ = self.events.send(CoreEvent::Plugged {
                    phone_type: pt,
                    wifi,
                });
            }
            Message::Unplugged => {
                // Informational (phone left the dongle); the transport
                // attach/detach stream stays authoritative for the USB
                // side.
                info!("phone unplugged");
                *phone_type = None;
                *frame_tick = None;
                self.audio.reset();
                self.video_reset.notify_waiters();
                let _ = self.events.send(CoreEvent::Unplugged);
            }
            Message::HeartBeat => {}
            Message::Unknown { tag, payload } => {
                debug!("unknown frame {tag:#04x} ({} bytes)", payload.len());
            }
            other => {
                debug!("unexpected inbound {other:?}");
            }
        }
        Ok(())
    }

    /// Opened → Initialised, then push the configuration batch.
    fn advance_initialised(&mut self) -> Result<(), ()> {
        self.phase.send_modify(|p| {
            let _ = p.initialise();
        });
        self.push_config_sequence().map_err(|_| ())
    }

    fn arm_frame_tick(
        &self,
        phone_type: Option<PhoneType>,
        frame_tick: &mut Option<tokio::time::Interval>,
    ) {
        if !self.phase.borrow().is_streaming() {
            return;
        }
        let Some(pt) = phone_type else { return };
        match self.config.frame_interval(pt) {
            Some(ms) if frame_tick.is_none() => {
                let period = Duration::from_millis(ms);
                let mut tick =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                debug!("frame heartbeat every {ms} ms for {pt}");
                *frame_tick = Some(tick);
            }
            _ => {}
        }
    }

    fn emit_dongle_info(&self, box_info: &JsonBlob, sw_version: Option<&str>) {
        let mut identity = self.identity.clone().unwrap_or_default();
        if let Some(sw) = sw_version {
            identity.fw_version = sw.to_string();
        }
        if identity.product.is_empty() {
            if let Ok(value) = box_info.value() {
                if let Some(name) = value.get("boxName").and_then(|v| v.as_str()) {
                    identity.product = name.to_string();
                }
            }
        }
        let _ = self.events.send(CoreEvent::DongleInfo(identity));
    }

    fn fatal(&self, reason: &str) {
        warn!("session failed: {reason}");
        self.phase.send_modify(|p| p.fail());
        let _ = self.events.send(CoreEvent::Failure(reason.to_string()));
        self.cancel.cancel();
    }

    fn push_control(&self, message: Message) -> Result<(), AutoboxError> {
        match self.outbound.push(FrameCategory::Control, message) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Control frames must never drop.
                self.fatal(&format!("outbound control: {err}"));
                Err(err)
            }
        }
    }

    /// The initialise blob sequence (file writes, per the reference
    /// firmware).
    fn push_init_sequence(&self) -> Result<(), AutoboxError> {
        let cfg = &self.config;
        let files: Vec<(String, Bytes)> = {
            let mut files = vec![
                ("/tmp/screen_dpi".to_string(), le_u32(cfg.dpi)),
                ("/tmp/night_mode".to_string(), le_u32(cfg.night_mode as u32)),
                (
                    "/tmp/hand_drive_mode".to_string(),
                    le_u32(cfg.drive_hand_right as u32),
                ),
                ("/tmp/charge_mode".to_string(), le_u32(1)),
                (
                    "/etc/box_name".to_string(),
                    Bytes::from(cfg.car_name.clone().into_bytes()),
                ),
            ];
            if !cfg.oem_icon.is_empty() {
                files.push((
                    "/etc/oem_icon.png".to_string(),
                    Bytes::from(cfg.oem_icon.clone()),
                ));
            }
            for (size, png) in &cfg.icons {
                files.push((
                    format!("/etc/icon_{size}x{size}.png"),
                    Bytes::from(png.clone()),
                ));
            }
            files
        };

        for (path, content) in files {
            self.push_control(Message::SendFile { path, content })?;
        }
        Ok(())
    }

    /// The configuration batch sent on entering Initialised.
    fn push_config_sequence(&self) -> Result<(), AutoboxError> {
        let cfg = &self.config;
        self.push_control(Message::Open(OpenInfo {
            width: cfg.width,
            height: cfg.height,
            fps: cfg.fps,
            format: cfg.format,
            packet_max: cfg.packet_max,
            i_box_version: cfg.i_box_version,
            phone_work_mode: cfg.phone_work_mode,
        }))?;

        let sync_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let settings = serde_json::json!({
            "mediaDelay": cfg.media_delay,
            "syncTime": sync_time,
            "androidAutoSizeW": cfg.width,
            "androidAutoSizeH": cfg.height,
            "boxName": cfg.car_name,
            "oemName": cfg.oem_name,
            "wifiChannel": cfg.wifi_channel,
        });
        self.push_control(Message::BoxSettings(JsonBlob::from_value(&settings)))?;

        self.push_control(Message::Command(CommandValue::WifiEnable))?;
        let band = match cfg.wifi_type {
            crate::config::WifiType::Ghz24 => CommandValue::Wifi24g,
            crate::config::WifiType::Ghz5 => CommandValue::Wifi5g,
        };
        self.push_control(Message::Command(band))?;
        let transfer = if cfg.audio_transfer_mode {
            CommandValue::AudioTransferOn
        } else {
            CommandValue::AudioTransferOff
        };
        self.push_control(Message::Command(transfer))
    }
}

fn le_u32(v: u32) -> Bytes {
    Bytes::from(v.to_le_bytes().to_vec())
}

// ── Tests ────────────────────────────────────────────────────────
