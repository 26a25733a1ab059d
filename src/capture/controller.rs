//! Runs one user action at a time against a capture session.
//!
//! Front ends send [`Command`]s and read [`Event`]s; the controller task owns
//! every session it opens, so nothing else ever touches the portal handles or
//! the recorder process. Every action that gets past the selection check ends
//! with exactly one [`Event::Ended`].
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::capture::backend::{self, DisplayServer, Toolchain};
use crate::capture::command_utils::ToolCommand;
use crate::capture::error::{CaptureError, Result};
use crate::capture::frame::{FrameCapture, save_png, verify_nonempty};
use crate::capture::geometry::{MonitorInfo, SelectionRect, map_to_physical_crop};
use crate::capture::output::{
    RECORDING_EXTENSION, RECORDING_PREFIX, SCREENSHOT_EXTENSION, SCREENSHOT_PREFIX,
    build_output_path,
};
use crate::capture::portal::{CaptureService, DbusPortal};
use crate::capture::session::{
    CancelHandle, CancelToken, CaptureSession, SessionOptions, SessionSlot, cancel_pair,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purpose {
    Screenshot,
    Recording,
}

/// What to capture and where the result goes.
#[derive(Clone, Debug)]
pub struct CaptureRequest {
    pub selection: SelectionRect,
    pub monitor: MonitorInfo,
    /// Logical top-left of the whole desktop, where whole-desktop frames start.
    pub desktop_origin: (i32, i32),
    pub output_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub enum Command {
    Screenshot(CaptureRequest),
    StartRecording(CaptureRequest),
    StopRecording,
    /// Abandons negotiation, or stops a live recording.
    Cancel,
}

#[derive(Debug)]
pub enum Event {
    RecordingStarted { output_path: PathBuf },
    ScreenshotSaved { path: PathBuf },
    RecordingSaved { path: PathBuf, forced: bool },
    Failed { purpose: Purpose, error: CaptureError },
    /// The session is closed and the slot is free again. Not sent for a
    /// request refused as busy, which never opened one.
    Ended { purpose: Purpose },
}

/// The environment-specific half of a capture: how sessions are opened and
/// which mechanisms produce frames and recordings.
pub trait CaptureDriver: Send + Sync + 'static {
    type Service: CaptureService + 'static;

    fn open_session(
        &self,
        purpose: Purpose,
        slot: &SessionSlot,
        cancel: CancelToken,
    ) -> impl Future<Output = Result<CaptureSession<Self::Service>>> + Send;

    fn grab_frame(
        &self,
        session: &CaptureSession<Self::Service>,
        request: &CaptureRequest,
    ) -> impl Future<Output = Result<FrameCapture>> + Send;

    /// Recorder invocations in preference order.
    fn recorder_commands(
        &self,
        session: &CaptureSession<Self::Service>,
        selection: &SelectionRect,
        monitor: &MonitorInfo,
        output: &Path,
    ) -> Result<Vec<ToolCommand>>;
}

/// Drives the real desktop: ScreenCast portal when the preferred mechanism
/// needs it, otherwise the probed command line tools.
pub struct SystemDriver {
    toolchain: Toolchain,
    options: SessionOptions,
}

impl SystemDriver {
    pub fn probe() -> Self {
        Self::new(Toolchain::probe(), SessionOptions::default())
    }

    pub fn new(toolchain: Toolchain, options: SessionOptions) -> Self {
        Self { toolchain, options }
    }

    fn wants_portal(&self, purpose: Purpose) -> bool {
        match purpose {
            Purpose::Screenshot => self
                .toolchain
                .frames
                .first()
                .is_some_and(|mechanism| mechanism.needs_negotiation()),
            Purpose::Recording => self
                .toolchain
                .recorders
                .first()
                .is_some_and(|mechanism| mechanism.needs_negotiation()),
        }
    }

    fn direct_display(&self) -> Result<DisplayServer> {
        self.toolchain
            .display
            .ok_or_else(|| CaptureError::Unavailable("a display server".to_string()))
    }

    /// Negotiates over the service `connect` yields when the preferred
    /// mechanism needs it. An unavailable service falls back to a direct
    /// session with the command line tools.
    async fn open_with<S, C>(
        &self,
        purpose: Purpose,
        slot: &SessionSlot,
        cancel: CancelToken,
        connect: C,
    ) -> Result<CaptureSession<S>>
    where
        S: CaptureService,
        C: Future<Output = Result<S>>,
    {
        let guard = slot.acquire()?;

        if self.wants_portal(purpose) {
            let limit = self.options.step_timeout;
            let connected = tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| CaptureError::Timeout {
                    what: "connecting to the portal".to_string(),
                    after: limit,
                })
                .and_then(|connected| connected);

            match connected {
                Ok(service) => {
                    let mut session = CaptureSession::new(service, guard, self.options, cancel);
                    session.negotiate().await?;
                    return Ok(session);
                }
                Err(err) if err.is_unavailable() => {
                    warn!("{err}; using command line tools instead");
                }
                Err(err) => return Err(err),
            }
        }

        let display = self.direct_display()?;
        debug!("direct {display:?} session for {purpose:?}");
        Ok(CaptureSession::direct(display, guard, self.options, cancel))
    }
}

impl CaptureDriver for SystemDriver {
    type Service = DbusPortal;

    async fn open_session(
        &self,
        purpose: Purpose,
        slot: &SessionSlot,
        cancel: CancelToken,
    ) -> Result<CaptureSession<DbusPortal>> {
        self.open_with(purpose, slot, cancel, DbusPortal::connect()).await
    }

    async fn grab_frame(
        &self,
        session: &CaptureSession<DbusPortal>,
        request: &CaptureRequest,
    ) -> Result<FrameCapture> {
        backend::first_available_frame(&self.toolchain.frames, session.is_negotiated(), |mechanism| {
            backend::pull_frame(mechanism, session, &request.monitor, request.desktop_origin)
        })
        .await
    }

    fn recorder_commands(
        &self,
        session: &CaptureSession<DbusPortal>,
        selection: &SelectionRect,
        monitor: &MonitorInfo,
        output: &Path,
    ) -> Result<Vec<ToolCommand>> {
        self.toolchain
            .recorders
            .iter()
            .filter(|mechanism| !mechanism.needs_negotiation() || session.is_negotiated())
            .map(|&mechanism| backend::recorder_command(mechanism, session, selection, monitor, output))
            .collect()
    }
}

/// Handle to the controller task. Cloning shares the same task.
#[derive(Clone)]
pub struct CaptureController {
    commands: mpsc::UnboundedSender<Command>,
    slot: SessionSlot,
}

impl CaptureController {
    pub fn spawn<D: CaptureDriver>(
        driver: D,
        slot: SessionSlot,
        runtime: &Handle,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        runtime.spawn(serve(Arc::new(driver), slot.clone(), command_rx, events));

        (Self { commands, slot }, event_rx)
    }

    pub fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            error!("capture controller has stopped");
        }
    }

    pub fn screenshot(&self, request: CaptureRequest) {
        self.send(Command::Screenshot(request));
    }

    pub fn start_recording(&self, request: CaptureRequest) {
        self.send(Command::StartRecording(request));
    }

    pub fn stop_recording(&self) {
        self.send(Command::StopRecording);
    }

    pub fn cancel(&self) {
        self.send(Command::Cancel);
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_active()
    }
}

async fn serve<D: CaptureDriver>(
    driver: Arc<D>,
    slot: SessionSlot,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(command) = commands.recv().await {
        let (purpose, request) = match command {
            Command::Screenshot(request) => (Purpose::Screenshot, request),
            Command::StartRecording(request) => (Purpose::Recording, request),
            idle @ (Command::StopRecording | Command::Cancel) => {
                debug!("no capture in progress, ignoring {idle:?}");
                continue;
            }
        };

        if !request.selection.is_actionable() {
            debug!("selection {:?} is too small, nothing to do", request.selection);
            continue;
        }

        let (cancel, token) = cancel_pair();
        match purpose {
            Purpose::Screenshot => {
                let flow = screenshot_flow(driver.as_ref(), &slot, &request, token, &events);
                supervise(flow, &mut commands, &cancel, &events).await;
            }
            Purpose::Recording => {
                let flow = recording_flow(driver.as_ref(), &slot, &request, token, &events);
                supervise(flow, &mut commands, &cancel, &events).await;
            }
        }

        emit(&events, Event::Ended { purpose });
    }

    debug!("capture controller shutting down");
}

/// Runs `flow` to completion while turning stop/cancel commands into a
/// cancellation of the running action. New capture requests are refused.
async fn supervise(
    flow: impl Future<Output = ()>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    cancel: &CancelHandle,
    events: &mpsc::UnboundedSender<Event>,
) {
    tokio::pin!(flow);
    let mut listening = true;

    loop {
        tokio::select! {
            () = &mut flow => return,
            command = commands.recv(), if listening => match command {
                Some(Command::StopRecording | Command::Cancel) => cancel.cancel(),
                Some(Command::Screenshot(request)) => refuse_busy(events, Purpose::Screenshot, &request),
                Some(Command::StartRecording(request)) => refuse_busy(events, Purpose::Recording, &request),
                None => {
                    listening = false;
                    cancel.cancel();
                }
            },
        }
    }
}

fn emit(events: &mpsc::UnboundedSender<Event>, event: Event) {
    if events.send(event).is_err() {
        debug!("nobody is listening for capture events");
    }
}

fn refuse_busy(events: &mpsc::UnboundedSender<Event>, purpose: Purpose, request: &CaptureRequest) {
    if !request.selection.is_actionable() {
        return;
    }
    warn!("a capture is already running, refusing {purpose:?}");
    emit(
        events,
        Event::Failed {
            purpose,
            error: CaptureError::Busy,
        },
    );
}

fn report_failure(events: &mpsc::UnboundedSender<Event>, purpose: Purpose, error: CaptureError) {
    if matches!(error, CaptureError::Cancelled) {
        info!("{purpose:?} cancelled");
        return;
    }
    error!("{purpose:?} failed: {error}");
    emit(events, Event::Failed { purpose, error });
}

async fn screenshot_flow<D: CaptureDriver>(
    driver: &D,
    slot: &SessionSlot,
    request: &CaptureRequest,
    cancel: CancelToken,
    events: &mpsc::UnboundedSender<Event>,
) {
    let outcome = match driver.open_session(Purpose::Screenshot, slot, cancel.clone()).await {
        Ok(mut session) => {
            let outcome = capture_and_save(driver, &mut session, request, cancel).await;
            session.close().await;
            outcome
        }
        Err(err) => Err(err),
    };

    match outcome {
        Ok(path) => {
            info!("screenshot saved to {}", path.display());
            emit(events, Event::ScreenshotSaved { path });
        }
        Err(err) => report_failure(events, Purpose::Screenshot, err),
    }
}

async fn capture_and_save<D: CaptureDriver>(
    driver: &D,
    session: &mut CaptureSession<D::Service>,
    request: &CaptureRequest,
    mut cancel: CancelToken,
) -> Result<PathBuf> {
    let capture = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(CaptureError::Cancelled),
        capture = driver.grab_frame(session, request) => capture?,
    };
    session.frame_taken()?;

    let FrameCapture {
        frame,
        origin_x,
        origin_y,
    } = capture;
    let crop = map_to_physical_crop(
        &request.selection,
        &request.monitor,
        origin_x,
        origin_y,
        frame.width,
        frame.height,
    );
    if crop.is_empty() {
        return Err(CaptureError::EmptyCrop);
    }
    debug!("cropping {}x{} frame to {crop:?}", frame.width, frame.height);

    let image = frame.into_cropped(crop)?;
    let path = build_output_path(&request.output_dir, SCREENSHOT_PREFIX, SCREENSHOT_EXTENSION)?;
    let target = path.clone();
    tokio::task::spawn_blocking(move || save_png(&image, &target))
        .await
        .map_err(|err| CaptureError::io("encoding screenshot", io::Error::other(err)))??;

    Ok(path)
}

async fn recording_flow<D: CaptureDriver>(
    driver: &D,
    slot: &SessionSlot,
    request: &CaptureRequest,
    cancel: CancelToken,
    events: &mpsc::UnboundedSender<Event>,
) {
    let mut session = match driver.open_session(Purpose::Recording, slot, cancel.clone()).await {
        Ok(session) => session,
        Err(err) => return report_failure(events, Purpose::Recording, err),
    };

    let outcome = record(driver, &mut session, request, cancel, events).await;
    session.close().await;

    match outcome {
        Ok((path, forced)) => {
            info!("recording saved to {}", path.display());
            emit(events, Event::RecordingSaved { path, forced });
        }
        Err(err) => report_failure(events, Purpose::Recording, err),
    }
}

async fn record<D: CaptureDriver>(
    driver: &D,
    session: &mut CaptureSession<D::Service>,
    request: &CaptureRequest,
    mut cancel: CancelToken,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<(PathBuf, bool)> {
    let output = build_output_path(&request.output_dir, RECORDING_PREFIX, RECORDING_EXTENSION)?;
    let commands = driver.recorder_commands(session, &request.selection, &request.monitor, &output)?;

    let mut last = None;
    for command in commands {
        let description = command.describe();
        match session.start_recording(command, output.clone()).await {
            Ok(()) => {
                debug!("recording with `{description}`");
                last = None;
                break;
            }
            Err(err) if err.is_unavailable() => {
                info!("{err}");
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    if let Some(err) = last {
        return Err(err);
    }
    if !session.is_recording() {
        return Err(CaptureError::Unavailable("a screen recorder".to_string()));
    }

    emit(
        events,
        Event::RecordingStarted {
            output_path: output.clone(),
        },
    );

    let tool = session.recorder_tool().unwrap_or("recorder");
    let exited = tokio::select! {
        () = cancel.cancelled() => None,
        status = session.recorder_exited() => Some(status?),
    };

    let outcome = session.stop_recording().await?;
    if let Some(status) = exited {
        warn!("{tool} exited on its own with {status}");
        if !status.success() {
            return Err(CaptureError::Subprocess {
                tool: tool.to_string(),
                message: format!("exited with {status}"),
            });
        }
    }

    verify_nonempty(&outcome.output_path)?;
    Ok((outcome.output_path, outcome.forced))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use image::{Rgba, RgbaImage};

    use super::*;
    use crate::capture::frame::CapturedFrame;
    use crate::capture::portal::{PortalResponse, Results};
    use crate::capture::session::{Step, cancel_pair};
    use crate::capture::session::tests::{FakeService, Reply, fast_options};

    #[derive(Default)]
    struct FakeDriver {
        service: FakeService,
        negotiate: bool,
        recorder_script: Option<&'static str>,
        opened: Arc<AtomicUsize>,
        recorder_builds: Arc<AtomicUsize>,
    }

    impl CaptureDriver for FakeDriver {
        type Service = FakeService;

        async fn open_session(
            &self,
            _purpose: Purpose,
            slot: &SessionSlot,
            cancel: CancelToken,
        ) -> Result<CaptureSession<FakeService>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let guard = slot.acquire()?;
            if self.negotiate {
                let mut session =
                    CaptureSession::new(self.service.clone(), guard, fast_options(), cancel);
                session.negotiate().await?;
                Ok(session)
            } else {
                Ok(CaptureSession::direct(
                    DisplayServer::Wayland,
                    guard,
                    fast_options(),
                    cancel,
                ))
            }
        }

        async fn grab_frame(
            &self,
            _session: &CaptureSession<FakeService>,
            _request: &CaptureRequest,
        ) -> Result<FrameCapture> {
            let image = RgbaImage::from_fn(1920, 1080, |x, y| Rgba([x as u8, y as u8, 7, 255]));
            Ok(FrameCapture {
                frame: CapturedFrame::from_rgba(image),
                origin_x: 0,
                origin_y: 0,
            })
        }

        fn recorder_commands(
            &self,
            _session: &CaptureSession<FakeService>,
            _selection: &SelectionRect,
            _monitor: &MonitorInfo,
            output: &Path,
        ) -> Result<Vec<ToolCommand>> {
            self.recorder_builds.fetch_add(1, Ordering::SeqCst);
            let script = self.recorder_script.unwrap_or("exit 1");
            Ok(vec![
                ToolCommand::new("simpleshot-missing-recorder"),
                ToolCommand::new("sh").args(["-c", script, "sh"]).arg(output),
            ])
        }
    }

    fn output_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("simpleshot-controller-{label}-{}", std::process::id()))
    }

    fn request(dir: &Path) -> CaptureRequest {
        CaptureRequest {
            selection: SelectionRect {
                x: 10,
                y: 10,
                w: 100,
                h: 50,
            },
            monitor: MonitorInfo::new("DP-1", 0, 0, 960, 540, 2),
            desktop_origin: (0, 0),
            output_dir: dir.to_path_buf(),
        }
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("controller went quiet")
            .expect("controller stopped")
    }

    #[tokio::test]
    async fn screenshot_is_cropped_and_saved() {
        let dir = output_dir("shot");
        let (controller, mut events) =
            CaptureController::spawn(FakeDriver::default(), SessionSlot::default(), &Handle::current());

        controller.screenshot(request(&dir));

        let Event::ScreenshotSaved { path } = next(&mut events).await else {
            panic!("screenshot was not saved");
        };
        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (200, 100));
        assert!(matches!(next(&mut events).await, Event::Ended { purpose: Purpose::Screenshot }));
        assert!(!controller.is_busy());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn rejected_source_selection_never_spawns_a_recorder() {
        let dir = output_dir("rejected");
        let service = FakeService::default().with(
            Step::SelectSources,
            Reply::Respond(PortalResponse {
                status: 2,
                results: Results::new(),
            }),
        );
        let closes = service.closes.clone();
        let driver = FakeDriver {
            service,
            negotiate: true,
            ..FakeDriver::default()
        };
        let builds = driver.recorder_builds.clone();
        let slot = SessionSlot::default();
        let (controller, mut events) = CaptureController::spawn(driver, slot.clone(), &Handle::current());

        controller.start_recording(request(&dir));

        assert!(matches!(
            next(&mut events).await,
            Event::Failed {
                purpose: Purpose::Recording,
                error: CaptureError::Rejected {
                    step: Step::SelectSources,
                    status: 2
                }
            }
        ));
        assert!(matches!(next(&mut events).await, Event::Ended { purpose: Purpose::Recording }));
        assert_eq!(builds.load(Ordering::SeqCst), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!slot.is_active());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stubborn_recorder_is_killed_and_saved_once() {
        let dir = output_dir("stubborn");
        let driver = FakeDriver {
            recorder_script: Some("trap '' INT TERM; printf webm > \"$1\"; exec sleep 30"),
            ..FakeDriver::default()
        };
        let (controller, mut events) =
            CaptureController::spawn(driver, SessionSlot::default(), &Handle::current());

        controller.start_recording(request(&dir));
        let Event::RecordingStarted { output_path } = next(&mut events).await else {
            panic!("recording did not start");
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.stop_recording();

        match next(&mut events).await {
            Event::RecordingSaved { path, forced } => {
                assert_eq!(path, output_path);
                assert!(forced);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(next(&mut events).await, Event::Ended { purpose: Purpose::Recording }));

        controller.stop_recording();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn recorder_that_dies_is_reported() {
        let dir = output_dir("dies");
        let (controller, mut events) =
            CaptureController::spawn(FakeDriver::default(), SessionSlot::default(), &Handle::current());

        controller.start_recording(request(&dir));

        assert!(matches!(next(&mut events).await, Event::RecordingStarted { .. }));
        assert!(matches!(
            next(&mut events).await,
            Event::Failed {
                error: CaptureError::Subprocess { .. },
                ..
            }
        ));
        assert!(matches!(next(&mut events).await, Event::Ended { .. }));

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn tiny_selection_never_reaches_the_driver() {
        let driver = FakeDriver::default();
        let opened = driver.opened.clone();
        let (controller, mut events) =
            CaptureController::spawn(driver, SessionSlot::default(), &Handle::current());

        let mut tiny = request(&output_dir("tiny"));
        tiny.selection.w = 9;
        controller.screenshot(tiny.clone());
        tiny.selection = SelectionRect { x: 0, y: 0, w: 300, h: 4 };
        controller.start_recording(tiny);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(opened.load(Ordering::SeqCst), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn busy_slot_is_reported() {
        let slot = SessionSlot::default();
        let _held = slot.acquire().unwrap();
        let (controller, mut events) =
            CaptureController::spawn(FakeDriver::default(), slot, &Handle::current());

        controller.screenshot(request(&output_dir("busy")));

        assert!(matches!(
            next(&mut events).await,
            Event::Failed {
                error: CaptureError::Busy,
                ..
            }
        ));
        assert!(matches!(next(&mut events).await, Event::Ended { .. }));
    }

    #[tokio::test]
    async fn cancel_during_negotiation_allows_a_new_capture() {
        let dir = output_dir("cancel");
        let driver = FakeDriver {
            service: FakeService::default().with(Step::Start, Reply::Never),
            negotiate: true,
            ..FakeDriver::default()
        };
        let slot = SessionSlot::default();
        let (controller, mut events) = CaptureController::spawn(driver, slot.clone(), &Handle::current());

        controller.screenshot(request(&dir));
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.cancel();

        assert!(matches!(next(&mut events).await, Event::Ended { purpose: Purpose::Screenshot }));
        assert!(!slot.is_active());
        assert!(slot.acquire().is_ok());

        let _ = fs::remove_dir_all(dir);
    }

    const POLITE_RECORDER: &str = "trap 'exit 0' INT; printf webm > \"$1\"; while :; do sleep 0.05; done";

    #[tokio::test]
    async fn cancel_while_recording_stops_and_saves() {
        let dir = output_dir("cancel-recording");
        let driver = FakeDriver {
            recorder_script: Some(POLITE_RECORDER),
            ..FakeDriver::default()
        };
        let (controller, mut events) =
            CaptureController::spawn(driver, SessionSlot::default(), &Handle::current());

        controller.start_recording(request(&dir));
        let Event::RecordingStarted { output_path } = next(&mut events).await else {
            panic!("recording did not start");
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.cancel();

        match next(&mut events).await {
            Event::RecordingSaved { path, forced } => {
                assert_eq!(path, output_path);
                assert!(!forced);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(next(&mut events).await, Event::Ended { purpose: Purpose::Recording }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert!(!controller.is_busy());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn capture_requested_during_a_recording_is_refused_as_busy() {
        let dir = output_dir("refused");
        let driver = FakeDriver {
            recorder_script: Some(POLITE_RECORDER),
            ..FakeDriver::default()
        };
        let opened = driver.opened.clone();
        let (controller, mut events) =
            CaptureController::spawn(driver, SessionSlot::default(), &Handle::current());

        controller.start_recording(request(&dir));
        assert!(matches!(next(&mut events).await, Event::RecordingStarted { .. }));

        controller.screenshot(request(&dir));
        assert!(matches!(
            next(&mut events).await,
            Event::Failed {
                purpose: Purpose::Screenshot,
                error: CaptureError::Busy
            }
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        controller.stop_recording();
        assert!(matches!(next(&mut events).await, Event::RecordingSaved { .. }));
        assert!(matches!(next(&mut events).await, Event::Ended { purpose: Purpose::Recording }));
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        let _ = fs::remove_dir_all(dir);
    }

    fn portal_first_driver() -> SystemDriver {
        SystemDriver::new(
            Toolchain::ordered(Some(DisplayServer::Wayland), |_| true),
            fast_options(),
        )
    }

    #[tokio::test]
    async fn missing_portal_falls_back_to_a_direct_session() {
        let driver = portal_first_driver();
        let slot = SessionSlot::default();
        let (_cancel, token) = cancel_pair();

        let mut session = driver
            .open_with(Purpose::Recording, &slot, token, async {
                Err::<FakeService, _>(CaptureError::Unavailable("D-Bus session bus".to_string()))
            })
            .await
            .unwrap();
        assert!(!session.is_negotiated());
        assert!(slot.is_active());
        session.close().await;
        assert!(!slot.is_active());

        let (_cancel, token) = cancel_pair();
        let mut session = driver
            .open_with(Purpose::Screenshot, &slot, token, async { Ok(FakeService::default()) })
            .await
            .unwrap();
        assert!(session.is_negotiated());
        session.close().await;
    }

    #[tokio::test]
    async fn portal_failure_other_than_unavailable_is_not_masked() {
        let driver = portal_first_driver();
        let slot = SessionSlot::default();
        let (_cancel, token) = cancel_pair();

        let err = driver
            .open_with(Purpose::Recording, &slot, token, async {
                Err::<FakeService, _>(CaptureError::Busy)
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Busy));
        assert!(!slot.is_active());
    }
}
