//! Capture session: the ScreenCast handshake as an explicit state machine.
//!
//! ```text
//! Idle → SessionRequested → SourcesSelected → Started → RemoteOpened → Ready
//! Ready ⇄ Capturing          Ready → FrameTaken          any → Closed
//! ```
//!
//! Each arrow up to `Ready` is one awaited request. A step runs only after the
//! previous one reported success; anything else closes the session. Cancellation
//! and the per-step timeout wrap every await, so an outstanding request is simply
//! dropped and its late response never observed.
use std::fmt;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;

use crate::capture::backend::DisplayServer;
use crate::capture::command_utils::ToolCommand;
use crate::capture::error::{CaptureError, Result};
use crate::capture::portal::{CaptureService, OptionValue, Options, PortalValue, Results};
use crate::capture::recording::{RecordingOutcome, RecordingProcess};

const SOURCE_TYPE_MONITOR: u32 = 1;
const CURSOR_MODE_EMBEDDED: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    SessionRequested,
    SourcesSelected,
    Started,
    RemoteOpened,
    Ready,
    Capturing,
    FrameTaken,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    CreateSession,
    SelectSources,
    Start,
    OpenRemote,
}

impl Step {
    pub fn method(self) -> &'static str {
        match self {
            Step::CreateSession => "CreateSession",
            Step::SelectSources => "SelectSources",
            Step::Start => "Start",
            Step::OpenRemote => "OpenPipeWireRemote",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// One negotiated PipeWire stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub node_id: u32,
    /// Logical position of the streamed monitor, when the portal reports it.
    pub position: Option<(i32, i32)>,
    pub size: Option<(u32, u32)>,
}

impl StreamInfo {
    fn from_results(results: &Results) -> Option<Self> {
        let streams = results.get("streams")?.as_list()?;
        let fields = streams.first()?.as_list()?;
        let node_id = fields.first()?.as_u32()?;
        let props = fields.get(1).and_then(PortalValue::as_map);

        let position = props
            .and_then(|p| p.get("position"))
            .and_then(PortalValue::as_pair);
        let size = props
            .and_then(|p| p.get("size"))
            .and_then(PortalValue::as_pair)
            .and_then(|(w, h)| Some((u32::try_from(w).ok()?, u32::try_from(h).ok()?)));

        Some(Self {
            node_id,
            position,
            size,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureSource {
    PipeWire(StreamInfo),
    Display(DisplayServer),
}

/// Everything the handshake has produced so far. Passed explicitly to every
/// step; owned by exactly one session.
#[derive(Debug, Default)]
pub struct SessionContext {
    pub session_handle: Option<String>,
    pub stream: Option<StreamInfo>,
    pub remote: Option<OwnedFd>,
}

#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Bound on each handshake step. Start may wait on an interactive picker.
    pub step_timeout: Duration,
    /// How long a recorder gets to exit after SIGINT before it is killed.
    pub stop_grace: Duration,
    pub frame_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
            frame_timeout: Duration::from_secs(15),
        }
    }
}

/// Admits at most one live session per application instance.
#[derive(Clone, Debug, Default)]
pub struct SessionSlot(Arc<AtomicBool>);

impl SessionSlot {
    pub fn acquire(&self) -> Result<SlotGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| SlotGuard(self.0.clone()))
            .map_err(|_| CaptureError::Busy)
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Requests that a session wind down. Safe to call at any time, any number of times.
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

#[derive(Clone, Debug)]
pub struct CancelToken(watch::Receiver<bool>);

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(Arc::new(tx)), CancelToken(rx))
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled. Never resolves if every handle was dropped
    /// without cancelling.
    pub async fn cancelled(&mut self) {
        let abandoned = self.0.wait_for(|cancelled| *cancelled).await.is_err();
        if abandoned {
            std::future::pending::<()>().await;
        }
    }
}

async fn guarded<T>(
    cancel: &mut CancelToken,
    limit: Duration,
    step: Step,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CaptureError::Cancelled),
        outcome = tokio::time::timeout(limit, call) => match outcome {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Timeout { what: step.to_string(), after: limit }),
        },
    }
}

pub struct CaptureSession<S> {
    service: Option<S>,
    context: SessionContext,
    source: Option<CaptureSource>,
    state: SessionState,
    recording: Option<RecordingProcess>,
    options: SessionOptions,
    cancel: CancelToken,
    slot: Option<SlotGuard>,
}

impl<S: CaptureService> CaptureSession<S> {
    /// A session that must negotiate with `service` before it is usable.
    pub fn new(service: S, slot: SlotGuard, options: SessionOptions, cancel: CancelToken) -> Self {
        Self {
            service: Some(service),
            context: SessionContext::default(),
            source: None,
            state: SessionState::Idle,
            recording: None,
            options,
            cancel,
            slot: Some(slot),
        }
    }

    /// A session for tools that grab the display directly; it starts out Ready.
    pub fn direct(
        display: DisplayServer,
        slot: SlotGuard,
        options: SessionOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            service: None,
            context: SessionContext::default(),
            source: Some(CaptureSource::Display(display)),
            state: SessionState::Ready,
            recording: None,
            options,
            cancel,
            slot: Some(slot),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn source(&self) -> Option<&CaptureSource> {
        self.source.as_ref()
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_negotiated(&self) -> bool {
        matches!(self.source, Some(CaptureSource::PipeWire(_))) && self.context.remote.is_some()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the whole handshake. On any failure the session is closed before
    /// the error is returned.
    pub async fn negotiate(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(CaptureError::InvalidState(self.state));
        }

        let result = self.handshake().await;
        if let Err(err) = &result {
            warn!("capture negotiation stopped in {:?}: {err}", self.state);
            self.close().await;
        }
        result
    }

    async fn handshake(&mut self) -> Result<()> {
        let limit = self.options.step_timeout;
        let Some(service) = self.service.as_mut() else {
            return Err(CaptureError::InvalidState(self.state));
        };
        let cancel = &mut self.cancel;
        let context = &mut self.context;

        let step = Step::CreateSession;
        debug!("{step}");
        let response = guarded(cancel, limit, step, service.request(step, context, Options::new())).await?;
        if !response.is_success() {
            return Err(CaptureError::Rejected { step, status: response.status });
        }
        let handle = response
            .results
            .get("session_handle")
            .and_then(PortalValue::as_str)
            .ok_or(CaptureError::MissingField { step, field: "session_handle" })?;
        context.session_handle = Some(handle.to_string());
        self.state = SessionState::SessionRequested;

        let step = Step::SelectSources;
        debug!("{step}");
        let mut options = Options::new();
        options.insert("types", OptionValue::U32(SOURCE_TYPE_MONITOR));
        options.insert("multiple", OptionValue::Bool(false));
        options.insert("cursor_mode", OptionValue::U32(CURSOR_MODE_EMBEDDED));
        let response = guarded(cancel, limit, step, service.request(step, context, options)).await?;
        if !response.is_success() {
            return Err(CaptureError::Rejected { step, status: response.status });
        }
        self.state = SessionState::SourcesSelected;

        let step = Step::Start;
        debug!("{step}");
        let response = guarded(cancel, limit, step, service.request(step, context, Options::new())).await?;
        if !response.is_success() {
            return Err(CaptureError::Rejected { step, status: response.status });
        }
        let stream = StreamInfo::from_results(&response.results)
            .ok_or(CaptureError::MissingField { step, field: "streams" })?;
        context.stream = Some(stream.clone());
        self.state = SessionState::Started;

        let step = Step::OpenRemote;
        debug!("{step}");
        let remote = guarded(cancel, limit, step, service.open_remote(context)).await?;
        context.remote = Some(remote);
        self.state = SessionState::RemoteOpened;

        info!("capture session ready on PipeWire node {}", stream.node_id);
        self.source = Some(CaptureSource::PipeWire(stream));
        self.state = SessionState::Ready;
        Ok(())
    }

    pub async fn start_recording(&mut self, tool: ToolCommand, output: PathBuf) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(CaptureError::InvalidState(self.state));
        }

        self.recording = Some(RecordingProcess::spawn(tool, output)?);
        self.state = SessionState::Capturing;
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn recorder_tool(&self) -> Option<&'static str> {
        self.recording.as_ref().map(RecordingProcess::tool)
    }

    /// Resolves when the recorder exits without being asked to. Pending while
    /// nothing is recording.
    pub async fn recorder_exited(&mut self) -> Result<ExitStatus> {
        match self.recording.as_mut() {
            Some(process) => process.exited().await,
            None => std::future::pending().await,
        }
    }

    pub async fn stop_recording(&mut self) -> Result<RecordingOutcome> {
        let Some(process) = self.recording.take() else {
            return Err(CaptureError::InvalidState(self.state));
        };
        self.state = SessionState::Ready;
        process.stop(self.options.stop_grace).await
    }

    /// Marks the single frame as taken; the session only awaits `close` afterwards.
    pub fn frame_taken(&mut self) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(CaptureError::InvalidState(self.state));
        }
        self.state = SessionState::FrameTaken;
        Ok(())
    }

    /// Releases every resource exactly once. Closing a closed session is a no-op.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        if let Some(process) = self.recording.take() {
            match process.stop(self.options.stop_grace).await {
                Ok(outcome) => info!("recorder stopped on close: {}", outcome.output_path.display()),
                Err(err) => warn!("recorder did not stop cleanly: {err}"),
            }
        }

        if let (Some(service), Some(handle)) =
            (self.service.as_mut(), self.context.session_handle.take())
        {
            match tokio::time::timeout(self.options.step_timeout, service.close_session(&handle)).await {
                Ok(Ok(())) => debug!("closed portal session {handle}"),
                Ok(Err(err)) => warn!("closing portal session {handle} failed: {err}"),
                Err(_) => warn!("closing portal session {handle} timed out"),
            }
        }

        self.context.remote = None;
        self.context.stream = None;
        self.source = None;
        self.slot = None;
        self.state = SessionState::Closed;
    }
}

impl<S> Drop for CaptureSession<S> {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            debug!("capture session dropped in {:?}", self.state);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::fs::File;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::capture::portal::PortalResponse;

    #[derive(Clone)]
    pub(crate) enum Reply {
        Respond(PortalResponse),
        Never,
    }

    /// Scripted portal. Steps without a script succeed with a plausible answer.
    #[derive(Clone, Default)]
    pub(crate) struct FakeService {
        pub script: HashMap<Step, Reply>,
        pub calls: Arc<std::sync::Mutex<Vec<Step>>>,
        pub closes: Arc<AtomicUsize>,
    }

    impl FakeService {
        pub fn with(mut self, step: Step, reply: Reply) -> Self {
            self.script.insert(step, reply);
            self
        }

        fn default_reply(step: Step) -> PortalResponse {
            let mut results = Results::new();
            match step {
                Step::CreateSession => {
                    results.insert(
                        "session_handle".into(),
                        PortalValue::Str("/org/freedesktop/portal/desktop/session/1_1/t".into()),
                    );
                }
                Step::Start => return start_reply(57, (1920, 1080)),
                _ => {}
            }
            PortalResponse::success(results)
        }
    }

    /// A successful Start response announcing one stream of `size` logical pixels.
    pub(crate) fn start_reply(node_id: u32, size: (i32, i32)) -> PortalResponse {
        let mut props = Results::new();
        props.insert(
            "size".into(),
            PortalValue::List(vec![PortalValue::I32(size.0), PortalValue::I32(size.1)]),
        );
        let mut results = Results::new();
        results.insert(
            "streams".into(),
            PortalValue::List(vec![PortalValue::List(vec![
                PortalValue::U32(node_id),
                PortalValue::Map(props),
            ])]),
        );
        PortalResponse::success(results)
    }

    impl CaptureService for FakeService {
        async fn request(
            &mut self,
            step: Step,
            _context: &SessionContext,
            _options: Options,
        ) -> Result<PortalResponse> {
            self.calls.lock().unwrap().push(step);
            match self.script.get(&step).cloned() {
                Some(Reply::Respond(response)) => Ok(response),
                Some(Reply::Never) => std::future::pending().await,
                None => Ok(Self::default_reply(step)),
            }
        }

        async fn open_remote(&mut self, _context: &SessionContext) -> Result<OwnedFd> {
            self.calls.lock().unwrap().push(Step::OpenRemote);
            match self.script.get(&Step::OpenRemote) {
                Some(Reply::Never) => std::future::pending().await,
                _ => Ok(File::open("/dev/null").unwrap().into()),
            }
        }

        async fn close_session(&mut self, _session_handle: &str) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn fast_options() -> SessionOptions {
        SessionOptions {
            step_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(300),
            frame_timeout: Duration::from_secs(5),
        }
    }

    fn session(service: FakeService, slot: &SessionSlot) -> (CaptureSession<FakeService>, CancelHandle) {
        let (handle, token) = cancel_pair();
        let guard = slot.acquire().unwrap();
        (CaptureSession::new(service, guard, fast_options(), token), handle)
    }

    #[tokio::test]
    async fn handshake_reaches_ready_in_order() {
        let service = FakeService::default();
        let calls = service.calls.clone();
        let slot = SessionSlot::default();
        let (mut session, _cancel) = session(service, &slot);

        session.negotiate().await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.is_negotiated());
        assert_eq!(
            *calls.lock().unwrap(),
            vec![Step::CreateSession, Step::SelectSources, Step::Start, Step::OpenRemote]
        );
        match session.source() {
            Some(CaptureSource::PipeWire(stream)) => {
                assert_eq!(stream.node_id, 57);
                assert_eq!(stream.size, Some((1920, 1080)));
                assert_eq!(stream.position, None);
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_source_selection_closes_session() {
        let service = FakeService::default().with(
            Step::SelectSources,
            Reply::Respond(PortalResponse {
                status: 2,
                results: Results::new(),
            }),
        );
        let calls = service.calls.clone();
        let closes = service.closes.clone();
        let slot = SessionSlot::default();
        let (mut session, _cancel) = session(service, &slot);

        let err = session.negotiate().await.unwrap_err();

        assert!(matches!(
            err,
            CaptureError::Rejected {
                step: Step::SelectSources,
                status: 2
            }
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!calls.lock().unwrap().contains(&Step::Start));
        assert!(!slot.is_active());
    }

    #[tokio::test]
    async fn missing_session_handle_is_a_negotiation_failure() {
        let service = FakeService::default().with(
            Step::CreateSession,
            Reply::Respond(PortalResponse::success(Results::new())),
        );
        let slot = SessionSlot::default();
        let (mut session, _cancel) = session(service, &slot);

        let err = session.negotiate().await.unwrap_err();
        assert!(matches!(
            err,
            CaptureError::MissingField {
                field: "session_handle",
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn start_without_streams_is_a_negotiation_failure() {
        let service = FakeService::default().with(
            Step::Start,
            Reply::Respond(PortalResponse::success(Results::new())),
        );
        let slot = SessionSlot::default();
        let (mut session, _cancel) = session(service, &slot);

        let err = session.negotiate().await.unwrap_err();
        assert!(matches!(err, CaptureError::MissingField { field: "streams", .. }));
    }

    #[tokio::test]
    async fn unanswered_step_times_out() {
        let service = FakeService::default().with(Step::Start, Reply::Never);
        let slot = SessionSlot::default();
        let (handle, token) = cancel_pair();
        let mut options = fast_options();
        options.step_timeout = Duration::from_millis(100);
        let mut session = CaptureSession::new(service, slot.acquire().unwrap(), options, token);

        let err = session.negotiate().await.unwrap_err();
        assert!(matches!(err, CaptureError::Timeout { .. }));
        assert_eq!(session.state(), SessionState::Closed);
        drop(handle);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let service = FakeService::default();
        let closes = service.closes.clone();
        let slot = SessionSlot::default();
        let (mut session, _cancel) = session(service, &slot);
        session.negotiate().await.unwrap();

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(session.context().remote.is_none());
    }

    #[tokio::test]
    async fn cancel_mid_negotiation_frees_the_slot() {
        let service = FakeService::default().with(Step::SelectSources, Reply::Never);
        let slot = SessionSlot::default();
        let (mut session, cancel) = session(service, &slot);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = session.negotiate().await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, CaptureError::Cancelled));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!slot.is_active());

        let (mut next, _cancel) = self::session(FakeService::default(), &slot);
        next.negotiate().await.unwrap();
        assert_eq!(next.state(), SessionState::Ready);
    }

    #[test]
    fn slot_admits_one_session() {
        let slot = SessionSlot::default();
        let guard = slot.acquire().unwrap();
        assert!(matches!(slot.acquire(), Err(CaptureError::Busy)));
        drop(guard);
        assert!(slot.acquire().is_ok());
    }

    #[tokio::test]
    async fn recording_requires_ready_and_returns_to_ready() {
        let slot = SessionSlot::default();
        let (_handle, token) = cancel_pair();
        let mut session: CaptureSession<FakeService> = CaptureSession::direct(
            DisplayServer::Wayland,
            slot.acquire().unwrap(),
            fast_options(),
            token,
        );

        let tool = ToolCommand::new("sh").args(["-c", "trap 'exit 0' INT; while :; do sleep 0.05; done"]);
        session
            .start_recording(tool, PathBuf::from("/tmp/rec.webm"))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Capturing);

        let second = ToolCommand::new("true");
        assert!(matches!(
            session.start_recording(second, PathBuf::from("/tmp/rec2.webm")).await,
            Err(CaptureError::InvalidState(SessionState::Capturing))
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let outcome = session.stop_recording().await.unwrap();
        assert!(!outcome.forced);
        assert_eq!(session.state(), SessionState::Ready);

        session.close().await;
        assert!(!slot.is_active());
    }
}
