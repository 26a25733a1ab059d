//! Concrete ways to grab one frame or record a stream, and the probe that
//! orders them for the running desktop.
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};

use crate::capture::command_utils::{ToolCommand, command_exists, gst_plugin_exists, run_tool};
use crate::capture::error::{CaptureError, Result};
use crate::capture::frame::{CapturedFrame, FrameCapture};
use crate::capture::geometry::{MonitorInfo, SelectionRect, map_to_physical_crop};
use crate::capture::portal::{self, CaptureService};
use crate::capture::session::{CaptureSession, CaptureSource, SessionContext, StreamInfo};

const GST_LAUNCH: &str = "gst-launch-1.0";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayServer {
    Wayland,
    X11,
}

impl DisplayServer {
    pub fn detect() -> Option<Self> {
        Self::from_env(|key| std::env::var(key).ok())
    }

    fn from_env(var: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let set = |key: &str| var(key).is_some_and(|value| !value.is_empty());

        match var("XDG_SESSION_TYPE").as_deref() {
            Some("wayland") => return Some(DisplayServer::Wayland),
            Some("x11") => return Some(DisplayServer::X11),
            _ => {}
        }

        if set("WAYLAND_DISPLAY") {
            Some(DisplayServer::Wayland)
        } else if set("DISPLAY") {
            Some(DisplayServer::X11)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameMechanism {
    /// One buffer from the negotiated PipeWire stream.
    PipeWire,
    ScreenshotPortal,
    Grim,
    Import,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordMechanism {
    PipeWire,
    WfRecorder,
    FfmpegX11,
}

impl FrameMechanism {
    pub fn needs_negotiation(self) -> bool {
        matches!(self, FrameMechanism::PipeWire)
    }
}

impl RecordMechanism {
    pub fn needs_negotiation(self) -> bool {
        matches!(self, RecordMechanism::PipeWire)
    }
}

/// Mechanisms in the order they should be tried on this machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toolchain {
    pub display: Option<DisplayServer>,
    pub frames: Vec<FrameMechanism>,
    pub recorders: Vec<RecordMechanism>,
}

impl Toolchain {
    pub fn probe() -> Self {
        let display = DisplayServer::detect();
        let toolchain = Self::ordered(display, |program| match program {
            GST_LAUNCH => command_exists(GST_LAUNCH) && gst_plugin_exists("pipewiresrc"),
            other => command_exists(other),
        });
        info!(
            "display {:?}, frame mechanisms {:?}, recorders {:?}",
            toolchain.display, toolchain.frames, toolchain.recorders
        );
        toolchain
    }

    pub fn ordered(display: Option<DisplayServer>, present: impl Fn(&str) -> bool) -> Self {
        let gst = present(GST_LAUNCH);
        let mut frames = Vec::new();
        let mut recorders = Vec::new();

        match display {
            Some(DisplayServer::Wayland) => {
                if gst {
                    frames.push(FrameMechanism::PipeWire);
                    recorders.push(RecordMechanism::PipeWire);
                }
                frames.push(FrameMechanism::ScreenshotPortal);
                if present("grim") {
                    frames.push(FrameMechanism::Grim);
                }
                if present("wf-recorder") {
                    recorders.push(RecordMechanism::WfRecorder);
                }
            }
            Some(DisplayServer::X11) => {
                if present("import") {
                    frames.push(FrameMechanism::Import);
                }
                if present("ffmpeg") {
                    recorders.push(RecordMechanism::FfmpegX11);
                }
                if gst {
                    frames.push(FrameMechanism::PipeWire);
                    recorders.push(RecordMechanism::PipeWire);
                }
                frames.push(FrameMechanism::ScreenshotPortal);
            }
            None => {
                if gst {
                    frames.push(FrameMechanism::PipeWire);
                    recorders.push(RecordMechanism::PipeWire);
                }
                frames.push(FrameMechanism::ScreenshotPortal);
            }
        }

        Self {
            display,
            frames,
            recorders,
        }
    }
}

fn scratch_path(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!(
        "simpleshot-{label}-{}-{nanos}.png",
        std::process::id()
    ))
}

/// Hands the PipeWire remote to a child process. The duplicate is not
/// close-on-exec, so the child inherits it under the same number.
fn inheritable_remote(context: &SessionContext) -> Result<std::os::fd::OwnedFd> {
    let remote = context
        .remote
        .as_ref()
        .ok_or_else(|| CaptureError::Unavailable("PipeWire remote".to_string()))?;
    let duplicate = remote
        .try_clone()
        .map_err(|err| CaptureError::io("duplicating PipeWire remote", err))?;
    fcntl(&duplicate, FcntlArg::F_SETFD(FdFlag::empty())).map_err(|errno| {
        CaptureError::io("clearing close-on-exec", std::io::Error::from(errno))
    })?;
    Ok(duplicate)
}

fn pipewire_source(
    tool: ToolCommand,
    context: &SessionContext,
    stream: &StreamInfo,
) -> Result<ToolCommand> {
    use std::os::fd::AsRawFd;

    let remote = inheritable_remote(context)?;
    let mut tool = tool.args([
        "pipewiresrc".to_string(),
        format!("fd={}", remote.as_raw_fd()),
        format!("path={}", stream.node_id),
    ]);
    tool.inherited_fd = Some(remote);
    Ok(tool)
}

/// Where the stream's top-left corner sits in logical desktop coordinates.
fn stream_origin(stream: &StreamInfo, monitor: &MonitorInfo) -> (i32, i32) {
    stream.position.unwrap_or((monitor.x, monitor.y))
}

/// Buffer size of the stream in physical pixels. The portal reports `size` in
/// logical pixels.
fn stream_frame_size(stream: &StreamInfo, monitor: &MonitorInfo) -> (u32, u32) {
    let (width, height) = stream.size.unwrap_or((monitor.width, monitor.height));
    (width * monitor.scale, height * monitor.scale)
}

/// Tries `mechanisms` in order and returns the first frame. Mechanisms that
/// need a negotiated stream are skipped when there is none; `Unavailable`
/// moves on to the next one, any other failure ends the search.
pub async fn first_available_frame<F, Fut>(
    mechanisms: &[FrameMechanism],
    negotiated: bool,
    mut pull: F,
) -> Result<FrameCapture>
where
    F: FnMut(FrameMechanism) -> Fut,
    Fut: Future<Output = Result<FrameCapture>>,
{
    let mut last = None;

    for &mechanism in mechanisms {
        if mechanism.needs_negotiation() && !negotiated {
            continue;
        }
        match pull(mechanism).await {
            Ok(capture) => return Ok(capture),
            Err(err) if err.is_unavailable() => {
                info!("{mechanism:?} unavailable: {err}");
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last.unwrap_or_else(|| CaptureError::Unavailable("a screenshot tool".to_string())))
}

pub async fn pull_frame<S: CaptureService>(
    mechanism: FrameMechanism,
    session: &CaptureSession<S>,
    monitor: &MonitorInfo,
    desktop_origin: (i32, i32),
) -> Result<FrameCapture> {
    let limit = session.options().frame_timeout;
    let scratch = scratch_path("frame");

    let (path, origin) = match mechanism {
        FrameMechanism::PipeWire => {
            let Some(CaptureSource::PipeWire(stream)) = session.source() else {
                return Err(CaptureError::Unavailable("negotiated PipeWire stream".to_string()));
            };
            let tool = pipewire_source(ToolCommand::new(GST_LAUNCH).arg("-q"), session.context(), stream)?
                .args(["num-buffers=1", "!", "videoconvert", "!", "pngenc", "snapshot=true", "!", "filesink"])
                .arg(format!("location={}", scratch.display()));
            run_tool(tool, limit).await?;
            (scratch, stream_origin(stream, monitor))
        }
        FrameMechanism::ScreenshotPortal => {
            let path = tokio::time::timeout(limit, portal::request_screenshot())
                .await
                .map_err(|_| CaptureError::Timeout {
                    what: "Screenshot portal".to_string(),
                    after: limit,
                })??;
            (path, desktop_origin)
        }
        FrameMechanism::Grim => {
            let mut tool = ToolCommand::new("grim");
            let origin = if monitor.id.is_empty() {
                desktop_origin
            } else {
                tool = tool.args(["-o", monitor.id.as_str()]);
                (monitor.x, monitor.y)
            };
            run_tool(tool.arg(&scratch), limit).await?;
            (scratch, origin)
        }
        FrameMechanism::Import => {
            let tool = ToolCommand::new("import").args(["-window", "root"]).arg(&scratch);
            run_tool(tool, limit).await?;
            (scratch, (0, 0))
        }
    };

    let frame = CapturedFrame::load(&path);
    if let Err(err) = fs::remove_file(&path) {
        debug!("leaving temporary frame {}: {err}", path.display());
    }
    let frame = frame.map_err(|err| {
        warn!("{mechanism:?} produced an unreadable frame: {err}");
        CaptureError::NoOutput(path.clone())
    })?;

    debug!("{mechanism:?} captured {}x{} at origin {origin:?}", frame.width, frame.height);
    Ok(FrameCapture {
        frame,
        origin_x: origin.0,
        origin_y: origin.1,
    })
}

pub fn recorder_command<S: CaptureService>(
    mechanism: RecordMechanism,
    session: &CaptureSession<S>,
    selection: &SelectionRect,
    monitor: &MonitorInfo,
    output: &Path,
) -> Result<ToolCommand> {
    let global = selection.to_global(monitor);

    match mechanism {
        RecordMechanism::PipeWire => {
            let Some(CaptureSource::PipeWire(stream)) = session.source() else {
                return Err(CaptureError::Unavailable("negotiated PipeWire stream".to_string()));
            };
            let (frame_w, frame_h) = stream_frame_size(stream, monitor);
            let (origin_x, origin_y) = stream_origin(stream, monitor);
            let crop = map_to_physical_crop(selection, monitor, origin_x, origin_y, frame_w, frame_h);
            if crop.is_empty() {
                return Err(CaptureError::EmptyCrop);
            }

            let tool = pipewire_source(ToolCommand::new(GST_LAUNCH).args(["-e", "-q"]), session.context(), stream)?;
            Ok(tool
                .args(["do-timestamp=true", "!", "videoconvert", "!", "videocrop"])
                .arg(format!("left={}", crop.x))
                .arg(format!("top={}", crop.y))
                .arg(format!("right={}", frame_w - crop.x - crop.width))
                .arg(format!("bottom={}", frame_h - crop.y - crop.height))
                .args(["!", "vp8enc", "deadline=1", "!", "webmmux", "!", "filesink"])
                .arg(format!("location={}", output.display())))
        }
        RecordMechanism::WfRecorder => Ok(ToolCommand::new("wf-recorder")
            .arg("-g")
            .arg(global.geometry_string())
            .args(["-c", "libvpx", "-m", "webm", "-f"])
            .arg(output)),
        RecordMechanism::FfmpegX11 => {
            let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string());
            Ok(ToolCommand::new("ffmpeg")
                .args(["-y", "-loglevel", "error", "-f", "x11grab"])
                .arg("-video_size")
                .arg(format!("{}x{}", global.w, global.h))
                .arg("-i")
                .arg(format!("{display}+{},{}", global.x, global.y))
                .args(["-codec:v", "libvpx"])
                .arg(output))
        }
    }
}
