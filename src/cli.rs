use std::env;
use std::path::PathBuf;
use std::pin::pin;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::runtime::Handle;

use crate::capture::{
    CaptureController, CaptureError, CaptureRequest, CaptureTarget, CliRecordingState, Event,
    MonitorInfo, SelectionRect, SessionSlot, SystemDriver, clear_cli_recording_state,
    cli_state_dir, copy_image_to_clipboard, focused_output_name, list_monitors,
    desktop_origin, pick_region_geometry, read_cli_recording_state, write_cli_recording_state,
};
use crate::config::Config;

const STOP_WAIT: Duration = Duration::from_secs(10);

pub fn handle_cli_if_requested() -> Result<(), i32> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        return Ok(());
    }

    let result = match parse_cli_command(&args) {
        Ok(command) => run_cli_command(command),
        Err(message) => {
            eprintln!("{message}\n\n{}", cli_usage());
            Err(2)
        }
    };

    match result {
        Ok(()) => Err(0),
        Err(code) => Err(code),
    }
}

fn run_cli_command(command: CliCommand) -> Result<(), i32> {
    match command {
        CliCommand::Screenshot { target, copy } => {
            match block_on(take_screenshot(target, copy)) {
                Ok(path) => {
                    println!("Screenshot saved: {}", path.display());
                    Ok(())
                }
                Err(err) => {
                    eprintln!("Screenshot failed: {err:#}");
                    Err(1)
                }
            }
        }
        CliCommand::RecordStart { target } => match block_on(record(target)) {
            Ok(path) => {
                println!("Recording saved: {}", path.display());
                Ok(())
            }
            Err(err) => {
                eprintln!("Recording failed: {err:#}");
                Err(1)
            }
        },
        CliCommand::RecordStop => match stop_detached_recording() {
            Ok(path) => {
                println!("Recording stopped, saved as {}", path.display());
                Ok(())
            }
            Err(err) => {
                eprintln!("Cannot stop recording: {err:#}");
                Err(1)
            }
        },
        CliCommand::Help => {
            println!("{}", cli_usage());
            Ok(())
        }
    }
}

fn block_on<T>(task: impl Future<Output = Result<T>>) -> Result<T> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")?;
    runtime.block_on(task)
}

fn available_monitors() -> Result<Vec<MonitorInfo>> {
    match list_monitors() {
        Ok(monitors) => Ok(monitors),
        Err(err) => {
            debug!("niri outputs unavailable ({err:#}), asking GDK");
            gtk::init().context("cannot connect to the display")?;
            let monitors = crate::ui::gdk_monitors();
            if monitors.is_empty() {
                bail!("no monitors found");
            }
            Ok(monitors)
        }
    }
}

async fn resolve_request(target: CaptureTarget, output_dir: PathBuf) -> Result<CaptureRequest> {
    let monitors = available_monitors()?;
    let primary = monitors.first().context("no monitors found")?;

    let (monitor, selection) = match target {
        CaptureTarget::Fullscreen => {
            let focused = focused_output_name().ok();
            let monitor = monitors
                .iter()
                .find(|m| focused.as_deref() == Some(m.id.as_str()))
                .unwrap_or(primary)
                .clone();
            let selection = monitor.full_selection();
            (monitor, selection)
        }
        CaptureTarget::Region => {
            let geometry = pick_region_geometry().await?;
            let global = SelectionRect::parse_geometry(&geometry)
                .with_context(|| format!("unexpected region {geometry:?}"))?;
            let monitor = monitors
                .iter()
                .find(|m| m.contains(global.x, global.y))
                .unwrap_or(primary)
                .clone();
            let selection = SelectionRect {
                x: global.x - monitor.x,
                y: global.y - monitor.y,
                ..global
            };
            (monitor, selection)
        }
    };

    if !selection.is_actionable() {
        return Err(CaptureError::EmptySelection.into());
    }
    debug!("{} capture of {selection:?} on {}", target.slug(), monitor.id);

    Ok(CaptureRequest {
        selection,
        monitor,
        desktop_origin: desktop_origin(&monitors),
        output_dir,
    })
}

fn spawn_controller() -> (CaptureController, tokio::sync::mpsc::UnboundedReceiver<Event>) {
    CaptureController::spawn(SystemDriver::probe(), SessionSlot::default(), &Handle::current())
}

async fn take_screenshot(target: CaptureTarget, copy: bool) -> Result<PathBuf> {
    let config = Config::load();
    let request = resolve_request(target, config.screenshot_dir).await?;
    let (controller, mut events) = spawn_controller();
    controller.screenshot(request);

    let mut saved = None;
    let mut failure = None;
    while let Some(event) = events.recv().await {
        match event {
            Event::ScreenshotSaved { path } => saved = Some(path),
            Event::Failed { error, .. } => failure = Some(error),
            Event::Ended { .. } => break,
            other => debug!("{other:?}"),
        }
    }

    if let Some(err) = failure {
        return Err(err.into());
    }
    let path = saved.context("screenshot was cancelled")?;

    if copy {
        copy_image_to_clipboard(&path).await?;
        info!("copied {} to the clipboard", path.display());
    }
    Ok(path)
}

fn process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Records in the foreground until Ctrl-C or `record stop`.
async fn record(target: CaptureTarget) -> Result<PathBuf> {
    let state_dir = cli_state_dir()?;
    if let Ok(existing) = read_cli_recording_state(&state_dir)
        && process_alive(existing.pid)
    {
        bail!("a recording is already running (pid {})", existing.pid);
    }

    let config = Config::load();
    let request = resolve_request(target, config.recording_dir).await?;
    let (controller, mut events) = spawn_controller();
    controller.start_recording(request);

    let mut interrupt = pin!(tokio::signal::ctrl_c());
    let mut interrupted = false;
    let mut saved = None;
    let mut failure = None;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::RecordingStarted { output_path }) => {
                    let state = CliRecordingState {
                        pid: std::process::id(),
                        output_path: output_path.clone(),
                    };
                    if let Err(err) = write_cli_recording_state(&state_dir, &state) {
                        warn!("`record stop` will not find this recording: {err:#}");
                    }
                    println!(
                        "Recording to {}\nPress Ctrl-C or run `simpleshot record stop` to finish.",
                        output_path.display()
                    );
                }
                Some(Event::RecordingSaved { path, forced }) => {
                    if forced {
                        warn!("recorder had to be killed, {} may be truncated", path.display());
                    }
                    saved = Some(path);
                }
                Some(Event::Failed { error, .. }) => failure = Some(error),
                Some(Event::Ended { .. }) | None => break,
                Some(other) => debug!("{other:?}"),
            },
            signal = &mut interrupt, if !interrupted => {
                interrupted = true;
                signal.context("cannot listen for Ctrl-C")?;
                info!("stopping recording");
                controller.stop_recording();
            }
        }
    }

    clear_cli_recording_state(&state_dir);

    if let Some(err) = failure {
        return Err(err.into());
    }
    saved.context("recording was cancelled before it started")
}

fn stop_detached_recording() -> Result<PathBuf> {
    let state_dir = cli_state_dir()?;
    let state = read_cli_recording_state(&state_dir)?;
    let pid = Pid::from_raw(state.pid as i32);

    match kill(pid, Signal::SIGINT) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            clear_cli_recording_state(&state_dir);
            bail!("recording process {} is no longer running", state.pid);
        }
        Err(err) => {
            return Err(err).with_context(|| format!("cannot signal recording process {}", state.pid));
        }
    }

    let deadline = Instant::now() + STOP_WAIT;
    while process_alive(state.pid) {
        if Instant::now() >= deadline {
            bail!("recording process {} did not exit", state.pid);
        }
        thread::sleep(Duration::from_millis(100));
    }

    Ok(state.output_path)
}

fn parse_cli_command(args: &[String]) -> Result<CliCommand, String> {
    if args[0] == "help" || args[0] == "--help" || args[0] == "-h" {
        return Ok(CliCommand::Help);
    }

    if args[0] == "screenshot" {
        if args.len() < 2 || args.len() > 3 {
            return Err("usage: screenshot region|fullscreen [--copy]".to_string());
        }

        let target = parse_target(&args[1])?;
        let copy = match args.get(2).map(String::as_str) {
            None => false,
            Some("--copy") => true,
            Some(other) => return Err(format!("unknown screenshot option: {other}")),
        };
        return Ok(CliCommand::Screenshot { target, copy });
    }

    if args[0] == "record" {
        if args.len() >= 2 && args[1] == "start" {
            if args.len() != 3 {
                return Err("usage: record start region|fullscreen".to_string());
            }

            let target = parse_target(&args[2])?;
            return Ok(CliCommand::RecordStart { target });
        }

        if args.len() == 2 && args[1] == "stop" {
            return Ok(CliCommand::RecordStop);
        }

        return Err("usage: record start region|fullscreen, or record stop".to_string());
    }

    Err(format!("unknown command: {}", args[0]))
}

fn parse_target(input: &str) -> Result<CaptureTarget, String> {
    match input {
        "region" => Ok(CaptureTarget::Region),
        "fullscreen" => Ok(CaptureTarget::Fullscreen),
        _ => Err(format!("unsupported target: {input}")),
    }
}

fn cli_usage() -> &'static str {
    "SimpleShot

Usage:
  simpleshot                              open the settings window
  simpleshot screenshot region [--copy]
  simpleshot screenshot fullscreen [--copy]
  simpleshot record start region
  simpleshot record start fullscreen
  simpleshot record stop
  simpleshot help

Region selection uses slurp. `record start` stays in the foreground until
Ctrl-C or `simpleshot record stop`.

Example niri bindings:
  Mod+Shift+S    { spawn \"simpleshot\" \"screenshot\" \"region\" \"--copy\"; }
  Mod+Shift+F    { spawn \"simpleshot\" \"screenshot\" \"fullscreen\"; }
  Mod+Shift+R    { spawn \"simpleshot\" \"record\" \"start\" \"region\"; }
  Mod+Shift+E    { spawn \"simpleshot\" \"record\" \"stop\"; }"
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Screenshot { target: CaptureTarget, copy: bool },
    RecordStart { target: CaptureTarget },
    RecordStop,
    Help,
}
