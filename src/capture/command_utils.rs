use std::ffi::OsStr;
use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, bail};
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::capture::error::{CaptureError, Result};

/// A prepared invocation of an external capture tool.
pub struct ToolCommand {
    pub tool: &'static str,
    pub command: Command,
    /// Descriptor the child inherits; closed in this process once spawned.
    pub inherited_fd: Option<OwnedFd>,
}

impl ToolCommand {
    pub fn new(tool: &'static str) -> Self {
        Self {
            tool,
            command: Command::new(tool),
            inherited_fd: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn describe(&self) -> String {
        let std = self.command.as_std();
        let args: Vec<_> = std.get_args().map(|a| a.to_string_lossy()).collect();
        format!("{} {}", std.get_program().to_string_lossy(), args.join(" "))
    }
}

pub(crate) fn spawn_error(tool: &str, err: io::Error) -> CaptureError {
    if err.kind() == io::ErrorKind::NotFound {
        CaptureError::Unavailable(tool.to_string())
    } else {
        CaptureError::io(format!("cannot start {tool}"), err)
    }
}

/// Runs a one-shot tool to completion, bounded by `limit`.
pub(crate) async fn run_tool(mut tool: ToolCommand, limit: Duration) -> Result<()> {
    debug!("running {}", tool.describe());
    tool.command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = tool
        .command
        .spawn()
        .map_err(|err| spawn_error(tool.tool, err))?;
    drop(tool.inherited_fd.take());

    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(output) => output.map_err(|err| CaptureError::io(format!("waiting for {}", tool.tool), err))?,
        Err(_) => {
            return Err(CaptureError::Timeout {
                what: tool.tool.to_string(),
                after: limit,
            });
        }
    };

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let message = if stderr.is_empty() {
        format!("exit status {}", output.status)
    } else {
        stderr.to_string()
    };

    Err(CaptureError::Subprocess {
        tool: tool.tool.to_string(),
        message,
    })
}

pub fn command_exists(program: &str) -> bool {
    std::process::Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

pub fn gst_plugin_exists(plugin: &str) -> bool {
    std::process::Command::new("gst-inspect-1.0")
        .arg(plugin)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Region picker used by the command line front end. Prints `X,Y WxH`.
pub(crate) async fn pick_region_geometry() -> anyhow::Result<String> {
    let output = Command::new("slurp")
        .output()
        .await
        .context("cannot start slurp, is it installed?")?;

    if !output.status.success() {
        bail!("region selection was cancelled");
    }

    let geometry = String::from_utf8(output.stdout).context("slurp printed invalid text")?;
    let geometry = geometry.trim().to_string();

    if geometry.is_empty() {
        bail!("slurp returned no region");
    }

    Ok(geometry)
}

/// Copies a PNG file to the clipboard through wl-copy, or xclip on X11.
pub(crate) async fn copy_image_to_clipboard(path: &Path) -> anyhow::Result<()> {
    let image = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read screenshot {}", path.display()))?;

    let candidates: [(&str, &[&str]); 2] = [
        ("wl-copy", &["--type", "image/png"]),
        ("xclip", &["-selection", "clipboard", "-t", "image/png"]),
    ];

    for (program, args) in candidates {
        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err).with_context(|| format!("cannot start {program}")),
        };

        let mut stdin = child
            .stdin
            .take()
            .with_context(|| format!("cannot write to {program}"))?;
        stdin
            .write_all(&image)
            .await
            .context("writing clipboard data failed")?;
        drop(stdin);

        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for {program} failed"))?;
        if !status.success() {
            bail!("{program} exited with {status}");
        }
        return Ok(());
    }

    bail!("neither wl-copy nor xclip is installed")
}
