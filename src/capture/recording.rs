use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Child;

use crate::capture::command_utils::{ToolCommand, spawn_error};
use crate::capture::error::{CaptureError, Result};

/// A live recorder subprocess. Only the owning session may signal it; it runs
/// in its own process group so a terminal Ctrl-C does not reach it first.
pub struct RecordingProcess {
    child: Child,
    tool: &'static str,
    output_path: PathBuf,
}

#[derive(Debug)]
pub struct RecordingOutcome {
    pub output_path: PathBuf,
    /// The recorder ignored SIGINT and had to be killed.
    pub forced: bool,
    pub status: Option<ExitStatus>,
}

impl RecordingProcess {
    pub fn spawn(mut tool: ToolCommand, output_path: PathBuf) -> Result<Self> {
        tool.command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);

        let child = tool
            .command
            .spawn()
            .map_err(|err| spawn_error(tool.tool, err))?;
        drop(tool.inherited_fd.take());

        info!(
            "{} recording to {} (pid {:?})",
            tool.tool,
            output_path.display(),
            child.id()
        );

        Ok(Self {
            child,
            tool: tool.tool,
            output_path,
        })
    }

    pub fn tool(&self) -> &'static str {
        self.tool
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Resolves when the recorder exits on its own. Cancel safe.
    pub async fn exited(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .map_err(|err| CaptureError::io(format!("waiting for {}", self.tool), err))
    }

    /// Sends SIGINT so the recorder can finalise its container, waits up to
    /// `grace`, then kills it.
    pub async fn stop(mut self, grace: Duration) -> Result<RecordingOutcome> {
        let running = self
            .child
            .try_wait()
            .map_err(|err| CaptureError::io(format!("polling {}", self.tool), err))?
            .is_none();

        if running && let Some(pid) = self.child.id() {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGINT)
                && err != Errno::ESRCH
            {
                warn!("cannot interrupt {} ({pid}): {err}", self.tool);
            }
        }

        let (status, forced) = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status
                    .map_err(|err| CaptureError::io(format!("waiting for {}", self.tool), err))?;
                (Some(status), false)
            }
            Err(_) => {
                warn!(
                    "{} ignored SIGINT for {}ms, killing it",
                    self.tool,
                    grace.as_millis()
                );
                self.child
                    .kill()
                    .await
                    .map_err(|err| CaptureError::io(format!("killing {}", self.tool), err))?;
                (None, true)
            }
        };

        if let Some(status) = status
            && !status.success()
        {
            info!("{} exited with {status}", self.tool);
        }

        Ok(RecordingOutcome {
            output_path: self.output_path,
            forced,
            status,
        })
    }
}
