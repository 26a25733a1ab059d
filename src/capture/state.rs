//! Marker for a recording started from the command line, so that a second
//! invocation (`record stop`) can find and signal it.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::Value;

const CLI_RECORDING_STATE_FILE: &str = "recording.json";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CliRecordingState {
    pub pid: u32,
    pub output_path: PathBuf,
}

pub(crate) fn write_cli_recording_state(state_dir: &Path, state: &CliRecordingState) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("cannot create state directory {}", state_dir.display()))?;

    let file_path = state_dir.join(CLI_RECORDING_STATE_FILE);
    let data = serde_json::json!({
        "pid": state.pid,
        "output_path": state.output_path,
    });

    fs::write(&file_path, data.to_string())
        .with_context(|| format!("cannot write state file {}", file_path.display()))?;

    Ok(())
}

pub(crate) fn read_cli_recording_state(state_dir: &Path) -> Result<CliRecordingState> {
    let file_path = state_dir.join(CLI_RECORDING_STATE_FILE);
    let data = fs::read_to_string(&file_path)
        .with_context(|| format!("no recording in progress ({} missing)", file_path.display()))?;

    let value: Value = serde_json::from_str(&data).context("recording state file is corrupt")?;
    let pid = value
        .get("pid")
        .and_then(Value::as_u64)
        .context("recording state has no pid")? as u32;

    let output_path = value
        .get("output_path")
        .and_then(Value::as_str)
        .context("recording state has no output_path")?;

    Ok(CliRecordingState {
        pid,
        output_path: PathBuf::from(output_path),
    })
}

pub(crate) fn clear_cli_recording_state(state_dir: &Path) {
    let _ = fs::remove_file(state_dir.join(CLI_RECORDING_STATE_FILE));
}

pub(crate) fn cli_state_dir() -> Result<PathBuf> {
    if let Some(state_dir) = dirs::state_dir() {
        return Ok(state_dir.join("simpleshot"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        return Ok(home_dir.join(".local").join("state").join("simpleshot"));
    }

    bail!("cannot locate a state directory")
}
