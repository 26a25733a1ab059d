use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::capture::error::{CaptureError, Result};

pub const SCREENSHOT_PREFIX: &str = "screenshot";
pub const RECORDING_PREFIX: &str = "recording";
pub const SCREENSHOT_EXTENSION: &str = "png";
pub const RECORDING_EXTENSION: &str = "webm";

/// Creates `dir` if needed and returns a fresh `<prefix>_<timestamp>.<ext>` path in it.
pub fn build_output_path(dir: &Path, prefix: &str, extension: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .map_err(|err| CaptureError::io(format!("cannot create {}", dir.display()), err))?;

    let stem = file_stem(prefix, Local::now());
    let mut path = dir.join(format!("{stem}.{extension}"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{stem}-{n}.{extension}"));
        n += 1;
    }

    Ok(path)
}

fn file_stem(prefix: &str, when: DateTime<Local>) -> String {
    format!("{prefix}_{}", when.format("%Y-%m-%d_%H-%M-%S"))
}
