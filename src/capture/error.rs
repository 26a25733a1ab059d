use std::path::PathBuf;
use std::time::Duration;

use crate::capture::session::Step;

/// Failures of the capture core. Each variant maps onto one recovery path in
/// the controller; none of them terminate the application.
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("{step} failed with portal status {status}")]
    Rejected { step: Step, status: u32 },

    #[error("{step} response is missing `{field}`")]
    MissingField { step: Step, field: &'static str },

    #[error("{0} is not available on this system")]
    Unavailable(String),

    #[error("{what} timed out after {}s", .after.as_secs())]
    Timeout { what: String, after: Duration },

    #[error("capture was cancelled")]
    Cancelled,

    #[error("another capture session is already active")]
    Busy,

    #[error("selection is too small to capture")]
    EmptySelection,

    #[error("selection does not overlap the captured frame")]
    EmptyCrop,

    #[error("session is {0:?}, which does not allow this action")]
    InvalidState(crate::capture::session::SessionState),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed: {message}")]
    Subprocess { tool: String, message: String },

    #[error("capture produced no usable file at {}", .0.display())]
    NoOutput(PathBuf),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Dbus(#[from] zbus::Error),
}

impl CaptureError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CaptureError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the next mechanism in probe order should be tried.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CaptureError::Unavailable(_))
    }
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;
