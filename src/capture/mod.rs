mod backend;
mod command_utils;
mod controller;
mod error;
mod frame;
mod geometry;
mod monitors;
mod output;
mod portal;
mod recording;
mod session;
mod state;

pub use controller::{
    CaptureController, CaptureDriver, CaptureRequest, Command, Event, Purpose, SystemDriver,
};
pub use error::{CaptureError, Result};
pub use geometry::{MonitorInfo, SelectionRect, desktop_origin};
pub use monitors::{focused_output_name, list_monitors};
pub use session::SessionSlot;

pub(crate) use command_utils::{copy_image_to_clipboard, pick_region_geometry};
pub(crate) use state::{
    CliRecordingState, clear_cli_recording_state, cli_state_dir, read_cli_recording_state,
    write_cli_recording_state,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureTarget {
    Region,
    Fullscreen,
}

impl CaptureTarget {
    pub(crate) fn slug(self) -> &'static str {
        match self {
            CaptureTarget::Region => "region",
            CaptureTarget::Fullscreen => "fullscreen",
        }
    }
}
