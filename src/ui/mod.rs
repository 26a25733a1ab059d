mod recording_hud;
mod selection;
mod selection_overlay;
mod settings_window;

use adw::prelude::*;
use gtk::{gdk, gio};

use crate::capture::MonitorInfo;

pub use recording_hud::{RecordingHud, show_recording_hud};
pub use selection_overlay::{OverlayAction, show_selection_overlay};
pub use settings_window::build_settings_window;

/// Every monitor of the default display, paired with its logical geometry.
pub fn display_monitors() -> Vec<(gdk::Monitor, MonitorInfo)> {
    let Some(display) = gdk::Display::default() else {
        return Vec::new();
    };

    let model = display.monitors();
    (0..model.n_items())
        .filter_map(|i| model.item(i).and_downcast::<gdk::Monitor>())
        .map(|monitor| {
            let geometry = monitor.geometry();
            let info = MonitorInfo::new(
                monitor.connector().map(|c| c.to_string()).unwrap_or_default(),
                geometry.x(),
                geometry.y(),
                geometry.width().max(0) as u32,
                geometry.height().max(0) as u32,
                monitor.scale_factor(),
            );
            (monitor, info)
        })
        .collect()
}

pub fn gdk_monitors() -> Vec<MonitorInfo> {
    display_monitors().into_iter().map(|(_, info)| info).collect()
}

pub fn send_notification(app: &adw::Application, body: &str) {
    let notification = gio::Notification::new("SimpleShot");
    notification.set_body(Some(body));
    app.send_notification(None, &notification);
}
