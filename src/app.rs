use std::cell::{OnceCell, RefCell};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::Duration;

use adw::prelude::*;
use gtk::gdk_pixbuf::Pixbuf;
use gtk::{gdk, gio, glib};
use log::{error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::capture::{
    CaptureController, CaptureRequest, Event, MonitorInfo, Purpose, SelectionRect, SessionSlot,
    SystemDriver, desktop_origin,
};
use crate::config::Config;
use crate::ui::{
    OverlayAction, RecordingHud, build_settings_window, display_monitors, gdk_monitors,
    send_notification, show_recording_hud, show_selection_overlay,
};

const APP_ID: &str = "io.github.simpleshot";
/// Gives the compositor time to unmap the overlays before a frame is taken.
const OVERLAY_HIDE_DELAY: Duration = Duration::from_millis(200);

pub fn run() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("cannot start the async runtime: {err}");
            return;
        }
    };
    let handle = runtime.handle().clone();

    let app = adw::Application::builder()
        .application_id(APP_ID)
        .build();

    let shell: Rc<OnceCell<Rc<Shell>>> = Rc::default();
    app.connect_activate(move |app| {
        let shell = shell.get_or_init(|| Shell::new(app, &handle));
        shell.settings.present();
    });
    app.run();
}

/// Windows of the GUI and the capture controller they talk to.
struct Shell {
    app: adw::Application,
    config: Rc<RefCell<Config>>,
    controller: CaptureController,
    settings: adw::ApplicationWindow,
    overlays: RefCell<Vec<gtk::ApplicationWindow>>,
    hud: RefCell<Option<RecordingHud>>,
    hold: RefCell<Option<gio::ApplicationHoldGuard>>,
}

impl Shell {
    fn new(app: &adw::Application, runtime: &Handle) -> Rc<Self> {
        let (controller, events) =
            CaptureController::spawn(SystemDriver::probe(), SessionSlot::default(), runtime);
        let config = Rc::new(RefCell::new(Config::load()));

        let shell = Rc::new_cyclic(|weak: &Weak<Shell>| {
            let weak = weak.clone();
            let settings = build_settings_window(app, config.clone(), move || {
                if let Some(shell) = weak.upgrade() {
                    shell.start_capture();
                }
            });

            Shell {
                app: app.clone(),
                config,
                controller,
                settings,
                overlays: RefCell::default(),
                hud: RefCell::default(),
                hold: RefCell::default(),
            }
        });

        shell.listen(events);
        shell
    }

    fn listen(self: &Rc<Self>, mut events: UnboundedReceiver<Event>) {
        let weak = Rc::downgrade(self);
        glib::spawn_future_local(async move {
            while let Some(event) = events.recv().await {
                let Some(shell) = weak.upgrade() else {
                    break;
                };
                shell.handle_event(event);
            }
        });
    }

    fn start_capture(self: &Rc<Self>) {
        if self.controller.is_busy() || !self.overlays.borrow().is_empty() {
            return;
        }

        self.hold.replace(Some(self.app.hold()));
        self.settings.set_visible(false);

        let weak = Rc::downgrade(self);
        let on_action: Rc<dyn Fn(OverlayAction)> = Rc::new(move |action| {
            if let Some(shell) = weak.upgrade() {
                shell.on_overlay_action(action);
            }
        });

        let overlays: Vec<_> = display_monitors()
            .into_iter()
            .map(|(monitor, info)| {
                show_selection_overlay(&self.app, &monitor, info, on_action.clone())
            })
            .collect();

        if overlays.is_empty() {
            warn!("no monitors to capture");
            self.finish();
            return;
        }
        self.overlays.replace(overlays);
    }

    fn on_overlay_action(&self, action: OverlayAction) {
        match action {
            OverlayAction::Screenshot { monitor, selection } => {
                self.dispatch(Purpose::Screenshot, monitor, selection);
            }
            OverlayAction::Record { monitor, selection } => {
                self.dispatch(Purpose::Recording, monitor, selection);
            }
            OverlayAction::Dismiss => {
                if self.controller.is_busy() {
                    self.controller.cancel();
                } else {
                    self.finish();
                }
            }
        }
    }

    fn dispatch(&self, purpose: Purpose, monitor: MonitorInfo, selection: SelectionRect) {
        if !selection.is_actionable() {
            return;
        }

        let output_dir = {
            let config = self.config.borrow();
            match purpose {
                Purpose::Screenshot => config.screenshot_dir.clone(),
                Purpose::Recording => config.recording_dir.clone(),
            }
        };
        let request = CaptureRequest {
            selection,
            monitor,
            desktop_origin: desktop_origin(&gdk_monitors()),
            output_dir,
        };

        self.close_overlays();
        let controller = self.controller.clone();
        glib::timeout_add_local_once(OVERLAY_HIDE_DELAY, move || match purpose {
            Purpose::Screenshot => controller.screenshot(request),
            Purpose::Recording => controller.start_recording(request),
        });
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::RecordingStarted { output_path } => {
                let controller = self.controller.clone();
                let hud = show_recording_hud(&self.app, &output_path, move || {
                    controller.stop_recording();
                });
                if let Some(previous) = self.hud.replace(Some(hud)) {
                    previous.close();
                }
            }
            Event::ScreenshotSaved { path } => {
                self.copy_to_clipboard(&path);
                self.notify(&format!("Screenshot saved to {}", path.display()));
            }
            Event::RecordingSaved { path, forced } => {
                if forced {
                    warn!("recorder was killed, {} may be incomplete", path.display());
                }
                self.notify(&format!("Recording saved to {}", path.display()));
            }
            Event::Failed { purpose, error } => {
                let what = match purpose {
                    Purpose::Screenshot => "Screenshot",
                    Purpose::Recording => "Recording",
                };
                self.notify(&format!("{what} failed: {error}"));
            }
            Event::Ended { purpose } => {
                info!("{purpose:?} finished");
                self.finish();
            }
        }
    }

    /// Back to the settings window, whatever happened.
    fn finish(&self) {
        self.close_overlays();
        if let Some(hud) = self.hud.take() {
            hud.close();
        }
        self.settings.present();
        self.hold.take();
    }

    fn close_overlays(&self) {
        for window in self.overlays.take() {
            window.destroy();
        }
    }

    fn copy_to_clipboard(&self, path: &Path) {
        let Some(display) = gdk::Display::default() else {
            return;
        };

        match Pixbuf::from_file(path) {
            Ok(pixbuf) => {
                display
                    .clipboard()
                    .set_texture(&gdk::Texture::for_pixbuf(&pixbuf));
                info!("copied {} to the clipboard", path.display());
            }
            Err(err) => {
                error!("cannot load {} for the clipboard: {err}", path.display());
                self.notify(&format!("Could not copy the screenshot: {err}"));
            }
        }
    }

    fn notify(&self, body: &str) {
        send_notification(&self.app, body);
    }
}
