use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use adw::prelude::*;
use gtk::{Align, Box as GtkBox, Button, CssProvider, Label, Orientation};
use gtk4_layer_shell::{Edge, KeyboardMode, Layer, LayerShell};

/// Small always-on-top window shown while a recording is live.
pub struct RecordingHud {
    window: adw::ApplicationWindow,
    sources: Rc<RefCell<Vec<gtk::glib::SourceId>>>,
}

impl RecordingHud {
    pub fn close(self) {
        for source in self.sources.borrow_mut().drain(..) {
            source.remove();
        }
        self.window.destroy();
    }
}

pub fn show_recording_hud(
    app: &adw::Application,
    output_path: &Path,
    on_stop: impl Fn() + 'static,
) -> RecordingHud {
    apply_recording_hud_css();

    let hud = adw::ApplicationWindow::builder()
        .application(app)
        .title("Recording")
        .default_width(260)
        .default_height(50)
        .resizable(false)
        .build();
    hud.set_decorated(false);
    hud.set_size_request(260, 50);
    hud.add_css_class("recording-hud");

    if gtk4_layer_shell::is_supported() {
        hud.init_layer_shell();
        hud.set_layer(Layer::Overlay);
        hud.set_anchor(Edge::Top, true);
        hud.set_anchor(Edge::Right, true);
        hud.set_margin(Edge::Top, 12);
        hud.set_margin(Edge::Right, 12);
        hud.set_keyboard_mode(KeyboardMode::OnDemand);
        hud.set_namespace(Some("simpleshot-recording-hud"));
    }

    let row = GtkBox::new(Orientation::Horizontal, 10);
    row.set_margin_top(4);
    row.set_margin_bottom(4);
    row.set_margin_start(12);
    row.set_margin_end(12);
    row.set_halign(Align::Fill);

    let indicator = Label::new(Some("●"));
    indicator.add_css_class("recording-indicator");

    let timer_label = Label::new(Some("00:00:00"));
    timer_label.add_css_class("title-4");
    timer_label.set_hexpand(true);
    timer_label.set_halign(Align::Start);
    timer_label.set_tooltip_text(Some(&output_path.to_string_lossy()));

    let stop_button = Button::builder()
        .icon_name("media-playback-stop-symbolic")
        .tooltip_text("Stop Recording")
        .build();
    stop_button.add_css_class("stop-record-btn");

    row.append(&indicator);
    row.append(&timer_label);
    row.append(&stop_button);
    hud.set_content(Some(&row));

    let sources = Rc::new(RefCell::new(Vec::new()));
    let started_at = Instant::now();

    {
        let timer_label = timer_label.clone();
        let stop_button = stop_button.clone();
        let source = gtk::glib::timeout_add_local(Duration::from_secs(1), move || {
            if stop_button.is_sensitive() {
                timer_label.set_text(&format_elapsed(started_at.elapsed()));
            }
            gtk::glib::ControlFlow::Continue
        });
        sources.borrow_mut().push(source);
    }

    {
        let indicator = indicator.clone();
        let visible = Rc::new(RefCell::new(true));
        let source = gtk::glib::timeout_add_local(Duration::from_millis(500), move || {
            let mut visible = visible.borrow_mut();
            *visible = !*visible;
            indicator.set_opacity(if *visible { 1.0 } else { 0.2 });
            gtk::glib::ControlFlow::Continue
        });
        sources.borrow_mut().push(source);
    }

    let request_stop = {
        let stop_button = stop_button.clone();
        let timer_label = timer_label.clone();
        move || {
            if stop_button.is_sensitive() {
                stop_button.set_sensitive(false);
                timer_label.set_text("Saving…");
                on_stop();
            }
        }
    };
    let request_stop = Rc::new(request_stop);

    {
        let request_stop = request_stop.clone();
        stop_button.connect_clicked(move |_| request_stop());
    }

    {
        let request_stop = request_stop.clone();
        let key_controller = gtk::EventControllerKey::new();
        key_controller.connect_key_pressed(move |_, key, _, _| {
            if key == gtk::gdk::Key::Escape {
                request_stop();
                return gtk::glib::Propagation::Stop;
            }
            gtk::glib::Propagation::Proceed
        });
        hud.add_controller(key_controller);
    }

    hud.connect_close_request(move |_| {
        request_stop();
        gtk::glib::Propagation::Proceed
    });

    hud.present();
    RecordingHud {
        window: hud,
        sources,
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

fn apply_recording_hud_css() {
    let provider = CssProvider::new();
    provider.load_from_data(
        "
        window.recording-hud {
            background: rgba(30, 30, 30, 0.88);
            border-radius: 14px;
        }

        window.recording-hud label.recording-indicator {
            color: #e53935;
            font-size: 10px;
            font-weight: 700;
        }

        window.recording-hud button.stop-record-btn {
            min-width: 34px;
            min-height: 34px;
            border-radius: 999px;
            background: #d32f2f;
            color: white;
        }
        ",
    );

    if let Some(display) = gtk::gdk::Display::default() {
        gtk::style_context_add_provider_for_display(
            &display,
            &provider,
            gtk::STYLE_PROVIDER_PRIORITY_APPLICATION,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_time_is_clock_formatted() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(3_725)), "01:02:05");
    }
}
