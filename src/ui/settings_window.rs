use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use adw::prelude::*;
use gtk::{Align, Box as GtkBox, Button, Label, ListBox, Orientation, SelectionMode};
use log::{error, info};

use crate::config::Config;
use crate::ui::send_notification;

/// The window the app opens on and returns to after every capture.
pub fn build_settings_window(
    app: &adw::Application,
    config: Rc<RefCell<Config>>,
    on_start: impl Fn() + 'static,
) -> adw::ApplicationWindow {
    let window = adw::ApplicationWindow::builder()
        .application(app)
        .title("SimpleShot")
        .resizable(false)
        .default_width(500)
        .default_height(400)
        .build();

    let root = GtkBox::new(Orientation::Vertical, 0);
    let header_bar = adw::HeaderBar::new();

    let content = GtkBox::new(Orientation::Vertical, 16);
    content.set_valign(Align::Start);
    content.set_margin_top(24);
    content.set_margin_bottom(24);
    content.set_margin_start(24);
    content.set_margin_end(24);

    let title = Label::new(Some("Save Locations"));
    title.add_css_class("title-4");
    title.set_halign(Align::Start);

    let locations = ListBox::new();
    locations.set_selection_mode(SelectionMode::None);
    locations.add_css_class("boxed-list");

    let (screenshot_dir, recording_dir) = {
        let config = config.borrow();
        (config.screenshot_dir.clone(), config.recording_dir.clone())
    };
    let picture_row = {
        let config = config.clone();
        let app = app.clone();
        directory_row(&window, "Screenshots", &screenshot_dir, move |path| {
            config.borrow_mut().screenshot_dir = path;
            report_save(config.borrow().save(), |body| send_notification(&app, body));
        })
    };
    let video_row = {
        let config = config.clone();
        let app = app.clone();
        directory_row(&window, "Recordings", &recording_dir, move |path| {
            config.borrow_mut().recording_dir = path;
            report_save(config.borrow().save(), |body| send_notification(&app, body));
        })
    };
    locations.append(&picture_row);
    locations.append(&video_row);

    let hint = Label::new(Some(
        "Drag to select a region, then pick screenshot or record. Press Escape to cancel.",
    ));
    hint.add_css_class("dim-label");
    hint.set_wrap(true);

    let start_button = Button::with_label("Start Capture");
    start_button.add_css_class("suggested-action");
    start_button.add_css_class("pill");
    start_button.set_size_request(200, 50);
    start_button.set_halign(Align::Center);
    start_button.connect_clicked(move |_| on_start());

    content.append(&title);
    content.append(&locations);
    content.append(&hint);
    content.append(&start_button);

    root.append(&header_bar);
    root.append(&content);
    window.set_content(Some(&root));
    window.set_default_widget(Some(&start_button));

    window
}

fn report_save(result: anyhow::Result<()>, notify: impl Fn(&str)) {
    match result {
        Ok(()) => info!("saved settings"),
        Err(err) => {
            error!("cannot save settings: {err:#}");
            notify(&format!("Could not save settings: {err:#}"));
        }
    }
}

fn directory_row(
    window: &adw::ApplicationWindow,
    title: &str,
    initial: &Path,
    on_pick: impl Fn(PathBuf) + 'static,
) -> adw::ActionRow {
    let row = adw::ActionRow::builder()
        .title(title)
        .subtitle(initial.to_string_lossy().as_ref())
        .build();

    let choose_button = Button::with_label("Choose");
    choose_button.set_valign(Align::Center);
    row.add_suffix(&choose_button);

    let on_pick = Rc::new(on_pick);
    {
        let window = window.clone();
        let row = row.clone();
        let title = title.to_string();
        choose_button.connect_clicked(move |_| {
            let chooser = gtk::FileChooserNative::builder()
                .title(format!("Select {title} Folder"))
                .action(gtk::FileChooserAction::SelectFolder)
                .transient_for(&window)
                .modal(true)
                .build();

            let row = row.clone();
            let on_pick = on_pick.clone();
            // The dialog is gone once the last reference drops, so the
            // handler holds one until a response arrives.
            let pending = RefCell::new(Some(chooser.clone()));
            chooser.connect_response(move |chooser, response| {
                if response == gtk::ResponseType::Accept
                    && let Some(path) = chooser.file().and_then(|file| file.path())
                {
                    row.set_subtitle(&path.to_string_lossy());
                    on_pick(path);
                }
                pending.borrow_mut().take();
            });
            chooser.show();
        });
    }

    row
}
