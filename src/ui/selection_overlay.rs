use std::cell::RefCell;
use std::f64::consts::PI;
use std::rc::Rc;

use adw::prelude::*;
use gtk::{CssProvider, cairo, gdk, glib};
use gtk4_layer_shell::{Edge, KeyboardMode, Layer, LayerShell};

use crate::capture::{MonitorInfo, SelectionRect};
use crate::ui::selection::{BUTTON_SIZE, MenuAction, MenuLayout, Rect, SelectionState};

pub enum OverlayAction {
    Screenshot {
        monitor: MonitorInfo,
        selection: SelectionRect,
    },
    Record {
        monitor: MonitorInfo,
        selection: SelectionRect,
    },
    Dismiss,
}

/// Dimmed full-screen window on one monitor where the user drags out a region.
pub fn show_selection_overlay(
    app: &adw::Application,
    monitor: &gdk::Monitor,
    info: MonitorInfo,
    on_action: Rc<dyn Fn(OverlayAction)>,
) -> gtk::ApplicationWindow {
    apply_overlay_css();

    let window = gtk::ApplicationWindow::builder()
        .application(app)
        .title("Select Region")
        .decorated(false)
        .build();
    window.add_css_class("selection-overlay");

    if gtk4_layer_shell::is_supported() {
        window.init_layer_shell();
        window.set_layer(Layer::Overlay);
        window.set_monitor(Some(monitor));
        for edge in [Edge::Top, Edge::Bottom, Edge::Left, Edge::Right] {
            window.set_anchor(edge, true);
        }
        window.set_exclusive_zone(-1);
        window.set_keyboard_mode(KeyboardMode::Exclusive);
        window.set_namespace(Some("simpleshot-selection"));
    } else {
        window.fullscreen_on_monitor(monitor);
    }

    let state = Rc::new(RefCell::new(SelectionState::default()));
    let area = gtk::DrawingArea::new();
    area.set_hexpand(true);
    area.set_vexpand(true);
    area.set_cursor_from_name(Some("crosshair"));

    {
        let state = state.clone();
        area.set_draw_func(move |_, cr, _width, height| {
            draw_overlay(cr, &state.borrow(), f64::from(height));
        });
    }

    let drag = gtk::GestureDrag::new();
    {
        let state = state.clone();
        let area = area.clone();
        let on_action = on_action.clone();
        drag.connect_drag_begin(move |_, x, y| {
            let pressed = state.borrow_mut().press(x, y, f64::from(area.height()));
            let selection = state.borrow().rect();

            match (pressed, selection) {
                (Some(MenuAction::Screenshot), Some(selection)) => {
                    on_action(OverlayAction::Screenshot {
                        monitor: info.clone(),
                        selection,
                    });
                }
                (Some(MenuAction::Record), Some(selection)) => {
                    on_action(OverlayAction::Record {
                        monitor: info.clone(),
                        selection,
                    });
                }
                _ => area.queue_draw(),
            }
        });
    }
    {
        let state = state.clone();
        let area = area.clone();
        drag.connect_drag_update(move |gesture, dx, dy| {
            if let Some((x, y)) = gesture.start_point()
                && state.borrow_mut().drag_to(x + dx, y + dy)
            {
                area.queue_draw();
            }
        });
    }
    {
        let state = state.clone();
        let area = area.clone();
        drag.connect_drag_end(move |gesture, dx, dy| {
            if let Some((x, y)) = gesture.start_point() {
                state.borrow_mut().release(x + dx, y + dy);
                area.queue_draw();
            }
        });
    }
    area.add_controller(drag);

    let key_controller = gtk::EventControllerKey::new();
    key_controller.connect_key_pressed(move |_, key, _, _| {
        if key == gdk::Key::Escape {
            on_action(OverlayAction::Dismiss);
            return glib::Propagation::Stop;
        }
        glib::Propagation::Proceed
    });
    window.add_controller(key_controller);

    window.set_child(Some(&area));
    window.present();
    window
}

fn draw_overlay(cr: &cairo::Context, state: &SelectionState, screen_height: f64) {
    cr.set_source_rgba(0.0, 0.0, 0.0, 0.5);
    let _ = cr.paint();

    let Some(rect) = state.rect() else {
        return;
    };
    let (x, y) = (f64::from(rect.x), f64::from(rect.y));
    let (w, h) = (f64::from(rect.w), f64::from(rect.h));

    cr.set_operator(cairo::Operator::Clear);
    cr.rectangle(x, y, w, h);
    let _ = cr.fill();

    cr.set_operator(cairo::Operator::Over);
    cr.set_source_rgb(0.3, 0.6, 1.0);
    cr.set_line_width(2.0);
    cr.rectangle(x, y, w, h);
    let _ = cr.stroke();

    if let Some(menu) = state.menu(screen_height) {
        draw_menu(cr, &menu);
    }
}

fn draw_menu(cr: &cairo::Context, menu: &MenuLayout) {
    rounded_rect(cr, &menu.panel, 10.0);
    cr.set_source_rgba(0.15, 0.15, 0.15, 0.95);
    let _ = cr.fill_preserve();
    cr.set_source_rgba(1.0, 1.0, 1.0, 0.2);
    cr.set_line_width(1.0);
    let _ = cr.stroke();

    let radius = BUTTON_SIZE / 2.0;

    // Camera: white disc with a dark lens.
    let (cx, cy) = centre(&menu.screenshot);
    cr.set_source_rgb(1.0, 1.0, 1.0);
    cr.arc(cx, cy, radius, 0.0, 2.0 * PI);
    let _ = cr.fill();
    cr.set_source_rgb(0.2, 0.2, 0.2);
    cr.arc(cx, cy, 10.0, 0.0, 2.0 * PI);
    let _ = cr.fill();

    let (cx, cy) = centre(&menu.record);
    cr.set_source_rgb(0.9, 0.2, 0.2);
    cr.arc(cx, cy, radius, 0.0, 2.0 * PI);
    let _ = cr.fill();
    cr.set_source_rgb(1.0, 1.0, 1.0);
    cr.arc(cx, cy, 10.0, 0.0, 2.0 * PI);
    let _ = cr.fill();
}

fn centre(rect: &Rect) -> (f64, f64) {
    (rect.x + rect.w / 2.0, rect.y + rect.h / 2.0)
}

fn rounded_rect(cr: &cairo::Context, rect: &Rect, radius: f64) {
    let (x, y, w, h) = (rect.x, rect.y, rect.w, rect.h);
    cr.new_sub_path();
    cr.arc(x + w - radius, y + radius, radius, -PI / 2.0, 0.0);
    cr.arc(x + w - radius, y + h - radius, radius, 0.0, PI / 2.0);
    cr.arc(x + radius, y + h - radius, radius, PI / 2.0, PI);
    cr.arc(x + radius, y + radius, radius, PI, 3.0 * PI / 2.0);
    cr.close_path();
}

fn apply_overlay_css() {
    let provider = CssProvider::new();
    provider.load_from_data("window.selection-overlay { background-color: transparent; }");

    if let Some(display) = gdk::Display::default() {
        gtk::style_context_add_provider_for_display(
            &display,
            &provider,
            gtk::STYLE_PROVIDER_PRIORITY_APPLICATION,
        );
    }
}
