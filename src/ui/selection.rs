//! Drag-to-select and action menu logic of the overlay, free of GTK.
use crate::capture::SelectionRect;

pub const MENU_WIDTH: f64 = 200.0;
pub const MENU_HEIGHT: f64 = 60.0;
const MENU_GAP: f64 = 20.0;
pub const BUTTON_SIZE: f64 = 40.0;
const BUTTON_INSET: f64 = 40.0;
const BUTTON_SPACING: f64 = 20.0;
/// The menu only appears for selections larger than this in both directions.
const MENU_THRESHOLD: u32 = 50;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Rect {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && x <= self.x + self.w && y >= self.y && y <= self.y + self.h
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MenuAction {
    Screenshot,
    Record,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MenuLayout {
    pub panel: Rect,
    pub screenshot: Rect,
    pub record: Rect,
}

impl MenuLayout {
    /// Centred under the selection, or above it when it would leave the screen.
    fn place(selection: &SelectionRect, screen_height: f64) -> Self {
        let (x, y) = (f64::from(selection.x), f64::from(selection.y));
        let (w, h) = (f64::from(selection.w), f64::from(selection.h));

        let menu_x = x + w / 2.0 - MENU_WIDTH / 2.0;
        let mut menu_y = y + h + MENU_GAP;
        if menu_y + MENU_HEIGHT > screen_height {
            menu_y = y - MENU_HEIGHT - MENU_GAP;
        }

        let button_y = menu_y + (MENU_HEIGHT - BUTTON_SIZE) / 2.0;
        let screenshot_x = menu_x + BUTTON_INSET;
        let record_x = screenshot_x + BUTTON_SIZE + BUTTON_SPACING;

        Self {
            panel: Rect {
                x: menu_x,
                y: menu_y,
                w: MENU_WIDTH,
                h: MENU_HEIGHT,
            },
            screenshot: Rect {
                x: screenshot_x,
                y: button_y,
                w: BUTTON_SIZE,
                h: BUTTON_SIZE,
            },
            record: Rect {
                x: record_x,
                y: button_y,
                w: BUTTON_SIZE,
                h: BUTTON_SIZE,
            },
        }
    }

    fn hit(&self, x: f64, y: f64) -> Option<MenuAction> {
        if self.screenshot.contains(x, y) {
            Some(MenuAction::Screenshot)
        } else if self.record.contains(x, y) {
            Some(MenuAction::Record)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SelectionState {
    start: (f64, f64),
    end: (f64, f64),
    dragging: bool,
    has_selection: bool,
}

impl SelectionState {
    /// Pointer pressed. A press on a menu button returns its action and
    /// keeps the selection; anywhere else starts a new drag.
    pub fn press(&mut self, x: f64, y: f64, screen_height: f64) -> Option<MenuAction> {
        if let Some(action) = self
            .menu(screen_height)
            .and_then(|menu| menu.hit(x, y))
        {
            return Some(action);
        }

        self.start = (x, y);
        self.end = (x, y);
        self.dragging = true;
        self.has_selection = true;
        None
    }

    pub fn drag_to(&mut self, x: f64, y: f64) -> bool {
        if !self.dragging {
            return false;
        }
        self.end = (x, y);
        true
    }

    pub fn release(&mut self, x: f64, y: f64) {
        if self.dragging {
            self.end = (x, y);
            self.dragging = false;
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.dragging
    }

    pub fn rect(&self) -> Option<SelectionRect> {
        self.has_selection
            .then(|| SelectionRect::from_points(self.start, self.end))
    }

    pub fn menu(&self, screen_height: f64) -> Option<MenuLayout> {
        let rect = self.rect()?;
        let large_enough = rect.w > MENU_THRESHOLD && rect.h > MENU_THRESHOLD;
        (!self.dragging && large_enough).then(|| MenuLayout::place(&rect, screen_height))
    }
}
