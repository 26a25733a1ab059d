/// Selections narrower or shorter than this (logical pixels) are ignored.
pub const MIN_SELECTION_SIZE: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorInfo {
    /// Connector name, e.g. `eDP-1`. Empty when the environment does not report one.
    pub id: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub scale: u32,
}

impl MonitorInfo {
    pub fn new(id: impl Into<String>, x: i32, y: i32, width: u32, height: u32, scale: i32) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            width,
            height,
            scale: scale.max(1) as u32,
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x
            && y >= self.y
            && i64::from(x) < i64::from(self.x) + i64::from(self.width)
            && i64::from(y) < i64::from(self.y) + i64::from(self.height)
    }

    /// The whole monitor as a selection in its own coordinates.
    pub fn full_selection(&self) -> SelectionRect {
        SelectionRect {
            x: 0,
            y: 0,
            w: self.width,
            h: self.height,
        }
    }
}

/// Top-left corner of the bounding box around every monitor. Whole-desktop
/// captures start here.
pub fn desktop_origin(monitors: &[MonitorInfo]) -> (i32, i32) {
    let x = monitors.iter().map(|m| m.x).min().unwrap_or(0);
    let y = monitors.iter().map(|m| m.y).min().unwrap_or(0);
    (x, y)
}

/// Logical rectangle relative to one monitor's window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectionRect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl SelectionRect {
    /// Normalises a drag from `start` to `end` in either direction.
    pub fn from_points(start: (f64, f64), end: (f64, f64)) -> Self {
        let x = start.0.min(end.0);
        let y = start.1.min(end.1);
        Self {
            x: x as i32,
            y: y as i32,
            w: (end.0 - start.0).abs() as u32,
            h: (end.1 - start.1).abs() as u32,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.w >= MIN_SELECTION_SIZE && self.h >= MIN_SELECTION_SIZE
    }

    /// The selection in desktop-wide logical coordinates.
    pub fn to_global(&self, monitor: &MonitorInfo) -> SelectionRect {
        SelectionRect {
            x: self.x + monitor.x,
            y: self.y + monitor.y,
            ..*self
        }
    }

    /// `X,Y WxH`, the geometry syntax of slurp, grim and wf-recorder.
    pub fn geometry_string(&self) -> String {
        format!("{},{} {}x{}", self.x, self.y, self.w, self.h)
    }

    /// Parses the `X,Y WxH` geometry printed by slurp.
    pub fn parse_geometry(input: &str) -> Option<Self> {
        let (position, size) = input.trim().split_once(' ')?;
        let (x, y) = position.split_once(',')?;
        let (w, h) = size.split_once('x')?;
        Some(Self {
            x: x.trim().parse().ok()?,
            y: y.trim().parse().ok()?,
            w: w.trim().parse().ok()?,
            h: h.trim().parse().ok()?,
        })
    }
}

/// Physical-pixel rectangle inside a captured frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Maps a logical selection on `monitor` into the pixel space of a frame whose
/// top-left corner sits at logical `(origin_x, origin_y)`.
///
/// Never fails. A result with zero area means the selection does not overlap
/// the frame at all.
pub fn map_to_physical_crop(
    selection: &SelectionRect,
    monitor: &MonitorInfo,
    origin_x: i32,
    origin_y: i32,
    frame_width: u32,
    frame_height: u32,
) -> CropRegion {
    let scale = i64::from(monitor.scale.max(1));

    let x = (i64::from(selection.x) + i64::from(monitor.x) - i64::from(origin_x)) * scale;
    let y = (i64::from(selection.y) + i64::from(monitor.y) - i64::from(origin_y)) * scale;
    let w = i64::from(selection.w) * scale;
    let h = i64::from(selection.h) * scale;

    let (x, width) = clamp_axis(x, w, i64::from(frame_width));
    let (y, height) = clamp_axis(y, h, i64::from(frame_height));

    if width == 0 || height == 0 {
        return CropRegion::default();
    }

    CropRegion {
        x,
        y,
        width,
        height,
    }
}

fn clamp_axis(start: i64, length: i64, limit: i64) -> (u32, u32) {
    if limit <= 0 || length <= 0 || start >= limit || start + length <= 0 {
        return (0, 0);
    }

    let clamped = start.clamp(0, limit - 1);
    let length = length.min(limit - clamped);
    (clamped as u32, length as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(x: i32, y: i32, scale: i32) -> MonitorInfo {
        MonitorInfo::new("DP-1", x, y, 1920, 1080, scale)
    }

    #[test]
    fn scales_selection_on_hidpi_monitor() {
        let selection = SelectionRect {
            x: 10,
            y: 10,
            w: 100,
            h: 50,
        };
        let crop = map_to_physical_crop(&selection, &monitor(0, 0, 2), 0, 0, 1920, 1080);
        assert_eq!(
            crop,
            CropRegion {
                x: 20,
                y: 20,
                width: 200,
                height: 100
            }
        );
    }

    #[test]
    fn clamps_width_to_small_frame() {
        let selection = SelectionRect {
            x: 10,
            y: 10,
            w: 100,
            h: 50,
        };
        let crop = map_to_physical_crop(&selection, &monitor(0, 0, 2), 0, 0, 150, 150);
        assert_eq!(
            crop,
            CropRegion {
                x: 20,
                y: 20,
                width: 130,
                height: 100
            }
        );
    }

    #[test]
    fn inside_selection_is_never_clamped() {
        for scale in 1..=4 {
            let mon = MonitorInfo::new("HDMI-A-1", 0, 0, 800, 600, scale);
            let frame_w = mon.width * mon.scale;
            let frame_h = mon.height * mon.scale;
            for (x, y, w, h) in [(0, 0, 800, 600), (5, 7, 13, 11), (400, 300, 399, 299)] {
                let selection = SelectionRect { x, y, w, h };
                let crop = map_to_physical_crop(&selection, &mon, 0, 0, frame_w, frame_h);
                assert_eq!(crop.width, w * mon.scale);
                assert_eq!(crop.height, h * mon.scale);
                assert_eq!(crop.x, x as u32 * mon.scale);
                assert_eq!(crop.y, y as u32 * mon.scale);
            }
        }
    }

    #[test]
    fn overflowing_selection_stays_inside_frame() {
        let mon = monitor(0, 0, 3);
        for (x, y, w, h) in [(0, 0, 5000, 5000), (900, 500, 300, 300), (1919, 1079, 10, 10)] {
            let selection = SelectionRect { x, y, w, h };
            let crop = map_to_physical_crop(&selection, &mon, 0, 0, 1920, 1080);
            assert!(crop.x + crop.width <= 1920, "{crop:?}");
            assert!(crop.y + crop.height <= 1080, "{crop:?}");
        }
    }

    #[test]
    fn subtracts_capture_origin_for_second_monitor() {
        let right = monitor(1920, 0, 1);
        let selection = SelectionRect {
            x: 10,
            y: 20,
            w: 30,
            h: 40,
        };

        let whole_desktop = map_to_physical_crop(&selection, &right, 0, 0, 3840, 1080);
        assert_eq!(whole_desktop.x, 1930);

        let single_output = map_to_physical_crop(&selection, &right, 1920, 0, 1920, 1080);
        assert_eq!(single_output.x, 10);
        assert_eq!(single_output.y, 20);
    }

    #[test]
    fn disjoint_selection_yields_empty_region() {
        let selection = SelectionRect {
            x: 10,
            y: 10,
            w: 50,
            h: 50,
        };
        let crop = map_to_physical_crop(&selection, &monitor(1920, 0, 1), 0, 0, 1920, 1080);
        assert!(crop.is_empty());

        let crop = map_to_physical_crop(&selection, &monitor(0, 0, 1), 0, 0, 0, 0);
        assert!(crop.is_empty());
    }

    #[test]
    fn scale_below_one_is_treated_as_one() {
        assert_eq!(MonitorInfo::new("x", 0, 0, 10, 10, 0).scale, 1);
    }

    #[test]
    fn drag_in_any_direction_normalises() {
        let rect = SelectionRect::from_points((120.0, 80.0), (20.0, 30.0));
        assert_eq!(
            rect,
            SelectionRect {
                x: 20,
                y: 30,
                w: 100,
                h: 50
            }
        );
        assert!(rect.is_actionable());
        assert!(!SelectionRect::from_points((0.0, 0.0), (9.0, 200.0)).is_actionable());
    }

    #[test]
    fn slurp_geometry_round_trips_through_global_coordinates() {
        let parsed = SelectionRect::parse_geometry("1930,20 300x200\n").unwrap();
        assert_eq!(parsed.x, 1930);
        assert_eq!(parsed.w, 300);

        let local = SelectionRect {
            x: 10,
            y: 20,
            w: 300,
            h: 200,
        };
        assert_eq!(
            local.to_global(&monitor(1920, 0, 1)).geometry_string(),
            "1930,20 300x200"
        );
        assert!(SelectionRect::parse_geometry("garbage").is_none());
    }

    #[test]
    fn monitor_left_of_the_primary_maps_into_a_desktop_frame() {
        let left = MonitorInfo::new("HDMI-A-1", -1920, 0, 1920, 1080, 1);
        let primary = MonitorInfo::new("DP-1", 0, 0, 2560, 1440, 1);
        let origin = desktop_origin(&[primary, left.clone()]);
        assert_eq!(origin, (-1920, 0));

        let selection = SelectionRect {
            x: 10,
            y: 10,
            w: 100,
            h: 50,
        };
        let crop = map_to_physical_crop(&selection, &left, origin.0, origin.1, 4480, 1440);
        assert_eq!(
            crop,
            CropRegion {
                x: 10,
                y: 10,
                width: 100,
                height: 50
            }
        );
        assert_eq!(desktop_origin(&[]), (0, 0));
    }
}
