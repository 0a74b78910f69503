//! Where to put a popup menu that was requested by clicking a tray icon.

use crate::geometry::{Point, Rectangle, Size};

/// Pointer positions closer than this to the top of the monitor are treated as clicks on a panel
/// docked at the top of the screen.
pub const TOP_PANEL_THRESHOLD: i32 = 100;

/// Extra distance kept between the popup and the panel the tray icon lives in.
pub const PANEL_GAP: i32 = 4;

/// What the popup is being opened in response to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Anchor {
    /// The pointer position in root window coordinates
    pub pointer: Point,
    /// How far below the top edge of the tray icon the pointer was, if the click came from an
    /// icon that sits inside a panel. The popup is then pushed clear of that panel.
    pub offset_in_icon: Option<i32>,
}

/// Computes the top-left corner of a popup of `size` opened at `anchor` on the monitor
/// described by `bounds`.
///
/// The popup's top-left corner snaps to the pointer, unless that would make it overflow the
/// bottom or right edge of the monitor, in which case the bottom or right edge snaps to the
/// pointer instead.
#[must_use]
pub fn place_popup(anchor: Anchor, size: Size, bounds: Rectangle) -> Point {
    let Point { mut x, mut y } = anchor.pointer;

    if y < bounds.y {
        y = bounds.y;
    } else if y + size.h > bounds.bottom() {
        y -= size.h;
    }

    if x < bounds.x {
        x = bounds.x;
    } else if x + size.w > bounds.right() {
        x -= size.w;
    }

    if let Some(offset) = anchor.offset_in_icon {
        if y < TOP_PANEL_THRESHOLD {
            y += offset + PANEL_GAP;
        } else {
            y -= offset + PANEL_GAP;
        }
    }

    Point { x, y }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCREEN: Rectangle = Rectangle::new(0, 0, 1920, 1080);
    const MENU: Size = Size::new(200, 150);

    fn at(x: i32, y: i32) -> Anchor {
        Anchor {
            pointer: Point::new(x, y),
            offset_in_icon: None,
        }
    }

    #[test]
    fn fits_below_right() {
        assert_eq!(place_popup(at(500, 400), MENU, SCREEN), Point::new(500, 400));
    }

    #[test]
    fn snaps_bottom_right_edges_to_pointer() {
        assert_eq!(
            place_popup(at(1900, 1070), MENU, SCREEN),
            Point::new(1700, 920)
        );
    }

    #[test]
    fn clamps_to_monitor_origin() {
        let second_monitor = Rectangle::new(1920, 200, 1280, 1024);
        assert_eq!(
            place_popup(at(1800, 100), MENU, second_monitor),
            Point::new(1920, 200)
        );
    }

    #[test]
    fn top_panel_pushes_popup_down() {
        let anchor = Anchor {
            pointer: Point::new(1800, 10),
            offset_in_icon: Some(8),
        };
        assert_eq!(place_popup(anchor, MENU, SCREEN), Point::new(1600, 22));
    }

    #[test]
    fn bottom_panel_pushes_popup_up() {
        let anchor = Anchor {
            pointer: Point::new(1800, 1070),
            offset_in_icon: Some(12),
        };
        // 1070 - 150 (snap bottom edge) - (12 + 4)
        assert_eq!(place_popup(anchor, MENU, SCREEN), Point::new(1600, 904));
    }
}
