//! The menu that pops up when the XEmbed icon is clicked. XEmbed trays only host the icon, so we
//! draw the menu ourselves: an override-redirect window holding the pointer grab, rendered with
//! cairo and pango.

use cairo::{Context, Format as CairoImageFormat, ImageSurface};
use pangocairo::pango;
use trayshim_data::{
    colour::Colour,
    geometry::{Point, Rectangle, Size},
    placement::{self, Anchor},
};
use xcb::{x, Xid};

use super::{put_image, Error, Result};
use crate::menu::{EntryId, MenuSnapshot};

const FONT: &str = "Sans 10";
const PADDING_X: i32 = 12;
const PADDING_Y: i32 = 4;
const MIN_WIDTH: i32 = 120;
const BORDER: i32 = 1;

const BACKGROUND: Colour = Colour::opaque(0xf6, 0xf5, 0xf4);
const HIGHLIGHT: Colour = Colour::opaque(0x35, 0x84, 0xe4);
const FRAME: Colour = Colour::opaque(0x9a, 0x99, 0x96);
const TEXT: Colour = Colour::opaque(0x24, 0x1f, 0x31);
const TEXT_HIGHLIGHTED: Colour = Colour::WHITE;
const TEXT_DISABLED: Colour = Colour::opaque(0x8f, 0x8e, 0x8c);

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Row {
    pub id: EntryId,
    pub label: String,
    pub enabled: bool,
    /// Position of the row in popup coordinates, borders excluded
    pub bounds: Rectangle,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(super) struct Layout {
    pub rows: Vec<Row>,
    pub size: Size,
}

impl Layout {
    /// Lays `menu` out as a column of rows, measuring labels with `measure`
    pub fn new(menu: &MenuSnapshot, mut measure: impl FnMut(&str) -> Size) -> Self {
        let mut rows = Vec::with_capacity(menu.items.len());
        let mut width = MIN_WIDTH;
        let mut y = BORDER;

        for item in &menu.items {
            let text_size = measure(&item.label);
            let h = text_size.h + 2 * PADDING_Y;
            width = width.max(text_size.w + 2 * PADDING_X + 2 * BORDER);

            rows.push(Row {
                id: item.id,
                label: item.label.clone(),
                enabled: item.enabled,
                bounds: Rectangle::new(BORDER, y, 0, h),
            });
            y += h;
        }

        for row in &mut rows {
            row.bounds.w = width - 2 * BORDER;
        }

        Self {
            rows,
            size: Size::new(width, y + BORDER),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The row under `point`, in popup coordinates
    pub fn row_at(&self, point: Point) -> Option<usize> {
        self.rows.iter().position(|row| row.bounds.contains(point))
    }
}

/// An open popup menu
pub(super) struct Popup {
    window: x::Window,
    gc: x::Gcontext,
    layout: Layout,
    anchor: Anchor,
    hovered: Option<usize>,
    /// A button release only activates an entry once the pointer moved or a button was pressed
    /// inside the popup, so the release of the click that opened it is ignored
    armed: bool,
}

/// What the event loop should do after the popup saw an event
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Outcome {
    Keep,
    Close,
    Activate(EntryId),
}

impl Popup {
    /// Opens the popup for `menu` at `anchor`. Returns `None` when there is nothing to show.
    pub fn open(
        conn: &xcb::Connection,
        screen: &x::Screen,
        menu: &MenuSnapshot,
        anchor: Anchor,
    ) -> Result<Option<Self>> {
        let layout = Layout::new(menu, measurer()?);
        if layout.is_empty() {
            return Ok(None);
        }

        let bounds = super::monitor_bounds(conn, screen, anchor.pointer);
        let origin = placement::place_popup(anchor, layout.size, bounds);

        let window: x::Window = conn.generate_id();
        conn.send_request(&x::CreateWindow {
            depth: screen.root_depth(),
            wid: window,
            parent: screen.root(),
            x: origin.x as i16,
            y: origin.y as i16,
            width: layout.size.w as u16,
            height: layout.size.h as u16,
            border_width: 0,
            class: x::WindowClass::InputOutput,
            visual: screen.root_visual(),
            value_list: &[
                x::Cw::BackPixel(BACKGROUND.serialise_to_u32() >> 8),
                x::Cw::OverrideRedirect(true),
                x::Cw::EventMask(
                    x::EventMask::EXPOSURE
                        | x::EventMask::BUTTON_PRESS
                        | x::EventMask::BUTTON_RELEASE
                        | x::EventMask::POINTER_MOTION
                        | x::EventMask::LEAVE_WINDOW,
                ),
            ],
        });
        let gc: x::Gcontext = conn.generate_id();
        conn.send_request(&x::CreateGc {
            cid: gc,
            drawable: x::Drawable::Window(window),
            value_list: &[],
        });
        conn.send_request(&x::MapWindow { window });

        let grab = conn.send_request(&x::GrabPointer {
            owner_events: false,
            grab_window: window,
            event_mask: x::EventMask::BUTTON_PRESS
                | x::EventMask::BUTTON_RELEASE
                | x::EventMask::POINTER_MOTION,
            pointer_mode: x::GrabMode::Async,
            keyboard_mode: x::GrabMode::Async,
            confine_to: x::Window::none(),
            cursor: x::Cursor::none(),
            time: x::CURRENT_TIME,
        });
        match conn.wait_for_reply(grab) {
            Ok(reply) if reply.status() == x::GrabStatus::Success => {}
            Ok(reply) => tracing::warn!(
                "Failed to grab the pointer for the tray menu ({:?}), it won't close by itself",
                reply.status()
            ),
            Err(why) => tracing::warn!("Failed to grab the pointer for the tray menu: {why:?}"),
        }
        conn.flush()?;

        tracing::debug!(
            "Opened tray menu with {} rows at {origin:?}",
            layout.rows.len()
        );

        Ok(Some(Self {
            window,
            gc,
            layout,
            anchor,
            hovered: None,
            armed: false,
        }))
    }

    pub fn window(&self) -> x::Window {
        self.window
    }

    pub fn anchor(&self) -> Anchor {
        self.anchor
    }

    pub fn close(self, conn: &xcb::Connection) {
        conn.send_request(&x::UngrabPointer {
            time: x::CURRENT_TIME,
        });
        conn.send_request(&x::FreeGc { gc: self.gc });
        conn.send_request(&x::DestroyWindow {
            window: self.window,
        });
        if let Err(why) = conn.flush() {
            tracing::warn!("Failed to close the tray menu: {why:?}");
        }
    }

    pub fn draw(&self, conn: &xcb::Connection, screen: &x::Screen) -> Result<()> {
        let Size { w, h } = self.layout.size;
        let mut surface = ImageSurface::create(CairoImageFormat::Rgb24, w, h)?;

        {
            let cr = Context::new(&surface)?;
            paint(&cr, &self.layout, self.hovered)?;
        }
        surface.flush();

        let stride = surface.stride() as usize;
        let data = surface.data().map_err(|why| Error::Draw(why.to_string()))?;
        let mut pixels = Vec::with_capacity(w as usize * h as usize * 4);
        for row in data.chunks(stride).take(h as usize) {
            pixels.extend_from_slice(&row[..w as usize * 4]);
        }

        put_image(
            conn,
            x::Drawable::Window(self.window),
            self.gc,
            Size::new(w, h),
            screen.root_depth(),
            &pixels,
        )
    }

    /// Moves the highlight to the row under `position`. Returns whether the popup needs a redraw.
    pub fn motion(&mut self, position: Point) -> bool {
        self.armed = true;

        let hovered = self
            .layout
            .row_at(position)
            .filter(|&idx| self.layout.rows[idx].enabled);
        let changed = hovered != self.hovered;
        self.hovered = hovered;
        changed
    }

    pub fn leave(&mut self) -> bool {
        self.hovered.take().is_some()
    }

    /// A press reported on `window`, at `position` relative to it. Only presses on the popup
    /// itself keep it open, without a pointer grab the icon gets its own presses.
    pub fn button_press(&mut self, window: x::Window, position: Point) -> Outcome {
        let on_popup = window == self.window
            && Rectangle::new(0, 0, self.layout.size.w, self.layout.size.h).contains(position);
        if on_popup {
            self.armed = true;
            Outcome::Keep
        } else {
            Outcome::Close
        }
    }

    pub fn button_release(&mut self, position: Point) -> Outcome {
        if !self.armed {
            self.armed = true;
            return Outcome::Keep;
        }

        match self.layout.row_at(position).map(|idx| &self.layout.rows[idx]) {
            Some(row) if row.enabled => Outcome::Activate(row.id),
            Some(_) => Outcome::Keep,
            None => Outcome::Close,
        }
    }

    #[cfg(test)]
    fn with_layout(layout: Layout) -> Self {
        Self {
            window: x::Window::none(),
            gc: x::Gcontext::none(),
            layout,
            anchor: Anchor {
                pointer: Point::new(0, 0),
                offset_in_icon: None,
            },
            hovered: None,
            armed: false,
        }
    }
}

fn font() -> pango::FontDescription {
    pango::FontDescription::from_string(FONT)
}

/// Measures labels the way [`paint`] draws them
fn measurer() -> Result<impl FnMut(&str) -> Size> {
    let surface = ImageSurface::create(CairoImageFormat::Rgb24, 1, 1)?;
    let cr = Context::new(&surface)?;
    let text = pangocairo::functions::create_layout(&cr);
    text.set_font_description(Some(&font()));

    Ok(move |label: &str| {
        text.set_text(label);
        let (w, h) = text.pixel_size();
        Size::new(w, h)
    })
}

fn set_colour(cr: &Context, colour: Colour) {
    let (r, g, b) = colour.to_cairo_rgb();
    cr.set_source_rgb(r, g, b);
}

fn paint(cr: &Context, layout: &Layout, hovered: Option<usize>) -> Result<(), cairo::Error> {
    let Size { w, h } = layout.size;

    set_colour(cr, FRAME);
    cr.paint()?;
    set_colour(cr, BACKGROUND);
    cr.rectangle(
        f64::from(BORDER),
        f64::from(BORDER),
        f64::from(w - 2 * BORDER),
        f64::from(h - 2 * BORDER),
    );
    cr.fill()?;

    let text = pangocairo::functions::create_layout(cr);
    text.set_font_description(Some(&font()));

    for (idx, row) in layout.rows.iter().enumerate() {
        let Rectangle { x, y, w, h } = row.bounds;
        let highlighted = hovered == Some(idx);

        if highlighted {
            set_colour(cr, HIGHLIGHT);
            cr.rectangle(f64::from(x), f64::from(y), f64::from(w), f64::from(h));
            cr.fill()?;
        }

        let colour = match (row.enabled, highlighted) {
            (false, _) => TEXT_DISABLED,
            (true, true) => TEXT_HIGHLIGHTED,
            (true, false) => TEXT,
        };
        set_colour(cr, colour);

        text.set_text(&row.label);
        cr.move_to(f64::from(x + PADDING_X - BORDER), f64::from(y + PADDING_Y));
        pangocairo::functions::show_layout(cr, &text);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::menu::SnapshotItem;

    fn menu(labels: &[(&str, bool)]) -> MenuSnapshot {
        MenuSnapshot {
            items: labels
                .iter()
                .enumerate()
                .map(|(idx, &(label, enabled))| SnapshotItem {
                    id: EntryId::from_raw(idx as u64),
                    label: label.to_owned(),
                    enabled,
                })
                .collect(),
        }
    }

    /// 7 pixels per character, 14 pixels high
    fn fixed_width(label: &str) -> Size {
        Size::new(label.chars().count() as i32 * 7, 14)
    }

    #[test]
    fn rows_stack_vertically() {
        let layout = Layout::new(
            &menu(&[("Open", true), ("Connected", false), ("Quit", true)]),
            fixed_width,
        );

        assert_eq!(layout.size, Size::new(MIN_WIDTH, 1 + 3 * 22 + 1));
        let tops: Vec<_> = layout.rows.iter().map(|row| row.bounds.y).collect();
        assert_eq!(tops, [1, 23, 45]);
        assert!(layout.rows.iter().all(|row| row.bounds.w == MIN_WIDTH - 2));
    }

    #[test]
    fn long_labels_widen_the_popup() {
        let label = "A rather long status line that needs room";
        let layout = Layout::new(&menu(&[(label, false)]), fixed_width);

        assert_eq!(layout.size.w, label.len() as i32 * 7 + 2 * PADDING_X + 2 * BORDER);
    }

    #[test]
    fn empty_menus_have_no_rows() {
        let layout = Layout::new(&MenuSnapshot::default(), fixed_width);

        assert!(layout.is_empty());
        assert_eq!(layout.row_at(Point::new(5, 5)), None);
    }

    #[test]
    fn hit_testing() {
        let layout = Layout::new(&menu(&[("Open", true), ("Quit", true)]), fixed_width);

        assert_eq!(layout.row_at(Point::new(10, 1)), Some(0));
        assert_eq!(layout.row_at(Point::new(10, 22)), Some(0));
        assert_eq!(layout.row_at(Point::new(10, 23)), Some(1));
        // Borders aren't rows
        assert_eq!(layout.row_at(Point::new(10, 0)), None);
        assert_eq!(layout.row_at(Point::new(0, 10)), None);
        assert_eq!(layout.row_at(Point::new(10, 45)), None);
    }

    #[test]
    fn release_of_the_opening_click_is_ignored() {
        let mut popup = Popup::with_layout(Layout::new(&menu(&[("Open", true)]), fixed_width));

        assert_eq!(popup.button_release(Point::new(10, 10)), Outcome::Keep);
        assert_eq!(
            popup.button_release(Point::new(10, 10)),
            Outcome::Activate(EntryId::from_raw(0))
        );
    }

    #[test]
    fn motion_arms_and_highlights() {
        let mut popup = Popup::with_layout(Layout::new(
            &menu(&[("Status", false), ("Quit", true)]),
            fixed_width,
        ));

        // Disabled rows don't light up
        assert!(!popup.motion(Point::new(10, 10)));
        assert!(popup.motion(Point::new(10, 30)));
        assert!(!popup.motion(Point::new(12, 31)));

        assert_eq!(
            popup.button_release(Point::new(10, 30)),
            Outcome::Activate(EntryId::from_raw(1))
        );
        assert_eq!(popup.button_release(Point::new(10, 10)), Outcome::Keep);
        assert_eq!(popup.button_release(Point::new(500, 10)), Outcome::Close);

        assert!(popup.leave());
        assert!(!popup.leave());
    }

    #[test]
    fn presses_outside_close() {
        let mut popup = Popup::with_layout(Layout::new(&menu(&[("Open", true)]), fixed_width));

        let window = popup.window();
        assert_eq!(popup.button_press(window, Point::new(10, 10)), Outcome::Keep);
        assert_eq!(popup.button_press(window, Point::new(-5, 10)), Outcome::Close);
        assert_eq!(popup.button_press(window, Point::new(10, 400)), Outcome::Close);
    }

    #[test]
    fn presses_on_the_icon_close() {
        let mut popup = Popup::with_layout(Layout::new(&menu(&[("Open", true)]), fixed_width));
        // Ungrabbed presses on the icon come in icon coordinates, which may well lie inside the
        // popup's rectangle
        let icon = unsafe { <x::Window as xcb::XidNew>::new(0x0040_0001) };

        assert_eq!(popup.button_press(icon, Point::new(10, 10)), Outcome::Close);
    }

    #[test]
    fn paints_without_a_display() {
        let layout = Layout::new(&menu(&[("Open", true), ("Idle", false)]), fixed_width);
        let surface =
            ImageSurface::create(CairoImageFormat::Rgb24, layout.size.w, layout.size.h).unwrap();
        let cr = Context::new(&surface).unwrap();

        paint(&cr, &layout, Some(0)).unwrap();
    }
}
