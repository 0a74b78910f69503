//! Tray icons docked into an XEmbed system tray, the [freedesktop system tray protocol][`xembed`]
//! that the panels of most X11 desktops implement.
//!
//! The icon is a small window of our own that the tray manager reparents into its panel. It is
//! drawn, and its events are handled, on a dedicated thread.
//!
//! [`xembed`]: https://specifications.freedesktop.org/systemtray-spec/latest/

use std::{
    path::Path,
    sync::{Arc, Mutex},
    thread::{Builder as ThreadBuilder, JoinHandle},
};

use trayshim_data::{
    colour::Colour,
    geometry::{Point, Rectangle, Size},
    placement::Anchor,
    settings::TrayConfig,
};
use xcb::{randr, x, Xid};

use super::Backend;
use crate::{
    icon::IconImage,
    lock,
    menu::MenuSnapshot,
    tray::Dispatcher,
};

mod popup;

use popup::{Outcome, Popup};

/// Opcode of the `_NET_SYSTEM_TRAY_OPCODE` message asking the manager to embed a window
const SYSTEM_TRAY_REQUEST_DOCK: u32 = 0;

/// `_XEMBED_INFO` flag telling the embedder to map the window
const XEMBED_MAPPED: u32 = 1;

/// Largest amount of pixel data put into a single PutImage request
const MAX_REQUEST_BYTES: usize = 128 * 1024;

const THREAD_NAME: &str = "systray status icon";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("No XEmbed tray manager owns {0}")]
    NoTrayManager(String),
    #[error("The X server has no screen {0}")]
    NoScreen(usize),
    #[error("Failed to draw the tray menu: {0}")]
    Draw(String),
    #[error("Cairo error: {0}")]
    Cairo(#[from] cairo::Error),
    #[error("Failed to establish a connection to the X server: {0:?}")]
    XcbConnection(#[from] xcb::ConnError),
    #[error("Encountered an X protocol error: {0}")]
    XcbProtocol(String),
}

impl From<xcb::Error> for Error {
    fn from(xerror: xcb::Error) -> Self {
        match xerror {
            xcb::Error::Connection(err) => Self::XcbConnection(err),
            xcb::Error::Protocol(err) => Self::XcbProtocol(format!("{err:?}")),
        }
    }
}

type Result<T, E = Error> = std::result::Result<T, E>;

xcb::atoms_struct! {
    /// The atoms the icon needs over its lifetime, interned once when it is created
    #[derive(Clone, Copy, Debug)]
    struct Atoms {
        /// Type of the client messages sent to the tray manager
        opcode => b"_NET_SYSTEM_TRAY_OPCODE",
        /// Set on the manager's window when it prefers icons with a specific visual, mostly so
        /// they can be drawn with an alpha channel
        tray_visual => b"_NET_SYSTEM_TRAY_VISUAL",
        xembed_info => b"_XEMBED_INFO",
        wm_name => b"_NET_WM_NAME",
        utf8_string => b"UTF8_STRING",
        /// Sent to our own window to stop the event thread
        shutdown => b"_TRAYSHIM_SHUTDOWN",
        /// Sent to our own window when the menu changed while a popup may be open
        menu_changed => b"_TRAYSHIM_MENU_CHANGED",
    }
}

/// What the icon looks like right now, shared with the event thread
struct Shared {
    icon: IconImage,
    menu: MenuSnapshot,
}

/// How the pixels of the icon window are laid out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct IconVisual {
    depth: u8,
    /// What the icon is blended over, `None` for windows with an alpha channel
    background: Option<Colour>,
}

pub(crate) struct StatusIcon {
    dispatcher: Dispatcher,
    tray_size: u32,
    background: Colour,
    running: Option<Running>,
}

impl StatusIcon {
    pub fn new(dispatcher: Dispatcher, config: &TrayConfig) -> Self {
        Self {
            dispatcher,
            tray_size: config.tray_size,
            background: config.background,
            running: None,
        }
    }

    fn running(&self) -> crate::Result<&Running> {
        self.running.as_ref().ok_or(crate::Error::NotCreated)
    }
}

impl Backend for StatusIcon {
    fn create(&mut self, icon: &Path, tooltip: &str, menu: &MenuSnapshot) -> crate::Result<()> {
        let icon = IconImage::load(icon, self.tray_size)?;
        let shared = Arc::new(Mutex::new(Shared {
            icon,
            menu: menu.clone(),
        }));

        self.running = Some(Running::start(
            self.dispatcher.clone(),
            self.tray_size,
            self.background,
            tooltip,
            shared,
        )?);
        Ok(())
    }

    fn set_icon(&mut self, icon: &Path) -> crate::Result<()> {
        let icon = IconImage::load(icon, self.tray_size)?;
        let running = self.running()?;
        lock(&running.shared).icon = icon;

        // Clearing with exposures makes the event thread redraw the icon
        running.conn.send_request(&x::ClearArea {
            exposures: true,
            window: running.window,
            x: 0,
            y: 0,
            width: 0,
            height: 0,
        });
        running.conn.flush().map_err(Error::from)?;
        Ok(())
    }

    fn set_menu(&mut self, menu: &MenuSnapshot) -> crate::Result<()> {
        let running = self.running()?;
        lock(&running.shared).menu = menu.clone();
        running.notify(running.atoms.menu_changed)?;
        Ok(())
    }

    fn remove(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop();
        }
    }
}

/// An icon that is docked, or at least asked to be
struct Running {
    conn: Arc<xcb::Connection>,
    window: x::Window,
    gc: x::Gcontext,
    atoms: Atoms,
    shared: Arc<Mutex<Shared>>,
    thread: Option<JoinHandle<()>>,
}

impl Running {
    fn start(
        dispatcher: Dispatcher,
        tray_size: u32,
        background: Colour,
        tooltip: &str,
        shared: Arc<Mutex<Shared>>,
    ) -> crate::Result<Self> {
        let (conn, screen_num) =
            xcb::Connection::connect_with_extensions(None, &[], &[xcb::Extension::RandR])
                .map_err(Error::from)?;
        let conn = Arc::new(conn);
        let screen_num = usize::try_from(screen_num).unwrap_or_default();

        let docked = dock(&conn, screen_num, tray_size, background, tooltip)?;
        tracing::info!(
            "Docked into the XEmbed tray of window {:#x} (depth {})",
            docked.manager.resource_id(),
            docked.visual.depth
        );

        let event_loop = EventLoop {
            conn: Arc::clone(&conn),
            screen_num,
            window: docked.window,
            manager: docked.manager,
            gc: docked.gc,
            atoms: docked.atoms,
            visual: docked.visual,
            size: Size::new(tray_size as i32, tray_size as i32),
            shared: Arc::clone(&shared),
            dispatcher,
            popup: None,
        };

        let thread = match ThreadBuilder::new()
            .name(THREAD_NAME.into())
            .spawn(move || event_loop.run())
        {
            Ok(thread) => thread,
            Err(why) => {
                conn.send_request(&x::DestroyWindow {
                    window: docked.window,
                });
                let _ = conn.flush();
                return Err(why.into());
            }
        };

        Ok(Self {
            conn,
            window: docked.window,
            gc: docked.gc,
            atoms: docked.atoms,
            shared,
            thread: Some(thread),
        })
    }

    /// Sends a client message of `message_type` to our own window, where the event thread picks
    /// it up
    fn notify(&self, message_type: x::Atom) -> Result<()> {
        let event = x::ClientMessageEvent::new(
            self.window,
            message_type,
            x::ClientMessageData::Data32([0; 5]),
        );
        // With an empty mask the event goes to the client that created the window, us
        self.conn.send_request(&x::SendEvent {
            propagate: false,
            destination: x::SendEventDest::Window(self.window),
            event_mask: x::EventMask::NO_EVENT,
            event: &event,
        });
        self.conn.flush()?;
        Ok(())
    }

    fn stop(mut self) {
        if let Err(why) = self.notify(self.atoms.shutdown) {
            tracing::warn!("Failed to ask the {THREAD_NAME} thread to stop: {why}");
        }

        if let Some(thread) = self.thread.take() {
            // Dropping the last tray handle from a click handler lands us here on that very thread
            if thread.thread().id() != std::thread::current().id() && thread.join().is_err() {
                tracing::error!("The {THREAD_NAME} thread panicked");
            }
        }

        self.conn.send_request(&x::FreeGc { gc: self.gc });
        self.conn.send_request(&x::DestroyWindow {
            window: self.window,
        });
        if let Err(why) = self.conn.flush() {
            tracing::warn!("Failed to destroy the tray icon window: {why:?}");
        }
        tracing::debug!("Tray icon window destroyed");
    }
}

struct Docked {
    window: x::Window,
    manager: x::Window,
    gc: x::Gcontext,
    atoms: Atoms,
    visual: IconVisual,
}

fn selection_name(screen_num: usize) -> String {
    format!("_NET_SYSTEM_TRAY_S{screen_num}")
}

fn screen(conn: &xcb::Connection, screen_num: usize) -> Result<&x::Screen> {
    conn.get_setup()
        .roots()
        .nth(screen_num)
        .ok_or(Error::NoScreen(screen_num))
}

/// Creates the icon window and asks the tray manager of `screen_num` to embed it
fn dock(
    conn: &xcb::Connection,
    screen_num: usize,
    tray_size: u32,
    background: Colour,
    tooltip: &str,
) -> Result<Docked> {
    let screen = screen(conn, screen_num)?;
    let atoms = Atoms::intern_all(conn)?;

    let selection = selection_name(screen_num);
    let cookie = conn.send_request(&x::InternAtom {
        only_if_exists: false,
        name: selection.as_bytes(),
    });
    let selection_atom = conn.wait_for_reply(cookie)?.atom();

    let cookie = conn.send_request(&x::GetSelectionOwner {
        selection: selection_atom,
    });
    let manager = conn.wait_for_reply(cookie)?.owner();
    if manager.is_none() {
        tracing::warn!("Nobody owns {selection}, there's no XEmbed tray to dock into");
        return Err(Error::NoTrayManager(selection));
    }

    let size = tray_size.min(u32::from(u16::MAX)) as u16;
    let event_mask =
        x::EventMask::EXPOSURE | x::EventMask::BUTTON_PRESS | x::EventMask::STRUCTURE_NOTIFY;
    let window: x::Window = conn.generate_id();

    let visual = match argb_visual(conn, screen, manager, &atoms) {
        Some(visual_id) => {
            let colormap: x::Colormap = conn.generate_id();
            conn.send_request(&x::CreateColormap {
                alloc: x::ColormapAlloc::None,
                mid: colormap,
                window: screen.root(),
                visual: visual_id,
            });
            conn.send_request(&x::CreateWindow {
                depth: 32,
                wid: window,
                parent: screen.root(),
                x: 0,
                y: 0,
                width: size,
                height: size,
                border_width: 0,
                class: x::WindowClass::InputOutput,
                visual: visual_id,
                value_list: &[
                    x::Cw::BackPixel(0),
                    x::Cw::BorderPixel(0),
                    x::Cw::EventMask(event_mask),
                    x::Cw::Colormap(colormap),
                ],
            });
            IconVisual {
                depth: 32,
                background: None,
            }
        }
        None => {
            conn.send_request(&x::CreateWindow {
                depth: screen.root_depth(),
                wid: window,
                parent: screen.root(),
                x: 0,
                y: 0,
                width: size,
                height: size,
                border_width: 0,
                class: x::WindowClass::InputOutput,
                visual: screen.root_visual(),
                value_list: &[
                    x::Cw::BackPixel(background.serialise_to_u32() >> 8),
                    x::Cw::EventMask(event_mask),
                ],
            });
            IconVisual {
                depth: screen.root_depth(),
                background: Some(background),
            }
        }
    };

    conn.send_request(&x::ChangeProperty {
        mode: x::PropMode::Replace,
        window,
        property: atoms.xembed_info,
        r#type: atoms.xembed_info,
        data: &[0u32, XEMBED_MAPPED],
    });
    conn.send_request(&x::ChangeProperty {
        mode: x::PropMode::Replace,
        window,
        property: atoms.wm_name,
        r#type: atoms.utf8_string,
        data: tooltip.as_bytes(),
    });

    // So we hear about the manager going away
    conn.send_request(&x::ChangeWindowAttributes {
        window: manager,
        value_list: &[x::Cw::EventMask(x::EventMask::STRUCTURE_NOTIFY)],
    });

    let gc: x::Gcontext = conn.generate_id();
    conn.send_request(&x::CreateGc {
        cid: gc,
        drawable: x::Drawable::Window(window),
        value_list: &[],
    });

    let dock_request = x::ClientMessageEvent::new(
        manager,
        atoms.opcode,
        x::ClientMessageData::Data32([
            x::CURRENT_TIME,
            SYSTEM_TRAY_REQUEST_DOCK,
            window.resource_id(),
            0,
            0,
        ]),
    );
    let cookie = conn.send_request_checked(&x::SendEvent {
        propagate: false,
        destination: x::SendEventDest::Window(manager),
        event_mask: x::EventMask::NO_EVENT,
        event: &dock_request,
    });
    conn.check_request(cookie)
        .map_err(|why| Error::XcbProtocol(format!("{why:?}")))?;

    Ok(Docked {
        window,
        manager,
        gc,
        atoms,
        visual,
    })
}

/// The 32 bit visual the tray manager asks icons to use, if it asks for one
fn argb_visual(
    conn: &xcb::Connection,
    screen: &x::Screen,
    manager: x::Window,
    atoms: &Atoms,
) -> Option<x::Visualid> {
    let cookie = conn.send_request(&x::GetProperty {
        delete: false,
        window: manager,
        property: atoms.tray_visual,
        r#type: x::ATOM_VISUALID,
        long_offset: 0,
        long_length: 1,
    });
    let reply = match conn.wait_for_reply(cookie) {
        Ok(reply) => reply,
        Err(why) => {
            tracing::debug!("Failed to query _NET_SYSTEM_TRAY_VISUAL: {why:?}");
            return None;
        }
    };
    if reply.format() != 32 {
        return None;
    }
    let visual_id = *reply.value::<u32>().first()?;

    screen
        .allowed_depths()
        .filter(|depth| depth.depth() == 32)
        .flat_map(|depth| depth.visuals().iter())
        .any(|visual| visual.visual_id() == visual_id)
        .then_some(visual_id)
}

/// The bounds of the monitor `point` is on, or of the whole screen when RandR can't tell us
pub(super) fn monitor_bounds(conn: &xcb::Connection, screen: &x::Screen, point: Point) -> Rectangle {
    let whole_screen = Rectangle::new(
        0,
        0,
        i32::from(screen.width_in_pixels()),
        i32::from(screen.height_in_pixels()),
    );

    if !conn
        .active_extensions()
        .any(|extension| extension == xcb::Extension::RandR)
    {
        return whole_screen;
    }

    let get_monitors = conn.send_request(&randr::GetMonitors {
        window: screen.root(),
        get_active: true,
    });
    let monitors = match conn.wait_for_reply(get_monitors) {
        Ok(monitors) => monitors,
        Err(why) => {
            tracing::debug!("Failed to get the monitor list: {why:?}");
            return whole_screen;
        }
    };

    monitors
        .monitors()
        .map(|monitor| {
            Rectangle::new(
                i32::from(monitor.x()),
                i32::from(monitor.y()),
                i32::from(monitor.width()),
                i32::from(monitor.height()),
            )
        })
        .find(|bounds| bounds.contains(point))
        .unwrap_or(whole_screen)
}

fn rows_per_request(width: i32) -> usize {
    let stride = width.max(1) as usize * 4;
    (MAX_REQUEST_BYTES / stride).max(1)
}

/// Swaps 32 bit pixels from the little endian layout we draw in to the X server's byte order
fn to_server_order(data: &[u8], msb_first: bool) -> std::borrow::Cow<'_, [u8]> {
    if !msb_first {
        return data.into();
    }

    data.chunks_exact(4)
        .flat_map(|px| [px[3], px[2], px[1], px[0]])
        .collect::<Vec<_>>()
        .into()
}

/// Uploads 32 bits per pixel `data` of `size` to the top left corner of `drawable`
pub(super) fn put_image(
    conn: &xcb::Connection,
    drawable: x::Drawable,
    gc: x::Gcontext,
    size: Size,
    depth: u8,
    data: &[u8],
) -> Result<()> {
    if size.w <= 0 || size.h <= 0 {
        return Ok(());
    }

    let msb_first = conn.get_setup().image_byte_order() == x::ImageOrder::MsbFirst;
    let stride = size.w as usize * 4;
    let rows = rows_per_request(size.w);

    for (idx, chunk) in data.chunks(stride * rows).enumerate() {
        let chunk = to_server_order(chunk, msb_first);
        conn.send_request(&x::PutImage {
            format: x::ImageFormat::ZPixmap,
            drawable,
            gc,
            width: size.w as u16,
            height: (chunk.len() / stride) as u16,
            dst_x: 0,
            dst_y: (idx * rows) as i16,
            left_pad: 0,
            depth,
            data: &chunk,
        });
    }

    conn.flush()?;
    Ok(())
}

/// The icon centred on a `canvas` sized image, as the icon window's pixels
fn compose(icon: &IconImage, canvas: Size, background: Option<Colour>) -> Vec<u8> {
    let (pixels, fill) = match background {
        None => (icon.to_premultiplied_bgra(), [0; 4]),
        Some(background) => (
            icon.to_opaque_bgrx(background),
            [background.blue, background.green, background.red, 0],
        ),
    };

    let (cw, ch) = (canvas.w.max(0), canvas.h.max(0));
    let (iw, ih) = (icon.width as i32, icon.height as i32);
    let (dx, dy) = ((cw - iw) / 2, (ch - ih) / 2);

    let mut out = fill.repeat((cw * ch) as usize);
    for y in 0..ih {
        let cy = y + dy;
        if !(0..ch).contains(&cy) {
            continue;
        }
        for x in 0..iw {
            let cx = x + dx;
            if !(0..cw).contains(&cx) {
                continue;
            }
            let src = ((y * iw + x) * 4) as usize;
            let dst = ((cy * cw + cx) * 4) as usize;
            out[dst..dst + 4].copy_from_slice(&pixels[src..src + 4]);
        }
    }

    out
}

struct EventLoop {
    conn: Arc<xcb::Connection>,
    screen_num: usize,
    window: x::Window,
    manager: x::Window,
    gc: x::Gcontext,
    atoms: Atoms,
    visual: IconVisual,
    size: Size,
    shared: Arc<Mutex<Shared>>,
    dispatcher: Dispatcher,
    popup: Option<Popup>,
}

impl EventLoop {
    fn run(mut self) {
        tracing::debug!("{THREAD_NAME} thread started");

        loop {
            let event = match self.conn.wait_for_event() {
                Ok(event) => event,
                Err(xcb::Error::Protocol(why)) => {
                    tracing::warn!("X protocol error on the tray icon: {why:?}");
                    continue;
                }
                Err(xcb::Error::Connection(why)) => {
                    self.dispatcher.fail(crate::Error::HostGone(format!(
                        "lost the connection to the X server: {why:?}"
                    )));
                    return;
                }
            };

            let xcb::Event::X(event) = event else {
                continue;
            };

            match self.handle(event) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(why) => tracing::error!("Failed to handle tray event: {why}"),
            }
        }

        if let Some(popup) = self.popup.take() {
            popup.close(&self.conn);
        }
        tracing::debug!("{THREAD_NAME} thread stopped");
    }

    fn handle(&mut self, event: x::Event) -> Result<Flow> {
        match event {
            x::Event::Expose(ev) if ev.count() == 0 => {
                if ev.window() == self.window {
                    self.draw_icon()?;
                } else if let Some(popup) = &self.popup {
                    if ev.window() == popup.window() {
                        popup.draw(&self.conn, self.screen()?)?;
                    }
                }
            }
            x::Event::ConfigureNotify(ev) if ev.window() == self.window => {
                let size = Size::new(i32::from(ev.width()), i32::from(ev.height()));
                if size != self.size {
                    tracing::debug!("Tray icon resized to {}x{}", size.w, size.h);
                    self.size = size;
                    self.draw_icon()?;
                }
            }
            x::Event::DestroyNotify(ev) if ev.window() == self.manager => {
                self.dispatcher.fail(crate::Error::HostGone(
                    "the XEmbed tray manager went away".into(),
                ));
                return Ok(Flow::Stop);
            }
            x::Event::ButtonPress(ev) => {
                let position = Point::new(i32::from(ev.event_x()), i32::from(ev.event_y()));
                if let Some(popup) = &mut self.popup {
                    if popup.button_press(ev.event(), position) == Outcome::Close {
                        self.close_popup();
                    }
                } else if ev.event() == self.window && ev.detail() <= 3 {
                    // Buttons 4 and up are scroll wheels
                    self.open_popup(Anchor {
                        pointer: Point::new(i32::from(ev.root_x()), i32::from(ev.root_y())),
                        offset_in_icon: Some(position.y),
                    })?;
                }
            }
            x::Event::ButtonRelease(ev) => {
                let Some(popup) = &mut self.popup else {
                    return Ok(Flow::Continue);
                };
                let position = Point::new(i32::from(ev.event_x()), i32::from(ev.event_y()));
                match popup.button_release(position) {
                    Outcome::Keep => {}
                    Outcome::Close => self.close_popup(),
                    Outcome::Activate(id) => {
                        self.close_popup();
                        self.dispatcher.activate(id);
                    }
                }
            }
            x::Event::MotionNotify(ev) => {
                let position = Point::new(i32::from(ev.event_x()), i32::from(ev.event_y()));
                if let Some(popup) = &mut self.popup {
                    if popup.motion(position) {
                        popup.draw(&self.conn, screen(&self.conn, self.screen_num)?)?;
                    }
                }
            }
            x::Event::LeaveNotify(_) => {
                if let Some(popup) = &mut self.popup {
                    if popup.leave() {
                        popup.draw(&self.conn, screen(&self.conn, self.screen_num)?)?;
                    }
                }
            }
            x::Event::ClientMessage(ev) if ev.window() == self.window => {
                if ev.r#type() == self.atoms.shutdown {
                    return Ok(Flow::Stop);
                }
                if ev.r#type() == self.atoms.menu_changed {
                    if let Some(popup) = self.popup.take() {
                        let anchor = popup.anchor();
                        popup.close(&self.conn);
                        self.open_popup(anchor)?;
                    }
                }
            }
            _ => {}
        }

        Ok(Flow::Continue)
    }

    fn screen(&self) -> Result<&x::Screen> {
        screen(&self.conn, self.screen_num)
    }

    fn draw_icon(&self) -> Result<()> {
        let pixels = {
            let shared = lock(&self.shared);
            compose(&shared.icon, self.size, self.visual.background)
        };

        put_image(
            &self.conn,
            x::Drawable::Window(self.window),
            self.gc,
            self.size,
            self.visual.depth,
            &pixels,
        )
    }

    fn open_popup(&mut self, anchor: Anchor) -> Result<()> {
        let menu = lock(&self.shared).menu.clone();
        let screen = screen(&self.conn, self.screen_num)?;
        self.popup = Popup::open(&self.conn, screen, &menu, anchor)?;
        Ok(())
    }

    fn close_popup(&mut self) {
        if let Some(popup) = self.popup.take() {
            popup.close(&self.conn);
        }
    }
}

/// Whether the event thread keeps going after an event
enum Flow {
    Continue,
    Stop,
}
