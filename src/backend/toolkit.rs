//! Tray icons owned by the platform's own desktop toolkit (Windows and macOS), through the
//! [tray-icon][`tray_icon`] crate.
//!
//! The native objects may only be touched from the thread that runs the application's event
//! loop, so the backend only queues commands. [`pump_events`] applies them on that thread.
//!
//! [`tray_icon`]: https://crates.io/crates/tray-icon

use std::{
    cell::RefCell,
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, Once,
    },
};

use once_cell::sync::Lazy;
use tray_icon::{
    menu::{Menu, MenuEvent, MenuId, MenuItem},
    Icon, TrayIcon, TrayIconBuilder,
};
use trayshim_data::settings::TrayConfig;

use super::Backend;
use crate::{
    icon::IconImage,
    lock,
    menu::{EntryId, MenuSnapshot},
    tray::Dispatcher,
    Error, Result,
};

const MENU_ID_PREFIX: &str = "trayshim";

static NEXT_TRAY_ID: AtomicU64 = AtomicU64::new(0);

/// Commands waiting for the next [`pump_events`]
static PENDING: Lazy<Mutex<Vec<Command>>> = Lazy::new(Default::default);

/// Where clicks on the entries of each tray go
static ROUTES: Lazy<Mutex<HashMap<u64, Dispatcher>>> = Lazy::new(Default::default);

thread_local! {
    static HOSTS: RefCell<HashMap<u64, Host>> = RefCell::new(HashMap::new());
}

struct Host {
    icon: TrayIcon,
    dispatcher: Dispatcher,
}

enum Command {
    Create {
        tray: u64,
        icon: IconImage,
        tooltip: String,
        menu: MenuSnapshot,
        dispatcher: Dispatcher,
    },
    SetIcon {
        tray: u64,
        icon: IconImage,
    },
    SetMenu {
        tray: u64,
        menu: MenuSnapshot,
    },
    Remove {
        tray: u64,
    },
}

fn queue(command: Command) {
    lock(&PENDING).push(command);
}

pub(crate) struct Toolkit {
    id: u64,
    dispatcher: Dispatcher,
    icon_size: u32,
    created: bool,
}

impl Toolkit {
    pub fn new(dispatcher: Dispatcher, config: &TrayConfig) -> Self {
        Self {
            id: NEXT_TRAY_ID.fetch_add(1, Ordering::Relaxed),
            dispatcher,
            icon_size: config.tray_size,
            created: false,
        }
    }
}

impl Backend for Toolkit {
    fn create(&mut self, icon: &Path, tooltip: &str, menu: &MenuSnapshot) -> Result<()> {
        let icon = IconImage::load(icon, self.icon_size)?;
        install_menu_event_handler();
        lock(&ROUTES).insert(self.id, self.dispatcher.clone());

        queue(Command::Create {
            tray: self.id,
            icon,
            tooltip: tooltip.to_owned(),
            menu: menu.clone(),
            dispatcher: self.dispatcher.clone(),
        });
        self.created = true;
        Ok(())
    }

    fn set_icon(&mut self, icon: &Path) -> Result<()> {
        let icon = IconImage::load(icon, self.icon_size)?;
        queue(Command::SetIcon { tray: self.id, icon });
        Ok(())
    }

    fn set_menu(&mut self, menu: &MenuSnapshot) -> Result<()> {
        queue(Command::SetMenu {
            tray: self.id,
            menu: menu.clone(),
        });
        Ok(())
    }

    fn remove(&mut self) {
        if !self.created {
            return;
        }

        lock(&ROUTES).remove(&self.id);
        queue(Command::Remove { tray: self.id });
        self.created = false;
    }
}

/// Applies every queued command. Must be called from the thread running the event loop.
pub(crate) fn pump_events() {
    let commands = std::mem::take(&mut *lock(&PENDING));
    if commands.is_empty() {
        return;
    }

    HOSTS.with(|hosts| {
        let mut hosts = hosts.borrow_mut();
        for command in commands {
            apply(&mut hosts, command);
        }
    });
}

fn apply(hosts: &mut HashMap<u64, Host>, command: Command) {
    match command {
        Command::Create {
            tray,
            icon,
            tooltip,
            menu,
            dispatcher,
        } => {
            let built = native_icon(icon).and_then(|icon| {
                TrayIconBuilder::new()
                    .with_menu(Box::new(native_menu(tray, &menu)))
                    .with_tooltip(tooltip)
                    .with_icon(icon)
                    .build()
                    .map_err(|why| Error::Toolkit(why.to_string()))
            });

            match built {
                Ok(icon) => {
                    hosts.insert(tray, Host { icon, dispatcher });
                }
                Err(why) => {
                    tracing::error!("Failed to create native tray icon: {why}");
                    dispatcher.fail(why);
                }
            }
        }
        Command::SetIcon { tray, icon } => {
            let Some(host) = hosts.get(&tray) else {
                return;
            };
            let result = native_icon(icon).and_then(|icon| {
                host.icon
                    .set_icon(Some(icon))
                    .map_err(|why| Error::Toolkit(why.to_string()))
            });
            if let Err(why) = result {
                tracing::error!("Failed to change native tray icon: {why}");
                host.dispatcher.fail(why);
            }
        }
        Command::SetMenu { tray, menu } => {
            if let Some(host) = hosts.get(&tray) {
                host.icon.set_menu(Some(Box::new(native_menu(tray, &menu))));
            }
        }
        Command::Remove { tray } => {
            // Dropping the native icon takes it out of the tray
            if hosts.remove(&tray).is_some() {
                tracing::debug!("Native tray icon {tray} removed");
            }
        }
    }
}

fn native_icon(icon: IconImage) -> Result<Icon> {
    Icon::from_rgba(icon.rgba, icon.width, icon.height)
        .map_err(|why| Error::Toolkit(why.to_string()))
}

fn native_menu(tray: u64, menu: &MenuSnapshot) -> Menu {
    let native = Menu::new();
    for item in &menu.items {
        let entry = MenuItem::with_id(menu_id(tray, item.id), &item.label, item.enabled, None);
        if let Err(why) = native.append(&entry) {
            tracing::warn!("Failed to add '{}' to the native menu: {why}", item.label);
        }
    }
    native
}

fn menu_id(tray: u64, entry: EntryId) -> MenuId {
    MenuId::new(format!("{MENU_ID_PREFIX}-{tray}-{}", entry.raw()))
}

fn parse_menu_id(id: &str) -> Option<(u64, EntryId)> {
    let rest = id.strip_prefix(MENU_ID_PREFIX)?.strip_prefix('-')?;
    let (tray, entry) = rest.split_once('-')?;
    Some((tray.parse().ok()?, EntryId::from_raw(entry.parse().ok()?)))
}

fn install_menu_event_handler() {
    static INSTALLED: Once = Once::new();

    INSTALLED.call_once(|| {
        MenuEvent::set_event_handler(Some(|event: MenuEvent| {
            let Some((tray, entry)) = parse_menu_id(&event.id.0) else {
                return;
            };
            let dispatcher = lock(&ROUTES).get(&tray).cloned();
            if let Some(dispatcher) = dispatcher {
                dispatcher.activate(entry);
            }
        }));
    });
}
