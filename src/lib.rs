//! A small system tray icon with a text menu, on whichever tray the desktop offers.
//!
//! On Linux the icon is exported as a StatusNotifierItem (the AppIndicator protocol) when the
//! desktop shows those, and docked into the XEmbed tray of the panel otherwise. Elsewhere the
//! platform's own tray is used.
//!
//! ```no_run
//! use trayshim::SystemTray;
//!
//! # fn main() -> trayshim::Result<()> {
//! let tray = SystemTray::create("My App")?;
//! tray.add_menu_entry("Quit", |tray| tray.remove_tray())?;
//! tray.create_tray("icons/app.png")?;
//! # Ok(())
//! # }
//! ```

use std::{
    io,
    path::PathBuf,
    sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

mod backend;
mod executor;
mod icon;
pub mod logging;
mod menu;
mod tray;

pub use icon::register_resource;
pub use menu::{EntryId, MenuSnapshot, SnapshotItem};
pub use tray::{FailureCallback, MenuCallback, SystemTray};
pub use trayshim_data::{
    colour::Colour,
    settings::{TrayConfig, DEFAULT_TRAY_SIZE},
    BackendKind,
};

#[cfg(target_os = "linux")]
pub use backend::status_icon::Error as StatusIconError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("None of the tray backends can run on this system")]
    Unsupported,
    #[error("The {0} tray backend can't run on this system")]
    BackendUnavailable(BackendKind),
    #[error("Icon '{0}' is neither a readable file nor a registered resource")]
    IconNotFound(String),
    #[error("Failed to copy icon '{name}' to {path:?}: {source}")]
    IconCopy {
        name: String,
        path: PathBuf,
        source: io::Error,
    },
    #[error("Failed to decode icon {path:?}: {reason}")]
    IconDecode { path: PathBuf, reason: String },
    #[error("The tray icon has not been created yet")]
    NotCreated,
    #[error("The tray icon has already been created")]
    AlreadyCreated,
    #[error("The tray icon has been removed")]
    Removed,
    #[error("A menu entry labelled '{0}' already exists")]
    DuplicateEntry(String),
    #[error("A menu callback panicked: '{0}'")]
    CallbackPanicked(String),
    #[error("The tray host went away: {0}")]
    HostGone(String),
    #[cfg(target_os = "linux")]
    #[error("StatusNotifierItem error: {0}")]
    Indicator(#[from] ksni::Error),
    #[cfg(target_os = "linux")]
    #[error(transparent)]
    StatusIcon(#[from] backend::status_icon::Error),
    #[cfg(not(target_os = "linux"))]
    #[error("Native tray error: {0}")]
    Toolkit(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Applies pending changes to native tray icons, and must be called regularly from the thread
/// running the application's event loop.
///
/// Only Windows and macOS need this, their tray icons can't be touched from any other thread.
/// On Linux it does nothing.
pub fn pump_events() {
    #[cfg(not(target_os = "linux"))]
    backend::toolkit::pump_events();
}

/// Locks `mutex`, carrying on with the data of a poisoned one. Callbacks are user code and a
/// panicking callback must not take the tray down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`lock`], for readers of an [`RwLock`]
pub(crate) fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

/// [`lock`], for writers of an [`RwLock`]
pub(crate) fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn poisoned_locks_stay_usable() {
        let mutex = Arc::new(Mutex::new(1));
        let rwlock = Arc::new(RwLock::new(1));

        let (m, r) = (Arc::clone(&mutex), Arc::clone(&rwlock));
        let poisoner = thread::spawn(move || {
            let _m = m.lock().unwrap();
            let _r = r.write().unwrap();
            panic!("poisoning both locks");
        });
        assert!(poisoner.join().is_err());
        assert!(mutex.is_poisoned());
        assert!(rwlock.is_poisoned());

        *lock(&mutex) += 1;
        *write(&rwlock) += 1;
        assert_eq!(*lock(&mutex), 2);
        assert_eq!(*read(&rwlock), 2);
    }
}
