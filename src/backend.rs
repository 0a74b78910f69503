use std::path::Path;

use trayshim_data::{settings::TrayConfig, BackendKind};

use crate::{menu::MenuSnapshot, tray::Dispatcher, Error, Result};

#[cfg(target_os = "linux")]
pub(crate) mod indicator;
#[cfg(target_os = "linux")]
pub(crate) mod status_icon;
#[cfg(not(target_os = "linux"))]
pub(crate) mod toolkit;

/// One way of putting an icon into a tray.
///
/// The tray calls these with its own lock held, so they're never called concurrently. Clicks on
/// menu entries are reported through the [`Dispatcher`] the backend was created with.
pub(crate) trait Backend: Send {
    /// Shows the icon, at most once per backend
    fn create(&mut self, icon: &Path, tooltip: &str, menu: &MenuSnapshot) -> Result<()>;

    fn set_icon(&mut self, icon: &Path) -> Result<()>;

    fn set_menu(&mut self, menu: &MenuSnapshot) -> Result<()>;

    /// Takes the icon down and releases everything the backend holds. Must not block on the
    /// callback executor.
    fn remove(&mut self);
}

pub(crate) fn new(kind: BackendKind, dispatcher: Dispatcher, config: &TrayConfig) -> Box<dyn Backend> {
    match kind {
        #[cfg(target_os = "linux")]
        BackendKind::Indicator => Box::new(indicator::Indicator::new(dispatcher, config)),
        #[cfg(target_os = "linux")]
        BackendKind::StatusIcon => Box::new(status_icon::StatusIcon::new(dispatcher, config)),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Toolkit => Box::new(toolkit::Toolkit::new(dispatcher, config)),
        kind => {
            let _ = (dispatcher, config);
            Box::new(Unavailable(kind))
        }
    }
}

/// Stands in for a backend that wasn't compiled for this platform
struct Unavailable(BackendKind);

impl Backend for Unavailable {
    fn create(&mut self, _icon: &Path, _tooltip: &str, _menu: &MenuSnapshot) -> Result<()> {
        Err(Error::BackendUnavailable(self.0))
    }

    fn set_icon(&mut self, _icon: &Path) -> Result<()> {
        Err(Error::BackendUnavailable(self.0))
    }

    fn set_menu(&mut self, _menu: &MenuSnapshot) -> Result<()> {
        Err(Error::BackendUnavailable(self.0))
    }

    fn remove(&mut self) {}
}
