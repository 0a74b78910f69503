use std::{env, path::PathBuf, str::FromStr};

use crate::{colour::Colour, BackendKind};

/// Size of the icon when it's shown in the tray
pub const DEFAULT_TRAY_SIZE: u32 = 22;

/// What icons get composited over when the tray host can't give us a visual with an alpha channel
pub const DEFAULT_BACKGROUND: Colour = Colour::opaque(0x3c, 0x3c, 0x3c);

pub const TRAY_SIZE_VAR: &str = "TRAYSHIM_TRAY_SIZE";
pub const ICON_PATH_VAR: &str = "TRAYSHIM_ICON_PATH";
pub const BACKEND_VAR: &str = "TRAYSHIM_BACKEND";
pub const BACKGROUND_VAR: &str = "TRAYSHIM_BACKGROUND";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrayConfig {
    /// Edge length, in pixels, icons are scaled to before being handed to the tray
    pub tray_size: u32,
    /// Directory icon names are resolved against. `None` resolves them against the working
    /// directory and the embedded resources as they are.
    pub icon_dir: Option<PathBuf>,
    /// Skips probing the desktop and uses this backend
    pub backend: Option<BackendKind>,
    pub background: Colour,
}

impl Default for TrayConfig {
    fn default() -> Self {
        Self {
            tray_size: DEFAULT_TRAY_SIZE,
            icon_dir: None,
            backend: None,
            background: DEFAULT_BACKGROUND,
        }
    }
}

impl TrayConfig {
    /// The defaults, overridden by whatever `TRAYSHIM_*` environment variables are set.
    pub fn from_env() -> Self {
        Self::default().overridden_by(|var| env::var(var).ok())
    }

    /// Applies the overrides `lookup` knows about on top of `self`. Values that don't parse are
    /// logged and skipped.
    #[must_use]
    pub fn overridden_by(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(size) = parse_var::<u32>(&lookup, TRAY_SIZE_VAR) {
            if size == 0 {
                tracing::warn!("Ignoring {TRAY_SIZE_VAR}=0, icons need at least one pixel");
            } else {
                self.tray_size = size;
            }
        }

        if let Some(dir) = lookup(ICON_PATH_VAR).filter(|dir| !dir.is_empty()) {
            self.icon_dir = Some(dir.into());
        }

        if let Some(backend) = parse_var(&lookup, BACKEND_VAR) {
            self.backend = Some(backend);
        }

        if let Some(background) = parse_var(&lookup, BACKGROUND_VAR) {
            self.background = background;
        }

        self
    }

    #[must_use]
    pub fn with_tray_size(mut self, tray_size: u32) -> Self {
        self.tray_size = tray_size.max(1);
        self
    }

    #[must_use]
    pub fn with_icon_dir(mut self, icon_dir: impl Into<PathBuf>) -> Self {
        self.icon_dir = Some(icon_dir.into());
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    #[must_use]
    pub fn with_background(mut self, background: Colour) -> Self {
        self.background = background;
        self
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(var)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(why) => {
            tracing::warn!("Ignoring {var}={raw:?}: {why}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |var: &str| vars.get(var).cloned()
    }

    #[test]
    fn no_overrides() {
        let config = TrayConfig::default().overridden_by(lookup(&[]));
        assert_eq!(config, TrayConfig::default());
        assert_eq!(config.tray_size, 22);
    }

    #[test]
    fn all_overrides() {
        let config = TrayConfig::default().overridden_by(lookup(&[
            (TRAY_SIZE_VAR, "32"),
            (ICON_PATH_VAR, "/usr/share/app/icons"),
            (BACKEND_VAR, "xembed"),
            (BACKGROUND_VAR, "#000000"),
        ]));

        assert_eq!(config.tray_size, 32);
        assert_eq!(config.icon_dir, Some(PathBuf::from("/usr/share/app/icons")));
        assert_eq!(config.backend, Some(BackendKind::StatusIcon));
        assert_eq!(config.background, Colour::BLACK);
    }

    #[test]
    fn bad_overrides_are_ignored() {
        let config = TrayConfig::default().overridden_by(lookup(&[
            (TRAY_SIZE_VAR, "huge"),
            (ICON_PATH_VAR, ""),
            (BACKEND_VAR, "swing"),
            (BACKGROUND_VAR, "grey"),
        ]));
        assert_eq!(config, TrayConfig::default());

        let config = TrayConfig::default().overridden_by(lookup(&[(TRAY_SIZE_VAR, "0")]));
        assert_eq!(config.tray_size, DEFAULT_TRAY_SIZE);
    }
}
