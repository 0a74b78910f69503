use std::{fmt, str::FromStr};

pub mod colour;
pub mod geometry;
pub mod placement;
pub mod settings;

/// The native presentation layer a tray is shown through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// AppIndicator / KDE StatusNotifierItem, exported over D-Bus.
    Indicator,
    /// The legacy freedesktop XEmbed system tray, as used by the old GTK status icon.
    StatusIcon,
    /// The tray offered by the desktop toolkit of Windows and macOS.
    Toolkit,
}

impl BackendKind {
    pub const ALL: [Self; 3] = [Self::Indicator, Self::StatusIcon, Self::Toolkit];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Indicator => "indicator",
            Self::StatusIcon => "status-icon",
            Self::Toolkit => "toolkit",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("'{0}' does not name a tray backend (expected one of: indicator, status-icon, toolkit)")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "indicator" | "appindicator" | "sni" => Ok(Self::Indicator),
            "status-icon" | "statusicon" | "gtk" | "xembed" => Ok(Self::StatusIcon),
            "toolkit" | "native" => Ok(Self::Toolkit),
            _ => Err(UnknownBackend(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_aliases() {
        assert_eq!("sni".parse(), Ok(BackendKind::Indicator));
        assert_eq!("AppIndicator".parse(), Ok(BackendKind::Indicator));
        assert_eq!(" gtk ".parse(), Ok(BackendKind::StatusIcon));
        assert_eq!("xembed".parse(), Ok(BackendKind::StatusIcon));
        assert_eq!("native".parse(), Ok(BackendKind::Toolkit));
        assert!("swing".parse::<BackendKind>().is_err());

        for kind in BackendKind::ALL {
            assert_eq!(kind.name().parse(), Ok(kind));
        }
    }
}
