use std::{
    env, fs,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    sync::OnceLock,
};

pub use trayshim_data::BackendKind;

/// The first line of `/proc/<pid>/status` is `Name:\t<comm>`, and comm gets truncated to 15
/// bytes, so `indicator-application-service` shows up as `indicator-appli`.
const INDICATOR_SERVICE_NAME: &str = "indicator-app";

/// Desktops that are known to only ever show app indicators
const INDICATOR_ONLY_DESKTOPS: &[&str] = &["Unity"];

/// What we know about the desktop we're running in, as far as choosing a tray backend goes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Environment {
    /// Contents of `XDG_CURRENT_DESKTOP`
    pub current_desktop: Option<String>,
    /// Root of the process table, normally `/proc`
    pub proc_root: PathBuf,
    pub x11_available: bool,
    pub wayland_display: bool,
    pub is_linux: bool,
    /// Whether the platform has a tray that's part of its desktop toolkit (Windows, macOS)
    pub toolkit_supported: bool,
}

impl Environment {
    /// Looks at the environment of the current process.
    ///
    /// This connects to the X server to find out whether one is there, prefer [`Self::detected`]
    /// which only does that once.
    pub fn detect() -> Self {
        let is_linux = cfg!(target_os = "linux");

        Self {
            current_desktop: env::var("XDG_CURRENT_DESKTOP")
                .ok()
                .filter(|desktop| !desktop.is_empty()),
            proc_root: PathBuf::from("/proc"),
            x11_available: is_linux && x11_available(),
            wayland_display: env::var_os("WAYLAND_DISPLAY").is_some_and(|display| !display.is_empty()),
            is_linux,
            toolkit_supported: cfg!(any(target_os = "windows", target_os = "macos")),
        }
    }

    /// The environment of the current process. It is detected on first use and cached afterwards.
    pub fn detected() -> &'static Self {
        static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

        ENVIRONMENT.get_or_init(|| {
            let environment = Self::detect();
            tracing::debug!("Detected desktop environment: {environment:?}");
            environment
        })
    }

    fn has_graphical_session(&self) -> bool {
        self.x11_available || self.wayland_display
    }

    /// Whether the desktop is one that only supports app indicators
    pub fn is_indicator_only_desktop(&self) -> bool {
        self.current_desktop.as_deref().is_some_and(|desktop| {
            desktop
                .split(':')
                .any(|name| INDICATOR_ONLY_DESKTOPS.contains(&name))
        })
    }

    /// Picks the backend that works best in this environment, if any works at all.
    pub fn select(&self) -> Option<BackendKind> {
        if self.is_linux && self.has_graphical_session() {
            if self.is_indicator_only_desktop() {
                return Some(BackendKind::Indicator);
            }

            if indicator_service_running(&self.proc_root) {
                return Some(BackendKind::Indicator);
            }

            if self.x11_available {
                return Some(BackendKind::StatusIcon);
            }

            // A Wayland session without X has no XEmbed trays, our only chance is that the
            // compositor's panel hosts StatusNotifierItems
            return Some(BackendKind::Indicator);
        }

        if self.toolkit_supported {
            return Some(BackendKind::Toolkit);
        }

        None
    }

    /// Whether `kind` is able to run here at all
    pub fn supports(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Indicator => self.is_linux,
            BackendKind::StatusIcon => self.is_linux && self.x11_available,
            BackendKind::Toolkit => self.toolkit_supported,
        }
    }
}

/// Scans the process table under `proc_root` for a running `indicator-application-service`.
///
/// This is the only reliable way of finding out whether the desktop shows app indicators. Any
/// error while scanning is treated as the service not running.
pub fn indicator_service_running(proc_root: &Path) -> bool {
    match scan_for_process(proc_root, INDICATOR_SERVICE_NAME) {
        Ok(found) => found,
        Err(why) => {
            tracing::debug!(
                "Failed to scan {} for {INDICATOR_SERVICE_NAME}: {why}",
                proc_root.display()
            );
            false
        }
    }
}

fn scan_for_process(proc_root: &Path, name: &str) -> io::Result<bool> {
    for entry in fs::read_dir(proc_root)? {
        let entry = entry?;
        let is_pid = entry
            .file_name()
            .to_str()
            .and_then(|file_name| file_name.chars().next())
            .is_some_and(|c| c.is_ascii_digit());
        if !is_pid {
            continue;
        }

        // Processes can exit while we're scanning, and some belong to users we can't look at
        let Ok(status) = fs::File::open(entry.path().join("status")) else {
            continue;
        };

        let mut first_line = String::new();
        if BufReader::new(status).read_line(&mut first_line).is_err() {
            continue;
        }

        if first_line.contains(name) {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(target_os = "linux")]
fn x11_available() -> bool {
    match xcb::Connection::connect(None) {
        Ok(_) => true,
        Err(why) => {
            tracing::debug!("No X server available: {why:?}");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn x11_available() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn fake_proc(processes: &[(&str, &str)]) -> TempDir {
        let root = tempfile::tempdir().unwrap();
        for (pid, name) in processes {
            let dir = root.path().join(pid);
            fs::create_dir(&dir).unwrap();
            fs::write(
                dir.join("status"),
                format!("Name:\t{name}\nUmask:\t0022\nState:\tS (sleeping)\n"),
            )
            .unwrap();
        }
        root
    }

    fn linux(proc_root: &Path) -> Environment {
        Environment {
            current_desktop: None,
            proc_root: proc_root.to_owned(),
            x11_available: true,
            wayland_display: false,
            is_linux: true,
            toolkit_supported: false,
        }
    }

    #[test]
    fn finds_indicator_service() {
        let proc = fake_proc(&[("1", "systemd"), ("1734", "indicator-appli"), ("2001", "bash")]);
        assert!(indicator_service_running(proc.path()));
    }

    #[test]
    fn ignores_non_pid_entries() {
        let proc = fake_proc(&[("1", "systemd"), ("self", "indicator-appli")]);
        fs::create_dir(proc.path().join("42")).unwrap();
        fs::write(proc.path().join("cpuinfo"), "indicator-app").unwrap();

        assert!(!indicator_service_running(proc.path()));
    }

    #[test]
    fn only_the_first_line_counts() {
        let proc = fake_proc(&[("7", "bash")]);
        fs::write(
            proc.path().join("7/status"),
            "Name:\tbash\nCmdline:\tindicator-app\n",
        )
        .unwrap();

        assert!(!indicator_service_running(proc.path()));
    }

    #[test]
    fn missing_proc_is_not_fatal() {
        assert!(!indicator_service_running(Path::new(
            "/this/path/does/not/exist"
        )));
    }

    #[test]
    fn unity_uses_indicators() {
        let proc = fake_proc(&[]);
        let mut environment = linux(proc.path());

        environment.current_desktop = Some("Unity".into());
        assert_eq!(environment.select(), Some(BackendKind::Indicator));

        environment.current_desktop = Some("Unity:Unity7:ubuntu".into());
        assert_eq!(environment.select(), Some(BackendKind::Indicator));

        environment.current_desktop = Some("UnityLike".into());
        assert_eq!(environment.select(), Some(BackendKind::StatusIcon));
    }

    #[test]
    fn running_service_uses_indicators() {
        let proc = fake_proc(&[("900", "indicator-appli")]);
        let mut environment = linux(proc.path());
        environment.current_desktop = Some("XFCE".into());

        assert_eq!(environment.select(), Some(BackendKind::Indicator));
    }

    #[test]
    fn plain_x11_uses_status_icon() {
        let proc = fake_proc(&[("1", "init")]);
        assert_eq!(
            linux(proc.path()).select(),
            Some(BackendKind::StatusIcon)
        );
    }

    #[test]
    fn wayland_without_x_uses_indicators() {
        let proc = fake_proc(&[]);
        let environment = Environment {
            x11_available: false,
            wayland_display: true,
            ..linux(proc.path())
        };

        assert_eq!(environment.select(), Some(BackendKind::Indicator));
        assert!(!environment.supports(BackendKind::StatusIcon));
    }

    #[test]
    fn headless_is_unsupported() {
        let proc = fake_proc(&[("900", "indicator-appli")]);
        let environment = Environment {
            x11_available: false,
            ..linux(proc.path())
        };

        assert_eq!(environment.select(), None);
    }

    #[test]
    fn toolkit_elsewhere() {
        let environment = Environment {
            current_desktop: None,
            proc_root: PathBuf::from("/proc"),
            x11_available: false,
            wayland_display: false,
            is_linux: false,
            toolkit_supported: true,
        };

        assert_eq!(environment.select(), Some(BackendKind::Toolkit));
        assert!(environment.supports(BackendKind::Toolkit));
        assert!(!environment.supports(BackendKind::Indicator));
    }
}
