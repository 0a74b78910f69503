//! Tray icons exported over D-Bus as a [KDE/freedesktop StatusNotifierItem][`kde_sni`], which is
//! what AppIndicator based desktops show. This is done by using the [ksni][`ksni`] crate.
//!
//! [`kde_sni`]: https://www.freedesktop.org/wiki/Specifications/StatusNotifierItem/StatusNotifierItem/
//! [`ksni`]: https://crates.io/crates/ksni

use std::{future::Future, path::Path, sync::mpsc};

use ksni::TrayMethods;
use tokio::runtime::{Builder as RtBuilder, Runtime};
use trayshim_data::settings::TrayConfig;

use super::Backend;
use crate::{icon::IconImage, menu::MenuSnapshot, tray::Dispatcher, Error, Result};

pub(crate) struct Indicator {
    dispatcher: Dispatcher,
    icon_size: u32,
    service: Option<Service>,
}

struct Service {
    runtime: Runtime,
    handle: ksni::Handle<IndicatorTray>,
}

impl Indicator {
    pub fn new(dispatcher: Dispatcher, config: &TrayConfig) -> Self {
        Self {
            dispatcher,
            icon_size: config.tray_size,
            service: None,
        }
    }

    fn load_icon(&self, path: &Path) -> Result<ksni::Icon> {
        let image = IconImage::load(path, self.icon_size)?;

        // We convert the image to ARGB as that's the required format of the image as defined in
        // the SNI spec
        Ok(ksni::Icon {
            width: image.width as i32,
            height: image.height as i32,
            data: image.to_argb32_be(),
        })
    }

    fn update(&self, f: impl FnOnce(&mut IndicatorTray) + Send + 'static) -> Result<()> {
        let Some(service) = &self.service else {
            return Err(Error::NotCreated);
        };

        let handle = service.handle.clone();
        match run_on(&service.runtime, async move { handle.update(f).await }) {
            Some(Some(())) => Ok(()),
            _ => Err(Error::HostGone(
                "the StatusNotifierItem service has shut down".into(),
            )),
        }
    }
}

/// Runs `future` on `runtime` and waits for its output.
///
/// [`Runtime::block_on`] panics when the calling thread is already inside a runtime, which is
/// likely for applications that are async themselves, so this goes through a channel instead.
fn run_on<F>(runtime: &Runtime, future: F) -> Option<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send,
{
    let (tx, rx) = mpsc::sync_channel(1);
    runtime.spawn(async move {
        let _ = tx.send(future.await);
    });
    rx.recv().ok()
}

impl Backend for Indicator {
    fn create(&mut self, icon: &Path, tooltip: &str, menu: &MenuSnapshot) -> Result<()> {
        let tray = IndicatorTray {
            id: sanitise_id(tooltip),
            title: tooltip.to_owned(),
            icon: self.load_icon(icon)?,
            menu: menu.clone(),
            dispatcher: self.dispatcher.clone(),
        };

        // We make the runtime ourselves so we can give its thread a more descriptive name :^)
        let runtime = RtBuilder::new_multi_thread()
            .worker_threads(1)
            .thread_name("systray indicator")
            .enable_all()
            .build()?;

        let handle = match run_on(&runtime, tray.spawn()) {
            Some(Ok(handle)) => handle,
            Some(Err(why)) => {
                tracing::warn!("Failed to run SNI tray service: {why}");
                runtime.shutdown_background();
                return Err(why.into());
            }
            None => {
                runtime.shutdown_background();
                return Err(Error::HostGone(
                    "the StatusNotifierItem service never started".into(),
                ));
            }
        };

        self.service = Some(Service { runtime, handle });
        Ok(())
    }

    fn set_icon(&mut self, icon: &Path) -> Result<()> {
        let icon = self.load_icon(icon)?;
        self.update(move |tray| tray.icon = icon)
    }

    fn set_menu(&mut self, menu: &MenuSnapshot) -> Result<()> {
        let menu = menu.clone();
        self.update(move |tray| tray.menu = menu)
    }

    fn remove(&mut self) {
        let Some(Service { runtime, handle }) = self.service.take() else {
            return;
        };

        // Awaiting the shutdown could deadlock when we're removed from a callback, the service
        // finishes unregistering on its own
        drop(handle.shutdown());
        runtime.shutdown_background();
        tracing::debug!("StatusNotifierItem service stopped");
    }
}

struct IndicatorTray {
    id: String,
    title: String,
    icon: ksni::Icon,
    menu: MenuSnapshot,
    dispatcher: Dispatcher,
}

impl ksni::Tray for IndicatorTray {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn title(&self) -> String {
        self.title.clone()
    }

    fn icon_pixmap(&self) -> Vec<ksni::Icon> {
        vec![self.icon.clone()]
    }

    fn menu(&self) -> Vec<ksni::MenuItem<Self>> {
        use ksni::menu::*;

        self.menu
            .items
            .iter()
            .map(|item| {
                let id = item.id;
                StandardItem {
                    label: escape_mnemonics(&item.label),
                    enabled: item.enabled,
                    activate: Box::new(move |tray: &mut Self| tray.dispatcher.activate(id)),
                    ..Default::default()
                }
                .into()
            })
            .collect()
    }

    fn tool_tip(&self) -> ksni::ToolTip {
        ksni::ToolTip {
            icon_name: String::new(),
            icon_pixmap: vec![],
            title: self.title.clone(),
            description: String::new(),
        }
    }

    fn watcher_offline(&self, reason: ksni::OfflineReason) -> bool {
        let why = match reason {
            ksni::OfflineReason::No => {
                "StatusNotifierWatcher went offline without a reason or error".to_string()
            }
            ksni::OfflineReason::Error(err) => err.to_string(),
            _ => "StatusNotifierWatcher went offline for an unknown reason".to_string(),
        };

        tracing::info!("Watcher went offline: {why}");
        self.dispatcher.fail(Error::HostGone(why));

        // Keep the service around, the watcher may come back
        true
    }
}

/// dbusmenu treats `_` as the marker of an access key, it has to be doubled to show up in a label
fn escape_mnemonics(label: &str) -> String {
    label.replace('_', "__")
}

/// Item ids are meant to be stable, unique and boring: `My App!` becomes `my-app`.
fn sanitise_id(app_name: &str) -> String {
    let mut id = String::with_capacity(app_name.len());
    for c in app_name.chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c.to_ascii_lowercase());
        } else if !id.is_empty() && !id.ends_with('-') {
            id.push('-');
        }
    }

    while id.ends_with('-') {
        id.pop();
    }

    if id.is_empty() {
        id.push_str("trayshim");
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sanitised() {
        assert_eq!(sanitise_id("My App!"), "my-app");
        assert_eq!(sanitise_id("  spaced   out  "), "spaced-out");
        assert_eq!(sanitise_id("syncthing-tray"), "syncthing-tray");
        assert_eq!(sanitise_id("日本語"), "trayshim");
    }

    #[test]
    fn underscores_are_not_access_keys() {
        assert_eq!(escape_mnemonics("Open_file"), "Open__file");
        assert_eq!(escape_mnemonics("Plain"), "Plain");
    }

    #[test]
    fn futures_run_on_the_service_runtime() {
        let runtime = RtBuilder::new_multi_thread()
            .worker_threads(1)
            .thread_name("systray indicator")
            .build()
            .unwrap();

        let thread = run_on(&runtime, async {
            std::thread::current().name().map(ToOwned::to_owned)
        });
        assert_eq!(thread, Some(Some("systray indicator".to_owned())));

        // Also from inside another runtime, where block_on would panic
        let outer = RtBuilder::new_current_thread().build().unwrap();
        let answer = outer.block_on(async { run_on(&runtime, async { 42 }) });
        assert_eq!(answer, Some(42));
    }
}
