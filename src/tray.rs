use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};

use trayshim_data::{settings::TrayConfig, BackendKind};
use trayshim_probe::Environment;

use crate::{
    backend::{self, Backend},
    executor::CallbackExecutor,
    icon::IconResolver,
    lock,
    logging::panic_message,
    menu::{Change, EntryId, MenuModel},
    read, write, Error, Result,
};

/// What runs when a menu entry is clicked. It runs on the tray's callback thread and gets the
/// tray the entry belongs to.
pub type MenuCallback = Arc<dyn Fn(&SystemTray) + Send + Sync + 'static>;

/// What runs when the tray breaks after it was created.
pub type FailureCallback = Arc<dyn Fn(&SystemTray, &Error) + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    NotCreated,
    Active,
    Removed,
}

struct BackendSlot {
    lifecycle: Lifecycle,
    backend: Box<dyn Backend>,
}

struct Inner {
    app_name: String,
    kind: BackendKind,
    active: AtomicBool,
    /// Lock order: `slot` before `menu`, never the other way around
    slot: Mutex<BackendSlot>,
    menu: Mutex<MenuModel<MenuCallback>>,
    icons: IconResolver,
    executor: CallbackExecutor,
    failure_callback: RwLock<Option<FailureCallback>>,
}

/// An icon in the system tray with a popup menu.
///
/// This is a cheap handle, clones refer to the same icon. The icon goes away when
/// [`Self::remove_tray`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct SystemTray {
    inner: Arc<Inner>,
}

impl fmt::Debug for SystemTray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemTray")
            .field("app_name", &self.inner.app_name)
            .field("backend", &self.inner.kind)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl SystemTray {
    /// Creates a tray for `app_name` using the backend that suits the current desktop best.
    ///
    /// Configuration comes from the `TRAYSHIM_*` environment variables, see [`TrayConfig::from_env`].
    pub fn create(app_name: impl Into<String>) -> Result<Self> {
        Self::with_config(app_name, TrayConfig::from_env())
    }

    pub fn with_config(app_name: impl Into<String>, config: TrayConfig) -> Result<Self> {
        let kind = select_backend(Environment::detected(), &config)?;
        let icons = IconResolver::new(config.icon_dir.clone());

        Self::with_backend(app_name.into(), kind, icons, |dispatcher| {
            backend::new(kind, dispatcher, &config)
        })
    }

    fn with_backend(
        app_name: String,
        kind: BackendKind,
        icons: IconResolver,
        make_backend: impl FnOnce(Dispatcher) -> Box<dyn Backend>,
    ) -> Result<Self> {
        let executor = CallbackExecutor::spawn()?;
        tracing::info!("Using the {kind} tray backend for {app_name}");

        let inner = Arc::new_cyclic(|weak| Inner {
            app_name,
            kind,
            active: AtomicBool::new(false),
            slot: Mutex::new(BackendSlot {
                lifecycle: Lifecycle::NotCreated,
                backend: make_backend(Dispatcher {
                    tray: Weak::clone(weak),
                }),
            }),
            menu: Mutex::new(MenuModel::default()),
            icons,
            executor,
            failure_callback: RwLock::new(None),
        });

        Ok(Self { inner })
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    pub fn backend(&self) -> BackendKind {
        self.inner.kind
    }

    /// Whether the icon is currently shown in the tray
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Shows the icon called `icon_name` in the tray, with the application name as tooltip.
    ///
    /// Menu entries added beforehand show up right away.
    pub fn create_tray(&self, icon_name: &str) -> Result<()> {
        let mut slot = lock(&self.inner.slot);
        match slot.lifecycle {
            Lifecycle::NotCreated => {}
            Lifecycle::Active => return Err(Error::AlreadyCreated),
            Lifecycle::Removed => return Err(Error::Removed),
        }

        let icon = self.inner.icons.resolve(icon_name)?;
        let menu = lock(&self.inner.menu).snapshot();

        slot.backend.create(&icon, &self.inner.app_name, &menu)?;
        slot.lifecycle = Lifecycle::Active;
        self.inner.active.store(true, Ordering::Release);

        tracing::debug!("Tray for {} created with icon {}", self.inner.app_name, icon.display());
        Ok(())
    }

    /// Takes the icon out of the tray for good.
    ///
    /// Menu entries are forgotten and no more callbacks get scheduled, though the ones that were
    /// already scheduled still run. Calling this more than once does nothing.
    pub fn remove_tray(&self) {
        self.inner.remove();
    }

    /// Shows `info` as a greyed out line in the menu, and swaps the tray icon for `icon_name`.
    pub fn set_status(&self, info: &str, icon_name: &str) -> Result<()> {
        let mut slot = lock(&self.inner.slot);
        match slot.lifecycle {
            Lifecycle::NotCreated => return Err(Error::NotCreated),
            Lifecycle::Removed => return Err(Error::Removed),
            Lifecycle::Active => {}
        }

        let icon = self.inner.icons.resolve(icon_name)?;

        let menu = {
            let mut menu = lock(&self.inner.menu);
            menu.set_status(info);
            menu.snapshot()
        };
        slot.backend.set_menu(&menu)?;
        slot.backend.set_icon(&icon)
    }

    /// Adds an entry labelled `text` to the end of the menu. If there already is an entry labelled
    /// `text`, its callback gets replaced instead.
    pub fn add_menu_entry<F>(&self, text: &str, callback: F) -> Result<()>
    where
        F: Fn(&SystemTray) + Send + Sync + 'static,
    {
        self.change_menu(|menu| Ok(menu.add_entry(text, Arc::new(callback))))
    }

    /// Relabels the entry labelled `orig_text` to `new_text` and replaces its callback. If there
    /// is no entry labelled `orig_text`, one gets added with `callback`, still labelled
    /// `orig_text`.
    pub fn update_menu_entry<F>(&self, orig_text: &str, new_text: &str, callback: F) -> Result<()>
    where
        F: Fn(&SystemTray) + Send + Sync + 'static,
    {
        self.change_menu(|menu| {
            menu.update_entry(orig_text, new_text, Arc::new(callback))
                .map_err(|dup| Error::DuplicateEntry(dup.0))
        })
    }

    fn change_menu(
        &self,
        f: impl FnOnce(&mut MenuModel<MenuCallback>) -> Result<Change>,
    ) -> Result<()> {
        let mut slot = lock(&self.inner.slot);
        if slot.lifecycle == Lifecycle::Removed {
            return Err(Error::Removed);
        }

        let (change, menu) = {
            let mut menu = lock(&self.inner.menu);
            let change = f(&mut *menu)?;
            (change, menu.snapshot())
        };
        tracing::debug!("Menu of {} changed: {change:?}", self.inner.app_name);

        if slot.lifecycle == Lifecycle::Active {
            slot.backend.set_menu(&menu)?;
        }

        Ok(())
    }

    /// Installs the callback that gets told when the tray breaks after it was created: the tray
    /// host went away, or a menu callback panicked.
    pub fn set_failure_callback<F>(&self, callback: F)
    where
        F: Fn(&SystemTray, &Error) + Send + Sync + 'static,
    {
        *write(&self.inner.failure_callback) = Some(Arc::new(callback));
    }
}

impl Inner {
    fn remove(&self) {
        {
            let mut slot = lock(&self.slot);
            if slot.lifecycle == Lifecycle::Active {
                slot.backend.remove();
            }
            if slot.lifecycle != Lifecycle::Removed {
                tracing::debug!("Removing tray for {}", self.app_name);
            }
            slot.lifecycle = Lifecycle::Removed;
            self.active.store(false, Ordering::Release);
        }

        lock(&self.menu).clear();
        self.icons.cleanup();
        self.executor.shutdown();
    }

    fn failure_callback(&self) -> Option<FailureCallback> {
        read(&self.failure_callback).clone()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.remove();
    }
}

/// How backends hand events back to the tray they belong to.
///
/// It only holds a weak reference, backends are owned by the tray and must not keep it alive.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    tray: Weak<Inner>,
}

impl Dispatcher {
    /// The menu entry `id` was clicked, schedule its callback
    pub fn activate(&self, id: EntryId) {
        let Some(inner) = self.tray.upgrade() else {
            return;
        };

        let Some(callback) = lock(&inner.menu).callback(id) else {
            tracing::debug!("Ignoring click on {id}, it has no callback (anymore)");
            return;
        };

        let tray = SystemTray {
            inner: Arc::clone(&inner),
        };
        inner.executor.execute(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(&tray)));
            if let Err(payload) = result {
                let message = panic_message(payload.as_ref()).to_owned();
                tracing::error!("Menu callback of {} panicked: '{message}'", tray.app_name());
                report(&tray, &Error::CallbackPanicked(message));
            }
        }));
    }

    /// The tray broke in a way the application should hear about
    pub fn fail(&self, error: Error) {
        let Some(inner) = self.tray.upgrade() else {
            return;
        };

        tracing::error!("The tray of {} failed: {error}", inner.app_name);

        let tray = SystemTray {
            inner: Arc::clone(&inner),
        };
        inner
            .executor
            .execute(Box::new(move || report(&tray, &error)));
    }
}

/// The backend `config` asks for, or else the one that suits `environment` best
fn select_backend(environment: &Environment, config: &TrayConfig) -> Result<BackendKind> {
    match config.backend {
        Some(kind) if environment.supports(kind) => Ok(kind),
        Some(kind) => {
            tracing::error!("The {kind} tray backend can't run on this system");
            Err(Error::BackendUnavailable(kind))
        }
        None => environment.select().ok_or_else(|| {
            tracing::error!("Unsupported tray type!");
            Error::Unsupported
        }),
    }
}

fn report(tray: &SystemTray, error: &Error) {
    if let Some(callback) = tray.inner.failure_callback() {
        callback(tray, error);
    }
}
