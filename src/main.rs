use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        mpsc,
    },
    time::Duration,
};

use trayshim::SystemTray;

const IDLE_ICON: &str = "trayshim-demo/tray.png";
const BUSY_ICON: &str = "trayshim-demo/tray-busy.png";

fn main() {
    trayshim::logging::init();

    trayshim::register_resource(IDLE_ICON, include_bytes!("../resources/tray.png"));
    trayshim::register_resource(BUSY_ICON, include_bytes!("../resources/tray-busy.png"));

    let tray = match SystemTray::create("trayshim demo") {
        Ok(tray) => tray,
        Err(why) => {
            tracing::error!("Failed to set up a tray icon: {why}");
            std::process::exit(1);
        }
    };

    if let Err(why) = run(&tray) {
        tracing::error!("The tray demo failed: {why}");
        tray.remove_tray();
        std::process::exit(1);
    }
}

fn run(tray: &SystemTray) -> trayshim::Result<()> {
    let (quit_tx, quit_rx) = mpsc::channel();

    let failed = quit_tx.clone();
    tray.set_failure_callback(move |_, why| {
        tracing::error!("Tray icon failed: {why}");
        let _ = failed.send(());
    });

    let clicks = AtomicU32::new(0);
    tray.add_menu_entry("Count", move |tray| {
        let clicks = clicks.fetch_add(1, Ordering::Relaxed) + 1;
        let icon = if clicks % 2 == 1 { BUSY_ICON } else { IDLE_ICON };
        if let Err(why) = tray.set_status(&format!("Clicked {clicks} times"), icon) {
            tracing::warn!("Failed to update the status line: {why}");
        }
    })?;

    tray.add_menu_entry("Quit", move |tray| {
        tray.remove_tray();
        let _ = quit_tx.send(());
    })?;

    tray.create_tray(IDLE_ICON)?;
    tracing::info!("Tray icon is up, using the {} backend", tray.backend());

    // Native toolkit trays need their changes applied from this thread
    loop {
        trayshim::pump_events();
        match quit_rx.recv_timeout(Duration::from_millis(50)) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    tray.remove_tray();
    Ok(())
}
