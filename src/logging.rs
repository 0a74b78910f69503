use std::any::Any;

use tracing_subscriber::EnvFilter;

/// Sets up the `tracing` subscriber used by the demo binary. Log levels are taken from `RUST_LOG`,
/// with `info` as the default.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("A tracing subscriber was already installed");
    }

    install_panic_hook_handler();
}

/// Routes panics through `tracing`, so they end up wherever the rest of the logs go.
///
/// The previously installed hook still runs afterwards.
pub fn install_panic_hook_handler() {
    let prev = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        let payload = panic_message(info.payload());

        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed thread>");

        match info.location() {
            Some(location) => tracing::error!(
                "thread '{thread_name}' panicked at {}:{}:{}: '{payload}'\n{}",
                location.file(),
                location.line(),
                location.column(),
                std::backtrace::Backtrace::capture()
            ),
            None => tracing::error!(
                "thread '{thread_name}' panicked: '{payload}'\n{}",
                std::backtrace::Backtrace::capture()
            ),
        }

        prev(info);
    }));
}

/// The message a panic was raised with, if it was raised with one
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages() {
        let literal = std::panic::catch_unwind(|| panic!("plain")).unwrap_err();
        assert_eq!(panic_message(literal.as_ref()), "plain");

        let formatted = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(formatted.as_ref()), "formatted 42");

        let other = std::panic::catch_unwind(|| std::panic::panic_any(7_u32)).unwrap_err();
        assert_eq!(panic_message(other.as_ref()), "non-string payload");
    }
}
