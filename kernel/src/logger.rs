//! `log` facade backend.
//!
//! Records are prefixed with the tick-derived uptime and written to COM1,
//! which keeps logging usable before the GUI exists and after it wedges.

use log::{LevelFilter, Log, Metadata, Record};

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ms = crate::timer::uptime_ms();
        crate::serial::_print(format_args!(
            "[{:5}.{:03}] {:5} {}: {}\n",
            ms / 1000,
            ms % 1000,
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger. Called once, right after `serial::init`.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Raise or lower the global level (shell `loglevel` builtin).
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;

    // max_level is process-global; run these in sequence.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn init_is_idempotent() {
        let _guard = TEST_LOCK.lock().unwrap();
        init();
        init();
        log::info!("logger smoke test");
    }

    #[test]
    fn level_can_change() {
        let _guard = TEST_LOCK.lock().unwrap();
        init();
        set_level(LevelFilter::Debug);
        assert_eq!(log::max_level(), LevelFilter::Debug);
        set_level(LevelFilter::Info);
    }
}
