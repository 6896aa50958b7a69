//! Kernel logging facility
//!
//! Routes the `log` crate's macros to the serial port. Log levels are
//! configured based on build configuration (debug/release).

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Thread-safe logger implementation
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            crate::serial_println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Installs the serial logger. Debug builds log at Debug, release at Info.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| {
            log::set_max_level(
                #[cfg(debug_assertions)]
                LevelFilter::Debug,
                #[cfg(not(debug_assertions))]
                LevelFilter::Info,
            )
        })
        .expect("Logger initialization failed");
}
