//! `log` backend writing to a [`Console`]
//!
//! Records are rendered as `[LEVEL] target: message`. Until a console is
//! attached every record is dropped, so logging is safe from the first
//! instruction of boot.

use core::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::config;
use crate::console::{Console, ConsoleWriter};

pub struct KernelLogger {
    console: spin::Once<&'static dyn Console>,
    level: LevelFilter,
}

impl KernelLogger {
    pub const fn new(level: LevelFilter) -> Self {
        Self {
            console: spin::Once::new(),
            level,
        }
    }

    /// Attach the output sink; only the first call has any effect
    pub fn attach(&self, console: &'static dyn Console) {
        self.console.call_once(|| console);
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(console) = self.console.get() {
            let mut writer = ConsoleWriter::new(*console);
            let _ = writeln!(
                writer,
                "[{:<5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger::new(config::MAX_LOG_LEVEL);

/// Install the kernel logger as the global `log` backend
pub fn init(console: &'static dyn Console) -> Result<(), SetLoggerError> {
    LOGGER.attach(console);
    log::set_logger(&LOGGER)?;
    log::set_max_level(LOGGER.level());
    Ok(())
}

/// [`init`] with the console chosen by the build configuration
pub fn init_default() -> Result<(), SetLoggerError> {
    init(config::console())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;
    use std::boxed::Box;
    use std::string::String;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<String>);

    impl Console for Capture {
        fn putc(&self, c: u8) {
            self.0.lock().unwrap().push(c as char);
        }
    }

    fn emit(logger: &KernelLogger, level: Level, message: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target("keel")
                .args(format_args!("{}", message))
                .build(),
        );
    }

    #[test]
    fn test_records_above_the_level_are_dropped() {
        let console: &'static Capture = Box::leak(Box::default());
        let logger = KernelLogger::new(LevelFilter::Warn);
        logger.attach(console);

        emit(&logger, Level::Error, "broken");
        emit(&logger, Level::Info, "chatty");
        assert_eq!(*console.0.lock().unwrap(), "[ERROR] keel: broken\r\n");
    }

    #[test]
    fn test_no_output_without_console() {
        let logger = KernelLogger::new(LevelFilter::Trace);
        emit(&logger, Level::Error, "lost");
        assert!(logger.console.get().is_none());
    }
}
