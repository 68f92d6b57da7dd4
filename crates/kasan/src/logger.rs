//! # logger
//! A `log::Log` implementation which forwards records to a platform supplied
//! `LogSink`, typically a serial console. The sanitizer itself only writes to
//! the log through the `log` macros, so any other logger works equally well.
//!
//! No allocation takes place, the record is handed to the sink as
//! `fmt::Arguments` for it to render.
use core::fmt;

use log::{Level, Log, Metadata, Record, SetLoggerError};
use spin::Once;

/// The platform's output device. Called with the record's target, which is
/// `kasan` for violation reports, its level and its message.
pub trait LogSink: Send + Sync {
    fn write(&self, tag: &str, level: Level, message: &fmt::Arguments<'_>);
}

static ONCE: Once<()> = Once::new();

#[derive(Debug)]
pub struct KasanLogger<S: LogSink> {
    level: Level,
    sink: S,
}

impl<S: LogSink> KasanLogger<S> {
    pub const fn new(sink: S, level: Level) -> KasanLogger<S> {
        KasanLogger { level, sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Installs the logger as the global logger. Once a logger has been
    /// installed, later calls do nothing.
    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        ONCE.try_call_once(|| {
            log::set_logger(self)?;
            log::set_max_level(self.level.to_level_filter());
            Ok(())
        })
        .map(|_| ())
    }
}

impl<S: LogSink> Log for KasanLogger<S> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.level >= metadata.level()
    }

    fn flush(&self) {}

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.sink
                .write(record.target(), record.level(), record.args());
        }
    }
}
