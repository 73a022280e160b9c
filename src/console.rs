//! Console logger for LiteIPC binaries
//!
//! Backs the `log` facade with a line-oriented writer on stderr. Under test
//! the output goes to a bounded in-memory buffer instead.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Environment variable selecting the log level
pub const ENV_LOG: &str = "LITEIPC_LOG";

/// Console writer interface
pub struct Console {
    #[cfg(test)]
    buffer: heapless::String<1024>,
}

impl Console {
    pub const fn new() -> Self {
        Console {
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write one formatted record
    pub fn write_record(&mut self, level: Level, target: &str, args: &core::fmt::Arguments) {
        #[cfg(test)]
        {
            let _ = writeln!(self.buffer, "[{level:<5} {target}] {args}");
        }

        #[cfg(not(test))]
        {
            let mut line = String::new();
            let _ = writeln!(line, "[{level:<5} {target}] {args}");
            eprint!("{line}");
        }
    }

    #[cfg(test)]
    fn contents(&self) -> &str {
        &self.buffer
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// `log::Log` implementation over the global console
struct ConsoleLogger;

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());
static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            CONSOLE
                .lock()
                .write_record(record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Parse a level name; unknown names give `None`
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.trim().to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Install the console logger at `level`; later calls only change the level
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Install the console logger at the level named by `LITEIPC_LOG` (default info)
pub fn init_from_env() {
    let level = std::env::var(ENV_LOG)
        .ok()
        .and_then(|name| parse_level(&name))
        .unwrap_or(LevelFilter::Info);
    init(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" warn "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn records_are_formatted() {
        let mut console = Console::new();
        console.write_record(Level::Info, "liteipc::cms", &format_args!("elected"));
        assert_eq!(console.contents(), "[INFO  liteipc::cms] elected\n");
    }
}
