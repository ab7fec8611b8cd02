use std::io::{self, Write};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

fn format_record(record: &Record) -> String {
	format!("lssh: {}: {}", record.level().as_str().to_lowercase(), record.args())
}

impl Log for StderrLogger {
	fn enabled(&self, metadata: &Metadata) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record) {
		if self.enabled(record.metadata()) {
			let _ = writeln!(&mut io::stderr(), "{}", format_record(record));
		}
	}

	fn flush(&self) {
		let _ = io::stderr().flush();
	}
}

/// Installs the stderr logger. Only the first call takes effect.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
	log::set_logger(&LOGGER)?;
	log::set_max_level(level);
	Ok(())
}
