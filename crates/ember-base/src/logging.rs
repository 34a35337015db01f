use log::{LevelFilter, Log, Metadata, Record};
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Environment variable that overrides the build-mode default log level.
pub const LOG_LEVEL_ENV: &str = "EMBER_LOG";

/// A logger that writes engine records to stdout
pub struct StdoutLogger;

/// Appends records to `<dir>/<YYYY-MM-DD>.log`, switching files at midnight UTC
pub struct FileLogger {
    sink: Mutex<DailyFile>,
}

struct DailyFile {
    dir: PathBuf,
    date: String,
    file: File,
}

impl DailyFile {
    fn open(dir: PathBuf, date: String) -> std::io::Result<DailyFile> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", date)))?;
        Ok(DailyFile { dir, date, file })
    }

    /// Move to today's file if the date changed since the last record
    fn roll(&mut self) {
        let today = format_today();
        if today == self.date {
            return;
        }
        match DailyFile::open(self.dir.clone(), today) {
            Ok(next) => *self = next,
            // keep writing to the stale file rather than dropping records
            Err(e) => eprintln!("cannot open log file for {}: {}", format_today(), e),
        }
    }
}

impl FileLogger {
    /// Create the directory if needed and open today's file in it
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileLogger {
            sink: Mutex::new(DailyFile::open(dir, format_today())?),
        })
    }
}

fn level_enabled(metadata: &Metadata) -> bool {
    metadata.level() <= log::max_level()
}

/// `<timestamp> [LEVEL] [thread:..] target file:line - message`
fn format_record(record: &Record) -> String {
    format!(
        "{} [{}] [thread:{:?}] {} {}:{} - {}",
        format_timestamp(),
        record.level(),
        std::thread::current().id(),
        record.target(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.args()
    )
}

impl Log for StdoutLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        level_enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if level_enabled(record.metadata()) {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{}", format_record(record));
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        level_enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !level_enabled(record.metadata()) {
            return;
        }
        let line = format_record(record);
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        sink.roll();
        if let Err(e) = writeln!(sink.file, "{}", line) {
            eprintln!("log write failed ({}): {}", e, line);
        }
    }

    fn flush(&self) {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        let _ = sink.file.flush();
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// UTC wall clock as `YYYY-MM-DDTHH:MM:SS`
pub fn format_timestamp() -> String {
    let secs = unix_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let seconds_today = secs % 86_400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        year,
        month,
        day,
        seconds_today / 3_600,
        seconds_today / 60 % 60,
        seconds_today % 60
    )
}

/// UTC date as `YYYY-MM-DD`, the name of the current log file
pub fn format_today() -> String {
    let (year, month, day) = civil_from_days((unix_secs() / 86_400) as i64);
    format!("{:04}-{:02}-{:02}", year, month, day)
}

/// Convert days since Unix epoch to civil date (year, month, day)
/// Uses Howard Hinnant's algorithm (public domain)
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

fn parse_level(value: &str) -> Option<LevelFilter> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" | "0" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" | "full" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Resolve the max log level.
///
/// `EMBER_LOG` wins when it holds a recognized level name. Otherwise debug
/// builds log at Debug and release builds at Info.
pub fn level_from_env() -> LevelFilter {
    env::var(LOG_LEVEL_ENV)
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
}

/// Initialize the global logger with StdoutLogger
///
/// This can only be called once per process. Subsequent calls are silently ignored.
pub fn init_stdout_logger() {
    static LOGGER: StdoutLogger = StdoutLogger;

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level_from_env());
    }
}

/// Initialize the global logger with FileLogger
///
/// This can only be called once per process. Subsequent calls are silently ignored.
///
/// Returns an error if the FileLogger cannot be created (e.g., invalid directory).
pub fn init_file_logger(dir: impl Into<PathBuf>) -> std::io::Result<()> {
    let logger = FileLogger::new(dir)?;

    // set_logger needs a &'static; the leaked logger lives for the rest of the process
    if log::set_logger(Box::leak(Box::new(logger))).is_ok() {
        log::set_max_level(level_from_env());
    }

    Ok(())
}
