//! Session log for `medscan` runs.
//!
//! One file per process, truncated at startup. Each line carries a
//! millisecond UTC clock, the level and the emitting thread, because batch
//! predictions fan out over the rayon pool and interleave.
//!
//! Default location is `<data dir>/MedScan/medscan.log`; `MEDSCAN_LOG`
//! points it elsewhere. Until `init` runs the `log_info!` / `log_warn!` /
//! `log_err!` macros only reach stderr (and only with echo enabled), so the
//! library stays quiet inside a host that never sets logging up.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ENV_LOG_PATH: &str = "MEDSCAN_LOG";

static SINK: OnceLock<Sink> = OnceLock::new();
static ECHO: AtomicBool = AtomicBool::new(false);

struct Sink {
    path: PathBuf,
    file: Mutex<File>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warn,
    Error,
    Panic,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Panic => "PANIC",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Info, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Warn, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Error, &format!($($arg)*));
    };
}

/// File the current session writes to, once `init` has opened one.
pub fn log_path() -> Option<&'static Path> {
    SINK.get().map(|sink| sink.path.as_path())
}

/// Mirror log lines to stderr (`--verbose`).
pub fn set_echo(enabled: bool) {
    ECHO.store(enabled, Ordering::Relaxed);
}

pub fn write(level: Level, msg: &str) {
    let thread = std::thread::current();
    let line = format_line(&clock(), level, thread.name().unwrap_or("worker"), msg);
    emit(&line);
}

/// `[12:04:31.250] [WARN] [main] message`
pub fn format_line(clock: &str, level: Level, thread: &str, msg: &str) -> String {
    format!("[{}] [{}] [{}] {}", clock, level, thread, msg)
}

fn emit(line: &str) {
    if ECHO.load(Ordering::Relaxed) {
        eprintln!("{}", line);
    }
    // Write errors are ignored.
    if let Some(sink) = SINK.get()
        && let Ok(mut file) = sink.file.lock()
    {
        let _ = writeln!(file, "{}", line);
    }
}

/// Open the session log at `MEDSCAN_LOG` or the platform default.
pub fn init() {
    init_at(&resolve_log_path(|key| std::env::var(key).ok()));
}

/// Open (truncating) the session log at `path` and route panics into it.
/// Only the first call takes effect.
pub fn init_at(path: &Path) {
    if SINK.get().is_some() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let file = match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("medscan: cannot open log file {}: {}", path.display(), e);
            return;
        }
    };
    let _ = SINK.set(Sink {
        path: path.to_path_buf(),
        file: Mutex::new(file),
    });

    emit(&format!(
        "# medscan {} pid {} started at unix {}",
        env!("CARGO_PKG_VERSION"),
        std::process::id(),
        unix_seconds().unwrap_or(0)
    ));

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        write(Level::Panic, &info.to_string());
        prev(info);
    }));
}

/// `MEDSCAN_LOG` if set and non-empty, else `<data dir>/MedScan/medscan.log`.
pub fn resolve_log_path(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    match lookup(ENV_LOG_PATH).filter(|p| !p.is_empty()) {
        Some(path) => PathBuf::from(path),
        None => data_dir(&lookup).join("MedScan").join("medscan.log"),
    }
}

fn data_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = lookup("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Some(home) = lookup("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    if let Some(xdg) = lookup("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    match lookup("HOME") {
        Some(home) => PathBuf::from(home).join(".local").join("share"),
        None => PathBuf::from("."),
    }
}

fn unix_seconds() -> Option<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}

/// HH:MM:SS.mmm of the current UTC day.
fn clock() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => {
            let secs = d.as_secs();
            format!(
                "{:02}:{:02}:{:02}.{:03}",
                (secs % 86_400) / 3600,
                (secs % 3600) / 60,
                secs % 60,
                d.subsec_millis()
            )
        }
        Err(_) => "--:--:--.---".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_carries_level_and_thread() {
        let line = format_line("01:02:03.004", Level::Warn, "rayon-3", "fallback");
        assert_eq!(line, "[01:02:03.004] [WARN] [rayon-3] fallback");
    }

    #[test]
    fn levels_order_by_severity() {
        assert!(Level::Info < Level::Warn);
        assert!(Level::Error < Level::Panic);
        assert_eq!(Level::Error.to_string(), "ERROR");
    }

    #[test]
    fn clock_has_millisecond_precision() {
        let c = clock();
        assert_eq!(c.len(), 12);
        assert_eq!(&c[8..9], ".");
    }

    #[test]
    fn log_path_override_and_default() {
        let custom = resolve_log_path(|key| match key {
            ENV_LOG_PATH => Some("/var/log/medscan.log".to_string()),
            _ => None,
        });
        assert_eq!(custom, PathBuf::from("/var/log/medscan.log"));

        let fallback = resolve_log_path(|key| match key {
            "XDG_DATA_HOME" => Some("/data".to_string()),
            "HOME" | "APPDATA" => Some("/data".to_string()),
            _ => None,
        });
        assert!(fallback.ends_with("MedScan/medscan.log"));
        assert!(fallback.starts_with("/data"));
    }
}
