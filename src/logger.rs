use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub struct Logger {
    file: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(log_path: &str) -> Self {
        // Create logs directory if it doesn't exist
        if let Some(parent) = Path::new(log_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .ok();

        Logger {
            file: file.map(Mutex::new),
        }
    }

    pub fn log(&self, level: &str, message: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let log_line = format!("[{timestamp}] [{level}] {message}\n");

        if let Some(ref file) = self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(log_line.as_bytes());
                let _ = file.flush();
            }
        }
    }

    pub fn debug(&self, message: &str) {
        self.log("DEBUG", message);
    }

    pub fn info(&self, message: &str) {
        self.log("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.log("WARN", message);
    }

    pub fn error(&self, message: &str) {
        self.log("ERROR", message);
    }
}

// Global logger instance. A logger that failed to open its file discards
// messages instead of crashing the process.
lazy_static::lazy_static! {
    pub static ref LOGGER: Logger = Logger::new("logs/flux_gen.log");
}

// Convenience macros
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.warn(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.error(&format!($($arg)*))
    };
}
