//! Boolean environment-variable configuration, parsed once at startup.

use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;

/// Parse a yes/true/1 vs no/false/0 environment variable. Anything else is
/// treated as unset.
fn bool_env(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => match value.as_str() {
            "yes" | "true" | "1" => true,
            "no" | "false" | "0" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn size_env(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(value) => value.parse().unwrap_or(default),
        Err(_) => default,
    }
}

pub struct Config {
    pub log_to_file: bool,
    pub exit_on_panic: bool,
    pub dump_errnos: bool,
    pub run_global_ctors: bool,
    pub run_global_dtors: bool,
    pub verbose_stw: bool,
    pub dump_setup: bool,
    /// Bytes of address space reserved for the managed heap.
    pub heap_reservation: usize,
    /// Live bytes at which the first collection is scheduled.
    pub min_trigger: usize,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            log_to_file: bool_env("FUGC_LOG_TO_FILE", false),
            exit_on_panic: bool_env("FUGC_EXIT_ON_PANIC", false),
            dump_errnos: bool_env("FUGC_DUMP_ERRNOS", false),
            run_global_ctors: bool_env("FUGC_RUN_GLOBAL_CTORS", true),
            run_global_dtors: bool_env("FUGC_RUN_GLOBAL_DTORS", false),
            verbose_stw: bool_env("FUGC_VERBOSE_STW", false),
            dump_setup: bool_env("FUGC_DUMP_SETUP", false),
            heap_reservation: size_env("FUGC_HEAP_RESERVATION", 2 * 1024 * 1024 * 1024),
            min_trigger: size_env("FUGC_MIN_TRIGGER", 16 * 1024 * 1024),
        }
    }
}

static LOG_FILE: Mutex<Option<File>> = parking_lot::const_mutex(None);

pub fn open_log_file() {
    let file = File::create("fugc.log").expect("failed to create fugc.log");
    *LOG_FILE.lock() = Some(file);
}

pub fn log_line(args: std::fmt::Arguments) {
    let mut file = LOG_FILE.lock();
    match &mut *file {
        Some(file) => {
            let _ = writeln!(file, "{}", args);
        }
        None => eprintln!("{}", args),
    }
}

#[macro_export]
macro_rules! rt_log {
    ($($arg:tt)*) => {
        $crate::config::log_line(format_args!($($arg)*))
    };
}
