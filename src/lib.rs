//! procsentinel observes the process lifecycle of a Linux host through kernel
//! probes.
//!
//! The agent loads a pre-built probe object, attaches the hook points of the
//! [process monitor](process_monitor) and streams the decoded exec, fork and
//! exit events to the terminal.
//!
//! ```sh
//! # Print the hook point catalog
//! procsentinel catalog
//!
//! # Attach every probe, print their status and detach
//! procsentinel check
//!
//! # Stream events until SIGINT, SIGTERM or SIGHUP
//! procsentinel run --json
//! ```

pub mod cli;
pub mod config;
pub mod daemon;
pub mod term_print;

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder()
            .filter_level(level_filter)
            .format_timestamp(None)
            .format_module_path(false)
            .init();
    }
}
