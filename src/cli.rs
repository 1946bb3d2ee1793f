use std::env;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[clap(name = "procsentinel")]
#[clap(about = "Kernel probes for process lifecycle monitoring")]
#[clap(version)]
#[clap(disable_help_subcommand = true)]
pub struct Opts {
    /// Configuration file, `/var/lib/procsentinel/procsentinel.ini` when missing
    #[clap(long, global = true)]
    pub config_file: Option<String>,

    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Print the hook point catalog and the tables it uses
    Catalog,
    /// Attach every probe, print their status and detach
    Check,
    /// Stream decoded events until terminated
    Run {
        /// Print events as JSON lines
        #[clap(long)]
        json: bool,
    },
}

impl Opts {
    pub fn log_level(&self) -> log::LevelFilter {
        log_level_from_verbosity(self.verbose)
    }
}

pub fn log_level_from_verbosity(num: u8) -> log::LevelFilter {
    match num {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        2..=u8::MAX => log::LevelFilter::Trace,
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    // One line with every cause, the debug form adds the backtrace.
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}
