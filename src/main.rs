use anyhow::Result;
use clap::Parser;
use procsentinel::{
    cli::{self, Commands, Opts},
    config::SentinelConfig,
    daemon,
};

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    procsentinel::init_logger(Some(opts.log_level()));

    match execute(&opts).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}

async fn execute(opts: &Opts) -> Result<()> {
    log::trace!("procsentinel options: {:?}", opts);

    let config = if let Some(custom_file) = &opts.config_file {
        SentinelConfig::with_custom_file(custom_file)?
    } else {
        SentinelConfig::new()?
    };

    match &opts.command {
        Commands::Catalog => daemon::catalog(),
        Commands::Check => daemon::check(&config).await,
        Commands::Run { json } => daemon::run(&config, *json).await,
    }
}
