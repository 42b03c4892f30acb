use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleetplane::cli::{self, Cli, Command};

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Command::Serve { .. } => {
            // The daemon re-reads level/format from its config file; env
            // overrides still apply through Config.
            let config = fleetplane::config::Config::from_env().unwrap_or_default();
            init_tracing(&config.log_level, config.log_format == "json");
        }
        _ => init_tracing("warn", false),
    }

    if let Err(err) = cli::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(cli::exit_code(&err));
    }
}
