mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tm_domain::config::{LogConfig, LogFormat};

use crate::cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli::load_config(&cli.config)?;
    init_cli_tracing(&config.log);

    match cli.command {
        Command::Servers => cli::servers::run(config).await,
        Command::Tools { json } => cli::tools::run(config, json).await,
        Command::Call { tool, args } => {
            let code = cli::call::run(config, tool, args).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Validate) => {
            if !cli::config::validate(&config, &cli.config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Show) => cli::config::show(&config),
        Command::Watch => cli::watch::run(config).await,
    }
}

/// Log to stderr so stdout stays clean for command output. `RUST_LOG`
/// overrides the configured filter.
fn init_cli_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match log.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}
