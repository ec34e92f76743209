//! Drover CLI entry point.

use clap::Parser;

use drover::cli::{self, Cli, Commands};
use drover::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => cli::handle_error(err, cli.json),
    };
    let _logger = match LoggerImpl::init(&LogConfig::from(&config.logging)) {
        Ok(logger) => logger,
        Err(err) => cli::handle_error(err, cli.json),
    };

    let result = match cli.command {
        Commands::Init(args) => cli::commands::init::execute(args, cli.json).await,
        Commands::Daemon(args) => cli::commands::daemon::execute(args, &config, cli.json).await,
        Commands::Task(args) => cli::commands::task::execute(args, &config, cli.json).await,
        Commands::Exec(args) => cli::commands::exec::execute(args, &config, cli.json).await,
    };

    if let Err(err) = result {
        cli::handle_error(err, cli.json);
    }
}
