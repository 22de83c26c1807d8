//! seqflow CLI entry point.
//!
//! Binary name: `seqflow`
//!
//! Parses arguments, sets up logging and a Ctrl-C cancellation token, then
//! dispatches to the command handlers.

mod cli;
mod stage;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, LogFormat};
use seqflow_core::runner::PipelineError;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,seqflow=debug",
        _ => "trace",
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    // Shell completions need nothing else
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "seqflow", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling outstanding work");
            trigger.cancel();
        }
    });

    match dispatch(cli, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e
                .downcast_ref::<PipelineError>()
                .is_some_and(PipelineError::is_cancelled)
            {
                eprintln!("{} run cancelled", console::style("✗").red());
                return ExitCode::from(130);
            }
            eprintln!("{} {e:#}", console::style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => {
            let report = cli::run::run(args, cancel).await?;
            if !cli.quiet {
                cli::summary::print_report(&report, cli.json)?;
            }
        }

        Commands::Checkpoints { config, backend } => {
            cli::checkpoints::list_checkpoints(&config, backend, cli.json).await?;
        }

        Commands::Completions { .. } => {}
    }
    Ok(())
}
