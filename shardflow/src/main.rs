use anyhow::Context;
use clap::Parser;
use shardflow::cli::{self, Cli};
use shardflow::errors::{ShardflowError, EXIT_FATAL};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    shardflow::logging::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let code = error
                .downcast_ref::<ShardflowError>()
                .map_or(EXIT_FATAL, ShardflowError::exit_code);
            tracing::error!(exit_code = code, "{error:#}");
            eprintln!("error: {error:#}");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let name = cli.command.name();
    cli::execute(cli)
        .await
        .with_context(|| format!("shardflow {name} failed"))
}
