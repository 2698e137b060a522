use clap::Parser;
use parley::Cli;
use parley_core::telemetry;
use std::process::ExitCode;
use tokio::runtime::Runtime;

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    telemetry::init_tracing(telemetry::default_filter(cli.verbose))?;

    let runtime = Runtime::new()?;
    runtime.block_on(parley::run(cli))
}
