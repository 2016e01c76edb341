use anyhow::Result;
use clap::Parser;
use endpoint_controller::app::ApplicationBuilder;
use endpoint_controller::config::Cli;
use endpoint_controller::config::Commands;
use endpoint_controller::config::RunArgs;
use endpoint_controller::infrastructure::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(run_args) => run(*run_args).await,
    }
}

async fn run(run_args: RunArgs) -> Result<()> {
    let _guards = logging::init(run_args.metrics_file.as_deref())?;

    tracing::info!("Starting {}", &**version::BANNER);

    let app = ApplicationBuilder::new(run_args).build().await?;
    app.run().await?;

    tracing::info!("{} stopped", version::BINARY_NAME);
    Ok(())
}
