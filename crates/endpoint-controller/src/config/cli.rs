use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::controller::RunArgs;

#[derive(Parser)]
#[command(name = version::BINARY_NAME, about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the Endpoints and EndpointSlice controllers
    Run(Box<RunArgs>),
}
