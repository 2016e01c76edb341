pub mod cli;
pub mod controller;

use serde::Deserialize;
use serde::Serialize;

/// Encoding of the metric lines written to the metrics file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsFormat {
    #[default]
    Influx,
    Json,
}

pub use cli::*;
pub use controller::*;
