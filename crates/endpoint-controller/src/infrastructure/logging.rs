//! Global tracing subscriber: application logs plus a separate metrics file.

use std::env;
use std::fmt::{self};
use std::path::Path;
use std::path::PathBuf;

use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use utils::logging::LOG_PATH_ENV_VAR;
use utils::LoggingError;

/// Target of the events carrying encoded metric lines.
pub const METRICS_TARGET: &str = "metrics";

const METRICS_FILES_KEPT: usize = 3;

/// Writes only the recorded field values, one encoded line per event.
struct MetricLineFormatter;

struct FieldVisitor {
    line: String,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, _: &Field, value: &str) {
        self.line.push_str(value);
    }

    fn record_debug(&mut self, _: &Field, value: &dyn fmt::Debug) {
        self.line.push_str(&format!("{value:?}"));
    }
}

impl<S, N> FormatEvent<S, N> for MetricLineFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor {
            line: String::new(),
        };
        event.record(&mut visitor);
        writeln!(writer, "{}", visitor.line)
    }
}

fn is_metrics(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target() == METRICS_TARGET
}

/// Installs the global subscriber. Application logs go to stderr, or to the
/// file named by `LOG_PATH`; metric lines go to `metrics_file` when given.
///
/// The returned guards flush the non-blocking writers and must be kept alive
/// for the lifetime of the process.
pub fn init(metrics_file: Option<&Path>) -> Result<Vec<WorkerGuard>, LoggingError> {
    let log_path = env::var(LOG_PATH_ENV_VAR).ok().map(PathBuf::from);
    let fmt_layer = utils::logging::get_fmt_layer(log_path.as_deref())?;
    let mut guards: Vec<WorkerGuard> = fmt_layer.guard.into_iter().collect();

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let app_layer = fmt_layer
        .layer
        .with_filter(env_filter.and(filter::filter_fn(|metadata| !is_metrics(metadata))));

    let metrics_layer = match metrics_file {
        Some(path) => {
            let (writer, guard) = utils::logging::rolling_writer(path, METRICS_FILES_KEPT)?;
            guards.push(guard);
            Some(
                layer()
                    .event_format(MetricLineFormatter)
                    .fmt_fields(format::DefaultFields::new())
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(filter::filter_fn(is_metrics)),
            )
        }
        None => None,
    };

    registry().with(app_layer).with(metrics_layer).init();
    Ok(guards)
}
