use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_log::LogTracer;
use tracing_subscriber::{
    fmt,
    layer::{Layered, SubscriberExt},
    EnvFilter, Layer, Registry,
};

/// Configuration of the tracing subscriber installed by the binary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfiguration
{
    /// Write through the test writer so output is captured by the test harness.
    #[serde(default)]
    pub use_test_writer: bool,

    /// Emit one JSON object per event.
    #[serde(default)]
    pub force_json_output: bool,

    /// Emit JSON in the format understood by Google Cloud Logging.
    #[serde(default)]
    pub stackdriver_json_output: bool,
}

type FilteredRegistry = Layered<EnvFilter, Registry>;

/// Install the global tracing subscriber.
///
/// The level defaults to `info` and can be overridden with `RUST_LOG`. Records
/// emitted through the `log` crate (warp, hyper) are forwarded as well.
pub fn install_trace_subscriber(config: &TraceConfiguration) -> Result<()>
{
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("invalid log filter")?;

    let output_layer: Box<dyn Layer<FilteredRegistry> + Send + Sync> =
        if config.stackdriver_json_output
        {
            tracing_stackdriver::layer().boxed()
        }
        else if config.force_json_output
        {
            fmt::layer().json().with_current_span(false).boxed()
        }
        else if config.use_test_writer
        {
            fmt::layer().with_test_writer().boxed()
        }
        else
        {
            fmt::layer().with_thread_ids(true).with_level(true).boxed()
        };

    let subscriber = Registry::default().with(filter).with(output_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    LogTracer::init().context("failed to forward log records to tracing")?;

    Ok(())
}
