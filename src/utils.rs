use std::fmt::Display;
use std::time::Instant;

use console::Style;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const ANSI_BLUE: Style = Style::new().blue();

/// Install the global tracing subscriber: compact output on stderr with
/// per-span progress bars. Defaults to INFO; `RUST_LOG` overrides.
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    let indicatif_layer = IndicatifLayer::new();

    let filter = EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif_layer.get_stderr_writer())
                .with_timer(tracing_subscriber::fmt::time::uptime())
                .with_target(false)
                .compact(),
        )
        .with(indicatif_layer)
        .with(filter)
        .try_init()
}

/// Formats the time since `start` as a dim suffix for log lines.
pub fn as_overhead(start: Instant) -> impl Display {
    let elapsed = Instant::now().duration_since(start);
    ANSI_BLUE.apply_to(format!("(+{}ms)", elapsed.as_millis()))
}
