use crate::config::Environment;
use opentelemetry::global::BoxedTracer;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber: pretty output in development, one JSON
/// object per line in production. Filtering follows `RUST_LOG` and defaults
/// to `info`.
pub fn setup_logging(environment: Environment) {
    install_subscriber(environment, None);
}

/// Installs the global subscriber. With a tracer, spans are also bridged to
/// OpenTelemetry.
pub(crate) fn install_subscriber(environment: Environment, tracer: Option<BoxedTracer>) {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let otel_layer = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let fmt_layer = match environment {
        Environment::Production => tracing_subscriber::fmt::layer()
            .json()
            .with_level(true)
            .with_thread_names(true)
            .boxed(),
        Environment::Development => tracing_subscriber::fmt::layer()
            .pretty()
            .with_ansi(true)
            .with_thread_names(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(fmt_layer)
        .init();
}
