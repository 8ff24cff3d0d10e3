use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Stderr logging, `RUST_LOG` wins over `default_level`. Stdout stays free
/// for command output.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry().with(filter).with(stderr_layer).init();
}
