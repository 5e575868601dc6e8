use std::sync::Once;

static TRACING_INIT: Once = Once::new();

const DEFAULT_DIRECTIVE: &str = "info";

/// Install the global subscriber with the `info` fallback filter.
pub fn init_tracing() {
    init_tracing_with_default(DEFAULT_DIRECTIVE);
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set (for example `RUST_LOG=runtime=debug,info`);
/// otherwise `fallback` is used as the filter directive, and an unparsable
/// fallback degrades to `info`. Output goes to stderr so stdout stays free
/// for command output. Only the first call has any effect.
pub fn init_tracing_with_default(fallback: &str) {
    TRACING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_DIRECTIVE));
        let _ = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_ansi(false)
            .with_env_filter(filter)
            .try_init();
    });
}
