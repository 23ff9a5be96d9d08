use tracing_subscriber::{EnvFilter, fmt};

/// Initializes the global tracing subscriber with an env-filter style
/// directive string, e.g. `"info,history=debug"`. Call once at startup;
/// calling twice panics, which surfaces wiring mistakes immediately.
pub fn initialize(filter: &str) {
    let filter = EnvFilter::try_new(filter).expect("invalid tracing filter");
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Like [`initialize`] but safe to call repeatedly. Used by tests.
pub fn initialize_for_tests(filter: &str) {
    let filter = EnvFilter::try_new(filter).expect("invalid tracing filter");
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
