use tracing_subscriber::EnvFilter;

/// Installs a fmt logger honouring `RUST_LOG` for the current test binary.
/// Safe to call from every test; only the first call wins.
pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
