use tracing_subscriber::EnvFilter;

/// Configure `tracing_subscriber` to write to standard output.
///
/// Safe to call more than once; later calls no-op.
pub fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .try_init();
}
