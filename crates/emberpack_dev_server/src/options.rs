use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Dev server configuration.
///
/// All timing knobs are explicit because no observable behavior pins them:
/// the debounce window in particular is a tuning parameter, not a contract.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DevServerOptions {
  pub port: u16,
  /// Quiet window for coalescing filesystem events into one batch.
  pub watch_debounce: Duration,
  /// How long a batch waits for client acks under the non-blocking
  /// synchronization variant. A session that never acks within this window
  /// cannot block batch completion.
  pub ack_timeout: Duration,
  /// Opt in to the blocking synchronization variant: batches complete only
  /// once every connected session has applied the update.
  pub block_on_websockets: bool,
}

impl Default for DevServerOptions {
  fn default() -> Self {
    DevServerOptions {
      port: 3000,
      watch_debounce: Duration::from_millis(50),
      ack_timeout: Duration::from_secs(2),
      block_on_websockets: false,
    }
  }
}
