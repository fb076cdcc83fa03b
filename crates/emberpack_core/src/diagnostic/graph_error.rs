use thiserror::Error;

use crate::graph::EdgeId;
use crate::graph::FileId;

/// Contract breaches inside the graph.
///
/// `StaleFile` and `StaleEdge` must never occur in correct operation. They are
/// surfaced as errors rather than panics so the coordinator can stop cleanly,
/// but they always indicate a bug in the caller, not a recoverable runtime
/// condition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
  /// A file could not be removed because edges still point at it.
  #[error("file {0:?} still has connected edges")]
  InUse(FileId),

  /// A file id was dereferenced after its record was removed.
  #[error("stale file id {0:?}")]
  StaleFile(FileId),

  /// An edge id was dereferenced after the edge was disconnected.
  #[error("stale edge id {0:?}")]
  StaleEdge(EdgeId),
}
