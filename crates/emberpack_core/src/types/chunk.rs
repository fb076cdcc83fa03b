use crate::graph::FileId;
use crate::types::ContentTag;

/// One file's contribution to the chunks of a build pass.
///
/// Parts are accumulated by the change tracer and consumed by the chunk
/// assembler within the same pass. A part whose node has gone `Unknown` by
/// assembly time is skipped, never dereferenced.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkPart {
  pub file: FileId,
  pub tag: ContentTag,
  /// Generation of the node this part was computed against.
  pub generation: u64,
}
