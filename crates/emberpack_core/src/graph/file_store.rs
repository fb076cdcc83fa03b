use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use crate::diagnostic::Diagnostic;
use crate::diagnostic::GraphError;
use crate::types::CompiledModule;
use crate::types::ContentTag;
use crate::types::FileContent;

use super::EdgeId;

/// Stable identity of a file record: an index into the store's arena.
///
/// Ids stay valid for as long as the record is live; rebuilds mutate the
/// record in place and never replace its identity, so edges holding `FileId`s
/// survive any number of content changes.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileId(pub(crate) u32);

impl FileId {
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

/// Per-file state owned by the [`FileStore`].
///
/// Mutated only by the change tracer during a build pass, so no cross-node
/// locking exists anywhere in the graph.
#[derive(Debug)]
pub struct FileNode {
  pub path: PathBuf,
  pub tag: ContentTag,
  pub content: FileContent,
  /// Declared `hot.accept()` with no specifiers: this module handles being
  /// replaced in isolation.
  pub self_accept: bool,
  /// Specifiers this module declared dep-accepts for.
  pub accept_specifiers: Vec<String>,
  pub is_entry: bool,
  /// Monotonic; bumped on every content change. HMR messages carry the
  /// generation they were computed against.
  pub generation: u64,
  pub(crate) first_outgoing: Option<EdgeId>,
  pub(crate) first_incoming: Option<EdgeId>,
}

impl FileNode {
  fn new(path: PathBuf) -> Self {
    FileNode {
      path,
      tag: ContentTag::Unknown,
      content: FileContent::Pending,
      self_accept: false,
      accept_specifiers: Vec::new(),
      is_entry: false,
      generation: 0,
      first_outgoing: None,
      first_incoming: None,
    }
  }
}

#[derive(Debug)]
enum FileSlot {
  Occupied(FileNode),
  Free { next_free: Option<u32> },
}

/// Arena of [`FileNode`] records addressed by stable [`FileId`], backed by a
/// free list so removed slots are reused without shifting live ids.
#[derive(Debug, Default)]
pub struct FileStore {
  slots: Vec<FileSlot>,
  free_head: Option<u32>,
  by_path: HashMap<PathBuf, FileId>,
  live: usize,
  generation_counter: u64,
}

impl FileStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Idempotent: resolving the same path twice yields the same id.
  pub fn get_or_create(&mut self, path: &Path) -> FileId {
    if let Some(id) = self.by_path.get(path) {
      return *id;
    }

    let node = FileNode::new(path.to_path_buf());
    let id = match self.free_head {
      Some(index) => {
        let next_free = match self.slots[index as usize] {
          FileSlot::Free { next_free } => next_free,
          // The free list only ever points at free slots
          FileSlot::Occupied(_) => None,
        };
        self.free_head = next_free;
        self.slots[index as usize] = FileSlot::Occupied(node);
        FileId(index)
      }
      None => {
        let index = self.slots.len() as u32;
        self.slots.push(FileSlot::Occupied(node));
        FileId(index)
      }
    };

    self.by_path.insert(path.to_path_buf(), id);
    self.live += 1;
    tracing::trace!(?id, path = %path.display(), "created file record");
    id
  }

  pub fn get(&self, path: &Path) -> Option<FileId> {
    self.by_path.get(path).copied()
  }

  pub fn contains(&self, path: &Path) -> bool {
    self.by_path.contains_key(path)
  }

  pub fn node(&self, id: FileId) -> Result<&FileNode, GraphError> {
    match self.slots.get(id.index()) {
      Some(FileSlot::Occupied(node)) => Ok(node),
      _ => Err(GraphError::StaleFile(id)),
    }
  }

  pub fn node_mut(&mut self, id: FileId) -> Result<&mut FileNode, GraphError> {
    match self.slots.get_mut(id.index()) {
      Some(FileSlot::Occupied(node)) => Ok(node),
      _ => Err(GraphError::StaleFile(id)),
    }
  }

  /// Store compiled output for a file. Bumps the generation and leaves edges
  /// untouched; edge deltas are the tracer's concern.
  pub fn set_content(
    &mut self,
    id: FileId,
    tag: ContentTag,
    module: CompiledModule,
  ) -> Result<u64, GraphError> {
    let generation = self.next_generation();
    let node = self.node_mut(id)?;
    node.tag = tag;
    node.content = FileContent::Ready(module);
    node.generation = generation;
    Ok(generation)
  }

  /// Transition a file to the `Unknown` content state, used on build failure
  /// or when the underlying file disappears. Later steps must treat the
  /// record as absent, not dereference it.
  pub fn mark_unknown(&mut self, id: FileId, error: Option<Diagnostic>) -> Result<u64, GraphError> {
    let generation = self.next_generation();
    let node = self.node_mut(id)?;
    node.tag = ContentTag::Unknown;
    node.content = FileContent::Unknown { error };
    node.generation = generation;
    Ok(generation)
  }

  /// Remove a record. Fails with [`GraphError::InUse`] while any edge, in
  /// either direction, still connects to it; callers disconnect first.
  pub fn remove(&mut self, id: FileId) -> Result<(), GraphError> {
    let node = self.node(id)?;
    if node.first_incoming.is_some() || node.first_outgoing.is_some() {
      return Err(GraphError::InUse(id));
    }

    let path = node.path.clone();
    self.by_path.remove(&path);
    self.slots[id.index()] = FileSlot::Free {
      next_free: self.free_head,
    };
    self.free_head = Some(id.0);
    self.live -= 1;
    tracing::trace!(?id, path = %path.display(), "removed file record");
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.live
  }

  pub fn is_empty(&self) -> bool {
    self.live == 0
  }

  pub fn iter(&self) -> impl Iterator<Item = (FileId, &FileNode)> {
    self.slots.iter().enumerate().filter_map(|(index, slot)| {
      match slot {
        FileSlot::Occupied(node) => Some((FileId(index as u32), node)),
        FileSlot::Free { .. } => None,
      }
    })
  }

  /// The global generation counter. Monotonic across all files so message
  /// generations are comparable regardless of which file they came from.
  pub fn current_generation(&self) -> u64 {
    self.generation_counter
  }

  fn next_generation(&mut self) -> u64 {
    self.generation_counter += 1;
    self.generation_counter
  }
}
