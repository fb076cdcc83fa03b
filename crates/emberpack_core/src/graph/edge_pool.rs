use crate::diagnostic::GraphError;

use super::FileId;

/// Stable identity of a dependency edge: an index into the pool.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EdgeId(pub(crate) u32);

impl EdgeId {
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

/// A directed importer -> importee edge, threaded through two intrusive
/// doubly-linked lists: the importer's outgoing list and the importee's
/// incoming list. The links make disconnection O(1) without rescanning
/// either list.
#[derive(Debug)]
pub struct DependencyEdge {
  pub importer: FileId,
  pub importee: FileId,
  pub specifier: String,
  pub is_static: bool,
  pub(crate) next_outgoing: Option<EdgeId>,
  pub(crate) prev_outgoing: Option<EdgeId>,
  pub(crate) next_incoming: Option<EdgeId>,
  pub(crate) prev_incoming: Option<EdgeId>,
}

impl DependencyEdge {
  pub(crate) fn new(importer: FileId, importee: FileId, specifier: String, is_static: bool) -> Self {
    DependencyEdge {
      importer,
      importee,
      specifier,
      is_static,
      next_outgoing: None,
      prev_outgoing: None,
      next_incoming: None,
      prev_incoming: None,
    }
  }
}

#[derive(Debug)]
enum EdgeSlot {
  Occupied(DependencyEdge),
  Free { next_free: Option<u32> },
}

/// Free-list-backed pool of edges. Disconnected edges return their slot to
/// the free list; ids of disconnected edges go stale and dereferencing one is
/// a contract breach ([`GraphError::StaleEdge`]).
#[derive(Debug, Default)]
pub struct EdgePool {
  slots: Vec<EdgeSlot>,
  free_head: Option<u32>,
  live: usize,
}

impl EdgePool {
  pub(crate) fn alloc(&mut self, edge: DependencyEdge) -> EdgeId {
    self.live += 1;
    match self.free_head {
      Some(index) => {
        let next_free = match self.slots[index as usize] {
          EdgeSlot::Free { next_free } => next_free,
          EdgeSlot::Occupied(_) => None,
        };
        self.free_head = next_free;
        self.slots[index as usize] = EdgeSlot::Occupied(edge);
        EdgeId(index)
      }
      None => {
        let index = self.slots.len() as u32;
        self.slots.push(EdgeSlot::Occupied(edge));
        EdgeId(index)
      }
    }
  }

  pub(crate) fn free(&mut self, id: EdgeId) -> Result<DependencyEdge, GraphError> {
    match self.slots.get_mut(id.index()) {
      Some(slot @ EdgeSlot::Occupied(_)) => {
        let freed = std::mem::replace(
          slot,
          EdgeSlot::Free {
            next_free: self.free_head,
          },
        );
        self.free_head = Some(id.0);
        self.live -= 1;
        match freed {
          EdgeSlot::Occupied(edge) => Ok(edge),
          EdgeSlot::Free { .. } => Err(GraphError::StaleEdge(id)),
        }
      }
      _ => Err(GraphError::StaleEdge(id)),
    }
  }

  pub fn edge(&self, id: EdgeId) -> Result<&DependencyEdge, GraphError> {
    match self.slots.get(id.index()) {
      Some(EdgeSlot::Occupied(edge)) => Ok(edge),
      _ => Err(GraphError::StaleEdge(id)),
    }
  }

  pub(crate) fn edge_mut(&mut self, id: EdgeId) -> Result<&mut DependencyEdge, GraphError> {
    match self.slots.get_mut(id.index()) {
      Some(EdgeSlot::Occupied(edge)) => Ok(edge),
      _ => Err(GraphError::StaleEdge(id)),
    }
  }

  pub fn len(&self) -> usize {
    self.live
  }

  pub fn is_empty(&self) -> bool {
    self.live == 0
  }
}
