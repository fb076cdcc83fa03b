use std::path::Path;

use crate::diagnostic::Diagnostic;
use crate::diagnostic::GraphError;
use crate::types::CompiledModule;
use crate::types::ContentTag;

use super::DependencyEdge;
use super::EdgeId;
use super::EdgePool;
use super::FileId;
use super::FileNode;
use super::FileStore;

/// The module dependency graph: file records plus their dependency edges.
///
/// An explicit context object threaded through every operation — there is no
/// global graph. Exactly one build pass mutates it at a time (the change
/// tracer owns it for the duration of a pass), which is why none of these
/// operations take locks.
#[derive(Debug, Default)]
pub struct Graph {
  files: FileStore,
  edges: EdgePool,
}

impl Graph {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn files(&self) -> &FileStore {
    &self.files
  }

  pub fn get_or_create(&mut self, path: &Path) -> FileId {
    self.files.get_or_create(path)
  }

  pub fn get(&self, path: &Path) -> Option<FileId> {
    self.files.get(path)
  }

  pub fn node(&self, id: FileId) -> Result<&FileNode, GraphError> {
    self.files.node(id)
  }

  pub fn node_mut(&mut self, id: FileId) -> Result<&mut FileNode, GraphError> {
    self.files.node_mut(id)
  }

  pub fn set_content(
    &mut self,
    id: FileId,
    tag: ContentTag,
    module: CompiledModule,
  ) -> Result<u64, GraphError> {
    self.files.set_content(id, tag, module)
  }

  pub fn mark_unknown(&mut self, id: FileId, error: Option<Diagnostic>) -> Result<u64, GraphError> {
    self.files.mark_unknown(id, error)
  }

  pub fn current_generation(&self) -> u64 {
    self.files.current_generation()
  }

  /// Remove a file record. Edges must have been disconnected first; while any
  /// remain this fails with [`GraphError::InUse`].
  pub fn remove_file(&mut self, id: FileId) -> Result<(), GraphError> {
    self.files.remove(id)
  }

  /// Insert an edge at the head of both adjacency lists.
  pub fn add_edge(
    &mut self,
    importer: FileId,
    importee: FileId,
    specifier: impl Into<String>,
    is_static: bool,
  ) -> Result<EdgeId, GraphError> {
    // Both endpoints must exist before the edge does.
    self.files.node(importer)?;
    self.files.node(importee)?;

    let mut edge = DependencyEdge::new(importer, importee, specifier.into(), is_static);
    edge.next_outgoing = self.files.node(importer)?.first_outgoing;
    edge.next_incoming = self.files.node(importee)?.first_incoming;
    let id = self.edges.alloc(edge);

    if let Some(old_head) = self.files.node(importer)?.first_outgoing {
      self.edges.edge_mut(old_head)?.prev_outgoing = Some(id);
    }
    self.files.node_mut(importer)?.first_outgoing = Some(id);

    if let Some(old_head) = self.files.node(importee)?.first_incoming {
      self.edges.edge_mut(old_head)?.prev_incoming = Some(id);
    }
    self.files.node_mut(importee)?.first_incoming = Some(id);

    Ok(id)
  }

  /// O(1) unlink of an edge from both adjacency lists.
  ///
  /// The predecessor (or the list head, when the edge is first) is repointed
  /// to the successor. It is never unconditionally cleared: doing so would
  /// silently orphan every edge behind this one and later surface as missed
  /// rebuilds or stale-edge dereferences.
  pub fn disconnect_edge(&mut self, id: EdgeId) -> Result<DependencyEdge, GraphError> {
    let edge = self.edges.free(id)?;

    match edge.prev_outgoing {
      Some(prev) => self.edges.edge_mut(prev)?.next_outgoing = edge.next_outgoing,
      None => self.files.node_mut(edge.importer)?.first_outgoing = edge.next_outgoing,
    }
    if let Some(next) = edge.next_outgoing {
      self.edges.edge_mut(next)?.prev_outgoing = edge.prev_outgoing;
    }

    match edge.prev_incoming {
      Some(prev) => self.edges.edge_mut(prev)?.next_incoming = edge.next_incoming,
      None => self.files.node_mut(edge.importee)?.first_incoming = edge.next_incoming,
    }
    if let Some(next) = edge.next_incoming {
      self.edges.edge_mut(next)?.prev_incoming = edge.prev_incoming;
    }

    Ok(edge)
  }

  pub fn edge(&self, id: EdgeId) -> Result<&DependencyEdge, GraphError> {
    self.edges.edge(id)
  }

  /// Lazy, finite, restartable iteration over a file's outbound edges.
  pub fn outgoing(&self, file: FileId) -> EdgeIter<'_> {
    EdgeIter {
      graph: self,
      next: self.files.node(file).ok().and_then(|node| node.first_outgoing),
      direction: Direction::Outgoing,
    }
  }

  /// Lazy, finite, restartable iteration over a file's inbound edges.
  pub fn incoming(&self, file: FileId) -> EdgeIter<'_> {
    EdgeIter {
      graph: self,
      next: self.files.node(file).ok().and_then(|node| node.first_incoming),
      direction: Direction::Incoming,
    }
  }

  pub fn count_outgoing(&self, file: FileId) -> usize {
    self.outgoing(file).count()
  }

  pub fn count_incoming(&self, file: FileId) -> usize {
    self.incoming(file).count()
  }

  /// Walk a file's outbound edges while allowing the callback to disconnect
  /// the edge it was handed. The successor is snapshotted before the callback
  /// runs, so disconnecting the current edge never derails the walk.
  /// Disconnecting *other* edges of the same list during the walk is not
  /// supported and surfaces as [`GraphError::StaleEdge`].
  pub fn visit_outgoing<F>(&mut self, file: FileId, mut f: F) -> Result<(), GraphError>
  where
    F: FnMut(&mut Graph, EdgeId),
  {
    let mut cursor = self.files.node(file)?.first_outgoing;
    while let Some(id) = cursor {
      let next = self.edges.edge(id)?.next_outgoing;
      f(self, id);
      cursor = next;
    }
    Ok(())
  }

  pub fn edge_count(&self) -> usize {
    self.edges.len()
  }
}

#[derive(Clone, Copy, Debug)]
enum Direction {
  Outgoing,
  Incoming,
}

/// Iterator over one adjacency list. The successor is read before an item is
/// yielded, so the caller may disconnect the yielded edge between steps.
pub struct EdgeIter<'a> {
  graph: &'a Graph,
  next: Option<EdgeId>,
  direction: Direction,
}

impl<'a> Iterator for EdgeIter<'a> {
  type Item = (EdgeId, &'a DependencyEdge);

  fn next(&mut self) -> Option<Self::Item> {
    let id = self.next?;
    let edge = self.graph.edges.edge(id).ok()?;
    self.next = match self.direction {
      Direction::Outgoing => edge.next_outgoing,
      Direction::Incoming => edge.next_incoming,
    };
    Some((id, edge))
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn graph_with_files(paths: &[&str]) -> (Graph, Vec<FileId>) {
    let mut graph = Graph::new();
    let ids = paths
      .iter()
      .map(|path| graph.get_or_create(Path::new(path)))
      .collect();
    (graph, ids)
  }

  fn outgoing_specifiers(graph: &Graph, file: FileId) -> Vec<String> {
    graph
      .outgoing(file)
      .map(|(_, edge)| edge.specifier.clone())
      .collect()
  }

  #[test]
  fn edges_insert_at_head_of_both_lists() {
    let (mut graph, ids) = graph_with_files(&["/a.ts", "/b.ts", "/c.ts"]);

    graph.add_edge(ids[0], ids[1], "./b", true).unwrap();
    graph.add_edge(ids[0], ids[2], "./c", true).unwrap();

    assert_eq!(outgoing_specifiers(&graph, ids[0]), vec!["./c", "./b"]);
    assert_eq!(graph.count_incoming(ids[1]), 1);
    assert_eq!(graph.count_incoming(ids[2]), 1);
  }

  #[test]
  fn disconnecting_a_middle_edge_keeps_the_rest_enumerable() {
    let (mut graph, ids) = graph_with_files(&["/a.ts", "/b.ts", "/c.ts", "/d.ts"]);

    graph.add_edge(ids[0], ids[1], "./b", true).unwrap();
    let middle = graph.add_edge(ids[0], ids[2], "./c", true).unwrap();
    graph.add_edge(ids[0], ids[3], "./d", true).unwrap();

    graph.disconnect_edge(middle).unwrap();

    // The unlink must relink predecessor to successor; a blanket head-clear
    // would leave only one (or zero) of these.
    assert_eq!(outgoing_specifiers(&graph, ids[0]), vec!["./d", "./b"]);
    assert_eq!(graph.count_incoming(ids[2]), 0);
    assert_eq!(graph.edge_count(), 2);
  }

  #[test]
  fn disconnecting_head_and_tail_edges() {
    let (mut graph, ids) = graph_with_files(&["/a.ts", "/b.ts", "/c.ts", "/d.ts"]);

    let tail = graph.add_edge(ids[0], ids[1], "./b", true).unwrap();
    graph.add_edge(ids[0], ids[2], "./c", true).unwrap();
    let head = graph.add_edge(ids[0], ids[3], "./d", true).unwrap();

    graph.disconnect_edge(head).unwrap();
    assert_eq!(outgoing_specifiers(&graph, ids[0]), vec!["./c", "./b"]);

    graph.disconnect_edge(tail).unwrap();
    assert_eq!(outgoing_specifiers(&graph, ids[0]), vec!["./c"]);
  }

  #[test]
  fn disconnected_edge_id_goes_stale() {
    let (mut graph, ids) = graph_with_files(&["/a.ts", "/b.ts"]);
    let edge = graph.add_edge(ids[0], ids[1], "./b", true).unwrap();

    graph.disconnect_edge(edge).unwrap();

    assert_eq!(graph.edge(edge).unwrap_err(), GraphError::StaleEdge(edge));
    assert_eq!(
      graph.disconnect_edge(edge).unwrap_err(),
      GraphError::StaleEdge(edge)
    );
  }

  #[test]
  fn visit_tolerates_disconnecting_the_current_edge() {
    let (mut graph, ids) = graph_with_files(&["/a.ts", "/b.ts", "/c.ts", "/d.ts"]);

    graph.add_edge(ids[0], ids[1], "./b", true).unwrap();
    graph.add_edge(ids[0], ids[2], "./c", true).unwrap();
    graph.add_edge(ids[0], ids[3], "./d", true).unwrap();

    let mut seen = Vec::new();
    graph
      .visit_outgoing(ids[0], |graph, edge| {
        seen.push(graph.edge(edge).unwrap().specifier.clone());
        // Disconnect every edge as we pass it
        graph.disconnect_edge(edge).unwrap();
      })
      .unwrap();

    assert_eq!(seen, vec!["./d", "./c", "./b"]);
    assert_eq!(graph.count_outgoing(ids[0]), 0);
    assert_eq!(graph.edge_count(), 0);
  }

  #[test]
  fn remove_requires_disconnection_in_both_directions() {
    let (mut graph, ids) = graph_with_files(&["/a.ts", "/b.ts"]);
    let edge = graph.add_edge(ids[0], ids[1], "./b", true).unwrap();

    assert_eq!(graph.remove_file(ids[0]).unwrap_err(), GraphError::InUse(ids[0]));
    assert_eq!(graph.remove_file(ids[1]).unwrap_err(), GraphError::InUse(ids[1]));

    graph.disconnect_edge(edge).unwrap();
    graph.remove_file(ids[0]).unwrap();
    graph.remove_file(ids[1]).unwrap();
    assert!(graph.files().is_empty());
  }

  #[test]
  fn incoming_list_survives_unrelated_disconnects() {
    // Three importers of one shared module; dropping the middle importer's
    // edge must leave the other two enumerable from the importee side.
    let (mut graph, ids) = graph_with_files(&["/a.ts", "/b.ts", "/c.ts", "/util.js"]);
    let util = ids[3];

    graph.add_edge(ids[0], util, "./util", true).unwrap();
    let middle = graph.add_edge(ids[1], util, "./util", true).unwrap();
    graph.add_edge(ids[2], util, "./util", true).unwrap();

    graph.disconnect_edge(middle).unwrap();

    let importers: Vec<FileId> = graph.incoming(util).map(|(_, edge)| edge.importer).collect();
    assert_eq!(importers, vec![ids[2], ids[0]]);
  }
}
