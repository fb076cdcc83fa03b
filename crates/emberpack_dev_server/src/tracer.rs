use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use emberpack_core::diagnostic::BuildError;
use emberpack_core::diagnostic::Diagnostic;
use emberpack_core::diagnostic::GraphError;
use emberpack_core::graph::EdgeId;
use emberpack_core::graph::FileId;
use emberpack_core::graph::Graph;
use emberpack_core::hash::hash_bytes;
use emberpack_core::types::ChunkPart;
use emberpack_core::types::ContentTag;
use emberpack_core::types::FileContent;

use crate::compile::CompileOutput;
use crate::compile::Compiler;
use crate::compile::Resolver;
use crate::protocol::SyncEvent;
use crate::watch::WatchBatch;
use crate::watch::WatchEventKind;

/// Result of tracing one change batch through the graph.
#[derive(Debug)]
pub struct TraceOutcome {
  /// `ResultDidNotBundle` when the compiled graph did not change, otherwise
  /// `AnyBuildFinished` or its blocking variant.
  pub event: SyncEvent,
  /// Files whose output changed this pass, for the chunk assembler.
  pub parts: Vec<ChunkPart>,
  /// No accepting ancestor was found for at least one changed file; clients
  /// must fall back to a full reload.
  pub requires_reload: bool,
  /// Nearest accepting ancestors for the patched updates.
  pub boundaries: Vec<FileId>,
  /// Diagnostics to surface on the error overlay. Never aborts the batch.
  pub errors: Vec<Diagnostic>,
  /// Graph generation after the pass; delivered messages carry it.
  pub generation: u64,
}

impl TraceOutcome {
  pub fn did_bundle(&self) -> bool {
    self.event != SyncEvent::ResultDidNotBundle
  }
}

type CompileMessage = (FileId, Result<CompileOutput, BuildError>);

/// Per-pass bookkeeping. Compiles run on worker tasks; everything in here is
/// only ever touched by the owning pass.
struct Pass {
  tx: mpsc::UnboundedSender<CompileMessage>,
  scheduled: HashSet<FileId>,
  outstanding: usize,
  bundled: bool,
  changed: Vec<FileId>,
  errors: Vec<Diagnostic>,
}

/// Drives a build pass over a watch batch: re-compiles changed files, applies
/// edge deltas, finds HMR boundaries and accumulates chunk parts.
///
/// Exactly one pass runs at a time (batches queue behind the caller), which
/// is what lets the graph get by without any locking. Compiles are spawned
/// onto tokio tasks; their results are applied back serially, one whole
/// result at a time, so a dropped pass discards in-flight results without
/// ever leaving a file half-mutated.
#[derive(Debug)]
pub struct ChangeTracer {
  compiler: Arc<dyn Compiler>,
  resolver: Arc<dyn Resolver>,
  block_on_websockets: bool,
  /// Files whose last compile or resolution failed; retried whenever a batch
  /// creates new files, since a new file may satisfy the failing specifier.
  pending_failures: HashSet<FileId>,
}

impl ChangeTracer {
  pub fn new(
    compiler: Arc<dyn Compiler>,
    resolver: Arc<dyn Resolver>,
    block_on_websockets: bool,
  ) -> Self {
    ChangeTracer {
      compiler,
      resolver,
      block_on_websockets,
      pending_failures: HashSet::new(),
    }
  }

  #[tracing::instrument(level = "info", skip_all, fields(files = batch.len()))]
  pub async fn trace(
    &mut self,
    graph: &mut Graph,
    batch: &WatchBatch,
  ) -> anyhow::Result<TraceOutcome> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut pass = Pass {
      tx,
      scheduled: HashSet::new(),
      outstanding: 0,
      bundled: false,
      changed: Vec::new(),
      errors: Vec::new(),
    };
    let mut deleted = Vec::new();
    let mut created_any = false;

    for (path, kind) in batch.changes() {
      match kind {
        WatchEventKind::Deleted => {
          let Some(id) = graph.get(path) else { continue };
          graph.mark_unknown(id, None)?;
          pass.bundled = true;
          // Its imports went with it; importers must re-resolve.
          graph.visit_outgoing(id, |graph, edge| {
            let _ = graph.disconnect_edge(edge);
          })?;
          let importers: Vec<FileId> =
            graph.incoming(id).map(|(_, edge)| edge.importer).collect();
          for importer in importers {
            self.schedule(graph, importer, &mut pass)?;
          }
          deleted.push(id);
        }
        WatchEventKind::Created | WatchEventKind::Modified => {
          if kind == WatchEventKind::Created {
            created_any = true;
          }
          let id = graph.get_or_create(path);
          self.schedule(graph, id, &mut pass)?;
        }
      }
    }

    if created_any {
      // A new file may satisfy a previously failing specifier.
      let retries: Vec<FileId> = self.pending_failures.iter().copied().collect();
      for id in retries {
        self.schedule(graph, id, &mut pass)?;
      }
    }

    // Suspension point: workers finish here, results are applied only on
    // this pass.
    while pass.outstanding > 0 {
      let Some((id, result)) = rx.recv().await else { break };
      pass.outstanding -= 1;
      match result {
        Ok(output) => self.apply_output(graph, id, output, &mut pass)?,
        Err(error) => {
          let diagnostic = error.to_diagnostic();
          tracing::warn!(%error, "compile failed");
          graph.mark_unknown(id, Some(diagnostic.clone()))?;
          pass.errors.push(diagnostic);
          self.pending_failures.insert(id);
          pass.bundled = true;
        }
      }
    }

    // Deleted records go away once nothing points at them; while a stale
    // import still does, the record stays, as an `Unknown` tombstone.
    for id in deleted {
      if graph.node(id).is_ok() && graph.count_incoming(id) == 0 {
        graph.visit_outgoing(id, |graph, edge| {
          let _ = graph.disconnect_edge(edge);
        })?;
        graph.remove_file(id)?;
      }
    }

    let mut requires_reload = false;
    let mut boundaries = Vec::new();
    let mut seen_boundaries = HashSet::new();
    let mut parts = Vec::new();

    for &root in &pass.changed {
      let node = graph.node(root)?;
      match node.content {
        FileContent::Ready(_) => parts.push(ChunkPart {
          file: root,
          tag: node.tag,
          generation: node.generation,
        }),
        // Went unknown after its compile was applied (e.g. a later deletion
        // in the same batch); nothing to deliver for it.
        FileContent::Unknown { .. } | FileContent::Pending => continue,
      }

      match find_hmr_boundary(graph, root)? {
        Boundary::Accepted(found) => {
          for boundary in found {
            if seen_boundaries.insert(boundary) {
              boundaries.push(boundary);
            }
          }
        }
        Boundary::Reload => requires_reload = true,
      }
    }

    let event = if !pass.bundled {
      SyncEvent::ResultDidNotBundle
    } else if self.block_on_websockets {
      SyncEvent::AnyBuildFinishedWaitForWebSockets
    } else {
      SyncEvent::AnyBuildFinished
    };

    tracing::info!(
      ?event,
      parts = parts.len(),
      requires_reload,
      errors = pass.errors.len(),
      "batch traced"
    );

    Ok(TraceOutcome {
      event,
      parts,
      requires_reload,
      boundaries,
      errors: pass.errors,
      generation: graph.current_generation(),
    })
  }

  fn schedule(&self, graph: &Graph, id: FileId, pass: &mut Pass) -> Result<(), GraphError> {
    if !pass.scheduled.insert(id) {
      return Ok(());
    }
    let node = graph.node(id)?;
    let path = node.path.clone();
    let previous = node.content.ready().cloned();
    let compiler = Arc::clone(&self.compiler);
    let tx = pass.tx.clone();
    pass.outstanding += 1;
    tokio::spawn(async move {
      let result = compiler.compile(path, previous).await;
      // A cancelled pass drops the receiver; the whole result is discarded.
      let _ = tx.send((id, result));
    });
    Ok(())
  }

  /// Apply one compile result on the owning pass: content, accept flags and
  /// the outbound edge delta. Work here is proportional to this file's
  /// import list, never to the graph.
  fn apply_output(
    &mut self,
    graph: &mut Graph,
    id: FileId,
    output: CompileOutput,
    pass: &mut Pass,
  ) -> anyhow::Result<()> {
    let CompileOutput {
      tag,
      module,
      imports,
      self_accept,
      accept_specifiers,
    } = output;

    let node = graph.node(id)?;
    let path = node.path.clone();

    let unchanged = node.tag == tag
      && node.content.ready().is_some_and(|previous| {
        hash_bytes(previous.code.as_bytes()) == hash_bytes(module.code.as_bytes())
      });
    if unchanged {
      self.pending_failures.remove(&id);
      tracing::debug!(path = %path.display(), "byte-identical rewrite, not advancing");
      return Ok(());
    }

    // An accept call's specifiers must name direct imports; anything else is
    // a usage error reported to the developer, not silently ignored.
    let import_set: HashSet<&str> = imports
      .iter()
      .map(|record| record.specifier.as_str())
      .collect();
    let mut accepted = Vec::new();
    for specifier in accept_specifiers {
      if import_set.contains(specifier.as_str()) {
        accepted.push(specifier);
      } else {
        pass.errors.push(
          BuildError::InvalidAcceptSpecifier {
            module: path.clone(),
            specifier,
          }
          .to_diagnostic(),
        );
      }
    }

    graph.set_content(id, tag, module)?;
    {
      let node = graph.node_mut(id)?;
      node.self_accept = self_accept;
      node.accept_specifiers = accepted;
    }
    self.pending_failures.remove(&id);
    pass.bundled = true;

    // Diff the new import list against existing outbound edges and apply
    // only the delta.
    let mut existing: HashMap<String, EdgeId> = graph
      .outgoing(id)
      .map(|(edge_id, edge)| (edge.specifier.clone(), edge_id))
      .collect();
    let mut resolution_errors = Vec::new();

    for record in imports {
      if existing.remove(&record.specifier).is_some() {
        continue;
      }
      match self.resolver.resolve(&path, &record.specifier) {
        Ok(target) => {
          let importee = graph.get_or_create(&target);
          graph.add_edge(id, importee, record.specifier, record.is_static)?;
          if matches!(graph.node(importee)?.content, FileContent::Pending) {
            self.schedule(graph, importee, pass)?;
          }
        }
        Err(error) => resolution_errors.push(error),
      }
    }
    for (_, edge_id) in existing {
      graph.disconnect_edge(edge_id)?;
    }

    if resolution_errors.is_empty() {
      pass.changed.push(id);
    } else {
      // The file cannot contribute to a chunk until its imports resolve;
      // dependents keep their previous generation.
      let mut first = None;
      for error in resolution_errors {
        let mut diagnostic = error.to_diagnostic();
        diagnostic.file = Some(path.clone());
        if first.is_none() {
          first = Some(diagnostic.clone());
        }
        pass.errors.push(diagnostic);
      }
      graph.mark_unknown(id, first)?;
      self.pending_failures.insert(id);
    }

    Ok(())
  }
}

enum Boundary {
  Accepted(Vec<FileId>),
  Reload,
}

/// Ascend inbound edges from a changed file to the nearest accepting
/// ancestors. Each branch stops at the first self-accepting module, or at an
/// importer that dep-accepts the specifier it imports the child through. A
/// branch that reaches a module with no importers without finding an accept
/// forces a full reload.
fn find_hmr_boundary(graph: &Graph, root: FileId) -> Result<Boundary, GraphError> {
  // Stylesheets swap in place; they are their own boundary.
  if graph.node(root)?.tag == ContentTag::Css {
    return Ok(Boundary::Accepted(vec![root]));
  }

  let mut visited = HashSet::new();
  visited.insert(root);
  let mut stack = vec![root];
  let mut boundaries = Vec::new();

  while let Some(id) = stack.pop() {
    let node = graph.node(id)?;
    if node.self_accept {
      boundaries.push(id);
      continue;
    }

    let importers: Vec<(FileId, String, bool)> = graph
      .incoming(id)
      .map(|(_, edge)| (edge.importer, edge.specifier.clone(), edge.is_static))
      .collect();
    if importers.is_empty() {
      return Ok(Boundary::Reload);
    }

    for (importer, specifier, is_static) in importers {
      let importer_node = graph.node(importer)?;
      // Dynamic imports cannot satisfy an accept declaration.
      if is_static
        && importer_node
          .accept_specifiers
          .iter()
          .any(|accepted| *accepted == specifier)
      {
        if visited.insert(importer) {
          boundaries.push(importer);
        }
      } else if visited.insert(importer) {
        stack.push(importer);
      }
    }
  }

  Ok(Boundary::Accepted(boundaries))
}
