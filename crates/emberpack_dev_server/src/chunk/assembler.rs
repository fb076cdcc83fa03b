use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use parcel_sourcemap::SourceMap;

use emberpack_core::graph::FileId;
use emberpack_core::graph::Graph;
use emberpack_core::types::ChunkPart;
use emberpack_core::types::ContentTag;
use emberpack_core::types::FileContent;
use emberpack_core::types::SourceMapData;

/// Bootstrap source prepended to every JS chunk. Always the first source map
/// entry, so mapping generation stays stable across rebuilds.
const RUNTIME_SOURCE: &str = include_str!("runtime.js");
const RUNTIME_URL: &str = "emberpack:runtime";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChunkKind {
  JavaScript,
  Css,
}

/// A deliverable chunk: concatenated module output plus its source map.
#[derive(Clone, Debug)]
pub struct Chunk {
  pub kind: ChunkKind,
  pub code: String,
  pub source_map: String,
  /// Highest generation among contributing files.
  pub generation: u64,
  /// Contributing files in evaluation order.
  pub files: Vec<FileId>,
}

/// Concatenates ready file outputs into deliverable chunks.
///
/// Emission order is dependency postorder (importees before importers), so
/// module evaluation order is deterministic regardless of any module's use of
/// asynchronous top-level work. Parts whose node content is `Unknown` are
/// skipped, never dereferenced.
#[derive(Debug)]
pub struct ChunkAssembler {
  project_root: PathBuf,
}

impl ChunkAssembler {
  pub fn new(project_root: impl Into<PathBuf>) -> Self {
    ChunkAssembler {
      project_root: project_root.into(),
    }
  }

  /// Build one JS chunk and, when any part is CSS, one CSS chunk.
  pub fn assemble(&self, graph: &Graph, parts: &[ChunkPart]) -> anyhow::Result<Vec<Chunk>> {
    let ordered = self.order_parts(graph, parts)?;

    let mut js = Vec::new();
    let mut css = Vec::new();
    for (part, module) in ordered {
      match part.tag {
        ContentTag::Css => css.push((part, module)),
        _ => js.push((part, module)),
      }
    }

    let mut chunks = Vec::new();
    if !js.is_empty() {
      chunks.push(self.emit_js(graph, &js)?);
    }
    if !css.is_empty() {
      chunks.push(self.emit_css(graph, &css)?);
    }
    Ok(chunks)
  }

  /// Dependency postorder over the parts subgraph, restarted from each part
  /// in batch order so the result is stable across repeated builds.
  fn order_parts<'a>(
    &self,
    graph: &'a Graph,
    parts: &'a [ChunkPart],
  ) -> anyhow::Result<Vec<(&'a ChunkPart, &'a emberpack_core::types::CompiledModule)>> {
    let by_file: HashMap<FileId, &ChunkPart> =
      parts.iter().map(|part| (part.file, part)).collect();
    let mut visited: HashSet<FileId> = HashSet::new();
    let mut ordered = Vec::with_capacity(parts.len());

    for part in parts {
      self.visit(graph, part.file, &by_file, &mut visited, &mut ordered)?;
    }

    let mut result = Vec::with_capacity(ordered.len());
    for file in ordered {
      let part = by_file[&file];
      let node = graph.node(file)?;
      match &node.content {
        FileContent::Ready(module) => result.push((part, module)),
        // A part may reference a node that went unknown after it was
        // accumulated; it is skipped here rather than dereferenced.
        FileContent::Unknown { .. } | FileContent::Pending => continue,
      }
    }
    Ok(result)
  }

  fn visit(
    &self,
    graph: &Graph,
    file: FileId,
    by_file: &HashMap<FileId, &ChunkPart>,
    visited: &mut HashSet<FileId>,
    ordered: &mut Vec<FileId>,
  ) -> anyhow::Result<()> {
    if !by_file.contains_key(&file) || !visited.insert(file) {
      return Ok(());
    }
    let importees: Vec<FileId> = graph
      .outgoing(file)
      .map(|(_, edge)| edge.importee)
      .collect();
    for importee in importees {
      self.visit(graph, importee, by_file, visited, ordered)?;
    }
    ordered.push(file);
    Ok(())
  }

  fn emit_js(
    &self,
    graph: &Graph,
    parts: &[(&ChunkPart, &emberpack_core::types::CompiledModule)],
  ) -> anyhow::Result<Chunk> {
    let mut map = SourceMap::new(&self.project_root.to_string_lossy());
    map
      .add_empty_map(RUNTIME_URL, RUNTIME_SOURCE, 0)
      .map_err(|error| anyhow!("source map error: {:?}", error))?;

    let mut code = String::from(RUNTIME_SOURCE);
    let mut files = Vec::with_capacity(parts.len());
    let mut generation = 0;

    for (part, module) in parts {
      let url = self.module_url(graph, part.file)?;
      code.push_str(&format!(
        "__emberpack.register({url:?}, function (module, exports, require) {{\n"
      ));

      let body_offset = line_count(&code);
      self.splice_map(&mut map, &url, module, body_offset)?;
      code.push_str(&module.code);
      if !module.code.ends_with('\n') {
        code.push('\n');
      }
      code.push_str("});\n");

      files.push(part.file);
      generation = generation.max(part.generation);
    }

    Ok(Chunk {
      kind: ChunkKind::JavaScript,
      source_map: map
        .to_json(None)
        .map_err(|error| anyhow!("source map error: {:?}", error))?,
      code,
      generation,
      files,
    })
  }

  fn emit_css(
    &self,
    graph: &Graph,
    parts: &[(&ChunkPart, &emberpack_core::types::CompiledModule)],
  ) -> anyhow::Result<Chunk> {
    let mut map = SourceMap::new(&self.project_root.to_string_lossy());
    let mut code = String::new();
    let mut files = Vec::with_capacity(parts.len());
    let mut generation = 0;

    for (part, module) in parts {
      let url = self.module_url(graph, part.file)?;
      code.push_str(&format!("/* {url} */\n"));

      let body_offset = line_count(&code);
      self.splice_map(&mut map, &url, module, body_offset)?;
      code.push_str(&module.code);
      if !module.code.ends_with('\n') {
        code.push('\n');
      }

      files.push(part.file);
      generation = generation.max(part.generation);
    }

    Ok(Chunk {
      kind: ChunkKind::Css,
      source_map: map
        .to_json(None)
        .map_err(|error| anyhow!("source map error: {:?}", error))?,
      code,
      generation,
      files,
    })
  }

  fn splice_map(
    &self,
    map: &mut SourceMap,
    url: &str,
    module: &emberpack_core::types::CompiledModule,
    line_offset: usize,
  ) -> anyhow::Result<()> {
    match &module.source_map {
      Some(SourceMapData {
        mappings,
        sources,
        sources_content,
        names,
      }) => map
        .add_vlq_map(
          mappings.as_bytes(),
          sources.iter().map(|s| s.as_str()).collect(),
          sources_content.iter().map(|s| s.as_str()).collect(),
          names.iter().map(|s| s.as_str()).collect(),
          line_offset as i64,
          0,
        )
        .map_err(|error| anyhow!("source map error: {:?}", error)),
      None => map
        .add_empty_map(url, &module.code, line_offset as i64)
        .map_err(|error| anyhow!("source map error: {:?}", error)),
    }
  }

  fn module_url(&self, graph: &Graph, file: FileId) -> anyhow::Result<String> {
    let path = &graph.node(file)?.path;
    let relative = path.strip_prefix(&self.project_root).unwrap_or(path);
    Ok(format!("/{}", relative.to_string_lossy().replace('\\', "/")))
  }
}

fn line_count(s: &str) -> usize {
  s.bytes().filter(|&b| b == b'\n').count()
}
