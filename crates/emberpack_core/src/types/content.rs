use serde::Deserialize;
use serde::Serialize;

use crate::diagnostic::Diagnostic;

/// What kind of output a file compiles to.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentTag {
  #[default]
  JavaScript,
  Css,
  Html,
  Asset,
  /// The file exists in the graph but its kind has not been determined, e.g.
  /// because it never compiled successfully.
  Unknown,
}

/// A single module's source map, kept in the raw VLQ form the compiler
/// produced so chunk assembly can splice it at a line offset.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMapData {
  pub mappings: String,
  pub sources: Vec<String>,
  pub sources_content: Vec<String>,
  pub names: Vec<String>,
}

/// Compiled output for one file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledModule {
  pub code: String,
  pub source_map: Option<SourceMapData>,
}

/// The content state of a file record.
///
/// `Unknown` is a first-class state, not an error path: a file enters it when
/// its build fails or its content is discarded, and every consumer is forced
/// to handle it. Chunk assembly skips `Unknown` parts rather than
/// dereferencing them.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum FileContent {
  /// Registered but not yet compiled.
  #[default]
  Pending,
  Ready(CompiledModule),
  Unknown {
    error: Option<Diagnostic>,
  },
}

impl FileContent {
  pub fn ready(&self) -> Option<&CompiledModule> {
    match self {
      FileContent::Ready(module) => Some(module),
      _ => None,
    }
  }

  pub fn is_unknown(&self) -> bool {
    matches!(self, FileContent::Unknown { .. })
  }
}
