use serde::Deserialize;
use serde::Serialize;

/// One import discovered by the compiler in a module's source.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecord {
  /// The specifier text as written in the source
  pub specifier: String,
  /// Whether the specifier was statically analyzable. Dynamic specifiers
  /// still create edges, but cannot satisfy an accept declaration.
  pub is_static: bool,
}

impl ImportRecord {
  pub fn new(specifier: impl Into<String>, is_static: bool) -> Self {
    ImportRecord {
      specifier: specifier.into(),
      is_static,
    }
  }
}
