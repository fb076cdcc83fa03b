use std::path::PathBuf;

use thiserror::Error;

use super::Diagnostic;

/// Errors produced while tracing a change batch through the graph.
///
/// None of these abort the batch. They are recovered at the tracer boundary
/// and surfaced to connected sessions as an error overlay.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
  /// An import specifier did not resolve to a file.
  #[error("Could not resolve: {specifier:?}")]
  ResolutionFailure { specifier: String },

  /// The compiler collaborator rejected a file.
  #[error("Failed to compile {}: {message}", file.display())]
  TransformFailure { file: PathBuf, message: String },

  /// An accept call referenced a specifier that is not a direct import of the
  /// accepting module. A usage error reported to the developer, never fatal
  /// to the graph.
  #[error("{:?} accepts {specifier:?}, which it does not import", module.display())]
  InvalidAcceptSpecifier { module: PathBuf, specifier: String },
}

impl BuildError {
  pub fn file(&self) -> Option<&PathBuf> {
    match self {
      BuildError::ResolutionFailure { .. } => None,
      BuildError::TransformFailure { file, .. } => Some(file),
      BuildError::InvalidAcceptSpecifier { module, .. } => Some(module),
    }
  }

  pub fn to_diagnostic(&self) -> Diagnostic {
    let mut diagnostic = Diagnostic::new(self.to_string());
    diagnostic.file = self.file().cloned();
    if let BuildError::InvalidAcceptSpecifier { .. } = self {
      diagnostic.hints.push(String::from(
        "hot.accept specifiers must be string literals matching a direct import",
      ));
    }
    diagnostic
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn resolution_failure_matches_reported_format() {
    let error = BuildError::ResolutionFailure {
      specifier: String::from("./data"),
    };

    assert_eq!(error.to_string(), "Could not resolve: \"./data\"");
  }
}
