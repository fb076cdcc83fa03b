use std::fmt::Display;
use std::fmt::Formatter;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// A user facing error, rendered on the client error overlay.
///
/// Usually but not always this is linked to a source file.
#[derive(Error, Debug, Deserialize, PartialEq, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
  /// A summary user-facing message
  pub message: String,

  /// The file this diagnostic was emitted for, when known
  pub file: Option<PathBuf>,

  /// Hints for the user
  pub hints: Vec<String>,
}

impl Display for Diagnostic {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.message)
  }
}

impl Diagnostic {
  pub fn new(message: impl Into<String>) -> Self {
    Diagnostic {
      message: message.into(),
      ..Default::default()
    }
  }

  pub fn for_file(message: impl Into<String>, file: impl Into<PathBuf>) -> Self {
    Diagnostic {
      message: message.into(),
      file: Some(file.into()),
      ..Default::default()
    }
  }
}
