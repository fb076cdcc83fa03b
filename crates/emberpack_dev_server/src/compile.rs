use std::fmt::Debug;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;

use emberpack_core::diagnostic::BuildError;
use emberpack_core::types::CompiledModule;
use emberpack_core::types::ContentTag;
use emberpack_core::types::ImportRecord;

/// Result of compiling a single source file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompileOutput {
  pub tag: ContentTag,
  pub module: CompiledModule,
  pub imports: Vec<ImportRecord>,
  /// The module called `hot.accept()` with no specifiers.
  pub self_accept: bool,
  /// Specifiers the module declared dep-accepts for. Validated against the
  /// import list at trace time.
  pub accept_specifiers: Vec<String>,
}

/// The parser/transformer collaborator. Compiles one source file into output
/// plus its import list.
///
/// Implementations may run anywhere; the tracer spawns calls onto worker
/// tasks and applies results back on the single build-owning pass, so
/// compilers never see the graph.
#[async_trait]
pub trait Compiler: Debug + Send + Sync + 'static {
  async fn compile(
    &self,
    path: PathBuf,
    previous: Option<CompiledModule>,
  ) -> Result<CompileOutput, BuildError>;
}

/// Resolves an import specifier, relative to its importer, to a file path.
pub trait Resolver: Debug + Send + Sync + 'static {
  fn resolve(&self, importer: &Path, specifier: &str) -> Result<PathBuf, BuildError>;
}

/// Filesystem-backed resolver for relative specifiers, trying a fixed
/// extension list when the specifier has none.
#[derive(Debug)]
pub struct RelativeResolver {
  extensions: Vec<&'static str>,
}

impl Default for RelativeResolver {
  fn default() -> Self {
    RelativeResolver {
      extensions: vec!["ts", "tsx", "js", "jsx", "css"],
    }
  }
}

impl Resolver for RelativeResolver {
  fn resolve(&self, importer: &Path, specifier: &str) -> Result<PathBuf, BuildError> {
    let failure = || BuildError::ResolutionFailure {
      specifier: specifier.to_string(),
    };

    if !specifier.starts_with('.') {
      // Bare specifiers (packages) are out of scope for the dev loop
      return Err(failure());
    }

    let base = importer.parent().unwrap_or_else(|| Path::new("."));
    let joined = normalize(&base.join(specifier));

    if joined.extension().is_some() && joined.is_file() {
      return Ok(joined);
    }
    for extension in &self.extensions {
      let candidate = joined.with_extension(extension);
      if candidate.is_file() {
        return Ok(candidate);
      }
    }

    Err(failure())
  }
}

/// Lexically resolve `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      std::path::Component::CurDir => {}
      std::path::Component::ParentDir => {
        out.pop();
      }
      other => out.push(other),
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn normalize_collapses_relative_components() {
    assert_eq!(
      normalize(Path::new("/app/src/../lib/./util.ts")),
      PathBuf::from("/app/lib/util.ts")
    );
  }

  #[test]
  fn unresolvable_specifier_reports_expected_message() {
    let resolver = RelativeResolver::default();
    let error = resolver
      .resolve(Path::new("/definitely/missing/index.ts"), "./data")
      .unwrap_err();

    assert_eq!(error.to_string(), "Could not resolve: \"./data\"");
  }
}
