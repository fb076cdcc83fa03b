use std::collections::HashMap;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;

use emberpack_core::diagnostic::BuildError;
use emberpack_core::types::CompiledModule;
use emberpack_core::types::ContentTag;
use emberpack_core::types::ImportRecord;

use crate::compile::CompileOutput;
use crate::compile::Compiler;
use crate::compile::Resolver;

/// One file known to the [`MemoryCompiler`].
#[derive(Clone, Debug, Default)]
pub struct MemoryFile {
  pub code: String,
  pub tag: ContentTag,
  pub imports: Vec<ImportRecord>,
  pub self_accept: bool,
  pub accept_specifiers: Vec<String>,
  /// When set, compiling this file fails with a transform error.
  pub fail: Option<String>,
}

impl MemoryFile {
  pub fn js(code: &str) -> Self {
    MemoryFile {
      code: code.to_string(),
      tag: ContentTag::JavaScript,
      ..Default::default()
    }
  }

  pub fn css(code: &str) -> Self {
    MemoryFile {
      code: code.to_string(),
      tag: ContentTag::Css,
      ..Default::default()
    }
  }

  pub fn importing(mut self, specifier: &str) -> Self {
    self.imports.push(ImportRecord::new(specifier, true));
    self
  }

  pub fn importing_dynamic(mut self, specifier: &str) -> Self {
    self.imports.push(ImportRecord::new(specifier, false));
    self
  }

  pub fn self_accepting(mut self) -> Self {
    self.self_accept = true;
    self
  }

  pub fn accepting(mut self, specifier: &str) -> Self {
    self.accept_specifiers.push(specifier.to_string());
    self
  }
}

/// In-memory compiler collaborator: a programmable map of path to output,
/// with a compile counter for asserting how much work a pass performed.
#[derive(Debug, Default)]
pub struct MemoryCompiler {
  files: Mutex<HashMap<PathBuf, MemoryFile>>,
  compile_count: AtomicUsize,
}

impl MemoryCompiler {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn insert(&self, path: &str, file: MemoryFile) {
    self.files.lock().unwrap().insert(PathBuf::from(path), file);
  }

  pub fn remove(&self, path: &str) {
    self.files.lock().unwrap().remove(Path::new(path));
  }

  pub fn contains(&self, path: &Path) -> bool {
    self.files.lock().unwrap().contains_key(path)
  }

  pub fn compile_count(&self) -> usize {
    self.compile_count.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Compiler for MemoryCompiler {
  async fn compile(
    &self,
    path: PathBuf,
    _previous: Option<CompiledModule>,
  ) -> Result<CompileOutput, BuildError> {
    self.compile_count.fetch_add(1, Ordering::SeqCst);
    let file = {
      let files = self.files.lock().unwrap();
      files.get(&path).cloned()
    };

    let Some(file) = file else {
      return Err(BuildError::TransformFailure {
        file: path,
        message: String::from("no such file"),
      });
    };
    if let Some(message) = file.fail {
      return Err(BuildError::TransformFailure {
        file: path,
        message,
      });
    }

    Ok(CompileOutput {
      tag: file.tag,
      module: CompiledModule {
        code: file.code,
        source_map: None,
      },
      imports: file.imports,
      self_accept: file.self_accept,
      accept_specifiers: file.accept_specifiers,
    })
  }
}

/// Resolver over the [`MemoryCompiler`]'s file set; no filesystem involved.
#[derive(Debug)]
pub struct MemoryResolver {
  compiler: Arc<MemoryCompiler>,
  extensions: Vec<&'static str>,
}

impl MemoryResolver {
  pub fn new(compiler: Arc<MemoryCompiler>) -> Self {
    MemoryResolver {
      compiler,
      extensions: vec!["ts", "tsx", "js", "jsx", "css"],
    }
  }
}

impl Resolver for MemoryResolver {
  fn resolve(&self, importer: &Path, specifier: &str) -> Result<PathBuf, BuildError> {
    let base = importer.parent().unwrap_or_else(|| Path::new("/"));
    let joined = normalize(&base.join(specifier));

    if self.compiler.contains(&joined) {
      return Ok(joined);
    }
    for extension in &self.extensions {
      let candidate = joined.with_extension(extension);
      if self.compiler.contains(&candidate) {
        return Ok(candidate);
      }
    }

    Err(BuildError::ResolutionFailure {
      specifier: specifier.to_string(),
    })
  }
}

fn normalize(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        out.pop();
      }
      other => out.push(other),
    }
  }
  out
}
