mod build_error;
#[allow(clippy::module_inception)]
mod diagnostic;
mod graph_error;

pub use self::build_error::*;
pub use self::diagnostic::*;
pub use self::graph_error::*;
