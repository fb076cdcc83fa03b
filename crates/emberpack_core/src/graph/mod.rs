mod edge_pool;
mod file_store;
#[allow(clippy::module_inception)]
mod graph;

pub use self::edge_pool::*;
pub use self::file_store::*;
pub use self::graph::*;
