pub mod diagnostic;
pub mod graph;
pub mod hash;
pub mod types;
