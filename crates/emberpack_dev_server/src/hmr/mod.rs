#[allow(clippy::module_inception)]
mod hmr;

pub use self::hmr::*;
