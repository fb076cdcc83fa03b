mod chunk;
mod content;
mod import;

pub use self::chunk::*;
pub use self::content::*;
pub use self::import::*;
