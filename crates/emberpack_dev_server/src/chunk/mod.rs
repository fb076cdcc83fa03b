mod assembler;

pub use self::assembler::*;
