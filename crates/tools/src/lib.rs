//! Byte-level helpers shared by the parser crates.

pub mod decode;
