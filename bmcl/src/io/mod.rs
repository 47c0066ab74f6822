//! I/O utilities.

mod hash_reader;

pub use hash_reader::{HashReader, HashResult};
