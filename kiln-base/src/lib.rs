pub mod b3f;
pub mod hashing;

mod id_newtype;

pub use b3f::{B3FReader, B3FWriter};
