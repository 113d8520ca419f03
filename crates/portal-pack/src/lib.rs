mod error;
mod pack;
mod tree;
mod value;

pub use error::PackError;
pub use pack::{Pack, Unpack};
pub use tree::{flatten, map_leaves, unflatten, LeafShape, Structure};
pub use value::{Dtype, Value};
