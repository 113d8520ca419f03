use crate::{error::PackError, value::Value};

/// Trait the RPC core depends on rather than the concrete [`Value`] type, so
/// a different packing service (e.g. one backed by real shared-memory
/// arrays) can be dropped in without touching `portal`.
pub trait Pack {
    fn pack(&self) -> Vec<Vec<u8>>;
}

pub trait Unpack: Sized {
    fn unpack(bytes: &[u8]) -> Result<Self, PackError>;
}

impl Pack for Value {
    fn pack(&self) -> Vec<Vec<u8>> {
        Value::pack(self)
    }
}

impl Unpack for Value {
    fn unpack(bytes: &[u8]) -> Result<Self, PackError> {
        Value::unpack(bytes)
    }
}
