use std::sync::Arc;

use crate::error::PackError;

/// Scalar element type of an [`Value::Array`], mirroring numpy's dtype
/// strings from the Python source's packing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
}

impl Dtype {
    fn tag(self) -> u8 {
        match self {
            Dtype::I8 => 0,
            Dtype::I16 => 1,
            Dtype::I32 => 2,
            Dtype::I64 => 3,
            Dtype::U8 => 4,
            Dtype::U16 => 5,
            Dtype::U32 => 6,
            Dtype::U64 => 7,
            Dtype::F32 => 8,
            Dtype::F64 => 9,
            Dtype::Bool => 10,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, PackError> {
        Ok(match tag {
            0 => Dtype::I8,
            1 => Dtype::I16,
            2 => Dtype::I32,
            3 => Dtype::I64,
            4 => Dtype::U8,
            5 => Dtype::U16,
            6 => Dtype::U32,
            7 => Dtype::U64,
            8 => Dtype::F32,
            9 => Dtype::F64,
            10 => Dtype::Bool,
            other => return Err(PackError::UnknownTag(other)),
        })
    }

    /// Size in bytes of one element of this dtype.
    pub fn itemsize(self) -> usize {
        match self {
            Dtype::I8 | Dtype::U8 | Dtype::Bool => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::I32 | Dtype::U32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::U64 | Dtype::F64 => 8,
        }
    }
}

/// The value tree the core RPC machinery packs onto the wire and unpacks off
/// of it. Grounded on the Python source's use of `elements.tree` values:
/// byte strings, UTF-8 strings, numpy-like arrays, opaque shared-array
/// handles, `None`, and nested lists/dicts.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bytes(Arc<[u8]>),
    Str(String),
    Array { dtype: Dtype, shape: Vec<u64>, data: Arc<[u8]> },
    /// Opaque handle to out-of-band shared data. The core never interprets
    /// its bytes; it exists so a packing service backed by real shared
    /// memory can thread a handle through the same tree shape.
    Shared(Arc<[u8]>),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn array(dtype: Dtype, shape: Vec<u64>, data: impl Into<Arc<[u8]>>) -> Result<Self, PackError> {
        let data = data.into();
        let expected: u64 = shape.iter().product::<u64>() * dtype.itemsize() as u64;
        if expected != data.len() as u64 {
            return Err(PackError::ShapeMismatch { dtype, shape, len: data.len() });
        }
        Ok(Value::Array { dtype, shape, data })
    }

    /// Ordered byte segments whose concatenation decodes back to this value.
    /// Segments are split so large array payloads can be handed to scatter
    /// writes without copying.
    pub fn pack(&self) -> Vec<Vec<u8>> {
        let mut segments = Vec::new();
        self.pack_into(&mut segments);
        segments
    }

    fn pack_into(&self, out: &mut Vec<Vec<u8>>) {
        match self {
            Value::Null => out.push(vec![0]),
            Value::Bytes(b) => {
                let mut header = Vec::with_capacity(9);
                header.push(1);
                header.extend_from_slice(&(b.len() as u64).to_le_bytes());
                out.push(header);
                out.push(b.to_vec());
            }
            Value::Str(s) => {
                let bytes = s.as_bytes();
                let mut header = Vec::with_capacity(9);
                header.push(2);
                header.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                out.push(header);
                out.push(bytes.to_vec());
            }
            Value::Array { dtype, shape, data } => {
                let mut header = Vec::with_capacity(2 + 8 + 8 * shape.len() + 8);
                header.push(3);
                header.push(dtype.tag());
                header.extend_from_slice(&(shape.len() as u64).to_le_bytes());
                for dim in shape {
                    header.extend_from_slice(&dim.to_le_bytes());
                }
                header.extend_from_slice(&(data.len() as u64).to_le_bytes());
                out.push(header);
                out.push(data.to_vec());
            }
            Value::Shared(handle) => {
                let mut header = Vec::with_capacity(9);
                header.push(4);
                header.extend_from_slice(&(handle.len() as u64).to_le_bytes());
                out.push(header);
                out.push(handle.to_vec());
            }
            Value::List(items) => {
                let mut header = Vec::with_capacity(9);
                header.push(5);
                header.extend_from_slice(&(items.len() as u64).to_le_bytes());
                out.push(header);
                for item in items {
                    item.pack_into(out);
                }
            }
            Value::Map(entries) => {
                let mut header = Vec::with_capacity(9);
                header.push(6);
                header.extend_from_slice(&(entries.len() as u64).to_le_bytes());
                out.push(header);
                for (key, value) in entries {
                    let key_bytes = key.as_bytes();
                    let mut key_header = Vec::with_capacity(8);
                    key_header.extend_from_slice(&(key_bytes.len() as u64).to_le_bytes());
                    out.push(key_header);
                    out.push(key_bytes.to_vec());
                    value.pack_into(out);
                }
            }
        }
    }

    /// Decodes a value from a fully concatenated buffer (as produced by
    /// joining the segments from [`Value::pack`]).
    pub fn unpack(bytes: &[u8]) -> Result<Self, PackError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let value = cursor.read_value()?;
        Ok(value)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PackError> {
        if self.pos + n > self.bytes.len() {
            return Err(PackError::Truncated { expected: self.pos + n, got: self.bytes.len() });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, PackError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, PackError> {
        let slice = self.take(8)?;
        Ok(u64::from_le_bytes(slice.try_into().expect("exactly 8 bytes")))
    }

    fn read_value(&mut self) -> Result<Value, PackError> {
        let tag = self.u8()?;
        match tag {
            0 => Ok(Value::Null),
            1 => {
                let len = self.u64()? as usize;
                Ok(Value::Bytes(self.take(len)?.into()))
            }
            2 => {
                let len = self.u64()? as usize;
                let raw = self.take(len)?;
                let s = std::str::from_utf8(raw).map_err(|_| PackError::InvalidUtf8)?;
                Ok(Value::Str(s.to_string()))
            }
            3 => {
                let dtype = Dtype::from_tag(self.u8()?)?;
                let ndim = self.u64()? as usize;
                let mut shape = Vec::with_capacity(ndim);
                for _ in 0..ndim {
                    shape.push(self.u64()?);
                }
                let len = self.u64()? as usize;
                let data = self.take(len)?;
                Value::array(dtype, shape, data)
            }
            4 => {
                let len = self.u64()? as usize;
                Ok(Value::Shared(self.take(len)?.into()))
            }
            5 => {
                let count = self.u64()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_value()?);
                }
                Ok(Value::List(items))
            }
            6 => {
                let count = self.u64()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = self.u64()? as usize;
                    let key_bytes = self.take(key_len)?;
                    let key = std::str::from_utf8(key_bytes).map_err(|_| PackError::InvalidUtf8)?.to_string();
                    let value = self.read_value()?;
                    entries.push((key, value));
                }
                Ok(Value::Map(entries))
            }
            other => Err(PackError::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &Value) {
        let packed: Vec<u8> = value.pack().into_iter().flatten().collect();
        let decoded = Value::unpack(&packed).expect("unpack");
        assert_eq!(&decoded, value);
    }

    #[test]
    fn round_trips_scalars() {
        roundtrip(&Value::Null);
        roundtrip(&Value::Bytes(Arc::from(b"hello".as_slice())));
        roundtrip(&Value::Str("hello".to_string()));
    }

    #[test]
    fn round_trips_array() {
        let data: Arc<[u8]> = Arc::from([1u8, 2, 3, 4, 5, 6, 7, 8].as_slice());
        let value = Value::array(Dtype::I32, vec![2], data).expect("valid shape");
        roundtrip(&value);
    }

    #[test]
    fn round_trips_nested_structures() {
        let value = Value::Map(vec![
            ("a".to_string(), Value::List(vec![Value::Str("x".to_string()), Value::Null])),
            ("b".to_string(), Value::Shared(Arc::from(b"handle".as_slice()))),
        ]);
        roundtrip(&value);
    }

    #[test]
    fn array_shape_mismatch_is_rejected() {
        let data: Arc<[u8]> = Arc::from([1u8, 2, 3].as_slice());
        assert!(matches!(
            Value::array(Dtype::I32, vec![2], data),
            Err(PackError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn truncated_payload_errors() {
        assert!(matches!(Value::unpack(&[1, 5, 0, 0, 0, 0, 0, 0]), Err(PackError::Truncated { .. })));
    }
}
