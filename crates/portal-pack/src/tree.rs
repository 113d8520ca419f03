use crate::value::{Dtype, Value};

/// Shape of a [`Value`] tree with leaf payloads erased, keeping just enough
/// to tell whether two values are batch-compatible: container nesting plus,
/// for arrays, dtype and shape. Mirrors `elements.tree`'s structure
/// comparison from the Python source's `batching.py`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Structure {
    Leaf(LeafShape),
    List(Vec<Structure>),
    Map(Vec<(String, Structure)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeafShape {
    Null,
    Bytes,
    Str,
    Array { dtype: Dtype, shape: Vec<u64> },
    Shared,
}

/// Splits a value into its leaves (in flatten order) and the [`Structure`]
/// needed to put them back together with [`unflatten`].
pub fn flatten(value: &Value) -> (Vec<&Value>, Structure) {
    let mut leaves = Vec::new();
    let structure = flatten_into(value, &mut leaves);
    (leaves, structure)
}

fn flatten_into<'a>(value: &'a Value, leaves: &mut Vec<&'a Value>) -> Structure {
    match value {
        Value::List(items) => Structure::List(items.iter().map(|v| flatten_into(v, leaves)).collect()),
        Value::Map(entries) => Structure::Map(
            entries.iter().map(|(k, v)| (k.clone(), flatten_into(v, leaves))).collect(),
        ),
        leaf => {
            leaves.push(leaf);
            Structure::Leaf(leaf_shape(leaf))
        }
    }
}

fn leaf_shape(value: &Value) -> LeafShape {
    match value {
        Value::Null => LeafShape::Null,
        Value::Bytes(_) => LeafShape::Bytes,
        Value::Str(_) => LeafShape::Str,
        Value::Array { dtype, shape, .. } => LeafShape::Array { dtype: *dtype, shape: shape.clone() },
        Value::Shared(_) => LeafShape::Shared,
        Value::List(_) | Value::Map(_) => unreachable!("containers are not leaves"),
    }
}

/// Rebuilds a value from a [`Structure`] and the leaves that go with it, in
/// the same order [`flatten`] would have produced them.
pub fn unflatten(structure: &Structure, leaves: &[Value]) -> Value {
    let mut iter = leaves.iter().cloned();
    unflatten_from(structure, &mut iter)
}

fn unflatten_from(structure: &Structure, leaves: &mut impl Iterator<Item = Value>) -> Value {
    match structure {
        Structure::Leaf(_) => leaves.next().expect("leaf iterator exhausted before structure"),
        Structure::List(items) => Value::List(items.iter().map(|s| unflatten_from(s, leaves)).collect()),
        Structure::Map(entries) => {
            Value::Map(entries.iter().map(|(k, s)| (k.clone(), unflatten_from(s, leaves))).collect())
        }
    }
}

/// Applies `f` to every leaf of `value`, preserving container shape.
/// Used to unstack a batched reply back into per-caller results.
pub fn map_leaves(value: &Value, mut f: impl FnMut(&Value) -> Value) -> Value {
    fn go(value: &Value, f: &mut impl FnMut(&Value) -> Value) -> Value {
        match value {
            Value::List(items) => Value::List(items.iter().map(|v| go(v, f)).collect()),
            Value::Map(entries) => Value::Map(entries.iter().map(|(k, v)| (k.clone(), go(v, f))).collect()),
            leaf => f(leaf),
        }
    }
    go(value, &mut f)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn flatten_unflatten_round_trips() {
        let value = Value::Map(vec![
            ("x".to_string(), Value::List(vec![Value::Str("a".to_string()), Value::Null])),
            ("y".to_string(), Value::Bytes(Arc::from(b"z".as_slice()))),
        ]);
        let (leaves, structure) = flatten(&value);
        let owned: Vec<Value> = leaves.into_iter().cloned().collect();
        assert_eq!(unflatten(&structure, &owned), value);
    }

    #[test]
    fn same_shape_values_share_structure() {
        let a = Value::List(vec![Value::Str("one".to_string())]);
        let b = Value::List(vec![Value::Str("two".to_string())]);
        assert_eq!(flatten(&a).1, flatten(&b).1);
    }

    #[test]
    fn differing_array_shape_breaks_structure_equality() {
        let a = Value::array(Dtype::I32, vec![2], Arc::from([0u8; 8].as_slice())).unwrap();
        let b = Value::array(Dtype::I32, vec![3], Arc::from([0u8; 12].as_slice())).unwrap();
        assert_ne!(flatten(&a).1, flatten(&b).1);
    }

    #[test]
    fn map_leaves_preserves_shape() {
        let value = Value::List(vec![Value::Str("a".to_string()), Value::Str("b".to_string())]);
        let upper = map_leaves(&value, |leaf| match leaf {
            Value::Str(s) => Value::Str(s.to_uppercase()),
            other => other.clone(),
        });
        assert_eq!(upper, Value::List(vec![Value::Str("A".to_string()), Value::Str("B".to_string())]));
    }
}
