use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// A value stored under a key of either namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Text(CompactString),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

#[cfg(test)]
mod tests {
    use super::Value;

    #[test]
    fn msgpack_encoding_preserves_variants() {
        let values = vec![
            Value::from(42_i64),
            Value::from("hello"),
            Value::from(true),
            Value::Float(1.5),
            Value::from(vec![1u8, 2, 3]),
        ];
        let bytes = rmp_serde::to_vec(&values).expect("encode");
        let decoded: Vec<Value> = rmp_serde::from_slice(&bytes).expect("decode");
        assert_eq!(values, decoded);
        assert_eq!(decoded[0].as_integer(), Some(42));
        assert_eq!(decoded[1].as_text(), Some("hello"));
        assert_eq!(decoded[2].as_bool(), Some(true));
    }
}
