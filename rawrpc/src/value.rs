//! Positional argument and result values.
//!
//! A call carries its arguments as a list of [`Value`]s. Coercion to the
//! declared Rust type is exact: an `Int` never becomes a `Float`, and all
//! integers travel as one 64-bit width, so contracts declare `i64`.

use crate::status::Status;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Value {
    #[prost(oneof = "Kind", tags = "1, 2, 3, 4, 5, 6")]
    pub kind: Option<Kind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Kind {
    #[prost(bool, tag = "1")]
    Bool(bool),
    #[prost(sint64, tag = "2")]
    Int(i64),
    #[prost(double, tag = "3")]
    Float(f64),
    #[prost(string, tag = "4")]
    Str(String),
    #[prost(bytes = "vec", tag = "5")]
    Bytes(Vec<u8>),
    #[prost(message, tag = "6")]
    List(ValueList),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ValueList {
    #[prost(message, repeated, tag = "1")]
    pub values: Vec<Value>,
}

impl Value {
    /// The unit value, used by methods without a result.
    pub fn unit() -> Self {
        Self { kind: None }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            None => "()",
            Some(Kind::Bool(_)) => "bool",
            Some(Kind::Int(_)) => "i64",
            Some(Kind::Float(_)) => "f64",
            Some(Kind::Str(_)) => "String",
            Some(Kind::Bytes(_)) => "bytes",
            Some(Kind::List(_)) => "list",
        }
    }
}

impl From<Kind> for Value {
    fn from(kind: Kind) -> Self {
        Self { kind: Some(kind) }
    }
}

pub trait IntoValue {
    fn into_value(self) -> Value;
}

pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, Status>;
}

fn mismatch(expect: &str, value: &Value) -> Status {
    Status::invalid_argument(format!(
        "expected {expect}, got {}",
        value.type_name()
    ))
}

macro_rules! scalar_value {
    ($($ty:ty => $kind:ident, $name:literal;)*) => {
        $(
            impl IntoValue for $ty {
                fn into_value(self) -> Value {
                    Kind::$kind(self).into()
                }
            }

            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self, Status> {
                    match value.kind {
                        Some(Kind::$kind(v)) => Ok(v),
                        _ => Err(mismatch($name, &value)),
                    }
                }
            }
        )*
    };
}

scalar_value! {
    bool => Bool, "bool";
    i64 => Int, "i64";
    f64 => Float, "f64";
    String => Str, "String";
    Vec<u8> => Bytes, "bytes";
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::unit()
    }
}

impl FromValue for () {
    fn from_value(value: Value) -> Result<Self, Status> {
        match value.kind {
            None => Ok(()),
            _ => Err(mismatch("()", &value)),
        }
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Kind::Str(self.to_owned()).into()
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, Status> {
        Ok(value)
    }
}

// Concrete element types only: a generic `Vec<T>` would overlap `Vec<u8>`.
macro_rules! list_value {
    ($($ty:ty),*) => {
        $(
            impl IntoValue for Vec<$ty> {
                fn into_value(self) -> Value {
                    let values = self.into_iter().map(IntoValue::into_value).collect();
                    Kind::List(ValueList { values }).into()
                }
            }

            impl FromValue for Vec<$ty> {
                fn from_value(value: Value) -> Result<Self, Status> {
                    match value.kind {
                        Some(Kind::List(list)) => {
                            list.values.into_iter().map(<$ty>::from_value).collect()
                        }
                        _ => Err(mismatch("list", &value)),
                    }
                }
            }
        )*
    };
}

list_value!(bool, i64, f64, String, Value);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn exact_coercion() {
        assert_eq!(i64::from_value(7i64.into_value()), Ok(7));
        assert_eq!(String::from_value("abc".into_value()).unwrap(), "abc");
        assert_eq!(<()>::from_value(().into_value()), Ok(()));

        let err = f64::from_value(3i64.into_value()).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert_eq!(err.message, "expected f64, got i64");

        assert!(i64::from_value(Value::unit()).is_err());
        assert!(Vec::<u8>::from_value("x".into_value()).is_err());
    }

    #[test]
    fn lists() {
        let v = vec![1i64, -2, 3].into_value();
        assert_eq!(Vec::<i64>::from_value(v.clone()).unwrap(), vec![1, -2, 3]);

        let err = Vec::<String>::from_value(v).unwrap_err();
        assert_eq!(err.message, "expected String, got i64");

        let nested = vec![vec![true].into_value(), 1.5f64.into_value()].into_value();
        let back = Vec::<Value>::from_value(nested).unwrap();
        assert_eq!(back[1], Kind::Float(1.5).into());
    }

    #[test]
    fn wire_round_trip_keeps_kind() {
        use prost::Message;
        let v = vec![i64::MIN.into_value(), Vec::<u8>::new().into_value()].into_value();
        let decoded = Value::decode(v.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, v);
    }
}
