//! message argument model and the codecs that turn it into payload bytes
//!
//! every protocol carries a list of [`Value`]s. How the list is laid out on
//! the wire is up to the protocol's [`Codec`]; the dispatcher itself only
//! ever sees the packed bytes.
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Error;

/// A dynamically typed message argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// absent value
    Nil,
    /// boolean
    Bool(bool),
    /// signed integer
    Int(i64),
    /// floating point number
    Float(f64),
    /// utf8 string
    Str(String),
    /// raw bytes
    Bytes(Vec<u8>),
    /// nested list
    List(Vec<Value>),
}

impl Value {
    /// borrow the string content, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// borrow the raw content of a string or bytes value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// the integer content, if this is an integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// the boolean content, if this is a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

macro_rules! impl_from {
    ($ty: ty, $variant: ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        }
    };
}

impl_from!(bool, Bool);
impl_from!(i64, Int);
impl_from!(i32, Int);
impl_from!(u32, Int);
impl_from!(f64, Float);
impl_from!(String, Str);
impl_from!(&str, Str);
impl_from!(Vec<u8>, Bytes);
impl_from!(Vec<Value>, List);

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v.to_vec())
    }
}

/// pack/unpack pair of a protocol
pub trait Codec: Send + Sync + 'static {
    /// encode the argument list into a payload
    fn pack(&self, args: &[Value]) -> Result<Bytes, Error>;
    /// decode a payload back into an argument list
    fn unpack(&self, msg: &[u8]) -> Result<Vec<Value>, Error>;
}

/// the general purpose codec, any argument list survives a round trip
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn pack(&self, args: &[Value]) -> Result<Bytes, Error> {
        bincode::serialize(args)
            .map(Bytes::from)
            .map_err(|e| Error::Serialize(e.to_string()))
    }

    fn unpack(&self, msg: &[u8]) -> Result<Vec<Value>, Error> {
        bincode::deserialize(msg).map_err(|e| Error::Deserialize(e.to_string()))
    }
}

/// single string argument, sent as its utf8 bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn pack(&self, args: &[Value]) -> Result<Bytes, Error> {
        match args {
            [] => Ok(Bytes::new()),
            [v] => match v.as_bytes() {
                Some(b) => Ok(Bytes::copy_from_slice(b)),
                None => Err(Error::Serialize(format!("text codec can't pack {v}"))),
            },
            _ => Err(Error::Serialize(format!(
                "text codec packs one argument, got {}",
                args.len()
            ))),
        }
    }

    fn unpack(&self, msg: &[u8]) -> Result<Vec<Value>, Error> {
        let s = std::str::from_utf8(msg).map_err(|e| Error::Deserialize(e.to_string()))?;
        Ok(vec![Value::Str(s.to_owned())])
    }
}

/// single bytes argument passed through untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn pack(&self, args: &[Value]) -> Result<Bytes, Error> {
        match args {
            [] => Ok(Bytes::new()),
            [v] => v
                .as_bytes()
                .map(Bytes::copy_from_slice)
                .ok_or_else(|| Error::Serialize(format!("raw codec can't pack {v}"))),
            _ => Err(Error::Serialize(format!(
                "raw codec packs one argument, got {}",
                args.len()
            ))),
        }
    }

    fn unpack(&self, msg: &[u8]) -> Result<Vec<Value>, Error> {
        Ok(vec![Value::Bytes(msg.to_vec())])
    }
}
