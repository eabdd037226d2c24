use std::collections::BTreeMap;
use std::fmt;

use marten_core::{DType, Error, Result};

/// A single operator attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    DType(DType),
}

impl AttrValue {
    fn kind(&self) -> &'static str {
        match self {
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Bool(_) => "bool",
            AttrValue::Str(_) => "str",
            AttrValue::Ints(_) => "ints",
            AttrValue::Floats(_) => "floats",
            AttrValue::DType(_) => "dtype",
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v:?}"),
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Str(v) => write!(f, "\"{v}\""),
            AttrValue::Ints(v) => write!(f, "{v:?}"),
            AttrValue::Floats(v) => write!(f, "{v:?}"),
            AttrValue::DType(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::Ints(v)
    }
}

impl From<Vec<f64>> for AttrValue {
    fn from(v: Vec<f64>) -> Self {
        AttrValue::Floats(v)
    }
}

impl From<DType> for AttrValue {
    fn from(v: DType) -> Self {
        AttrValue::DType(v)
    }
}

/// Named attributes of an operator application, ordered by name.
///
/// Ordering matters: two applications with equal attrs print identically,
/// which the CSE pass and the text dump rely on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attrs(BTreeMap<String, AttrValue>);

macro_rules! typed_getter {
    ($name:ident, $or:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self, key: &str) -> Result<$ty> {
            match self.get(key)? {
                AttrValue::$variant(v) => Ok(v.clone()),
                other => Err(Error::msg(format!(
                    "attribute '{}' has type {}, expected {}",
                    key,
                    other.kind(),
                    stringify!($variant).to_lowercase()
                ))),
            }
        }

        /// Like the plain getter but falls back to `default` when missing.
        pub fn $or(&self, key: &str, default: $ty) -> Result<$ty> {
            if self.contains(key) {
                self.$name(key)
            } else {
                Ok(default)
            }
        }
    };
}

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<AttrValue> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    pub fn get(&self, key: &str) -> Result<&AttrValue> {
        self.0
            .get(key)
            .ok_or_else(|| Error::msg(format!("missing attribute '{key}'")))
    }

    typed_getter!(int, int_or, Int, i64);
    typed_getter!(float, float_or, Float, f64);
    typed_getter!(bool, bool_or, Bool, bool);
    typed_getter!(str, str_or, Str, String);
    typed_getter!(ints, ints_or, Ints, Vec<i64>);
    typed_getter!(floats, floats_or, Floats, Vec<f64>);
    typed_getter!(dtype, dtype_or, DType, DType);

    /// Integer list attribute read as non-negative sizes.
    pub fn usizes(&self, key: &str) -> Result<Vec<usize>> {
        self.ints(key)?
            .into_iter()
            .map(|v| {
                usize::try_from(v)
                    .map_err(|_| Error::msg(format!("attribute '{key}' has negative entry {v}")))
            })
            .collect()
    }
}

impl fmt::Display for Attrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "}}")
    }
}
