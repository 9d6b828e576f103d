use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single scalar value as returned by a shard transport.
///
/// The engine never interprets rows beyond what merging needs: ordering keys,
/// distinct/group keys and the arithmetic of aggregate combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Timestamp(i64), // microseconds since Unix epoch
    Date(i32),      // days since Unix epoch (1970-01-01)
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int32(v) => Some(*v as f64),
            Datum::Int64(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Add two values for SUM/COUNT combination. NULL is the identity.
    pub fn add(&self, other: &Datum) -> Datum {
        match (self, other) {
            (Datum::Int32(x), Datum::Int32(y)) => Datum::Int64(*x as i64 + *y as i64),
            (Datum::Int64(x), Datum::Int64(y)) => Datum::Int64(x + y),
            (Datum::Int32(x), Datum::Int64(y)) => Datum::Int64(*x as i64 + y),
            (Datum::Int64(x), Datum::Int32(y)) => Datum::Int64(x + *y as i64),
            (Datum::Float64(x), Datum::Float64(y)) => Datum::Float64(x + y),
            (Datum::Float64(x), Datum::Int64(y)) => Datum::Float64(x + *y as f64),
            (Datum::Int64(x), Datum::Float64(y)) => Datum::Float64(*x as f64 + y),
            (Datum::Float64(x), Datum::Int32(y)) => Datum::Float64(x + *y as f64),
            (Datum::Int32(x), Datum::Float64(y)) => Datum::Float64(*x as f64 + y),
            (Datum::Null, other) | (other, Datum::Null) => other.clone(),
            _ => self.clone(),
        }
    }

    /// Append a deterministic, type-tagged binary encoding of this value.
    /// Used for distinct and group keys, where NULL must equal NULL.
    pub fn encode_key(&self, key: &mut Vec<u8>) {
        match self {
            Datum::Null => key.push(0),
            Datum::Boolean(b) => {
                key.push(1);
                key.push(u8::from(*b));
            }
            // Int32 and Int64 share a tag so 7i32 and 7i64 collide on purpose.
            Datum::Int32(v) => {
                key.push(2);
                key.extend_from_slice(&(*v as i64).to_be_bytes());
            }
            Datum::Int64(v) => {
                key.push(2);
                key.extend_from_slice(&v.to_be_bytes());
            }
            Datum::Float64(v) => {
                key.push(3);
                key.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            Datum::Text(s) => {
                key.push(4);
                key.extend_from_slice(&(s.len() as u32).to_be_bytes());
                key.extend_from_slice(s.as_bytes());
            }
            Datum::Timestamp(v) => {
                key.push(5);
                key.extend_from_slice(&v.to_be_bytes());
            }
            Datum::Date(v) => {
                key.push(6);
                key.extend_from_slice(&v.to_be_bytes());
            }
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Int32(v) => write!(f, "{}", v),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Text(s) => write!(f, "{}", s),
            Datum::Timestamp(us) => write!(f, "{}", us),
            Datum::Date(days) => write!(f, "{}", days),
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Null, Datum::Null) => false, // NULL != NULL in SQL
            (Datum::Boolean(a), Datum::Boolean(b)) => a == b,
            (Datum::Int32(a), Datum::Int32(b)) => a == b,
            (Datum::Int64(a), Datum::Int64(b)) => a == b,
            (Datum::Int32(a), Datum::Int64(b)) => (*a as i64) == *b,
            (Datum::Int64(a), Datum::Int32(b)) => *a == (*b as i64),
            (Datum::Float64(a), Datum::Float64(b)) => a == b,
            (Datum::Float64(a), Datum::Int32(b)) => *a == (*b as f64),
            (Datum::Float64(a), Datum::Int64(b)) => *a == (*b as f64),
            (Datum::Int32(a), Datum::Float64(b)) => (*a as f64) == *b,
            (Datum::Int64(a), Datum::Float64(b)) => (*a as f64) == *b,
            (Datum::Text(a), Datum::Text(b)) => a == b,
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a == b,
            (Datum::Date(a), Datum::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order used by merges: NULL sorts first, numerics compare across widths,
/// mismatched types compare equal.
impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Null, _) => Ordering::Less,
            (_, Datum::Null) => Ordering::Greater,
            (Datum::Boolean(a), Datum::Boolean(b)) => a.cmp(b),
            (Datum::Int32(a), Datum::Int32(b)) => a.cmp(b),
            (Datum::Int64(a), Datum::Int64(b)) => a.cmp(b),
            (Datum::Int32(a), Datum::Int64(b)) => (*a as i64).cmp(b),
            (Datum::Int64(a), Datum::Int32(b)) => a.cmp(&(*b as i64)),
            (Datum::Float64(a), Datum::Float64(b)) => a.total_cmp(b),
            (Datum::Float64(a), Datum::Int32(b)) => a.total_cmp(&(*b as f64)),
            (Datum::Float64(a), Datum::Int64(b)) => a.total_cmp(&(*b as f64)),
            (Datum::Int32(a), Datum::Float64(b)) => (*a as f64).total_cmp(b),
            (Datum::Int64(a), Datum::Float64(b)) => (*a as f64).total_cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.cmp(b),
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a.cmp(b),
            (Datum::Date(a), Datum::Date(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// A row is an ordered list of datums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedRow {
    pub values: Vec<Datum>,
}

impl OwnedRow {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Binary key over the selected columns (all columns when `indices` is `None`).
    pub fn encode_key(&self, indices: Option<&[usize]>) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.values.len() * 9);
        match indices {
            Some(indices) => {
                for &i in indices {
                    self.values.get(i).unwrap_or(&Datum::Null).encode_key(&mut key);
                }
            }
            None => {
                for v in &self.values {
                    v.encode_key(&mut key);
                }
            }
        }
        key
    }
}

impl fmt::Display for OwnedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

/// Build a row from anything convertible into datums.
#[macro_export]
macro_rules! row {
    ($($v:expr),* $(,)?) => {
        $crate::datum::OwnedRow::new(vec![$($crate::datum::Datum::from($v)),*])
    };
}

impl From<i32> for Datum {
    fn from(v: i32) -> Self {
        Datum::Int32(v)
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int64(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float64(v)
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Boolean(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Text(v.to_string())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Datum::Text(v)
    }
}
