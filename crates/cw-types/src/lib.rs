#![forbid(unsafe_code)]

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Null,
    Bool,
    Number,
    Text,
}

/// One cell of an uploaded row. Field maps round-trip as ordinary JSON
/// objects, so the serde representation is untagged: `null`, booleans,
/// numbers, and strings map directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Scalar {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null => DType::Null,
            Self::Bool(_) => DType::Bool,
            Self::Number(_) => DType::Number,
            Self::Text(_) => DType::Text,
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Number(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Strict numeric coercion, used by formula evaluation and range
    /// predicates. Text is trimmed and parsed as-is; no formatting
    /// characters are stripped. Missing values and unparsable text fail.
    pub fn strict_number(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Number(v) if !v.is_nan() => Ok(*v),
            Self::Number(_) | Self::Null => Err(TypeError::ValueIsMissing),
            Self::Text(v) => v.trim().parse::<f64>().map_err(|_| TypeError::NonNumericValue {
                value: v.clone(),
                dtype: DType::Text,
            }),
        }
    }

    /// Lenient numeric coercion, used only by chart-value extraction.
    /// Currency symbols, thousands separators, and surrounding whitespace
    /// are stripped before parsing; anything still unparsable (and any
    /// missing value) yields `0.0`. This is deliberately a different
    /// contract from [`Scalar::strict_number`]: the two call paths diverge
    /// by design and must not be unified.
    #[must_use]
    pub fn lenient_number(&self) -> f64 {
        match self {
            Self::Bool(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Number(v) => {
                if v.is_finite() {
                    *v
                } else {
                    0.0
                }
            }
            Self::Null => 0.0,
            Self::Text(v) => {
                let stripped = FORMATTING_CHARS.replace_all(v, "");
                stripped
                    .parse::<f64>()
                    .map_or(0.0, |value| if value.is_finite() { value } else { 0.0 })
            }
        }
    }

    /// String coercion used for group keys and chart labels.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Null => "<null>".to_owned(),
            Self::Bool(v) => v.to_string(),
            Self::Number(v) => v.to_string(),
            Self::Text(v) => v.clone(),
        }
    }
}

static FORMATTING_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\s,$€£¥]").expect("formatting-strip pattern is valid")
});

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, ""),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Number(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("value {value:?} has non-numeric dtype {dtype:?}")]
    NonNumericValue { value: String, dtype: DType },
    #[error("value is missing")]
    ValueIsMissing,
}

/// Advisory dtype lattice for sampled column inference. `Null` unifies
/// with anything, `Bool`/`Number` unify numerically, and any other mix
/// degrades to `Text` rather than erroring: sampled descriptors are
/// hints, never enforcement.
#[must_use]
pub fn common_dtype(left: DType, right: DType) -> DType {
    use DType::{Bool, Null, Number, Text};

    match (left, right) {
        (a, b) if a == b => a,
        (Null, other) | (other, Null) => other,
        (Bool, Number) | (Number, Bool) => Number,
        (Text, _) | (_, Text) => Text,
        _ => Text,
    }
}

#[must_use]
pub fn infer_dtype<'a>(values: impl IntoIterator<Item = &'a Scalar>) -> DType {
    let mut current = DType::Null;
    for value in values {
        current = common_dtype(current, value.dtype());
    }
    current
}
