//! Column type definitions.

use rkyv::{Archive, Deserialize, Serialize};

/// Structural type inferred for a provider column.
///
/// The set is closed: every sampled value is classified by the ordered
/// inference rules in [`crate::fingerprint`], never by runtime reflection.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// 64-bit signed integer.
    Integer,
    /// 64-bit floating point.
    Float,
    /// UTF-8 text.
    String,
    /// Boolean token (`true`/`false`, `yes`/`no`, ...).
    Boolean,
    /// Date or date-time.
    DateTime,
    /// No non-empty value was sampled.
    Unknown,
}

impl ColumnType {
    /// Inference order. The first type accepted by the sample wins.
    pub const INFERENCE_ORDER: [ColumnType; 5] = [
        ColumnType::Integer,
        ColumnType::Float,
        ColumnType::Boolean,
        ColumnType::DateTime,
        ColumnType::String,
    ];

    /// Stable name used in fingerprints and step values.
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::String => "string",
            ColumnType::Boolean => "boolean",
            ColumnType::DateTime => "datetime",
            ColumnType::Unknown => "unknown",
        }
    }

    /// Parse a name produced by [`ColumnType::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "integer" => Some(ColumnType::Integer),
            "float" => Some(ColumnType::Float),
            "string" => Some(ColumnType::String),
            "boolean" => Some(ColumnType::Boolean),
            "datetime" => Some(ColumnType::DateTime),
            "unknown" => Some(ColumnType::Unknown),
            _ => None,
        }
    }

    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }

    /// Whether a column of this type may plausibly carry the same values as a
    /// column of `other` (used when deciding between rename and remove+add).
    pub fn is_compatible_with(&self, other: &ColumnType) -> bool {
        self == other
            || *self == ColumnType::Unknown
            || *other == ColumnType::Unknown
            || (self.is_numeric() && other.is_numeric())
    }

    /// Whether moving from `self` to `to` widens numeric precision.
    pub fn widens_to(&self, to: &ColumnType) -> bool {
        *self == ColumnType::Integer && *to == ColumnType::Float
    }

    /// Whether moving from `self` to `to` narrows the declared size.
    pub fn narrows_to(&self, to: &ColumnType) -> bool {
        *self == ColumnType::Float && *to == ColumnType::Integer
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
