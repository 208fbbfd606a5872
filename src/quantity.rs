//! Resource-quantity arithmetic in canonical milli-units.
//!
//! All comparisons and aggregation in the controller happen on `i64`
//! milli-values (milli-cores for CPU, milli-bytes for memory/storage).
//! The format hint records whether a quantity was written with a binary
//! suffix so edits stay legible in the manifest they came from.

use std::fmt;

const MIB: i64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Decimal,
    Binary,
}

/// A parsed quantity: canonical milli-value plus the format it was
/// expressed in.
#[derive(Clone, Copy, Debug)]
pub struct Amount {
    milli: i64,
    format: Format,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity: {0}")]
    Invalid(String),
    #[error("negative quantity: {0}")]
    Negative(String),
    #[error("quantity out of range: {0}")]
    OutOfRange(String),
}

impl Amount {
    pub fn from_milli(milli: i64, format: Format) -> Self {
        Self { milli, format }
    }

    pub fn milli(&self) -> i64 {
        self.milli
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Parse a Kubernetes quantity string (`"500m"`, `"2"`, `"1.5Gi"`,
    /// `"100M"`) into a milli-value.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        let (number, multiplier, format) = split_suffix(s);
        let value: f64 = number
            .parse()
            .map_err(|_| ParseError::Invalid(s.to_string()))?;
        if value < 0.0 {
            return Err(ParseError::Negative(s.to_string()));
        }

        let milli = value * multiplier * 1000.0;
        if !milli.is_finite() || milli > i64::MAX as f64 {
            return Err(ParseError::OutOfRange(s.to_string()));
        }

        Ok(Self {
            milli: milli.round() as i64,
            format,
        })
    }
}

fn split_suffix(s: &str) -> (&str, f64, Format) {
    // Two-character binary suffixes first so "1Gi" is not read as "1G".
    for (suf, mult) in [
        ("Ki", 1024f64),
        ("Mi", 1024f64.powi(2)),
        ("Gi", 1024f64.powi(3)),
        ("Ti", 1024f64.powi(4)),
        ("Pi", 1024f64.powi(5)),
        ("Ei", 1024f64.powi(6)),
    ] {
        if let Some(num) = s.strip_suffix(suf) {
            return (num, mult, Format::Binary);
        }
    }
    for (suf, mult) in [
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ] {
        if let Some(num) = s.strip_suffix(suf) {
            return (num, mult, Format::Decimal);
        }
    }
    (s, 1.0, Format::Decimal)
}

/// True for resource names measured in bytes (`memory`, `storage` and
/// their prefixed variants).
pub fn is_byte_resource(res: &str) -> bool {
    res.contains("memory") || res.contains("storage")
}

/// Round a raw milli-value to the readable form used in manifest edits.
///
/// Byte-valued resources are converted from milli-bytes to bytes and
/// rounded up to the nearest MiB; everything else stays a milli-quantity.
pub fn to_readable(res: &str, milli: i64, format: Format) -> Amount {
    if is_byte_resource(res) {
        let bytes = milli as f64 / 1000.0;
        let mib = (bytes / MIB as f64).ceil() as i64;
        return Amount::from_milli(mib * MIB * 1000, Format::Binary);
    }
    Amount::from_milli(milli, format)
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            Format::Binary => {
                let bytes = self.milli / 1000;
                if bytes != 0 && bytes % (MIB * 1024) == 0 {
                    write!(f, "{}Gi", bytes / (MIB * 1024))
                } else if bytes != 0 && bytes % MIB == 0 {
                    write!(f, "{}Mi", bytes / MIB)
                } else if bytes != 0 && bytes % 1024 == 0 {
                    write!(f, "{}Ki", bytes / 1024)
                } else {
                    write!(f, "{}", bytes)
                }
            }
            Format::Decimal => {
                if self.milli % 1000 == 0 {
                    write!(f, "{}", self.milli / 1000)
                } else {
                    write!(f, "{}m", self.milli)
                }
            }
        }
    }
}
