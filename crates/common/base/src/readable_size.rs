// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, str::FromStr};

use derive_more::{Add, AddAssign, From, Into};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use snafu::{OptionExt, Snafu};

const UNIT: u64 = 1;
const KIB: u64 = UNIT * 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseSizeError {
    #[snafu(display("empty size string"))]
    Empty,

    #[snafu(display("invalid size number in {input:?}"))]
    InvalidNumber { input: String },

    #[snafu(display("unknown size unit {unit:?}"))]
    UnknownUnit { unit: String },
}

/// A byte count that prints and parses in human units (`64KB`, `4MB`).
///
/// Units are binary: `1KB == 1024` bytes.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Add, AddAssign, From, Into,
)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    #[must_use]
    pub const fn kb(count: u64) -> Self { Self(count * KIB) }

    #[must_use]
    pub const fn mb(count: u64) -> Self { Self(count * MIB) }

    #[must_use]
    pub const fn gb(count: u64) -> Self { Self(count * GIB) }

    #[must_use]
    pub const fn as_bytes(self) -> u64 { self.0 }

    #[must_use]
    pub const fn as_kb(self) -> u64 { self.0 / KIB }

    #[must_use]
    pub const fn as_mb(self) -> u64 { self.0 / MIB }
}

impl fmt::Display for ReadableSize {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.0;
        let (value, unit) = if size >= TIB {
            (size as f64 / TIB as f64, "TB")
        } else if size >= GIB {
            (size as f64 / GIB as f64, "GB")
        } else if size >= MIB {
            (size as f64 / MIB as f64, "MB")
        } else if size >= KIB {
            (size as f64 / KIB as f64, "KB")
        } else {
            return write!(f, "{size}B");
        };
        write!(f, "{value:.2}{unit}")
    }
}

impl FromStr for ReadableSize {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        snafu::ensure!(!s.is_empty(), EmptySnafu);

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        let number: f64 = number.parse().ok().context(InvalidNumberSnafu { input: s })?;

        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => UNIT,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            "T" | "TB" | "TIB" => TIB,
            other => {
                return UnknownUnitSnafu {
                    unit: other.to_string(),
                }
                .fail();
            }
        };

        #[allow(clippy::cast_precision_loss)]
        let bytes = number * multiplier as f64;
        Ok(Self(bytes as u64))
    }
}

impl Serialize for ReadableSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bytes(bytes) => Ok(Self(bytes)),
            Repr::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        assert_eq!(ReadableSize::kb(64).as_bytes(), 65_536);
        assert_eq!(ReadableSize::mb(55).as_mb(), 55);
        assert_eq!(ReadableSize::gb(2).as_bytes(), 2 * GIB);
    }

    #[test]
    fn test_display() {
        assert_eq!(ReadableSize(512).to_string(), "512B");
        assert_eq!(ReadableSize::kb(64).to_string(), "64.00KB");
        assert_eq!(ReadableSize(MIB + MIB / 2).to_string(), "1.50MB");
    }

    #[test]
    fn test_parse() {
        assert_eq!("1024".parse::<ReadableSize>().unwrap(), ReadableSize::kb(1));
        assert_eq!("64KB".parse::<ReadableSize>().unwrap(), ReadableSize::kb(64));
        assert_eq!("4m".parse::<ReadableSize>().unwrap(), ReadableSize::mb(4));
        assert_eq!(
            "1.5GiB".parse::<ReadableSize>().unwrap(),
            ReadableSize(GIB + GIB / 2)
        );
        assert_eq!("".parse::<ReadableSize>(), Err(ParseSizeError::Empty));
        assert!(matches!(
            "12XB".parse::<ReadableSize>(),
            Err(ParseSizeError::UnknownUnit { .. })
        ));
    }

    #[test]
    fn test_serde_accepts_number_and_text() {
        let from_num: ReadableSize = serde_json::from_str("2048").unwrap();
        let from_text: ReadableSize = serde_json::from_str("\"2KB\"").unwrap();
        assert_eq!(from_num, from_text);
        assert_eq!(serde_json::to_string(&from_num).unwrap(), "2048");
    }
}
