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

//! Partitioning of `[0, total)` into byte ranges.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    config::MIN_PARALLEL_SIZE,
    error::{Result, TransferError},
};

/// Half-open byte range `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    pub begin: u64,
    pub end:   u64,
}

impl Range {
    #[must_use]
    pub const fn new(begin: u64, end: u64) -> Self { Self { begin, end } }

    #[must_use]
    pub const fn len(&self) -> u64 { self.end.saturating_sub(self.begin) }

    #[must_use]
    pub const fn is_empty(&self) -> bool { self.begin >= self.end }

    /// `Range` header value for the remaining bytes. HTTP ranges are
    /// inclusive.
    #[must_use]
    pub fn header_value(&self) -> String { format!("bytes={}-{}", self.begin, self.end - 1) }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.begin, self.end)
    }
}

pub type RangeList = Vec<Range>;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RangeGenMode {
    /// `total / parallel` per range, the last one absorbing the remainder.
    Default,
    /// Fixed-size blocks handed out lazily.
    #[default]
    BlockSize,
}

impl RangeGenMode {
    pub fn parse(mode: &str) -> Result<Self> {
        Self::from_str(mode).map_err(|_| TransferError::UnknownRangeGenMode {
            mode: mode.to_string(),
        })
    }
}

/// Lazy cursor over the partition of `[0, total)`.
///
/// Persisted with the resume snapshot, so a resumed transfer only generates
/// the part of the file no worker has been assigned yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeListGen {
    mode:       RangeGenMode,
    total:      u64,
    begin:      u64,
    block_size: u64,
    parallel:   usize,
    count:      usize,
}

impl RangeListGen {
    #[must_use]
    pub fn new(total: u64, parallel: usize, mode: RangeGenMode, block_hint: u64) -> Self {
        let parallel = parallel.max(1);
        let block_size = match mode {
            RangeGenMode::BlockSize => block_hint.min(total / parallel as u64 + 1),
            RangeGenMode::Default => total / parallel as u64,
        }
        .max(1);

        Self {
            mode,
            total,
            begin: 0,
            block_size,
            parallel,
            count: 0,
        }
    }

    /// Hand out the next range, or `None` once `[0, total)` is covered.
    pub fn next_range(&mut self) -> Option<Range> {
        if self.begin >= self.total {
            return None;
        }

        let end = match self.mode {
            RangeGenMode::Default if self.count + 1 >= self.parallel => self.total,
            _ => (self.begin + self.block_size).min(self.total),
        };
        let range = Range::new(self.begin, end);
        self.begin = end;
        self.count += 1;
        Some(range)
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 { self.block_size }

    #[must_use]
    pub const fn total(&self) -> u64 { self.total }

    #[must_use]
    pub const fn mode(&self) -> RangeGenMode { self.mode }

    /// Number of ranges handed out so far.
    #[must_use]
    pub const fn count(&self) -> usize { self.count }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool { self.begin >= self.total }

    /// Bytes not yet handed out.
    #[must_use]
    pub const fn remaining(&self) -> u64 { self.total.saturating_sub(self.begin) }
}

/// Full partition for the given inputs. Same inputs, same partition.
#[must_use]
pub fn generate(total: u64, parallel: usize, mode: RangeGenMode, block_hint: u64) -> RangeList {
    let mut generator = RangeListGen::new(total, parallel, mode, block_hint);
    std::iter::from_fn(|| generator.next_range()).collect()
}

/// Parallelism for a transfer: a resumed transfer keeps one worker per
/// remaining range, a fresh one never starts more workers than there are
/// `MIN_PARALLEL_SIZE` slices in the file.
#[must_use]
pub fn select_parallel(resumed_ranges: usize, max_parallel: usize, total: u64) -> usize {
    if resumed_ranges > 0 {
        return resumed_ranges;
    }
    let by_size = total / MIN_PARALLEL_SIZE.as_bytes() + 1;
    let parallel = (max_parallel as u64).min(by_size);
    (parallel as usize).max(1)
}

/// The write buffer never needs to exceed one block.
#[must_use]
pub fn select_cache_size(cache_size: u64, block_size: u64) -> usize {
    cache_size.min(block_size).max(1) as usize
}

/// Share of `parallel` each of `load` concurrently running files gets.
#[must_use]
pub const fn average_parallel(parallel: usize, load: usize) -> usize {
    if load < 1 {
        return 1;
    }
    let share = parallel / load;
    if share < 1 { 1 } else { share }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn assert_partition(ranges: &[Range], total: u64) {
        let mut cursor = 0;
        for r in ranges {
            assert_eq!(r.begin, cursor, "gap or overlap at {r}");
            assert!(!r.is_empty());
            cursor = r.end;
        }
        assert_eq!(cursor, total);
    }

    #[test]
    fn test_block_size_mode_clips_last_range() {
        let ranges = generate(10 * MIB, 2, RangeGenMode::BlockSize, 4 * MIB);
        assert_eq!(ranges, vec![
            Range::new(0, 4 * MIB),
            Range::new(4 * MIB, 8 * MIB),
            Range::new(8 * MIB, 10 * MIB),
        ]);
    }

    #[test]
    fn test_block_size_mode_capped_by_parallel_share() {
        // total / 3 + 1 is below the 4 MiB hint
        let ranges = generate(10 * MIB, 3, RangeGenMode::BlockSize, 4 * MIB);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].len(), 10 * MIB / 3 + 1);
        assert_partition(&ranges, 10 * MIB);
    }

    #[test]
    fn test_default_mode_last_absorbs_remainder() {
        let ranges = generate(1003, 4, RangeGenMode::Default, 0);
        assert_eq!(ranges, vec![
            Range::new(0, 250),
            Range::new(250, 500),
            Range::new(500, 750),
            Range::new(750, 1003),
        ]);
    }

    #[test]
    fn test_partition_coverage() {
        for total in [1, 7, 1000, 4096, 10 * MIB + 3] {
            for parallel in 1..=8 {
                for mode in [RangeGenMode::Default, RangeGenMode::BlockSize] {
                    assert_partition(&generate(total, parallel, mode, 1500), total);
                }
            }
        }
    }

    #[test]
    fn test_small_total_never_yields_empty_ranges() {
        let ranges = generate(3, 5, RangeGenMode::Default, 0);
        assert_eq!(ranges.len(), 3);
        assert_partition(&ranges, 3);
    }

    #[test]
    fn test_zero_total_is_empty_plan() {
        assert!(generate(0, 4, RangeGenMode::BlockSize, MIB).is_empty());
        assert!(generate(0, 4, RangeGenMode::Default, MIB).is_empty());
    }

    #[test]
    fn test_cursor_resumes_tail() {
        let mut generator = RangeListGen::new(1000, 2, RangeGenMode::BlockSize, 300);
        let first = generator.next_range().unwrap();
        let json = serde_json::to_string(&generator).unwrap();
        let mut restored: RangeListGen = serde_json::from_str(&json).unwrap();

        let mut tail = vec![first];
        tail.extend(std::iter::from_fn(|| restored.next_range()));
        assert_eq!(tail, generate(1000, 2, RangeGenMode::BlockSize, 300));
        assert!(restored.is_exhausted());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(RangeGenMode::parse("block_size").unwrap(), RangeGenMode::BlockSize);
        assert_eq!(RangeGenMode::parse("default").unwrap(), RangeGenMode::Default);
        assert!(matches!(
            RangeGenMode::parse("stripes"),
            Err(TransferError::UnknownRangeGenMode { .. })
        ));
    }

    #[test]
    fn test_select_parallel() {
        assert_eq!(select_parallel(3, 10, 100 * MIB), 3);
        assert_eq!(select_parallel(0, 10, 100 * MIB), 10);
        // 200 KiB only has room for two 128 KiB slices
        assert_eq!(select_parallel(0, 10, 200 * 1024), 2);
        assert_eq!(select_parallel(0, 0, 100 * MIB), 1);
        assert_eq!(select_parallel(0, 5, 0), 1);
    }

    #[test]
    fn test_cache_and_average() {
        assert_eq!(select_cache_size(64 * 1024, 4 * MIB), 64 * 1024);
        assert_eq!(select_cache_size(64 * 1024, 1000), 1000);
        assert_eq!(average_parallel(10, 3), 3);
        assert_eq!(average_parallel(2, 5), 1);
        assert_eq!(average_parallel(4, 0), 1);
    }
}
