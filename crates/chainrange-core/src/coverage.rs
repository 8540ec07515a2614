//! Coverage index: cuts the union of all pending ranges into slices that
//! are planned independently.
//!
//! Pending data is usually a dense recent blob plus a few old holes far in
//! the past. Neighbouring ranges separated by a small gap are coalesced into
//! one blob so queries can realign across the gap; far-apart blobs are kept
//! apart so no query ever scans the empty space between them. Blobs are then
//! cut into vertical slices no longer than one query may span. When only
//! the newest slices are wanted, the older ones are never built.

use serde::{Deserialize, Serialize};

use crate::error::RangeError;
use crate::range::{merge, split_many_to_max_length, Range, RangeValue};

/// Tuning of [`build_coverage_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageIndexOptions {
    /// Coalesce two ranges when the gap between them is at most this many units.
    pub merge_if_closer_than: u64,
    /// Maximum size of a slice.
    pub vertical_slice_size: u64,
    /// Keep only this many of the most recent slices.
    #[serde(default)]
    pub max_slices: Option<usize>,
}

impl CoverageIndexOptions {
    /// The planner's settings for a given maximum query range size.
    pub fn for_max_range_size(max_range_size: u64) -> Self {
        Self {
            merge_if_closer_than: max_range_size.div_ceil(2),
            vertical_slice_size: max_range_size,
            max_slices: None,
        }
    }

    pub fn newest(mut self, max_slices: usize) -> Self {
        self.max_slices = Some(max_slices);
        self
    }
}

/// Build the ascending list of slices covering every input range, or only
/// the newest `max_slices` of them.
pub fn build_coverage_index<T: RangeValue>(
    per_entity: &[Vec<Range<T>>],
    options: CoverageIndexOptions,
) -> Result<Vec<Range<T>>, RangeError> {
    let all: Vec<Range<T>> = per_entity.iter().flatten().copied().collect();
    let merged = merge(&all);
    if merged.len() <= 1 {
        return slice_blobs(&merged, options);
    }

    let max_gap = i64::try_from(options.merge_if_closer_than).unwrap_or(i64::MAX);
    let mut blobs: Vec<Range<T>> = Vec::with_capacity(merged.len());
    for range in merged {
        match blobs.last_mut() {
            Some(blob)
                if blob.to().to_number().saturating_add(max_gap) >= range.from().to_number() =>
            {
                *blob = blob.extend_to(range.to());
            }
            _ => blobs.push(range),
        }
    }

    slice_blobs(&blobs, options)
}

fn slice_blobs<T: RangeValue>(
    blobs: &[Range<T>],
    options: CoverageIndexOptions,
) -> Result<Vec<Range<T>>, RangeError> {
    match options.max_slices {
        None => split_many_to_max_length(blobs, options.vertical_slice_size),
        Some(limit) => newest_slices(blobs, options.vertical_slice_size, limit),
    }
}

/// The last `limit` slices of `blobs`, ascending. Slices are aligned on each
/// blob's lower end, like [`split_many_to_max_length`].
fn newest_slices<T: RangeValue>(
    blobs: &[Range<T>],
    slice_size: u64,
    limit: usize,
) -> Result<Vec<Range<T>>, RangeError> {
    if slice_size == 0 {
        return Err(RangeError::ZeroLength);
    }
    let step = i64::try_from(slice_size).unwrap_or(i64::MAX);
    let mut slices = Vec::with_capacity(limit.min(blobs.len().saturating_mul(2)));

    'blobs: for blob in blobs.iter().rev() {
        let count = blob.size().div_ceil(slice_size);
        for i in (0..count).rev() {
            if slices.len() >= limit {
                break 'blobs;
            }
            let offset = i64::try_from(i).unwrap_or(i64::MAX).saturating_mul(step);
            let from = blob.from().add(offset);
            let to = if i + 1 == count { blob.to() } else { from.add(step - 1) };
            slices.push(Range::new_unchecked(from, to));
        }
    }

    slices.reverse();
    Ok(slices)
}
