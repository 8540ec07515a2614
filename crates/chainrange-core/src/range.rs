//! Closed-interval algebra over block numbers and timestamps.
//!
//! Every operation is a pure function over `Range<T>`, generic over any
//! scalar implementing [`RangeValue`]. Ranges are valid by construction:
//! `Range::new` and deserialization both reject `from > to`.
//!
//! Two scalar kinds are supported out of the box:
//! - `u64`: block numbers
//! - `DateTime<Utc>`: timestamps at millisecond granularity

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::RangeError;

// ─── Scalar strategy ─────────────────────────────────────────────────────────

/// A totally ordered, steppable scalar a [`Range`] can be built over.
///
/// Ordering, `min` and `max` come from [`Ord`]; the trait adds stepping and a
/// numeric projection used for sizes and distances.
pub trait RangeValue: Copy + Ord + fmt::Debug + Send + Sync + 'static {
    /// The smallest value strictly greater than `self`.
    fn next_value(self) -> Self;
    /// The greatest value strictly smaller than `self`.
    fn previous_value(self) -> Self;
    /// Numeric position on the scalar axis (block number, unix millis).
    fn to_number(self) -> i64;
    /// Move `amount` units along the axis (may be negative).
    fn add(self, amount: i64) -> Self;
}

impl RangeValue for u64 {
    fn next_value(self) -> Self {
        self.saturating_add(1)
    }

    fn previous_value(self) -> Self {
        self.saturating_sub(1)
    }

    fn to_number(self) -> i64 {
        i64::try_from(self).unwrap_or(i64::MAX)
    }

    fn add(self, amount: i64) -> Self {
        if amount >= 0 {
            self.saturating_add(amount.unsigned_abs())
        } else {
            self.saturating_sub(amount.unsigned_abs())
        }
    }
}

impl RangeValue for DateTime<Utc> {
    fn next_value(self) -> Self {
        self + Duration::milliseconds(1)
    }

    fn previous_value(self) -> Self {
        self - Duration::milliseconds(1)
    }

    fn to_number(self) -> i64 {
        self.timestamp_millis()
    }

    fn add(self, amount: i64) -> Self {
        self + Duration::milliseconds(amount)
    }
}

// ─── Range ───────────────────────────────────────────────────────────────────

/// A closed interval `[from, to]` with `from <= to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Range<T: RangeValue> {
    from: T,
    to: T,
}

impl<T: RangeValue> Range<T> {
    /// Build a range, failing if `from > to`.
    pub fn new(from: T, to: T) -> Result<Self, RangeError> {
        if from > to {
            return Err(RangeError::Invalid {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            });
        }
        Ok(Self { from, to })
    }

    /// A range covering exactly one value.
    pub fn point(value: T) -> Self {
        Self {
            from: value,
            to: value,
        }
    }

    pub(crate) fn new_unchecked(from: T, to: T) -> Self {
        debug_assert!(from <= to, "range built with from > to");
        Self { from, to }
    }

    pub fn from(&self) -> T {
        self.from
    }

    pub fn to(&self) -> T {
        self.to
    }

    /// Number of scalar units covered (both ends included).
    pub fn size(&self) -> u64 {
        (self.to.to_number() - self.from.to_number()).unsigned_abs() + 1
    }

    pub fn contains(&self, value: T) -> bool {
        self.from <= value && value <= self.to
    }

    /// Returns `true` if `other` lies entirely inside `self`.
    pub fn includes(&self, other: &Self) -> bool {
        self.from <= other.from && other.to <= self.to
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.from <= other.to && other.from <= self.to
    }

    /// The overlapping part of two ranges, if any.
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        self.overlaps(other)
            .then(|| Self::new_unchecked(self.from.max(other.from), self.to.min(other.to)))
    }

    /// Grow the upper bound to `to`; a smaller `to` leaves the range untouched.
    pub fn extend_to(&self, to: T) -> Self {
        Self::new_unchecked(self.from, self.to.max(to))
    }
}

impl<T: RangeValue> fmt::Display for Range<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?}]", self.from, self.to)
    }
}

#[derive(Deserialize)]
struct RawRange<T> {
    from: T,
    to: T,
}

impl<'de, T> Deserialize<'de> for Range<T>
where
    T: RangeValue + Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawRange::<T>::deserialize(deserializer)?;
        Range::new(raw.from, raw.to).map_err(serde::de::Error::custom)
    }
}

/// Direction in which split results are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Oldest first, chunks aligned on each range's lower bound.
    Asc,
    /// Most recent first, chunks aligned on each range's upper bound.
    Desc,
}

// ─── Operations ──────────────────────────────────────────────────────────────

/// Sort and merge overlapping or adjacent ranges into a disjoint sorted list.
pub fn merge<T: RangeValue>(ranges: &[Range<T>]) -> Vec<Range<T>> {
    let mut sorted = ranges.to_vec();
    sorted.sort_unstable_by_key(|r| r.from);

    let mut merged: Vec<Range<T>> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(current) if range.from <= current.to.next_value() => {
                current.to = current.to.max(range.to);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Clip every range to `window`, dropping the ones outside of it.
pub fn intersect<T: RangeValue>(ranges: &[Range<T>], window: &Range<T>) -> Vec<Range<T>> {
    ranges.iter().filter_map(|r| r.intersection(window)).collect()
}

/// The single range spanning all inputs, `None` for an empty input.
pub fn covering<T: RangeValue>(ranges: &[Range<T>]) -> Option<Range<T>> {
    let from = ranges.iter().map(|r| r.from).min()?;
    let to = ranges.iter().map(|r| r.to).max()?;
    Some(Range::new_unchecked(from, to))
}

/// What is left of `range` once `to_exclude` is removed: 0, 1 or 2 ranges.
pub fn exclude<T: RangeValue>(range: &Range<T>, to_exclude: &Range<T>) -> Vec<Range<T>> {
    if !range.overlaps(to_exclude) {
        return vec![*range];
    }
    if to_exclude.includes(range) {
        return vec![];
    }
    let mut remaining = Vec::with_capacity(2);
    if range.from < to_exclude.from {
        remaining.push(Range::new_unchecked(
            range.from,
            to_exclude.from.previous_value(),
        ));
    }
    if range.to > to_exclude.to {
        remaining.push(Range::new_unchecked(to_exclude.to.next_value(), range.to));
    }
    remaining
}

/// Remove every exclusion from `range`, one exclusion at a time.
pub fn exclude_many<T: RangeValue>(range: &Range<T>, exclusions: &[Range<T>]) -> Vec<Range<T>> {
    let mut remaining = vec![*range];
    for ex in exclusions {
        remaining = remaining.iter().flat_map(|r| exclude(r, ex)).collect();
        if remaining.is_empty() {
            break;
        }
    }
    remaining
}

/// Same result as applying [`exclude_many`] to every range, computed with a
/// single sweep over the merged inputs.
pub fn exclude_sorted<T: RangeValue>(ranges: &[Range<T>], exclusions: &[Range<T>]) -> Vec<Range<T>> {
    let ranges = merge(ranges);
    let exclusions = merge(exclusions);

    let mut result = Vec::with_capacity(ranges.len());
    let mut first_candidate = 0;
    for range in &ranges {
        while first_candidate < exclusions.len() && exclusions[first_candidate].to < range.from {
            first_candidate += 1;
        }

        let mut cursor = Some(range.from);
        for ex in exclusions[first_candidate..].iter().take_while(|ex| ex.from <= range.to) {
            let Some(from) = cursor else { break };
            if ex.from > from {
                result.push(Range::new_unchecked(from, ex.from.previous_value()));
            }
            cursor = (ex.to < range.to).then(|| ex.to.next_value().max(from));
        }
        if let Some(from) = cursor {
            result.push(Range::new_unchecked(from, range.to));
        }
    }
    result
}

fn length_as_step(max_len: u64) -> i64 {
    i64::try_from(max_len).unwrap_or(i64::MAX)
}

/// Split into consecutive chunks of at most `max_len` units, in order.
pub fn split_to_max_length<T: RangeValue>(
    range: &Range<T>,
    max_len: u64,
) -> Result<Vec<Range<T>>, RangeError> {
    if max_len == 0 {
        return Err(RangeError::ZeroLength);
    }
    let step = length_as_step(max_len);
    let mut chunks = Vec::with_capacity((range.size() / max_len) as usize + 1);
    let mut from = range.from;
    loop {
        let rest = Range::new_unchecked(from, range.to);
        if rest.size() <= max_len {
            chunks.push(rest);
            return Ok(chunks);
        }
        let end = from.add(step - 1);
        chunks.push(Range::new_unchecked(from, end));
        from = end.next_value();
    }
}

pub fn split_many_to_max_length<T: RangeValue>(
    ranges: &[Range<T>],
    max_len: u64,
) -> Result<Vec<Range<T>>, RangeError> {
    let mut chunks = Vec::with_capacity(ranges.len());
    for range in ranges {
        chunks.extend(split_to_max_length(range, max_len)?);
    }
    Ok(chunks)
}

/// Merge, split to `max_len` and keep the first `take` chunks in `order`.
///
/// Only the chunks that are returned are ever materialised, so asking for
/// the latest few chunks of a huge history stays cheap.
pub fn split_many_and_take_some<T: RangeValue>(
    ranges: &[Range<T>],
    max_len: u64,
    take: usize,
    order: SortOrder,
) -> Result<Vec<Range<T>>, RangeError> {
    if max_len == 0 {
        return Err(RangeError::ZeroLength);
    }
    if ranges.is_empty() || take == 0 {
        return Ok(vec![]);
    }
    let step = length_as_step(max_len);
    let merged = merge(ranges);
    let mut result: Vec<Range<T>> = Vec::with_capacity(take.min(merged.len() * 2));

    match order {
        SortOrder::Asc => {
            for range in &merged {
                let mut from = range.from;
                while result.len() < take {
                    let rest = Range::new_unchecked(from, range.to);
                    if rest.size() <= max_len {
                        push_ordered(&mut result, rest, order);
                        break;
                    }
                    let end = from.add(step - 1);
                    push_ordered(&mut result, Range::new_unchecked(from, end), order);
                    from = end.next_value();
                }
            }
        }
        SortOrder::Desc => {
            for range in merged.iter().rev() {
                let mut to = range.to;
                while result.len() < take {
                    let rest = Range::new_unchecked(range.from, to);
                    if rest.size() <= max_len {
                        push_ordered(&mut result, rest, order);
                        break;
                    }
                    let start = to.add(1 - step);
                    push_ordered(&mut result, Range::new_unchecked(start, to), order);
                    to = start.previous_value();
                }
            }
        }
    }
    result.truncate(take);
    Ok(result)
}

fn push_ordered<T: RangeValue>(result: &mut Vec<Range<T>>, range: Range<T>, order: SortOrder) {
    debug_assert!(
        result.last().map_or(true, |last| match order {
            SortOrder::Asc => last.to < range.from,
            SortOrder::Desc => range.to < last.from,
        }),
        "split produced overlapping or out-of-order ranges"
    );
    result.push(range);
}

/// Sum of the sizes of `ranges` (overlaps counted twice).
pub fn total_size<T: RangeValue>(ranges: &[Range<T>]) -> u64 {
    ranges.iter().map(Range::size).sum()
}

/// Returns `true` if any two ranges of the list overlap.
pub fn any_overlap<T: RangeValue>(ranges: &[Range<T>]) -> bool {
    let mut sorted = ranges.to_vec();
    sorted.sort_unstable_by_key(|r| r.from);
    sorted.windows(2).any(|w| w[0].overlaps(&w[1]))
}

/// Returns `true` if any range of `a` overlaps any range of `b`.
pub fn many_overlap<T: RangeValue>(a: &[Range<T>], b: &[Range<T>]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_unstable_by_key(|r| r.from);
    b.sort_unstable_by_key(|r| r.from);

    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i].overlaps(&b[j]) {
            return true;
        }
        if a[i].to < b[j].from {
            i += 1;
        } else {
            j += 1;
        }
    }
    false
}

// ─── Tests ───────────────────────────────────────────────────────────────────
