#![forbid(unsafe_code)]

use std::cell::OnceCell;
use std::collections::HashMap;
use std::ops::Range;

use chrono::{NaiveTime, TimeDelta};
use qc_types::Timestamp;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on generated grids so a tiny frequency cannot exhaust memory.
pub const MAX_GRID_LEN: usize = 50_000_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("index is empty")]
    Empty,
    #[error("step must be positive, found {millis} ms")]
    InvalidStep { millis: i64 },
    #[error("range start {start} is after range end {end}")]
    InvalidRange { start: Timestamp, end: Timestamp },
    #[error("grid of {len} slots exceeds the limit of {MAX_GRID_LEN}")]
    GridTooLarge { len: usize },
    #[error("operation requires a strictly increasing index")]
    NotStrictlyIncreasing,
    #[error("index contains duplicate timestamps")]
    DuplicateLabels,
    #[error("alignment vectors must have equal lengths")]
    InvalidAlignmentVectors,
}

fn detect_duplicates(labels: &[Timestamp]) -> bool {
    let mut seen = HashMap::<&Timestamp, ()>::with_capacity(labels.len());
    labels.iter().any(|label| seen.insert(label, ()).is_some())
}

/// Ordered sequence of timestamps labelling the rows of a frame.
///
/// Raw indexes may be unsorted or contain duplicates; most lookups that
/// depend on time order require [`TimeIndex::is_strictly_increasing`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeIndex {
    labels: Vec<Timestamp>,
    #[serde(skip)]
    duplicate_cache: OnceCell<bool>,
    #[serde(skip)]
    increasing_cache: OnceCell<bool>,
}

impl PartialEq for TimeIndex {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels
    }
}

impl From<Vec<Timestamp>> for TimeIndex {
    fn from(labels: Vec<Timestamp>) -> Self {
        Self::new(labels)
    }
}

impl TimeIndex {
    #[must_use]
    pub fn new(labels: Vec<Timestamp>) -> Self {
        Self {
            labels,
            duplicate_cache: OnceCell::new(),
            increasing_cache: OnceCell::new(),
        }
    }

    /// `start, start + step, ...` up to and including `end`.
    pub fn regular_range(
        start: Timestamp,
        end: Timestamp,
        step: TimeDelta,
    ) -> Result<Self, IndexError> {
        let step_ms = step.num_milliseconds();
        if step_ms <= 0 {
            return Err(IndexError::InvalidStep { millis: step_ms });
        }
        if start > end {
            return Err(IndexError::InvalidRange { start, end });
        }
        let span_ms = (end - start).num_milliseconds();
        let slots = usize::try_from(span_ms / step_ms)
            .ok()
            .and_then(|n| n.checked_add(1))
            .unwrap_or(usize::MAX);
        if slots > MAX_GRID_LEN {
            return Err(IndexError::GridTooLarge { len: slots });
        }
        let labels = (0..slots)
            .map(|k| start + TimeDelta::milliseconds(step_ms * k as i64))
            .collect();
        Ok(Self::new(labels))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[must_use]
    pub fn labels(&self) -> &[Timestamp] {
        &self.labels
    }

    #[must_use]
    pub fn get(&self, pos: usize) -> Option<Timestamp> {
        self.labels.get(pos).copied()
    }

    #[must_use]
    pub fn first(&self) -> Option<Timestamp> {
        self.labels.first().copied()
    }

    #[must_use]
    pub fn last(&self) -> Option<Timestamp> {
        self.labels.last().copied()
    }

    #[must_use]
    pub fn has_duplicates(&self) -> bool {
        *self
            .duplicate_cache
            .get_or_init(|| detect_duplicates(&self.labels))
    }

    /// Sorted ascending with no repeated timestamp.
    #[must_use]
    pub fn is_strictly_increasing(&self) -> bool {
        *self
            .increasing_cache
            .get_or_init(|| self.labels.windows(2).all(|w| w[0] < w[1]))
    }

    /// Position in `self` of every label of `target` (first occurrence).
    #[must_use]
    pub fn get_indexer(&self, target: &TimeIndex) -> Vec<Option<usize>> {
        let mut positions = HashMap::with_capacity(self.labels.len());
        for (idx, label) in self.labels.iter().enumerate() {
            positions.entry(label).or_insert(idx);
        }
        target
            .labels
            .iter()
            .map(|label| positions.get(label).copied())
            .collect()
    }

    /// Stable ascending sort order: equal timestamps keep input order.
    #[must_use]
    pub fn argsort(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.labels.len()).collect();
        order.sort_by_key(|&i| self.labels[i]);
        order
    }

    #[must_use]
    pub fn take(&self, positions: &[usize]) -> Self {
        Self::new(positions.iter().map(|&i| self.labels[i]).collect())
    }

    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.labels.len());
        let start = start.min(end);
        Self::new(self.labels[start..end].to_vec())
    }

    /// Sorted union of two duplicate-free indexes.
    pub fn union_sorted(&self, other: &Self) -> Result<Self, IndexError> {
        if self.has_duplicates() || other.has_duplicates() {
            return Err(IndexError::DuplicateLabels);
        }
        let mut labels: Vec<Timestamp> = self
            .labels
            .iter()
            .chain(other.labels.iter())
            .copied()
            .collect();
        labels.sort_unstable();
        labels.dedup();
        Ok(Self::new(labels))
    }

    // ── Time-span lookups (strictly increasing indexes) ─────────────────

    fn require_increasing(&self) -> Result<(), IndexError> {
        if self.is_strictly_increasing() {
            Ok(())
        } else {
            Err(IndexError::NotStrictlyIncreasing)
        }
    }

    /// First position whose label is `>= target`; `len()` when none is.
    pub fn first_at_or_after(&self, target: Timestamp) -> Result<usize, IndexError> {
        self.require_increasing()?;
        Ok(self.labels.partition_point(|label| *label < target))
    }

    /// Positions of labels inside `[start, end]`.
    pub fn positions_between(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Range<usize>, IndexError> {
        self.require_increasing()?;
        let lo = self.labels.partition_point(|label| *label < start);
        let hi = self.labels.partition_point(|label| *label <= end);
        Ok(lo..hi.max(lo))
    }

    /// Position of the label closest to `target`; ties resolve to the later label.
    pub fn nearest(&self, target: Timestamp) -> Result<usize, IndexError> {
        self.require_increasing()?;
        if self.labels.is_empty() {
            return Err(IndexError::Empty);
        }
        let after = self.labels.partition_point(|label| *label < target);
        if after == 0 {
            return Ok(0);
        }
        if after == self.labels.len() {
            return Ok(after - 1);
        }
        let before = after - 1;
        let left = target - self.labels[before];
        let right = self.labels[after] - target;
        Ok(if left < right { before } else { after })
    }

    /// Start position of the closed window `[labels[pos] - span, labels[pos]]`.
    pub fn window_start(&self, pos: usize, span: TimeDelta) -> Result<usize, IndexError> {
        self.require_increasing()?;
        let Some(&end) = self.labels.get(pos) else {
            return Ok(pos);
        };
        let start = end - span;
        Ok(self.labels[..=pos].partition_point(|label| *label < start))
    }
}

// ── Alignment ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentPlan {
    pub union_index: TimeIndex,
    pub left_positions: Vec<Option<usize>>,
    pub right_positions: Vec<Option<usize>>,
}

/// Align two duplicate-free indexes on their sorted union.
pub fn align_union(left: &TimeIndex, right: &TimeIndex) -> Result<AlignmentPlan, IndexError> {
    let union_index = left.union_sorted(right)?;
    let left_positions = left.get_indexer(&union_index);
    let right_positions = right.get_indexer(&union_index);
    Ok(AlignmentPlan {
        union_index,
        left_positions,
        right_positions,
    })
}

pub fn validate_alignment_plan(plan: &AlignmentPlan) -> Result<(), IndexError> {
    let n = plan.union_index.len();
    if plan.left_positions.len() != n || plan.right_positions.len() != n {
        return Err(IndexError::InvalidAlignmentVectors);
    }
    Ok(())
}

// ── Timestamp audit ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuditOptions {
    pub frequency: TimeDelta,
    pub expected_start: Option<Timestamp>,
    pub expected_end: Option<Timestamp>,
    /// Reindex onto the regular grid instead of checking occupancy of bins.
    pub exact_times: bool,
}

impl AuditOptions {
    #[must_use]
    pub fn new(frequency: TimeDelta) -> Self {
        Self {
            frequency,
            expected_start: None,
            expected_end: None,
            exact_times: true,
        }
    }
}

/// Outcome of auditing a raw index.
///
/// Every failure vector is paired with the index it is aligned to, so the
/// caller can group runs into records with the right start and end times.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampAudit {
    /// The raw index, in input order.
    pub raw: TimeIndex,
    /// Row `i` is earlier than row `i - 1`; aligned with `raw`.
    pub nonmonotonic: Vec<bool>,
    /// Sorted, duplicate-free timestamps of the input.
    pub unique: TimeIndex,
    /// Timestamp occurred more than once; aligned with `unique`.
    pub duplicated: Vec<bool>,
    /// Grid slots (exact times) or bin starts the missing check ran over.
    pub expected: TimeIndex,
    /// Slot or bin holds no timestamp; aligned with `expected`.
    pub missing: Vec<bool>,
    /// The normalized index.
    pub index: TimeIndex,
    /// Raw row feeding each row of `index`, `None` for inserted grid slots.
    pub rows: Vec<Option<usize>>,
    /// Distinct timestamps dropped because they fall off the expected grid.
    pub off_grid: usize,
}

/// Detect non-monotonic, duplicate and missing timestamps and build the
/// normalized index.
pub fn audit_timestamps(
    raw: &TimeIndex,
    options: &AuditOptions,
) -> Result<TimestampAudit, IndexError> {
    let step_ms = options.frequency.num_milliseconds();
    if step_ms <= 0 {
        return Err(IndexError::InvalidStep { millis: step_ms });
    }
    if raw.is_empty() {
        return Err(IndexError::Empty);
    }
    let labels = raw.labels();

    let mut nonmonotonic = vec![false; labels.len()];
    for i in 1..labels.len() {
        nonmonotonic[i] = labels[i] < labels[i - 1];
    }

    // stable sort keeps the first input occurrence at the head of each run
    let order = raw.argsort();
    let mut unique_labels = Vec::with_capacity(labels.len());
    let mut kept_rows = Vec::with_capacity(labels.len());
    let mut duplicated = Vec::with_capacity(labels.len());
    for &row in &order {
        let ts = labels[row];
        if unique_labels.last() == Some(&ts) {
            if let Some(flag) = duplicated.last_mut() {
                *flag = true;
            }
        } else {
            unique_labels.push(ts);
            kept_rows.push(row);
            duplicated.push(false);
        }
    }
    let unique = TimeIndex::new(unique_labels);

    let (first, last) = match (unique.first(), unique.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(IndexError::Empty),
    };

    if options.exact_times {
        let start = options.expected_start.unwrap_or(first);
        let end = options.expected_end.unwrap_or(last);
        let grid = TimeIndex::regular_range(start, end, options.frequency)?;
        let on_grid = unique.get_indexer(&grid);
        let missing = on_grid.iter().map(Option::is_none).collect();
        let rows = on_grid
            .iter()
            .map(|pos| pos.map(|p| kept_rows[p]))
            .collect();
        let matched = on_grid.iter().filter(|pos| pos.is_some()).count();
        Ok(TimestampAudit {
            raw: raw.clone(),
            nonmonotonic,
            off_grid: unique.len() - matched,
            unique,
            duplicated,
            expected: grid.clone(),
            missing,
            index: grid,
            rows,
        })
    } else {
        let (bins, missing) = occupancy_bins(unique.labels(), step_ms)?;
        Ok(TimestampAudit {
            raw: raw.clone(),
            nonmonotonic,
            index: unique.clone(),
            unique,
            duplicated,
            expected: bins,
            missing,
            rows: kept_rows.into_iter().map(Some).collect(),
            off_grid: 0,
        })
    }
}

/// Bins of `step_ms` aligned to midnight of the first day; a bin is missing
/// when no timestamp falls inside it.
fn occupancy_bins(sorted: &[Timestamp], step_ms: i64) -> Result<(TimeIndex, Vec<bool>), IndexError> {
    let Some(&first) = sorted.first() else {
        return Ok((TimeIndex::default(), Vec::new()));
    };
    let origin = first.date().and_time(NaiveTime::MIN);
    let bin_of = |ts: &Timestamp| (*ts - origin).num_milliseconds().div_euclid(step_ms);
    let first_bin = bin_of(&first);
    let last_bin = sorted.last().map_or(first_bin, bin_of);

    let len = usize::try_from(last_bin - first_bin + 1).unwrap_or(usize::MAX);
    if len > MAX_GRID_LEN {
        return Err(IndexError::GridTooLarge { len });
    }
    let mut occupied = vec![false; len];
    for ts in sorted {
        if let Some(slot) = usize::try_from(bin_of(ts) - first_bin)
            .ok()
            .and_then(|k| occupied.get_mut(k))
        {
            *slot = true;
        }
    }
    let starts = (first_bin..=last_bin)
        .map(|k| origin + TimeDelta::milliseconds(k * step_ms))
        .collect();
    let missing = occupied.iter().map(|&hit| !hit).collect();
    Ok((TimeIndex::new(starts), missing))
}
