#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::TimeDelta;
use qc_columnar::{BitMask, Column, ColumnError};
use qc_index::{IndexError, TimeIndex, align_union, validate_alignment_plan};
use qc_types::{nanmean, nanstd};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("index length ({index_len}) does not match column length ({column_len})")]
    LengthMismatch { index_len: usize, column_len: usize },
    #[error("column '{0}' not found")]
    UnknownColumn(String),
    #[error("duplicate column name: '{0}'")]
    DuplicateColumn(String),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

fn check_len(index: &TimeIndex, column_len: usize) -> Result<(), FrameError> {
    if column_len == index.len() {
        Ok(())
    } else {
        Err(FrameError::LengthMismatch {
            index_len: index.len(),
            column_len,
        })
    }
}

// ── TimeFrame ──────────────────────────────────────────────────────────

/// Named float columns sharing one timestamp index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeFrame {
    index: TimeIndex,
    columns: BTreeMap<String, Column>,
    column_order: Vec<String>,
}

impl TimeFrame {
    pub fn new(
        index: TimeIndex,
        columns: Vec<(String, Column)>,
    ) -> Result<Self, FrameError> {
        let mut frame = Self::empty(index);
        for (name, column) in columns {
            if frame.columns.contains_key(&name) {
                return Err(FrameError::DuplicateColumn(name));
            }
            frame.insert_column(name, column)?;
        }
        Ok(frame)
    }

    pub fn from_values(
        index: TimeIndex,
        columns: Vec<(&str, Vec<f64>)>,
    ) -> Result<Self, FrameError> {
        Self::new(
            index,
            columns
                .into_iter()
                .map(|(name, values)| (name.to_owned(), Column::new(values)))
                .collect(),
        )
    }

    /// Frame with an index and no columns.
    #[must_use]
    pub fn empty(index: TimeIndex) -> Self {
        Self {
            index,
            columns: BTreeMap::new(),
            column_order: Vec::new(),
        }
    }

    #[must_use]
    pub fn index(&self) -> &TimeIndex {
        &self.index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.column_order.len()
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    #[must_use]
    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.get_mut(name)
    }

    /// Columns in insertion order.
    pub fn iter_columns(&self) -> impl Iterator<Item = (&str, &Column)> + '_ {
        self.column_order
            .iter()
            .filter_map(|name| self.columns.get(name).map(|col| (name.as_str(), col)))
    }

    /// Add a column, replacing (in place) one with the same name.
    pub fn insert_column(
        &mut self,
        name: impl Into<String>,
        column: Column,
    ) -> Result<(), FrameError> {
        check_len(&self.index, column.len())?;
        let name = name.into();
        if !self.columns.contains_key(&name) {
            self.column_order.push(name.clone());
        }
        self.columns.insert(name, column);
        Ok(())
    }

    /// Sub-frame with the requested columns, in the requested order.
    pub fn select(&self, names: &[String]) -> Result<Self, FrameError> {
        let mut seen = BTreeSet::new();
        let mut out = Self::empty(self.index.clone());
        for name in names {
            let column = self
                .columns
                .get(name)
                .ok_or_else(|| FrameError::UnknownColumn(name.clone()))?;
            if !seen.insert(name.as_str()) {
                return Err(FrameError::DuplicateColumn(name.clone()));
            }
            out.insert_column(name.clone(), column.clone())?;
        }
        Ok(out)
    }

    /// Gather rows by position onto `index`; `None` rows are all-missing.
    pub fn take_rows(
        &self,
        index: TimeIndex,
        positions: &[Option<usize>],
    ) -> Result<Self, FrameError> {
        check_len(&index, positions.len())?;
        let mut out = Self::empty(index);
        for (name, column) in self.iter_columns() {
            out.insert_column(name, column.take(positions))?;
        }
        Ok(out)
    }

    /// Cells outside `keep` become missing.
    pub fn mask_rows(&self, keep: &BitMask) -> Result<Self, FrameError> {
        check_len(&self.index, keep.len())?;
        let mut out = Self::empty(self.index.clone());
        for (name, column) in self.iter_columns() {
            out.insert_column(name, column.where_mask(keep))?;
        }
        Ok(out)
    }

    /// Cells where `mask` is false become missing.
    pub fn where_mask(&self, mask: &MaskFrame) -> Result<Self, FrameError> {
        check_len(&self.index, mask.len())?;
        let mut out = Self::empty(self.index.clone());
        for (name, column) in self.iter_columns() {
            let column = match mask.column(name) {
                Some(keep) => column.where_mask(keep),
                None => column.clone(),
            };
            out.insert_column(name, column)?;
        }
        Ok(out)
    }

    pub fn set_missing(&mut self, name: &str, row: usize) -> Result<(), FrameError> {
        let column = self
            .columns
            .get_mut(name)
            .ok_or_else(|| FrameError::UnknownColumn(name.to_owned()))?;
        column.set_missing(row);
        Ok(())
    }

    /// Merge `newer` into this frame on the sorted union of both indexes.
    ///
    /// Non-missing cells of `newer` win; elsewhere the value from this frame
    /// is kept, and cells present in neither are missing.
    pub fn combine_newest(&self, newer: &Self) -> Result<Self, FrameError> {
        let plan = align_union(&self.index, &newer.index)?;
        validate_alignment_plan(&plan)?;

        let mut out = Self::empty(plan.union_index);
        let names: Vec<&String> = self
            .column_order
            .iter()
            .chain(
                newer
                    .column_order
                    .iter()
                    .filter(|name| !self.columns.contains_key(*name)),
            )
            .collect();
        for name in names {
            let older = self.columns.get(name);
            let latest = newer.columns.get(name);
            let values = plan
                .left_positions
                .iter()
                .zip(&plan.right_positions)
                .map(|(left, right)| {
                    let new_value = latest.zip(*right).map(|(col, pos)| col.values()[pos]);
                    match new_value {
                        Some(value) if !value.is_nan() => value,
                        _ => older
                            .zip(*left)
                            .map_or(f64::NAN, |(col, pos)| col.values()[pos]),
                    }
                })
                .collect();
            out.insert_column(name.clone(), Column::new(values))?;
        }
        Ok(out)
    }

    /// Time-span rolling window over one column.
    pub fn rolling(
        &self,
        name: &str,
        span: TimeDelta,
        min_periods: usize,
    ) -> Result<Rolling<'_>, FrameError> {
        let column = self
            .columns
            .get(name)
            .ok_or_else(|| FrameError::UnknownColumn(name.to_owned()))?;
        Rolling::new(&self.index, column.values(), span, min_periods)
    }
}

// ── MaskFrame ──────────────────────────────────────────────────────────

/// Boolean frame with the shape of a [`TimeFrame`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MaskFrame {
    index: TimeIndex,
    columns: BTreeMap<String, BitMask>,
    column_order: Vec<String>,
}

impl MaskFrame {
    /// Every cell of every named column set to `value`.
    #[must_use]
    pub fn filled(index: TimeIndex, names: &[String], value: bool) -> Self {
        let len = index.len();
        let mut out = Self {
            index,
            columns: BTreeMap::new(),
            column_order: Vec::new(),
        };
        for name in names {
            let bits = if value {
                BitMask::all_true(len)
            } else {
                BitMask::all_false(len)
            };
            if out.columns.insert(name.clone(), bits).is_none() {
                out.column_order.push(name.clone());
            }
        }
        out
    }

    pub fn new(index: TimeIndex, columns: Vec<(String, BitMask)>) -> Result<Self, FrameError> {
        let mut out = Self::filled(index, &[], false);
        for (name, bits) in columns {
            if out.columns.contains_key(&name) {
                return Err(FrameError::DuplicateColumn(name));
            }
            out.insert_column(name, bits)?;
        }
        Ok(out)
    }

    #[must_use]
    pub fn index(&self) -> &TimeIndex {
        &self.index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&BitMask> {
        self.columns.get(name)
    }

    pub fn iter_columns(&self) -> impl Iterator<Item = (&str, &BitMask)> + '_ {
        self.column_order
            .iter()
            .filter_map(|name| self.columns.get(name).map(|bits| (name.as_str(), bits)))
    }

    #[must_use]
    pub fn get(&self, name: &str, row: usize) -> bool {
        self.columns.get(name).is_some_and(|bits| bits.get(row))
    }

    pub fn insert_column(&mut self, name: impl Into<String>, bits: BitMask) -> Result<(), FrameError> {
        check_len(&self.index, bits.len())?;
        let name = name.into();
        if !self.columns.contains_key(&name) {
            self.column_order.push(name.clone());
        }
        self.columns.insert(name, bits);
        Ok(())
    }

    /// OR `bits` into the named column, creating it when absent.
    pub fn or_column(&mut self, name: &str, bits: &BitMask) -> Result<(), FrameError> {
        check_len(&self.index, bits.len())?;
        match self.columns.get_mut(name) {
            Some(existing) => *existing = existing.or_mask(bits),
            None => self.insert_column(name, bits.clone())?,
        }
        Ok(())
    }

    /// Conform to `index`, filling new rows (and columns in `names` not yet
    /// present) with `fill`.
    #[must_use]
    pub fn realign(&self, index: TimeIndex, names: &[String], fill: bool) -> Self {
        let positions = self.index.get_indexer(&index);
        let mut out = Self::filled(index, names, fill);
        for (name, bits) in self.iter_columns() {
            // realigned columns keep their original order ahead of new ones
            out.columns.insert(name.to_owned(), bits.take(&positions, fill));
        }
        let mut order: Vec<String> = self.column_order.clone();
        for name in names {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        out.column_order = order;
        out
    }

    /// Cell-wise negation.
    #[must_use]
    pub fn not(&self) -> Self {
        Self {
            index: self.index.clone(),
            columns: self
                .columns
                .iter()
                .map(|(name, bits)| (name.clone(), bits.not_mask()))
                .collect(),
            column_order: self.column_order.clone(),
        }
    }

    #[must_use]
    pub fn count_true(&self) -> usize {
        self.columns.values().map(BitMask::count_true).sum()
    }
}

// ── Rolling windows ────────────────────────────────────────────────────

/// Min/max summary of one closed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowExtrema {
    /// First row of the window.
    pub start: usize,
    pub min: f64,
    pub max: f64,
    /// Row of the first minimum.
    pub argmin: usize,
    /// Row of the first maximum.
    pub argmax: usize,
}

impl WindowExtrema {
    #[must_use]
    pub fn delta(&self) -> f64 {
        self.max - self.min
    }
}

/// Closed time-span windows `[t - span, t]` over a strictly increasing
/// index. A window yields a value only when it holds at least
/// `min_periods` non-missing values.
pub struct Rolling<'a> {
    values: &'a [f64],
    starts: Vec<usize>,
    min_periods: usize,
}

impl<'a> Rolling<'a> {
    pub fn new(
        index: &TimeIndex,
        values: &'a [f64],
        span: TimeDelta,
        min_periods: usize,
    ) -> Result<Self, FrameError> {
        check_len(index, values.len())?;
        if !index.is_strictly_increasing() {
            return Err(IndexError::NotStrictlyIncreasing.into());
        }
        let labels = index.labels();
        let mut starts = Vec::with_capacity(labels.len());
        let mut start = 0;
        for &end in labels {
            let from = end - span;
            while labels.get(start).is_some_and(|label| *label < from) {
                start += 1;
            }
            starts.push(start);
        }
        Ok(Self {
            values,
            starts,
            min_periods: min_periods.max(1),
        })
    }

    /// First row of each row's window.
    #[must_use]
    pub fn starts(&self) -> &[usize] {
        &self.starts
    }

    /// Running count, sum and sum of squares of each window, shifted by the
    /// first value of the column.
    fn sums(&self) -> Vec<WindowSums> {
        let shift = self
            .values
            .iter()
            .copied()
            .find(|v| v.is_finite())
            .unwrap_or(0.0);
        let mut acc = WindowSums::default();
        let mut tail = 0;
        self.starts
            .iter()
            .enumerate()
            .map(|(end, &start)| {
                acc.push(self.values[end], shift);
                while tail < start {
                    acc.pop(self.values[tail], shift);
                    tail += 1;
                }
                if acc.count == 0 {
                    acc = WindowSums::default();
                }
                WindowSums { shift, ..acc }
            })
            .collect()
    }

    fn window(&self, end: usize) -> &[f64] {
        &self.values[self.starts[end]..=end]
    }

    #[must_use]
    pub fn mean(&self) -> Vec<f64> {
        self.sums()
            .iter()
            .enumerate()
            .map(|(end, sums)| {
                if sums.count < self.min_periods {
                    f64::NAN
                } else if sums.infinite > 0 {
                    nanmean(self.window(end))
                } else {
                    sums.shift + sums.sum / sums.count as f64
                }
            })
            .collect()
    }

    /// Sample standard deviation.
    #[must_use]
    pub fn std(&self) -> Vec<f64> {
        self.sums()
            .iter()
            .enumerate()
            .map(|(end, sums)| {
                if sums.count < self.min_periods || sums.count < 2 {
                    return f64::NAN;
                }
                let n = sums.count as f64;
                let spread = sums.sum_sq - sums.sum * sums.sum / n;
                // cancellation swamps nearly constant windows
                if sums.infinite > 0 || spread <= 1e-9 * sums.sum_sq {
                    nanstd(self.window(end), 1)
                } else {
                    (spread / (n - 1.0)).sqrt()
                }
            })
            .collect()
    }

    #[must_use]
    pub fn min(&self) -> Vec<f64> {
        self.extrema()
            .iter()
            .map(|extrema| extrema.map_or(f64::NAN, |e| e.min))
            .collect()
    }

    #[must_use]
    pub fn max(&self) -> Vec<f64> {
        self.extrema()
            .iter()
            .map(|extrema| extrema.map_or(f64::NAN, |e| e.max))
            .collect()
    }

    /// Monotonic queues of candidate rows; the head of each is the first
    /// minimum (maximum) of the current window.
    #[must_use]
    pub fn extrema(&self) -> Vec<Option<WindowExtrema>> {
        let mut lows: VecDeque<usize> = VecDeque::new();
        let mut highs: VecDeque<usize> = VecDeque::new();
        let mut valid = 0_usize;
        let mut tail = 0;
        self.starts
            .iter()
            .enumerate()
            .map(|(end, &start)| {
                let value = self.values[end];
                if !value.is_nan() {
                    valid += 1;
                    while lows.back().is_some_and(|&row| self.values[row] > value) {
                        lows.pop_back();
                    }
                    lows.push_back(end);
                    while highs.back().is_some_and(|&row| self.values[row] < value) {
                        highs.pop_back();
                    }
                    highs.push_back(end);
                }
                while tail < start {
                    if !self.values[tail].is_nan() {
                        valid -= 1;
                    }
                    tail += 1;
                }
                while lows.front().is_some_and(|&row| row < start) {
                    lows.pop_front();
                }
                while highs.front().is_some_and(|&row| row < start) {
                    highs.pop_front();
                }
                if valid < self.min_periods {
                    return None;
                }
                let (&argmin, &argmax) = (lows.front()?, highs.front()?);
                Some(WindowExtrema {
                    start,
                    min: self.values[argmin],
                    max: self.values[argmax],
                    argmin,
                    argmax,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowSums {
    shift: f64,
    /// Non-missing values, infinite ones included.
    count: usize,
    infinite: usize,
    sum: f64,
    sum_sq: f64,
}

impl WindowSums {
    fn push(&mut self, value: f64, shift: f64) {
        if value.is_nan() {
            return;
        }
        self.count += 1;
        if value.is_finite() {
            let d = value - shift;
            self.sum += d;
            self.sum_sq += d * d;
        } else {
            self.infinite += 1;
        }
    }

    fn pop(&mut self, value: f64, shift: f64) {
        if value.is_nan() {
            return;
        }
        self.count = self.count.saturating_sub(1);
        if value.is_finite() {
            let d = value - shift;
            self.sum -= d;
            self.sum_sq -= d * d;
        } else {
            self.infinite = self.infinite.saturating_sub(1);
        }
    }
}
