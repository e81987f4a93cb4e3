//! Ratio-weighted op sequencing.
//!
//! A [`SequencePlanner`] collects items with integer ratios and lays them out
//! into an [`OpSequence`] of length `Σ ratio`. Cycles map onto the sequence by
//! modulo, so every window of `len` consecutive cycles sees each item exactly
//! `ratio` times whichever layout is chosen. The layouts differ in how evenly
//! the occurrences are spread inside that window.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequencerType {
    /// Weighted round robin: each pass takes one token from every item that
    /// still has some. `A:3,B:1` gives `A B A A`.
    #[default]
    Bucket,
    /// Occurrence `k` of an item with ratio `r` sits at `k / r` on the unit
    /// interval. `A:4,B:2` gives `A B A A B A`.
    Interval,
    /// Items back to back. `A:2,B:1` gives `A A B`.
    Concat,
}

impl FromStr for SequencerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bucket" => Ok(SequencerType::Bucket),
            "interval" => Ok(SequencerType::Interval),
            "concat" => Ok(SequencerType::Concat),
            _ => Err(Error::UnknownSequencer(s.to_string())),
        }
    }
}

impl fmt::Display for SequencerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SequencerType::Bucket => "bucket",
            SequencerType::Interval => "interval",
            SequencerType::Concat => "concat",
        })
    }
}

/// Immutable cycle → item lookup table.
#[derive(Debug, Clone)]
pub struct OpSequence<T> {
    items: Vec<T>,
}

impl<T> OpSequence<T> {
    /// Item for `cycle`, or `None` if the sequence is empty.
    pub fn get(&self, cycle: u64) -> Option<&T> {
        if self.items.is_empty() {
            return None;
        }
        let idx = cycle % self.items.len() as u64;
        self.items.get(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

pub struct SequencePlanner<T> {
    kind: SequencerType,
    entries: Vec<(T, u64)>,
}

impl<T: Clone> SequencePlanner<T> {
    pub fn new(kind: SequencerType) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }

    /// Adds `item` with weight `ratio`. A ratio of zero excludes it.
    pub fn add(&mut self, item: T, ratio: u64) -> &mut Self {
        if ratio > 0 {
            self.entries.push((item, ratio));
        }
        self
    }

    /// Lays out the sequence. The result is empty only if every ratio was zero;
    /// the caller decides whether that is an error for its cycle range.
    pub fn resolve(self) -> OpSequence<T> {
        let order = match self.kind {
            SequencerType::Bucket => bucket_order(&self.entries),
            SequencerType::Interval => interval_order(&self.entries),
            SequencerType::Concat => concat_order(&self.entries),
        };
        let items = order
            .into_iter()
            .map(|i| self.entries[i].0.clone())
            .collect();
        OpSequence { items }
    }
}

fn bucket_order<T>(entries: &[(T, u64)]) -> Vec<usize> {
    let mut remaining: Vec<u64> = entries.iter().map(|(_, r)| *r).collect();
    let total: u64 = remaining.iter().sum();
    let mut order = Vec::with_capacity(total as usize);
    while (order.len() as u64) < total {
        for (i, left) in remaining.iter_mut().enumerate() {
            if *left > 0 {
                *left -= 1;
                order.push(i);
            }
        }
    }
    order
}

fn interval_order<T>(entries: &[(T, u64)]) -> Vec<usize> {
    // (entry, k, ratio), position k / ratio
    let mut slots: Vec<(usize, u64, u64)> = entries
        .iter()
        .enumerate()
        .flat_map(|(i, (_, r))| (0..*r).map(move |k| (i, k, *r)))
        .collect();
    // exact rational comparison; sort_by is stable so ties keep declaration order
    slots.sort_by(|a, b| (a.1 as u128 * b.2 as u128).cmp(&(b.1 as u128 * a.2 as u128)));
    slots.into_iter().map(|(i, _, _)| i).collect()
}

fn concat_order<T>(entries: &[(T, u64)]) -> Vec<usize> {
    entries
        .iter()
        .enumerate()
        .flat_map(|(i, (_, r))| std::iter::repeat_n(i, *r as usize))
        .collect()
}
