// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Weight matrix builder
//!
//! Turns raw overlay counts into the normalized weights that drive
//! apportionment.
//!
//! Terms
//! -----
//!
//! *Sub-unit*
//!
//! A fine-grained locator, typically a postcode, whose position is known
//! precisely. Counting how many of a geography's sub-units fall inside each
//! grid cell gives an estimate of how the geography's population is split
//! across the cells it overlaps.
//!
//! *Raw proportion*
//!
//! For geography g and cell c:
//!
//! p(g, c) = count(g, c) / total(g)
//!
//! where total(g) is the number of sub-units in g as a whole.
//!
//! *Weight*
//!
//! The overlay frequently attributes the same sub-unit to more than one cell
//! (points on a shared boundary), and occasionally to none, so the raw
//! proportions of a geography need not sum to 1. Each geography's row is
//! therefore rescaled by its own sum:
//!
//! w(g, c) = p(g, c) / sum_c' p(g, c')
//!
//! giving weights which sum to 1 per geography within
//! `WEIGHT_SUM_TOLERANCE`.
//!
//! WeightAggregator
//! ----------------
//!
//! Counts are fed in one at a time, the same way they come out of the
//! overlay:
//!
//! ```ignore
//!     let mut aggregator = WeightAggregator::new();
//!     aggregator.record_geography_total("E02000001", 40)?;
//!     aggregator.record_intersection("E02000001", "cell-17", 30)?;
//!     aggregator.record_intersection("E02000001", "cell-18", 12)?;
//!
//!     let matrix = aggregator.calculate(&populations)?;
//! ```
//!
//! `calculate()` only builds columns for geographies present in the
//! population table. A geography with nonzero population but no nonzero
//! intersection count fails the run with `MissingGeography`; dropping it
//! would silently lose population.
//!
//! WeightMatrix
//! ------------
//!
//! The result is sparse: one `WeightColumn` per geography, holding only the
//! cells with a nonzero weight, in ascending cell-id order. The ordering is
//! what apportionment relies on for deterministic tie-breaks.
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use log::debug;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::PopulationTable;
use crate::RegridError;
use crate::Result;

/// Allowed distance of a column's weight sum from 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

pub(crate) fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= WEIGHT_SUM_TOLERANCE
}

/// Rescale `raw` so it sums to 1. A row that already sums to 1 within
/// tolerance is returned untouched. Returns `None` for rows whose sum is
/// zero or not finite.
pub fn normalize_weights(raw: &[f64]) -> Option<Vec<f64>> {
    let sum: f64 = raw.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return None;
    }
    if approx_eq(sum, 1.0) {
        return Some(raw.to_vec());
    }
    Some(raw.iter().map(|w| w / sum).collect())
}

/// A single (geography, cell, weight) triple.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub geography: String,
    pub cell: String,
    pub weight: f64,
}

/// Nonzero weights of one geography, sorted by cell id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WeightColumn {
    cells: Vec<String>,
    weights: Vec<f64>,
}

impl WeightColumn {
    fn from_sorted(pairs: Vec<(String, f64)>) -> Self {
        let (cells, weights) = pairs.into_iter().unzip();
        Self { cells, weights }
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.cells
            .iter()
            .map(|c| c.as_str())
            .zip(self.weights.iter().copied())
    }

    pub fn sum(&self) -> f64 {
        self.weights.iter().sum()
    }

    fn validate(&self, geography: &str) -> Result<()> {
        let inconsistent = |reason: String| RegridError::MatrixConsistency {
            geography: geography.to_string(),
            reason,
        };

        if self.is_empty() {
            return Err(inconsistent("column has no cells".into()));
        }
        for (cell, weight) in self.iter() {
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(inconsistent(format!(
                    "cell {:?} has weight {} outside [0, 1]",
                    cell, weight
                )));
            }
        }
        let sum = self.sum();
        if !approx_eq(sum, 1.0) {
            return Err(inconsistent(format!("weights sum to {} instead of 1", sum)));
        }
        Ok(())
    }
}

/// Normalized, immutable weights for one run, indexed by geography.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WeightMatrix {
    columns: BTreeMap<String, WeightColumn>,
    cells: BTreeSet<String>,
}

impl WeightMatrix {
    /// Build a matrix from weights computed elsewhere. Zero weights are
    /// dropped. Every resulting column must sum to 1 within tolerance.
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = WeightEntry>,
    {
        let mut rows: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for entry in entries {
            let row = rows.entry(entry.geography.clone()).or_default();
            if row.insert(entry.cell.clone(), entry.weight).is_some() {
                return Err(RegridError::DuplicateIntersection {
                    geography: entry.geography,
                    cell: entry.cell,
                });
            }
        }

        let mut matrix = Self::default();
        for (geography, row) in rows {
            let pairs: Vec<(String, f64)> =
                row.into_iter().filter(|(_, w)| *w != 0.0).collect();
            if pairs.is_empty() {
                continue;
            }
            let column = WeightColumn::from_sorted(pairs);
            column.validate(&geography)?;
            matrix.insert(geography, column);
        }
        Ok(matrix)
    }

    fn insert(&mut self, geography: String, column: WeightColumn) {
        self.cells.extend(column.cells.iter().cloned());
        self.columns.insert(geography, column);
    }

    pub fn column(&self, geography: &str) -> Option<&WeightColumn> {
        self.columns.get(geography)
    }

    /// Columns in ascending geography order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &WeightColumn)> {
        self.columns.iter().map(|(g, c)| (g.as_str(), c))
    }

    /// Every cell with at least one nonzero weight, ascending.
    pub fn cells(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|c| c.as_str())
    }

    pub fn nr_geographies(&self) -> usize {
        self.columns.len()
    }

    pub fn nr_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn nr_entries(&self) -> usize {
        self.columns.values().map(|c| c.len()).sum()
    }

    pub fn entries(&self) -> impl Iterator<Item = WeightEntry> + '_ {
        self.columns().flat_map(|(geography, column)| {
            column.iter().map(move |(cell, weight)| WeightEntry {
                geography: geography.to_string(),
                cell: cell.to_string(),
                weight,
            })
        })
    }

    /// geography -> cell -> weight, for dumping.
    pub fn as_nested(&self) -> BTreeMap<&str, BTreeMap<&str, f64>> {
        self.columns()
            .map(|(geography, column)| (geography, column.iter().collect()))
            .collect()
    }
}

/// Collects overlay counts and turns them into a `WeightMatrix`.
#[derive(Clone, Debug, Default)]
pub struct WeightAggregator {
    totals: BTreeMap<String, u64>,
    intersections: BTreeMap<String, BTreeMap<String, u64>>,
}

impl WeightAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the number of sub-units in `geography` as a whole.
    pub fn record_geography_total(&mut self, geography: &str, count: i64) -> Result<()> {
        if count < 0 {
            return Err(RegridError::NegativePopulation {
                geography: geography.to_string(),
                cell: None,
                value: count,
            });
        }
        if self.totals.insert(geography.to_string(), count as u64).is_some() {
            return Err(RegridError::DuplicateGeography(geography.to_string()));
        }
        Ok(())
    }

    /// Record the number of `geography`'s sub-units located in `cell`.
    pub fn record_intersection(&mut self, geography: &str, cell: &str, count: i64) -> Result<()> {
        if count < 0 {
            return Err(RegridError::NegativePopulation {
                geography: geography.to_string(),
                cell: Some(cell.to_string()),
                value: count,
            });
        }
        let row = self.intersections.entry(geography.to_string()).or_default();
        if row.insert(cell.to_string(), count as u64).is_some() {
            return Err(RegridError::DuplicateIntersection {
                geography: geography.to_string(),
                cell: cell.to_string(),
            });
        }
        Ok(())
    }

    pub fn nr_geographies(&self) -> usize {
        self.totals.len()
    }

    pub fn nr_intersections(&self) -> usize {
        self.intersections.values().map(|r| r.len()).sum()
    }

    /// Build normalized weight columns for every geography in
    /// `populations`.
    pub fn calculate(&self, populations: &PopulationTable) -> Result<WeightMatrix> {
        let mut matrix = WeightMatrix::default();

        for (geography, population) in populations.iter() {
            let counts: Vec<(&String, u64)> = match self.intersections.get(geography) {
                Some(row) => row
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(cell, count)| (cell, *count))
                    .collect(),
                None => vec![],
            };

            if counts.is_empty() {
                if population > 0 {
                    return Err(RegridError::MissingGeography {
                        geography: geography.to_string(),
                        population,
                    });
                }
                debug!("{}: no population and no cell mapping, skipping", geography);
                continue;
            }

            let total = self.totals.get(geography).copied().unwrap_or(0);
            if total == 0 {
                return Err(RegridError::InconsistentCounts {
                    geography: geography.to_string(),
                    total,
                });
            }

            let raw: Vec<f64> = counts
                .iter()
                .map(|(_, count)| *count as f64 / total as f64)
                .collect();
            let raw_sum: f64 = raw.iter().sum();
            if !approx_eq(raw_sum, 1.0) {
                debug!(
                    "{}: raw proportions over {} cells sum to {:.6}, rescaling",
                    geography,
                    raw.len(),
                    raw_sum
                );
            }

            let weights = normalize_weights(&raw).ok_or_else(|| RegridError::MissingGeography {
                geography: geography.to_string(),
                population,
            })?;
            let pairs = counts
                .iter()
                .zip(weights)
                .map(|((cell, _), w)| (cell.to_string(), w))
                .collect();
            let column = WeightColumn::from_sorted(pairs);
            column.validate(geography)?;
            matrix.insert(geography.to_string(), column);
        }

        let unused = self
            .intersections
            .keys()
            .filter(|g| populations.get(g.as_str()).is_none())
            .count();
        if unused > 0 {
            warn!(
                "{} geographies have overlay counts but no population, ignoring",
                unused
            );
        }

        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    // =====================================================================
    // normalize_weights tests
    // =====================================================================

    #[test]
    fn test_normalize_scales_down_overcount() {
        // 0.6 + 0.6 = 1.2, each ends at 0.5.
        let w = normalize_weights(&[0.6, 0.6]).unwrap();
        assert!(approx(w[0], 0.5));
        assert!(approx(w[1], 0.5));
    }

    #[test]
    fn test_normalize_scales_up_undercount() {
        let w = normalize_weights(&[0.2, 0.2]).unwrap();
        assert!(approx(w[0], 0.5));
        assert!(approx(w[1], 0.5));
    }

    #[test]
    fn test_normalize_idempotent() {
        let once = normalize_weights(&[3.0, 1.0, 1.0, 2.0]).unwrap();
        let twice = normalize_weights(&once).unwrap();
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert!((a - b).abs() <= WEIGHT_SUM_TOLERANCE);
        }
    }

    #[test]
    fn test_normalize_zero_row() {
        assert_eq!(normalize_weights(&[0.0, 0.0]), None);
        assert_eq!(normalize_weights(&[]), None);
        assert_eq!(normalize_weights(&[f64::NAN, 1.0]), None);
    }

    // =====================================================================
    // WeightAggregator tests
    // =====================================================================

    fn pops(entries: &[(&str, i64)]) -> PopulationTable {
        PopulationTable::from_counts(entries.iter().copied()).unwrap()
    }

    #[test]
    fn test_calculate_exact_split() {
        let mut agg = WeightAggregator::new();
        agg.record_geography_total("g", 10).unwrap();
        agg.record_intersection("g", "b", 3).unwrap();
        agg.record_intersection("g", "a", 7).unwrap();

        let matrix = agg.calculate(&pops(&[("g", 100)])).unwrap();
        let col = matrix.column("g").unwrap();
        assert_eq!(col.cells(), &["a".to_string(), "b".to_string()]);
        assert!(approx(col.weights()[0], 0.7));
        assert!(approx(col.weights()[1], 0.3));
        assert_eq!(matrix.nr_cells(), 2);
    }

    #[test]
    fn test_calculate_boundary_double_count() {
        // 10 postcodes, 4 of which sit on the a/b boundary and were
        // attributed to both cells: raw proportions 0.7 + 0.7 = 1.4.
        let mut agg = WeightAggregator::new();
        agg.record_geography_total("g", 10).unwrap();
        agg.record_intersection("g", "a", 7).unwrap();
        agg.record_intersection("g", "b", 7).unwrap();

        let matrix = agg.calculate(&pops(&[("g", 9)])).unwrap();
        let col = matrix.column("g").unwrap();
        assert!(approx(col.sum(), 1.0));
        assert!(approx(col.weights()[0], 0.5));
    }

    #[test]
    fn test_calculate_drops_zero_counts() {
        let mut agg = WeightAggregator::new();
        agg.record_geography_total("g", 4).unwrap();
        agg.record_intersection("g", "a", 4).unwrap();
        agg.record_intersection("g", "b", 0).unwrap();

        let matrix = agg.calculate(&pops(&[("g", 1)])).unwrap();
        assert_eq!(matrix.column("g").unwrap().len(), 1);
        assert_eq!(matrix.nr_cells(), 1);
        assert_eq!(matrix.nr_entries(), 1);
    }

    #[test]
    fn test_calculate_missing_geography() {
        let mut agg = WeightAggregator::new();
        agg.record_geography_total("g", 4).unwrap();
        agg.record_intersection("g", "a", 4).unwrap();

        let err = agg.calculate(&pops(&[("g", 1), ("h", 5)])).unwrap_err();
        assert_eq!(
            err,
            RegridError::MissingGeography {
                geography: "h".into(),
                population: 5,
            }
        );
    }

    #[test]
    fn test_calculate_all_zero_counts_is_missing() {
        let mut agg = WeightAggregator::new();
        agg.record_geography_total("g", 4).unwrap();
        agg.record_intersection("g", "a", 0).unwrap();

        let err = agg.calculate(&pops(&[("g", 2)])).unwrap_err();
        assert!(matches!(err, RegridError::MissingGeography { .. }));
    }

    #[test]
    fn test_calculate_skips_empty_unmapped_geography() {
        let mut agg = WeightAggregator::new();
        agg.record_geography_total("g", 4).unwrap();
        agg.record_intersection("g", "a", 4).unwrap();

        let matrix = agg.calculate(&pops(&[("g", 1), ("h", 0)])).unwrap();
        assert_eq!(matrix.nr_geographies(), 1);
        assert!(matrix.column("h").is_none());
    }

    #[test]
    fn test_calculate_zero_total_with_counts() {
        let mut agg = WeightAggregator::new();
        agg.record_intersection("g", "a", 4).unwrap();

        let err = agg.calculate(&pops(&[("g", 1)])).unwrap_err();
        assert_eq!(
            err,
            RegridError::InconsistentCounts {
                geography: "g".into(),
                total: 0,
            }
        );
    }

    #[test]
    fn test_record_negative_counts() {
        let mut agg = WeightAggregator::new();
        assert!(matches!(
            agg.record_geography_total("g", -4),
            Err(RegridError::NegativePopulation { cell: None, .. })
        ));
        assert_eq!(
            agg.record_intersection("g", "a", -1),
            Err(RegridError::NegativePopulation {
                geography: "g".into(),
                cell: Some("a".into()),
                value: -1,
            })
        );
    }

    #[test]
    fn test_record_duplicates() {
        let mut agg = WeightAggregator::new();
        agg.record_geography_total("g", 4).unwrap();
        agg.record_intersection("g", "a", 1).unwrap();
        assert_eq!(
            agg.record_geography_total("g", 4),
            Err(RegridError::DuplicateGeography("g".into()))
        );
        assert!(matches!(
            agg.record_intersection("g", "a", 2),
            Err(RegridError::DuplicateIntersection { .. })
        ));
    }

    // =====================================================================
    // WeightMatrix tests
    // =====================================================================

    fn entry(g: &str, c: &str, w: f64) -> WeightEntry {
        WeightEntry {
            geography: g.into(),
            cell: c.into(),
            weight: w,
        }
    }

    #[test]
    fn test_from_entries_thirds() {
        let third = 1.0 / 3.0;
        let matrix = WeightMatrix::from_entries(vec![
            entry("g", "c", third),
            entry("g", "a", third),
            entry("g", "b", third),
            entry("h", "a", 1.0),
            entry("h", "z", 0.0),
        ])
        .unwrap();

        assert_eq!(matrix.nr_geographies(), 2);
        assert_eq!(matrix.nr_cells(), 3);
        assert_eq!(matrix.column("h").unwrap().len(), 1);
        let cells: Vec<&str> = matrix.cells().collect();
        assert_eq!(cells, vec!["a", "b", "c"]);
        assert_eq!(matrix.entries().count(), 4);
    }

    #[test]
    fn test_from_entries_rejects_bad_sum() {
        let err = WeightMatrix::from_entries(vec![entry("g", "a", 0.5), entry("g", "b", 0.6)])
            .unwrap_err();
        assert!(matches!(err, RegridError::MatrixConsistency { .. }));
    }

    #[test]
    fn test_from_entries_rejects_out_of_range() {
        let err = WeightMatrix::from_entries(vec![entry("g", "a", 1.5), entry("g", "b", -0.5)])
            .unwrap_err();
        assert!(matches!(err, RegridError::MatrixConsistency { .. }));

        let err = WeightMatrix::from_entries(vec![entry("g", "a", f64::NAN)]).unwrap_err();
        assert!(matches!(err, RegridError::MatrixConsistency { .. }));
    }

    #[test]
    fn test_from_entries_rejects_duplicates() {
        let err = WeightMatrix::from_entries(vec![entry("g", "a", 0.5), entry("g", "a", 0.5)])
            .unwrap_err();
        assert_eq!(
            err,
            RegridError::DuplicateIntersection {
                geography: "g".into(),
                cell: "a".into(),
            }
        );
    }

    #[test]
    fn test_as_nested() {
        let matrix =
            WeightMatrix::from_entries(vec![entry("g", "a", 0.25), entry("g", "b", 0.75)]).unwrap();
        let nested = matrix.as_nested();
        assert_eq!(nested["g"]["b"], 0.75);
    }
}
