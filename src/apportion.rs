// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Integer apportionment of geography populations across grid cells.
//!
//! # Problem
//!
//! Each source geography g carries an integer population T and a weight
//! column w_1..w_n over the n cells it overlaps, with sum(w) == 1. The exact
//! share of cell i is f_i = w_i * T, which is almost never an integer.
//! Rounding each f_i independently loses or invents people: the rounded
//! values of a geography no longer add up to T. Downstream consumers sum
//! cells back into larger areas and expect those sums to match published
//! totals, so every geography's integers must add up to exactly T.
//!
//! # Approach
//!
//! Largest remainder (Hamilton's method), applied to one geography at a
//! time:
//!
//! ```text
//! largest_remainder(T, w[1..n]):
//!     f[i] = w[i] * T
//!     r[i] = round(f[i])
//!     D    = T - sum(r)
//!
//!     if D > 0:
//!         d[i] = f[i] - r[i]
//!         add 1 to the D cells with the largest d, lowest cell id first on ties
//!     if D < 0:
//!         d[i] = f[i] - r[i]
//!         take 1 from the |D| cells with the smallest d, lowest cell id first
//!         on ties
//!
//!     assert sum(r) == T
//! ```
//!
//! Rounding to nearest puts every residual in [-0.5, 0.5], so with weights
//! summing to 1 the correction |D| is at most n / 2. A correction larger than
//! n can only come from a weight column that does not sum to 1 and is
//! reported as `MatrixConsistency`.
//!
//! # Exact arithmetic
//!
//! Populations go up to 2^63 and f64 stops representing every integer at
//! 2^53, so f[i] is never formed as a float. Each weight is first converted
//! to a fixed-point integer q[i] = round(w[i] * 2^63) and the column total
//! Q = sum(q) stands in for 1:
//!
//! ```text
//!     f[i] = T * q[i] / Q          (u128 quotient and remainder)
//! ```
//!
//! Rounding, residuals and the correction ranking all work on the integer
//! remainders, so sum(f) == T holds exactly and equal residuals really are
//! equal. Only `max_deviation` is converted back to f64, for reporting.
//!
//! The rounding rule is selectable (`RoundingRule`) and defaults to round
//! half to even. Whatever the rule, it is applied to every geography of a
//! run.
//!
//! # Properties
//!
//! - **Conservation**: sum of a geography's cells == T, checked after every
//!   geography.
//! - **Boundedness**: |r[i] - f[i]| < 1. When D > 0 the D largest residuals
//!   are all positive (otherwise sum(d) could not reach D), so a cell that
//!   gains 1 ends up within 1 of f[i]. D < 0 is symmetric.
//! - **Non-negativity**: only cells rounded up can be taken from.
//! - **Determinism**: residuals are integers ranked with ties broken by cell
//!   position, which is ascending cell id.
//!
//! # Parallelism
//!
//! Geographies are independent. `apportion()` hands every column to the
//! rayon pool and collects the results back in geography order, so the
//! output does not depend on scheduling. Cells of one geography are never
//! split across workers since the correction ranks the whole column.
use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use log::debug;
use log::trace;
use log::warn;
use metrics::counter;
use metrics::histogram;
use rayon::prelude::*;
use serde::Deserialize;
use serde::Serialize;

use crate::weights::approx_eq;
use crate::PopulationTable;
use crate::RegridError;
use crate::Result;
use crate::WeightMatrix;

/// How fractional allocations are rounded before the correction step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RoundingRule {
    /// Round to nearest, ties to the even integer.
    #[default]
    HalfEven,
    /// Round to nearest, ties away from zero.
    HalfAwayFromZero,
}

impl RoundingRule {
    /// Whether `quot + rem / div` rounds up to `quot + 1`.
    fn rounds_up(self, quot: u128, rem: u128, div: u128) -> bool {
        match (2 * rem).cmp(&div) {
            Ordering::Less => false,
            Ordering::Greater => true,
            Ordering::Equal => match self {
                RoundingRule::HalfEven => quot % 2 == 1,
                RoundingRule::HalfAwayFromZero => true,
            },
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApportionOpts {
    #[serde(default)]
    pub rounding: RoundingRule,
}

/// Integer allocation of one geography.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Apportionment {
    /// Per-cell integers, in the order of the input weights.
    pub values: Vec<u64>,
    /// T - sum(round(f)): positive when cells were topped up, negative when
    /// cells were trimmed.
    pub correction: i64,
    /// Largest |values[i] - f[i]|.
    pub max_deviation: f64,
}

/// Fixed-point scale weights are converted to before any arithmetic with T.
const WEIGHT_SCALE: f64 = (1u64 << 63) as f64;

/// Distribute `total` across cells in proportion to `weights`, returning
/// integers which sum to exactly `total`. `weights` must be ordered by
/// ascending cell id; ties in the correction step go to the lower index.
pub fn largest_remainder(
    geography: &str,
    total: u64,
    weights: &[f64],
    rounding: RoundingRule,
) -> Result<Apportionment> {
    let n = weights.len();
    let inconsistent = |reason: String| RegridError::MatrixConsistency {
        geography: geography.to_string(),
        reason,
    };

    if n == 0 {
        if total == 0 {
            return Ok(Apportionment::default());
        }
        return Err(RegridError::MissingGeography {
            geography: geography.to_string(),
            population: total,
        });
    }

    if total == 0 {
        return Ok(Apportionment {
            values: vec![0; n],
            ..Default::default()
        });
    }

    // A lone cell takes everything; its weight is 1 by construction.
    if n == 1 {
        return Ok(Apportionment {
            values: vec![total],
            ..Default::default()
        });
    }

    for (idx, w) in weights.iter().enumerate() {
        if !w.is_finite() || !(0.0..=1.0).contains(w) {
            return Err(inconsistent(format!("cell #{} has weight {}", idx, w)));
        }
    }
    let sum: f64 = weights.iter().sum();
    if !approx_eq(sum, 1.0) {
        return Err(inconsistent(format!("weights sum to {} instead of 1", sum)));
    }

    // Exact shares f[i] = T * q[i] / Q. q[i] <= 2^63 and T < 2^64 keep the
    // products inside u128, and the tolerance above keeps Q below 2^64.
    let scaled: Vec<u128> = weights
        .iter()
        .map(|w| (w * WEIGHT_SCALE).round() as u128)
        .collect();
    let div: u128 = scaled.iter().sum();
    if div == 0 {
        return Err(inconsistent("all weights round to zero".into()));
    }

    let mut values = Vec::with_capacity(n);
    let mut residuals = Vec::with_capacity(n);
    for q in scaled.iter() {
        let share = total as u128 * q;
        let (quot, rem) = (share / div, share % div);
        // quot <= T since q <= Q.
        if rounding.rounds_up(quot, rem, div) {
            values.push(quot as u64 + 1);
            residuals.push(rem as i128 - div as i128);
        } else {
            values.push(quot as u64);
            residuals.push(rem as i128);
        }
    }

    let assigned: u128 = values.iter().map(|v| *v as u128).sum();
    let correction = total as i128 - assigned as i128;
    if correction.unsigned_abs() > n as u128 {
        return Err(inconsistent(format!(
            "rounding correction {} exceeds {} cells",
            correction, n
        )));
    }

    if correction != 0 {
        let mut order: Vec<usize> = (0..n).collect();

        if correction > 0 {
            order.sort_by_key(|&i| (Reverse(residuals[i]), i));
            for &i in order.iter().take(correction as usize) {
                values[i] += 1;
                residuals[i] -= div as i128;
            }
        } else {
            order.sort_by_key(|&i| (residuals[i], i));
            for &i in order.iter().take(correction.unsigned_abs() as usize) {
                if values[i] == 0 {
                    return Err(inconsistent(format!(
                        "cell #{} would drop below zero while trimming {}",
                        i, -correction
                    )));
                }
                values[i] -= 1;
                residuals[i] += div as i128;
            }
        }
    }

    let actual: u128 = values.iter().map(|v| *v as u128).sum();
    if actual != total as u128 {
        return Err(RegridError::ConservationViolated {
            geography: geography.to_string(),
            expected: total,
            actual: actual.min(u64::MAX as u128) as u64,
        });
    }

    let max_deviation = residuals
        .iter()
        .map(|d| d.unsigned_abs() as f64 / div as f64)
        .fold(0.0f64, f64::max);

    Ok(Apportionment {
        values,
        correction: correction as i64,
        max_deviation,
    })
}

/// Integer population per (geography, cell), frozen once built.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApportionedMatrix {
    columns: BTreeMap<String, Vec<(String, u64)>>,
    cells: BTreeSet<String>,
}

impl ApportionedMatrix {
    /// Cells and integers of `geography`, ascending by cell id.
    pub fn column(&self, geography: &str) -> Option<&[(String, u64)]> {
        self.columns.get(geography).map(|c| c.as_slice())
    }

    pub fn value(&self, geography: &str, cell: &str) -> Option<u64> {
        self.column(geography)?
            .iter()
            .find(|(c, _)| c == cell)
            .map(|(_, v)| *v)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &[(String, u64)])> {
        self.columns.iter().map(|(g, c)| (g.as_str(), c.as_slice()))
    }

    /// All cells of the weight matrix this was built from, ascending.
    pub fn cells(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|c| c.as_str())
    }

    pub fn nr_geographies(&self) -> usize {
        self.columns.len()
    }

    pub fn nr_cells(&self) -> usize {
        self.cells.len()
    }
}

/// Counters describing one `apportion()` pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ApportionStats {
    pub geographies: usize,
    pub skipped: usize,
    pub corrections_up: u64,
    pub corrections_down: u64,
    pub max_deviation: f64,
}

/// Apportion every geography in `populations` across its weight column.
///
/// Geographies with zero population and no column are skipped. A geography
/// with nonzero population and no column fails with `MissingGeography`.
/// Columns for geographies missing from `populations` are ignored.
pub fn apportion(
    matrix: &WeightMatrix,
    populations: &PopulationTable,
    opts: &ApportionOpts,
) -> Result<(ApportionedMatrix, ApportionStats)> {
    let mut stats = ApportionStats::default();
    let mut work = Vec::with_capacity(matrix.nr_geographies());

    for (geography, population) in populations.iter() {
        match matrix.column(geography) {
            Some(column) => work.push((geography, population, column)),
            None if population == 0 => {
                stats.skipped += 1;
                counter!("zero_population_total").increment(1);
            }
            None => {
                return Err(RegridError::MissingGeography {
                    geography: geography.to_string(),
                    population,
                })
            }
        }
    }

    let orphans = matrix
        .columns()
        .filter(|(g, _)| populations.get(g).is_none())
        .count();
    if orphans > 0 {
        warn!("{} weight columns have no population, ignoring", orphans);
    }

    debug!(
        "apportioning {} geographies over {} cells ({:?})",
        work.len(),
        matrix.nr_cells(),
        opts.rounding
    );

    let results: Vec<Result<Apportionment>> = work
        .par_iter()
        .map(|(geography, population, column)| {
            let alloc = largest_remainder(geography, *population, column.weights(), opts.rounding)?;
            record_metrics(*population, column.len(), &alloc);
            trace!(
                "{}: T={} cells={} correction={} max_dev={:.4}",
                geography,
                population,
                column.len(),
                alloc.correction,
                alloc.max_deviation
            );
            Ok(alloc)
        })
        .collect();

    let mut out = ApportionedMatrix {
        columns: BTreeMap::new(),
        cells: matrix.cells().map(|c| c.to_string()).collect(),
    };
    for ((geography, _, column), result) in work.iter().zip(results) {
        let alloc = result?;
        stats.geographies += 1;
        if alloc.correction > 0 {
            stats.corrections_up += alloc.correction as u64;
        } else {
            stats.corrections_down += alloc.correction.unsigned_abs();
        }
        stats.max_deviation = stats.max_deviation.max(alloc.max_deviation);

        let entries = column
            .cells()
            .iter()
            .cloned()
            .zip(alloc.values)
            .collect();
        out.columns.insert(geography.to_string(), entries);
    }

    Ok((out, stats))
}

fn record_metrics(population: u64, nr_cells: usize, alloc: &Apportionment) {
    counter!("geographies_apportioned_total").increment(1);
    if population == 0 {
        counter!("zero_population_total").increment(1);
    }
    if nr_cells == 1 {
        counter!("single_cell_total").increment(1);
    }
    if alloc.correction > 0 {
        counter!("rounding_corrections_total", "direction" => "up")
            .increment(alloc.correction as u64);
    } else if alloc.correction < 0 {
        counter!("rounding_corrections_total", "direction" => "down")
            .increment(alloc.correction.unsigned_abs());
    }
    histogram!("rounding_deviation").record(alloc.max_deviation);
}
