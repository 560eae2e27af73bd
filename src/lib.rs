// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod aggregate;
mod apportion;
mod error;
mod population;
mod weights;

pub mod input;
pub mod log_recorder;

use log::info;
use serde::Serialize;

pub use aggregate::aggregate;
pub use aggregate::CellPopulation;
pub use apportion::apportion;
pub use apportion::largest_remainder;
pub use apportion::ApportionOpts;
pub use apportion::ApportionStats;
pub use apportion::ApportionedMatrix;
pub use apportion::Apportionment;
pub use apportion::RoundingRule;
pub use error::RegridError;
pub use error::Result;
pub use population::PopulationTable;
pub use weights::normalize_weights;
pub use weights::WeightAggregator;
pub use weights::WeightColumn;
pub use weights::WeightEntry;
pub use weights::WeightMatrix;
pub use weights::WEIGHT_SUM_TOLERANCE;

/// What one run did, for logging and for callers that want to check it.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub geographies: usize,
    pub skipped: usize,
    pub cells: usize,
    pub population: u64,
    pub corrections_up: u64,
    pub corrections_down: u64,
    pub max_deviation: f64,
}

/// Build weights from overlay counts, then apportion and aggregate.
pub fn regrid(
    overlay: &WeightAggregator,
    populations: &PopulationTable,
    opts: &ApportionOpts,
) -> Result<(CellPopulation, RunSummary)> {
    let matrix = overlay.calculate(populations)?;
    info!(
        "weights: {} geographies, {} cells, {} entries",
        matrix.nr_geographies(),
        matrix.nr_cells(),
        matrix.nr_entries()
    );
    regrid_matrix(&matrix, populations, opts)
}

/// Apportion and aggregate an already normalized weight matrix.
pub fn regrid_matrix(
    matrix: &WeightMatrix,
    populations: &PopulationTable,
    opts: &ApportionOpts,
) -> Result<(CellPopulation, RunSummary)> {
    let (apportioned, stats) = apportion(matrix, populations, opts)?;
    let cells = aggregate(&apportioned)?;

    // Per-geography conservation already holds, this catches anything lost
    // between apportionment and aggregation.
    let expected = populations.total();
    if cells.total() != expected as u128 {
        return Err(RegridError::ConservationViolated {
            geography: "*".to_string(),
            expected,
            actual: cells.total().min(u64::MAX as u128) as u64,
        });
    }

    let summary = RunSummary {
        geographies: stats.geographies,
        skipped: stats.skipped,
        cells: cells.len(),
        population: expected,
        corrections_up: stats.corrections_up,
        corrections_down: stats.corrections_down,
        max_deviation: stats.max_deviation,
    };
    info!(
        "apportioned {} geographies ({} skipped) into {} cells, population={} corrections=+{}/-{} max_dev={:.4}",
        summary.geographies,
        summary.skipped,
        summary.cells,
        summary.population,
        summary.corrections_up,
        summary.corrections_down,
        summary.max_deviation,
    );

    Ok((cells, summary))
}
