// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::ApportionedMatrix;
use crate::RegridError;
use crate::Result;

/// Final integer population per grid cell.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellPopulation {
    cells: BTreeMap<String, u64>,
}

impl CellPopulation {
    pub fn get(&self, cell: &str) -> Option<u64> {
        self.cells.get(cell).copied()
    }

    /// Cells in ascending identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.cells.iter().map(|(c, p)| (c.as_str(), *p))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn total(&self) -> u128 {
        self.cells.values().map(|p| *p as u128).sum()
    }
}

/// Row-sum the apportioned matrix. Every cell of the matrix shows up, with 0
/// if nothing landed in it.
pub fn aggregate(matrix: &ApportionedMatrix) -> Result<CellPopulation> {
    let mut cells: BTreeMap<String, u64> = matrix.cells().map(|c| (c.to_string(), 0)).collect();

    for (_, column) in matrix.columns() {
        for (cell, value) in column.iter() {
            let slot = cells.entry(cell.clone()).or_insert(0);
            *slot = slot
                .checked_add(*value)
                .ok_or_else(|| RegridError::Overflow(cell.clone()))?;
        }
    }

    Ok(CellPopulation { cells })
}
