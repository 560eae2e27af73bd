// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::BTreeMap;

use crate::RegridError;
use crate::Result;

/// Known integer population per source geography, keyed by identifier.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PopulationTable {
    pops: BTreeMap<String, u64>,
    total: u64,
}

impl PopulationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the population of `geography`. Negative values and repeated
    /// identifiers are data-integrity faults.
    pub fn record(&mut self, geography: &str, value: i64) -> Result<()> {
        if value < 0 {
            return Err(RegridError::NegativePopulation {
                geography: geography.to_string(),
                cell: None,
                value,
            });
        }
        if self.pops.contains_key(geography) {
            return Err(RegridError::DuplicateGeography(geography.to_string()));
        }

        let value = value as u64;
        self.total = self
            .total
            .checked_add(value)
            .ok_or_else(|| RegridError::Overflow(geography.to_string()))?;
        self.pops.insert(geography.to_string(), value);
        Ok(())
    }

    pub fn from_counts<'a, I>(counts: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, i64)>,
    {
        let mut table = Self::new();
        for (geography, value) in counts {
            table.record(geography, value)?;
        }
        Ok(table)
    }

    pub fn get(&self, geography: &str) -> Option<u64> {
        self.pops.get(geography).copied()
    }

    /// Geographies in ascending identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.pops.iter().map(|(g, p)| (g.as_str(), *p))
    }

    pub fn len(&self) -> usize {
        self.pops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pops.is_empty()
    }

    /// Sum of all recorded populations.
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_total() {
        let table = PopulationTable::from_counts([("b", 5), ("a", 7), ("c", 0)]).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.total(), 12);
        assert_eq!(table.get("a"), Some(7));
        assert_eq!(table.get("z"), None);

        let order: Vec<&str> = table.iter().map(|(g, _)| g).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_negative_population_rejected() {
        let mut table = PopulationTable::new();
        let err = table.record("E1", -1).unwrap_err();
        assert_eq!(
            err,
            RegridError::NegativePopulation {
                geography: "E1".into(),
                cell: None,
                value: -1,
            }
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_geography_rejected() {
        let mut table = PopulationTable::new();
        table.record("E1", 3).unwrap();
        assert_eq!(
            table.record("E1", 4),
            Err(RegridError::DuplicateGeography("E1".into()))
        );
        assert_eq!(table.get("E1"), Some(3));
    }

    #[test]
    fn test_total_overflow() {
        let mut table = PopulationTable::new();
        table.record("a", i64::MAX).unwrap();
        table.record("b", i64::MAX).unwrap();
        assert_eq!(
            table.record("c", 2),
            Err(RegridError::Overflow("c".into()))
        );
    }
}
