// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use thiserror::Error;

/// Faults raised while building weights, apportioning or aggregating. All of
/// them abort the run; each names the geography or cell responsible so the
/// upstream data can be corrected.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RegridError {
    #[error("geography {geography:?} has population {population} but no cell mapping")]
    MissingGeography { geography: String, population: u64 },

    #[error("weight column for geography {geography:?} is inconsistent: {reason}")]
    MatrixConsistency { geography: String, reason: String },

    #[error("negative value {value} for {}", describe(.geography, .cell.as_deref()))]
    NegativePopulation {
        geography: String,
        cell: Option<String>,
        value: i64,
    },

    #[error("geography {0:?} specified more than once")]
    DuplicateGeography(String),

    #[error("intersection {geography:?}/{cell:?} specified more than once")]
    DuplicateIntersection { geography: String, cell: String },

    #[error("geography {geography:?} has intersection counts but a sub-unit total of {total}")]
    InconsistentCounts { geography: String, total: u64 },

    #[error("geography {geography:?} apportioned {actual} instead of {expected}")]
    ConservationViolated {
        geography: String,
        expected: u64,
        actual: u64,
    },

    #[error("population sum overflows u64 at {0:?}")]
    Overflow(String),
}

fn describe(geography: &str, cell: Option<&str>) -> String {
    match cell {
        Some(cell) => format!("geography {:?} in cell {:?}", geography, cell),
        None => format!("geography {:?}", geography),
    }
}

pub type Result<T> = std::result::Result<T, RegridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let err = RegridError::MissingGeography {
            geography: "E02000001".into(),
            population: 12,
        };
        assert!(err.to_string().contains("E02000001"));

        let err = RegridError::NegativePopulation {
            geography: "E02000001".into(),
            cell: Some("c17".into()),
            value: -3,
        };
        let msg = err.to_string();
        assert!(msg.contains("E02000001"));
        assert!(msg.contains("c17"));
        assert!(msg.contains("-3"));
    }
}
