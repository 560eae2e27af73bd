// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

// apportion() records from rayon workers, so the recorder has to be global.
// Everything lives in one test since the process only gets one.

use gridpop::apportion;
use gridpop::log_recorder::LogRecorder;
use gridpop::ApportionOpts;
use gridpop::PopulationTable;
use gridpop::WeightEntry;
use gridpop::WeightMatrix;

fn entry(geography: &str, cell: &str, weight: f64) -> WeightEntry {
    WeightEntry {
        geography: geography.to_string(),
        cell: cell.to_string(),
        weight,
    }
}

#[test]
fn test_apportion_records_metrics() {
    let recorder = LogRecorder::new();
    assert!(metrics::set_global_recorder(recorder.clone()).is_ok());

    let matrix = WeightMatrix::from_entries([
        entry("X", "c0", 0.4),
        entry("X", "c1", 0.3),
        entry("X", "c2", 0.2),
        entry("X", "c3", 0.075),
        entry("X", "c4", 0.025),
        entry("S", "c5", 1.0),
        entry("Z", "c0", 0.5),
        entry("Z", "c5", 0.5),
    ])
    .unwrap();
    // E has nobody and no column, so it is skipped rather than apportioned.
    let pops = PopulationTable::from_counts([("X", 6), ("S", 4), ("Z", 0), ("E", 0)]).unwrap();

    let (out, stats) = apportion(&matrix, &pops, &ApportionOpts::default()).unwrap();
    assert_eq!(out.column("S").unwrap(), &[("c5".to_string(), 4)]);
    assert_eq!(stats.geographies, 3);
    assert_eq!(stats.skipped, 1);

    assert_eq!(recorder.counter_value("geographies_apportioned_total", &[]), 3);
    assert_eq!(recorder.counter_value("single_cell_total", &[]), 1);
    assert_eq!(recorder.counter_value("zero_population_total", &[]), 2);
    assert_eq!(
        recorder.counter_value("rounding_corrections_total", &[("direction", "up")]),
        1
    );
    assert_eq!(
        recorder.counter_value("rounding_corrections_total", &[("direction", "down")]),
        0
    );

    // One sample per apportioned geography. X's worst cell is c3: 0.45 -> 1.
    let mut deviations = recorder.histogram_values("rounding_deviation");
    deviations.sort_by(|a, b| a.total_cmp(b));
    assert_eq!(deviations.len(), 3);
    assert_eq!(deviations[0], 0.0);
    assert_eq!(deviations[1], 0.0);
    assert!((deviations[2] - 0.55).abs() < 1e-9);

    recorder.report();
}
