// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::io::Write;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::PopulationTable;
use crate::WeightAggregator;

/// Read `input` as inline JSON, or from a file when prefixed with `f:` or
/// `file:`.
fn read_input(input: &str) -> Result<String> {
    match input.split_once(':') {
        Some(("f", path)) | Some(("file", path)) => {
            let mut f = fs::OpenOptions::new()
                .read(true)
                .open(path)
                .with_context(|| format!("Failed to open {:?}", path))?;
            let mut content = String::new();
            f.read_to_string(&mut content)?;
            Ok(content)
        }
        _ => Ok(input.to_string()),
    }
}

/// Population per geography as supplied by the population source.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PopulationInput {
    pub populations: BTreeMap<String, i64>,
}

impl PopulationInput {
    pub fn parse(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(&read_input(input)?)?)
    }

    pub fn to_table(&self) -> Result<PopulationTable> {
        Ok(PopulationTable::from_counts(
            self.populations.iter().map(|(g, p)| (g.as_str(), *p)),
        )?)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntersectionCount {
    pub geography: String,
    pub cell: String,
    pub count: i64,
}

/// Sub-unit counts produced by the geometry overlay.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OverlayInput {
    #[serde(default)]
    pub totals: BTreeMap<String, i64>,
    #[serde(default)]
    pub intersections: Vec<IntersectionCount>,
}

impl OverlayInput {
    pub fn parse(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(&read_input(input)?)?)
    }

    pub fn to_aggregator(&self) -> Result<WeightAggregator> {
        let mut aggregator = WeightAggregator::new();
        for (geography, count) in self.totals.iter() {
            aggregator.record_geography_total(geography, *count)?;
        }
        for (idx, ic) in self.intersections.iter().enumerate() {
            aggregator
                .record_intersection(&ic.geography, &ic.cell, ic.count)
                .with_context(|| format!("intersections[{}]", idx))?;
        }
        Ok(aggregator)
    }
}

pub fn example_populations() -> PopulationInput {
    PopulationInput {
        populations: [("E00000001", 6), ("E00000002", 2), ("E00000003", 0)]
            .into_iter()
            .map(|(g, p)| (g.to_string(), p))
            .collect(),
    }
}

pub fn example_overlay() -> OverlayInput {
    let counts = [
        ("E00000001", "1km-0412-0388", 16),
        ("E00000001", "1km-0412-0389", 12),
        ("E00000001", "1km-0413-0388", 8),
        ("E00000001", "1km-0413-0389", 3),
        ("E00000001", "1km-0414-0388", 1),
        ("E00000002", "1km-0412-0388", 5),
        ("E00000002", "1km-0412-0387", 5),
        ("E00000003", "1km-0414-0388", 2),
    ];
    OverlayInput {
        totals: [("E00000001", 40), ("E00000002", 10), ("E00000003", 2)]
            .into_iter()
            .map(|(g, c)| (g.to_string(), c))
            .collect(),
        intersections: counts
            .into_iter()
            .map(|(g, c, n)| IntersectionCount {
                geography: g.to_string(),
                cell: c.to_string(),
                count: n,
            })
            .collect(),
    }
}

/// Serialize `value` as pretty JSON to `path`, or to stdout if `None`.
pub fn write_json<T: Serialize>(path: Option<&str>, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match path {
        Some(path) => {
            let mut f = fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(path)
                .with_context(|| format!("Failed to create {:?}", path))?;
            f.write_all(json.as_bytes())?;
            f.write_all(b"\n")?;
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Write the example documents into `dir`, refusing to overwrite.
pub fn write_example_files(dir: &str) -> Result<()> {
    for (name, json) in [
        (
            "populations.json",
            serde_json::to_string_pretty(&example_populations())?,
        ),
        ("overlay.json", serde_json::to_string_pretty(&example_overlay())?),
    ] {
        let path = std::path::Path::new(dir).join(name);
        let mut f = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to create {:?}", path))?;
        f.write_all(json.as_bytes())?;
    }
    Ok(())
}
