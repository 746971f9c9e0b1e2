//! JSON exporter for received datasets.
//!
//! Exports every consumer worker's last grid so a renderer can draw the
//! blocks, their ghost margins and the particles they hold.

use crate::error::SimResult;
use crate::runner::{ScenarioMetrics, ScenarioResult};
use insitu_core::{Block, DomainGrid};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// One owned block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockExport {
    pub id: usize,
    pub coords: [usize; 3],
    /// `[xmin, ymin, zmin, xmax, ymax, zmax]`
    pub domain: [f32; 6],
    pub actual_domain: [f32; 6],
    pub ghost_domain: [f32; 6],
    pub interior: usize,
    pub positions: Vec<[f32; 3]>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<f32>,
}

impl BlockExport {
    pub fn new(block: &Block) -> Self {
        Self {
            id: block.id,
            coords: block.coords,
            domain: block.domain.to_array(),
            actual_domain: block.actual_domain.to_array(),
            ghost_domain: block.ghost_domain.to_array(),
            interior: block.interior_count(),
            positions: block.positions().iter().map(|p| [p.x, p.y, p.z]).collect(),
            attributes: block.attributes(),
        }
    }
}

/// One consumer worker's grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerExport {
    pub rank: usize,
    pub world_bounds: [f32; 6],
    pub ghost_width: f32,
    pub blocks: Vec<BlockExport>,
}

impl ConsumerExport {
    pub fn new(grid: &DomainGrid) -> Self {
        Self {
            rank: grid.rank(),
            world_bounds: grid.world_bounds().to_array(),
            ghost_width: grid.ghost_width(),
            blocks: grid.mine().map(BlockExport::new).collect(),
        }
    }
}

/// Complete scenario export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    pub metrics: ScenarioMetrics,

    pub consumers: Vec<ConsumerExport>,
}

impl DatasetExport {
    pub fn from_result(result: &ScenarioResult) -> Self {
        Self {
            scenario: result.scenario.name().to_string(),
            seed: result.seed,
            passed: result.passed,
            failure_reason: result.failure_reason.clone(),
            metrics: result.metrics.clone(),
            consumers: result.grids.iter().map(ConsumerExport::new).collect(),
        }
    }

    /// Total particle records across every exported block.
    pub fn particle_count(&self) -> usize {
        self.consumers
            .iter()
            .flat_map(|c| &c.blocks)
            .map(|b| b.positions.len())
            .sum()
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> SimResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
