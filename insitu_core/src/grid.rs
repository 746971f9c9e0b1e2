//! Spatial domain decomposition of the world bounds into owned blocks.
//!
//! A [`DomainGrid`] splits the reduced world bounds into `nx * ny * nz`
//! blocks by interpolating along each axis, pads each block with a ghost
//! region, and assigns each block a contiguous range of consumer workers.
//! Grids are rebuilt from scratch on every pull and never mutated after the
//! pull that filled them completes.

use crate::bounds::Box3;
use crate::error::{InSituError, Result};
use crate::particles::ParticleLayout;
use insitu_env::Rank;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Number of blocks along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridDims {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
}

impl GridDims {
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        Self { nx, ny, nz }
    }

    /// `n` blocks along every axis.
    pub fn cube(n: usize) -> Self {
        Self::new(n, n, n)
    }

    /// Only meaningful for dims that passed [`GridDims::validate`].
    pub fn num_blocks(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    /// Every axis must be at least 1 and the block count must fit the
    /// `i32` query count sent on the wire.
    pub fn validate(&self) -> Result<()> {
        if self.nx == 0 || self.ny == 0 || self.nz == 0 {
            return Err(InSituError::config(format!(
                "grid dims {} must be at least 1 along every axis",
                self
            )));
        }
        let count = self
            .nx
            .checked_mul(self.ny)
            .and_then(|n| n.checked_mul(self.nz))
            .filter(|&n| n <= i32::MAX as usize);
        if count.is_none() {
            return Err(InSituError::config(format!("grid dims {} describe too many blocks", self)));
        }
        Ok(())
    }

    /// Row-major block id of `(ix, iy, iz)`.
    pub fn block_id(&self, ix: usize, iy: usize, iz: usize) -> usize {
        iz * self.ny * self.nx + iy * self.nx + ix
    }

    /// Inverse of [`GridDims::block_id`].
    pub fn coords(&self, id: usize) -> [usize; 3] {
        [id % self.nx, (id / self.nx) % self.ny, id / (self.nx * self.ny)]
    }

    fn as_vector(&self) -> Vector3<f32> {
        Vector3::new(self.nx as f32, self.ny as f32, self.nz as f32)
    }
}

impl Default for GridDims {
    fn default() -> Self {
        GridDims::cube(2)
    }
}

impl fmt::Display for GridDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.nx, self.ny, self.nz)
    }
}

impl FromStr for GridDims {
    type Err = InSituError;

    /// Parses `"NxMxK"` or `"N"`.
    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split(|c| c == 'x' || c == 'X')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|e| InSituError::config(format!("invalid grid dims '{}': {}", s, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let dims = match parts.as_slice() {
            [n] => GridDims::cube(*n),
            [nx, ny, nz] => GridDims::new(*nx, *ny, *nz),
            _ => {
                return Err(InSituError::config(format!(
                    "invalid grid dims '{}': expected N or NxMxK",
                    s
                )))
            }
        };
        dims.validate()?;
        Ok(dims)
    }
}

/// Consumer-side decomposition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub dims: GridDims,
    /// Padding applied around every block.
    pub ghost_width: f32,
    /// Replace each outer-boundary face of a block's actual domain with the
    /// matching ghost face.
    pub extend_boundary_faces: bool,
}

impl GridConfig {
    pub fn with_dims(mut self, dims: GridDims) -> Self {
        self.dims = dims;
        self
    }

    pub fn with_ghost_width(mut self, ghost_width: f32) -> Self {
        self.ghost_width = ghost_width;
        self
    }

    pub fn with_boundary_extension(mut self, enabled: bool) -> Self {
        self.extend_boundary_faces = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.dims.validate()?;
        if !self.ghost_width.is_finite() || self.ghost_width < 0.0 {
            return Err(InSituError::config(format!(
                "ghost width must be a non-negative number, got {}",
                self.ghost_width
            )));
        }
        Ok(())
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            dims: GridDims::default(),
            ghost_width: 1.5 * 0.01,
            extend_boundary_faces: true,
        }
    }
}

/// Owner range of block `block_id` out of `num_blocks` spread over
/// `num_workers` consumer workers, as `(first_owner, num_owners)`.
pub fn block_owners(block_id: usize, num_blocks: usize, num_workers: usize) -> (Rank, usize) {
    if num_blocks >= num_workers {
        (block_id % num_workers, 1)
    } else {
        // Both bounds are at most num_workers; only the products need widening.
        let scale = |id: usize| (id as u128 * num_workers as u128 / num_blocks as u128) as usize;
        let first = scale(block_id);
        let end = scale(block_id + 1);
        (first, end - first)
    }
}

/// One cell of the decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: usize,
    pub coords: [usize; 3],
    /// Tight, non-overlapping partition cell.
    pub domain: Box3,
    /// `domain` with every outer-boundary face pushed out to the ghost face.
    pub actual_domain: Box3,
    /// `domain` padded by the ghost width on every face. This is the region
    /// requested from the producer.
    pub ghost_domain: Box3,
    pub first_owner: Rank,
    pub num_owners: usize,
    pub is_mine: bool,
    particles: Vec<f32>,
    layout: ParticleLayout,
}

impl Block {
    pub fn owners(&self) -> Range<Rank> {
        self.first_owner..self.first_owner + self.num_owners
    }

    /// Raw records received for this block.
    pub fn particles(&self) -> &[f32] {
        &self.particles
    }

    pub fn particle_count(&self) -> usize {
        self.layout.record_count(&self.particles)
    }

    pub fn layout(&self) -> ParticleLayout {
        self.layout
    }

    pub fn positions(&self) -> Vec<Vector3<f32>> {
        self.layout.positions(&self.particles).collect()
    }

    /// Attribute floats of every record, concatenated.
    pub fn attributes(&self) -> Vec<f32> {
        self.layout
            .attributes(&self.particles)
            .flat_map(|attrs| attrs.iter().copied())
            .collect()
    }

    /// Records whose position lies inside the tight domain rather than only
    /// in the ghost margin.
    pub fn interior_count(&self) -> usize {
        self.layout
            .positions(&self.particles)
            .filter(|p| self.domain.contains(p))
            .count()
    }

    pub(crate) fn set_particles(&mut self, particles: Vec<f32>) {
        self.particles = particles;
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block {} on actual domain {} (ghost {}) has {} particles",
            self.id,
            self.actual_domain,
            self.ghost_domain,
            self.particle_count()
        )
    }
}

/// Summary of the particles one worker received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub owned_blocks: usize,
    /// All received records, ghost copies included.
    pub particles: usize,
    /// Records inside their block's tight domain.
    pub interior_particles: usize,
    /// Records that only fell in a ghost margin.
    pub ghost_particles: usize,
}

/// The decomposed world for one pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainGrid {
    dims: GridDims,
    world_bounds: Box3,
    ghost_width: f32,
    rank: Rank,
    num_workers: usize,
    blocks: Vec<Block>,
}

impl DomainGrid {
    /// Builds the grid with outer-boundary extension and position-only records.
    pub fn build(
        dims: GridDims,
        world_bounds: Box3,
        ghost_width: f32,
        rank: Rank,
        num_workers: usize,
    ) -> Result<Self> {
        let config = GridConfig {
            dims,
            ghost_width,
            extend_boundary_faces: true,
        };
        Self::from_config(&config, world_bounds, rank, num_workers, ParticleLayout::default())
    }

    /// Builds the grid for worker `rank` of a `num_workers` consumer group.
    pub fn from_config(
        config: &GridConfig,
        world_bounds: Box3,
        rank: Rank,
        num_workers: usize,
        layout: ParticleLayout,
    ) -> Result<Self> {
        config.validate()?;
        if num_workers == 0 {
            return Err(InSituError::config("consumer group has no workers"));
        }
        if rank >= num_workers {
            return Err(InSituError::config(format!(
                "rank {} outside a consumer group of {}",
                rank, num_workers
            )));
        }

        let dims = config.dims;
        let num_blocks = dims.num_blocks();
        let steps = dims.as_vector();
        let ghost = config.ghost_width;

        let blocks = (0..num_blocks)
            .map(|id| {
                let [ix, iy, iz] = dims.coords(id);
                let index = Vector3::new(ix as f32, iy as f32, iz as f32);
                let f_lo = index.component_div(&steps);
                let f_up = (index + Vector3::repeat(1.0)).component_div(&steps);

                let domain = Box3::new(world_bounds.lerp(&f_lo), world_bounds.lerp(&f_up));
                let padded = domain.grow(ghost);

                let mut actual = domain;
                if config.extend_boundary_faces {
                    let at = [ix, iy, iz];
                    let last = [dims.nx - 1, dims.ny - 1, dims.nz - 1];
                    for axis in 0..3 {
                        if at[axis] == 0 {
                            actual.lower[axis] = padded.lower[axis];
                        }
                        if at[axis] == last[axis] {
                            actual.upper[axis] = padded.upper[axis];
                        }
                    }
                }

                let (first_owner, num_owners) = block_owners(id, num_blocks, num_workers);
                Block {
                    id,
                    coords: [ix, iy, iz],
                    domain,
                    actual_domain: actual,
                    ghost_domain: padded,
                    first_owner,
                    num_owners,
                    is_mine: (first_owner..first_owner + num_owners).contains(&rank),
                    particles: Vec::new(),
                    layout,
                }
            })
            .collect();

        Ok(Self {
            dims,
            world_bounds,
            ghost_width: ghost,
            rank,
            num_workers,
            blocks,
        })
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn world_bounds(&self) -> &Box3 {
        &self.world_bounds
    }

    pub fn ghost_width(&self) -> f32 {
        self.ghost_width
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, id: usize) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// Blocks owned by this worker, in block id order.
    pub fn mine(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_mine)
    }

    pub fn my_block_ids(&self) -> Vec<usize> {
        self.mine().map(|b| b.id).collect()
    }

    pub(crate) fn block_mut(&mut self, id: usize) -> Option<&mut Block> {
        self.blocks.get_mut(id)
    }

    /// Records received across every owned block.
    pub fn particle_count(&self) -> usize {
        self.mine().map(Block::particle_count).sum()
    }

    pub fn stats(&self) -> DatasetStats {
        let mut stats = DatasetStats::default();
        for block in self.mine() {
            let total = block.particle_count();
            let interior = block.interior_count();
            stats.owned_blocks += 1;
            stats.particles += total;
            stats.interior_particles += interior;
            stats.ghost_particles += total - interior;
        }
        stats
    }
}
