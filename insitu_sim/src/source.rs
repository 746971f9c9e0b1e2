//! Producer-side particle data for the harness.
//!
//! A `ParticleSource` holds one producer worker's particle buffer and
//! evolves it between timesteps:
//! - Random walk: particles start in the worker's x-slab and jitter every step
//! - Fixed: hand-placed records that never move
//! - Unit cube: random particles inside one offset unit cube

use insitu_core::{Box3, ParticleLayout};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Uniform};

/// Default per-step jitter of the random walk.
pub const DEFAULT_SPEED: f32 = 0.01;

/// One producer worker's particles.
pub struct ParticleSource {
    layout: ParticleLayout,
    records: Vec<f32>,

    /// RNG for the walk (seeded per worker)
    rng: ChaCha8Rng,

    /// Per-step displacement distribution; `None` for static data
    jitter: Option<Uniform<f32>>,

    steps: u64,
}

impl ParticleSource {
    /// Particles of worker `rank` out of `size`, starting uniformly in the
    /// slab `x in [rank/size, (rank+1)/size)`, `y, z in [0, 1)`.
    ///
    /// Attribute components, if any, start uniform in `[0, 1)`.
    pub fn random_walk(seed: u64, rank: usize, size: usize, count: usize, layout: ParticleLayout, speed: f32) -> Self {
        let mut rng = worker_rng(seed, rank);
        let unit = Uniform::new(0.0f32, 1.0);
        let size = size.max(1) as f32;

        let mut records = Vec::with_capacity(count * layout.stride());
        for _ in 0..count {
            records.push((rank as f32 + unit.sample(&mut rng)) / size);
            records.push(unit.sample(&mut rng));
            records.push(unit.sample(&mut rng));
            for _ in 0..layout.attribute_count() {
                records.push(unit.sample(&mut rng));
            }
        }

        let jitter = (speed > 0.0).then(|| Uniform::new_inclusive(-speed, speed));
        Self {
            layout,
            records,
            rng,
            jitter,
            steps: 0,
        }
    }

    /// Static records.
    pub fn fixed(layout: ParticleLayout, records: Vec<f32>) -> Self {
        Self {
            layout,
            records,
            rng: ChaCha8Rng::seed_from_u64(0),
            jitter: None,
            steps: 0,
        }
    }

    /// `count` static particles strictly inside the unit cube at `origin`.
    pub fn unit_cube(seed: u64, rank: usize, count: usize, origin: Vector3<f32>, layout: ParticleLayout) -> Self {
        let mut rng = worker_rng(seed, rank);
        let inside = Uniform::new(0.05f32, 0.95);

        let mut records = Vec::with_capacity(count * layout.stride());
        for _ in 0..count {
            for axis in 0..3 {
                records.push(origin[axis] + inside.sample(&mut rng));
            }
            for _ in 0..layout.attribute_count() {
                records.push(rank as f32);
            }
        }
        Self::fixed(layout, records)
    }

    /// Advances one timestep.
    pub fn step(&mut self) {
        self.steps += 1;
        let Some(jitter) = self.jitter else {
            return;
        };
        let stride = self.layout.stride();
        for record in self.records.chunks_exact_mut(stride) {
            for coord in record.iter_mut().take(3) {
                *coord += jitter.sample(&mut self.rng);
            }
        }
    }

    pub fn records(&self) -> &[f32] {
        &self.records
    }

    pub fn layout(&self) -> ParticleLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.layout.record_count(&self.records)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bounds(&self) -> Box3 {
        self.layout.bounds(&self.records)
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}

fn worker_rng(seed: u64, rank: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed.wrapping_mul(0x9e3779b97f4a7c15) ^ rank as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_walk_starts_in_slab() {
        let source = ParticleSource::random_walk(7, 1, 4, 500, ParticleLayout::POSITIONS, DEFAULT_SPEED);
        let bounds = source.bounds();

        assert_eq!(source.len(), 500);
        assert!(bounds.lower.x >= 0.25 && bounds.upper.x < 0.5);
        assert!(bounds.lower.y >= 0.0 && bounds.upper.y < 1.0);
    }

    #[test]
    fn test_walk_is_deterministic_per_seed() {
        let mut a = ParticleSource::random_walk(3, 0, 2, 50, ParticleLayout::POSITIONS_WITH_ATTRIBUTE, 0.01);
        let mut b = ParticleSource::random_walk(3, 0, 2, 50, ParticleLayout::POSITIONS_WITH_ATTRIBUTE, 0.01);
        let c = ParticleSource::random_walk(4, 0, 2, 50, ParticleLayout::POSITIONS_WITH_ATTRIBUTE, 0.01);

        a.step();
        b.step();
        assert_eq!(a.records(), b.records());
        assert_ne!(a.records(), c.records());
    }

    #[test]
    fn test_step_moves_positions_only() {
        let mut source = ParticleSource::random_walk(1, 0, 1, 20, ParticleLayout::POSITIONS_WITH_ATTRIBUTE, 0.01);
        let before = source.records().to_vec();
        source.step();

        for (old, new) in before.chunks_exact(4).zip(source.records().chunks_exact(4)) {
            for axis in 0..3 {
                assert!((old[axis] - new[axis]).abs() <= 0.01 + f32::EPSILON);
            }
            assert_eq!(old[3], new[3]);
        }
        assert_eq!(source.steps(), 1);
    }

    #[test]
    fn test_fixed_and_cube_sources_do_not_move() {
        let mut fixed = ParticleSource::fixed(ParticleLayout::POSITIONS, vec![0.0, 0.0, 0.0, 5.0, 5.0, 5.0]);
        fixed.step();
        assert_eq!(fixed.records(), &[0.0, 0.0, 0.0, 5.0, 5.0, 5.0]);

        let cube = ParticleSource::unit_cube(9, 2, 100, Vector3::new(2.0, 0.0, 0.0), ParticleLayout::POSITIONS);
        let bounds = cube.bounds();
        assert_eq!(cube.len(), 100);
        assert!(bounds.lower.x > 2.0 && bounds.upper.x < 3.0);
    }
}
