//! Fixed-stride particle records and the producer-side containment scan.

use crate::bounds::Box3;
use crate::error::{InSituError, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Number of floats per record holding the position.
pub const POSITION_FLOATS: usize = 3;

/// Shape of one particle record: 3 position floats followed by
/// `stride - 3` attribute floats.
///
/// The stride is agreed at session setup on both sides and never travels on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticleLayout {
    stride: usize,
}

impl ParticleLayout {
    /// Position-only records.
    pub const POSITIONS: ParticleLayout = ParticleLayout { stride: 3 };

    /// Position plus one scalar attribute.
    pub const POSITIONS_WITH_ATTRIBUTE: ParticleLayout = ParticleLayout { stride: 4 };

    pub fn new(stride: usize) -> Result<Self> {
        let layout = Self { stride };
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stride < POSITION_FLOATS {
            return Err(InSituError::config(format!(
                "particle stride {} is smaller than the {} position components",
                self.stride, POSITION_FLOATS
            )));
        }
        Ok(())
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn attribute_count(&self) -> usize {
        self.stride - POSITION_FLOATS
    }

    /// Number of complete records in `buffer`.
    pub fn record_count(&self, buffer: &[f32]) -> usize {
        buffer.len() / self.stride
    }

    /// The prefix of `buffer` holding complete records.
    ///
    /// A trailing partial record is dropped with a warning.
    pub fn whole_records<'a>(&self, buffer: &'a [f32]) -> &'a [f32] {
        let usable = self.record_count(buffer) * self.stride;
        if usable != buffer.len() {
            tracing::warn!(
                len = buffer.len(),
                stride = self.stride,
                dropped = buffer.len() - usable,
                "Particle buffer is not a whole number of records, truncating"
            );
        }
        &buffer[..usable]
    }

    /// Iterates the positions of every complete record.
    pub fn positions<'a>(&self, buffer: &'a [f32]) -> impl Iterator<Item = Vector3<f32>> + 'a {
        buffer
            .chunks_exact(self.stride)
            .map(|record| Vector3::new(record[0], record[1], record[2]))
    }

    /// Iterates the attribute slice of every complete record.
    pub fn attributes<'a>(&self, buffer: &'a [f32]) -> impl Iterator<Item = &'a [f32]> + 'a {
        buffer
            .chunks_exact(self.stride)
            .map(|record| &record[POSITION_FLOATS..])
    }

    /// Bounds of every position in `buffer`; empty for an empty buffer.
    pub fn bounds(&self, buffer: &[f32]) -> Box3 {
        let mut bounds = Box3::empty();
        for record in buffer.chunks_exact(self.stride) {
            bounds.extend(&Vector3::new(record[0], record[1], record[2]));
        }
        bounds
    }

    /// Appends to `out` every record of `buffer` whose position lies in
    /// `query` (closed on every face), in buffer order. Returns how many
    /// records were appended.
    pub fn select_into(&self, buffer: &[f32], query: &Box3, out: &mut Vec<f32>) -> usize {
        let mut selected = 0;
        for record in buffer.chunks_exact(self.stride) {
            if query.contains_xyz(record[0], record[1], record[2]) {
                out.extend_from_slice(record);
                selected += 1;
            }
        }
        selected
    }
}

impl Default for ParticleLayout {
    fn default() -> Self {
        ParticleLayout::POSITIONS
    }
}
